//! # clsbench-train — Training Engine
//!
//! Everything a worker needs to train an image classifier:
//!
//! * **[`LrScheduler`]** — per-step learning-rate policy (step decay, warmup
//!   then step decay, cosine) over every parameter group of an optimiser.
//! * **[`Sgd`]** — SGD with momentum, weight decay and parameter groups.
//! * **[`GradScaler`]** — dynamic loss scaling with overflow skipping.
//! * **[`Trainer`]** — the per-batch loop and top-1 validation.
//! * **[`Collective`]** / **[`spawn`]** — thread mesh with gradient
//!   all-reduce, scalar mean and weight broadcast.
//! * **[`run_worker`]** — one worker's full run, epoch by epoch.
//! * **[`metrics`]** — summary sinks plus rate and latency trackers.

pub mod mesh;
pub mod metrics;
pub mod optim;
pub mod run;
pub mod scaler;
pub mod scheduler;
pub mod trainer;

pub use mesh::{spawn, Collective, LocalMesh, MeshMember, SingleProcess};
pub use metrics::{
    CsvSummaryWriter, LatencySummary, LatencyTracker, MemorySink, MetricsSink, RateTracker,
    SharedSink,
};
pub use optim::{ParamsSgd, Sgd};
pub use run::{below_target, run_with, run_worker, RunSummary};
pub use scaler::GradScaler;
pub use scheduler::{
    wrap_optimizer_with_scheduler, LrScheduler, ParamGroups, SchedulerConfig, SchedulerKind,
};
pub use trainer::{EpochReport, Trainer, TrainerConfig};
