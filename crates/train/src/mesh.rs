//! Worker mesh: one replica per thread, kept in sync through collectives.
//!
//! * **[`Collective`]** — the operations the training loop needs across
//!   replicas: gradient all-reduce, scalar mean and weight broadcast.
//! * **[`SingleProcess`]** — the one-worker identity implementation.
//! * **[`spawn`]** — runs `world_size` workers on scoped threads, each with a
//!   [`MeshMember`] handle onto a shared in-process rendezvous.
//!
//! Every collective is a rendezvous: all workers must call the same
//! operations in the same order. If one worker fails, the mesh is aborted and
//! every pending or later collective returns an error instead of hanging.

use std::sync::Arc;

use candle_core::{Error, Result, Tensor};
use parking_lot::{Condvar, Mutex};

// ── Collective trait ────────────────────────────────────────────────────────

pub trait Collective {
    fn ordinal(&self) -> usize;

    fn world_size(&self) -> usize;

    fn is_master(&self) -> bool {
        self.ordinal() == 0
    }

    /// Element-wise sum of `tensors` over all workers, multiplied by `scale`.
    ///
    /// Every worker must pass the same number of tensors with matching shapes.
    fn all_reduce_sum(&self, tensors: Vec<Tensor>, scale: f64) -> Result<Vec<Tensor>>;

    /// Unweighted mean of `value` over all workers.
    fn mesh_mean(&self, value: f64) -> Result<f64>;

    /// The master's `tensors`, delivered to every worker.
    fn broadcast(&self, tensors: Vec<Tensor>) -> Result<Vec<Tensor>>;
}

/// A mesh of one.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn ordinal(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, tensors: Vec<Tensor>, scale: f64) -> Result<Vec<Tensor>> {
        if scale == 1.0 {
            return Ok(tensors);
        }
        tensors.iter().map(|t| t.affine(scale, 0.0)).collect()
    }

    fn mesh_mean(&self, value: f64) -> Result<f64> {
        Ok(value)
    }

    fn broadcast(&self, tensors: Vec<Tensor>) -> Result<Vec<Tensor>> {
        Ok(tensors)
    }
}

// ── In-process rendezvous ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Payload {
    Tensors(Vec<Tensor>),
    Scalar(f64),
}

struct Round {
    slots: Vec<Option<Payload>>,
    arrived: usize,
    generation: u64,
    /// Contributions of the last completed round, in ordinal order.
    result: Arc<Vec<Payload>>,
    aborted_by: Option<usize>,
}

/// Shared state of a thread mesh.
pub struct LocalMesh {
    world_size: usize,
    round: Mutex<Round>,
    ready: Condvar,
}

impl LocalMesh {
    pub fn new(world_size: usize) -> Arc<Self> {
        Arc::new(Self {
            world_size,
            round: Mutex::new(Round {
                slots: vec![None; world_size],
                arrived: 0,
                generation: 0,
                result: Arc::new(Vec::new()),
                aborted_by: None,
            }),
            ready: Condvar::new(),
        })
    }

    /// Handle for worker `ordinal`.
    pub fn member(self: &Arc<Self>, ordinal: usize) -> MeshMember {
        MeshMember {
            ordinal,
            mesh: Arc::clone(self),
        }
    }

    /// Fail every pending and future collective. The first caller wins.
    pub fn abort(&self, ordinal: usize) {
        let mut round = self.round.lock();
        if round.aborted_by.is_none() {
            round.aborted_by = Some(ordinal);
        }
        self.ready.notify_all();
    }

    pub fn aborted_by(&self) -> Option<usize> {
        self.round.lock().aborted_by
    }

    /// Contribute `payload` and wait for every worker's contribution.
    fn exchange(&self, ordinal: usize, payload: Payload) -> Result<Arc<Vec<Payload>>> {
        let mut round = self.round.lock();
        if let Some(by) = round.aborted_by {
            return Err(aborted(by));
        }
        round.slots[ordinal] = Some(payload);
        round.arrived += 1;

        if round.arrived == self.world_size {
            let result: Vec<Payload> = round.slots.iter_mut().filter_map(Option::take).collect();
            round.result = Arc::new(result);
            round.arrived = 0;
            round.generation += 1;
            self.ready.notify_all();
            return Ok(Arc::clone(&round.result));
        }

        // The round cannot complete again until this worker has read the
        // result and contributed to the next one.
        let generation = round.generation;
        while round.generation == generation && round.aborted_by.is_none() {
            self.ready.wait(&mut round);
        }
        match round.aborted_by {
            Some(by) if round.generation == generation => Err(aborted(by)),
            _ => Ok(Arc::clone(&round.result)),
        }
    }
}

fn aborted(by: usize) -> Error {
    Error::Msg(format!("worker mesh aborted by worker {by}"))
}

fn tensors_of(payload: &Payload) -> Result<&[Tensor]> {
    match payload {
        Payload::Tensors(t) => Ok(t),
        Payload::Scalar(_) => Err(Error::Msg(
            "collective mismatch: expected tensors, got a scalar".into(),
        )),
    }
}

/// One worker's view of a [`LocalMesh`].
#[derive(Clone)]
pub struct MeshMember {
    ordinal: usize,
    mesh: Arc<LocalMesh>,
}

impl MeshMember {
    pub fn mesh(&self) -> &Arc<LocalMesh> {
        &self.mesh
    }
}

impl Collective for MeshMember {
    fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn world_size(&self) -> usize {
        self.mesh.world_size
    }

    fn all_reduce_sum(&self, tensors: Vec<Tensor>, scale: f64) -> Result<Vec<Tensor>> {
        let n = tensors.len();
        let all = self.mesh.exchange(self.ordinal, Payload::Tensors(tensors))?;
        let mut summed: Vec<Tensor> = Vec::with_capacity(n);
        // Ordinal order, so every worker computes bit-identical sums.
        for payload in all.iter() {
            let contrib = tensors_of(payload)?;
            if contrib.len() != n {
                return Err(Error::Msg(format!(
                    "all_reduce length mismatch: {} vs {n}",
                    contrib.len()
                )));
            }
            if summed.is_empty() {
                summed.extend(contrib.iter().cloned());
            } else {
                for (acc, t) in summed.iter_mut().zip(contrib) {
                    *acc = (&*acc + t)?;
                }
            }
        }
        if scale == 1.0 {
            return Ok(summed);
        }
        summed.iter().map(|t| t.affine(scale, 0.0)).collect()
    }

    fn mesh_mean(&self, value: f64) -> Result<f64> {
        let all = self.mesh.exchange(self.ordinal, Payload::Scalar(value))?;
        let mut sum = 0.0;
        for payload in all.iter() {
            match payload {
                Payload::Scalar(v) => sum += v,
                Payload::Tensors(_) => {
                    return Err(Error::Msg(
                        "collective mismatch: expected a scalar, got tensors".into(),
                    ))
                }
            }
        }
        Ok(sum / all.len() as f64)
    }

    fn broadcast(&self, tensors: Vec<Tensor>) -> Result<Vec<Tensor>> {
        let payload = if self.is_master() {
            tensors
        } else {
            Vec::new()
        };
        let all = self.mesh.exchange(self.ordinal, Payload::Tensors(payload))?;
        match all.first() {
            Some(master) => Ok(tensors_of(master)?.to_vec()),
            None => Err(Error::Msg("broadcast over an empty mesh".into())),
        }
    }
}

// ── Spawn ───────────────────────────────────────────────────────────────────

/// Aborts the mesh unless the worker finished cleanly.
struct AbortGuard<'a> {
    mesh: &'a LocalMesh,
    ordinal: usize,
    clean: bool,
}

impl Drop for AbortGuard<'_> {
    fn drop(&mut self) {
        if !self.clean {
            self.mesh.abort(self.ordinal);
        }
    }
}

/// Run `f` on `world_size` worker threads and collect results in ordinal order.
///
/// If any worker fails, the error of the worker that aborted the mesh is
/// returned; the others only saw the abort.
pub fn spawn<T, F>(world_size: usize, f: F) -> anyhow::Result<Vec<T>>
where
    T: Send,
    F: Fn(MeshMember) -> anyhow::Result<T> + Sync,
{
    anyhow::ensure!(world_size > 0, "world size must be positive");
    let mesh = LocalMesh::new(world_size);

    let outcomes: Vec<anyhow::Result<T>> = std::thread::scope(|s| {
        let mut handles = Vec::with_capacity(world_size);
        for ordinal in 0..world_size {
            let member = mesh.member(ordinal);
            let mesh: &LocalMesh = &mesh;
            let f = &f;
            let handle = std::thread::Builder::new()
                .name(format!("worker-{ordinal}"))
                .spawn_scoped(s, move || {
                    let mut guard = AbortGuard {
                        mesh,
                        ordinal,
                        clean: false,
                    };
                    let out = f(member);
                    guard.clean = out.is_ok();
                    out
                });
            match handle {
                Ok(h) => handles.push(h),
                Err(e) => {
                    mesh.abort(ordinal);
                    handles.clear();
                    return vec![Err(anyhow::anyhow!("failed to spawn worker {ordinal}: {e}"))];
                }
            }
        }
        handles
            .into_iter()
            .enumerate()
            .map(|(ordinal, h)| {
                h.join()
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("worker {ordinal} panicked")))
            })
            .collect()
    });

    let root = mesh.aborted_by();
    let mut results = Vec::with_capacity(world_size);
    let mut first_err = None;
    for (ordinal, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(v) => results.push(v),
            Err(e) => {
                tracing::error!(ordinal, error = %e, "worker failed");
                if first_err.is_none() || root == Some(ordinal) {
                    first_err = Some(e);
                }
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(results),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
