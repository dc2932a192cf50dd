//! # clsbench-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`RunConfig`]** — resolved run settings (serialised as JSON), built by
//!   [`resolve_config`] from [`ConfigOverrides`] and [`defaults_for`].
//! * **[`ModelArch`]** — supported architectures and their input size.
//! * **[`ConfigurationError`]** — the one error raised at configuration time.
//! * **[`BatchSource`]** / **[`SyntheticImages`]** — batch loading.

pub mod arch;
pub mod config;
pub mod data;
pub mod error;

pub use arch::{ModelArch, NUM_CLASSES, SUPPORTED_MODELS};
pub use config::{
    default_kwargs, defaults_for, resolve_config, ConfigOverrides, ModelDefaults, RunConfig,
};
pub use data::{BatchSource, SyntheticImages};
pub use error::ConfigurationError;
