//! Configuration errors.
//!
//! Raised only while resolving a run configuration or constructing a
//! learning-rate scheduler, never from the training hot path.

use thiserror::Error;

/// A setting is missing, out of its valid domain, or names something unknown.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("setting `{field}` must be positive and finite, got {value}")]
    NonPositive { field: &'static str, value: f64 },

    #[error("setting `{field}` must be greater than {bound}, got {value}")]
    NotAbove {
        field: &'static str,
        value: f64,
        bound: f64,
    },

    #[error("unknown lr scheduler type `{0}` (expected none, step-decay, warmup-step-decay or cosine)")]
    UnknownScheduler(String),

    #[error("unknown model `{0}`")]
    UnknownModel(String),
}

impl ConfigurationError {
    /// Name of the offending setting, when the error is about a single field.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::Missing(field)
            | Self::NonPositive { field, .. }
            | Self::NotAbove { field, .. } => Some(field),
            Self::UnknownScheduler(_) => Some("lr_scheduler_type"),
            Self::UnknownModel(_) => Some("model"),
        }
    }
}
