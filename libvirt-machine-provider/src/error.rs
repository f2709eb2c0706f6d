//! Semantic error kinds shared across the reconciler, registries and plugins.

use thiserror::Error;

/// Errors produced by the reconciliation engine and its plugin subsystems.
///
/// Variants map 1:1 onto the semantic kinds the reconciler dispatches on:
/// `NotFound`/`Cancelled` are tolerated or cause quiet exit, `Transient`/
/// `Partial` are requeued with backoff, the rest are surfaced to the caller.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{entity}: not found during {phase}")]
    NotFound { entity: String, phase: String },

    #[error("{entity}: already exists during {phase}")]
    AlreadyExists { entity: String, phase: String },

    #[error("{entity}: invalid spec during {phase}: {reason}")]
    InvalidSpec {
        entity: String,
        phase: String,
        reason: String,
    },

    #[error("{entity}: ambiguous plugin match during {phase}: {candidates:?}")]
    PluginAmbiguous {
        entity: String,
        phase: String,
        candidates: Vec<String>,
    },

    #[error("{entity}: transient failure during {phase}: {source}")]
    Transient {
        entity: String,
        phase: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{entity}: cancelled during {phase}")]
    Cancelled { entity: String, phase: String },

    #[error("{entity}: partial failure during {phase} ({failed} of {attempted} device(s) failed)")]
    Partial {
        entity: String,
        phase: String,
        attempted: usize,
        failed: usize,
    },
}

impl ProviderError {
    pub fn not_found(entity: impl Into<String>, phase: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            phase: phase.into(),
        }
    }

    pub fn already_exists(entity: impl Into<String>, phase: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity: entity.into(),
            phase: phase.into(),
        }
    }

    pub fn invalid_spec(
        entity: impl Into<String>,
        phase: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidSpec {
            entity: entity.into(),
            phase: phase.into(),
            reason: reason.into(),
        }
    }

    pub fn ambiguous(
        entity: impl Into<String>,
        phase: impl Into<String>,
        candidates: Vec<String>,
    ) -> Self {
        Self::PluginAmbiguous {
            entity: entity.into(),
            phase: phase.into(),
            candidates,
        }
    }

    pub fn transient(
        entity: impl Into<String>,
        phase: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self::Transient {
            entity: entity.into(),
            phase: phase.into(),
            source: source.into(),
        }
    }

    /// Whether the reconciler should requeue this error with backoff.
    ///
    /// `NotFound` on secondary loads is tolerated by callers before it ever
    /// reaches here; by the time an error reaches the work queue only
    /// `Transient`/`Partial` are retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Partial { .. })
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;
