use std::{io, path::PathBuf};

/// Errors produced while resolving, assembling, or tracking a network.
///
/// [`Integrity`](Error::Integrity), [`TerminalShape`](Error::TerminalShape) and
/// [`LossThreshold`](Error::LossThreshold) are fatal: the run must abort.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A freshly resolved configuration disagrees with the stored one.
    #[error("configuration integrity violation for experiment {experiment_id:?}: {detail}")]
    Integrity {
        experiment_id: String,
        detail: String,
    },
    /// The final decoder stage does not produce the target image.
    #[error("decode stage {stage} resolves to {found} {what}, target requires {expected}")]
    TerminalShape {
        stage: usize,
        what: &'static str,
        expected: usize,
        found: usize,
    },
    /// The training loss diverged.
    #[error("loss {loss:.3} exceeds threshold {threshold:.3} at step {step}")]
    LossThreshold {
        step: u64,
        loss: f64,
        threshold: f64,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Graph assembly was asked to connect incompatible shapes.
    #[error("shape mismatch: {0}")]
    Shape(String),
    /// The default encoder channel table has no entry for this stage.
    #[error("no default channel count for encode stage {stage} (table has {len} entries)")]
    ChannelTableExhausted { stage: usize, len: usize },
    #[error("stage key {key:?} in {section:?} is not an integer")]
    StageKey { section: String, key: String },
    #[error("checkpoint {path:?}: {detail}")]
    Checkpoint { path: PathBuf, detail: String },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
    /// Whether the error must abort a run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Integrity { .. } | Self::TerminalShape { .. } | Self::LossThreshold { .. }
        )
    }
}
