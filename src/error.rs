//! Typed failures raised by the embedding pipeline
//!
//! Library functions return `anyhow::Result`; the variants here travel inside the
//! `anyhow::Error` and can be recovered with `err.downcast_ref::<EmbedError>()`.

use std::path::PathBuf;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum EmbedError {
    /// The codec produced fewer top-level tokens than the prior context needs.
    #[error("audio is not long enough: got {tokens} tokens, need at least {required}")]
    AudioTooShort { tokens: usize, required: usize },

    /// The pooling window count does not divide the activation length.
    #[error("pooling window count {windows} must evenly divide {tokens} activation frames")]
    PoolingWindows { windows: usize, tokens: usize },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("failed to load {what} from {}", path.display())]
    ResourceLoad {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("{stage} failed")]
    Computation {
        stage: &'static str,
        #[source]
        source: BoxError,
    },
}

impl EmbedError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn resource_load(what: &'static str, path: impl Into<PathBuf>, source: anyhow::Error) -> Self {
        Self::ResourceLoad {
            what,
            path: path.into(),
            source: source.into(),
        }
    }

    pub fn computation(stage: &'static str, source: anyhow::Error) -> Self {
        Self::Computation {
            stage,
            source: source.into(),
        }
    }

    /// True for failures caused by the input itself rather than the models or the machine.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Self::AudioTooShort { .. } | Self::PoolingWindows { .. } | Self::InvalidInput(_)
        )
    }
}

/// Find an [`EmbedError`] anywhere in an error chain.
pub fn find_embed_error(err: &anyhow::Error) -> Option<&EmbedError> {
    err.chain().find_map(|cause| cause.downcast_ref::<EmbedError>())
}
