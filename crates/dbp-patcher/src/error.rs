use std::{io, path::PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PatcherError>;

#[derive(Debug, Error)]
pub enum PatcherError {
    /// The toolchain could not be extracted; nothing else can run until it is.
    #[error("patcher setup failed: {0}")]
    Setup(String),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cancelled while waiting for command")]
    Cancelled,

    #[error("failed to parse patcher metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl PatcherError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
