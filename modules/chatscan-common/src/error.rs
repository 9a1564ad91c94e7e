use thiserror::Error;

use crate::types::SourceKind;

pub type Result<T> = std::result::Result<T, ChatScanError>;

#[derive(Error, Debug)]
pub enum ChatScanError {
    /// The source's backing primitive could not be reached. Triggers fallback.
    #[error("{kind} source unavailable: {reason}")]
    SourceUnavailable { kind: SourceKind, reason: String },

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("No usable identity for {name:?} from {kind} source")]
    IdentityUnresolved { name: Option<String>, kind: SourceKind },

    #[error("All chat sources are unavailable: {}", .errors.join("; "))]
    AllSourcesUnavailable {
        errors: Vec<String>,
        selection: crate::types::Metadata,
    },

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Run failure: {0}")]
    RunFailure(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl ChatScanError {
    pub fn unavailable(kind: SourceKind, reason: impl Into<String>) -> Self {
        ChatScanError::SourceUnavailable {
            kind,
            reason: reason.into(),
        }
    }

    /// Expected unavailability, as opposed to an unexpected failure.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ChatScanError::SourceUnavailable { .. })
    }
}
