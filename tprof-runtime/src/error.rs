#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("at least one target required")]
    NoTargets,

    #[error("cannot extract code object from {0}")]
    NotCode(String),

    #[error("cannot resolve target `{name}`")]
    Unresolved { name: String },

    #[error("tool id {id} is already in use by {holder}")]
    ToolInUse { id: u8, holder: String },
}

/// Coarse classification of [`Error`], for callers that branch on the failure
/// mode rather than the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    Resolution,
    Conflict,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoTargets | Error::NotCode(_) => ErrorKind::InvalidArgument,
            Error::Unresolved { .. } => ErrorKind::Resolution,
            Error::ToolInUse { .. } => ErrorKind::Conflict,
        }
    }
}
