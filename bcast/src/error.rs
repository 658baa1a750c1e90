use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Argument(String),
    #[error("cannot open source {path:?}: {cause:#}")]
    SourceOpen { path: PathBuf, cause: anyhow::Error },
    #[error("cannot open destination {path:?}: {cause:#}")]
    SinkOpen { path: PathBuf, cause: anyhow::Error },
    #[error("failed reading the archive stream: {cause:#}")]
    StreamRead { cause: anyhow::Error },
    #[error("failed writing to the destination stream: {cause:#}")]
    StreamWrite { cause: anyhow::Error },
    #[error("extraction into {path:?} did not complete: {cause:#}")]
    SinkClose { path: PathBuf, cause: anyhow::Error },
    #[error(transparent)]
    Group(#[from] group::Error),
}

impl Error {
    /// True if this process detected the failure itself, so the group still has to learn about it.
    pub fn is_local(&self) -> bool {
        match self {
            Error::Group(error) => !error.is_group_failure(),
            _ => true,
        }
    }
}
