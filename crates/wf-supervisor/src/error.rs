use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("daemon binary `{0}` not found")]
    DaemonNotFound(String),
    #[error("failed to launch {}: {source}", path.display())]
    Launch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("daemon did not publish its descriptor within {0:?}")]
    StartTimeout(Duration),
    #[error("supervision cancelled")]
    Cancelled,
}

impl SupervisorError {
    /// Configuration problems need operator action rather than a retry.
    pub fn is_configuration(&self) -> bool {
        matches!(self, SupervisorError::DaemonNotFound(_))
    }
}
