use container_lifecycle::LifecycleError;

/// Errors that can occur while attaching to a container.
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    /// Resolution or state precondition failed
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("invalid detach keys {0:?}")]
    InvalidDetachKeys(String),

    /// The options asked for a stream the client did not supply
    #[error("no client {0} stream supplied")]
    MissingClientStream(&'static str),

    #[error("client stream failed: {0}")]
    ClientStream(#[from] std::io::Error),

    #[error("session task failed: {0}")]
    Task(String),
}

impl AttachError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Lifecycle(e) => e.error_code(),
            Self::InvalidDetachKeys(_) => "invalid_detach_keys",
            Self::MissingClientStream(_) => "missing_client_stream",
            Self::ClientStream(_) => "client_stream",
            Self::Task(_) => "task_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_codes_pass_through() {
        let err = AttachError::from(LifecycleError::NotRunning("abc".into()));
        assert_eq!(err.error_code(), "not_running");
        assert_eq!(err.to_string(), "container abc is not running");
    }

    #[test]
    fn own_codes() {
        assert_eq!(
            AttachError::InvalidDetachKeys("ctrl-".into()).error_code(),
            "invalid_detach_keys"
        );
        assert_eq!(
            AttachError::MissingClientStream("stdin").to_string(),
            "no client stdin stream supplied"
        );
    }
}
