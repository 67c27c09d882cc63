use std::time::Duration;

/// Errors that can occur while tracking or driving a container.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    /// Identifier, prefix or name does not resolve to a container
    #[error("no such container: {0}")]
    NotFound(String),

    /// Prefix matches more than one container
    #[error("ambiguous container reference {prefix:?} matches {matches} containers")]
    AmbiguousId { prefix: String, matches: usize },

    /// A container with this name is already registered
    #[error("container name {0:?} is already in use")]
    NameInUse(String),

    #[error("container {0} is not running")]
    NotRunning(String),

    #[error("container {0} has already been started")]
    AlreadyStarted(String),

    #[error("container {0} is not stopped")]
    NotStopped(String),

    /// `wait_stop` elapsed before the container stopped; the container is unaffected
    #[error("timed out after {0:?} waiting for the container to stop")]
    Timeout(Duration),

    /// A stream endpoint was closed while in use
    #[error("{0} stream is closed")]
    ClosedStream(&'static str),

    #[error("failed to deliver signal: {0}")]
    SignalDeliveryFailed(String),

    #[error("failed to spawn container process: {0}")]
    SpawnFailed(String),
}

impl LifecycleError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AmbiguousId { .. } => "ambiguous_id",
            Self::NameInUse(_) => "name_in_use",
            Self::NotRunning(_) => "not_running",
            Self::AlreadyStarted(_) => "already_started",
            Self::NotStopped(_) => "not_stopped",
            Self::Timeout(_) => "timeout",
            Self::ClosedStream(_) => "closed_stream",
            Self::SignalDeliveryFailed(_) => "signal_delivery_failed",
            Self::SpawnFailed(_) => "spawn_failed",
        }
    }

    /// Timeouts never affect the container, so callers may poll again.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(
            LifecycleError::NotFound("abc".into()).error_code(),
            "not_found"
        );
        assert_eq!(
            LifecycleError::AmbiguousId {
                prefix: "abcd".into(),
                matches: 2
            }
            .error_code(),
            "ambiguous_id"
        );
        assert_eq!(
            LifecycleError::ClosedStream("stdin").error_code(),
            "closed_stream"
        );
    }

    #[test]
    fn only_timeouts_are_recoverable() {
        assert!(LifecycleError::Timeout(Duration::from_millis(5)).is_recoverable());
        assert!(!LifecycleError::NotRunning("x".into()).is_recoverable());
        assert!(!LifecycleError::SignalDeliveryFailed("ESRCH".into()).is_recoverable());
    }

    #[test]
    fn display_mentions_reference() {
        let err = LifecycleError::AmbiguousId {
            prefix: "abcd".into(),
            matches: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("abcd"));
        assert!(msg.contains('2'));
    }
}
