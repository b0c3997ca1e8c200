/// Errors surfaced to callers of the stream consumer.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("invalid hash: {0}")]
    InvalidHash(String),
    #[error("unknown hash: {0}")]
    UnknownHash(String),
    #[error("subscription to {hash} rejected: {message}")]
    SubscriptionRejected { hash: String, message: String },
    #[error("server failure: {0}")]
    ServerFailure(String),
    #[error("failed to reconnect: {0}")]
    RecycleFailed(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("subscription cancelled")]
    Cancelled,
}

impl ConsumerError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidHash(_) => "invalid_hash",
            Self::UnknownHash(_) => "unknown_hash",
            Self::SubscriptionRejected { .. } => "subscription_rejected",
            Self::ServerFailure(_) => "server_failure",
            Self::RecycleFailed(_) => "recycle_failed",
            Self::Transport(_) => "transport",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Errors raised by a [`Transport`](crate::transport::Transport).
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport not started")]
    NotStarted,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("write failed: {0}")]
    Write(String),
    #[error("transport stopped")]
    Stopped,
}

impl TransportError {
    /// Whether a reconnect attempt is worth making after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connect(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::NotStarted | Self::Write(_) | Self::Stopped => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(TransportError::Connect("refused".into()).is_retryable());
        assert!(TransportError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(TransportError::Status { status: 429, body: String::new() }.is_retryable());
        assert!(!TransportError::Status { status: 401, body: "denied".into() }.is_retryable());
        assert!(!TransportError::Stopped.is_retryable());
    }

    #[test]
    fn transport_error_converts() {
        let err: ConsumerError = TransportError::NotStarted.into();
        assert_eq!(err.error_kind(), "transport");
        assert_eq!(err.to_string(), "transport not started");
    }

    #[test]
    fn rejection_message() {
        let err = ConsumerError::SubscriptionRejected {
            hash: "abc".into(),
            message: "The hash abc doesn't exist".into(),
        };
        assert_eq!(err.error_kind(), "subscription_rejected");
        assert!(err.to_string().contains("doesn't exist"));
    }
}
