use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Not authorized (HTTP {0})")]
    Auth(u16),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl RemoteError {
    /// Retried silently on the next tick
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// 401/403; expected while an identity transition is in progress
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(RemoteError::Network("reset".into()).is_transient());
        assert!(RemoteError::Timeout.is_transient());
        assert!(
            RemoteError::Status {
                status: 503,
                message: "unavailable".into()
            }
            .is_transient()
        );
        assert!(
            !RemoteError::Status {
                status: 404,
                message: "missing".into()
            }
            .is_transient()
        );
        assert!(RemoteError::Auth(401).is_auth());
        assert!(!RemoteError::Auth(403).is_transient());
        assert!(!RemoteError::Decode("eof".into()).is_auth());
    }
}
