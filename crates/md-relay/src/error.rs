use thiserror::Error;

/// Coarse failure classes used by the relay and the retry queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeout or transport drop. Eligible for retry.
    Network,
    /// Malformed or unexpected response. Never retried automatically.
    Protocol,
    /// Session or key operation failed. Fatal for the current attempt.
    Crypto,
    /// Storage, serialization or configuration problem on this side.
    Local,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unexpected node: expected <{expected}>, got <{got}>")]
    UnexpectedNode { expected: String, got: String },

    #[error("Server returned error {code} for {context}")]
    ServerError { code: String, context: String },

    #[error("Invalid JID: {0}")]
    InvalidJid(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("No session for {0}")]
    NoSession(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Base64(#[from] base64::DecodeError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Network(_) | Error::Timeout(_) => ErrorKind::Network,
            Error::Protocol(_)
            | Error::UnexpectedNode { .. }
            | Error::ServerError { .. }
            | Error::InvalidJid(_) => ErrorKind::Protocol,
            Error::Crypto(_) | Error::NoSession(_) => ErrorKind::Crypto,
            Error::Storage(_)
            | Error::Serialization(_)
            | Error::Config(_)
            | Error::Json(_)
            | Error::Base64(_) => ErrorKind::Local,
        }
    }

    /// Whether a failed send should stay enrolled in the retry queue.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::Crypto)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_failures() {
        assert_eq!(Error::Timeout("iq".into()).kind(), ErrorKind::Network);
        assert_eq!(
            Error::ServerError {
                code: "404".into(),
                context: "usync".into()
            }
            .kind(),
            ErrorKind::Protocol
        );
        assert_eq!(Error::NoSession("1.0".into()).kind(), ErrorKind::Crypto);
        assert_eq!(Error::Storage("disk".into()).kind(), ErrorKind::Local);
    }

    #[test]
    fn protocol_failures_are_not_retried() {
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(Error::Crypto("bad mac".into()).is_retryable());
        assert!(!Error::Protocol("missing list".into()).is_retryable());
        assert!(!Error::Config("zero tick".into()).is_retryable());
    }
}
