use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    Access,
    Duplicate,
    Provider,
    Storage,
    Capacity,
    Crypto,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Access => "ACCESS",
            ErrorKind::Duplicate => "DUPLICATE",
            ErrorKind::Provider => "PROVIDER",
            ErrorKind::Storage => "STORAGE",
            ErrorKind::Capacity => "CAPACITY",
            ErrorKind::Crypto => "CRYPTO",
            ErrorKind::Internal => "INTERNAL",
        };
        write!(f, "{}", s)
    }
}

impl ErrorKind {
    /// Kinds that a caller may retry after a delay; the rest are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Provider | ErrorKind::Capacity)
    }
}

pub trait CairnError: std::error::Error {
    fn kind(&self) -> ErrorKind;

    fn retry_after(&self) -> Option<Duration> {
        None
    }

    /// Message safe to return to external callers. Internal-kind details
    /// stay in logs only.
    fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::Internal => "internal error".to_string(),
            _ => self.to_string(),
        }
    }
}
