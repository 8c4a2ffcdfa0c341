use thiserror::Error;

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Deterministic rejection reasons. The display strings are part of the wire
/// contract: they are published verbatim inside error outcome events and must
/// not change.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    #[error("Unparsable content")]
    UnparsableContent,

    #[error("Bad delegation")]
    BadDelegation,

    #[error("Token amount must be a positive number")]
    NonPositiveAmount,

    #[error("Token not supported")]
    UnsupportedToken,

    #[error("Transaction not supported")]
    UnsupportedType,

    #[error("Author cannot mint this token")]
    UnauthorizedMint,

    #[error("Author cannot burn this token")]
    UnauthorizedBurn,

    #[error("Not enough funds")]
    InsufficientFunds,

    #[error("Network Error")]
    NetworkError,
}

impl Rejection {
    /// The stable reason string carried in the error outcome event.
    pub fn message(&self) -> &'static str {
        match self {
            Rejection::UnparsableContent => "Unparsable content",
            Rejection::BadDelegation => "Bad delegation",
            Rejection::NonPositiveAmount => "Token amount must be a positive number",
            Rejection::UnsupportedToken => "Token not supported",
            Rejection::UnsupportedType => "Transaction not supported",
            Rejection::UnauthorizedMint => "Author cannot mint this token",
            Rejection::UnauthorizedBurn => "Author cannot burn this token",
            Rejection::InsufficientFunds => "Not enough funds",
            Rejection::NetworkError => "Network Error",
        }
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("NATS error: {0}")]
    Nats(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Rejected: {0}")]
    Rejected(Rejection),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<Rejection> for LedgerError {
    fn from(rejection: Rejection) -> Self {
        LedgerError::Rejected(rejection)
    }
}

impl LedgerError {
    /// Classification at the handler boundary: deterministic rejections are
    /// terminal, everything else (database connectivity, serialization
    /// failures, deadlock aborts, relay transport) is retried. Unique-key
    /// violations land here too: a concurrent duplicate or first-credit race
    /// resolves itself on the next attempt.
    pub fn is_transient(&self) -> bool {
        !matches!(self, LedgerError::Rejected(_) | LedgerError::Config(_))
    }

    /// The rejection carried by a deterministic failure, if any.
    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            LedgerError::Rejected(r) => Some(*r),
            _ => None,
        }
    }
}
