//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Slack API or HTTP signature verification failure.
    Slack(String),
    /// An operation was rejected because its input failed validation.
    Validation(String),
    /// A state transition or git operation conflicted with concurrent state.
    Conflict(String),
    /// An external subprocess (git, gh, or an AI tool) exited non-zero or failed to spawn.
    Subprocess(String),
    /// A run or request was canceled before it completed.
    Canceled,
    /// File system path failed validation against the managed worktree root.
    PathViolation(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Caller is not authorized to perform the requested action.
    Unauthorized(String),
    /// A one-time code, pairing request, or token was already consumed.
    AlreadyConsumed(String),
    /// Secret sealing/unsealing (AES-GCM) failure.
    Crypto(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Slack(msg) => write!(f, "slack: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::Subprocess(msg) => write!(f, "subprocess: {msg}"),
            Self::Canceled => write!(f, "canceled"),
            Self::PathViolation(msg) => write!(f, "path violation: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::AlreadyConsumed(msg) => write!(f, "already consumed: {msg}"),
            Self::Crypto(msg) => write!(f, "crypto: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Subprocess(format!("http: {err}"))
    }
}
