//! Scoped failure taxonomy. `Ignored` failures (hook/notification errors)
//! are logged and dropped at the call site and so have no variant here.

use std::fmt;

/// A failure tagged with the scope at which it must be handled.
#[derive(Debug, Clone)]
pub enum Failure {
    /// Argument misconfiguration or I/O errors outside per-cycle scope.
    /// Aborts the process with exit status 1.
    Catastrophic(String),
    /// Connect/auth/capability failure for one account. Remaining
    /// folders for that account are skipped; other accounts continue.
    Account(String),
    /// In-cycle recoverable condition (e.g. a careful-mode zero-delivery
    /// batch). Aborts the current sub-action and any subsequent
    /// sub-actions on this account for this cycle.
    AccountSoft(String),
    /// SEARCH/FETCH/STORE rejected by the server for one folder only.
    Folder(String),
}

impl Failure {
    pub fn message(&self) -> &str {
        match self {
            Failure::Catastrophic(msg)
            | Failure::Account(msg)
            | Failure::AccountSoft(msg)
            | Failure::Folder(msg) => msg,
        }
    }

    pub fn is_catastrophic(&self) -> bool {
        matches!(self, Failure::Catastrophic(_))
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (scope, msg) = match self {
            Failure::Catastrophic(msg) => ("catastrophic", msg),
            Failure::Account(msg) => ("account", msg),
            Failure::AccountSoft(msg) => ("account-soft", msg),
            Failure::Folder(msg) => ("folder", msg),
        };
        write!(f, "{scope}: {msg}")
    }
}

impl std::error::Error for Failure {}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls error: {0}")]
    Tls(#[from] async_native_tls::Error),
    #[error("wire parse error: {0}")]
    Parse(#[from] mailsweep_proto::ParseError),
    #[error("server capability response missing literal IMAP4rev1")]
    MissingCapability,
    #[error("authentication policy forbids every available method")]
    AuthPolicyFailure,
    #[error("authentication failed: tag={tag} text={text}")]
    AuthFailure { tag: String, text: String },
    #[error("command {tag} failed: {text}")]
    CommandFailure { tag: String, text: String },
    #[error("server closed the connection unexpectedly")]
    UnexpectedEof,
    #[error("operation timed out")]
    Timeout,
}

impl From<ConnectionError> for Failure {
    fn from(err: ConnectionError) -> Self {
        Failure::Account(err.to_string())
    }
}
