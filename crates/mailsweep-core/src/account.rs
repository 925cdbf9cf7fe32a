//! The account descriptor, per-cycle telemetry, and the enumerated
//! option sets that make up one action request.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;

use crate::delivery::Delivery;
use crate::filter::FilterSpec;
use crate::secret::PasswordSource;

/// How the socket is wrapped before the IMAP dialogue starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Plain,
    StartTls,
    Ssl,
}

/// What authentication methods a caller permits for this account.
#[derive(Debug, Clone, Copy)]
pub struct AuthPolicy {
    pub login_allowed: bool,
    pub plaintext_allowed: bool,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self { login_allowed: true, plaintext_allowed: false }
    }
}

/// Per-cycle counters, reset at the start of every Orchestrator cycle.
#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    pub delivered: u64,
    pub undelivered: u64,
    pub marked: u64,
    pub trashed: u64,
    pub deleted: u64,
}

/// An immutable connection descriptor plus the mutable per-cycle state
/// that accumulates while the Orchestrator runs sub-actions against it.
pub struct Account {
    pub transport: Transport,
    pub host: String,
    pub port: u16,
    pub user: String,
    secret: Arc<dyn PasswordSource>,
    cached_secret: OnceCell<String>,
    pub auth_policy: AuthPolicy,
    pub socket_timeout: Duration,

    pub telemetry: Telemetry,
    pub changes: Vec<String>,
    pub errors: Vec<String>,
}

impl Account {
    pub fn new(
        transport: Transport,
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        secret: Arc<dyn PasswordSource>,
        auth_policy: AuthPolicy,
        socket_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            host: host.into(),
            port,
            user: user.into(),
            secret,
            cached_secret: OnceCell::new(),
            auth_policy,
            socket_timeout,
            telemetry: Telemetry::default(),
            changes: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Resolves and caches the account's secret for the process lifetime.
    pub async fn password(&self) -> anyhow::Result<&str> {
        self.cached_secret.get_or_try_init(|| self.secret.resolve()).await.map(String::as_str)
    }

    /// Clears telemetry and error/change lists at the start of a new cycle.
    pub fn begin_cycle(&mut self) {
        self.telemetry = Telemetry::default();
        self.changes.clear();
        self.errors.clear();
    }

    /// Whether the account is in a failed state for the current cycle,
    /// i.e. whether the cross-action failure barrier should trip.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn record_change(&mut self, message: impl Into<String>) {
        self.changes.push(message.into());
    }

    pub fn is_gmail(&self) -> bool {
        self.host == "imap.gmail.com"
    }
}

/// Flag mutation target for `mark` and for a `fetch`'s post-delivery STORE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marking {
    Auto,
    Noop,
    Seen,
    Unseen,
    Flagged,
    Unflagged,
}

impl Marking {
    /// Resolves `auto` against the filter that produced the result set:
    /// seen iff the filter requires unseen only, flagged iff it requires
    /// unflagged only, else noop.
    pub fn resolve(self, filter: &FilterSpec) -> Marking {
        match self {
            Marking::Auto => {
                if filter.requires_unseen_only() {
                    Marking::Seen
                } else if filter.requires_unflagged_only() {
                    Marking::Flagged
                } else {
                    Marking::Noop
                }
            }
            other => other,
        }
    }
}

/// Deletion method for the `delete` action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Auto,
    Delete,
    DeleteNoExpunge,
    GmailTrash,
}

impl Method {
    /// Resolves `auto`: gmail-trash when the host is `imap.gmail.com`
    /// and the folder being acted on is not itself `[Gmail]/Trash`;
    /// plain `delete` otherwise.
    pub fn resolve(self, account: &Account, folder: &str) -> Method {
        match self {
            Method::Auto => {
                if account.is_gmail() && folder != "[Gmail]/Trash" {
                    Method::GmailTrash
                } else {
                    Method::Delete
                }
            }
            other => other,
        }
    }
}

/// One action request against a single account.
#[derive(Debug, Clone)]
pub enum ActionSpec {
    List,
    Count,
    Mark(Marking),
    Fetch(FetchSpec),
    Delete(Method),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Yolo,
    Careful,
    Paranoid,
}

#[derive(Clone)]
pub struct FetchSpec {
    pub marking: Marking,
    pub fetch_number: usize,
    pub batch_number: usize,
    pub batch_size: u64,
    pub delivery_mode: DeliveryMode,
    pub new_mail_hooks: Vec<String>,
    pub delivery: Arc<dyn Delivery>,
}

impl fmt::Debug for FetchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchSpec")
            .field("marking", &self.marking)
            .field("fetch_number", &self.fetch_number)
            .field("batch_number", &self.batch_number)
            .field("batch_size", &self.batch_size)
            .field("delivery_mode", &self.delivery_mode)
            .field("new_mail_hooks", &self.new_mail_hooks)
            .finish_non_exhaustive()
    }
}

/// Per-Orchestrator-cycle queue of pending post-cycle hook commands,
/// deduplicated while preserving first-seen order.
#[derive(Debug, Clone, Default)]
pub struct CycleState {
    seen: std::collections::HashSet<String>,
    ordered: Vec<String>,
}

impl CycleState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_hook(&mut self, command: impl Into<String>) {
        let command = command.into();
        if self.seen.insert(command.clone()) {
            self.ordered.push(command);
        }
    }

    pub fn pending_hooks(&self) -> &[String] {
        &self.ordered
    }
}
