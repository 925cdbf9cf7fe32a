//! Clap-derived command surface: shared connection/filter/schedule
//! options plus one subcommand per action. `for-each` re-parses a
//! `;`-separated trailing argument list through the same four grammars.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use mailsweep_core::{
    Account, AuthPolicy, CommandSecretSource, DeliveryMode, ExternalMda, FetchSpec, FileSecretSource,
    FilterSpec, FlaggedFilter, MaildirDelivery, Marking, Method, PasswordSource, PinentrySecretSource,
    SeenFilter, TimeSource, Transport,
};

/// One resolved sub-action, ready for the Orchestrator. Distinct from
/// `mailsweep_core::ActionSpec` only in that `List`/`Count` share a
/// variant here since they differ solely in output formatting.
#[derive(Clone)]
pub enum PlannedAction {
    List,
    Count,
    Mark(Marking),
    Fetch(FetchSpec),
    Delete(Method),
}

pub struct Plan {
    pub account: Account,
    pub filter: FilterSpec,
    pub folders: Vec<String>,
    pub actions: Vec<PlannedAction>,
    pub schedule: ScheduleArgs,
    pub output: OutputArgs,
}

#[derive(Parser, Debug)]
#[command(
    name = "mailsweep",
    about = "Sweep matching IMAP messages: list, count, mark, fetch-and-deliver or delete"
)]
pub struct Cli {
    #[command(flatten)]
    pub connection: ConnectionArgs,
    #[command(flatten)]
    pub filter: FilterArgs,
    #[command(flatten)]
    pub schedule: ScheduleArgs,
    #[command(flatten)]
    pub output: OutputArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Parser, Debug, Clone)]
pub struct ConnectionArgs {
    #[arg(long)]
    pub host: String,
    #[arg(long, default_value_t = 993)]
    pub port: u16,
    #[arg(long)]
    pub user: String,
    #[arg(long, value_enum, default_value_t = TransportArg::Ssl)]
    pub transport: TransportArg,
    #[arg(long)]
    pub allow_plaintext_auth: bool,
    #[arg(long)]
    pub no_login_auth: bool,
    #[arg(long, value_parser = mailsweep_helpers::de::parse_duration, default_value = "30s")]
    pub socket_timeout: Duration,
    #[arg(long = "folder")]
    pub folders: Vec<String>,

    #[arg(long, conflicts_with_all = ["password_command", "use_pinentry"])]
    pub password_file: Option<PathBuf>,
    #[arg(long, conflicts_with = "use_pinentry")]
    pub password_command: Option<String>,
    #[arg(long)]
    pub use_pinentry: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportArg {
    Plain,
    StartTls,
    Ssl,
}

impl From<TransportArg> for Transport {
    fn from(value: TransportArg) -> Self {
        match value {
            TransportArg::Plain => Transport::Plain,
            TransportArg::StartTls => Transport::StartTls,
            TransportArg::Ssl => Transport::Ssl,
        }
    }
}

#[derive(Parser, Debug, Clone, Default)]
pub struct FilterArgs {
    #[arg(long)]
    pub seen: bool,
    #[arg(long)]
    pub unseen: bool,
    #[arg(long)]
    pub flagged: bool,
    #[arg(long)]
    pub unflagged: bool,
    #[arg(long = "from")]
    pub from_includes: Vec<String>,
    #[arg(long = "not-from")]
    pub from_excludes: Vec<String>,
    #[arg(long = "older-than")]
    pub older_than_days: Vec<i64>,
    #[arg(long = "older-than-file")]
    pub older_than_file: Vec<PathBuf>,
    #[arg(long = "older-than-mtime-of")]
    pub older_than_mtime_of: Vec<PathBuf>,
    #[arg(long = "newer-than")]
    pub newer_than_days: Vec<i64>,
    #[arg(long = "newer-than-file")]
    pub newer_than_file: Vec<PathBuf>,
    #[arg(long = "newer-than-mtime-of")]
    pub newer_than_mtime_of: Vec<PathBuf>,
}

impl FilterArgs {
    fn finish(&self) -> Result<FilterSpec> {
        if self.seen && self.unseen {
            bail!("--seen and --unseen are mutually exclusive");
        }
        if self.flagged && self.unflagged {
            bail!("--flagged and --unflagged are mutually exclusive");
        }

        let seen = if self.seen {
            SeenFilter::RequireSeen
        } else if self.unseen {
            SeenFilter::RequireUnseen
        } else {
            SeenFilter::DontCare
        };
        let flagged = if self.flagged {
            FlaggedFilter::RequireFlagged
        } else if self.unflagged {
            FlaggedFilter::RequireUnflagged
        } else {
            FlaggedFilter::DontCare
        };

        let mut older_than: Vec<TimeSource> =
            self.older_than_days.iter().map(|d| TimeSource::DaysAgo(*d)).collect();
        older_than.extend(self.older_than_file.iter().cloned().map(TimeSource::FileTimestamp));
        older_than.extend(self.older_than_mtime_of.iter().cloned().map(TimeSource::FileMtime));

        let mut newer_than: Vec<TimeSource> =
            self.newer_than_days.iter().map(|d| TimeSource::DaysAgo(*d)).collect();
        newer_than.extend(self.newer_than_file.iter().cloned().map(TimeSource::FileTimestamp));
        newer_than.extend(self.newer_than_mtime_of.iter().cloned().map(TimeSource::FileMtime));

        Ok(FilterSpec {
            seen,
            flagged,
            from_includes: self.from_includes.clone(),
            from_excludes: self.from_excludes.clone(),
            older_than,
            newer_than,
        })
    }
}

#[derive(Parser, Debug, Clone)]
pub struct ScheduleArgs {
    #[arg(long)]
    pub once: bool,
    #[arg(long, value_parser = mailsweep_helpers::de::parse_duration)]
    pub every: Option<Duration>,
    #[arg(long, value_parser = mailsweep_helpers::de::parse_duration, default_value = "0s")]
    pub jitter: Duration,
}

#[derive(Parser, Debug, Clone, Default)]
pub struct OutputArgs {
    #[arg(long)]
    pub dry_run: bool,
    #[arg(long)]
    pub very_dry_run: bool,
    #[arg(long)]
    pub porcelain: bool,
    #[arg(long)]
    pub quiet: bool,
    #[arg(long)]
    pub trace: bool,
    #[arg(long)]
    pub notify_binary: Option<String>,
    #[arg(long)]
    pub notify_success: bool,
    #[arg(long)]
    pub notify_failure: bool,
    #[arg(long)]
    pub success_cmd: Option<String>,
    #[arg(long)]
    pub failure_cmd: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Lists selectable folders.
    List,
    /// Counts messages matching the filter in each folder.
    Count,
    /// Sets or clears a flag on messages matching the filter.
    Mark(MarkArgs),
    /// Fetches and delivers messages matching the filter.
    Fetch(FetchArgs),
    /// Deletes or trashes messages matching the filter.
    Delete(DeleteArgs),
    /// Runs a `;`-separated sequence of the other subcommands in order.
    ForEach {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        items: Vec<String>,
    },
}

#[derive(Parser, Debug, Clone)]
pub struct MarkArgs {
    #[arg(value_enum)]
    pub marking: MarkingArg,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkingArg {
    Seen,
    Unseen,
    Flagged,
    Unflagged,
}

impl From<MarkingArg> for Marking {
    fn from(value: MarkingArg) -> Self {
        match value {
            MarkingArg::Seen => Marking::Seen,
            MarkingArg::Unseen => Marking::Unseen,
            MarkingArg::Flagged => Marking::Flagged,
            MarkingArg::Unflagged => Marking::Unflagged,
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct FetchArgs {
    #[arg(long, conflicts_with = "maildir")]
    pub mda: Option<String>,
    #[arg(long, conflicts_with = "mda")]
    pub maildir: Option<PathBuf>,
    #[arg(long, default_value_t = 100)]
    pub fetch_number: usize,
    #[arg(long, default_value_t = 10)]
    pub batch_number: usize,
    #[arg(long, value_parser = mailsweep_helpers::de::parse_size, default_value = "4MiB")]
    pub batch_size: u64,
    #[arg(long, value_enum, default_value_t = FetchMarkingArg::Auto)]
    pub mark: FetchMarkingArg,
    #[arg(long, value_enum, default_value_t = DeliveryModeArg::Careful)]
    pub delivery_mode: DeliveryModeArg,
    #[arg(long = "new-mail-hook")]
    pub new_mail_hooks: Vec<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMarkingArg {
    Auto,
    Noop,
    Seen,
    Unseen,
    Flagged,
    Unflagged,
}

impl From<FetchMarkingArg> for Marking {
    fn from(value: FetchMarkingArg) -> Self {
        match value {
            FetchMarkingArg::Auto => Marking::Auto,
            FetchMarkingArg::Noop => Marking::Noop,
            FetchMarkingArg::Seen => Marking::Seen,
            FetchMarkingArg::Unseen => Marking::Unseen,
            FetchMarkingArg::Flagged => Marking::Flagged,
            FetchMarkingArg::Unflagged => Marking::Unflagged,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryModeArg {
    Yolo,
    Careful,
    Paranoid,
}

impl From<DeliveryModeArg> for DeliveryMode {
    fn from(value: DeliveryModeArg) -> Self {
        match value {
            DeliveryModeArg::Yolo => DeliveryMode::Yolo,
            DeliveryModeArg::Careful => DeliveryMode::Careful,
            DeliveryModeArg::Paranoid => DeliveryMode::Paranoid,
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct DeleteArgs {
    #[arg(long, value_enum, default_value_t = MethodArg::Auto)]
    pub method: MethodArg,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodArg {
    Auto,
    Delete,
    DeleteNoExpunge,
    GmailTrash,
}

impl From<MethodArg> for Method {
    fn from(value: MethodArg) -> Self {
        match value {
            MethodArg::Auto => Method::Auto,
            MethodArg::Delete => Method::Delete,
            MethodArg::DeleteNoExpunge => Method::DeleteNoExpunge,
            MethodArg::GmailTrash => Method::GmailTrash,
        }
    }
}

/// A single `for-each` grammar, re-parsed once per `;`-separated group.
#[derive(Parser, Debug, Clone)]
#[command(name = "mailsweep-for-each-item")]
struct SubActionArgs {
    #[command(subcommand)]
    action: SubAction,
}

#[derive(Subcommand, Debug, Clone)]
enum SubAction {
    List,
    Count,
    Mark(MarkArgs),
    Fetch(FetchArgs),
    Delete(DeleteArgs),
}

impl Cli {
    /// Validates and lowers the parsed CLI into a `Plan` the Orchestrator
    /// can run directly, resolving `for-each` into its component actions.
    pub fn finish(self) -> Result<Plan> {
        let secret: Arc<dyn PasswordSource> = if let Some(path) = self.connection.password_file {
            Arc::new(FileSecretSource { path })
        } else if let Some(command) = self.connection.password_command {
            Arc::new(CommandSecretSource { command })
        } else if self.connection.use_pinentry {
            Arc::new(PinentrySecretSource::new(format!(
                "mailsweep password for {}@{}",
                self.connection.user, self.connection.host
            )))
        } else {
            bail!("one of --password-file, --password-command or --use-pinentry is required");
        };

        let auth_policy = AuthPolicy {
            login_allowed: !self.connection.no_login_auth,
            plaintext_allowed: self.connection.allow_plaintext_auth,
        };

        let account = Account::new(
            self.connection.transport.into(),
            self.connection.host,
            self.connection.port,
            self.connection.user,
            secret,
            auth_policy,
            self.connection.socket_timeout,
        );

        let filter = self.filter.finish()?;

        let folders =
            if self.connection.folders.is_empty() { vec!["INBOX".to_string()] } else { self.connection.folders };

        let mut actions = Vec::new();
        match self.command {
            Command::List => actions.push(PlannedAction::List),
            Command::Count => actions.push(PlannedAction::Count),
            Command::Mark(args) => actions.push(planned_mark(args)),
            Command::Fetch(args) => actions.push(planned_fetch(args)?),
            Command::Delete(args) => actions.push(planned_delete(args)),
            Command::ForEach { items } => actions.extend(plan_for_each(items)?),
        }

        if self.schedule.once && self.schedule.every.is_some() {
            bail!("--once and --every are mutually exclusive");
        }

        Ok(Plan { account, filter, folders, actions, schedule: self.schedule, output: self.output })
    }
}

fn planned_mark(args: MarkArgs) -> PlannedAction {
    PlannedAction::Mark(args.marking.into())
}

fn planned_delete(args: DeleteArgs) -> PlannedAction {
    PlannedAction::Delete(args.method.into())
}

fn planned_fetch(args: FetchArgs) -> Result<PlannedAction> {
    let delivery: Arc<dyn mailsweep_core::Delivery> = match (args.mda, args.maildir) {
        (Some(command), None) => Arc::new(ExternalMda { command }),
        (None, Some(root)) => Arc::new(MaildirDelivery { root }),
        (None, None) => bail!("fetch requires either --mda or --maildir"),
        (Some(_), Some(_)) => bail!("--mda and --maildir are mutually exclusive"),
    };

    Ok(PlannedAction::Fetch(FetchSpec {
        marking: args.mark.into(),
        fetch_number: args.fetch_number.max(1),
        batch_number: args.batch_number.max(1),
        batch_size: args.batch_size.max(1),
        delivery_mode: args.delivery_mode.into(),
        new_mail_hooks: args.new_mail_hooks,
        delivery,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec!["mailsweep", "--host", "imap.example.com", "--user", "a@example.com", "--password-file", "/tmp/secret"]
    }

    #[test]
    fn seen_and_unseen_are_mutually_exclusive() {
        let mut args = base_args();
        args.extend(["--seen", "--unseen", "count"]);
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(cli.finish().is_err());
    }

    #[test]
    fn once_and_every_are_mutually_exclusive() {
        let mut args = base_args();
        args.extend(["--once", "--every", "5m", "count"]);
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(cli.finish().is_err());
    }

    #[test]
    fn fetch_requires_a_delivery_target() {
        let mut args = base_args();
        args.push("fetch");
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(cli.finish().is_err());
    }

    #[test]
    fn fetch_rejects_both_mda_and_maildir() {
        let mut args = base_args();
        args.extend(["fetch", "--mda", "procmail", "--maildir", "/tmp/mail"]);
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn fetch_with_maildir_builds_a_fetch_action() {
        let mut args = base_args();
        args.extend(["fetch", "--maildir", "/tmp/mail", "--batch-size", "256KiB", "--batch-number", "10"]);
        let cli = Cli::try_parse_from(args).unwrap();
        let plan = cli.finish().unwrap();
        match &plan.actions[..] {
            [PlannedAction::Fetch(spec)] => {
                assert_eq!(spec.batch_size, 256 * 1024);
                assert_eq!(spec.batch_number, 10);
            }
            other => panic!("expected a single fetch action, got {}", other.len()),
        }
    }

    #[test]
    fn for_each_splits_on_semicolon_into_distinct_actions() {
        let mut args = base_args();
        args.extend(["for-each", "count", ";", "mark", "seen", ";", "delete", "--method", "delete"]);
        let cli = Cli::try_parse_from(args).unwrap();
        let plan = cli.finish().unwrap();
        assert_eq!(plan.actions.len(), 3);
        assert!(matches!(plan.actions[0], PlannedAction::Count));
        assert!(matches!(plan.actions[1], PlannedAction::Mark(Marking::Seen)));
        assert!(matches!(plan.actions[2], PlannedAction::Delete(Method::Delete)));
    }

    #[test]
    fn for_each_rejects_an_empty_sequence() {
        let mut args = base_args();
        args.push("for-each");
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(cli.finish().is_err());
    }

    #[test]
    fn defaults_to_inbox_when_no_folder_is_given() {
        let mut args = base_args();
        args.push("count");
        let cli = Cli::try_parse_from(args).unwrap();
        let plan = cli.finish().unwrap();
        assert_eq!(plan.folders, vec!["INBOX".to_string()]);
    }

    #[test]
    fn repeated_folder_flags_are_all_kept_in_order() {
        let mut args = base_args();
        args.extend(["--folder", "INBOX", "--folder", "Archive", "count"]);
        let cli = Cli::try_parse_from(args).unwrap();
        let plan = cli.finish().unwrap();
        assert_eq!(plan.folders, vec!["INBOX".to_string(), "Archive".to_string()]);
    }
}

fn plan_for_each(items: Vec<String>) -> Result<Vec<PlannedAction>> {
    let mut groups: Vec<Vec<String>> = vec![Vec::new()];
    for item in items {
        if item == ";" || item == "\\;" {
            groups.push(Vec::new());
        } else {
            groups.last_mut().expect("always at least one group").push(item);
        }
    }

    let mut actions = Vec::new();
    for group in groups {
        if group.is_empty() {
            continue;
        }
        let parsed = SubActionArgs::try_parse_from(std::iter::once("mailsweep-for-each-item".to_string()).chain(group))
            .context("failed to parse a for-each sub-action")?;
        actions.push(match parsed.action {
            SubAction::List => PlannedAction::List,
            SubAction::Count => PlannedAction::Count,
            SubAction::Mark(args) => planned_mark(args),
            SubAction::Fetch(args) => planned_fetch(args)?,
            SubAction::Delete(args) => planned_delete(args),
        });
    }

    if actions.is_empty() {
        bail!("for-each requires at least one sub-action");
    }
    Ok(actions)
}
