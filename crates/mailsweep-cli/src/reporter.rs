//! Porcelain/human output and the end-of-cycle good/bad summary,
//! including notification and hook dispatch.

use mailsweep_core::{Account, CycleState, hooks};

use crate::cli::OutputArgs;

pub fn print_folder_list(folders: &[String]) {
    for folder in folders {
        println!("{folder}");
    }
}

pub fn print_count(folder: &str, count: usize, porcelain: bool) {
    if porcelain {
        println!("{count} {folder}");
    } else {
        println!("{folder}: {count} matching message(s)");
    }
}

/// Prints the cycle's good/bad summary and fires the configured
/// notification/hook for whichever outcome occurred.
pub async fn summarize_account(account: &Account, output: &OutputArgs) {
    let t = &account.telemetry;
    let summary = format!(
        "delivered={} undelivered={} marked={} trashed={} deleted={} errors={}",
        t.delivered,
        t.undelivered,
        t.marked,
        t.trashed,
        t.deleted,
        account.errors.len()
    );

    if account.has_errors() {
        eprintln!("{} {}: {summary}", account.host, account.user);
        for error in &account.errors {
            eprintln!("  - {error}");
        }
        notify_and_hook(output, output.notify_failure, &output.failure_cmd, hooks::NotifyCategory::Error, "mailsweep sweep failed", &summary)
            .await;
    } else {
        if !output.quiet {
            println!("{} {}: {summary}", account.host, account.user);
        }
        notify_and_hook(output, output.notify_success, &output.success_cmd, hooks::NotifyCategory::Info, "mailsweep sweep complete", &summary)
            .await;
    }
}

async fn notify_and_hook(
    output: &OutputArgs,
    should_notify: bool,
    hook_cmd: &Option<String>,
    category: hooks::NotifyCategory,
    title: &str,
    body: &str,
) {
    if should_notify {
        if let Some(binary) = &output.notify_binary {
            hooks::notify(binary, category, "mailsweep", title, body).await;
        }
    }
    if let Some(cmd) = hook_cmd {
        hooks::run_hook(cmd, title, body).await;
    }
}

/// Runs every deduplicated post-cycle `new-mail` hook once.
pub async fn run_new_mail_hooks(cycle: &CycleState) {
    for command in cycle.pending_hooks() {
        hooks::run_hook(command, "mailsweep new mail", "").await;
    }
}
