//! Runs one cycle for one account: connect once, then for every
//! sub-action in order, visit every folder in order running just that
//! sub-action, honoring the account-level error barriers, then logout.
//! Sub-actions are outer and folders inner so that a later folder's
//! failure of an earlier sub-action is recorded before an independent
//! later sub-action (e.g. `delete`) ever runs against any folder.

use mailsweep_core::{Account, Connection, CycleState, Failure, FilterSpec, action, folder};
use tracing::{error, info, warn};

use crate::cli::PlannedAction;
use crate::reporter;

pub struct CycleOutcome {
    pub had_errors: bool,
}

pub async fn run_cycle(
    account: &mut Account,
    folders: &[String],
    filter: &FilterSpec,
    actions: &[PlannedAction],
    trace: bool,
    porcelain: bool,
    cycle: &mut CycleState,
) -> anyhow::Result<CycleOutcome> {
    account.begin_cycle();

    let now = time::OffsetDateTime::now_utc();
    let (rendered_filter, _dynamic) = filter.render(now)?;

    let mut conn = match Connection::establish(account, trace).await {
        Ok(conn) => conn,
        Err(err) => {
            error!("connect failed: host={} user={} error={err}", account.host, account.user);
            account.record_error(format!("connect failed: {err}"));
            return Ok(CycleOutcome { had_errors: true });
        }
    };

    if actions.iter().any(|a| matches!(a, PlannedAction::List)) {
        match folder::list_folders(&mut conn).await {
            Ok(names) => reporter::print_folder_list(&names),
            Err(err) => {
                account.record_error(format!("LIST failed: {err}"));
                warn!("list folders failed: error={err}");
            }
        }
    }

    let folder_actions: Vec<&PlannedAction> =
        actions.iter().filter(|a| !matches!(a, PlannedAction::List)).collect();

    let mut account_soft_tripped = false;

    for planned in folder_actions.iter().copied() {
        if account_soft_tripped {
            account.record_error(
                "sub-action skipped: an account-soft failure already ended this cycle".to_string(),
            );
            break;
        }

        for folder_name in folders {
            if let Err(err) = folder::select(&mut conn, folder_name).await {
                account.record_error(format!("select {folder_name} failed: {err}"));
                warn!("folder select failed: folder={folder_name} error={err}");
                continue;
            }

            let result =
                run_action(&mut conn, account, folder_name, filter, &rendered_filter, planned, cycle, porcelain)
                    .await;

            if let Err(err) = folder::close(&mut conn).await {
                warn!("folder close failed: folder={folder_name} error={err}");
            }

            match result {
                Ok(()) => {}
                Err(Failure::Folder(msg)) => {
                    account.record_error(msg);
                }
                Err(Failure::AccountSoft(msg)) => {
                    account.record_error(msg);
                    account_soft_tripped = true;
                    break;
                }
                Err(Failure::Account(msg)) => {
                    account.record_error(msg);
                    conn.force_close();
                    return Ok(CycleOutcome { had_errors: true });
                }
                Err(Failure::Catastrophic(msg)) => return Err(anyhow::anyhow!(msg)),
            }
        }
    }

    conn.logout().await;
    info!("cycle complete: host={} user={} errors={}", account.host, account.user, account.errors.len());
    Ok(CycleOutcome { had_errors: account.has_errors() })
}

async fn run_action(
    conn: &mut Connection,
    account: &mut Account,
    folder_name: &str,
    filter: &FilterSpec,
    rendered_filter: &str,
    planned: &PlannedAction,
    cycle: &mut CycleState,
    porcelain: bool,
) -> Result<(), Failure> {
    match planned {
        PlannedAction::List => Ok(()),
        PlannedAction::Count => {
            let count = action::count(conn, rendered_filter).await?;
            reporter::print_count(folder_name, count, porcelain);
            Ok(())
        }
        PlannedAction::Mark(marking) => {
            let marking = marking.resolve(filter);
            action::mark(conn, account, rendered_filter, marking).await
        }
        PlannedAction::Fetch(spec) => {
            action::fetch(conn, account, folder_name, filter, rendered_filter, spec, cycle).await
        }
        PlannedAction::Delete(method) => action::delete(conn, account, folder_name, rendered_filter, *method).await,
    }
}
