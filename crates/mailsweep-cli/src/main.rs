mod cli;
mod orchestrator;
mod reporter;
mod scheduler;

use std::process::ExitCode;

use clap::Parser;
use cli::{Cli, Plan, PlannedAction};
use mailsweep_core::CycleState;
use mailsweep_helpers::{logging, shutdown};
use tracing::info;

/// A single-threaded runtime is the required contract: no implicit
/// cross-account parallelism, matching the teacher's own `imap_fetcher`
/// tool's `current_thread` flavor.
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(2);
        }
    };

    logging::init_logging("mailsweep=info,tokio=warn", "MAILSWEEP_LOG");

    let plan = match cli.finish() {
        Ok(plan) => plan,
        Err(err) => {
            eprintln!("mailsweep: {err:#}");
            return ExitCode::from(2);
        }
    };

    if plan.output.very_dry_run {
        describe_plan(&plan);
        return ExitCode::from(1);
    }
    if plan.output.dry_run {
        describe_plan(&plan);
    }

    run_schedule(plan).await
}

async fn run_schedule(plan: Plan) -> ExitCode {
    let Plan { mut account, folders, filter, actions, schedule, output } = plan;

    let signals = shutdown::Signals::new();
    tokio::spawn(shutdown::listen_signals(signals.clone()));

    let poll = !schedule.once && schedule.every.is_some();
    let mut had_errors = false;
    let mut first = true;

    loop {
        if signals.interrupt.is_cancelled() {
            break;
        }

        if poll && first {
            let pre_jitter = scheduler::jittered(schedule.jitter);
            if scheduler::sleep_cancellable(pre_jitter, &signals).await.is_interrupted() {
                break;
            }
        }
        first = false;

        let start = tokio::time::Instant::now();
        let mut cycle = CycleState::new();
        let outcome = orchestrator::run_cycle(
            &mut account,
            &folders,
            &filter,
            &actions,
            output.trace,
            output.porcelain,
            &mut cycle,
        )
        .await;

        match outcome {
            Ok(outcome) => {
                reporter::run_new_mail_hooks(&cycle).await;
                reporter::summarize_account(&account, &output).await;
                had_errors = had_errors || outcome.had_errors;
            }
            Err(err) => {
                eprintln!("mailsweep: catastrophic failure: {err:#}");
                return ExitCode::from(1);
            }
        }

        if !poll || signals.interrupt.is_cancelled() {
            break;
        }

        let elapsed = start.elapsed();
        let delay = scheduler::next_delay(schedule.every.expect("poll implies every is set"), elapsed, schedule.jitter);
        info!("next cycle in {delay:?}");
        if scheduler::sleep_cancellable(delay, &signals).await.is_interrupted() {
            break;
        }
    }

    if had_errors { ExitCode::from(1) } else { ExitCode::SUCCESS }
}

fn describe_plan(plan: &Plan) {
    println!("account: {}@{}", plan.account.user, plan.account.host);
    println!("folders: {}", plan.folders.join(", "));
    for action in &plan.actions {
        match action {
            PlannedAction::List => println!("- list"),
            PlannedAction::Count => println!("- count"),
            PlannedAction::Mark(marking) => println!("- mark {marking:?}"),
            PlannedAction::Fetch(spec) => println!(
                "- fetch (batch-number={}, batch-size={}, mode={:?})",
                spec.batch_number, spec.batch_size, spec.delivery_mode
            ),
            PlannedAction::Delete(method) => println!("- delete {method:?}"),
        }
    }
}
