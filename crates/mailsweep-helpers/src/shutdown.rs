use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// The two distinct signal channels the scheduler reacts to: a "wake" that
/// cuts the inter-cycle sleep short and starts the next cycle immediately,
/// and an "interrupt" that requests graceful shutdown at the next safe
/// point. A second interrupt received after the first escalates to an
/// immediate process exit.
#[derive(Clone)]
pub struct Signals {
    pub wake: Arc<tokio::sync::Notify>,
    pub interrupt: CancellationToken,
}

impl Signals {
    pub fn new() -> Self {
        Self { wake: Arc::new(tokio::sync::Notify::new()), interrupt: CancellationToken::new() }
    }
}

impl Default for Signals {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs forever, translating OS signals into the `Signals` channels.
///
/// `SIGUSR1` fires `wake` once per delivery. The first `SIGINT`/`SIGTERM`
/// cancels `interrupt`; a second one received afterwards terminates the
/// process immediately with a non-zero status, matching the "hit ^C twice
/// to abort" contract of the interactive sleep.
pub async fn listen_signals(signals: Signals) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigusr1 = match signal(SignalKind::user_defined1()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("failed to install SIGUSR1 handler: error={err}");
                listen_interrupt_only(signals).await;
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("failed to install SIGTERM handler: error={err}");
                listen_interrupt_only(signals).await;
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("failed to install SIGINT handler: error={err}");
                listen_interrupt_only(signals).await;
                return;
            }
        };

        loop {
            tokio::select! {
                _ = sigusr1.recv() => {
                    warn!("wake signal received: SIGUSR1");
                    signals.wake.notify_waiters();
                }
                _ = sigterm.recv() => {
                    warn!("interrupt signal received: SIGTERM");
                    escalate_or_cancel(&signals.interrupt);
                }
                _ = sigint.recv() => {
                    warn!("interrupt signal received: SIGINT");
                    escalate_or_cancel(&signals.interrupt);
                }
            }
        }
    }

    #[cfg(not(unix))]
    listen_interrupt_only(signals).await;
}

async fn listen_interrupt_only(signals: Signals) {
    loop {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("interrupt signal received: ctrl-c");
        escalate_or_cancel(&signals.interrupt);
    }
}

fn escalate_or_cancel(interrupt: &CancellationToken) {
    if interrupt.is_cancelled() {
        warn!("second interrupt received, aborting immediately");
        std::process::exit(130);
    }
    interrupt.cancel();
}
