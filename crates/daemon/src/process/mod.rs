pub mod utils;

use std::path::Path;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use common::fs::FsNotification;

use crate::daemon::{Daemon, DaemonError};
use crate::state::AppState;
use crate::watcher::Watcher;

const LOG_FILE_PREFIX: &str = "cumulus.log";

/// `RUST_LOG` wins; otherwise `default` (or `info` if it does not parse)
fn env_filter(default: &str) -> EnvFilter {
    let fallback = EnvFilter::try_new(default).unwrap_or_else(|_| EnvFilter::new("info"));
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) => EnvFilter::try_new(directives).unwrap_or(fallback),
        Err(_) => fallback,
    }
}

/// Install the global subscriber: compact stdout, plus a daily rolling file
/// under `log_dir` when one is given.
///
/// The returned guards flush the non-blocking writers when dropped and must
/// outlive the engine.
pub fn init_logging(log_level: &str, log_dir: Option<&Path>) -> Vec<WorkerGuard> {
    let mut guards = Vec::new();

    let (stdout, guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(guard);
    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout)
        .with_filter(env_filter(log_level));

    let file_layer = log_dir.and_then(|dir| match std::fs::create_dir_all(dir) {
        Ok(()) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX));
            guards.push(guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(env_filter(log_level)),
            )
        }
        Err(e) => {
            eprintln!("Warning: no log files, cannot create {:?}: {}", dir, e);
            None
        }
    });

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .init();

    utils::register_panic_logger();
    utils::report_build_info();
    guards
}

/// Run the engine until SIGINT or SIGTERM.
///
/// Each tick runs one engine round; watcher notifications are handed to the
/// engine as they arrive and picked up on the next round.
pub async fn run(state: AppState) -> Result<(), DaemonError> {
    let tick = Duration::from_millis(state.config.tick_ms.max(1));
    let mut daemon = Daemon::open(state)?;

    let watcher = Watcher::new(&daemon.roots()).unwrap_or_else(|e| {
        tracing::error!("filesystem notifications unavailable: {}", e);
        daemon.notify(FsNotification::Unavailable);
        Watcher::disabled()
    });
    let notifications = watcher.receiver();

    let shutdown = utils::ShutdownSignal::install()?;
    let mut stop = shutdown.subscribe();
    let mut ticks = tokio::time::interval(tick);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(syncs = daemon.roots().len(), tick_ms = tick.as_millis() as u64, "engine running");
    loop {
        tokio::select! {
            _ = ticks.tick() => daemon.step()?,
            Ok(notification) = notifications.recv_async() => daemon.notify(notification),
            _ = stop.changed() => break,
        }
    }

    drop(watcher);
    daemon.shutdown()
}
