use std::time::Duration;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::watch;

use crate::version::build_info;

/// Time given to in-flight work after SIGTERM before the loop is told to stop
const TERM_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// SIGINT/SIGTERM listener.
///
/// Listening starts when the signal is installed; clones of the receiver
/// observe the shutdown as a changed watch value.
pub struct ShutdownSignal {
    trigger: watch::Sender<bool>,
    listener: tokio::task::JoinHandle<()>,
}

impl ShutdownSignal {
    pub fn install() -> std::io::Result<Self> {
        let sigint = signal(SignalKind::interrupt())?;
        let sigterm = signal(SignalKind::terminate())?;
        let (trigger, _) = watch::channel(false);
        let listener = tokio::spawn(listen(sigint, sigterm, trigger.clone()));
        Ok(Self { trigger, listener })
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.trigger.subscribe()
    }

    /// Stop without waiting for a signal
    pub fn trigger(&self) {
        let _ = self.trigger.send(true);
    }
}

impl Drop for ShutdownSignal {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen(mut sigint: Signal, mut sigterm: Signal, trigger: watch::Sender<bool>) {
    tokio::select! {
        _ = sigint.recv() => {
            tracing::info!("SIGINT received, stopping");
        }
        _ = sigterm.recv() => {
            tracing::info!(grace_ms = TERM_GRACE_PERIOD.as_millis() as u64, "SIGTERM received, stopping");
            tokio::time::sleep(TERM_GRACE_PERIOD).await;
        }
    }
    let _ = trigger.send(true);
}

/// Route panics through `tracing` so they land in the log file too
pub fn register_panic_logger() {
    std::panic::set_hook(Box::new(|panic| {
        let thread = std::thread::current();
        let thread = thread.name().unwrap_or("<unnamed>");
        match panic.location() {
            Some(loc) => tracing::error!(
                message = %panic,
                thread,
                panic.file = loc.file(),
                panic.line = loc.line(),
            ),
            None => tracing::error!(message = %panic, thread),
        }
    }));
}

pub fn report_build_info() {
    let build = build_info();
    tracing::info!(
        version = build.version,
        repo_version = build.repo_version,
        build_profile = build.build_profile,
        built_at = build.build_timestamp,
        "cumulus starting"
    );
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_trigger_reaches_subscribers() {
        let signal = ShutdownSignal::install().unwrap();
        let mut rx = signal.subscribe();
        assert!(!*rx.borrow());

        signal.trigger();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }
}
