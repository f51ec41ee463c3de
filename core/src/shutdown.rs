//! Cooperative shutdown.
//!
//! A clone-able stop flag shared by the ingest loop and the background
//! tasks. The first stop signal requests a cooperative drain; a second one
//! terminates the process immediately, mirroring the traditional
//! restore-default-handlers behavior.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{error, info, warn};

#[derive(Clone, Default)]
pub struct StopFlag {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a cooperative stop. Idempotent.
    pub fn trigger(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Resolve once the flag is set. Returns immediately if it already is.
    pub async fn wait(&self) {
        loop {
            if self.is_set() {
                return;
            }
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// Install the two-stage signal handling task: the first SIGINT/SIGTERM
/// sets the stop flag so loops drain and exit; the second one terminates
/// the process on the spot.
pub fn install_signal_handlers(stop: StopFlag) {
    tokio::spawn(async move {
        if let Err(e) = signal_task(stop).await {
            error!("signal handling unavailable: {e}");
        }
    });
}

async fn signal_task(stop: StopFlag) -> std::io::Result<()> {
    wait_for_signal().await?;
    info!("signal received, finishing after cached data are sent (send again to exit immediately)");
    stop.trigger();
    wait_for_signal().await?;
    warn!("second signal received, exiting immediately");
    std::process::exit(1);
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
