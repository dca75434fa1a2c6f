//! Stop-signal handling.
//!
//! A stop request is only ever observed between turns: the scheduler checks
//! the flag before selecting the next role, never while a write or a driver
//! call is in flight.
//!
//! ```text
//! Ctrl-C / SIGTERM
//!    │
//!    ▼
//! StopSignal::request()   (flag set, nothing else)
//!    │
//!    ▼
//! Scheduler, between turns: persist and return Stopped
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

/// Shared, cloneable stop flag.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the scheduler to stop at the next turn boundary.
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Spawn a task that sets the flag on Ctrl-C (and SIGTERM on Unix).
    ///
    /// Must be called from within a tokio runtime.
    pub fn install(&self) {
        let signal = self.clone();
        tokio::spawn(async move {
            wait_for_shutdown().await;
            info!("Stop requested; finishing the current turn before exiting");
            signal.request();
        });
    }
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Could not register SIGTERM handler: {e}");
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Could not listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}
