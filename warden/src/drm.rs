//! License/identity tick.
//!
//! Periodically re-validates the host identity over the control channel. A
//! single failure is normal (host asleep, service restarting); only a streak
//! marks the identity invalid, and the manager decides what to do with that.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::hostsvc::HostServices;

const TICK_INTERVAL: Duration = Duration::from_secs(300);
const MAX_FAILURES: u32 = 3;

pub struct DrmMonitor {
    host: Arc<dyn HostServices>,
    failures: AtomicU32,
    on_invalid: Box<dyn Fn() + Send + Sync>,
}

impl DrmMonitor {
    pub fn new(host: Arc<dyn HostServices>, on_invalid: Box<dyn Fn() + Send + Sync>) -> Self {
        Self {
            host,
            failures: AtomicU32::new(0),
            on_invalid,
        }
    }

    pub async fn run(self: Arc<Self>, mut early_stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(TICK_INTERVAL) => self.tick().await,
                _ = early_stop.changed() => return,
            }
        }
    }

    pub async fn tick(&self) {
        match self.host.get_user().await {
            Ok(user) => {
                self.failures.store(0, Ordering::SeqCst);
                tracing::trace!(user = %user.name, "identity tick ok");
            }
            Err(e) => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::debug!(error = %e, failures = failures, "identity tick failed");
                if failures == MAX_FAILURES {
                    tracing::error!("host identity could not be validated");
                    (self.on_invalid)();
                }
            }
        }
    }
}
