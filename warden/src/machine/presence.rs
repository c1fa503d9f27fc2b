//! Name presence for discovery.
//!
//! Machines are announced by name (mDNS-style) so host-side tooling can
//! resolve them. Rename pulls the old name out before any state changes and
//! re-announces whatever name the machine ends up with.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Clone, Default)]
pub struct Presence {
    names: Arc<Mutex<HashSet<String>>>,
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: &str) {
        if self.names.lock().insert(name.to_string()) {
            tracing::debug!(name = name, "announcing machine name");
        }
    }

    pub fn remove(&self, name: &str) {
        if self.names.lock().remove(name) {
            tracing::debug!(name = name, "withdrawing machine name");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.lock().contains(name)
    }
}
