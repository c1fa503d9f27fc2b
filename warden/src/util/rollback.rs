//! Undo lists for compound operations.
//!
//! Rename, bridge add, and the wormhole mount are multi-step: each step that
//! succeeds registers its inverse here, and on a later failure the inverses
//! run in reverse order. The original error is always the one returned to
//! the caller; failures of the inverses themselves are only logged.

use warden_shared::WardenResult;

type Undo = Box<dyn FnOnce() -> WardenResult<()> + Send>;

pub struct Rollback {
    undos: Vec<(&'static str, Undo)>,
}

impl Rollback {
    pub fn new() -> Self {
        Self { undos: Vec::new() }
    }

    /// Register the inverse of a step that just succeeded.
    pub fn push<F>(&mut self, label: &'static str, undo: F)
    where
        F: FnOnce() -> WardenResult<()> + Send + 'static,
    {
        self.undos.push((label, Box::new(undo)));
    }

    /// The operation completed; drop all undos.
    pub fn disarm(mut self) {
        self.undos.clear();
    }

    /// The operation failed; run every undo in reverse registration order.
    pub fn run(mut self) {
        while let Some((label, undo)) = self.undos.pop() {
            if let Err(e) = undo() {
                tracing::warn!(step = label, error = %e, "rollback step failed");
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.undos.is_empty()
    }
}

impl Default for Rollback {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use warden_shared::WardenError;

    #[test]
    fn test_runs_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut rb = Rollback::new();
        for i in 0..3 {
            let order = Arc::clone(&order);
            rb.push("step", move || {
                order.lock().unwrap().push(i);
                Ok(())
            });
        }
        rb.run();
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn test_disarm_skips_undos() {
        let ran = Arc::new(Mutex::new(false));
        let mut rb = Rollback::new();
        {
            let ran = Arc::clone(&ran);
            rb.push("step", move || {
                *ran.lock().unwrap() = true;
                Ok(())
            });
        }
        rb.disarm();
        assert!(!*ran.lock().unwrap());
    }

    #[test]
    fn test_failed_undo_does_not_stop_the_rest() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut rb = Rollback::new();
        {
            let order = Arc::clone(&order);
            rb.push("first", move || {
                order.lock().unwrap().push("first");
                Ok(())
            });
        }
        rb.push("failing", || Err(WardenError::Internal("boom".into())));
        rb.run();
        assert_eq!(*order.lock().unwrap(), vec!["first"]);
    }
}
