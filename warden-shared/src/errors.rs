//! Error handling for the warden workspace.
//!
//! One enum for the whole workspace; RPC surfaces return the display string
//! to callers, so variants carry short machine-readable prefixes.

use thiserror::Error;

pub type WardenResult<T> = Result<T, WardenError>;

#[derive(Error, Debug)]
pub enum WardenError {
    /// Bad input from a caller. No mutation was performed.
    #[error("validation: {0}")]
    Validation(String),

    #[error("machine not found: {0}")]
    MachineNotFound(String),

    #[error("name already in use: {0}")]
    NameTaken(String),

    /// The manager is shutting down and refuses new work.
    #[error("manager is stopping")]
    Stopping,

    #[error("store: {0}")]
    Store(String),

    #[error("mount: {0}")]
    Mount(String),

    #[error("netlink: {0}")]
    Netlink(String),

    #[error("lxc: {0}")]
    Lxc(String),

    #[error("agent: {0}")]
    Agent(String),

    #[error("proxy: {0}")]
    Proxy(String),

    #[error("host service: {0}")]
    HostService(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WardenError {
    /// True for errors a caller can fix by changing the request.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            WardenError::Validation(_)
                | WardenError::MachineNotFound(_)
                | WardenError::NameTaken(_)
                | WardenError::InvalidState(_)
        )
    }
}

/// Collapse errors from a parallel fan-out into one.
///
/// Returns `Ok(())` when the list is empty, the sole error when there is one,
/// and a newline-joined aggregate otherwise.
pub fn join_errors(errors: Vec<WardenError>) -> WardenResult<()> {
    let mut errors = errors;
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(WardenError::Internal(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_empty_is_ok() {
        assert!(join_errors(Vec::new()).is_ok());
    }

    #[test]
    fn test_join_single_preserves_variant() {
        let err = join_errors(vec![WardenError::MachineNotFound("m1".into())]).unwrap_err();
        assert!(matches!(err, WardenError::MachineNotFound(_)));
    }

    #[test]
    fn test_join_many_aggregates() {
        let err = join_errors(vec![
            WardenError::Internal("a".into()),
            WardenError::Internal("b".into()),
        ])
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains('a') && msg.contains('b'));
    }
}
