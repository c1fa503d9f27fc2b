//! Line-framed JSON RPC wire types.
//!
//! Every RPC surface in the workspace (host, guest, internal, agent, host
//! service client) speaks the same framing: one JSON object per line, a
//! request carrying a caller-chosen id, a response echoing it. Methods are
//! snake_case strings; params and results are free-form JSON validated by
//! the handler.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Lifecycle states of a machine.
///
/// `Restoring` exists only between process start and the end of store
/// replay; `Deleted` is terminal and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    Restoring,
    Stopped,
    Starting,
    Running,
    Stopping,
    Deleted,
}

impl MachineStatus {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            MachineStatus::Starting | MachineStatus::Running | MachineStatus::Stopping
        )
    }

    pub fn can_start(self) -> bool {
        matches!(self, MachineStatus::Stopped)
    }

    pub fn can_stop(self) -> bool {
        matches!(self, MachineStatus::Starting | MachineStatus::Running)
    }
}

/// Seccomp confinement flavor applied to a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SeccompPolicy {
    Default,
    Isolated,
    Emulated,
    EmulatedIsolated,
}

impl Default for SeccompPolicy {
    fn default() -> Self {
        SeccompPolicy::Default
    }
}

/// Machine metadata as returned to RPC callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub builtin: bool,
    pub status: MachineStatus,
    pub rootfs_dir: String,
    pub default_user: String,
    pub created_at: String,
}

// ============================================================================
// Agent surface
// ============================================================================

/// Methods the manager invokes on the per-machine agent.
pub mod agent {
    pub const DIAL_ENGINE_SOCKET: &str = "dial_engine_socket";
    pub const WAIT_ENGINE_START: &str = "wait_engine_start";
    pub const UPDATE_HOSTNAME: &str = "update_hostname";
    pub const SYNC_ENGINE_EVENTS: &str = "sync_engine_events";
    pub const ADD_DEVICE_NODE: &str = "add_device_node";
    pub const REMOVE_DEVICE_NODE: &str = "remove_device_node";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateHostnameParams {
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceNodeParams {
    pub path: String,
}

// ============================================================================
// Host service surface
// ============================================================================

/// Methods the manager invokes on the host control service.
pub mod hostsvc {
    pub const GET_USER: &str = "get_user";
    pub const GET_EXTRA_CA_CERTIFICATES: &str = "get_extra_ca_certificates";
    pub const ADD_ENGINE_BRIDGE: &str = "add_engine_bridge";
    pub const REMOVE_ENGINE_BRIDGE: &str = "remove_engine_bridge";
}

/// Host-side identity of the human user, used for NFS anon squashing and
/// socket ownership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
}
