//! Process-wide configuration, resolved once at startup and threaded through
//! constructors. Nothing here mutates after `GuestConfig` is built.

use std::path::{Path, PathBuf};

use warden_shared::{WardenError, WardenResult};

/// Hostname the guest VM is provisioned with. Running the manager anywhere
/// else is a configuration error.
pub const GUEST_HOSTNAME: &str = "wardenvm";

/// Name of the builtin machine that runs the container engine.
pub const ENGINE_MACHINE_NAME: &str = "engine";
/// Name of the builtin machine that runs the k8s control plane.
pub const K8S_MACHINE_NAME: &str = "k8s";

/// TCP port of the engine HTTP proxy on the guest NIC.
pub const ENGINE_PROXY_PORT: u16 = 62375;
/// TCP port of the kernel NFS server on the guest NIC.
pub const NFS_PORT: u16 = 2049;
/// TCP port of the internal RPC surface (lxc hooks connect here).
pub const INTERNAL_RPC_PORT: u16 = 62420;
/// TCP port of the krpc initiator listener (the external host surface).
pub const KRPC_PORT: u16 = 62421;
/// TCP port of the control service on the host side.
pub const HOST_SERVICE_PORT: u16 = 62422;

/// Guest NIC addresses on the control network.
pub const GUEST_IP4: &str = "198.19.249.2";
pub const GUEST_IP6: &str = "fd07:36a9:d17c:f0::2";
/// Host-side peer; the only client the NFS server will authorize.
pub const HOST_IP4: &str = "198.19.249.1";

/// Trunk interface the host vlan router delivers per-bridge traffic on.
pub const VLAN_TRUNK_IFNAME: &str = "eth2";

/// Subnets owned by the guest itself. Engine bridges must not overlap these.
pub const INTERNAL_SUBNETS: &[&str] = &[
    "198.19.249.0/24",
    "198.19.250.0/24",
    "fd07:36a9:d17c:f0::/64",
];

/// First five octets of every bridge-mirror MAC; the last octet encodes the
/// vlan id and the host/guest direction bit.
pub const BRIDGE_MAC_TEMPLATE: [u8; 5] = [0x5e, 0xa1, 0xb0, 0x42, 0xc7];

#[derive(Debug, Clone)]
pub struct GuestConfig {
    /// Root of the persistent data volume.
    pub data_dir: PathBuf,
    /// Runtime sockets directory.
    pub run_dir: PathBuf,
    /// Mirror root exported to the host, one subdir per machine.
    pub nfs_root_dir: PathBuf,
    /// Flat forward-facing mirror root bind-mounted into machines.
    pub nfs_machines_dir: PathBuf,
    /// Mirror root for engine image layer mounts, one subdir per tag.
    pub nfs_images_dir: PathBuf,
    /// The single NFS client the kernel upcalls will authorize.
    pub allowed_nfs_client: String,
    /// Set by tests to skip hostname and privilege checks.
    pub test_mode: bool,
}

impl GuestConfig {
    /// Build the production configuration. Fails unless the process is
    /// actually running inside the guest VM.
    pub fn detect() -> WardenResult<Self> {
        let hostname = nix::unistd::gethostname()
            .map_err(|e| WardenError::Internal(format!("gethostname: {}", e)))?;
        if hostname.to_string_lossy() != GUEST_HOSTNAME {
            return Err(WardenError::Validation(format!(
                "not running in the guest VM (hostname {:?})",
                hostname
            )));
        }

        Ok(Self {
            data_dir: PathBuf::from("/data/warden"),
            run_dir: PathBuf::from("/run/warden"),
            nfs_root_dir: PathBuf::from("/nfs/root"),
            nfs_machines_dir: PathBuf::from("/nfs/machines"),
            nfs_images_dir: PathBuf::from("/nfs/images"),
            allowed_nfs_client: HOST_IP4.to_string(),
            test_mode: false,
        })
    }

    /// Configuration rooted in a scratch directory, for tests.
    pub fn for_tests(root: &Path) -> Self {
        Self {
            data_dir: root.join("data"),
            run_dir: root.join("run"),
            nfs_root_dir: root.join("nfs/root"),
            nfs_machines_dir: root.join("nfs/machines"),
            nfs_images_dir: root.join("nfs/images"),
            allowed_nfs_client: HOST_IP4.to_string(),
            test_mode: true,
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store.db")
    }

    /// Per-machine rootfs parent directory.
    pub fn machines_dir(&self) -> PathBuf {
        self.data_dir.join("containers")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn network_dir(&self) -> PathBuf {
        self.data_dir.join("network")
    }

    pub fn engine_proxy_socket(&self) -> PathBuf {
        self.run_dir.join("engine.sock")
    }

    pub fn guest_rpc_socket(&self) -> PathBuf {
        self.run_dir.join("guest.sock")
    }

    pub fn internal_rpc_socket(&self) -> PathBuf {
        self.run_dir.join("internal.sock")
    }

    /// Agent socket path inside a machine's rootfs.
    pub fn agent_socket(&self, rootfs_dir: &Path) -> PathBuf {
        rootfs_dir.join("run/warden-agent.sock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_paths_derive_from_data_dir() {
        let dir = TempDir::new().unwrap();
        let cfg = GuestConfig::for_tests(dir.path());
        assert!(cfg.store_path().starts_with(&cfg.data_dir));
        assert!(cfg.machines_dir().ends_with("containers"));
        assert!(cfg.logs_dir().ends_with("logs"));
    }
}
