//! Guest network orchestration.
//!
//! For every bridge the container engine creates, the host allocates a vlan
//! and the manager builds an L3 mirror of it inside the engine machine's
//! network namespace: a source-filter macvlan on the vlan trunk, proxy-ARP
//! and proxy-NDP with zero delay, host routes, and proxy-neigh entries for
//! the return path. Add and remove are strict inverses; add rolls back fully
//! on any failure.

pub mod linkops;

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use warden_shared::{WardenError, WardenResult};

use crate::config::{GuestConfig, BRIDGE_MAC_TEMPLATE, INTERNAL_SUBNETS, VLAN_TRUNK_IFNAME};
use crate::hostsvc::HostServices;
use crate::util::Rollback;

pub use linkops::{LinkOps, MirrorSpec, NetlinkOps};

// ============================================================================
// Subnets
// ============================================================================

/// An IPv4 or IPv6 prefix with integer math for overlap checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subnet {
    addr: u128,
    prefix: u8,
    v6: bool,
}

impl Subnet {
    pub fn is_v6(&self) -> bool {
        self.v6
    }

    fn mask(&self) -> u128 {
        let width: u8 = if self.v6 { 128 } else { 32 };
        if self.prefix == 0 {
            0
        } else {
            (!0u128) << (width - self.prefix)
        }
    }

    pub fn contains(&self, other: &Subnet) -> bool {
        self.v6 == other.v6
            && other.prefix >= self.prefix
            && (other.addr & self.mask()) == (self.addr & self.mask())
    }

    pub fn intersects(&self, other: &Subnet) -> bool {
        self.contains(other) || other.contains(self)
    }
}

impl FromStr for Subnet {
    type Err = WardenError;

    fn from_str(s: &str) -> WardenResult<Self> {
        let (addr_str, prefix_str) = s
            .split_once('/')
            .ok_or_else(|| WardenError::Validation(format!("subnet missing prefix: {:?}", s)))?;
        let addr: IpAddr = addr_str
            .parse()
            .map_err(|_| WardenError::Validation(format!("bad subnet address: {:?}", s)))?;
        let prefix: u8 = prefix_str
            .parse()
            .map_err(|_| WardenError::Validation(format!("bad subnet prefix: {:?}", s)))?;
        let (addr, v6, width) = match addr {
            IpAddr::V4(a) => (u32::from(a) as u128, false, 32),
            IpAddr::V6(a) => (u128::from(a), true, 128),
        };
        if prefix > width {
            return Err(WardenError::Validation(format!(
                "subnet prefix out of range: {:?}",
                s
            )));
        }
        Ok(Subnet { addr, prefix, v6 })
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.v6 {
            write!(
                f,
                "{}/{}",
                std::net::Ipv6Addr::from(self.addr),
                self.prefix
            )
        } else {
            write!(
                f,
                "{}/{}",
                std::net::Ipv4Addr::from(self.addr as u32),
                self.prefix
            )
        }
    }
}

impl TryFrom<String> for Subnet {
    type Error = WardenError;
    fn try_from(s: String) -> WardenResult<Self> {
        s.parse()
    }
}

impl From<Subnet> for String {
    fn from(s: Subnet) -> String {
        s.to_string()
    }
}

// ============================================================================
// MACs
// ============================================================================

/// Derive the (host, guest) MAC pair for a vlan from the install template.
/// The low seven bits of the last octet carry the vlan id; the high bit is
/// clear on the host side and set on the guest side.
pub fn derive_macs(template: [u8; 5], vlan_id: u16) -> ([u8; 6], [u8; 6]) {
    let low = (vlan_id & 0x7f) as u8;
    let mut host = [0u8; 6];
    let mut guest = [0u8; 6];
    host[..5].copy_from_slice(&template);
    guest[..5].copy_from_slice(&template);
    host[5] = low;
    guest[5] = 0x80 | low;
    (host, guest)
}

// ============================================================================
// Bridges
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Engine-side bridge name, unique per engine network.
    pub name: String,
    pub subnet4: Option<Subnet>,
    pub subnet6: Option<Subnet>,
    /// Addresses the engine answers for on the bridge (gateway + service).
    pub addrs: Vec<IpAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BridgeState {
    config: BridgeConfig,
    vlan_id: u16,
    mirror_ifname: String,
    netns_pid: u32,
}

pub struct NetworkManager {
    host: Arc<dyn HostServices>,
    links: Arc<dyn LinkOps>,
    state_path: PathBuf,
    bridges: parking_lot::Mutex<HashMap<String, BridgeState>>,
    internal_subnets: Vec<Subnet>,
}

impl NetworkManager {
    pub fn new(
        cfg: &GuestConfig,
        host: Arc<dyn HostServices>,
        links: Arc<dyn LinkOps>,
    ) -> WardenResult<Self> {
        std::fs::create_dir_all(cfg.network_dir())?;
        let state_path = cfg.network_dir().join("bridges.json");
        let bridges = match std::fs::read_to_string(&state_path) {
            Ok(json) => serde_json::from_str(&json)
                .map_err(|e| WardenError::Internal(format!("decode bridge state: {}", e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        let internal_subnets = INTERNAL_SUBNETS
            .iter()
            .map(|s| s.parse())
            .collect::<WardenResult<Vec<_>>>()?;
        Ok(Self {
            host,
            links,
            state_path,
            bridges: parking_lot::Mutex::new(bridges),
            internal_subnets,
        })
    }

    fn persist(&self) -> WardenResult<()> {
        let bridges = self.bridges.lock();
        let json = serde_json::to_string_pretty(&*bridges)
            .map_err(|e| WardenError::Internal(format!("encode bridge state: {}", e)))?;
        std::fs::write(&self.state_path, json)?;
        Ok(())
    }

    /// Hard rejection of subnets that would collide with the guest's own
    /// routing. Runs before any side effect.
    pub fn check_subnet_conflict(&self, config: &BridgeConfig) -> WardenResult<()> {
        for subnet in config.subnet4.iter().chain(config.subnet6.iter()) {
            for internal in &self.internal_subnets {
                if subnet.intersects(internal) {
                    return Err(WardenError::Validation(format!(
                        "bridge subnet {} conflicts with internal subnet {}",
                        subnet, internal
                    )));
                }
            }
        }
        Ok(())
    }

    /// Wire an engine bridge into the guest: allocate the vlan on the host,
    /// create the macvlan mirror in the engine's netns, and set up routing.
    pub async fn add_bridge(&self, config: BridgeConfig, netns_pid: u32) -> WardenResult<()> {
        self.check_subnet_conflict(&config)?;
        if self.bridges.lock().contains_key(&config.name) {
            return Err(WardenError::Validation(format!(
                "bridge {} already added",
                config.name
            )));
        }

        let mut rollback = Rollback::new();
        let result = self
            .add_bridge_steps(&config, netns_pid, &mut rollback)
            .await;

        match result {
            Ok(state) => {
                rollback.disarm();
                self.bridges.lock().insert(config.name.clone(), state);
                self.persist()?;
                tracing::info!(bridge = %config.name, "engine bridge added");
                Ok(())
            }
            Err(e) => {
                rollback.run();
                Err(e)
            }
        }
    }

    async fn add_bridge_steps(
        &self,
        config: &BridgeConfig,
        netns_pid: u32,
        rollback: &mut Rollback,
    ) -> WardenResult<BridgeState> {
        // host side: vlan allocation + host bridge
        let vlan_id = self.host.add_engine_bridge(&config.name).await?;
        {
            let host = Arc::clone(&self.host);
            let name = config.name.clone();
            rollback.push("host bridge", move || {
                block_on_rollback(async move { host.remove_engine_bridge(&name).await })
            });
        }

        let (host_mac, guest_mac) = derive_macs(BRIDGE_MAC_TEMPLATE, vlan_id);
        let mirror_ifname = format!("wmv{}", vlan_id);

        // macvlan in source-filter mode, parented on the trunk, born into
        // the engine's netns
        self.links
            .create_mirror_link(&mirror_ifname, VLAN_TRUNK_IFNAME, guest_mac, netns_pid)
            .await?;
        {
            let links = Arc::clone(&self.links);
            let ifname = mirror_ifname.clone();
            rollback.push("mirror link", move || {
                block_on_rollback(async move { links.delete_mirror_link(&ifname, netns_pid).await })
            });
        }

        // break the routing loop before any traffic can flow
        self.links.add_host_bridge_port(&mirror_ifname).await?;
        {
            let links = Arc::clone(&self.links);
            let ifname = mirror_ifname.clone();
            rollback.push("nft port", move || {
                block_on_rollback(async move { links.remove_host_bridge_port(&ifname).await })
            });
        }

        let spec = MirrorSpec {
            ifname: mirror_ifname.clone(),
            host_mac,
            addrs: config.addrs.clone(),
        };
        self.links.setup_mirror_in_ns(netns_pid, &spec).await?;
        {
            let links = Arc::clone(&self.links);
            let spec = spec.clone();
            rollback.push("ns mirror", move || {
                block_on_rollback(async move { links.teardown_mirror_in_ns(netns_pid, &spec).await })
            });
        }

        // return path on the guest-visible bridge
        self.links.add_proxy_neigh(&config.addrs).await?;
        {
            let links = Arc::clone(&self.links);
            let addrs = config.addrs.clone();
            rollback.push("proxy neigh", move || {
                block_on_rollback(async move { links.remove_proxy_neigh(&addrs).await })
            });
        }

        Ok(BridgeState {
            config: config.clone(),
            vlan_id,
            mirror_ifname,
            netns_pid,
        })
    }

    /// Strict inverse of `add_bridge`, in reverse order; every step
    /// tolerates having already been undone.
    pub async fn remove_bridge(&self, name: &str) -> WardenResult<()> {
        let state = self
            .bridges
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| WardenError::Validation(format!("bridge {} not found", name)))?;

        let spec = MirrorSpec {
            ifname: state.mirror_ifname.clone(),
            host_mac: derive_macs(BRIDGE_MAC_TEMPLATE, state.vlan_id).0,
            addrs: state.config.addrs.clone(),
        };

        if let Err(e) = self.links.remove_proxy_neigh(&state.config.addrs).await {
            tracing::warn!(bridge = name, error = %e, "proxy neigh removal failed");
        }
        if let Err(e) = self
            .links
            .teardown_mirror_in_ns(state.netns_pid, &spec)
            .await
        {
            tracing::warn!(bridge = name, error = %e, "ns mirror teardown failed");
        }
        if let Err(e) = self
            .links
            .remove_host_bridge_port(&state.mirror_ifname)
            .await
        {
            tracing::warn!(bridge = name, error = %e, "nft port removal failed");
        }
        if let Err(e) = self
            .links
            .delete_mirror_link(&state.mirror_ifname, state.netns_pid)
            .await
        {
            tracing::warn!(bridge = name, error = %e, "mirror link removal failed");
        }
        self.host.remove_engine_bridge(name).await?;

        self.bridges.lock().remove(name);
        self.persist()?;
        tracing::info!(bridge = name, "engine bridge removed");
        Ok(())
    }

    /// Remove every bridge belonging to a stopped engine machine.
    pub async fn remove_all(&self) -> WardenResult<()> {
        let names: Vec<String> = self.bridges.lock().keys().cloned().collect();
        let mut errors = Vec::new();
        for name in names {
            if let Err(e) = self.remove_bridge(&name).await {
                errors.push(e);
            }
        }
        warden_shared::errors::join_errors(errors)
    }
}

/// Rollback closures are synchronous; bridge undo steps are async. Run them
/// on a scratch runtime off the main one.
fn block_on_rollback<F>(fut: F) -> WardenResult<()>
where
    F: std::future::Future<Output = WardenResult<()>> + Send + 'static,
{
    std::thread::spawn(move || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| WardenError::Internal(format!("rollback runtime: {}", e)))?
            .block_on(fut)
    })
    .join()
    .map_err(|_| WardenError::Internal("rollback thread panicked".into()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;
    use warden_shared::wire::HostUser;

    // ------------------------------------------------------------------------
    // Fakes
    // ------------------------------------------------------------------------

    #[derive(Default)]
    struct FakeHost {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl HostServices for FakeHost {
        async fn get_user(&self) -> WardenResult<HostUser> {
            Ok(HostUser {
                name: "user".into(),
                uid: 501,
                gid: 20,
            })
        }

        async fn get_extra_ca_certificates(&self) -> WardenResult<Vec<String>> {
            Ok(Vec::new())
        }

        async fn add_engine_bridge(&self, name: &str) -> WardenResult<u16> {
            self.calls.lock().push(format!("add {}", name));
            Ok(7)
        }

        async fn remove_engine_bridge(&self, name: &str) -> WardenResult<()> {
            self.calls.lock().push(format!("remove {}", name));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeLinks {
        ops: Mutex<Vec<String>>,
        fail_ns_setup: AtomicBool,
    }

    #[async_trait::async_trait]
    impl LinkOps for FakeLinks {
        async fn create_mirror_link(
            &self,
            name: &str,
            parent: &str,
            _mac: [u8; 6],
            _netns_pid: u32,
        ) -> WardenResult<()> {
            self.ops.lock().push(format!("create {} on {}", name, parent));
            Ok(())
        }

        async fn delete_mirror_link(&self, name: &str, _netns_pid: u32) -> WardenResult<()> {
            self.ops.lock().push(format!("delete {}", name));
            Ok(())
        }

        async fn add_host_bridge_port(&self, ifname: &str) -> WardenResult<()> {
            self.ops.lock().push(format!("nft+ {}", ifname));
            Ok(())
        }

        async fn remove_host_bridge_port(&self, ifname: &str) -> WardenResult<()> {
            self.ops.lock().push(format!("nft- {}", ifname));
            Ok(())
        }

        async fn setup_mirror_in_ns(&self, _netns_pid: u32, spec: &MirrorSpec) -> WardenResult<()> {
            if self.fail_ns_setup.load(Ordering::SeqCst) {
                return Err(WardenError::Netlink("injected ns failure".into()));
            }
            self.ops.lock().push(format!("ns+ {}", spec.ifname));
            Ok(())
        }

        async fn teardown_mirror_in_ns(
            &self,
            _netns_pid: u32,
            spec: &MirrorSpec,
        ) -> WardenResult<()> {
            self.ops.lock().push(format!("ns- {}", spec.ifname));
            Ok(())
        }

        async fn add_proxy_neigh(&self, addrs: &[IpAddr]) -> WardenResult<()> {
            self.ops.lock().push(format!("neigh+ {}", addrs.len()));
            Ok(())
        }

        async fn remove_proxy_neigh(&self, addrs: &[IpAddr]) -> WardenResult<()> {
            self.ops.lock().push(format!("neigh- {}", addrs.len()));
            Ok(())
        }
    }

    fn bridge_config(name: &str, subnet4: &str) -> BridgeConfig {
        BridgeConfig {
            name: name.to_string(),
            subnet4: Some(subnet4.parse().unwrap()),
            subnet6: None,
            addrs: vec!["172.20.0.1".parse().unwrap()],
        }
    }

    fn manager(dir: &TempDir) -> (NetworkManager, Arc<FakeHost>, Arc<FakeLinks>) {
        let cfg = GuestConfig::for_tests(dir.path());
        let host = Arc::new(FakeHost::default());
        let links = Arc::new(FakeLinks::default());
        let manager = NetworkManager::new(
            &cfg,
            Arc::clone(&host) as Arc<dyn HostServices>,
            Arc::clone(&links) as Arc<dyn LinkOps>,
        )
        .unwrap();
        (manager, host, links)
    }

    // ------------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------------

    #[test]
    fn test_subnet_parse_and_display() {
        let s: Subnet = "172.20.0.0/16".parse().unwrap();
        assert_eq!(s.to_string(), "172.20.0.0/16");
        let s6: Subnet = "fd00:1::/64".parse().unwrap();
        assert!(s6.is_v6());
        assert!("172.20.0.0".parse::<Subnet>().is_err());
        assert!("172.20.0.0/33".parse::<Subnet>().is_err());
    }

    #[test]
    fn test_subnet_intersection() {
        let a: Subnet = "198.19.249.0/24".parse().unwrap();
        let b: Subnet = "198.19.0.0/16".parse().unwrap();
        let c: Subnet = "10.0.0.0/8".parse().unwrap();
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
        assert!(!a.intersects(&c));
        // different families never intersect
        let v6: Subnet = "fd00::/8".parse().unwrap();
        assert!(!a.intersects(&v6));
    }

    #[test]
    fn test_mac_derivation() {
        let (host, guest) = derive_macs([0x5e, 0xa1, 0xb0, 0x42, 0xc7], 7);
        assert_eq!(host, [0x5e, 0xa1, 0xb0, 0x42, 0xc7, 0x07]);
        assert_eq!(guest, [0x5e, 0xa1, 0xb0, 0x42, 0xc7, 0x87]);
        // only seven bits of the vlan id land in the octet
        let (host, _) = derive_macs([0; 5], 0xff);
        assert_eq!(host[5], 0x7f);
    }

    #[tokio::test]
    async fn test_subnet_conflict_rejected_before_side_effects() {
        let dir = TempDir::new().unwrap();
        let (manager, host, links) = manager(&dir);

        let err = manager
            .add_bridge(bridge_config("net0", "198.19.249.0/25"), 100)
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::Validation(_)));
        assert!(host.calls.lock().is_empty());
        assert!(links.ops.lock().is_empty());
    }

    #[tokio::test]
    async fn test_add_then_remove_is_balanced() {
        let dir = TempDir::new().unwrap();
        let (manager, host, links) = manager(&dir);

        manager
            .add_bridge(bridge_config("net0", "172.20.0.0/16"), 100)
            .await
            .unwrap();
        manager.remove_bridge("net0").await.unwrap();

        assert_eq!(
            *host.calls.lock(),
            vec!["add net0".to_string(), "remove net0".to_string()]
        );
        let ops = links.ops.lock().clone();
        assert_eq!(
            ops,
            vec![
                "create wmv7 on eth2",
                "nft+ wmv7",
                "ns+ wmv7",
                "neigh+ 1",
                "neigh- 1",
                "ns- wmv7",
                "nft- wmv7",
                "delete wmv7",
            ]
        );
    }

    #[tokio::test]
    async fn test_add_failure_rolls_back_host_side() {
        let dir = TempDir::new().unwrap();
        let (manager, host, links) = manager(&dir);
        links.fail_ns_setup.store(true, Ordering::SeqCst);

        let err = manager
            .add_bridge(bridge_config("net0", "172.20.0.0/16"), 100)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("injected ns failure"));

        // host allocation undone, link and nft entries undone
        assert_eq!(
            *host.calls.lock(),
            vec!["add net0".to_string(), "remove net0".to_string()]
        );
        let ops = links.ops.lock().clone();
        assert_eq!(
            ops,
            vec!["create wmv7 on eth2", "nft+ wmv7", "nft- wmv7", "delete wmv7"]
        );
    }

    #[tokio::test]
    async fn test_duplicate_bridge_rejected() {
        let dir = TempDir::new().unwrap();
        let (manager, _host, _links) = manager(&dir);
        manager
            .add_bridge(bridge_config("net0", "172.20.0.0/16"), 100)
            .await
            .unwrap();
        assert!(manager
            .add_bridge(bridge_config("net0", "172.21.0.0/16"), 100)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_state_survives_reload() {
        let dir = TempDir::new().unwrap();
        {
            let (manager, _host, _links) = manager(&dir);
            manager
                .add_bridge(bridge_config("net0", "172.20.0.0/16"), 100)
                .await
                .unwrap();
        }
        let (manager, _host, _links) = manager(&dir);
        assert!(manager.remove_bridge("net0").await.is_ok());
    }
}
