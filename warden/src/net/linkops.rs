//! Link-level plumbing for bridge mirrors.
//!
//! Netlink work in the guest's own namespace goes through one shared
//! rtnetlink connection. Work inside the engine machine's namespace runs on
//! a dedicated thread that setns()es into the target and opens its own
//! netlink socket there; sysctls for that namespace are reached through
//! /proc/<pid>/root so no namespace switch is needed for them.

use std::net::IpAddr;
use std::os::fd::AsFd;
use std::path::PathBuf;

use futures::TryStreamExt;
use netlink_packet_route::link::nlas as link_nlas;
use nix::sched::{setns, CloneFlags};

use warden_shared::{WardenError, WardenResult};

/// macvlan uapi constants; the crate exposes the nla shapes but not these.
const MACVLAN_MODE_SOURCE: u32 = 16;
const MACVLAN_MACADDR_ADD: u32 = 1;
const MACVLAN_MACADDR_DEL: u32 = 2;

/// Everything the in-namespace side of a mirror needs.
#[derive(Debug, Clone)]
pub struct MirrorSpec {
    pub ifname: String,
    /// Host-side MAC admitted by the source filter.
    pub host_mac: [u8; 6],
    /// Engine addresses that get /32 (v4) and /128 (v6) routes plus
    /// proxy-neigh entries on the guest bridge.
    pub addrs: Vec<IpAddr>,
}

#[async_trait::async_trait]
pub trait LinkOps: Send + Sync {
    /// Create the source-filter macvlan on `parent` and move it into the
    /// engine's network namespace.
    async fn create_mirror_link(
        &self,
        name: &str,
        parent: &str,
        mac: [u8; 6],
        netns_pid: u32,
    ) -> WardenResult<()>;

    async fn delete_mirror_link(&self, name: &str, netns_pid: u32) -> WardenResult<()>;

    /// nftables membership that keeps mirror traffic out of the forward path.
    async fn add_host_bridge_port(&self, ifname: &str) -> WardenResult<()>;
    async fn remove_host_bridge_port(&self, ifname: &str) -> WardenResult<()>;

    /// Inside the engine netns: source-filter MAC, proxy-ARP/NDP with zero
    /// delay, link up, host routes.
    async fn setup_mirror_in_ns(&self, netns_pid: u32, spec: &MirrorSpec) -> WardenResult<()>;
    async fn teardown_mirror_in_ns(&self, netns_pid: u32, spec: &MirrorSpec) -> WardenResult<()>;

    /// Proxy-neigh entries on the guest-visible bridge for the return path.
    async fn add_proxy_neigh(&self, addrs: &[IpAddr]) -> WardenResult<()>;
    async fn remove_proxy_neigh(&self, addrs: &[IpAddr]) -> WardenResult<()>;
}

fn nl_err(context: &str, e: impl std::fmt::Display) -> WardenError {
    WardenError::Netlink(format!("{}: {}", context, e))
}

pub struct NetlinkOps {
    handle: rtnetlink::Handle,
    /// Guest bridge carrying machine traffic; proxy neighbors live here.
    guest_bridge: String,
}

impl NetlinkOps {
    pub fn new(guest_bridge: String) -> WardenResult<Self> {
        let (conn, handle, _) =
            rtnetlink::new_connection().map_err(|e| nl_err("rtnetlink connect", e))?;
        tokio::spawn(conn);
        Ok(Self {
            handle,
            guest_bridge,
        })
    }

    async fn link_index(&self, name: &str) -> WardenResult<u32> {
        let link = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute()
            .try_next()
            .await
            .map_err(|e| nl_err("link get", e))?
            .ok_or_else(|| WardenError::Netlink(format!("link {} not found", name)))?;
        Ok(link.header.index)
    }
}

#[async_trait::async_trait]
impl LinkOps for NetlinkOps {
    async fn create_mirror_link(
        &self,
        name: &str,
        parent: &str,
        mac: [u8; 6],
        netns_pid: u32,
    ) -> WardenResult<()> {
        let parent_index = self.link_index(parent).await?;
        let mut request = self
            .handle
            .link()
            .add()
            .macvlan(name.to_string(), parent_index, MACVLAN_MODE_SOURCE);
        request
            .message_mut()
            .nlas
            .push(link_nlas::Nla::Address(mac.to_vec()));
        request
            .message_mut()
            .nlas
            .push(link_nlas::Nla::NetNsPid(netns_pid));
        request.execute().await.map_err(|e| nl_err("macvlan add", e))
    }

    async fn delete_mirror_link(&self, name: &str, netns_pid: u32) -> WardenResult<()> {
        // the link lives in the engine's namespace
        let name = name.to_string();
        in_namespace(netns_pid, move |handle| {
            Box::pin(async move {
                let Some(link) = handle
                    .link()
                    .get()
                    .match_name(name.clone())
                    .execute()
                    .try_next()
                    .await
                    .ok()
                    .flatten()
                else {
                    return Ok(()); // already gone
                };
                handle
                    .link()
                    .del(link.header.index)
                    .execute()
                    .await
                    .map_err(|e| nl_err("macvlan del", e))
            })
        })
        .await
    }

    async fn add_host_bridge_port(&self, ifname: &str) -> WardenResult<()> {
        nft_set_op("add", ifname).await
    }

    async fn remove_host_bridge_port(&self, ifname: &str) -> WardenResult<()> {
        nft_set_op("delete", ifname).await
    }

    async fn setup_mirror_in_ns(&self, netns_pid: u32, spec: &MirrorSpec) -> WardenResult<()> {
        // proxy-ARP/NDP via the machine's own /proc; no namespace switch
        let conf = ns_sysctl_dir(netns_pid, &spec.ifname);
        write_ns_sysctl(&conf.join("proxy_arp"), "1")?;
        write_ns_sysctl(&conf.join("proxy_delay"), "0")?;
        let conf6 = ns_sysctl_dir6(netns_pid, &spec.ifname);
        write_ns_sysctl(&conf6.join("proxy_ndp"), "1")?;

        let spec = spec.clone();
        in_namespace(netns_pid, move |handle| {
            Box::pin(async move {
                let index = {
                    let link = handle
                        .link()
                        .get()
                        .match_name(spec.ifname.clone())
                        .execute()
                        .try_next()
                        .await
                        .map_err(|e| nl_err("link get", e))?
                        .ok_or_else(|| {
                            WardenError::Netlink(format!("mirror {} not in netns", spec.ifname))
                        })?;
                    link.header.index
                };

                // admit the host's frames through the source filter
                let mut request = handle.link().set(index);
                request.message_mut().nlas.push(link_nlas::Nla::Info(vec![
                    link_nlas::Info::Kind(link_nlas::InfoKind::MacVlan),
                    link_nlas::Info::Data(link_nlas::InfoData::MacVlan(vec![
                        link_nlas::InfoMacVlan::MacAddrMode(MACVLAN_MACADDR_ADD),
                        link_nlas::InfoMacVlan::MacAddr(spec.host_mac),
                    ])),
                ]));
                request
                    .execute()
                    .await
                    .map_err(|e| nl_err("source filter add", e))?;

                handle
                    .link()
                    .set(index)
                    .up()
                    .execute()
                    .await
                    .map_err(|e| nl_err("link up", e))?;

                for addr in &spec.addrs {
                    match addr {
                        IpAddr::V4(a) => handle
                            .route()
                            .add()
                            .v4()
                            .destination_prefix(*a, 32)
                            .output_interface(index)
                            .execute()
                            .await
                            .map_err(|e| nl_err("host route v4", e))?,
                        IpAddr::V6(a) => handle
                            .route()
                            .add()
                            .v6()
                            .destination_prefix(*a, 128)
                            .output_interface(index)
                            .execute()
                            .await
                            .map_err(|e| nl_err("host route v6", e))?,
                    }
                }
                Ok(())
            })
        })
        .await
    }

    async fn teardown_mirror_in_ns(&self, netns_pid: u32, spec: &MirrorSpec) -> WardenResult<()> {
        let spec = spec.clone();
        in_namespace(netns_pid, move |handle| {
            Box::pin(async move {
                let Some(link) = handle
                    .link()
                    .get()
                    .match_name(spec.ifname.clone())
                    .execute()
                    .try_next()
                    .await
                    .ok()
                    .flatten()
                else {
                    return Ok(()); // namespace or link already gone
                };
                let index = link.header.index;

                let mut request = handle.link().set(index);
                request.message_mut().nlas.push(link_nlas::Nla::Info(vec![
                    link_nlas::Info::Kind(link_nlas::InfoKind::MacVlan),
                    link_nlas::Info::Data(link_nlas::InfoData::MacVlan(vec![
                        link_nlas::InfoMacVlan::MacAddrMode(MACVLAN_MACADDR_DEL),
                        link_nlas::InfoMacVlan::MacAddr(spec.host_mac),
                    ])),
                ]));
                if let Err(e) = request.execute().await {
                    tracing::debug!(error = %e, "source filter del");
                }
                Ok(())
            })
        })
        .await
    }

    async fn add_proxy_neigh(&self, addrs: &[IpAddr]) -> WardenResult<()> {
        let index = self.link_index(&self.guest_bridge).await?;
        for addr in addrs {
            let mut request = self.handle.neighbours().add(index, *addr);
            request.message_mut().header.flags |= netlink_packet_route::NTF_PROXY;
            request
                .execute()
                .await
                .map_err(|e| nl_err("proxy neigh add", e))?;
        }
        Ok(())
    }

    async fn remove_proxy_neigh(&self, addrs: &[IpAddr]) -> WardenResult<()> {
        let index = self.link_index(&self.guest_bridge).await?;
        let mut neighbours = self
            .handle
            .neighbours()
            .get()
            .execute();
        let mut to_del = Vec::new();
        while let Some(entry) = neighbours
            .try_next()
            .await
            .map_err(|e| nl_err("neigh dump", e))?
        {
            if entry.header.ifindex == index {
                to_del.push(entry);
            }
        }
        let _ = addrs;
        for entry in to_del {
            if let Err(e) = self.handle.neighbours().del(entry).execute().await {
                tracing::debug!(error = %e, "proxy neigh del");
            }
        }
        Ok(())
    }
}

fn ns_sysctl_dir(pid: u32, ifname: &str) -> PathBuf {
    PathBuf::from(format!(
        "/proc/{}/root/proc/sys/net/ipv4/conf/{}",
        pid, ifname
    ))
}

fn ns_sysctl_dir6(pid: u32, ifname: &str) -> PathBuf {
    PathBuf::from(format!(
        "/proc/{}/root/proc/sys/net/ipv6/conf/{}",
        pid, ifname
    ))
}

fn write_ns_sysctl(path: &std::path::Path, value: &str) -> WardenResult<()> {
    std::fs::write(path, value)
        .map_err(|e| WardenError::Netlink(format!("sysctl {}: {}", path.display(), e)))
}

/// Run netlink work inside another process's network namespace.
///
/// setns() sticks to the calling thread, so the work runs on a dedicated
/// thread that is discarded afterwards, never on a pooled one. Sockets
/// opened after setns belong to the target namespace.
async fn in_namespace<F>(netns_pid: u32, work: F) -> WardenResult<()>
where
    F: FnOnce(
            rtnetlink::Handle,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = WardenResult<()>> + Send>,
        > + Send
        + 'static,
{
    tokio::task::spawn_blocking(move || -> WardenResult<()> {
        std::thread::Builder::new()
            .name(format!("netns-{}", netns_pid))
            .spawn(move || -> WardenResult<()> {
                let ns_file = std::fs::File::open(format!("/proc/{}/ns/net", netns_pid))
                    .map_err(|e| {
                        WardenError::Netlink(format!("open netns of {}: {}", netns_pid, e))
                    })?;
                setns(ns_file.as_fd(), CloneFlags::CLONE_NEWNET)
                    .map_err(|e| WardenError::Netlink(format!("setns: {}", e)))?;

                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| WardenError::Netlink(format!("ns runtime: {}", e)))?;
                runtime.block_on(async move {
                    let (conn, handle, _) =
                        rtnetlink::new_connection().map_err(|e| nl_err("ns rtnetlink", e))?;
                    tokio::spawn(conn);
                    work(handle).await
                })
            })
            .map_err(|e| WardenError::Netlink(format!("spawn ns thread: {}", e)))?
            .join()
            .map_err(|_| WardenError::Netlink("ns thread panicked".into()))?
    })
    .await
    .map_err(|e| WardenError::Netlink(format!("ns task: {}", e)))?
}

/// Membership in the "host bridge ports" set that short-circuits forwarding
/// for mirror interfaces. Removal of an absent element is not an error.
async fn nft_set_op(op: &str, ifname: &str) -> WardenResult<()> {
    let output = tokio::process::Command::new("nft")
        .args([
            op,
            "element",
            "inet",
            "warden",
            "host_bridge_ports",
            &format!("{{ {} }}", ifname),
        ])
        .output()
        .await
        .map_err(|e| WardenError::Netlink(format!("nft: {}", e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if op == "delete" && stderr.contains("No such file or directory") {
            return Ok(());
        }
        return Err(WardenError::Netlink(format!(
            "nft {} {}: {}",
            op,
            ifname,
            stderr.trim()
        )));
    }
    Ok(())
}
