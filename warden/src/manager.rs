//! Composition root.
//!
//! Owns startup order, cross-component wiring, and the two-phase shutdown:
//! `early_stop` closes the acceptors, then machines are stopped in parallel,
//! workers joined, mirrors closed, and `stopped` broadcast last.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use warden_shared::{WardenError, WardenResult};

use crate::agent::{AgentCalls, AgentPool};
use crate::config::{
    GuestConfig, ENGINE_MACHINE_NAME, ENGINE_PROXY_PORT, GUEST_IP4, INTERNAL_RPC_PORT, KRPC_PORT,
};
use crate::devices::DeviceMonitor;
use crate::drm::DrmMonitor;
use crate::hostsvc::{HostServiceClient, HostServices};
use crate::machine::{CliLxcFactory, CreateSpec, FreezerHold, MachineManager};
use crate::net::{NetlinkOps, NetworkManager};
use crate::nfs::upcall::{UpcallHandler, UpcallServer};
use crate::nfs::{ExportTable, Mirror, MirrorDir, MultiMirror, SysMounter};
use crate::proxy::{EngineEndpoint, EngineProxy, PassthroughFilter, ProxyStream};
use crate::rpc::{GuestSurface, HostSurface, InternalSurface, RpcServer};
use crate::seccomp::SeccompProfiles;
use crate::store::{Database, MachineStore};
use crate::wormhole::Wormhole;

/// Grace between `poweroff` and `poweroff -f`.
const POWEROFF_DEADLINE: Duration = Duration::from_secs(120);

/// Bridge the guest's machine traffic rides on; proxy neighbors live here.
const GUEST_BRIDGE_IFNAME: &str = "mbr0";

/// Host share used as the wormhole lower layer.
const HOST_SHARE_DIR: &str = "/mnt/host-share";

pub struct Manager {
    cfg: GuestConfig,
    pub machines: Arc<MachineManager>,
    pub network: Arc<NetworkManager>,
    pub wormhole: Arc<Wormhole>,
    rootfs_mirror: Arc<dyn Mirror>,
    images_mirror: Arc<dyn Mirror>,
    upcalls: Mutex<Option<UpcallServer>>,
    devices: Mutex<Option<DeviceMonitor>>,
    // the kernel serves NFS on this fd; dropping it stops the server
    _nfs_listener: std::net::TcpListener,
    early_stop_tx: watch::Sender<bool>,
    stop_tx: watch::Sender<bool>,
}

impl Manager {
    /// Bring the whole control plane up. Fatal errors abort startup.
    pub async fn start(cfg: GuestConfig) -> WardenResult<Arc<Self>> {
        let (early_stop_tx, early_stop) = watch::channel(false);
        let (stop_tx, _) = watch::channel(false);

        std::fs::create_dir_all(&cfg.data_dir)?;
        std::fs::create_dir_all(&cfg.run_dir)?;

        // host identity first: it drives NFS squashing and socket ownership
        let host: Arc<dyn HostServices> = Arc::new(HostServiceClient::new());
        let user = host.get_user().await?;
        tracing::info!(user = %user.name, uid = user.uid, "host identity resolved");

        // mirror trees and the kernel NFS server
        let exports = Arc::new(ExportTable::new(user.uid, user.gid));
        let root_mirror = Arc::new(MirrorDir::new(
            cfg.nfs_root_dir.clone(),
            Box::new(SysMounter),
            Arc::clone(&exports),
        )?);
        let forward_mirror = Arc::new(MirrorDir::new(
            cfg.nfs_machines_dir.clone(),
            Box::new(SysMounter),
            Arc::clone(&exports),
        )?);
        let rootfs_mirror: Arc<dyn Mirror> = Arc::new(MultiMirror::new(vec![
            root_mirror as Arc<dyn Mirror>,
            forward_mirror as Arc<dyn Mirror>,
        ]));
        let images_mirror: Arc<dyn Mirror> = Arc::new(MirrorDir::new(
            cfg.nfs_images_dir.clone(),
            Box::new(SysMounter),
            Arc::clone(&exports),
        )?);

        let nfs_listener = crate::nfs::server::start_kernel_nfsd(
            &cfg.nfs_root_dir.join("ro"),
            &cfg.allowed_nfs_client,
            user.uid,
            user.gid,
        )?;
        let upcalls = UpcallServer::start(Arc::new(UpcallHandler::new(
            Arc::clone(&exports),
            cfg.allowed_nfs_client.clone(),
        )))?;

        // machines
        let seccomp = Arc::new(SeccompProfiles::stage()?);
        let agents: Arc<dyn AgentCalls> = Arc::new(AgentPool::new());
        let wardend_path = std::env::current_exe()?;
        let store = MachineStore::new(Database::open(&cfg.store_path())?);
        let machines = Arc::new(MachineManager::new(
            cfg.clone(),
            store,
            Arc::clone(&rootfs_mirror),
            Arc::clone(&agents),
            Arc::new(CliLxcFactory::new(cfg.clone(), wardend_path)),
            seccomp,
            user.uid,
            user.gid,
        ));

        let autostart = machines.restore()?;
        ensure_builtin_machines(&machines)?;
        for id in autostart {
            let machines = Arc::clone(&machines);
            tokio::spawn(async move {
                if let Err(e) = machines.start(&id).await {
                    tracing::warn!(machine_id = %id, error = %e, "autostart failed");
                }
            });
        }

        // bridge orchestration
        let links = Arc::new(NetlinkOps::new(GUEST_BRIDGE_IFNAME.to_string())?);
        let network = Arc::new(NetworkManager::new(&cfg, Arc::clone(&host), links)?);

        // engine proxy on TCP and unix
        let endpoint: Arc<dyn EngineEndpoint> = Arc::new(EngineMachineEndpoint {
            machines: Arc::clone(&machines),
            agents: Arc::clone(&agents),
        });
        let proxy = Arc::new(EngineProxy::new(endpoint, Arc::new(PassthroughFilter)));

        let proxy_tcp = tokio::net::TcpListener::bind((GUEST_IP4, ENGINE_PROXY_PORT))
            .await
            .map_err(|e| WardenError::Internal(format!("bind engine proxy: {}", e)))?;
        tokio::spawn(Arc::clone(&proxy).serve_tcp(proxy_tcp, early_stop.clone()));

        let proxy_socket = cfg.engine_proxy_socket();
        let _ = std::fs::remove_file(&proxy_socket);
        let proxy_unix = tokio::net::UnixListener::bind(&proxy_socket)
            .map_err(|e| WardenError::Internal(format!("bind engine proxy socket: {}", e)))?;
        std::fs::set_permissions(&proxy_socket, std::fs::Permissions::from_mode(0o660))?;
        tokio::spawn(Arc::clone(&proxy).serve_unix(proxy_unix, early_stop.clone()));

        // wormhole + shutdown-on-idle plumbing
        let wormhole = Arc::new(Wormhole::new(
            &cfg,
            Arc::new(SysMounter),
            PathBuf::from(HOST_SHARE_DIR),
        ));
        let (poweroff_tx, poweroff_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(poweroff_waiter(poweroff_rx));

        // RPC surfaces
        let host_surface = RpcServer::new(Arc::new(HostSurface::new(
            Arc::clone(&machines),
            Arc::clone(&network),
            Arc::clone(&images_mirror),
        )));
        let krpc = tokio::net::TcpListener::bind((GUEST_IP4, KRPC_PORT))
            .await
            .map_err(|e| WardenError::Internal(format!("bind krpc: {}", e)))?;
        tokio::spawn(host_surface.serve_tcp(krpc, early_stop.clone()));

        let guest_surface = RpcServer::new(Arc::new(GuestSurface::new(
            Arc::clone(&wormhole),
            poweroff_tx,
        )));
        let guest_socket = cfg.guest_rpc_socket();
        let _ = std::fs::remove_file(&guest_socket);
        let guest_unix = tokio::net::UnixListener::bind(&guest_socket)
            .map_err(|e| WardenError::Internal(format!("bind guest rpc socket: {}", e)))?;
        tokio::spawn(guest_surface.serve_unix(guest_unix, early_stop.clone()));

        let internal_surface = RpcServer::new(Arc::new(InternalSurface::new(Arc::clone(&machines))));
        let internal = tokio::net::TcpListener::bind(("127.0.0.1", INTERNAL_RPC_PORT))
            .await
            .map_err(|e| WardenError::Internal(format!("bind internal rpc: {}", e)))?;
        tokio::spawn(internal_surface.serve_tcp(internal, early_stop.clone()));

        // watchers
        let devices = DeviceMonitor::start(Arc::clone(&machines), Arc::clone(&agents))?;
        let drm = Arc::new(DrmMonitor::new(
            Arc::clone(&host),
            Box::new(|| tracing::error!("identity invalid; continuing degraded")),
        ));
        tokio::spawn(drm.run(early_stop.clone()));

        tracing::info!("manager started");
        Ok(Arc::new(Self {
            cfg,
            machines,
            network,
            wormhole,
            rootfs_mirror,
            images_mirror,
            upcalls: Mutex::new(Some(upcalls)),
            devices: Mutex::new(Some(devices)),
            _nfs_listener: nfs_listener,
            early_stop_tx,
            stop_tx,
        }))
    }

    pub fn config(&self) -> &GuestConfig {
        &self.cfg
    }

    pub fn subscribe_stopped(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Ordered shutdown: acceptors, machines, workers, mirrors.
    pub async fn shutdown(&self) {
        tracing::info!("manager stopping");
        self.machines.set_stopping();
        let _ = self.early_stop_tx.send(true);

        if let Err(e) = self.machines.stop_all().await {
            tracing::warn!(error = %e, "stop_all reported errors");
        }

        if let Some(devices) = self.devices.lock().take() {
            devices.shutdown();
        }
        if let Some(upcalls) = self.upcalls.lock().take() {
            upcalls.shutdown();
        }
        if let Err(e) = self.rootfs_mirror.close() {
            tracing::warn!(error = %e, "rootfs mirror close failed");
        }
        if let Err(e) = self.images_mirror.close() {
            tracing::warn!(error = %e, "image mirror close failed");
        }

        let _ = self.stop_tx.send(true);
        tracing::info!("manager stopped");
    }
}

/// The engine machine and the k8s machine exist from first boot and are not
/// user-manageable.
fn ensure_builtin_machines(machines: &MachineManager) -> WardenResult<()> {
    for (name, user) in [
        (crate::config::ENGINE_MACHINE_NAME, "root"),
        (crate::config::K8S_MACHINE_NAME, "root"),
    ] {
        if machines.get(name).is_ok() {
            continue;
        }
        machines.create(CreateSpec {
            name: name.to_string(),
            builtin: true,
            default_user: user.to_string(),
            config_overrides: vec![
                ("lxc.apparmor.profile".into(), "unconfined".into()),
                ("lxc.mount.auto".into(), "proc:rw sys:rw cgroup:rw".into()),
            ],
            ..Default::default()
        })?;
    }
    Ok(())
}

/// The engine machine as the proxy's upstream.
struct EngineMachineEndpoint {
    machines: Arc<MachineManager>,
    agents: Arc<dyn AgentCalls>,
}

#[async_trait::async_trait]
impl EngineEndpoint for EngineMachineEndpoint {
    async fn ensure_started(&self) -> WardenResult<()> {
        let engine = self.machines.get(ENGINE_MACHINE_NAME)?;
        if engine.is_running() {
            return Ok(());
        }

        // the pending start itself pins the freezer
        let _hold = FreezerHold::acquire(Arc::clone(&engine.freezer));
        match self.machines.start(ENGINE_MACHINE_NAME).await {
            Ok(()) => {}
            // lost the race to another connection; that start waits for
            // readiness on our behalf
            Err(WardenError::InvalidState(_)) if engine.is_running() => {}
            Err(e) => return Err(e),
        }
        self.agents.wait_engine_start(&engine.id).await
    }

    async fn dial(&self) -> WardenResult<Box<dyn ProxyStream>> {
        let engine = self.machines.get(ENGINE_MACHINE_NAME)?;
        let stream = self.agents.dial_engine_socket(&engine.id).await?;
        Ok(Box::new(stream))
    }

    fn request_hold(&self) -> Option<FreezerHold> {
        self.machines
            .get(ENGINE_MACHINE_NAME)
            .ok()
            .map(|engine| FreezerHold::acquire(Arc::clone(&engine.freezer)))
    }
}

/// Runs once a poweroff request is granted: polite first, forced after the
/// deadline.
async fn poweroff_waiter(mut rx: tokio::sync::mpsc::UnboundedReceiver<()>) {
    if rx.recv().await.is_none() {
        return;
    }
    tracing::info!("pending VM shutdown granted, powering off");
    match tokio::process::Command::new("poweroff").status().await {
        Ok(status) if status.success() => {}
        other => tracing::warn!(result = ?other, "poweroff did not run cleanly"),
    }
    tokio::time::sleep(POWEROFF_DEADLINE).await;
    tracing::warn!("poweroff deadline passed, forcing");
    let _ = tokio::process::Command::new("poweroff")
        .arg("-f")
        .status()
        .await;
}
