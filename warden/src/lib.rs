//! Guest-side control plane for LXC machines and the container engine.
//!
//! One long-lived process inside the VM owns machine lifecycle and
//! persistence, mirrors rootfses to the host over kernel NFS, proxies the
//! container engine's HTTP socket, and wires engine bridges into the guest's
//! routing namespace.

pub mod agent;
pub mod config;
pub mod devices;
pub mod drm;
pub mod hostsvc;
pub mod machine;
pub mod manager;
pub mod net;
pub mod nfs;
pub mod proxy;
pub mod rpc;
pub mod seccomp;
pub mod store;
pub mod util;
pub mod wormhole;

pub use config::GuestConfig;
pub use manager::Manager;

use tracing_subscriber::EnvFilter;
use warden_shared::WardenResult;

/// Initialize tracing with env-filtered stderr output plus a file log under
/// the data volume. The returned guard must live for the process lifetime.
pub fn init_logging(
    cfg: &GuestConfig,
) -> WardenResult<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(cfg.logs_dir())?;
    let appender = tracing_appender::rolling::never(cfg.logs_dir(), "wardend.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Ok(guard)
}
