//! Kernel NFS server bring-up.

use std::io::Write;
use std::net::TcpListener;
use std::os::fd::AsRawFd;
use std::path::Path;

use warden_shared::{WardenError, WardenResult};

use crate::config::{GUEST_IP4, NFS_PORT};

use super::exports::render_etc_exports;

/// Serve the v4 family only; v2/v3 need rpcbind and lockd we don't run.
const NFS_VERSION_MASK: &str = "-2 -3 +4 +4.1 +4.2";

const NFSD_THREADS: u32 = 8;

const NFSD_PROC: &str = "/proc/fs/nfsd";

/// Configure and start the kernel NFS server.
///
/// The returned listener must stay alive for as long as the server runs; the
/// kernel serves on the fd we hand to `portlist`.
pub fn start_kernel_nfsd(export_root: &Path, client_ip: &str, anon_uid: u32, anon_gid: u32) -> WardenResult<TcpListener> {
    let nfsd = Path::new(NFSD_PROC);

    std::fs::write(nfsd.join("versions"), NFS_VERSION_MASK)
        .map_err(|e| WardenError::Internal(format!("set nfsd versions: {}", e)))?;

    std::fs::write(
        "/etc/exports",
        render_etc_exports(export_root, client_ip, anon_uid, anon_gid),
    )
    .map_err(|e| WardenError::Internal(format!("write /etc/exports: {}", e)))?;

    let listener = TcpListener::bind((GUEST_IP4, NFS_PORT))
        .map_err(|e| WardenError::Internal(format!("bind nfs listener: {}", e)))?;

    let mut portlist = std::fs::OpenOptions::new()
        .write(true)
        .open(nfsd.join("portlist"))
        .map_err(|e| WardenError::Internal(format!("open nfsd portlist: {}", e)))?;
    writeln!(portlist, "{}", listener.as_raw_fd())
        .map_err(|e| WardenError::Internal(format!("register nfs listener: {}", e)))?;

    // starts the server
    std::fs::write(nfsd.join("threads"), NFSD_THREADS.to_string())
        .map_err(|e| WardenError::Internal(format!("start nfsd threads: {}", e)))?;

    tracing::info!(port = NFS_PORT, threads = NFSD_THREADS, "kernel nfsd started");
    Ok(listener)
}
