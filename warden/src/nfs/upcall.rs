//! Kernel nfsd upcall servicing.
//!
//! The kernel NFS server delegates client authorization and path<->fsid
//! lookup to userspace over three rpc_pipefs cache channels. Each channel is
//! serviced by a dedicated reader thread: poll for readability, read one
//! request line, write one reply line. Replies use max expiry so the kernel
//! caches them until we flush the cache by removing the export.
//!
//! Paths on the wire are encoded as `\x` followed by lowercase hex of the
//! raw bytes, which sidesteps the cache protocol's whitespace escaping.

use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use warden_shared::{WardenError, WardenResult};

use super::exports::{ExportTable, NFSEXP_SECINFO_MASK};

/// Largest representable expiry; entries live until explicitly flushed.
const MAX_EXPIRY: i64 = i64::MAX;

/// The only fsid type the manager hands out.
const FSID_NUM: u32 = 1;

const RPC_PIPEFS_DIR: &str = "/proc/net/rpc";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    AuthUnixIp,
    Export,
    FileHandle,
}

impl Channel {
    fn cache_name(self) -> &'static str {
        match self {
            Channel::AuthUnixIp => "auth.unix.ip",
            Channel::Export => "nfsd.export",
            Channel::FileHandle => "nfsd.fh",
        }
    }

    fn channel_path(self) -> PathBuf {
        Path::new(RPC_PIPEFS_DIR)
            .join(self.cache_name())
            .join("channel")
    }
}

fn encode_path(path: &Path) -> String {
    format!("\\x{}", hex::encode(path.as_os_str().as_encoded_bytes()))
}

fn decode_token(token: &str) -> WardenResult<Vec<u8>> {
    if let Some(hexpart) = token.strip_prefix("\\x") {
        hex::decode(hexpart).map_err(|e| WardenError::Internal(format!("bad hex token: {}", e)))
    } else {
        Ok(token.as_bytes().to_vec())
    }
}

/// Stateless request handling, one function per channel.
pub struct UpcallHandler {
    exports: Arc<ExportTable>,
    allowed_client: String,
}

impl UpcallHandler {
    pub fn new(exports: Arc<ExportTable>, allowed_client: String) -> Self {
        Self {
            exports,
            allowed_client,
        }
    }

    pub fn handle(&self, channel: Channel, line: &str) -> WardenResult<String> {
        match channel {
            Channel::AuthUnixIp => self.handle_auth(line),
            Channel::Export => self.handle_export(line),
            Channel::FileHandle => self.handle_fh(line),
        }
    }

    /// `nfsd <ip>` -> map the ip to itself as its auth domain, but only for
    /// the single allowed client. Everything else gets a negative entry.
    fn handle_auth(&self, line: &str) -> WardenResult<String> {
        let mut tokens = line.split_whitespace();
        let class = tokens
            .next()
            .ok_or_else(|| WardenError::Internal("empty auth upcall".into()))?;
        let ip = tokens
            .next()
            .ok_or_else(|| WardenError::Internal("auth upcall missing ip".into()))?;

        if ip == self.allowed_client {
            Ok(format!("{} {} {} {}\n", class, ip, MAX_EXPIRY, ip))
        } else {
            tracing::warn!(ip = ip, "rejecting NFS client");
            Ok(format!("{} {} {}\n", class, ip, MAX_EXPIRY))
        }
    }

    /// `<domain> <path>` -> export entry for the path, or a negative entry.
    fn handle_export(&self, line: &str) -> WardenResult<String> {
        let mut tokens = line.split_whitespace();
        let domain = tokens
            .next()
            .ok_or_else(|| WardenError::Internal("empty export upcall".into()))?;
        let path_token = tokens
            .next()
            .ok_or_else(|| WardenError::Internal("export upcall missing path".into()))?;

        let path_bytes = decode_token(path_token)?;
        let path = PathBuf::from(String::from_utf8_lossy(&path_bytes).into_owned());
        let path_hex = encode_path(&path);

        match self.exports.lookup(&path) {
            Some(entry) => Ok(format!(
                "{} {} {} {} {} {} {} secinfo 1 1 {}\n",
                domain,
                path_hex,
                MAX_EXPIRY,
                entry.flags,
                entry.anon_uid,
                entry.anon_gid,
                entry.fsid,
                entry.flags & NFSEXP_SECINFO_MASK,
            )),
            None => Ok(format!("{} {} {}\n", domain, path_hex, MAX_EXPIRY)),
        }
    }

    /// `<domain> <fsidtype> <fsidhex>` -> path owning the fsid, for
    /// filehandle bootstrap. Only FSID_NUM is handled.
    fn handle_fh(&self, line: &str) -> WardenResult<String> {
        let mut tokens = line.split_whitespace();
        let domain = tokens
            .next()
            .ok_or_else(|| WardenError::Internal("empty fh upcall".into()))?;
        let fsid_type: u32 = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| WardenError::Internal("fh upcall missing fsid type".into()))?;
        let fsid_token = tokens
            .next()
            .ok_or_else(|| WardenError::Internal("fh upcall missing fsid".into()))?;

        let negative = format!("{} {} {} {}\n", domain, fsid_type, fsid_token, MAX_EXPIRY);

        if fsid_type != FSID_NUM {
            return Ok(negative);
        }
        let fsid_bytes = decode_token(fsid_token)?;
        if fsid_bytes.len() != 4 {
            return Ok(negative);
        }
        let fsid = u32::from_ne_bytes([fsid_bytes[0], fsid_bytes[1], fsid_bytes[2], fsid_bytes[3]]);

        match self.exports.find_by_fsid(fsid) {
            Some(entry) => Ok(format!(
                "{} {} {} {} {}\n",
                domain,
                fsid_type,
                fsid_token,
                MAX_EXPIRY,
                encode_path(&entry.path),
            )),
            None => Ok(negative),
        }
    }
}

/// The three reader threads plus their stop flag.
pub struct UpcallServer {
    stop: Arc<AtomicBool>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl UpcallServer {
    /// Open all three channels and start servicing them.
    pub fn start(handler: Arc<UpcallHandler>) -> WardenResult<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();

        for channel in [Channel::AuthUnixIp, Channel::Export, Channel::FileHandle] {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(channel.channel_path())
                .map_err(|e| {
                    WardenError::Internal(format!(
                        "open upcall channel {}: {}",
                        channel.channel_path().display(),
                        e
                    ))
                })?;
            let handler = Arc::clone(&handler);
            let stop = Arc::clone(&stop);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("nfs-upcall-{}", channel.cache_name()))
                    .spawn(move || reader_loop(channel, file, handler, stop))
                    .map_err(|e| WardenError::Internal(format!("spawn upcall reader: {}", e)))?,
            );
        }

        Ok(Self { stop, threads })
    }

    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

fn reader_loop(
    channel: Channel,
    mut file: std::fs::File,
    handler: Arc<UpcallHandler>,
    stop: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; 4096];
    while !stop.load(Ordering::SeqCst) {
        let ready = {
            let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(1000u16)) {
                Ok(0) => false,
                Ok(_) => true,
                Err(nix::errno::Errno::EINTR) => false,
                Err(e) => {
                    tracing::error!(channel = channel.cache_name(), error = %e, "upcall poll failed");
                    return;
                }
            }
        };
        if !ready {
            continue;
        }

        // the kernel delivers exactly one request per read
        let n = match file.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => n,
            Err(e) => {
                tracing::error!(channel = channel.cache_name(), error = %e, "upcall read failed");
                return;
            }
        };

        let request = String::from_utf8_lossy(&buf[..n]).into_owned();
        for line in request.lines() {
            if line.is_empty() {
                continue;
            }
            match handler.handle(channel, line) {
                Ok(reply) => {
                    if let Err(e) = file.write_all(reply.as_bytes()) {
                        tracing::error!(channel = channel.cache_name(), error = %e, "upcall write failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(channel = channel.cache_name(), line = line, error = %e, "bad upcall request");
                }
            }
        }
    }
}
