//! Export table and fsid allocation.
//!
//! One record per active export path. The kernel identifies NFSv4 exports by
//! a 32-bit fsid; ids are unique while an export is live and go back on a
//! free list when it is removed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use warden_shared::{WardenError, WardenResult};

// Kernel NFSEXP_* flag bits as understood by the nfsd.export cache.
pub const NFSEXP_READONLY: u32 = 0x0001;
pub const NFSEXP_INSECURE_PORT: u32 = 0x0002;
pub const NFSEXP_ROOTSQUASH: u32 = 0x0004;
pub const NFSEXP_ALLSQUASH: u32 = 0x0008;
pub const NFSEXP_ASYNC: u32 = 0x0010;
pub const NFSEXP_GATHERED_WRITES: u32 = 0x0020;
pub const NFSEXP_NOSUBTREECHECK: u32 = 0x0400;
pub const NFSEXP_FSID: u32 = 0x2000;
pub const NFSEXP_CROSSMOUNT: u32 = 0x4000;
/// Quick-fid filehandles; understood by the guest kernel's nfsd.
pub const NFSEXP_QFID: u32 = 0x80000;

/// Flags stamped on every mirror export.
pub const NFSEXP_BASE_MASK: u32 = NFSEXP_INSECURE_PORT
    | NFSEXP_ROOTSQUASH
    | NFSEXP_ALLSQUASH
    | NFSEXP_ASYNC
    | NFSEXP_GATHERED_WRITES
    | NFSEXP_NOSUBTREECHECK
    | NFSEXP_FSID
    | NFSEXP_CROSSMOUNT
    | NFSEXP_QFID;

/// Subset the secinfo line is allowed to carry.
pub const NFSEXP_SECINFO_MASK: u32 =
    NFSEXP_READONLY | NFSEXP_ROOTSQUASH | NFSEXP_ALLSQUASH | NFSEXP_INSECURE_PORT;

#[derive(Debug, Clone)]
pub struct ExportEntry {
    pub path: PathBuf,
    pub flags: u32,
    pub anon_uid: u32,
    pub anon_gid: u32,
    pub fsid: u32,
}

struct TableInner {
    entries: HashMap<PathBuf, ExportEntry>,
    next_fsid: u32,
    free_fsids: Vec<u32>,
}

/// Mutex-guarded map of active exports, shared between the mirrors (which
/// mutate it) and the upcall readers (which scan it).
pub struct ExportTable {
    inner: Mutex<TableInner>,
    anon_uid: u32,
    anon_gid: u32,
}

impl ExportTable {
    /// `anon_uid`/`anon_gid` are the host user's ids; all squashed access
    /// maps to them.
    pub fn new(anon_uid: u32, anon_gid: u32) -> Self {
        Self {
            inner: Mutex::new(TableInner {
                entries: HashMap::new(),
                // fsid 0 is the export root pinned in /etc/exports
                next_fsid: 1,
                free_fsids: Vec::new(),
            }),
            anon_uid,
            anon_gid,
        }
    }

    /// Register an export and allocate its fsid.
    pub fn add(&self, path: &Path, extra_flags: u32) -> WardenResult<u32> {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(path) {
            return Err(WardenError::Internal(format!(
                "export already registered: {}",
                path.display()
            )));
        }
        let fsid = match inner.free_fsids.pop() {
            Some(id) => id,
            None => {
                let id = inner.next_fsid;
                inner.next_fsid += 1;
                id
            }
        };
        inner.entries.insert(
            path.to_path_buf(),
            ExportEntry {
                path: path.to_path_buf(),
                flags: NFSEXP_BASE_MASK | extra_flags,
                anon_uid: self.anon_uid,
                anon_gid: self.anon_gid,
                fsid,
            },
        );
        Ok(fsid)
    }

    /// Unregister an export; its fsid becomes reusable.
    pub fn remove(&self, path: &Path) -> WardenResult<()> {
        let mut inner = self.inner.lock();
        match inner.entries.remove(path) {
            Some(entry) => {
                inner.free_fsids.push(entry.fsid);
                Ok(())
            }
            None => Err(WardenError::Internal(format!(
                "export not registered: {}",
                path.display()
            ))),
        }
    }

    pub fn lookup(&self, path: &Path) -> Option<ExportEntry> {
        self.inner.lock().entries.get(path).cloned()
    }

    /// Linear scan for the filehandle bootstrap upcall.
    pub fn find_by_fsid(&self, fsid: u32) -> Option<ExportEntry> {
        self.inner
            .lock()
            .entries
            .values()
            .find(|e| e.fsid == fsid)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

/// Render `/etc/exports`, pinning the single allowed client on the export
/// root with fsid 0.
pub fn render_etc_exports(export_root: &Path, client_ip: &str, anon_uid: u32, anon_gid: u32) -> String {
    format!(
        "{root} {ip}(ro,insecure,root_squash,all_squash,async,wdelay,no_subtree_check,crossmnt,qfid,fsid=0,anonuid={uid},anongid={gid})\n",
        root = export_root.display(),
        ip = client_ip,
        uid = anon_uid,
        gid = anon_gid,
    )
}
