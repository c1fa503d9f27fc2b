//! Kernel-NFS mirror tree.
//!
//! Presents every running machine's rootfs (and engine image layers) to the
//! host under the export roots. Each mirror root owns an `rw` backing tree
//! and an `ro` exported tree; the kernel NFS server exports only `ro`, and
//! the manager answers the kernel's authorization and lookup upcalls over
//! rpc_pipefs.

pub mod exports;
pub mod image;
pub mod mirror;
pub mod server;
pub mod upcall;

pub use exports::{ExportTable, NFSEXP_BASE_MASK, NFSEXP_SECINFO_MASK};
pub use mirror::{Mirror, MirrorDir, Mounter, MultiMirror, SysMounter};
