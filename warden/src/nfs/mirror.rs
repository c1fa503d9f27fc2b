//! Mirror trees.
//!
//! A mirror root `R` owns two parallel trees: `R/rw/<sub>` backing
//! directories and `R/ro/<sub>` exported mount points. Mounting is
//! mkdir-then-remount-fresh so a stale mount from a previous run never
//! survives. Mount syscalls go through the `Mounter` seam so the tree logic
//! is testable without privileges.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use parking_lot::Mutex;

use warden_shared::{WardenError, WardenResult};

use super::exports::{ExportTable, NFSEXP_READONLY};
use super::image;

/// Mount capability set every mirror root implements.
pub trait Mirror: Send + Sync {
    /// Bind-mount `source` at `ro/<sub>`, registering the export.
    fn mount(&self, sub: &str, source: &Path) -> WardenResult<()>;

    /// Like `mount`, but the backing dir is owned by `uid:gid`.
    fn mount_bind(&self, sub: &str, source: &Path, uid: u32, gid: u32) -> WardenResult<()>;

    /// Unmount `ro/<sub>` and drop its export. Tolerates "not mounted".
    fn unmount(&self, sub: &str) -> WardenResult<()>;

    /// Mount an engine image: plain bind for one layer, overlay otherwise.
    fn mount_image(&self, tag: &str, layers: &[PathBuf]) -> WardenResult<()>;

    /// Unmount everything this mirror still has active.
    fn close(&self) -> WardenResult<()>;
}

/// Syscall seam for the mirror tree.
pub trait Mounter: Send + Sync {
    fn bind_mount(&self, source: &Path, target: &Path) -> WardenResult<()>;
    fn overlay_mount(&self, target: &Path, options: &str) -> WardenResult<()>;
    /// Must succeed when the target is simply not mounted.
    fn unmount(&self, target: &Path) -> WardenResult<()>;
}

/// Real mount(2)/umount2(2) implementation.
pub struct SysMounter;

impl Mounter for SysMounter {
    fn bind_mount(&self, source: &Path, target: &Path) -> WardenResult<()> {
        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| {
            WardenError::Mount(format!(
                "bind {} -> {}: {}",
                source.display(),
                target.display(),
                e
            ))
        })
    }

    fn overlay_mount(&self, target: &Path, options: &str) -> WardenResult<()> {
        mount(
            Some("overlay"),
            target,
            Some("overlay"),
            MsFlags::MS_NOATIME,
            Some(options),
        )
        .map_err(|e| WardenError::Mount(format!("overlay {}: {}", target.display(), e)))
    }

    fn unmount(&self, target: &Path) -> WardenResult<()> {
        match umount2(target, MntFlags::MNT_DETACH) {
            Ok(()) => Ok(()),
            // not mounted / doesn't exist is the desired end state
            Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => Ok(()),
            Err(e) => Err(WardenError::Mount(format!(
                "unmount {}: {}",
                target.display(),
                e
            ))),
        }
    }
}

/// What a mirror holds at one subpath; image mounts keep their layer list so
/// `close` can report them distinctly.
enum ActiveMount {
    Bind,
    Image,
}

/// One mirror root with its rw/ro twin trees.
pub struct MirrorDir {
    root: PathBuf,
    mounter: Box<dyn Mounter>,
    exports: std::sync::Arc<ExportTable>,
    active: Mutex<HashMap<String, ActiveMount>>,
}

impl MirrorDir {
    pub fn new(
        root: PathBuf,
        mounter: Box<dyn Mounter>,
        exports: std::sync::Arc<ExportTable>,
    ) -> WardenResult<Self> {
        std::fs::create_dir_all(root.join("rw"))?;
        std::fs::create_dir_all(root.join("ro"))?;
        Ok(Self {
            root,
            mounter,
            exports,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn rw_path(&self, sub: &str) -> PathBuf {
        self.root.join("rw").join(sub)
    }

    pub fn ro_path(&self, sub: &str) -> PathBuf {
        self.root.join("ro").join(sub)
    }

    fn validate_sub(sub: &str) -> WardenResult<()> {
        if sub.is_empty() || sub.contains('/') || sub == "." || sub == ".." {
            return Err(WardenError::Validation(format!(
                "bad mirror subpath: {:?}",
                sub
            )));
        }
        Ok(())
    }

    fn mount_inner(
        &self,
        sub: &str,
        source: &Path,
        owner: Option<(u32, u32)>,
    ) -> WardenResult<()> {
        Self::validate_sub(sub)?;
        let mut active = self.active.lock();

        let rw = self.rw_path(sub);
        let ro = self.ro_path(sub);

        // backing dir, idempotent
        std::fs::create_dir_all(&rw)?;
        if let Some((uid, gid)) = owner {
            nix::unistd::chown(
                &rw,
                Some(nix::unistd::Uid::from_raw(uid)),
                Some(nix::unistd::Gid::from_raw(gid)),
            )
            .map_err(|e| WardenError::Mount(format!("chown {}: {}", rw.display(), e)))?;
        }

        // remount fresh over whatever a previous run left behind
        self.mounter.unmount(&ro)?;
        if active.remove(sub).is_some() {
            let _ = self.exports.remove(&ro);
        }

        self.mounter.bind_mount(source, &ro)?;
        if let Err(e) = self.exports.add(&ro, 0) {
            let _ = self.mounter.unmount(&ro);
            return Err(e);
        }
        active.insert(sub.to_string(), ActiveMount::Bind);

        tracing::debug!(sub = sub, source = %source.display(), "mirror mount added");
        Ok(())
    }
}

impl Mirror for MirrorDir {
    fn mount(&self, sub: &str, source: &Path) -> WardenResult<()> {
        self.mount_inner(sub, source, None)
    }

    fn mount_bind(&self, sub: &str, source: &Path, uid: u32, gid: u32) -> WardenResult<()> {
        self.mount_inner(sub, source, Some((uid, gid)))
    }

    fn unmount(&self, sub: &str) -> WardenResult<()> {
        Self::validate_sub(sub)?;
        let mut active = self.active.lock();

        let ro = self.ro_path(sub);
        self.mounter.unmount(&ro)?;
        if active.remove(sub).is_some() {
            let _ = self.exports.remove(&ro);
        }
        // leave the rw backing dir; recreation is idempotent

        tracing::debug!(sub = sub, "mirror mount removed");
        Ok(())
    }

    fn mount_image(&self, tag: &str, layers: &[PathBuf]) -> WardenResult<()> {
        let sub = image::tag_to_subdir(tag);
        Self::validate_sub(&sub)?;
        if layers.is_empty() {
            return Err(WardenError::Validation(format!(
                "image {} has no layers",
                tag
            )));
        }

        let mut active = self.active.lock();
        let rw = self.rw_path(&sub);
        let ro = self.ro_path(&sub);
        std::fs::create_dir_all(&rw)?;

        self.mounter.unmount(&ro)?;
        if active.remove(&sub).is_some() {
            let _ = self.exports.remove(&ro);
        }

        if layers.len() == 1 {
            // single lowerdir: a bind is enough
            self.mounter.bind_mount(&layers[0], &ro)?;
        } else {
            let options = image::overlay_options(layers)?;
            self.mounter.overlay_mount(&ro, &options.options)?;
        }

        if let Err(e) = self.exports.add(&ro, NFSEXP_READONLY) {
            let _ = self.mounter.unmount(&ro);
            return Err(e);
        }
        active.insert(sub.clone(), ActiveMount::Image);

        tracing::debug!(tag = tag, layers = layers.len(), "image mount added");
        Ok(())
    }

    fn close(&self) -> WardenResult<()> {
        let mut active = self.active.lock();
        let mut errors = Vec::new();
        for (sub, _) in active.drain() {
            let ro = self.ro_path(&sub);
            if let Err(e) = self.mounter.unmount(&ro) {
                errors.push(e);
            }
            let _ = self.exports.remove(&ro);
        }
        warden_shared::errors::join_errors(errors)
    }
}

/// Fan-out over several mirror roots; errors from all of them are joined.
pub struct MultiMirror {
    mirrors: Vec<std::sync::Arc<dyn Mirror>>,
}

impl MultiMirror {
    pub fn new(mirrors: Vec<std::sync::Arc<dyn Mirror>>) -> Self {
        Self { mirrors }
    }

    fn fan_out<F>(&self, op: F) -> WardenResult<()>
    where
        F: Fn(&dyn Mirror) -> WardenResult<()>,
    {
        let errors: Vec<_> = self
            .mirrors
            .iter()
            .filter_map(|m| op(m.as_ref()).err())
            .collect();
        warden_shared::errors::join_errors(errors)
    }
}

impl Mirror for MultiMirror {
    fn mount(&self, sub: &str, source: &Path) -> WardenResult<()> {
        self.fan_out(|m| m.mount(sub, source))
    }

    fn mount_bind(&self, sub: &str, source: &Path, uid: u32, gid: u32) -> WardenResult<()> {
        self.fan_out(|m| m.mount_bind(sub, source, uid, gid))
    }

    fn unmount(&self, sub: &str) -> WardenResult<()> {
        self.fan_out(|m| m.unmount(sub))
    }

    fn mount_image(&self, tag: &str, layers: &[PathBuf]) -> WardenResult<()> {
        self.fan_out(|m| m.mount_image(tag, layers))
    }

    fn close(&self) -> WardenResult<()> {
        self.fan_out(|m| m.close())
    }
}
