//! Engine image layer mounts.
//!
//! Multi-layer images mount as overlayfs. Layer paths come from the engine's
//! storage driver and routinely blow past PATH_MAX once joined, and some are
//! reached through symlinks; passing `/proc/self/fd/<n>` tokens for fds held
//! open with O_PATH sidesteps both. The fds must stay open until mount(2)
//! returns.

use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

use warden_shared::{WardenError, WardenResult};

/// Overlay options string plus the O_PATH fds it references.
pub struct OverlayOptions {
    pub options: String,
    _layer_fds: Vec<OwnedFd>,
}

/// Build overlay mount options for a read-only multi-layer image.
///
/// Layers are ordered top-most first, matching overlayfs lowerdir order.
pub fn overlay_options(layers: &[PathBuf]) -> WardenResult<OverlayOptions> {
    let mut fds = Vec::with_capacity(layers.len());
    let mut tokens = Vec::with_capacity(layers.len());

    for layer in layers {
        let fd = open_path_fd(layer)?;
        tokens.push(format!("/proc/self/fd/{}", fd.as_raw_fd()));
        fds.push(fd);
    }

    Ok(OverlayOptions {
        options: format!(
            "lowerdir={},redirect_dir=nofollow,nfs_export=on",
            tokens.join(":")
        ),
        _layer_fds: fds,
    })
}

fn open_path_fd(path: &Path) -> WardenResult<OwnedFd> {
    let fd = nix::fcntl::open(path, OFlag::O_PATH | OFlag::O_DIRECTORY, Mode::empty())
        .map_err(|e| WardenError::Mount(format!("open layer {}: {}", path.display(), e)))?;
    Ok(fd)
}

/// Image tags contain `/` and `:`; flatten to a single mirror subdir name.
pub fn tag_to_subdir(tag: &str) -> String {
    tag.chars()
        .map(|c| match c {
            '/' | ':' => '_',
            c => c,
        })
        .collect()
}
