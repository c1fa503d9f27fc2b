//! Host file-sharing sessions.
//!
//! Host sessions share a single overlay mount, bind-mounted into the
//! forward-facing mirror tree so machines see it too. The first session
//! mounts, the last one out unmounts. The session mutex covers the whole of
//! every operation, including nuke, so a racing session start either
//! completes before the nuke begins or observes the cleared tree.

use std::path::PathBuf;

use parking_lot::Mutex;

use warden_shared::{WardenError, WardenResult};

use crate::config::GuestConfig;
use crate::nfs::Mounter;
use crate::util::Rollback;

struct WormholeState {
    sessions: u64,
    mounted: bool,
}

pub struct Wormhole {
    state: Mutex<WormholeState>,
    mounter: std::sync::Arc<dyn Mounter>,
    /// Lower layer: the host-provided share.
    share_dir: PathBuf,
    data_dir: PathBuf,
    mount_point: PathBuf,
    /// Machine-visible bind of the overlay.
    bind_target: PathBuf,
}

impl Wormhole {
    pub fn new(cfg: &GuestConfig, mounter: std::sync::Arc<dyn Mounter>, share_dir: PathBuf) -> Self {
        Self {
            state: Mutex::new(WormholeState {
                sessions: 0,
                mounted: false,
            }),
            mounter,
            share_dir,
            data_dir: cfg.data_dir.join("wormhole"),
            mount_point: cfg.run_dir.join("wormhole"),
            bind_target: cfg.nfs_machines_dir.join("rw").join("host"),
        }
    }

    pub fn session_count(&self) -> u64 {
        self.state.lock().sessions
    }

    pub fn is_mounted(&self) -> bool {
        self.state.lock().mounted
    }

    /// First session mounts the overlay and its machine-visible bind.
    pub fn on_session_start(&self) -> WardenResult<()> {
        let mut state = self.state.lock();
        state.sessions += 1;
        if state.mounted {
            return Ok(());
        }

        let mut rollback = Rollback::new();
        let result = (|| -> WardenResult<()> {
            let upper = self.data_dir.join("upper");
            let work = self.data_dir.join("work");
            std::fs::create_dir_all(&upper)?;
            std::fs::create_dir_all(&work)?;
            std::fs::create_dir_all(&self.mount_point)?;

            let options = format!(
                "lowerdir={},upperdir={},workdir={}",
                self.share_dir.display(),
                upper.display(),
                work.display()
            );
            self.mounter.overlay_mount(&self.mount_point, &options)?;
            {
                let mounter = std::sync::Arc::clone(&self.mounter);
                let mount_point = self.mount_point.clone();
                rollback.push("overlay", move || mounter.unmount(&mount_point));
            }

            std::fs::create_dir_all(&self.bind_target)?;
            self.mounter.bind_mount(&self.mount_point, &self.bind_target)?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                rollback.disarm();
                state.mounted = true;
                tracing::debug!(sessions = state.sessions, "wormhole mounted");
                Ok(())
            }
            Err(e) => {
                rollback.run();
                state.sessions -= 1;
                Err(e)
            }
        }
    }

    /// Last session unmounts the bind, then the overlay.
    pub fn on_session_end(&self) -> WardenResult<()> {
        let mut state = self.state.lock();
        if state.sessions == 0 {
            return Err(WardenError::InvalidState(
                "session end without matching start".into(),
            ));
        }
        state.sessions -= 1;
        if state.sessions == 0 && state.mounted {
            self.mounter.unmount(&self.bind_target)?;
            self.mounter.unmount(&self.mount_point)?;
            state.mounted = false;
            tracing::debug!("wormhole unmounted");
        }
        Ok(())
    }

    /// Wipe the persistent upper layer. Holds the session lock for the whole
    /// operation and refuses while mounted or while any session is open.
    pub fn nuke_data(&self) -> WardenResult<()> {
        let state = self.state.lock();
        if state.mounted || state.sessions > 0 {
            return Err(WardenError::InvalidState(
                "wormhole is in use; disconnect sessions first".into(),
            ));
        }
        match std::fs::remove_dir_all(&self.data_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!("wormhole data cleared");
        Ok(())
    }
}
