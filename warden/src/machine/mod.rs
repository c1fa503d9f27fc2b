//! Machine model and lifecycle.

pub mod freezer;
pub mod lxc;
mod manager;
mod presence;
mod registry;

pub use freezer::{Freezer, FreezerHold};
pub use lxc::{CliLxcFactory, LxcFactory, LxcHandle};
pub use manager::{CreateSpec, MachineManager};
pub use presence::Presence;
pub use registry::Registry;

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use warden_shared::wire::{MachineInfo, MachineStatus};

use crate::store::MachineRecord;

/// One machine: stable id, freezer refcount, and the mutex-guarded mutable
/// state. Lock order is registry before machine, machine before mirror.
pub struct Machine {
    pub id: String,
    pub freezer: Arc<Freezer>,
    state: Mutex<MachineState>,
}

pub struct MachineState {
    pub record: MachineRecord,
    pub status: MachineStatus,
    pub init_pid: Option<u32>,
    pub lxc: Box<dyn LxcHandle>,
}

impl Machine {
    pub fn new(record: MachineRecord, status: MachineStatus, lxc: Box<dyn LxcHandle>) -> Arc<Self> {
        Arc::new(Self {
            id: record.id.clone(),
            freezer: Arc::new(Freezer::new()),
            state: Mutex::new(MachineState {
                record,
                status,
                init_pid: None,
                lxc,
            }),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, MachineState> {
        self.state.lock()
    }

    pub fn name(&self) -> String {
        self.lock().record.name.clone()
    }

    pub fn status(&self) -> MachineStatus {
        self.lock().status
    }

    pub fn is_running(&self) -> bool {
        self.status() == MachineStatus::Running
    }

    pub fn is_builtin(&self) -> bool {
        self.lock().record.builtin
    }

    pub fn info(&self) -> MachineInfo {
        let st = self.lock();
        MachineInfo {
            id: st.record.id.clone(),
            name: st.record.name.clone(),
            aliases: st.record.aliases.clone(),
            builtin: st.record.builtin,
            status: st.status,
            rootfs_dir: st.record.rootfs_dir.clone(),
            default_user: st.record.default_user.clone(),
            created_at: st.record.created_at.to_rfc3339(),
        }
    }
}
