//! Machine lifecycle operations.
//!
//! All compound operations (create, delete, rename) register their undo
//! steps on a `Rollback` so a failure midway never leaves partial state.
//! Registry and machine locks are released before any call into an agent.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ulid::Ulid;

use warden_shared::wire::{MachineInfo, MachineStatus, SeccompPolicy};
use warden_shared::{WardenError, WardenResult};

use crate::agent::AgentCalls;
use crate::config::GuestConfig;
use crate::nfs::Mirror;
use crate::seccomp::SeccompProfiles;
use crate::store::{MachineRecord, MachineStore};
use crate::util::Rollback;

use super::lxc::LxcFactory;
use super::{Machine, Presence, Registry};

const START_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CreateSpec {
    pub name: String,
    pub aliases: Vec<String>,
    pub builtin: bool,
    pub seccomp_policy: SeccompPolicy,
    pub config_overrides: Vec<(String, String)>,
    pub default_user: String,
}

pub struct MachineManager {
    cfg: GuestConfig,
    store: MachineStore,
    registry: Registry,
    mirror: Arc<dyn Mirror>,
    agents: Arc<dyn AgentCalls>,
    lxc_factory: Arc<dyn LxcFactory>,
    seccomp: Arc<SeccompProfiles>,
    presence: Presence,
    host_uid: u32,
    host_gid: u32,
    stopping: AtomicBool,
}

impl MachineManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: GuestConfig,
        store: MachineStore,
        mirror: Arc<dyn Mirror>,
        agents: Arc<dyn AgentCalls>,
        lxc_factory: Arc<dyn LxcFactory>,
        seccomp: Arc<SeccompProfiles>,
        host_uid: u32,
        host_gid: u32,
    ) -> Self {
        Self {
            cfg,
            store,
            registry: Registry::new(),
            mirror,
            agents,
            lxc_factory,
            seccomp,
            presence: Presence::new(),
            host_uid,
            host_gid,
            stopping: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    /// Refuse new work; called at the start of shutdown.
    pub fn set_stopping(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    fn check_stopping(&self) -> WardenResult<()> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(WardenError::Stopping);
        }
        Ok(())
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Resolve an id or a name (aliases included).
    pub fn get(&self, id_or_name: &str) -> WardenResult<Arc<Machine>> {
        self.registry
            .get_by_id(id_or_name)
            .or_else(|| self.registry.get_by_name(id_or_name))
            .ok_or_else(|| WardenError::MachineNotFound(id_or_name.to_string()))
    }

    pub fn list_info(&self) -> Vec<MachineInfo> {
        let mut infos: Vec<_> = self.registry.list().iter().map(|m| m.info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn count_non_builtin(&self) -> usize {
        self.registry.count_non_builtin()
    }

    pub fn for_each<F>(&self, f: F) -> WardenResult<()>
    where
        F: FnMut(&Arc<Machine>) -> WardenResult<()>,
    {
        self.registry.for_each(f)
    }

    /// Default machine per settings, healing a stale explicit choice.
    pub fn default_machine(&self) -> WardenResult<Option<MachineInfo>> {
        let live: Vec<_> = self
            .registry
            .list()
            .iter()
            .map(|m| {
                let st = m.lock();
                (st.record.id.clone(), st.record.name.clone(), st.record.builtin)
            })
            .collect();
        let id = self.store.resolve_default_machine(&live)?;
        Ok(id.and_then(|id| self.registry.get_by_id(&id)).map(|m| m.info()))
    }

    /// Pin the explicit default machine.
    pub fn set_default_machine(&self, id_or_name: &str) -> WardenResult<()> {
        let machine = self.get(id_or_name)?;
        self.store.set_setting(
            crate::store::machines_settings::DEFAULT_MACHINE_ID,
            &machine.id,
        )
    }

    pub fn set_default_user(&self, user: &str) -> WardenResult<()> {
        self.store
            .set_setting(crate::store::machines_settings::DEFAULT_USER, user)
    }

    // ========================================================================
    // Create / delete
    // ========================================================================

    pub fn create(&self, spec: CreateSpec) -> WardenResult<MachineInfo> {
        self.check_stopping()?;
        validate_name(&spec.name)?;
        for alias in &spec.aliases {
            validate_name(alias)?;
        }

        let id = Ulid::new().to_string();
        let rootfs_dir = self.cfg.machines_dir().join(&id);

        let record = MachineRecord {
            id: id.clone(),
            name: spec.name.clone(),
            aliases: spec.aliases.clone(),
            builtin: spec.builtin,
            rootfs_dir: rootfs_dir.to_string_lossy().into_owned(),
            seccomp_policy: spec.seccomp_policy,
            config_overrides: spec.config_overrides.clone(),
            default_user: spec.default_user.clone(),
            last_cgroup_path: None,
            desired_running: false,
            created_at: Utc::now(),
        };

        let mut rollback = Rollback::new();
        let result = (|| {
            // materialize rootfs
            std::fs::create_dir_all(&rootfs_dir)?;
            {
                let rootfs_dir = rootfs_dir.clone();
                rollback.push("rootfs", move || {
                    std::fs::remove_dir_all(&rootfs_dir)?;
                    Ok(())
                });
            }

            // persistent row
            self.store.save(&record)?;
            {
                let store = self.store.clone();
                let id = id.clone();
                rollback.push("store row", move || store.delete(&id));
            }

            // lxc handle + registry entry
            let lxc = self
                .lxc_factory
                .create(&record, &self.seccomp.path(record.seccomp_policy))?;
            let machine = Machine::new(record.clone(), MachineStatus::Stopped, lxc);
            self.registry.insert(Arc::clone(&machine))?;
            {
                let registry = self.registry.clone();
                let id = id.clone();
                rollback.push("registry", move || {
                    registry.remove(&id);
                    Ok(())
                });
            }

            // host-visible mirror of the rootfs
            self.mirror
                .mount_bind(&spec.name, &rootfs_dir, self.host_uid, self.host_gid)?;

            Ok(machine.info())
        })();

        match result {
            Ok(info) => {
                rollback.disarm();
                self.presence.add(&spec.name);
                self.store
                    .set_setting(crate::store::machines_settings::LAST_MACHINE_ID, &id)?;
                tracing::info!(machine_id = %id, name = %spec.name, "created machine");
                Ok(info)
            }
            Err(e) => {
                rollback.run();
                Err(e)
            }
        }
    }

    pub async fn delete(&self, id_or_name: &str, force: bool) -> WardenResult<()> {
        let machine = self.get(id_or_name)?;
        let name = machine.name();

        if machine.is_builtin() {
            return Err(WardenError::Validation(format!(
                "machine {} is builtin and cannot be deleted",
                name
            )));
        }

        if machine.status().is_active() {
            if !force {
                return Err(WardenError::InvalidState(format!(
                    "machine {} is {:?}",
                    name,
                    machine.status()
                )));
            }
            self.stop(&machine.id).await?;
        }

        // pre-delete hook: the mirror entry goes first so the host never
        // sees a dangling export
        self.mirror.unmount(&name)?;

        {
            let machine = Arc::clone(&machine);
            tokio::task::spawn_blocking(move || {
                let mut st = machine.lock();
                st.status = MachineStatus::Deleted;
                st.lxc.destroy()
            })
            .await
            .map_err(|e| WardenError::Internal(format!("destroy task: {}", e)))??;
        }

        self.store.delete(&machine.id)?;
        self.registry.remove(&machine.id);
        self.presence.remove(&name);
        self.agents.drop_client(&machine.id);

        // rootfs and log are best-effort; the startup sweep catches leftovers
        let rootfs = self.cfg.machines_dir().join(&machine.id);
        if let Err(e) = std::fs::remove_dir_all(&rootfs) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(machine_id = %machine.id, error = %e, "rootfs cleanup failed");
            }
        }
        let log = self.cfg.logs_dir().join(format!("{}.log", machine.id));
        let _ = std::fs::remove_file(log);

        tracing::info!(machine_id = %machine.id, name = %name, "deleted machine");
        Ok(())
    }

    // ========================================================================
    // Start / stop
    // ========================================================================

    pub async fn start(&self, id_or_name: &str) -> WardenResult<()> {
        self.check_stopping()?;
        let machine = self.get(id_or_name)?;

        // phase 1: transition and boot, blocking
        let init_pid = {
            let machine = Arc::clone(&machine);
            tokio::task::spawn_blocking(move || -> WardenResult<u32> {
                let mut st = machine.lock();
                if st.status == MachineStatus::Running {
                    return Err(WardenError::InvalidState("already running".into()));
                }
                if !st.status.can_start() {
                    return Err(WardenError::InvalidState(format!(
                        "cannot start from {:?}",
                        st.status
                    )));
                }
                st.status = MachineStatus::Starting;
                if let Err(e) = st.lxc.start() {
                    st.status = MachineStatus::Stopped;
                    return Err(e);
                }
                match st.lxc.wait_running(START_TIMEOUT) {
                    Ok(pid) => {
                        st.init_pid = Some(pid);
                        Ok(pid)
                    }
                    Err(e) => {
                        let _ = st.lxc.stop(Duration::from_secs(0));
                        st.status = MachineStatus::Stopped;
                        Err(e)
                    }
                }
            })
            .await
            .map_err(|e| WardenError::Internal(format!("start task: {}", e)))??
        };

        // phase 2: agent readiness, no machine lock held
        let rootfs = {
            let st = machine.lock();
            std::path::PathBuf::from(&st.record.rootfs_dir)
        };
        self.agents
            .register(&machine.id, self.cfg.agent_socket(&rootfs));
        if let Err(e) = self.agents.wait_ready(&machine.id).await {
            let machine2 = Arc::clone(&machine);
            let _ = tokio::task::spawn_blocking(move || {
                let mut st = machine2.lock();
                let _ = st.lxc.stop(Duration::from_secs(0));
                st.status = MachineStatus::Stopped;
                st.init_pid = None;
            })
            .await;
            self.agents.drop_client(&machine.id);
            return Err(e);
        }

        // phase 3: the post-start observation that makes the machine Running
        {
            let mut st = machine.lock();
            st.status = MachineStatus::Running;
            let cgroup = format!("/sys/fs/cgroup/lxc.payload.{}", machine.id);
            st.record.last_cgroup_path = Some(cgroup.clone());
            st.record.desired_running = true;
            self.store.save(&st.record)?;
            machine.freezer.set_cgroup(Some(cgroup.into()));
        }
        self.store
            .set_setting(crate::store::machines_settings::LAST_MACHINE_ID, &machine.id)?;

        tracing::info!(machine_id = %machine.id, pid = init_pid, "machine running");
        Ok(())
    }

    pub async fn stop(&self, id_or_name: &str) -> WardenResult<()> {
        let machine = self.get(id_or_name)?;

        {
            let machine = Arc::clone(&machine);
            let store = self.store.clone();
            tokio::task::spawn_blocking(move || -> WardenResult<()> {
                let mut st = machine.lock();
                if !st.status.can_stop() {
                    return Err(WardenError::InvalidState(format!(
                        "cannot stop from {:?}",
                        st.status
                    )));
                }
                st.status = MachineStatus::Stopping;
                let res = st.lxc.stop(STOP_GRACE);
                st.status = MachineStatus::Stopped;
                st.init_pid = None;
                st.record.desired_running = false;
                st.record.last_cgroup_path = None;
                store.save(&st.record)?;
                machine.freezer.set_cgroup(None);
                res
            })
            .await
            .map_err(|e| WardenError::Internal(format!("stop task: {}", e)))??;
        }

        self.agents.drop_client(&machine.id);
        tracing::info!(machine_id = %machine.id, "machine stopped");
        Ok(())
    }

    pub async fn restart(&self, id_or_name: &str) -> WardenResult<()> {
        let id = self.get(id_or_name)?.id.clone();
        self.stop(&id).await?;
        self.start(&id).await
    }

    /// Stop every running machine in parallel; errors are joined.
    pub async fn stop_all(&self) -> WardenResult<()> {
        let ids: Vec<String> = self
            .registry
            .list()
            .iter()
            .filter(|m| m.status().can_stop())
            .map(|m| m.id.clone())
            .collect();
        let results = futures::future::join_all(ids.iter().map(|id| self.stop(id))).await;
        warden_shared::errors::join_errors(results.into_iter().filter_map(|r| r.err()).collect())
    }

    /// Post-stop callback from the LXC hook. Also fires on crashes, so it
    /// tolerates every state.
    pub fn report_stopped(&self, id: &str) -> WardenResult<()> {
        let machine = self.get(id)?;
        {
            let mut st = machine.lock();
            if st.status == MachineStatus::Stopped {
                return Ok(());
            }
            tracing::info!(machine_id = %id, from = ?st.status, "machine reported stopped");
            st.status = MachineStatus::Stopped;
            st.init_pid = None;
            st.record.last_cgroup_path = None;
            self.store.save(&st.record)?;
            machine.freezer.set_cgroup(None);
        }
        self.agents.drop_client(&machine.id);
        Ok(())
    }

    // ========================================================================
    // Rename
    // ========================================================================

    pub async fn rename(&self, id_or_name: &str, new_name: &str) -> WardenResult<()> {
        self.check_stopping()?;
        let machine = self.get(id_or_name)?;
        let old_name = machine.name();

        if new_name == old_name {
            return Ok(());
        }
        validate_name(new_name)?;
        if machine.is_builtin() {
            return Err(WardenError::Validation(format!(
                "machine {} is builtin and cannot be renamed",
                old_name
            )));
        }
        if self.registry.get_by_name(new_name).is_some() {
            return Err(WardenError::NameTaken(new_name.to_string()));
        }

        let was_running = self.rename_commit(&machine, &old_name, new_name)?;

        // hostname files, after every lock is released: agents rewrite them
        // in the machine's own mount namespace when it is running
        let result = if was_running {
            self.agents.update_hostname(&machine.id, new_name).await
        } else {
            let rootfs = {
                let st = machine.lock();
                std::path::PathBuf::from(&st.record.rootfs_dir)
            };
            write_hostname_files(&rootfs, &old_name, new_name)
        };

        if let Err(e) = result {
            if let Err(revert_err) = self.rename_commit(&machine, new_name, &old_name) {
                tracing::error!(
                    machine_id = %machine.id,
                    error = %revert_err,
                    "rename revert failed after hostname update error"
                );
            }
            return Err(e);
        }

        tracing::info!(machine_id = %machine.id, old = %old_name, new = %new_name, "renamed machine");
        Ok(())
    }

    /// Steps 1-5 of the rename protocol: presence, registry, store, mirror,
    /// LXC UTS name. Synchronous; on failure all completed steps are undone
    /// and the original error returned. Returns whether the machine was
    /// running at commit time.
    fn rename_commit(
        &self,
        machine: &Arc<Machine>,
        old_name: &str,
        new_name: &str,
    ) -> WardenResult<bool> {
        let mut rollback = Rollback::new();

        // presence drops the old name first and is re-announced on every
        // exit with whatever name the machine ends up owning
        self.presence.remove(old_name);

        let result = (|| -> WardenResult<bool> {
            // swap the name index
            self.registry.rename(&machine.id, old_name, new_name)?;
            {
                let registry = self.registry.clone();
                let id = machine.id.clone();
                let (old_name, new_name) = (old_name.to_string(), new_name.to_string());
                rollback.push("registry name", move || {
                    registry.rename(&id, &new_name, &old_name)
                });
            }

            let (old_record, rootfs_dir, was_running) = {
                let mut st = machine.lock();
                let old_record = st.record.clone();
                st.record.name = new_name.to_string();
                (
                    old_record,
                    std::path::PathBuf::from(&st.record.rootfs_dir),
                    st.status == MachineStatus::Running,
                )
            };
            {
                let machine = Arc::clone(machine);
                let old_name = old_name.to_string();
                rollback.push("record name", move || {
                    machine.lock().record.name = old_name;
                    Ok(())
                });
            }

            // persist the new row
            {
                let st = machine.lock();
                self.store.save(&st.record)?;
            }
            {
                let store = self.store.clone();
                rollback.push("store row", move || store.save(&old_record));
            }

            // move the mirror entry
            self.mirror.unmount(old_name)?;
            {
                let mirror = Arc::clone(&self.mirror);
                let old_name = old_name.to_string();
                let rootfs = rootfs_dir.clone();
                let (uid, gid) = (self.host_uid, self.host_gid);
                rollback.push("mirror old mount", move || {
                    mirror.mount_bind(&old_name, &rootfs, uid, gid)
                });
            }
            self.mirror
                .mount_bind(new_name, &rootfs_dir, self.host_uid, self.host_gid)?;
            {
                let mirror = Arc::clone(&self.mirror);
                let new_name = new_name.to_string();
                rollback.push("mirror new mount", move || mirror.unmount(&new_name));
            }

            // LXC side
            {
                let mut st = machine.lock();
                st.lxc.set_uts_name(new_name)?;
            }
            {
                let machine = Arc::clone(machine);
                let old_name = old_name.to_string();
                rollback.push("lxc uts name", move || {
                    machine.lock().lxc.set_uts_name(&old_name)
                });
            }

            Ok(was_running)
        })();

        match result {
            Ok(was_running) => {
                rollback.disarm();
                self.presence.add(new_name);
                Ok(was_running)
            }
            Err(e) => {
                rollback.run();
                self.presence.add(old_name);
                Err(e)
            }
        }
    }

    // ========================================================================
    // Startup restore
    // ========================================================================

    /// Replay every persisted row into the registry and re-add its mirror
    /// mount. Returns the ids whose desired state is running, for the caller
    /// to start in the background.
    pub fn restore(&self) -> WardenResult<Vec<String>> {
        let records = self.store.load_all()?;
        tracing::info!(count = records.len(), "restoring machines from store");

        let mut autostart = Vec::new();
        for record in records {
            let lxc = self
                .lxc_factory
                .create(&record, &self.seccomp.path(record.seccomp_policy))?;
            let machine = Machine::new(record.clone(), MachineStatus::Restoring, lxc);
            self.registry.insert(Arc::clone(&machine))?;

            if let Err(e) = self.mirror.mount_bind(
                &record.name,
                Path::new(&record.rootfs_dir),
                self.host_uid,
                self.host_gid,
            ) {
                tracing::warn!(machine_id = %record.id, error = %e, "restore mirror mount failed");
            }
            self.presence.add(&record.name);

            machine.lock().status = MachineStatus::Stopped;
            if record.desired_running {
                autostart.push(record.id.clone());
            }
        }

        self.sweep_orphans()?;
        Ok(autostart)
    }

    /// Delete rootfs dirs and logs whose ids are absent from the store.
    fn sweep_orphans(&self) -> WardenResult<()> {
        let known: std::collections::HashSet<String> = self
            .registry
            .list()
            .iter()
            .map(|m| m.id.clone())
            .collect();

        for dir in [self.cfg.machines_dir(), self.cfg.logs_dir()] {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let entry = entry?;
                let file_name = entry.file_name();
                let stem = Path::new(&file_name)
                    .file_stem()
                    .unwrap_or(&file_name)
                    .to_string_lossy()
                    .into_owned();
                if known.contains(&stem) {
                    continue;
                }
                tracing::info!(path = %entry.path().display(), "removing orphan");
                let result = if entry.path().is_dir() {
                    std::fs::remove_dir_all(entry.path())
                } else {
                    std::fs::remove_file(entry.path())
                };
                if let Err(e) = result {
                    tracing::warn!(path = %entry.path().display(), error = %e, "orphan removal failed");
                }
            }
        }
        Ok(())
    }
}

/// DNS-safe machine names: lowercase alphanumerics and inner dashes.
pub fn validate_name(name: &str) -> WardenResult<()> {
    let ok = !name.is_empty()
        && name.len() <= 63
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if !ok {
        return Err(WardenError::Validation(format!(
            "invalid machine name {:?}",
            name
        )));
    }
    Ok(())
}

/// Rewrite /etc/hostname and /etc/hosts of a stopped machine.
fn write_hostname_files(rootfs: &Path, old_name: &str, new_name: &str) -> WardenResult<()> {
    let etc = rootfs.join("etc");
    std::fs::create_dir_all(&etc)?;
    std::fs::write(etc.join("hostname"), format!("{}\n", new_name))?;

    let hosts_path = etc.join("hosts");
    let hosts = std::fs::read_to_string(&hosts_path).unwrap_or_default();
    let mut lines: Vec<String> = hosts
        .lines()
        .filter(|l| {
            !l.split_whitespace()
                .skip(1)
                .any(|host| host == old_name)
        })
        .map(str::to_string)
        .collect();
    lines.push(format!("127.0.1.1\t{}", new_name));
    std::fs::write(&hosts_path, lines.join("\n") + "\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nfs::mirror::tests::RecordingMounter;
    use crate::nfs::{ExportTable, MirrorDir};
    use crate::store::Database;
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;

    // ------------------------------------------------------------------------
    // Fakes
    // ------------------------------------------------------------------------

    struct FakeLxc {
        running: bool,
        uts_name: String,
        fail_set_uts: Arc<AtomicBool>,
        uts_log: Arc<Mutex<Vec<String>>>,
    }

    impl crate::machine::LxcHandle for FakeLxc {
        fn start(&mut self) -> WardenResult<()> {
            self.running = true;
            Ok(())
        }

        fn wait_running(&mut self, _timeout: Duration) -> WardenResult<u32> {
            Ok(4242)
        }

        fn stop(&mut self, _grace: Duration) -> WardenResult<()> {
            self.running = false;
            Ok(())
        }

        fn is_running(&self) -> WardenResult<bool> {
            Ok(self.running)
        }

        fn set_uts_name(&mut self, name: &str) -> WardenResult<()> {
            if self.fail_set_uts.load(Ordering::SeqCst) {
                return Err(WardenError::Lxc("injected uts failure".into()));
            }
            self.uts_name = name.to_string();
            self.uts_log.lock().push(name.to_string());
            Ok(())
        }

        fn destroy(&mut self) -> WardenResult<()> {
            Ok(())
        }
    }

    struct FakeLxcFactory {
        fail_set_uts: Arc<AtomicBool>,
        uts_log: Arc<Mutex<Vec<String>>>,
    }

    impl FakeLxcFactory {
        fn new() -> Self {
            Self {
                fail_set_uts: Arc::new(AtomicBool::new(false)),
                uts_log: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl LxcFactory for FakeLxcFactory {
        fn create(
            &self,
            record: &MachineRecord,
            _seccomp_profile: &Path,
        ) -> WardenResult<Box<dyn crate::machine::LxcHandle>> {
            Ok(Box::new(FakeLxc {
                running: false,
                uts_name: record.name.clone(),
                fail_set_uts: Arc::clone(&self.fail_set_uts),
                uts_log: Arc::clone(&self.uts_log),
            }))
        }
    }

    #[derive(Default)]
    struct FakeAgents {
        fail_update_hostname: AtomicBool,
        hostnames: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl AgentCalls for FakeAgents {
        fn register(&self, _machine_id: &str, _socket: PathBuf) {}
        fn drop_client(&self, _machine_id: &str) {}

        async fn wait_ready(&self, _machine_id: &str) -> WardenResult<()> {
            Ok(())
        }

        async fn update_hostname(&self, _machine_id: &str, hostname: &str) -> WardenResult<()> {
            if self.fail_update_hostname.load(Ordering::SeqCst) {
                return Err(WardenError::Agent("injected hostname failure".into()));
            }
            self.hostnames.lock().push(hostname.to_string());
            Ok(())
        }

        async fn add_device_node(&self, _machine_id: &str, _path: &str) -> WardenResult<()> {
            Ok(())
        }

        async fn remove_device_node(&self, _machine_id: &str, _path: &str) -> WardenResult<()> {
            Ok(())
        }

        async fn wait_engine_start(&self, _machine_id: &str) -> WardenResult<()> {
            Ok(())
        }

        async fn sync_engine_events(&self, _machine_id: &str) -> WardenResult<()> {
            Ok(())
        }

        async fn dial_engine_socket(&self, _machine_id: &str) -> WardenResult<tokio::net::UnixStream> {
            Err(WardenError::Agent("not implemented in fake".into()))
        }
    }

    // ------------------------------------------------------------------------
    // Fixture
    // ------------------------------------------------------------------------

    struct Fixture {
        _dir: TempDir,
        manager: MachineManager,
        exports: Arc<ExportTable>,
        mirror_root: PathBuf,
        factory: Arc<FakeLxcFactory>,
        agents: Arc<FakeAgents>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let cfg = GuestConfig::for_tests(dir.path());
        let db = Database::open(&cfg.store_path()).unwrap();
        let store = MachineStore::new(db);
        let exports = Arc::new(ExportTable::new(501, 20));
        let mirror_root = cfg.nfs_root_dir.clone();
        let mirror: Arc<dyn Mirror> = Arc::new(
            MirrorDir::new(
                mirror_root.clone(),
                Box::new(Arc::new(RecordingMounter::new())),
                Arc::clone(&exports),
            )
            .unwrap(),
        );
        let factory = Arc::new(FakeLxcFactory::new());
        let agents = Arc::new(FakeAgents::default());
        let manager = MachineManager::new(
            cfg,
            store,
            mirror,
            Arc::clone(&agents) as Arc<dyn AgentCalls>,
            Arc::clone(&factory) as Arc<dyn LxcFactory>,
            Arc::new(SeccompProfiles::stage().unwrap()),
            501,
            20,
        );
        Fixture {
            _dir: dir,
            manager,
            exports,
            mirror_root,
            factory,
            agents,
        }
    }

    fn spec(name: &str) -> CreateSpec {
        CreateSpec {
            name: name.to_string(),
            default_user: "admin".to_string(),
            ..Default::default()
        }
    }

    fn ro_path(fix: &Fixture, sub: &str) -> PathBuf {
        fix.mirror_root.join("ro").join(sub)
    }

    // ------------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------------

    #[test]
    fn test_create_registers_everything() {
        let fix = fixture();
        let info = fix.manager.create(spec("alpha")).unwrap();

        assert_eq!(info.name, "alpha");
        assert!(fix.manager.get("alpha").is_ok());
        assert!(fix.manager.get(&info.id).is_ok());
        assert!(fix.exports.lookup(&ro_path(&fix, "alpha")).is_some());
        assert!(fix.manager.presence().contains("alpha"));
        fix.manager.registry().assert_coherent();

        let row = fix.manager.store.get(&info.id).unwrap().unwrap();
        assert_eq!(row.name, "alpha");
    }

    #[test]
    fn test_create_duplicate_name_rolls_back() {
        let fix = fixture();
        fix.manager.create(spec("alpha")).unwrap();
        let err = fix.manager.create(spec("alpha")).unwrap_err();
        assert!(matches!(err, WardenError::NameTaken(_)));

        // exactly one of everything left
        assert_eq!(fix.manager.list_info().len(), 1);
        assert_eq!(fix.manager.store.load_all().unwrap().len(), 1);
        assert_eq!(fix.exports.len(), 1);
        fix.manager.registry().assert_coherent();
    }

    #[test]
    fn test_create_invalid_name_rejected() {
        let fix = fixture();
        for bad in ["", "Caps", "has space", "-lead", "trail-", "dot.dot"] {
            assert!(fix.manager.create(spec(bad)).is_err(), "{:?}", bad);
        }
        assert!(fix.manager.list_info().is_empty());
    }

    #[tokio::test]
    async fn test_start_stop_cycle() {
        let fix = fixture();
        let info = fix.manager.create(spec("alpha")).unwrap();

        fix.manager.start(&info.id).await.unwrap();
        let machine = fix.manager.get(&info.id).unwrap();
        assert_eq!(machine.status(), MachineStatus::Running);
        assert_eq!(machine.lock().init_pid, Some(4242));
        assert!(fix.manager.store.get(&info.id).unwrap().unwrap().desired_running);

        fix.manager.stop(&info.id).await.unwrap();
        assert_eq!(machine.status(), MachineStatus::Stopped);
        assert!(!fix.manager.store.get(&info.id).unwrap().unwrap().desired_running);
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let fix = fixture();
        let info = fix.manager.create(spec("alpha")).unwrap();
        fix.manager.start(&info.id).await.unwrap();
        assert!(fix.manager.start(&info.id).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_removes_everything() {
        let fix = fixture();
        let info = fix.manager.create(spec("alpha")).unwrap();
        fix.manager.delete("alpha", false).await.unwrap();

        assert!(fix.manager.get(&info.id).is_err());
        assert!(fix.manager.store.get(&info.id).unwrap().is_none());
        assert!(fix.exports.lookup(&ro_path(&fix, "alpha")).is_none());
        assert!(!fix.manager.presence().contains("alpha"));
    }

    #[tokio::test]
    async fn test_delete_running_requires_force() {
        let fix = fixture();
        let info = fix.manager.create(spec("alpha")).unwrap();
        fix.manager.start(&info.id).await.unwrap();

        assert!(fix.manager.delete("alpha", false).await.is_err());
        fix.manager.delete("alpha", true).await.unwrap();
        assert!(fix.manager.get(&info.id).is_err());
    }

    #[tokio::test]
    async fn test_rename_happy_path() {
        let fix = fixture();
        let info = fix.manager.create(spec("a")).unwrap();
        fix.manager.rename("a", "b").await.unwrap();

        assert!(fix.manager.get("a").is_err());
        assert_eq!(fix.manager.get("b").unwrap().id, info.id);
        assert_eq!(
            fix.manager.store.get(&info.id).unwrap().unwrap().name,
            "b"
        );
        assert!(fix.exports.lookup(&ro_path(&fix, "a")).is_none());
        assert!(fix.exports.lookup(&ro_path(&fix, "b")).is_some());
        assert_eq!(fix.factory.uts_log.lock().last().unwrap(), "b");
        assert!(fix.manager.presence().contains("b"));
        assert!(!fix.manager.presence().contains("a"));
        fix.manager.registry().assert_coherent();
    }

    #[tokio::test]
    async fn test_rename_then_back_restores_state() {
        let fix = fixture();
        let info = fix.manager.create(spec("a")).unwrap();
        fix.manager.rename("a", "b").await.unwrap();
        fix.manager.rename("b", "a").await.unwrap();

        assert_eq!(fix.manager.get("a").unwrap().id, info.id);
        assert!(fix.manager.get("b").is_err());
        assert_eq!(fix.manager.store.get(&info.id).unwrap().unwrap().name, "a");
        assert!(fix.exports.lookup(&ro_path(&fix, "a")).is_some());
        assert!(fix.exports.lookup(&ro_path(&fix, "b")).is_none());
        assert_eq!(fix.exports.len(), 1);
    }

    #[tokio::test]
    async fn test_rename_rollback_on_uts_failure() {
        let fix = fixture();
        let info = fix.manager.create(spec("a")).unwrap();
        fix.factory.fail_set_uts.store(true, Ordering::SeqCst);

        let err = fix.manager.rename("a", "b").await.unwrap_err();
        assert!(err.to_string().contains("injected uts failure"));

        // everything back under the old name
        assert_eq!(fix.manager.get("a").unwrap().id, info.id);
        assert!(fix.manager.get("b").is_err());
        assert_eq!(fix.manager.store.get(&info.id).unwrap().unwrap().name, "a");
        assert!(fix.exports.lookup(&ro_path(&fix, "a")).is_some());
        assert!(fix.exports.lookup(&ro_path(&fix, "b")).is_none());
        assert!(fix.manager.presence().contains("a"));
        fix.manager.registry().assert_coherent();
    }

    #[tokio::test]
    async fn test_rename_rollback_on_agent_failure() {
        let fix = fixture();
        let info = fix.manager.create(spec("a")).unwrap();
        fix.manager.start(&info.id).await.unwrap();
        fix.agents.fail_update_hostname.store(true, Ordering::SeqCst);

        let err = fix.manager.rename("a", "b").await.unwrap_err();
        assert!(err.to_string().contains("injected hostname failure"));

        assert_eq!(fix.manager.get("a").unwrap().id, info.id);
        assert!(fix.manager.get("b").is_err());
        assert_eq!(fix.manager.store.get(&info.id).unwrap().unwrap().name, "a");
        assert!(fix.exports.lookup(&ro_path(&fix, "a")).is_some());
        fix.manager.registry().assert_coherent();
    }

    #[tokio::test]
    async fn test_rename_same_name_is_noop() {
        let fix = fixture();
        fix.manager.create(spec("a")).unwrap();
        fix.manager.rename("a", "a").await.unwrap();
        assert!(fix.manager.get("a").is_ok());
        assert_eq!(fix.exports.len(), 1);
    }

    #[tokio::test]
    async fn test_rename_builtin_rejected() {
        let fix = fixture();
        let mut s = spec("engine");
        s.builtin = true;
        fix.manager.create(s).unwrap();
        assert!(fix.manager.rename("engine", "other").await.is_err());
    }

    #[tokio::test]
    async fn test_rename_to_taken_name_rejected() {
        let fix = fixture();
        fix.manager.create(spec("a")).unwrap();
        fix.manager.create(spec("b")).unwrap();
        let err = fix.manager.rename("a", "b").await.unwrap_err();
        assert!(matches!(err, WardenError::NameTaken(_)));
        assert!(fix.manager.get("a").is_ok());
    }

    #[test]
    fn test_report_stopped_clears_runtime_state() {
        let fix = fixture();
        let info = fix.manager.create(spec("alpha")).unwrap();
        let machine = fix.manager.get(&info.id).unwrap();
        {
            let mut st = machine.lock();
            st.status = MachineStatus::Running;
            st.init_pid = Some(99);
        }
        fix.manager.report_stopped(&info.id).unwrap();
        assert_eq!(machine.status(), MachineStatus::Stopped);
        assert_eq!(machine.lock().init_pid, None);
    }

    #[test]
    fn test_restore_and_orphan_sweep() {
        let dir = TempDir::new().unwrap();
        let cfg = GuestConfig::for_tests(dir.path());

        // seed the store and an orphan rootfs out-of-band
        {
            let db = Database::open(&cfg.store_path()).unwrap();
            let store = MachineStore::new(db);
            store
                .save(&MachineRecord {
                    id: "01J0000000000000000000000A".into(),
                    name: "alpha".into(),
                    aliases: Vec::new(),
                    builtin: false,
                    rootfs_dir: cfg
                        .machines_dir()
                        .join("01J0000000000000000000000A")
                        .to_string_lossy()
                        .into_owned(),
                    seccomp_policy: SeccompPolicy::Default,
                    config_overrides: Vec::new(),
                    default_user: "admin".into(),
                    last_cgroup_path: None,
                    desired_running: true,
                    created_at: Utc::now(),
                })
                .unwrap();
        }
        std::fs::create_dir_all(cfg.machines_dir().join("01J0000000000000000000000A")).unwrap();
        let orphan = cfg.machines_dir().join("01JORPHANORPHANORPHANORPHA");
        std::fs::create_dir_all(&orphan).unwrap();

        let db = Database::open(&cfg.store_path()).unwrap();
        let store = MachineStore::new(db);
        let exports = Arc::new(ExportTable::new(501, 20));
        let mirror: Arc<dyn Mirror> = Arc::new(
            MirrorDir::new(
                cfg.nfs_root_dir.clone(),
                Box::new(Arc::new(RecordingMounter::new())),
                Arc::clone(&exports),
            )
            .unwrap(),
        );
        let manager = MachineManager::new(
            cfg,
            store,
            mirror,
            Arc::new(FakeAgents::default()),
            Arc::new(FakeLxcFactory::new()),
            Arc::new(SeccompProfiles::stage().unwrap()),
            501,
            20,
        );

        let autostart = manager.restore().unwrap();
        assert_eq!(autostart, vec!["01J0000000000000000000000A".to_string()]);
        assert!(manager.get("alpha").is_ok());
        assert_eq!(
            manager.get("alpha").unwrap().status(),
            MachineStatus::Stopped
        );
        assert_eq!(exports.len(), 1);
        assert!(!orphan.exists());
    }

    #[test]
    fn test_default_machine_falls_back_to_first_non_builtin() {
        let fix = fixture();
        let mut engine = spec("engine");
        engine.builtin = true;
        fix.manager.create(engine).unwrap();
        fix.manager.create(spec("zeta")).unwrap();
        fix.manager.create(spec("alpha")).unwrap();
        // creation records last_machine_id; drop it to exercise the sort
        fix.manager
            .store
            .delete_setting(crate::store::machines_settings::LAST_MACHINE_ID)
            .unwrap();

        let default = fix.manager.default_machine().unwrap().unwrap();
        assert_eq!(default.name, "alpha");
    }

    #[tokio::test]
    async fn test_stop_all_joins_errors() {
        let fix = fixture();
        let a = fix.manager.create(spec("a")).unwrap();
        let b = fix.manager.create(spec("b")).unwrap();
        fix.manager.start(&a.id).await.unwrap();
        fix.manager.start(&b.id).await.unwrap();

        fix.manager.stop_all().await.unwrap();
        assert_eq!(fix.manager.get(&a.id).unwrap().status(), MachineStatus::Stopped);
        assert_eq!(fix.manager.get(&b.id).unwrap().status(), MachineStatus::Stopped);
    }

    #[test]
    fn test_write_hostname_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::write(
            dir.path().join("etc/hosts"),
            "127.0.0.1\tlocalhost\n127.0.1.1\told-name\n",
        )
        .unwrap();

        write_hostname_files(dir.path(), "old-name", "new-name").unwrap();

        let hostname = std::fs::read_to_string(dir.path().join("etc/hostname")).unwrap();
        assert_eq!(hostname, "new-name\n");
        let hosts = std::fs::read_to_string(dir.path().join("etc/hosts")).unwrap();
        assert!(!hosts.contains("old-name"));
        assert!(hosts.contains("127.0.1.1\tnew-name"));
        assert!(hosts.contains("localhost"));
    }
}
