//! LXC integration.
//!
//! Machines run as LXC containers driven through the lxc-* tools, with one
//! rendered config file per machine. The LXC container name is the machine
//! ID so renames never touch the LXC object; only `lxc.uts.name` changes.
//! Subprocess isolation keeps liblxc state out of the manager.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use warden_shared::{WardenError, WardenResult};

use crate::config::GuestConfig;
use crate::store::MachineRecord;
use crate::util::{force_kill, is_process_alive};

/// Runtime operations on one machine's LXC container.
pub trait LxcHandle: Send {
    fn start(&mut self) -> WardenResult<()>;

    /// Block until the container reports RUNNING, then return the init pid.
    fn wait_running(&mut self, timeout: Duration) -> WardenResult<u32>;

    /// Graceful stop with bounded grace; force-kill on expiry.
    fn stop(&mut self, grace: Duration) -> WardenResult<()>;

    fn is_running(&self) -> WardenResult<bool>;

    /// Rewrite `lxc.uts.name`; takes effect on next boot, the agent handles
    /// the live hostname.
    fn set_uts_name(&mut self, name: &str) -> WardenResult<()>;

    /// Tear down the LXC side of the machine. Rootfs removal is the
    /// manager's job.
    fn destroy(&mut self) -> WardenResult<()>;
}

/// Creates LXC handles; swapped for a fake in tests.
pub trait LxcFactory: Send + Sync {
    fn create(
        &self,
        record: &MachineRecord,
        seccomp_profile: &Path,
    ) -> WardenResult<Box<dyn LxcHandle>>;
}

// ============================================================================
// CLI-driven implementation
// ============================================================================

pub struct CliLxcFactory {
    cfg: GuestConfig,
    /// Path to this executable, re-entered by the post-stop hook.
    wardend_path: PathBuf,
}

impl CliLxcFactory {
    pub fn new(cfg: GuestConfig, wardend_path: PathBuf) -> Self {
        Self { cfg, wardend_path }
    }

    fn lxc_dir(&self) -> PathBuf {
        self.cfg.data_dir.join("lxc")
    }
}

impl LxcFactory for CliLxcFactory {
    fn create(
        &self,
        record: &MachineRecord,
        seccomp_profile: &Path,
    ) -> WardenResult<Box<dyn LxcHandle>> {
        let container_dir = self.lxc_dir().join(&record.id);
        std::fs::create_dir_all(&container_dir)?;
        let config_path = container_dir.join("config");
        let log_path = self.cfg.logs_dir().join(format!("{}.log", record.id));
        std::fs::create_dir_all(self.cfg.logs_dir())?;

        let config = render_config(record, seccomp_profile, &log_path, &self.wardend_path);
        std::fs::write(&config_path, &config)?;

        Ok(Box::new(CliLxc {
            id: record.id.clone(),
            lxcpath: self.lxc_dir(),
            config_path,
            log_path,
            record: record.clone(),
            seccomp_profile: seccomp_profile.to_path_buf(),
            wardend_path: self.wardend_path.clone(),
            init_pid: None,
        }))
    }
}

/// Render the full LXC config for a machine. Overrides come last so they win.
pub fn render_config(
    record: &MachineRecord,
    seccomp_profile: &Path,
    log_path: &Path,
    wardend_path: &Path,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("lxc.uts.name = {}\n", record.name));
    out.push_str(&format!("lxc.rootfs.path = dir:{}\n", record.rootfs_dir));
    out.push_str(&format!(
        "lxc.seccomp.profile = {}\n",
        seccomp_profile.display()
    ));
    out.push_str(&format!("lxc.log.file = {}\n", log_path.display()));
    out.push_str(&format!(
        "lxc.hook.post-stop = {} lxc-hook post-stop {}\n",
        wardend_path.display(),
        record.id
    ));
    out.push_str("lxc.net.0.type = veth\n");
    out.push_str("lxc.net.0.link = mbr0\n");
    out.push_str("lxc.net.0.flags = up\n");
    out.push_str("lxc.init.cmd = /sbin/init\n");
    for (key, value) in &record.config_overrides {
        out.push_str(&format!("{} = {}\n", key, value));
    }
    out
}

struct CliLxc {
    id: String,
    lxcpath: PathBuf,
    config_path: PathBuf,
    log_path: PathBuf,
    record: MachineRecord,
    seccomp_profile: PathBuf,
    wardend_path: PathBuf,
    /// Last observed init pid; the kill fallback when the monitor is gone.
    init_pid: Option<u32>,
}

impl CliLxc {
    fn run(&self, program: &str, args: &[&str]) -> WardenResult<String> {
        let output = Command::new(program)
            .args(["-P", &self.lxcpath.to_string_lossy(), "-n", &self.id])
            .args(args)
            .output()
            .map_err(|e| WardenError::Lxc(format!("{}: {}", program, e)))?;
        if !output.status.success() {
            return Err(WardenError::Lxc(format!(
                "{} {}: {}",
                program,
                self.id,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl LxcHandle for CliLxc {
    fn start(&mut self) -> WardenResult<()> {
        self.run(
            "lxc-start",
            &[
                "-f",
                &self.config_path.to_string_lossy(),
                "-o",
                &self.log_path.to_string_lossy(),
            ],
        )?;
        Ok(())
    }

    fn wait_running(&mut self, timeout: Duration) -> WardenResult<u32> {
        self.run(
            "lxc-wait",
            &["-s", "RUNNING", "-t", &timeout.as_secs().to_string()],
        )?;
        let pid_out = self.run("lxc-info", &["-p", "-H"])?;
        let pid = pid_out
            .trim()
            .parse()
            .map_err(|e| WardenError::Lxc(format!("bad init pid {:?}: {}", pid_out.trim(), e)))?;
        self.init_pid = Some(pid);
        Ok(pid)
    }

    fn stop(&mut self, grace: Duration) -> WardenResult<()> {
        match self.run("lxc-stop", &["-t", &grace.as_secs().to_string()]) {
            Ok(_) => {
                self.init_pid = None;
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(machine_id = %self.id, error = %e, "graceful stop failed, killing");
            }
        }
        if let Err(e) = self.run("lxc-stop", &["-k"]) {
            // monitor gone; take the init process down directly
            match self.init_pid {
                Some(pid) if is_process_alive(pid) => {
                    tracing::warn!(machine_id = %self.id, pid = pid, "lxc monitor unreachable, killing init");
                    if !force_kill(pid) {
                        return Err(e);
                    }
                }
                _ => {}
            }
        }
        self.init_pid = None;
        Ok(())
    }

    fn is_running(&self) -> WardenResult<bool> {
        let out = self.run("lxc-info", &["-s", "-H"])?;
        Ok(out.trim() == "RUNNING")
    }

    fn set_uts_name(&mut self, name: &str) -> WardenResult<()> {
        self.record.name = name.to_string();
        let config = render_config(
            &self.record,
            &self.seccomp_profile,
            &self.log_path,
            &self.wardend_path,
        );
        std::fs::write(&self.config_path, config)?;
        Ok(())
    }

    fn destroy(&mut self) -> WardenResult<()> {
        // stop if anything is left, then drop our rendered state
        if self.is_running().unwrap_or(false) {
            let _ = self.run("lxc-stop", &["-k"]);
        }
        if let Some(pid) = self.init_pid.take() {
            if is_process_alive(pid) {
                force_kill(pid);
            }
        }
        if let Some(dir) = self.config_path.parent() {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(WardenError::Lxc(format!(
                        "remove lxc dir {}: {}",
                        dir.display(),
                        e
                    )));
                }
            }
        }
        Ok(())
    }
}
