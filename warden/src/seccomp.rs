//! Seccomp policy staging.
//!
//! LXC wants policies as files on disk; the texts are small and fixed, so
//! they are staged into a tmpdir at startup and referenced by path from each
//! machine's config.

use std::path::PathBuf;

use tempfile::TempDir;

use warden_shared::wire::SeccompPolicy;
use warden_shared::{WardenError, WardenResult};

const POLICY_DEFAULT: &str = "\
2
denylist
kexec_load errno 1
kexec_file_load errno 1
open_by_handle_at errno 1
init_module errno 1
finit_module errno 1
delete_module errno 1
";

const POLICY_ISOLATED: &str = "\
2
denylist
kexec_load errno 1
kexec_file_load errno 1
open_by_handle_at errno 1
init_module errno 1
finit_module errno 1
delete_module errno 1
mount errno 1
umount2 errno 1
ptrace errno 1
bpf errno 1
";

// emulated machines trap multiplexed syscalls so the emulator sees them
const POLICY_EMULATED: &str = "\
2
denylist
kexec_load errno 1
kexec_file_load errno 1
open_by_handle_at errno 1
init_module errno 1
finit_module errno 1
delete_module errno 1
ioctl notify
";

const POLICY_EMULATED_ISOLATED: &str = "\
2
denylist
kexec_load errno 1
kexec_file_load errno 1
open_by_handle_at errno 1
init_module errno 1
finit_module errno 1
delete_module errno 1
mount errno 1
umount2 errno 1
ptrace errno 1
bpf errno 1
ioctl notify
";

/// Staged policy files; the tmpdir lives as long as the manager.
pub struct SeccompProfiles {
    dir: TempDir,
}

impl SeccompProfiles {
    pub fn stage() -> WardenResult<Self> {
        let dir = TempDir::new()
            .map_err(|e| WardenError::Internal(format!("seccomp tmpdir: {}", e)))?;
        for (name, text) in [
            ("default", POLICY_DEFAULT),
            ("isolated", POLICY_ISOLATED),
            ("emulated", POLICY_EMULATED),
            ("emulated-isolated", POLICY_EMULATED_ISOLATED),
        ] {
            std::fs::write(dir.path().join(name), text)?;
        }
        Ok(Self { dir })
    }

    pub fn path(&self, policy: SeccompPolicy) -> PathBuf {
        let name = match policy {
            SeccompPolicy::Default => "default",
            SeccompPolicy::Isolated => "isolated",
            SeccompPolicy::Emulated => "emulated",
            SeccompPolicy::EmulatedIsolated => "emulated-isolated",
        };
        self.dir.path().join(name)
    }
}
