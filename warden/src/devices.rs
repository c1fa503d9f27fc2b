//! Device hot-plug fan-out.
//!
//! An inotify watch on /dev turns node creation and removal into agent calls
//! on every running machine. Only a fixed allow-pattern of hot-pluggable
//! device names is forwarded; everything else in /dev is noise.

use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};

use warden_shared::{WardenError, WardenResult};

use crate::agent::AgentCalls;
use crate::machine::MachineManager;

const DEV_DIR: &str = "/dev";

/// Hot-pluggable device name prefixes forwarded into machines.
const EXTRA_DEVICE_PREFIXES: &[&str] = &["ttyUSB", "ttyACM", "hidraw", "video", "gpiochip"];

pub fn matches_extra_device(name: &str) -> bool {
    EXTRA_DEVICE_PREFIXES
        .iter()
        .any(|prefix| name.strip_prefix(prefix).is_some_and(|rest| rest.chars().all(|c| c.is_ascii_digit())))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub added: bool,
    pub name: String,
}

pub struct DeviceMonitor {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl DeviceMonitor {
    /// Start watching /dev; events fan out to running machines until
    /// `shutdown` is called.
    pub fn start(
        machines: Arc<MachineManager>,
        agents: Arc<dyn AgentCalls>,
    ) -> WardenResult<Self> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK)
            .map_err(|e| WardenError::Internal(format!("inotify init: {}", e)))?;
        inotify
            .add_watch(DEV_DIR, AddWatchFlags::IN_CREATE | AddWatchFlags::IN_DELETE)
            .map_err(|e| WardenError::Internal(format!("inotify watch {}: {}", DEV_DIR, e)))?;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<DeviceEvent>();
        let stop = Arc::new(AtomicBool::new(false));

        // async side: fan each event out to all running machines in parallel
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                dispatch_event(&machines, &agents, event).await;
            }
        });

        // blocking side: drain inotify
        let thread_stop = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("dev-monitor".into())
            .spawn(move || watch_loop(inotify, tx, thread_stop))
            .map_err(|e| WardenError::Internal(format!("spawn dev monitor: {}", e)))?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn watch_loop(
    inotify: Inotify,
    tx: tokio::sync::mpsc::UnboundedSender<DeviceEvent>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::SeqCst) {
        let ready = {
            let mut fds = [PollFd::new(inotify.as_fd(), PollFlags::POLLIN)];
            matches!(poll(&mut fds, PollTimeout::from(1000u16)), Ok(n) if n > 0)
        };
        if !ready {
            continue;
        }

        let events = match inotify.read_events() {
            Ok(events) => events,
            Err(nix::errno::Errno::EAGAIN) => continue,
            Err(e) => {
                tracing::error!(error = %e, "inotify read failed");
                return;
            }
        };

        for event in events {
            let Some(name) = event.name.as_ref().and_then(|n| n.to_str()) else {
                continue;
            };
            if !matches_extra_device(name) {
                continue;
            }
            let added = event.mask.contains(AddWatchFlags::IN_CREATE);
            if tx
                .send(DeviceEvent {
                    added,
                    name: name.to_string(),
                })
                .is_err()
            {
                return;
            }
        }
    }
}

/// One agent call per running machine, all in parallel. Failures from
/// machines that stopped in the meantime are expected and dropped.
pub async fn dispatch_event(
    machines: &MachineManager,
    agents: &Arc<dyn AgentCalls>,
    event: DeviceEvent,
) {
    let path = format!("{}/{}", DEV_DIR, event.name);
    tracing::debug!(device = %path, added = event.added, "device event");

    let running: Vec<String> = machines
        .registry()
        .list()
        .iter()
        .filter(|m| m.is_running())
        .map(|m| m.id.clone())
        .collect();

    let tasks: Vec<_> = running
        .into_iter()
        .map(|id| {
            let agents = Arc::clone(agents);
            let path = path.clone();
            let added = event.added;
            tokio::spawn(async move {
                let result = if added {
                    agents.add_device_node(&id, &path).await
                } else {
                    agents.remove_device_node(&id, &path).await
                };
                if let Err(e) = result {
                    tracing::debug!(machine_id = %id, device = %path, error = %e, "device fan-out call failed");
                }
            })
        })
        .collect();
    for task in tasks {
        let _ = task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_pattern() {
        assert!(matches_extra_device("ttyUSB0"));
        assert!(matches_extra_device("ttyACM12"));
        assert!(matches_extra_device("hidraw3"));
        assert!(matches_extra_device("video0"));
        assert!(!matches_extra_device("sda"));
        assert!(!matches_extra_device("null"));
        assert!(!matches_extra_device("ttyUSB"));
        assert!(!matches_extra_device("ttyUSB0extra"));
        assert!(!matches_extra_device("vcs1"));
    }
}
