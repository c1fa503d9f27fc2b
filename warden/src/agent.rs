//! Agent RPC clients.
//!
//! Every machine runs a small agent reachable over a unix socket in its
//! rootfs. The manager keeps one lazily-connected client per running
//! machine; clients are dropped on stop and re-established after restart.
//! Framing is one JSON object per line, matching the manager's own RPC
//! surfaces.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::UnixStream;

use warden_shared::wire::{self, Request, Response};
use warden_shared::{WardenError, WardenResult};

const PING: &str = "ping";

const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Agent surface the manager consumes. Trait so tests can inject failures.
#[async_trait::async_trait]
pub trait AgentCalls: Send + Sync {
    /// Make `machine_id` callable; `socket` is the agent socket, and the
    /// engine's real socket lives next to it for `dial_engine_socket`.
    fn register(&self, machine_id: &str, socket: PathBuf);

    /// Drop any cached connection (machine stopped or restarted).
    fn drop_client(&self, machine_id: &str);

    /// Block until the agent answers; the machine's readiness signal.
    async fn wait_ready(&self, machine_id: &str) -> WardenResult<()>;

    /// Rewrite /etc/hostname and /etc/hosts inside the machine.
    async fn update_hostname(&self, machine_id: &str, hostname: &str) -> WardenResult<()>;

    async fn add_device_node(&self, machine_id: &str, path: &str) -> WardenResult<()>;
    async fn remove_device_node(&self, machine_id: &str, path: &str) -> WardenResult<()>;

    /// Block until the container engine inside the machine accepts requests.
    async fn wait_engine_start(&self, machine_id: &str) -> WardenResult<()>;

    /// Resync engine event subscriptions after an engine restart.
    async fn sync_engine_events(&self, machine_id: &str) -> WardenResult<()>;

    /// Fresh connection to the engine's real socket, one per proxy client.
    async fn dial_engine_socket(&self, machine_id: &str) -> WardenResult<UnixStream>;
}

/// One lazily-connected client.
struct AgentClient {
    socket: PathBuf,
    stream: tokio::sync::Mutex<Option<BufStream<UnixStream>>>,
    next_id: AtomicU64,
}

impl AgentClient {
    fn new(socket: PathBuf) -> Self {
        Self {
            socket,
            stream: tokio::sync::Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    async fn call(&self, method: &str, params: Value) -> WardenResult<Value> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            let stream = UnixStream::connect(&self.socket).await.map_err(|e| {
                WardenError::Agent(format!("connect {}: {}", self.socket.display(), e))
            })?;
            *guard = Some(BufStream::new(stream));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request {
            id,
            method: method.to_string(),
            params,
        };
        let mut line = serde_json::to_string(&request)
            .map_err(|e| WardenError::Agent(format!("encode request: {}", e)))?;
        line.push('\n');

        let result = tokio::time::timeout(CALL_TIMEOUT, async {
            let stream = guard.as_mut().expect("stream populated above");
            stream.write_all(line.as_bytes()).await?;
            stream.flush().await?;
            let mut reply = String::new();
            stream.read_line(&mut reply).await?;
            Ok::<String, std::io::Error>(reply)
        })
        .await;

        let reply = match result {
            Ok(Ok(reply)) if !reply.is_empty() => reply,
            Ok(Ok(_)) => {
                *guard = None;
                return Err(WardenError::Agent("connection closed".into()));
            }
            Ok(Err(e)) => {
                *guard = None;
                return Err(WardenError::Agent(format!("{}: {}", method, e)));
            }
            Err(_) => {
                *guard = None;
                return Err(WardenError::Agent(format!("{}: timed out", method)));
            }
        };

        let response: Response = serde_json::from_str(&reply)
            .map_err(|e| WardenError::Agent(format!("decode response: {}", e)))?;
        if response.id != id {
            *guard = None;
            return Err(WardenError::Agent(format!(
                "response id mismatch: sent {}, got {}",
                id, response.id
            )));
        }
        match response.error {
            Some(e) => Err(WardenError::Agent(e)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }
}

/// Client pool keyed by machine id.
#[derive(Default)]
pub struct AgentPool {
    clients: Mutex<HashMap<String, Arc<AgentClient>>>,
}

impl AgentPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self, machine_id: &str) -> WardenResult<Arc<AgentClient>> {
        self.clients
            .lock()
            .get(machine_id)
            .cloned()
            .ok_or_else(|| WardenError::Agent(format!("no agent for machine {}", machine_id)))
    }
}

#[async_trait::async_trait]
impl AgentCalls for AgentPool {
    fn register(&self, machine_id: &str, socket: PathBuf) {
        self.clients
            .lock()
            .insert(machine_id.to_string(), Arc::new(AgentClient::new(socket)));
    }

    fn drop_client(&self, machine_id: &str) {
        self.clients.lock().remove(machine_id);
    }

    async fn wait_ready(&self, machine_id: &str) -> WardenResult<()> {
        let client = self.client(machine_id)?;
        let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
        let mut delay = Duration::from_millis(50);
        loop {
            match client.call(PING, Value::Null).await {
                Ok(_) => return Ok(()),
                Err(e) if tokio::time::Instant::now() + delay >= deadline => {
                    return Err(WardenError::Agent(format!(
                        "machine {} never became ready: {}",
                        machine_id, e
                    )));
                }
                Err(_) => {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(2));
                }
            }
        }
    }

    async fn update_hostname(&self, machine_id: &str, hostname: &str) -> WardenResult<()> {
        self.client(machine_id)?
            .call(
                wire::agent::UPDATE_HOSTNAME,
                json!(wire::UpdateHostnameParams {
                    hostname: hostname.to_string()
                }),
            )
            .await?;
        Ok(())
    }

    async fn add_device_node(&self, machine_id: &str, path: &str) -> WardenResult<()> {
        self.client(machine_id)?
            .call(
                wire::agent::ADD_DEVICE_NODE,
                json!(wire::DeviceNodeParams {
                    path: path.to_string()
                }),
            )
            .await?;
        Ok(())
    }

    async fn remove_device_node(&self, machine_id: &str, path: &str) -> WardenResult<()> {
        self.client(machine_id)?
            .call(
                wire::agent::REMOVE_DEVICE_NODE,
                json!(wire::DeviceNodeParams {
                    path: path.to_string()
                }),
            )
            .await?;
        Ok(())
    }

    async fn wait_engine_start(&self, machine_id: &str) -> WardenResult<()> {
        self.client(machine_id)?
            .call(wire::agent::WAIT_ENGINE_START, Value::Null)
            .await?;
        Ok(())
    }

    async fn sync_engine_events(&self, machine_id: &str) -> WardenResult<()> {
        self.client(machine_id)?
            .call(wire::agent::SYNC_ENGINE_EVENTS, Value::Null)
            .await?;
        Ok(())
    }

    async fn dial_engine_socket(&self, machine_id: &str) -> WardenResult<UnixStream> {
        // the agent keeps the engine's real socket bridged next to its own
        let client = self.client(machine_id)?;
        let engine_socket = client.socket.with_file_name("engine.sock");
        UnixStream::connect(&engine_socket).await.map_err(|e| {
            WardenError::Agent(format!(
                "dial engine socket {}: {}",
                engine_socket.display(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncBufReadExt;

    async fn serve_one(listener: tokio::net::UnixListener, reply: impl Fn(Request) -> Response + Send + 'static) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut stream = BufStream::new(stream);
        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        let request: Request = serde_json::from_str(&line).unwrap();
        let mut out = serde_json::to_string(&reply(request)).unwrap();
        out.push('\n');
        stream.write_all(out.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("agent.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();
        tokio::spawn(serve_one(listener, |req| {
            assert_eq!(req.method, "update_hostname");
            Response::ok(req.id, Value::Null)
        }));

        let pool = AgentPool::new();
        pool.register("m1", socket);
        pool.update_hostname("m1", "beta").await.unwrap();
    }

    #[tokio::test]
    async fn test_agent_error_is_surfaced() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("agent.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();
        tokio::spawn(serve_one(listener, |req| Response::err(req.id, "no such device")));

        let pool = AgentPool::new();
        pool.register("m1", socket);
        let err = pool.add_device_node("m1", "/dev/ttyUSB0").await.unwrap_err();
        assert!(err.to_string().contains("no such device"));
    }

    #[tokio::test]
    async fn test_unregistered_machine_fails_fast() {
        let pool = AgentPool::new();
        assert!(pool.update_hostname("ghost", "x").await.is_err());
    }
}
