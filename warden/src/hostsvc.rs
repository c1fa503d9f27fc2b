//! Host control service client.
//!
//! The host runs a control service on the peer address; the manager calls it
//! for user identity, extra CA certificates, and vlan/bridge allocation.
//! Same line-framed JSON codec as everything else; one short-lived
//! connection per call keeps the client trivially reconnect-safe.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

use warden_shared::wire::{self, HostUser, Request, Response};
use warden_shared::{WardenError, WardenResult};

use crate::config::{HOST_IP4, HOST_SERVICE_PORT};

#[async_trait::async_trait]
pub trait HostServices: Send + Sync {
    async fn get_user(&self) -> WardenResult<HostUser>;
    async fn get_extra_ca_certificates(&self) -> WardenResult<Vec<String>>;

    /// Allocate a vlan and create the host-side bridge; returns the vlan id.
    async fn add_engine_bridge(&self, name: &str) -> WardenResult<u16>;
    async fn remove_engine_bridge(&self, name: &str) -> WardenResult<()>;
}

pub struct HostServiceClient {
    addr: String,
    next_id: AtomicU64,
}

impl HostServiceClient {
    pub fn new() -> Self {
        Self {
            addr: format!("{}:{}", HOST_IP4, HOST_SERVICE_PORT),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_addr(addr: String) -> Self {
        Self {
            addr,
            next_id: AtomicU64::new(1),
        }
    }

    async fn call(&self, method: &str, params: Value) -> WardenResult<Value> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| WardenError::HostService(format!("connect {}: {}", self.addr, e)))?;
        let mut stream = BufStream::new(stream);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_string(&Request {
            id,
            method: method.to_string(),
            params,
        })
        .map_err(|e| WardenError::HostService(format!("encode: {}", e)))?;
        line.push('\n');
        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| WardenError::HostService(format!("{}: {}", method, e)))?;
        stream
            .flush()
            .await
            .map_err(|e| WardenError::HostService(format!("{}: {}", method, e)))?;

        let mut reply = String::new();
        stream
            .read_line(&mut reply)
            .await
            .map_err(|e| WardenError::HostService(format!("{}: {}", method, e)))?;
        if reply.is_empty() {
            return Err(WardenError::HostService(format!(
                "{}: connection closed",
                method
            )));
        }

        let response: Response = serde_json::from_str(&reply)
            .map_err(|e| WardenError::HostService(format!("decode: {}", e)))?;
        match response.error {
            Some(e) => Err(WardenError::HostService(e)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }
}

impl Default for HostServiceClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl HostServices for HostServiceClient {
    async fn get_user(&self) -> WardenResult<HostUser> {
        let value = self.call(wire::hostsvc::GET_USER, Value::Null).await?;
        serde_json::from_value(value)
            .map_err(|e| WardenError::HostService(format!("decode user: {}", e)))
    }

    async fn get_extra_ca_certificates(&self) -> WardenResult<Vec<String>> {
        let value = self
            .call(wire::hostsvc::GET_EXTRA_CA_CERTIFICATES, Value::Null)
            .await?;
        serde_json::from_value(value)
            .map_err(|e| WardenError::HostService(format!("decode certificates: {}", e)))
    }

    async fn add_engine_bridge(&self, name: &str) -> WardenResult<u16> {
        let value = self
            .call(wire::hostsvc::ADD_ENGINE_BRIDGE, json!({ "name": name }))
            .await?;
        let vlan = value
            .get("vlan_id")
            .and_then(Value::as_u64)
            .ok_or_else(|| WardenError::HostService("bridge reply missing vlan_id".into()))?;
        u16::try_from(vlan)
            .map_err(|_| WardenError::HostService(format!("vlan id {} out of range", vlan)))
    }

    async fn remove_engine_bridge(&self, name: &str) -> WardenResult<()> {
        self.call(wire::hostsvc::REMOVE_ENGINE_BRIDGE, json!({ "name": name }))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fake_host_service() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut stream = BufStream::new(stream);
                    let mut line = String::new();
                    stream.read_line(&mut line).await.unwrap();
                    let request: Request = serde_json::from_str(&line).unwrap();
                    let response = match request.method.as_str() {
                        wire::hostsvc::GET_USER => Response::ok(
                            request.id,
                            json!({"name": "dev", "uid": 501, "gid": 20}),
                        ),
                        wire::hostsvc::ADD_ENGINE_BRIDGE => {
                            Response::ok(request.id, json!({"vlan_id": 12}))
                        }
                        wire::hostsvc::REMOVE_ENGINE_BRIDGE => {
                            Response::ok(request.id, Value::Null)
                        }
                        _ => Response::err(request.id, "unknown method"),
                    };
                    let mut out = serde_json::to_string(&response).unwrap();
                    out.push('\n');
                    stream.write_all(out.as_bytes()).await.unwrap();
                    stream.flush().await.unwrap();
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_get_user() {
        let addr = fake_host_service().await;
        let client = HostServiceClient::with_addr(addr);
        let user = client.get_user().await.unwrap();
        assert_eq!(user.uid, 501);
        assert_eq!(user.name, "dev");
    }

    #[tokio::test]
    async fn test_bridge_allocation() {
        let addr = fake_host_service().await;
        let client = HostServiceClient::with_addr(addr);
        assert_eq!(client.add_engine_bridge("net0").await.unwrap(), 12);
        client.remove_engine_bridge("net0").await.unwrap();
    }

    #[tokio::test]
    async fn test_error_propagates() {
        let addr = fake_host_service().await;
        let client = HostServiceClient::with_addr(addr);
        let err = client.call("bogus", Value::Null).await.unwrap_err();
        assert!(err.to_string().contains("unknown method"));
    }
}
