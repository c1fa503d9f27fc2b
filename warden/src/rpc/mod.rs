//! RPC surfaces.
//!
//! Three independent servers share one line-framed JSON codec: the external
//! host surface (machine CRUD and bridge operations), the in-guest surface
//! used by host-initiated sessions, and the internal surface the LXC
//! post-stop hook reports into. Requests on one connection are handled in
//! order; connections are independent.

mod guest;
mod host;
mod internal;

pub use guest::GuestSurface;
pub use host::HostSurface;
pub use internal::InternalSurface;

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::sync::watch;

use warden_shared::wire::{Request, Response};
use warden_shared::WardenResult;

#[async_trait::async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, method: &str, params: Value) -> WardenResult<Value>;
}

pub struct RpcServer {
    handler: Arc<dyn RpcHandler>,
}

impl RpcServer {
    pub fn new(handler: Arc<dyn RpcHandler>) -> Arc<Self> {
        Arc::new(Self { handler })
    }

    pub async fn serve_tcp(
        self: Arc<Self>,
        listener: tokio::net::TcpListener,
        mut early_stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move { server.serve_connection(stream).await });
                    }
                    Err(e) => tracing::warn!(error = %e, "rpc accept failed"),
                },
                _ = early_stop.changed() => return,
            }
        }
    }

    pub async fn serve_unix(
        self: Arc<Self>,
        listener: tokio::net::UnixListener,
        mut early_stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move { server.serve_connection(stream).await });
                    }
                    Err(e) => tracing::warn!(error = %e, "rpc accept failed"),
                },
                _ = early_stop.changed() => return,
            }
        }
    }

    pub async fn serve_connection<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let mut stream = BufStream::new(stream);
        loop {
            let mut line = String::new();
            match stream.read_line(&mut line).await {
                Ok(0) => return,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "rpc read failed");
                    return;
                }
            }
            if line.trim().is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<Request>(&line) {
                Ok(request) => {
                    let id = request.id;
                    match self.handler.handle(&request.method, request.params).await {
                        Ok(result) => Response::ok(id, result),
                        Err(e) => Response::err(id, e.to_string()),
                    }
                }
                Err(e) => Response::err(0, format!("bad request: {}", e)),
            };

            let Ok(mut out) = serde_json::to_string(&response) else {
                return;
            };
            out.push('\n');
            if stream.write_all(out.as_bytes()).await.is_err() {
                return;
            }
            if stream.flush().await.is_err() {
                return;
            }
        }
    }
}
