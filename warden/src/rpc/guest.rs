//! In-guest surface for host-initiated sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};

use warden_shared::{WardenError, WardenResult};

use crate::wormhole::Wormhole;

use super::RpcHandler;

pub struct GuestSurface {
    wormhole: Arc<Wormhole>,
    poweroff_requested: AtomicBool,
    poweroff_tx: tokio::sync::mpsc::UnboundedSender<()>,
}

impl GuestSurface {
    pub fn new(
        wormhole: Arc<Wormhole>,
        poweroff_tx: tokio::sync::mpsc::UnboundedSender<()>,
    ) -> Self {
        Self {
            wormhole,
            poweroff_requested: AtomicBool::new(false),
            poweroff_tx,
        }
    }

    fn maybe_poweroff(&self) {
        if self.poweroff_requested.load(Ordering::SeqCst) && self.wormhole.session_count() == 0 {
            let _ = self.poweroff_tx.send(());
        }
    }
}

#[async_trait::async_trait]
impl RpcHandler for GuestSurface {
    async fn handle(&self, method: &str, _params: Value) -> WardenResult<Value> {
        match method {
            "on_session_start" => {
                self.wormhole.on_session_start()?;
                Ok(Value::Null)
            }
            "on_session_end" => {
                self.wormhole.on_session_end()?;
                self.maybe_poweroff();
                Ok(Value::Null)
            }
            "nuke_wormhole_data" => {
                self.wormhole.nuke_data()?;
                Ok(Value::Null)
            }
            // VM shutdown waits for the last session to disconnect
            "request_poweroff" => {
                self.poweroff_requested.store(true, Ordering::SeqCst);
                self.maybe_poweroff();
                Ok(Value::Null)
            }
            "session_count" => Ok(json!({ "count": self.wormhole.session_count() })),
            _ => Err(WardenError::Validation(format!(
                "unknown method {}",
                method
            ))),
        }
    }
}
