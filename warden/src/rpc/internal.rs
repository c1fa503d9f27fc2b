//! Internal surface; the LXC post-stop hook reports here.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use warden_shared::{WardenError, WardenResult};

use crate::machine::MachineManager;

use super::RpcHandler;

pub const REPORT_STOPPED: &str = "report_stopped";

pub struct InternalSurface {
    machines: Arc<MachineManager>,
}

impl InternalSurface {
    pub fn new(machines: Arc<MachineManager>) -> Self {
        Self { machines }
    }
}

#[async_trait::async_trait]
impl RpcHandler for InternalSurface {
    async fn handle(&self, method: &str, params: Value) -> WardenResult<Value> {
        match method {
            REPORT_STOPPED => {
                #[derive(Deserialize)]
                struct P {
                    machine_id: String,
                }
                let p: P = serde_json::from_value(params)
                    .map_err(|e| WardenError::Validation(format!("bad params: {}", e)))?;
                self.machines.report_stopped(&p.machine_id)?;
                Ok(Value::Null)
            }
            _ => Err(WardenError::Validation(format!(
                "unknown method {}",
                method
            ))),
        }
    }
}
