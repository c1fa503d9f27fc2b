//! External host surface: machine CRUD, rename, defaults, bridges, images.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use warden_shared::{WardenError, WardenResult};

use crate::config::ENGINE_MACHINE_NAME;
use crate::machine::{CreateSpec, MachineManager};
use crate::net::{BridgeConfig, NetworkManager};
use crate::nfs::Mirror;

use super::RpcHandler;

pub struct HostSurface {
    machines: Arc<MachineManager>,
    network: Arc<NetworkManager>,
    images: Arc<dyn Mirror>,
}

#[derive(Deserialize)]
struct MachineRef {
    machine: String,
}

#[derive(Deserialize)]
struct DeleteParams {
    machine: String,
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
struct RenameParams {
    machine: String,
    new_name: String,
}

#[derive(Deserialize)]
struct MountImageParams {
    tag: String,
    layers: Vec<PathBuf>,
}

impl HostSurface {
    pub fn new(
        machines: Arc<MachineManager>,
        network: Arc<NetworkManager>,
        images: Arc<dyn Mirror>,
    ) -> Self {
        Self {
            machines,
            network,
            images,
        }
    }

    fn parse<T: serde::de::DeserializeOwned>(params: Value) -> WardenResult<T> {
        serde_json::from_value(params)
            .map_err(|e| WardenError::Validation(format!("bad params: {}", e)))
    }

    fn engine_netns_pid(&self) -> WardenResult<u32> {
        let engine = self.machines.get(ENGINE_MACHINE_NAME)?;
        let init_pid = engine.lock().init_pid;
        init_pid
            .ok_or_else(|| WardenError::InvalidState("engine machine is not running".into()))
    }
}

#[async_trait::async_trait]
impl RpcHandler for HostSurface {
    async fn handle(&self, method: &str, params: Value) -> WardenResult<Value> {
        match method {
            "create_machine" => {
                let spec: CreateSpec = Self::parse(params)?;
                let info = self.machines.create(spec)?;
                Ok(json!(info))
            }
            "delete_machine" => {
                let p: DeleteParams = Self::parse(params)?;
                self.machines.delete(&p.machine, p.force).await?;
                Ok(Value::Null)
            }
            "start_machine" => {
                let p: MachineRef = Self::parse(params)?;
                self.machines.start(&p.machine).await?;
                Ok(Value::Null)
            }
            "stop_machine" => {
                let p: MachineRef = Self::parse(params)?;
                self.machines.stop(&p.machine).await?;
                Ok(Value::Null)
            }
            "restart_machine" => {
                let p: MachineRef = Self::parse(params)?;
                self.machines.restart(&p.machine).await?;
                Ok(Value::Null)
            }
            "rename_machine" => {
                let p: RenameParams = Self::parse(params)?;
                self.machines.rename(&p.machine, &p.new_name).await?;
                Ok(Value::Null)
            }
            "get_machine" => {
                let p: MachineRef = Self::parse(params)?;
                Ok(json!(self.machines.get(&p.machine)?.info()))
            }
            "list_machines" => Ok(json!(self.machines.list_info())),
            "count_machines" => Ok(json!({ "count": self.machines.count_non_builtin() })),
            "default_machine" => Ok(json!(self.machines.default_machine()?)),
            "set_default_machine" => {
                let p: MachineRef = Self::parse(params)?;
                self.machines.set_default_machine(&p.machine)?;
                Ok(Value::Null)
            }
            "add_engine_bridge" => {
                let config: BridgeConfig = Self::parse(params)?;
                let netns_pid = self.engine_netns_pid()?;
                self.network.add_bridge(config, netns_pid).await?;
                Ok(Value::Null)
            }
            "remove_engine_bridge" => {
                #[derive(Deserialize)]
                struct P {
                    name: String,
                }
                let p: P = Self::parse(params)?;
                self.network.remove_bridge(&p.name).await?;
                Ok(Value::Null)
            }
            "mount_image" => {
                let p: MountImageParams = Self::parse(params)?;
                self.images.mount_image(&p.tag, &p.layers)?;
                Ok(Value::Null)
            }
            "unmount_image" => {
                #[derive(Deserialize)]
                struct P {
                    tag: String,
                }
                let p: P = Self::parse(params)?;
                self.images
                    .unmount(&crate::nfs::image::tag_to_subdir(&p.tag))?;
                Ok(Value::Null)
            }
            _ => Err(WardenError::Validation(format!(
                "unknown method {}",
                method
            ))),
        }
    }
}
