use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sysinfo::{Disks, System};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::controller::AgentController;
use crate::errors::{AgentError, AgentResult};
use crate::file_transfer::{channel_key, FileMetadata, TransferHub, TransferItem};
use crate::topology::{Distribution, InstanceId, License, Topology};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Maintains the connection to the driver and dispatches its commands to
/// the controller. Long operations run in their own tasks so the read loop
/// keeps feeding transfer channels.
#[derive(Clone)]
pub struct WebSocketHandler {
    config: Arc<AgentConfig>,
    controller: Arc<AgentController>,
    transfers: Arc<TransferHub>,
    write: Arc<RwLock<Option<Arc<Mutex<WsWrite>>>>>,
}

impl WebSocketHandler {
    pub fn new(
        config: Arc<AgentConfig>,
        controller: Arc<AgentController>,
        transfers: Arc<TransferHub>,
    ) -> Self {
        WebSocketHandler {
            config,
            controller,
            transfers,
            write: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn connect_and_listen(&self) -> AgentResult<()> {
        loop {
            match self.establish_connection().await {
                Ok(()) => {
                    info!("WebSocket connection closed, reconnecting...");
                }
                Err(e) => {
                    error!("WebSocket connection error: {}", e);
                }
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn establish_connection(&self) -> AgentResult<()> {
        let ws_url = format!(
            "{}?nodeId={}&token={}",
            self.config.driver.url, self.config.driver.node_id, self.config.driver.secret
        );
        info!("Connecting to driver at {}", self.config.driver.url);

        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .map_err(|e| AgentError::WebSocketError(format!("Failed to connect: {}", e)))?;

        info!("WebSocket connected");
        let (write, mut read) = ws_stream.split();
        let write = Arc::new(Mutex::new(write));
        *self.write.write().await = Some(write.clone());

        let handshake = json!({
            "type": "agent_handshake",
            "nodeId": self.config.driver.node_id,
            "token": self.config.driver.secret,
            "hostname": self.config.driver.hostname,
            "session": Uuid::new_v4().to_string(),
        });
        {
            let mut w = write.lock().await;
            w.send(Message::Text(handshake.to_string()))
                .await
                .map_err(|e| AgentError::WebSocketError(format!("Handshake failed: {}", e)))?;
        }

        let heartbeat_write = write.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                interval.tick().await;
                let heartbeat = json!({
                    "type": "heartbeat",
                    "timestamp": chrono::Utc::now().timestamp_millis(),
                });
                if let Ok(mut w) = heartbeat_write.try_lock() {
                    if w.send(Message::Text(heartbeat.to_string())).await.is_err() {
                        break;
                    }
                }
            }
        });

        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if let Err(e) = self.handle_message(&text).await {
                        error!("Error handling message: {}", e);
                    }
                }
                Ok(Message::Close(_)) => {
                    info!("Driver closed the connection");
                    break;
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        *self.write.write().await = None;
        Ok(())
    }

    async fn handle_message(&self, text: &str) -> AgentResult<()> {
        let msg: Value = serde_json::from_str(text)?;

        match msg["type"].as_str() {
            Some("agent_handshake_response") => {
                info!("Driver acknowledged handshake");
                Ok(())
            }
            Some("install_server") => self.handle_install_server(&msg),
            Some("install_console") => self.handle_install_console(&msg),
            Some("uninstall_server") => self.handle_uninstall_server(&msg),
            Some("uninstall_console") => self.handle_uninstall_console(&msg),
            Some("start_server") => self.handle_start_server(&msg),
            Some("stop_server") => self.handle_stop_server(&msg),
            Some("server_state") => self.handle_server_state(&msg).await,
            Some("start_console") => self.handle_start_console(&msg),
            Some("stop_console") => self.handle_stop_console(&msg),
            Some("console_state") => self.handle_console_state(&msg).await,
            Some("configure_license") => self.handle_configure_license(&msg),
            Some("spawn_client") => self.handle_spawn_client(&msg),
            Some("destroy_client") => self.handle_destroy_client(&msg),
            Some("download_client") => self.handle_download_client(&msg),
            Some("transfer_item") => self.handle_transfer_item(&msg).await,
            Some("instance_status") => self.handle_instance_status(&msg).await,
            Some("cleanup") => self.handle_cleanup(&msg),
            Some(other) => {
                warn!("Unknown message type: {}", other);
                Ok(())
            }
            None => Err(AgentError::InvalidRequest(
                "Message missing type field".to_string(),
            )),
        }
    }

    /// Runs one driver command in its own task and reports the outcome.
    fn spawn_operation<F>(
        &self,
        request_id: Option<String>,
        operation: &'static str,
        instance_id: String,
        fut: F,
    ) where
        F: Future<Output = AgentResult<Value>> + Send + 'static,
    {
        let handler = self.clone();
        tokio::spawn(async move {
            let outcome = fut.await;
            handler
                .emit_operation_result(request_id.as_deref(), operation, &instance_id, outcome)
                .await;
        });
    }

    fn handle_install_server(&self, msg: &Value) -> AgentResult<()> {
        let request_id = optional_str(msg, "requestId");
        let instance_id = InstanceId::new(required_str(msg, "instanceId")?);
        let server = required_str(msg, "server")?.to_string();
        let topology: Topology = serde_json::from_value(msg["topology"].clone())?;
        let offline = msg["offline"].as_bool().unwrap_or(false);
        let license = optional_license(msg)?;
        let config_index = msg["configIndex"].as_u64().unwrap_or(0) as usize;

        let controller = self.controller.clone();
        self.spawn_operation(request_id, "install_server", instance_id.to_string(), async move {
            controller
                .install_server(&instance_id, &topology, &server, offline, license.as_ref(), config_index)
                .await?;
            Ok(Value::Null)
        });
        Ok(())
    }

    fn handle_install_console(&self, msg: &Value) -> AgentResult<()> {
        let request_id = optional_str(msg, "requestId");
        let instance_id = InstanceId::new(required_str(msg, "instanceId")?);
        let hostname = required_str(msg, "hostname")?.to_string();
        let distribution: Distribution = serde_json::from_value(msg["distribution"].clone())?;
        let kit_path = optional_str(msg, "kitPath").map(std::path::PathBuf::from);
        let license = optional_license(msg)?;

        let controller = self.controller.clone();
        self.spawn_operation(request_id, "install_console", instance_id.to_string(), async move {
            controller
                .install_console(
                    &instance_id,
                    &hostname,
                    &distribution,
                    kit_path.as_deref(),
                    license.as_ref(),
                )
                .await?;
            Ok(Value::Null)
        });
        Ok(())
    }

    fn handle_uninstall_server(&self, msg: &Value) -> AgentResult<()> {
        let request_id = optional_str(msg, "requestId");
        let instance_id = InstanceId::new(required_str(msg, "instanceId")?);
        let server = required_str(msg, "server")?.to_string();

        let controller = self.controller.clone();
        self.spawn_operation(request_id, "uninstall_server", instance_id.to_string(), async move {
            let remaining = controller.uninstall_server(&instance_id, &server).await?;
            Ok(json!({ "remaining": remaining }))
        });
        Ok(())
    }

    fn handle_uninstall_console(&self, msg: &Value) -> AgentResult<()> {
        let request_id = optional_str(msg, "requestId");
        let instance_id = InstanceId::new(required_str(msg, "instanceId")?);

        let controller = self.controller.clone();
        self.spawn_operation(request_id, "uninstall_console", instance_id.to_string(), async move {
            let remaining = controller.uninstall_console(&instance_id).await?;
            Ok(json!({ "remaining": remaining }))
        });
        Ok(())
    }

    fn handle_start_server(&self, msg: &Value) -> AgentResult<()> {
        let request_id = optional_str(msg, "requestId");
        let instance_id = InstanceId::new(required_str(msg, "instanceId")?);
        let server = required_str(msg, "server")?.to_string();

        let controller = self.controller.clone();
        self.spawn_operation(request_id, "start_server", instance_id.to_string(), async move {
            controller.start_server(&instance_id, &server).await?;
            Ok(Value::Null)
        });
        Ok(())
    }

    fn handle_stop_server(&self, msg: &Value) -> AgentResult<()> {
        let request_id = optional_str(msg, "requestId");
        let instance_id = InstanceId::new(required_str(msg, "instanceId")?);
        let server = required_str(msg, "server")?.to_string();

        let controller = self.controller.clone();
        self.spawn_operation(request_id, "stop_server", instance_id.to_string(), async move {
            controller.stop_server(&instance_id, &server).await?;
            Ok(Value::Null)
        });
        Ok(())
    }

    async fn handle_server_state(&self, msg: &Value) -> AgentResult<()> {
        let request_id = optional_str(msg, "requestId");
        let instance_id = InstanceId::new(required_str(msg, "instanceId")?);
        let server = required_str(msg, "server")?;

        let state = self.controller.server_state(&instance_id, server).await;
        self.emit_operation_result(
            request_id.as_deref(),
            "server_state",
            instance_id.as_str(),
            Ok(json!({ "server": server, "state": state })),
        )
        .await;
        Ok(())
    }

    fn handle_start_console(&self, msg: &Value) -> AgentResult<()> {
        let request_id = optional_str(msg, "requestId");
        let instance_id = InstanceId::new(required_str(msg, "instanceId")?);

        let controller = self.controller.clone();
        self.spawn_operation(request_id, "start_console", instance_id.to_string(), async move {
            controller.start_console(&instance_id).await?;
            Ok(Value::Null)
        });
        Ok(())
    }

    fn handle_stop_console(&self, msg: &Value) -> AgentResult<()> {
        let request_id = optional_str(msg, "requestId");
        let instance_id = InstanceId::new(required_str(msg, "instanceId")?);

        let controller = self.controller.clone();
        self.spawn_operation(request_id, "stop_console", instance_id.to_string(), async move {
            controller.stop_console(&instance_id).await?;
            Ok(Value::Null)
        });
        Ok(())
    }

    async fn handle_console_state(&self, msg: &Value) -> AgentResult<()> {
        let request_id = optional_str(msg, "requestId");
        let instance_id = InstanceId::new(required_str(msg, "instanceId")?);

        let state = self.controller.console_state(&instance_id).await;
        self.emit_operation_result(
            request_id.as_deref(),
            "console_state",
            instance_id.as_str(),
            Ok(json!({ "state": state })),
        )
        .await;
        Ok(())
    }

    fn handle_configure_license(&self, msg: &Value) -> AgentResult<()> {
        let request_id = optional_str(msg, "requestId");
        let instance_id = InstanceId::new(required_str(msg, "instanceId")?);
        let server = required_str(msg, "server")?.to_string();
        let license: License = serde_json::from_value(msg["license"].clone())?;

        let controller = self.controller.clone();
        self.spawn_operation(request_id, "configure_license", instance_id.to_string(), async move {
            controller.configure_license(&instance_id, &server, &license).await?;
            Ok(Value::Null)
        });
        Ok(())
    }

    fn handle_spawn_client(&self, msg: &Value) -> AgentResult<()> {
        let request_id = optional_str(msg, "requestId");
        let instance_id = InstanceId::new(required_str(msg, "instanceId")?);
        let client = required_str(msg, "client")?.to_string();

        let controller = self.controller.clone();
        self.spawn_operation(request_id, "spawn_client", instance_id.to_string(), async move {
            let pid = controller.spawn_client(&instance_id, &client).await?;
            Ok(json!({ "pid": pid }))
        });
        Ok(())
    }

    fn handle_destroy_client(&self, msg: &Value) -> AgentResult<()> {
        let request_id = optional_str(msg, "requestId");
        let instance_id = InstanceId::new(required_str(msg, "instanceId")?);
        let client = required_str(msg, "client")?.to_string();
        let pid = msg["pid"]
            .as_u64()
            .filter(|&pid| pid > 0)
            .and_then(|pid| u32::try_from(pid).ok())
            .ok_or_else(|| {
                AgentError::InvalidRequest("Missing or out-of-range pid field".to_string())
            })?;

        let controller = self.controller.clone();
        self.spawn_operation(request_id, "destroy_client", instance_id.to_string(), async move {
            controller.destroy_client(&instance_id, &client, pid).await?;
            Ok(Value::Null)
        });
        Ok(())
    }

    fn handle_download_client(&self, msg: &Value) -> AgentResult<()> {
        let request_id = optional_str(msg, "requestId");
        let instance_id = InstanceId::new(required_str(msg, "instanceId")?);
        let client = required_str(msg, "client")?.to_string();

        let controller = self.controller.clone();
        self.spawn_operation(request_id, "download_client", instance_id.to_string(), async move {
            controller.download_client(&instance_id, &client).await?;
            Ok(Value::Null)
        });
        Ok(())
    }

    /// Transfer items are decoded on the read loop so their order on the
    /// socket is the order in the channel. A full channel blocks reading
    /// until the receiver task drains it, which paces the driver through
    /// socket backpressure; the driver must therefore issue `download_client`
    /// before streaming past the channel window, or command dispatch stalls
    /// behind the backlog.
    async fn handle_transfer_item(&self, msg: &Value) -> AgentResult<()> {
        let instance_id = InstanceId::new(required_str(msg, "instanceId")?);
        let client = required_str(msg, "client")?;
        let kind = required_str(msg, "item")?;

        let item = match kind {
            "header" => {
                let metadata: FileMetadata = serde_json::from_value(msg["file"].clone())?;
                TransferItem::Header(metadata)
            }
            "chunk" => {
                let encoded = required_str(msg, "data")?;
                let decoded = general_purpose::STANDARD.decode(encoded).map_err(|e| {
                    AgentError::InvalidRequest(format!("Invalid chunk encoding: {}", e))
                })?;
                TransferItem::Chunk(Bytes::from(decoded))
            }
            "eof" => TransferItem::EndOfStream,
            other => {
                return Err(AgentError::InvalidRequest(format!(
                    "Unknown transfer item kind: {}",
                    other
                )));
            }
        };

        let channel = channel_key(&instance_id, client);
        self.transfers.push(&channel, item).await
    }

    async fn handle_instance_status(&self, msg: &Value) -> AgentResult<()> {
        let request_id = optional_str(msg, "requestId");
        let instance_id = InstanceId::new(required_str(msg, "instanceId")?);

        let status = self.controller.instance_status(&instance_id).await;
        let data = serde_json::to_value(status)?;
        self.emit_operation_result(
            request_id.as_deref(),
            "instance_status",
            instance_id.as_str(),
            Ok(data),
        )
        .await;
        Ok(())
    }

    fn handle_cleanup(&self, msg: &Value) -> AgentResult<()> {
        let request_id = optional_str(msg, "requestId");
        let instance_id = InstanceId::new(required_str(msg, "instanceId")?);

        let controller = self.controller.clone();
        self.spawn_operation(request_id, "cleanup", instance_id.to_string(), async move {
            controller.cleanup(&instance_id).await?;
            Ok(Value::Null)
        });
        Ok(())
    }

    async fn emit_operation_result(
        &self,
        request_id: Option<&str>,
        operation: &str,
        instance_id: &str,
        outcome: AgentResult<Value>,
    ) {
        let event = match &outcome {
            Ok(data) => json!({
                "type": "operation_result",
                "operation": operation,
                "requestId": request_id,
                "instanceId": instance_id,
                "success": true,
                "data": data,
                "timestamp": chrono::Utc::now().timestamp_millis(),
            }),
            Err(e) => {
                error!("Operation {} failed for instance {}: {}", operation, instance_id, e);
                json!({
                    "type": "operation_result",
                    "operation": operation,
                    "requestId": request_id,
                    "instanceId": instance_id,
                    "success": false,
                    "error": e.to_string(),
                    "timestamp": chrono::Utc::now().timestamp_millis(),
                })
            }
        };

        let writer = { self.write.read().await.clone() };
        if let Some(write) = writer {
            let mut w = write.lock().await;
            if let Err(e) = w.send(Message::Text(event.to_string())).await {
                error!("Failed to send operation result: {}", e);
            }
        } else {
            debug!("No driver connection, dropping result of {}", operation);
        }
    }

    pub async fn send_health_report(&self) -> AgentResult<()> {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();

        let cpu_percent = system.global_cpu_info().cpu_usage();
        let memory_usage_mb = system.used_memory() / (1024 * 1024);
        let memory_total_mb = system.total_memory() / (1024 * 1024);

        let disks = Disks::new_with_refreshed_list();
        let mut disk_total_gb = 0.0f64;
        let mut disk_usage_gb = 0.0f64;
        for disk in disks.list() {
            let total = disk.total_space() as f64 / 1_073_741_824.0;
            let available = disk.available_space() as f64 / 1_073_741_824.0;
            disk_total_gb += total;
            disk_usage_gb += total - available;
        }

        let report = json!({
            "type": "health_report",
            "nodeId": self.config.driver.node_id,
            "timestamp": chrono::Utc::now().timestamp_millis(),
            "cpuPercent": cpu_percent,
            "memoryUsageMb": memory_usage_mb,
            "memoryTotalMb": memory_total_mb,
            "diskUsageGb": disk_usage_gb,
            "diskTotalGb": disk_total_gb,
            "uptimeSeconds": get_uptime(),
        });

        let writer = { self.write.read().await.clone() };
        if let Some(write) = writer {
            let mut w = write.lock().await;
            w.send(Message::Text(report.to_string()))
                .await
                .map_err(|e| AgentError::WebSocketError(format!("Health report failed: {}", e)))?;
            debug!("Health report sent");
        } else {
            debug!("No driver connection, skipping health report");
        }
        Ok(())
    }
}

fn required_str<'a>(msg: &'a Value, field: &str) -> AgentResult<&'a str> {
    msg[field]
        .as_str()
        .ok_or_else(|| AgentError::InvalidRequest(format!("Missing {} field", field)))
}

fn optional_str(msg: &Value, field: &str) -> Option<String> {
    msg[field].as_str().map(str::to_string)
}

fn optional_license(msg: &Value) -> AgentResult<Option<License>> {
    match msg.get("license") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
    }
}

fn get_uptime() -> u64 {
    std::fs::read_to_string("/proc/uptime")
        .ok()
        .and_then(|content| content.split_whitespace().next().map(|s| s.to_string()))
        .and_then(|uptime_str| uptime_str.parse::<f64>().ok())
        .map(|uptime| uptime as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::config::{ClientConfig, DriverConfig, LoggingConfig, StorageConfig};
    use crate::kit_manager::test_support::MockKitProvider;
    use crate::kit_manager::KitProvider;

    fn test_handler(root: &Path) -> WebSocketHandler {
        let config = Arc::new(AgentConfig {
            driver: DriverConfig {
                url: "ws://localhost:3000/ws".to_string(),
                node_id: "node-test".to_string(),
                secret: "secret".to_string(),
                hostname: "localhost".to_string(),
                local_port: 8080,
            },
            storage: StorageConfig {
                root_dir: root.to_path_buf(),
            },
            client: ClientConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        });
        let transfers = Arc::new(TransferHub::new());
        let provider = Arc::new(MockKitProvider::new(root));
        let controller = Arc::new(AgentController::new(
            config.clone(),
            provider as Arc<dyn KitProvider>,
            transfers.clone(),
        ));
        WebSocketHandler::new(config, controller, transfers)
    }

    #[tokio::test]
    async fn destroy_client_rejects_a_missing_or_out_of_range_pid() {
        let dir = tempfile::tempdir().unwrap();
        let handler = test_handler(dir.path());

        for pid in [json!(u64::from(u32::MAX) + 1), json!(0), Value::Null] {
            let msg = json!({
                "type": "destroy_client",
                "instanceId": "T1",
                "client": "C1",
                "pid": pid,
            });
            let err = handler.handle_message(&msg.to_string()).await.unwrap_err();
            assert!(matches!(err, AgentError::InvalidRequest(_)));
        }
    }

    #[test]
    fn required_str_reports_the_missing_field() {
        let msg = json!({ "type": "start_server" });
        let err = required_str(&msg, "instanceId").unwrap_err();
        assert!(err.to_string().contains("instanceId"));
    }

    #[test]
    fn optional_license_accepts_absent_and_null() {
        assert!(optional_license(&json!({})).unwrap().is_none());
        assert!(optional_license(&json!({ "license": null })).unwrap().is_none());

        let license = optional_license(&json!({
            "license": { "name": "cluster.key", "content": "licensed" }
        }))
        .unwrap()
        .unwrap();
        assert_eq!(license.name, "cluster.key");
    }

    #[test]
    fn chunk_decoding_rejects_bad_base64() {
        let encoded = general_purpose::STANDARD.encode(b"payload");
        assert_eq!(
            general_purpose::STANDARD.decode(&encoded).unwrap(),
            b"payload"
        );
        assert!(general_purpose::STANDARD.decode("not base64!!").is_err());
    }
}
