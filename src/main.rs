mod config;
mod controller;
mod errors;
mod file_transfer;
mod install_registry;
mod kit_manager;
mod process_manager;
mod server_instance;
mod topology;
mod websocket_handler;

pub use config::AgentConfig;
pub use controller::AgentController;
pub use errors::{AgentError, AgentResult};
pub use file_transfer::TransferHub;
pub use kit_manager::{KitManager, KitProvider};
pub use websocket_handler::WebSocketHandler;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tracing::{error, info, warn};

const HEALTH_REPORT_INTERVAL: Duration = Duration::from_secs(30);

pub struct RigAgent {
    config: Arc<AgentConfig>,
    ws_handler: Arc<WebSocketHandler>,
}

impl RigAgent {
    pub async fn new(config: AgentConfig) -> AgentResult<Self> {
        info!("Initializing agent on node {}", config.driver.node_id);
        let config = Arc::new(config);

        tokio::fs::create_dir_all(config.storage.instances_dir()).await?;
        tokio::fs::create_dir_all(config.storage.kits_dir()).await?;
        tokio::fs::create_dir_all(config.storage.kit_cache_dir()).await?;

        let kits: Arc<dyn KitProvider> = Arc::new(KitManager::new(&config.storage));
        let transfers = Arc::new(TransferHub::new());
        let controller = Arc::new(AgentController::new(
            config.clone(),
            kits,
            transfers.clone(),
        ));
        let ws_handler = Arc::new(WebSocketHandler::new(config.clone(), controller, transfers));

        Ok(RigAgent { config, ws_handler })
    }

    pub async fn run(&self) -> AgentResult<()> {
        info!("Starting rig agent v{}", env!("CARGO_PKG_VERSION"));

        let ws_handler = self.ws_handler.clone();
        let ws_task = tokio::spawn(async move { ws_handler.connect_and_listen().await });

        let health_handler = self.ws_handler.clone();
        let health_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_REPORT_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(e) = health_handler.send_health_report().await {
                    warn!("Failed to send health report: {}", e);
                }
            }
        });

        let local_port = self.config.driver.local_port;
        let http_task = tokio::spawn(async move { serve_local_health(local_port).await });

        // The bare stdout line is the readiness contract for whoever
        // spawned this process.
        println!("{}", config::AGENT_READY_MARKER);
        info!("Agent ready, listening for driver commands");

        tokio::select! {
            result = ws_task => match result {
                Ok(outcome) => {
                    error!("WebSocket task exited");
                    outcome
                }
                Err(e) => Err(AgentError::InternalError(format!("WebSocket task failed: {}", e))),
            },
            result = health_task => {
                error!("Health monitoring task exited");
                result.map_err(|e| AgentError::InternalError(format!("Health task failed: {}", e)))
            }
            result = http_task => match result {
                Ok(outcome) => {
                    error!("Local health endpoint exited");
                    outcome
                }
                Err(e) => Err(AgentError::InternalError(format!("HTTP task failed: {}", e))),
            },
        }
    }
}

async fn serve_local_health(port: u16) -> AgentResult<()> {
    let app = Router::new().route("/health", get(|| async { "OK" }));
    let addr = format!("127.0.0.1:{}", port);
    info!("Local health endpoint on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| AgentError::NetworkError(format!("Failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| AgentError::NetworkError(format!("Health endpoint failed: {}", e)))
}

struct CliArgs {
    config_path: Option<String>,
    node_name: Option<String>,
    root_dir: Option<PathBuf>,
}

/// Minimal argument scan. A parent agent spawning this binary as a remote
/// client passes --node-name and --root-dir; unknown flags are ignored.
fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = CliArgs {
        config_path: None,
        node_name: None,
        root_dir: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                parsed.config_path = Some(args[i + 1].clone());
                i += 2;
            }
            "--node-name" if i + 1 < args.len() => {
                parsed.node_name = Some(args[i + 1].clone());
                i += 2;
            }
            "--root-dir" if i + 1 < args.len() => {
                parsed.root_dir = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }
    parsed
}

#[tokio::main]
async fn main() -> AgentResult<()> {
    let args = parse_args();

    let mut config = match &args.config_path {
        Some(path) => AgentConfig::from_file(path),
        None => AgentConfig::from_file("/etc/rig-agent/config.toml")
            .or_else(|_| AgentConfig::from_env()),
    }
    .map_err(AgentError::ConfigError)?;

    if let Some(node_name) = args.node_name {
        config.driver.node_id = node_name;
    }
    if let Some(root_dir) = args.root_dir {
        config.storage.root_dir = root_dir;
    }

    let filter = format!("rig_agent={},tokio=info", config.logging.level);
    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Configuration loaded: {:?}", config);

    let agent = RigAgent::new(config).await?;
    agent.run().await
}
