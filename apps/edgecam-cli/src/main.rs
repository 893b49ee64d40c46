use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::Parser;
use edgecam_cloud::{AzureBlobPublisher, BlobPublisher, IotHubClient, MessageClient};
use edgecam_controller::{CameraController, CameraDevice, FfmpegCamera, MockCamera};
use edgecam_network::{build_router, serve, AppContext};
use edgecam_ops::{ensure_parent_dir, init_tracing};
use edgecam_orchestrator::{BrokerPump, CommandDispatcher, EventPump};
use edgecam_types::{config::EdgecamConfig, EdgecamError};
use edgecam_vision::ImageAnnotator;
use tracing::{error, info, warn};

const DEFAULT_CONFIG: &str = "configs/edgecam.toml";

#[derive(Debug, Parser)]
#[command(name = "edgecam", version, about = "Single-camera edge agent")]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, env = "EDGECAM_CONFIG", default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Override `server.bind_addr`.
    #[arg(long)]
    bind: Option<String>,

    /// Override `server.port`.
    #[arg(long)]
    port: Option<u16>,

    /// Use the synthetic camera instead of the capture device.
    #[arg(long)]
    mock_camera: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let (mut config, load_warning) = load_config(&cli.config);
    config.apply_env();
    if let Some(bind) = cli.bind {
        config.server.bind_addr = bind;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if cli.mock_camera {
        config.camera.mock = true;
    }

    init_tracing(&config.ops).context("failed to initialise logging")?;
    if let Some(warning) = load_warning {
        warn!("{warning}");
    }
    for name in config.missing_settings() {
        let err = EdgecamError::ConfigMissing(name);
        warn!(error = %err, "Setting not provided");
    }

    ensure_parent_dir(&config.camera.output_path)?;

    let camera = Arc::new(CameraController::new(
        build_camera(&config),
        ImageAnnotator::new(&config.annotator),
        &config.camera.output_path,
    ));
    if let Err(err) = camera.open().await {
        warn!(error = %err, "Camera not available yet; captures will retry on demand");
    }

    let publisher: Arc<dyn BlobPublisher> = Arc::new(AzureBlobPublisher::new(config.storage.clone())?);
    let dispatcher = Arc::new(CommandDispatcher::new(Arc::clone(&camera), publisher));

    let broker = spawn_broker(&config, Arc::clone(&dispatcher));

    let router = build_router(AppContext::new(Arc::clone(&dispatcher)), &config.server);
    let served = serve(router, &config.server, shutdown_signal()).await;

    if let Some(task) = broker {
        task.abort();
    }
    if let Err(err) = camera.release().await {
        error!(error = %err, "Failed to release camera");
    }
    info!("edgecam stopped");
    served.map_err(Into::into)
}

fn load_config(path: &Path) -> (EdgecamConfig, Option<String>) {
    match EdgecamConfig::from_file(path) {
        Ok(cfg) => match cfg.validate() {
            Ok(()) => (cfg, None),
            Err(err) => (
                EdgecamConfig::default(),
                Some(format!(
                    "Invalid config in '{}': {err}. Falling back to internal defaults.",
                    path.display()
                )),
            ),
        },
        Err(err) => (
            EdgecamConfig::default(),
            Some(format!(
                "Failed to load config from '{}': {err}. Falling back to internal defaults.",
                path.display()
            )),
        ),
    }
}

fn build_camera(config: &EdgecamConfig) -> Box<dyn CameraDevice> {
    if config.camera.mock {
        info!("Using mock camera");
        Box::new(MockCamera::new(config.camera.width, config.camera.height))
    } else {
        Box::new(FfmpegCamera::new(config.camera.clone()))
    }
}

fn spawn_broker(
    config: &EdgecamConfig,
    dispatcher: Arc<CommandDispatcher>,
) -> Option<tokio::task::JoinHandle<()>> {
    if config.broker.connection_string.is_none() {
        warn!("No broker connection string; cloud messages and twin updates are disabled");
        return None;
    }
    let client: Arc<dyn MessageClient> = match IotHubClient::new(&config.broker) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            error!(error = %err, "Failed to prepare IoT Hub client");
            return None;
        }
    };

    let pump = BrokerPump::new(client, dispatcher);
    Some(tokio::spawn(async move {
        if let Err(err) = pump.run().await {
            error!(error = %err, "Broker pump failed");
        }
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_parse() {
        let cli = Cli::parse_from(["edgecam", "--config", "x.toml", "--port", "8080", "--mock-camera"]);
        assert_eq!(cli.config, PathBuf::from("x.toml"));
        assert_eq!(cli.port, Some(8080));
        assert!(cli.mock_camera);
        assert!(cli.bind.is_none());
    }

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let (config, warning) = load_config(&PathBuf::from("/nonexistent/edgecam.toml"));
        assert!(warning.is_some());
        assert_eq!(config.server.port, 1337);
    }

    #[test]
    fn shipped_config_is_valid() {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../configs/edgecam.toml");
        let (config, warning) = load_config(&path);
        assert!(warning.is_none(), "{warning:?}");
        assert_eq!(config.storage.container, "webcam");
    }
}
