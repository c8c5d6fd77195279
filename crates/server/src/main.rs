//! ondevice-server - OpenAI-compatible chat completions over one local model

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use inference::session::{UpstreamConfig, UpstreamSession};
use inference::{GenerationBridge, LogBuffer};
use ondevice_server::{ServerConfig, ServerManager};

/// Serve a local model behind /v1/chat/completions
#[derive(Parser)]
#[command(name = "ondevice-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON config file (missing file means defaults)
    #[arg(short, long, default_value = "ondevice-server.json")]
    config: PathBuf,

    /// Interface to bind
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Model name to request from the upstream
    #[arg(short, long)]
    model: Option<String>,

    /// Base URL of the OpenAI-compatible upstream (llama-server, Ollama)
    #[arg(long)]
    upstream: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(model) = self.model {
            config.model = model;
        }
        if let Some(upstream) = self.upstream {
            config.upstream_url = upstream;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let mut config = ServerConfig::load(&cli.config).await?;
    cli.apply(&mut config);
    config.validate()?;

    log::info!(
        "ondevice-server starting (model '{}' via {})",
        config.model,
        config.upstream_url
    );

    let session = Arc::new(UpstreamSession::new(UpstreamConfig::new(
        config.upstream_url.clone(),
        config.model.clone(),
    )));
    let _probe = session.spawn_probe();

    let logs = Arc::new(LogBuffer::new());
    let bridge = Arc::new(GenerationBridge::with_config(
        session,
        logs,
        config.bridge_config(),
    ));

    let manager = ServerManager::new(bridge);
    let status = manager.start(&config).await?;
    if let (Some(address), Some(port)) = (status.address.as_deref(), status.port) {
        log::info!("Ready at http://{}:{}/v1/chat/completions", address, port);
    }

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    manager.stop().await;

    Ok(())
}
