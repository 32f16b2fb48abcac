//! pipetap demo host.
//!
//! Runs the in-process reference host on a line-based TCP socket with an
//! echo core handler, and intercepts it:
//! - inbound lines equal to `ping` are rewritten to `pong`
//! - inbound lines starting with `#` are dropped
//! - outbound lines of logged-in connections are tagged with their identity
//!
//! ```text
//! $ pipetap --listen 127.0.0.1:7000
//! $ pipetap-cli --addr 127.0.0.1:7000 send ping hello "#hidden"
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use pipetap::config::{load_config, validate_config, ConfigError, TapConfig};
use pipetap::host::local::LocalServer;
use pipetap::host::{tcp, ConnectionRef, ListenerSocket};
use pipetap::observability::{logging, metrics};
use pipetap::pipeline::{Stage, StageContext, StageRole, WriteAck};
use pipetap::{Interceptor, Message, PipelineError};

#[derive(Parser)]
#[command(name = "pipetap")]
#[command(about = "Interception demo on an in-process pipeline host", long_about = None)]
struct Args {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `host.listen`.
    #[arg(short, long)]
    listen: Option<String>,

    /// Override `owner`.
    #[arg(long)]
    owner: Option<String>,
}

/// Host core handler: writes every line back.
struct EchoCore;

impl Stage for EchoCore {
    fn role(&self) -> StageRole {
        StageRole::Inbound
    }

    fn on_read(&self, ctx: &dyn StageContext, msg: Message) -> Result<(), PipelineError> {
        ctx.write(msg, WriteAck::detached())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => TapConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.host.listen = listen;
    }
    if let Some(owner) = args.owner {
        config.owner = owner;
    }
    validate_config(&config).map_err(ConfigError::Validation)?;

    logging::init_logging(&config.observability);
    tracing::info!(
        owner = %config.owner,
        listen = %config.host.listen,
        anchor = %config.host.anchor,
        "pipetap v0.1.0 starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let server = LocalServer::new(config.host.anchor.clone(), |_: &ConnectionRef| -> Arc<dyn Stage> {
        Arc::new(EchoCore)
    });
    let interceptor = Interceptor::from_config(&config, Arc::new(server.clone()))?;

    interceptor.set_inbound_handler(|handle, msg| match msg.downcast::<String>() {
        Ok(line) if line == "ping" => Ok(Some(Message::new(String::from("pong")))),
        Ok(line) if line.starts_with('#') => {
            tracing::debug!(connection = %handle.id(), "Dropping comment line");
            Ok(None)
        }
        Ok(line) => Ok(Some(Message::new(line))),
        Err(other) => Ok(Some(other)),
    });
    interceptor.set_outbound_handler(|handle, msg| {
        let Ok(identity) = handle.identity() else {
            return Ok(Some(msg));
        };
        match msg.downcast::<String>() {
            Ok(line) => Ok(Some(Message::new(format!("[{identity}] {line}")))),
            Err(other) => Ok(Some(other)),
        }
    });

    let listener = TcpListener::bind(&config.host.listen).await?;
    let socket = server.listen(listener.local_addr()?);
    interceptor.begin();
    tracing::info!(address = %socket.local_addr(), "Listening for connections");

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let transport = tokio::spawn(tcp::serve(server.clone(), socket, listener, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
    // Publishes the host shutdown event, which closes the interceptor.
    server.shutdown();
    transport.await??;

    tracing::info!(begun = interceptor.has_begun(), "Shutdown complete");
    Ok(())
}
