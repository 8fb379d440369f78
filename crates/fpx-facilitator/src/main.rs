//! fpx-facilitator: rendezvous facilitator binary

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fpx_facilitator::{FacilitatorServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting fpx-facilitator");

    let config = ServerConfig::load()?;
    if config.unsafe_logging {
        info!("Unsafe logging enabled, client and proxy addresses will be logged");
    }

    let server = FacilitatorServer::bind(config).await?;

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        return Err(e);
    }

    Ok(())
}
