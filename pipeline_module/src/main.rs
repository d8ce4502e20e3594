use pipeline_module::{run_server, ServiceConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_target(false).init();

    let config = ServiceConfig::from_env()?;

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("shutdown signal listener failed: {}", err);
        }
        info!("shutdown signal received");
    };

    run_server(config, shutdown).await
}
