use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    info!("Starting cloud orchestrator");

    cloud_orchestrator::cli::run().await
}
