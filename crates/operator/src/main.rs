use app_operator::{config::OperatorConfig, controller, logging::init_logging};
use kube::Client;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::load()?;
    init_logging(&config.log_level, config.log_format)?;
    let client = Client::try_default().await?;
    info!(version = env!("CARGO_PKG_VERSION"), "operator starting");
    controller::run(client, config).await
}
