use anyhow::Context;
use kbzpay_service::{config::Config, Application};
use service_core::observability::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    let application = Application::build(config)
        .await
        .context("Failed to build application")?;
    application.run_until_stopped().await?;

    Ok(())
}
