use roost::config::AppConfig;
use roost::{AppState, build_router, metrics};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    match config.logging.format.as_str() {
        "json" => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    metrics::init_metrics();

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let base_url = config.server.base_url();

    let state = AppState::new(config).await?;
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, base_url = %base_url, "Roost listening");

    axum::serve(listener, router).await?;
    Ok(())
}
