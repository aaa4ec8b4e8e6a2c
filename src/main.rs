use pairchat::{config::Config, db::SqliteMessageStore, AppState};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("pairchat=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env()?;
    let store = SqliteMessageStore::connect(&config.database_url, config.db_max_connections).await?;
    let app = pairchat::app(AppState::new(store, config.outbox_capacity));

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    info!(addr = %listener.local_addr()?, "relay listening");
    axum::serve(listener, app).await?;
    Ok(())
}
