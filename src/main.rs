use std::sync::Arc;

use anyhow::{Context, Result};
use haggle::{
    app,
    clock::SystemClock,
    db,
    rooms::{Hub, SqliteDirectory, SqliteHistory},
    AppState, Config,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "haggle=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    tracing::info!("Opening database: {}", config.database_url);
    let db_pool = db::connect(&config.database_url)
        .await
        .context("Failed to open database")?;

    let hub = Hub::new(
        Arc::new(SqliteDirectory::new(db_pool.clone())),
        Arc::new(SqliteHistory::new(db_pool)),
        config.window,
        Arc::new(SystemClock),
    );
    tracing::info!(
        "Bookable hours {}..={} for {} days",
        config.window.first_hour,
        config.window.last_hour,
        config.window.horizon_days
    );

    let addr = config.addr();
    let app = app(AppState::new(hub, config));

    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
