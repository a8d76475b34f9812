use tracing_subscriber::EnvFilter;

use pulsefeed_api::{
    config::Config, db::create_pool, models::activity_type::validate_registry,
    routes::create_router, state::AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    validate_registry()?;

    let pool = create_pool(&config.database_url)?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    // The writer handle keeps the cache's background writer alive.
    let (state, _cache_writer) = AppState::new(&config, pool).await?;
    let app = create_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
