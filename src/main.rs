use std::net::SocketAddr;
use tag_history_server::cache::QueryCache;
use tag_history_server::config::AppConfig;
use tag_history_server::{router, AppState};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tag_history_server=info,tower_http=info")),
        )
        .init();

    let config = AppConfig::from_env();
    config.validate()?;
    info!(
        database = %config.database.path,
        profile = %config.query.default_profile,
        table = %config.query.default_table,
        pool_max_size = config.pool.max_size,
        cache_max_entries = config.cache.max_entries,
        "Configuration loaded"
    );

    // Connexions ouvertes à la demande : le démarrage n'échoue pas si la base est absente.
    let state = AppState::new(&config);
    if QueryCache::spawn_cleanup(state.cache().clone(), config.cache.cleanup_interval()).is_some() {
        info!(interval_secs = config.cache.cleanup_interval_secs, "Cache cleanup task started");
    }

    let app = router(state);

    let addr: SocketAddr = config.server.addr.parse()?;
    info!("Server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
