use tracing::info;
use tracing_subscriber::EnvFilter;

use cychat_server::api;
use cychat_server::config::ServerConfig;
use cychat_server::AppContext;
use cychat_shared::constants::APP_NAME;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,cychat_server=debug")),
        )
        .init();

    info!("Starting {} server v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(
        http_addr = %config.http_addr,
        database = %config.database_path.display(),
        uploads = %config.upload_dir.display(),
        pubsub = %config.pubsub_backend,
        redis_host = %config.redis_host,
        redis_port = config.redis_port,
        "Loaded configuration"
    );
    let http_addr = config.http_addr;

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems (broker, attachment store, database)
    // -----------------------------------------------------------------------
    let app = AppContext::from_config(config).await?;
    info!(pubsub = app.broker.name(), "Subsystems ready");

    // -----------------------------------------------------------------------
    // 4. Run the HTTP/WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
