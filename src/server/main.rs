// Chattify server binary: command listener, websocket relay, background samplers.
use chattify::server::{config::ServerConfig, connection::Server, database::Database};
use chattify::server::presence::PresenceRegistry;
use chattify::server::relay::ChatRelay;
use chattify::server::auth;
use chattify::utils::performance;
use std::sync::Arc;
use tokio::net::TcpListener;
use log::{info, error};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&log_level)).init();

    let config = ServerConfig::from_env();

    if config.enable_tls {
        info!("TLS on; TLS_CERT_PATH and TLS_KEY_PATH must point at the PEM files.");
    } else {
        info!("TLS off; the command listener speaks plain TCP.");
    }

    let database = Arc::new(Database::connect_with_retry(&config.database_url, 5).await?);

    info!("🗄️ Applying database schema...");
    if let Err(e) = database.migrate().await {
        error!("Schema setup failed: {}", e);
        return Err(e.into());
    }
    info!("✅ Database schema ready");

    let presence = PresenceRegistry::new();

    // Background samplers: performance snapshots plus an hourly token sweep
    let perf_log_path = std::env::var("PERFORMANCE_LOG_PATH")
        .unwrap_or_else(|_| "data/chattify_performance.log".to_string());
    info!("📊 Performance sampler writes to {} every 120s", perf_log_path);
    let perf_db = database.clone();
    let perf_presence = presence.clone();
    tokio::spawn(async move {
        performance::start_performance_logger(perf_db, perf_presence, &perf_log_path).await;
    });

    let sweep_db = database.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            auth::cleanup_expired_tokens(sweep_db.clone()).await;
        }
    });

    // Real-time relay on port +1 relative to the command listener
    let relay = ChatRelay::new(database.clone(), config.clone(), presence);
    let ws_port = config.port + 1;
    let ws_host = config.host.clone();
    tokio::spawn(async move {
        if let Err(e) = start_relay_listener(&format!("{}:{}", ws_host, ws_port), relay).await {
            error!("Relay listener error: {}", e);
        }
    });
    info!("Relay listening on {}:{}", config.host, ws_port);

    let server = Server {
        db: database.clone(),
        config: config.clone(),
    };
    server.run(&format!("{}:{}", config.host, config.port)).await?;
    Ok(())
}

async fn start_relay_listener(addr: &str, relay: ChatRelay) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Relay listener bound on {}", addr);

    while let Ok((stream, peer)) = listener.accept().await {
        info!("Relay connection from {}", peer);
        let relay = relay.clone();
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws_stream) => relay.handle_connection(ws_stream).await,
                Err(e) => error!("Relay handshake with {} failed: {}", peer, e),
            }
        });
    }

    Ok(())
}
