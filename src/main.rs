//! tabbridge - local relay between a browser extension and a coding-agent
//! backend.
//!
//! One WebSocket per browser tab, one session (and one agent conversation)
//! per tab. The relay streams agent output to the extension in real time and
//! persists enough metadata to resume a conversation on a later connection.

mod config;
mod connection;
mod driver;
mod permission;
mod protocol;
mod server;
mod session;
mod store;
mod stream;

use config::Config;
use connection::ConnectionManager;
use server::{create_router, AppState};
use session::manager::SessionManager;
use session::SessionShared;
use std::sync::Arc;
use store::screenshots::ScreenshotStore;
use store::Store;
use stream::StreamController;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env();
    init_tracing(config.debug);

    // Project-scoped state directory: store file, screenshots, logs.
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;
    std::fs::create_dir_all(config.screenshots_dir())?;

    tracing::info!(path = %config.db_path().display(), "Opening store");
    let store = Store::open(config.db_path())?;

    // Rows left active by a previous process are stale; fold them.
    let folded = store.close_stale_sessions()?;
    if folded > 0 {
        tracing::info!(folded, "Closed stale sessions from previous run");
    }

    let screenshots = ScreenshotStore::new(config.screenshots_dir());
    screenshots.sweep(config.screenshot_ttl);
    screenshots.clone().spawn_reaper(config.screenshot_ttl);

    let connections = Arc::new(ConnectionManager::new(config.max_connections));

    let driver_config = config.clone();
    let shared = Arc::new(SessionShared {
        store: store.clone(),
        screenshots,
        streams: Arc::new(StreamController::new()),
        connections: Arc::clone(&connections),
        timeouts: config.permission_timeouts,
        clear_purges_messages: config.clear_session_purges_messages,
        // Each session exclusively owns its driver instance.
        driver_factory: Arc::new(move || driver::create_driver(&driver_config)),
    });

    let sessions = SessionManager::new(Arc::clone(&shared), &config);
    sessions.spawn_reaper();

    let state = AppState {
        config: Arc::new(config.clone()),
        store,
        sessions: Arc::clone(&sessions),
        connections,
    };

    let app = create_router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.bind_host, config.port);
    tracing::info!(%addr, driver = ?config.driver, "tabbridge listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    // Accepting stopped above; now drain live sessions and flush.
    sessions.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

fn init_tracing(debug: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug {
            "tabbridge=debug,tower_http=debug".into()
        } else {
            "tabbridge=info,tower_http=info".into()
        }
    });
    if debug {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_span_list(false),
            )
            .init();
    }
}
