// Copyright (c) 2025 sbksba
//
// This software is licensed under the terms of the MIT License.
// See the LICENSE file in the project root for the full license text.
use std::sync::Arc;

use axum::http::HeaderName;
use server::clock::{Clock, SystemClock};
use server::config::Config;
use server::database::{self, SqliteTaskStore};
use server::handlers::AppState;
use server::notifier::{LogNotifier, Notifier, TelegramNotifier};
use server::routes;
use server::scheduler::Scheduler;
use server::store::TaskStore;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tracing::info!("Starting up taskbell...");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {:?}", e);
            std::process::exit(1);
        }
    };

    let db_pool = match database::establish_connection_pool(&config.database_url).await {
        Ok(pool) => {
            tracing::info!("Database connection was made successfully.");
            pool
        }
        Err(e) => {
            tracing::error!("Failed to connect with the database: {:?}", e);
            std::process::exit(1);
        }
    };

    let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::new(db_pool));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let notifier: Arc<dyn Notifier> = match &config.telegram_token {
        Some(token) => Arc::new(TelegramNotifier::new(&config.telegram_api_base, token)),
        None => {
            tracing::warn!("TELEGRAM_BOT_TOKEN is not set, notifications will only be logged.");
            Arc::new(LogNotifier)
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(store.clone(), notifier, clock.clone(), config.scheduler);
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx));

    let app_routes = routes::create_router(AppState { store, clock });

    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers([
            HeaderName::from_static("content-type"),
            HeaderName::from_static("accept"),
        ])
        .allow_origin(Any);

    let app = app_routes.layer(cors).layer(TraceLayer::new_for_http());

    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {:?}", config.bind_addr, e);
            std::process::exit(1);
        }
    };
    tracing::info!("The server listens on http://{}", config.bind_addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {:?}", e);
            }
            tracing::info!("Shutdown requested.");
        })
        .await;
    if let Err(e) = served {
        tracing::error!("Server error: {:?}", e);
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler_handle.await {
        tracing::error!("Scheduler task failed: {:?}", e);
    }
}
