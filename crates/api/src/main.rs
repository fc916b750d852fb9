//! Laterbird service binary: HTTP API, browser UI, dispatcher workers and
//! the delay queue promoter in one process.

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use laterbird_common::config::AppConfig;
use laterbird_common::db::{create_pool, run_migrations};
use laterbird_common::redis_pool::create_redis_pool;
use laterbird_engine::cache::RedisStatusCache;
use laterbird_engine::queue::{QueueTopology, RedisDelayQueue};
use laterbird_engine::service::NotificationService;
use laterbird_engine::store::PgNotificationStore;
use laterbird_notifier::dispatcher::Dispatcher;
use laterbird_notifier::telegram::TelegramChannel;

use laterbird_api::routes::create_router_with_ui;
use laterbird_api::state::AppState;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            "laterbird_api=info,laterbird_engine=info,laterbird_notifier=info,tower_http=info",
        )
    });

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration (also reads .env, so RUST_LOG there applies)
    let config = AppConfig::from_env()?;
    init_tracing(config.log_json);

    tracing::info!("Starting Laterbird...");

    // Record store
    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;

    // Fired on shutdown; also stops broker retries and in-flight sends
    let cancel = CancellationToken::new();

    // Status cache and delay queue share one Redis connection manager
    let redis = create_redis_pool(&config.redis_url).await?;
    let queue = Arc::new(
        RedisDelayQueue::new(
            redis.clone(),
            QueueTopology::from_config(&config),
            config.broker_retry_policy(),
        )
        .with_shutdown(cancel.clone()),
    );
    queue.setup_infrastructure().await?;

    // Delivery channel
    let telegram = TelegramChannel::from_config(&config)?;
    telegram.verify().await?;

    let service = Arc::new(NotificationService::new(
        Arc::new(PgNotificationStore::new(pool.clone())),
        Arc::new(RedisStatusCache::new(redis.clone())),
        queue.clone(),
        Arc::new(telegram),
        config.routing_key.clone(),
    ));

    let mut tasks = JoinSet::new();

    {
        let queue = queue.clone();
        let cancel = cancel.clone();
        let interval = config.queue_poll_interval();
        tasks.spawn(async move { queue.run_promoter(cancel, interval).await });
    }

    let dispatcher = Dispatcher::new(service.clone(), config.queue_poll_interval());
    for i in 0..config.dispatcher_workers.max(1) {
        let tag = format!("{}-{}", config.consumer_name, i);
        let consumer = queue.consumer(&tag).await?;
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { dispatcher.run(&consumer, cancel, &tag).await });
    }
    tracing::info!(workers = config.dispatcher_workers.max(1), "Dispatcher workers started");

    // HTTP server
    let app = create_router_with_ui(AppState::new(service.clone()), Path::new(&config.web_dir))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener =
        tokio::net::TcpListener::bind((config.http_host.as_str(), config.http_port)).await?;
    tracing::info!("API server listening on {}", listener.local_addr()?);

    let server = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let shutdown = cancel.clone();
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = &result {
                tracing::error!(error = %e, "API server failed");
                cancel.cancel();
            }
            result
        })
    };

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
        _ = cancel.cancelled() => {}
    }

    // Phase two: stop every task, then release connections
    cancel.cancel();
    let server_result = server.await?;
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Background task panicked");
        }
    }

    drop(dispatcher);
    drop(service);
    drop(queue);
    drop(redis);
    pool.close().await;

    tracing::info!("Laterbird stopped.");
    server_result?;
    Ok(())
}
