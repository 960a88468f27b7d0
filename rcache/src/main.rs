use std::sync::Arc;
use std::time::Duration;

use common_database::get_pool_with_config;
use common_health::HealthRegistry;
use common_kafka::kafka_consumer::TrackedConsumer;
use envconfig::Envconfig;
use rcache::config::{Config, ConsumerConfig};
use rcache::consumer::CacheConsumerLoop;
use rcache::precompute::Precomputer;
use rcache::server::{self, AppState};
use rcache::store::CacheStore;
use serve_metrics::setup_metrics_routes;
use tracing::level_filters::LevelFilter;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    info!("starting rcache...");

    ConsumerConfig::set_defaults("rcache", "ALS", false);
    let config = Config::init_from_env()?;

    let health_registry = HealthRegistry::new("rcache");
    let db_health = health_registry
        .register("database".to_string(), Duration::from_secs(30))
        .await;
    let http_health = health_registry
        .register("http_server".to_string(), Duration::from_secs(30))
        .await;
    let cache_health = health_registry
        .register("cache_batcher".to_string(), Duration::from_secs(30))
        .await;
    let cert_health = health_registry
        .register("cert_batcher".to_string(), Duration::from_secs(30))
        .await;
    let config_health = health_registry
        .register("config_batcher".to_string(), Duration::from_secs(30))
        .await;
    let cache_consumer_health = if !config.update_on_send {
        Some(
            health_registry
                .register("cache_consumer".to_string(), Duration::from_secs(30))
                .await,
        )
    } else {
        None
    };

    let pool = get_pool_with_config(
        &config.resolved_postgres_dsn()?,
        common_database::PoolConfig {
            max_connections: config.db_max_connections,
            ..Default::default()
        },
    )
    .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    db_health.report_healthy().await;

    let store = CacheStore::new(pool.clone(), config.update_queue_capacity, config.keyhole_template.clone());
    let precomputer = Precomputer::new(
        config.afc_req_url.clone(),
        config.precompute_quota,
        config.vendor_extension_keys(),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    if !config.update_on_send {
        let consumer = Arc::new(TrackedConsumer::new(&config.kafka, &config.consumer, ".*")?);
        let loop_ = CacheConsumerLoop::new(
            consumer,
            store.clone(),
            config.als_topic.clone(),
            config.als_max_age_sec,
            cache_consumer_health,
        );
        let loop_shutdown = shutdown_rx.clone();
        tokio::spawn(loop_.run(loop_shutdown));
        info!("cache-write consumer loop started (update_on_send = false)");
    }

    let state = AppState::new(
        pool,
        store,
        precomputer,
        config.batcher_max_batch,
        health_registry,
    );
    // Batcher health is reported healthy immediately: the worker loops start
    // in `AppState::new` and have no failure mode short of the process dying.
    cache_health.report_healthy().await;
    cert_health.report_healthy().await;
    config_health.report_healthy().await;

    let router = setup_metrics_routes(server::router(state));

    let mut shutdown_rx = shutdown_rx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let bind = format!("{}:{}", config.bind_host, config.rcache_port);
    info!(bind, "listening");
    http_health.report_healthy().await;

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    info!("rcache shut down");
    Ok(())
}
