use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use common_database::get_pool_with_config;
use common_health::HealthRegistry;
use common_kafka::kafka_consumer::TrackedConsumer;
use envconfig::Envconfig;
use serve_metrics::{serve, setup_metrics_routes};
use siphon::config::{Config, ConsumerConfig};
use siphon::siphon_loop::SiphonHealth;
use siphon::SiphonLoop;
use tracing::level_filters::LevelFilter;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("rdkafka=warn".parse().unwrap()),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

async fn index() -> &'static str {
    "siphon"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    info!("starting siphon...");

    ConsumerConfig::set_defaults("siphon", "ALS", false);
    let config = Config::init_from_env()?;

    info!(
        als_topic = config.als_topic,
        exclude_pattern = config.als_topic_exclude_pattern,
        max_age_sec = config.als_max_age_sec,
        "configuration loaded"
    );

    let health_registry = HealthRegistry::new("siphon");
    let loop_health = SiphonHealth {
        kafka_consumer: health_registry
            .register("kafka_consumer".to_string(), Duration::from_secs(30))
            .await,
        database: health_registry
            .register("database".to_string(), Duration::from_secs(30))
            .await,
        bundle_assembler: health_registry
            .register("bundle_assembler".to_string(), Duration::from_secs(30))
            .await,
    };

    let bind = format!("{}:{}", config.bind_host, config.bind_port);
    let health_router = Router::new()
        .route("/", get(index))
        .route(
            "/healthz",
            get({
                let registry = health_registry.clone();
                move || {
                    let registry = registry.clone();
                    async move { registry.get_status() }
                }
            }),
        );
    let health_router = setup_metrics_routes(health_router);
    tokio::task::spawn(async move {
        serve(health_router, &bind)
            .await
            .expect("failed to start health/metrics server");
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let pool = get_pool_with_config(
        &config.resolved_postgres_dsn()?,
        common_database::PoolConfig {
            max_connections: config.db_max_connections,
            ..Default::default()
        },
    )
    .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let consumer = Arc::new(TrackedConsumer::new(&config.kafka, &config.consumer, ".*")?);

    let siphon_loop = SiphonLoop::new(
        consumer,
        pool,
        config.als_topic.clone(),
        &config.als_topic_exclude_pattern,
        config.als_max_age_sec,
        config.als_max_bundles_per_batch,
        Duration::from_secs(config.progress_report_interval_sec),
        Some(loop_health),
    )?;

    siphon_loop.run(shutdown_rx).await?;

    info!("siphon shut down");
    Ok(())
}
