use envconfig::Envconfig;

pub use common_kafka::config::{ConsumerConfig, KafkaConfig};

#[derive(Envconfig, Clone)]
pub struct Config {
    /// Read only when `update_on_send = false`: rcache then consumes the ALS
    /// topic itself and writes cache entries on the consumer side instead of
    /// waiting on a producer's `/update` call.
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    #[envconfig(from = "ALS_TOPIC", default = "ALS")]
    pub als_topic: String,

    #[envconfig(from = "ALS_MAX_AGE_SEC", default = "1000")]
    pub als_max_age_sec: u64,

    #[envconfig(from = "RCACHE_PORT", default = "3551")]
    pub rcache_port: u16,

    #[envconfig(from = "BIND_HOST", default = "::")]
    pub bind_host: String,

    #[envconfig(from = "RCACHE_POSTGRES_DSN")]
    pub postgres_dsn: String,

    #[envconfig(from = "RCACHE_POSTGRES_PASSWORD_FILE")]
    pub postgres_password_file: Option<String>,

    #[envconfig(from = "RCACHE_DB_MAX_CONNECTIONS", default = "10")]
    pub db_max_connections: u32,

    /// External DB-bootstrap service; not called by this binary, only threaded
    /// through so operators can point deployments at the same value siphon uses.
    #[envconfig(from = "DB_CREATOR_URL", default = "")]
    pub db_creator_url: String,

    #[envconfig(from = "PRECOMPUTE_QUOTA", default = "10")]
    pub precompute_quota: usize,

    #[envconfig(from = "AFC_REQ_URL", default = "")]
    pub afc_req_url: String,

    #[envconfig(from = "RULESETS_URL", default = "")]
    pub rulesets_url: String,

    #[envconfig(from = "CONFIG_RETRIEVAL_URL", default = "")]
    pub config_retrieval_url: String,

    /// Opaque PostGIS SQL fragment interpolated with beam endpoints for
    /// directional invalidation; concrete template is deployment-specific.
    #[envconfig(from = "KEYHOLE_TEMPLATE", default = "")]
    pub keyhole_template: String,

    /// true => cache is written by the producer (siphon/AFC server path);
    /// false => written by rcache itself on the consumer side.
    #[envconfig(from = "UPDATE_ON_SEND", default = "true")]
    pub update_on_send: bool,

    /// Comma-separated vendor-extension keys propagated from a stale response
    /// into a recomputation request.
    #[envconfig(from = "AFC_STATE_VENDOR_EXTENSIONS", default = "")]
    pub afc_state_vendor_extensions: String,

    #[envconfig(from = "BATCHER_MAX_BATCH", default = "1000")]
    pub batcher_max_batch: usize,

    #[envconfig(from = "UPDATE_QUEUE_CAPACITY", default = "10000")]
    pub update_queue_capacity: usize,
}

impl Config {
    pub fn resolved_postgres_dsn(&self) -> anyhow::Result<String> {
        let Some(path) = &self.postgres_password_file else {
            return Ok(self.postgres_dsn.clone());
        };
        let password = std::fs::read_to_string(path)?.trim().to_string();
        Ok(self.postgres_dsn.replacen("{password}", &password, 1))
    }

    pub fn vendor_extension_keys(&self) -> Vec<String> {
        self.afc_state_vendor_extensions
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_kafka_config() -> KafkaConfig {
        KafkaConfig {
            kafka_producer_linger_ms: 20,
            kafka_producer_queue_mib: 400,
            kafka_producer_queue_messages: 10_000_000,
            kafka_message_timeout_ms: 20000,
            kafka_compression_codec: "none".into(),
            kafka_tls: false,
            kafka_hosts: "localhost:9092".into(),
            kafka_topic_metadata_refresh_interval_ms: None,
            kafka_producer_batch_size: None,
            kafka_enable_idempotence: None,
            kafka_max_in_flight: None,
            kafka_retry_backoff_ms: None,
            kafka_socket_timeout_ms: None,
            kafka_metadata_max_age_ms: None,
        }
    }

    fn test_consumer_config() -> ConsumerConfig {
        ConsumerConfig {
            kafka_consumer_group: "rcache".into(),
            kafka_consumer_topic: "ALS".into(),
            kafka_consumer_offset_reset: "earliest".into(),
            kafka_consumer_auto_commit: false,
            kafka_consumer_auto_commit_interval_ms: 5000,
        }
    }

    #[test]
    fn resolved_dsn_passes_through_without_password_file() {
        let config = Config {
            kafka: test_kafka_config(),
            consumer: test_consumer_config(),
            als_topic: "ALS".into(),
            als_max_age_sec: 1000,
            rcache_port: 3551,
            bind_host: "::".into(),
            postgres_dsn: "postgres://localhost/rcache".into(),
            postgres_password_file: None,
            db_max_connections: 10,
            db_creator_url: String::new(),
            precompute_quota: 10,
            afc_req_url: String::new(),
            rulesets_url: String::new(),
            config_retrieval_url: String::new(),
            keyhole_template: String::new(),
            update_on_send: true,
            afc_state_vendor_extensions: String::new(),
            batcher_max_batch: 1000,
            update_queue_capacity: 10000,
        };
        assert_eq!(config.resolved_postgres_dsn().unwrap(), config.postgres_dsn);
    }

    #[test]
    fn vendor_extension_keys_splits_and_trims() {
        let mut config = Config {
            kafka: test_kafka_config(),
            consumer: test_consumer_config(),
            als_topic: "ALS".into(),
            als_max_age_sec: 1000,
            rcache_port: 3551,
            bind_host: "::".into(),
            postgres_dsn: "postgres://localhost/rcache".into(),
            postgres_password_file: None,
            db_max_connections: 10,
            db_creator_url: String::new(),
            precompute_quota: 10,
            afc_req_url: String::new(),
            rulesets_url: String::new(),
            config_retrieval_url: String::new(),
            keyhole_template: String::new(),
            update_on_send: true,
            afc_state_vendor_extensions: String::new(),
            batcher_max_batch: 1000,
            update_queue_capacity: 10000,
        };
        config.afc_state_vendor_extensions = " vendorA ,vendorB, ,vendorC".into();
        assert_eq!(
            config.vendor_extension_keys(),
            vec!["vendorA".to_string(), "vendorB".to_string(), "vendorC".to_string()]
        );
    }
}
