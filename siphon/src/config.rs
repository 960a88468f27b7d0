use envconfig::Envconfig;

pub use common_kafka::config::{ConsumerConfig, KafkaConfig};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    #[envconfig(from = "ALS_TOPIC", default = "ALS")]
    pub als_topic: String,

    /// Any Kafka topic matching this regex (and not equal to `als_topic`) is treated
    /// as a JSON-log side-channel topic rather than an ALS transaction topic.
    #[envconfig(from = "ALS_TOPIC_EXCLUDE_PATTERN", default = "^(?!ALS$).*")]
    pub als_topic_exclude_pattern: String,

    #[envconfig(from = "ALS_MAX_AGE_SEC", default = "1000")]
    pub als_max_age_sec: u64,

    #[envconfig(from = "ALS_MAX_BUNDLES_PER_BATCH", default = "1000")]
    pub als_max_bundles_per_batch: usize,

    #[envconfig(from = "PROGRESS_REPORT_INTERVAL_SEC", default = "5")]
    pub progress_report_interval_sec: u64,

    #[envconfig(from = "ALS_POSTGRES_DSN")]
    pub postgres_dsn: String,

    #[envconfig(from = "ALS_POSTGRES_PASSWORD_FILE")]
    pub postgres_password_file: Option<String>,

    #[envconfig(from = "ALS_DB_MAX_CONNECTIONS", default = "10")]
    pub db_max_connections: u32,

    #[envconfig(from = "BIND_HOST", default = "::")]
    pub bind_host: String,

    #[envconfig(from = "BIND_PORT", default = "3550")]
    pub bind_port: u16,
}

impl Config {
    /// Reads the Postgres DSN, substituting a password read from
    /// `postgres_password_file` when present (matches the secrets-as-files
    /// convention used by the deployed ALS/rcache databases).
    pub fn resolved_postgres_dsn(&self) -> anyhow::Result<String> {
        let Some(path) = &self.postgres_password_file else {
            return Ok(self.postgres_dsn.clone());
        };
        let password = std::fs::read_to_string(path)?.trim().to_string();
        Ok(self.postgres_dsn.replacen("{password}", &password, 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_dsn_passes_through_without_password_file() {
        ConsumerConfig::set_defaults("siphon", "ALS", false);
        let config = Config {
            kafka: KafkaConfig::init_from_env().unwrap(),
            consumer: ConsumerConfig::init_from_env().unwrap(),
            als_topic: "ALS".into(),
            als_topic_exclude_pattern: "^(?!ALS$).*".into(),
            als_max_age_sec: 1000,
            als_max_bundles_per_batch: 1000,
            progress_report_interval_sec: 5,
            postgres_dsn: "postgres://localhost/als".into(),
            postgres_password_file: None,
            db_max_connections: 10,
            bind_host: "::".into(),
            bind_port: 3550,
        };
        assert_eq!(config.resolved_postgres_dsn().unwrap(), config.postgres_dsn);
    }
}
