use thiserror::Error;

#[derive(Error, Debug)]
pub enum SiphonError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("protocol error: {0}")]
    Protocol(#[from] als_model::message::AlsParseError),

    #[error("schema/db format error: {0}")]
    SchemaMismatch(String),
}

impl SiphonError {
    /// True for errors the loop recovers from locally (transient DB, decode
    /// errors); false for errors that should abort the process (schema mismatch
    /// detected at startup).
    pub fn is_transient(&self) -> bool {
        match self {
            SiphonError::Database(e) => common_database::is_transient_error(e),
            SiphonError::Kafka(_) => true,
            SiphonError::Protocol(_) | SiphonError::SchemaMismatch(_) => false,
        }
    }
}
