#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("store: {0}")]
    Store(#[from] kafka_ui_store::StoreError),

    #[error("api: {0}")]
    Api(#[from] kafka_ui_api_server::ApiError),

    #[cfg(feature = "kafka")]
    #[error("kafka: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("signal: {0}")]
    Signal(#[from] std::io::Error),
}
