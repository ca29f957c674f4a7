//! Broker consumer: every record on every subscribed topic goes to the
//! store's ingest channel.

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message as _};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kafka_ui_store::{Message, RawRecord};

use crate::config::KafkaSettings;
use crate::error::ServerError;

fn client_config(settings: &KafkaSettings) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", &settings.brokers)
        .set("group.id", &settings.group_id)
        .set("auto.offset.reset", "earliest")
        .set("enable.auto.commit", "true")
        .set("topic.metadata.refresh.interval.ms", "10000");

    if let Some(tls) = &settings.tls {
        config
            .set("security.protocol", "ssl")
            .set("ssl.ca.location", tls.ca.to_string_lossy())
            .set("ssl.certificate.location", tls.cert.to_string_lossy())
            .set("ssl.key.location", tls.key.to_string_lossy());
    }
    config
}

fn raw_record(message: &BorrowedMessage<'_>) -> RawRecord {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| (header.key.to_string(), header.value.map(<[u8]>::to_vec)))
                .collect()
        })
        .unwrap_or_default();

    RawRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: Some(message.offset()),
        timestamp_ms: message.timestamp().to_millis(),
        headers,
        payload: message.payload().map(<[u8]>::to_vec),
    }
}

/// Consume until `shutdown` fires or the store stops ingesting.
pub async fn run(
    settings: KafkaSettings,
    ingest: mpsc::Sender<Message>,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let consumer: StreamConsumer = client_config(&settings).create()?;
    consumer.subscribe(&[settings.topic_pattern.as_str()])?;
    tracing::info!(
        brokers = %settings.brokers,
        group = %settings.group_id,
        pattern = %settings.topic_pattern,
        tls = settings.tls.is_some(),
        "kafka consumer subscribed"
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = consumer.recv() => match received {
                Ok(record) => {
                    let message = Message::from_record(raw_record(&record));
                    drop(record);
                    tracing::trace!(topic = %message.topic, offset = message.offset, "consumed");
                    if ingest.send(message).await.is_err() {
                        tracing::info!("ingest closed, stopping consumer");
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "kafka receive"),
            },
        }
    }

    tracing::info!("kafka consumer stopped");
    Ok(())
}
