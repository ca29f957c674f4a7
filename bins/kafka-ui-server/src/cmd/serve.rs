use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use kafka_ui_storage_memory::MemoryBackend;
use kafka_ui_storage_mongo::MongoBackend;
use kafka_ui_storage_postgres::PostgresBackend;
use kafka_ui_store::{Message, Store};

use crate::config::{DatabaseSettings, ServeArgs, ServerConfig};
use crate::error::ServerError;

/// Capacity of the consumer → store channel.
const INGEST_BUFFER: usize = 1024;

fn build_store(config: &ServerConfig, token: CancellationToken) -> Result<Store, ServerError> {
    let settings = config.service.clone();
    let store = match &config.database {
        DatabaseSettings::Mongo(mongo) => {
            tracing::info!(host = %mongo.host, database = %mongo.database, "using mongo store");
            Store::from_backend(MongoBackend::new(mongo.clone()), token, settings)
        }
        DatabaseSettings::Postgres(pg) => {
            tracing::info!(host = %pg.host, database = %pg.database, "using postgres store");
            Store::from_backend(PostgresBackend::new(pg.clone())?, token, settings)
        }
        DatabaseSettings::Memory => {
            tracing::warn!("using in-memory store, messages are lost on exit");
            Store::from_backend(MemoryBackend::new(), token, settings)
        }
    };
    Ok(store)
}

#[cfg(feature = "kafka")]
fn spawn_consumer(
    config: &ServerConfig,
    ingest: mpsc::Sender<Message>,
    token: CancellationToken,
) -> JoinHandle<()> {
    let settings = config.kafka.clone();
    let consumer_token = token.clone();
    tokio::spawn(async move {
        if let Err(e) = crate::consumer::run(settings, ingest, consumer_token).await {
            tracing::error!(error = %e, "kafka consumer failed");
            token.cancel();
        }
    })
}

#[cfg(not(feature = "kafka"))]
fn spawn_consumer(
    config: &ServerConfig,
    ingest: mpsc::Sender<Message>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tracing::warn!(
        brokers = %config.kafka.brokers,
        "built without the `kafka` feature, nothing is consumed"
    );
    tokio::spawn(async move {
        token.cancelled().await;
        drop(ingest);
    })
}

pub async fn run(args: ServeArgs) -> Result<(), ServerError> {
    tracing::info!("kafka-ui-server starting");

    let config = ServerConfig::load(args)?;

    // --- CancellationToken for graceful shutdown ---
    let token = CancellationToken::new();

    let store = build_store(&config, token.clone())?;

    // --- Store: bootstrap + ingest ---
    let (ingest_tx, ingest_rx) = mpsc::channel(INGEST_BUFFER);
    let mut handles: Vec<JoinHandle<()>> = vec![store.serve(ingest_rx).await?];

    // --- Broker consumer ---
    handles.push(spawn_consumer(&config, ingest_tx, token.clone()));

    // --- API server ---
    let mut api = tokio::spawn(kafka_ui_api_server::run(
        store.clone(),
        config.api.clone(),
        token.clone(),
    ));

    tracing::info!(port = config.api.port, "kafka-ui-server started, press Ctrl+C to stop");

    let api_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("received Ctrl+C, shutting down");
            None
        }
        _ = token.cancelled() => None,
        finished = &mut api => Some(finished),
    };

    token.cancel();
    store.stop().await;

    let api_result = match api_result {
        Some(finished) => finished,
        None => api.await,
    };
    for handle in handles {
        let _ = handle.await;
    }

    match api_result {
        Ok(result) => result?,
        Err(e) => tracing::error!(error = %e, "api task panicked"),
    }

    tracing::info!("kafka-ui-server stopped");
    Ok(())
}
