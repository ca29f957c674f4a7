use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use futures_util::{StreamExt, TryStreamExt};
use mongodb::bson::{self, Bson, Document, doc};
use mongodb::change_stream::ChangeStream;
use mongodb::change_stream::event::ChangeStreamEvent;
use mongodb::options::{ClientOptions, FullDocumentType, IndexOptions};
use mongodb::{Client, Collection, IndexModel};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kafka_ui_store::{
    Backend, BoxFuture, Changes, Filters, Message, NativePredicate, Operator, StoreError,
};

const NAME: &str = "mongo";
const COLLECTION: &str = "kafka";
const TOPIC_INDEX: &str = "topic";
const REOPEN_DELAY: Duration = Duration::from_secs(1);

// ═══════════════════════════════════════════════════════════════
//  MongoConfig
// ═══════════════════════════════════════════════════════════════

fn default_host() -> String {
    "127.0.0.1:27017".to_string()
}

fn default_database() -> String {
    "softswiss".to_string()
}

fn default_replica_set() -> Option<String> {
    Some("rs0".to_string())
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct MongoConfig {
    /// `host:port` of a replica set member. Change streams need a replica set.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_replica_set")]
    pub replica_set: Option<String>,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            database: default_database(),
            replica_set: default_replica_set(),
        }
    }
}

impl MongoConfig {
    pub fn uri(&self) -> String {
        match &self.replica_set {
            Some(set) => format!("mongodb://{}/?replicaSet={set}", self.host),
            None => format!("mongodb://{}/", self.host),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Document shape
// ═══════════════════════════════════════════════════════════════

fn epoch() -> bson::DateTime {
    bson::DateTime::from_millis(0)
}

/// [`Message`] as stored in the collection: `at` is a native BSON date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredMessage {
    #[serde(default)]
    topic: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    offset: i64,
    #[serde(default)]
    partition: i32,
    #[serde(default)]
    timestamp: i64,
    #[serde(default = "epoch")]
    at: bson::DateTime,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    message: Map<String, Value>,
}

impl From<&Message> for StoredMessage {
    fn from(message: &Message) -> Self {
        Self {
            topic: message.topic.clone(),
            headers: message.headers.clone(),
            offset: message.offset,
            partition: message.partition,
            timestamp: message.timestamp,
            at: bson::DateTime::from_millis(message.at.timestamp_millis()),
            size: message.size,
            message: message.message.clone(),
        }
    }
}

impl From<StoredMessage> for Message {
    fn from(stored: StoredMessage) -> Self {
        Self {
            topic: stored.topic,
            headers: stored.headers,
            offset: stored.offset,
            partition: stored.partition,
            timestamp: stored.timestamp,
            at: DateTime::<Utc>::from_timestamp_millis(stored.at.timestamp_millis())
                .unwrap_or_default(),
            size: stored.size,
            message: stored.message,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  MongoBackend
// ═══════════════════════════════════════════════════════════════

/// Document store: one collection, change streams for live updates.
pub struct MongoBackend {
    config: MongoConfig,
}

impl MongoBackend {
    pub fn new(config: MongoConfig) -> Self {
        Self { config }
    }

    async fn client(&self) -> Result<Client, StoreError> {
        let mut options = ClientOptions::parse(self.config.uri())
            .await
            .map_err(backend_error)?;
        options.app_name = Some("kafka-ui".to_string());
        let client = Client::with_options(options).map_err(backend_error)?;
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(backend_error)?;
        Ok(client)
    }

    fn collection(&self, client: &Client) -> Collection<StoredMessage> {
        client
            .database(&self.config.database)
            .collection(COLLECTION)
    }
}

fn backend_error(e: mongodb::error::Error) -> StoreError {
    StoreError::backend(NAME, e)
}

impl Backend for MongoBackend {
    type Session = Client;

    fn name(&self) -> &'static str {
        NAME
    }

    fn connect(&self) -> BoxFuture<'_, Result<Client, StoreError>> {
        Box::pin(self.client())
    }

    fn initialize(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let client = self.client().await?;
            let database = client.database(&self.config.database);

            if let Err(e) = database.create_collection(COLLECTION).await {
                tracing::warn!(collection = COLLECTION, error = %e, "create collection");
            }

            let index = IndexModel::builder()
                .keys(doc! { "topic": 1 })
                .options(
                    IndexOptions::builder()
                        .name(TOPIC_INDEX.to_string())
                        .build(),
                )
                .build();
            if let Err(e) = self.collection(&client).create_index(index).await {
                tracing::warn!(index = TOPIC_INDEX, error = %e, "create index");
            }

            tracing::info!(database = %self.config.database, collection = COLLECTION, "mongo initialized");
            Ok(())
        })
    }

    fn distinct_topics<'a>(
        &'a self,
        session: &'a Client,
    ) -> BoxFuture<'a, Result<Vec<String>, StoreError>> {
        Box::pin(async move {
            let values = self
                .collection(session)
                .distinct("topic", doc! {})
                .await
                .map_err(backend_error)?;
            Ok(values
                .into_iter()
                .filter_map(|value| match value {
                    Bson::String(topic) => Some(topic),
                    _ => None,
                })
                .collect())
        })
    }

    fn insert<'a>(
        &'a self,
        session: &'a Client,
        message: &'a Message,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.collection(session)
                .insert_one(StoredMessage::from(message))
                .await
                .map_err(backend_error)?;
            Ok(())
        })
    }

    fn last_messages<'a>(
        &'a self,
        session: &'a Client,
        filters: &'a Filters,
    ) -> BoxFuture<'a, Result<Vec<Message>, StoreError>> {
        Box::pin(async move {
            let query = query_document(filters);
            tracing::debug!(%query, limit = filters.limit(), "find last messages");
            let stored: Vec<StoredMessage> = self
                .collection(session)
                .find(query)
                .sort(doc! { "offset": -1 })
                .limit(filters.limit() as i64)
                .await
                .map_err(backend_error)?
                .try_collect()
                .await
                .map_err(backend_error)?;
            Ok(stored.into_iter().map(Message::from).collect())
        })
    }

    fn listen_changes(
        &self,
        session: Client,
        changes: mpsc::Sender<Message>,
        stop: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        let collection = self.collection(&session);
        Box::pin(async move {
            loop {
                let opened = tokio::select! {
                    _ = stop.cancelled() => return,
                    opened = open_change_stream(&collection) => opened,
                };
                let mut stream = match opened {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!(error = %e, "open change stream");
                        tokio::select! {
                            _ = stop.cancelled() => return,
                            _ = tokio::time::sleep(REOPEN_DELAY) => continue,
                        }
                    }
                };

                loop {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        event = stream.next() => match event {
                            Some(Ok(event)) => {
                                let change = Changes {
                                    old_value: None,
                                    new_value: event.full_document.map(Message::from),
                                };
                                let Some(message) = change.into_new_value() else {
                                    continue;
                                };
                                if changes.send(message).await.is_err() {
                                    return;
                                }
                            }
                            Some(Err(e)) => {
                                tracing::warn!(error = %e, "change stream failed, reopening");
                                break;
                            }
                            None => break,
                        },
                    }
                }
            }
        })
    }
}

async fn open_change_stream(
    collection: &Collection<StoredMessage>,
) -> mongodb::error::Result<ChangeStream<ChangeStreamEvent<StoredMessage>>> {
    collection
        .watch()
        .pipeline([doc! {
            "$match": { "operationType": { "$in": ["insert", "update", "replace"] } }
        }])
        .full_document(FullDocumentType::UpdateLookup)
        .await
}

/// Topic scope plus the numeric predicates Mongo can evaluate itself.
fn query_document(filters: &Filters) -> Document {
    let mut query = Document::new();
    if let Some(topic) = filters.topic_scope() {
        query.insert("topic", topic);
    }
    for predicate in filters.native_predicates() {
        let Some(op) = mongo_operator(predicate.op) else {
            continue;
        };
        push_condition(&mut query, &predicate, op);
    }
    query
}

fn push_condition(query: &mut Document, predicate: &NativePredicate, op: &str) {
    let field = predicate.field.name();
    match query.get_document_mut(field) {
        Ok(conditions) => {
            conditions.insert(op, predicate.value);
        }
        Err(_) => {
            let mut conditions = Document::new();
            conditions.insert(op, predicate.value);
            query.insert(field, conditions);
        }
    }
}

fn mongo_operator(op: Operator) -> Option<&'static str> {
    match op {
        Operator::Eq => Some("$eq"),
        Operator::Ne => Some("$ne"),
        Operator::Gt => Some("$gt"),
        Operator::Ge => Some("$gte"),
        Operator::Lt => Some("$lt"),
        Operator::Le => Some("$lte"),
        Operator::IEq | Operator::Contains => None,
    }
}
