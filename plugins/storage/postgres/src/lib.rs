//! Table store on PostgreSQL.
//!
//! Every message is one row of the `kafka` table. PostgreSQL has no change
//! feed a plain connection can subscribe to, so live updates come from
//! polling the `id` sequence: rows with an id above the last one seen are
//! new.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Connection, FromRow, PgConnection, PgPool, Postgres, QueryBuilder};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kafka_ui_store::{
    Backend, BoxFuture, Changes, Filters, Message, NativePredicate, Operator, ReservedField,
    StoreError,
};

const NAME: &str = "postgres";
const MAINTENANCE_DATABASE: &str = "postgres";
const REOPEN_DELAY: Duration = Duration::from_secs(1);

const SELECT_COLUMNS: &str = r#"SELECT id, topic, headers, "offset", "partition", "timestamp", at, size, message FROM kafka"#;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS kafka (
    id          BIGSERIAL PRIMARY KEY,
    topic       TEXT        NOT NULL,
    headers     JSONB       NOT NULL DEFAULT '{}'::jsonb,
    "offset"    BIGINT      NOT NULL,
    "partition" INTEGER     NOT NULL,
    "timestamp" BIGINT      NOT NULL,
    at          TIMESTAMPTZ NOT NULL,
    size        BIGINT      NOT NULL,
    message     JSONB       NOT NULL DEFAULT '{}'::jsonb
)"#;

const CREATE_TOPIC_INDEX: &str = "CREATE INDEX IF NOT EXISTS topic ON kafka (topic)";

// ═══════════════════════════════════════════════════════════════
//  PostgresConfig
// ═══════════════════════════════════════════════════════════════

fn default_host() -> String {
    "127.0.0.1:5432".to_string()
}

fn default_database() -> String {
    "softswiss".to_string()
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    16
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_poll_batch() -> i64 {
    256
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PostgresConfig {
    /// `host` or `host:port`.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Pause between two change polls that found nothing.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Rows fetched per change poll.
    #[serde(default = "default_poll_batch")]
    pub poll_batch: i64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            database: default_database(),
            user: default_user(),
            password: None,
            max_connections: default_max_connections(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_batch: default_poll_batch(),
        }
    }
}

impl PostgresConfig {
    fn connect_options(&self, database: &str) -> Result<PgConnectOptions, StoreError> {
        let mut options = PgConnectOptions::new()
            .database(database)
            .username(&self.user)
            .application_name("kafka-ui");
        options = match self.host.rsplit_once(':') {
            Some((host, port)) => {
                let port = u16::from_str(port).map_err(|e| StoreError::backend(NAME, e))?;
                options.host(host).port(port)
            }
            None => options.host(&self.host),
        };
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        Ok(options)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Rows
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, FromRow)]
struct MessageRow {
    id: i64,
    topic: String,
    headers: Json<HashMap<String, String>>,
    offset: i64,
    partition: i32,
    timestamp: i64,
    at: DateTime<Utc>,
    size: i64,
    message: Json<Map<String, Value>>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            topic: row.topic,
            headers: row.headers.0,
            offset: row.offset,
            partition: row.partition,
            timestamp: row.timestamp,
            at: row.at,
            size: row.size,
            message: row.message.0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  PostgresBackend
// ═══════════════════════════════════════════════════════════════

pub struct PostgresBackend {
    config: PostgresConfig,
    pool: PgPool,
}

impl PostgresBackend {
    /// The pool connects lazily, so the database may not exist yet.
    pub fn new(config: PostgresConfig) -> Result<Self, StoreError> {
        let options = config.connect_options(&config.database)?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy_with(options);
        Ok(Self { config, pool })
    }

    async fn create_database(&self) -> Result<(), StoreError> {
        let options = self.config.connect_options(MAINTENANCE_DATABASE)?;
        let mut conn = PgConnection::connect_with(&options)
            .await
            .map_err(backend_error)?;

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
                .bind(&self.config.database)
                .fetch_one(&mut conn)
                .await
                .map_err(backend_error)?;

        if !exists {
            let statement = format!("CREATE DATABASE {}", quote_identifier(&self.config.database));
            if let Err(e) = sqlx::query(&statement).execute(&mut conn).await {
                tracing::warn!(database = %self.config.database, error = %e, "create database");
            }
        }

        if let Err(e) = conn.close().await {
            tracing::debug!(error = %e, "close maintenance connection");
        }
        Ok(())
    }
}

fn backend_error(e: sqlx::Error) -> StoreError {
    StoreError::backend(NAME, e)
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl Backend for PostgresBackend {
    type Session = PgPool;

    fn name(&self) -> &'static str {
        NAME
    }

    fn connect(&self) -> BoxFuture<'_, Result<PgPool, StoreError>> {
        Box::pin(async move {
            // Fail fast when the server is unreachable.
            let conn = self.pool.acquire().await.map_err(backend_error)?;
            drop(conn);
            Ok(self.pool.clone())
        })
    }

    fn initialize(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            self.create_database().await?;

            if let Err(e) = sqlx::query(CREATE_TABLE).execute(&self.pool).await {
                if is_connection_error(&e) {
                    return Err(backend_error(e));
                }
                tracing::warn!(table = "kafka", error = %e, "create table");
            }
            if let Err(e) = sqlx::query(CREATE_TOPIC_INDEX).execute(&self.pool).await {
                tracing::warn!(index = "topic", error = %e, "create index");
            }

            tracing::info!(database = %self.config.database, table = "kafka", "postgres initialized");
            Ok(())
        })
    }

    fn distinct_topics<'a>(
        &'a self,
        session: &'a PgPool,
    ) -> BoxFuture<'a, Result<Vec<String>, StoreError>> {
        Box::pin(async move {
            sqlx::query_scalar("SELECT DISTINCT topic FROM kafka")
                .fetch_all(session)
                .await
                .map_err(backend_error)
        })
    }

    fn insert<'a>(
        &'a self,
        session: &'a PgPool,
        message: &'a Message,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            sqlx::query(
                r#"INSERT INTO kafka (topic, headers, "offset", "partition", "timestamp", at, size, message)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
            )
            .bind(&message.topic)
            .bind(Json(&message.headers))
            .bind(message.offset)
            .bind(message.partition)
            .bind(message.timestamp)
            .bind(message.at)
            .bind(message.size)
            .bind(Json(&message.message))
            .execute(session)
            .await
            .map_err(backend_error)?;
            Ok(())
        })
    }

    fn last_messages<'a>(
        &'a self,
        session: &'a PgPool,
        filters: &'a Filters,
    ) -> BoxFuture<'a, Result<Vec<Message>, StoreError>> {
        Box::pin(async move {
            let mut query = last_messages_query(filters);
            let rows: Vec<MessageRow> = query
                .build_query_as()
                .fetch_all(session)
                .await
                .map_err(backend_error)?;
            Ok(rows.into_iter().map(Message::from).collect())
        })
    }

    fn listen_changes(
        &self,
        session: PgPool,
        changes: mpsc::Sender<Message>,
        stop: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let batch = self.config.poll_batch.max(1);
        Box::pin(async move {
            let Some(mut last_seen) = high_water_mark(&session, &stop).await else {
                return;
            };
            tracing::debug!(last_seen, "polling kafka table for changes");

            loop {
                let rows = tokio::select! {
                    _ = stop.cancelled() => return,
                    rows = rows_after(&session, last_seen, batch) => rows,
                };
                let rows = match rows {
                    Ok(rows) => rows,
                    Err(e) => {
                        tracing::warn!(error = %e, "poll changes");
                        Vec::new()
                    }
                };

                if rows.is_empty() {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = tokio::time::sleep(poll_interval) => continue,
                    }
                }

                for row in rows {
                    last_seen = last_seen.max(row.id);
                    let change = Changes {
                        old_value: None,
                        new_value: Some(Message::from(row)),
                    };
                    let Some(message) = change.into_new_value() else {
                        continue;
                    };
                    if changes.send(message).await.is_err() {
                        return;
                    }
                }
            }
        })
    }
}

/// Highest row id at subscription time; `None` once `stop` fires.
async fn high_water_mark(pool: &PgPool, stop: &CancellationToken) -> Option<i64> {
    loop {
        let found = tokio::select! {
            _ = stop.cancelled() => return None,
            found = sqlx::query_scalar::<_, i64>("SELECT COALESCE(MAX(id), 0) FROM kafka").fetch_one(pool) => found,
        };
        match found {
            Ok(id) => return Some(id),
            Err(e) => {
                tracing::warn!(error = %e, "open change feed");
                tokio::select! {
                    _ = stop.cancelled() => return None,
                    _ = tokio::time::sleep(REOPEN_DELAY) => {}
                }
            }
        }
    }
}

async fn rows_after(pool: &PgPool, last_seen: i64, batch: i64) -> Result<Vec<MessageRow>, sqlx::Error> {
    let sql = format!("{SELECT_COLUMNS} WHERE id > $1 ORDER BY id LIMIT $2");
    sqlx::query_as(&sql)
        .bind(last_seen)
        .bind(batch)
        .fetch_all(pool)
        .await
}

fn last_messages_query(filters: &Filters) -> QueryBuilder<'_, Postgres> {
    let mut query = QueryBuilder::new(SELECT_COLUMNS);
    query.push(" WHERE TRUE");
    if let Some(topic) = filters.topic_scope() {
        query.push(" AND topic = ").push_bind(topic);
    }
    for predicate in filters.native_predicates() {
        push_condition(&mut query, &predicate);
    }
    query
        .push(r#" ORDER BY "offset" DESC LIMIT "#)
        .push_bind(filters.limit() as i64);
    query
}

fn push_condition(query: &mut QueryBuilder<'_, Postgres>, predicate: &NativePredicate) {
    let Some(op) = sql_operator(predicate.op) else {
        return;
    };
    query
        .push(format!(" AND {} {op} ", column(predicate.field)))
        .push_bind(predicate.value);
}

fn column(field: ReservedField) -> &'static str {
    match field {
        ReservedField::Offset => r#""offset""#,
        ReservedField::Partition => r#""partition""#,
        ReservedField::Timestamp => r#""timestamp""#,
        ReservedField::Size => "size",
        ReservedField::At => "at",
        ReservedField::Topic => "topic",
    }
}

fn sql_operator(op: Operator) -> Option<&'static str> {
    match op {
        Operator::Eq => Some("="),
        Operator::Ne => Some("<>"),
        Operator::Gt => Some(">"),
        Operator::Ge => Some(">="),
        Operator::Lt => Some("<"),
        Operator::Le => Some("<="),
        Operator::IEq | Operator::Contains => None,
    }
}

fn is_connection_error(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use kafka_ui_store::Filter;

    #[test]
    fn query_scopes_topic_and_pushes_down_predicates() {
        let filters = Filters {
            topic: "orders".into(),
            filters: vec![
                Filter::new("offset", "10", Operator::Ge),
                Filter::new("Partition", "2", Operator::Eq),
                Filter::new("tenant", "acme", Operator::Eq),
            ],
            size: 5,
        };
        let query = last_messages_query(&filters);
        assert_eq!(
            query.sql(),
            format!(
                r#"{SELECT_COLUMNS} WHERE TRUE AND topic = $1 AND "offset" >= $2 AND "partition" = $3 ORDER BY "offset" DESC LIMIT $4"#
            )
        );
    }

    #[test]
    fn all_sentinel_queries_every_topic() {
        let filters = Filters {
            topic: "ALL".into(),
            ..Default::default()
        };
        let query = last_messages_query(&filters);
        assert_eq!(
            query.sql(),
            format!(r#"{SELECT_COLUMNS} WHERE TRUE ORDER BY "offset" DESC LIMIT $1"#)
        );
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_identifier("softswiss"), r#""softswiss""#);
        assert_eq!(quote_identifier(r#"we"ird"#), r#""we""ird""#);
    }

    #[test]
    fn host_with_port_is_split() {
        let config = PostgresConfig {
            host: "db.internal:6543".into(),
            ..Default::default()
        };
        let options = config.connect_options("softswiss").unwrap();
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 6543);
        assert_eq!(options.get_database(), Some("softswiss"));
    }

    #[test]
    fn bad_port_is_rejected() {
        let config = PostgresConfig {
            host: "db.internal:port".into(),
            ..Default::default()
        };
        assert!(config.connect_options("softswiss").is_err());
    }
}
