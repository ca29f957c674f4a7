use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use kafka_ui_api_server::ApiSettings;
use kafka_ui_storage_mongo::MongoConfig;
use kafka_ui_storage_postgres::PostgresConfig;
use kafka_ui_store::{BootstrapPolicy, ServiceSettings};

use crate::error::ServerError;

#[derive(Parser)]
#[command(name = "kafka-ui-server", about = "Kafka message browser backend")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Consume the broker, persist messages and serve the websocket API
    Serve(ServeArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    /// Optional TOML file; command line and environment take precedence
    #[arg(long, env = "CONFIG_PATH")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub options: Options,
}

/// Every setting, each optional so the command line, the environment and
/// the TOML file can be layered.
#[derive(Args, Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Options {
    #[arg(long, env = "WS_PORT")]
    pub ws_port: Option<u16>,

    #[arg(long, env = "KAFKA_HOST")]
    pub kafka_host: Option<String>,
    #[arg(long, env = "KAFKA_PORT")]
    pub kafka_port: Option<u16>,
    #[arg(long, env = "KAFKA_GROUP_ID")]
    pub kafka_group_id: Option<String>,
    /// Subscription pattern; a leading `^` makes it a regex
    #[arg(long, env = "KAFKA_TOPIC_PATTERN")]
    pub kafka_topic_pattern: Option<String>,
    #[arg(long, env = "KAFKA_TLS_CA")]
    pub kafka_tls_ca: Option<PathBuf>,
    #[arg(long, env = "KAFKA_TLS_CERT")]
    pub kafka_tls_cert: Option<PathBuf>,
    #[arg(long, env = "KAFKA_TLS_KEY")]
    pub kafka_tls_key: Option<PathBuf>,

    /// mongo | postgres | memory (`rethink` selects the table store)
    #[arg(long, env = "DB_TYPE")]
    pub db_type: Option<String>,
    #[arg(long, env = "DB_HOST")]
    pub db_host: Option<String>,
    #[arg(long, env = "DB_PORT")]
    pub db_port: Option<u16>,
    #[arg(long, env = "DB_NAME")]
    pub db_name: Option<String>,
    #[arg(long, env = "DB_USER")]
    pub db_user: Option<String>,
    #[arg(long, env = "DB_PASSWORD", hide_env_values = true)]
    pub db_password: Option<String>,
    /// Mongo replica set; change streams need one
    #[arg(long, env = "DB_REPLICA_SET")]
    pub db_replica_set: Option<String>,

    #[arg(long, env = "DB_BOOTSTRAP_ATTEMPTS")]
    pub db_bootstrap_attempts: Option<u32>,
    #[arg(long, env = "DB_BOOTSTRAP_DELAY_MS")]
    pub db_bootstrap_delay_ms: Option<u64>,
}

impl Options {
    /// Fill every unset value from `other`.
    pub fn or(self, other: Options) -> Options {
        Options {
            ws_port: self.ws_port.or(other.ws_port),
            kafka_host: self.kafka_host.or(other.kafka_host),
            kafka_port: self.kafka_port.or(other.kafka_port),
            kafka_group_id: self.kafka_group_id.or(other.kafka_group_id),
            kafka_topic_pattern: self.kafka_topic_pattern.or(other.kafka_topic_pattern),
            kafka_tls_ca: self.kafka_tls_ca.or(other.kafka_tls_ca),
            kafka_tls_cert: self.kafka_tls_cert.or(other.kafka_tls_cert),
            kafka_tls_key: self.kafka_tls_key.or(other.kafka_tls_key),
            db_type: self.db_type.or(other.db_type),
            db_host: self.db_host.or(other.db_host),
            db_port: self.db_port.or(other.db_port),
            db_name: self.db_name.or(other.db_name),
            db_user: self.db_user.or(other.db_user),
            db_password: self.db_password.or(other.db_password),
            db_replica_set: self.db_replica_set.or(other.db_replica_set),
            db_bootstrap_attempts: self.db_bootstrap_attempts.or(other.db_bootstrap_attempts),
            db_bootstrap_delay_ms: self.db_bootstrap_delay_ms.or(other.db_bootstrap_delay_ms),
        }
    }

    pub fn load_file(path: &Path) -> Result<Options, ServerError> {
        let content = std::fs::read_to_string(path).map_err(|e| ServerError::Config {
            context: "read",
            detail: format!("'{}': {e}", path.display()),
        })?;
        toml::from_str(&content).map_err(|e| ServerError::Config {
            context: "parse",
            detail: format!("'{}': {e}", path.display()),
        })
    }
}

// ---- Resolved config ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseKind {
    Mongo,
    /// Relational table store; also selected by `rethink`.
    Postgres,
    Memory,
}

impl DatabaseKind {
    fn default_port(self) -> u16 {
        match self {
            DatabaseKind::Mongo | DatabaseKind::Memory => 27017,
            DatabaseKind::Postgres => 5432,
        }
    }
}

impl FromStr for DatabaseKind {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mongo" | "mongodb" => Ok(DatabaseKind::Mongo),
            "postgres" | "postgresql" | "rethink" | "rethinkdb" => Ok(DatabaseKind::Postgres),
            "memory" => Ok(DatabaseKind::Memory),
            _ => Err(ServerError::Config {
                context: "db-type",
                detail: format!("not supported database type: {s}"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub brokers: String,
    pub group_id: String,
    pub topic_pattern: String,
    /// Set only when all three files are configured.
    pub tls: Option<TlsFiles>,
}

#[derive(Debug, Clone)]
pub enum DatabaseSettings {
    Mongo(MongoConfig),
    Postgres(PostgresConfig),
    Memory,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub api: ApiSettings,
    pub kafka: KafkaSettings,
    pub database: DatabaseSettings,
    pub service: ServiceSettings,
}

impl ServerConfig {
    /// Layer command line/env over the optional file, then defaults.
    pub fn load(args: ServeArgs) -> Result<Self, ServerError> {
        let options = match &args.config {
            Some(path) => {
                let file = Options::load_file(path)?;
                tracing::info!(config = %path.display(), "loaded config file");
                args.options.or(file)
            }
            None => args.options,
        };
        Self::resolve(options)
    }

    pub fn resolve(options: Options) -> Result<Self, ServerError> {
        let kind: DatabaseKind = options.db_type.as_deref().unwrap_or("mongo").parse()?;

        let db_host = format!(
            "{}:{}",
            options.db_host.as_deref().unwrap_or("127.0.0.1"),
            options.db_port.unwrap_or(kind.default_port())
        );
        let db_name = options.db_name.unwrap_or_else(|| "softswiss".to_string());

        let database = match kind {
            DatabaseKind::Mongo => DatabaseSettings::Mongo(MongoConfig {
                host: db_host,
                database: db_name,
                replica_set: Some(options.db_replica_set.unwrap_or_else(|| "rs0".to_string()))
                    .filter(|set| !set.is_empty()),
            }),
            DatabaseKind::Postgres => DatabaseSettings::Postgres(PostgresConfig {
                host: db_host,
                database: db_name,
                user: options.db_user.unwrap_or_else(|| "postgres".to_string()),
                password: options.db_password,
                ..Default::default()
            }),
            DatabaseKind::Memory => DatabaseSettings::Memory,
        };

        let tls = match (options.kafka_tls_ca, options.kafka_tls_cert, options.kafka_tls_key) {
            (Some(ca), Some(cert), Some(key)) => Some(TlsFiles { ca, cert, key }),
            (None, None, None) => None,
            _ => {
                tracing::warn!("kafka tls needs ca, cert and key; connecting without tls");
                None
            }
        };

        let kafka = KafkaSettings {
            brokers: format!(
                "{}:{}",
                options.kafka_host.as_deref().unwrap_or("127.0.0.1"),
                options.kafka_port.unwrap_or(9092)
            ),
            group_id: options
                .kafka_group_id
                .unwrap_or_else(|| "kafka-ui-messages-fetch".to_string()),
            topic_pattern: options.kafka_topic_pattern.unwrap_or_else(|| "^.*".to_string()),
            tls,
        };

        let defaults = BootstrapPolicy::default();
        let service = ServiceSettings {
            bootstrap: BootstrapPolicy {
                attempts: options.db_bootstrap_attempts.unwrap_or(defaults.attempts),
                delay: options
                    .db_bootstrap_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.delay),
            },
            ..Default::default()
        };

        let api = ApiSettings {
            port: options.ws_port.unwrap_or(9002),
            ..Default::default()
        };

        Ok(Self {
            api,
            kafka,
            database,
            service,
        })
    }
}
