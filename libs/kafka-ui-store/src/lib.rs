//! Message store behind the kafka-ui websocket server.
//!
//! Every consumed broker record is persisted through a [`Backend`]; browser
//! subscribers get topic discovery and filtered historical + live message
//! streams through a [`Store`]. The event loops, session pool and result
//! ordering live in [`BackendService`] and are shared by every backend.

pub mod backend;
pub mod comparator;
pub mod error;
pub mod field;
pub mod filter;
pub mod message;
pub mod pool;
pub mod service;
pub mod settings;
pub mod store;
pub mod topics;

pub use backend::{Backend, BoxFuture};
pub use comparator::{Comparator, NumericComparator, Operator, StringComparator, UnknownOperator};
pub use error::{BoxError, StoreError};
pub use field::{FieldKind, FieldValue, ReservedField};
pub use filter::{ALL_TOPICS, Filter, Filters, NativePredicate};
pub use message::{Changes, Message, RawRecord};
pub use pool::{ConnectionPool, PooledSession};
pub use service::{BackendService, StoreService};
pub use settings::{BootstrapPolicy, ServiceSettings};
pub use store::Store;
