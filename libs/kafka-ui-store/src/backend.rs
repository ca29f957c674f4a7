use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;
use crate::filter::Filters;
use crate::message::Message;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Database-specific operations behind a [`BackendService`](crate::BackendService).
///
/// A backend knows how to talk to one database. Session bookkeeping,
/// ingest, the subscriber event loops and result ordering live in the
/// service and are identical for every backend.
pub trait Backend: Send + Sync + 'static {
    /// One live database session. Cloning must yield a handle to the same
    /// session.
    type Session: Clone + Send + Sync + 'static;

    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    fn connect(&self) -> BoxFuture<'_, Result<Self::Session, StoreError>>;

    /// Create database, collection/table and the topic index when absent.
    /// "Already exists" is logged and ignored; only an unreachable database
    /// is an error.
    fn initialize(&self) -> BoxFuture<'_, Result<(), StoreError>>;

    fn distinct_topics<'a>(
        &'a self,
        session: &'a Self::Session,
    ) -> BoxFuture<'a, Result<Vec<String>, StoreError>>;

    fn insert<'a>(
        &'a self,
        session: &'a Self::Session,
        message: &'a Message,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// The `filters.limit()` highest-offset messages in `filters.topic_scope()`,
    /// in any order. Backends may narrow the query with
    /// [`Filters::native_predicates`] before the limit is applied.
    fn last_messages<'a>(
        &'a self,
        session: &'a Self::Session,
        filters: &'a Filters,
    ) -> BoxFuture<'a, Result<Vec<Message>, StoreError>>;

    /// Build the change listener for one subscriber.
    ///
    /// Anything that must be in place before the subscriber's first query
    /// (e.g. a subscription) is set up before this returns; the returned
    /// future forwards newly written messages into `changes` until `stop`
    /// fires or the receiver is gone.
    fn listen_changes(
        &self,
        session: Self::Session,
        changes: mpsc::Sender<Message>,
        stop: CancellationToken,
    ) -> BoxFuture<'static, ()>;
}
