use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, BoxFuture};
use crate::error::StoreError;
use crate::filter::Filters;
use crate::message::Message;
use crate::pool::{ConnectionPool, PooledSession};
use crate::settings::ServiceSettings;
use crate::topics::KnownTopics;

/// The uniform store contract every backend service offers.
pub trait StoreService: Send + Sync {
    /// Idempotent schema/index bootstrap.
    fn initialize_context(&self) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Bootstrap with retries, then start the long-lived ingest task
    /// draining `ingest`. An exhausted retry budget is returned as
    /// [`StoreError::Bootstrap`] and no task is started.
    fn serve(
        &self,
        ingest: mpsc::Receiver<Message>,
    ) -> BoxFuture<'_, Result<JoinHandle<()>, StoreError>>;

    /// Release backend-owned resources.
    fn stop(&self) -> BoxFuture<'_, ()>;

    /// Topic discovery. Every value sent on `trigger` replays the persisted
    /// topic names; topics first seen on ingest are pushed as they arrive.
    fn topics(
        &self,
        cancel: CancellationToken,
        trigger: mpsc::Receiver<()>,
    ) -> mpsc::Receiver<Message>;

    /// Historical query plus live updates, both filtered through the most
    /// recent value received on `filters`.
    fn messages(
        &self,
        cancel: CancellationToken,
        filters: mpsc::Receiver<Filters>,
    ) -> mpsc::Receiver<Message>;
}

// ═══════════════════════════════════════════════════════════════
//  BackendService
// ═══════════════════════════════════════════════════════════════

/// [`StoreService`] implementation over any [`Backend`].
pub struct BackendService<B: Backend> {
    shared: Arc<Shared<B>>,
}

struct Shared<B: Backend> {
    backend: B,
    pool: Arc<ConnectionPool<B::Session>>,
    new_topics: broadcast::Sender<String>,
    shutdown: CancellationToken,
    settings: ServiceSettings,
}

impl<B: Backend> Clone for BackendService<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: Backend> BackendService<B> {
    /// `shutdown` is the process-wide token: firing it ends ingest and every
    /// subscriber task.
    pub fn new(backend: B, shutdown: CancellationToken, settings: ServiceSettings) -> Self {
        let (new_topics, _) = broadcast::channel(settings.notify_buffer.max(1));
        Self {
            shared: Arc::new(Shared {
                backend,
                pool: Arc::new(ConnectionPool::new()),
                new_topics,
                shutdown,
                settings,
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    /// Sessions currently held by running tasks.
    pub fn open_sessions(&self) -> usize {
        self.shared.pool.len()
    }

    async fn bootstrap(&self) -> Result<(), StoreError> {
        let policy = &self.shared.settings.bootstrap;
        let attempts = policy.attempts.max(1);
        let backend = self.shared.backend.name();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.shared.backend.initialize().await {
                Ok(()) => {
                    tracing::info!(backend, attempt, "store initialized");
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    tracing::warn!(backend, attempt, error = %e, "store initialization failed, retrying");
                    tokio::time::sleep(policy.delay).await;
                }
                Err(e) => {
                    return Err(StoreError::Bootstrap {
                        attempts,
                        source: Box::new(e),
                    });
                }
            }
        }
    }
}

impl<B: Backend> Shared<B> {
    /// Drive `work` until it completes or either token fires. `None` means
    /// the subscription is over.
    async fn until_stopped<T>(
        &self,
        cancel: &CancellationToken,
        work: impl Future<Output = T>,
    ) -> Option<T> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            _ = self.shutdown.cancelled() => None,
            out = work => Some(out),
        }
    }

    /// Hand `message` to the subscriber. False when the subscriber is gone
    /// or cancelled while the queue was full.
    async fn deliver(
        &self,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<Message>,
        message: Message,
    ) -> bool {
        matches!(self.until_stopped(cancel, tx.send(message)).await, Some(Ok(())))
    }

    async fn open_session(&self) -> Result<PooledSession<B::Session>, StoreError> {
        let session = self.backend.connect().await?;
        Ok(PooledSession::acquire(&self.pool, session))
    }

    /// Open a session for a subscriber task. Failures are logged; the
    /// caller then ends, which closes the subscriber's queue.
    async fn subscriber_session(
        &self,
        purpose: &'static str,
    ) -> Option<(PooledSession<B::Session>, B::Session)> {
        let guard = match self.open_session().await {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!(backend = self.backend.name(), purpose, error = %e, "open session");
                return None;
            }
        };
        match guard.session() {
            Ok(session) => Some((guard, session)),
            Err(e) => {
                tracing::warn!(backend = self.backend.name(), purpose, error = %e, "lookup session");
                None
            }
        }
    }
}

impl<B: Backend> StoreService for BackendService<B> {
    fn initialize_context(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        self.shared.backend.initialize()
    }

    fn serve(
        &self,
        ingest: mpsc::Receiver<Message>,
    ) -> BoxFuture<'_, Result<JoinHandle<()>, StoreError>> {
        Box::pin(async move {
            self.bootstrap().await?;
            let guard = self.shared.open_session().await?;
            let shared = Arc::clone(&self.shared);
            Ok(tokio::spawn(ingest_loop(shared, guard, ingest)))
        })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            tracing::info!(
                backend = self.shared.backend.name(),
                open_sessions = self.shared.pool.len(),
                "store stopped"
            );
        })
    }

    fn topics(
        &self,
        cancel: CancellationToken,
        mut trigger: mpsc::Receiver<()>,
    ) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(self.shared.settings.output_buffer.max(1));
        let shared = Arc::clone(&self.shared);
        // Subscribe before returning so no topic announced after this call
        // is missed.
        let mut notifications = shared.new_topics.subscribe();

        tokio::spawn(async move {
            let Some((_guard, session)) = shared.subscriber_session("topics").await else {
                return;
            };
            let mut trigger_open = true;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("close topics subscription: subscriber context closed");
                        break;
                    }
                    _ = shared.shutdown.cancelled() => {
                        tracing::info!("close topics subscription: application context closed");
                        break;
                    }
                    notice = notifications.recv() => match notice {
                        Ok(topic) => {
                            tracing::trace!(%topic, "get new topic");
                            if !shared.deliver(&cancel, &tx, Message::for_topic(topic)).await {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "topic notifications lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    start = trigger.recv(), if trigger_open => match start {
                        Some(()) => {
                            let query = shared.backend.distinct_topics(&session);
                            let names = match shared.until_stopped(&cancel, query).await {
                                Some(Ok(names)) => names,
                                Some(Err(e)) => {
                                    tracing::warn!(error = %e, "distinct topic");
                                    continue;
                                }
                                None => break,
                            };
                            for name in names {
                                if !shared.deliver(&cancel, &tx, Message::for_topic(name)).await {
                                    return;
                                }
                            }
                        }
                        None => trigger_open = false,
                    },
                }
            }
        });

        rx
    }

    fn messages(
        &self,
        cancel: CancellationToken,
        mut filters: mpsc::Receiver<Filters>,
    ) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(self.shared.settings.output_buffer.max(1));
        let shared = Arc::clone(&self.shared);

        tokio::spawn(async move {
            let Some((_guard, session)) = shared.subscriber_session("messages").await else {
                return;
            };

            let (live_tx, mut live_rx) = mpsc::channel(shared.settings.live_buffer.max(1));
            let listener_stop = cancel.child_token();
            let _listener_guard = listener_stop.clone().drop_guard();
            tokio::spawn(
                shared
                    .backend
                    .listen_changes(session.clone(), live_tx, listener_stop),
            );

            // Nothing matches until the subscriber sends its first filter.
            let mut active = Filters::default();
            let mut flushed = Flushed::default();
            let mut filters_open = true;
            let mut live_open = true;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("close messages subscription: subscriber context closed");
                        break;
                    }
                    _ = shared.shutdown.cancelled() => {
                        tracing::info!("close messages subscription: application context closed");
                        break;
                    }
                    update = filters.recv(), if filters_open => match update {
                        Some(update) => {
                            active = update;
                            flushed.clear();
                            if !forward_history(&shared, &cancel, &session, &active, &tx, &mut flushed).await {
                                break;
                            }
                        }
                        None => filters_open = false,
                    },
                    change = live_rx.recv(), if live_open => match change {
                        Some(message) => {
                            if !message.matches(&active) || flushed.covers(&message) {
                                continue;
                            }
                            if !shared.deliver(&cancel, &tx, message).await {
                                break;
                            }
                        }
                        None => live_open = false,
                    },
                }
            }
        });

        rx
    }
}

/// Replay persisted topics, then persist everything arriving on `ingest`.
async fn ingest_loop<B: Backend>(
    shared: Arc<Shared<B>>,
    guard: PooledSession<B::Session>,
    mut ingest: mpsc::Receiver<Message>,
) {
    let backend = shared.backend.name();
    let session = match guard.session() {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(backend, error = %e, "ingest session lost");
            return;
        }
    };

    let mut known = KnownTopics::new(shared.new_topics.clone());
    match shared.backend.distinct_topics(&session).await {
        Ok(names) => known.seed(names),
        Err(e) => tracing::warn!(backend, error = %e, "distinct topic"),
    }
    tracing::info!(backend, topics = known.len(), "ingest started");

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            next = ingest.recv() => {
                let Some(message) = next else {
                    tracing::info!(backend, "ingest channel closed");
                    break;
                };

                known.observe(&message.topic);

                match shared.backend.insert(&session, &message).await {
                    Ok(()) => tracing::debug!(
                        backend,
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        "insert document"
                    ),
                    Err(e) => tracing::warn!(
                        backend,
                        topic = %message.topic,
                        offset = message.offset,
                        error = %e,
                        "insert message error"
                    ),
                }
            }
        }
    }

    tracing::info!(backend, "ingest stopped");
}

/// Highest offset already delivered from history, per topic and partition.
/// Live changes at or below it were part of the history and are skipped.
#[derive(Debug, Default)]
struct Flushed(HashMap<(String, i32), i64>);

impl Flushed {
    fn record(&mut self, message: &Message) {
        let mark = self
            .0
            .entry((message.topic.clone(), message.partition))
            .or_insert(message.offset);
        *mark = (*mark).max(message.offset);
    }

    fn covers(&self, message: &Message) -> bool {
        self.0
            .get(&(message.topic.clone(), message.partition))
            .is_some_and(|mark| message.offset <= *mark)
    }

    fn clear(&mut self) {
        self.0.clear();
    }
}

/// Run the historical query for `filters` and forward the matching results
/// oldest-first. Returns false when the subscriber is gone or cancelled.
async fn forward_history<B: Backend>(
    shared: &Shared<B>,
    cancel: &CancellationToken,
    session: &B::Session,
    filters: &Filters,
    tx: &mpsc::Sender<Message>,
    flushed: &mut Flushed,
) -> bool {
    let query = shared.backend.last_messages(session, filters);
    let mut messages = match shared.until_stopped(cancel, query).await {
        Some(Ok(messages)) => messages,
        Some(Err(e)) => {
            tracing::warn!(backend = shared.backend.name(), error = %e, "get last messages");
            return true;
        }
        None => return false,
    };

    // Newest N first, then presented oldest-first.
    messages.sort_by(|a, b| b.offset.cmp(&a.offset));
    messages.truncate(filters.limit());
    messages.reverse();

    for message in messages.into_iter().filter(|m| m.matches(filters)) {
        flushed.record(&message);
        if !shared.deliver(cancel, tx, message).await {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &str, partition: i32, offset: i64) -> Message {
        Message {
            topic: topic.into(),
            partition,
            offset,
            ..Default::default()
        }
    }

    #[test]
    fn flushed_marks_are_per_topic_and_partition() {
        let mut flushed = Flushed::default();
        flushed.record(&message("orders", 0, 4));
        flushed.record(&message("orders", 0, 2));

        assert!(flushed.covers(&message("orders", 0, 4)));
        assert!(flushed.covers(&message("orders", 0, 1)));
        assert!(!flushed.covers(&message("orders", 0, 5)));
        assert!(!flushed.covers(&message("orders", 1, 0)));
        assert!(!flushed.covers(&message("payments", 0, 0)));

        flushed.clear();
        assert!(!flushed.covers(&message("orders", 0, 4)));
    }
}
