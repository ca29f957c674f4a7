//! Process-local message store. Used for development runs without a
//! database and as the backend of the service tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use kafka_ui_store::{Backend, BoxFuture, Filters, Message, StoreError};

const NAME: &str = "memory";

#[derive(Debug, thiserror::Error)]
#[error("memory store refused the request")]
pub struct Refused;

// ═══════════════════════════════════════════════════════════════
//  MemoryBackend
// ═══════════════════════════════════════════════════════════════

/// Append-only in-memory collection with a change feed.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

struct Inner {
    records: RwLock<Vec<Message>>,
    changes: broadcast::Sender<Message>,
    /// Remaining `initialize` calls that fail before one succeeds.
    failing_initializations: AtomicU32,
    refuse_connections: AtomicBool,
}

/// Session handle; every session sees the same collection.
#[derive(Debug, Clone, Copy)]
pub struct MemorySession;

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                records: RwLock::new(Vec::new()),
                changes,
                failing_initializations: AtomicU32::new(0),
                refuse_connections: AtomicBool::new(false),
            }),
        }
    }

    /// Make the next `count` initializations fail.
    pub fn fail_initializations(&self, count: u32) {
        self.inner
            .failing_initializations
            .store(count, Ordering::SeqCst);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Persist a message directly, bypassing ingest. The change feed still
    /// fires.
    pub fn push(&self, message: Message) {
        self.write().push(message.clone());
        let _ = self.inner.changes.send(message);
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Message>> {
        match self.inner.records.read() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("memory store read lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Message>> {
        match self.inner.records.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("memory store write lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl Backend for MemoryBackend {
    type Session = MemorySession;

    fn name(&self) -> &'static str {
        NAME
    }

    fn connect(&self) -> BoxFuture<'_, Result<MemorySession, StoreError>> {
        Box::pin(async move {
            if self.inner.refuse_connections.load(Ordering::SeqCst) {
                return Err(StoreError::backend(NAME, Refused));
            }
            Ok(MemorySession)
        })
    }

    fn initialize(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let failing = &self.inner.failing_initializations;
            let remaining = failing.load(Ordering::SeqCst);
            if remaining > 0 {
                failing.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::backend(NAME, Refused));
            }
            Ok(())
        })
    }

    fn distinct_topics<'a>(
        &'a self,
        _session: &'a MemorySession,
    ) -> BoxFuture<'a, Result<Vec<String>, StoreError>> {
        Box::pin(async move {
            let mut topics: Vec<String> = Vec::new();
            for record in self.read().iter() {
                if !topics.contains(&record.topic) {
                    topics.push(record.topic.clone());
                }
            }
            Ok(topics)
        })
    }

    fn insert<'a>(
        &'a self,
        _session: &'a MemorySession,
        message: &'a Message,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.push(message.clone());
            Ok(())
        })
    }

    fn last_messages<'a>(
        &'a self,
        _session: &'a MemorySession,
        filters: &'a Filters,
    ) -> BoxFuture<'a, Result<Vec<Message>, StoreError>> {
        Box::pin(async move {
            let scope = filters.topic_scope();
            let predicates: Vec<_> = filters.native_predicates().collect();
            let mut found: Vec<Message> = self
                .read()
                .iter()
                .filter(|m| scope.is_none_or(|topic| m.topic == topic))
                .filter(|m| predicates.iter().all(|p| p.holds_for(m)))
                .cloned()
                .collect();
            found.sort_by(|a, b| b.offset.cmp(&a.offset));
            found.truncate(filters.limit());
            Ok(found)
        })
    }

    fn listen_changes(
        &self,
        _session: MemorySession,
        changes: mpsc::Sender<Message>,
        stop: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        let mut feed = self.inner.changes.subscribe();
        Box::pin(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    change = feed.recv() => match change {
                        Ok(message) => {
                            if changes.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "memory change feed lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!("memory change feed closed");
        })
    }
}
