use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use kafka_ui_storage_memory::MemoryBackend;
use kafka_ui_store::{
    Backend, BackendService, BootstrapPolicy, BoxFuture, Filter, Filters, Message, Operator,
    ServiceSettings, StoreError, StoreService,
};

const QUIET: Duration = Duration::from_millis(150);
const WAIT: Duration = Duration::from_secs(2);

fn settings() -> ServiceSettings {
    ServiceSettings {
        bootstrap: BootstrapPolicy {
            attempts: 3,
            delay: Duration::from_millis(10),
        },
        ..Default::default()
    }
}

fn message(topic: &str, offset: i64) -> Message {
    Message {
        topic: topic.into(),
        offset,
        timestamp: 1_700_000_000 + offset,
        at: DateTime::<Utc>::from_timestamp(1_700_000_000 + offset, 0).unwrap_or_default(),
        ..Default::default()
    }
}

fn service(backend: &MemoryBackend) -> (BackendService<MemoryBackend>, CancellationToken) {
    let shutdown = CancellationToken::new();
    (
        BackendService::new(backend.clone(), shutdown.clone(), settings()),
        shutdown,
    )
}

async fn next(rx: &mut mpsc::Receiver<Message>) -> Message {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("stream closed")
}

async fn assert_quiet(rx: &mut mpsc::Receiver<Message>) {
    if let Ok(Some(message)) = timeout(QUIET, rx.recv()).await {
        panic!("unexpected message: {message:?}");
    }
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

/// Memory backend whose historical query can be scripted.
struct ScriptedHistory {
    inner: MemoryBackend,
    history: History,
}

enum History {
    /// The query never completes.
    Wedged,
    /// The message is written while the query runs.
    WrittenDuring(Message),
}

impl Backend for ScriptedHistory {
    type Session = <MemoryBackend as Backend>::Session;

    fn name(&self) -> &'static str {
        "scripted"
    }

    fn connect(&self) -> BoxFuture<'_, Result<Self::Session, StoreError>> {
        self.inner.connect()
    }

    fn initialize(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        self.inner.initialize()
    }

    fn distinct_topics<'a>(
        &'a self,
        session: &'a Self::Session,
    ) -> BoxFuture<'a, Result<Vec<String>, StoreError>> {
        self.inner.distinct_topics(session)
    }

    fn insert<'a>(
        &'a self,
        session: &'a Self::Session,
        message: &'a Message,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        self.inner.insert(session, message)
    }

    fn last_messages<'a>(
        &'a self,
        session: &'a Self::Session,
        filters: &'a Filters,
    ) -> BoxFuture<'a, Result<Vec<Message>, StoreError>> {
        match &self.history {
            History::Wedged => {
                Box::pin(std::future::pending::<Result<Vec<Message>, StoreError>>())
            }
            History::WrittenDuring(message) => {
                self.inner.push(message.clone());
                self.inner.last_messages(session, filters)
            }
        }
    }

    fn listen_changes(
        &self,
        session: Self::Session,
        changes: mpsc::Sender<Message>,
        stop: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        self.inner.listen_changes(session, changes, stop)
    }
}

fn orders(size: usize) -> Filters {
    Filters {
        topic: "orders".into(),
        size,
        ..Default::default()
    }
}

// ═══════════════════════════════════════════════════════════════
//  messages
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn history_is_newest_n_oldest_first_then_live() {
    let backend = MemoryBackend::new();
    for offset in 0..12 {
        backend.push(message("orders", offset));
    }
    let (service, _shutdown) = service(&backend);
    let (ingest_tx, ingest_rx) = mpsc::channel(16);
    let _ingest = service.serve(ingest_rx).await.unwrap();

    let cancel = CancellationToken::new();
    let (filters_tx, filters_rx) = mpsc::channel(4);
    let mut rx = service.messages(cancel.clone(), filters_rx);
    filters_tx
        .send(Filters {
            topic: "orders".into(),
            size: 5,
            ..Default::default()
        })
        .await
        .unwrap();

    let mut offsets = Vec::new();
    for _ in 0..5 {
        offsets.push(next(&mut rx).await.offset);
    }
    assert_eq!(offsets, vec![7, 8, 9, 10, 11]);

    ingest_tx.send(message("payments", 1)).await.unwrap();
    ingest_tx.send(message("orders", 12)).await.unwrap();
    let live = next(&mut rx).await;
    assert_eq!((live.topic.as_str(), live.offset), ("orders", 12));
    assert_quiet(&mut rx).await;

    cancel.cancel();
}

#[tokio::test]
async fn history_bound_counts_before_predicates() {
    let backend = MemoryBackend::new();
    for offset in 0..10 {
        let mut m = message("orders", offset);
        if offset % 2 == 0 {
            m.headers.insert("tenant".into(), "acme".into());
        }
        backend.push(m);
    }
    let (service, _shutdown) = service(&backend);

    let (filters_tx, filters_rx) = mpsc::channel(4);
    let mut rx = service.messages(CancellationToken::new(), filters_rx);
    filters_tx
        .send(Filters {
            topic: "orders".into(),
            filters: vec![Filter::new("tenant", "acme", Operator::Eq)],
            size: 4,
        })
        .await
        .unwrap();

    // Newest four are 6..=9; two of them carry the header.
    assert_eq!(next(&mut rx).await.offset, 6);
    assert_eq!(next(&mut rx).await.offset, 8);
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn nothing_flows_before_the_first_filter() {
    let backend = MemoryBackend::new();
    backend.push(message("orders", 0));
    let (service, _shutdown) = service(&backend);

    let (_filters_tx, filters_rx) = mpsc::channel::<Filters>(4);
    let mut rx = service.messages(CancellationToken::new(), filters_rx);
    wait_until(|| service.open_sessions() == 1).await;

    backend.push(message("orders", 1));
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn empty_filter_update_drops_everything() {
    let backend = MemoryBackend::new();
    backend.push(message("orders", 0));
    let (service, _shutdown) = service(&backend);

    let (filters_tx, filters_rx) = mpsc::channel(4);
    let mut rx = service.messages(CancellationToken::new(), filters_rx);
    filters_tx.send(Filters::default()).await.unwrap();
    assert_quiet(&mut rx).await;

    backend.push(message("orders", 1));
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn new_filter_replaces_the_old_one() {
    let backend = MemoryBackend::new();
    backend.push(message("orders", 0));
    backend.push(message("payments", 0));
    let (service, _shutdown) = service(&backend);

    let (filters_tx, filters_rx) = mpsc::channel(4);
    let mut rx = service.messages(CancellationToken::new(), filters_rx);
    filters_tx
        .send(Filters {
            topic: "orders".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(next(&mut rx).await.topic, "orders");

    filters_tx
        .send(Filters {
            topic: "payments".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(next(&mut rx).await.topic, "payments");

    backend.push(message("orders", 1));
    backend.push(message("payments", 1));
    let live = next(&mut rx).await;
    assert_eq!((live.topic.as_str(), live.offset), ("payments", 1));
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn all_topics_query_is_still_matched_by_topic_name() {
    let backend = MemoryBackend::new();
    backend.push(message("orders", 0));
    let (service, _shutdown) = service(&backend);

    let (filters_tx, filters_rx) = mpsc::channel(4);
    let mut rx = service.messages(CancellationToken::new(), filters_rx);
    filters_tx
        .send(Filters {
            topic: "all".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn cancelling_a_subscriber_releases_its_session() {
    let backend = MemoryBackend::new();
    let (service, _shutdown) = service(&backend);

    let cancel = CancellationToken::new();
    let (_filters_tx, filters_rx) = mpsc::channel::<Filters>(4);
    let mut rx = service.messages(cancel.clone(), filters_rx);
    wait_until(|| service.open_sessions() == 1).await;

    cancel.cancel();
    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
    wait_until(|| service.open_sessions() == 0).await;
}

#[tokio::test]
async fn cancel_ends_a_subscriber_blocked_on_a_full_queue() {
    let backend = MemoryBackend::new();
    for offset in 0..40 {
        backend.push(message("orders", offset));
    }
    let (service, _shutdown) = service(&backend);

    let cancel = CancellationToken::new();
    let (filters_tx, filters_rx) = mpsc::channel(4);
    let mut rx = service.messages(cancel.clone(), filters_rx);
    filters_tx.send(orders(40)).await.unwrap();

    // Nobody reads: history fills the queue and the task waits on it.
    tokio::time::sleep(QUIET).await;
    assert_eq!(service.open_sessions(), 1);

    cancel.cancel();
    wait_until(|| service.open_sessions() == 0).await;

    let mut drained = 0;
    while timeout(WAIT, rx.recv()).await.unwrap().is_some() {
        drained += 1;
    }
    assert_eq!(drained, settings().output_buffer);
}

#[tokio::test]
async fn cancel_ends_a_subscriber_waiting_on_the_database() {
    let backend = MemoryBackend::new();
    backend.push(message("orders", 0));
    let service = BackendService::new(
        ScriptedHistory {
            inner: backend,
            history: History::Wedged,
        },
        CancellationToken::new(),
        settings(),
    );

    let cancel = CancellationToken::new();
    let (filters_tx, filters_rx) = mpsc::channel(4);
    let mut rx = service.messages(cancel.clone(), filters_rx);
    filters_tx.send(orders(5)).await.unwrap();
    assert_quiet(&mut rx).await;

    cancel.cancel();
    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
    wait_until(|| service.open_sessions() == 0).await;
}

#[tokio::test]
async fn shutdown_ends_a_subscriber_waiting_on_the_database() {
    let backend = MemoryBackend::new();
    let shutdown = CancellationToken::new();
    let service = BackendService::new(
        ScriptedHistory {
            inner: backend,
            history: History::Wedged,
        },
        shutdown.clone(),
        settings(),
    );

    let (filters_tx, filters_rx) = mpsc::channel(4);
    let mut rx = service.messages(CancellationToken::new(), filters_rx);
    filters_tx.send(orders(5)).await.unwrap();
    assert_quiet(&mut rx).await;

    shutdown.cancel();
    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
    wait_until(|| service.open_sessions() == 0).await;
}

#[tokio::test]
async fn write_during_history_query_is_delivered_once() {
    let backend = MemoryBackend::new();
    backend.push(message("orders", 0));
    let service = BackendService::new(
        ScriptedHistory {
            inner: backend.clone(),
            history: History::WrittenDuring(message("orders", 1)),
        },
        CancellationToken::new(),
        settings(),
    );

    let (filters_tx, filters_rx) = mpsc::channel(4);
    let mut rx = service.messages(CancellationToken::new(), filters_rx);
    filters_tx.send(orders(5)).await.unwrap();

    assert_eq!(next(&mut rx).await.offset, 0);
    assert_eq!(next(&mut rx).await.offset, 1);
    assert_quiet(&mut rx).await;

    backend.push(message("orders", 2));
    assert_eq!(next(&mut rx).await.offset, 2);
}

#[tokio::test]
async fn application_shutdown_closes_every_stream() {
    let backend = MemoryBackend::new();
    let (service, shutdown) = service(&backend);

    let (_filters_tx, filters_rx) = mpsc::channel::<Filters>(4);
    let (_trigger_tx, trigger_rx) = mpsc::channel(4);
    let mut messages = service.messages(CancellationToken::new(), filters_rx);
    let mut topics = service.topics(CancellationToken::new(), trigger_rx);
    wait_until(|| service.open_sessions() == 2).await;

    shutdown.cancel();
    assert!(timeout(WAIT, messages.recv()).await.unwrap().is_none());
    assert!(timeout(WAIT, topics.recv()).await.unwrap().is_none());
    wait_until(|| service.open_sessions() == 0).await;
}

#[tokio::test]
async fn refused_session_closes_the_stream() {
    let backend = MemoryBackend::new();
    backend.refuse_connections(true);
    let (service, _shutdown) = service(&backend);

    let (_filters_tx, filters_rx) = mpsc::channel::<Filters>(4);
    let mut rx = service.messages(CancellationToken::new(), filters_rx);
    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
    assert_eq!(service.open_sessions(), 0);
}

// ═══════════════════════════════════════════════════════════════
//  topics
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn trigger_replays_persisted_topics() {
    let backend = MemoryBackend::new();
    backend.push(message("orders", 0));
    backend.push(message("payments", 0));
    let (service, _shutdown) = service(&backend);

    let (trigger_tx, trigger_rx) = mpsc::channel(4);
    let mut rx = service.topics(CancellationToken::new(), trigger_rx);
    trigger_tx.send(()).await.unwrap();

    let mut names = vec![next(&mut rx).await.topic, next(&mut rx).await.topic];
    names.sort();
    assert_eq!(names, vec!["orders".to_string(), "payments".to_string()]);

    trigger_tx.send(()).await.unwrap();
    next(&mut rx).await;
    next(&mut rx).await;
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn every_topics_subscriber_sees_a_new_topic() {
    let backend = MemoryBackend::new();
    backend.push(message("orders", 0));
    let (service, _shutdown) = service(&backend);

    let (_trigger_a, trigger_a) = mpsc::channel(4);
    let (_trigger_b, trigger_b) = mpsc::channel(4);
    let mut a = service.topics(CancellationToken::new(), trigger_a);
    let mut b = service.topics(CancellationToken::new(), trigger_b);

    let (ingest_tx, ingest_rx) = mpsc::channel(16);
    let _ingest = service.serve(ingest_rx).await.unwrap();

    // Already persisted: not announced again.
    ingest_tx.send(message("orders", 1)).await.unwrap();
    ingest_tx.send(message("payments", 0)).await.unwrap();
    ingest_tx.send(message("payments", 1)).await.unwrap();
    ingest_tx.send(message("__consumer_offsets", 0)).await.unwrap();

    assert_eq!(next(&mut a).await.topic, "payments");
    assert_eq!(next(&mut b).await.topic, "payments");
    assert_quiet(&mut a).await;
    assert_quiet(&mut b).await;
}

#[tokio::test]
async fn closed_trigger_keeps_notifications_flowing() {
    let backend = MemoryBackend::new();
    let (service, _shutdown) = service(&backend);

    let (trigger_tx, trigger_rx) = mpsc::channel::<()>(4);
    let mut rx = service.topics(CancellationToken::new(), trigger_rx);
    drop(trigger_tx);

    let (ingest_tx, ingest_rx) = mpsc::channel(16);
    let _ingest = service.serve(ingest_rx).await.unwrap();
    ingest_tx.send(message("orders", 0)).await.unwrap();
    assert_eq!(next(&mut rx).await.topic, "orders");
}

// ═══════════════════════════════════════════════════════════════
//  serve
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn serve_retries_bootstrap() {
    let backend = MemoryBackend::new();
    backend.fail_initializations(2);
    let (service, _shutdown) = service(&backend);

    let (ingest_tx, ingest_rx) = mpsc::channel(16);
    let _ingest = service.serve(ingest_rx).await.unwrap();
    ingest_tx.send(message("orders", 0)).await.unwrap();
    wait_until(|| backend.len() == 1).await;
}

#[tokio::test]
async fn serve_gives_up_after_the_retry_budget() {
    let backend = MemoryBackend::new();
    backend.fail_initializations(3);
    let (service, _shutdown) = service(&backend);

    let (_ingest_tx, ingest_rx) = mpsc::channel(16);
    let err = service.serve(ingest_rx).await.unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, StoreError::Bootstrap { attempts: 3, .. }));
    assert!(backend.is_empty());
}

#[tokio::test(start_paused = true)]
async fn default_budget_is_ten_attempts_a_second_apart() {
    let backend = MemoryBackend::new();
    backend.fail_initializations(10);
    let service = BackendService::new(
        backend.clone(),
        CancellationToken::new(),
        ServiceSettings::default(),
    );

    let started = tokio::time::Instant::now();
    let (_ingest_tx, ingest_rx) = mpsc::channel(16);
    let err = service.serve(ingest_rx).await.unwrap_err();
    assert!(matches!(err, StoreError::Bootstrap { attempts: 10, .. }));
    // Nine pauses between ten attempts.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(9) && elapsed < Duration::from_secs(10));
    // Exactly ten attempts were consumed.
    assert!(backend.initialize().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn tenth_attempt_may_still_succeed() {
    let backend = MemoryBackend::new();
    backend.fail_initializations(9);
    let service = BackendService::new(
        backend.clone(),
        CancellationToken::new(),
        ServiceSettings::default(),
    );
    let (_ingest_tx, ingest_rx) = mpsc::channel(16);
    assert!(service.serve(ingest_rx).await.is_ok());
}

#[tokio::test]
async fn ingest_stops_when_its_channel_closes() {
    let backend = MemoryBackend::new();
    let (service, _shutdown) = service(&backend);

    let (ingest_tx, ingest_rx) = mpsc::channel(16);
    let ingest = service.serve(ingest_rx).await.unwrap();
    ingest_tx.send(message("orders", 0)).await.unwrap();
    drop(ingest_tx);

    timeout(WAIT, ingest).await.unwrap().unwrap();
    assert_eq!(backend.len(), 1);
    assert_eq!(service.open_sessions(), 0);
}
