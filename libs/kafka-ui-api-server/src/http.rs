use std::collections::BTreeSet;
use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kafka_ui_store::Store;

use super::AppState;

// ═══════════════════════════════════════════════════════════════
//  REST: GET /api/topics
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_list_topics(State(state): State<AppState>) -> impl IntoResponse {
    let names = collect_topics(&state.store, state.topics_idle).await;
    axum::Json(names).into_response()
}

/// One-shot topic listing over the discovery stream: trigger a replay and
/// collect names until nothing new arrives for `idle`.
pub async fn collect_topics(store: &Store, idle: Duration) -> Vec<String> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let (trigger_tx, trigger_rx) = mpsc::channel(1);
    let mut topics = store.topics(cancel, trigger_rx);

    if trigger_tx.send(()).await.is_err() {
        return Vec::new();
    }

    let mut names = BTreeSet::new();
    while let Ok(Some(topic)) = tokio::time::timeout(idle, topics.recv()).await {
        names.insert(topic.topic);
    }
    names.into_iter().collect()
}
