use tokio::sync::broadcast;

/// Name fragment of the broker's internal offsets topic.
pub const OFFSETS_TOPIC_MARKER: &str = "__consumer_offsets";

pub fn is_internal_topic(name: &str) -> bool {
    name.contains(OFFSETS_TOPIC_MARKER)
}

/// Topic names seen so far by the ingest loop.
///
/// Owned by the ingest task alone; subscribers only ever see the
/// notifications it broadcasts.
#[derive(Debug)]
pub struct KnownTopics {
    names: Vec<String>,
    notify: broadcast::Sender<String>,
}

impl KnownTopics {
    pub fn new(notify: broadcast::Sender<String>) -> Self {
        Self {
            names: Vec::new(),
            notify,
        }
    }

    /// Load names already persisted. No notifications are sent.
    pub fn seed(&mut self, names: impl IntoIterator<Item = String>) {
        for name in names {
            if !is_internal_topic(&name) && !self.contains(&name) {
                self.names.push(name);
            }
        }
    }

    /// Record a topic seen on ingest. Returns true and notifies subscribers
    /// only the first time a non-internal name shows up.
    pub fn observe(&mut self, name: &str) -> bool {
        if is_internal_topic(name) || self.contains(name) {
            return false;
        }
        self.names.push(name.to_string());
        tracing::trace!(topic = %name, "send new topic");
        // No receivers is fine: nobody is watching topics right now.
        let _ = self.notify.send(name.to_string());
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
