use std::time::Duration;

/// Retry budget for schema bootstrap.
#[derive(Debug, Clone)]
pub struct BootstrapPolicy {
    pub attempts: u32,
    /// Pause between two attempts.
    pub delay: Duration,
}

impl Default for BootstrapPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(1),
        }
    }
}

/// Tunables of a backend service.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub bootstrap: BootstrapPolicy,
    /// Capacity of each subscriber's output queue.
    pub output_buffer: usize,
    /// Capacity of the queue between a change listener and its subscriber.
    pub live_buffer: usize,
    /// Capacity of the new-topic broadcast; slower subscribers skip ahead.
    pub notify_buffer: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            bootstrap: BootstrapPolicy::default(),
            output_buffer: 16,
            live_buffer: 64,
            notify_buffer: 64,
        }
    }
}
