use uuid::Uuid;

/// Boxed driver error carried by [`StoreError::Backend`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{backend}: {source}")]
    Backend {
        backend: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("bootstrap failed after {attempts} attempts: {source}")]
    Bootstrap {
        attempts: u32,
        #[source]
        source: Box<StoreError>,
    },

    #[error("session {0} is not in the pool")]
    SessionNotFound(Uuid),
}

impl StoreError {
    /// Wrap a driver error, tagging it with the backend that produced it.
    pub fn backend(backend: &'static str, source: impl Into<BoxError>) -> Self {
        StoreError::Backend {
            backend,
            source: source.into(),
        }
    }

    /// True for the error returned when bootstrap exhausted its retries.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Bootstrap { .. })
    }
}
