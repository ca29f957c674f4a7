use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::error::StoreError;
use crate::filter::Filters;
use crate::message::Message;
use crate::service::{BackendService, StoreService};
use crate::settings::ServiceSettings;

/// Backend-agnostic store handle shared by the consumer and every
/// websocket connection.
#[derive(Clone)]
pub struct Store {
    service: Arc<dyn StoreService>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    pub fn new(service: Arc<dyn StoreService>) -> Self {
        Self { service }
    }

    pub fn from_backend<B: Backend>(
        backend: B,
        shutdown: CancellationToken,
        settings: ServiceSettings,
    ) -> Self {
        Self::new(Arc::new(BackendService::new(backend, shutdown, settings)))
    }

    pub async fn initialize_context(&self) -> Result<(), StoreError> {
        self.service.initialize_context().await
    }

    pub async fn serve(
        &self,
        ingest: mpsc::Receiver<Message>,
    ) -> Result<JoinHandle<()>, StoreError> {
        self.service.serve(ingest).await
    }

    pub async fn stop(&self) {
        self.service.stop().await
    }

    pub fn topics(
        &self,
        cancel: CancellationToken,
        trigger: mpsc::Receiver<()>,
    ) -> mpsc::Receiver<Message> {
        self.service.topics(cancel, trigger)
    }

    pub fn messages(
        &self,
        cancel: CancellationToken,
        filters: mpsc::Receiver<Filters>,
    ) -> mpsc::Receiver<Message> {
        self.service.messages(cancel, filters)
    }
}
