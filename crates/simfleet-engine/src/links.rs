use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use simfleet_core::Endpoint;

use crate::remote::{Connector, RemoteChannel, RemoteError};

type Slot = Arc<tokio::sync::Mutex<Option<Arc<dyn RemoteChannel>>>>;

/// One shared channel per remote host, keyed by catalog id.
///
/// Connecting to one host never waits on another host's connect.
pub(crate) struct LinkPool {
    connector: Arc<dyn Connector>,
    slots: Mutex<HashMap<u64, Slot>>,
}

impl LinkPool {
    pub(crate) fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, id: u64) -> Slot {
        self.slots.lock().entry(id).or_default().clone()
    }

    /// Returns the live channel for `id`, connecting if there is none.
    pub(crate) async fn connect(
        &self,
        id: u64,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn RemoteChannel>, RemoteError> {
        let slot = self.slot(id);
        let mut current = slot.lock().await;
        if let Some(link) = current.as_ref() {
            if link.is_alive() {
                return Ok(link.clone());
            }
        }
        if let Some(dead) = current.take() {
            dead.close().await;
        }
        let link = self.connector.connect(endpoint).await?;
        *current = Some(link.clone());
        Ok(link)
    }

    /// Drops `link` if it is still the pooled channel for `id`.
    pub(crate) async fn invalidate(&self, id: u64, link: &Arc<dyn RemoteChannel>) {
        let slot = self.slot(id);
        let mut current = slot.lock().await;
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, link)) {
            current.take();
        }
        drop(current);
        link.close().await;
    }

    pub(crate) async fn disconnect(&self, id: u64) {
        let slot = self.slot(id);
        let link = slot.lock().await.take();
        if let Some(link) = link {
            link.close().await;
        }
    }

    pub(crate) async fn close_all(&self) {
        let ids: Vec<u64> = self.slots.lock().keys().copied().collect();
        for id in ids {
            self.disconnect(id).await;
        }
    }
}
