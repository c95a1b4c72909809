//! Space registry
//!
//! The registry owns every open [`SpaceStorage`] in the process, keyed by
//! universal id. It is created by the composition root and shared by `Arc`;
//! there is no global instance.
//!
//! Each space gets a forwarder task that republishes its status events on
//! the registry's bus and logs every transition. Destroying a space ends its
//! stream, which in turn ends the forwarder.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::identity::UniversalId;
use crate::storage::{ConnectionPool, StoreError, StoreResult};
use crate::store::{SpaceStorage, StatusEvent};

struct SpaceEntry {
    store: Arc<SpaceStorage>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    /// Set once the space is torn down; guards reconnects against teardown
    destroyed: tokio::sync::Mutex<bool>,
}

impl SpaceEntry {
    fn new(store: Arc<SpaceStorage>, forwarder: JoinHandle<()>) -> Self {
        Self {
            store,
            forwarder: Mutex::new(Some(forwarder)),
            destroyed: tokio::sync::Mutex::new(false),
        }
    }

    /// Destroy the space and wait for its forwarder to drain
    ///
    /// Only the first call tears down; later ones return at once.
    async fn destroy(&self) {
        let mut destroyed = self.destroyed.lock().await;
        self.teardown(&mut destroyed).await;
    }

    async fn teardown(&self, destroyed: &mut bool) {
        if std::mem::replace(destroyed, true) {
            return;
        }
        self.store.destroy().await;
        let forwarder = self.forwarder.lock().take();
        if let Some(forwarder) = forwarder {
            if let Err(e) = forwarder.await {
                error!(universal_id = %self.store.universal_id(), error = %e, "[nbstore] status forwarder failed");
            }
        }
    }
}

type SpaceCell = Arc<OnceCell<Arc<SpaceEntry>>>;

/// Process-wide cache of open spaces
pub struct StoreRegistry {
    config: StoreConfig,
    pool: ConnectionPool,
    spaces: tokio::sync::Mutex<HashMap<UniversalId, SpaceCell>>,
    bus: Mutex<Option<broadcast::Sender<StatusEvent>>>,
    closed: AtomicBool,
}

impl StoreRegistry {
    pub fn new(config: StoreConfig) -> Self {
        let (bus, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            pool: ConnectionPool::new(),
            spaces: tokio::sync::Mutex::new(HashMap::new()),
            bus: Mutex::new(Some(bus)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Get the space for `id`, opening and connecting it on first use
    ///
    /// Concurrent callers for the same id share one construction. A failed
    /// construction is not cached; the next call tries again. A cached
    /// space that was closed is reconnected. A space evicted while this call
    /// was waiting on it is never reconnected; the lookup starts over.
    pub async fn ensure(&self, id: &UniversalId) -> StoreResult<Arc<SpaceStorage>> {
        loop {
            let cell = {
                let mut spaces = self.spaces.lock().await;
                // Checked under the map lock so shutdown cannot drain in between
                if self.is_closed() {
                    return Err(StoreError::RegistryClosed);
                }
                Arc::clone(spaces.entry(id.clone()).or_default())
            };

            let entry = match cell.get() {
                Some(entry) => Arc::clone(entry),
                None => Arc::clone(cell.get_or_try_init(|| self.open_space(id)).await?),
            };

            let mut destroyed = entry.destroyed.lock().await;
            if *destroyed {
                continue;
            }
            if !self.is_mapped(id, &cell).await {
                // Evicted before its cell was filled, so nobody tore it down
                entry.teardown(&mut destroyed).await;
                debug!(universal_id = %id, "evicted space discarded");
                continue;
            }

            // Closed spaces stay cached; bring them back on demand
            entry.store.connect().await?;
            return Ok(Arc::clone(&entry.store));
        }
    }

    async fn is_mapped(&self, id: &UniversalId, cell: &SpaceCell) -> bool {
        let spaces = self.spaces.lock().await;
        spaces.get(id).is_some_and(|mapped| Arc::ptr_eq(mapped, cell))
    }

    /// The cached space for `id`, without opening it
    pub async fn get(&self, id: &UniversalId) -> Option<Arc<SpaceStorage>> {
        let spaces = self.spaces.lock().await;
        spaces
            .get(id)
            .and_then(|cell| cell.get())
            .map(|entry| Arc::clone(&entry.store))
    }

    /// Ids of every cached space
    pub async fn cached_ids(&self) -> Vec<UniversalId> {
        let spaces = self.spaces.lock().await;
        spaces
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Disconnect the space for `id` but keep it cached
    ///
    /// Other users of the same space may still hold it; the shared connection
    /// closes once nobody references it. Closing an unknown id is a no-op.
    pub async fn close(&self, id: &UniversalId) -> StoreResult<()> {
        match self.get(id).await {
            Some(store) => store.disconnect().await,
            None => {
                debug!(universal_id = %id, "close for unknown space ignored");
                Ok(())
            }
        }
    }

    /// Destroy the space for `id` and evict it
    pub async fn destroy(&self, id: &UniversalId) {
        let cell = self.spaces.lock().await.remove(id);
        if let Some(entry) = cell.as_ref().and_then(|cell| cell.get()) {
            entry.destroy().await;
            info!(universal_id = %id, "[nbstore] space destroyed");
        }
    }

    /// Status events of every space, current and future
    ///
    /// After shutdown the subscription is already closed.
    pub fn subscribe(&self) -> StatusSubscription {
        let receiver = match self.bus.lock().as_ref() {
            Some(bus) => bus.subscribe(),
            None => broadcast::channel(1).1,
        };
        StatusSubscription {
            receiver: Some(receiver),
        }
    }

    /// Destroy every cached space and close the event bus
    ///
    /// Spaces are torn down concurrently; failures are logged. Later calls
    /// are no-ops, and `ensure` fails with `RegistryClosed` from now on.
    pub async fn shutdown(&self) {
        let cells: Vec<SpaceCell> = {
            let mut spaces = self.spaces.lock().await;
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            spaces.drain().map(|(_, cell)| cell).collect()
        };
        let entries: Vec<Arc<SpaceEntry>> =
            cells.iter().filter_map(|cell| cell.get().cloned()).collect();

        info!(spaces = entries.len(), "[nbstore] shutting down store registry");
        join_all(entries.iter().map(|entry| entry.destroy())).await;

        self.bus.lock().take();
        info!("[nbstore] store registry shut down");
    }

    async fn open_space(&self, id: &UniversalId) -> StoreResult<Arc<SpaceEntry>> {
        let store = Arc::new(SpaceStorage::new(
            id.identity().clone(),
            &self.pool,
            &self.config.data_dir,
            self.config.event_capacity,
        ));

        // Subscribe before connecting so no connect event is missed
        let events = store.subscribe();
        let bus = self.bus.lock().clone().ok_or(StoreError::RegistryClosed)?;
        let forwarder = tokio::spawn(forward_events(events, bus));

        if let Err(e) = store.connect().await {
            store.destroy().await;
            if let Err(join_error) = forwarder.await {
                error!(universal_id = %id, error = %join_error, "[nbstore] status forwarder failed");
            }
            return Err(e);
        }

        debug!(universal_id = %id, "space opened");
        Ok(Arc::new(SpaceEntry::new(store, forwarder)))
    }
}

/// Republish one space's events on the registry bus until the space ends
async fn forward_events(
    mut events: broadcast::Receiver<StatusEvent>,
    bus: broadcast::Sender<StatusEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                info!(
                    status = %event.status,
                    space_type = %event.space_type,
                    space_id = %event.space_id,
                    storage = %event.storage,
                    "[nbstore] status changed"
                );
                if let Some(details) = &event.error {
                    error!(space_id = %event.space_id, error = %details, "[nbstore] connection error");
                }
                // No subscribers is fine
                let _ = bus.send(event);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "status forwarder lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Handle onto the registry's status bus
///
/// Dropping the handle unsubscribes as well.
pub struct StatusSubscription {
    receiver: Option<broadcast::Receiver<StatusEvent>>,
}

impl StatusSubscription {
    /// Next event, or `None` once unsubscribed or the bus is closed
    ///
    /// Events missed by a lagging subscriber are skipped.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "status subscriber lagged");
                }
                Err(RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    pub fn unsubscribe(&mut self) {
        self.receiver = None;
    }

    pub fn is_subscribed(&self) -> bool {
        self.receiver.is_some()
    }
}
