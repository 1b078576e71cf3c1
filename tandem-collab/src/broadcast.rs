//! Ordered fan-out of integrated revisions to every client of a document.
//!
//! One tokio broadcast channel per document. The session actor publishes
//! each revision exactly once, in revision order; every connection holds
//! its own receiver and decides whether the event is its own
//! acknowledgement or another client's update.
//!
//! A receiver that falls more than `capacity` events behind has lost
//! revisions and must be disconnected; the client recovers by reconnecting.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use tandem_core::{ChangeSet, ClientId};

use crate::session::{DocumentHandle, SessionConfig};

/// A revision as it was appended to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionEvent {
    /// Client whose update produced the revision
    pub origin: ClientId,
    pub revision_number: usize,
    pub change_set: ChangeSet,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub events_published: u64,
    pub events_lagged: u64,
    pub active_peers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    events_published: AtomicU64,
    events_lagged: AtomicU64,
}

/// The broadcast channel of a single document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RevisionEvent>>,
    peers: RwLock<HashSet<ClientId>>,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many events a receiver may fall behind before it
    /// starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashSet::new()),
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a client and subscribe it from the next published event.
    pub async fn add_peer(&self, client_id: ClientId) -> broadcast::Receiver<Arc<RevisionEvent>> {
        self.peers.write().await.insert(client_id);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, client_id: &ClientId) -> bool {
        self.peers.write().await.remove(client_id)
    }

    /// Publish to every subscribed receiver, returning how many there were.
    pub fn publish(&self, event: RevisionEvent) -> usize {
        self.atomic_stats
            .events_published
            .fetch_add(1, Ordering::Relaxed);
        // No receivers is not an error: the author may have just left.
        self.sender.send(Arc::new(event)).unwrap_or(0)
    }

    /// Record that a receiver skipped `missed` events.
    pub fn record_lag(&self, missed: u64) {
        self.atomic_stats
            .events_lagged
            .fetch_add(missed, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, client_id: &ClientId) -> bool {
        self.peers.read().await.contains(client_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_published: self.atomic_stats.events_published.load(Ordering::Relaxed),
            events_lagged: self.atomic_stats.events_lagged.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }
}

/// Maps document ids to their running sessions.
///
/// Sessions are started on first use and dropped once their last client
/// has left.
pub struct RoomManager {
    rooms: RwLock<HashMap<Uuid, DocumentHandle>>,
    config: SessionConfig,
}

impl RoomManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// The session for `doc_id`, started if it is not running.
    pub async fn get_or_create(&self, doc_id: Uuid) -> DocumentHandle {
        self.with_room(doc_id, |room| async move { room }).await
    }

    /// Run `f` against the session for `doc_id` while holding the room
    /// table, so the room cannot be removed before `f` completes.
    pub async fn with_room<F, Fut, T>(&self, doc_id: Uuid, f: F) -> T
    where
        F: FnOnce(DocumentHandle) -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&doc_id) {
                return f(room.clone()).await;
            }
        }

        let mut rooms = self.rooms.write().await;
        // Another connection may have created it meanwhile.
        let room = match rooms.get(&doc_id) {
            Some(room) => room.clone(),
            None => {
                log::info!("Starting session for document {doc_id}");
                let room = DocumentHandle::spawn(doc_id, &self.config);
                rooms.insert(doc_id, room.clone());
                room
            }
        };
        f(room).await
    }

    /// Drop the session for `doc_id` if no client is joined.
    pub async fn remove_if_empty(&self, doc_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(doc_id) {
            if room.broadcast().peer_count().await == 0 {
                rooms.remove(doc_id);
                log::info!("Room {doc_id} removed (empty)");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
