use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::ids;
use crate::messages::ServerMessage;
use crate::storage::Storage;

/// What the per-socket writer task consumes: frames to serialize, or an
/// explicit close with code and reason.
#[derive(Debug)]
pub enum Outbound {
    Frame(ServerMessage),
    Close { code: u16, reason: String },
}

/// Handle to a locally attached socket. The epoch token ties a socket task to
/// its registration so a replaced socket's teardown cannot unregister its
/// successor.
#[derive(Clone)]
pub struct ClientHandle {
    pub id: String,
    pub epoch: u64,
    pub tx: mpsc::UnboundedSender<Outbound>,
}

/// Per-instance view of the world. The KV is authoritative; everything here
/// may lag and is rebuilt from traffic.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<Storage>,
    pub instance_id: String,
    /// client id -> locally attached socket
    pub clients: Arc<DashMap<String, ClientHandle>>,
    /// client id -> queue-drain task for that socket
    pub drains: Arc<DashMap<String, JoinHandle<()>>>,
    /// controller id -> synth ids that controller reports as peer-connected
    pub webrtc_peers: Arc<DashMap<String, HashSet<String>>>,
    /// controller id -> when it last activated on this instance
    pub activated_at: Arc<DashMap<String, Instant>>,
    /// last change-notification id this instance dispatched
    pub last_notification: Arc<RwLock<Option<String>>>,
    epoch: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(storage: Arc<Storage>, instance_id: String) -> Self {
        Self {
            storage,
            instance_id,
            clients: Arc::new(DashMap::new()),
            drains: Arc::new(DashMap::new()),
            webrtc_peers: Arc::new(DashMap::new()),
            activated_at: Arc::new(DashMap::new()),
            last_notification: Arc::new(RwLock::new(None)),
            epoch: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether the socket identified by `epoch` still owns the handle for
    /// `id`. False once the client was replaced or unregistered.
    pub fn owns(&self, id: &str, epoch: u64) -> bool {
        self.clients
            .get(id)
            .map(|handle| handle.epoch == epoch)
            .unwrap_or(false)
    }

    /// Send a frame to a locally attached client. Returns false when no
    /// socket is attached here or its channel is gone.
    pub fn send_local(&self, id: &str, frame: ServerMessage) -> bool {
        match self.clients.get(id) {
            Some(handle) => handle.tx.send(Outbound::Frame(frame)).is_ok(),
            None => false,
        }
    }

    pub fn local_synth_handles(&self) -> Vec<ClientHandle> {
        self.clients
            .iter()
            .filter(|entry| ids::is_synth_id(entry.key()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Union of synth ids every controller on this instance reports as
    /// peer-connected. The reaper's notion of liveness.
    pub fn reported_synths(&self) -> HashSet<String> {
        let mut union = HashSet::new();
        for entry in self.webrtc_peers.iter() {
            union.extend(entry.value().iter().cloned());
        }
        union
    }

    pub fn abort_drain(&self, id: &str) {
        if let Some((_, task)) = self.drains.remove(id) {
            task.abort();
        }
    }
}
