use std::time::Duration;

use anyhow::Result;
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::ids;
use crate::messages::{ClientSummary, ServerMessage};
use crate::state::{AppState, ClientHandle, Outbound};
use crate::storage::{now_ms, ClientRecord};

/// How long a duplicate registration waits for the replaced socket's close to
/// run before installing the new handle.
pub const REPLACE_SETTLE: Duration = Duration::from_millis(100);

pub struct RegisterOutcome {
    pub record: ClientRecord,
    pub is_reconnection: bool,
}

/// Register a client under `id` for the socket identified by `epoch`.
///
/// A live local socket under the same id is closed with 1000/"Replaced" and
/// its handle removed before the new one is installed, so the old socket's
/// teardown finds nothing to unregister. A prior KV record (from this or any
/// other instance) marks the client as reconnecting whether or not it said
/// so itself.
pub async fn register(
    state: &AppState,
    id: &str,
    epoch: u64,
    tx: &mpsc::UnboundedSender<Outbound>,
    client_is_reconnect: bool,
) -> Result<RegisterOutcome> {
    if let Some((_, previous)) = state.clients.remove(id) {
        info!(client = %id, "replacing existing socket for re-registered client");
        let _ = previous.tx.send(Outbound::Close {
            code: 1000,
            reason: "Replaced".to_string(),
        });
        state.abort_drain(id);
        tokio::time::sleep(REPLACE_SETTLE).await;
    }

    let now = now_ms();
    let prior = state.storage.get_client_record(id).await?;
    let is_reconnection = prior.is_some() || client_is_reconnect;
    let record = match prior {
        Some(ref prior) => ClientRecord::reconnected(prior, &state.instance_id, now),
        None => ClientRecord::new(id, &state.instance_id, now),
    };
    state.storage.put_client_record(&record).await?;

    state.clients.insert(
        id.to_string(),
        ClientHandle {
            id: id.to_string(),
            epoch,
            tx: tx.clone(),
        },
    );

    if record.is_controller {
        state
            .storage
            .put_controller_entry(id, &state.instance_id)
            .await?;
        counter!("podium_registrations_total", 1, "role" => "controller");
    } else {
        counter!("podium_registrations_total", 1, "role" => "synth");
        let frame = if is_reconnection {
            ServerMessage::ClientReconnected {
                client_id: id.to_string(),
                reconnection_count: record.reconnection_count,
            }
        } else {
            ServerMessage::ClientConnected {
                client_id: id.to_string(),
            }
        };
        notify_controllers(state, frame).await;
    }

    debug!(
        client = %id,
        reconnection = is_reconnection,
        reconnection_count = record.reconnection_count,
        "client registered"
    );

    Ok(RegisterOutcome {
        record,
        is_reconnection,
    })
}

/// Remove a client: record, directory entry, local handle, drain task. Synth
/// departures are announced to every controller.
pub async fn unregister(state: &AppState, id: &str) -> Result<()> {
    state.clients.remove(id);
    state.abort_drain(id);
    state.storage.delete_client_record(id).await?;

    if ids::is_controller_id(id) {
        state.storage.delete_controller_entry(id).await?;
        state.webrtc_peers.remove(id);
        state.activated_at.remove(id);
    } else {
        notify_controllers(
            state,
            ServerMessage::ClientDisconnected {
                client_id: id.to_string(),
            },
        )
        .await;
    }

    debug!(client = %id, "client unregistered");
    Ok(())
}

/// Refresh `last_seen` for a client, preserving its `connection_timestamp`.
/// A client heartbeating past its record's TTL gets a fresh record. The
/// rewrite extends the record TTL, and the directory entry's along with it
/// for controllers.
pub async fn touch(state: &AppState, id: &str) -> Result<ClientRecord> {
    let now = now_ms();
    let record = match state.storage.get_client_record(id).await? {
        Some(mut record) => {
            record.last_seen = now;
            record
        }
        None => ClientRecord::new(id, &state.instance_id, now),
    };
    state.storage.put_client_record(&record).await?;
    if record.is_controller {
        state
            .storage
            .put_controller_entry(id, &record.instance_id)
            .await?;
    }
    Ok(record)
}

/// The synth list controllers see: every non-controller record, annotated
/// with local-socket attachment and controller-reported peer connectivity.
/// Listing never evicts anyone; that is the reaper's job.
pub async fn list_clients(state: &AppState) -> Result<Vec<ClientSummary>> {
    let reported = state.reported_synths();
    let mut clients: Vec<ClientSummary> = state
        .storage
        .list_client_records()
        .await?
        .into_iter()
        .filter(|record| !record.is_controller)
        .map(|record| ClientSummary {
            connected: state.clients.contains_key(&record.id),
            peer_connected: reported.contains(&record.id),
            last_seen: record.last_seen,
            connection_timestamp: record.connection_timestamp,
            reconnection_count: record.reconnection_count,
            id: record.id,
        })
        .collect();
    clients.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(clients)
}

/// Deliver a frame to every controller in the directory: locally when the
/// socket is here, queued through the KV otherwise.
pub async fn notify_controllers(state: &AppState, frame: ServerMessage) {
    let controller_ids = match state.storage.list_controller_ids().await {
        Ok(ids) => ids,
        Err(err) => {
            warn!(%err, "failed to list controllers for notification");
            return;
        }
    };

    for controller_id in controller_ids {
        if state.send_local(&controller_id, frame.clone()) {
            continue;
        }
        let payload = match serde_json::to_value(&frame) {
            Ok(value) => value,
            Err(err) => {
                warn!(%err, "failed to serialize controller notification");
                return;
            }
        };
        if let Err(err) = state.storage.enqueue_message(&controller_id, payload).await {
            warn!(controller = %controller_id, %err, "failed to queue controller notification");
        }
    }
}
