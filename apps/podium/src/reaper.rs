use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::messages::ServerMessage;
use crate::registry;
use crate::state::AppState;
use crate::storage::{now_ms, ClientRecord};

/// Newly registered synths are immune to the reaper for this long, measured
/// from `connection_timestamp` only. Reconnects do not restart the clock.
pub const GRACE_PERIOD: Duration = Duration::from_secs(15);

pub const GRACE_PERIOD_MS: u64 = GRACE_PERIOD.as_millis() as u64;

/// Whether a record should be removed, given the union of synth ids some
/// controller still reports as peer-connected. Controllers are never reaped,
/// and staleness of `last_seen` alone never evicts: liveness is defined by
/// controller-reported data channels.
pub fn should_remove(record: &ClientRecord, now: u64, reported: &HashSet<String>) -> bool {
    if record.is_controller {
        return false;
    }
    if now.saturating_sub(record.connection_timestamp) < GRACE_PERIOD_MS {
        return false;
    }
    !reported.contains(&record.id)
}

/// Remove every synth past its grace period that no controller on this
/// instance claims, announcing each departure to controllers. The sweep only
/// judges synths this instance is responsible for (record owned here, or
/// socket attached here): a controller on another instance may be holding
/// its own synths alive, and that is invisible in our WebRTC map.
pub async fn sweep(state: &AppState) -> Result<usize> {
    let now = now_ms();
    let reported = state.reported_synths();
    let records = state.storage.list_client_records().await?;

    let mut removed = 0;
    for record in records {
        let ours =
            record.instance_id == state.instance_id || state.clients.contains_key(&record.id);
        if !ours || !should_remove(&record, now, &reported) {
            continue;
        }
        info!(synth = %record.id, "reaping synth with no controller-reported peer connection");
        state.storage.delete_client_record(&record.id).await?;
        state.clients.remove(&record.id);
        state.abort_drain(&record.id);
        registry::notify_controllers(
            state,
            ServerMessage::ClientDisconnected {
                client_id: record.id.clone(),
            },
        )
        .await;
        counter!("podium_synths_reaped_total", 1);
        removed += 1;
    }

    if removed > 0 {
        debug!(removed, "reaper sweep finished");
    }
    Ok(removed)
}

/// Deferred sweep scheduled at controller activation: fires once the grace
/// period for synths registered around the activation has elapsed.
pub fn schedule_delayed_sweep(state: AppState) {
    tokio::spawn(async move {
        tokio::time::sleep(GRACE_PERIOD).await;
        if let Err(err) = sweep(&state).await {
            warn!(%err, "delayed reaper sweep failed");
        }
    });
}
