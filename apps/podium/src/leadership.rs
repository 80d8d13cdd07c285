use std::time::Duration;

use anyhow::Result;
use metrics::counter;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::messages::ServerMessage;
use crate::state::AppState;
use crate::storage::{now_ms, ChangeNotification, ControllerRecord};

/// A controller that misses heartbeats for this long loses leadership. The
/// single authoritative constant; HTTP responses echo it as `timeoutMs`.
pub const HEARTBEAT_TIMEOUT_MS: u64 = 30_000;

/// Change notifications older than this are discarded on read, so a replayed
/// record after a restart cannot re-announce a long-gone leader.
pub const NOTIFICATION_STALE_MS: u64 = 30_000;

pub const NOTIFY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What `set_active` should do, decided before any write. Heartbeats can
/// only ever refresh the current leader; they never claim or seize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// No live leader and a real activation: the candidate takes over.
    VacantClaim,
    /// Candidate already leads: rewrite the timestamp only.
    Refresh,
    /// A heartbeat from someone who does not currently lead.
    RejectHeartbeat,
    /// A live leader is preempted by another controller's activation.
    Takeover,
}

pub fn is_expired(record: &ControllerRecord, now: u64) -> bool {
    now.saturating_sub(record.timestamp) > HEARTBEAT_TIMEOUT_MS
}

pub fn remaining_ms(record: &ControllerRecord, now: u64) -> u64 {
    HEARTBEAT_TIMEOUT_MS.saturating_sub(now.saturating_sub(record.timestamp))
}

pub fn decide(
    current: Option<&ControllerRecord>,
    candidate: &str,
    is_heartbeat: bool,
    now: u64,
) -> Transition {
    match current {
        Some(record) if !is_expired(record, now) => {
            if record.id == candidate {
                Transition::Refresh
            } else if is_heartbeat {
                Transition::RejectHeartbeat
            } else {
                Transition::Takeover
            }
        }
        // Absent or expired record: an expired leader's own heartbeat is
        // rejected too; it must re-activate.
        _ => {
            if is_heartbeat {
                Transition::RejectHeartbeat
            } else {
                Transition::VacantClaim
            }
        }
    }
}

#[derive(Debug)]
pub struct SetActiveOutcome {
    pub changed: bool,
    pub active: Option<String>,
}

/// Current leader, expiring on read: a record past the heartbeat timeout is
/// deleted and a null notification published before returning None.
pub async fn get_active(state: &AppState) -> Result<Option<ControllerRecord>> {
    let Some(record) = state.storage.get_controller_record().await? else {
        return Ok(None);
    };
    if is_expired(&record, now_ms()) {
        info!(controller = %record.id, "controller lease expired; clearing leadership");
        state.storage.delete_controller_record().await?;
        publish_change(state, None).await?;
        return Ok(None);
    }
    Ok(Some(record))
}

/// Claim, refresh, or be rejected. Publishes a change notification exactly
/// when leadership actually moves; repeated activation by the current leader
/// is idempotent and silent on the notification key.
pub async fn set_active(state: &AppState, id: &str, is_heartbeat: bool) -> Result<SetActiveOutcome> {
    let now = now_ms();
    let current = state.storage.get_controller_record().await?;
    let transition = decide(current.as_ref(), id, is_heartbeat, now);

    match transition {
        Transition::Refresh => {
            state
                .storage
                .put_controller_record(&ControllerRecord {
                    id: id.to_string(),
                    timestamp: now,
                    instance_id: state.instance_id.clone(),
                })
                .await?;
            if !is_heartbeat {
                info!(controller = %id, "active controller re-activated");
            }
            Ok(SetActiveOutcome {
                changed: false,
                active: Some(id.to_string()),
            })
        }
        Transition::RejectHeartbeat => {
            let active = current
                .filter(|record| !is_expired(record, now))
                .map(|record| record.id);
            debug!(candidate = %id, active = ?active, "rejecting heartbeat from non-leader");
            Ok(SetActiveOutcome {
                changed: false,
                active,
            })
        }
        Transition::VacantClaim | Transition::Takeover => {
            if let Transition::Takeover = transition {
                let preempted = current.as_ref().map(|r| r.id.as_str()).unwrap_or("");
                info!(controller = %id, %preempted, "controller preempted leadership");
            } else {
                info!(controller = %id, "controller claimed leadership");
            }
            state
                .storage
                .put_controller_record(&ControllerRecord {
                    id: id.to_string(),
                    timestamp: now,
                    instance_id: state.instance_id.clone(),
                })
                .await?;
            publish_change(state, Some(id.to_string())).await?;
            Ok(SetActiveOutcome {
                changed: true,
                active: Some(id.to_string()),
            })
        }
    }
}

/// Release leadership, permitted only to the current leader. Returns whether
/// anything was cleared.
pub async fn clear(state: &AppState, id: &str) -> Result<bool> {
    let Some(record) = state.storage.get_controller_record().await? else {
        return Ok(false);
    };
    if record.id != id {
        debug!(candidate = %id, active = %record.id, "refusing release by non-leader");
        return Ok(false);
    }
    info!(controller = %id, "controller released leadership");
    state.storage.delete_controller_record().await?;
    publish_change(state, None).await?;
    Ok(true)
}

/// Administrative reset: deletes unconditionally and announces no leader.
pub async fn force_reset(state: &AppState) -> Result<()> {
    warn!("force-resetting controller leadership");
    state.storage.delete_controller_record().await?;
    publish_change(state, None).await?;
    Ok(())
}

/// Write a fresh change notification and dispatch it to this instance's
/// synths immediately. Recording the id first keeps the local poller from
/// delivering the same change twice.
pub async fn publish_change(
    state: &AppState,
    controller_id: Option<String>,
) -> Result<ChangeNotification> {
    let notification = ChangeNotification::new(controller_id);
    state
        .storage
        .put_change_notification(&notification)
        .await?;
    counter!("podium_leadership_changes_total", 1);
    dispatch_local(state, &notification).await;
    Ok(notification)
}

/// Whether a polled notification should be acted on: unseen id, and young
/// enough that it cannot be a stale replay.
pub fn should_dispatch(last_processed: Option<&str>, notification: &ChangeNotification, now: u64) -> bool {
    if now.saturating_sub(notification.timestamp) > NOTIFICATION_STALE_MS {
        return false;
    }
    last_processed != Some(notification.notification_id.as_str())
}

/// Send `active-controller` to every locally attached synth. A failed send
/// falls back to the recipient's KV queue.
pub async fn dispatch_local(state: &AppState, notification: &ChangeNotification) {
    *state.last_notification.write() = Some(notification.notification_id.clone());

    let frame = ServerMessage::ActiveController {
        controller_id: notification.controller_id.clone(),
        timestamp: notification.timestamp,
        notification_id: Some(notification.notification_id.clone()),
    };

    for handle in state.local_synth_handles() {
        if state.send_local(&handle.id, frame.clone()) {
            continue;
        }
        let payload = match serde_json::to_value(&frame) {
            Ok(value) => value,
            Err(_) => return,
        };
        if let Err(err) = state.storage.enqueue_message(&handle.id, payload).await {
            warn!(synth = %handle.id, %err, "failed to queue leadership notification");
        }
    }

    debug!(
        controller = ?notification.controller_id,
        notification = %notification.notification_id,
        "dispatched leadership notification"
    );
}

/// Per-instance poller: picks up leadership changes written by other
/// instances and fans them out to local synths.
pub async fn run_notification_poller(state: AppState) {
    let mut ticker = interval(NOTIFY_POLL_INTERVAL);
    loop {
        ticker.tick().await;
        let notification = match state.storage.get_change_notification().await {
            Ok(Some(notification)) => notification,
            Ok(None) => continue,
            Err(err) => {
                warn!(%err, "failed to poll change notification");
                continue;
            }
        };
        let last = state.last_notification.read().clone();
        if should_dispatch(last.as_deref(), &notification, now_ms()) {
            dispatch_local(&state, &notification).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use crate::state::{ClientHandle, Outbound};
    use crate::storage::Storage;

    fn test_state() -> AppState {
        AppState::new(Arc::new(Storage::in_memory()), "instance-test".into())
    }

    fn record(id: &str, timestamp: u64) -> ControllerRecord {
        ControllerRecord {
            id: id.to_string(),
            timestamp,
            instance_id: "instance-test".into(),
        }
    }

    fn attach_synth(state: &AppState, id: &str) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        state.clients.insert(
            id.to_string(),
            ClientHandle {
                id: id.to_string(),
                epoch: state.next_epoch(),
                tx,
            },
        );
        rx
    }

    fn drain_active_controller(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Option<String>> {
        let mut seen = Vec::new();
        while let Ok(out) = rx.try_recv() {
            if let Outbound::Frame(ServerMessage::ActiveController { controller_id, .. }) = out {
                seen.push(controller_id);
            }
        }
        seen
    }

    #[test]
    fn decision_table_matches_state_machine() {
        let now = 100_000;
        let live = record("controller-a", now - 1_000);
        let expired = record("controller-a", now - HEARTBEAT_TIMEOUT_MS - 1_000);

        // (none) --activate--> LEADING
        assert_eq!(decide(None, "controller-a", false, now), Transition::VacantClaim);
        // a heartbeat never claims vacant leadership
        assert_eq!(
            decide(None, "controller-a", true, now),
            Transition::RejectHeartbeat
        );
        // LEADING --heartbeat(self)--> LEADING
        assert_eq!(
            decide(Some(&live), "controller-a", true, now),
            Transition::Refresh
        );
        // LEADING --heartbeat(other)--> LEADING (other rejected)
        assert_eq!(
            decide(Some(&live), "controller-b", true, now),
            Transition::RejectHeartbeat
        );
        // LEADING --activate(other)--> LEADING' (preempted)
        assert_eq!(
            decide(Some(&live), "controller-b", false, now),
            Transition::Takeover
        );
        // expired leader must re-activate; its heartbeat no longer refreshes
        assert_eq!(
            decide(Some(&expired), "controller-a", true, now),
            Transition::RejectHeartbeat
        );
        assert_eq!(
            decide(Some(&expired), "controller-b", false, now),
            Transition::VacantClaim
        );
    }

    #[test]
    fn remaining_time_clamps_to_zero() {
        let now = 100_000;
        assert_eq!(remaining_ms(&record("c", now - 10_000), now), 20_000);
        assert_eq!(remaining_ms(&record("c", now - 50_000), now), 0);
    }

    #[tokio::test]
    async fn activation_claims_and_publishes() {
        let state = test_state();
        let outcome = set_active(&state, "controller-a", false).await.unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.active.as_deref(), Some("controller-a"));

        let notification = state
            .storage
            .get_change_notification()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notification.controller_id.as_deref(), Some("controller-a"));
    }

    #[tokio::test]
    async fn repeated_activation_is_idempotent_on_the_notification() {
        let state = test_state();
        set_active(&state, "controller-a", false).await.unwrap();
        let first = state
            .storage
            .get_change_notification()
            .await
            .unwrap()
            .unwrap();

        let outcome = set_active(&state, "controller-a", false).await.unwrap();
        assert!(!outcome.changed);

        let second = state
            .storage
            .get_change_notification()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.notification_id, second.notification_id);
    }

    #[tokio::test]
    async fn non_leader_heartbeat_is_rejected_without_notification() {
        let state = test_state();
        set_active(&state, "controller-a", false).await.unwrap();
        let before = state
            .storage
            .get_change_notification()
            .await
            .unwrap()
            .unwrap();

        let outcome = set_active(&state, "controller-b", true).await.unwrap();
        assert!(!outcome.changed);
        assert_eq!(outcome.active.as_deref(), Some("controller-a"));

        let after = state
            .storage
            .get_change_notification()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before.notification_id, after.notification_id);
    }

    #[tokio::test]
    async fn takeover_notifies_local_synths() {
        let state = test_state();
        let mut rx = attach_synth(&state, "synth-1");

        set_active(&state, "controller-a", false).await.unwrap();
        set_active(&state, "controller-b", false).await.unwrap();

        let seen = drain_active_controller(&mut rx);
        assert_eq!(
            seen,
            vec![
                Some("controller-a".to_string()),
                Some("controller-b".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn expiry_on_read_announces_null_leader() {
        let state = test_state();
        let mut rx = attach_synth(&state, "synth-1");

        let stale = record("controller-a", now_ms() - HEARTBEAT_TIMEOUT_MS - 5_000);
        state.storage.put_controller_record(&stale).await.unwrap();

        assert!(get_active(&state).await.unwrap().is_none());
        assert!(state
            .storage
            .get_controller_record()
            .await
            .unwrap()
            .is_none());

        let seen = drain_active_controller(&mut rx);
        assert_eq!(seen, vec![None]);
    }

    #[tokio::test]
    async fn clear_requires_ownership() {
        let state = test_state();
        set_active(&state, "controller-a", false).await.unwrap();

        assert!(!clear(&state, "controller-b").await.unwrap());
        assert!(state
            .storage
            .get_controller_record()
            .await
            .unwrap()
            .is_some());

        assert!(clear(&state, "controller-a").await.unwrap());
        assert!(state
            .storage
            .get_controller_record()
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn heartbeat_refresh_extends_the_lease() {
        let state = test_state();
        set_active(&state, "controller-a", false).await.unwrap();
        let before = state
            .storage
            .get_controller_record()
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let outcome = set_active(&state, "controller-a", true).await.unwrap();
        assert!(!outcome.changed);

        let after = state
            .storage
            .get_controller_record()
            .await
            .unwrap()
            .unwrap();
        assert!(after.timestamp >= before.timestamp);
    }

    #[test]
    fn dispatch_dedups_on_notification_id_and_staleness() {
        let now = now_ms();
        let fresh = ChangeNotification::new(Some("controller-a".into()));
        assert!(should_dispatch(None, &fresh, now));
        assert!(!should_dispatch(Some(&fresh.notification_id), &fresh, now));
        assert!(should_dispatch(Some("other-id"), &fresh, now));

        let mut stale = ChangeNotification::new(None);
        stale.timestamp = now - NOTIFICATION_STALE_MS - 1;
        assert!(!should_dispatch(None, &stale, now));
    }

    #[tokio::test]
    async fn poller_dispatch_path_reaches_disconnected_synths_via_queue() {
        let state = test_state();
        // Synth handle whose receiver is gone: send fails, frame is queued.
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        state.clients.insert(
            "synth-1".into(),
            ClientHandle {
                id: "synth-1".into(),
                epoch: state.next_epoch(),
                tx,
            },
        );

        let notification = ChangeNotification::new(Some("controller-a".into()));
        dispatch_local(&state, &notification).await;

        let queued = state.storage.list_queued("synth-1").await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].1["type"], "active-controller");
        assert_eq!(queued[0].1["controllerId"], "controller-a");
    }
}
