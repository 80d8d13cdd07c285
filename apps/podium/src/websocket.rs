use std::time::{Duration, Instant};

use anyhow::Result;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, error, warn};

use crate::ids;
use crate::leadership;
use crate::messages::{ClientMessage, ServerMessage};
use crate::reaper;
use crate::registry;
use crate::state::{AppState, Outbound};
use crate::storage::now_ms;

/// Every locally attached socket drains its KV message queue on this cadence.
pub const QUEUE_DRAIN_INTERVAL: Duration = Duration::from_millis(500);

/// GET /signal (Upgrade) - WebSocket endpoint for all client verbs.
pub async fn signal_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    // Writer task: per-socket sends are ordered by this channel.
    tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Frame(frame) => {
                    let json = match serde_json::to_string(&frame) {
                        Ok(json) => json,
                        Err(_) => continue,
                    };
                    if sink.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // The socket binds to a client id on its first successful register verb.
    let mut bound: Option<(String, u64)> = None;

    while let Some(next) = stream.next().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(err) => {
                debug!(%err, "websocket receive error");
                break;
            }
        };
        match msg {
            Message::Text(text) => process_frame(&state, &mut bound, &tx, &text).await,
            Message::Binary(data) => match String::from_utf8(data) {
                // Some clients send JSON in binary frames; accept those too.
                Ok(text) => process_frame(&state, &mut bound, &tx, &text).await,
                Err(_) => debug!("ignoring non-UTF8 binary frame"),
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    if let Some((id, epoch)) = bound {
        // A replaced socket no longer owns the handle; its teardown must not
        // unregister the successor.
        if state.owns(&id, epoch) {
            if let Err(err) = registry::unregister(&state, &id).await {
                warn!(client = %id, %err, "failed to unregister on socket close");
            }
        } else {
            debug!(client = %id, "socket was replaced; skipping unregister");
        }
    }
}

/// Parse and route one inbound frame. Malformed JSON and unknown verbs are
/// logged and dropped; nothing here closes the socket.
async fn process_frame(
    state: &AppState,
    bound: &mut Option<(String, u64)>,
    tx: &mpsc::UnboundedSender<Outbound>,
    text: &str,
) {
    let frame = match serde_json::from_str::<ClientMessage>(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(%err, "dropping unparseable frame");
            return;
        }
    };

    match frame {
        ClientMessage::Register {
            id, is_reconnect, ..
        } => {
            if let Some((old_id, _)) = bound.clone() {
                if old_id == id {
                    // Same socket re-registering: swap the handle quietly
                    // instead of closing ourselves as a duplicate.
                    state.clients.remove(&id);
                    state.abort_drain(&id);
                } else {
                    let _ = registry::unregister(state, &old_id).await;
                }
            }
            match handle_register(state, &id, is_reconnect, tx).await {
                Ok(epoch) => *bound = Some((id, epoch)),
                Err(err) => {
                    error!(client = %id, %err, "registration failed");
                    let _ = tx.send(Outbound::Frame(ServerMessage::Error {
                        message: format!("registration failed: {err}"),
                    }));
                }
            }
        }
        other => {
            let Some((id, _)) = bound.as_ref() else {
                warn!("dropping verb from unregistered socket");
                return;
            };
            if let Err(err) = dispatch(state, id, tx, other).await {
                error!(client = %id, %err, "error handling frame");
                let _ = tx.send(Outbound::Frame(ServerMessage::Error {
                    message: format!("failed to process message: {err}"),
                }));
            }
        }
    }
}

/// Register this socket under `id`, confirm, push the role-specific snapshot
/// (current leader for synths, the synth list for controllers), and start
/// the queue drain for cross-instance messages.
pub async fn handle_register(
    state: &AppState,
    id: &str,
    client_is_reconnect: bool,
    tx: &mpsc::UnboundedSender<Outbound>,
) -> Result<u64> {
    let epoch = state.next_epoch();
    let outcome = registry::register(state, id, epoch, tx, client_is_reconnect).await?;

    let _ = tx.send(Outbound::Frame(ServerMessage::RegistrationConfirmed {
        id: id.to_string(),
        reconnection_count: outcome.record.reconnection_count,
        timestamp: now_ms(),
        is_reconnection: outcome.is_reconnection,
    }));

    if outcome.record.is_controller {
        let clients = registry::list_clients(state).await?;
        let _ = tx.send(Outbound::Frame(ServerMessage::ClientList { clients }));
    } else {
        let active = leadership::get_active(state).await?;
        let _ = tx.send(Outbound::Frame(ServerMessage::ActiveController {
            controller_id: active.map(|record| record.id),
            timestamp: now_ms(),
            notification_id: None,
        }));
    }

    spawn_queue_drain(state.clone(), id.to_string(), epoch, tx.clone());
    Ok(epoch)
}

fn spawn_queue_drain(
    state: AppState,
    id: String,
    epoch: u64,
    tx: mpsc::UnboundedSender<Outbound>,
) {
    let drain_state = state.clone();
    let drain_id = id.clone();
    let task = tokio::spawn(async move {
        let mut ticker = interval(QUEUE_DRAIN_INTERVAL);
        loop {
            ticker.tick().await;
            if !drain_state.owns(&drain_id, epoch) {
                break;
            }
            if let Err(err) = drain_queued(&drain_state, &drain_id, &tx).await {
                warn!(client = %drain_id, %err, "queue drain tick failed");
            }
        }
    });
    if let Some(stale) = state.drains.insert(id, task) {
        stale.abort();
    }
}

/// Deliver every queued frame for `id` in key order, deleting each entry
/// after the send is accepted. Best-effort per tick: anything left over is
/// taken on the next tick.
pub async fn drain_queued(
    state: &AppState,
    id: &str,
    tx: &mpsc::UnboundedSender<Outbound>,
) -> Result<usize> {
    let queued = state.storage.list_queued(id).await?;
    let mut delivered = 0;
    for (ulid, value) in queued {
        let frame: ServerMessage = match serde_json::from_value(value) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(client = %id, %ulid, %err, "discarding unparseable queued message");
                state.storage.delete_queued(id, &ulid).await?;
                continue;
            }
        };
        if tx.send(Outbound::Frame(frame)).is_err() {
            // Socket is gone; leave the rest for the next owner.
            break;
        }
        state.storage.delete_queued(id, &ulid).await?;
        delivered += 1;
    }
    Ok(delivered)
}

/// Route a verb from a registered client. `sender_id` is the id the socket
/// bound at registration; relayed envelopes are stamped with it regardless
/// of what the client claims.
pub async fn dispatch(
    state: &AppState,
    sender_id: &str,
    tx: &mpsc::UnboundedSender<Outbound>,
    frame: ClientMessage,
) -> Result<()> {
    // Any inbound traffic proves the client is alive and extends its
    // record's TTL.
    registry::touch(state, sender_id).await?;

    match frame {
        ClientMessage::Register { .. } => {
            warn!(client = %sender_id, "register handled at session layer; ignoring");
        }
        ClientMessage::Heartbeat { .. } => {
            let _ = tx.send(Outbound::Frame(ServerMessage::HeartbeatAck {
                timestamp: now_ms(),
            }));
        }
        ClientMessage::ControllerHeartbeat => {
            if !ids::is_controller_id(sender_id) {
                warn!(client = %sender_id, "dropping controller-heartbeat from non-controller");
                return Ok(());
            }
            // Refresh the lease when this controller leads; a non-leader's
            // heartbeat is rejected inside set_active.
            let _ = leadership::set_active(state, sender_id, true).await?;
            let clients = registry::list_clients(state).await?;
            let _ = tx.send(Outbound::Frame(ServerMessage::ClientList { clients }));
        }
        ClientMessage::ControllerActivate { .. } => {
            if !ids::is_controller_id(sender_id) {
                warn!(client = %sender_id, "dropping controller-activate from non-controller");
                return Ok(());
            }
            leadership::set_active(state, sender_id, false).await?;
            state
                .activated_at
                .insert(sender_id.to_string(), Instant::now());
            let clients = registry::list_clients(state).await?;
            let _ = tx.send(Outbound::Frame(ServerMessage::ClientList { clients }));
            reaper::schedule_delayed_sweep(state.clone());
        }
        ClientMessage::ControllerDeactivate { .. } => {
            if !ids::is_controller_id(sender_id) {
                return Ok(());
            }
            leadership::clear(state, sender_id).await?;
        }
        ClientMessage::ControllerConnections { connections } => {
            if !ids::is_controller_id(sender_id) {
                warn!(client = %sender_id, "dropping controller-connections from non-controller");
                return Ok(());
            }
            state
                .webrtc_peers
                .insert(sender_id.to_string(), connections.into_iter().collect());
            let settled = state
                .activated_at
                .get(sender_id)
                .map(|at| at.elapsed() >= reaper::GRACE_PERIOD / 2)
                .unwrap_or(false);
            if settled {
                reaper::sweep(state).await?;
            }
        }
        ClientMessage::RequestActiveController => {
            let active = leadership::get_active(state).await?;
            let _ = tx.send(Outbound::Frame(ServerMessage::ActiveController {
                controller_id: active.map(|record| record.id),
                timestamp: now_ms(),
                notification_id: None,
            }));
        }
        ClientMessage::Offer { target, data, .. } => {
            let frame = ServerMessage::Offer {
                target: target.clone(),
                data,
                source: sender_id.to_string(),
            };
            relay(state, &target, frame).await?;
        }
        ClientMessage::Answer { target, data, .. } => {
            let frame = ServerMessage::Answer {
                target: target.clone(),
                data,
                source: sender_id.to_string(),
            };
            relay(state, &target, frame).await?;
        }
        ClientMessage::IceCandidate { target, data, .. } => {
            let frame = ServerMessage::IceCandidate {
                target: target.clone(),
                data,
                source: sender_id.to_string(),
            };
            relay(state, &target, frame).await?;
        }
    }
    Ok(())
}

/// Deliver a signaling frame to its target: in-process when the socket is
/// attached here and open, through the KV queue otherwise.
pub async fn relay(state: &AppState, target: &str, frame: ServerMessage) -> Result<()> {
    if state.send_local(target, frame.clone()) {
        counter!("podium_signals_relayed_total", 1, "path" => "local");
        return Ok(());
    }
    let payload = serde_json::to_value(&frame)?;
    state.storage.enqueue_message(target, payload).await?;
    counter!("podium_signals_relayed_total", 1, "path" => "queued");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::state::ClientHandle;
    use crate::storage::Storage;

    fn test_state() -> AppState {
        AppState::new(Arc::new(Storage::in_memory()), "instance-test".into())
    }

    fn attach(state: &AppState, id: &str) -> mpsc::UnboundedReceiver<Outbound> {
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

    fn try_frame(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Option<ServerMessage> {
        match rx.try_recv() {
            Ok(Outbound::Frame(frame)) => Some(frame),
            _ => None,
        }
    }

    #[tokio::test]
    async fn heartbeat_is_acked() {
        let state = test_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatch(
            &state,
            "synth-a",
            &tx,
            ClientMessage::Heartbeat { timestamp: None },
        )
        .await
        .unwrap();

        match try_frame(&mut rx) {
            Some(ServerMessage::HeartbeatAck { .. }) => {}
            other => panic!("expected heartbeat_ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn offer_is_delivered_locally_with_stamped_source() {
        let state = test_state();
        let mut target_rx = attach(&state, "controller-abc");
        let (tx, _rx) = mpsc::unbounded_channel();

        dispatch(
            &state,
            "synth-a",
            &tx,
            ClientMessage::Offer {
                target: "controller-abc".into(),
                data: serde_json::json!({"sdp": "v=0"}),
                // A forged source must be overwritten by the bound id.
                source: Some("synth-forged".into()),
            },
        )
        .await
        .unwrap();

        match try_frame(&mut target_rx) {
            Some(ServerMessage::Offer { source, target, .. }) => {
                assert_eq!(source, "synth-a");
                assert_eq!(target, "controller-abc");
            }
            other => panic!("expected offer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn offer_to_absent_target_is_queued() {
        let state = test_state();
        let (tx, _rx) = mpsc::unbounded_channel();

        dispatch(
            &state,
            "synth-a",
            &tx,
            ClientMessage::Offer {
                target: "controller-elsewhere".into(),
                data: serde_json::json!({"sdp": "v=0"}),
                source: None,
            },
        )
        .await
        .unwrap();

        let queued = state
            .storage
            .list_queued("controller-elsewhere")
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].1["type"], "offer");
        assert_eq!(queued[0].1["source"], "synth-a");
    }

    #[tokio::test]
    async fn drain_delivers_in_order_and_deletes() {
        let state = test_state();
        for n in 0..3 {
            state
                .storage
                .enqueue_message(
                    "synth-a",
                    serde_json::to_value(ServerMessage::IceCandidate {
                        target: "synth-a".into(),
                        data: serde_json::json!({ "n": n }),
                        source: "controller-abc".into(),
                    })
                    .unwrap(),
                )
                .await
                .unwrap();
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let delivered = drain_queued(&state, "synth-a", &tx).await.unwrap();
        assert_eq!(delivered, 3);
        assert!(state.storage.list_queued("synth-a").await.unwrap().is_empty());

        for expected in 0..3 {
            match try_frame(&mut rx) {
                Some(ServerMessage::IceCandidate { data, .. }) => {
                    assert_eq!(data["n"], expected);
                }
                other => panic!("expected ice-candidate, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn drain_leaves_queue_intact_when_socket_is_gone() {
        let state = test_state();
        state
            .storage
            .enqueue_message(
                "synth-a",
                serde_json::to_value(ServerMessage::HeartbeatAck { timestamp: 1 }).unwrap(),
            )
            .await
            .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let delivered = drain_queued(&state, "synth-a", &tx).await.unwrap();
        assert_eq!(delivered, 0);
        assert_eq!(state.storage.list_queued("synth-a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn controller_connections_updates_map_and_sweeps_after_settling() {
        let state = test_state();
        let (tx, _rx) = mpsc::unbounded_channel();

        // Activated long enough ago that the sweep gate is open.
        state.activated_at.insert(
            "controller-abc".into(),
            Instant::now() - reaper::GRACE_PERIOD,
        );
        state
            .storage
            .put_client_record(&crate::storage::ClientRecord::new(
                "synth-orphan",
                "instance-test",
                now_ms() - reaper::GRACE_PERIOD_MS - 5_000,
            ))
            .await
            .unwrap();

        dispatch(
            &state,
            "controller-abc",
            &tx,
            ClientMessage::ControllerConnections {
                connections: vec!["synth-held".into()],
            },
        )
        .await
        .unwrap();

        assert!(state
            .webrtc_peers
            .get("controller-abc")
            .unwrap()
            .contains("synth-held"));
        assert!(state
            .storage
            .get_client_record("synth-orphan")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn controller_connections_before_settling_does_not_sweep() {
        let state = test_state();
        let (tx, _rx) = mpsc::unbounded_channel();

        state
            .activated_at
            .insert("controller-abc".into(), Instant::now());
        state
            .storage
            .put_client_record(&crate::storage::ClientRecord::new(
                "synth-orphan",
                "instance-test",
                now_ms() - reaper::GRACE_PERIOD_MS - 5_000,
            ))
            .await
            .unwrap();

        dispatch(
            &state,
            "controller-abc",
            &tx,
            ClientMessage::ControllerConnections {
                connections: vec![],
            },
        )
        .await
        .unwrap();

        assert!(state
            .storage
            .get_client_record("synth-orphan")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn controller_verbs_from_synths_are_dropped() {
        let state = test_state();
        let (tx, mut rx) = mpsc::unbounded_channel();

        dispatch(
            &state,
            "synth-a",
            &tx,
            ClientMessage::ControllerActivate { id: None },
        )
        .await
        .unwrap();

        assert!(state
            .storage
            .get_controller_record()
            .await
            .unwrap()
            .is_none());
        assert!(try_frame(&mut rx).is_none());
    }

    #[tokio::test]
    async fn request_active_controller_replies_with_null_when_vacant() {
        let state = test_state();
        let (tx, mut rx) = mpsc::unbounded_channel();

        dispatch(&state, "synth-a", &tx, ClientMessage::RequestActiveController)
            .await
            .unwrap();

        match try_frame(&mut rx) {
            Some(ServerMessage::ActiveController { controller_id, .. }) => {
                assert_eq!(controller_id, None);
            }
            other => panic!("expected active-controller, got {other:?}"),
        }
    }
}
