use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames sent by clients over the `/signal` WebSocket.
///
/// Every frame is a JSON object with a `type` field; verbs are kebab-case and
/// payload fields camelCase. Signaling envelopes (`offer`/`answer`/
/// `ice-candidate`) are relayed verbatim; the server never looks inside
/// `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Register {
        id: String,
        #[serde(default)]
        client_type: Option<String>,
        #[serde(default)]
        is_reconnect: bool,
        #[serde(default)]
        timestamp: Option<u64>,
    },
    Heartbeat {
        #[serde(default)]
        timestamp: Option<u64>,
    },
    ControllerHeartbeat,
    ControllerActivate {
        #[serde(default)]
        id: Option<String>,
    },
    ControllerDeactivate {
        #[serde(default)]
        id: Option<String>,
    },
    ControllerConnections {
        connections: Vec<String>,
    },
    RequestActiveController,
    #[serde(rename_all = "camelCase")]
    Offer {
        target: String,
        data: Value,
        #[serde(default)]
        source: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        target: String,
        data: Value,
        #[serde(default)]
        source: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        target: String,
        data: Value,
        #[serde(default)]
        source: Option<String>,
    },
}

/// Frames sent by the server (or relayed on behalf of a peer).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    RegistrationConfirmed {
        id: String,
        reconnection_count: u32,
        timestamp: u64,
        is_reconnection: bool,
    },
    #[serde(rename = "heartbeat_ack")]
    HeartbeatAck { timestamp: u64 },
    /// Authoritative leadership announcement. `controllerId` is null when no
    /// controller is active. `notificationId` is present when the frame was
    /// produced by a change notification, so receivers can observe dedup.
    #[serde(rename_all = "camelCase")]
    ActiveController {
        controller_id: Option<String>,
        timestamp: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notification_id: Option<String>,
    },
    ClientList { clients: Vec<ClientSummary> },
    #[serde(rename_all = "camelCase")]
    Offer {
        target: String,
        data: Value,
        source: String,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        target: String,
        data: Value,
        source: String,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        target: String,
        data: Value,
        source: String,
    },
    #[serde(rename_all = "camelCase")]
    ClientConnected { client_id: String },
    #[serde(rename_all = "camelCase")]
    ClientReconnected {
        client_id: String,
        reconnection_count: u32,
    },
    #[serde(rename_all = "camelCase")]
    ClientDisconnected { client_id: String },
    Error { message: String },
}

/// One row of a `client-list` frame. `connected` reports whether a socket is
/// attached to this instance; `peerConnected` whether any controller reports
/// an open data channel to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSummary {
    pub id: String,
    pub connected: bool,
    pub last_seen: u64,
    pub connection_timestamp: u64,
    pub reconnection_count: u32,
    pub peer_connected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn register_verb_round_trips() {
        let frame: ClientMessage = serde_json::from_value(json!({
            "type": "register",
            "id": "synth-abc",
            "clientType": "synth",
            "isReconnect": true,
            "timestamp": 42u64,
        }))
        .unwrap();
        match frame {
            ClientMessage::Register {
                id,
                client_type,
                is_reconnect,
                timestamp,
            } => {
                assert_eq!(id, "synth-abc");
                assert_eq!(client_type.as_deref(), Some("synth"));
                assert!(is_reconnect);
                assert_eq!(timestamp, Some(42));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn register_defaults_optional_fields() {
        let frame: ClientMessage =
            serde_json::from_value(json!({"type": "register", "id": "controller-x"})).unwrap();
        match frame {
            ClientMessage::Register {
                is_reconnect,
                timestamp,
                ..
            } => {
                assert!(!is_reconnect);
                assert_eq!(timestamp, None);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn controller_verbs_use_kebab_case() {
        assert!(matches!(
            serde_json::from_value::<ClientMessage>(json!({"type": "controller-activate"}))
                .unwrap(),
            ClientMessage::ControllerActivate { .. }
        ));
        assert!(matches!(
            serde_json::from_value::<ClientMessage>(
                json!({"type": "controller-connections", "connections": ["synth-a"]})
            )
            .unwrap(),
            ClientMessage::ControllerConnections { .. }
        ));
        assert!(matches!(
            serde_json::from_value::<ClientMessage>(json!({"type": "request-active-controller"}))
                .unwrap(),
            ClientMessage::RequestActiveController
        ));
    }

    #[test]
    fn ice_candidate_envelope_round_trips() {
        let frame: ClientMessage = serde_json::from_value(json!({
            "type": "ice-candidate",
            "target": "controller-abc",
            "data": {"candidate": "candidate:0 1 UDP ..."},
        }))
        .unwrap();
        match frame {
            ClientMessage::IceCandidate { target, source, .. } => {
                assert_eq!(target, "controller-abc");
                assert_eq!(source, None);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn heartbeat_ack_keeps_snake_case_name() {
        let out = serde_json::to_value(ServerMessage::HeartbeatAck { timestamp: 7 }).unwrap();
        assert_eq!(out, json!({"type": "heartbeat_ack", "timestamp": 7}));
    }

    #[test]
    fn active_controller_serializes_null_leader() {
        let out = serde_json::to_value(ServerMessage::ActiveController {
            controller_id: None,
            timestamp: 9,
            notification_id: None,
        })
        .unwrap();
        assert_eq!(
            out,
            json!({"type": "active-controller", "controllerId": null, "timestamp": 9})
        );
    }

    #[test]
    fn relayed_offer_carries_stamped_source() {
        let out = serde_json::to_value(ServerMessage::Offer {
            target: "controller-abc".into(),
            data: json!({"sdp": "v=0"}),
            source: "synth-a".into(),
        })
        .unwrap();
        assert_eq!(out["type"], "offer");
        assert_eq!(out["source"], "synth-a");
        assert_eq!(out["target"], "controller-abc");
    }

    #[test]
    fn unknown_verb_fails_to_parse() {
        assert!(serde_json::from_value::<ClientMessage>(json!({"type": "transcode"})).is_err());
    }

    #[test]
    fn client_summary_uses_camel_case() {
        let out = serde_json::to_value(ClientSummary {
            id: "synth-a".into(),
            connected: true,
            last_seen: 1,
            connection_timestamp: 2,
            reconnection_count: 3,
            peer_connected: false,
        })
        .unwrap();
        assert_eq!(out["lastSeen"], 1);
        assert_eq!(out["connectionTimestamp"], 2);
        assert_eq!(out["reconnectionCount"], 3);
        assert_eq!(out["peerConnected"], false);
    }
}
