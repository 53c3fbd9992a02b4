//! Offer/answer/ICE relay between two participants of one call

use std::sync::Arc;
use tracing::debug;

use super::manager::{Audience, CallSessionManager, Delivery};
use crate::service::presence::PresenceView;
use crate::{Error, Result};
use huddle_proto::{ServerMessage, SignalingEnvelope};

/// Stateless router for negotiation envelopes
///
/// Validates sender and addressee against the room's active roster and
/// resolves the addressee's call connection through the presence view.
/// Trickle ICE is forwarded for the lifetime of the call with no cap.
#[derive(Clone)]
pub struct SignalingRelay {
    presence: Arc<dyn PresenceView>,
}

impl SignalingRelay {
    pub fn new(presence: Arc<dyn PresenceView>) -> Self {
        Self { presence }
    }

    /// Route `envelope` to the addressee's call connection
    ///
    /// `envelope.from` must already be the server-verified sender.
    pub fn relay(&self, calls: &CallSessionManager, envelope: SignalingEnvelope) -> Result<Delivery> {
        if envelope.from == envelope.to {
            return Err(Error::InvalidInput(
                "Cannot send signaling messages to yourself".to_string(),
            ));
        }

        let session = calls
            .session(&envelope.room_id)
            .ok_or_else(|| Error::NotFound("No active call in this room".to_string()))?;
        if !session.is_participant(&envelope.from) {
            return Err(Error::NotFound(
                "You are not a participant of this call".to_string(),
            ));
        }
        let target = session.participant(&envelope.to).ok_or_else(|| {
            Error::NotFound(format!("{} is not a participant of this call", envelope.to))
        })?;

        let connection_id = target.connection_id.clone();
        if !self
            .presence
            .connections_of(&envelope.to)
            .contains(&connection_id)
        {
            return Err(Error::TransportUnavailable(format!(
                "{} is no longer connected",
                envelope.to
            )));
        }

        debug!(
            room_id = %envelope.room_id,
            from = %envelope.from,
            to = %envelope.to,
            kind = envelope.payload.kind(),
            "Relaying signaling envelope"
        );

        Ok(Delivery::to(
            Audience::Connection(connection_id),
            ServerMessage::relayed(envelope),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CallType, ConnectionId, RoomId, UserId};
    use crate::service::call::Caller;
    use crate::service::presence::MockPresenceView;
    use huddle_proto::{IceCandidate, SessionDescription, SignalPayload};
    use std::collections::HashSet;

    fn caller(user: &str, connection: &str) -> Caller {
        Caller::new(
            UserId::from(user),
            ConnectionId::from(connection),
            Arc::new(HashSet::from([RoomId::from("7")])),
        )
    }

    fn call_with_u1_u2() -> CallSessionManager {
        let mut calls = CallSessionManager::new(8);
        calls
            .start_call(&caller("u1", "c1"), &RoomId::from("7"), CallType::Video)
            .unwrap();
        calls.join_call(&caller("u2", "c2"), &RoomId::from("7")).unwrap();
        calls
    }

    fn presence_with(connections: Vec<(&'static str, &'static str)>) -> Arc<dyn PresenceView> {
        let mut presence = MockPresenceView::new();
        presence.expect_connections_of().returning(move |user| {
            connections
                .iter()
                .filter(|(u, _)| *u == user.as_str())
                .map(|(_, c)| ConnectionId::from(*c))
                .collect()
        });
        Arc::new(presence)
    }

    fn offer(from: &str, to: &str) -> SignalingEnvelope {
        SignalingEnvelope {
            room_id: RoomId::from("7"),
            from: UserId::from(from),
            to: UserId::from(to),
            payload: SignalPayload::Offer(SessionDescription::offer("v=0 P")),
        }
    }

    #[test]
    fn test_relay_forwards_verbatim_to_call_connection() {
        let calls = call_with_u1_u2();
        let relay = SignalingRelay::new(presence_with(vec![("u2", "c2"), ("u2", "c2-tab")]));

        let delivery = relay.relay(&calls, offer("u1", "u2")).unwrap();

        assert_eq!(
            delivery.audience,
            vec![Audience::Connection(ConnectionId::from("c2"))]
        );
        assert_eq!(
            delivery.message,
            ServerMessage::WebrtcOffer {
                room_id: RoomId::from("7"),
                from_user_id: UserId::from("u1"),
                payload: SessionDescription::offer("v=0 P"),
            }
        );
    }

    #[test]
    fn test_relay_from_outsider_is_not_found() {
        let calls = call_with_u1_u2();
        let relay = SignalingRelay::new(presence_with(vec![("u2", "c2")]));

        let err = relay.relay(&calls, offer("u3", "u2")).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_relay_to_outsider_is_not_found() {
        let calls = call_with_u1_u2();
        let relay = SignalingRelay::new(presence_with(vec![]));

        let err = relay.relay(&calls, offer("u1", "u3")).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_relay_without_call_is_not_found() {
        let calls = CallSessionManager::new(8);
        let relay = SignalingRelay::new(presence_with(vec![]));

        assert!(matches!(
            relay.relay(&calls, offer("u1", "u2")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_relay_to_closed_connection_is_transport_unavailable() {
        let calls = call_with_u1_u2();
        // u2 is only reachable on another tab; the call connection is gone
        let relay = SignalingRelay::new(presence_with(vec![("u2", "c2-tab")]));

        assert!(matches!(
            relay.relay(&calls, offer("u1", "u2")),
            Err(Error::TransportUnavailable(_))
        ));
    }

    #[test]
    fn test_relay_to_self_is_rejected() {
        let calls = call_with_u1_u2();
        let relay = SignalingRelay::new(presence_with(vec![("u1", "c1")]));

        assert!(matches!(
            relay.relay(&calls, offer("u1", "u1")),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_trickle_candidates_keep_flowing() {
        let calls = call_with_u1_u2();
        let relay = SignalingRelay::new(presence_with(vec![("u1", "c1")]));

        for i in 0..50u16 {
            let envelope = SignalingEnvelope {
                room_id: RoomId::from("7"),
                from: UserId::from("u2"),
                to: UserId::from("u1"),
                payload: SignalPayload::IceCandidate(IceCandidate {
                    candidate: format!("candidate:{i} 1 udp 1 10.0.0.{i} 5000 typ host"),
                    sdp_mid: Some("0".to_string()),
                    sdp_mline_index: Some(0),
                    username_fragment: None,
                }),
            };
            let delivery = relay.relay(&calls, envelope).unwrap();
            assert_eq!(delivery.message.name(), "webrtc_ice_candidate");
        }
    }
}
