//! Frames exchanged over the signaling channel.
//!
//! Every frame is a JSON object `{"event": "<name>", "data": {...}}` with
//! camelCase field names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{CallId, RoomId, UserId};
use crate::signal::{IceCandidate, SessionDescription, SignalPayload, SignalingEnvelope};

/// Media type a call was started with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Audio,
    Video,
    Screen,
}

impl CallType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Screen => "screen",
        }
    }
}

impl std::fmt::Display for CallType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-participant media flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Audio,
    Screen,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Screen => "screen",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Roster entry as seen by clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub user_id: UserId,
    pub video_enabled: bool,
    pub audio_enabled: bool,
    pub screen_sharing: bool,
    pub joined_at: DateTime<Utc>,
}

/// Client -> server frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    JoinRoom {
        room_id: RoomId,
    },
    LeaveRoom {
        room_id: RoomId,
    },
    StartCall {
        room_id: RoomId,
        #[serde(rename = "type")]
        call_type: CallType,
    },
    JoinCall {
        room_id: RoomId,
    },
    LeaveCall {},
    EndCall {
        room_id: RoomId,
    },
    ToggleVideo {
        room_id: RoomId,
        enabled: bool,
    },
    ToggleAudio {
        room_id: RoomId,
        enabled: bool,
    },
    StartScreenShare {
        room_id: RoomId,
    },
    StopScreenShare {
        room_id: RoomId,
    },
    WebrtcOffer {
        room_id: RoomId,
        target_user_id: UserId,
        payload: SessionDescription,
    },
    WebrtcAnswer {
        room_id: RoomId,
        target_user_id: UserId,
        payload: SessionDescription,
    },
    WebrtcIceCandidate {
        room_id: RoomId,
        target_user_id: UserId,
        payload: IceCandidate,
    },
}

impl ClientMessage {
    /// Wire name of the event
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join_room",
            Self::LeaveRoom { .. } => "leave_room",
            Self::StartCall { .. } => "start_call",
            Self::JoinCall { .. } => "join_call",
            Self::LeaveCall {} => "leave_call",
            Self::EndCall { .. } => "end_call",
            Self::ToggleVideo { .. } => "toggle_video",
            Self::ToggleAudio { .. } => "toggle_audio",
            Self::StartScreenShare { .. } => "start_screen_share",
            Self::StopScreenShare { .. } => "stop_screen_share",
            Self::WebrtcOffer { .. } => "webrtc_offer",
            Self::WebrtcAnswer { .. } => "webrtc_answer",
            Self::WebrtcIceCandidate { .. } => "webrtc_ice_candidate",
        }
    }

    /// Room the frame targets, if any
    #[must_use]
    pub fn room_id(&self) -> Option<&RoomId> {
        match self {
            Self::LeaveCall {} => None,
            Self::JoinRoom { room_id }
            | Self::LeaveRoom { room_id }
            | Self::StartCall { room_id, .. }
            | Self::JoinCall { room_id }
            | Self::EndCall { room_id }
            | Self::ToggleVideo { room_id, .. }
            | Self::ToggleAudio { room_id, .. }
            | Self::StartScreenShare { room_id }
            | Self::StopScreenShare { room_id }
            | Self::WebrtcOffer { room_id, .. }
            | Self::WebrtcAnswer { room_id, .. }
            | Self::WebrtcIceCandidate { room_id, .. } => Some(room_id),
        }
    }

    /// Room-level frames report failures as `error`, everything else as `call_error`
    #[must_use]
    pub const fn is_room_scoped(&self) -> bool {
        matches!(self, Self::JoinRoom { .. } | Self::LeaveRoom { .. })
    }

    /// Build the relayed envelope for a `webrtc_*` frame, stamping the
    /// server-verified sender. Other frames are handed back unchanged.
    pub fn into_envelope(self, from: UserId) -> Result<SignalingEnvelope, Self> {
        let (room_id, to, payload) = match self {
            Self::WebrtcOffer {
                room_id,
                target_user_id,
                payload,
            } => (room_id, target_user_id, SignalPayload::Offer(payload)),
            Self::WebrtcAnswer {
                room_id,
                target_user_id,
                payload,
            } => (room_id, target_user_id, SignalPayload::Answer(payload)),
            Self::WebrtcIceCandidate {
                room_id,
                target_user_id,
                payload,
            } => (room_id, target_user_id, SignalPayload::IceCandidate(payload)),
            other => return Err(other),
        };
        Ok(SignalingEnvelope {
            room_id,
            from,
            to,
            payload,
        })
    }

    /// Client-side helper to address an envelope to a peer
    #[must_use]
    pub fn from_envelope(envelope: SignalingEnvelope) -> Self {
        let SignalingEnvelope {
            room_id,
            to,
            payload,
            ..
        } = envelope;
        match payload {
            SignalPayload::Offer(payload) => Self::WebrtcOffer {
                room_id,
                target_user_id: to,
                payload,
            },
            SignalPayload::Answer(payload) => Self::WebrtcAnswer {
                room_id,
                target_user_id: to,
                payload,
            },
            SignalPayload::IceCandidate(payload) => Self::WebrtcIceCandidate {
                room_id,
                target_user_id: to,
                payload,
            },
        }
    }
}

/// Server -> client frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    JoinedRoom {
        room_id: RoomId,
        participants: Vec<UserId>,
    },
    PresenceChanged {
        user_id: UserId,
        online: bool,
    },
    CallStarted {
        call_id: CallId,
        room_id: RoomId,
        created_by: UserId,
        #[serde(rename = "type")]
        call_type: CallType,
        started_at: DateTime<Utc>,
    },
    CallJoined {
        call_id: CallId,
        room_id: RoomId,
        participants: Vec<ParticipantInfo>,
    },
    UserJoinedCall {
        room_id: RoomId,
        user_id: UserId,
        video_enabled: bool,
        audio_enabled: bool,
    },
    UserLeftCall {
        room_id: RoomId,
        user_id: UserId,
    },
    UserVideoToggled {
        room_id: RoomId,
        user_id: UserId,
        enabled: bool,
    },
    UserAudioToggled {
        room_id: RoomId,
        user_id: UserId,
        enabled: bool,
    },
    ScreenShareStarted {
        room_id: RoomId,
        user_id: UserId,
    },
    ScreenShareStopped {
        room_id: RoomId,
        user_id: UserId,
    },
    WebrtcOffer {
        room_id: RoomId,
        from_user_id: UserId,
        payload: SessionDescription,
    },
    WebrtcAnswer {
        room_id: RoomId,
        from_user_id: UserId,
        payload: SessionDescription,
    },
    WebrtcIceCandidate {
        room_id: RoomId,
        from_user_id: UserId,
        payload: IceCandidate,
    },
    CallEnded {
        call_id: CallId,
        room_id: RoomId,
        ended_at: DateTime<Utc>,
        /// Whole seconds the call was active
        duration: u64,
    },
    CallError {
        message: String,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    /// Wire name of the event
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::JoinedRoom { .. } => "joined_room",
            Self::PresenceChanged { .. } => "presence_changed",
            Self::CallStarted { .. } => "call_started",
            Self::CallJoined { .. } => "call_joined",
            Self::UserJoinedCall { .. } => "user_joined_call",
            Self::UserLeftCall { .. } => "user_left_call",
            Self::UserVideoToggled { .. } => "user_video_toggled",
            Self::UserAudioToggled { .. } => "user_audio_toggled",
            Self::ScreenShareStarted { .. } => "screen_share_started",
            Self::ScreenShareStopped { .. } => "screen_share_stopped",
            Self::WebrtcOffer { .. } => "webrtc_offer",
            Self::WebrtcAnswer { .. } => "webrtc_answer",
            Self::WebrtcIceCandidate { .. } => "webrtc_ice_candidate",
            Self::CallEnded { .. } => "call_ended",
            Self::CallError { .. } => "call_error",
            Self::Error { .. } => "error",
        }
    }

    /// Deliverable form of a relayed envelope, tagged with its sender
    #[must_use]
    pub fn relayed(envelope: SignalingEnvelope) -> Self {
        let SignalingEnvelope {
            room_id,
            from,
            payload,
            ..
        } = envelope;
        match payload {
            SignalPayload::Offer(payload) => Self::WebrtcOffer {
                room_id,
                from_user_id: from,
                payload,
            },
            SignalPayload::Answer(payload) => Self::WebrtcAnswer {
                room_id,
                from_user_id: from,
                payload,
            },
            SignalPayload::IceCandidate(payload) => Self::WebrtcIceCandidate {
                room_id,
                from_user_id: from,
                payload,
            },
        }
    }

    /// Sender and payload of a relayed `webrtc_*` frame
    #[must_use]
    pub fn as_signal(&self) -> Option<(&RoomId, &UserId, SignalPayload)> {
        match self {
            Self::WebrtcOffer {
                room_id,
                from_user_id,
                payload,
            } => Some((room_id, from_user_id, SignalPayload::Offer(payload.clone()))),
            Self::WebrtcAnswer {
                room_id,
                from_user_id,
                payload,
            } => Some((room_id, from_user_id, SignalPayload::Answer(payload.clone()))),
            Self::WebrtcIceCandidate {
                room_id,
                from_user_id,
                payload,
            } => Some((
                room_id,
                from_user_id,
                SignalPayload::IceCandidate(payload.clone()),
            )),
            _ => None,
        }
    }

    #[must_use]
    pub fn call_error(message: impl Into<String>) -> Self {
        Self::CallError {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_start_call_frame_shape() {
        let frame = json!({"event": "start_call", "data": {"roomId": "7", "type": "video"}});
        let msg: ClientMessage = serde_json::from_value(frame).unwrap();
        assert_eq!(
            msg,
            ClientMessage::StartCall {
                room_id: RoomId::from("7"),
                call_type: CallType::Video,
            }
        );
        assert_eq!(msg.name(), "start_call");
    }

    #[test]
    fn test_leave_call_accepts_empty_data() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"event": "leave_call", "data": {}})).unwrap();
        assert_eq!(msg, ClientMessage::LeaveCall {});
        assert!(msg.room_id().is_none());
    }

    #[test]
    fn test_call_started_serializes_camel_case() {
        let started_at = Utc::now();
        let msg = ServerMessage::CallStarted {
            call_id: CallId::from("c1"),
            room_id: RoomId::from("7"),
            created_by: UserId::from("u1"),
            call_type: CallType::Video,
            started_at,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["event"], "call_started");
        assert_eq!(value["data"]["createdBy"], "u1");
        assert_eq!(value["data"]["type"], "video");
        assert_eq!(value["data"]["roomId"], "7");
    }

    #[test]
    fn test_offer_becomes_envelope_with_verified_sender() {
        let msg = ClientMessage::WebrtcOffer {
            room_id: RoomId::from("7"),
            target_user_id: UserId::from("u2"),
            payload: SessionDescription::offer("v=0"),
        };
        let envelope = msg.into_envelope(UserId::from("u1")).unwrap();
        assert_eq!(envelope.from, UserId::from("u1"));
        assert_eq!(envelope.to, UserId::from("u2"));

        let relayed = ServerMessage::relayed(envelope);
        let value = serde_json::to_value(&relayed).unwrap();
        assert_eq!(value["event"], "webrtc_offer");
        assert_eq!(value["data"]["fromUserId"], "u1");
        assert_eq!(value["data"]["payload"]["sdp"], "v=0");
    }

    #[test]
    fn test_non_signal_frame_is_not_an_envelope() {
        let msg = ClientMessage::JoinCall {
            room_id: RoomId::from("7"),
        };
        assert!(msg.clone().into_envelope(UserId::from("u1")).is_err());
        assert!(!msg.is_room_scoped());
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let result: Result<ClientMessage, _> =
            serde_json::from_value(json!({"event": "launch_rockets", "data": {}}));
        assert!(result.is_err());
    }
}
