//! Call session state
//!
//! One session per room, holding the participant roster in join order.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use crate::models::{CallId, CallType, ConnectionId, MediaKind, ParticipantInfo, RoomId, UserId};
use huddle_proto::ServerMessage;

/// Roster entry for one participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantState {
    pub user_id: UserId,
    /// Connection that joined; signaling for this user is routed here
    pub connection_id: ConnectionId,
    pub video_enabled: bool,
    pub audio_enabled: bool,
    pub screen_sharing: bool,
    pub joined_at: DateTime<Utc>,
}

impl ParticipantState {
    /// Initial media flags follow the call type
    #[must_use]
    pub fn new(user_id: UserId, connection_id: ConnectionId, call_type: CallType) -> Self {
        Self {
            user_id,
            connection_id,
            video_enabled: call_type == CallType::Video,
            audio_enabled: true,
            screen_sharing: false,
            joined_at: Utc::now(),
        }
    }

    /// Same participant on `connection_id`, media state and join time kept
    #[must_use]
    pub fn rejoined(&self, connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            ..self.clone()
        }
    }

    #[must_use]
    pub const fn flag(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Video => self.video_enabled,
            MediaKind::Audio => self.audio_enabled,
            MediaKind::Screen => self.screen_sharing,
        }
    }

    pub fn set_flag(&mut self, kind: MediaKind, enabled: bool) {
        match kind {
            MediaKind::Video => self.video_enabled = enabled,
            MediaKind::Audio => self.audio_enabled = enabled,
            MediaKind::Screen => self.screen_sharing = enabled,
        }
    }

    #[must_use]
    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            user_id: self.user_id.clone(),
            video_enabled: self.video_enabled,
            audio_enabled: self.audio_enabled,
            screen_sharing: self.screen_sharing,
            joined_at: self.joined_at,
        }
    }
}

/// An active call in one room
#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: CallId,
    pub room_id: RoomId,
    pub created_by: UserId,
    pub call_type: CallType,
    pub started_at: DateTime<Utc>,
    participants: IndexMap<UserId, ParticipantState>,
}

impl CallSession {
    /// Create a session with the creator as the sole participant
    #[must_use]
    pub fn new(
        room_id: RoomId,
        created_by: UserId,
        connection_id: ConnectionId,
        call_type: CallType,
    ) -> Self {
        let mut creator = ParticipantState::new(created_by.clone(), connection_id, call_type);
        if call_type == CallType::Screen {
            creator.screen_sharing = true;
        }

        let mut participants = IndexMap::new();
        participants.insert(created_by.clone(), creator);

        Self {
            id: CallId::new(),
            room_id,
            created_by,
            call_type,
            started_at: Utc::now(),
            participants,
        }
    }

    #[must_use]
    pub fn participant(&self, user_id: &UserId) -> Option<&ParticipantState> {
        self.participants.get(user_id)
    }

    pub fn participant_mut(&mut self, user_id: &UserId) -> Option<&mut ParticipantState> {
        self.participants.get_mut(user_id)
    }

    #[must_use]
    pub fn is_participant(&self, user_id: &UserId) -> bool {
        self.participants.contains_key(user_id)
    }

    /// Participants in join order
    pub fn participants(&self) -> impl Iterator<Item = &ParticipantState> {
        self.participants.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Insert or replace the entry for `state.user_id`, returning the replaced one
    pub fn upsert(&mut self, state: ParticipantState) -> Option<ParticipantState> {
        let previous = self.participants.shift_remove(&state.user_id);
        self.participants.insert(state.user_id.clone(), state);
        previous
    }

    pub fn remove(&mut self, user_id: &UserId) -> Option<ParticipantState> {
        self.participants.shift_remove(user_id)
    }

    /// Participant currently holding the screen-share flag
    #[must_use]
    pub fn screen_sharer(&self) -> Option<&UserId> {
        self.participants
            .values()
            .find(|p| p.screen_sharing)
            .map(|p| &p.user_id)
    }

    /// Roster as seen by `viewer`, without the viewer's own entry
    #[must_use]
    pub fn roster_for(&self, viewer: &UserId) -> Vec<ParticipantInfo> {
        self.participants
            .values()
            .filter(|p| &p.user_id != viewer)
            .map(ParticipantState::info)
            .collect()
    }

    /// Whole seconds elapsed between start and `now`
    #[must_use]
    pub fn duration_at(&self, now: DateTime<Utc>) -> u64 {
        u64::try_from(now.signed_duration_since(self.started_at).num_seconds()).unwrap_or(0)
    }

    #[must_use]
    pub fn started_message(&self) -> ServerMessage {
        ServerMessage::CallStarted {
            call_id: self.id.clone(),
            room_id: self.room_id.clone(),
            created_by: self.created_by.clone(),
            call_type: self.call_type,
            started_at: self.started_at,
        }
    }

    #[must_use]
    pub fn ended_message(&self, ended_at: DateTime<Utc>) -> ServerMessage {
        ServerMessage::CallEnded {
            call_id: self.id.clone(),
            room_id: self.room_id.clone(),
            ended_at,
            duration: self.duration_at(ended_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> CallSession {
        CallSession::new(
            RoomId::from("7"),
            UserId::from("u1"),
            ConnectionId::from("c1"),
            CallType::Video,
        )
    }

    #[test]
    fn test_new_session_has_creator_only() {
        let session = session();
        assert_eq!(session.len(), 1);
        let creator = session.participant(&UserId::from("u1")).unwrap();
        assert!(creator.video_enabled);
        assert!(creator.audio_enabled);
        assert!(!creator.screen_sharing);
    }

    #[test]
    fn test_screen_call_creator_is_sharing() {
        let session = CallSession::new(
            RoomId::from("7"),
            UserId::from("u1"),
            ConnectionId::from("c1"),
            CallType::Screen,
        );
        assert_eq!(session.screen_sharer(), Some(&UserId::from("u1")));
    }

    #[test]
    fn test_upsert_replaces_and_keeps_one_entry() {
        let mut session = session();
        let first = ParticipantState::new(UserId::from("u2"), ConnectionId::from("c2"), CallType::Audio);
        let second = ParticipantState::new(UserId::from("u2"), ConnectionId::from("c3"), CallType::Audio);

        assert!(session.upsert(first).is_none());
        let replaced = session.upsert(second).unwrap();

        assert_eq!(replaced.connection_id, ConnectionId::from("c2"));
        assert_eq!(session.len(), 2);
        assert_eq!(
            session.participant(&UserId::from("u2")).unwrap().connection_id,
            ConnectionId::from("c3")
        );
    }

    #[test]
    fn test_roster_excludes_viewer_and_keeps_order() {
        let mut session = session();
        session.upsert(ParticipantState::new(UserId::from("u2"), ConnectionId::from("c2"), CallType::Video));
        session.upsert(ParticipantState::new(UserId::from("u3"), ConnectionId::from("c3"), CallType::Video));

        let roster: Vec<_> = session
            .roster_for(&UserId::from("u3"))
            .into_iter()
            .map(|p| p.user_id)
            .collect();
        assert_eq!(roster, vec![UserId::from("u1"), UserId::from("u2")]);
    }

    #[test]
    fn test_duration_never_negative() {
        let session = session();
        let before = session.started_at - chrono::Duration::seconds(5);
        assert_eq!(session.duration_at(before), 0);
        let after = session.started_at + chrono::Duration::seconds(42);
        assert_eq!(session.duration_at(after), 42);
    }
}
