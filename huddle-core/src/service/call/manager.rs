//! Call session state machine
//!
//! Per room a call is either absent or active; removal of the session is the
//! terminal state. Every operation runs to completion synchronously and
//! returns the ordered effects (group membership changes and deliveries) the
//! caller must apply. Nothing here awaits, so a roster is never observed
//! half-updated.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use super::session::{CallSession, ParticipantState};
use crate::models::{CallId, CallType, ConnectionId, MediaKind, RoomId, UserId};
use crate::{Error, Result};
use huddle_proto::ServerMessage;

/// The connection an operation originates from
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    /// Room memberships loaded when the connection was accepted
    pub rooms: Arc<HashSet<RoomId>>,
}

impl Caller {
    #[must_use]
    pub fn new(user_id: UserId, connection_id: ConnectionId, rooms: Arc<HashSet<RoomId>>) -> Self {
        Self {
            user_id,
            connection_id,
            rooms,
        }
    }

    #[must_use]
    pub fn is_member(&self, room_id: &RoomId) -> bool {
        self.rooms.contains(room_id)
    }
}

/// Who receives a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// Every connection joined to the room group
    Room(RoomId),
    /// Every connection subscribed to the call group
    Call(CallId),
    /// Every connection of one user
    User(UserId),
    /// Exactly one connection
    Connection(ConnectionId),
}

/// A message for the union of several audiences, delivered once per connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub audience: Vec<Audience>,
    pub exclude: Option<ConnectionId>,
    pub message: ServerMessage,
}

impl Delivery {
    #[must_use]
    pub fn to(audience: Audience, message: ServerMessage) -> Self {
        Self {
            audience: vec![audience],
            exclude: None,
            message,
        }
    }

    #[must_use]
    pub fn excluding(mut self, connection_id: ConnectionId) -> Self {
        self.exclude = Some(connection_id);
        self
    }
}

/// Side effect produced by a call operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEffect {
    Subscribe {
        connection_id: ConnectionId,
        call_id: CallId,
    },
    Unsubscribe {
        connection_id: ConnectionId,
        call_id: CallId,
    },
    Deliver(Delivery),
    /// Drop the call group and everyone still in it
    Dissolve(CallId),
}

/// Owns every active call session, at most one per room
#[derive(Debug)]
pub struct CallSessionManager {
    sessions: HashMap<RoomId, CallSession>,
    /// Connection -> room of the call it participates in
    by_connection: HashMap<ConnectionId, RoomId>,
    max_participants: usize,
}

impl CallSessionManager {
    #[must_use]
    pub fn new(max_participants: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            by_connection: HashMap::new(),
            max_participants,
        }
    }

    /// Start a call in `room_id` with the caller as sole participant
    pub fn start_call(
        &mut self,
        caller: &Caller,
        room_id: &RoomId,
        call_type: CallType,
    ) -> Result<Vec<CallEffect>> {
        if !caller.is_member(room_id) {
            return Err(Error::AuthorizationDenied(
                "You are not a member of this room".to_string(),
            ));
        }
        if self.sessions.contains_key(room_id) {
            return Err(Error::SessionConflict(
                "A call is already active in this room".to_string(),
            ));
        }

        let mut effects = self.leave_current_call(caller);

        let session = CallSession::new(
            room_id.clone(),
            caller.user_id.clone(),
            caller.connection_id.clone(),
            call_type,
        );
        info!(
            room_id = %room_id,
            call_id = %session.id,
            user_id = %caller.user_id,
            call_type = %call_type,
            "Call started"
        );

        effects.push(CallEffect::Subscribe {
            connection_id: caller.connection_id.clone(),
            call_id: session.id.clone(),
        });
        effects.push(CallEffect::Deliver(Delivery::to(
            Audience::Room(room_id.clone()),
            session.started_message(),
        )));

        self.by_connection
            .insert(caller.connection_id.clone(), room_id.clone());
        self.sessions.insert(room_id.clone(), session);

        Ok(effects)
    }

    /// Join the active call in `room_id`, replacing any earlier entry of the same user
    pub fn join_call(&mut self, caller: &Caller, room_id: &RoomId) -> Result<Vec<CallEffect>> {
        if !caller.is_member(room_id) {
            return Err(Error::AuthorizationDenied(
                "You are not a member of this room".to_string(),
            ));
        }
        let session = self
            .sessions
            .get(room_id)
            .ok_or_else(|| Error::NotFound("No active call in this room".to_string()))?;
        if !session.is_participant(&caller.user_id) && session.len() >= self.max_participants {
            return Err(Error::SessionConflict(format!(
                "Call is full ({} participants)",
                self.max_participants
            )));
        }

        let mut effects = Vec::new();
        if self.by_connection.get(&caller.connection_id) != Some(room_id) {
            effects.extend(self.leave_current_call(caller));
        }

        // The earlier leave never tears down this room's call: the caller's
        // connection was in a different room.
        let Some(session) = self.sessions.get_mut(room_id) else {
            return Err(Error::NotFound("No active call in this room".to_string()));
        };
        let call_id = session.id.clone();

        // A rejoin keeps the media state the other participants were told about
        let entry = match session.participant(&caller.user_id) {
            Some(existing) => existing.rejoined(caller.connection_id.clone()),
            None => ParticipantState::new(
                caller.user_id.clone(),
                caller.connection_id.clone(),
                session.call_type,
            ),
        };
        let joined = ServerMessage::UserJoinedCall {
            room_id: room_id.clone(),
            user_id: caller.user_id.clone(),
            video_enabled: entry.video_enabled,
            audio_enabled: entry.audio_enabled,
        };

        if let Some(previous) = session.upsert(entry) {
            if previous.connection_id != caller.connection_id {
                debug!(
                    room_id = %room_id,
                    user_id = %caller.user_id,
                    old_connection = %previous.connection_id,
                    new_connection = %caller.connection_id,
                    "Participant rejoined from another connection"
                );
                self.by_connection.remove(&previous.connection_id);
                effects.push(CallEffect::Unsubscribe {
                    connection_id: previous.connection_id,
                    call_id: call_id.clone(),
                });
            }
        }

        let roster = session.roster_for(&caller.user_id);
        info!(
            room_id = %room_id,
            call_id = %call_id,
            user_id = %caller.user_id,
            participants = session.len(),
            "User joined call"
        );

        self.by_connection
            .insert(caller.connection_id.clone(), room_id.clone());

        effects.push(CallEffect::Subscribe {
            connection_id: caller.connection_id.clone(),
            call_id: call_id.clone(),
        });
        effects.push(CallEffect::Deliver(
            Delivery::to(Audience::Call(call_id.clone()), joined)
                .excluding(caller.connection_id.clone()),
        ));
        effects.push(CallEffect::Deliver(Delivery::to(
            Audience::Connection(caller.connection_id.clone()),
            ServerMessage::CallJoined {
                call_id,
                room_id: room_id.clone(),
                participants: roster,
            },
        )));

        Ok(effects)
    }

    /// Update one media flag of the caller and announce it to the call
    ///
    /// A caller that is not in the room's call is ignored.
    pub fn toggle_media(
        &mut self,
        caller: &Caller,
        room_id: &RoomId,
        kind: MediaKind,
        enabled: bool,
    ) -> Result<Vec<CallEffect>> {
        let Some(session) = self.sessions.get_mut(room_id) else {
            return Ok(Vec::new());
        };
        if !session.is_participant(&caller.user_id) {
            return Ok(Vec::new());
        }

        if kind == MediaKind::Screen && enabled {
            if let Some(sharer) = session.screen_sharer() {
                if sharer != &caller.user_id {
                    return Err(Error::SessionConflict(format!(
                        "{sharer} is already sharing their screen"
                    )));
                }
            }
        }

        let call_id = session.id.clone();
        if let Some(participant) = session.participant_mut(&caller.user_id) {
            participant.set_flag(kind, enabled);
        }
        debug!(
            room_id = %room_id,
            user_id = %caller.user_id,
            kind = %kind,
            enabled,
            "Media toggled"
        );

        let room_id = room_id.clone();
        let user_id = caller.user_id.clone();
        let message = match (kind, enabled) {
            (MediaKind::Video, enabled) => ServerMessage::UserVideoToggled {
                room_id,
                user_id,
                enabled,
            },
            (MediaKind::Audio, enabled) => ServerMessage::UserAudioToggled {
                room_id,
                user_id,
                enabled,
            },
            (MediaKind::Screen, true) => ServerMessage::ScreenShareStarted { room_id, user_id },
            (MediaKind::Screen, false) => ServerMessage::ScreenShareStopped { room_id, user_id },
        };

        Ok(vec![CallEffect::Deliver(Delivery::to(
            Audience::Call(call_id),
            message,
        ))])
    }

    /// Leave whatever call the caller's connection is in
    pub fn leave_call(&mut self, caller: &Caller) -> Vec<CallEffect> {
        self.leave_current_call(caller)
    }

    /// Abrupt disconnect of a connection
    pub fn disconnect(&mut self, connection_id: &ConnectionId, user_id: &UserId) -> Vec<CallEffect> {
        self.depart(connection_id, user_id)
    }

    /// End the call in `room_id`; only its creator may do this
    pub fn end_call(&mut self, caller: &Caller, room_id: &RoomId) -> Result<Vec<CallEffect>> {
        let session = self
            .sessions
            .get(room_id)
            .ok_or_else(|| Error::NotFound("No active call in this room".to_string()))?;
        if session.created_by != caller.user_id {
            return Err(Error::AuthorizationDenied(
                "Only the call creator can end the call".to_string(),
            ));
        }

        Ok(self.teardown(room_id, None))
    }

    #[must_use]
    pub fn session(&self, room_id: &RoomId) -> Option<&CallSession> {
        self.sessions.get(room_id)
    }

    /// Room of the call `connection_id` participates in
    #[must_use]
    pub fn call_of(&self, connection_id: &ConnectionId) -> Option<&RoomId> {
        self.by_connection.get(connection_id)
    }

    #[must_use]
    pub fn active_calls(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.sessions.values().map(CallSession::len).sum()
    }

    fn leave_current_call(&mut self, caller: &Caller) -> Vec<CallEffect> {
        self.depart(&caller.connection_id, &caller.user_id)
    }

    fn depart(&mut self, connection_id: &ConnectionId, user_id: &UserId) -> Vec<CallEffect> {
        let Some(room_id) = self.by_connection.remove(connection_id) else {
            return Vec::new();
        };
        let Some(session) = self.sessions.get_mut(&room_id) else {
            return Vec::new();
        };

        let owned = session
            .participant(user_id)
            .is_some_and(|p| &p.connection_id == connection_id);
        if !owned {
            return Vec::new();
        }
        session.remove(user_id);

        let call_id = session.id.clone();
        let creator_left = &session.created_by == user_id;
        let now_empty = session.is_empty();
        info!(
            room_id = %room_id,
            call_id = %call_id,
            user_id = %user_id,
            remaining = session.len(),
            "User left call"
        );

        let mut effects = vec![
            CallEffect::Unsubscribe {
                connection_id: connection_id.clone(),
                call_id: call_id.clone(),
            },
            CallEffect::Deliver(Delivery::to(
                Audience::Call(call_id),
                ServerMessage::UserLeftCall {
                    room_id: room_id.clone(),
                    user_id: user_id.clone(),
                },
            )),
        ];

        if now_empty || creator_left {
            let departed = creator_left.then(|| user_id.clone());
            effects.extend(self.teardown(&room_id, departed));
        }
        effects
    }

    /// Remove the session and announce `call_ended` exactly once per connection
    fn teardown(&mut self, room_id: &RoomId, departed_creator: Option<UserId>) -> Vec<CallEffect> {
        let Some(session) = self.sessions.remove(room_id) else {
            return Vec::new();
        };
        for participant in session.participants() {
            self.by_connection.remove(&participant.connection_id);
        }

        let ended_at = Utc::now();
        let message = session.ended_message(ended_at);
        info!(
            room_id = %room_id,
            call_id = %session.id,
            duration = session.duration_at(ended_at),
            "Call ended"
        );

        let mut audience = vec![
            Audience::Room(room_id.clone()),
            Audience::Call(session.id.clone()),
        ];
        if let Some(creator) = departed_creator {
            audience.push(Audience::User(creator));
        }

        vec![
            CallEffect::Deliver(Delivery {
                audience,
                exclude: None,
                message,
            }),
            CallEffect::Dissolve(session.id),
        ]
    }
}
