//! Single dispatch point for every server-side mutation
//!
//! Transport tasks never touch the registry, router or call state directly.
//! They submit a [`Command`] and the coordinator applies it to completion
//! before looking at the next one, so rosters are never observed mid-update.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use huddle_cluster::sync::Outlet;
use huddle_cluster::{ConnectionRegistry, GroupKey, RoomBroadcastRouter};
use huddle_core::metrics;
use huddle_core::models::{ConnectionId, MediaKind, RoomId, UserId};
use huddle_core::service::{Audience, CallEffect, CallSessionManager, Caller, Delivery, SignalingRelay};
use huddle_core::{Error, Result};
use huddle_proto::{ClientMessage, ServerMessage};

/// Queue depth between transports and the coordinator
const COMMAND_BUFFER: usize = 4096;

/// Work submitted by transport tasks
#[derive(Debug)]
pub enum Command {
    /// An authenticated transport was accepted
    Connect {
        connection_id: ConnectionId,
        user_id: UserId,
        rooms: HashSet<RoomId>,
        outlet: Outlet,
    },
    /// The transport closed or failed
    Disconnect { connection_id: ConnectionId },
    /// Keepalive traffic with no payload
    Heartbeat { connection_id: ConnectionId },
    /// A decoded client frame
    Client {
        connection_id: ConnectionId,
        message: ClientMessage,
    },
}

/// The coordinator task stopped and no longer accepts commands
#[derive(Debug, thiserror::Error)]
#[error("coordinator is not running")]
pub struct CoordinatorClosed;

/// Cloneable submission side of the coordinator queue
#[derive(Clone, Debug)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    pub async fn send(&self, command: Command) -> std::result::Result<(), CoordinatorClosed> {
        self.commands.send(command).await.map_err(|_| CoordinatorClosed)
    }

    pub async fn connect(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        rooms: HashSet<RoomId>,
        outlet: Outlet,
    ) -> std::result::Result<(), CoordinatorClosed> {
        self.send(Command::Connect {
            connection_id,
            user_id,
            rooms,
            outlet,
        })
        .await
    }

    pub async fn client(
        &self,
        connection_id: ConnectionId,
        message: ClientMessage,
    ) -> std::result::Result<(), CoordinatorClosed> {
        self.send(Command::Client {
            connection_id,
            message,
        })
        .await
    }

    pub async fn heartbeat(
        &self,
        connection_id: ConnectionId,
    ) -> std::result::Result<(), CoordinatorClosed> {
        self.send(Command::Heartbeat { connection_id }).await
    }

    pub async fn disconnect(
        &self,
        connection_id: ConnectionId,
    ) -> std::result::Result<(), CoordinatorClosed> {
        self.send(Command::Disconnect { connection_id }).await
    }
}

/// Owns call state and drives the registry and router
pub struct Coordinator {
    calls: CallSessionManager,
    registry: ConnectionRegistry,
    router: RoomBroadcastRouter,
    relay: SignalingRelay,
    callers: HashMap<ConnectionId, Caller>,
}

impl Coordinator {
    #[must_use]
    pub fn new(
        registry: ConnectionRegistry,
        router: RoomBroadcastRouter,
        max_participants: usize,
    ) -> Self {
        let relay = SignalingRelay::new(Arc::new(registry.clone()));
        Self {
            calls: CallSessionManager::new(max_participants),
            registry,
            router,
            relay,
            callers: HashMap::new(),
        }
    }

    /// Start the dispatch loop on the runtime
    pub fn spawn(self, sweep_interval: Duration) -> (CoordinatorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let task = tokio::spawn(self.run(rx, sweep_interval));
        (CoordinatorHandle { commands: tx }, task)
    }

    /// Process commands until every handle is dropped
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>, sweep_interval: Duration) {
        let mut sweep = tokio::time::interval(sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        sweep.tick().await;

        info!("Coordinator started");
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        info!("All transports gone, coordinator stopping");
                        break;
                    };
                    self.handle(command);
                }
                _ = sweep.tick() => {
                    let evicted = self.sweep_idle();
                    if evicted > 0 {
                        info!(evicted, "Idle connections evicted");
                    }
                }
            }
        }
    }

    pub fn handle(&mut self, command: Command) {
        match command {
            Command::Connect {
                connection_id,
                user_id,
                rooms,
                outlet,
            } => self.connect(connection_id, user_id, rooms, outlet),
            Command::Disconnect { connection_id } => self.disconnect(&connection_id),
            Command::Heartbeat { connection_id } => {
                self.registry.record_activity(&connection_id);
                return;
            }
            Command::Client {
                connection_id,
                message,
            } => self.handle_client(&connection_id, message),
        }
        self.refresh_gauges();
    }

    /// Disconnect every connection idle past the registry's timeout
    pub fn sweep_idle(&mut self) -> usize {
        let idle = self.registry.idle_connections();
        for connection_id in &idle {
            self.router.evict(connection_id);
            self.disconnect(connection_id);
        }
        if !idle.is_empty() {
            self.refresh_gauges();
        }
        idle.len()
    }

    #[must_use]
    pub const fn calls(&self) -> &CallSessionManager {
        &self.calls
    }

    fn connect(
        &mut self,
        connection_id: ConnectionId,
        user_id: UserId,
        rooms: HashSet<RoomId>,
        outlet: Outlet,
    ) {
        if self.callers.contains_key(&connection_id) {
            warn!(connection_id = %connection_id, "Duplicate connect ignored");
            return;
        }

        let came_online = self.registry.register(connection_id.clone(), user_id.clone());
        self.router
            .attach(connection_id.clone(), user_id.clone(), outlet);
        for room_id in &rooms {
            self.router
                .join(&connection_id, GroupKey::Room(room_id.clone()));
        }

        let caller = Caller::new(user_id, connection_id.clone(), Arc::new(rooms));
        info!(
            connection_id = %connection_id,
            user_id = %caller.user_id,
            rooms = caller.rooms.len(),
            "Connection accepted"
        );

        if came_online {
            self.announce_presence(&caller, true, Some(&connection_id));
        }
        self.callers.insert(connection_id, caller);
    }

    fn disconnect(&mut self, connection_id: &ConnectionId) {
        let Some(caller) = self.callers.remove(connection_id) else {
            debug!(connection_id = %connection_id, "Disconnect for unknown connection");
            return;
        };

        let effects = self.calls.disconnect(connection_id, &caller.user_id);
        self.apply(effects);
        self.router.detach(connection_id);

        if self.registry.unregister(connection_id).is_some() {
            self.announce_presence(&caller, false, None);
        }
        info!(
            connection_id = %connection_id,
            user_id = %caller.user_id,
            "Connection closed"
        );
    }

    fn handle_client(&mut self, connection_id: &ConnectionId, message: ClientMessage) {
        let Some(caller) = self.callers.get(connection_id).cloned() else {
            warn!(
                connection_id = %connection_id,
                event = message.name(),
                "Message from unknown connection dropped"
            );
            return;
        };
        self.registry.record_activity(connection_id);

        let event = message.name();
        let room_scoped = message.is_room_scoped();
        debug!(
            connection_id = %connection_id,
            user_id = %caller.user_id,
            event,
            "Client message"
        );

        if let Err(err) = self.dispatch(&caller, message) {
            self.reject(&caller, event, room_scoped, &err);
        }
    }

    fn dispatch(&mut self, caller: &Caller, message: ClientMessage) -> Result<()> {
        let effects = match message {
            ClientMessage::JoinRoom { room_id } => return self.join_room(caller, room_id),
            ClientMessage::LeaveRoom { room_id } => self.leave_room(caller, &room_id),
            ClientMessage::StartCall { room_id, call_type } => {
                self.calls.start_call(caller, &room_id, call_type)?
            }
            ClientMessage::JoinCall { room_id } => self.calls.join_call(caller, &room_id)?,
            ClientMessage::LeaveCall {} => self.calls.leave_call(caller),
            ClientMessage::EndCall { room_id } => self.calls.end_call(caller, &room_id)?,
            ClientMessage::ToggleVideo { room_id, enabled } => {
                self.calls
                    .toggle_media(caller, &room_id, MediaKind::Video, enabled)?
            }
            ClientMessage::ToggleAudio { room_id, enabled } => {
                self.calls
                    .toggle_media(caller, &room_id, MediaKind::Audio, enabled)?
            }
            ClientMessage::StartScreenShare { room_id } => {
                self.calls
                    .toggle_media(caller, &room_id, MediaKind::Screen, true)?
            }
            ClientMessage::StopScreenShare { room_id } => {
                self.calls
                    .toggle_media(caller, &room_id, MediaKind::Screen, false)?
            }
            signal @ (ClientMessage::WebrtcOffer { .. }
            | ClientMessage::WebrtcAnswer { .. }
            | ClientMessage::WebrtcIceCandidate { .. }) => return self.relay_signal(caller, signal),
        };
        self.apply(effects);
        Ok(())
    }

    fn join_room(&self, caller: &Caller, room_id: RoomId) -> Result<()> {
        if !caller.is_member(&room_id) {
            return Err(Error::AuthorizationDenied(format!(
                "Not a member of room {room_id}"
            )));
        }

        let key = GroupKey::Room(room_id.clone());
        self.router.join(&caller.connection_id, key.clone());
        let participants = self.router.users_in(&key);
        self.router.send_to_connection(
            &caller.connection_id,
            &ServerMessage::JoinedRoom {
                room_id: room_id.clone(),
                participants,
            },
        )?;

        if let Some(session) = self.calls.session(&room_id) {
            self.router
                .send_to_connection(&caller.connection_id, &session.started_message())?;
        }
        Ok(())
    }

    fn leave_room(&mut self, caller: &Caller, room_id: &RoomId) -> Vec<CallEffect> {
        self.router
            .leave(&caller.connection_id, &GroupKey::Room(room_id.clone()));
        if self.calls.call_of(&caller.connection_id) == Some(room_id) {
            self.calls.leave_call(caller)
        } else {
            Vec::new()
        }
    }

    fn relay_signal(&self, caller: &Caller, message: ClientMessage) -> Result<()> {
        let envelope = message
            .into_envelope(caller.user_id.clone())
            .map_err(|other| {
                Error::InvalidInput(format!("{} is not a signaling message", other.name()))
            })?;
        let kind = envelope.payload.kind();

        let delivery = self.relay.relay(&self.calls, envelope)?;
        self.deliver(&delivery)?;
        metrics::signaling::ENVELOPES_RELAYED
            .with_label_values(&[kind])
            .inc();
        Ok(())
    }

    fn apply(&self, effects: Vec<CallEffect>) {
        for effect in effects {
            match effect {
                CallEffect::Subscribe {
                    connection_id,
                    call_id,
                } => {
                    self.router.join(&connection_id, GroupKey::Call(call_id));
                }
                CallEffect::Unsubscribe {
                    connection_id,
                    call_id,
                } => self.router.leave(&connection_id, &GroupKey::Call(call_id)),
                CallEffect::Deliver(delivery) => {
                    if let Err(err) = self.deliver(&delivery) {
                        debug!(
                            event_type = delivery.message.name(),
                            error = %err,
                            "Delivery incomplete"
                        );
                    }
                }
                CallEffect::Dissolve(call_id) => {
                    self.router.dissolve(&GroupKey::Call(call_id));
                    metrics::calls::CALLS_ENDED.inc();
                }
            }
        }
    }

    /// Fan a delivery out through the router
    ///
    /// Group audiences are best effort; a direct connection audience that
    /// cannot be reached is an error.
    fn deliver(&self, delivery: &Delivery) -> Result<()> {
        let mut groups = Vec::with_capacity(delivery.audience.len());
        let mut direct = Vec::new();
        for audience in &delivery.audience {
            match audience {
                Audience::Room(room_id) => groups.push(GroupKey::Room(room_id.clone())),
                Audience::Call(call_id) => groups.push(GroupKey::Call(call_id.clone())),
                Audience::User(user_id) => groups.push(GroupKey::User(user_id.clone())),
                Audience::Connection(connection_id) => direct.push(connection_id),
            }
        }

        if !groups.is_empty() {
            self.router
                .broadcast_many(&groups, &delivery.message, delivery.exclude.as_ref());
        }
        for connection_id in direct {
            if delivery.exclude.as_ref() != Some(connection_id) {
                self.router
                    .send_to_connection(connection_id, &delivery.message)?;
            }
        }
        Ok(())
    }

    fn announce_presence(&self, caller: &Caller, online: bool, exclude: Option<&ConnectionId>) {
        let groups: Vec<GroupKey> = caller.rooms.iter().cloned().map(GroupKey::Room).collect();
        let message = ServerMessage::PresenceChanged {
            user_id: caller.user_id.clone(),
            online,
        };
        let sent = self.router.broadcast_many(&groups, &message, exclude);
        info!(user_id = %caller.user_id, online, sent, "Presence changed");
    }

    fn reject(&self, caller: &Caller, event: &'static str, room_scoped: bool, err: &Error) {
        warn!(
            connection_id = %caller.connection_id,
            user_id = %caller.user_id,
            event,
            kind = err.kind(),
            error = %err,
            "Request rejected"
        );
        metrics::calls::CALL_ERRORS
            .with_label_values(&[err.kind()])
            .inc();

        let reply = if room_scoped {
            ServerMessage::error(err.client_message())
        } else {
            ServerMessage::call_error(err.client_message())
        };
        if let Err(send_err) = self.router.send_to_connection(&caller.connection_id, &reply) {
            debug!(
                connection_id = %caller.connection_id,
                error = %send_err,
                "Could not report error to client"
            );
        }
    }

    fn refresh_gauges(&self) {
        let snapshot = self.registry.metrics();
        metrics::presence::ACTIVE_CONNECTIONS.set(gauge(snapshot.active_connections));
        metrics::presence::ONLINE_USERS.set(gauge(snapshot.online_users));
        metrics::calls::ACTIVE_CALLS.set(gauge(self.calls.active_calls()));
        metrics::calls::CALL_PARTICIPANTS.set(gauge(self.calls.participant_count()));
    }
}

fn gauge(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::test_helpers::{test_connection_id, test_room_id, test_user_id};

    fn coordinator() -> Coordinator {
        let registry = ConnectionRegistry::default();
        let router = RoomBroadcastRouter::new(Arc::new(registry.clone()));
        Coordinator::new(registry, router, 8)
    }

    #[test]
    fn test_duplicate_connect_is_ignored() {
        let mut coordinator = coordinator();
        let (tx, _rx) = mpsc::channel(8);
        for _ in 0..2 {
            coordinator.handle(Command::Connect {
                connection_id: test_connection_id("c1"),
                user_id: test_user_id("u1"),
                rooms: HashSet::from([test_room_id("7")]),
                outlet: tx.clone(),
            });
        }
        assert_eq!(coordinator.registry.connection_count(), 1);
        assert_eq!(coordinator.callers.len(), 1);
    }

    #[test]
    fn test_disconnect_unknown_connection_is_noop() {
        let mut coordinator = coordinator();
        coordinator.handle(Command::Disconnect {
            connection_id: test_connection_id("ghost"),
        });
        assert_eq!(coordinator.registry.connection_count(), 0);
    }

    #[test]
    fn test_gauge_saturates() {
        assert_eq!(gauge(3), 3);
        assert_eq!(gauge(usize::MAX), i64::MAX);
    }

    #[tokio::test]
    async fn test_spawned_coordinator_stops_when_handles_drop() {
        let (handle, task) = coordinator().spawn(Duration::from_secs(30));
        let (tx, mut rx) = mpsc::channel(8);
        handle
            .connect(
                test_connection_id("c1"),
                test_user_id("u1"),
                HashSet::from([test_room_id("7")]),
                tx,
            )
            .await
            .unwrap();
        handle
            .client(
                test_connection_id("c1"),
                ClientMessage::JoinRoom {
                    room_id: test_room_id("7"),
                },
            )
            .await
            .unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.name(), "joined_room");

        drop(handle);
        task.await.unwrap();
    }
}
