//! Client side of one call
//!
//! A `PeerConnectionManager` lives exactly as long as the call it was built
//! for. It keeps one [`PeerLink`] per remote participant, owns the local
//! tracks and turns server events into negotiation steps.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::event::CallEvent;
use crate::link::{LinkCommand, LinkContext, PeerLink};
use crate::media::{LocalTrack, MediaSource};
use crate::signaling::SignalingSink;
use crate::transport::PeerTransportFactory;
use huddle_proto::{
    ClientMessage, IceCandidate, MediaKind, RoomId, ServerMessage, SessionDescription, UserId,
};

#[derive(Default)]
struct ManagerState {
    links: HashMap<UserId, PeerLink>,
    camera: Option<LocalTrack>,
    microphone: Option<LocalTrack>,
    display: Option<LocalTrack>,
    /// Display track is live on every link
    sharing: bool,
    /// `start_screen_share` sent, server has not confirmed yet
    share_requested: bool,
    disposed: bool,
}

impl ManagerState {
    fn ensure_open(&self) -> Result<()> {
        if self.disposed {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }

    /// Tracks a freshly opened link should carry
    fn outgoing_tracks(&self) -> Vec<LocalTrack> {
        let video = if self.sharing {
            self.display.clone()
        } else {
            self.camera.clone()
        };
        video.into_iter().chain(self.microphone.clone()).collect()
    }

    /// Forget links whose actor has already stopped
    fn prune(&mut self) {
        self.links.retain(|user_id, link| {
            let keep = !link.is_closed();
            if !keep {
                debug!(remote = %user_id, "Dropping closed peer link");
            }
            keep
        });
    }

    fn live_link(&self, user_id: &UserId) -> Result<&PeerLink> {
        self.links
            .get(user_id)
            .filter(|link| !link.is_closed())
            .ok_or_else(|| ClientError::UnknownPeer(user_id.clone()))
    }

    fn broadcast(&self, command: impl Fn() -> LinkCommand) {
        for (user_id, link) in &self.links {
            if link.send(command()).is_err() {
                debug!(remote = %user_id, "Skipping closed link");
            }
        }
    }
}

pub struct PeerConnectionManager {
    local_user: UserId,
    room_id: RoomId,
    factory: Arc<dyn PeerTransportFactory>,
    media: Arc<dyn MediaSource>,
    signals: Arc<dyn SignalingSink>,
    events: mpsc::UnboundedSender<CallEvent>,
    negotiation_timeout: Duration,
    state: Mutex<ManagerState>,
}

impl PeerConnectionManager {
    pub fn new(
        local_user: UserId,
        room_id: RoomId,
        negotiation_timeout: Duration,
        factory: Arc<dyn PeerTransportFactory>,
        media: Arc<dyn MediaSource>,
        signals: Arc<dyn SignalingSink>,
    ) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            local_user,
            room_id,
            factory,
            media,
            signals,
            events,
            negotiation_timeout,
            state: Mutex::new(ManagerState::default()),
        };
        (manager, events_rx)
    }

    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Capture camera and/or microphone
    ///
    /// Re-acquiring the camera swaps it on every link; an existing
    /// microphone is kept.
    pub async fn acquire_local_media(&self, video: bool, audio: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;

        let stream = match self.media.user_media(video, audio).await {
            Ok(stream) => stream,
            Err(e) => {
                self.report_media_error(&e);
                return Err(e);
            }
        };

        if let Some(camera) = stream.video {
            self.local_stream_available(&camera);
            let replaced = state.camera.replace(camera.clone());
            if !state.sharing {
                match replaced {
                    Some(_) => state.broadcast(|| LinkCommand::ReplaceVideo(camera.clone())),
                    None => state.broadcast(|| LinkCommand::AddTrack(camera.clone())),
                }
            }
            if let Some(old) = replaced {
                old.stop();
            }
        }

        if let Some(microphone) = stream.audio {
            if state.microphone.is_some() {
                microphone.stop();
            } else {
                self.local_stream_available(&microphone);
                state.broadcast(|| LinkCommand::AddTrack(microphone.clone()));
                state.microphone = Some(microphone);
            }
        }
        Ok(())
    }

    /// Capture the screen without publishing it yet
    pub async fn acquire_display_media(&self) -> Result<LocalTrack> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;

        let display = match self.media.display_media().await {
            Ok(display) => display,
            Err(e) => {
                self.report_media_error(&e);
                return Err(e);
            }
        };
        self.local_stream_available(&display);
        if let Some(old) = state.display.replace(display.clone()) {
            old.stop();
        }
        Ok(display)
    }

    /// Open a link to a participant, replacing any existing one
    ///
    /// The initiator sends the first offer.
    pub async fn on_participant_joined(&self, user_id: UserId, is_initiator: bool) -> Result<()> {
        if user_id == self.local_user {
            return Ok(());
        }
        let previous = {
            let mut state = self.state.lock().await;
            state.ensure_open()?;
            state.links.remove(&user_id)
        };
        if let Some(previous) = previous {
            debug!(remote = %user_id, "Replacing existing peer link");
            previous.shutdown().await;
        }

        let mut state = self.state.lock().await;
        state.ensure_open()?;
        state.prune();
        let link = self.open_link(&user_id, &state).await?;
        if is_initiator {
            link.send(LinkCommand::StartOffer)?;
        }
        info!(remote = %user_id, is_initiator, "Peer link opened");
        state.links.insert(user_id, link);
        Ok(())
    }

    pub async fn on_remote_offer(&self, from: UserId, offer: SessionDescription) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        state.prune();

        let stale = state.links.get(&from).is_none_or(PeerLink::is_closed);
        if stale {
            let link = self.open_link(&from, &state).await?;
            state.links.insert(from.clone(), link);
        }
        state.live_link(&from)?.send(LinkCommand::RemoteOffer(offer))
    }

    pub async fn on_remote_answer(&self, from: UserId, answer: SessionDescription) -> Result<()> {
        let state = self.state.lock().await;
        state.ensure_open()?;
        state.live_link(&from)?.send(LinkCommand::RemoteAnswer(answer))
    }

    pub async fn on_remote_ice_candidate(&self, from: UserId, candidate: IceCandidate) -> Result<()> {
        let state = self.state.lock().await;
        state.ensure_open()?;
        state
            .live_link(&from)?
            .send(LinkCommand::RemoteCandidate(candidate))
    }

    /// Flip the camera's enabled flag and tell the server; no renegotiation
    pub async fn toggle_local_video(&self) -> Result<bool> {
        self.toggle(MediaKind::Video).await
    }

    /// Flip the microphone's enabled flag and tell the server
    pub async fn toggle_local_audio(&self) -> Result<bool> {
        self.toggle(MediaKind::Audio).await
    }

    async fn toggle(&self, kind: MediaKind) -> Result<bool> {
        let track = {
            let state = self.state.lock().await;
            state.ensure_open()?;
            match kind {
                MediaKind::Audio => state.microphone.clone(),
                MediaKind::Video | MediaKind::Screen => state.camera.clone(),
            }
        }
        .ok_or(ClientError::NoLocalTrack(kind))?;

        let enabled = !track.is_enabled();
        track.set_enabled(enabled);

        let room_id = self.room_id.clone();
        let message = match kind {
            MediaKind::Audio => ClientMessage::ToggleAudio { room_id, enabled },
            MediaKind::Video | MediaKind::Screen => ClientMessage::ToggleVideo { room_id, enabled },
        };
        self.signals.send(message).await?;
        Ok(enabled)
    }

    /// Point every link's outgoing video at `track`
    ///
    /// Links swap the sender in place when they can and renegotiate
    /// otherwise.
    pub async fn replace_video_track(&self, track: LocalTrack) -> Result<()> {
        let state = self.state.lock().await;
        state.ensure_open()?;
        state.broadcast(|| LinkCommand::ReplaceVideo(track.clone()));
        Ok(())
    }

    /// Capture the screen and ask the server to announce it
    ///
    /// Outgoing video switches once `screen_share_started` comes back.
    pub async fn start_screen_share(&self) -> Result<()> {
        let has_display = self.state.lock().await.display.is_some();
        if !has_display {
            self.acquire_display_media().await?;
        }
        self.state.lock().await.share_requested = true;

        self.signals
            .send(ClientMessage::StartScreenShare {
                room_id: self.room_id.clone(),
            })
            .await
    }

    /// Tell the server and go back to the camera
    pub async fn stop_screen_share(&self) -> Result<()> {
        self.signals
            .send(ClientMessage::StopScreenShare {
                room_id: self.room_id.clone(),
            })
            .await?;
        self.restore_camera().await;
        Ok(())
    }

    async fn confirm_screen_share(&self) {
        let mut state = self.state.lock().await;
        state.share_requested = false;
        if state.sharing {
            return;
        }
        let Some(display) = state.display.clone() else {
            // Started from another device of this user
            return;
        };
        state.sharing = true;
        state.broadcast(|| LinkCommand::ReplaceVideo(display.clone()));
        info!(room_id = %self.room_id, "Screen share live");
    }

    async fn restore_camera(&self) {
        let mut state = self.state.lock().await;
        let was_sharing = std::mem::take(&mut state.sharing);
        state.share_requested = false;
        if let Some(display) = state.display.take() {
            display.stop();
        }
        if was_sharing {
            if let Some(camera) = state.camera.clone() {
                state.broadcast(|| LinkCommand::ReplaceVideo(camera.clone()));
            }
        }
    }

    /// Close and forget the link to one participant
    pub async fn teardown(&self, user_id: &UserId) {
        let link = {
            let mut state = self.state.lock().await;
            state.prune();
            state.links.remove(user_id)
        };
        if let Some(link) = link {
            link.shutdown().await;
        }
    }

    pub async fn teardown_all(&self) {
        let links: Vec<PeerLink> = {
            let mut state = self.state.lock().await;
            state.links.drain().map(|(_, link)| link).collect()
        };
        for link in links {
            link.shutdown().await;
        }
    }

    /// Route one server event to the matching operation
    ///
    /// Events for other rooms are ignored.
    pub async fn handle_server_message(&self, message: &ServerMessage) -> Result<()> {
        match message {
            ServerMessage::CallJoined {
                room_id,
                participants,
                ..
            } if room_id == &self.room_id => {
                for participant in participants {
                    self.on_participant_joined(participant.user_id.clone(), false)
                        .await?;
                }
            }
            ServerMessage::UserJoinedCall {
                room_id, user_id, ..
            } if room_id == &self.room_id => {
                self.on_participant_joined(user_id.clone(), true).await?;
            }
            ServerMessage::WebrtcOffer {
                room_id,
                from_user_id,
                payload,
            } if room_id == &self.room_id => {
                self.on_remote_offer(from_user_id.clone(), payload.clone())
                    .await?;
            }
            ServerMessage::WebrtcAnswer {
                room_id,
                from_user_id,
                payload,
            } if room_id == &self.room_id => {
                self.on_remote_answer(from_user_id.clone(), payload.clone())
                    .await?;
            }
            ServerMessage::WebrtcIceCandidate {
                room_id,
                from_user_id,
                payload,
            } if room_id == &self.room_id => {
                self.on_remote_ice_candidate(from_user_id.clone(), payload.clone())
                    .await?;
            }
            ServerMessage::UserLeftCall { room_id, user_id } if room_id == &self.room_id => {
                self.teardown(user_id).await;
            }
            ServerMessage::CallEnded { room_id, .. } if room_id == &self.room_id => {
                self.teardown_all().await;
                self.emit(CallEvent::CallEnded);
            }
            ServerMessage::ScreenShareStarted { room_id, user_id } if room_id == &self.room_id => {
                if user_id == &self.local_user {
                    self.confirm_screen_share().await;
                }
                self.emit(CallEvent::ScreenShareChanged {
                    user_id: user_id.clone(),
                    active: true,
                });
            }
            ServerMessage::ScreenShareStopped { room_id, user_id } if room_id == &self.room_id => {
                if user_id == &self.local_user {
                    self.restore_camera().await;
                }
                self.emit(CallEvent::ScreenShareChanged {
                    user_id: user_id.clone(),
                    active: false,
                });
            }
            ServerMessage::CallError { message } | ServerMessage::Error { message } => {
                let mut state = self.state.lock().await;
                if std::mem::take(&mut state.share_requested) && !state.sharing {
                    if let Some(display) = state.display.take() {
                        display.stop();
                    }
                }
                drop(state);
                warn!(room_id = %self.room_id, error = %message, "Server rejected request");
                self.emit(CallEvent::ServerError {
                    message: message.clone(),
                });
            }
            _ => {}
        }
        Ok(())
    }

    /// Remote users with an open link
    pub async fn peers(&self) -> Vec<UserId> {
        let mut state = self.state.lock().await;
        state.prune();
        state.links.keys().cloned().collect()
    }

    pub async fn has_peer(&self, user_id: &UserId) -> bool {
        self.state.lock().await.live_link(user_id).is_ok()
    }

    /// Tear down every link and stop local capture; the manager is unusable afterwards
    pub async fn dispose(&self) {
        let (links, tracks) = {
            let mut state = self.state.lock().await;
            if state.disposed {
                return;
            }
            state.disposed = true;
            let links: Vec<PeerLink> = state.links.drain().map(|(_, link)| link).collect();
            let tracks: Vec<LocalTrack> = [
                state.camera.take(),
                state.microphone.take(),
                state.display.take(),
            ]
            .into_iter()
            .flatten()
            .collect();
            (links, tracks)
        };

        for link in links {
            link.shutdown().await;
        }
        for track in tracks {
            track.stop();
        }
        info!(room_id = %self.room_id, "Call manager disposed");
    }

    async fn open_link(&self, user_id: &UserId, state: &ManagerState) -> Result<PeerLink> {
        let context = LinkContext {
            room_id: self.room_id.clone(),
            signals: Arc::clone(&self.signals),
            events: self.events.clone(),
            negotiation_timeout: self.negotiation_timeout,
        };
        PeerLink::open(
            user_id.clone(),
            context,
            self.factory.as_ref(),
            state.outgoing_tracks(),
        )
        .await
    }

    fn local_stream_available(&self, track: &LocalTrack) {
        self.emit(CallEvent::LocalStreamAvailable {
            kind: track.kind(),
            track_id: track.id().to_string(),
        });
    }

    fn report_media_error(&self, error: &ClientError) {
        warn!(room_id = %self.room_id, error = %error, "Local media unavailable");
        self.emit(CallEvent::MediaError {
            message: error.to_string(),
        });
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }
}
