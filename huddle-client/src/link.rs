//! One negotiation actor per remote peer
//!
//! Offers, answers and candidates for a peer go through a single FIFO
//! queue and are applied strictly in arrival order. Candidates that arrive
//! before any remote description are held back and applied right after it.
//!
//! Each step races the cancel signal and the negotiation deadline, so a
//! stalled transport or signaling channel never blocks teardown.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::event::CallEvent;
use crate::media::LocalTrack;
use crate::signaling::SignalingSink;
use crate::transport::{PeerState, PeerTransport, PeerTransportFactory, TransportEvent};
use huddle_proto::{ClientMessage, IceCandidate, RoomId, SessionDescription, UserId};

#[derive(Debug)]
pub(crate) enum LinkCommand {
    StartOffer,
    RemoteOffer(SessionDescription),
    RemoteAnswer(SessionDescription),
    RemoteCandidate(IceCandidate),
    AddTrack(LocalTrack),
    ReplaceVideo(LocalTrack),
}

/// Everything a link needs from its call
#[derive(Clone)]
pub(crate) struct LinkContext {
    pub room_id: RoomId,
    pub signals: Arc<dyn SignalingSink>,
    pub events: mpsc::UnboundedSender<CallEvent>,
    pub negotiation_timeout: Duration,
}

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a running link; dropping it closes the peer connection
pub(crate) struct PeerLink {
    commands: mpsc::UnboundedSender<LinkCommand>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PeerLink {
    pub(crate) async fn open(
        remote: UserId,
        context: LinkContext,
        factory: &dyn PeerTransportFactory,
        tracks: Vec<LocalTrack>,
    ) -> Result<Self> {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let transport = factory.create(&remote, transport_tx).await?;
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (cancel, cancel_rx) = watch::channel(false);

        let actor = LinkActor {
            remote,
            context,
            transport,
            pending_candidates: Vec::new(),
            remote_described: false,
            negotiated: false,
            connected: false,
            deadline: None,
        };
        let task = tokio::spawn(actor.run(command_rx, transport_rx, cancel_rx, tracks));

        Ok(Self {
            commands,
            cancel,
            task,
        })
    }

    pub(crate) fn send(&self, command: LinkCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| ClientError::Closed)
    }

    /// The actor has stopped on its own (failure or timeout)
    pub(crate) fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Cancel whatever step is running and wait until the transport is closed
    pub(crate) async fn shutdown(self) {
        let _ = self.cancel.send(true);
        let _ = self.task.await;
    }
}

struct LinkActor {
    remote: UserId,
    context: LinkContext,
    transport: Arc<dyn PeerTransport>,
    pending_candidates: Vec<IceCandidate>,
    remote_described: bool,
    negotiated: bool,
    connected: bool,
    deadline: Option<Instant>,
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

enum Next {
    Command(LinkCommand),
    Transport(TransportEvent),
}

/// Why a step did not run to completion
enum Interrupt {
    Cancelled,
    TimedOut,
}

impl LinkActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<LinkCommand>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        mut cancel: watch::Receiver<bool>,
        tracks: Vec<LocalTrack>,
    ) {
        let attached = tokio::select! {
            biased;
            _ = cancel.changed() => false,
            () = self.attach(&tracks) => true,
        };

        let reason = loop {
            if !attached {
                break "closed";
            }
            // A dropped handle counts as cancellation
            let next = tokio::select! {
                biased;
                _ = cancel.changed() => break "closed",
                () = expire(self.deadline) => {
                    self.timed_out();
                    break "negotiation timeout";
                }
                command = commands.recv() => match command {
                    Some(command) => Next::Command(command),
                    None => break "closed",
                },
                event = transport_events.recv() => match event {
                    Some(event) => Next::Transport(event),
                    None => break "transport gone",
                },
            };

            let step_limit = Instant::now() + self.context.negotiation_timeout;
            let deadline = self.deadline.map_or(step_limit, |d| d.min(step_limit));
            let outcome = tokio::select! {
                biased;
                _ = cancel.changed() => Err(Interrupt::Cancelled),
                () = tokio::time::sleep_until(deadline) => Err(Interrupt::TimedOut),
                step = self.step(next) => Ok(step),
            };

            match outcome {
                Ok(Ok(ControlFlow::Continue(()))) => {}
                Ok(Ok(ControlFlow::Break(reason))) => break reason,
                Ok(Err(e)) => {
                    warn!(remote = %self.remote, error = %e, "Negotiation step failed");
                    self.emit_state(PeerState::Failed);
                    break "negotiation error";
                }
                Err(Interrupt::Cancelled) => break "closed",
                Err(Interrupt::TimedOut) => {
                    self.timed_out();
                    break "negotiation timeout";
                }
            }
        };
        drop(commands);

        match tokio::time::timeout(CLOSE_TIMEOUT, self.transport.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(remote = %self.remote, error = %e, "Transport close failed"),
            Err(_) => warn!(remote = %self.remote, "Transport close timed out"),
        }
        info!(remote = %self.remote, reason, "Peer link closed");
        let _ = self.context.events.send(CallEvent::PeerClosed {
            user_id: self.remote.clone(),
        });
    }

    async fn attach(&self, tracks: &[LocalTrack]) {
        for track in tracks {
            if let Err(e) = self.transport.add_track(track).await {
                warn!(remote = %self.remote, kind = %track.kind(), error = %e, "Failed to attach local track");
            }
        }
    }

    async fn step(&mut self, next: Next) -> Result<ControlFlow<&'static str>> {
        match next {
            Next::Command(command) => self.apply(command).await,
            Next::Transport(event) => self.on_transport_event(event).await,
        }
    }

    fn timed_out(&self) {
        warn!(
            remote = %self.remote,
            timeout = ?self.context.negotiation_timeout,
            "Negotiation timed out"
        );
        self.emit_state(PeerState::Failed);
    }

    async fn apply(&mut self, command: LinkCommand) -> Result<ControlFlow<&'static str>> {
        match command {
            LinkCommand::StartOffer => self.offer().await?,
            LinkCommand::RemoteOffer(offer) => {
                self.transport.set_remote_description(offer).await?;
                self.remote_described = true;
                self.flush_candidates().await?;

                let answer = self.transport.create_answer().await?;
                self.send(ClientMessage::WebrtcAnswer {
                    room_id: self.context.room_id.clone(),
                    target_user_id: self.remote.clone(),
                    payload: answer,
                })
                .await?;
                self.negotiated = true;
                self.arm();
            }
            LinkCommand::RemoteAnswer(answer) => {
                self.transport.set_remote_description(answer).await?;
                self.remote_described = true;
                self.flush_candidates().await?;
            }
            LinkCommand::RemoteCandidate(candidate) => {
                if self.remote_described {
                    self.transport.add_ice_candidate(candidate).await?;
                } else {
                    debug!(remote = %self.remote, "Candidate buffered until remote description");
                    self.pending_candidates.push(candidate);
                }
            }
            LinkCommand::AddTrack(track) => {
                self.transport.add_track(&track).await?;
                if self.negotiated {
                    self.offer().await?;
                }
            }
            LinkCommand::ReplaceVideo(track) => {
                if self.transport.replace_video_track(&track).await? {
                    debug!(remote = %self.remote, track_id = track.id(), "Video swapped in place");
                } else {
                    self.transport.add_track(&track).await?;
                    self.offer().await?;
                }
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn on_transport_event(&mut self, event: TransportEvent) -> Result<ControlFlow<&'static str>> {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.send(ClientMessage::WebrtcIceCandidate {
                    room_id: self.context.room_id.clone(),
                    target_user_id: self.remote.clone(),
                    payload: candidate,
                })
                .await?;
            }
            TransportEvent::StateChanged(state) => {
                self.emit_state(state);
                match state {
                    PeerState::Connected => {
                        self.connected = true;
                        self.deadline = None;
                    }
                    PeerState::Disconnected => self.connected = false,
                    PeerState::Failed => return Ok(ControlFlow::Break("failed")),
                    PeerState::Closed => return Ok(ControlFlow::Break("closed by transport")),
                    PeerState::New | PeerState::Connecting => {}
                }
            }
            TransportEvent::RemoteTrack { track_id, kind } => {
                let _ = self.context.events.send(CallEvent::RemoteTrack {
                    user_id: self.remote.clone(),
                    track_id,
                    kind,
                });
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn offer(&mut self) -> Result<()> {
        let offer = self.transport.create_offer().await?;
        self.send(ClientMessage::WebrtcOffer {
            room_id: self.context.room_id.clone(),
            target_user_id: self.remote.clone(),
            payload: offer,
        })
        .await?;
        self.negotiated = true;
        self.arm();
        Ok(())
    }

    async fn flush_candidates(&mut self) -> Result<()> {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            self.transport.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn send(&self, message: ClientMessage) -> Result<()> {
        self.context.signals.send(message).await
    }

    /// Start the negotiation clock unless the peer is already up
    fn arm(&mut self) {
        if !self.connected && self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.context.negotiation_timeout);
        }
    }

    fn emit_state(&self, state: PeerState) {
        debug!(remote = %self.remote, state = %state, "Peer state changed");
        let _ = self.context.events.send(CallEvent::PeerStateChanged {
            user_id: self.remote.clone(),
            state,
        });
    }
}
