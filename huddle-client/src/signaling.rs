//! Signaling channel to the server
//!
//! One background task owns the WebSocket. Frames queued while the socket
//! is down are sent after the next successful connect. Reconnects follow
//! the configured [`RetryPolicy`]; running out of attempts is terminal.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::retry::RetryPolicy;
use huddle_proto::{ClientMessage, ServerMessage};

const CHANNEL_CAPACITY: usize = 256;

/// Where peer links and the call manager send their frames
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SignalingSink: Send + Sync {
    async fn send(&self, message: ClientMessage) -> Result<()>;
}

/// Connection lifecycle and inbound frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    Connected,
    Message(ServerMessage),
    Disconnected,
    /// The retry policy is exhausted; no further reconnects
    GaveUp { attempts: usize },
}

pub struct SignalingClient {
    outgoing: mpsc::Sender<ClientMessage>,
    task: JoinHandle<()>,
}

impl SignalingClient {
    /// Start connecting in the background
    pub fn connect(
        config: &ClientConfig,
        token: &str,
    ) -> Result<(Self, mpsc::Receiver<SignalingEvent>)> {
        let mut url = Url::parse(&config.signaling_url)?;
        url.query_pairs_mut().append_pair("token", token);

        let (outgoing_tx, outgoing_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let task = tokio::spawn(connection_loop(
            url,
            config.retry.clone(),
            outgoing_rx,
            events_tx,
        ));

        Ok((
            Self {
                outgoing: outgoing_tx,
                task,
            },
            events_rx,
        ))
    }

    /// Stop the connection task immediately
    pub fn close(&self) {
        self.task.abort();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

#[async_trait]
impl SignalingSink for SignalingClient {
    async fn send(&self, message: ClientMessage) -> Result<()> {
        self.outgoing
            .send(message)
            .await
            .map_err(|_| ClientError::Closed)
    }
}

enum SessionEnd {
    /// Every `SignalingClient` handle is gone
    ClientGone,
    Dropped,
}

async fn connection_loop(
    url: Url,
    retry: RetryPolicy,
    mut outgoing: mpsc::Receiver<ClientMessage>,
    events: mpsc::Sender<SignalingEvent>,
) {
    let mut backoff = retry.backoff();
    let mut attempts = 0usize;

    loop {
        attempts += 1;
        info!(host = url.host_str().unwrap_or_default(), attempts, "Connecting to signaling server");

        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                backoff = retry.backoff();
                attempts = 0;
                if events.send(SignalingEvent::Connected).await.is_err() {
                    return;
                }
                match run_session(ws, &mut outgoing, &events).await {
                    SessionEnd::ClientGone => return,
                    SessionEnd::Dropped => {
                        let _ = events.send(SignalingEvent::Disconnected).await;
                    }
                }
            }
            Err(e) => warn!(error = %e, "Signaling connection failed"),
        }

        let Some(delay) = backoff.next() else {
            error!(attempts, "Signaling server unreachable, giving up");
            let _ = events.send(SignalingEvent::GaveUp { attempts }).await;
            return;
        };
        info!(delay = ?delay, "Reconnecting to signaling server");
        tokio::time::sleep(delay).await;
    }
}

async fn run_session(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    outgoing: &mut mpsc::Receiver<ClientMessage>,
    events: &mpsc::Sender<SignalingEvent>,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();
    info!("Signaling connected");

    loop {
        tokio::select! {
            message = outgoing.recv() => {
                let Some(message) = message else {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::ClientGone;
                };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(event = message.name(), error = %e, "Failed to encode client message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!(error = %e, "Signaling send failed");
                    return SessionEnd::Dropped;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => {
                        if events.send(SignalingEvent::Message(message)).await.is_err() {
                            return SessionEnd::ClientGone;
                        }
                    }
                    Err(e) => debug!(error = %e, "Unrecognized signaling frame"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    info!("Signaling server closed connection");
                    return SessionEnd::Dropped;
                }
                // Pings are answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Signaling receive error");
                    return SessionEnd::Dropped;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_proto::RoomId;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn config(url: String) -> ClientConfig {
        ClientConfig {
            signaling_url: url,
            retry: RetryPolicy {
                max_attempts: 2,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(20),
                factor: 2.0,
                jitter: false,
            },
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn test_gives_up_after_policy_exhausted() {
        let (_client, mut events) =
            SignalingClient::connect(&config("ws://127.0.0.1:1/ws".to_string()), "t").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(SignalingEvent::GaveUp { attempts: 3 }));
    }

    #[test]
    fn test_invalid_url_rejected() {
        let result = SignalingClient::connect(&config("not a url".to_string()), "t");
        assert!(matches!(result, Err(ClientError::Signaling(_))));
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let frame = loop {
                if let Some(Ok(Message::Text(text))) = ws.next().await {
                    break text;
                }
            };
            let received: ClientMessage = serde_json::from_str(&frame).unwrap();
            let reply = ServerMessage::JoinedRoom {
                room_id: RoomId::from("7"),
                participants: vec![],
            };
            ws.send(Message::Text(serde_json::to_string(&reply).unwrap().into()))
                .await
                .unwrap();
            received
        });

        let (client, mut events) =
            SignalingClient::connect(&config(format!("ws://{addr}/ws")), "t").unwrap();
        assert_eq!(events.recv().await, Some(SignalingEvent::Connected));

        client
            .send(ClientMessage::JoinRoom {
                room_id: RoomId::from("7"),
            })
            .await
            .unwrap();

        assert_eq!(
            events.recv().await,
            Some(SignalingEvent::Message(ServerMessage::JoinedRoom {
                room_id: RoomId::from("7"),
                participants: vec![],
            }))
        );
        assert_eq!(
            server.await.unwrap(),
            ClientMessage::JoinRoom {
                room_id: RoomId::from("7"),
            }
        );
    }
}
