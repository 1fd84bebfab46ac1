//! WebSocket transport: client channel and relay server.

use crate::channel::{OpenChannel, SignalingChannel, SignalingLink};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::relay::Relay;
use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{accept_async, connect_async};
use voice_core::{
    ChannelId, Error, LocalIdentity, ParticipantId, ParticipantPatch, SignalPayload,
    SignalingEvent,
};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

fn connection_error(e: tungstenite::Error) -> Error {
    Error::ConnectionError(e.to_string())
}

/// Read frames until a text frame arrives and parse it as `T`.
async fn next_message<S, T>(stream: &mut S) -> Result<Option<T>, Error>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    T: serde::de::DeserializeOwned,
{
    while let Some(frame) = stream.next().await {
        match frame.map_err(connection_error)? {
            Message::Text(text) => return Ok(Some(serde_json::from_str(&text)?)),
            Message::Close(_) => return Ok(None),
            _ => continue,
        }
    }
    Ok(None)
}

/// Signaling channel that talks to a relay over WebSocket.
pub struct WsSignalingChannel {
    url: String,
    handshake_timeout: Duration,
}

impl WsSignalingChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

#[async_trait]
impl SignalingChannel for WsSignalingChannel {
    async fn open(
        &self,
        channel: &ChannelId,
        identity: &LocalIdentity,
    ) -> Result<OpenChannel, Error> {
        info!("Connecting to relay {}", self.url);
        let (ws, _) = tokio::time::timeout(self.handshake_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| Error::ConnectionError(format!("timed out connecting to {}", self.url)))?
            .map_err(connection_error)?;
        let (mut sink, mut stream) = ws.split();

        let join = ClientMessage::Join {
            channel_id: channel.to_string(),
            user_id: identity.id.clone(),
            username: identity.username.clone(),
        };
        sink.send(Message::Text(serde_json::to_string(&join)?))
            .await
            .map_err(connection_error)?;

        let first = tokio::time::timeout(self.handshake_timeout, next_message(&mut stream))
            .await
            .map_err(|_| Error::ConnectionError("relay did not answer join".to_string()))??;
        let participants = match first {
            Some(ServerMessage::UserList(participants)) => participants,
            Some(ServerMessage::Error { message }) => return Err(Error::ConnectionError(message)),
            Some(other) => {
                return Err(Error::ConnectionError(format!(
                    "unexpected first message from relay: {:?}",
                    other
                )))
            }
            None => return Err(Error::ConnectionError("relay closed the connection".to_string())),
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(SignalingEvent::RosterSnapshot { participants });

        let reader = tokio::spawn(async move {
            loop {
                match next_message::<_, ServerMessage>(&mut stream).await {
                    Ok(Some(ServerMessage::Error { message })) => {
                        warn!("Relay reported an error: {}", message)
                    }
                    Ok(Some(message)) => {
                        if let Some(event) = message.into_event() {
                            if events_tx.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("Relay closed the signaling stream");
                        break;
                    }
                    Err(Error::Serialization(e)) => warn!("Ignoring malformed relay frame: {}", e),
                    Err(e) => {
                        warn!("Signaling stream failed: {}", e);
                        break;
                    }
                }
            }
        });

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let leaving = matches!(message, ClientMessage::Leave);
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode {:?}: {}", message, e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!("Failed to write to relay: {}", e);
                    break;
                }
                if leaving {
                    let _ = sink.close().await;
                    break;
                }
            }
        });

        Ok(OpenChannel {
            link: Box::new(WsLink {
                local_id: identity.id.clone(),
                out_tx,
                closed: AtomicBool::new(false),
                tasks: Mutex::new(Some((reader, writer))),
            }),
            events: events_rx,
        })
    }
}

struct WsLink {
    local_id: ParticipantId,
    out_tx: mpsc::UnboundedSender<ClientMessage>,
    closed: AtomicBool,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl WsLink {
    fn send(&self, message: ClientMessage) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionError("signaling channel closed".to_string()));
        }
        self.out_tx
            .send(message)
            .map_err(|_| Error::ConnectionError("relay connection lost".to_string()))
    }
}

#[async_trait]
impl SignalingLink for WsLink {
    fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    fn send_signal(&self, to: &ParticipantId, payload: SignalPayload) -> Result<(), Error> {
        self.send(ClientMessage::Signal {
            user_id: to.clone(),
            signal: payload,
        })
    }

    fn broadcast_update(&self, patch: &ParticipantPatch) -> Result<(), Error> {
        self.send(ClientMessage::UserUpdate(patch.clone()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.out_tx.send(ClientMessage::Leave);
        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some((reader, writer)) = tasks {
            reader.abort();
            if tokio::time::timeout(CLOSE_TIMEOUT, writer).await.is_err() {
                warn!("Timed out flushing leave to relay");
            }
            let _ = reader.await;
        }
        debug!("Signaling channel for {} closed", self.local_id);
    }
}

impl Drop for WsLink {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some((reader, writer)) = tasks.take() {
                reader.abort();
                writer.abort();
            }
        }
    }
}

/// Accept WebSocket clients on `listener` and relay their traffic through `relay`.
pub async fn serve(listener: TcpListener, relay: Relay) -> Result<(), Error> {
    serve_with_join_timeout(listener, relay, DEFAULT_HANDSHAKE_TIMEOUT).await
}

/// Like [`serve`], dropping clients that have not sent `join` within `join_timeout`.
pub async fn serve_with_join_timeout(
    listener: TcpListener,
    relay: Relay,
    join_timeout: Duration,
) -> Result<(), Error> {
    info!("Relay listening on {}", listener.local_addr()?);
    loop {
        let (stream, addr) = listener.accept().await?;
        let relay = relay.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(relay, stream, addr, join_timeout).await {
                warn!("Relay connection {} ended with error: {}", addr, e);
            }
        });
    }
}

async fn handle_connection(
    relay: Relay,
    stream: TcpStream,
    addr: SocketAddr,
    join_timeout: Duration,
) -> Result<(), Error> {
    let handshake = async {
        let ws = accept_async(stream).await.map_err(connection_error)?;
        let (sink, mut source) = ws.split();
        let first = next_message::<_, ClientMessage>(&mut source).await?;
        Ok::<_, Error>((sink, source, first))
    };
    let (mut sink, mut source, first) = tokio::time::timeout(join_timeout, handshake)
        .await
        .map_err(|_| Error::ConnectionError(format!("{} did not join in time", addr)))??;

    let (channel, user_id, username) = match first {
        Some(ClientMessage::Join {
            channel_id,
            user_id,
            username,
        }) => (ChannelId::new(channel_id), user_id, username),
        Some(other) => {
            let reply = ServerMessage::Error {
                message: format!("expected join, got {:?}", other),
            };
            let _ = sink.send(Message::Text(serde_json::to_string(&reply)?)).await;
            return Ok(());
        }
        None => return Ok(()),
    };

    let mut outbound = match relay.join(&channel, &user_id, &username) {
        Ok(rx) => rx,
        Err(e) => {
            let reply = ServerMessage::Error {
                message: e.to_string(),
            };
            let _ = sink.send(Message::Text(serde_json::to_string(&reply)?)).await;
            return Ok(());
        }
    };
    debug!("{} joined {} from {}", user_id, channel, addr);

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode {:?}: {}", message, e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    loop {
        match next_message::<_, ClientMessage>(&mut source).await {
            Ok(Some(ClientMessage::Signal {
                user_id: to,
                signal,
            })) => relay.signal(&channel, &user_id, &to, signal),
            Ok(Some(ClientMessage::UserUpdate(patch))) => relay.update(&channel, &user_id, patch),
            Ok(Some(ClientMessage::Leave)) | Ok(None) => break,
            Ok(Some(ClientMessage::Join { .. })) => {
                warn!("{} sent a second join; ignoring", user_id)
            }
            Err(Error::Serialization(e)) => warn!("Ignoring malformed frame from {}: {}", addr, e),
            Err(e) => {
                debug!("Connection {} dropped: {}", addr, e);
                break;
            }
        }
    }

    relay.leave(&channel, &user_id);
    writer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start_relay() -> (String, Relay) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = Relay::new();
        tokio::spawn(serve(listener, relay.clone()));
        (format!("ws://{}", addr), relay)
    }

    async fn next_event(open: &mut OpenChannel) -> SignalingEvent {
        tokio::time::timeout(Duration::from_secs(5), open.events.recv())
            .await
            .expect("timed out waiting for signaling event")
            .expect("signaling stream ended")
    }

    #[tokio::test]
    async fn two_clients_exchange_signals() {
        let (url, relay) = start_relay().await;
        let channel = ChannelId::from("ch1");
        let client = WsSignalingChannel::new(url);

        let alice = LocalIdentity::new("Alice");
        let mut a = client.open(&channel, &alice).await.unwrap();
        assert_eq!(
            next_event(&mut a).await,
            SignalingEvent::RosterSnapshot {
                participants: vec![]
            }
        );

        let bob = LocalIdentity::new("Bob");
        let mut b = client.open(&channel, &bob).await.unwrap();
        match next_event(&mut b).await {
            SignalingEvent::RosterSnapshot { participants } => {
                assert_eq!(participants.len(), 1);
                assert_eq!(participants[0].id, alice.id);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            next_event(&mut a).await,
            SignalingEvent::ParticipantJoined {
                id: bob.id.clone(),
                username: "Bob".into()
            }
        );

        a.link
            .send_signal(&bob.id, serde_json::json!({ "type": "offer" }))
            .unwrap();
        assert_eq!(
            next_event(&mut b).await,
            SignalingEvent::Signal {
                from: alice.id.clone(),
                payload: serde_json::json!({ "type": "offer" })
            }
        );

        b.link.broadcast_update(&ParticipantPatch::muted(true)).unwrap();
        assert_eq!(
            next_event(&mut a).await,
            SignalingEvent::ParticipantUpdated {
                id: bob.id.clone(),
                patch: ParticipantPatch::muted(true)
            }
        );

        b.link.close().await;
        assert_eq!(
            next_event(&mut a).await,
            SignalingEvent::ParticipantLeft { id: bob.id.clone() }
        );
        assert_eq!(relay.members(&channel).len(), 1);
    }

    #[tokio::test]
    async fn silent_client_is_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_with_join_timeout(
            listener,
            Relay::new(),
            Duration::from_millis(200),
        ));

        let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => panic!("unexpected frame {}", text),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "relay kept an idle client open");
    }

    #[tokio::test]
    async fn unreachable_relay_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = WsSignalingChannel::new(format!("ws://{}", addr))
            .with_handshake_timeout(Duration::from_secs(2));
        let err = client
            .open(&ChannelId::from("ch1"), &LocalIdentity::new("Alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionError(_)));
    }
}
