//! In-process signaling over a shared [`Relay`].

use crate::channel::{OpenChannel, SignalingChannel, SignalingLink};
use crate::relay::Relay;
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use voice_core::{
    ChannelId, Error, LocalIdentity, ParticipantId, ParticipantPatch, SignalPayload,
};

/// Signaling channel that joins a relay living in the same process.
///
/// Besides wiring tests and single-process demos together it can simulate an
/// unreachable relay and hold `open` in flight.
#[derive(Clone)]
pub struct LocalSignaling {
    relay: Relay,
    reachable: Arc<AtomicBool>,
    gate: Arc<Mutex<Option<watch::Receiver<bool>>>>,
    opens: Arc<AtomicUsize>,
    opening: Arc<Notify>,
}

impl LocalSignaling {
    pub fn new(relay: Relay) -> Self {
        Self {
            relay,
            reachable: Arc::new(AtomicBool::new(true)),
            gate: Arc::new(Mutex::new(None)),
            opens: Arc::new(AtomicUsize::new(0)),
            opening: Arc::new(Notify::new()),
        }
    }

    /// Make subsequent `open` calls fail with `ConnectionError`.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Suspend subsequent `open` calls until the returned sender publishes `true`.
    pub fn hold_open(&self) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);
        *self.gate.lock().unwrap_or_else(|e| e.into_inner()) = Some(rx);
        tx
    }

    /// Number of `open` attempts made so far.
    pub fn open_attempts(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Resolves once an `open` call has started.
    pub async fn opening(&self) {
        self.opening.notified().await;
    }
}

#[async_trait]
impl SignalingChannel for LocalSignaling {
    async fn open(
        &self,
        channel: &ChannelId,
        identity: &LocalIdentity,
    ) -> Result<OpenChannel, Error> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.opening.notify_one();

        let gate = self.gate.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(mut gate) = gate {
            let _ = gate.wait_for(|open| *open).await;
        }

        if !self.reachable.load(Ordering::SeqCst) {
            return Err(Error::ConnectionError("relay unreachable".to_string()));
        }

        let mut inbound = self.relay.join(channel, &identity.id, &identity.username)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                if let Some(event) = message.into_event() {
                    if events_tx.send(event).is_err() {
                        break;
                    }
                }
            }
        });

        Ok(OpenChannel {
            link: Box::new(LocalLink {
                relay: self.relay.clone(),
                channel: channel.clone(),
                local_id: identity.id.clone(),
                closed: AtomicBool::new(false),
                forwarder: Mutex::new(Some(forwarder)),
            }),
            events: events_rx,
        })
    }
}

struct LocalLink {
    relay: Relay,
    channel: ChannelId,
    local_id: ParticipantId,
    closed: AtomicBool,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl LocalLink {
    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::ConnectionError("signaling channel closed".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SignalingLink for LocalLink {
    fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    fn send_signal(&self, to: &ParticipantId, payload: SignalPayload) -> Result<(), Error> {
        self.ensure_open()?;
        self.relay.signal(&self.channel, &self.local_id, to, payload);
        Ok(())
    }

    fn broadcast_update(&self, patch: &ParticipantPatch) -> Result<(), Error> {
        self.ensure_open()?;
        self.relay
            .update(&self.channel, &self.local_id, patch.clone());
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing local signaling for {}", self.local_id);
        self.relay.leave(&self.channel, &self.local_id);
        let forwarder = self
            .forwarder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(forwarder) = forwarder {
            forwarder.abort();
            if let Err(e) = forwarder.await {
                if !e.is_cancelled() {
                    warn!("Signaling forwarder ended abnormally: {}", e);
                }
            }
        }
    }
}

impl Drop for LocalLink {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            self.relay.leave(&self.channel, &self.local_id);
        }
        if let Ok(mut forwarder) = self.forwarder.lock() {
            if let Some(forwarder) = forwarder.take() {
                forwarder.abort();
            }
        }
    }
}
