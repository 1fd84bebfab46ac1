//! Peer links backed by WebRTC peer connections.
//!
//! Each link owns a driver task holding the `RTCPeerConnection`. Negotiation is
//! non-trickle: an offer or answer is only sent once ICE gathering completes, so
//! every payload on the wire is a [`NegotiationMessage`] with a full SDP.
//!
//! Local microphone frames are sent as PCMU on one shared RTP track per media
//! track; remote audio is decoded onto the [`Speaker`] when one is set.

use crate::codec;
use crate::link::{LinkContext, LinkEventKind, PeerLink, PeerLinkFactory};
use bytes::Bytes;
use log::{debug, error, info, warn};
use media_io::{MediaTrack, PlaybackSource, Speaker, TrackKind, FRAME_DURATION};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use voice_core::{Error, LinkState, ParticipantId, Role, SignalPayload};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Payload carried inside `signal` messages between two links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NegotiationMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    /// Sent by the responder to ask the initiator for a fresh offer
    Renegotiate,
}

const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(15);

type TrackCache = Arc<Mutex<HashMap<String, (MediaTrack, Arc<TrackLocalStaticSample>)>>>;

/// Builds [`WebRtcLink`]s sharing one WebRTC API instance.
pub struct WebRtcLinkFactory {
    api: Arc<API>,
    rtc_config: RTCConfiguration,
    negotiation_timeout: Duration,
    tracks: TrackCache,
    speaker: Option<Speaker>,
}

impl WebRtcLinkFactory {
    pub fn new(ice_servers: Vec<String>) -> Result<Self, Error> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::ConnectionError(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            Error::ConnectionError(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = ice_servers
            .into_iter()
            .map(|url| RTCIceServer {
                urls: vec![url],
                ..Default::default()
            })
            .collect();

        Ok(Self {
            api: Arc::new(api),
            rtc_config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            tracks: Arc::new(Mutex::new(HashMap::new())),
            speaker: None,
        })
    }

    /// Play remote audio from every link on `speaker`.
    pub fn with_speaker(mut self, speaker: Speaker) -> Self {
        self.speaker = Some(speaker);
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }
}

/// The RTP track every link uses for `track`, so all peers receive the same
/// stream. The flag is set when this call created it.
fn rtc_track(cache: &TrackCache, track: &MediaTrack) -> (Arc<TrackLocalStaticSample>, bool) {
    let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
    cache.retain(|_, (media, _)| media.is_live());
    if let Some((_, rtc)) = cache.get(track.id()) {
        return (rtc.clone(), false);
    }

    let codec = match track.kind() {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_PCMU.to_owned(),
            clock_rate: codec::PCMU_RATE,
            channels: 1,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    };
    let rtc = Arc::new(TrackLocalStaticSample::new(
        codec,
        track.id().to_string(),
        format!("huddle-{}", track.label()),
    ));
    cache.insert(track.id().to_string(), (track.clone(), rtc.clone()));
    (rtc, true)
}

/// Encode the frames `track` publishes onto `rtc` until the track ends.
async fn send_audio(track: MediaTrack, rtc: Arc<TrackLocalStaticSample>) {
    let mut frames = track.frames();
    loop {
        tokio::select! {
            _ = track.ended() => break,
            frame = frames.recv() => match frame {
                Ok(frame) => {
                    let sample = Sample {
                        data: Bytes::from(codec::encode_frame(&frame)),
                        duration: FRAME_DURATION,
                        ..Default::default()
                    };
                    if let Err(e) = rtc.write_sample(&sample).await {
                        debug!("Dropped audio frame for {}: {}", track.label(), e);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Audio sender for {} skipped {} frame(s)", track.label(), skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
    debug!("Audio sender for {} stopped", track.label());
}

/// Decode a remote PCMU track onto the speaker until the track closes.
async fn play_remote(track: Arc<TrackRemote>, source: PlaybackSource, participant: ParticipantId) {
    while let Ok((packet, _)) = track.read_rtp().await {
        if packet.header.payload_type == codec::PCMU_PAYLOAD_TYPE {
            source.play(&codec::decode_frame(&packet.payload));
        }
    }
    debug!("Remote audio from {} ended", participant);
}

impl PeerLinkFactory for WebRtcLinkFactory {
    fn create(&self, context: LinkContext) -> Result<Box<dyn PeerLink>, Error> {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(LinkState::Negotiating));
        let role = context.role;

        let driver = Driver {
            context,
            state: state.clone(),
            tracks: self.tracks.clone(),
            speaker: self.speaker.clone(),
            senders: HashMap::new(),
            renegotiate: false,
        };
        tokio::spawn(driver.run(
            self.api.clone(),
            self.rtc_config.clone(),
            self.negotiation_timeout,
            commands_rx,
        ));

        Ok(Box::new(WebRtcLink {
            role,
            state,
            commands,
        }))
    }
}

enum Command {
    Signal(SignalPayload),
    AddTrack(MediaTrack),
    RemoveTrack(MediaTrack),
    Close,
}

/// Handle to a peer connection running on its driver task.
pub struct WebRtcLink {
    role: Role,
    state: Arc<Mutex<LinkState>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl WebRtcLink {
    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Link driver already stopped");
        }
    }
}

impl PeerLink for WebRtcLink {
    fn role(&self) -> Role {
        self.role
    }

    fn state(&self) -> LinkState {
        *lock(&self.state)
    }

    fn signal(&self, payload: SignalPayload) {
        self.send(Command::Signal(payload));
    }

    fn add_track(&self, track: &MediaTrack) {
        self.send(Command::AddTrack(track.clone()));
    }

    fn remove_track(&self, track: &MediaTrack) {
        self.send(Command::RemoveTrack(track.clone()));
    }

    fn close(&self) {
        *lock(&self.state) = LinkState::Closed;
        self.send(Command::Close);
    }
}

impl Drop for WebRtcLink {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock(state: &Mutex<LinkState>) -> MutexGuard<'_, LinkState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

struct Driver {
    context: LinkContext,
    state: Arc<Mutex<LinkState>>,
    tracks: TrackCache,
    speaker: Option<Speaker>,
    senders: HashMap<String, Arc<RTCRtpSender>>,
    /// Track set changed while still negotiating
    renegotiate: bool,
}

impl Driver {
    async fn run(
        mut self,
        api: Arc<API>,
        config: RTCConfiguration,
        timeout: Duration,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let participant = self.context.participant.clone();
        let pc = match api.new_peer_connection(config).await {
            Ok(pc) => Arc::new(pc),
            Err(e) => {
                self.fail(format!("Failed to create peer connection: {}", e));
                return;
            }
        };

        let (pc_states, mut pc_states_rx) = mpsc::unbounded_channel();
        let label = participant.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!("Peer connection state change for {}: {}", label, state);
            let _ = pc_states.send(state);
            Box::pin(async {})
        }));

        let label = participant.clone();
        let speaker = self.speaker.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            info!("Remote {} track {} from {}", track.kind(), track.id(), label);
            if track.kind() == RTPCodecType::Audio {
                if let Some(speaker) = &speaker {
                    tokio::spawn(play_remote(track, speaker.source(), label.clone()));
                }
            }
            Box::pin(async {})
        }));

        for track in self.context.tracks.clone() {
            if let Err(e) = self.attach(&pc, &track).await {
                self.fail(e.to_string());
                close_pc(&pc).await;
                return;
            }
        }

        if self.context.role == Role::Initiator {
            if let Err(e) = self.offer(&pc).await {
                self.fail(e.to_string());
                close_pc(&pc).await;
                return;
            }
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            let negotiating = self.current() == LinkState::Negotiating;
            tokio::select! {
                command = commands.recv() => {
                    let result = match command {
                        None | Some(Command::Close) => break,
                        Some(Command::Signal(payload)) => self.handle_signal(&pc, payload).await,
                        Some(Command::AddTrack(track)) => {
                            match self.attach(&pc, &track).await {
                                Ok(()) => self.tracks_changed(&pc).await,
                                Err(e) => Err(e),
                            }
                        }
                        Some(Command::RemoveTrack(track)) => {
                            match self.detach(&pc, &track).await {
                                Ok(()) => self.tracks_changed(&pc).await,
                                Err(e) => Err(e),
                            }
                        }
                    };
                    if let Err(e) = result {
                        self.fail(e.to_string());
                        break;
                    }
                }
                Some(state) = pc_states_rx.recv() => {
                    match state {
                        RTCPeerConnectionState::Connected => {
                            if self.connected() && self.renegotiate {
                                self.renegotiate = false;
                                if let Err(e) = self.request_renegotiation(&pc).await {
                                    self.fail(e.to_string());
                                    break;
                                }
                            }
                        }
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                            self.fail(format!("peer connection {}", state));
                            break;
                        }
                        RTCPeerConnectionState::Disconnected => {
                            warn!("Peer connection to {} interrupted", participant);
                        }
                        _ => {}
                    }
                }
                _ = &mut deadline, if negotiating => {
                    self.fail("negotiation timed out".to_string());
                    break;
                }
            }
        }

        close_pc(&pc).await;
        debug!("Link #{} to {} stopped", self.context.link, participant);
    }

    fn current(&self) -> LinkState {
        *lock(&self.state)
    }

    fn connected(&self) -> bool {
        let mut state = lock(&self.state);
        if *state != LinkState::Negotiating {
            return *state == LinkState::Connected;
        }
        *state = LinkState::Connected;
        drop(state);
        info!("Link to {} connected", self.context.participant);
        self.context.emit(LinkEventKind::Connected);
        true
    }

    /// Close on our own. Silent when the owner already closed the link.
    fn fail(&self, reason: String) {
        let mut state = lock(&self.state);
        if *state == LinkState::Closed {
            return;
        }
        *state = LinkState::Closed;
        drop(state);
        error!("Link to {} closed: {}", self.context.participant, reason);
        self.context.emit(LinkEventKind::Closed { reason });
    }

    fn send(&self, message: &NegotiationMessage) -> Result<(), Error> {
        let payload = serde_json::to_value(message)?;
        self.context.emit(LinkEventKind::Signal(payload));
        Ok(())
    }

    async fn attach(&mut self, pc: &RTCPeerConnection, track: &MediaTrack) -> Result<(), Error> {
        if self.senders.contains_key(track.id()) {
            return Ok(());
        }
        let (rtc, created) = rtc_track(&self.tracks, track);
        if created && track.kind() == TrackKind::Audio {
            tokio::spawn(send_audio(track.clone(), rtc.clone()));
        }
        let rtc: Arc<dyn TrackLocal + Send + Sync> = rtc;
        let sender = pc
            .add_track(rtc)
            .await
            .map_err(|e| self.negotiation_error(format!("Failed to add track: {}", e)))?;
        debug!("Attached {} to link {}", track.label(), self.context.link);
        self.senders.insert(track.id().to_string(), sender);
        Ok(())
    }

    async fn detach(&mut self, pc: &RTCPeerConnection, track: &MediaTrack) -> Result<(), Error> {
        if let Some(sender) = self.senders.remove(track.id()) {
            pc.remove_track(&sender)
                .await
                .map_err(|e| self.negotiation_error(format!("Failed to remove track: {}", e)))?;
            debug!("Detached {} from link {}", track.label(), self.context.link);
        }
        Ok(())
    }

    async fn tracks_changed(&mut self, pc: &RTCPeerConnection) -> Result<(), Error> {
        if self.current() == LinkState::Connected {
            self.request_renegotiation(pc).await
        } else {
            self.renegotiate = true;
            Ok(())
        }
    }

    async fn request_renegotiation(&mut self, pc: &RTCPeerConnection) -> Result<(), Error> {
        match self.context.role {
            Role::Initiator => self.offer(pc).await,
            Role::Responder => self.send(&NegotiationMessage::Renegotiate),
        }
    }

    async fn handle_signal(
        &mut self,
        pc: &RTCPeerConnection,
        payload: SignalPayload,
    ) -> Result<(), Error> {
        let message: NegotiationMessage = match serde_json::from_value(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "Ignoring malformed signal from {}: {}",
                    self.context.participant, e
                );
                return Ok(());
            }
        };

        match message {
            NegotiationMessage::Offer { sdp } => {
                let offer = RTCSessionDescription::offer(sdp)
                    .map_err(|e| self.negotiation_error(format!("Failed to parse offer: {}", e)))?;
                pc.set_remote_description(offer).await.map_err(|e| {
                    self.negotiation_error(format!("Failed to set remote description: {}", e))
                })?;
                let answer = pc.create_answer(None).await.map_err(|e| {
                    self.negotiation_error(format!("Failed to create answer: {}", e))
                })?;
                let sdp = self.gather(pc, answer).await?;
                self.send(&NegotiationMessage::Answer { sdp })
            }
            NegotiationMessage::Answer { sdp } => {
                let answer = RTCSessionDescription::answer(sdp).map_err(|e| {
                    self.negotiation_error(format!("Failed to parse answer: {}", e))
                })?;
                pc.set_remote_description(answer).await.map_err(|e| {
                    self.negotiation_error(format!("Failed to set remote description: {}", e))
                })
            }
            NegotiationMessage::Renegotiate => {
                if self.context.role != Role::Initiator {
                    warn!("Responder got a renegotiation request, ignoring");
                    return Ok(());
                }
                if self.current() == LinkState::Connected {
                    self.offer(pc).await
                } else {
                    self.renegotiate = true;
                    Ok(())
                }
            }
        }
    }

    async fn offer(&self, pc: &RTCPeerConnection) -> Result<(), Error> {
        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| self.negotiation_error(format!("Failed to create offer: {}", e)))?;
        let sdp = self.gather(pc, offer).await?;
        debug!("Created offer for {}", self.context.participant);
        self.send(&NegotiationMessage::Offer { sdp })
    }

    /// Apply a local description and wait for ICE gathering so the SDP carries
    /// every candidate.
    async fn gather(
        &self,
        pc: &RTCPeerConnection,
        description: RTCSessionDescription,
    ) -> Result<String, Error> {
        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(description).await.map_err(|e| {
            self.negotiation_error(format!("Failed to set local description: {}", e))
        })?;
        let _ = gathered.recv().await;
        pc.local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| self.negotiation_error("No local description".to_string()))
    }

    fn negotiation_error(&self, reason: String) -> Error {
        Error::NegotiationFailed {
            participant: self.context.participant.clone(),
            reason,
        }
    }
}

async fn close_pc(pc: &RTCPeerConnection) {
    if let Err(e) = pc.close().await {
        debug!("Error closing peer connection: {}", e);
    }
}
