use crate::roster::ParticipantRoster;
use log::{debug, error, info, warn};
use media_io::{LocalMedia, MediaDevices, MediaStream};
use mesh::{LinkEvent, LinkEventKind, PeerLinkFactory, PeerMesh, SignalBuffer};
use signaling::{SignalingChannel, SignalingLink};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use voice_core::{
    ChannelId, Error, LinkState, LocalIdentity, Participant, ParticipantPatch,
    Phase, Role, ScreenShare, SessionEvent, SignalingEvent,
};

/// Point-in-time view of the session for observers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub phase: Phase,
    pub channel: Option<ChannelId>,
    pub local: Option<LocalIdentity>,
    pub is_muted: bool,
    pub screen_share: ScreenShare,
    /// Remote participants, ordered by id
    pub participants: Vec<Participant>,
}

/// Tunables of a controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub username: String,
    pub signal_buffer: SignalBuffer,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            username: "Anonymous".to_string(),
            signal_buffer: SignalBuffer::default(),
        }
    }
}

/// Resources of the session between `connect` and `disconnect`.
struct Active {
    channel: ChannelId,
    identity: LocalIdentity,
    token: CancellationToken,
    media: Option<LocalMedia>,
    link: Option<Arc<dyn SignalingLink>>,
    mesh: Option<PeerMesh>,
    roster: ParticipantRoster,
    muted: bool,
    screen: ScreenShare,
}

struct State {
    phase: Phase,
    /// Bumped on every connect so work from an older session can tell it is stale
    generation: u64,
    active: Option<Active>,
}

impl State {
    fn current(&mut self, generation: u64) -> Option<&mut Active> {
        if self.generation != generation {
            return None;
        }
        self.active
            .as_mut()
            .filter(|active| !active.token.is_cancelled())
    }
}

struct Shared {
    devices: Arc<dyn MediaDevices>,
    signaling: Arc<dyn SignalingChannel>,
    links: Arc<dyn PeerLinkFactory>,
    config: ControllerConfig,
    state: Mutex<State>,
    snapshot: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
}

/// Coordinates one voice session: capture devices, the relay connection and
/// the peer mesh.
///
/// Every mutation of the session happens with the state lock held, so
/// handlers for UI calls, relay events and link events never interleave.
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct VoiceSessionController {
    shared: Arc<Shared>,
}

impl VoiceSessionController {
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        signaling: Arc<dyn SignalingChannel>,
        links: Arc<dyn PeerLinkFactory>,
    ) -> Self {
        Self::with_config(devices, signaling, links, ControllerConfig::default())
    }

    pub fn with_config(
        devices: Arc<dyn MediaDevices>,
        signaling: Arc<dyn SignalingChannel>,
        links: Arc<dyn PeerLinkFactory>,
        config: ControllerConfig,
    ) -> Self {
        let (snapshot, _) = watch::channel(SessionSnapshot::default());
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                devices,
                signaling,
                links,
                config,
                state: Mutex::new(State {
                    phase: Phase::Idle,
                    generation: 0,
                    active: None,
                }),
                snapshot,
                events,
            }),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    pub fn phase(&self) -> Phase {
        self.shared.snapshot.borrow().phase
    }

    /// Watch session snapshots; a new value is published after every change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshot.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Number of peer links currently held by the session.
    pub async fn link_count(&self) -> usize {
        let state = self.shared.state.lock().await;
        state
            .active
            .as_ref()
            .and_then(|active| active.mesh.as_ref())
            .map(PeerMesh::len)
            .unwrap_or(0)
    }

    /// The local capture owned by the session, if any.
    pub async fn local_media(&self) -> Option<LocalMedia> {
        let state = self.shared.state.lock().await;
        state.active.as_ref().and_then(|active| active.media.clone())
    }

    /// Join `channel`: acquire the microphone, then open the relay connection.
    ///
    /// Either failure returns the session to `Idle` with nothing held. A
    /// `disconnect` issued meanwhile makes this return `Error::Cancelled`.
    pub async fn connect(&self, channel: impl Into<ChannelId>) -> Result<(), Error> {
        let channel = channel.into();
        let shared = &self.shared;

        let (generation, token, identity) = {
            let mut state = shared.state.lock().await;
            if state.phase != Phase::Idle {
                return Err(Error::InvalidState(format!(
                    "cannot connect while {:?}",
                    state.phase
                )));
            }
            state.generation += 1;
            let token = CancellationToken::new();
            let identity = LocalIdentity::new(shared.config.username.clone());
            info!("Connecting to {} as {}", channel, identity.id);
            state.active = Some(Active {
                channel: channel.clone(),
                identity: identity.clone(),
                token: token.clone(),
                media: None,
                link: None,
                mesh: None,
                roster: ParticipantRoster::new(),
                muted: false,
                screen: ScreenShare::Off,
            });
            shared.set_phase(&mut state, Phase::Connecting);
            (state.generation, token, identity)
        };

        let microphone = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            result = shared.devices.acquire_microphone() => result,
        };

        {
            let mut state = shared.state.lock().await;
            let Some(active) = state.current(generation) else {
                if let Ok(stream) = &microphone {
                    shared.devices.release(stream);
                }
                return Err(Error::Cancelled);
            };
            match microphone {
                Ok(stream) => {
                    debug!("Microphone acquired: {:?}", stream);
                    active.media = Some(LocalMedia::new(stream));
                }
                Err(e) => {
                    warn!("Microphone unavailable, aborting connect: {}", e);
                    shared.abort_connect(&mut state);
                    return Err(e);
                }
            }
        }

        let opened = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            result = shared.signaling.open(&channel, &identity) => result,
        };
        let mut opened = match opened {
            Ok(opened) => opened,
            Err(e) => {
                let mut state = shared.state.lock().await;
                if state.current(generation).is_some() {
                    warn!("Could not reach relay: {}", e);
                    shared.abort_connect(&mut state);
                }
                return Err(e);
            }
        };
        let link: Arc<dyn SignalingLink> = Arc::from(opened.link);

        // The relay always leads with the roster snapshot.
        let first = tokio::select! {
            _ = token.cancelled() => None,
            event = opened.events.recv() => event,
        };

        let mut state = shared.state.lock().await;
        if state.current(generation).is_none() {
            drop(state);
            link.close().await;
            return Err(Error::Cancelled);
        }
        let Some(first) = first else {
            shared.abort_connect(&mut state);
            drop(state);
            link.close().await;
            return Err(Error::ConnectionError(
                "relay closed the channel during join".to_string(),
            ));
        };

        let (mesh, link_events) = PeerMesh::new(shared.links.clone(), shared.config.signal_buffer);
        if let Some(active) = state.current(generation) {
            active.link = Some(link);
            active.mesh = Some(mesh);
        }
        shared.set_phase(&mut state, Phase::Connected);
        shared.handle_signaling(&mut state, generation, first);
        drop(state);

        tokio::spawn(dispatch(
            shared.clone(),
            generation,
            token,
            opened.events,
            link_events,
        ));
        info!("Connected to {}", channel);
        Ok(())
    }

    /// Leave the session from any phase. Everything the session acquired is
    /// released before this returns.
    pub async fn disconnect(&self) {
        if !self.shared.shut_down(None).await {
            // Another caller may be mid-teardown; converge with it.
            let mut snapshots = self.shared.snapshot.subscribe();
            let _ = snapshots
                .wait_for(|s| s.phase != Phase::Disconnecting)
                .await;
        }
    }

    /// Flip every local microphone track and announce the new mute state.
    /// Returns whether the microphone is now muted.
    pub async fn toggle_mute(&self) -> Result<bool, Error> {
        let shared = &self.shared;
        let mut state = shared.state.lock().await;
        if state.phase != Phase::Connected {
            return Err(Error::InvalidState("not connected".to_string()));
        }
        let generation = state.generation;
        let Some(active) = state.current(generation) else {
            return Err(Error::InvalidState("not connected".to_string()));
        };
        let Some(media) = &active.media else {
            return Err(Error::InvalidState("not connected".to_string()));
        };
        let mut first_enabled = None;
        for track in media.microphone.audio_tracks() {
            track.set_enabled(!track.is_enabled());
            first_enabled.get_or_insert(track.is_enabled());
        }
        let muted = !first_enabled.unwrap_or(!active.muted);
        active.muted = muted;
        info!("Microphone {}", if muted { "muted" } else { "unmuted" });

        if let Some(link) = &active.link {
            if let Err(e) = link.broadcast_update(&ParticipantPatch::muted(muted)) {
                warn!("Failed to announce mute state: {}", e);
            }
        }
        shared.emit(SessionEvent::MuteChanged(muted));
        shared.publish(&state);
        Ok(muted)
    }

    /// Start sharing the screen, or stop the active share. Returns whether a
    /// share is active afterwards.
    ///
    /// A refused capture prompt leaves the voice connection untouched and
    /// is returned as `PermissionDenied`.
    pub async fn toggle_screen_share(&self) -> Result<bool, Error> {
        let shared = &self.shared;
        let (generation, token) = {
            let mut state = shared.state.lock().await;
            if state.phase != Phase::Connected {
                return Err(Error::InvalidState("not connected".to_string()));
            }
            let generation = state.generation;
            let Some(active) = state.current(generation) else {
                return Err(Error::InvalidState("not connected".to_string()));
            };
            match active.screen {
                ScreenShare::Requesting => {
                    return Err(Error::InvalidState(
                        "screen capture request already pending".to_string(),
                    ))
                }
                ScreenShare::Active => {
                    shared.stop_screen(active);
                    shared.publish(&state);
                    return Ok(false);
                }
                ScreenShare::Off => {
                    active.screen = ScreenShare::Requesting;
                    let token = active.token.clone();
                    shared.publish(&state);
                    (generation, token)
                }
            }
        };

        let result = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            result = shared.devices.acquire_screen() => result,
        };

        let mut state = shared.state.lock().await;
        let Some(active) = state.current(generation) else {
            if let Ok(stream) = &result {
                shared.devices.release(stream);
            }
            return Err(Error::Cancelled);
        };

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                info!("Screen capture not started: {}", e);
                active.screen = ScreenShare::Off;
                shared.publish(&state);
                return Err(e);
            }
        };

        if let Some(mesh) = active.mesh.as_mut() {
            mesh.attach_track(&stream);
        }
        if let Some(media) = active.media.as_mut() {
            media.screen = Some(stream.clone());
        }
        active.screen = ScreenShare::Active;
        if let Some(link) = &active.link {
            if let Err(e) = link.broadcast_update(&ParticipantPatch::screen_sharing(true)) {
                warn!("Failed to announce screen share: {}", e);
            }
        }
        info!("Screen share started");
        shared.emit(SessionEvent::ScreenShareChanged(true));
        shared.publish(&state);
        drop(state);

        tokio::spawn(watch_screen_end(shared.clone(), generation, token, stream));
        Ok(true)
    }
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self, state: &State) {
        let snapshot = match &state.active {
            Some(active) => SessionSnapshot {
                phase: state.phase,
                channel: Some(active.channel.clone()),
                local: Some(active.identity.clone()),
                is_muted: active.muted,
                screen_share: active.screen,
                participants: active.roster.snapshot(),
            },
            None => SessionSnapshot {
                phase: state.phase,
                ..Default::default()
            },
        };
        self.snapshot.send_replace(snapshot);
    }

    fn set_phase(&self, state: &mut State, phase: Phase) {
        if state.phase != phase {
            debug!("Session phase {:?} -> {:?}", state.phase, phase);
            state.phase = phase;
            self.emit(SessionEvent::PhaseChanged(phase));
        }
        self.publish(state);
    }

    /// Drop a connect attempt that failed before reaching `Connected`.
    fn abort_connect(&self, state: &mut State) {
        if let Some(active) = state.active.take() {
            active.token.cancel();
            if let Some(media) = active.media {
                media.release(self.devices.as_ref());
            }
        }
        self.set_phase(state, Phase::Idle);
    }

    /// Tear the session down. With `generation` set, only that session is
    /// affected. Returns false when there was nothing to tear down.
    async fn shut_down(&self, generation: Option<u64>) -> bool {
        let link = {
            let mut state = self.state.lock().await;
            if generation.is_some_and(|g| g != state.generation) {
                return false;
            }
            if matches!(state.phase, Phase::Idle | Phase::Disconnecting) {
                debug!("Nothing to disconnect in phase {:?}", state.phase);
                return false;
            }
            info!("Disconnecting from {:?}", state.phase);
            let Some(active) = state.active.take() else {
                self.set_phase(&mut state, Phase::Idle);
                return true;
            };
            self.set_phase(&mut state, Phase::Disconnecting);

            active.token.cancel();
            if let Some(mut mesh) = active.mesh {
                mesh.destroy_all();
            }
            if let Some(media) = active.media {
                media.release(self.devices.as_ref());
            }
            active.link
        };

        if let Some(link) = link {
            link.close().await;
        }

        let mut state = self.state.lock().await;
        if state.phase == Phase::Disconnecting {
            self.set_phase(&mut state, Phase::Idle);
        }
        info!("Disconnected");
        true
    }

    fn stop_screen(&self, active: &mut Active) {
        if let Some(stream) = active.media.as_mut().and_then(|m| m.screen.take()) {
            if let Some(mesh) = active.mesh.as_mut() {
                mesh.detach_track(&stream);
            }
            self.devices.release(&stream);
        }
        active.screen = ScreenShare::Off;
        if let Some(link) = &active.link {
            if let Err(e) = link.broadcast_update(&ParticipantPatch::screen_sharing(false)) {
                warn!("Failed to announce end of screen share: {}", e);
            }
        }
        info!("Screen share stopped");
        self.emit(SessionEvent::ScreenShareChanged(false));
    }

    fn handle_signaling(&self, state: &mut State, generation: u64, event: SignalingEvent) {
        if state.phase != Phase::Connected {
            return;
        }
        let Some(active) = state.current(generation) else {
            return;
        };

        match event {
            SignalingEvent::RosterSnapshot { participants } => {
                debug!("Roster snapshot with {} participant(s)", participants.len());
                for info in participants {
                    if info.id == active.identity.id {
                        continue;
                    }
                    self.add_participant(active, Participant::from(info), Role::Responder);
                }
            }
            SignalingEvent::ParticipantJoined { id, username } => {
                if id == active.identity.id {
                    return;
                }
                self.add_participant(active, Participant::new(id, username), Role::Initiator);
            }
            SignalingEvent::ParticipantLeft { id } => {
                if let Some(mesh) = active.mesh.as_mut() {
                    mesh.destroy_link(&id);
                }
                if active.roster.remove(&id).is_some() {
                    info!("{} left", id);
                    self.emit(SessionEvent::ParticipantLeft(id));
                }
            }
            SignalingEvent::Signal { from, payload } => {
                if let Some(mesh) = active.mesh.as_mut() {
                    mesh.forward_signal(&from, payload);
                }
                return;
            }
            SignalingEvent::ParticipantUpdated { id, patch } => {
                active.roster.apply_patch(&id, &patch);
            }
        }
        self.publish(state);
    }

    fn add_participant(&self, active: &mut Active, participant: Participant, role: Role) {
        let (Some(mesh), Some(media)) = (active.mesh.as_mut(), active.media.as_ref()) else {
            return;
        };
        let id = participant.id.clone();
        match mesh.create_link(&id, role, media) {
            Ok(_) => {
                info!("{} ({}) joined", participant.username, id);
                active.roster.upsert(participant);
                self.emit(SessionEvent::ParticipantJoined(id));
            }
            Err(Error::DuplicateLink(id)) => {
                error!("Ignoring second join for {}: link already exists", id);
            }
            Err(e) => {
                warn!("Could not create link to {}: {}", id, e);
                self.emit(SessionEvent::LinkFailed {
                    participant: id,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn handle_link_event(&self, state: &mut State, generation: u64, event: LinkEvent) {
        let Some(active) = state.current(generation) else {
            return;
        };
        let Some(mesh) = active.mesh.as_mut() else {
            return;
        };
        if !mesh.is_current(&event) {
            debug!("Ignoring event from stale link #{}", event.link);
            return;
        }

        let participant = event.participant;
        match event.kind {
            LinkEventKind::Signal(payload) => {
                if let Some(link) = &active.link {
                    if let Err(e) = link.send_signal(&participant, payload) {
                        warn!("Failed to send signal to {}: {}", participant, e);
                    }
                }
                return;
            }
            LinkEventKind::Connected => {
                active
                    .roster
                    .set_link_state(&participant, LinkState::Connected);
                self.emit(SessionEvent::LinkConnected(participant));
            }
            LinkEventKind::Closed { reason } => {
                warn!("Link to {} failed: {}", participant, reason);
                mesh.destroy_link(&participant);
                active.roster.remove(&participant);
                self.emit(SessionEvent::LinkFailed {
                    participant,
                    reason,
                });
            }
        }
        self.publish(state);
    }

    async fn screen_ended(&self, generation: u64, stream: &MediaStream) {
        let mut state = self.state.lock().await;
        let Some(active) = state.current(generation) else {
            return;
        };
        let sharing_this = active
            .media
            .as_ref()
            .and_then(|m| m.screen.as_ref())
            .is_some_and(|s| s.id() == stream.id());
        if sharing_this {
            info!("Screen capture ended by the system");
            self.stop_screen(active);
            self.publish(&state);
        }
    }
}

/// Consume relay and link events for one session until it ends.
async fn dispatch(
    shared: Arc<Shared>,
    generation: u64,
    token: CancellationToken,
    mut signaling: mpsc::UnboundedReceiver<SignalingEvent>,
    mut links: mpsc::UnboundedReceiver<LinkEvent>,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            event = signaling.recv() => match event {
                Some(event) => {
                    let mut state = shared.state.lock().await;
                    shared.handle_signaling(&mut state, generation, event);
                }
                None => {
                    if token.is_cancelled() {
                        break;
                    }
                    warn!("Relay connection lost");
                    if shared.shut_down(Some(generation)).await {
                        shared.emit(SessionEvent::SignalingLost);
                    }
                    break;
                }
            },
            Some(event) = links.recv() => {
                let mut state = shared.state.lock().await;
                shared.handle_link_event(&mut state, generation, event);
            }
        }
    }
    debug!("Dispatch loop for session {} stopped", generation);
}

async fn watch_screen_end(
    shared: Arc<Shared>,
    generation: u64,
    token: CancellationToken,
    stream: MediaStream,
) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = stream.ended() => shared.screen_ended(generation, &stream).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use media_io::fake::{FakeDevices, Grant};
    use media_io::MockMediaDevices;
    use mesh::RecordingLinkFactory;
    use serde_json::json;
    use signaling::{
        LocalSignaling, MockSignalingChannel, MockSignalingLink, OpenChannel, Relay,
        ServerMessage,
    };
    use std::time::Duration;
    use test_log::test;
    use voice_core::{CaptureSource, ParticipantId, PeerInfo};

    struct Fixture {
        devices: Arc<FakeDevices>,
        signaling: LocalSignaling,
        relay: Relay,
        links: RecordingLinkFactory,
        controller: VoiceSessionController,
    }

    fn fixture_with(devices: FakeDevices) -> Fixture {
        let devices = Arc::new(devices);
        let relay = Relay::new();
        let signaling = LocalSignaling::new(relay.clone());
        let links = RecordingLinkFactory::new();
        let controller = VoiceSessionController::new(
            devices.clone(),
            Arc::new(signaling.clone()),
            Arc::new(links.clone()),
        );
        Fixture {
            devices,
            signaling,
            relay,
            links,
            controller,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(FakeDevices::new())
    }

    async fn wait_until(
        controller: &VoiceSessionController,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        let mut snapshots = controller.subscribe();
        let snapshot = tokio::time::timeout(Duration::from_secs(5), snapshots.wait_for(predicate))
            .await
            .expect("timed out waiting for session state")
            .expect("controller dropped")
            .clone();
        snapshot
    }

    async fn next_message(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for relay message")
            .expect("relay dropped member")
    }

    fn local_id(controller: &VoiceSessionController) -> ParticipantId {
        controller.snapshot().local.expect("no local identity").id
    }

    #[test(tokio::test)]
    async fn connect_to_empty_channel() {
        let f = fixture();
        f.controller.connect("ch1").await.unwrap();

        let snapshot = f.controller.snapshot();
        assert_eq!(snapshot.phase, Phase::Connected);
        assert_eq!(snapshot.channel, Some(ChannelId::from("ch1")));
        assert!(snapshot.participants.is_empty());
        assert_eq!(f.controller.link_count().await, 0);
        assert_eq!(f.relay.members(&ChannelId::from("ch1")).len(), 1);
    }

    #[test(tokio::test)]
    async fn joiner_gets_initiator_link() {
        let f = fixture();
        f.controller.connect("ch1").await.unwrap();

        let _bob = f
            .relay
            .join(&ChannelId::from("ch1"), &ParticipantId::from("u2"), "Bob")
            .unwrap();
        let snapshot = wait_until(&f.controller, |s| s.participants.len() == 1).await;

        assert_eq!(snapshot.participants[0].id, ParticipantId::from("u2"));
        assert_eq!(snapshot.participants[0].username, "Bob");
        assert_eq!(f.controller.link_count().await, 1);
        let link = f.links.latest(&ParticipantId::from("u2")).unwrap();
        assert_eq!(link.role(), Role::Initiator);
        assert_eq!(f.links.created(), 1);
    }

    #[test(tokio::test)]
    async fn newcomer_answers_everyone_present() {
        let f = fixture();
        let ch = ChannelId::from("ch1");
        let _bob = f.relay.join(&ch, &ParticipantId::from("u2"), "Bob").unwrap();
        let _carol = f.relay.join(&ch, &ParticipantId::from("u3"), "Carol").unwrap();

        f.controller.connect("ch1").await.unwrap();

        let snapshot = f.controller.snapshot();
        assert_eq!(snapshot.participants.len(), 2);
        assert_eq!(f.controller.link_count().await, 2);
        for link in f.links.links() {
            assert_eq!(link.role(), Role::Responder);
        }
    }

    #[test(tokio::test)]
    async fn link_created_during_share_carries_screen() {
        let f = fixture();
        let ch = ChannelId::from("ch1");
        f.controller.connect("ch1").await.unwrap();
        assert!(f.controller.toggle_screen_share().await.unwrap());

        let _carol = f.relay.join(&ch, &ParticipantId::from("u3"), "Carol").unwrap();
        wait_until(&f.controller, |s| s.participants.len() == 1).await;

        let media = f.controller.local_media().await.unwrap();
        let screen = media.screen.expect("screen stream");
        let link = f.links.latest(&ParticipantId::from("u3")).unwrap();
        assert!(link.has_track(&screen.tracks()[0]));
        assert!(link.has_track(&media.microphone.tracks()[0]));
    }

    #[test(tokio::test)]
    async fn denied_microphone_never_opens_signaling() {
        let mut devices = MockMediaDevices::new();
        devices
            .expect_acquire_microphone()
            .times(1)
            .returning(|| Err(Error::PermissionDenied(CaptureSource::Microphone)));
        let mut signaling = MockSignalingChannel::new();
        signaling.expect_open().times(0);

        let controller = VoiceSessionController::new(
            Arc::new(devices),
            Arc::new(signaling),
            Arc::new(RecordingLinkFactory::new()),
        );
        let mut events = controller.events();

        let err = controller.connect("ch1").await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(CaptureSource::Microphone)));
        assert!(err.is_user_visible());
        assert_eq!(controller.phase(), Phase::Idle);
        assert_eq!(controller.snapshot(), SessionSnapshot::default());

        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::PhaseChanged(Phase::Connecting)
        );
        assert_eq!(events.try_recv().unwrap(), SessionEvent::PhaseChanged(Phase::Idle));
    }

    #[test(tokio::test)]
    async fn unreachable_relay_releases_microphone() {
        let f = fixture();
        f.signaling.set_reachable(false);

        let err = f.controller.connect("ch1").await.unwrap_err();
        assert!(matches!(err, Error::ConnectionError(_)));
        assert_eq!(f.controller.phase(), Phase::Idle);
        assert_eq!(f.devices.released_tracks(), 1);
        assert_eq!(f.devices.live_tracks(), 0);
    }

    #[test(tokio::test)]
    async fn disconnect_while_opening_signaling() {
        let f = fixture();
        let _hold = f.signaling.hold_open();

        let controller = f.controller.clone();
        let connecting = tokio::spawn(async move { controller.connect("ch1").await });
        f.signaling.opening().await;
        assert_eq!(f.controller.phase(), Phase::Connecting);

        f.controller.disconnect().await;

        assert_eq!(f.controller.phase(), Phase::Idle);
        assert!(matches!(connecting.await.unwrap(), Err(Error::Cancelled)));
        assert_eq!(f.devices.released_tracks(), 1);
        assert_eq!(f.devices.live_tracks(), 0);
        assert!(f.relay.members(&ChannelId::from("ch1")).is_empty());
        assert_eq!(f.controller.link_count().await, 0);
    }

    #[test(tokio::test)]
    async fn disconnect_while_microphone_prompt_open() {
        let f = fixture();
        let gate = f.devices.hold_microphone();

        let controller = f.controller.clone();
        let connecting = tokio::spawn(async move { controller.connect("ch1").await });
        f.devices.requested().await;

        f.controller.disconnect().await;
        gate.open();

        assert!(matches!(connecting.await.unwrap(), Err(Error::Cancelled)));
        assert_eq!(f.controller.phase(), Phase::Idle);
        assert_eq!(f.devices.live_tracks(), 0);
        assert_eq!(f.signaling.open_attempts(), 0);
    }

    #[test(tokio::test)]
    async fn disconnect_is_idempotent() {
        let f = fixture();
        f.controller.disconnect().await;
        assert_eq!(f.controller.phase(), Phase::Idle);

        f.controller.connect("ch1").await.unwrap();
        let _bob = f
            .relay
            .join(&ChannelId::from("ch1"), &ParticipantId::from("u2"), "Bob")
            .unwrap();
        wait_until(&f.controller, |s| s.participants.len() == 1).await;

        f.controller.disconnect().await;
        assert_eq!(f.devices.released_tracks(), 1);
        assert!(f.links.open_links().is_empty());
        assert_eq!(f.controller.snapshot(), SessionSnapshot::default());

        f.controller.disconnect().await;
        assert_eq!(f.devices.released_tracks(), 1);
        assert_eq!(f.controller.phase(), Phase::Idle);

        // a fresh session can follow
        f.controller.connect("ch1").await.unwrap();
        assert_eq!(f.controller.snapshot().participants.len(), 1);
    }

    #[test(tokio::test)]
    async fn connect_twice_is_rejected() {
        let f = fixture();
        f.controller.connect("ch1").await.unwrap();
        assert!(matches!(
            f.controller.connect("ch2").await,
            Err(Error::InvalidState(_))
        ));
        assert_eq!(f.controller.snapshot().channel, Some(ChannelId::from("ch1")));
    }

    #[test(tokio::test)]
    async fn mute_round_trip() {
        let f = fixture();
        let ch = ChannelId::from("ch1");
        assert!(matches!(
            f.controller.toggle_mute().await,
            Err(Error::InvalidState(_))
        ));

        f.controller.connect("ch1").await.unwrap();
        let me = local_id(&f.controller);
        let mut bob = f.relay.join(&ch, &ParticipantId::from("u2"), "Bob").unwrap();
        next_message(&mut bob).await;

        assert!(f.controller.toggle_mute().await.unwrap());
        let media = f.controller.local_media().await.unwrap();
        assert!(media.microphone.tracks().iter().all(|t| !t.is_enabled()));
        assert!(f.controller.snapshot().is_muted);
        assert_eq!(
            next_message(&mut bob).await,
            ServerMessage::UserUpdated {
                user_id: me.clone(),
                updates: ParticipantPatch::muted(true),
            }
        );

        assert!(!f.controller.toggle_mute().await.unwrap());
        assert!(media.microphone.tracks().iter().all(|t| t.is_enabled()));
        assert_eq!(
            next_message(&mut bob).await,
            ServerMessage::UserUpdated {
                user_id: me,
                updates: ParticipantPatch::muted(false),
            }
        );
    }

    #[test(tokio::test)]
    async fn screen_denial_keeps_voice() {
        let f = fixture_with(FakeDevices::new().with_screen(Grant::Deny));
        let ch = ChannelId::from("ch1");
        f.controller.connect("ch1").await.unwrap();
        let mut bob = f.relay.join(&ch, &ParticipantId::from("u2"), "Bob").unwrap();
        next_message(&mut bob).await;
        wait_until(&f.controller, |s| s.participants.len() == 1).await;

        let err = f.controller.toggle_screen_share().await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(CaptureSource::Screen)));

        let snapshot = f.controller.snapshot();
        assert_eq!(snapshot.phase, Phase::Connected);
        assert_eq!(snapshot.screen_share, ScreenShare::Off);
        assert_eq!(f.controller.link_count().await, 1);
        assert!(bob.try_recv().is_err());

        // permission granted on a second attempt
        f.devices.set_screen(Grant::Allow);
        assert!(f.controller.toggle_screen_share().await.unwrap());
    }

    #[test(tokio::test)]
    async fn stopping_share_detaches_everywhere() {
        let f = fixture();
        let ch = ChannelId::from("ch1");
        f.controller.connect("ch1").await.unwrap();
        let me = local_id(&f.controller);
        let mut bob = f.relay.join(&ch, &ParticipantId::from("u2"), "Bob").unwrap();
        next_message(&mut bob).await;
        wait_until(&f.controller, |s| s.participants.len() == 1).await;

        assert!(f.controller.toggle_screen_share().await.unwrap());
        let screen = f.controller.local_media().await.unwrap().screen.unwrap();
        let video = screen.tracks()[0].clone();
        let u2 = f.links.latest(&ParticipantId::from("u2")).unwrap();
        assert!(u2.has_track(&video));
        assert_eq!(
            next_message(&mut bob).await,
            ServerMessage::UserUpdated {
                user_id: me.clone(),
                updates: ParticipantPatch::screen_sharing(true),
            }
        );

        assert!(!f.controller.toggle_screen_share().await.unwrap());
        assert!(!u2.has_track(&video));
        assert!(!video.is_live());
        assert_eq!(f.controller.snapshot().screen_share, ScreenShare::Off);
        assert_eq!(
            next_message(&mut bob).await,
            ServerMessage::UserUpdated {
                user_id: me,
                updates: ParticipantPatch::screen_sharing(false),
            }
        );

        let _carol = f.relay.join(&ch, &ParticipantId::from("u3"), "Carol").unwrap();
        wait_until(&f.controller, |s| s.participants.len() == 2).await;
        let u3 = f.links.latest(&ParticipantId::from("u3")).unwrap();
        assert!(!u3.has_track(&video));
        assert_eq!(u3.tracks().len(), 1);
    }

    #[test(tokio::test)]
    async fn system_ending_capture_stops_share() {
        let f = fixture();
        f.controller.connect("ch1").await.unwrap();
        let mut events = f.controller.events();
        assert!(f.controller.toggle_screen_share().await.unwrap());
        let screen = f.controller.local_media().await.unwrap().screen.unwrap();

        screen.tracks()[0].stop();

        let snapshot = wait_until(&f.controller, |s| s.screen_share == ScreenShare::Off).await;
        assert_eq!(snapshot.phase, Phase::Connected);
        assert!(f.controller.local_media().await.unwrap().screen.is_none());
        let mut changes = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::ScreenShareChanged(on) = event {
                changes.push(on);
            }
        }
        assert_eq!(changes, vec![true, false]);
    }

    #[test(tokio::test)]
    async fn link_failure_drops_participant() {
        let f = fixture();
        let ch = ChannelId::from("ch1");
        f.controller.connect("ch1").await.unwrap();
        let mut events = f.controller.events();
        let _bob = f.relay.join(&ch, &ParticipantId::from("u2"), "Bob").unwrap();
        let _carol = f.relay.join(&ch, &ParticipantId::from("u3"), "Carol").unwrap();
        wait_until(&f.controller, |s| s.participants.len() == 2).await;

        f.links
            .latest(&ParticipantId::from("u2"))
            .unwrap()
            .fail("ice failed");

        let snapshot = wait_until(&f.controller, |s| s.participants.len() == 1).await;
        assert_eq!(snapshot.phase, Phase::Connected);
        assert_eq!(snapshot.participants[0].id, ParticipantId::from("u3"));
        assert_eq!(f.controller.link_count().await, 1);

        let mut failed = None;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::LinkFailed { participant, .. } = event {
                failed = Some(participant);
            }
        }
        assert_eq!(failed, Some(ParticipantId::from("u2")));
    }

    #[test(tokio::test)]
    async fn negotiation_is_relayed_both_ways() {
        let f = fixture();
        let ch = ChannelId::from("ch1");
        f.controller.connect("ch1").await.unwrap();
        let me = local_id(&f.controller);
        let u2 = ParticipantId::from("u2");
        let mut bob = f.relay.join(&ch, &u2, "Bob").unwrap();
        next_message(&mut bob).await;
        wait_until(&f.controller, |s| s.participants.len() == 1).await;

        let link = f.links.latest(&u2).unwrap();
        link.emit_signal(json!({ "type": "offer", "sdp": "v=0" }));
        assert_eq!(
            next_message(&mut bob).await,
            ServerMessage::Signal {
                user_id: me.clone(),
                signal: json!({ "type": "offer", "sdp": "v=0" }),
            }
        );

        f.relay
            .signal(&ch, &u2, &me, json!({ "type": "answer", "sdp": "v=0" }));
        tokio::time::timeout(Duration::from_secs(5), async {
            while link.signals().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("answer never reached the link");
        link.connect();
        let snapshot = wait_until(&f.controller, |s| {
            s.participants
                .first()
                .is_some_and(|p| p.link_state == LinkState::Connected)
        })
        .await;
        assert_eq!(snapshot.participants.len(), 1);
        assert_eq!(link.signals(), vec![json!({ "type": "answer", "sdp": "v=0" })]);
    }

    #[test(tokio::test)]
    async fn signal_before_join_is_replayed() {
        let f = fixture();
        let ch = ChannelId::from("ch1");
        f.controller.connect("ch1").await.unwrap();
        let me = local_id(&f.controller);
        let u3 = ParticipantId::from("u3");

        f.relay.signal(&ch, &u3, &me, json!({ "n": 1 }));
        let _carol = f.relay.join(&ch, &u3, "Carol").unwrap();
        wait_until(&f.controller, |s| s.participants.len() == 1).await;

        let link = f.links.latest(&u3).unwrap();
        assert_eq!(link.signals(), vec![json!({ "n": 1 })]);
    }

    #[test(tokio::test)]
    async fn leave_and_updates_follow_relay() {
        let f = fixture();
        let ch = ChannelId::from("ch1");
        f.controller.connect("ch1").await.unwrap();
        let u2 = ParticipantId::from("u2");
        let _bob = f.relay.join(&ch, &u2, "Bob").unwrap();
        wait_until(&f.controller, |s| s.participants.len() == 1).await;

        f.relay.update(&ch, &u2, ParticipantPatch::muted(true));
        wait_until(&f.controller, |s| {
            s.participants.first().is_some_and(|p| p.is_muted)
        })
        .await;

        // patch for someone who never joined is dropped
        f.relay
            .update(&ch, &ParticipantId::from("u9"), ParticipantPatch::muted(true));

        f.relay.leave(&ch, &u2);
        wait_until(&f.controller, |s| s.participants.is_empty()).await;
        assert_eq!(f.controller.link_count().await, 0);
        assert_eq!(
            f.links.latest(&u2).unwrap().state(),
            LinkState::Closed
        );
    }

    #[test(tokio::test)]
    async fn lost_relay_tears_session_down() {
        let devices = Arc::new(FakeDevices::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        events_tx
            .send(SignalingEvent::RosterSnapshot {
                participants: vec![PeerInfo::new(ParticipantId::from("u2"), "Bob")],
            })
            .unwrap();

        let mut link = MockSignalingLink::new();
        link.expect_close().times(1).returning(|| ());
        let mut signaling = MockSignalingChannel::new();
        let mut open = Some(OpenChannel {
            link: Box::new(link),
            events: events_rx,
        });
        signaling
            .expect_open()
            .times(1)
            .returning(move |_, _| open.take().ok_or(Error::Cancelled));

        let links = RecordingLinkFactory::new();
        let controller = VoiceSessionController::new(
            devices.clone(),
            Arc::new(signaling),
            Arc::new(links.clone()),
        );
        let mut events = controller.events();
        controller.connect("ch1").await.unwrap();
        assert_eq!(controller.link_count().await, 1);

        drop(events_tx);
        wait_until(&controller, |s| s.phase == Phase::Idle).await;

        assert_eq!(devices.live_tracks(), 0);
        assert!(links.open_links().is_empty());
        let lost = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(SessionEvent::SignalingLost) = events.recv().await {
                    break;
                }
            }
        })
        .await;
        assert!(lost.is_ok());
    }

    #[test(tokio::test)]
    async fn roster_matches_links_through_churn() {
        let f = fixture();
        let ch = ChannelId::from("ch1");
        f.controller.connect("ch1").await.unwrap();
        let me = local_id(&f.controller);

        let mut members = Vec::new();
        for n in 0..6 {
            let id = ParticipantId::new(format!("p{}", n));
            members.push(f.relay.join(&ch, &id, "peer").unwrap());
            f.relay.signal(&ch, &ParticipantId::from("p5"), &me, json!({ "n": n }));
        }
        for n in [1, 3, 4] {
            f.relay.leave(&ch, &ParticipantId::new(format!("p{}", n)));
        }

        let ids = |s: &SessionSnapshot| -> Vec<String> {
            s.participants.iter().map(|p| p.id.to_string()).collect()
        };
        wait_until(&f.controller, |s| ids(s) == ["p0", "p2", "p5"]).await;
        assert_eq!(f.controller.link_count().await, 3);
        assert_eq!(f.links.open_links().len(), 3);
        assert_eq!(
            f.links.latest(&ParticipantId::from("p5")).unwrap().signals().len(),
            6
        );
    }

    mod generated_churn {
        use super::*;
        use proptest::prelude::*;
        use std::collections::{BTreeSet, HashMap};
        use std::prelude::v1::test;

        #[derive(Debug, Clone)]
        enum Op {
            Join(u8),
            Leave(u8),
            Signal(u8),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0u8..6).prop_map(Op::Join),
                (0u8..6).prop_map(Op::Leave),
                (0u8..6).prop_map(Op::Signal),
            ]
        }

        async fn apply(ops: Vec<Op>) {
            let f = fixture();
            let ch = ChannelId::from("ch1");
            f.controller.connect("ch1").await.unwrap();
            let me = local_id(&f.controller);

            let mut present = HashMap::new();
            for op in ops {
                match op {
                    Op::Join(n) => {
                        let id = ParticipantId::new(format!("p{}", n));
                        if !present.contains_key(&id) {
                            let rx = f.relay.join(&ch, &id, "peer").unwrap();
                            present.insert(id, rx);
                        }
                    }
                    Op::Leave(n) => {
                        let id = ParticipantId::new(format!("p{}", n));
                        if present.remove(&id).is_some() {
                            f.relay.leave(&ch, &id);
                        }
                    }
                    Op::Signal(n) => {
                        let id = ParticipantId::new(format!("p{}", n));
                        f.relay.signal(&ch, &id, &me, json!({ "from": n }));
                    }
                }
            }

            // Joined last, so seeing it means every earlier event was handled.
            let marker = ParticipantId::from("marker");
            let _marker_rx = f.relay.join(&ch, &marker, "marker").unwrap();
            let mut expected: BTreeSet<String> = present.keys().map(|id| id.to_string()).collect();
            expected.insert(marker.to_string());

            let snapshot = wait_until(&f.controller, |s| {
                s.participants
                    .iter()
                    .map(|p| p.id.to_string())
                    .collect::<BTreeSet<_>>()
                    == expected
            })
            .await;
            assert_eq!(f.controller.link_count().await, snapshot.participants.len());
            assert_eq!(f.links.open_links().len(), snapshot.participants.len());
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            #[test]
            fn roster_tracks_joins_and_leaves(ops in prop::collection::vec(op(), 0..40)) {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                runtime.block_on(apply(ops));
            }
        }
    }
}
