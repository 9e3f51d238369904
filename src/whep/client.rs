//! WHEP client state machine
//!
//! A single task owns the peer connection and walks the `ClientState`
//! graph:
//!
//! ```text
//! Bootstrapping -> Offering -> Negotiating -> Trickling <-> Connected
//!       ^                                         |
//!       |                                    (ICE failed)
//!   Restarting <----------- Disconnected <--------+---- any request failure
//!       ^                         |
//!       |                  (retry declined)
//!       |                         v
//!       +---- (ICE failed) ---- Halted
//! ```
//!
//! A halted client keeps watching its peer; only error-driven restarts are
//! suppressed.
//!
//! Peer callbacks reach the task through a channel tagged with the peer
//! generation, so events of a torn-down peer are dropped. Candidate routing
//! happens directly in the callback through the shared `CandidateTrickle`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::hooks::{ClientHooks, RetryContext, TrackEvent};
use super::link::link_to_ice_servers;
use super::peer::{MediaPeer, PeerConnector, PeerObserver, RtcConnector};
use super::sdp::{edit_offer, parse_offer};
use super::signaling::{IceCandidate, WhepSignaling, API_PREFIX};
use super::state::{ClientState, IceState};
use super::transport::HttpTransport;
use super::trickle::{CandidateRoute, CandidateTrickle};
use crate::auth::TokenProvider;
use crate::config::{TimingConfig, WhepConfig};
use crate::error::{AppError, Result};
use crate::events::{EventBus, WhepEvent};

enum Command {
    Restart,
    Stop,
}

enum PeerEvent {
    IceStateChanged { generation: u64 },
    Failure { generation: u64, error: AppError },
}

/// Builder for a WHEP session; `spawn` starts it
pub struct WhepClient {
    resource: String,
    endpoints: Vec<String>,
    timing: TimingConfig,
    signaling: WhepSignaling,
    connector: Arc<dyn PeerConnector>,
    hooks: ClientHooks,
    bus: EventBus,
}

impl WhepClient {
    pub fn new(
        config: &WhepConfig,
        transport: Arc<dyn HttpTransport>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        let endpoints = if config.endpoints.is_empty() {
            vec![API_PREFIX.to_string()]
        } else {
            config.endpoints.clone()
        };

        Self {
            resource: config.resource.clone(),
            endpoints,
            timing: config.timing.clone(),
            signaling: WhepSignaling::new(transport, tokens),
            connector: Arc::new(RtcConnector::new()),
            hooks: ClientHooks::default(),
            bus: EventBus::new(),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn PeerConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_hooks(mut self, hooks: ClientHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    /// Start the client task
    pub fn spawn(self) -> WhepHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ClientState::Idle);

        let driver = Driver {
            trickle: CandidateTrickle::new(self.signaling.clone()),
            resource: self.resource,
            endpoints: self.endpoints,
            timing: self.timing,
            signaling: self.signaling,
            connector: self.connector,
            hooks: self.hooks,
            bus: self.bus.clone(),
            state_tx,
            peer_tx,
            peer_rx,
            url_index: 0,
            generation: 0,
            peer: None,
            ice_state: None,
            local_offer: None,
            remote_answer: None,
            attempts: 0,
            last_error: None,
        };

        let task = tokio::spawn(driver.run(cmd_rx));

        WhepHandle {
            cmd_tx,
            state_rx,
            bus: self.bus,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }
}

/// Control handle of a running client
#[derive(Clone)]
pub struct WhepHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ClientState>,
    bus: EventBus,
    task: Arc<Mutex<Option<JoinHandle<Result<()>>>>>,
}

impl WhepHandle {
    /// Tear the session down and bootstrap again
    pub fn restart(&self) -> Result<()> {
        self.cmd_tx
            .send(Command::Restart)
            .map_err(|_| AppError::ChannelClosed("client task has ended".to_string()))
    }

    /// Stop the client and wait for its task
    pub async fn stop(&self) -> Result<()> {
        // Already finished if the send fails
        let _ = self.cmd_tx.send(Command::Stop);
        self.wait().await
    }

    /// Wait for the client task to end; returns its fatal error, if any
    pub async fn wait(&self) -> Result<()> {
        let task = self.task.lock().await.take();
        match task {
            Some(task) => task
                .await
                .map_err(|e| AppError::Internal(format!("client task panicked: {}", e)))?,
            None => Ok(()),
        }
    }

    pub fn state(&self) -> ClientState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.state_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WhepEvent> {
        self.bus.subscribe()
    }
}

/// Callbacks of one peer generation
struct GenerationObserver {
    generation: u64,
    trickle: CandidateTrickle,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    hooks: ClientHooks,
    bus: EventBus,
}

impl PeerObserver for GenerationObserver {
    fn on_local_candidate(&self, candidate: IceCandidate) {
        let CandidateRoute::SendNow(candidate) = self.trickle.route(self.generation, candidate)
        else {
            return;
        };

        let trickle = self.trickle.clone();
        let peer_tx = self.peer_tx.clone();
        let bus = self.bus.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            match trickle.flush(generation, vec![candidate]).await {
                Ok(0) => {}
                Ok(count) => {
                    if let Some(session_url) = trickle.session_url() {
                        bus.publish(WhepEvent::CandidatesSent { session_url, count });
                    }
                }
                Err(error) => {
                    let _ = peer_tx.send(PeerEvent::Failure { generation, error });
                }
            }
        });
    }

    fn on_ice_state_change(&self) {
        let _ = self.peer_tx.send(PeerEvent::IceStateChanged {
            generation: self.generation,
        });
    }

    fn on_track(&self, track: TrackEvent) {
        if self.trickle.generation() != self.generation {
            return;
        }
        info!("Remote {} track {}", track.kind, track.track_id);
        self.bus.publish(WhepEvent::TrackAdded {
            kind: track.kind.clone(),
            track_id: track.track_id.clone(),
        });
        self.hooks.track(track);
    }
}

struct Driver {
    resource: String,
    endpoints: Vec<String>,
    timing: TimingConfig,
    signaling: WhepSignaling,
    trickle: CandidateTrickle,
    connector: Arc<dyn PeerConnector>,
    hooks: ClientHooks,
    bus: EventBus,
    state_tx: watch::Sender<ClientState>,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    /// Index into `endpoints`, advanced when bootstrap fails
    url_index: usize,
    generation: u64,
    peer: Option<Arc<dyn MediaPeer>>,
    /// Last ICE state read back from the peer
    ice_state: Option<IceState>,
    local_offer: Option<String>,
    remote_answer: Option<String>,
    /// Restarts since ICE last reached connected
    attempts: u32,
    last_error: Option<String>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) -> Result<()> {
        self.next_generation();
        let mut state = ClientState::Bootstrapping;

        loop {
            self.set_state(state);

            if state == ClientState::Stopped {
                self.stop_peer().await;
                self.clear_session().await;
                self.trickle.reset(self.generation + 1);
                info!("WHEP client stopped");
                return Ok(());
            }

            let outcome = tokio::select! {
                biased;
                command = commands.recv() => Err(command),
                next = self.step(state) => Ok(next),
            };

            state = match outcome {
                Ok(next) => match next {
                    Ok(next) => next,
                    Err(e) => {
                        error!("WHEP client failed: {}", e);
                        self.stop_peer().await;
                        self.hooks.connection_state(IceState::Closed.as_str());
                        self.set_state(ClientState::Stopped);
                        return Err(e);
                    }
                },
                Err(Some(Command::Restart)) => {
                    info!("Restart requested");
                    self.attempts = 0;
                    ClientState::Restarting
                }
                Err(Some(Command::Stop)) | Err(None) => ClientState::Stopped,
            };
        }
    }

    async fn step(&mut self, state: ClientState) -> Result<ClientState> {
        match state {
            ClientState::Idle | ClientState::Bootstrapping => self.bootstrap().await,
            ClientState::Offering => self.offer().await,
            ClientState::Negotiating => self.negotiate().await,
            ClientState::Trickling | ClientState::Connected | ClientState::Halted => {
                self.monitor(state).await
            }
            ClientState::Disconnected => Ok(self.wait_before_restart().await),
            ClientState::Restarting => Ok(self.restart().await),
            ClientState::Stopped => Ok(ClientState::Stopped),
        }
    }

    fn set_state(&self, state: ClientState) {
        if *self.state_tx.borrow() == state {
            return;
        }
        debug!("Client state: {}", state);
        self.state_tx.send_replace(state);
        self.bus.publish(WhepEvent::ClientStateChanged { state });
    }

    fn next_generation(&mut self) {
        self.generation += 1;
        self.trickle.reset(self.generation);
    }

    fn resource_url(&self) -> String {
        format!("{}/{}", self.endpoints[self.url_index], self.resource)
    }

    fn rotate_endpoint(&mut self) {
        if self.endpoints.len() < 2 {
            return;
        }
        self.url_index = if self.endpoints.len() > self.url_index + 1 {
            self.url_index + 1
        } else {
            0
        };
        info!("Switching to endpoint {}", self.endpoints[self.url_index]);
        self.bus.publish(WhepEvent::EndpointRotated {
            index: self.url_index,
            endpoint: self.endpoints[self.url_index].clone(),
        });
    }

    /// Reconnection handler: consult the retry policy and pick the next state
    fn on_failure(&mut self, error: AppError) -> Result<ClientState> {
        if !error.is_recoverable() {
            return Err(error);
        }

        warn!("error: {}", error);
        self.last_error = Some(error.to_string());
        let ctx = RetryContext {
            error: error.to_string(),
            attempt: self.attempts + 1,
            ice_state: self.ice_state,
            has_peer: self.peer.is_some(),
        };

        if self.hooks.retry(&ctx) {
            self.attempts += 1;
            Ok(ClientState::Disconnected)
        } else {
            info!("Retry declined, not restarting");
            self.bus.publish(WhepEvent::Halted {
                reason: ctx.error,
            });
            Ok(ClientState::Halted)
        }
    }

    async fn bootstrap(&mut self) -> Result<ClientState> {
        let resource_url = self.resource_url();
        info!("requesting ICE servers");

        let links = match self.signaling.request_ice_servers(&resource_url).await {
            Ok(links) => links,
            Err(e) => {
                self.rotate_endpoint();
                return self.on_failure(e);
            }
        };

        // A malformed Link header is not retried
        let ice_servers = link_to_ice_servers(links.as_deref())?;

        let observer = Arc::new(GenerationObserver {
            generation: self.generation,
            trickle: self.trickle.clone(),
            peer_tx: self.peer_tx.clone(),
            hooks: self.hooks.clone(),
            bus: self.bus.clone(),
        });

        let peer = match self
            .connector
            .connect(self.generation, ice_servers, observer)
            .await
        {
            Ok(peer) => peer,
            Err(e) => {
                self.rotate_endpoint();
                return self.on_failure(e);
            }
        };
        // Owned by the driver before the next await, so a command that
        // cancels this step still finds the peer in `stop_peer`
        self.peer = Some(peer.clone());

        match peer.create_offer().await {
            Ok(offer) => {
                self.local_offer = Some(offer);
                Ok(ClientState::Offering)
            }
            Err(e) => {
                self.rotate_endpoint();
                self.on_failure(e)
            }
        }
    }

    async fn offer(&mut self) -> Result<ClientState> {
        let (Some(peer), Some(mut sdp)) = (self.peer.clone(), self.local_offer.take()) else {
            return Ok(ClientState::Restarting);
        };

        edit_offer(&mut sdp);

        // The server must see exactly what the peer applied
        let sdp = match peer.set_local_description(&sdp).await {
            Ok(applied) => applied,
            Err(e) => return self.on_failure(e),
        };
        self.trickle.set_offer(self.generation, parse_offer(&sdp));

        info!("sending offer");
        match self.signaling.post_offer(&self.resource_url(), &sdp).await {
            Ok(answer) => {
                info!(session_url = %answer.session_url, "Session created");
                self.trickle
                    .set_session_url(self.generation, answer.session_url.clone());
                self.bus.publish(WhepEvent::SessionCreated {
                    session_url: answer.session_url,
                });
                self.remote_answer = Some(answer.sdp);
                Ok(ClientState::Negotiating)
            }
            Err(e) => self.on_failure(e),
        }
    }

    async fn negotiate(&mut self) -> Result<ClientState> {
        let answer = self.remote_answer.take().unwrap_or_default();

        let Some(peer) = self.peer.clone() else {
            return Ok(ClientState::Trickling);
        };
        if let Some(state) = peer.ice_state() {
            self.ice_state = Some(state);
        }
        if self.ice_state.is_some_and(IceState::is_connected_like) {
            debug!("Already connected, not applying the answer again");
            return Ok(ClientState::Trickling);
        }

        if let Err(e) = peer.set_remote_answer(&answer).await {
            return self.on_failure(e);
        }
        info!("Remote answer applied");

        let queued = self.trickle.take_queued(self.generation);
        if queued.is_empty() {
            return Ok(ClientState::Trickling);
        }

        for candidate in &queued {
            if let Err(e) = peer.add_ice_candidate(candidate.clone()).await {
                debug!("Failed to apply queued candidate: {}", e);
            }
        }

        info!("Flushing {} queued candidate(s)", queued.len());
        match self.trickle.flush(self.generation, queued).await {
            Ok(count) => {
                if let Some(session_url) = self.trickle.session_url() {
                    self.bus
                        .publish(WhepEvent::CandidatesSent { session_url, count });
                }
                Ok(ClientState::Trickling)
            }
            Err(e) => self.on_failure(e),
        }
    }

    async fn monitor(&mut self, current: ClientState) -> Result<ClientState> {
        loop {
            let Some(event) = self.peer_rx.recv().await else {
                return Ok(ClientState::Stopped);
            };

            match event {
                PeerEvent::IceStateChanged { generation } if generation == self.generation => {
                    return Ok(self.on_connection_state(current).await);
                }
                PeerEvent::Failure { generation, error } if generation == self.generation => {
                    if current == ClientState::Halted {
                        // retry already declined
                        warn!("error: {}", error);
                        continue;
                    }
                    return self.on_failure(error);
                }
                _ => trace!("Ignoring event of a previous peer"),
            }
        }
    }

    /// Read the peer's ICE state, polling until it is available
    async fn read_connection_state(&self) -> IceState {
        loop {
            let Some(peer) = &self.peer else {
                debug!("Peer connection is not available");
                return IceState::Disconnected;
            };
            if let Some(state) = peer.ice_state() {
                return state;
            }
            debug!("Awaiting connection state...");
            tokio::time::sleep(self.timing.state_poll()).await;
        }
    }

    async fn on_connection_state(&mut self, current: ClientState) -> ClientState {
        let state = self.read_connection_state().await;
        self.ice_state = Some(state);

        info!("peer connection state: {}", state);
        self.hooks.connection_state(state.as_str());
        self.bus.publish(WhepEvent::IceStateChanged { state });

        if state.is_disconnected_like() {
            info!("restarting...");
            return ClientState::Restarting;
        }

        match state {
            IceState::Connected | IceState::Completed => {
                self.attempts = 0;
                ClientState::Connected
            }
            _ if current == ClientState::Connected => ClientState::Trickling,
            _ => current,
        }
    }

    async fn wait_before_restart(&mut self) -> ClientState {
        let delay = self.timing.restart_delay();
        self.bus.publish(WhepEvent::RestartScheduled {
            delay_ms: delay.as_millis() as u64,
            reason: self.last_error.clone().unwrap_or_default(),
        });
        set_delay(delay).await;
        ClientState::Restarting
    }

    /// Full restart cycle: stop, delete the session, reset, bootstrap again
    async fn restart(&mut self) -> ClientState {
        self.stop_peer().await;
        self.clear_session().await;

        self.ice_state = Some(IceState::Disconnected);
        self.local_offer = None;
        self.remote_answer = None;
        self.next_generation();

        ClientState::Bootstrapping
    }

    /// Close and drop the peer, waiting for its data channel to close unless
    /// the connection is already down
    async fn stop_peer(&mut self) {
        let Some(peer) = self.peer.take() else {
            return;
        };

        let closed = if self.ice_state.is_some_and(IceState::is_disconnected_like) {
            None
        } else {
            peer.take_data_channel_closed()
        };

        if let Err(e) = peer.close().await {
            warn!("Failed to close peer connection: {}", e);
        }
        drop(peer);

        let Some(closed) = closed else {
            return;
        };
        match tokio::time::timeout(self.timing.close_timeout(), closed).await {
            Ok(Ok(())) => {
                debug!("Data channel closed");
                set_delay(self.timing.close_linger()).await;
            }
            Ok(Err(_)) => debug!("Data channel dropped without closing"),
            Err(_) => warn!(
                "Data channel did not close within {:?}",
                self.timing.close_timeout()
            ),
        }
    }

    /// DELETE the session resource; failures are only logged
    async fn clear_session(&mut self) {
        let Some(session_url) = self.trickle.session_url() else {
            return;
        };

        match self.signaling.delete_session(&session_url).await {
            Ok(()) => {
                info!(session_url = %session_url, "Session deleted");
                self.bus.publish(WhepEvent::SessionDeleted { session_url });
            }
            Err(e) => warn!("delete session error: {}", e),
        }
    }
}

async fn set_delay(delay: Duration) {
    info!("Waiting {} seconds...", (delay.as_millis() as f64 / 1000.0).round());
    tokio::time::sleep(delay).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use crate::whep::hooks::max_restarts;
    use crate::whep::link::IceServerEntry;
    use crate::whep::transport::{WhepRequest, WhepResponse};
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use reqwest::Method;
    use tokio::sync::oneshot;

    const OFFER: &str = "v=0\r\n\
        a=ice-ufrag:uf\r\n\
        a=ice-pwd:pw\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
        a=rtpmap:96 VP8/90000\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        a=rtpmap:111 opus/48000/2\r\n\
        a=fmtp:111 minptime=10;useinbandfec=1\r\n";

    type Handler = Box<dyn Fn(&WhepRequest) -> Result<WhepResponse> + Send + Sync>;

    struct ScriptedTransport {
        handler: Handler,
        seen: SyncMutex<Vec<WhepRequest>>,
    }

    impl ScriptedTransport {
        fn new(
            handler: impl Fn(&WhepRequest) -> Result<WhepResponse> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                handler: Box::new(handler),
                seen: SyncMutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(Method, String)> {
            self.seen
                .lock()
                .iter()
                .map(|r| (r.method.clone(), r.url.clone()))
                .collect()
        }

        fn count(&self, method: Method) -> usize {
            self.seen.lock().iter().filter(|r| r.method == method).count()
        }

        fn bodies(&self, method: Method) -> Vec<String> {
            self.seen
                .lock()
                .iter()
                .filter(|r| r.method == method)
                .map(|r| r.body.clone().unwrap_or_default())
                .collect()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(&self, request: WhepRequest) -> Result<WhepResponse> {
            let reply = (self.handler)(&request);
            self.seen.lock().push(request);
            reply
        }
    }

    /// A server that accepts everything
    fn happy_server(request: &WhepRequest) -> Result<WhepResponse> {
        Ok(match request.method {
            Method::OPTIONS => WhepResponse::new(204)
                .with_header("Link", r#"<stun:stun.example.com:3478>; rel="ice-server""#),
            Method::POST => WhepResponse::new(201)
                .with_header("Location", "/sessions/abc")
                .with_body("v=0\r\nanswer\r\n"),
            Method::PATCH => WhepResponse::new(204),
            _ => WhepResponse::new(200),
        })
    }

    struct FakePeer {
        offer_delay: Duration,
        reject_edits: bool,
        ice_state: SyncMutex<Option<IceState>>,
        closed: SyncMutex<bool>,
        closed_tx: SyncMutex<Option<oneshot::Sender<()>>>,
        closed_rx: SyncMutex<Option<oneshot::Receiver<()>>>,
        answers: SyncMutex<Vec<String>>,
        added: SyncMutex<usize>,
    }

    impl FakePeer {
        fn new(connector: &FakeConnector) -> Self {
            let (tx, rx) = oneshot::channel();
            Self {
                offer_delay: connector.offer_delay,
                reject_edits: connector.reject_edits,
                ice_state: SyncMutex::new(connector.initial_state),
                closed: SyncMutex::new(false),
                closed_tx: SyncMutex::new(Some(tx)),
                closed_rx: SyncMutex::new(Some(rx)),
                answers: SyncMutex::new(Vec::new()),
                added: SyncMutex::new(0),
            }
        }

        fn is_closed(&self) -> bool {
            *self.closed.lock()
        }
    }

    #[async_trait]
    impl MediaPeer for FakePeer {
        async fn create_offer(&self) -> Result<String> {
            if !self.offer_delay.is_zero() {
                tokio::time::sleep(self.offer_delay).await;
            }
            Ok(OFFER.to_string())
        }

        async fn set_local_description(&self, sdp: &str) -> Result<String> {
            if self.reject_edits {
                return Ok(OFFER.to_string());
            }
            Ok(sdp.to_string())
        }

        async fn set_remote_answer(&self, sdp: &str) -> Result<()> {
            self.answers.lock().push(sdp.to_string());
            Ok(())
        }

        async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
            *self.added.lock() += 1;
            Ok(())
        }

        fn ice_state(&self) -> Option<IceState> {
            *self.ice_state.lock()
        }

        fn take_data_channel_closed(&self) -> Option<oneshot::Receiver<()>> {
            self.closed_rx.lock().take()
        }

        async fn close(&self) -> Result<()> {
            *self.closed.lock() = true;
            if let Some(tx) = self.closed_tx.lock().take() {
                let _ = tx.send(());
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        /// Candidates gathered right away, before any session exists
        early_candidates: usize,
        offer_delay: Duration,
        /// Peers refuse the edited offer and apply the unedited one
        reject_edits: bool,
        initial_state: Option<IceState>,
        peers: SyncMutex<Vec<(Arc<FakePeer>, Arc<dyn PeerObserver>)>>,
    }

    impl FakeConnector {
        fn latest(&self) -> (Arc<FakePeer>, Arc<dyn PeerObserver>) {
            self.peers.lock().last().cloned().expect("no peer created")
        }

        fn created(&self) -> usize {
            self.peers.lock().len()
        }
    }

    #[async_trait]
    impl PeerConnector for FakeConnector {
        async fn connect(
            &self,
            _generation: u64,
            _ice_servers: Vec<IceServerEntry>,
            observer: Arc<dyn PeerObserver>,
        ) -> Result<Arc<dyn MediaPeer>> {
            for n in 0..self.early_candidates {
                observer.on_local_candidate(candidate(n));
            }
            let peer = Arc::new(FakePeer::new(self));
            self.peers.lock().push((peer.clone(), observer));
            Ok(peer)
        }
    }

    fn candidate(n: usize) -> IceCandidate {
        IceCandidate::new(format!(
            "candidate:{} 1 udp 2122260223 192.168.1.{} 5000 typ host",
            n, n
        ))
        .with_mid("0", 0)
    }

    fn config(endpoints: &[&str]) -> WhepConfig {
        WhepConfig {
            resource: "cam".to_string(),
            endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
            ..Default::default()
        }
    }

    fn client(
        config: &WhepConfig,
        transport: Arc<ScriptedTransport>,
        connector: Arc<FakeConnector>,
    ) -> WhepClient {
        WhepClient::new(config, transport, Arc::new(StaticToken::new("tok")))
            .with_connector(connector)
    }

    async fn wait_for_state(handle: &WhepHandle, wanted: ClientState) {
        let mut rx = handle.watch_state();
        tokio::time::timeout(Duration::from_secs(120), rx.wait_for(|s| *s == wanted))
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed");
    }

    async fn wait_for_event<F>(rx: &mut broadcast::Receiver<WhepEvent>, pred: F) -> WhepEvent
    where
        F: Fn(&WhepEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(120), async {
            loop {
                let event = rx.recv().await.expect("event bus closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn state_changed(wanted: ClientState) -> impl Fn(&WhepEvent) -> bool {
        move |e| matches!(e, WhepEvent::ClientStateChanged { state } if *state == wanted)
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpoint_rotates_and_wraps_on_options_failure() {
        let transport = ScriptedTransport::new(|_| Ok(WhepResponse::new(500)));
        let connector = Arc::new(FakeConnector::default());
        let handle = client(&config(&["/a", "/b"]), transport.clone(), connector)
            .with_hooks(ClientHooks::new().should_retry(max_restarts(2)))
            .spawn();

        wait_for_state(&handle, ClientState::Halted).await;

        let urls: Vec<String> = transport.calls().into_iter().map(|(_, url)| url).collect();
        assert_eq!(urls, vec!["/a/cam/whep", "/b/cam/whep", "/a/cam/whep"]);

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_created_from_location() {
        let transport = ScriptedTransport::new(happy_server);
        let connector = Arc::new(FakeConnector::default());
        let handle = client(&config(&[]), transport.clone(), connector.clone()).spawn();
        let mut events = handle.subscribe();

        let event =
            wait_for_event(&mut events, |e| matches!(e, WhepEvent::SessionCreated { .. })).await;
        assert_eq!(
            event,
            WhepEvent::SessionCreated {
                session_url: "/api/mediamtx/sessions/abc".to_string()
            }
        );

        wait_for_state(&handle, ClientState::Trickling).await;
        let (peer, _) = connector.latest();
        assert_eq!(*peer.answers.lock(), vec!["v=0\r\nanswer\r\n".to_string()]);

        // The posted offer asks for stereo Opus
        let offer = &transport.bodies(Method::POST)[0];
        assert!(offer.contains("a=fmtp:111 minptime=10;useinbandfec=1;stereo=1;sprop-stereo=1"));

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_candidates_sent_in_one_patch() {
        let transport = ScriptedTransport::new(happy_server);
        let connector = Arc::new(FakeConnector {
            early_candidates: 3,
            ..Default::default()
        });
        let handle = client(&config(&[]), transport.clone(), connector.clone()).spawn();
        let mut events = handle.subscribe();

        let sent =
            wait_for_event(&mut events, |e| matches!(e, WhepEvent::CandidatesSent { .. })).await;
        assert!(matches!(sent, WhepEvent::CandidatesSent { count: 3, .. }));

        let patches = transport.bodies(Method::PATCH);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].matches("a=candidate:").count(), 3);
        assert!(patches[0].starts_with("a=ice-ufrag:uf\r\na=ice-pwd:pw\r\n"));

        let (peer, observer) = connector.latest();
        assert_eq!(*peer.added.lock(), 3);

        // The queue is empty: a later candidate goes out on its own
        observer.on_local_candidate(candidate(9));
        let sent =
            wait_for_event(&mut events, |e| matches!(e, WhepEvent::CandidatesSent { .. })).await;
        assert!(matches!(sent, WhepEvent::CandidatesSent { count: 1, .. }));

        let patches = transport.bodies(Method::PATCH);
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[1].matches("a=candidate:").count(), 1);

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_state_deletes_session_and_bootstraps_again() {
        let transport = ScriptedTransport::new(happy_server);
        let connector = Arc::new(FakeConnector::default());
        let reported = Arc::new(SyncMutex::new(Vec::new()));
        let sink = reported.clone();
        let handle = client(&config(&[]), transport.clone(), connector.clone())
            .with_hooks(
                ClientHooks::new().on_connection_state(move |s| sink.lock().push(s.to_string())),
            )
            .spawn();
        let mut events = handle.subscribe();

        wait_for_state(&handle, ClientState::Trickling).await;

        let (peer, observer) = connector.latest();
        *peer.ice_state.lock() = Some(IceState::Failed);
        observer.on_ice_state_change();

        let deleted =
            wait_for_event(&mut events, |e| matches!(e, WhepEvent::SessionDeleted { .. })).await;
        assert_eq!(
            deleted,
            WhepEvent::SessionDeleted {
                session_url: "/api/mediamtx/sessions/abc".to_string()
            }
        );

        wait_for_event(&mut events, state_changed(ClientState::Bootstrapping)).await;
        wait_for_event(&mut events, |e| matches!(e, WhepEvent::SessionCreated { .. })).await;

        let methods: Vec<Method> = transport.calls().into_iter().map(|(m, _)| m).collect();
        assert_eq!(
            &methods[..5],
            &[Method::OPTIONS, Method::POST, Method::DELETE, Method::OPTIONS, Method::POST]
        );
        assert_eq!(transport.calls()[2].1, "/api/mediamtx/sessions/abc");
        assert_eq!(connector.created(), 2);
        assert_eq!(*reported.lock(), vec!["failed".to_string()]);

        // The old peer's events no longer matter
        observer.on_ice_state_change();
        handle.stop().await.unwrap();
        assert_eq!(transport.count(Method::OPTIONS), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_declined_retry_does_not_restart() {
        let transport = ScriptedTransport::new(|request| {
            if request.method == Method::POST {
                Ok(WhepResponse::new(500))
            } else {
                happy_server(request)
            }
        });
        let connector = Arc::new(FakeConnector::default());
        let handle = client(&config(&[]), transport.clone(), connector)
            .with_hooks(ClientHooks::new().should_retry(|_| false))
            .spawn();

        wait_for_state(&handle, ClientState::Halted).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(transport.count(Method::OPTIONS), 1);
        assert_eq!(transport.count(Method::POST), 1);
        assert_eq!(handle.state(), ClientState::Halted);

        // A manual restart still works
        let mut events = handle.subscribe();
        handle.restart().unwrap();
        wait_for_event(&mut events, state_changed(ClientState::Bootstrapping)).await;
        wait_for_event(&mut events, state_changed(ClientState::Halted)).await;
        assert_eq!(transport.count(Method::OPTIONS), 2);

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_without_policy_restarts_after_delay() {
        let posts = Arc::new(SyncMutex::new(0));
        let counter = posts.clone();
        let transport = ScriptedTransport::new(move |request| {
            if request.method == Method::POST {
                let mut n = counter.lock();
                *n += 1;
                if *n == 1 {
                    return Ok(WhepResponse::new(400));
                }
            }
            happy_server(request)
        });
        let connector = Arc::new(FakeConnector::default());
        let handle = client(&config(&[]), transport.clone(), connector).spawn();
        let mut events = handle.subscribe();

        let scheduled =
            wait_for_event(&mut events, |e| matches!(e, WhepEvent::RestartScheduled { .. })).await;
        assert!(matches!(scheduled, WhepEvent::RestartScheduled { delay_ms: 5000, .. }));

        wait_for_event(&mut events, |e| matches!(e, WhepEvent::SessionCreated { .. })).await;
        assert_eq!(*posts.lock(), 2);

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_link_is_fatal() {
        let transport = ScriptedTransport::new(|request| {
            if request.method == Method::OPTIONS {
                Ok(WhepResponse::new(204)
                    .with_header("Link", r#"<https://example.com>; rel="preload""#))
            } else {
                happy_server(request)
            }
        });
        let connector = Arc::new(FakeConnector::default());
        let handle = client(&config(&[]), transport.clone(), connector.clone()).spawn();

        let result = handle.wait().await;
        assert!(matches!(result, Err(AppError::MalformedLink(_))));
        assert_eq!(handle.state(), ClientState::Stopped);
        assert_eq!(transport.count(Method::POST), 0);
        assert_eq!(connector.created(), 0);
        assert!(handle.restart().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_deletes_session() {
        let transport = ScriptedTransport::new(happy_server);
        let connector = Arc::new(FakeConnector::default());
        let handle = client(&config(&[]), transport.clone(), connector.clone()).spawn();

        wait_for_state(&handle, ClientState::Trickling).await;
        let (peer, observer) = connector.latest();
        *peer.ice_state.lock() = Some(IceState::Connected);
        observer.on_ice_state_change();
        wait_for_state(&handle, ClientState::Connected).await;

        let started = tokio::time::Instant::now();
        handle.stop().await.unwrap();

        assert_eq!(handle.state(), ClientState::Stopped);
        assert_eq!(transport.count(Method::DELETE), 1);
        assert!(peer.is_closed());
        // data channel closed, then the linger
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_while_offering_closes_the_pending_peer() {
        let transport = ScriptedTransport::new(happy_server);
        let connector = Arc::new(FakeConnector {
            offer_delay: Duration::from_secs(10),
            ..Default::default()
        });
        let handle = client(&config(&[]), transport.clone(), connector.clone()).spawn();
        let mut events = handle.subscribe();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(connector.created(), 1);
        let (first, _) = connector.latest();

        handle.restart().unwrap();
        wait_for_event(&mut events, state_changed(ClientState::Bootstrapping)).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(connector.created(), 2);
        assert!(first.is_closed());
        let (second, _) = connector.latest();
        assert!(!second.is_closed());
        assert_eq!(transport.count(Method::POST), 0);

        handle.stop().await.unwrap();
        assert!(second.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_halted_client_still_restarts_on_ice_failure() {
        let transport = ScriptedTransport::new(|request| {
            if request.method == Method::PATCH {
                Ok(WhepResponse::new(500))
            } else {
                happy_server(request)
            }
        });
        let connector = Arc::new(FakeConnector {
            early_candidates: 1,
            ..Default::default()
        });
        let reported = Arc::new(SyncMutex::new(Vec::new()));
        let sink = reported.clone();
        let hooks = ClientHooks::new()
            .should_retry(|_| false)
            .on_connection_state(move |s| sink.lock().push(s.to_string()));
        let handle = client(&config(&[]), transport.clone(), connector.clone())
            .with_hooks(hooks)
            .spawn();

        wait_for_state(&handle, ClientState::Halted).await;
        assert_eq!(transport.count(Method::PATCH), 1);

        let mut events = handle.subscribe();
        let (peer, observer) = connector.latest();
        *peer.ice_state.lock() = Some(IceState::Failed);
        observer.on_ice_state_change();

        wait_for_event(&mut events, |e| matches!(e, WhepEvent::SessionDeleted { .. })).await;
        wait_for_event(&mut events, state_changed(ClientState::Bootstrapping)).await;
        // the new session fails its PATCH too and halts again
        wait_for_event(&mut events, state_changed(ClientState::Halted)).await;

        assert_eq!(*reported.lock(), vec!["failed".to_string()]);
        assert_eq!(transport.count(Method::OPTIONS), 2);
        assert_eq!(transport.count(Method::DELETE), 1);
        assert!(peer.is_closed());

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_posts_the_offer_the_peer_applied() {
        let transport = ScriptedTransport::new(happy_server);
        let connector = Arc::new(FakeConnector {
            reject_edits: true,
            ..Default::default()
        });
        let handle = client(&config(&[]), transport.clone(), connector).spawn();

        wait_for_state(&handle, ClientState::Trickling).await;

        let posted = transport.bodies(Method::POST);
        assert_eq!(posted, vec![OFFER.to_string()]);
        assert!(!posted[0].contains("stereo=1"));

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_patch_goes_through_reconnection() {
        let patches = Arc::new(SyncMutex::new(0));
        let counter = patches.clone();
        let transport = ScriptedTransport::new(move |request| {
            if request.method == Method::PATCH {
                let mut n = counter.lock();
                *n += 1;
                if *n == 1 {
                    return Ok(WhepResponse::new(412));
                }
            }
            happy_server(request)
        });
        let connector = Arc::new(FakeConnector {
            early_candidates: 1,
            ..Default::default()
        });
        let handle = client(&config(&[]), transport.clone(), connector).spawn();
        let mut events = handle.subscribe();

        let scheduled =
            wait_for_event(&mut events, |e| matches!(e, WhepEvent::RestartScheduled { .. })).await;
        let WhepEvent::RestartScheduled { reason, .. } = scheduled else {
            unreachable!()
        };
        assert!(reason.contains("412"));

        wait_for_event(&mut events, |e| matches!(e, WhepEvent::SessionDeleted { .. })).await;
        let sent =
            wait_for_event(&mut events, |e| matches!(e, WhepEvent::CandidatesSent { .. })).await;
        assert!(matches!(sent, WhepEvent::CandidatesSent { count: 1, .. }));
        assert_eq!(*patches.lock(), 2);
        assert_eq!(transport.count(Method::OPTIONS), 2);

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_failure_does_not_stop_the_restart() {
        let transport = ScriptedTransport::new(|request| {
            if request.method == Method::DELETE {
                Ok(WhepResponse::new(500))
            } else {
                happy_server(request)
            }
        });
        let connector = Arc::new(FakeConnector::default());
        let handle = client(&config(&[]), transport.clone(), connector.clone()).spawn();

        wait_for_state(&handle, ClientState::Trickling).await;
        let mut events = handle.subscribe();
        let (peer, observer) = connector.latest();
        *peer.ice_state.lock() = Some(IceState::Failed);
        observer.on_ice_state_change();

        let seen = tokio::time::timeout(Duration::from_secs(120), async {
            let mut seen = Vec::new();
            loop {
                let event = events.recv().await.expect("event bus closed");
                let created = matches!(event, WhepEvent::SessionCreated { .. });
                seen.push(event);
                if created {
                    return seen;
                }
            }
        })
        .await
        .expect("timed out waiting for a new session");

        assert!(seen.contains(&WhepEvent::ClientStateChanged {
            state: ClientState::Bootstrapping
        }));
        assert!(!seen
            .iter()
            .any(|e| matches!(e, WhepEvent::SessionDeleted { .. })));
        assert_eq!(transport.count(Method::DELETE), 1);
        assert_eq!(connector.created(), 2);

        // failing DELETE on stop is not an error either
        handle.stop().await.unwrap();
        assert_eq!(transport.count(Method::DELETE), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_skipped_when_already_connected() {
        let transport = ScriptedTransport::new(happy_server);
        let connector = Arc::new(FakeConnector {
            early_candidates: 2,
            initial_state: Some(IceState::Connected),
            ..Default::default()
        });
        let handle = client(&config(&[]), transport.clone(), connector.clone()).spawn();

        wait_for_state(&handle, ClientState::Trickling).await;

        let (peer, _) = connector.latest();
        assert!(peer.answers.lock().is_empty());
        assert_eq!(*peer.added.lock(), 0);
        assert_eq!(transport.count(Method::PATCH), 0);

        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_skips_data_channel_wait_when_disconnected() {
        let transport = ScriptedTransport::new(happy_server);
        let connector = Arc::new(FakeConnector::default());
        let handle = client(&config(&[]), transport.clone(), connector.clone()).spawn();

        wait_for_state(&handle, ClientState::Trickling).await;
        let mut events = handle.subscribe();
        let (first, observer) = connector.latest();
        *first.ice_state.lock() = Some(IceState::Failed);
        observer.on_ice_state_change();

        // after the restart the mirrored state stays disconnected
        wait_for_event(&mut events, state_changed(ClientState::Bootstrapping)).await;
        wait_for_event(&mut events, state_changed(ClientState::Trickling)).await;
        let (second, _) = connector.latest();

        let started = tokio::time::Instant::now();
        handle.stop().await.unwrap();

        assert!(second.is_closed());
        assert!(second.closed_rx.lock().is_some());
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(transport.count(Method::DELETE), 2);
    }
}
