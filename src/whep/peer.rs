//! Peer connection seam
//!
//! The client drives a `MediaPeer` built by a `PeerConnector`; the
//! `webrtc`-crate implementation lives here, test doubles live with the
//! client tests.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

use super::hooks::TrackEvent;
use super::link::IceServerEntry;
use super::mdns::{mdns_host_name, mdns_mode, mdns_mode_label};
use super::signaling::IceCandidate;
use super::state::IceState;
use crate::error::{AppError, Result};

/// Receives a peer's callbacks
///
/// Called from the peer's own tasks; implementations must not block.
pub trait PeerObserver: Send + Sync {
    /// A local candidate was gathered
    fn on_local_candidate(&self, candidate: IceCandidate);
    /// The ICE connection state changed; read it back through `MediaPeer::ice_state`
    fn on_ice_state_change(&self);
    /// A remote track arrived
    fn on_track(&self, track: TrackEvent);
}

/// One peer connection plus its liveness data channel
#[async_trait]
pub trait MediaPeer: Send + Sync {
    /// Create the local offer, unmodified
    async fn create_offer(&self) -> Result<String>;

    /// Apply the local offer; returns the SDP that was actually applied,
    /// which is the unedited offer when `sdp` is refused
    async fn set_local_description(&self, sdp: &str) -> Result<String>;

    async fn set_remote_answer(&self, sdp: &str) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Current ICE connection state; `None` while not readable yet
    fn ice_state(&self) -> Option<IceState>;

    /// Resolves when the data channel closes; yields `None` after the first call
    fn take_data_channel_closed(&self) -> Option<oneshot::Receiver<()>>;

    async fn close(&self) -> Result<()>;
}

/// Builds peers for a set of ICE servers
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Create a peer with one data channel and sendrecv video + audio
    /// transceivers, reporting its callbacks to `observer`
    async fn connect(
        &self,
        generation: u64,
        ice_servers: Vec<IceServerEntry>,
        observer: Arc<dyn PeerObserver>,
    ) -> Result<Arc<dyn MediaPeer>>;
}

/// `PeerConnector` backed by the `webrtc` crate
#[derive(Debug, Clone, Default)]
pub struct RtcConnector;

impl RtcConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(
        &self,
        generation: u64,
        ice_servers: Vec<IceServerEntry>,
        observer: Arc<dyn PeerObserver>,
    ) -> Result<Arc<dyn MediaPeer>> {
        let peer = RtcPeer::new(generation, ice_servers, observer).await?;
        Ok(Arc::new(peer))
    }
}

/// Receive-side peer connection
pub struct RtcPeer {
    generation: u64,
    pc: Arc<RTCPeerConnection>,
    /// Keeps the data channel alive for the peer's lifetime
    _data_channel: Arc<RTCDataChannel>,
    dc_closed: Mutex<Option<oneshot::Receiver<()>>>,
    /// Last offer produced, used when the edited one is refused
    pristine_offer: Mutex<Option<RTCSessionDescription>>,
}

impl RtcPeer {
    pub async fn new(
        generation: u64,
        ice_servers: Vec<IceServerEntry>,
        observer: Arc<dyn PeerObserver>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        let mode = mdns_mode();
        setting_engine.set_ice_multicast_dns_mode(mode);
        if mode == MulticastDnsMode::QueryAndGather {
            setting_engine.set_multicast_dns_host_name(mdns_host_name(generation));
        }
        debug!("mDNS mode: {} (generation {})", mdns_mode_label(mode), generation);

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        info!("Creating peer connection with {} ICE server(s)", ice_servers.len());
        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers.into_iter().map(RTCIceServer::from).collect(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);

        // Liveness only, never carries payload
        let data_channel = pc.create_data_channel("", None).await?;
        let (closed_tx, closed_rx) = oneshot::channel();
        let mut closed_tx = Some(closed_tx);
        data_channel.on_close(Box::new(move || {
            if let Some(tx) = closed_tx.take() {
                let _ = tx.send(());
            }
            Box::pin(async {})
        }));

        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendrecv,
                    send_encodings: vec![],
                }),
            )
            .await?;
        }

        let peer = Self {
            generation,
            pc,
            _data_channel: data_channel,
            dc_closed: Mutex::new(Some(closed_rx)),
            pristine_offer: Mutex::new(None),
        };
        peer.setup_event_handlers(observer);

        Ok(peer)
    }

    fn setup_event_handlers(&self, observer: Arc<dyn PeerObserver>) {
        let candidates = observer.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                // end-of-gathering is signalled with None
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(init) => candidates.on_local_candidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }),
                        Err(e) => warn!("Failed to serialize local candidate: {}", e),
                    }
                }
                Box::pin(async {})
            }));

        let states = observer.clone();
        let generation = self.generation;
        self.pc
            .on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
                debug!("ICE connection state {} (generation {})", s, generation);
                states.on_ice_state_change();
                Box::pin(async {})
            }));

        let tracks = observer;
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            tracks.on_track(TrackEvent {
                kind: track.kind().to_string(),
                track_id: track.id(),
                stream_id: track.stream_id(),
                track: Some(track),
            });
            Box::pin(async {})
        }));
    }
}

#[async_trait]
impl MediaPeer for RtcPeer {
    async fn create_offer(&self) -> Result<String> {
        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        *self.pristine_offer.lock() = Some(offer);
        Ok(sdp)
    }

    async fn set_local_description(&self, sdp: &str) -> Result<String> {
        let desc = RTCSessionDescription::offer(sdp.to_string())?;
        match self.pc.set_local_description(desc).await {
            Ok(()) => Ok(sdp.to_string()),
            Err(e) => {
                let pristine = self.pristine_offer.lock().take();
                let Some(pristine) = pristine else {
                    return Err(e.into());
                };
                warn!("Edited offer rejected ({}), using the unedited offer", e);
                let applied = pristine.sdp.clone();
                self.pc.set_local_description(pristine).await?;
                Ok(applied)
            }
        }
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<()> {
        let desc = RTCSessionDescription::answer(sdp.to_string())?;
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    fn ice_state(&self) -> Option<IceState> {
        IceState::from_rtc(self.pc.ice_connection_state())
    }

    fn take_data_channel_closed(&self) -> Option<oneshot::Receiver<()>> {
        self.dc_closed.lock().take()
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to close peer connection: {}", e)))
    }
}
