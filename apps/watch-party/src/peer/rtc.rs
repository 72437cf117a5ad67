//! Peer connection backed by webrtc-rs.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use signal_bus::{IceCandidate, SdpType, SessionDescription};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::config::{IceServer, SessionConfig};
use crate::error::{Result, WatchPartyError, to_peer_error};
use crate::media::{MediaTrack, TrackKind};
use crate::peer::{
    ChannelOrigin, Connectivity, DataChannel, FrameOutcome, PeerConnection, PeerConnector,
    PeerEvent, PeerEventSink, gate_frame,
};

fn build_api() -> Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_peer_error)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(to_peer_error)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn to_connectivity(state: RTCIceConnectionState) -> Connectivity {
    match state {
        RTCIceConnectionState::Checking => Connectivity::Checking,
        RTCIceConnectionState::Connected => Connectivity::Connected,
        RTCIceConnectionState::Completed => Connectivity::Completed,
        RTCIceConnectionState::Disconnected => Connectivity::Disconnected,
        RTCIceConnectionState::Failed => Connectivity::Failed,
        RTCIceConnectionState::Closed => Connectivity::Closed,
        _ => Connectivity::New,
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

/// Opens webrtc-rs peer connections.
#[derive(Debug, Default, Clone, Copy)]
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
        config: &SessionConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>> {
        let connection = RtcPeerConnection::open(config, events).await?;
        let connection: Arc<dyn PeerConnection> = Arc::new(connection);
        Ok(connection)
    }
}

/// A captured track and the sample track that carries it.
#[derive(Clone)]
struct LocalSender {
    track: MediaTrack,
    writer: Arc<TrackLocalStaticSample>,
}

pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    events: PeerEventSink,
    stream_id: String,
    senders: Mutex<HashMap<String, LocalSender>>,
}

impl RtcPeerConnection {
    pub async fn open(config: &SessionConfig, events: PeerEventSink) -> Result<Self> {
        let api = build_api()?;
        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.iter().map(to_rtc_ice_server).collect(),
            ice_candidate_pool_size: config.ice_candidate_pool_size,
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(to_peer_error)?,
        );
        tracing::debug!(
            target = "webrtc",
            ice_servers = config.ice_servers.len(),
            "peer connection created"
        );

        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    tracing::trace!(target = "webrtc", "ice gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = sink.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(target = "webrtc", error = %err, "failed to serialise local candidate");
                    }
                }
            })
        }));

        let sink = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let sink = sink.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", ?state, "ice connection state changed");
                let _ = sink.send(PeerEvent::Connectivity(to_connectivity(state)));
            })
        }));

        let sink = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Video => TrackKind::Video,
                        _ => TrackKind::Audio,
                    };
                    let stream_id = track.stream_id();
                    tracing::debug!(target = "webrtc", %stream_id, %kind, "remote track");
                    let _ = sink.send(PeerEvent::RemoteTrack { stream_id, kind });
                })
            },
        ));

        let sink = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let sink = sink.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", label = dc.label(), "remote data channel announced");
                let channel = RtcDataChannel::wire(dc, ChannelOrigin::Remote, sink.clone());
                let _ = sink.send(PeerEvent::ChannelAnnounced(channel));
            })
        }));

        Ok(Self {
            pc,
            events,
            stream_id: uuid::Uuid::new_v4().to_string(),
            senders: Mutex::new(HashMap::new()),
        })
    }

    fn new_local_track(&self, track: &MediaTrack) -> Arc<TrackLocalStaticSample> {
        let writer = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_string(),
            self.stream_id.clone(),
        ));
        self.senders.lock().insert(
            track.id().to_string(),
            LocalSender {
                track: track.clone(),
                writer: writer.clone(),
            },
        );
        writer
    }

    fn attached_tracks(&self) -> usize {
        self.senders.lock().len()
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn add_track(&self, track: &MediaTrack) -> Result<()> {
        let local = self.new_local_track(track);
        self.pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(to_peer_error)?;
        tracing::debug!(target = "webrtc", track = track.id(), kind = %track.kind(), "local track attached");
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(to_peer_error)?;
        let channel = RtcDataChannel::wire(dc, ChannelOrigin::Local, self.events.clone());
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await.map_err(to_peer_error)?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(to_peer_error)?;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| WatchPartyError::PeerConnection("missing local description".into()))?;
        Ok(SessionDescription::offer(local.sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let remote = match description.sdp_type {
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
            SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Rollback => {
                return Err(WatchPartyError::PeerConnection(
                    "rollback descriptions are not supported".into(),
                ));
            }
        }
        .map_err(to_peer_error)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(to_peer_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| WatchPartyError::IceApply(err.to_string()))
    }

    async fn replace_video_track(&self, track: &MediaTrack) -> Result<bool> {
        for sender in self.pc.get_senders().await {
            let is_video = match sender.track().await {
                Some(current) => current.kind() == RTPCodecType::Video,
                None => false,
            };
            if !is_video {
                continue;
            }
            let local = self.new_local_track(track);
            sender
                .replace_track(Some(local as Arc<dyn TrackLocal + Send + Sync>))
                .await
                .map_err(to_peer_error)?;
            tracing::debug!(target = "webrtc", track = track.id(), "video sender track replaced");
            return Ok(true);
        }
        Ok(false)
    }

    async fn write_frame(
        &self,
        track_id: &str,
        data: Bytes,
        duration: Duration,
    ) -> Result<FrameOutcome> {
        let sender = self.senders.lock().get(track_id).cloned();
        let outcome = gate_frame(sender.as_ref().map(|sender| &sender.track));
        match (outcome, sender) {
            (FrameOutcome::Written, Some(sender)) => {
                let sample = Sample {
                    data,
                    duration,
                    ..Default::default()
                };
                sender
                    .writer
                    .write_sample(&sample)
                    .await
                    .map_err(to_peer_error)?;
            }
            (FrameOutcome::Ended, Some(_)) => {
                self.senders.lock().remove(track_id);
                tracing::debug!(target = "webrtc", track = track_id, "local track ended; sender released");
            }
            _ => {}
        }
        Ok(outcome)
    }

    async fn close(&self) -> Result<()> {
        self.senders.lock().clear();
        self.pc.close().await.map_err(to_peer_error)
    }
}

pub struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
}

impl RtcDataChannel {
    fn wire(
        dc: Arc<RTCDataChannel>,
        origin: ChannelOrigin,
        events: PeerEventSink,
    ) -> Arc<dyn DataChannel> {
        let sink = events.clone();
        dc.on_open(Box::new(move || {
            let sink = sink.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", ?origin, "data channel opened");
                let _ = sink.send(PeerEvent::ChannelOpen(origin));
            })
        }));

        let sink = events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let sink = sink.clone();
            Box::pin(async move {
                if !msg.is_string {
                    tracing::warn!(target = "webrtc", frame_len = msg.data.len(), "ignoring binary data channel frame");
                    return;
                }
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        let _ = sink.send(PeerEvent::ChannelMessage { origin, text });
                    }
                    Err(err) => {
                        tracing::warn!(target = "webrtc", error = %err, "data channel frame is not utf-8");
                    }
                }
            })
        }));

        let sink = events;
        dc.on_close(Box::new(move || {
            let sink = sink.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", ?origin, "data channel closed");
                let _ = sink.send(PeerEvent::ChannelClosed(origin));
            })
        }));

        let label = dc.label().to_string();
        Arc::new(Self { dc, label })
    }
}

impl fmt::Debug for RtcDataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcDataChannel")
            .field("label", &self.label)
            .field("open", &self.is_open())
            .finish()
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(WatchPartyError::ChannelClosed);
        }
        self.dc.send_text(text).await.map_err(to_peer_error)?;
        Ok(())
    }
}
