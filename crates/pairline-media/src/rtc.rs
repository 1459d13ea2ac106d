//! webrtc-rs backed peer connections.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use pairline_shared::protocol::IceCandidate;

use crate::config::RtcConfig;
use crate::error::RtcError;
use crate::media::LocalMedia;
use crate::peer::{
    LinkState, PeerConnection, PeerConnectionFactory, PeerEventSink, PeerSignal, RemoteTrack,
    TrackKind,
};
use crate::quality::{EncodingBounds, RawStats};

impl From<RTCPeerConnectionState> for LinkState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New => LinkState::New,
            RTCPeerConnectionState::Connecting => LinkState::Connecting,
            RTCPeerConnectionState::Connected => LinkState::Connected,
            RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
            RTCPeerConnectionState::Failed => LinkState::Failed,
            RTCPeerConnectionState::Closed => LinkState::Closed,
            _ => LinkState::New,
        }
    }
}

pub struct RtcPeerFactory {
    api: API,
    config: RtcConfig,
}

impl RtcPeerFactory {
    /// Build the WebRTC API with the default codecs and interceptors.
    /// Fails if `config` has no usable TURN server.
    pub fn new(config: RtcConfig) -> Result<Self, RtcError> {
        config.validate()?;

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, config })
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ice_candidate_pool_size: self.config.ice_candidate_pool_size,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            ..Default::default()
        }
    }
}

impl PeerConnectionFactory for RtcPeerFactory {
    type Connection = RtcPeer;

    async fn create(&self, events: PeerEventSink) -> Result<RtcPeer, RtcError> {
        let pc = Arc::new(self.api.new_peer_connection(self.rtc_configuration()).await?);
        install_callbacks(&pc, events);

        Ok(RtcPeer {
            pc,
            bounds: Mutex::new(EncodingBounds::default()),
            audio: Mutex::new(None),
            video: Mutex::new(None),
        })
    }
}

fn install_callbacks(pc: &RTCPeerConnection, events: PeerEventSink) {
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        // `None` marks the end of gathering.
        if let Some(candidate) = candidate {
            match candidate.to_json() {
                Ok(init) => {
                    sink.emit(PeerSignal::LocalIceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => warn!(error = %e, "Could not serialize local ICE candidate"),
            }
        }
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        debug!(generation = sink.generation(), state = %state, "Peer connection state");
        sink.emit(PeerSignal::StateChanged(state.into()));
        Box::pin(async {})
    }));

    let sink = events;
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(TrackKind::Audio),
                RTPCodecType::Video => Some(TrackKind::Video),
                _ => None,
            };
            if let Some(kind) = kind {
                sink.emit(PeerSignal::RemoteTrack(RemoteTrack {
                    track_id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                }));
            }
            Box::pin(async {})
        },
    ));
}

struct VideoSender {
    track: Arc<TrackLocalStaticSample>,
    sender: Arc<RTCRtpSender>,
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    bounds: Mutex<EncodingBounds>,
    audio: Mutex<Option<Arc<TrackLocalStaticSample>>>,
    video: Mutex<Option<VideoSender>>,
}

impl RtcPeer {
    /// Outgoing tracks, for the capture pipeline to write samples into.
    pub async fn local_tracks(&self) -> Vec<Arc<TrackLocalStaticSample>> {
        let mut tracks = Vec::new();
        if let Some(audio) = self.audio.lock().await.as_ref() {
            tracks.push(audio.clone());
        }
        if let Some(video) = self.video.lock().await.as_ref() {
            tracks.push(video.track.clone());
        }
        tracks
    }

    async fn add_video_track(&self, stream_id: &str) -> Result<VideoSender, RtcError> {
        let track = video_track(stream_id);
        let sender = self
            .pc
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        Ok(VideoSender { track, sender })
    }
}

fn audio_track(stream_id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            ..Default::default()
        },
        "audio".to_owned(),
        stream_id.to_owned(),
    ))
}

fn video_track(stream_id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            ..Default::default()
        },
        "video".to_owned(),
        stream_id.to_owned(),
    ))
}

impl PeerConnection for RtcPeer {
    async fn create_offer(&self) -> Result<String, RtcError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, RtcError> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(answer.sdp)
    }

    async fn set_remote_offer(&self, sdp: String) -> Result<(), RtcError> {
        let bounds = *self.bounds.lock().await;
        let desc = RTCSessionDescription::offer(apply_bandwidth(&sdp, bounds))
            .map_err(|e| RtcError::InvalidSdp(e.to_string()))?;
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn set_remote_answer(&self, sdp: String) -> Result<(), RtcError> {
        let bounds = *self.bounds.lock().await;
        let desc = RTCSessionDescription::answer(apply_bandwidth(&sdp, bounds))
            .map_err(|e| RtcError::InvalidSdp(e.to_string()))?;
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn add_local_media(&self, media: &LocalMedia) -> Result<(), RtcError> {
        if media.audio {
            let mut audio = self.audio.lock().await;
            if audio.is_none() {
                let track = audio_track(&media.stream_id);
                self.pc
                    .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
                    .await?;
                *audio = Some(track);
            }
        }

        if media.video {
            let mut video = self.video.lock().await;
            if video.is_none() {
                *video = Some(self.add_video_track(&media.stream_id).await?);
            }
        }
        Ok(())
    }

    async fn replace_video_source(&self, media: &LocalMedia) -> Result<bool, RtcError> {
        let mut video = self.video.lock().await;

        match (video.as_mut(), media.video) {
            (Some(current), true) => {
                let track = video_track(&media.stream_id);
                current
                    .sender
                    .replace_track(Some(track.clone() as Arc<dyn TrackLocal + Send + Sync>))
                    .await?;
                current.track = track;
                Ok(false)
            }
            (Some(current), false) => {
                current.sender.replace_track(None).await?;
                Ok(false)
            }
            (None, true) => {
                // No video sender to reuse: a new m-line needs an offer.
                *video = Some(self.add_video_track(&media.stream_id).await?);
                Ok(true)
            }
            (None, false) => Ok(false),
        }
    }

    /// webrtc-rs has no sender parameters for bitrate, so the bounds are
    /// written into the video section of every remote description applied
    /// from now on.
    async fn set_encoding_bounds(&self, bounds: EncodingBounds) -> Result<(), RtcError> {
        *self.bounds.lock().await = bounds;
        Ok(())
    }

    async fn sample_stats(&self) -> Result<RawStats, RtcError> {
        let report = self.pc.get_stats().await;
        Ok(raw_stats(report.reports.values()))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(error = %e, "Error closing peer connection");
        }
    }
}

/// Fold a stats report into the counters the sampler understands.
///
/// RTT comes from the nominated candidate pair, falling back to the RTCP
/// receiver reports. Loss is summed over every `remote-inbound-rtp` stream
/// (what the far side reports about our outgoing media). webrtc-rs does not
/// produce jitter yet, so it stays `None`.
pub fn raw_stats<'a>(reports: impl IntoIterator<Item = &'a StatsReportType>) -> RawStats {
    let mut raw = RawStats::default();
    let mut rtcp_rtt: Option<f64> = None;

    for stat in reports {
        match stat {
            StatsReportType::CandidatePair(pair) if pair.nominated => {
                raw.rtt = Duration::try_from_secs_f64(pair.current_round_trip_time)
                    .ok()
                    .filter(|rtt| !rtt.is_zero());
                raw.bytes_sent = pair.bytes_sent;
                raw.bytes_received = pair.bytes_received;
            }
            StatsReportType::RemoteInboundRTP(remote) => {
                let lost = u64::try_from(remote.packets_lost).unwrap_or(0);
                raw.packets_lost = Some(raw.packets_lost.unwrap_or(0) + lost);
                raw.packets_received =
                    Some(raw.packets_received.unwrap_or(0) + remote.packets_received);
                if let Some(rtt) = remote.round_trip_time {
                    rtcp_rtt = Some(rtcp_rtt.map_or(rtt, |worst| worst.max(rtt)));
                }
            }
            _ => {}
        }
    }

    if raw.rtt.is_none() {
        raw.rtt = rtcp_rtt
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .filter(|rtt| !rtt.is_zero());
    }
    raw
}

/// Write the bitrate window into every video section: `b=AS`/`b=TIAS` for
/// the ceiling and `x-google-*-bitrate` fmtp parameters for the floor.
/// Existing bandwidth lines and `x-google-` parameters are replaced. Other
/// sections are untouched.
pub fn apply_bandwidth(sdp: &str, bounds: EncodingBounds) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut section: Vec<&str> = Vec::new();

    for line in sdp.lines() {
        if line.starts_with("m=") {
            munge_section(&section, bounds, &mut out);
            section.clear();
        }
        section.push(line);
    }
    munge_section(&section, bounds, &mut out);

    let mut munged = out.join("\r\n");
    munged.push_str("\r\n");
    munged
}

fn munge_section(lines: &[&str], bounds: EncodingBounds, out: &mut Vec<String>) {
    let Some((media, rest)) = lines.split_first().filter(|(m, _)| m.starts_with("m=video")) else {
        out.extend(lines.iter().map(|l| l.to_string()));
        return;
    };

    let bandwidth = [
        format!("b=AS:{}", bounds.max_bitrate_bps / 1000),
        format!("b=TIAS:{}", bounds.max_bitrate_bps),
    ];
    let window = format!(
        "x-google-min-bitrate={min};x-google-start-bitrate={min};x-google-max-bitrate={max}",
        min = bounds.min_bitrate_bps / 1000,
        max = bounds.max_bitrate_bps / 1000,
    );

    out.push(media.to_string());
    let mut inserted = false;
    let mut with_fmtp: Vec<&str> = Vec::new();

    for line in rest {
        if line.starts_with("b=AS:") || line.starts_with("b=TIAS:") {
            continue;
        }
        if !inserted {
            if line.starts_with("c=") {
                out.push(line.to_string());
                out.extend(bandwidth.iter().cloned());
                inserted = true;
                continue;
            }
            if !line.starts_with("i=") {
                out.extend(bandwidth.iter().cloned());
                inserted = true;
            }
        }
        if let Some(fmtp) = line.strip_prefix("a=fmtp:") {
            let (payload, params) = fmtp.split_once(' ').unwrap_or((fmtp, ""));
            with_fmtp.push(payload);
            let mut kept: Vec<&str> = params
                .split(';')
                .map(str::trim)
                .filter(|p| !p.is_empty() && !p.starts_with("x-google-"))
                .collect();
            kept.push(&window);
            out.push(format!("a=fmtp:{payload} {}", kept.join(";")));
            continue;
        }
        out.push(line.to_string());
    }
    if !inserted {
        out.extend(bandwidth.iter().cloned());
    }

    // m=<media> <port> <proto> <fmt>...
    for payload in media.split_whitespace().skip(3) {
        if !with_fmtp.contains(&payload) {
            out.push(format!("a=fmtp:{payload} {window}"));
        }
    }
}
