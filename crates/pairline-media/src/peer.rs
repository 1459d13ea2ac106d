//! The platform seam: one peer connection per link.
//!
//! Backends push asynchronous happenings (gathered candidates, state
//! changes, remote tracks) into a [`PeerEventSink`]. Every sink is tagged
//! with the generation of the connection it belongs to, so events from a
//! connection that has since been replaced can be told apart and dropped.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use pairline_shared::protocol::IceCandidate;

use crate::error::RtcError;
use crate::media::LocalMedia;
use crate::quality::{EncodingBounds, RawStats};

/// Transport-level state as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTrack {
    pub track_id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerSignal {
    LocalIceCandidate(IceCandidate),
    StateChanged(LinkState),
    RemoteTrack(RemoteTrack),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub generation: u64,
    pub signal: PeerSignal,
}

#[derive(Debug, Clone)]
pub struct PeerEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the owning link has gone away.
    pub fn emit(&self, signal: PeerSignal) -> bool {
        self.tx
            .send(PeerEvent {
                generation: self.generation,
                signal,
            })
            .is_ok()
    }
}

pub trait PeerConnection: Send + Sync + 'static {
    /// Create an offer and install it as the local description.
    fn create_offer(&self) -> impl Future<Output = Result<String, RtcError>> + Send;

    /// Create an answer and install it as the local description.
    fn create_answer(&self) -> impl Future<Output = Result<String, RtcError>> + Send;

    fn set_remote_offer(&self, sdp: String) -> impl Future<Output = Result<(), RtcError>> + Send;

    fn set_remote_answer(&self, sdp: String)
        -> impl Future<Output = Result<(), RtcError>> + Send;

    fn add_ice_candidate(
        &self,
        candidate: IceCandidate,
    ) -> impl Future<Output = Result<(), RtcError>> + Send;

    fn add_local_media(
        &self,
        media: &LocalMedia,
    ) -> impl Future<Output = Result<(), RtcError>> + Send;

    /// Swap the outgoing video for `media`. Returns `true` when the change
    /// cannot be done in place and a new offer is required.
    fn replace_video_source(
        &self,
        media: &LocalMedia,
    ) -> impl Future<Output = Result<bool, RtcError>> + Send;

    fn set_encoding_bounds(
        &self,
        bounds: EncodingBounds,
    ) -> impl Future<Output = Result<(), RtcError>> + Send;

    fn sample_stats(&self) -> impl Future<Output = Result<RawStats, RtcError>> + Send;

    fn close(&self) -> impl Future<Output = ()> + Send;
}

pub trait PeerConnectionFactory: Send + Sync + 'static {
    type Connection: PeerConnection;

    fn create(
        &self,
        events: PeerEventSink,
    ) -> impl Future<Output = Result<Self::Connection, RtcError>> + Send;
}

/// Lets one factory serve every link of a session.
impl<F: PeerConnectionFactory> PeerConnectionFactory for Arc<F> {
    type Connection = F::Connection;

    fn create(
        &self,
        events: PeerEventSink,
    ) -> impl Future<Output = Result<Self::Connection, RtcError>> + Send {
        F::create(self, events)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory peer connection recording every call made on it.

    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        CreateOffer,
        CreateAnswer,
        SetRemoteOffer(String),
        SetRemoteAnswer(String),
        AddIceCandidate(String),
        AddLocalMedia(String),
        ReplaceVideoSource(String),
        SetEncodingBounds(EncodingBounds),
        SampleStats,
        Close,
    }

    #[derive(Default)]
    pub struct FakeState {
        pub calls: Vec<(u64, Call)>,
        pub sinks: Vec<PeerEventSink>,
        pub fail_remote_offer: bool,
        pub renegotiate_on_replace: bool,
        pub stats: RawStats,
    }

    #[derive(Clone, Default)]
    pub struct FakeFactory {
        pub state: Arc<Mutex<FakeState>>,
    }

    impl FakeFactory {
        pub fn calls(&self) -> Vec<Call> {
            self.state
                .lock()
                .unwrap()
                .calls
                .iter()
                .map(|(_, c)| c.clone())
                .collect()
        }

        pub fn calls_for(&self, generation: u64) -> Vec<Call> {
            self.state
                .lock()
                .unwrap()
                .calls
                .iter()
                .filter(|(g, _)| *g == generation)
                .map(|(_, c)| c.clone())
                .collect()
        }

        pub fn connections_created(&self) -> usize {
            self.state.lock().unwrap().sinks.len()
        }

        /// Sink of the most recently created connection.
        pub fn sink(&self) -> PeerEventSink {
            self.state.lock().unwrap().sinks.last().cloned().unwrap()
        }
    }

    pub struct FakeConnection {
        generation: u64,
        state: Arc<Mutex<FakeState>>,
    }

    impl FakeConnection {
        fn record(&self, call: Call) {
            self.state.lock().unwrap().calls.push((self.generation, call));
        }
    }

    impl PeerConnection for FakeConnection {
        async fn create_offer(&self) -> Result<String, RtcError> {
            self.record(Call::CreateOffer);
            Ok(format!("offer-{}", self.generation))
        }

        async fn create_answer(&self) -> Result<String, RtcError> {
            self.record(Call::CreateAnswer);
            Ok(format!("answer-{}", self.generation))
        }

        async fn set_remote_offer(&self, sdp: String) -> Result<(), RtcError> {
            self.record(Call::SetRemoteOffer(sdp));
            if self.state.lock().unwrap().fail_remote_offer {
                return Err(RtcError::InvalidSdp("rejected by fake".into()));
            }
            Ok(())
        }

        async fn set_remote_answer(&self, sdp: String) -> Result<(), RtcError> {
            self.record(Call::SetRemoteAnswer(sdp));
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
            self.record(Call::AddIceCandidate(candidate.candidate));
            Ok(())
        }

        async fn add_local_media(&self, media: &LocalMedia) -> Result<(), RtcError> {
            self.record(Call::AddLocalMedia(media.stream_id.clone()));
            Ok(())
        }

        async fn replace_video_source(&self, media: &LocalMedia) -> Result<bool, RtcError> {
            self.record(Call::ReplaceVideoSource(media.stream_id.clone()));
            Ok(self.state.lock().unwrap().renegotiate_on_replace)
        }

        async fn set_encoding_bounds(&self, bounds: EncodingBounds) -> Result<(), RtcError> {
            self.record(Call::SetEncodingBounds(bounds));
            Ok(())
        }

        async fn sample_stats(&self) -> Result<RawStats, RtcError> {
            self.record(Call::SampleStats);
            Ok(self.state.lock().unwrap().stats.clone())
        }

        async fn close(&self) {
            self.record(Call::Close);
        }
    }

    impl PeerConnectionFactory for FakeFactory {
        type Connection = FakeConnection;

        async fn create(&self, events: PeerEventSink) -> Result<FakeConnection, RtcError> {
            let generation = events.generation();
            self.state.lock().unwrap().sinks.push(events);
            Ok(FakeConnection {
                generation,
                state: self.state.clone(),
            })
        }
    }
}
