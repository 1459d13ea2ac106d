//! Per-link connection state machine.
//!
//! [`Orchestrator`] owns exactly one live peer connection at a time and
//! drives it through negotiation, recovery and teardown. It never sleeps on
//! its own: the owner asks [`Orchestrator::next_wakeup`] when to call
//! [`Orchestrator::handle_wakeup`], which keeps every timer testable on a
//! paused clock. `handle::OrchestratorHandle` wraps it in a task.

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use pairline_shared::protocol::{IceCandidate, SignalPayload};

use crate::config::OrchestratorSettings;
use crate::error::{OrchestratorError, RtcError};
use crate::ice::IceCandidateBuffer;
use crate::media::LocalMedia;
use crate::peer::{
    LinkState, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink, PeerSignal,
    RemoteTrack,
};
use crate::quality::{LinkStats, StatsSampler};
use crate::reconnect::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Failed,
}

/// Which side sends the opening offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Receiver,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    StateChanged(ConnectionState),
    RemoteTrack(RemoteTrack),
    /// Payload to relay to the remote peer
    OutgoingSignal(SignalPayload),
    Stats(LinkStats),
    /// Terminal failure, emitted once
    Error(OrchestratorError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NegotiationPhase {
    Stable,
    HaveLocalOffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    /// Link dropped; give it a chance to come back by itself
    Grace,
    /// Backoff delay elapsed, start the next attempt
    Retry,
    /// The current attempt did not reach Connected in time
    AttemptTimeout,
}

pub struct Orchestrator<F: PeerConnectionFactory> {
    factory: F,
    role: Role,
    settings: OrchestratorSettings,
    state: ConnectionState,
    phase: NegotiationPhase,
    connection: Option<F::Connection>,
    generation: u64,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    local_media: Option<LocalMedia>,
    ice: IceCandidateBuffer,
    backoff: Backoff,
    deadline: Option<(Instant, Deadline)>,
    next_stats: Option<Instant>,
    sampler: StatsSampler,
    events: mpsc::UnboundedSender<OrchestratorEvent>,
    ever_connected: bool,
    pending_renegotiation: bool,
    closed: bool,
}

impl<F: PeerConnectionFactory> Orchestrator<F> {
    /// Returns the orchestrator and the receiver its peer connections
    /// report into; feed that receiver to [`Self::handle_peer_event`].
    pub fn new(
        factory: F,
        role: Role,
        settings: OrchestratorSettings,
        events: mpsc::UnboundedSender<OrchestratorEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let backoff = Backoff::from_settings(&settings);

        (
            Self {
                factory,
                role,
                settings,
                state: ConnectionState::Idle,
                phase: NegotiationPhase::Stable,
                connection: None,
                generation: 0,
                peer_tx,
                local_media: None,
                ice: IceCandidateBuffer::new(),
                backoff,
                deadline: None,
                next_stats: None,
                sampler: StatsSampler::new(),
                events,
                ever_connected: false,
                pending_renegotiation: false,
                closed: false,
            },
            peer_rx,
        )
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Closed by the user or failed for good.
    pub fn is_finished(&self) -> bool {
        self.closed || self.state == ConnectionState::Failed
    }

    /// Earliest instant at which [`Self::handle_wakeup`] has work to do.
    pub fn next_wakeup(&self) -> Option<Instant> {
        let deadline = self.deadline.map(|(at, _)| at);
        match (deadline, self.next_stats) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // -----------------------------------------------------------------------
    // Negotiation
    // -----------------------------------------------------------------------

    /// Attach local media. Applied to the current connection, if any, and to
    /// every connection created afterwards.
    pub async fn set_local_media(&mut self, media: LocalMedia) -> Result<(), OrchestratorError> {
        self.ensure_open()?;
        if let Some(conn) = &self.connection {
            let result = conn.add_local_media(&media).await;
            self.check(result).await?;
        }
        self.local_media = Some(media);
        Ok(())
    }

    pub async fn create_offer(&mut self) -> Result<(), OrchestratorError> {
        self.ensure_open()?;
        if self.phase != NegotiationPhase::Stable {
            return Err(OrchestratorError::NegotiationInProgress);
        }

        if self.connection.is_none() {
            let result = self.replace_connection().await;
            self.check(result).await?;
        }

        let result = match &self.connection {
            Some(conn) => conn.create_offer().await,
            None => return Err(OrchestratorError::Closed),
        };
        let sdp = self.check(result).await?;

        self.phase = NegotiationPhase::HaveLocalOffer;
        if self.state == ConnectionState::Idle {
            self.set_state(ConnectionState::Connecting);
        }
        debug!(generation = self.generation, "Sending offer");
        self.emit(OrchestratorEvent::OutgoingSignal(SignalPayload::Offer { sdp }));
        Ok(())
    }

    pub async fn handle_offer(&mut self, sdp: String) -> Result<(), OrchestratorError> {
        self.ensure_open()?;

        let link_down = matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Reconnecting
        );
        if self.phase == NegotiationPhase::HaveLocalOffer {
            if self.role == Role::Initiator {
                debug!("Ignoring offer that collides with our own");
                return Ok(());
            }
            // Receiver yields: drop our offer and answer theirs.
            let result = self.replace_connection().await;
            self.check(result).await?;
        } else if self.connection.is_none() || (link_down && self.ice.is_ready()) {
            let result = self.replace_connection().await;
            self.check(result).await?;
        }

        let result = match &self.connection {
            Some(conn) => conn.set_remote_offer(sdp).await,
            None => return Err(OrchestratorError::Closed),
        };
        self.check(result).await?;
        self.flush_ice_candidates().await;

        let result = match &self.connection {
            Some(conn) => conn.create_answer().await,
            None => return Err(OrchestratorError::Closed),
        };
        let answer = self.check(result).await?;

        self.phase = NegotiationPhase::Stable;
        if self.state == ConnectionState::Idle {
            self.set_state(ConnectionState::Connecting);
        }
        debug!(generation = self.generation, "Sending answer");
        self.emit(OrchestratorEvent::OutgoingSignal(SignalPayload::Answer {
            sdp: answer,
        }));
        Ok(())
    }

    pub async fn handle_answer(&mut self, sdp: String) -> Result<(), OrchestratorError> {
        self.ensure_open()?;
        if self.phase != NegotiationPhase::HaveLocalOffer {
            debug!("Ignoring stale answer");
            return Ok(());
        }

        let result = match &self.connection {
            Some(conn) => conn.set_remote_answer(sdp).await,
            None => return Err(OrchestratorError::Closed),
        };
        self.check(result).await?;

        self.phase = NegotiationPhase::Stable;
        self.flush_ice_candidates().await;

        if std::mem::take(&mut self.pending_renegotiation) {
            self.create_offer().await?;
        }
        Ok(())
    }

    /// Apply a remote candidate, or hold it until the remote description is
    /// set. A candidate the backend rejects is logged and skipped.
    pub async fn add_ice_candidate(&mut self, candidate: IceCandidate) {
        if self.is_finished() {
            return;
        }
        match self.ice.accept(candidate) {
            Some(candidate) => self.apply_ice_candidate(candidate).await,
            None => trace!(buffered = self.ice.len(), "Buffered early ICE candidate"),
        }
    }

    /// Dispatch a payload relayed from the remote peer.
    pub async fn handle_remote_signal(
        &mut self,
        payload: SignalPayload,
    ) -> Result<(), OrchestratorError> {
        match payload {
            SignalPayload::Offer { sdp } => self.handle_offer(sdp).await,
            SignalPayload::Answer { sdp } => self.handle_answer(sdp).await,
            SignalPayload::IceCandidate(candidate) => {
                self.add_ice_candidate(candidate).await;
                Ok(())
            }
            other => {
                trace!(kind = other.kind(), "Not a negotiation payload");
                Ok(())
            }
        }
    }

    /// Swap the outgoing video on the live connection. Renegotiates only when
    /// the backend says the swap cannot happen in place.
    pub async fn switch_video_source(&mut self, media: LocalMedia) -> Result<(), OrchestratorError> {
        self.ensure_open()?;

        let renegotiate = match &self.connection {
            Some(conn) => conn.replace_video_source(&media).await?,
            None => false,
        };
        self.local_media = Some(media);

        if renegotiate {
            if self.phase == NegotiationPhase::Stable {
                self.create_offer().await?;
            } else {
                debug!("Renegotiation deferred until the current one settles");
                self.pending_renegotiation = true;
            }
        }
        Ok(())
    }

    /// Explicit leave. Terminal: stops every timer and drops the connection
    /// and the media handle.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.deadline = None;
        self.next_stats = None;
        self.local_media = None;
        self.ice.reset();

        if let Some(conn) = self.connection.take() {
            conn.close().await;
        }
        info!(generation = self.generation, "Link closed");
        self.set_state(ConnectionState::Disconnected);
    }

    // -----------------------------------------------------------------------
    // Backend events and timers
    // -----------------------------------------------------------------------

    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        if event.generation != self.generation || self.is_finished() {
            trace!(
                generation = event.generation,
                current = self.generation,
                "Dropping event from a replaced connection"
            );
            return;
        }

        match event.signal {
            PeerSignal::LocalIceCandidate(candidate) => {
                self.emit(OrchestratorEvent::OutgoingSignal(SignalPayload::IceCandidate(
                    candidate,
                )));
            }
            PeerSignal::RemoteTrack(track) => {
                debug!(track = %track.track_id, kind = ?track.kind, "Remote track");
                self.emit(OrchestratorEvent::RemoteTrack(track));
            }
            PeerSignal::StateChanged(link) => self.on_link_state(link, Instant::now()).await,
        }
    }

    async fn on_link_state(&mut self, link: LinkState, now: Instant) {
        match link {
            LinkState::Connected => {
                if self.state == ConnectionState::Connected {
                    return;
                }
                if self.ever_connected {
                    info!(attempts = self.backoff.attempts(), "Link recovered");
                }
                self.ever_connected = true;
                self.backoff.reset();
                self.deadline = None;
                self.sampler.reset();
                self.next_stats = Some(now + self.settings.stats_interval);
                self.set_state(ConnectionState::Connected);
            }
            LinkState::Disconnected => {
                if self.state == ConnectionState::Connected {
                    self.next_stats = None;
                    self.deadline = Some((now + self.settings.grace_period, Deadline::Grace));
                    self.set_state(ConnectionState::Disconnected);
                }
            }
            LinkState::Failed => {
                if !self.ever_connected {
                    self.fail(OrchestratorError::NegotiationFailed(
                        "ICE connectivity checks failed".into(),
                    ))
                    .await;
                    return;
                }
                // Skip the grace period: the backend already gave up on this
                // connection.
                self.next_stats = None;
                if self.state == ConnectionState::Connected {
                    self.set_state(ConnectionState::Disconnected);
                }
                self.schedule_retry(now).await;
            }
            LinkState::New | LinkState::Connecting | LinkState::Closed => {}
        }
    }

    pub async fn handle_wakeup(&mut self, now: Instant) {
        if let Some((at, kind)) = self.deadline {
            if now >= at {
                self.deadline = None;
                match kind {
                    Deadline::Grace => {
                        if self.state == ConnectionState::Disconnected {
                            self.schedule_retry(now).await;
                        }
                    }
                    Deadline::Retry => self.start_attempt(now).await,
                    Deadline::AttemptTimeout => {
                        debug!(attempt = self.backoff.attempts(), "Reconnection attempt timed out");
                        self.schedule_retry(now).await;
                    }
                }
            }
        }

        if let Some(at) = self.next_stats {
            if now >= at && self.state == ConnectionState::Connected {
                self.next_stats = Some(at + self.settings.stats_interval);
                self.sample_stats(now).await;
            }
        }
    }

    async fn schedule_retry(&mut self, now: Instant) {
        match self.backoff.next_delay() {
            Some(delay) => {
                info!(
                    attempt = self.backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnection"
                );
                self.deadline = Some((now + delay, Deadline::Retry));
                self.set_state(ConnectionState::Reconnecting);
            }
            None => {
                self.fail(OrchestratorError::LinkLost).await;
            }
        }
    }

    async fn start_attempt(&mut self, now: Instant) {
        let result = self.replace_connection().await;
        if self.check(result).await.is_err() {
            return;
        }

        self.deadline = Some((now + self.settings.attempt_timeout, Deadline::AttemptTimeout));
        if self.role == Role::Initiator {
            if let Err(e) = self.create_offer().await {
                debug!(error = %e, "Re-offer failed");
            }
        }
    }

    async fn sample_stats(&mut self, now: Instant) {
        let Some(conn) = &self.connection else {
            return;
        };
        match conn.sample_stats().await {
            Ok(raw) => {
                let stats = self.sampler.sample(raw, now);
                trace!(quality = ?stats.quality, rtt_ms = ?stats.rtt_ms, "Link stats");
                self.emit(OrchestratorEvent::Stats(stats));
            }
            Err(e) => debug!(error = %e, "Stats sampling failed"),
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Close the current connection (if any) and open a fresh one carrying
    /// the local media and encoding bounds.
    async fn replace_connection(&mut self) -> Result<(), RtcError> {
        if let Some(old) = self.connection.take() {
            old.close().await;
        }

        self.generation += 1;
        self.ice.rearm();
        self.phase = NegotiationPhase::Stable;

        let sink = PeerEventSink::new(self.generation, self.peer_tx.clone());
        let conn = self.factory.create(sink).await?;
        conn.set_encoding_bounds(self.settings.encoding).await?;
        if let Some(media) = &self.local_media {
            conn.add_local_media(media).await?;
        }

        debug!(generation = self.generation, "Peer connection created");
        self.connection = Some(conn);
        Ok(())
    }

    async fn flush_ice_candidates(&mut self) {
        let candidates = self.ice.release();
        if !candidates.is_empty() {
            debug!(count = candidates.len(), "Applying buffered ICE candidates");
        }
        for candidate in candidates {
            self.apply_ice_candidate(candidate).await;
        }
    }

    async fn apply_ice_candidate(&mut self, candidate: IceCandidate) {
        let Some(conn) = &self.connection else {
            return;
        };
        if let Err(e) = conn.add_ice_candidate(candidate).await {
            warn!(error = %e, "Remote ICE candidate rejected");
        }
    }

    fn ensure_open(&self) -> Result<(), OrchestratorError> {
        if self.is_finished() {
            return Err(OrchestratorError::Closed);
        }
        Ok(())
    }

    /// Map a backend failure to a terminal negotiation error.
    async fn check<T>(&mut self, result: Result<T, RtcError>) -> Result<T, OrchestratorError> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => Err(self.fail(e.into()).await),
        }
    }

    async fn fail(&mut self, error: OrchestratorError) -> OrchestratorError {
        if self.state != ConnectionState::Failed {
            warn!(error = %error, "Link failed");
            self.deadline = None;
            self.next_stats = None;
            if let Some(conn) = self.connection.take() {
                conn.close().await;
            }
            self.set_state(ConnectionState::Failed);
            self.emit(OrchestratorEvent::Error(error.clone()));
        }
        error
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "Link state");
            self.state = state;
            self.emit(OrchestratorEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: OrchestratorEvent) {
        if self.events.send(event).is_err() {
            trace!("Orchestrator event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::media::MediaConstraints;
    use crate::peer::fake::{Call, FakeFactory};
    use crate::peer::TrackKind;
    use crate::quality::{EncodingBounds, RawStats};

    type Events = mpsc::UnboundedReceiver<OrchestratorEvent>;

    fn orchestrator(role: Role) -> (Orchestrator<FakeFactory>, FakeFactory, Events) {
        let factory = FakeFactory::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let (orch, _peer_rx) =
            Orchestrator::new(factory.clone(), role, OrchestratorSettings::default(), tx);
        (orch, factory, rx)
    }

    fn drain(rx: &mut Events) -> Vec<OrchestratorEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn candidate(n: u8) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n}"),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }

    fn link(generation: u64, state: LinkState) -> PeerEvent {
        PeerEvent {
            generation,
            signal: PeerSignal::StateChanged(state),
        }
    }

    async fn connected_initiator() -> (Orchestrator<FakeFactory>, FakeFactory, Events) {
        let (mut orch, factory, mut rx) = orchestrator(Role::Initiator);
        orch.create_offer().await.unwrap();
        orch.handle_answer("answer".into()).await.unwrap();
        orch.handle_peer_event(link(1, LinkState::Connected)).await;
        assert_eq!(orch.state(), ConnectionState::Connected);
        drain(&mut rx);
        (orch, factory, rx)
    }

    #[tokio::test]
    async fn test_initiator_offer_creates_connection_with_bounds() {
        let (mut orch, factory, mut rx) = orchestrator(Role::Initiator);
        orch.create_offer().await.unwrap();

        assert_eq!(
            factory.calls(),
            vec![
                Call::SetEncodingBounds(EncodingBounds::default()),
                Call::CreateOffer
            ]
        );
        assert_eq!(
            drain(&mut rx),
            vec![
                OrchestratorEvent::StateChanged(ConnectionState::Connecting),
                OrchestratorEvent::OutgoingSignal(SignalPayload::Offer {
                    sdp: "offer-1".into()
                }),
            ]
        );

        assert_eq!(
            orch.create_offer().await,
            Err(OrchestratorError::NegotiationInProgress)
        );
    }

    #[tokio::test]
    async fn test_early_candidates_applied_after_remote_offer() {
        let (mut orch, factory, mut rx) = orchestrator(Role::Receiver);
        orch.add_ice_candidate(candidate(1)).await;
        orch.add_ice_candidate(candidate(2)).await;
        assert_eq!(factory.connections_created(), 0);

        orch.handle_offer("offer".into()).await.unwrap();
        orch.add_ice_candidate(candidate(3)).await;

        assert_eq!(
            factory.calls(),
            vec![
                Call::SetEncodingBounds(EncodingBounds::default()),
                Call::SetRemoteOffer("offer".into()),
                Call::AddIceCandidate("candidate:1".into()),
                Call::AddIceCandidate("candidate:2".into()),
                Call::CreateAnswer,
                Call::AddIceCandidate("candidate:3".into()),
            ]
        );
        assert!(drain(&mut rx).contains(&OrchestratorEvent::OutgoingSignal(
            SignalPayload::Answer {
                sdp: "answer-1".into()
            }
        )));
    }

    #[tokio::test]
    async fn test_initiator_ignores_colliding_offer() {
        let (mut orch, factory, _rx) = orchestrator(Role::Initiator);
        orch.create_offer().await.unwrap();
        orch.handle_offer("their-offer".into()).await.unwrap();

        assert!(!factory
            .calls()
            .iter()
            .any(|c| matches!(c, Call::SetRemoteOffer(_))));
    }

    #[tokio::test]
    async fn test_stale_answer_is_ignored() {
        let (mut orch, factory, _rx) = orchestrator(Role::Initiator);
        orch.create_offer().await.unwrap();
        orch.handle_answer("first".into()).await.unwrap();
        orch.handle_answer("second".into()).await.unwrap();

        let answers: Vec<Call> = factory
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::SetRemoteAnswer(_)))
            .collect();
        assert_eq!(answers, vec![Call::SetRemoteAnswer("first".into())]);
    }

    #[tokio::test]
    async fn test_negotiation_error_fails_once() {
        let (mut orch, factory, mut rx) = orchestrator(Role::Receiver);
        factory.state.lock().unwrap().fail_remote_offer = true;

        let err = orch.handle_offer("bad".into()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NegotiationFailed(_)));
        assert_eq!(orch.state(), ConnectionState::Failed);
        assert_eq!(factory.calls().last(), Some(&Call::Close));

        assert_eq!(orch.handle_offer("again".into()).await, Err(OrchestratorError::Closed));
        let errors = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, OrchestratorEvent::Error(_)))
            .count();
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn test_ice_failure_before_connecting_is_terminal() {
        let (mut orch, _factory, mut rx) = orchestrator(Role::Initiator);
        orch.create_offer().await.unwrap();
        orch.handle_peer_event(link(1, LinkState::Failed)).await;

        assert_eq!(orch.state(), ConnectionState::Failed);
        assert!(orch.next_wakeup().is_none());
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, OrchestratorEvent::Error(OrchestratorError::NegotiationFailed(_)))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnection_is_bounded_then_fails() {
        let (mut orch, factory, mut rx) = connected_initiator().await;

        orch.handle_peer_event(link(1, LinkState::Disconnected)).await;
        assert_eq!(orch.state(), ConnectionState::Disconnected);

        let grace_end = orch.next_wakeup().unwrap();
        assert_eq!(grace_end - Instant::now(), Duration::from_secs(2));
        orch.handle_wakeup(grace_end).await;
        assert_eq!(orch.state(), ConnectionState::Reconnecting);

        let mut delays = Vec::new();
        let mut now = grace_end;
        while let Some(retry_at) = orch.next_wakeup() {
            delays.push(retry_at - now);
            orch.handle_wakeup(retry_at).await;
            if orch.is_finished() {
                break;
            }
            // The attempt opened a fresh connection and re-offered on it.
            let generation = factory.connections_created() as u64;
            assert!(factory.calls_for(generation).contains(&Call::CreateOffer));

            let timeout_at = orch.next_wakeup().unwrap();
            orch.handle_wakeup(timeout_at).await;
            now = timeout_at;
        }

        let millis: Vec<u64> = delays.iter().map(|d| d.as_millis() as u64).collect();
        assert_eq!(millis, vec![500, 1_000, 2_000, 4_000, 8_000]);
        assert_eq!(factory.connections_created(), 6);
        assert_eq!(orch.state(), ConnectionState::Failed);
        assert!(orch.next_wakeup().is_none());
        assert!(drain(&mut rx)
            .contains(&OrchestratorEvent::Error(OrchestratorError::LinkLost)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_within_grace_needs_no_new_connection() {
        let (mut orch, factory, _rx) = connected_initiator().await;

        orch.handle_peer_event(link(1, LinkState::Disconnected)).await;
        orch.handle_peer_event(link(1, LinkState::Connected)).await;

        assert_eq!(orch.state(), ConnectionState::Connected);
        assert_eq!(factory.connections_created(), 1);
        // Only the stats timer remains.
        let next = orch.next_wakeup().unwrap();
        assert_eq!(next - Instant::now(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_from_replaced_connection_are_ignored() {
        let (mut orch, factory, _rx) = connected_initiator().await;

        orch.handle_peer_event(link(1, LinkState::Failed)).await;
        let retry_at = orch.next_wakeup().unwrap();
        orch.handle_wakeup(retry_at).await;
        assert_eq!(factory.connections_created(), 2);

        orch.handle_peer_event(link(1, LinkState::Connected)).await;
        assert_eq!(orch.state(), ConnectionState::Reconnecting);

        orch.handle_peer_event(link(2, LinkState::Connected)).await;
        assert_eq!(orch.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receiver_answers_reoffer_on_fresh_connection() {
        let (mut orch, factory, _rx) = orchestrator(Role::Receiver);
        orch.handle_offer("offer-a".into()).await.unwrap();
        orch.handle_peer_event(link(1, LinkState::Connected)).await;
        orch.handle_peer_event(link(1, LinkState::Disconnected)).await;

        orch.handle_offer("offer-b".into()).await.unwrap();
        assert_eq!(factory.connections_created(), 2);
        assert_eq!(
            factory.calls_for(2),
            vec![
                Call::SetEncodingBounds(EncodingBounds::default()),
                Call::SetRemoteOffer("offer-b".into()),
                Call::CreateAnswer,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_sampled_while_connected() {
        let (mut orch, factory, mut rx) = connected_initiator().await;
        factory.state.lock().unwrap().stats = RawStats {
            rtt: Some(Duration::from_millis(400)),
            ..Default::default()
        };

        let at = orch.next_wakeup().unwrap();
        orch.handle_wakeup(at).await;

        let stats: Vec<LinkStats> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                OrchestratorEvent::Stats(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].quality, crate::quality::LinkQuality::Poor);
        assert_eq!(orch.state(), ConnectionState::Connected);
        assert_eq!(orch.next_wakeup(), Some(at + Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_local_ice_and_tracks_are_forwarded() {
        let (mut orch, _factory, mut rx) = orchestrator(Role::Initiator);
        orch.create_offer().await.unwrap();
        drain(&mut rx);

        orch.handle_peer_event(PeerEvent {
            generation: 1,
            signal: PeerSignal::LocalIceCandidate(candidate(7)),
        })
        .await;
        let track = RemoteTrack {
            track_id: "v0".into(),
            stream_id: "remote".into(),
            kind: TrackKind::Video,
        };
        orch.handle_peer_event(PeerEvent {
            generation: 1,
            signal: PeerSignal::RemoteTrack(track.clone()),
        })
        .await;

        assert_eq!(
            drain(&mut rx),
            vec![
                OrchestratorEvent::OutgoingSignal(SignalPayload::IceCandidate(candidate(7))),
                OrchestratorEvent::RemoteTrack(track),
            ]
        );
    }

    #[tokio::test]
    async fn test_switch_video_renegotiates_only_when_required() {
        let (mut orch, factory, _rx) = orchestrator(Role::Initiator);
        let camera = LocalMedia::new("camera", MediaConstraints::AUDIO_VIDEO);
        orch.set_local_media(camera).await.unwrap();
        orch.create_offer().await.unwrap();
        orch.handle_answer("answer".into()).await.unwrap();

        let screen = LocalMedia::new("screen", MediaConstraints::AUDIO_VIDEO);
        orch.switch_video_source(screen.clone()).await.unwrap();
        let offers = factory
            .calls()
            .iter()
            .filter(|c| **c == Call::CreateOffer)
            .count();
        assert_eq!(offers, 1);

        factory.state.lock().unwrap().renegotiate_on_replace = true;
        orch.switch_video_source(screen).await.unwrap();
        let offers = factory
            .calls()
            .iter()
            .filter(|c| **c == Call::CreateOffer)
            .count();
        assert_eq!(offers, 2);
        assert!(factory.calls().contains(&Call::AddLocalMedia("camera".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_terminal_and_stops_timers() {
        let (mut orch, factory, mut rx) = connected_initiator().await;
        orch.close().await;

        assert_eq!(orch.state(), ConnectionState::Disconnected);
        assert!(orch.is_finished());
        assert!(orch.next_wakeup().is_none());
        assert_eq!(factory.calls().last(), Some(&Call::Close));
        assert_eq!(
            drain(&mut rx),
            vec![OrchestratorEvent::StateChanged(ConnectionState::Disconnected)]
        );
        assert_eq!(orch.create_offer().await, Err(OrchestratorError::Closed));
    }
}
