//! Ties the queue, rooms, relay and safety ledger together behind the
//! signaling protocol. One [`Hub`] serves every connection; the WebSocket
//! layer only moves frames in and out.

use std::net::IpAddr;

use tracing::{debug, info, warn};

use pairline_shared::protocol::{ClientMessage, ServerMessage};
use pairline_shared::types::{GroupSize, ParticipantId, Preferences, RoomId};
use pairline_store::{Ban, NewReport};

use crate::match_queue::MatchQueueHandle;
use crate::participants::{Outbound, ParticipantRegistry};
use crate::relay::{RelayOutcome, SignalRelay};
use crate::rooms::{JoinOutcome, RoomRegistry};
use crate::safety::{ReportVerdict, SafetyLedger};

const MAX_DISPLAY_NAME_CHARS: usize = 32;

#[derive(Clone)]
pub struct Hub {
    pub participants: ParticipantRegistry,
    pub rooms: RoomRegistry,
    pub queue: MatchQueueHandle,
    pub safety: SafetyLedger,
    relay: SignalRelay,
}

impl Hub {
    pub fn new(queue: MatchQueueHandle, safety: SafetyLedger, rooms: RoomRegistry) -> Self {
        let participants = ParticipantRegistry::new();
        Self {
            relay: SignalRelay::new(rooms.clone(), participants.clone()),
            participants,
            rooms,
            queue,
            safety,
        }
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Admit a new connection, or refuse it with the ban that applies.
    pub async fn connect(&self, addr: Option<IpAddr>, tx: Outbound) -> Result<ParticipantId, Ban> {
        if let Some(addr) = addr {
            if let Some(ban) = self.check_ban(addr).await {
                info!(addr = %addr, reason = %ban.reason, "Refused banned address");
                return Err(ban);
            }
        }

        let id = ParticipantId::new();
        let _ = tx.send(ServerMessage::Welcome { participant_id: id });
        let count = self.participants.register(id, addr, tx).await;
        info!(peer = %id, addr = ?addr, active = count, "Participant connected");

        self.participants
            .broadcast(ServerMessage::ActiveUsers { count })
            .await;
        Ok(id)
    }

    pub async fn disconnect(&self, id: ParticipantId) {
        if let Err(e) = self.queue.dequeue(id).await {
            warn!(peer = %id, error = %e, "Could not remove from queue");
        }
        if let Some(room_id) = self.participants.room_of(id).await {
            self.leave_room(id, &room_id).await;
        }

        if let Some(participant) = self.participants.unregister(id).await {
            let count = self.participants.count().await;
            info!(
                peer = %id,
                name = ?participant.display_name,
                active = count,
                "Participant disconnected"
            );
            self.participants
                .broadcast(ServerMessage::ActiveUsers { count })
                .await;
        }
    }

    // -----------------------------------------------------------------------
    // Protocol
    // -----------------------------------------------------------------------

    pub async fn handle(&self, from: ParticipantId, message: ClientMessage) {
        match message {
            ClientMessage::JoinQueue { preferences } => self.join_queue(from, preferences).await,
            ClientMessage::LeaveQueue => {
                if let Err(e) = self.queue.dequeue(from).await {
                    warn!(peer = %from, error = %e, "Could not remove from queue");
                }
            }
            ClientMessage::JoinRoom {
                room_id,
                display_name,
            } => self.join_room(from, room_id, display_name).await,
            ClientMessage::LeaveRoom { room_id } => self.leave_room(from, &room_id).await,
            ClientMessage::Signal(signal) => {
                if self.relay.relay(signal, from).await == RelayOutcome::UnknownTarget {
                    self.send_error(from, "Signal target is not in the room").await;
                }
            }
            ClientMessage::Panic { room_id } => self.panic(from, room_id).await,
            ClientMessage::Report {
                room_id,
                reason,
                details,
            } => {
                self.report(from, &room_id, reason, details).await;
            }
        }
    }

    async fn join_queue(&self, from: ParticipantId, preferences: Preferences) {
        if let Some(current) = self.participants.room_of(from).await {
            self.leave_room(from, &current).await;
        }

        if preferences.group_size == GroupSize::Group {
            let (room_id, outcome) = self.rooms.open_group_room(from).await;
            self.participants.set_room(from, Some(room_id.clone())).await;
            self.participants
                .send(from, ServerMessage::MatchFound { room_id: room_id.clone() })
                .await;
            self.announce_join(from, &room_id, outcome).await;
            return;
        }

        loop {
            let matched = match self.queue.enqueue(from, preferences.clone()).await {
                Ok(matched) => matched,
                Err(e) => {
                    warn!(peer = %from, error = %e, "Queue unavailable");
                    self.send_error(from, "Matchmaking is unavailable").await;
                    return;
                }
            };

            let Some(matched) = matched else {
                debug!(peer = %from, "Queued");
                self.participants.send(from, ServerMessage::Queued).await;
                return;
            };

            debug!(
                peer = %from,
                matched = %matched.peer_id,
                waited = ?matched.waited,
                partner_mode = ?matched.peer_preferences.mode,
                "Pairing"
            );
            if self.start_pair(matched.peer_id, from).await {
                return;
            }
            if self.participants.get(from).await.is_none() {
                return;
            }
            debug!(peer = %from, gone = %matched.peer_id, "Matched peer already gone, queueing again");
        }
    }

    /// `waiting` was first in line, so it initiates. Returns false, with the
    /// room dismantled, when `waiting` disconnected before the room filled.
    async fn start_pair(&self, waiting: ParticipantId, arriving: ParticipantId) -> bool {
        let room_id = RoomId::new_pair();

        let mut outcome = JoinOutcome::Waiting;
        for member in [waiting, arriving] {
            match self.rooms.join(&room_id, member).await {
                Ok(o) => outcome = o,
                Err(e) => {
                    warn!(room = %room_id, error = %e, "Fresh room refused a member");
                    self.dismantle(&room_id, [waiting, arriving]).await;
                    return false;
                }
            }
            if !self.participants.assign_room(member, room_id.clone()).await {
                self.dismantle(&room_id, [waiting, arriving]).await;
                return false;
            }
        }

        // A disconnect that landed between the two joins already emptied the room.
        if !matches!(outcome, JoinOutcome::Filled { .. }) {
            self.dismantle(&room_id, [waiting, arriving]).await;
            return false;
        }

        for member in [waiting, arriving] {
            self.participants
                .send(member, ServerMessage::MatchFound { room_id: room_id.clone() })
                .await;
        }
        self.announce_join(arriving, &room_id, outcome).await;
        true
    }

    /// Undo a pairing nobody was told about yet.
    async fn dismantle(&self, room_id: &RoomId, members: [ParticipantId; 2]) {
        for member in members {
            self.rooms.leave(room_id, member).await;
            if self.participants.room_of(member).await.as_ref() == Some(room_id) {
                self.participants.set_room(member, None).await;
            }
        }
    }

    async fn join_room(
        &self,
        from: ParticipantId,
        room_id: RoomId,
        display_name: Option<String>,
    ) {
        if let Some(name) = display_name {
            self.participants
                .set_display_name(from, sanitize_display_name(&name))
                .await;
        }

        if let Some(current) = self.participants.room_of(from).await {
            if current != room_id {
                self.leave_room(from, &current).await;
            }
        }
        if let Err(e) = self.queue.dequeue(from).await {
            warn!(peer = %from, error = %e, "Could not remove from queue");
        }

        match self.rooms.join(&room_id, from).await {
            Ok(outcome) => {
                self.participants.set_room(from, Some(room_id.clone())).await;
                self.announce_join(from, &room_id, outcome).await;
            }
            Err(e) => {
                debug!(peer = %from, room = %room_id, error = %e, "Join refused");
                self.send_error(from, &e.to_string()).await;
            }
        }
    }

    /// Tell the members what a successful join means for them.
    async fn announce_join(&self, joiner: ParticipantId, room_id: &RoomId, outcome: JoinOutcome) {
        match outcome {
            JoinOutcome::Waiting | JoinOutcome::AlreadyMember => {}
            JoinOutcome::Filled {
                initiator,
                receiver,
            } => {
                self.participants
                    .send(initiator, ServerMessage::IsInitiator { is_initiator: true })
                    .await;
                self.participants
                    .send(receiver, ServerMessage::IsInitiator { is_initiator: false })
                    .await;
            }
            JoinOutcome::GroupJoined { existing } => {
                for member in &existing {
                    self.participants
                        .send(*member, ServerMessage::PeerJoined { peer_id: joiner })
                        .await;
                }
                info!(room = %room_id, peer = %joiner, existing = existing.len(), "Joined group room");
                self.participants
                    .send(joiner, ServerMessage::ExistingPeers { peers: existing })
                    .await;
            }
        }
    }

    async fn leave_room(&self, from: ParticipantId, room_id: &RoomId) {
        if self.participants.room_of(from).await.as_ref() == Some(room_id) {
            self.participants.set_room(from, None).await;
        }

        let Some(outcome) = self.rooms.leave(room_id, from).await else {
            return;
        };

        let notice = if room_id.is_group() {
            ServerMessage::PeerLeft { peer_id: from }
        } else {
            ServerMessage::PeerDisconnected
        };
        for member in outcome.remaining {
            self.participants.send(member, notice.clone()).await;
        }
    }

    async fn panic(&self, from: ParticipantId, room_id: RoomId) {
        warn!(peer = %from, room = %room_id, "Panic");
        self.report(from, &room_id, "panic".to_string(), None).await;
        self.leave_room(from, &room_id).await;
    }

    async fn report(
        &self,
        from: ParticipantId,
        room_id: &RoomId,
        reason: String,
        details: Option<String>,
    ) -> Option<ReportVerdict> {
        let members = self.rooms.members(room_id).await.unwrap_or_default();
        if !members.contains(&from) {
            self.send_error(from, "Not a member of that room").await;
            return None;
        }

        let others: Vec<ParticipantId> = members.into_iter().filter(|m| *m != from).collect();
        let &[reported] = others.as_slice() else {
            self.send_error(from, "Reports need exactly one other member in the room")
                .await;
            return None;
        };

        let report = NewReport {
            reporter_id: from,
            reported_id: reported,
            reason,
            details,
            reporter_addr: self.participants.addr_of(from).await.map(|a| a.to_string()),
            reported_addr: self.participants.addr_of(reported).await.map(|a| a.to_string()),
        };

        let safety = self.safety.clone();
        let verdict = match tokio::task::spawn_blocking(move || safety.file_report(&report)).await
        {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(error = %e, "Report task failed");
                return None;
            }
        };

        debug!(reported = %reported, trust = verdict.trust_score, "Report applied");
        if let Some(ban) = &verdict.new_ban {
            self.enforce_ban(ban).await;
        }
        Some(verdict)
    }

    /// Every connection from the banned address is told and closed.
    async fn enforce_ban(&self, ban: &Ban) {
        let Ok(addr) = ban.address.parse::<IpAddr>() else {
            return;
        };
        for id in self.participants.connected_from(addr).await {
            self.participants
                .send(
                    id,
                    ServerMessage::Banned {
                        reason: ban.reason.clone(),
                    },
                )
                .await;
        }
    }

    async fn check_ban(&self, addr: IpAddr) -> Option<Ban> {
        let safety = self.safety.clone();
        let address = addr.to_string();
        match tokio::task::spawn_blocking(move || safety.check_ban(&address)).await {
            Ok(ban) => ban,
            Err(e) => {
                warn!(addr = %addr, error = %e, "Ban check task failed, letting the connection through");
                None
            }
        }
    }

    async fn send_error(&self, to: ParticipantId, message: &str) {
        self.participants
            .send(
                to,
                ServerMessage::Error {
                    message: message.to_string(),
                },
            )
            .await;
    }
}

/// Printable characters only, at most [`MAX_DISPLAY_NAME_CHARS`].
fn sanitize_display_name(name: &str) -> Option<String> {
    let cleaned: String = name
        .trim()
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_DISPLAY_NAME_CHARS)
        .collect();
    (!cleaned.is_empty()).then_some(cleaned)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use pairline_shared::protocol::{SignalMessage, SignalPayload};

    use super::*;
    use crate::match_queue::{MatchQueue, MemoryQueueStore};
    use crate::safety::MemoryTrustStore;

    type Inbox = mpsc::UnboundedReceiver<ServerMessage>;

    fn hub() -> Hub {
        let queue = MatchQueueHandle::spawn(MatchQueue::new(MemoryQueueStore::default(), 600));
        let safety = SafetyLedger::new(Arc::new(MemoryTrustStore::default()), 10, 50);
        Hub::new(queue, safety, RoomRegistry::new(4))
    }

    async fn connect(hub: &Hub, addr: &str) -> (ParticipantId, Inbox) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = hub.connect(Some(addr.parse().unwrap()), tx).await.unwrap();
        assert_eq!(rx.recv().await, Some(ServerMessage::Welcome { participant_id: id }));
        (id, rx)
    }

    /// Everything queued for this connection, active-user counts skipped.
    fn drain(rx: &mut Inbox) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if !matches!(message, ServerMessage::ActiveUsers { .. }) {
                out.push(message);
            }
        }
        out
    }

    async fn matched_pair(hub: &Hub) -> (ParticipantId, Inbox, ParticipantId, Inbox, RoomId) {
        let (x, mut rx_x) = connect(hub, "1.2.3.4").await;
        let (y, mut rx_y) = connect(hub, "5.6.7.8").await;
        hub.handle(x, ClientMessage::JoinQueue { preferences: Preferences::video() }).await;
        hub.handle(y, ClientMessage::JoinQueue { preferences: Preferences::video() }).await;

        let room_id = hub.participants.room_of(x).await.unwrap();
        drain(&mut rx_x);
        drain(&mut rx_y);
        (x, rx_x, y, rx_y, room_id)
    }

    #[tokio::test]
    async fn test_match_makes_first_in_line_initiator() {
        let hub = hub();
        let (x, mut rx_x) = connect(&hub, "1.2.3.4").await;
        let (y, mut rx_y) = connect(&hub, "5.6.7.8").await;

        hub.handle(x, ClientMessage::JoinQueue { preferences: Preferences::video() }).await;
        assert_eq!(drain(&mut rx_x), vec![ServerMessage::Queued]);

        hub.handle(y, ClientMessage::JoinQueue { preferences: Preferences::video() }).await;
        let room_id = hub.participants.room_of(y).await.unwrap();
        assert_eq!(hub.participants.room_of(x).await, Some(room_id.clone()));
        assert!(!room_id.is_group());

        assert_eq!(
            drain(&mut rx_x),
            vec![
                ServerMessage::MatchFound { room_id: room_id.clone() },
                ServerMessage::IsInitiator { is_initiator: true },
            ]
        );
        assert_eq!(
            drain(&mut rx_y),
            vec![
                ServerMessage::MatchFound { room_id: room_id.clone() },
                ServerMessage::IsInitiator { is_initiator: false },
            ]
        );
        assert_eq!(hub.queue.len().await, Ok(0));

        // The clients confirm by joining; roles are not handed out again.
        for id in [x, y] {
            hub.handle(
                id,
                ClientMessage::JoinRoom {
                    room_id: room_id.clone(),
                    display_name: Some("  anon\u{7}  ".into()),
                },
            )
            .await;
        }
        assert!(drain(&mut rx_x).is_empty());
        assert!(drain(&mut rx_y).is_empty());
        assert_eq!(
            hub.participants.get(x).await.unwrap().display_name.as_deref(),
            Some("anon")
        );
    }

    #[tokio::test]
    async fn test_signals_relayed_within_room() {
        let hub = hub();
        let (x, _rx_x, _y, mut rx_y, room_id) = matched_pair(&hub).await;

        let signal = SignalMessage::new(room_id, None, SignalPayload::Offer { sdp: "v=0".into() });
        hub.handle(x, ClientMessage::Signal(signal.clone())).await;

        match drain(&mut rx_y).as_slice() {
            [ServerMessage::Signal(received)] => {
                assert_eq!(received.id, signal.id);
                assert_eq!(received.sender, Some(x));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_leave_and_disconnect_notify_partner() {
        let hub = hub();
        let (x, _rx_x, y, mut rx_y, room_id) = matched_pair(&hub).await;

        hub.handle(x, ClientMessage::LeaveRoom { room_id: room_id.clone() }).await;
        assert_eq!(drain(&mut rx_y), vec![ServerMessage::PeerDisconnected]);
        assert_eq!(hub.participants.room_of(x).await, None);

        hub.disconnect(y).await;
        assert_eq!(hub.rooms.room_count().await, 0);
        assert_eq!(hub.participants.count().await, 1);
    }

    #[tokio::test]
    async fn test_partner_gone_before_pairing_requeues() {
        let hub = hub();
        let (x, _rx_x) = connect(&hub, "1.2.3.4").await;
        let (y, mut rx_y) = connect(&hub, "5.6.7.8").await;
        hub.handle(x, ClientMessage::JoinQueue { preferences: Preferences::video() }).await;

        // X's socket is gone but its disconnect has not reached the queue yet.
        hub.participants.unregister(x).await;
        drain(&mut rx_y);
        hub.handle(y, ClientMessage::JoinQueue { preferences: Preferences::video() }).await;

        assert_eq!(drain(&mut rx_y), vec![ServerMessage::Queued]);
        assert_eq!(hub.participants.room_of(y).await, None);
        assert_eq!(hub.rooms.room_count().await, 0);
        assert_eq!(hub.queue.len().await, Ok(1));

        let (z, mut rx_z) = connect(&hub, "9.9.9.9").await;
        hub.handle(z, ClientMessage::JoinQueue { preferences: Preferences::video() }).await;
        let room_id = hub.participants.room_of(z).await.unwrap();
        assert_eq!(hub.participants.room_of(y).await, Some(room_id.clone()));
        assert!(drain(&mut rx_z).contains(&ServerMessage::IsInitiator { is_initiator: false }));
        assert!(drain(&mut rx_y).contains(&ServerMessage::MatchFound { room_id }));
    }

    #[tokio::test]
    async fn test_disconnect_leaves_queue() {
        let hub = hub();
        let (x, _rx_x) = connect(&hub, "1.2.3.4").await;
        hub.handle(x, ClientMessage::JoinQueue { preferences: Preferences::text() }).await;
        hub.disconnect(x).await;

        assert_eq!(hub.queue.len().await, Ok(0));
    }

    #[tokio::test]
    async fn test_panic_reports_and_leaves() {
        let hub = hub();
        let (x, mut rx_x, _y, mut rx_y, room_id) = matched_pair(&hub).await;

        hub.handle(x, ClientMessage::Panic { room_id: room_id.clone() }).await;

        assert_eq!(drain(&mut rx_y), vec![ServerMessage::PeerDisconnected]);
        assert!(drain(&mut rx_x).is_empty());
        assert_eq!(hub.rooms.members(&room_id).await.map(|m| m.len()), Some(1));
    }

    #[tokio::test]
    async fn test_fifth_report_bans_and_disconnects() {
        let hub = hub();
        let (offender, mut rx_offender) = connect(&hub, "1.2.3.4").await;

        for n in 1..=5 {
            let (reporter, mut rx_reporter) = connect(&hub, "9.9.9.9").await;
            let room_id = RoomId::new_pair();
            hub.rooms.join(&room_id, offender).await.unwrap();
            hub.rooms.join(&room_id, reporter).await.unwrap();

            let verdict = hub
                .report(reporter, &room_id, "abuse".into(), None)
                .await
                .unwrap();
            assert_eq!(verdict.trust_score, 100 - 10 * n);
            assert_eq!(verdict.new_ban.is_some(), n == 5);
            assert!(drain(&mut rx_reporter).is_empty());

            hub.rooms.leave(&room_id, offender).await;
            hub.disconnect(reporter).await;
        }

        assert!(matches!(
            drain(&mut rx_offender).last(),
            Some(ServerMessage::Banned { .. })
        ));

        // The banned address cannot come back.
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(hub.connect(Some("1.2.3.4".parse().unwrap()), tx).await.is_err());
    }

    #[tokio::test]
    async fn test_report_outside_room_rejected() {
        let hub = hub();
        let (x, mut rx_x) = connect(&hub, "1.2.3.4").await;
        assert!(hub
            .report(x, &RoomId::new_pair(), "abuse".into(), None)
            .await
            .is_none());
        assert!(matches!(drain(&mut rx_x).as_slice(), [ServerMessage::Error { .. }]));
    }

    #[tokio::test]
    async fn test_group_queue_joins_mesh_room() {
        let hub = hub();
        let group = Preferences {
            group_size: GroupSize::Group,
            ..Preferences::video()
        };
        let (a, mut rx_a) = connect(&hub, "10.0.0.1").await;
        let (b, mut rx_b) = connect(&hub, "10.0.0.2").await;

        hub.handle(a, ClientMessage::JoinQueue { preferences: group.clone() }).await;
        hub.handle(b, ClientMessage::JoinQueue { preferences: group }).await;

        let room_id = hub.participants.room_of(a).await.unwrap();
        assert!(room_id.is_group());
        assert_eq!(
            drain(&mut rx_a),
            vec![
                ServerMessage::MatchFound { room_id: room_id.clone() },
                ServerMessage::ExistingPeers { peers: vec![] },
                ServerMessage::PeerJoined { peer_id: b },
            ]
        );
        assert_eq!(
            drain(&mut rx_b),
            vec![
                ServerMessage::MatchFound { room_id: room_id.clone() },
                ServerMessage::ExistingPeers { peers: vec![a] },
            ]
        );

        hub.handle(b, ClientMessage::LeaveRoom { room_id }).await;
        assert_eq!(drain(&mut rx_a), vec![ServerMessage::PeerLeft { peer_id: b }]);
    }

    #[tokio::test]
    async fn test_full_room_returns_error() {
        let hub = hub();
        let (_x, _rx_x, _y, _rx_y, room_id) = matched_pair(&hub).await;
        let (z, mut rx_z) = connect(&hub, "10.1.1.1").await;

        hub.handle(
            z,
            ClientMessage::JoinRoom {
                room_id,
                display_name: None,
            },
        )
        .await;
        assert!(matches!(drain(&mut rx_z).as_slice(), [ServerMessage::Error { .. }]));
    }

    #[test]
    fn test_display_name_sanitized() {
        assert_eq!(sanitize_display_name("   "), None);
        assert_eq!(sanitize_display_name(&"x".repeat(50)).map(|n| n.len()), Some(32));
    }
}
