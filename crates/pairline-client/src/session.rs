//! Session-scoped connection context.
//!
//! [`Session`] is the only owner of connection state on the client: the
//! signaling client, one [`OrchestratorHandle`] per peer link and the local
//! media handle. Nothing is global, so leaving a room (or dropping the
//! session) closes every link and releases capture.
//!
//! Like the orchestrator, the core is a plain struct driven by its owner;
//! [`SessionHandle::spawn`] runs it as a task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use pairline_media::{
    acquire_local_media, LocalMedia, MediaConstraints, MediaDevices, MediaError,
    OrchestratorError, OrchestratorEvent, OrchestratorHandle, OrchestratorSettings,
    PeerConnectionFactory, Role,
};
use pairline_net::{RetryPolicy, SignalTransport, SignalingClient};
use pairline_shared::protocol::{ClientMessage, ServerMessage, SignalMessage, SignalPayload};
use pairline_shared::types::{ChatMode, ParticipantId, Preferences, RoomId};

use crate::error::ClientError;
use crate::events::SessionEvent;

const COMMAND_CHANNEL_CAPACITY: usize = 256;
const ACK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Identifies a link within the current room: the remote member in group
/// rooms, `None` for the single link of a 1:1 room.
pub type LinkKey = Option<ParticipantId>;

/// An orchestrator event tagged with the link it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkEvent {
    pub peer: LinkKey,
    serial: u64,
    pub event: OrchestratorEvent,
}

struct Link {
    handle: OrchestratorHandle,
    /// Distinguishes this link from an earlier one under the same key
    serial: u64,
    forward: JoinHandle<()>,
}

pub struct Session<T, F, D>
where
    T: SignalTransport,
    F: PeerConnectionFactory,
    D: MediaDevices,
{
    signaling: SignalingClient<T>,
    factory: Arc<F>,
    devices: Arc<D>,
    settings: OrchestratorSettings,
    retry: RetryPolicy,
    display_name: Option<String>,
    mode: ChatMode,
    room: Option<RoomId>,
    links: HashMap<LinkKey, Link>,
    next_serial: u64,
    media: Option<LocalMedia>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl<T, F, D> Session<T, F, D>
where
    T: SignalTransport,
    F: PeerConnectionFactory,
    D: MediaDevices,
{
    /// Returns the session and the receiver its links report into; feed that
    /// receiver to [`Self::handle_link_event`].
    pub fn new(
        signaling: SignalingClient<T>,
        factory: Arc<F>,
        devices: Arc<D>,
        settings: OrchestratorSettings,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (link_tx, link_rx) = mpsc::unbounded_channel();

        (
            Self {
                signaling,
                factory,
                devices,
                settings,
                retry: RetryPolicy::default(),
                display_name: None,
                mode: ChatMode::Video,
                room: None,
                links: HashMap::new(),
                next_serial: 0,
                media: None,
                link_tx,
                events,
            },
            link_rx,
        )
    }

    pub fn room(&self) -> Option<&RoomId> {
        self.room.as_ref()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn local_id(&self) -> Option<ParticipantId> {
        self.signaling.local_id()
    }

    pub fn set_display_name(&mut self, name: Option<String>) {
        self.display_name = name;
    }

    // -----------------------------------------------------------------------
    // User actions
    // -----------------------------------------------------------------------

    /// Ask for a new partner, leaving the current room first.
    pub async fn join_queue(&mut self, preferences: Preferences) {
        self.leave().await;
        self.mode = preferences.mode;
        self.signaling.send(ClientMessage::JoinQueue { preferences });
    }

    pub fn leave_queue(&mut self) {
        self.signaling.send(ClientMessage::LeaveQueue);
    }

    /// Enter a room by id, typically a shared group room.
    pub async fn join_room(&mut self, room_id: RoomId) {
        if self.room.as_ref() != Some(&room_id) {
            self.leave().await;
        }
        self.room = Some(room_id.clone());
        self.signaling.send(ClientMessage::JoinRoom {
            room_id,
            display_name: self.display_name.clone(),
        });
    }

    /// Explicit leave. Safe to call outside a room.
    pub async fn leave(&mut self) {
        let Some(room_id) = self.room.clone() else {
            return;
        };
        self.teardown().await;
        info!(room = %room_id, "Left room");
        self.signaling.send(ClientMessage::LeaveRoom { room_id });
    }

    /// End the session at once and let the server file a report.
    pub async fn panic(&mut self) -> Result<(), ClientError> {
        let room_id = self.room.clone().ok_or(ClientError::NotInRoom)?;
        self.teardown().await;
        warn!(room = %room_id, "Panic: leaving room");
        self.signaling.send(ClientMessage::Panic { room_id });
        Ok(())
    }

    pub fn report(&mut self, reason: String, details: Option<String>) -> Result<(), ClientError> {
        let room_id = self.room.clone().ok_or(ClientError::NotInRoom)?;
        self.signaling.send(ClientMessage::Report {
            room_id,
            reason,
            details,
        });
        Ok(())
    }

    /// Tell the other member(s) our camera went off or on.
    pub fn toggle_video(&mut self, is_video_off: bool) -> Result<(), ClientError> {
        self.send_to_room(SignalPayload::ToggleVideo { is_video_off })
    }

    pub fn send_chat(&mut self, text: String) -> Result<(), ClientError> {
        self.send_to_room(SignalPayload::Chat { text })
    }

    /// Swap the outgoing video on every live link.
    pub async fn switch_video_source(&mut self, media: LocalMedia) {
        for (key, link) in &self.links {
            if let Err(e) = link.handle.switch_video_source(media.clone()).await {
                debug!(peer = ?key, error = %e, "Video switch skipped");
            }
        }
        if let Some(old) = self.media.replace(media) {
            self.devices.release(&old);
        }
    }

    /// The socket (re)connected: write out anything queued meanwhile.
    pub fn transport_connected(&mut self) {
        self.signaling.flush();
    }

    /// Resend unacknowledged signals; report the ones given up on.
    pub fn poll_acks(&mut self) {
        for lost in self.signaling.poll_timeouts(self.retry) {
            self.emit(SessionEvent::SignalLost {
                kind: lost.payload.kind().to_string(),
            });
        }
    }

    // -----------------------------------------------------------------------
    // Server messages
    // -----------------------------------------------------------------------

    /// Decode and handle one text frame from the socket.
    pub async fn handle_server_text(&mut self, text: &str) {
        match self.signaling.receive_text(text) {
            Ok(Some(message)) => self.dispatch(message).await,
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Undecodable server frame"),
        }
    }

    pub async fn handle_server_message(&mut self, message: ServerMessage) {
        if let Some(message) = self.signaling.receive(message) {
            self.dispatch(message).await;
        }
    }

    async fn dispatch(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Welcome { participant_id } => {
                info!(id = %participant_id, "Connected to signaling server");
                self.emit(SessionEvent::Connected { participant_id });
            }

            ServerMessage::Queued => self.emit(SessionEvent::Queued),

            ServerMessage::MatchFound { room_id } => {
                info!(room = %room_id, "Match found");
                self.room = Some(room_id.clone());
                self.emit(SessionEvent::MatchFound { room_id });

                // Capture starts now so the offer is not held up later.
                if self.mode == ChatMode::Video {
                    if let Err(e) = self.ensure_media().await {
                        self.media_failed(e).await;
                    }
                }
            }

            ServerMessage::IsInitiator { is_initiator } => {
                self.emit(SessionEvent::RoleAssigned { is_initiator });
                let role = if is_initiator {
                    Role::Initiator
                } else {
                    Role::Receiver
                };
                self.open_link(None, role).await;
            }

            ServerMessage::ExistingPeers { peers } => {
                // Newest joiner offers to everyone already present.
                for peer_id in peers {
                    self.emit(SessionEvent::PeerJoined { peer_id });
                    self.open_link(Some(peer_id), Role::Initiator).await;
                }
            }

            ServerMessage::PeerJoined { peer_id } => {
                self.emit(SessionEvent::PeerJoined { peer_id });
                self.open_link(Some(peer_id), Role::Receiver).await;
            }

            ServerMessage::PeerLeft { peer_id } => {
                self.close_link(Some(peer_id)).await;
                self.emit(SessionEvent::PeerLeft { peer_id });
            }

            ServerMessage::PeerDisconnected => {
                info!("Partner left");
                self.teardown().await;
                self.emit(SessionEvent::PartnerLeft);
            }

            ServerMessage::Signal(signal) => self.handle_signal(signal).await,

            ServerMessage::ActiveUsers { count } => {
                self.emit(SessionEvent::ActiveUsers { count });
            }

            ServerMessage::Banned { reason } => {
                warn!(reason = %reason, "Banned by server");
                self.teardown().await;
                self.emit(SessionEvent::Banned { reason });
            }

            ServerMessage::Error { message } => {
                debug!(message = %message, "Server error");
                self.emit(SessionEvent::Error { message });
            }
        }
    }

    async fn handle_signal(&mut self, signal: SignalMessage) {
        let Some(room_id) = &self.room else {
            debug!(kind = signal.payload.kind(), "Signal outside a room");
            return;
        };
        if *room_id != signal.room_id {
            debug!(room = %signal.room_id, "Signal for another room");
            return;
        }
        let key = if room_id.is_group() { signal.sender } else { None };

        match signal.payload {
            SignalPayload::Chat { text } => self.emit(SessionEvent::Chat {
                from: signal.sender,
                text,
            }),
            SignalPayload::ToggleVideo { is_video_off } => {
                self.emit(SessionEvent::RemoteVideoToggled {
                    from: signal.sender,
                    is_video_off,
                })
            }
            SignalPayload::Ack { .. } => {}
            payload => {
                if !self.links.contains_key(&key) && matches!(payload, SignalPayload::Offer { .. })
                {
                    // Offer raced ahead of our role assignment.
                    self.open_link(key, Role::Receiver).await;
                }
                match self.links.get(&key) {
                    Some(link) => {
                        if let Err(e) = link.handle.remote_signal(payload).await {
                            debug!(peer = ?key, error = %e, "Link no longer running");
                        }
                    }
                    None => trace!(peer = ?key, kind = payload.kind(), "No link for signal"),
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Links
    // -----------------------------------------------------------------------

    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        let LinkEvent {
            peer,
            serial,
            event,
        } = event;
        if self.links.get(&peer).map(|l| l.serial) != Some(serial) {
            trace!(peer = ?peer, "Dropping event from a closed link");
            return;
        }

        match event {
            OrchestratorEvent::OutgoingSignal(payload) => {
                if let Some(room_id) = self.room.clone() {
                    self.signaling.send_signal(room_id, peer, payload);
                }
            }
            OrchestratorEvent::StateChanged(state) => {
                self.emit(SessionEvent::LinkState { peer, state });
            }
            OrchestratorEvent::RemoteTrack(track) => {
                self.emit(SessionEvent::RemoteTrack { peer, track });
            }
            OrchestratorEvent::Stats(stats) => {
                self.emit(SessionEvent::Stats { peer, stats });
            }
            OrchestratorEvent::Error(error) => {
                warn!(peer = ?peer, error = %error, "Link failed");
                if let Some(link) = self.links.remove(&peer) {
                    link.forward.abort();
                }
                self.emit(SessionEvent::LinkFailed {
                    peer,
                    error: error.to_string(),
                });
            }
        }
    }

    /// Text rooms carry no peer connection.
    async fn open_link(&mut self, key: LinkKey, role: Role) {
        if self.mode == ChatMode::Text || self.room.is_none() {
            return;
        }

        if let Err(e) = self.try_open_link(key, role).await {
            match e {
                OrchestratorError::Media(e) => self.media_failed(e).await,
                e => {
                    warn!(peer = ?key, error = %e, "Could not open link");
                    self.emit(SessionEvent::LinkFailed {
                        peer: key,
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    async fn try_open_link(&mut self, key: LinkKey, role: Role) -> Result<(), OrchestratorError> {
        // The initiator must not offer before local media is ready.
        let media = self.ensure_media().await?;
        self.close_link(key).await;

        let (handle, mut rx) =
            OrchestratorHandle::spawn(self.factory.clone(), role, self.settings.clone());
        handle.set_local_media(media).await?;

        self.next_serial += 1;
        let serial = self.next_serial;
        let tx = self.link_tx.clone();
        let forward = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let tagged = LinkEvent {
                    peer: key,
                    serial,
                    event,
                };
                if tx.send(tagged).is_err() {
                    break;
                }
            }
        });

        if role == Role::Initiator {
            handle.start().await?;
        }

        debug!(peer = ?key, role = ?role, "Link opened");
        self.links.insert(
            key,
            Link {
                handle,
                serial,
                forward,
            },
        );
        Ok(())
    }

    async fn close_link(&mut self, key: LinkKey) {
        if let Some(link) = self.links.remove(&key) {
            link.handle.close().await;
            link.forward.abort();
            debug!(peer = ?key, "Link closed");
        }
    }

    async fn ensure_media(&mut self) -> Result<LocalMedia, MediaError> {
        if let Some(media) = &self.media {
            return Ok(media.clone());
        }
        let media = acquire_local_media(
            self.devices.as_ref(),
            MediaConstraints::AUDIO_VIDEO,
            self.settings.stream_wait_timeout,
        )
        .await?;
        self.media = Some(media.clone());
        Ok(media)
    }

    async fn media_failed(&mut self, error: MediaError) {
        self.emit(SessionEvent::MediaFailed {
            error: error.to_string(),
        });
        self.leave().await;
    }

    /// Close every link, release capture and forget the room.
    async fn teardown(&mut self) {
        let keys: Vec<LinkKey> = self.links.keys().copied().collect();
        for key in keys {
            self.close_link(key).await;
        }
        if let Some(media) = self.media.take() {
            self.devices.release(&media);
        }
        if let Some(room_id) = self.room.take() {
            self.signaling.forget_room(&room_id);
        }
    }

    fn send_to_room(&mut self, payload: SignalPayload) -> Result<(), ClientError> {
        let room_id = self.room.clone().ok_or(ClientError::NotInRoom)?;
        self.signaling.send_signal(room_id, None, payload);
        Ok(())
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

impl<T, F, D> Drop for Session<T, F, D>
where
    T: SignalTransport,
    F: PeerConnectionFactory,
    D: MediaDevices,
{
    fn drop(&mut self) {
        // Link handles abort their own tasks when dropped.
        for link in self.links.values() {
            link.forward.abort();
        }
        if let Some(media) = self.media.take() {
            self.devices.release(&media);
        }
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// Commands sent *into* the session task.
#[derive(Debug)]
pub enum SessionCommand {
    JoinQueue(Preferences),
    LeaveQueue,
    JoinRoom(RoomId),
    Leave,
    Panic,
    Report {
        reason: String,
        details: Option<String>,
    },
    ToggleVideo(bool),
    Chat(String),
    SwitchVideoSource(LocalMedia),
    TransportConnected,
    Shutdown,
}

pub struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionCommand>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Run `session` in its own task. `inbound` carries decoded server
    /// messages from whatever owns the socket.
    pub fn spawn<T, F, D>(
        session: Session<T, F, D>,
        link_rx: mpsc::UnboundedReceiver<LinkEvent>,
        inbound: mpsc::UnboundedReceiver<ServerMessage>,
    ) -> Self
    where
        T: SignalTransport + 'static,
        F: PeerConnectionFactory,
        D: MediaDevices,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let task = tokio::spawn(run(session, cmd_rx, link_rx, inbound));

        Self {
            cmd_tx,
            task: Some(task),
        }
    }

    pub async fn send(&self, command: SessionCommand) -> Result<(), ClientError> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Leave the room, release everything and wait for the task to end.
    pub async fn shutdown(mut self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown).await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run<T, F, D>(
    mut session: Session<T, F, D>,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    mut link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    mut inbound: mpsc::UnboundedReceiver<ServerMessage>,
) where
    T: SignalTransport,
    F: PeerConnectionFactory,
    D: MediaDevices,
{
    let mut acks = tokio::time::interval(ACK_POLL_INTERVAL);

    loop {
        tokio::select! {
            // --- Commands ---
            cmd = cmd_rx.recv() => {
                let result = match cmd {
                    Some(SessionCommand::JoinQueue(preferences)) => {
                        session.join_queue(preferences).await;
                        Ok(())
                    }
                    Some(SessionCommand::LeaveQueue) => {
                        session.leave_queue();
                        Ok(())
                    }
                    Some(SessionCommand::JoinRoom(room_id)) => {
                        session.join_room(room_id).await;
                        Ok(())
                    }
                    Some(SessionCommand::Leave) => {
                        session.leave().await;
                        Ok(())
                    }
                    Some(SessionCommand::Panic) => session.panic().await,
                    Some(SessionCommand::Report { reason, details }) => {
                        session.report(reason, details)
                    }
                    Some(SessionCommand::ToggleVideo(off)) => session.toggle_video(off),
                    Some(SessionCommand::Chat(text)) => session.send_chat(text),
                    Some(SessionCommand::SwitchVideoSource(media)) => {
                        session.switch_video_source(media).await;
                        Ok(())
                    }
                    Some(SessionCommand::TransportConnected) => {
                        session.transport_connected();
                        Ok(())
                    }
                    Some(SessionCommand::Shutdown) | None => {
                        session.leave().await;
                        break;
                    }
                };
                if let Err(e) = result {
                    debug!(error = %e, "Command rejected");
                    session.emit(SessionEvent::Error { message: e.to_string() });
                }
            }

            // --- Socket ---
            Some(message) = inbound.recv() => {
                session.handle_server_message(message).await;
            }

            // --- Links ---
            Some(event) = link_rx.recv() => {
                session.handle_link_event(event).await;
            }

            // --- Timers ---
            _ = acks.tick() => session.poll_acks(),
        }
    }

    info!("Session task finished");
}
