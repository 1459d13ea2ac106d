//! Runs an [`Orchestrator`] in its own task.
//!
//! Commands go in over a bounded mpsc channel, [`OrchestratorEvent`]s come
//! out over an unbounded one. Dropping the handle aborts the task; use
//! [`OrchestratorHandle::close`] for an orderly teardown.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use pairline_shared::protocol::SignalPayload;

use crate::config::OrchestratorSettings;
use crate::error::OrchestratorError;
use crate::media::LocalMedia;
use crate::orchestrator::{Orchestrator, OrchestratorEvent, Role};
use crate::peer::PeerConnectionFactory;

const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Commands sent *into* the orchestrator task.
#[derive(Debug)]
pub enum OrchestratorCommand {
    /// Send the opening offer.
    Start,
    /// Negotiation payload relayed from the remote peer.
    RemoteSignal(SignalPayload),
    SetLocalMedia(LocalMedia),
    SwitchVideoSource(LocalMedia),
    /// Explicit leave.
    Close,
}

pub struct OrchestratorHandle {
    cmd_tx: mpsc::Sender<OrchestratorCommand>,
    task: Option<JoinHandle<()>>,
}

impl OrchestratorHandle {
    pub fn spawn<F: PeerConnectionFactory>(
        factory: F,
        role: Role,
        settings: OrchestratorSettings,
    ) -> (Self, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (orchestrator, peer_rx) = Orchestrator::new(factory, role, settings, event_tx);

        let task = tokio::spawn(run(orchestrator, cmd_rx, peer_rx));

        (
            Self {
                cmd_tx,
                task: Some(task),
            },
            event_rx,
        )
    }

    pub async fn start(&self) -> Result<(), OrchestratorError> {
        self.send(OrchestratorCommand::Start).await
    }

    pub async fn remote_signal(&self, payload: SignalPayload) -> Result<(), OrchestratorError> {
        self.send(OrchestratorCommand::RemoteSignal(payload)).await
    }

    pub async fn set_local_media(&self, media: LocalMedia) -> Result<(), OrchestratorError> {
        self.send(OrchestratorCommand::SetLocalMedia(media)).await
    }

    pub async fn switch_video_source(&self, media: LocalMedia) -> Result<(), OrchestratorError> {
        self.send(OrchestratorCommand::SwitchVideoSource(media)).await
    }

    /// Close the link and wait for the task to release its connection.
    pub async fn close(mut self) {
        let _ = self.cmd_tx.send(OrchestratorCommand::Close).await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// `false` once the task has stopped (closed or failed).
    pub fn is_running(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    async fn send(&self, command: OrchestratorCommand) -> Result<(), OrchestratorError> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| OrchestratorError::Closed)
    }
}

impl Drop for OrchestratorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run<F: PeerConnectionFactory>(
    mut orchestrator: Orchestrator<F>,
    mut cmd_rx: mpsc::Receiver<OrchestratorCommand>,
    mut peer_rx: mpsc::UnboundedReceiver<crate::peer::PeerEvent>,
) {
    loop {
        let wakeup = orchestrator.next_wakeup();

        tokio::select! {
            // --- Commands ---
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(OrchestratorCommand::Start) => {
                        if let Err(e) = orchestrator.create_offer().await {
                            debug!(error = %e, "Offer rejected");
                        }
                    }
                    Some(OrchestratorCommand::RemoteSignal(payload)) => {
                        if let Err(e) = orchestrator.handle_remote_signal(payload).await {
                            debug!(error = %e, "Remote signal rejected");
                        }
                    }
                    Some(OrchestratorCommand::SetLocalMedia(media)) => {
                        if let Err(e) = orchestrator.set_local_media(media).await {
                            debug!(error = %e, "Local media rejected");
                        }
                    }
                    Some(OrchestratorCommand::SwitchVideoSource(media)) => {
                        if let Err(e) = orchestrator.switch_video_source(media).await {
                            debug!(error = %e, "Video source switch failed");
                        }
                    }
                    Some(OrchestratorCommand::Close) | None => {
                        orchestrator.close().await;
                        break;
                    }
                }
            }

            // --- Backend events ---
            Some(event) = peer_rx.recv() => {
                orchestrator.handle_peer_event(event).await;
            }

            // --- Timers ---
            _ = sleep_until(wakeup) => {
                orchestrator.handle_wakeup(Instant::now()).await;
            }
        }

        if orchestrator.is_finished() {
            break;
        }
    }

    info!(state = ?orchestrator.state(), "Orchestrator task finished");
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
