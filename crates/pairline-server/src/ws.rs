//! `GET /ws`: one reader task and one writer task per connection.

use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::HeaderMap,
    response::Response,
};
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use pairline_shared::protocol::{ClientMessage, ServerMessage};

use crate::api::AppState;
use crate::hub::Hub;
use crate::rate_limit::peer_ip;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    let addr = peer_ip(connect_info.map(|ConnectInfo(a)| a), &headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub, addr))
}

async fn handle_socket(socket: WebSocket, hub: Hub, addr: Option<IpAddr>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // The ban check runs before anything else is read from the socket.
    let id = match hub.connect(addr, tx).await {
        Ok(id) => id,
        Err(ban) => {
            reject_banned(&mut sink, ban.reason, addr).await;
            return;
        }
    };

    // --- Writer ---
    let mut writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, ServerMessage::Banned { .. });

            match message.to_json() {
                Ok(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Failed to encode server message"),
            }

            if closing {
                if let Err(e) = sink.close().await {
                    debug!(error = %e, "Close after ban failed");
                }
                break;
            }
        }
    });

    // --- Reader ---
    let reader_hub = hub.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!(peer = %id, error = %e, "WebSocket read failed");
                    break;
                }
            };

            match ClientMessage::from_json(&text) {
                Ok(message) => reader_hub.handle(id, message).await,
                Err(e) => {
                    debug!(peer = %id, error = %e, "Malformed client message");
                    reader_hub
                        .participants
                        .send(
                            id,
                            ServerMessage::Error {
                                message: "Malformed message".into(),
                            },
                        )
                        .await;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    hub.disconnect(id).await;
}

/// Send `banned` and close. Returns whether the notice went out.
async fn reject_banned<S>(sink: &mut S, reason: String, addr: Option<IpAddr>) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let delivered = match (ServerMessage::Banned { reason }).to_json() {
        Ok(text) => match sink.send(Message::Text(text)).await {
            Ok(()) => true,
            Err(e) => {
                debug!(addr = ?addr, error = %e, "Could not deliver ban notice");
                false
            }
        },
        Err(e) => {
            warn!(error = %e, "Failed to encode ban notice");
            false
        }
    };

    if let Err(e) = sink.close().await {
        debug!(addr = ?addr, error = %e, "Close after ban failed");
    }
    delivered
}

#[cfg(test)]
mod tests {
    use futures::channel::mpsc as fmpsc;

    use super::*;

    #[tokio::test]
    async fn test_ban_notice_sent_then_closed() {
        let (mut tx, mut rx) = fmpsc::unbounded::<Message>();
        let addr = Some("203.0.113.9".parse().unwrap());

        assert!(reject_banned(&mut tx, "Too many reports".into(), addr).await);

        match rx.next().await {
            Some(Message::Text(text)) => {
                assert!(matches!(
                    ServerMessage::from_json(&text).unwrap(),
                    ServerMessage::Banned { reason } if reason == "Too many reports"
                ));
            }
            other => panic!("expected a text frame, got {other:?}"),
        }
        // Closed after the notice.
        assert!(rx.next().await.is_none());
    }

    #[tokio::test]
    async fn test_ban_notice_to_departed_client_is_tolerated() {
        let (mut tx, rx) = fmpsc::unbounded::<Message>();
        drop(rx);

        assert!(!reject_banned(&mut tx, "Too many reports".into(), None).await);
    }
}
