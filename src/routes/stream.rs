use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::any;
use axum::Router;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::auth::{resolve_access_token, AuthenticatedUser, Role};
use crate::services::hub::{BusEvent, ClientFrame, ServerFrame};
use crate::state::AppState;
use crate::time::to_iso;

/// Policy close-code for sessions that fail the token handshake.
const CLOSE_CODE_AUTH_FAILED: u16 = 4401;
/// Normal "going away" close used while draining.
const CLOSE_CODE_GOING_AWAY: u16 = 1001;

#[derive(Debug, Clone, serde::Deserialize)]
pub(crate) struct StreamQuery {
    token: Option<String>,
}

pub(crate) async fn stream_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<StreamQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let user = query
        .token
        .as_deref()
        .and_then(|token| resolve_access_token(&state.tokens, token).ok());
    ws.on_upgrade(move |socket| handle_session(socket, state, user))
}

async fn handle_session(socket: WebSocket, state: AppState, user: Option<AuthenticatedUser>) {
    let (mut sender, receiver) = socket.split();

    let Some(user) = user else {
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_CODE_AUTH_FAILED,
                reason: "authentication failed".into(),
            })))
            .await;
        return;
    };

    tracing::info!(username = %user.username, "subscriber session opened");
    let connected = ServerFrame::Connected {
        message: "connected".to_string(),
        timestamp: to_iso(Utc::now()),
    };
    if send_frame(&mut sender, &connected).await.is_err() {
        return;
    }

    let session = Session {
        user,
        batteries: HashSet::new(),
        locations: HashSet::new(),
    };
    run_session(sender, receiver, state, session).await;
}

struct Session {
    user: AuthenticatedUser,
    batteries: HashSet<String>,
    locations: HashSet<String>,
}

impl Session {
    fn wants(&self, event: &BusEvent) -> bool {
        self.batteries.contains(&event.battery_id) || self.locations.contains(&event.location_id)
    }

    fn may_subscribe(&self) -> bool {
        matches!(self.user.role, Role::Admin | Role::Engineer)
    }

    /// Handles one control frame; returns the reply, if any.
    fn handle(&mut self, frame: ClientFrame) -> Option<ServerFrame> {
        let now = to_iso(Utc::now());
        match frame {
            ClientFrame::Ping {} => Some(ServerFrame::Pong { timestamp: now }),
            ClientFrame::SubscribeBattery { battery_id } => {
                if !self.may_subscribe() {
                    return Some(ServerFrame::Error {
                        detail: "Engineer access required".to_string(),
                    });
                }
                let battery_id = battery_id.trim().to_string();
                if battery_id.is_empty() {
                    return Some(ServerFrame::Error {
                        detail: "battery_id is required".to_string(),
                    });
                }
                self.batteries.insert(battery_id.clone());
                Some(ServerFrame::Subscribed {
                    scope: "battery".to_string(),
                    id: battery_id,
                    timestamp: now,
                })
            }
            ClientFrame::UnsubscribeBattery { battery_id } => {
                let battery_id = battery_id.trim().to_string();
                self.batteries.remove(&battery_id);
                Some(ServerFrame::Unsubscribed {
                    scope: "battery".to_string(),
                    id: battery_id,
                    timestamp: now,
                })
            }
            ClientFrame::SubscribeLocation { location_id } => {
                if !self.may_subscribe() {
                    return Some(ServerFrame::Error {
                        detail: "Engineer access required".to_string(),
                    });
                }
                let location_id = location_id.trim().to_string();
                if location_id.is_empty() {
                    return Some(ServerFrame::Error {
                        detail: "location_id is required".to_string(),
                    });
                }
                self.locations.insert(location_id.clone());
                Some(ServerFrame::Subscribed {
                    scope: "location".to_string(),
                    id: location_id,
                    timestamp: now,
                })
            }
            ClientFrame::UnsubscribeLocation { location_id } => {
                let location_id = location_id.trim().to_string();
                self.locations.remove(&location_id);
                Some(ServerFrame::Unsubscribed {
                    scope: "location".to_string(),
                    id: location_id,
                    timestamp: now,
                })
            }
        }
    }
}

async fn run_session(
    mut sender: futures::stream::SplitSink<WebSocket, Message>,
    mut receiver: futures::stream::SplitStream<WebSocket>,
    state: AppState,
    mut session: Session,
) {
    let mut bus = state.hub.subscribe();
    let idle_timeout = Duration::from_secs(state.config.subscriber_idle_timeout_seconds);
    let cancel = state.shutdown.clone();
    let mut deadline = tokio::time::Instant::now() + idle_timeout;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sender
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_CODE_GOING_AWAY,
                        reason: "server draining".into(),
                    })))
                    .await;
                break;
            }

            _ = tokio::time::sleep_until(deadline) => {
                tracing::debug!(username = %session.user.username, "closing idle subscriber");
                let _ = sender.send(Message::Close(None)).await;
                break;
            }

            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        deadline = tokio::time::Instant::now() + idle_timeout;
                        let reply = match serde_json::from_str::<ClientFrame>(text.as_str()) {
                            Ok(frame) => session.handle(frame),
                            Err(err) => Some(ServerFrame::Error {
                                detail: format!("Unrecognized frame: {err}"),
                            }),
                        };
                        if let Some(frame) = reply {
                            if send_frame(&mut sender, &frame).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        deadline = tokio::time::Instant::now() + idle_timeout;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Binary(_))) => {
                        deadline = tokio::time::Instant::now() + idle_timeout;
                    }
                    Some(Err(err)) => {
                        tracing::debug!(error = %err, "subscriber socket error");
                        break;
                    }
                }
            }

            event = bus.recv() => {
                match event {
                    Ok(event) => {
                        if session.wants(&event) {
                            if send_frame(&mut sender, event.frame.as_ref()).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(dropped)) => {
                        // Oldest events were dropped for this subscriber; the
                        // connection stays up.
                        let lag = ServerFrame::Lag {
                            dropped,
                            timestamp: to_iso(Utc::now()),
                        };
                        if send_frame(&mut sender, &lag).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    tracing::info!(username = %session.user.username, "subscriber session closed");
}

async fn send_frame(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_else(|_| {
        r#"{"event":"error","detail":"frame serialization failed"}"#.to_string()
    });
    sender.send(Message::Text(text.into())).await
}

pub fn router() -> Router<AppState> {
    Router::new().route("/stream", any(stream_handler))
}
