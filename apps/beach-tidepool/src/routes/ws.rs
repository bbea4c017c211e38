use super::ApiError;
use crate::auth::AuthRequest;
use crate::protocol::{parse_inbound, CloseReason, Inbound, ServerFrame};
use crate::state::AppState;
use crate::terminal::session::CONNECTION_QUEUE_DEPTH;
use crate::terminal::SessionEvent;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use std::borrow::Cow;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Query parameters understood by the terminal socket.
#[derive(Debug, Default)]
struct SocketParams {
    session_id: Option<String>,
    terminal_token: Option<String>,
}

impl SocketParams {
    fn from_query(query: &HashMap<String, String>) -> Self {
        let non_empty = |key: &str| query.get(key).filter(|value| !value.is_empty()).cloned();
        Self {
            session_id: non_empty("sessionId"),
            terminal_token: non_empty("token"),
        }
    }
}

/// `GET /api/terminal/ws?sessionId=...`. Authentication happens before the
/// upgrade; every other rejection is a close code on the upgraded socket.
pub async fn terminal_socket(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let authenticated = state.authenticator.authenticate(&AuthRequest {
        headers: &headers,
        query: &query,
    }) || query
        .get("wsToken")
        .is_some_and(|token| state.ws_tokens.validate(token));
    if !authenticated {
        warn!(target = "tidepool::ws", "rejected unauthenticated terminal socket");
        return ApiError::Unauthorized("authentication required").into_response();
    }

    let params = SocketParams::from_query(&query);
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

async fn close_with(mut socket: WebSocket, reason: CloseReason) {
    debug!(target = "tidepool::ws", code = reason.code(), "closing terminal socket");
    let _ = socket.send(close_message(reason)).await;
}

fn close_message(reason: CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: reason.code(),
        reason: Cow::Borrowed(reason.reason()),
    }))
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    sink.send(Message::Text(frame.to_json())).await
}

async fn handle_socket(mut socket: WebSocket, state: AppState, params: SocketParams) {
    if !state.terminal_enabled() {
        return close_with(socket, CloseReason::Disabled).await;
    }
    if !state.terminal_token_ok(params.terminal_token.as_deref()) {
        return close_with(socket, CloseReason::AuthRequired).await;
    }
    let Some(session_id) = params.session_id else {
        return close_with(socket, CloseReason::SessionIdRequired).await;
    };
    let Some(session) = state.registry.get(&session_id) else {
        return close_with(socket, CloseReason::SessionNotFound).await;
    };
    // Scrollback capture and subscription happen atomically; anything the
    // process prints from here on is queued in `events`.
    let Some(attachment) = session.attach(CONNECTION_QUEUE_DEPTH) else {
        return close_with(socket, CloseReason::SessionNotFound).await;
    };
    let subscriber = attachment.subscriber;
    info!(
        target = "tidepool::ws",
        session_id = %session_id,
        subscriber = ?subscriber,
        "terminal viewer connected"
    );

    let mut greeting = vec![ServerFrame::Connected {
        session_id: session_id.clone(),
        shell: session.shell().to_string(),
        cwd: session.cwd().display().to_string(),
    }];
    if !attachment.scrollback.is_empty() {
        greeting.push(ServerFrame::Scrollback {
            data: attachment.scrollback,
        });
    }
    for frame in &greeting {
        if socket.send(Message::Text(frame.to_json())).await.is_err() {
            session.detach(subscriber);
            return;
        }
    }

    let (mut sink, mut stream) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ServerFrame>();
    let mut events = attachment.events;
    let writer_session = session_id.clone();
    let mut writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                reply = reply_rx.recv() => {
                    let Some(frame) = reply else { break };
                    if send_frame(&mut sink, &frame).await.is_err() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Some(SessionEvent::Data(data)) => {
                        if send_frame(&mut sink, &ServerFrame::Data { data }).await.is_err() {
                            break;
                        }
                    }
                    Some(SessionEvent::Exit { exit_code }) => {
                        let _ = send_frame(&mut sink, &ServerFrame::Exit { exit_code }).await;
                        let _ = sink.send(close_message(CloseReason::EndOfSession)).await;
                        break;
                    }
                    None => {
                        warn!(
                            target = "tidepool::ws",
                            session_id = %writer_session,
                            "viewer dropped from output fan-out"
                        );
                        let _ = sink.send(close_message(CloseReason::Lagging)).await;
                        break;
                    }
                },
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut writer => break,
            message = stream.next() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => {
                        debug!(target = "tidepool::ws", session_id = %session_id, error = %err, "terminal socket error");
                        break;
                    }
                    None => break,
                };
                match message {
                    Message::Text(text) => handle_text(&text, &session_id, &state, &reply_tx),
                    Message::Binary(bytes) => match String::from_utf8(bytes) {
                        Ok(text) => handle_text(&text, &session_id, &state, &reply_tx),
                        Err(_) => {
                            let _ = reply_tx.send(ServerFrame::Error {
                                message: "binary frames must contain UTF-8 JSON".into(),
                            });
                        }
                    },
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        }
    }

    session.detach(subscriber);
    writer.abort();
    info!(
        target = "tidepool::ws",
        session_id = %session_id,
        subscriber = ?subscriber,
        "terminal viewer disconnected"
    );
}

fn handle_text(
    text: &str,
    session_id: &str,
    state: &AppState,
    replies: &mpsc::UnboundedSender<ServerFrame>,
) {
    match parse_inbound(text) {
        Ok(Inbound::Input(data)) => {
            let limit = state.config.max_input_bytes;
            if data.len() > limit {
                let _ = replies.send(ServerFrame::Error {
                    message: format!("input exceeds {limit} bytes"),
                });
            } else if !state.registry.write(session_id, data.as_bytes()) {
                debug!(target = "tidepool::ws", session_id, "input dropped; session gone");
            }
        }
        Ok(Inbound::Resize { cols, rows }) => {
            let outcome = state.registry.resize(session_id, cols, rows, true);
            debug!(target = "tidepool::ws", session_id, cols, rows, ?outcome, "resize request");
        }
        Ok(Inbound::Ping) => {
            let _ = replies.send(ServerFrame::Pong);
        }
        Ok(Inbound::Unknown(kind)) => {
            debug!(target = "tidepool::ws", session_id, kind = %kind, "ignoring unknown frame type");
        }
        Err(err) => {
            warn!(target = "tidepool::ws", session_id, error = %err, "malformed terminal frame");
            let _ = replies.send(ServerFrame::Error {
                message: format!("Invalid message format: {err}"),
            });
        }
    }
}
