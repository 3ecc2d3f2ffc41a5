use crate::app::{ApiError, AppState};
use crate::hub::CloseReason;
use crate::mailbox::MailboxError;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use paircast_proto::{MailboxMessage, WS_CLOSE_NORMAL, WS_CLOSE_RATE_LIMITED};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

const PING_INTERVAL: Duration = Duration::from_secs(20);
const MAX_MISSED_PONGS: u32 = 2;

/// `GET /ws/{mailbox_id}`. The mailbox id is the capability: anyone who
/// holds it may subscribe, nobody can guess it.
pub async fn upgrade(
    State(state): State<Arc<AppState>>,
    Path(mailbox_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.mailboxes.verify(&mailbox_id).await {
        Ok(_) => ws.on_upgrade(move |socket| serve_socket(socket, state, mailbox_id)),
        Err(MailboxError::Gone) => ApiError::NotFound.into_response(),
        Err(other) => ApiError::from(other).into_response(),
    }
}

async fn serve_socket(socket: WebSocket, state: Arc<AppState>, mailbox_id: String) {
    let (mut sink, mut stream) = socket.split();

    let mut subscription = match state.hub.subscribe(&mailbox_id).await {
        Ok(subscription) => subscription,
        Err(_) => {
            let _ = close_with(&mut sink, WS_CLOSE_RATE_LIMITED, "subscriber_limit").await;
            return;
        }
    };

    // Replay everything already in the store before entering fan-out;
    // registration happened first, so the monotone seq filter below
    // drops whatever arrives on both paths.
    let mut last_sent: Option<u64> = None;
    match state.mailboxes.read_all(&mailbox_id).await {
        Ok(snapshot) => {
            for message in snapshot {
                if !send_message(&mut sink, &message).await {
                    state.hub.unsubscribe(&mailbox_id, subscription.id).await;
                    return;
                }
                last_sent = Some(message.seq);
            }
        }
        Err(_) => {
            let _ = close_with(
                &mut sink,
                CloseReason::MailboxClosed.ws_code(),
                CloseReason::MailboxClosed.label(),
            )
            .await;
            state.hub.unsubscribe(&mailbox_id, subscription.id).await;
            return;
        }
    }

    let mut ping_timer = interval(PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; it only arms the pong counter.
    ping_timer.tick().await;
    let mut missed_pongs: u32 = 0;

    let exit = loop {
        tokio::select! {
            delivery = subscription.messages.recv() => {
                match delivery {
                    Some(message) => {
                        if last_sent.map_or(true, |sent| message.seq > sent) {
                            if !send_message(&mut sink, &message).await {
                                break Exit::Silent;
                            }
                            last_sent = Some(message.seq);
                        }
                    }
                    // The hub dropped us; the reason (if any) is still
                    // waiting on the close channel.
                    None => break Exit::ReasonPending,
                }
            }
            reason = &mut subscription.closed => {
                break match reason {
                    Ok(reason) => Exit::Close(reason.ws_code(), reason.label()),
                    Err(_) => Exit::Close(WS_CLOSE_NORMAL, "closed"),
                };
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Pong(_))) => missed_pongs = 0,
                    Some(Ok(Message::Close(_))) | None => break Exit::Silent,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break Exit::Silent,
                }
            }
            _ = ping_timer.tick() => {
                if missed_pongs >= MAX_MISSED_PONGS {
                    break Exit::Close(WS_CLOSE_NORMAL, "pong_timeout");
                }
                missed_pongs += 1;
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break Exit::Silent;
                }
            }
        }
    };

    let close_frame = match exit {
        Exit::Close(code, label) => Some((code, label)),
        Exit::ReasonPending => match subscription.closed.try_recv() {
            Ok(reason) => Some((reason.ws_code(), reason.label())),
            Err(_) => Some((WS_CLOSE_NORMAL, "closed")),
        },
        Exit::Silent => None,
    };
    if let Some((code, label)) = close_frame {
        debug!(mailbox = %mailbox_id, code, reason = label, "closing subscriber");
        let _ = close_with(&mut sink, code, label).await;
    }

    state.hub.unsubscribe(&mailbox_id, subscription.id).await;
}

enum Exit {
    Close(u16, &'static str),
    /// The fan-out channel ended; consult the close channel for why.
    ReasonPending,
    Silent,
}

async fn send_message(
    sink: &mut SplitSink<WebSocket, Message>,
    message: &MailboxMessage,
) -> bool {
    let frame = match serde_json::to_string(message) {
        Ok(frame) => frame,
        Err(_) => return false,
    };
    sink.send(Message::Text(frame)).await.is_ok()
}

async fn close_with(
    sink: &mut SplitSink<WebSocket, Message>,
    code: u16,
    reason: &'static str,
) -> Result<(), axum::Error> {
    sink.send(Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    })))
    .await
}

