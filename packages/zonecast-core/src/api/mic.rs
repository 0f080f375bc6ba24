//! Live audio ingress (`/ws/mic`).
//!
//! Binary frames carry raw little-endian s16 PCM and go straight to the
//! encoder's stdin. While the encoder input is full the handler stops reading
//! the socket, which backs the sender off through TCP flow control. Closing
//! the socket ends the mic session.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::sink::SinkExt;
use futures::stream::{SplitSink, StreamExt};
use serde::{Deserialize, Serialize};

use crate::api::ws_connection::ConnectionKind;
use crate::api::AppState;
use crate::error::ZonecastError;
use crate::playback::{FeedOutcome, LiveInput};

/// Query parameters of the ingress socket.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicParams {
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum MicOutgoing {
    #[serde(rename_all = "camelCase")]
    Started { session_id: String, sample_rate: u32, channels: u16 },
    Error { code: &'static str, message: String },
}

impl MicOutgoing {
    fn to_message(&self) -> Option<Message> {
        serde_json::to_string(self).ok().map(|s| Message::Text(s.into()))
    }
}

/// `GET /ws/mic?sampleRate=48000&channels=2`
pub async fn mic_ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<MicParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_mic_ws(socket, params, state))
}

async fn send_error(sender: &mut SplitSink<WebSocket, Message>, error: &ZonecastError) {
    let msg = MicOutgoing::Error {
        code: error.code(),
        message: error.to_string(),
    };
    if let Some(msg) = msg.to_message() {
        let _ = sender.send(msg).await;
    }
}

async fn handle_mic_ws(socket: WebSocket, params: MicParams, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let conn_guard = state.ws_manager.register(ConnectionKind::Mic);
    let cancel_token = conn_guard.cancel_token().clone();

    let sample_rate = params.sample_rate.unwrap_or(state.config.encoder.sample_rate);
    let channels = params.channels.unwrap_or(state.config.encoder.channels);
    log::info!(
        "[Mic] {} requesting live session ({}Hz, {}ch)",
        conn_guard.id(),
        sample_rate,
        channels
    );

    let started = match state.arbiter.start_mic(sample_rate, channels).await {
        Ok(started) => started,
        Err(e) => {
            log::warn!("[Mic] {} start refused: {}", conn_guard.id(), e);
            send_error(&mut sender, &e).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    let Some(input) = started.input else {
        let e = ZonecastError::Internal("live session has no encoder input".into());
        send_error(&mut sender, &e).await;
        let _ = state.arbiter.stop_session(&started.session_id).await;
        return;
    };

    let ack = MicOutgoing::Started {
        session_id: started.session_id.clone(),
        sample_rate,
        channels,
    };
    if let Some(msg) = ack.to_message() {
        let _ = sender.send(msg).await;
    }

    let mut stalls = 0u64;
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                log::info!("[Mic] {} force-closed", conn_guard.id());
                break;
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    match feed(&input, data).await {
                        Ok(FeedOutcome::Accepted) => {}
                        Ok(FeedOutcome::Backpressure) => stalls += 1,
                        Err(e) => {
                            log::warn!("[Mic] {} encoder input gone: {}", conn_guard.id(), e);
                            send_error(&mut sender, &e).await;
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
        }
    }

    drop(input);
    log::info!(
        "[Mic] {} closed (session {}, {} backpressure stall(s))",
        conn_guard.id(),
        started.session_id,
        stalls
    );
    if let Err(e) = state.arbiter.stop_session(&started.session_id).await {
        log::warn!("[Mic] Stopping session {} failed: {}", started.session_id, e);
    }
}

async fn feed(input: &LiveInput, data: bytes::Bytes) -> Result<FeedOutcome, ZonecastError> {
    if data.is_empty() {
        return Ok(FeedOutcome::Accepted);
    }
    input.feed(data).await.map_err(ZonecastError::from)
}
