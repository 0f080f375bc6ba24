//! Realtime subscriber WebSocket (`/ws`).
//!
//! On connect the client receives a `snapshot` of every zone and the playback
//! status, then every broadcast event. Clients may also send playback
//! commands and zone status requests; each gets a direct reply.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::sink::SinkExt;
use futures::stream::{SplitSink, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::api::ws_connection::ConnectionKind;
use crate::api::AppState;
use crate::error::{ZonecastError, ZonecastResult};
use crate::playback::{PlaybackStatus, StartedSession};
use crate::types::ZoneId;
use crate::zones::{StatusFrame, ZoneSnapshot};

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket Message Types
// ─────────────────────────────────────────────────────────────────────────────

/// Incoming WebSocket message envelope.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum WsIncoming {
    Heartbeat,
    StartFile { payload: FileRequest },
    StartPlaylist { payload: PlaylistRequest },
    StartRemote { payload: RemoteRequest },
    Stop,
    Pause,
    Resume,
    NextTrack,
    PreviousTrack,
    GetPlayback,
    RequestZoneStatus { payload: ZoneRequest },
}

#[derive(Debug, Deserialize)]
struct FileRequest {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct PlaylistRequest {
    tracks: Vec<PathBuf>,
    #[serde(default, rename = "loop")]
    looping: bool,
}

#[derive(Debug, Deserialize)]
struct RemoteRequest {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ZoneRequest {
    zone: ZoneId,
}

/// Outgoing WebSocket messages.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum WsOutgoing {
    Snapshot { payload: SnapshotPayload },
    HeartbeatAck,
    CommandOk { payload: CommandOkPayload },
    PlaybackStatus { payload: PlaybackStatus },
    ZoneStatus { payload: StatusFrame },
    Error { code: &'static str, message: String },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotPayload {
    zones: Vec<ZoneSnapshot>,
    playback: PlaybackStatus,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CommandOkPayload {
    command: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
}

impl WsOutgoing {
    fn to_message(&self) -> Option<Message> {
        serde_json::to_string(self)
            .ok()
            .map(|s| Message::Text(s.into()))
    }

    fn error(e: &ZonecastError) -> Self {
        Self::Error {
            code: e.code(),
            message: e.to_string(),
        }
    }

    fn ok(command: &'static str, started: Option<StartedSession>) -> Self {
        Self::CommandOk {
            payload: CommandOkPayload {
                command,
                session_id: started.map(|s| s.session_id),
            },
        }
    }
}

fn build_snapshot(state: &AppState) -> Option<Message> {
    WsOutgoing::Snapshot {
        payload: SnapshotPayload {
            zones: state.zones.zones(),
            playback: state.arbiter.status(),
        },
    }
    .to_message()
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket Message Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Runs one client command and builds its reply.
async fn handle_command(state: &AppState, command: WsIncoming) -> WsOutgoing {
    let arbiter = &state.arbiter;
    let result: ZonecastResult<WsOutgoing> = match command {
        WsIncoming::Heartbeat => Ok(WsOutgoing::HeartbeatAck),
        WsIncoming::StartFile { payload } => arbiter
            .start_file(payload.path)
            .await
            .map(|s| WsOutgoing::ok("startFile", Some(s))),
        WsIncoming::StartPlaylist { payload } => arbiter
            .start_playlist(payload.tracks, payload.looping)
            .await
            .map(|s| WsOutgoing::ok("startPlaylist", Some(s))),
        WsIncoming::StartRemote { payload } => arbiter
            .start_remote(payload.url)
            .await
            .map(|s| WsOutgoing::ok("startRemote", Some(s))),
        WsIncoming::Stop => arbiter.stop().await.map(|()| WsOutgoing::ok("stop", None)),
        WsIncoming::Pause => arbiter.pause().await.map(|_| WsOutgoing::ok("pause", None)),
        WsIncoming::Resume => arbiter
            .resume()
            .await
            .map(|s| WsOutgoing::ok("resume", Some(s))),
        WsIncoming::NextTrack => arbiter
            .next_track()
            .await
            .map(|s| WsOutgoing::ok("nextTrack", Some(s))),
        WsIncoming::PreviousTrack => arbiter
            .previous_track()
            .await
            .map(|s| WsOutgoing::ok("previousTrack", Some(s))),
        WsIncoming::GetPlayback => Ok(WsOutgoing::PlaybackStatus {
            payload: arbiter.status(),
        }),
        WsIncoming::RequestZoneStatus { payload } => state
            .zones
            .request_status(payload.zone)
            .await
            .map(|frame| WsOutgoing::ZoneStatus { payload: frame }),
    };

    result.unwrap_or_else(|e| {
        log::info!("[WS] Command failed: {}", e);
        WsOutgoing::error(&e)
    })
}

async fn send(sender: &mut SplitSink<WebSocket, Message>, msg: WsOutgoing) -> bool {
    match msg.to_message() {
        Some(msg) => sender.send(msg).await.is_ok(),
        None => true,
    }
}

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut broadcast_rx = state.event_bridge.subscribe();
    let mut last_activity = Instant::now();

    let conn_guard = state.ws_manager.register(ConnectionKind::Subscriber);
    let cancel_token = conn_guard.cancel_token().clone();
    log::info!("[WS] New connection established: {}", conn_guard.id());

    if let Some(msg) = build_snapshot(&state) {
        if sender.send(msg).await.is_err() {
            log::warn!("[WS] Failed to send snapshot, client disconnected");
            return;
        }
    }

    let heartbeat_timeout = Duration::from_secs(state.config.ws_heartbeat_timeout_secs);
    let mut heartbeat_interval =
        tokio::time::interval(Duration::from_secs(state.config.ws_heartbeat_check_interval_secs.max(1)));
    heartbeat_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                log::info!("[WS] Connection force-closed: {}", conn_guard.id());
                break;
            }

            msg = receiver.next() => {
                last_activity = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match serde_json::from_str::<WsIncoming>(&text) {
                            Ok(command) => handle_command(&state, command).await,
                            Err(e) => WsOutgoing::error(&ZonecastError::Validation(format!(
                                "unrecognized message: {}",
                                e
                            ))),
                        };
                        if !send(&mut sender, reply).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }

            event = broadcast_rx.recv() => match event {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("[WS] {} lagged, {} event(s) skipped; resending snapshot", conn_guard.id(), n);
                    if let Some(msg) = build_snapshot(&state) {
                        if sender.send(msg).await.is_err() {
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            _ = heartbeat_interval.tick() => {
                if last_activity.elapsed() > heartbeat_timeout {
                    log::warn!("[WS] Heartbeat timeout: {}", conn_guard.id());
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        let cmd: WsIncoming =
            serde_json::from_str(r#"{"type":"startPlaylist","payload":{"tracks":["/a.mp3"],"loop":true}}"#)
                .unwrap();
        match cmd {
            WsIncoming::StartPlaylist { payload } => {
                assert!(payload.looping);
                assert_eq!(payload.tracks, vec![PathBuf::from("/a.mp3")]);
            }
            other => panic!("unexpected {:?}", other),
        }

        let cmd: WsIncoming =
            serde_json::from_str(r#"{"type":"requestZoneStatus","payload":{"zone":7}}"#).unwrap();
        assert!(matches!(cmd, WsIncoming::RequestZoneStatus { payload: ZoneRequest { zone: 7 } }));

        assert!(matches!(
            serde_json::from_str::<WsIncoming>(r#"{"type":"pause"}"#).unwrap(),
            WsIncoming::Pause
        ));
    }

    #[test]
    fn error_reply_has_code_and_message() {
        let json = serde_json::to_value(WsOutgoing::error(&ZonecastError::ModeBusy {
            active_mode: crate::types::PlaybackMode::Mic,
            requested_mode: crate::types::PlaybackMode::File,
        }))
        .unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "mode_busy");
    }

    #[test]
    fn command_ok_omits_missing_session() {
        let json = serde_json::to_value(WsOutgoing::ok("stop", None)).unwrap();
        assert_eq!(json["type"], "commandOk");
        assert_eq!(json["payload"]["command"], "stop");
        assert!(json["payload"].get("sessionId").is_none());
    }
}
