//! Message broker bridge over WebSocket.
//!
//! The broker client runs out of process. It connects to `/ws/broker`,
//! forwards every inbound broker message as a `{"topic", "payload"}` text
//! frame, and receives the engine's publishes in the same shape.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::api::ws_connection::ConnectionKind;
use crate::api::AppState;
use crate::error::{ZonecastError, ZonecastResult};
use crate::zones::{BrokerPublisher, TransportError};

/// One broker message in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerEnvelope {
    pub topic: String,
    /// Raw string or inline JSON.
    pub payload: Value,
}

impl BrokerEnvelope {
    /// Payload as the raw text the engine's topic router expects.
    pub fn payload_text(&self) -> String {
        match &self.payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Parses an inbound bridge frame.
pub fn parse_envelope(text: &str) -> ZonecastResult<BrokerEnvelope> {
    let envelope: BrokerEnvelope = serde_json::from_str(text)
        .map_err(|e| ZonecastError::Validation(format!("bad broker frame: {}", e)))?;
    if envelope.topic.trim().is_empty() {
        return Err(ZonecastError::Validation("broker frame without topic".into()));
    }
    Ok(envelope)
}

/// [`BrokerPublisher`] that fans publishes out to connected bridge sockets.
pub struct WsBrokerBridge {
    tx: broadcast::Sender<BrokerEnvelope>,
}

impl WsBrokerBridge {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEnvelope> {
        self.tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.tx.receiver_count() > 0
    }
}

#[async_trait]
impl BrokerPublisher for WsBrokerBridge {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), TransportError> {
        let payload = serde_json::from_str(&payload).unwrap_or(Value::String(payload));
        let envelope = BrokerEnvelope {
            topic: topic.to_string(),
            payload,
        };
        self.tx.send(envelope).map(|_| ()).map_err(|_| TransportError::Closed)
    }
}

/// `GET /ws/broker`
pub async fn broker_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_broker_ws(socket, state))
}

async fn handle_broker_ws(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut outbound = state.broker.subscribe();

    let conn_guard = state.ws_manager.register(ConnectionKind::Broker);
    let cancel_token = conn_guard.cancel_token().clone();
    log::info!("[Broker] Bridge connected: {}", conn_guard.id());

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                log::info!("[Broker] Bridge force-closed: {}", conn_guard.id());
                break;
            }

            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let envelope = match parse_envelope(&text) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            log::warn!("[Broker] Dropping frame: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = state
                        .zones
                        .handle_broker_message(&envelope.topic, &envelope.payload_text())
                        .await
                    {
                        log::warn!("[Broker] {} rejected: {}", envelope.topic, e);
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },

            out = outbound.recv() => match out {
                Ok(envelope) => {
                    let Ok(json) = serde_json::to_string(&envelope) else { continue };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("[Broker] Bridge lagged, {} publish(es) lost", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    log::info!("[Broker] Bridge disconnected: {}", conn_guard.id());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_accepts_string_and_json_payloads() {
        let text = parse_envelope(r#"{"topic":"bulk/test","payload":"YNNY"}"#).unwrap();
        assert_eq!(text.payload_text(), "YNNY");

        let json = parse_envelope(r#"{"topic":"zone3/command","payload":{"set_stream":true}}"#).unwrap();
        assert_eq!(json.payload_text(), r#"{"set_stream":true}"#);
    }

    #[test]
    fn envelope_requires_topic() {
        assert!(parse_envelope(r#"{"topic":"","payload":"x"}"#).is_err());
        assert!(parse_envelope("not json").is_err());
    }

    #[tokio::test]
    async fn publish_without_bridge_is_closed() {
        let bridge = WsBrokerBridge::new(8);
        assert!(!bridge.is_connected());
        assert!(matches!(
            bridge.publish("zone1/command", "{}".into()).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn publish_reaches_connected_bridge() {
        let bridge = WsBrokerBridge::new(8);
        let mut rx = bridge.subscribe();

        bridge
            .publish("zone2/command", r#"{"get_status":true}"#.into())
            .await
            .unwrap();
        bridge.publish("zone2/lwt", "online".into()).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.topic, "zone2/command");
        assert_eq!(first.payload["get_status"], true);
        assert_eq!(rx.recv().await.unwrap().payload, Value::String("online".into()));
    }
}
