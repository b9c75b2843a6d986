//! Fan-out service
//!
//! A long-lived process with two transports: a WebSocket listener for
//! subscribers and an HTTP endpoint accepting producer broadcasts.
//! The WebSocket side identifies the user from a token or query
//! parameter at handshake time, confirms with a `connected` event,
//! and then serves subscribe/unsubscribe/ping actions.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as WsRequest, Response as WsResponse,
};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::observability::Logger;

use super::errors::{BusError, BusResult};
use super::producer::SENDER_HEADER;
use super::router::{SubKey, SubscriptionRouter};

/// Fan-out service configuration
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// WebSocket bind address
    pub ws_addr: String,
    /// HTTP bind address (broadcast + health)
    pub http_addr: String,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            ws_addr: "0.0.0.0:4200".to_string(),
            http_addr: "0.0.0.0:4100".to_string(),
        }
    }
}

/// Inbound client actions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientAction {
    Subscribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        class_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope_id: Option<String>,
    },
    Unsubscribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        class_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope_id: Option<String>,
    },
    Ping,
}

/// Outbound service events (data frames are ChangeBatch payloads)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ServerEvent {
    Connected {
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    Subscribed {
        target: String,
    },
    Unsubscribed {
        target: String,
    },
    Pong,
    Error {
        message: String,
    },
}

/// Turn subscribe/unsubscribe fields into a routing key.
pub fn sub_key(
    class_id: Option<String>,
    id: Option<String>,
    scope_id: Option<String>,
) -> BusResult<SubKey> {
    if let Some(class_id) = class_id {
        return Ok(SubKey::Class(class_id));
    }
    if let Some(id) = id {
        return Ok(SubKey::Object(id));
    }
    if let Some(scope_id) = scope_id {
        return Ok(SubKey::Scope(scope_id));
    }
    Err(BusError::InvalidMessage(
        "subscribe needs class_id, id, or scope_id".into(),
    ))
}

fn key_label(key: &SubKey) -> String {
    match key {
        SubKey::Class(class_id) => class_id.clone(),
        SubKey::Object(object_key) => object_key.clone(),
        SubKey::Scope(scope_id) => scope_id.clone(),
    }
}

pub struct FanoutService {
    config: FanoutConfig,
    router: Arc<SubscriptionRouter>,
}

impl FanoutService {
    pub fn new(config: FanoutConfig) -> Self {
        Self {
            config,
            router: Arc::new(SubscriptionRouter::new()),
        }
    }

    pub fn router(&self) -> Arc<SubscriptionRouter> {
        Arc::clone(&self.router)
    }

    /// Run both transports until one fails.
    pub async fn run(&self) -> BusResult<()> {
        let ws = self.run_websocket();
        let http = self.run_http();
        tokio::try_join!(ws, http)?;
        Ok(())
    }

    async fn run_http(&self) -> BusResult<()> {
        let app = http_router(self.router());
        let listener = TcpListener::bind(&self.config.http_addr)
            .await
            .map_err(|e| BusError::Config(format!("http bind failed: {}", e)))?;

        Logger::info(
            "FANOUT_HTTP_LISTENING",
            &[("addr", self.config.http_addr.as_str())],
        );

        axum::serve(listener, app)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))
    }

    async fn run_websocket(&self) -> BusResult<()> {
        let listener = TcpListener::bind(&self.config.ws_addr)
            .await
            .map_err(|e| BusError::Config(format!("ws bind failed: {}", e)))?;

        Logger::info(
            "FANOUT_WS_LISTENING",
            &[("addr", self.config.ws_addr.as_str())],
        );

        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| BusError::Connection(e.to_string()))?;
            let router = self.router();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, router).await {
                    Logger::warn(
                        "FANOUT_CONNECTION_CLOSED",
                        &[("peer", &peer.to_string()), ("cause", &e.to_string())],
                    );
                }
            });
        }
    }
}

/// The HTTP surface: producer broadcasts and health counters.
pub fn http_router(router: Arc<SubscriptionRouter>) -> Router {
    Router::new()
        .route("/broadcast", post(broadcast_handler))
        .route("/health", get(health_handler))
        .with_state(router)
}

async fn broadcast_handler(
    State(router): State<Arc<SubscriptionRouter>>,
    headers: HeaderMap,
    Json(batch): Json<super::event::ChangeBatch>,
) -> Json<Value> {
    let sender = headers
        .get(SENDER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let sent = router.deliver(&batch, sender.as_deref()).await;
    Json(json!({ "sent": sent }))
}

async fn health_handler(State(router): State<Arc<SubscriptionRouter>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": router.connection_count(),
        "subscriptions": router.subscription_count(),
    }))
}

/// User identity from the handshake: `?user_id=` or `?token=` (the
/// token is opaque here; verification belongs to the caller's
/// authenticator).
fn user_from_query(query: Option<&str>) -> Option<String> {
    let query = query?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next()?;
        let value = parts.next().unwrap_or("");
        if (key == "user_id" || key == "token") && !value.is_empty() {
            return Some(value.to_string());
        }
    }
    None
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Arc<SubscriptionRouter>,
) -> BusResult<()> {
    let mut user_id: Option<String> = None;
    let ws_stream = accept_hdr_async(stream, |request: &WsRequest, response: WsResponse| {
        user_id = user_from_query(request.uri().query());
        Ok(response)
    })
    .await
    .map_err(|e| BusError::Connection(format!("handshake failed: {}", e)))?;

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let connection_id = Uuid::new_v4().to_string();
    let (frame_tx, mut frame_rx) = mpsc::channel::<String>(256);

    router.connect(&connection_id, user_id.clone(), frame_tx.clone());
    Logger::info(
        "FANOUT_CONNECTED",
        &[
            ("connection", connection_id.as_str()),
            ("peer", &peer.to_string()),
            ("user", user_id.as_deref().unwrap_or("-")),
        ],
    );

    send_event(
        &frame_tx,
        &ServerEvent::Connected {
            user_id: user_id.clone(),
        },
    )
    .await;

    loop {
        tokio::select! {
            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_action(&router, &connection_id, &text, &frame_tx).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if ws_sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }

            outbound = frame_rx.recv() => {
                match outbound {
                    Some(payload) => {
                        if ws_sender.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    router.disconnect(&connection_id);
    Logger::info(
        "FANOUT_DISCONNECTED",
        &[("connection", connection_id.as_str())],
    );
    Ok(())
}

async fn handle_action(
    router: &Arc<SubscriptionRouter>,
    connection_id: &str,
    text: &str,
    frame_tx: &mpsc::Sender<String>,
) {
    let action = match serde_json::from_str::<ClientAction>(text) {
        Ok(action) => action,
        Err(e) => {
            send_event(
                frame_tx,
                &ServerEvent::Error {
                    message: format!("invalid message: {}", e),
                },
            )
            .await;
            return;
        }
    };

    match action {
        ClientAction::Subscribe {
            class_id,
            id,
            scope_id,
        } => match sub_key(class_id, id, scope_id) {
            Ok(key) => {
                let label = key_label(&key);
                match router.subscribe(connection_id, key) {
                    Ok(()) => {
                        send_event(frame_tx, &ServerEvent::Subscribed { target: label }).await;
                    }
                    Err(e) => {
                        send_event(
                            frame_tx,
                            &ServerEvent::Error {
                                message: e.to_string(),
                            },
                        )
                        .await;
                    }
                }
            }
            Err(e) => {
                send_event(
                    frame_tx,
                    &ServerEvent::Error {
                        message: e.to_string(),
                    },
                )
                .await;
            }
        },
        ClientAction::Unsubscribe {
            class_id,
            id,
            scope_id,
        } => match sub_key(class_id, id, scope_id) {
            Ok(key) => {
                let label = key_label(&key);
                let _ = router.unsubscribe(connection_id, &key);
                send_event(frame_tx, &ServerEvent::Unsubscribed { target: label }).await;
            }
            Err(e) => {
                send_event(
                    frame_tx,
                    &ServerEvent::Error {
                        message: e.to_string(),
                    },
                )
                .await;
            }
        },
        ClientAction::Ping => {
            send_event(frame_tx, &ServerEvent::Pong).await;
        }
    }
}

async fn send_event(frame_tx: &mpsc::Sender<String>, event: &ServerEvent) {
    if let Ok(payload) = serde_json::to_string(event) {
        let _ = frame_tx.send(payload).await;
    }
}
