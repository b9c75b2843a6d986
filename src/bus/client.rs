//! Reconnecting subscriber client
//!
//! Connects to the fan-out service, re-issues its subscriptions every
//! time the `connected` event arrives, and forwards data frames to the
//! consumer. Reconnects with exponential backoff, 1 s doubling to a
//! 30 s cap. No backfill: consumers that need consistency re-fetch.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::observability::Logger;

use super::router::SubKey;
use super::service::ClientAction;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct BusClient {
    /// WebSocket URL, e.g. `ws://127.0.0.1:4200/?user_id=u1`
    url: String,
    subscriptions: Vec<SubKey>,
}

impl BusClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            subscriptions: Vec::new(),
        }
    }

    pub fn with_subscription(mut self, key: SubKey) -> Self {
        self.subscriptions.push(key);
        self
    }

    /// Run until the consumer hangs up. Data frames (`type: changes`)
    /// go to `frames`; service events are handled internally.
    pub async fn run(self, frames: mpsc::Sender<Value>) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match connect_async(self.url.as_str()).await {
                Ok((ws_stream, _)) => {
                    backoff = INITIAL_BACKOFF;
                    let (mut sink, mut stream) = ws_stream.split();

                    while let Some(message) = stream.next().await {
                        let text = match message {
                            Ok(Message::Text(text)) => text,
                            Ok(Message::Close(_)) | Err(_) => break,
                            _ => continue,
                        };
                        let Ok(value) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };

                        // re-subscribe on every (re)connect confirmation
                        if value.get("event").and_then(Value::as_str) == Some("connected") {
                            for key in &self.subscriptions {
                                let action = subscribe_action(key);
                                let Ok(payload) = serde_json::to_string(&action) else {
                                    continue;
                                };
                                if sink.send(Message::Text(payload)).await.is_err() {
                                    break;
                                }
                            }
                            continue;
                        }

                        if value.get("type").and_then(Value::as_str) == Some("changes") {
                            if frames.send(value).await.is_err() {
                                // consumer gone, stop for good
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    Logger::warn(
                        "BUS_CLIENT_CONNECT_FAILED",
                        &[("url", self.url.as_str()), ("cause", &e.to_string())],
                    );
                }
            }

            if frames.is_closed() {
                return;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

fn subscribe_action(key: &SubKey) -> ClientAction {
    match key {
        SubKey::Class(class_id) => ClientAction::Subscribe {
            class_id: Some(class_id.clone()),
            id: None,
            scope_id: None,
        },
        SubKey::Object(object_key) => ClientAction::Subscribe {
            class_id: None,
            id: Some(object_key.clone()),
            scope_id: None,
        },
        SubKey::Scope(scope_id) => ClientAction::Subscribe {
            class_id: None,
            id: None,
            scope_id: Some(scope_id.clone()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_action_shapes() {
        let wire =
            serde_json::to_value(subscribe_action(&SubKey::Class("user".into()))).unwrap();
        assert_eq!(wire["action"], "subscribe");
        assert_eq!(wire["class_id"], "user");

        let wire =
            serde_json::to_value(subscribe_action(&SubKey::Object("user/7".into()))).unwrap();
        assert_eq!(wire["id"], "user/7");

        let wire =
            serde_json::to_value(subscribe_action(&SubKey::Scope("s1".into()))).unwrap();
        assert_eq!(wire["scope_id"], "s1");
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = INITIAL_BACKOFF;
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(backoff.as_secs());
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }
}
