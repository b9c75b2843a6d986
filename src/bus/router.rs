//! Subscription router
//!
//! Connections subscribe by class id, by `"<class>/<id>"` object key,
//! or by scope id. Routing unions the matches per item, dedupes by
//! connection, drops the originating user, and hands each survivor
//! the full batch payload exactly once. One lock covers the three
//! maps and the per-connection sets, so disconnect cleanup and route
//! lookup cannot race.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::errors::{BusError, BusResult};
use super::event::{item_class_id, item_object_key, item_scope, ChangeBatch};

/// A subscription target
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubKey {
    /// All changes of a class
    Class(String),
    /// One object, keyed `"<class>/<id>"`
    Object(String),
    /// Every item carrying this `_scope_id`
    Scope(String),
}

struct Connection {
    user_id: Option<String>,
    sender: mpsc::Sender<String>,
    subscriptions: HashSet<SubKey>,
}

#[derive(Default)]
struct RouterState {
    connections: HashMap<String, Connection>,
    by_class: HashMap<String, HashSet<String>>,
    by_object: HashMap<String, HashSet<String>>,
    by_scope: HashMap<String, HashSet<String>>,
}

/// Routing tables for the fan-out service
#[derive(Default)]
pub struct SubscriptionRouter {
    state: Mutex<RouterState>,
}

impl SubscriptionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and its outbound frame channel.
    pub fn connect(
        &self,
        connection_id: impl Into<String>,
        user_id: Option<String>,
        sender: mpsc::Sender<String>,
    ) {
        if let Ok(mut state) = self.state.lock() {
            state.connections.insert(
                connection_id.into(),
                Connection {
                    user_id,
                    sender,
                    subscriptions: HashSet::new(),
                },
            );
        }
    }

    /// Drop a connection and release all of its subscriptions.
    pub fn disconnect(&self, connection_id: &str) {
        let Ok(mut state) = self.state.lock() else { return };
        let Some(connection) = state.connections.remove(connection_id) else {
            return;
        };
        for key in connection.subscriptions {
            let index = match &key {
                SubKey::Class(class_id) => state.by_class.get_mut(class_id),
                SubKey::Object(object_key) => state.by_object.get_mut(object_key),
                SubKey::Scope(scope_id) => state.by_scope.get_mut(scope_id),
            };
            if let Some(set) = index {
                set.remove(connection_id);
            }
        }
    }

    pub fn subscribe(&self, connection_id: &str, key: SubKey) -> BusResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| BusError::Connection("router lock poisoned".into()))?;

        if !state.connections.contains_key(connection_id) {
            return Err(BusError::Connection(format!(
                "unknown connection '{}'",
                connection_id
            )));
        }

        let index = match &key {
            SubKey::Class(class_id) => state.by_class.entry(class_id.clone()).or_default(),
            SubKey::Object(object_key) => state.by_object.entry(object_key.clone()).or_default(),
            SubKey::Scope(scope_id) => state.by_scope.entry(scope_id.clone()).or_default(),
        };
        index.insert(connection_id.to_string());

        if let Some(connection) = state.connections.get_mut(connection_id) {
            connection.subscriptions.insert(key);
        }
        Ok(())
    }

    pub fn unsubscribe(&self, connection_id: &str, key: &SubKey) -> BusResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| BusError::Connection("router lock poisoned".into()))?;

        let index = match key {
            SubKey::Class(class_id) => state.by_class.get_mut(class_id),
            SubKey::Object(object_key) => state.by_object.get_mut(object_key),
            SubKey::Scope(scope_id) => state.by_scope.get_mut(scope_id),
        };
        if let Some(set) = index {
            set.remove(connection_id);
        }
        if let Some(connection) = state.connections.get_mut(connection_id) {
            connection.subscriptions.remove(key);
        }
        Ok(())
    }

    /// Deliver a batch: union the matches of every item, skip the
    /// sender's own connections, send the full payload once per
    /// surviving connection. Returns how many were sent.
    pub async fn deliver(&self, batch: &ChangeBatch, sender_user_id: Option<&str>) -> usize {
        let payload = match serde_json::to_string(batch) {
            Ok(payload) => payload,
            Err(_) => return 0,
        };

        // collect senders under the lock, post after releasing it
        let recipients: Vec<mpsc::Sender<String>> = {
            let Ok(state) = self.state.lock() else { return 0 };

            let mut matched: HashSet<&String> = HashSet::new();
            for item in &batch.items {
                if let Some(class_id) = item_class_id(item) {
                    if let Some(set) = state.by_class.get(class_id) {
                        matched.extend(set.iter());
                    }
                }
                if let Some(object_key) = item_object_key(item) {
                    if let Some(set) = state.by_object.get(&object_key) {
                        matched.extend(set.iter());
                    }
                }
                if let Some(scope_id) = item_scope(item) {
                    if let Some(set) = state.by_scope.get(scope_id) {
                        matched.extend(set.iter());
                    }
                }
            }

            matched
                .into_iter()
                .filter_map(|connection_id| state.connections.get(connection_id))
                .filter(|connection| match (&connection.user_id, sender_user_id) {
                    (Some(subscriber), Some(sender)) => subscriber != sender,
                    _ => true,
                })
                .map(|connection| connection.sender.clone())
                .collect()
        };

        let mut sent = 0;
        for sender in recipients {
            if sender.send(payload.clone()).await.is_ok() {
                sent += 1;
            }
        }
        sent
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().map(|s| s.connections.len()).unwrap_or(0)
    }

    pub fn subscription_count(&self) -> usize {
        self.state
            .lock()
            .map(|s| {
                s.connections
                    .values()
                    .map(|c| c.subscriptions.len())
                    .sum()
            })
            .unwrap_or(0)
    }
}
