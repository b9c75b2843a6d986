//! Broadcast producer
//!
//! Fire-and-forget HTTP POST of committed change batches to the
//! fan-out service. Hard 500 ms timeout, no retry; all errors are
//! logged and swallowed. A save must never fail because broadcast
//! failed.

use std::sync::Arc;
use std::time::Duration;

use crate::observability::Logger;

use super::errors::{BusError, BusResult};
use super::event::ChangeBatch;

/// Header carrying the writer's identity, used for skip-sender routing
pub const SENDER_HEADER: &str = "X-Sender-User-Id";

const BROADCAST_TIMEOUT: Duration = Duration::from_millis(500);

pub struct BroadcastProducer {
    client: reqwest::Client,
    endpoint: String,
}

impl BroadcastProducer {
    /// `endpoint` is the fan-out service's broadcast URL, e.g.
    /// `http://127.0.0.1:4100/broadcast`.
    pub fn new(endpoint: impl Into<String>) -> BusResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(BROADCAST_TIMEOUT)
            .build()
            .map_err(|e| BusError::Config(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Post a batch without blocking the caller. Failures are logged
    /// and dropped.
    pub fn emit(self: &Arc<Self>, batch: ChangeBatch, sender_user_id: Option<String>) {
        let producer = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = producer.send(&batch, sender_user_id.as_deref()).await {
                Logger::warn(
                    "BROADCAST_DROPPED",
                    &[
                        ("endpoint", producer.endpoint.as_str()),
                        ("items", &batch.items.len().to_string()),
                        ("cause", &e.to_string()),
                    ],
                );
            }
        });
    }

    /// The awaitable POST; `emit` is the usual entry point.
    pub async fn send(
        &self,
        batch: &ChangeBatch,
        sender_user_id: Option<&str>,
    ) -> BusResult<()> {
        let mut request = self.client.post(&self.endpoint).json(batch);
        if let Some(user_id) = sender_user_id {
            request = request.header(SENDER_HEADER, user_id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BusError::PostFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BusError::PostFailed(format!(
                "fan-out returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
