//! Progress egress: JSON messages on a per-audit Redis channel.
//!
//! Messages from parallel phases may interleave at the transport; consumers
//! key on `audit_id + phase + sequence`, so the sequence counter here is
//! per-audit monotonic.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub audit_id: Uuid,
    pub phase: String,
    pub completed: usize,
    pub total: usize,
    pub timestamp: String,
    pub sequence: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub audit_id: Uuid,
    pub event: String,
}

pub struct ProgressPublisher {
    redis: ConnectionManager,
    audit_id: Uuid,
    sequence: AtomicU64,
}

impl ProgressPublisher {
    pub fn new(redis: ConnectionManager, audit_id: Uuid) -> Self {
        Self { redis, audit_id, sequence: AtomicU64::new(0) }
    }

    pub fn channel(&self) -> String {
        format!("audit:progress:{}", self.audit_id)
    }

    /// Publish a phase progress update. Delivery is best-effort: a broken
    /// Redis connection degrades the UI, never the audit.
    pub async fn publish(&self, phase: &str, completed: usize, total: usize) {
        let message = ProgressMessage {
            audit_id: self.audit_id,
            phase: phase.to_string(),
            completed,
            total,
            timestamp: Utc::now().to_rfc3339(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
        };
        self.send(&message).await;
    }

    pub async fn dashboard_ready(&self) {
        let message = EventMessage { audit_id: self.audit_id, event: "dashboard_ready".to_string() };
        self.send(&message).await;
    }

    async fn send<T: Serialize>(&self, message: &T) {
        let payload = match serde_json::to_string(message) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(audit_id = %self.audit_id, "progress serialization failed: {e}");
                return;
            }
        };
        let mut conn = self.redis.clone();
        if let Err(e) = conn.publish::<_, _, ()>(self.channel(), payload).await {
            tracing::warn!(audit_id = %self.audit_id, "progress publish failed: {e}");
        }
    }
}
