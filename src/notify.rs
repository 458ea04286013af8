//! Notify bus — per-session pub/sub over Postgres LISTEN/NOTIFY (spec §3
//! "Notify channel", §6.2). Channel names derive from the session id by
//! stripping dashes (`Uuid::simple`) and prefixing `events_`/`control_`.
//! Oversize payloads are collapsed to a `{type:"ref"}` stub; the consumer
//! refetches the full event from `Storage` by id.
//!
//! Grounded in the teacher's `ipc::event::EventBroadcaster`, but that type is
//! in-memory only (a `tokio::sync::broadcast::Sender`) and cannot fan out
//! across worker processes or survive a worker restart, so the transport is
//! rebuilt here on `sqlx::postgres::PgListener`/`pg_notify`.

use anyhow::Result;
use serde_json::{json, Value};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use uuid::Uuid;

/// Payloads over this many bytes are truncated to a ref stub.
pub const MAX_PAYLOAD_BYTES: usize = 7500;

#[derive(Clone)]
pub struct NotifyBus {
    pool: PgPool,
}

impl NotifyBus {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn events_channel(session_id: Uuid) -> String {
        format!("events_{}", session_id.simple())
    }

    pub fn control_channel(session_id: Uuid) -> String {
        format!("control_{}", session_id.simple())
    }

    /// Publish a persisted event. `event_id` is the durable row id so a
    /// truncated consumer can refetch it.
    pub async fn publish_event(
        &self,
        session_id: Uuid,
        event_id: i64,
        event_type: &str,
        payload: &Value,
    ) -> Result<()> {
        let full = json!({"type": event_type, "id": event_id, "payload": payload});
        let body = truncate_if_oversize(&full, event_type, event_id);
        self.notify(&Self::events_channel(session_id), &body).await
    }

    /// Publish an ephemeral event (never persisted, so there is no id to
    /// refetch by — if it would overflow the bus it is simply dropped,
    /// since a dropped delta is superseded by the next complete-text event
    /// anyway, per spec §4.3).
    pub async fn publish_ephemeral(
        &self,
        session_id: Uuid,
        event_type: &str,
        payload: &Value,
    ) -> Result<()> {
        let full = json!({"type": event_type, "payload": payload});
        if serde_json::to_string(&full)?.len() > MAX_PAYLOAD_BYTES {
            return Ok(());
        }
        self.notify(&Self::events_channel(session_id), &full).await
    }

    pub async fn publish_control(&self, session_id: Uuid, payload: &Value) -> Result<()> {
        self.notify(&Self::control_channel(session_id), payload)
            .await
    }

    async fn notify(&self, channel: &str, payload: &Value) -> Result<()> {
        let text = serde_json::to_string(payload)?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(text)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Dedicated LISTEN connection for `channel`, separate from the main
    /// pool (spec §5 "per-subscriber LISTEN connection pool separate from
    /// the main pool").
    pub async fn subscribe(&self, channel: &str) -> Result<PgListener> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(channel).await?;
        Ok(listener)
    }
}

fn truncate_if_oversize(full: &Value, event_type: &str, event_id: i64) -> Value {
    match serde_json::to_string(full) {
        Ok(s) if s.len() > MAX_PAYLOAD_BYTES => {
            json!({"type": "ref", "originalType": event_type, "id": event_id})
        }
        _ => full.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_strip_dashes() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(
            NotifyBus::events_channel(id),
            "events_550e8400e29b41d4a716446655440000"
        );
        assert_eq!(
            NotifyBus::control_channel(id),
            "control_550e8400e29b41d4a716446655440000"
        );
    }

    #[test]
    fn oversize_payload_becomes_ref_stub() {
        let big = "x".repeat(8192);
        let full = json!({"type": "agent:tool-end", "id": 42, "payload": {"content": big}});
        let truncated = truncate_if_oversize(&full, "agent:tool-end", 42);
        assert_eq!(truncated["type"], "ref");
        assert_eq!(truncated["originalType"], "agent:tool-end");
        assert_eq!(truncated["id"], 42);
    }

    #[test]
    fn small_payload_is_untouched() {
        let full = json!({"type": "agent:text", "id": 1, "payload": {"text": "Hi"}});
        let out = truncate_if_oversize(&full, "agent:text", 1);
        assert_eq!(out, full);
    }
}
