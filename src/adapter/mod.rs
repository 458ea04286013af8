//! Adapter contract (spec §4.2): one trait, three wire-protocol
//! implementations. Each adapter instance is scoped to a single session —
//! the factory in `build` mints a fresh one per `SessionProcess` — so
//! adapter-internal state (stdin handle, pending-request table, latched
//! session ref) lives behind `&self` interior mutability rather than a
//! separate `ManagedProcess` handle threaded through every call, which is
//! how the teacher's `ClaudeCodeRunner`/`CodexRunner` are already shaped
//! (`AtomicU32` pid, `AtomicBool` cancelled).

pub mod claude;
pub mod codex;
pub mod gemini;

use crate::model::{AgentKind, PermissionMode, SpawnOptions};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// The closed, uniform event taxonomy every adapter's frame parser maps
/// onto (spec §4.4). Adapter-specific quirks belong in the payload, never
/// as a new variant (spec §9 "dynamic tool catalogue").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "session:init")]
    SessionInit {
        session_ref: Option<String>,
        slash_commands: Vec<String>,
        mcp_servers: Vec<String>,
    },
    #[serde(rename = "session:state")]
    SessionState { status: String },
    #[serde(rename = "user:message")]
    UserMessage { text: String, has_image: bool },
    #[serde(rename = "agent:text")]
    AgentText { text: String },
    #[serde(rename = "agent:text-delta")]
    AgentTextDelta { text: String },
    #[serde(rename = "agent:thinking")]
    AgentThinking { text: String },
    #[serde(rename = "agent:tool-start")]
    AgentToolStart {
        tool_use_id: String,
        tool_name: String,
        input: Value,
    },
    #[serde(rename = "agent:tool-end")]
    AgentToolEnd {
        tool_use_id: String,
        content: Value,
        is_error: bool,
    },
    #[serde(rename = "agent:tool-approval")]
    AgentToolApproval {
        approval_id: String,
        tool_name: String,
        tool_input: Value,
        danger_level: String,
    },
    #[serde(rename = "agent:result")]
    AgentResult {
        turns: u32,
        duration_ms: u64,
        cost_usd: f64,
        model_usage: Value,
    },
    #[serde(rename = "agent:activity")]
    AgentActivity { text: String },
    #[serde(rename = "system:info")]
    SystemInfo { message: String },
    #[serde(rename = "system:error")]
    SystemError { message: String },
    #[serde(rename = "team:message")]
    TeamMessage { text: String },
}

impl Event {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Event::SessionInit { .. } => "session:init",
            Event::SessionState { .. } => "session:state",
            Event::UserMessage { .. } => "user:message",
            Event::AgentText { .. } => "agent:text",
            Event::AgentTextDelta { .. } => "agent:text-delta",
            Event::AgentThinking { .. } => "agent:thinking",
            Event::AgentToolStart { .. } => "agent:tool-start",
            Event::AgentToolEnd { .. } => "agent:tool-end",
            Event::AgentToolApproval { .. } => "agent:tool-approval",
            Event::AgentResult { .. } => "agent:result",
            Event::AgentActivity { .. } => "agent:activity",
            Event::SystemInfo { .. } => "system:info",
            Event::SystemError { .. } => "system:error",
            Event::TeamMessage { .. } => "team:message",
        }
    }

    /// Streaming deltas are never persisted (spec §3 Event invariant).
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Event::AgentTextDelta { .. })
    }
}

/// Everything a running adapter can push back to the owning `SessionProcess`
/// outside of the request/response calls below. Replaces the JS contract's
/// separate `onData`/`onExit`/`onThinkingChange` callback registrations with
/// a single ordered channel, which is the idiomatic Rust shape for "push
/// several kinds of async notification to one owner".
#[derive(Debug, Clone)]
pub enum AdapterSignal {
    Event(Event),
    ThinkingChanged(bool),
    Exit(Option<i32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Allow,
    Deny,
}

/// One contract, three protocols behind it (spec §4.2). An instance is
/// created per session by `build` and owns exactly one child process (or,
/// for Codex, a logical sequence of per-turn children) for its lifetime.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Start a brand-new conversation.
    async fn spawn(
        &self,
        prompt: &str,
        opts: &SpawnOptions,
    ) -> Result<mpsc::UnboundedReceiver<AdapterSignal>>;

    /// Resume a previously captured `session_ref` with a fresh prompt.
    async fn resume(
        &self,
        session_ref: &str,
        prompt: &str,
        opts: &SpawnOptions,
    ) -> Result<mpsc::UnboundedReceiver<AdapterSignal>>;

    async fn send_message(&self, text: &str, image: Option<&str>) -> Result<()>;

    async fn send_tool_result(&self, tool_use_id: &str, content: &str) -> Result<()>;

    async fn respond_to_approval(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
        updated_input: Option<Value>,
    ) -> Result<()>;

    async fn interrupt(&self) -> Result<()>;

    /// Grace period before an un-acked interrupt escalates to SIGTERM on
    /// the process group (spec §4.2.1/4.2.2/4.2.3, §5 cancellation
    /// semantics — 3s Claude, 2s Gemini, 5s Codex).
    fn interrupt_grace(&self) -> std::time::Duration;

    async fn set_model(&self, model: &str) -> Result<()>;

    async fn set_permission_mode(&self, mode: PermissionMode) -> Result<()>;

    fn is_alive(&self) -> bool;

    fn pid(&self) -> Option<i32>;
}

/// Send `signal` to the process group (negative pid). The child is always
/// spawned detached in its own group so kill targets the whole tree, not
/// just the direct child (spec §4.2).
#[cfg(unix)]
pub(crate) fn kill_process_group(pid: i32, signal: i32) {
    if pid > 0 {
        unsafe {
            libc::kill(-pid, signal);
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn kill_process_group(_pid: i32, _signal: i32) {}

/// Adapter factory keyed on agent identity (spec §4.5 "instantiate adapter
/// via a factory that keys on agent identity and capability interaction
/// mode").
pub fn build(kind: AgentKind) -> Arc<dyn Adapter> {
    match kind {
        AgentKind::Claude => Arc::new(claude::ClaudeAdapter::new()),
        AgentKind::Codex => Arc::new(codex::CodexAdapter::new()),
        AgentKind::Gemini => Arc::new(gemini::GeminiAdapter::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_text_delta_is_ephemeral() {
        let delta = Event::AgentTextDelta { text: "hi".into() };
        let text = Event::AgentText { text: "hi".into() };
        assert!(delta.is_ephemeral());
        assert!(!text.is_ephemeral());
    }

    #[test]
    fn type_tags_match_spec_taxonomy() {
        assert_eq!(
            Event::SessionInit {
                session_ref: None,
                slash_commands: vec![],
                mcp_servers: vec![]
            }
            .type_tag(),
            "session:init"
        );
        assert_eq!(
            Event::AgentToolEnd {
                tool_use_id: "t1".into(),
                content: Value::Null,
                is_error: false
            }
            .type_tag(),
            "agent:tool-end"
        );
    }
}
