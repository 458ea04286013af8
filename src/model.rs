//! Domain types shared across the session execution core (spec §3, GLOSSARY).
//! These are in-memory views; durable storage lives in `crate::storage`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Claude,
    Codex,
    Gemini,
}

impl AgentKind {
    pub fn binary_name(self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
            AgentKind::Gemini => "gemini",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
    DontAsk,
}

impl PermissionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::BypassPermissions => "bypassPermissions",
            PermissionMode::Plan => "plan",
            PermissionMode::DontAsk => "dontAsk",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "default" => PermissionMode::Default,
            "acceptEdits" => PermissionMode::AcceptEdits,
            "bypassPermissions" => PermissionMode::BypassPermissions,
            "plan" => PermissionMode::Plan,
            "dontAsk" => PermissionMode::DontAsk,
            _ => return None,
        })
    }
}

/// How a capability is invoked: a free-form conversational prompt (session
/// path) or a fixed command template (one-shot execution runner path).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionMode {
    Prompt,
    Template,
}

/// Configuration record on an agent declaring either a template command or a
/// prompt mode (GLOSSARY "Capability").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub agent_kind: AgentKind,
    pub interaction_mode: InteractionMode,
    pub timeout_sec: u64,
    pub max_output_bytes: u64,
    pub idle_timeout_sec: Option<u64>,
    /// Argv template for `InteractionMode::Template`; `{{name}}` tokens are
    /// substituted by `safety::build_command_args`.
    pub command_template: Option<Vec<String>>,
    pub prompt_template: Option<String>,
    pub arg_schema: Vec<crate::safety::ArgSpec>,
    pub danger_level: String,
    pub env_allowlist: Vec<String>,
    /// Per-capability credential directory override (multi-account rotation
    /// hint, SPEC_FULL.md supplemented feature #1) — threaded through to
    /// `SpawnOptions::credential_dir` for adapters that support it.
    pub credential_dir: Option<std::path::PathBuf>,
}

impl Default for Capability {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            agent_kind: AgentKind::Claude,
            interaction_mode: InteractionMode::Prompt,
            timeout_sec: 300,
            max_output_bytes: 10 * 1024 * 1024,
            idle_timeout_sec: None,
            command_template: None,
            prompt_template: None,
            arg_schema: Vec::new(),
            danger_level: "medium".to_string(),
            env_allowlist: Vec::new(),
            credential_dir: None,
        }
    }
}

/// Arguments resolved for one spawn/resume call: working directory, prompt
/// text and any template arguments, already validated by the safety gate.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub working_dir: std::path::PathBuf,
    pub permission_mode: PermissionMode,
    pub model: Option<String>,
    pub env: HashMap<String, String>,
    /// Optional per-turn credential directory override (supplemented
    /// feature — multi-account rotation hint, SPEC_FULL.md).
    pub credential_dir: Option<std::path::PathBuf>,
}
