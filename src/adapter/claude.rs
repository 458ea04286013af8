//! Claude adapter (spec §4.2.1): persistent NDJSON over stdin/stdout. Unlike
//! the teacher's `ClaudeCodeRunner`, which spawns a fresh `claude -p <content>`
//! per turn, this process stays alive across turns — the print flag is
//! never passed, so a user message is written to stdin instead of starting
//! a new child. The teacher's PID-tracking/SIGSTOP-SIGCONT/cancelled-flag
//! shape is kept; only the one-shot-vs-persistent spawn model changes.

use super::{kill_process_group, Adapter, AdapterSignal, ApprovalDecision, Event};
use crate::model::{PermissionMode, SpawnOptions};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::fmt::Debug;
use std::os::unix::process::CommandExt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::{mpsc, Mutex},
};
use tracing::warn;

/// Slash commands written as raw terminal lines rather than wrapped in a
/// user-message JSON frame (spec §4.2.1).
const KNOWN_COMMANDS: &[&str] = &[
    "compact",
    "clear",
    "cost",
    "memory",
    "mcp",
    "permissions",
    "status",
    "doctor",
    "model",
    "review",
    "init",
    "bug",
    "help",
    "vim",
    "terminal",
    "login",
    "logout",
    "release-notes",
    "pr_comments",
    "exit",
];

pub struct ClaudeAdapter {
    /// stdin writes are serialized so text, tool results and control
    /// requests never interleave mid-line (spec §4.2.1 "Serialization").
    stdin: Mutex<Option<ChildStdin>>,
    pid: Arc<AtomicI32>,
    alive: Arc<AtomicBool>,
}

impl ClaudeAdapter {
    pub fn new() -> Self {
        Self {
            stdin: Mutex::new(None),
            pid: Arc::new(AtomicI32::new(0)),
            alive: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn spawn_internal(
        &self,
        resume_ref: Option<&str>,
        prompt: &str,
        opts: &SpawnOptions,
    ) -> Result<mpsc::UnboundedReceiver<AdapterSignal>> {
        let mut cmd = Command::new("claude");
        cmd.args([
            "--input-format",
            "stream-json",
            "--output-format",
            "stream-json",
            "--verbose",
            "--permission-mode",
            opts.permission_mode.as_str(),
        ]);
        if let Some(r) = resume_ref {
            cmd.args(["--resume", r]);
        }
        cmd.current_dir(&opts.working_dir);
        cmd.env_clear();
        cmd.envs(&opts.env);
        // Multi-account rotation hint (SPEC_FULL.md supplemented feature #1):
        // an explicit credential directory overrides Claude's default
        // `~/.claude` config lookup for this one turn.
        if let Some(dir) = &opts.credential_dir {
            cmd.env("CLAUDE_CONFIG_DIR", dir);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        // Detached, own process group — kill() below always targets the group.
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = cmd.spawn().context("failed to spawn claude")?;
        let pid = child.id().context("claude exited immediately")? as i32;
        self.pid.store(pid, Ordering::SeqCst);
        self.alive.store(true, Ordering::SeqCst);

        let stdin = child.stdin.take().context("claude stdin not piped")?;
        let stdout = child.stdout.take().context("claude stdout not piped")?;
        let stderr = child.stderr.take().context("claude stderr not piped")?;
        *self.stdin.lock().await = Some(stdin);

        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(stderr_scanner(stderr, tx.clone()));
        tokio::spawn(stdout_reader(stdout, tx.clone()));

        let alive = self.alive.clone();
        tokio::spawn(async move {
            let status = child.wait().await.ok().and_then(|s| s.code());
            alive.store(false, Ordering::SeqCst);
            let _ = tx.send(AdapterSignal::Exit(status));
        });

        self.send_message(prompt, None).await?;
        Ok(rx)
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().context("claude stdin is closed")?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

async fn stdout_reader(
    stdout: tokio::process::ChildStdout,
    tx: mpsc::UnboundedSender<AdapterSignal>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(parsed) => {
                        for signal in map_json_to_signals(&parsed) {
                            if tx.send(signal).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(err = %e, line = %line, "malformed claude frame, skipping");
                    }
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!(err = %e, "claude stdout read failed");
                return;
            }
        }
    }
}

async fn stderr_scanner(
    stderr: tokio::process::ChildStderr,
    tx: mpsc::UnboundedSender<AdapterSignal>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        // Supplemented feature (SPEC_FULL.md): surface a rate-limit signal
        // rather than silently failing the turn.
        let lower = line.to_lowercase();
        if lower.contains("rate limit") || lower.contains("usage limit") {
            let _ = tx.send(AdapterSignal::Event(Event::SystemError {
                message: format!("rate limited: {line}"),
            }));
        }
    }
}

/// Translates one parsed Claude stdout frame into zero or more adapter
/// signals (spec §4.4 parser obligations).
fn map_json_to_signals(parsed: &Value) -> Vec<AdapterSignal> {
    let mut out = Vec::new();
    let Some(frame_type) = parsed.get("type").and_then(Value::as_str) else {
        return out;
    };
    match frame_type {
        "system" => {
            if parsed.get("subtype").and_then(Value::as_str) == Some("init") {
                let session_ref = parsed
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(String::from);
                out.push(AdapterSignal::Event(Event::SessionInit {
                    session_ref,
                    slash_commands: KNOWN_COMMANDS.iter().map(|s| s.to_string()).collect(),
                    mcp_servers: Vec::new(),
                }));
            } else {
                out.push(AdapterSignal::ThinkingChanged(true));
            }
        }
        "assistant" => {
            out.push(AdapterSignal::ThinkingChanged(true));
            if let Some(blocks) = parsed
                .pointer("/message/content")
                .and_then(Value::as_array)
            {
                for block in blocks {
                    match block.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                out.push(AdapterSignal::Event(Event::AgentText {
                                    text: text.to_string(),
                                }));
                            }
                        }
                        Some("thinking") => {
                            if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                                out.push(AdapterSignal::Event(Event::AgentThinking {
                                    text: text.to_string(),
                                }));
                            }
                        }
                        Some("tool_use") => {
                            let tool_use_id = block
                                .get("id")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string();
                            let tool_name = block
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string();
                            let input = block.get("input").cloned().unwrap_or(Value::Null);
                            out.push(AdapterSignal::Event(Event::AgentToolStart {
                                tool_use_id,
                                tool_name,
                                input,
                            }));
                        }
                        _ => {}
                    }
                }
            }
        }
        "tool_result" => {
            let tool_use_id = parsed
                .get("tool_use_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let is_error = parsed
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let content = parsed.get("content").cloned().unwrap_or(Value::Null);
            out.push(AdapterSignal::Event(Event::AgentToolEnd {
                tool_use_id,
                content,
                is_error,
            }));
        }
        "result" => {
            let cost_usd = parsed.get("cost_usd").and_then(Value::as_f64).unwrap_or(0.0);
            let duration_ms = parsed
                .get("duration_ms")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            out.push(AdapterSignal::Event(Event::AgentResult {
                turns: 1,
                duration_ms,
                cost_usd,
                model_usage: parsed.get("usage").cloned().unwrap_or(Value::Null),
            }));
            out.push(AdapterSignal::ThinkingChanged(false));
        }
        "control_request" => {
            if parsed.pointer("/request/subtype").and_then(Value::as_str) == Some("can_use_tool") {
                let approval_id = parsed
                    .get("request_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let tool_name = parsed
                    .pointer("/request/tool_name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let tool_input = parsed
                    .pointer("/request/input")
                    .cloned()
                    .unwrap_or(Value::Null);
                out.push(AdapterSignal::Event(Event::AgentToolApproval {
                    approval_id,
                    tool_name,
                    tool_input,
                    danger_level: "medium".to_string(),
                }));
            }
        }
        _ => {
            warn!(frame_type, "unknown claude frame type, skipping");
        }
    }
    out
}

#[async_trait]
impl Adapter for ClaudeAdapter {
    async fn spawn(
        &self,
        prompt: &str,
        opts: &SpawnOptions,
    ) -> Result<mpsc::UnboundedReceiver<AdapterSignal>> {
        self.spawn_internal(None, prompt, opts).await
    }

    async fn resume(
        &self,
        session_ref: &str,
        prompt: &str,
        opts: &SpawnOptions,
    ) -> Result<mpsc::UnboundedReceiver<AdapterSignal>> {
        self.spawn_internal(Some(session_ref), prompt, opts).await
    }

    async fn send_message(&self, text: &str, image: Option<&str>) -> Result<()> {
        if let Some(bare) = text.strip_prefix('/') {
            let cmd_name = bare.split_whitespace().next().unwrap_or("");
            if KNOWN_COMMANDS.contains(&cmd_name) {
                return self.write_line(text).await;
            }
        }

        let content = if let Some(data_url) = image {
            let (media_type, data) = decode_data_url(data_url);
            json!([
                {"type": "text", "text": text},
                {"type": "image", "source": {"type": "base64", "media_type": media_type, "data": data}}
            ])
        } else {
            Value::String(text.to_string())
        };

        let frame = json!({
            "type": "user",
            "message": {"role": "user", "content": content},
            "parent_tool_use_id": Value::Null,
        });
        self.write_line(&frame.to_string()).await
    }

    async fn send_tool_result(&self, tool_use_id: &str, content: &str) -> Result<()> {
        let frame = json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{"type": "tool_result", "tool_use_id": tool_use_id, "content": content}],
            },
        });
        self.write_line(&frame.to_string()).await
    }

    async fn respond_to_approval(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
        updated_input: Option<Value>,
    ) -> Result<()> {
        let subtype = match decision {
            ApprovalDecision::Allow => "allow",
            ApprovalDecision::Deny => "deny",
        };
        let mut response = json!({"subtype": subtype});
        if let Some(input) = updated_input {
            response["updatedInput"] = input;
        }
        let frame = json!({
            "type": "control_response",
            "request_id": approval_id,
            "response": response,
        });
        self.write_line(&frame.to_string()).await
    }

    async fn interrupt(&self) -> Result<()> {
        let frame = json!({"type": "control_request", "request": {"subtype": "interrupt"}});
        self.write_line(&frame.to_string()).await
    }

    fn interrupt_grace(&self) -> Duration {
        Duration::from_secs(3)
    }

    async fn set_model(&self, model: &str) -> Result<()> {
        let frame = json!({"type": "control_request", "request": {"subtype": "set_model", "model": model}});
        self.write_line(&frame.to_string()).await
    }

    async fn set_permission_mode(&self, mode: PermissionMode) -> Result<()> {
        let frame = json!({
            "type": "control_request",
            "request": {"subtype": "set_permission_mode", "mode": mode.as_str()},
        });
        self.write_line(&frame.to_string()).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn pid(&self) -> Option<i32> {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid > 0 {
            Some(pid)
        } else {
            None
        }
    }
}

impl ClaudeAdapter {
    pub fn kill(&self, signal: i32) {
        kill_process_group(self.pid.load(Ordering::SeqCst), signal);
    }
}

fn decode_data_url(data_url: &str) -> (String, String) {
    // "data:image/png;base64,AAAA..." → ("image/png", "AAAA...")
    if let Some(rest) = data_url.strip_prefix("data:") {
        if let Some((meta, data)) = rest.split_once(',') {
            let media_type = meta.split(';').next().unwrap_or("image/png").to_string();
            return (media_type, data.to_string());
        }
    }
    ("image/png".to_string(), data_url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_slash_command_is_recognized() {
        assert!(KNOWN_COMMANDS.contains(&"clear"));
        assert!(!KNOWN_COMMANDS.contains(&"foobar"));
    }

    #[test]
    fn decode_data_url_splits_media_type_and_payload() {
        let (media, data) = decode_data_url("data:image/png;base64,AAAA");
        assert_eq!(media, "image/png");
        assert_eq!(data, "AAAA");
    }

    #[test]
    fn init_frame_maps_to_session_init_with_known_commands() {
        let parsed = json!({"type": "system", "subtype": "init", "session_id": "abc123"});
        let signals = map_json_to_signals(&parsed);
        assert_eq!(signals.len(), 1);
        match &signals[0] {
            AdapterSignal::Event(Event::SessionInit { session_ref, slash_commands, .. }) => {
                assert_eq!(session_ref.as_deref(), Some("abc123"));
                assert!(slash_commands.contains(&"clear".to_string()));
            }
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[test]
    fn result_frame_emits_agent_result_then_thinking_false() {
        let parsed = json!({"type": "result", "cost_usd": 0.01, "duration_ms": 1200});
        let signals = map_json_to_signals(&parsed);
        assert_eq!(signals.len(), 2);
        assert!(matches!(signals[0], AdapterSignal::Event(Event::AgentResult { .. })));
        assert!(matches!(signals[1], AdapterSignal::ThinkingChanged(false)));
    }

    #[test]
    fn can_use_tool_control_request_maps_to_tool_approval() {
        let parsed = json!({
            "type": "control_request",
            "request_id": "req-1",
            "request": {"subtype": "can_use_tool", "tool_name": "Bash", "input": {"command": "ls"}},
        });
        let signals = map_json_to_signals(&parsed);
        assert_eq!(signals.len(), 1);
        match &signals[0] {
            AdapterSignal::Event(Event::AgentToolApproval { approval_id, tool_name, .. }) => {
                assert_eq!(approval_id, "req-1");
                assert_eq!(tool_name, "Bash");
            }
            other => panic!("unexpected signal: {other:?}"),
        }
    }
}

impl Drop for ClaudeAdapter {
    fn drop(&mut self) {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid > 0 && self.alive.load(Ordering::SeqCst) {
            kill_process_group(pid, libc::SIGTERM);
        }
    }
}

impl Debug for ClaudeAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaudeAdapter")
            .field("pid", &self.pid.load(Ordering::SeqCst))
            .field("alive", &self.alive.load(Ordering::SeqCst))
            .finish()
    }
}

use std::fmt::Debug;
