//! The session process (spec §4.3): owns one adapter, multiplexes the
//! control channel and adapter signals, maintains durable state, and
//! exposes a single exit future. Grounded in the teacher's per-session
//! task loop (`session::runner::Runner` driving one `ClaudeRunner`), but
//! generalized from a plain request/response runner to a full state
//! machine with idle timers, an approval pipeline and delta coalescing —
//! this is the piece spec §9 calls "one owner per session holding private
//! state, with all external inputs funnelled into a single serialized
//! input queue".

use crate::adapter::{kill_process_group, Adapter, AdapterSignal, ApprovalDecision, Event};
use crate::model::{PermissionMode, SpawnOptions};
use crate::notify::NotifyBus;
use crate::storage::Storage;
use anyhow::Result;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Batching window for `agent:text-delta` coalescing (spec §4.3).
const DELTA_BATCH_WINDOW: Duration = Duration::from_millis(200);

/// Inputs arriving on a session's control channel (spec §4.3 multiplexer
/// table). One variant per row.
#[derive(Debug, Clone)]
pub enum ControlMessage {
    Message {
        text: String,
        image: Option<String>,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    ApprovalDecision {
        approval_id: String,
        decision: ApprovalDecision,
        updated_input: Option<Value>,
        post_approval_mode: Option<PermissionMode>,
        post_approval_compact: bool,
        clear_context_restart: bool,
    },
    Interrupt,
    SetPermissionMode {
        mode: PermissionMode,
    },
    SetModel {
        model: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LiveStatus {
    Active,
    AwaitingInput,
}

/// Handle returned to the session runner: a control-channel sender and an
/// exit future. The driving task lives entirely inside `start`.
pub struct SessionProcess {
    session_id: Uuid,
    adapter: Arc<dyn Adapter>,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    exit_rx: Mutex<Option<oneshot::Receiver<Option<i32>>>>,
}

impl SessionProcess {
    /// Spawns (or resumes) the adapter and starts the driver task. Mirrors
    /// spec §4.3's `start` transition: `— → active`.
    pub async fn start(
        storage: Storage,
        notify: NotifyBus,
        adapter: Arc<dyn Adapter>,
        session_id: Uuid,
        idle_timeout_sec: Option<u64>,
        prompt: &str,
        existing_session_ref: Option<String>,
        opts: SpawnOptions,
    ) -> Result<Arc<Self>> {
        let signals_rx = match &existing_session_ref {
            Some(session_ref) => adapter.resume(session_ref, prompt, &opts).await?,
            None => adapter.spawn(prompt, &opts).await?,
        };
        storage
            .mark_session_active(session_id, existing_session_ref.as_deref())
            .await?;

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        let driver = Driver {
            session_id,
            storage,
            notify,
            adapter: adapter.clone(),
            idle_timeout: idle_timeout_sec.map(Duration::from_secs),
            idle_deadline: None,
            delta_buffer: None,
            delta_deadline: None,
            signals_rx,
            control_rx,
            exit_tx: Some(exit_tx),
            pending_approvals: HashSet::new(),
            exit_handled: false,
            status: LiveStatus::Active,
        };
        tokio::spawn(driver.run());

        Ok(Arc::new(Self {
            session_id,
            adapter,
            control_tx,
            exit_rx: Mutex::new(Some(exit_rx)),
        }))
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn control_sender(&self) -> mpsc::UnboundedSender<ControlMessage> {
        self.control_tx.clone()
    }

    /// Best-effort pid of the adapter's current child, for execution-row
    /// bookkeeping. `None` once the adapter has exited.
    pub fn pid(&self) -> Option<i32> {
        self.adapter.pid()
    }

    /// Resolves once, with the exit code (or `None` if the adapter never
    /// reported one, e.g. a forced kill).
    pub async fn wait_for_exit(&self) -> Option<i32> {
        let rx = self.exit_rx.lock().await.take();
        match rx {
            Some(rx) => rx.await.unwrap_or(None),
            None => None,
        }
    }
}

struct Driver {
    session_id: Uuid,
    storage: Storage,
    notify: NotifyBus,
    adapter: Arc<dyn Adapter>,
    idle_timeout: Option<Duration>,
    idle_deadline: Option<Instant>,
    delta_buffer: Option<String>,
    delta_deadline: Option<Instant>,
    signals_rx: mpsc::UnboundedReceiver<AdapterSignal>,
    control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    exit_tx: Option<oneshot::Sender<Option<i32>>>,
    pending_approvals: HashSet<String>,
    exit_handled: bool,
    status: LiveStatus,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let idle_deadline = self.idle_deadline;
            let delta_deadline = self.delta_deadline;
            let idle_sleep = async {
                match idle_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };
            let delta_sleep = async {
                match delta_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                signal = self.signals_rx.recv() => {
                    match signal {
                        Some(AdapterSignal::Event(event)) => self.handle_event(event).await,
                        Some(AdapterSignal::ThinkingChanged(_)) => {}
                        Some(AdapterSignal::Exit(code)) => {
                            self.handle_exit(code).await;
                            break;
                        }
                        None => {
                            self.handle_exit(None).await;
                            break;
                        }
                    }
                }
                ctl = self.control_rx.recv() => {
                    match ctl {
                        Some(msg) => self.handle_control(msg).await,
                        None => {}
                    }
                }
                _ = idle_sleep => {
                    self.fire_idle_timeout().await;
                }
                _ = delta_sleep => {
                    self.flush_delta_buffer().await;
                }
            }

            if self.exit_handled {
                break;
            }
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::AgentTextDelta { text } => {
                let buf = self.delta_buffer.get_or_insert_with(String::new);
                buf.push_str(&text);
                if self.delta_deadline.is_none() {
                    self.delta_deadline = Some(Instant::now() + DELTA_BATCH_WINDOW);
                }
            }
            Event::AgentText { .. } => {
                // The complete message supersedes any buffered delta (spec
                // §4.3 "discarded because the subsequent agent:text carries
                // the final text").
                self.delta_buffer = None;
                self.delta_deadline = None;
                self.publish(&event).await;
            }
            Event::AgentResult { cost_usd, turns, duration_ms, .. } => {
                self.delta_buffer = None;
                self.delta_deadline = None;
                self.publish(&event).await;
                if let Err(e) = self
                    .storage
                    .mark_session_awaiting_input(
                        self.session_id,
                        cost_usd,
                        turns as i32,
                        duration_ms as i64,
                    )
                    .await
                {
                    warn!(err = %e, "failed to persist awaiting_input transition");
                }
                self.status = LiveStatus::AwaitingInput;
                self.idle_deadline = self
                    .idle_timeout
                    .map(|timeout| Instant::now() + timeout);
            }
            Event::AgentToolApproval {
                approval_id,
                tool_name,
                tool_input,
                danger_level,
            } => {
                self.pending_approvals.insert(approval_id.clone());
                let sanitized = Event::AgentToolApproval {
                    approval_id,
                    tool_name,
                    tool_input: crate::safety::sanitize_tool_input_value(&tool_input),
                    danger_level,
                };
                self.publish(&sanitized).await;
            }
            Event::AgentToolStart {
                tool_use_id,
                tool_name,
                input,
            } => {
                let sanitized = Event::AgentToolStart {
                    tool_use_id,
                    tool_name,
                    input: crate::safety::sanitize_tool_input_value(&input),
                };
                self.publish(&sanitized).await;
            }
            Event::SessionInit { ref session_ref, .. } => {
                if let Some(session_ref) = session_ref {
                    if let Err(e) = self.storage.update_session_ref(self.session_id, session_ref).await {
                        warn!(err = %e, "failed to persist session_ref from session:init");
                    }
                }
                self.publish(&event).await;
            }
            _ => self.publish(&event).await,
        }
    }

    async fn flush_delta_buffer(&mut self) {
        self.delta_deadline = None;
        let Some(text) = self.delta_buffer.take() else {
            return;
        };
        if text.is_empty() {
            return;
        }
        let event = Event::AgentTextDelta { text };
        self.publish(&event).await;
    }

    async fn fire_idle_timeout(&mut self) {
        info!(session_id = %self.session_id, "idle timer fired, interrupting");
        self.idle_deadline = None;
        if let Err(e) = self.adapter.interrupt().await {
            warn!(err = %e, "idle interrupt failed");
        }
        let grace = self.adapter.interrupt_grace();
        tokio::time::sleep(grace).await;
        if self.adapter.is_alive() {
            if let Some(pid) = self.adapter.pid() {
                kill_process_group(pid, libc::SIGTERM);
            }
        }
    }

    async fn handle_control(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::Message { text, image } => {
                if self.status == LiveStatus::AwaitingInput {
                    self.idle_deadline = None;
                    self.status = LiveStatus::Active;
                }
                if let Err(e) = self.adapter.send_message(&text, image.as_deref()).await {
                    warn!(err = %e, "adapter.send_message failed");
                }
            }
            ControlMessage::ToolResult { tool_use_id, content } => {
                if let Err(e) = self.adapter.send_tool_result(&tool_use_id, &content).await {
                    warn!(err = %e, "adapter.send_tool_result failed");
                }
            }
            ControlMessage::ApprovalDecision {
                approval_id,
                decision,
                updated_input,
                post_approval_mode,
                post_approval_compact,
                clear_context_restart,
            } => {
                if let Some(mode) = post_approval_mode {
                    if let Err(e) = self.storage.set_permission_mode(self.session_id, mode.as_str()).await {
                        warn!(err = %e, "failed to persist post-approval permission mode");
                    }
                    if let Err(e) = self.adapter.set_permission_mode(mode).await {
                        warn!(err = %e, "adapter.set_permission_mode failed");
                    }
                }
                self.pending_approvals.remove(&approval_id);
                if let Err(e) = self
                    .adapter
                    .respond_to_approval(&approval_id, decision, updated_input)
                    .await
                {
                    warn!(err = %e, "adapter.respond_to_approval failed");
                }
                if clear_context_restart {
                    let _ = self.adapter.send_message("/clear", None).await;
                } else if post_approval_compact {
                    let _ = self.adapter.send_message("/compact", None).await;
                }
            }
            ControlMessage::Interrupt => {
                if let Err(e) = self.adapter.interrupt().await {
                    warn!(err = %e, "adapter.interrupt failed");
                }
            }
            ControlMessage::SetPermissionMode { mode } => {
                if let Err(e) = self.storage.set_permission_mode(self.session_id, mode.as_str()).await {
                    warn!(err = %e, "failed to persist permission mode");
                }
                if matches!(self.status, LiveStatus::Active | LiveStatus::AwaitingInput) {
                    if let Err(e) = self.adapter.set_permission_mode(mode).await {
                        warn!(err = %e, "adapter.set_permission_mode failed");
                    }
                }
            }
            ControlMessage::SetModel { model } => {
                if let Err(e) = self.storage.set_model(self.session_id, &model).await {
                    warn!(err = %e, "failed to persist model");
                }
                if let Err(e) = self.adapter.set_model(&model).await {
                    warn!(err = %e, "adapter.set_model failed (queued for next spawn)");
                }
            }
        }
    }

    /// Single guarded exit path (spec §4.3 "a single exitHandled boolean
    /// guards double-fire across adapter retries").
    async fn handle_exit(&mut self, code: Option<i32>) {
        if self.exit_handled {
            return;
        }
        self.exit_handled = true;

        // On session end every unresolved approval auto-denies so the
        // adapter's in-flight request completes (spec §4.3).
        for approval_id in self.pending_approvals.drain() {
            let _ = self
                .adapter
                .respond_to_approval(&approval_id, ApprovalDecision::Deny, None)
                .await;
        }

        if let Err(e) = self.storage.mark_session_exited(self.session_id).await {
            warn!(err = %e, "failed to persist session exit");
        }
        if let Ok(Some(row)) = self.storage.get_session(self.session_id).await {
            let event = Event::SessionState { status: row.status };
            self.publish(&event).await;
        }

        if let Some(tx) = self.exit_tx.take() {
            let _ = tx.send(code);
        }
    }

    /// Assigns a monotonic sequence, persists (unless ephemeral), and
    /// publishes (spec §4.3 "Event publishing").
    async fn publish(&self, event: &Event) {
        let payload = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(e) => {
                warn!(err = %e, "failed to serialize event");
                return;
            }
        };
        let result = if event.is_ephemeral() {
            self.notify
                .publish_ephemeral(self.session_id, event.type_tag(), &payload)
                .await
        } else {
            self.publish_persisted(event.type_tag(), &payload).await
        };
        if let Err(e) = result {
            warn!(err = %e, "failed to publish event");
        }
    }

    async fn publish_persisted(&self, event_type: &str, payload: &Value) -> Result<()> {
        let seq = self.storage.next_event_seq(self.session_id).await?;
        let row = self
            .storage
            .insert_event(self.session_id, seq, event_type, payload)
            .await?;
        self.notify
            .publish_event(self.session_id, row.id, event_type, payload)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_message_variants_cover_spec_table() {
        // Compile-time coverage check: this match is exhaustive iff every
        // row of the spec §4.3 multiplexer table has a variant.
        fn assert_exhaustive(msg: ControlMessage) {
            match msg {
                ControlMessage::Message { .. } => {}
                ControlMessage::ToolResult { .. } => {}
                ControlMessage::ApprovalDecision { .. } => {}
                ControlMessage::Interrupt => {}
                ControlMessage::SetPermissionMode { .. } => {}
                ControlMessage::SetModel { .. } => {}
            }
        }
        assert_exhaustive(ControlMessage::Interrupt);
    }
}
