//! `session:run` job handler (spec §4.5). Resolves a session to its
//! capability, runs the safety gate, instantiates the adapter and drives a
//! `SessionProcess` to completion.

use crate::adapter;
use crate::context::WorkerContext;
use crate::model::{InteractionMode, PermissionMode, SpawnOptions};
use crate::safety;
use crate::session_process::SessionProcess;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use tracing::{info, warn};
use uuid::Uuid;

/// `session:run` payload. The spec's literal `{sessionId, resumeRef?}` is
/// widened with the two fields the runner needs that a session row doesn't
/// carry itself: which execution row to finalize against, and the working
/// directory to validate and spawn into (sessions have no stored cwd — it
/// travels with the job, same as the teacher's `ClaudeRunner::run` takes a
/// `repo_path` argument rather than reading one off the session).
#[derive(Debug, Deserialize)]
pub struct SessionRunJob {
    pub session_id: Uuid,
    pub execution_id: Uuid,
    pub resume_ref: Option<String>,
    pub working_dir: PathBuf,
    /// Dotted-path context for `safety::interpolate_prompt` when the
    /// capability supplies a `prompt_template` rather than a one-off prompt
    /// override on the execution row.
    #[serde(default)]
    pub prompt_context: Value,
}

pub async fn run(ctx: &WorkerContext, payload: Value) -> Result<()> {
    let job: SessionRunJob = serde_json::from_value(payload).context("invalid session:run payload")?;

    // Duplicate-delivery guard: the queue is at-least-once, a job already
    // finalized by a previous delivery is a no-op.
    if let Some(execution) = ctx.storage.get_execution(job.execution_id).await? {
        if execution.is_terminal() {
            info!(execution_id = %job.execution_id, "session:run already terminal, skipping");
            return Ok(());
        }
    }

    let session = ctx
        .storage
        .get_session(job.session_id)
        .await?
        .context("session not found")?;

    let capability = ctx
        .registry
        .get(session.capability_id)
        .cloned()
        .context("capability not found in registry")?;

    if !matches!(capability.interaction_mode, InteractionMode::Prompt) {
        anyhow::bail!("session:run received a template-mode capability");
    }

    let working_dir =
        safety::validate_working_dir_with_fallback(&job.working_dir, &ctx.config.allowed_working_dirs, &ctx.storage)
            .await?;

    let execution = ctx
        .storage
        .get_execution(job.execution_id)
        .await?
        .context("execution not found")?;

    let prompt = execution
        .prompt_override
        .clone()
        .or_else(|| {
            capability
                .prompt_template
                .as_deref()
                .map(|t| safety::interpolate_prompt(t, &job.prompt_context))
        })
        .context("no prompt resolved: execution has no prompt_override and capability has no prompt_template")?;

    let permission_mode = PermissionMode::parse(&session.permission_mode).unwrap_or(PermissionMode::Default);
    let env = safety::build_child_env(&capability.env_allowlist);
    let opts = SpawnOptions {
        working_dir,
        permission_mode,
        model: session.model.clone(),
        env,
        credential_dir: capability.credential_dir.clone(),
    };

    let resume_ref = job.resume_ref.clone().or_else(|| session.session_ref.clone());
    let adapter_handle = adapter::build(capability.agent_kind);

    let process = SessionProcess::start(
        ctx.storage.clone(),
        ctx.notify.clone(),
        adapter_handle,
        job.session_id,
        capability.idle_timeout_sec,
        &prompt,
        resume_ref,
        opts,
    )
    .await?;

    let log_path = format!("session:{}", job.session_id);
    ctx.storage
        .mark_execution_running(
            job.execution_id,
            process.pid().unwrap_or(0),
            &log_path,
            &ctx.config.worker_id,
        )
        .await?;

    let exit_code = process.wait_for_exit().await;
    let post_exit_session = ctx.storage.get_session(job.session_id).await?;
    let final_status = classify_final_status(exit_code, post_exit_session.as_ref().map(|s| s.status.as_str()));

    if !ctx
        .storage
        .finalize_execution_if_running(job.execution_id, final_status, exit_code)
        .await?
    {
        warn!(
            execution_id = %job.execution_id,
            "finalize_execution_if_running found execution already out of 'running' (cancelled concurrently?)"
        );
    }

    Ok(())
}

/// A clean interrupt (idle timeout, explicit stop) still ends the adapter
/// process without a zero exit code; the session's own post-exit status is
/// the tie-breaker (spec §4.5, design note "Idle-kill is success").
fn classify_final_status(exit_code: Option<i32>, session_status: Option<&str>) -> &'static str {
    match exit_code {
        Some(0) => "succeeded",
        _ => match session_status {
            Some("idle") | Some("awaiting_input") => "succeeded",
            _ => "failed",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_exit_is_success() {
        assert_eq!(classify_final_status(Some(0), Some("active")), "succeeded");
    }

    #[test]
    fn nonzero_exit_with_active_session_is_failure() {
        assert_eq!(classify_final_status(Some(1), Some("active")), "failed");
    }

    #[test]
    fn idle_kill_after_nonzero_exit_is_success() {
        assert_eq!(classify_final_status(None, Some("idle")), "succeeded");
    }

    #[test]
    fn awaiting_input_after_interrupt_is_success() {
        assert_eq!(classify_final_status(None, Some("awaiting_input")), "succeeded");
    }

    #[test]
    fn missing_session_row_is_failure() {
        assert_eq!(classify_final_status(None, None), "failed");
    }

    #[test]
    fn job_payload_widened_fields_deserialize() {
        let payload = serde_json::json!({
            "session_id": Uuid::nil(),
            "execution_id": Uuid::nil(),
            "working_dir": "/tmp",
        });
        let job: SessionRunJob = serde_json::from_value(payload).unwrap();
        assert!(job.resume_ref.is_none());
        assert_eq!(job.prompt_context, Value::Null);
    }
}
