//! `capability:execute` job handler (spec §4.6): the one-shot,
//! non-conversational capability path. No adapter, no `SessionProcess` — a
//! single child spawned from a fixed `command_template`, streamed straight
//! to a log file, bounded by a wall-clock timeout and an output-size cap.

use crate::context::WorkerContext;
use crate::log_writer::{LineKind, LogWriter};
use crate::safety;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Forced-kill grace window after a Claude one-shot emits `{"type":"result"}`
/// on stdout, to defeat the known CLI bug where stdout never closes on its
/// own (spec §4.6).
const CLAUDE_RESULT_GRACE: Duration = Duration::from_secs(2);
/// Grace window between SIGTERM and SIGKILL once a cap (timeout or output
/// size) is exceeded.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// `capability:execute` payload. Widened past the spec's literal
/// `{executionId}` with the working directory the spawn needs — execution
/// rows don't carry one, so it travels with the job the same way
/// `session:run`'s does.
#[derive(Debug, Deserialize)]
pub struct ExecutionJob {
    pub execution_id: Uuid,
    pub working_dir: PathBuf,
}

struct LineEvent(LineKind, String);

pub async fn run(ctx: &WorkerContext, payload: Value) -> Result<()> {
    let job: ExecutionJob = serde_json::from_value(payload).context("invalid capability:execute payload")?;

    let execution = ctx
        .storage
        .get_execution(job.execution_id)
        .await?
        .context("execution not found")?;
    if execution.is_terminal() {
        info!(execution_id = %job.execution_id, "capability:execute already terminal, skipping");
        return Ok(());
    }

    let capability_id = execution.capability_id.context("execution has no capability_id")?;
    let capability = ctx
        .registry
        .get(capability_id)
        .cloned()
        .context("capability not found in registry")?;
    let template = capability
        .command_template
        .clone()
        .context("capability has no command_template")?;

    let working_dir =
        safety::validate_working_dir_with_fallback(&job.working_dir, &ctx.config.allowed_working_dirs, &ctx.storage)
            .await?;

    let raw_args: HashMap<String, Value> = execution
        .cli_flags
        .clone()
        .and_then(|v| v.as_object().cloned())
        .map(|m| m.into_iter().collect())
        .unwrap_or_default();
    safety::validate_args(&capability.arg_schema, &raw_args)?;
    let string_args: HashMap<String, String> = raw_args
        .into_iter()
        .map(|(k, v)| {
            let s = match v {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (k, s)
        })
        .collect();
    let argv = safety::build_command_args(&template, &string_args)?;
    let (program, args) = argv.split_first().context("command_template is empty")?;

    if Path::new(program).is_absolute() {
        safety::validate_binary(Path::new(program))?;
    }

    let env = safety::build_child_env(&capability.env_allowlist);
    let log_path = LogWriter::path_for(&ctx.config.log_dir, &job.execution_id.to_string());
    let mut log = LogWriter::create(log_path.clone()).await?;

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(&working_dir)
        .env_clear()
        .envs(&env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    unsafe {
        command.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let mut child = command.spawn().context("failed to spawn capability execution")?;
    let pid = child.id().map(|p| p as i32).unwrap_or(0);

    let log_path_str = log_path.to_string_lossy().into_owned();
    ctx.storage
        .mark_execution_running(job.execution_id, pid, &log_path_str, &ctx.config.worker_id)
        .await?;

    let (lines_tx, mut lines_rx) = mpsc::unbounded_channel();
    spawn_reader(child.stdout.take(), LineKind::Stdout, lines_tx.clone());
    spawn_reader(child.stderr.take(), LineKind::Stderr, lines_tx.clone());
    drop(lines_tx);

    let is_claude = matches!(capability.agent_kind, crate::model::AgentKind::Claude);
    let mut saw_claude_result = false;
    let mut claude_grace_deadline: Option<tokio::time::Instant> = None;
    let timeout_deadline = tokio::time::Instant::now() + Duration::from_secs(capability.timeout_sec);
    let mut outcome: Option<&'static str> = None;

    loop {
        let claude_sleep = async {
            match claude_grace_deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            status = child.wait() => {
                let status = status.ok();
                let exit_code = status.and_then(|s| s.code());
                finalize(ctx, job.execution_id, &mut log, exit_code, outcome).await?;
                return Ok(());
            }
            // Both readers' senders drop once their pipe closes, at which
            // point `recv()` starts yielding `None`; `child.wait()` above
            // remains the sole authority on the real exit code.
            ev = lines_rx.recv() => {
                if let Some(LineEvent(kind, text)) = ev {
                    if is_claude && kind == LineKind::Stdout && text.contains("\"type\":\"result\"") && !saw_claude_result {
                        saw_claude_result = true;
                        claude_grace_deadline = Some(tokio::time::Instant::now() + CLAUDE_RESULT_GRACE);
                    }
                    if let Err(e) = log.write_line(kind, &text).await {
                        warn!(err = %e, "log write failed");
                    }
                    let counts = log.counts();
                    let _ = ctx.storage.update_execution_counts(job.execution_id, counts.bytes as i64, counts.lines as i64).await;
                    if counts.bytes >= capability.max_output_bytes && outcome.is_none() {
                        outcome = Some("failed");
                        warn!(execution_id = %job.execution_id, "output cap exceeded, terminating");
                        crate::adapter::kill_process_group(pid, libc::SIGTERM);
                    }
                }
            }
            _ = tokio::time::sleep_until(timeout_deadline) => {
                if outcome.is_none() {
                    outcome = Some("timed_out");
                    warn!(execution_id = %job.execution_id, "timeout exceeded, terminating");
                    crate::adapter::kill_process_group(pid, libc::SIGTERM);
                    tokio::time::sleep(KILL_GRACE).await;
                    crate::adapter::kill_process_group(pid, libc::SIGKILL);
                }
            }
            _ = claude_sleep => {
                info!(execution_id = %job.execution_id, "claude result-grace elapsed, forcing exit");
                crate::adapter::kill_process_group(pid, libc::SIGKILL);
                claude_grace_deadline = None;
            }
        }
    }
}

fn spawn_reader<R>(pipe: Option<R>, kind: LineKind, tx: mpsc::UnboundedSender<LineEvent>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let Some(pipe) = pipe else {
        return;
    };
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(LineEvent(kind, line)).is_err() {
                return;
            }
        }
    });
}

async fn finalize(
    ctx: &WorkerContext,
    execution_id: Uuid,
    log: &mut LogWriter,
    exit_code: Option<i32>,
    capped_outcome: Option<&'static str>,
) -> Result<()> {
    let _ = log.close().await;
    let status = classify_status(exit_code, capped_outcome);
    if !ctx
        .storage
        .finalize_execution_if_running(execution_id, status, exit_code)
        .await?
    {
        warn!(execution_id = %execution_id, "finalize_execution_if_running found execution already out of 'running'");
    }
    Ok(())
}

/// `capped_outcome` wins when a timeout or output-size cap fired before the
/// child exited on its own; otherwise the exit code alone decides.
fn classify_status(exit_code: Option<i32>, capped_outcome: Option<&'static str>) -> &'static str {
    match capped_outcome {
        Some(s) => s,
        None => match exit_code {
            Some(0) => "succeeded",
            Some(_) => "failed",
            None => "timed_out",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_exit_succeeds() {
        assert_eq!(classify_status(Some(0), None), "succeeded");
    }

    #[test]
    fn nonzero_exit_fails() {
        assert_eq!(classify_status(Some(1), None), "failed");
    }

    #[test]
    fn missing_exit_code_times_out() {
        assert_eq!(classify_status(None, None), "timed_out");
    }

    #[test]
    fn capped_outcome_overrides_exit_code() {
        assert_eq!(classify_status(Some(0), Some("failed")), "failed");
    }

    #[test]
    fn job_payload_deserializes() {
        let payload = serde_json::json!({
            "execution_id": Uuid::nil(),
            "working_dir": "/tmp",
        });
        let job: ExecutionJob = serde_json::from_value(payload).unwrap();
        assert_eq!(job.working_dir, PathBuf::from("/tmp"));
    }
}
