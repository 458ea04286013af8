use agendo::config::WorkerConfig;
use agendo::context::WorkerContext;
use agendo::heartbeat::{self, ActiveJobCounter};
use agendo::notify::NotifyBus;
use agendo::queue::{Queue, QUEUE_AGENT_ANALYZE, QUEUE_CAPABILITY_EXECUTE, QUEUE_SESSION_RUN};
use agendo::registry::CapabilityRegistry;
use agendo::runner::{execution_runner, session_runner};
use agendo::storage::Storage;
use anyhow::{Context as _, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(
    name = "agendo-worker",
    about = "Agendo worker — claims session:run/capability:execute/agent:analyze jobs and drives agent CLIs",
    version
)]
struct Args {
    /// Worker identity used for heartbeats and job claims.
    #[arg(long, env = "WORKER_ID")]
    worker_id: Option<String>,

    /// Directory for the worker's own config.toml and logs.
    #[arg(long, env = "LOG_DIR")]
    log_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "WORKER_LOG")]
    log: Option<String>,

    /// Maximum jobs this worker will run concurrently.
    #[arg(long, env = "WORKER_MAX_CONCURRENT_JOBS")]
    max_concurrent_jobs: Option<usize>,

    /// Postgres connection string.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Run pre-flight checks and exit (no job processing).
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match WorkerConfig::new(
        args.worker_id,
        args.log_dir,
        args.log,
        args.max_concurrent_jobs,
        args.database_url,
    ) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("FATAL: invalid worker configuration: {e:#}");
            std::process::exit(1);
        }
    };

    let _log_guard = setup_logging(&config.log_level, &config.log_dir);

    if let Err(e) = preflight(&config).await {
        error!(err = %e, "pre-flight check failed");
        std::process::exit(1);
    }
    if args.check {
        info!("pre-flight checks passed");
        return Ok(());
    }

    match run_worker(config).await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!(err = %e, "worker crashed");
            std::process::exit(1);
        }
    }
}

/// Init the tracing subscriber. Mirrors the daily-rolling-file + stdout
/// layering pattern the rest of this codebase's tooling uses, scoped to
/// `{log_dir}/worker.log`.
fn setup_logging(log_level: &str, log_dir: &std::path::Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!(
            "warn: could not create log directory '{}': {e} — falling back to stdout",
            log_dir.display()
        );
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(log_dir, "worker.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(log_level))
        .with(tracing_subscriber::fmt::layer().compact())
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
        .init();

    Some(guard)
}

/// Disk space + zombie reconciliation (spec §6.5 "pre-flight (disk,
/// zombies)"). Disk: the log directory must be writable. Zombies: any
/// session/execution left running by a crashed prior worker is reconciled
/// via `recover_stale_sessions` before this worker claims new jobs.
async fn preflight(config: &WorkerConfig) -> Result<()> {
    let probe = config.log_dir.join(".preflight");
    tokio::fs::write(&probe, b"ok")
        .await
        .with_context(|| format!("log directory '{}' is not writable", config.log_dir.display()))?;
    let _ = tokio::fs::remove_file(&probe).await;

    let storage = Storage::new(&config.database_url).await?;
    let recovered = storage.recover_stale_sessions().await.unwrap_or(0);
    if recovered > 0 {
        info!(count = recovered, "reconciled stale sessions from a previous worker");
    }
    Ok(())
}

async fn run_worker(config: WorkerConfig) -> Result<()> {
    info!(
        worker_id = %config.worker_id,
        max_concurrent_jobs = config.max_concurrent_jobs,
        "agendo worker starting"
    );

    for binary in ["claude", "codex", "gemini"] {
        let available = std::process::Command::new(binary)
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .is_ok();
        if available {
            info!(binary = %binary, "agent CLI found");
        } else {
            warn!(binary = %binary, "agent CLI not found on PATH — capabilities using it will fail");
        }
    }

    let storage = Storage::new(&config.database_url).await?;
    let notify = NotifyBus::new(storage.pool());
    let queue = Queue::new(storage.pool());
    let registry = CapabilityRegistry::load_from_toml(&config.log_dir.join("capabilities.toml"))?;

    let ctx = WorkerContext {
        storage: storage.clone(),
        notify,
        queue: queue.clone(),
        registry,
        config: Arc::new(config.clone()),
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let active = ActiveJobCounter::new();

    let heartbeat_task = tokio::spawn(heartbeat::run_heartbeat(
        storage.clone(),
        config.worker_id.clone(),
        config.max_concurrent_jobs as i32,
        active.clone(),
        config.heartbeat_interval,
        shutdown_rx.clone(),
    ));
    let reaper_task = tokio::spawn(heartbeat::run_stale_reaper(
        storage.clone(),
        config.stale_job_threshold,
        config.heartbeat_interval,
        shutdown_rx.clone(),
    ));
    let pruner_task = tokio::spawn(heartbeat::run_session_pruner(
        storage.clone(),
        config.session_retention_days,
        shutdown_rx.clone(),
    ));

    let pollers = vec![
        tokio::spawn(poll_queue(
            ctx.clone(),
            QUEUE_SESSION_RUN,
            active.clone(),
            config.max_concurrent_jobs,
            shutdown_rx.clone(),
            |ctx, payload| async move { session_runner::run(&ctx, payload).await },
        )),
        tokio::spawn(poll_queue(
            ctx.clone(),
            QUEUE_CAPABILITY_EXECUTE,
            active.clone(),
            config.max_concurrent_jobs,
            shutdown_rx.clone(),
            |ctx, payload| async move { execution_runner::run(&ctx, payload).await },
        )),
        tokio::spawn(poll_queue(
            ctx.clone(),
            QUEUE_AGENT_ANALYZE,
            active.clone(),
            config.max_concurrent_jobs,
            shutdown_rx.clone(),
            // `agent:analyze` (binary capability suggestion) is collaborator
            // surface, not this core's concern (SPEC_FULL.md Non-goals) —
            // claimed and completed so it never wedges the queue.
            |_ctx, _payload| async move { Ok(()) },
        )),
    ];

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining in-flight jobs");
    let _ = shutdown_tx.send(true);

    let drain = tokio::time::timeout(Duration::from_secs(25), async {
        for task in pollers {
            let _ = task.await;
        }
    });
    if drain.await.is_err() {
        warn!("jobs still in flight after 25s drain window, exiting anyway");
    }
    let _ = heartbeat_task.await;
    let _ = reaper_task.await;
    let _ = pruner_task.await;

    info!("agendo worker exited cleanly");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// One polling loop per named queue (spec §6.1): claim, run the handler,
/// then mark the job `done` or `failed` based solely on whether the
/// handler returned `Ok`/`Err` (spec §7 "job-level fatal errors bubble out
/// of the handler and let the queue mark the job failed"). Outcome on the
/// session/execution row itself is a separate, finer-grained concern the
/// handler already owns.
///
/// `handler` takes the context by value (cheap — every field is an Arc or
/// pool clone) rather than by reference, so the per-job future it returns
/// can be `'static` and handed straight to `tokio::spawn`.
async fn poll_queue<H, F>(
    ctx: WorkerContext,
    queue_name: &'static str,
    active: ActiveJobCounter,
    max_concurrent_jobs: usize,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
    handler: H,
) where
    H: Fn(WorkerContext, serde_json::Value) -> F + Send + Sync + 'static,
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if *shutdown.borrow() {
                    break;
                }
                if active.get() as usize >= max_concurrent_jobs {
                    continue;
                }
                match ctx.queue.claim_next(queue_name, &ctx.config.worker_id).await {
                    Ok(Some(job)) => {
                        active.inc();
                        let ctx = ctx.clone();
                        let active = active.clone();
                        let job_fut = handler(ctx.clone(), job.payload);
                        tokio::spawn(async move {
                            let result = job_fut.await;
                            // Spec §7: a fatal handler error bubbles out here and the
                            // queue marks the job failed — outcome tracking lives on
                            // the execution row, not the queue's own bookkeeping.
                            if let Err(e) = result {
                                error!(queue = queue_name, job_id = job.id, err = %e, "job handler failed");
                                if let Err(e) = ctx.queue.fail(job.id).await {
                                    warn!(queue = queue_name, job_id = job.id, err = %e, "failed to mark job failed");
                                }
                            } else if let Err(e) = ctx.queue.complete(job.id).await {
                                warn!(queue = queue_name, job_id = job.id, err = %e, "failed to mark job complete");
                            }
                            active.dec();
                        });
                    }
                    Ok(None) => {}
                    Err(e) => warn!(queue = queue_name, err = %e, "job claim failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
