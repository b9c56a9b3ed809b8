use super::classify::{classify_component, classify_level};
use super::manager::{JobManager, StatusUpdate};
use super::registry::CancellationHandle;
use crate::schema::{Component, JobStatus, LogLevel, StoreConfig};
use anyhow::Context;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const ENV_JOB_ID: &str = "PIPELINE_JOB_ID";
pub const ENV_TARGET_STORE: &str = "TARGET_STORE";
pub const ENV_PIPELINE_TYPE: &str = "PIPELINE_TYPE";
pub const ENV_STORE_CONFIG: &str = "STORE_CONFIG_JSON";
pub const ENV_CAPTURED: &str = "PIPELINE_CAPTURED";

/// Starts a load somewhere else (a Cloud Run job execution) and reports back
/// the execution name. The remote side records its own terminal status.
#[async_trait::async_trait]
pub trait JobDelegate: Send + Sync {
    async fn launch(&self, job_id: &str, env: &[(String, String)]) -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub kill_grace: Duration,
    /// How long output may keep arriving after the process exited, for
    /// pipes held open by processes it left behind.
    pub output_drain: Duration,
}

impl RunnerConfig {
    pub fn from_env() -> Self {
        let program = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("shopload"));
        Self {
            program,
            args: vec!["pipeline".to_string()],
            timeout: Duration::from_secs(
                std::env::var("JOB_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(20 * 3600),
            ),
            kill_grace: Duration::from_secs(2),
            output_drain: Duration::from_secs(5),
        }
    }
}

enum ChildOutcome {
    Exited(ExitStatus),
    Cancelled,
    TimedOut,
}

/// Fire-and-forget execution of historical loads.
#[derive(Clone)]
pub struct BackgroundRunner {
    manager: JobManager,
    delegate: Option<Arc<dyn JobDelegate>>,
    config: RunnerConfig,
}

impl BackgroundRunner {
    pub fn new(
        manager: JobManager,
        delegate: Option<Arc<dyn JobDelegate>>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            manager,
            delegate,
            config,
        }
    }

    pub fn manager(&self) -> &JobManager {
        &self.manager
    }

    /// Spawn the load and return at once. Failures end up in the job store,
    /// never in the caller.
    pub fn run_historical_load_async(&self, store: StoreConfig, job_id: String) -> JoinHandle<()> {
        // registered before spawning so an immediate cancel is not lost
        let handle = self.manager.registry().register(&job_id);
        let runner = self.clone();
        tokio::spawn(async move {
            runner.run(store, job_id, handle).await;
        })
    }

    async fn run(&self, store: StoreConfig, job_id: String, handle: CancellationHandle) {
        if let Err(e) = self.execute(&store, &job_id, handle).await {
            tracing::error!(job_id = %job_id, error = %e, "runner: historical load failed");
            self.log(
                &job_id,
                &store,
                LogLevel::Error,
                &format!("Historical load failed: {e:#}"),
                Component::Main,
            )
            .await;
            self.settle(&job_id, &store, JobStatus::Failed, Some(format!("{e:#}")))
                .await;
        }
        self.manager.registry().remove(&job_id);
    }

    async fn execute(
        &self,
        store: &StoreConfig,
        job_id: &str,
        handle: CancellationHandle,
    ) -> anyhow::Result<()> {
        if let StatusUpdate::AlreadyTerminal(status) = self
            .manager
            .update_job_status(job_id, JobStatus::Running, None, None)
            .await?
        {
            tracing::info!(job_id, status = %status, "runner: job finished before it started");
            return Ok(());
        }

        self.log(
            job_id,
            store,
            LogLevel::Info,
            &format!("Starting historical load for {}", store.merchant),
            Component::Main,
        )
        .await;

        let env = pipeline_env(store, job_id)?;

        if let Some(delegate) = &self.delegate {
            let execution = delegate.launch(job_id, &env).await?;
            tracing::info!(job_id, execution = %execution, "runner: delegated load");
            self.log(
                job_id,
                store,
                LogLevel::Info,
                &format!("Started remote execution: {execution}"),
                Component::Main,
            )
            .await;
            return Ok(());
        }

        self.run_subprocess(store, job_id, &env, handle).await
    }

    async fn run_subprocess(
        &self,
        store: &StoreConfig,
        job_id: &str,
        env: &[(String, String)],
        handle: CancellationHandle,
    ) -> anyhow::Result<()> {
        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(ENV_CAPTURED, "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.config.program.display()))?;

        tracing::info!(job_id, pid = ?child.id(), "runner: pipeline process started");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(stderr, tx.clone())));
        }
        drop(tx);

        let deadline = tokio::time::sleep(self.config.timeout);
        tokio::pin!(deadline);
        let drain = tokio::time::sleep(self.config.output_drain);
        tokio::pin!(drain);

        let mut streams_open = true;
        let mut exited: Option<ExitStatus> = None;
        let outcome = loop {
            tokio::select! {
                line = rx.recv(), if streams_open => match line {
                    Some(line) => self.record_line(job_id, store, &line).await,
                    None => {
                        streams_open = false;
                        if let Some(status) = exited {
                            break ChildOutcome::Exited(status);
                        }
                    }
                },
                status = child.wait(), if exited.is_none() => {
                    let status = status.context("failed to wait for pipeline")?;
                    if !streams_open {
                        break ChildOutcome::Exited(status);
                    }
                    exited = Some(status);
                    drain
                        .as_mut()
                        .reset(tokio::time::Instant::now() + self.config.output_drain);
                }
                _ = &mut drain, if exited.is_some() => {
                    tracing::warn!(job_id, "runner: output still open after exit, closing it");
                    if let Some(status) = exited {
                        break ChildOutcome::Exited(status);
                    }
                }
                _ = handle.cancelled() => break ChildOutcome::Cancelled,
                _ = &mut deadline => break ChildOutcome::TimedOut,
            }
        };

        match outcome {
            ChildOutcome::Exited(status) if status.success() => {
                if self.settle(job_id, store, JobStatus::Completed, None).await {
                    self.log(
                        job_id,
                        store,
                        LogLevel::Info,
                        "Historical load completed successfully",
                        Component::Main,
                    )
                    .await;
                }
            }
            ChildOutcome::Exited(status) => {
                let code = status.code().unwrap_or(-1);
                let applied = self
                    .settle(
                        job_id,
                        store,
                        JobStatus::Failed,
                        Some(format!("Process exited with code {code}")),
                    )
                    .await;
                if applied {
                    self.log(
                        job_id,
                        store,
                        LogLevel::Error,
                        &format!("Historical load failed with exit code {code}"),
                        Component::Main,
                    )
                    .await;
                }
            }
            ChildOutcome::Cancelled => {
                tracing::info!(job_id, "runner: cancellation requested, stopping pipeline");
                terminate(&mut child, self.config.kill_grace).await;
            }
            ChildOutcome::TimedOut => {
                terminate(&mut child, self.config.kill_grace).await;
                let secs = self.config.timeout.as_secs();
                self.log(
                    job_id,
                    store,
                    LogLevel::Error,
                    &format!("Job timed out after {secs} seconds"),
                    Component::Main,
                )
                .await;
                self.settle(
                    job_id,
                    store,
                    JobStatus::Failed,
                    Some(format!("Job timed out after {secs} seconds")),
                )
                .await;
            }
        }

        for reader in readers {
            reader.abort();
        }
        Ok(())
    }

    async fn record_line(&self, job_id: &str, store: &StoreConfig, line: &str) {
        let line = line.trim_end();
        if line.trim().is_empty() {
            return;
        }
        self.log(
            job_id,
            store,
            classify_level(line),
            line,
            classify_component(line),
        )
        .await;
    }

    async fn log(
        &self,
        job_id: &str,
        store: &StoreConfig,
        level: LogLevel,
        message: &str,
        component: Component,
    ) {
        if let Err(e) = self
            .manager
            .log_message(job_id, level, message, Some(&store.merchant), Some(component))
            .await
        {
            tracing::error!(job_id, error = %e, "runner: failed to append log line");
        }
    }

    /// Record the final status unless a terminal event already exists.
    /// Returns whether this call wrote it.
    async fn settle(
        &self,
        job_id: &str,
        store: &StoreConfig,
        status: JobStatus,
        error_message: Option<String>,
    ) -> bool {
        match self
            .manager
            .update_job_status(job_id, status, error_message, None)
            .await
        {
            Ok(StatusUpdate::Applied) => true,
            Ok(StatusUpdate::AlreadyTerminal(current)) => {
                self.log(
                    job_id,
                    store,
                    LogLevel::Info,
                    &format!("Job already has terminal status: {current}"),
                    Component::Main,
                )
                .await;
                false
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "runner: failed to record final status");
                false
            }
        }
    }
}

/// Environment handed to the pipeline, locally or remotely.
pub fn pipeline_env(store: &StoreConfig, job_id: &str) -> anyhow::Result<Vec<(String, String)>> {
    Ok(vec![
        (ENV_JOB_ID.to_string(), job_id.to_string()),
        (ENV_TARGET_STORE.to_string(), store.merchant.clone()),
        (ENV_PIPELINE_TYPE.to_string(), "historical".to_string()),
        (
            ENV_STORE_CONFIG.to_string(),
            serde_json::to_string(store).context("failed to encode store config")?,
        ),
    ])
}

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "runner: error reading pipeline output");
                break;
            }
        }
    }
}

/// SIGTERM, then SIGKILL once `grace` has passed.
#[cfg(unix)]
async fn terminate(child: &mut Child, grace: Duration) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
    }
    force_kill(child).await;
}

#[cfg(not(unix))]
async fn terminate(child: &mut Child, _grace: Duration) {
    force_kill(child).await;
}

async fn force_kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "runner: failed to kill pipeline process");
    }
}
