use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

mod config;
mod functions;
mod jobs;
mod pipeline;
mod schema;
mod services;

use config::{AppConfig, background_runner};
use functions::AppState;
use functions::onboarding::{OnboardInput, onboard};
use functions::sweeper::{Sweeper, SyncSchedule};
use pipeline::{
    JobLogger, Pipeline, PipelineSettings, ShopifyConnector, resolve_stores_from_env,
};
use schema::{Component, JobStatus, StoreConfig};
use services::{BigQuerySink, ShopifyApi, ShopifyClient, TableSink, token_source_from_env};

#[derive(Debug, Parser)]
#[command(
    name = "shopload",
    about = "Shopify to BigQuery loads with job tracking",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// HTTP API, dashboard and sweeper.
    Serve {
        #[arg(long, env = "PORT", help = "Port to listen on")]
        port: Option<u16>,
    },
    /// Run the historical load for the configured stores.
    Pipeline,
    /// Connect a store and optionally start its first load.
    Onboard {
        #[arg(long, help = "Store URL, e.g. example.myshopify.com")]
        merchant: String,
        #[arg(long, env = "SHOPIFY_ACCESS_TOKEN", hide_env_values = true)]
        token: String,
        #[arg(long, help = "BigQuery dataset name")]
        dataset: String,
        #[arg(long, env = "GCP_PROJECT_ID")]
        project: Option<String>,
        #[arg(long = "start-date", help = "Backfill start date (YYYY-MM-DD)")]
        start_date: Option<NaiveDate>,
        #[arg(long = "no-initial-run", help = "Only save the store, do not load")]
        no_initial_run: bool,
    },
    /// Fail jobs that have been pending for too long.
    CleanStuck {
        #[arg(long, env = "STUCK_JOB_HOURS", default_value_t = 24)]
        hours: i64,
    },
    /// Print recent jobs.
    Jobs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

/// Plain-text subscriber for pipeline mode; a parent runner stores whatever
/// lands on stderr, so no colour codes.
fn pipeline_subscriber<W>(writer: W) -> impl tracing::Subscriber + Send + Sync
where
    W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(writer)
        .with_ansi(false)
        .finish()
}

fn init_tracing(to_stderr: bool) {
    if to_stderr {
        if let Err(e) = tracing::subscriber::set_global_default(pipeline_subscriber(std::io::stderr)) {
            eprintln!("failed to install tracing subscriber: {e}");
        }
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    }
}

fn is_pipeline_container() -> bool {
    std::env::var(jobs::runner::ENV_PIPELINE_TYPE).is_ok_and(|v| v == "historical")
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::from_env();

    let command = match cli.command {
        Some(command) => command,
        None if is_pipeline_container() => Command::Pipeline,
        None => Command::Serve { port: None },
    };

    // stdout carries the `[LEVEL]` lines a parent runner captures
    init_tracing(matches!(command, Command::Pipeline));

    match command {
        Command::Serve { port } => serve(config, port).await,
        Command::Pipeline => {
            let code = run_pipeline(&config).await;
            std::process::exit(code);
        }
        Command::Onboard {
            merchant,
            token,
            dataset,
            project,
            start_date,
            no_initial_run,
        } => {
            let input = OnboardInput {
                merchant,
                token,
                dataset,
                gcp_project_id: project,
                backfill_start_date: start_date,
                initial_run: !no_initial_run,
            };
            onboard_cli(config, input).await
        }
        Command::CleanStuck { hours } => {
            let backends = config.backends().await?;
            let (cleaned, total) = backends.manager.force_clean_stuck_jobs(hours).await?;
            println!("Cleaned {cleaned} of {total} stuck jobs");
            Ok(())
        }
        Command::Jobs { limit } => {
            let backends = config.backends().await?;
            for job in backends.manager.get_recent_jobs(limit).await? {
                println!(
                    "{}  {:<10} {:<32} {:<16} records={} errors={}",
                    job.job_id,
                    job.status,
                    job.store_url,
                    job.started_at.format("%Y-%m-%d %H:%M"),
                    job.records_processed.unwrap_or(0),
                    job.error_count,
                );
            }
            Ok(())
        }
    }
}

async fn app_state(config: &AppConfig) -> Result<AppState> {
    let backends = config.backends().await?;
    let runner = background_runner(backends.manager)?;
    let sink: Arc<dyn TableSink> = Arc::new(BigQuerySink::new(token_source_from_env()?)?);
    Ok(AppState {
        runner,
        stores: backends.stores,
        sink,
        default_project: config.gcp_project_id.clone(),
        stuck_job_hours: config.stuck_job_hours,
    })
}

fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
        }
        tx.send(true).ok();
    });
    rx
}

async fn serve(config: AppConfig, port: Option<u16>) -> Result<()> {
    let state = app_state(&config).await?;
    let shutdown = shutdown_channel();

    let schedule = match &config.sync_schedule {
        Some(expr) => Some(SyncSchedule::parse(expr, &config.sync_timezone)?),
        None => None,
    };
    let sweeper = Sweeper::new(
        state.runner.clone(),
        state.stores.clone(),
        config.stuck_job_hours,
        config.sweep_interval,
        schedule,
    );
    tokio::spawn(sweeper.run(shutdown.clone()));

    let port = port.unwrap_or(config.port);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "shopload listening");

    let mut stop = shutdown;
    axum::serve(listener, functions::router(state))
        .with_graceful_shutdown(async move {
            stop.changed().await.ok();
        })
        .await?;
    Ok(())
}

async fn onboard_cli(config: AppConfig, input: OnboardInput) -> Result<()> {
    let state = app_state(&config).await?;
    let done = onboard(&state, input, "cli").await?;
    println!("{}", serde_json::to_string_pretty(&done)?);

    if let Some(job_id) = done.job_id {
        let registry = state.manager().registry().clone();
        while registry.contains(&job_id) {
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        let status = state.manager().current_status(&job_id).await?;
        println!(
            "Job {job_id} finished with status {}",
            status.map(|s| s.to_string()).unwrap_or_else(|| "unknown".to_string())
        );
    }
    Ok(())
}

/// Pipeline entrypoint. Never fails: every problem ends up in the exit code
/// and, when a job id is set, in the job's status.
async fn run_pipeline(config: &AppConfig) -> i32 {
    let backends = match &config.database_url {
        Some(_) => match config.backends().await {
            Ok(backends) => Some(backends),
            Err(e) => {
                tracing::error!(error = %e, "pipeline: job store unavailable, continuing without it");
                None
            }
        },
        None => None,
    };
    let manager = backends.as_ref().map(|b| b.manager.clone());
    let repository = backends.as_ref().map(|b| b.stores.clone());
    let logger = JobLogger::from_env(manager);

    let stores = match resolve_stores_from_env(repository.as_deref()).await {
        Ok(stores) => stores,
        Err(e) => {
            let message = format!("Failed to load store configuration: {e:#}");
            logger.error(&message, None, Component::Main).await;
            logger
                .update_job_status(JobStatus::Failed, Some(message), None)
                .await;
            return 1;
        }
    };

    let sink: Arc<dyn TableSink> = match token_source_from_env().and_then(BigQuerySink::new) {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            let message = format!("Failed to create BigQuery client: {e:#}");
            logger.error(&message, None, Component::Main).await;
            logger
                .update_job_status(JobStatus::Failed, Some(message), None)
                .await;
            return 1;
        }
    };

    let connect: ShopifyConnector = Box::new(|store: &StoreConfig| {
        let client = ShopifyClient::new(&store.merchant, &store.token)?;
        Ok(Arc::new(client) as Arc<dyn ShopifyApi>)
    });

    logger
        .info(
            &format!("Starting historical pipeline for {} stores", stores.len()),
            None,
            Component::Main,
        )
        .await;
    let pipeline = Pipeline::new(logger, sink, connect, PipelineSettings::from_env());
    pipeline.run(stores).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn pipeline_tracing_has_no_escape_codes() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = pipeline_subscriber(move || writer.clone());
        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(store = "a.myshopify.com", "upload failed");
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("upload failed"));
        assert!(!output.contains('\u{1b}'));
    }

    #[test]
    fn cli_parses_clean_stuck_hours() {
        let cli = Cli::try_parse_from(["shopload", "clean-stuck", "--hours", "6"]).unwrap();
        assert!(matches!(cli.command, Some(Command::CleanStuck { hours: 6 })));
    }
}
