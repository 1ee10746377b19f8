//! # pipewatch
//!
//! Operator CLI for pipeline runs: list, create, start and retry runs over
//! REST, or follow a run (stages, live logs, job progress) over the push
//! channel until it settles.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tracing::{info, warn};

use pipewatch::auth::TokenSource;
use pipewatch::model::CreateRunRequest;
use pipewatch::{
    ClientError, Config, HubError, JobTracker, NotificationKind, PipelineClient,
    RunId, RunsApi, Session, StageStatus, SyncError, ViewPhase, ViewSnapshot,
};

/// Live operator view of multi-stage pipeline runs.
#[derive(Parser)]
#[command(name = "pipewatch", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List pipeline runs.
    Runs {
        /// Only runs of this concept.
        #[arg(long)]
        concept_id: Option<String>,
    },
    /// Create a run for a concept.
    Create {
        #[arg(long)]
        concept_id: String,
        /// Start the run right away.
        #[arg(long)]
        start: bool,
    },
    /// Start a pending run.
    Start { run_id: String },
    /// Retry a failed stage of a run.
    Retry { run_id: String, stage_type: String },
    /// Follow a run until it settles (or Ctrl-C).
    Watch { run_id: String },
    /// Follow background jobs and notifications until Ctrl-C.
    Jobs,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Hub(#[from] HubError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("pipewatch: {e}");
            std::process::exit(2);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli.command, &config).await {
        eprintln!("pipewatch: {e}");
        std::process::exit(1);
    }
}

async fn run(command: Commands, config: &Config) -> Result<(), CliError> {
    match command {
        Commands::Runs { concept_id } => {
            let api = rest_client(config)?;
            let runs = api.list_runs(concept_id.as_deref()).await?;
            if runs.is_empty() {
                println!("no runs");
            }
            for run in runs {
                println!(
                    "{:<10} {:<10} concept={:<10} started={}",
                    run.id,
                    run.status.map_or("?", |s| s.as_str()),
                    run.concept_id.as_deref().unwrap_or("-"),
                    run.started_at.as_deref().unwrap_or("-"),
                );
            }
        }
        Commands::Create { concept_id, start } => {
            let api = rest_client(config)?;
            let run = api
                .create_run(&CreateRunRequest {
                    concept_id,
                    auto_start: start,
                })
                .await?
                .into_run();
            println!("created run {} ({})", run.id, run.status);
        }
        Commands::Start { run_id } => {
            rest_client(config)?.start_run(&RunId::from(run_id.as_str())).await?;
            println!("run {run_id} started");
        }
        Commands::Retry { run_id, stage_type } => {
            rest_client(config)?
                .retry_stage(&RunId::from(run_id.as_str()), &stage_type)
                .await?;
            println!("retry of {stage_type} requested for run {run_id}");
        }
        Commands::Watch { run_id } => watch(config, RunId::from(run_id.as_str())).await?,
        Commands::Jobs => follow_jobs(config).await?,
    }
    Ok(())
}

fn rest_client(config: &Config) -> Result<PipelineClient, ClientError> {
    PipelineClient::new(
        &config.api.base_url,
        config.api.request_timeout(),
        TokenSource::from_config(&config.auth).shared(),
    )
}

fn open_session(config: &Config) -> Result<Session, ClientError> {
    let session = Session::from_config(config)?;
    session
        .connection()
        .on_state_change(|state| eprintln!("pipewatch: hub {state}"));
    Ok(session)
}

async fn watch(config: &Config, run_id: RunId) -> Result<(), CliError> {
    let session = open_session(config)?;
    if let Err(e) = session.connect().await {
        warn!("live updates unavailable, polling only: {e}");
    }

    let view = session.run_view();
    let mut view_rev = view.subscribe();
    let mut jobs_rev = session.jobs().subscribe();
    let mut printer = Printer::default();

    if let Err(e) = view.open(run_id.clone()).await {
        eprintln!("pipewatch: {e}");
    }
    printer.render_view(&view.snapshot());

    let mut recover = tokio::time::interval(Duration::from_secs(30));
    recover.tick().await;

    loop {
        if view.phase() == ViewPhase::Settled {
            break;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            changed = view_rev.changed() => {
                if changed.is_err() {
                    break;
                }
                printer.render_view(&view.snapshot());
            }
            changed = jobs_rev.changed() => {
                if changed.is_ok() {
                    printer.render_jobs(session.jobs());
                }
            }
            _ = recover.tick() => {
                if view.phase() == ViewPhase::Stalled {
                    info!(run_id = %run_id, "retrying stalled run view");
                    if let Err(e) = view.refresh().await {
                        eprintln!("pipewatch: {e}");
                    }
                }
            }
        }
    }

    let snapshot = view.snapshot();
    printer.render_view(&snapshot);
    if let Some(run) = &snapshot.run {
        println!("run {} {}", run.id, run.status);
    }
    view.close();
    session.disconnect();
    Ok(())
}

async fn follow_jobs(config: &Config) -> Result<(), CliError> {
    let session = open_session(config)?;
    session.connect().await?;
    let mut jobs_rev = session.jobs().subscribe();
    let mut printer = Printer::default();
    println!("following jobs, Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = jobs_rev.changed() => {
                if changed.is_err() {
                    break;
                }
                printer.render_jobs(session.jobs());
            }
        }
    }
    session.disconnect();
    Ok(())
}

/// Prints what changed since the last render.
#[derive(Default)]
struct Printer {
    phase: Option<ViewPhase>,
    stages: HashMap<String, StageStatus>,
    logs_printed: usize,
    jobs: HashMap<String, (u8, String)>,
    notes_seen: HashSet<uuid::Uuid>,
}

impl Printer {
    fn render_view(&mut self, snapshot: &ViewSnapshot) {
        if self.phase != Some(snapshot.phase) {
            self.phase = Some(snapshot.phase);
            match (&snapshot.phase, &snapshot.last_error) {
                (ViewPhase::Stalled, Some(err)) => println!("-- stalled: {err}"),
                (phase, _) => println!("-- {phase:?}"),
            }
        }
        if let Some(run) = &snapshot.run {
            for stage in &run.stages {
                let previous = self.stages.insert(stage.stage_type.clone(), stage.status);
                if previous != Some(stage.status) {
                    match &stage.error {
                        Some(err) if stage.status == StageStatus::Failed => {
                            println!("[{}] {}: {err}", stage.stage_type, stage.status.label());
                        }
                        _ => println!("[{}] {}", stage.stage_type, stage.status.label()),
                    }
                }
            }
        }
        if snapshot.logs.len() < self.logs_printed {
            self.logs_printed = 0;
        }
        for line in &snapshot.logs[self.logs_printed..] {
            println!("  | {}", line.text);
        }
        self.logs_printed = snapshot.logs.len();
    }

    fn render_jobs(&mut self, jobs: &JobTracker) {
        let active = jobs.list_active_jobs();
        for job in &active {
            let current = (job.progress, job.status_text.clone());
            if self.jobs.get(&job.id) != Some(&current) {
                println!("job {:<8} {:>3}% {}", job.id, job.progress, job.status_text);
                self.jobs.insert(job.id.clone(), current);
            }
        }
        self.jobs.retain(|id, _| active.iter().any(|j| &j.id == id));

        for note in jobs.notifications().into_iter().rev() {
            if self.notes_seen.insert(note.id) {
                let marker = match note.kind {
                    NotificationKind::Success => "ok",
                    NotificationKind::Error => "error",
                    NotificationKind::Warning => "warn",
                    NotificationKind::Info => "info",
                };
                match &note.message {
                    Some(message) => println!("({marker}) {}: {message}", note.title),
                    None => println!("({marker}) {}", note.title),
                }
            }
        }
    }
}
