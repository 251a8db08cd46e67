use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use chaptersync_core::config_file;
use chaptersync_core::memory::{MemoryAssetStore, MemoryCatalog, MemoryJobStore};
use chaptersync_core::notify::{FanoutNotifier, LogNotifier, WebhookNotifier};
use chaptersync_core::{
    AssetStore, Catalog, Config, Frequency, IngestionService, JobSpec, JobStore, JobUpdate,
    Notifier, Orchestrator, ProgressEvent, ProgressFn, Resolver, SourceRegistry,
};
use chaptersync_store::{Database, FsAssetStore, SqliteCatalog, SqliteJobStore};

mod logging;
mod output;

use output::ColorMode;

/// Chapter ingestion: discover new chapters on external sources and import them
#[derive(Parser, Debug)]
#[command(name = "chaptersync", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file to use instead of the platform and .chaptersync.toml cascade
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Directory for daily-rolling log files
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Run against an in-memory copy of the stores; nothing is persisted
    #[arg(long, global = true)]
    dry_run: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Backfill schedule hours, then dispatch due jobs every hour until Ctrl+C
    Run,

    /// Run a single dispatch tick
    Tick {
        /// Tick time (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<String>,
    },

    /// Run one job immediately, regardless of its schedule
    Trigger {
        job_id: String,
    },

    /// Register the ingestion job of a work
    Register {
        /// Work id in the catalog
        #[arg(long)]
        work: String,

        /// Source locator; repeat for alternates, in preference order
        #[arg(long = "source", required = true)]
        sources: Vec<String>,

        #[arg(long, default_value = "daily")]
        frequency: Frequency,

        /// Register the job disabled
        #[arg(long)]
        disabled: bool,
    },

    /// Edit a job
    Update {
        job_id: String,

        /// Replace the source list; repeat for alternates
        #[arg(long = "source")]
        sources: Vec<String>,

        #[arg(long)]
        frequency: Option<Frequency>,

        #[arg(long, conflicts_with = "disable")]
        enable: bool,

        #[arg(long)]
        disable: bool,
    },

    /// Delete a job
    Delete {
        job_id: String,
    },

    /// List jobs
    Jobs,

    /// Add or rename a work in the catalog
    AddWork {
        id: String,
        name: String,
    },

    /// List supported source families and their hosts
    Sources,

    /// Parse a source locator and print its metadata and chapters
    Parse {
        locator: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = load_settings(&cli)?;
    let _log_guard = logging::init(cli.verbose, config.log_dir.as_deref())?;
    tracing::debug!(?config, "configuration loaded");

    let color = ColorMode(!cli.no_color && std::io::stdout().is_terminal());
    let mut out = std::io::stdout();

    // Source lookups need no persisted state.
    let stores = match cli.command {
        Command::AddWork { .. } | Command::Sources | Command::Parse { .. } => Stores::memory(),
        _ => Stores::open(&config, cli.dry_run).await?,
    };
    let app = App::build(&config, stores, progress_printer(color));
    run_command(cli.command, &config, app, color, &mut out).await
}

async fn run_command(
    command: Command,
    config: &Config,
    app: App,
    color: ColorMode,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    match command {
        Command::Run => {
            let cancel = CancellationToken::new();
            let orchestrator = Arc::new(
                Orchestrator::new(app.jobs.clone(), app.resolver.clone(), config)
                    .with_progress(app.progress.clone())
                    .with_cancel(cancel.clone()),
            );
            let assigned = orchestrator.backfill_schedule_hours().await?;
            tracing::info!(assigned, "schedule hours backfilled");

            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutting down");
                    cancel.cancel();
                }
            });
            orchestrator.run().await;
        }
        Command::Tick { at } => {
            let now = match at {
                Some(at) => DateTime::parse_from_rfc3339(&at)
                    .with_context(|| format!("invalid --at time: {at}"))?
                    .with_timezone(&Utc),
                None => Utc::now(),
            };
            let orchestrator = Orchestrator::new(app.jobs.clone(), app.resolver.clone(), config)
                .with_progress(app.progress.clone());
            let report = orchestrator.run_tick(now).await?;
            output::print_tick_report(out, &report, color)?;
        }
        Command::Trigger { job_id } => {
            let outcome = app.service.trigger_job(&job_id).await?;
            output::print_outcome(out, &outcome, color)?;
        }
        Command::Register {
            work,
            sources,
            frequency,
            disabled,
        } => {
            let mut spec = JobSpec::new(work, sources, frequency);
            spec.enabled = !disabled;
            let job = app.service.register_job(spec).await?;
            output::print_jobs(out, std::slice::from_ref(&job), color)?;
        }
        Command::Update {
            job_id,
            sources,
            frequency,
            enable,
            disable,
        } => {
            let update = JobUpdate {
                sources: (!sources.is_empty()).then_some(sources),
                frequency,
                enabled: match (enable, disable) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                },
            };
            let job = app.service.update_job(&job_id, update).await?;
            output::print_jobs(out, std::slice::from_ref(&job), color)?;
        }
        Command::Delete { job_id } => {
            app.service.delete_job(&job_id).await?;
            writeln!(out, "Job {job_id} deleted.")?;
        }
        Command::Jobs => {
            let jobs = app.service.list_jobs().await?;
            output::print_jobs(out, &jobs, color)?;
        }
        Command::AddWork { id, name } => {
            let db = Database::open(&config.database_path)?;
            db.upsert_work(&id, &name)?;
            writeln!(out, "Work {id} saved.")?;
        }
        Command::Sources => {
            output::print_sources(out, &app.service.supported_sources(), color)?;
        }
        Command::Parse { locator } => {
            let parsed = app.service.parse_source(&locator).await?;
            output::print_parsed(out, &parsed, color)?;
        }
    }
    Ok(())
}

/// Resolve configuration: defaults < config file < env vars < CLI flags.
fn load_settings(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::default();

    let file = match &cli.config {
        Some(path) => config_file::load_from_path(path)?
            .with_context(|| format!("config file not found: {}", path.display()))?,
        None => config_file::load_config()?,
    };
    file.apply(&mut config)?;

    if let Ok(path) = std::env::var("CHAPTERSYNC_DB") {
        config.database_path = PathBuf::from(path);
    }
    if let Ok(root) = std::env::var("CHAPTERSYNC_ASSET_ROOT") {
        config.asset_root = PathBuf::from(root);
    }
    if let Ok(url) = std::env::var("CHAPTERSYNC_WEBHOOK_URL") {
        config.webhook_url = Some(url).filter(|u| !u.trim().is_empty());
    }
    if let Ok(dir) = std::env::var("CHAPTERSYNC_LOG_DIR") {
        config.log_dir = Some(PathBuf::from(dir));
    }
    if let Some(n) = std::env::var("CHAPTERSYNC_MAX_CONCURRENT_JOBS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
    {
        config.max_concurrent_jobs = n.max(1);
    }

    if let Some(db) = &cli.db {
        config.database_path = db.clone();
    }
    if let Some(dir) = &cli.log_dir {
        config.log_dir = Some(dir.clone());
    }
    Ok(config)
}

/// Prints progress events to stdout as they arrive.
fn progress_printer(color: ColorMode) -> ProgressFn {
    let writer = Arc::new(Mutex::new(std::io::stdout()));
    Arc::new(move |event: ProgressEvent| {
        if let Ok(mut w) = writer.lock() {
            let _ = output::print_progress(&mut *w, &event, color);
            let _ = w.flush();
        }
    })
}

struct Stores {
    catalog: Arc<dyn Catalog>,
    jobs: Arc<dyn JobStore>,
    assets: Arc<dyn AssetStore>,
}

impl Stores {
    fn memory() -> Self {
        Self {
            catalog: Arc::new(MemoryCatalog::new()),
            jobs: Arc::new(MemoryJobStore::new()),
            assets: Arc::new(MemoryAssetStore::new()),
        }
    }

    /// SQLite and the filesystem, or with `dry_run` an in-memory copy of
    /// the database contents.
    async fn open(config: &Config, dry_run: bool) -> anyhow::Result<Self> {
        let db = Database::open(&config.database_path).with_context(|| {
            format!("failed to open database {}", config.database_path.display())
        })?;
        let catalog = SqliteCatalog::new(db.clone());
        let jobs = SqliteJobStore::new(db.clone());
        if !dry_run {
            return Ok(Self {
                catalog: Arc::new(catalog),
                jobs: Arc::new(jobs),
                assets: Arc::new(FsAssetStore::new(config.asset_root.clone())),
            });
        }

        let memory_catalog = MemoryCatalog::new();
        for work in db.list_works()? {
            memory_catalog.add_work(&work.id, &work.name);
            for chapter in catalog.list_chapters(&work.id).await? {
                memory_catalog.seed_chapter(&work.id, chapter.identifier);
            }
        }
        let memory_jobs = MemoryJobStore::new();
        for job in jobs.list_jobs().await? {
            memory_jobs.insert(job);
        }
        tracing::info!("dry run: changes stay in memory");
        Ok(Self {
            catalog: Arc::new(memory_catalog),
            jobs: Arc::new(memory_jobs),
            assets: Arc::new(MemoryAssetStore::new()),
        })
    }
}

struct App {
    jobs: Arc<dyn JobStore>,
    resolver: Arc<Resolver>,
    service: IngestionService,
    progress: ProgressFn,
}

impl App {
    fn build(config: &Config, stores: Stores, progress: ProgressFn) -> Self {
        let resolver = Arc::new(Resolver::new(
            config,
            SourceRegistry::from_config(config),
            stores.catalog.clone(),
            stores.jobs.clone(),
            stores.assets,
            build_notifier(config),
        ));
        let service = IngestionService::new(stores.jobs.clone(), stores.catalog, resolver.clone())
            .with_progress(progress.clone());
        Self {
            jobs: stores.jobs,
            resolver,
            service,
            progress,
        }
    }
}

fn build_notifier(config: &Config) -> Arc<dyn Notifier> {
    let log: Arc<dyn Notifier> = Arc::new(LogNotifier);
    match &config.webhook_url {
        Some(url) => {
            let webhook =
                WebhookNotifier::new(config.build_client(), url.clone(), config.http_timeout());
            Arc::new(FanoutNotifier::new(vec![log, Arc::new(webhook)]))
        }
        None => log,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_requires_a_source() {
        assert!(Cli::try_parse_from(["chaptersync", "register", "--work", "w1"]).is_err());
        let cli = Cli::try_parse_from([
            "chaptersync",
            "register",
            "--work",
            "w1",
            "--source",
            "https://a.test/x",
            "--source",
            "https://b.test/y",
            "--frequency",
            "weekly",
        ])
        .unwrap();
        match cli.command {
            Command::Register {
                sources, frequency, ..
            } => {
                assert_eq!(sources.len(), 2);
                assert_eq!(frequency, Frequency::Weekly);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn enable_and_disable_conflict() {
        assert!(
            Cli::try_parse_from(["chaptersync", "update", "j1", "--enable", "--disable"]).is_err()
        );
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from(["chaptersync", "jobs", "--dry-run", "-vv"]).unwrap();
        assert!(cli.dry_run);
        assert_eq!(cli.verbose, 2);
    }
}
