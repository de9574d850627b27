use std::process;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{filter::LevelFilter, fmt};

use concord_app::cli::{Cli, Commands, JobsArgs, StatusArgs, SubmitArgs};
use concord_app::config::{self, AppConfig};
use concord_app::error::AppError;
use concord_app::paths::AppPaths;
use concord_app::server::{self, AppState};
use concord_app::services::arbitration::ArbitrationService;
use concord_app::services::complexity::ComplexityAnalyzer;
use concord_app::services::coordinator::{Coordinator, SubmitRequest};
use concord_app::services::executor::ParallelExecutor;
use concord_app::services::gate::ResourceGate;
use concord_app::services::jobs::{JobState, JobTracker};
use concord_app::services::orchestrator::{Orchestrator, OrchestratorConfig, Worker};
use concord_app::services::reaper;
use concord_app::services::registry::ExtractorRegistry;
use concord_app::services::webhook::WebhookDispatcher;
use concord_app::store::{LmdbQueue, LmdbStateStore};

/// Extra lease time beyond the job timeout so a live worker never loses a
/// task it is still driving.
const LEASE_GRACE: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(determine_log_level(&cli));

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("tracing subscriber already set; skipping re-initialization");
    }
}

fn determine_log_level(cli: &Cli) -> LevelFilter {
    let service = matches!(
        cli.command,
        Some(Commands::Serve(_)) | Some(Commands::Worker(_))
    );
    match (service, cli.verbose) {
        (true, 0) => LevelFilter::INFO,
        (true, 1) => LevelFilter::DEBUG,
        (true, _) => LevelFilter::TRACE,
        (false, 0) => LevelFilter::OFF,
        (false, 1) => LevelFilter::INFO,
        (false, 2) => LevelFilter::DEBUG,
        (false, _) => LevelFilter::TRACE,
    }
}

/// Everything a command needs, wired once.
struct AppContext {
    config: AppConfig,
    paths: AppPaths,
    store: Arc<LmdbStateStore>,
    queue: Arc<LmdbQueue>,
    tracker: JobTracker,
    registry: ExtractorRegistry,
    coordinator: Arc<Coordinator>,
    orchestrator: Arc<Orchestrator>,
    arbitration: Arc<ArbitrationService>,
}

fn build_context() -> Result<AppContext, AppError> {
    let config = config::load()?;
    let paths = AppPaths::new(&config.storage.path)?;
    let store = Arc::new(LmdbStateStore::open(&paths)?);
    let queue = Arc::new(LmdbQueue::with_env(store.env_handle())?);
    let tracker = JobTracker::new(store.clone());
    let registry = ExtractorRegistry::builtin(&config.extraction.extractors);

    let orchestrator = Arc::new(Orchestrator::new(
        tracker.clone(),
        store.clone(),
        registry.clone(),
        ComplexityAnalyzer::new(store.clone()),
        ResourceGate::new(config.extraction.min_free_memory_ratio),
        ParallelExecutor::new(config.extraction.executor_config()),
        WebhookDispatcher::new(
            config
                .webhook
                .to_webhook_config(config.server.public_base_url.clone()),
        ),
        paths.clone(),
        OrchestratorConfig {
            job_timeout: config.extraction.job_timeout(),
            comparator: config.extraction.comparator_config(),
            default_policy: config.extraction.merge_policy()?,
        },
    ));
    let coordinator = Arc::new(Coordinator::new(
        tracker.clone(),
        queue.clone(),
        paths.clone(),
        config.extraction.clone(),
    ));
    let arbitration = Arc::new(ArbitrationService::new(
        tracker.clone(),
        store.clone(),
        orchestrator.clone(),
    ));

    Ok(AppContext {
        config,
        paths,
        store,
        queue,
        tracker,
        registry,
        coordinator,
        orchestrator,
        arbitration,
    })
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Some(Commands::Serve(_)) => {
            let ctx = build_context()?;
            let state = AppState {
                coordinator: ctx.coordinator.clone(),
                arbitration: ctx.arbitration.clone(),
                registry: ctx.registry.clone(),
            };
            server::serve(&ctx.config.server, state).await?;
        }
        Some(Commands::Worker(_)) => {
            run_worker().await?;
        }
        Some(Commands::Submit(args)) => {
            run_submit(args).await?;
        }
        Some(Commands::Status(args)) => {
            run_status(args)?;
        }
        Some(Commands::Jobs(args)) => {
            run_jobs(args)?;
        }
        Some(Commands::Extractors(_)) => {
            let ctx = build_context()?;
            println!("{}", serde_json::to_string_pretty(&ctx.registry.all_info())?);
        }
        Some(Commands::Reap(_)) => {
            let ctx = build_context()?;
            let report = reaper::reap(
                ctx.store.as_ref(),
                &ctx.tracker,
                &ctx.paths,
                &ctx.config.retention.to_retention_config(),
            )?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        None => {
            Cli::print_help();
        }
    }
    Ok(())
}

async fn run_worker() -> Result<(), AppError> {
    let ctx = build_context()?;
    let visibility = ctx.config.extraction.job_timeout() + LEASE_GRACE;
    let worker = Worker::new(
        ctx.queue.clone(),
        ctx.orchestrator.clone(),
        Duration::from_secs(ctx.config.extraction.worker_poll_secs),
        visibility,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    worker.run(shutdown_rx).await;
    Ok(())
}

async fn run_submit(args: SubmitArgs) -> Result<(), AppError> {
    let ctx = build_context()?;
    let request = SubmitRequest {
        source_ref: args.input.display().to_string(),
        strategy: args.strategy.map(Into::into),
        force_complexity: args.force_complexity.map(Into::into),
        requested_extractors: args.extractors.clone(),
        callback_url: args.callback_url.clone(),
        ..SubmitRequest::default()
    };
    let job_id = ctx.coordinator.submit(&request)?;
    println!("{job_id}");

    if args.wait {
        // Drive the job inline rather than waiting on a worker process.
        let worker = Worker::new(
            ctx.queue.clone(),
            ctx.orchestrator.clone(),
            Duration::from_millis(200),
            ctx.config.extraction.job_timeout() + LEASE_GRACE,
        );
        while worker.poll_once().await? {}
        let status = ctx.coordinator.status(&job_id)?;
        eprintln!(
            "state={} progress={}%",
            status.state.as_ref(),
            status.progress_pct
        );
        if status.state == JobState::Completed {
            let path = ctx.paths.job_document_path(&job_id)?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

fn run_status(args: StatusArgs) -> Result<(), AppError> {
    let ctx = build_context()?;
    let status = ctx.coordinator.status(&args.job_id)?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn run_jobs(args: JobsArgs) -> Result<(), AppError> {
    let ctx = build_context()?;
    let jobs = ctx.coordinator.list(args.state)?;
    for job in &jobs {
        println!(
            "{}  {:<12}  {:>3}%  {}",
            job.job_id,
            job.state.as_ref(),
            job.progress_pct,
            job.source_path
        );
    }
    if args.state.is_none() {
        let counts = ctx.tracker.counts()?;
        if !counts.is_empty() {
            println!("{}", serde_json::to_string(&counts)?);
        }
    }
    Ok(())
}
