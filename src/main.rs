use std::{process, sync::Arc};

use apalis::{
    layers::WorkerBuilderExt,
    prelude::{Monitor, WorkerBuilder, WorkerFactoryFn},
};
use apalis_cron::CronStream;
use apalis_sql::{Config as ApalisSqlConfig, postgres::PostgresStorage};
use eventmirror::{
    application::{
        cache::CacheStore,
        error::AppError,
        fetch::{Fetcher, RetryPolicy, UpstreamTransport},
        hydration::HydrationService,
        jobs::{
            DurableFetchQueue, FETCH_JOB_NAMESPACE, FetchJobPayload, FetchWorkerContext,
            SweepContext, process_fetch_job, process_sweep_cache_job, sweep_schedule,
        },
        maintenance::{DEFAULT_SWEEP_HOURS, MaintenanceService},
        repos::{CacheRepo, FetchJobsRepo},
        resolver::RequestResolver,
        users::UserService,
    },
    config::{self, CacheBackend, QueueBackend},
    infra::{
        db::PostgresRepositories,
        error::InfraError,
        http::{self, AppState},
        memory::MemoryCacheRepo,
        telemetry,
        upstream::{MemoryFetchPool, UpstreamClient, UpstreamCredentials},
    },
};
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::Notify,
    task::JoinHandle,
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Sweep(args) => run_sweep(settings, args).await,
        config::Command::SweepEvent(args) => run_sweep_event(settings, args).await,
        config::Command::Hydrate(args) => run_hydrate(settings, args).await,
        config::Command::AddUser(args) => run_add_user(settings, args).await,
    }
}

/// Long-lived collaborators shared by the serve and hydrate commands.
struct Services {
    db: Option<Arc<PostgresRepositories>>,
    cache: CacheStore,
    fetcher: Arc<dyn Fetcher>,
    durable: Option<Arc<DurableFetchQueue>>,
    transport: Arc<dyn UpstreamTransport>,
    policy: RetryPolicy,
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let services = build_services(&settings).await?;

    let users = match services.db.as_ref() {
        Some(db) => Some(UserService::new(db.clone())),
        None => {
            warn!(
                target = "eventmirror::startup",
                "no database configured; inbound credential check is disabled"
            );
            None
        }
    };

    let maintenance = MaintenanceService::new(services.cache.clone());
    let sweep = settings
        .maintenance
        .sweep_enabled
        .then(|| SweepContext {
            maintenance: maintenance.clone(),
            retention_hours: settings.maintenance.retention_hours,
            fetch_jobs: services
                .durable
                .as_ref()
                .and(services.db.clone())
                .map(|db| db as Arc<dyn FetchJobsRepo>),
        });
    let monitor_handle = spawn_job_monitor(&settings, &services, sweep)?;

    let state = AppState {
        resolver: RequestResolver::new(services.cache.clone(), services.fetcher.clone()),
        maintenance,
        hydration: build_hydration(&settings, &services),
        users,
    };
    if state.hydration.is_none() {
        warn!(
            target = "eventmirror::startup",
            "upstream.default_account_code is not set; hydration routes are disabled"
        );
    }

    let result = serve_http(&settings, state).await;

    if let Some(handle) = monitor_handle {
        handle.abort();
        let _ = handle.await;
    }

    result
}

async fn run_sweep(settings: config::Settings, args: config::SweepArgs) -> Result<(), AppError> {
    let (_, cache) = build_cache(&settings).await?;
    let report = MaintenanceService::new(cache)
        .sweep_older_than(args.hours.unwrap_or(DEFAULT_SWEEP_HOURS))
        .await?;
    print_report(&report)
}

async fn run_sweep_event(
    settings: config::Settings,
    args: config::SweepEventArgs,
) -> Result<(), AppError> {
    let (_, cache) = build_cache(&settings).await?;
    let report = MaintenanceService::new(cache)
        .sweep_event(&args.event_code)
        .await?;
    print_report(&report)
}

async fn run_hydrate(settings: config::Settings, args: config::HydrateArgs) -> Result<(), AppError> {
    let services = build_services(&settings).await?;
    let hydration = build_hydration(&settings, &services).ok_or_else(|| {
        AppError::from(InfraError::configuration(
            "hydration requires upstream.default_account_code",
        ))
    })?;
    let monitor_handle = spawn_job_monitor(&settings, &services, None)?;

    let result = match args.reg_code.as_deref() {
        Some(reg_code) => print_report(&hydration.hydrate_entity(&args.event_code, reg_code).await),
        None => print_report(&hydration.hydrate_event(&args.event_code).await),
    };

    if let Some(handle) = monitor_handle {
        handle.abort();
        let _ = handle.await;
    }

    result
}

async fn run_add_user(settings: config::Settings, args: config::AddUserArgs) -> Result<(), AppError> {
    let db = connect_database(&settings)
        .await?
        .ok_or_else(|| AppError::from(InfraError::configuration("database url is not configured")))?;

    let password = match args.password {
        Some(password) if !args.password_stdin => password,
        _ => read_password_from_stdin().await?,
    };

    UserService::new(db)
        .upsert_user(&args.username, &password)
        .await
        .map_err(|err| AppError::validation(err.to_string()))?;

    info!(
        target = "eventmirror::users",
        username = %args.username.trim(),
        "user stored"
    );
    Ok(())
}

async fn read_password_from_stdin() -> Result<String, AppError> {
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn print_report<T: Serialize>(report: &T) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(report)
        .map_err(|err| AppError::unexpected(format!("failed to render report: {err}")))?;
    println!("{rendered}");
    Ok(())
}

async fn connect_database(
    settings: &config::Settings,
) -> Result<Option<Arc<PostgresRepositories>>, AppError> {
    let Some(database_url) = settings.database.url.as_ref() else {
        return Ok(None);
    };

    let pool = PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    if settings.queue.backend == QueueBackend::Durable {
        PostgresStorage::<()>::setup(&pool)
            .await
            .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;
    }

    Ok(Some(Arc::new(PostgresRepositories::new(pool))))
}

async fn build_cache(
    settings: &config::Settings,
) -> Result<(Option<Arc<PostgresRepositories>>, CacheStore), AppError> {
    let db = connect_database(settings).await?;
    let repo: Arc<dyn CacheRepo> = match (settings.cache.backend, db.as_ref()) {
        (CacheBackend::Postgres, Some(db)) => {
            let repo: Arc<dyn CacheRepo> = db.clone();
            repo
        }
        (CacheBackend::Postgres, None) => {
            return Err(InfraError::configuration("database url is not configured").into());
        }
        (CacheBackend::Memory, _) => Arc::new(MemoryCacheRepo::new()),
    };
    Ok((db, CacheStore::new(repo, settings.cache.expiration)))
}

fn build_transport(settings: &config::Settings) -> Result<Arc<dyn UpstreamTransport>, AppError> {
    let upstream = &settings.upstream;
    let base_url = upstream
        .base_url
        .as_deref()
        .ok_or_else(|| InfraError::configuration("upstream.base_url is not configured"))?;
    let (Some(username), Some(password)) = (upstream.username.clone(), upstream.password.clone())
    else {
        return Err(InfraError::configuration("upstream credentials are not configured").into());
    };

    let client = UpstreamClient::new(
        base_url,
        &upstream.api_prefix,
        UpstreamCredentials { username, password },
        upstream.connect_timeout,
    )?;
    Ok(Arc::new(client))
}

fn retry_policy(queue: &config::QueueSettings) -> RetryPolicy {
    RetryPolicy {
        initial_delay: queue.initial_backoff,
        multiplier: queue.backoff_multiplier.get(),
        max_wait: queue.max_wait,
        max_attempts: queue.max_attempts,
        job_timeout: queue.job_timeout,
    }
}

async fn build_services(settings: &config::Settings) -> Result<Services, AppError> {
    let (db, cache) = build_cache(settings).await?;
    let transport = build_transport(settings)?;
    let policy = retry_policy(&settings.queue);
    let concurrency = settings.queue.concurrency.get() as usize;

    let (fetcher, durable): (Arc<dyn Fetcher>, Option<Arc<DurableFetchQueue>>) =
        match (settings.queue.backend, db.as_ref()) {
            (QueueBackend::Memory, _) => {
                let pool: Arc<dyn Fetcher> = Arc::new(MemoryFetchPool::new(
                    transport.clone(),
                    policy.clone(),
                    concurrency,
                ));
                (pool, None)
            }
            (QueueBackend::Durable, Some(db)) => {
                let jobs: Arc<dyn FetchJobsRepo> = db.clone();
                let queue = Arc::new(DurableFetchQueue::new(
                    jobs,
                    policy.clone(),
                    concurrency,
                    settings.queue.poll_interval,
                ));
                let fetcher: Arc<dyn Fetcher> = queue.clone();
                (fetcher, Some(queue))
            }
            (QueueBackend::Durable, None) => {
                return Err(InfraError::configuration(
                    "queue.backend `durable` requires a database url",
                )
                .into());
            }
        };

    info!(
        target = "eventmirror::startup",
        cache_backend = ?settings.cache.backend,
        queue_backend = ?settings.queue.backend,
        concurrency,
        "services initialised"
    );

    Ok(Services {
        db,
        cache,
        fetcher,
        durable,
        transport,
        policy,
    })
}

fn build_hydration(settings: &config::Settings, services: &Services) -> Option<HydrationService> {
    settings
        .upstream
        .default_account_code
        .as_deref()
        .map(|account| HydrationService::new(services.cache.clone(), services.fetcher.clone(), account))
}

/// Spawn the apalis monitor for the durable fetch worker and the scheduled sweep.
///
/// Returns `None` when neither worker is needed.
fn spawn_job_monitor(
    settings: &config::Settings,
    services: &Services,
    sweep: Option<SweepContext>,
) -> Result<Option<JoinHandle<()>>, AppError> {
    let mut monitor = Monitor::new();
    let mut registered = false;

    let durable = match (services.durable.as_ref(), services.db.as_ref()) {
        (Some(queue), Some(db)) => {
            let storage: PostgresStorage<FetchJobPayload> = PostgresStorage::new_with_config(
                db.pool().clone(),
                ApalisSqlConfig::new(FETCH_JOB_NAMESPACE),
            );
            let jobs: Arc<dyn FetchJobsRepo> = db.clone();
            let context = FetchWorkerContext {
                jobs,
                transport: services.transport.clone(),
                policy: services.policy.clone(),
            };
            let worker = WorkerBuilder::new("fetch-upstream-worker")
                .concurrency(settings.queue.concurrency.get() as usize)
                .data(context)
                .backend(storage)
                .build_fn(process_fetch_job);
            monitor = monitor.register(worker);
            registered = true;
            Some(queue.clone())
        }
        _ => None,
    };

    if let Some(context) = sweep {
        let schedule = sweep_schedule(&settings.maintenance.sweep_schedule)
            .map_err(InfraError::configuration)?;
        let worker = WorkerBuilder::new("sweep-cache-worker")
            .data(context)
            .backend(CronStream::new(schedule))
            .build_fn(process_sweep_cache_job);
        monitor = monitor.register(worker);
        registered = true;
    }

    if !registered {
        return Ok(None);
    }

    if let Some(queue) = durable.as_ref() {
        queue.mark_ready();
    }

    Ok(Some(tokio::spawn(async move {
        if let Err(err) = monitor.run().await {
            error!(error = %err, "job monitor stopped");
        }
        if let Some(queue) = durable {
            queue.mark_stopped();
        }
    })))
}

async fn serve_http(settings: &config::Settings, state: AppState) -> Result<(), AppError> {
    let router = http::build_router(state);
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "eventmirror::startup",
        addr = %settings.server.addr,
        "listening"
    );

    let draining = Arc::new(Notify::new());
    let signal = draining.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                signal.notify_one();
            })
            .await
    });

    tokio::select! {
        joined = &mut server => return server_outcome(joined),
        _ = draining.notified() => {}
    }

    info!(
        target = "eventmirror::startup",
        grace_seconds = settings.server.graceful_shutdown.as_secs(),
        "shutting down"
    );
    match tokio::time::timeout(settings.server.graceful_shutdown, &mut server).await {
        Ok(joined) => server_outcome(joined),
        Err(_) => {
            warn!(
                target = "eventmirror::startup",
                "graceful shutdown timed out; dropping open connections"
            );
            server.abort();
            Ok(())
        }
    }
}

fn server_outcome(
    joined: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), AppError> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(AppError::unexpected(format!("server error: {err}"))),
        Err(err) => Err(AppError::unexpected(format!("server task failed: {err}"))),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
