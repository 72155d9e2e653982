//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

pub use cli::{
    AddUserArgs, CliArgs, Command, DatabaseOverride, HydrateArgs, ServeArgs, ServeOverrides,
    SweepArgs, SweepEventArgs,
};

use std::{fmt, net::SocketAddr, num::NonZeroU32, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "eventmirror";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_API_PREFIX: &str = "certainExternal/service/v1";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CACHE_EXPIRATION_HOURS: u64 = 24;
const DEFAULT_QUEUE_CONCURRENCY: u32 = 20;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 2_000;
const DEFAULT_BACKOFF_MULTIPLIER: u32 = 2;
const DEFAULT_MAX_WAIT_SECS: u64 = 120;
const DEFAULT_MAX_ATTEMPTS: u32 = 8;
const DEFAULT_JOB_TIMEOUT_SECS: u64 = 120;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_SWEEP_SCHEDULE: &str = "0 0 * * * *";
const DEFAULT_RETENTION_HOURS: u64 = 168;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub upstream: UpstreamSettings,
    pub cache: CacheSettings,
    pub queue: QueueSettings,
    pub maintenance: MaintenanceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Clone)]
pub struct UpstreamSettings {
    pub base_url: Option<String>,
    pub api_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub default_account_code: Option<String>,
    pub connect_timeout: Duration,
}

impl fmt::Debug for UpstreamSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamSettings")
            .field("base_url", &self.base_url)
            .field("api_prefix", &self.api_prefix)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("default_account_code", &self.default_account_code)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub backend: CacheBackend,
    pub expiration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    Memory,
    Durable,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub backend: QueueBackend,
    pub concurrency: NonZeroU32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: NonZeroU32,
    pub max_wait: Duration,
    pub max_attempts: NonZeroU32,
    pub job_timeout: Duration,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct MaintenanceSettings {
    pub sweep_enabled: bool,
    pub sweep_schedule: String,
    pub retention_hours: u64,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("EVENTMIRROR").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Sweep(args)) => raw.apply_database_override(&args.database),
        Some(Command::SweepEvent(args)) => raw.apply_database_override(&args.database),
        Some(Command::Hydrate(args)) => raw.apply_database_override(&args.database),
        Some(Command::AddUser(args)) => raw.apply_database_override(&args.database),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    upstream: RawUpstreamSettings,
    cache: RawCacheSettings,
    queue: RawQueueSettings,
    maintenance: RawMaintenanceSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.upstream_base_url.as_ref() {
            self.upstream.base_url = Some(url.clone());
        }
        if let Some(backend) = overrides.cache_backend.as_ref() {
            self.cache.backend = Some(backend.clone());
        }
        if let Some(hours) = overrides.cache_expiration_hours {
            self.cache.expiration_hours = Some(hours);
        }
        if let Some(backend) = overrides.queue_backend.as_ref() {
            self.queue.backend = Some(backend.clone());
        }
        if let Some(concurrency) = overrides.queue_concurrency {
            self.queue.concurrency = Some(concurrency);
        }

        self.apply_database_override(&overrides.database);
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            upstream,
            cache,
            queue,
            maintenance,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let database = build_database_settings(database)?;
        let upstream = build_upstream_settings(upstream)?;
        let cache = build_cache_settings(cache)?;
        let queue = build_queue_settings(queue)?;
        let maintenance = build_maintenance_settings(maintenance)?;

        if database.url.is_none() {
            if cache.backend == CacheBackend::Postgres {
                return Err(LoadError::invalid(
                    "database.url",
                    "required when cache.backend is `postgres`",
                ));
            }
            if queue.backend == QueueBackend::Durable {
                return Err(LoadError::invalid(
                    "database.url",
                    "required when queue.backend is `durable`",
                ));
            }
        }

        Ok(Self {
            server,
            logging,
            database,
            upstream,
            cache,
            queue,
            maintenance,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = non_blank(database.url);
    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_upstream_settings(upstream: RawUpstreamSettings) -> Result<UpstreamSettings, LoadError> {
    let base_url = non_blank(upstream.base_url);
    if base_url
        .as_deref()
        .is_some_and(|url| !(url.starts_with("http://") || url.starts_with("https://")))
    {
        return Err(LoadError::invalid(
            "upstream.base_url",
            "must start with http:// or https://",
        ));
    }

    let connect_secs = upstream
        .connect_timeout_seconds
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);
    if connect_secs == 0 {
        return Err(LoadError::invalid(
            "upstream.connect_timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(UpstreamSettings {
        base_url,
        api_prefix: non_blank(upstream.api_prefix)
            .unwrap_or_else(|| DEFAULT_API_PREFIX.to_string()),
        username: non_blank(upstream.username),
        password: upstream.password.filter(|value| !value.is_empty()),
        default_account_code: non_blank(upstream.default_account_code),
        connect_timeout: Duration::from_secs(connect_secs),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let backend = match cache.backend.as_deref().map(str::trim) {
        None | Some("postgres") => CacheBackend::Postgres,
        Some("memory") => CacheBackend::Memory,
        Some(other) => {
            return Err(LoadError::invalid(
                "cache.backend",
                format!("unknown backend `{other}` (expected postgres or memory)"),
            ));
        }
    };

    let hours = cache
        .expiration_hours
        .unwrap_or(DEFAULT_CACHE_EXPIRATION_HOURS);
    if hours == 0 {
        return Err(LoadError::invalid(
            "cache.expiration_hours",
            "must be greater than zero",
        ));
    }

    Ok(CacheSettings {
        backend,
        expiration: Duration::from_secs(hours.saturating_mul(3600)),
    })
}

fn build_queue_settings(queue: RawQueueSettings) -> Result<QueueSettings, LoadError> {
    let backend = match queue.backend.as_deref().map(str::trim) {
        None | Some("memory") => QueueBackend::Memory,
        Some("durable") => QueueBackend::Durable,
        Some(other) => {
            return Err(LoadError::invalid(
                "queue.backend",
                format!("unknown backend `{other}` (expected memory or durable)"),
            ));
        }
    };

    let concurrency = non_zero_u32(
        queue.concurrency.unwrap_or(DEFAULT_QUEUE_CONCURRENCY).into(),
        "queue.concurrency",
    )?;
    let backoff_multiplier = non_zero_u32(
        queue
            .backoff_multiplier
            .unwrap_or(DEFAULT_BACKOFF_MULTIPLIER)
            .into(),
        "queue.backoff_multiplier",
    )?;
    let max_attempts = non_zero_u32(
        queue.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).into(),
        "queue.max_attempts",
    )?;

    let initial_backoff_ms = queue
        .initial_backoff_ms
        .unwrap_or(DEFAULT_INITIAL_BACKOFF_MS);
    if initial_backoff_ms == 0 {
        return Err(LoadError::invalid(
            "queue.initial_backoff_ms",
            "must be greater than zero",
        ));
    }

    let job_timeout_secs = queue.job_timeout_seconds.unwrap_or(DEFAULT_JOB_TIMEOUT_SECS);
    if job_timeout_secs == 0 {
        return Err(LoadError::invalid(
            "queue.job_timeout_seconds",
            "must be greater than zero",
        ));
    }

    let poll_interval_ms = queue.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
    if poll_interval_ms == 0 {
        return Err(LoadError::invalid(
            "queue.poll_interval_ms",
            "must be greater than zero",
        ));
    }

    Ok(QueueSettings {
        backend,
        concurrency,
        initial_backoff: Duration::from_millis(initial_backoff_ms),
        backoff_multiplier,
        max_wait: Duration::from_secs(queue.max_wait_seconds.unwrap_or(DEFAULT_MAX_WAIT_SECS)),
        max_attempts,
        job_timeout: Duration::from_secs(job_timeout_secs),
        poll_interval: Duration::from_millis(poll_interval_ms),
    })
}

fn build_maintenance_settings(
    maintenance: RawMaintenanceSettings,
) -> Result<MaintenanceSettings, LoadError> {
    let sweep_schedule = non_blank(maintenance.sweep_schedule)
        .unwrap_or_else(|| DEFAULT_SWEEP_SCHEDULE.to_string());
    apalis_cron::Schedule::from_str(&sweep_schedule).map_err(|err| {
        LoadError::invalid("maintenance.sweep_schedule", format!("failed to parse: {err}"))
    })?;

    let retention_hours = maintenance
        .retention_hours
        .unwrap_or(DEFAULT_RETENTION_HOURS);
    if retention_hours == 0 {
        return Err(LoadError::invalid(
            "maintenance.retention_hours",
            "must be greater than zero",
        ));
    }

    Ok(MaintenanceSettings {
        sweep_enabled: maintenance.sweep_enabled.unwrap_or(true),
        sweep_schedule,
        retention_hours,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Clone, Deserialize, Default)]
#[serde(default)]
struct RawUpstreamSettings {
    base_url: Option<String>,
    api_prefix: Option<String>,
    username: Option<String>,
    password: Option<String>,
    default_account_code: Option<String>,
    connect_timeout_seconds: Option<u64>,
}

impl fmt::Debug for RawUpstreamSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawUpstreamSettings")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    backend: Option<String>,
    expiration_hours: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQueueSettings {
    backend: Option<String>,
    concurrency: Option<u32>,
    initial_backoff_ms: Option<u64>,
    backoff_multiplier: Option<u32>,
    max_wait_seconds: Option<u64>,
    max_attempts: Option<u32>,
    job_timeout_seconds: Option<u64>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMaintenanceSettings {
    sweep_enabled: Option<bool>,
    sweep_schedule: Option<String>,
    retention_hours: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
