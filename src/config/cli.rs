use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

use crate::domain::hydration::is_registration_code;

/// Command-line arguments for the eventmirror binary.
#[derive(Debug, Parser)]
#[command(
    name = "eventmirror",
    version,
    about = "Caching mirror for the upstream event-management API"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "EVENTMIRROR_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP service (default).
    Serve(Box<ServeArgs>),
    /// Delete cache entries older than the given age.
    Sweep(SweepArgs),
    /// Delete every cache entry of one event.
    #[command(name = "sweep-event")]
    SweepEvent(SweepEventArgs),
    /// Warm the cache for an event, or for one registrant of it.
    Hydrate(HydrateArgs),
    /// Create or replace an inbound API user.
    #[command(name = "add-user")]
    AddUser(AddUserArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Emit logs as JSON.
    #[arg(long = "log-json", value_name = "BOOL", value_parser = BoolishValueParser::new())]
    pub log_json: Option<bool>,

    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Override the upstream base URL.
    #[arg(long = "upstream-base-url", value_name = "URL")]
    pub upstream_base_url: Option<String>,

    /// Override the cache backend (postgres|memory).
    #[arg(long = "cache-backend", value_name = "BACKEND")]
    pub cache_backend: Option<String>,

    /// Override the cache expiration window.
    #[arg(long = "cache-expiration-hours", value_name = "HOURS")]
    pub cache_expiration_hours: Option<u64>,

    /// Override the fetch queue backend (memory|durable).
    #[arg(long = "queue-backend", value_name = "BACKEND")]
    pub queue_backend: Option<String>,

    /// Override the number of simultaneous upstream calls.
    #[arg(long = "queue-concurrency", value_name = "N")]
    pub queue_concurrency: Option<u32>,
}

#[derive(Debug, Args, Clone)]
pub struct SweepArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Remove entries older than this many hours.
    #[arg(long, value_name = "HOURS")]
    pub hours: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct SweepEventArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    #[arg(value_name = "EVENT")]
    pub event_code: String,
}

#[derive(Debug, Args, Clone)]
pub struct HydrateArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    #[arg(value_name = "EVENT")]
    pub event_code: String,

    /// Hydrate only this registrant.
    #[arg(value_name = "REG", value_parser = parse_registration_code)]
    pub reg_code: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct AddUserArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    #[arg(value_name = "USERNAME")]
    pub username: String,

    /// Read the password from standard input.
    #[arg(long = "password-stdin", conflicts_with = "password")]
    pub password_stdin: bool,

    /// Password given inline; prefer --password-stdin.
    #[arg(long, value_name = "PASSWORD", required_unless_present = "password_stdin")]
    pub password: Option<String>,
}

fn parse_registration_code(value: &str) -> Result<String, String> {
    if is_registration_code(value) {
        Ok(value.to_string())
    } else {
        Err("registration codes contain only digits and dashes".to_string())
    }
}
