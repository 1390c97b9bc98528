use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr, time::Duration};

/// Which object network the gateway talks to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// SQLite headers plus payload files under `storage_dir`.
    Local,
    /// Process memory, lost on exit.
    Memory,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub backend: Backend,
    pub request_timeout: Duration,
    pub cache_capacity: usize,
    pub cache_lifetime: Duration,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Versioned S3 gateway over an append-only object network")]
pub struct Args {
    /// Host to bind to (overrides GATEWAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides GATEWAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where payloads are stored (overrides GATEWAY_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides GATEWAY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Object network backend (overrides GATEWAY_BACKEND)
    #[arg(long, value_enum)]
    pub backend: Option<Backend>,

    /// Per-request timeout in seconds (overrides GATEWAY_REQUEST_TIMEOUT_SECS)
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,

    /// Entries per metadata cache, 0 disables caching (overrides GATEWAY_CACHE_CAPACITY)
    #[arg(long)]
    pub cache_capacity: Option<usize>,

    /// Metadata cache entry lifetime in seconds (overrides GATEWAY_CACHE_LIFETIME_SECS)
    #[arg(long)]
    pub cache_lifetime_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read and parse an environment variable, falling back to `default` when it
/// is not set.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        Self::from_args(Args::parse())
    }

    fn from_args(args: Args) -> Result<(Self, bool)> {
        // --- Environment fallback ---
        let env_host = env::var("GATEWAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port: u16 = env_or("GATEWAY_PORT", 3000)?;
        let env_storage =
            env::var("GATEWAY_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("GATEWAY_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/gateway.db".into());
        let env_backend = match env::var("GATEWAY_BACKEND") {
            Ok(value) => <Backend as ValueEnum>::from_str(&value, true)
                .map_err(|err| anyhow::anyhow!(err))
                .with_context(|| format!("parsing GATEWAY_BACKEND value `{}`", value))?,
            Err(_) => Backend::Local,
        };
        let env_timeout: u64 = env_or("GATEWAY_REQUEST_TIMEOUT_SECS", 30)?;
        let env_capacity: usize = env_or("GATEWAY_CACHE_CAPACITY", 10_000)?;
        let env_lifetime: u64 = env_or("GATEWAY_CACHE_LIFETIME_SECS", 60)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            backend: args.backend.unwrap_or(env_backend),
            request_timeout: Duration::from_secs(args.request_timeout_secs.unwrap_or(env_timeout)),
            cache_capacity: args.cache_capacity.unwrap_or(env_capacity),
            cache_lifetime: Duration::from_secs(args.cache_lifetime_secs.unwrap_or(env_lifetime)),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
