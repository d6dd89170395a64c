use crate::services::{
    cleaner::CleanerConfig,
    mapping_store::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE},
    replicator::ReplicatorConfig,
};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub source_dir: String,
    pub destination_dir: String,
    pub database_url: String,
    /// Only notifications naming this bucket are handled, when set.
    pub source_bucket: Option<String>,
    /// Retention width per source key.
    pub max_active: usize,
    /// Grace period before disowned copies are reclaimed.
    pub disowned_lag_seconds: u64,
    /// How long reclaimed generations are remembered against late redeliveries.
    pub reclaimed_retention_seconds: u64,
    pub cleaner_page_size: u32,
    pub copy_attempts: u32,
    pub copy_backoff_ms: u64,
    /// Run the Cleaner in-process on this interval, when set.
    pub sweep_interval_secs: Option<u64>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Versioned backup replicator")]
pub struct Args {
    /// Host to bind to (overrides BACKUP_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides BACKUP_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding source objects (overrides BACKUP_SOURCE_DIR)
    #[arg(long)]
    pub source_dir: Option<String>,

    /// Directory receiving backup copies (overrides BACKUP_DESTINATION_DIR)
    #[arg(long)]
    pub destination_dir: Option<String>,

    /// Database URL (overrides BACKUP_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Ignore notifications for other buckets (overrides SOURCE_BUCKET)
    #[arg(long)]
    pub source_bucket: Option<String>,

    /// Maximum active generations kept per key (overrides MAX_ACTIVE)
    #[arg(long)]
    pub max_active: Option<usize>,

    /// Grace period in seconds before reclamation (overrides DISOWNED_LAG_SECONDS)
    #[arg(long)]
    pub disowned_lag_seconds: Option<u64>,

    /// Seconds a reclaimed generation is remembered (overrides RECLAIMED_RETENTION_SECONDS)
    #[arg(long)]
    pub reclaimed_retention_seconds: Option<u64>,

    /// Records per Cleaner page (overrides CLEANER_PAGE_SIZE)
    #[arg(long)]
    pub cleaner_page_size: Option<u32>,

    /// Copy attempts per notification (overrides COPY_ATTEMPTS)
    #[arg(long)]
    pub copy_attempts: Option<u32>,

    /// Initial backoff between copy attempts (overrides COPY_BACKOFF_MS)
    #[arg(long)]
    pub copy_backoff_ms: Option<u64>,

    /// Sweep interval for the in-process Cleaner (overrides SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        Self::merge(Args::parse(), |name| env::var(name))
    }

    /// Merge parsed args over values found through `lookup`.
    pub fn merge(
        args: Args,
        lookup: impl Fn(&str) -> Result<String, env::VarError>,
    ) -> Result<(Self, bool)> {
        let text = |name: &str, default: &str| match lookup(name) {
            Ok(value) => Ok(value),
            Err(env::VarError::NotPresent) => Ok(default.to_string()),
            Err(err) => Err(err).with_context(|| format!("reading {}", name)),
        };
        let optional = |name: &str| match lookup(name) {
            Ok(value) if !value.is_empty() => Ok(Some(value)),
            Ok(_) | Err(env::VarError::NotPresent) => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", name)),
        };

        let cfg = Self {
            host: args
                .host
                .map_or_else(|| text("BACKUP_HOST", "0.0.0.0"), Ok)?,
            port: or_env(args.port, &lookup, "BACKUP_PORT", 3000)?,
            source_dir: args
                .source_dir
                .map_or_else(|| text("BACKUP_SOURCE_DIR", "./data/src"), Ok)?,
            destination_dir: args
                .destination_dir
                .map_or_else(|| text("BACKUP_DESTINATION_DIR", "./data/dst"), Ok)?,
            database_url: args.database_url.map_or_else(
                || text("BACKUP_DATABASE_URL", "sqlite://./data/meta/backups.db"),
                Ok,
            )?,
            source_bucket: match args.source_bucket {
                Some(bucket) => Some(bucket),
                None => optional("SOURCE_BUCKET")?,
            },
            max_active: or_env(args.max_active, &lookup, "MAX_ACTIVE", 3)?,
            disowned_lag_seconds: or_env(
                args.disowned_lag_seconds,
                &lookup,
                "DISOWNED_LAG_SECONDS",
                10,
            )?,
            reclaimed_retention_seconds: or_env(
                args.reclaimed_retention_seconds,
                &lookup,
                "RECLAIMED_RETENTION_SECONDS",
                7 * 24 * 60 * 60,
            )?,
            cleaner_page_size: or_env(
                args.cleaner_page_size,
                &lookup,
                "CLEANER_PAGE_SIZE",
                DEFAULT_PAGE_SIZE,
            )?
            .clamp(1, MAX_PAGE_SIZE),
            copy_attempts: or_env(args.copy_attempts, &lookup, "COPY_ATTEMPTS", 1)?.max(1),
            copy_backoff_ms: or_env(args.copy_backoff_ms, &lookup, "COPY_BACKOFF_MS", 100)?,
            sweep_interval_secs: match args.sweep_interval_secs {
                Some(secs) => Some(secs),
                None => optional("SWEEP_INTERVAL_SECS")?
                    .map(|value| {
                        value
                            .parse::<u64>()
                            .with_context(|| format!("parsing SWEEP_INTERVAL_SECS value `{}`", value))
                    })
                    .transpose()?,
            },
        };

        if cfg.max_active == 0 {
            bail!("MAX_ACTIVE must be at least 1");
        }
        if cfg.reclaimed_retention_seconds < cfg.disowned_lag_seconds {
            bail!("RECLAIMED_RETENTION_SECONDS must be at least DISOWNED_LAG_SECONDS");
        }
        if cfg.sweep_interval_secs == Some(0) {
            bail!("SWEEP_INTERVAL_SECS must be at least 1");
        }

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn replicator_config(&self) -> ReplicatorConfig {
        ReplicatorConfig {
            max_active: self.max_active,
            copy_attempts: self.copy_attempts,
            copy_backoff: Duration::from_millis(self.copy_backoff_ms),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn cleaner_config(&self) -> CleanerConfig {
        CleanerConfig {
            disowned_lag: Duration::from_secs(self.disowned_lag_seconds),
            page_size: self.cleaner_page_size,
            reclaimed_retention: Duration::from_secs(self.reclaimed_retention_seconds),
        }
    }
}

/// CLI value if given, else the parsed environment value, else `default`.
fn or_env<T>(
    cli: Option<T>,
    lookup: &impl Fn(&str) -> Result<String, env::VarError>,
    name: &str,
    default: T,
) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(value) = cli {
        return Ok(value);
    }
    match lookup(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
