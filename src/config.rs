use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::backend::sftp::SftpSettings;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_root: String,
    pub database_url: String,
    /// Present only when `SFTP_HOST` is set.
    pub sftp: Option<SftpSettings>,
}

/// What the binary should do after loading its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Serve,
    Migrate,
    CheckRemote,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Chunked upload service")]
pub struct Args {
    /// Host to bind to (overrides CHUNKED_UPLOAD_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CHUNKED_UPLOAD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Root directory of the local backend (overrides CHUNKED_UPLOAD_STORAGE_ROOT)
    #[arg(long)]
    pub storage_root: Option<String>,

    /// Database URL (overrides CHUNKED_UPLOAD_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Test the remote backend connection and exit
    #[arg(long, conflicts_with = "migrate")]
    pub check_remote: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        let args = Args::parse();
        let mode = if args.migrate {
            RunMode::Migrate
        } else if args.check_remote {
            RunMode::CheckRemote
        } else {
            RunMode::Serve
        };
        let cfg = Self::from_sources(args, |name| env::var(name).ok())?;
        Ok((cfg, mode))
    }

    /// Merge CLI args over values looked up by `var` (the process
    /// environment outside of tests).
    fn from_sources(args: Args, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env_host = var("CHUNKED_UPLOAD_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = parse_var(&var, "CHUNKED_UPLOAD_PORT", 3000u16)?;
        let env_storage = var("CHUNKED_UPLOAD_STORAGE_ROOT").unwrap_or_else(|| "./uploads".into());
        let env_db = var("CHUNKED_UPLOAD_DATABASE_URL")
            .unwrap_or_else(|| "sqlite://./data/meta/chunked_upload.db".into());

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_root: args.storage_root.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            sftp: sftp_from_sources(&var)?,
        };

        if cfg.storage_root.trim().is_empty() {
            bail!("storage root must not be empty");
        }
        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// SFTP settings, if a remote host is configured at all.
fn sftp_from_sources(var: &impl Fn(&str) -> Option<String>) -> Result<Option<SftpSettings>> {
    let Some(host) = var("SFTP_HOST").filter(|h| !h.trim().is_empty()) else {
        return Ok(None);
    };

    let port = parse_var(var, "SFTP_PORT", 22u16)?;
    let timeout_secs = parse_var(var, "SFTP_TIMEOUT_SECS", 30u64)?;
    let settings = SftpSettings {
        host,
        port,
        username: var("SFTP_USERNAME").unwrap_or_default(),
        password: var("SFTP_PASSWORD").unwrap_or_default(),
        base_path: var("SFTP_BASE_PATH").unwrap_or_else(|| "/uploads".into()),
        known_hosts: var("SFTP_KNOWN_HOSTS")
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from),
        connect_timeout: Duration::from_secs(timeout_secs),
        operation_timeout: Duration::from_secs(timeout_secs),
    };

    if settings.port == 0 {
        bail!("SFTP_PORT must not be 0");
    }
    if timeout_secs == 0 {
        bail!("SFTP_TIMEOUT_SECS must be at least 1");
    }
    if settings.username.is_empty() {
        bail!("SFTP_USERNAME is required when SFTP_HOST is set");
    }
    if settings.password.is_empty() {
        bail!("SFTP_PASSWORD is required when SFTP_HOST is set");
    }
    if settings.base_path.trim().is_empty() {
        bail!("SFTP_BASE_PATH must not be empty");
    }
    Ok(Some(settings))
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        None => Ok(default),
    }
}
