use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::{env, fmt};
use uuid::Uuid;

use crate::backend::gist::DEFAULT_API_URL;

/// Which container backend the binary talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// One directory per container under `containers_dir`.
    Filesystem,
    /// GitHub Gists via the REST API.
    Gist,
}

impl BackendKind {
    fn parse_env(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "filesystem" | "fs" => Ok(Self::Filesystem),
            "gist" => Ok(Self::Gist),
            other => bail!("unknown backend `{}` (expected `filesystem` or `gist`)", other),
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub backend: BackendKind,
    pub containers_dir: String,
    pub gist_token: Option<String>,
    pub gist_api_url: String,
    pub master_gist_id: Option<String>,
    pub app_version: String,
    pub device_id: String,
}

// Hand-written so the Gist token never reaches the logs.
impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("backend", &self.backend)
            .field("containers_dir", &self.containers_dir)
            .field("gist_token", &self.gist_token.as_ref().map(|_| "<redacted>"))
            .field("gist_api_url", &self.gist_api_url)
            .field("master_gist_id", &self.master_gist_id)
            .field("app_version", &self.app_version)
            .field("device_id", &self.device_id)
            .finish()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Sharded media store over quota-limited Gist containers")]
pub struct Args {
    /// Host to bind to (overrides SHARD_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides SHARD_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL of the local key-value store (overrides SHARD_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Container backend (overrides SHARD_STORE_BACKEND)
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Root directory of the filesystem backend (overrides SHARD_STORE_CONTAINERS_DIR)
    #[arg(long)]
    pub containers_dir: Option<String>,

    /// Gist API base URL (overrides SHARD_STORE_GIST_API_URL)
    #[arg(long)]
    pub gist_api_url: Option<String>,

    /// Master container id (overrides SHARD_STORE_MASTER_GIST_ID)
    #[arg(long)]
    pub master_gist_id: Option<String>,

    /// Device id written into shard manifests (overrides SHARD_STORE_DEVICE_ID)
    #[arg(long)]
    pub device_id: Option<String>,

    /// Create the key-value schema and exit
    #[arg(long)]
    pub migrate: bool,
}

fn env_opt(name: &str) -> Result<Option<String>> {
    match env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env_opt("SHARD_STORE_HOST")?.unwrap_or_else(|| "0.0.0.0".into());
        let env_port = match env_opt("SHARD_STORE_PORT")? {
            Some(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing SHARD_STORE_PORT value `{}`", value))?,
            None => 3000,
        };
        let env_db = env_opt("SHARD_STORE_DATABASE_URL")?
            .unwrap_or_else(|| "sqlite://./data/meta/shard_store.db".into());
        let env_backend = match env_opt("SHARD_STORE_BACKEND")? {
            Some(value) => BackendKind::parse_env(&value).context("parsing SHARD_STORE_BACKEND")?,
            None => BackendKind::Filesystem,
        };
        let env_containers =
            env_opt("SHARD_STORE_CONTAINERS_DIR")?.unwrap_or_else(|| "./data/containers".into());
        let env_api_url = env_opt("SHARD_STORE_GIST_API_URL")?.unwrap_or_else(|| DEFAULT_API_URL.into());
        let env_master = env_opt("SHARD_STORE_MASTER_GIST_ID")?;
        let app_version =
            env_opt("SHARD_STORE_APP_VERSION")?.unwrap_or_else(|| env!("CARGO_PKG_VERSION").into());
        let env_device = env_opt("SHARD_STORE_DEVICE_ID")?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            backend: args.backend.unwrap_or(env_backend),
            containers_dir: args.containers_dir.unwrap_or(env_containers),
            gist_token: env_opt("SHARD_STORE_GIST_TOKEN")?,
            gist_api_url: args.gist_api_url.unwrap_or(env_api_url),
            master_gist_id: args.master_gist_id.or(env_master),
            app_version,
            device_id: args
                .device_id
                .or(env_device)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        };

        if cfg.backend == BackendKind::Gist && cfg.gist_token.is_none() {
            bail!("SHARD_STORE_GIST_TOKEN is required when the gist backend is selected");
        }

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_accepts_aliases() {
        assert_eq!(BackendKind::parse_env("GIST").unwrap(), BackendKind::Gist);
        assert_eq!(BackendKind::parse_env("fs").unwrap(), BackendKind::Filesystem);
        assert!(BackendKind::parse_env("s3").is_err());
    }
}
