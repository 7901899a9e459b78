use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr, time::Duration};

/// Which half of the system this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    /// HTTP file server (producer of jobs).
    Server,
    /// Background worker consuming the job queue.
    Worker,
}

/// Credentials and location of the cloud replica bucket.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub root: String,
    pub database_url: String,
    /// `None` disables every cloud-tier behaviour.
    pub cloud: Option<CloudConfig>,
    pub file_server_url: Option<String>,
    pub workers: usize,
    pub cleanup_interval: Option<Duration>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Deploy file store with cloud replication")]
pub struct Args {
    /// Process role
    #[arg(long, value_enum, default_value_t = Role::Server)]
    pub role: Role,

    /// Host to bind to (overrides DEPLOY_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides DEPLOY_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Local root directory for stored files (overrides DEPLOY_STORE_ROOT)
    #[arg(long)]
    pub root: Option<String>,

    /// Job queue database URL (overrides DEPLOY_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Replica bucket; leave unset for a pure local store (overrides DEPLOY_STORE_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Bucket region (overrides DEPLOY_STORE_REGION)
    #[arg(long)]
    pub region: Option<String>,

    /// Custom S3-compatible endpoint (overrides DEPLOY_STORE_ENDPOINT)
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Access key id (overrides DEPLOY_STORE_ACCESS_KEY_ID)
    #[arg(long)]
    pub access_key_id: Option<String>,

    /// Secret access key (overrides DEPLOY_STORE_SECRET_ACCESS_KEY)
    #[arg(long)]
    pub secret_access_key: Option<String>,

    /// File server the worker reads upload content from (overrides DEPLOY_STORE_FILE_SERVER_URL)
    #[arg(long)]
    pub file_server_url: Option<String>,

    /// Concurrent job slots per worker (overrides DEPLOY_STORE_WORKERS)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Enqueue a deploy cleanup every N seconds, 0 disables (overrides DEPLOY_STORE_CLEANUP_INTERVAL_SECS)
    #[arg(long)]
    pub cleanup_interval_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig, role and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, Role, bool)> {
        let args = Args::parse();
        let cfg = Self::from_args(&args)?;
        Ok((cfg, args.role, args.migrate))
    }

    /// Merge already-parsed args over the environment.
    pub fn from_args(args: &Args) -> Result<Self> {
        let host = args
            .host
            .clone()
            .unwrap_or_else(|| env_or("DEPLOY_STORE_HOST", "0.0.0.0"));
        let port = match args.port {
            Some(port) => port,
            None => parse_env("DEPLOY_STORE_PORT", 3000)?,
        };
        let root = args
            .root
            .clone()
            .unwrap_or_else(|| env_or("DEPLOY_STORE_ROOT", "./data/files"));
        let database_url = args.database_url.clone().unwrap_or_else(|| {
            env_or(
                "DEPLOY_STORE_DATABASE_URL",
                "sqlite://./data/meta/deploy_store.db",
            )
        });

        let bucket = args
            .bucket
            .clone()
            .or_else(|| env::var("DEPLOY_STORE_BUCKET").ok())
            .filter(|b| !b.trim().is_empty());
        let cloud = bucket.map(|bucket| CloudConfig {
            bucket,
            region: args
                .region
                .clone()
                .unwrap_or_else(|| env_or("DEPLOY_STORE_REGION", "us-east-1")),
            endpoint: args
                .endpoint
                .clone()
                .or_else(|| env::var("DEPLOY_STORE_ENDPOINT").ok()),
            access_key_id: args
                .access_key_id
                .clone()
                .or_else(|| env::var("DEPLOY_STORE_ACCESS_KEY_ID").ok()),
            secret_access_key: args
                .secret_access_key
                .clone()
                .or_else(|| env::var("DEPLOY_STORE_SECRET_ACCESS_KEY").ok()),
        });

        let file_server_url = args
            .file_server_url
            .clone()
            .or_else(|| env::var("DEPLOY_STORE_FILE_SERVER_URL").ok());
        let workers = match args.workers {
            Some(n) => n,
            None => parse_env("DEPLOY_STORE_WORKERS", 4)?,
        }
        .max(1);
        let cleanup_secs = match args.cleanup_interval_secs {
            Some(n) => n,
            None => parse_env("DEPLOY_STORE_CLEANUP_INTERVAL_SECS", 0)?,
        };

        Ok(Self {
            host,
            port,
            root,
            database_url,
            cloud,
            file_server_url,
            workers,
            cleanup_interval: (cleanup_secs > 0).then(|| Duration::from_secs(cleanup_secs)),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn bucket(&self) -> Option<&str> {
        self.cloud.as_ref().map(|c| c.bucket.as_str())
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.into())
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
