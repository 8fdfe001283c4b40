//! Archival of the interim directory with `restic`.
//!
//! Repository location and credentials come from the configuration and the
//! storage Secret. Credentials reach the child process through its own
//! environment; the GCS service-account key is staged in a per-run
//! temporary directory that is removed when the [`Archiver`] is dropped.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use common::protocol::{FileStats, SnapshotStats};
use common::{Error, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::cluster::SecretData;
use crate::config::Config;
use crate::priority::PrioritySettings;
use crate::session::{CommandRunner, CommandSpec};

pub const RESTIC_CMD: &str = "restic";

// Storage Secret keys.
pub const RESTIC_PASSWORD: &str = "RESTIC_PASSWORD";
pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const GOOGLE_PROJECT_ID: &str = "GOOGLE_PROJECT_ID";
pub const GOOGLE_SERVICE_ACCOUNT_JSON_KEY: &str = "GOOGLE_SERVICE_ACCOUNT_JSON_KEY";
pub const AZURE_ACCOUNT_NAME: &str = "AZURE_ACCOUNT_NAME";
pub const AZURE_ACCOUNT_KEY: &str = "AZURE_ACCOUNT_KEY";
pub const B2_ACCOUNT_ID: &str = "B2_ACCOUNT_ID";
pub const B2_ACCOUNT_KEY: &str = "B2_ACCOUNT_KEY";
pub const REST_SERVER_USERNAME: &str = "REST_SERVER_USERNAME";
pub const REST_SERVER_PASSWORD: &str = "REST_SERVER_PASSWORD";

const DEFAULT_S3_ENDPOINT: &str = "s3.amazonaws.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Local,
    S3,
    Gcs,
    Azure,
    B2,
    Swift,
    Rest,
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "s3" => Ok(Self::S3),
            "gcs" => Ok(Self::Gcs),
            "azure" => Ok(Self::Azure),
            "b2" => Ok(Self::B2),
            "swift" => Ok(Self::Swift),
            "rest" => Ok(Self::Rest),
            other => Err(Error::Config(format!("unknown storage provider {other:?}"))),
        }
    }
}

impl Provider {
    /// Prefix of restic's per-backend `-o <prefix>.connections=N` option.
    fn connections_option(self) -> Option<&'static str> {
        match self {
            Self::S3 => Some("s3"),
            Self::Gcs => Some("gs"),
            Self::Azure => Some("azure"),
            Self::B2 => Some("b2"),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// Location and credentials of one restic repository.
pub struct Repository {
    provider: Provider,
    env: BTreeMap<String, String>,
    _scratch: Option<tempfile::TempDir>,
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("provider", &self.provider)
            .field("env_keys", &self.env.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Repository {
    pub fn new(cfg: &Config, secret: &SecretData) -> Result<Self> {
        let provider: Provider = cfg.provider.parse()?;
        let get = |key: &str| -> Option<String> {
            secret
                .get(key)
                .map(|v| String::from_utf8_lossy(v).trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let require = |key: &str| -> Result<String> {
            get(key).ok_or_else(|| {
                Error::Config(format!(
                    "storage secret {}/{} has no {key}",
                    cfg.storage_secret_namespace, cfg.storage_secret_name
                ))
            })
        };

        let mut env = BTreeMap::new();
        env.insert(RESTIC_PASSWORD.to_string(), require(RESTIC_PASSWORD)?);
        let prefix = cfg.path_prefix.trim_matches('/');
        let mut scratch = None;

        let url = match provider {
            Provider::Local => {
                if cfg.endpoint.trim().is_empty() {
                    return Err(Error::Config("ENDPOINT (mount path) is required for provider local".into()));
                }
                join_path(cfg.endpoint.trim_end_matches('/'), prefix)
            }
            Provider::S3 => {
                for key in [AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY] {
                    if let Some(v) = get(key) {
                        env.insert(key.to_string(), v);
                    }
                }
                if !cfg.region.is_empty() {
                    env.insert("AWS_DEFAULT_REGION".into(), cfg.region.clone());
                }
                let endpoint = if cfg.endpoint.is_empty() { DEFAULT_S3_ENDPOINT } else { cfg.endpoint.trim_end_matches('/') };
                format!("s3:{}", join_path(&format!("{endpoint}/{}", require_bucket(cfg)?), prefix))
            }
            Provider::Gcs => {
                env.insert(GOOGLE_PROJECT_ID.into(), require(GOOGLE_PROJECT_ID)?);
                let key = require(GOOGLE_SERVICE_ACCOUNT_JSON_KEY)?;
                let dir = tempfile::Builder::new()
                    .prefix("restic-gcs-")
                    .tempdir_in(&cfg.scratch_dir)
                    .map_err(|e| Error::Write(format!("scratch dir in {}: {e}", cfg.scratch_dir.display())))?;
                let path = dir.path().join("gcs-sa.json");
                fs::write(&path, key).map_err(|e| Error::Write(format!("write {}: {e}", path.display())))?;
                env.insert("GOOGLE_APPLICATION_CREDENTIALS".into(), path.to_string_lossy().into_owned());
                scratch = Some(dir);
                format!("gs:{}:/{prefix}", require_bucket(cfg)?)
            }
            Provider::Azure => {
                env.insert(AZURE_ACCOUNT_NAME.into(), require(AZURE_ACCOUNT_NAME)?);
                env.insert(AZURE_ACCOUNT_KEY.into(), require(AZURE_ACCOUNT_KEY)?);
                format!("azure:{}:/{prefix}", require_bucket(cfg)?)
            }
            Provider::B2 => {
                env.insert(B2_ACCOUNT_ID.into(), require(B2_ACCOUNT_ID)?);
                env.insert(B2_ACCOUNT_KEY.into(), require(B2_ACCOUNT_KEY)?);
                format!("b2:{}:{prefix}", require_bucket(cfg)?)
            }
            Provider::Swift => {
                for (key, value) in secret {
                    if key.starts_with("OS_") || key.starts_with("ST_") {
                        env.insert(key.clone(), String::from_utf8_lossy(value).trim().to_string());
                    }
                }
                format!("swift:{}:/{prefix}", require_bucket(cfg)?)
            }
            Provider::Rest => {
                if cfg.endpoint.trim().is_empty() {
                    return Err(Error::Config("ENDPOINT is required for provider rest".into()));
                }
                let endpoint = cfg.endpoint.trim().trim_end_matches('/');
                let with_auth = match (get(REST_SERVER_USERNAME), get(REST_SERVER_PASSWORD)) {
                    (Some(user), Some(pass)) => match endpoint.split_once("://") {
                        Some((scheme, rest)) => format!(
                            "{scheme}://{}:{}@{rest}",
                            urlencoding::encode(&user),
                            urlencoding::encode(&pass)
                        ),
                        None => endpoint.to_string(),
                    },
                    _ => endpoint.to_string(),
                };
                format!("rest:{}", join_path(&with_auth, prefix))
            }
        };
        env.insert("RESTIC_REPOSITORY".into(), url);

        Ok(Self {
            provider,
            env,
            _scratch: scratch,
        })
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }
}

fn require_bucket(cfg: &Config) -> Result<&str> {
    let bucket = cfg.bucket.trim();
    if bucket.is_empty() {
        return Err(Error::Config(format!("BUCKET is required for provider {}", cfg.provider)));
    }
    Ok(bucket)
}

fn join_path(base: &str, prefix: &str) -> String {
    if prefix.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{prefix}")
    }
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep_last: Option<u32>,
    pub keep_hourly: Option<u32>,
    pub keep_daily: Option<u32>,
    pub keep_weekly: Option<u32>,
    pub keep_monthly: Option<u32>,
    pub keep_yearly: Option<u32>,
    pub keep_tags: Vec<String>,
    pub prune: bool,
    pub dry_run: bool,
}

impl RetentionPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            keep_last: cfg.retention_keep_last,
            keep_hourly: cfg.retention_keep_hourly,
            keep_daily: cfg.retention_keep_daily,
            keep_weekly: cfg.retention_keep_weekly,
            keep_monthly: cfg.retention_keep_monthly,
            keep_yearly: cfg.retention_keep_yearly,
            keep_tags: cfg.retention_keep_tags.clone(),
            prune: cfg.retention_prune,
            dry_run: cfg.retention_dry_run,
        }
    }

    /// True when no `--keep-*` rule is set; `forget` is skipped then.
    pub fn is_empty(&self) -> bool {
        self.keep_args().is_empty()
    }

    fn keep_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let counts = [
            ("--keep-last", self.keep_last),
            ("--keep-hourly", self.keep_hourly),
            ("--keep-daily", self.keep_daily),
            ("--keep-weekly", self.keep_weekly),
            ("--keep-monthly", self.keep_monthly),
            ("--keep-yearly", self.keep_yearly),
        ];
        for (flag, count) in counts {
            if let Some(n) = count.filter(|n| *n > 0) {
                args.extend([flag.to_string(), n.to_string()]);
            }
        }
        for tag in self.keep_tags.iter().filter(|t| !t.is_empty()) {
            args.extend(["--keep-tag".to_string(), tag.clone()]);
        }
        args
    }
}

// ---------------------------------------------------------------------------
// Backup summary
// ---------------------------------------------------------------------------

/// The `summary` message of `restic backup --json`.
#[derive(Debug, Deserialize)]
struct BackupSummary {
    message_type: String,
    #[serde(default)]
    files_new: u64,
    #[serde(default)]
    files_changed: u64,
    #[serde(default)]
    files_unmodified: u64,
    #[serde(default)]
    total_files_processed: u64,
    #[serde(default)]
    data_added: u64,
    #[serde(default)]
    total_bytes_processed: u64,
    #[serde(default)]
    total_duration: f64,
    #[serde(default)]
    snapshot_id: String,
}

/// Extract snapshot statistics from the JSON-lines output of a backup.
pub fn parse_backup_summary(stdout: &str, path: &Path) -> Result<SnapshotStats> {
    let summary = stdout
        .lines()
        .filter_map(|line| serde_json::from_str::<BackupSummary>(line.trim()).ok())
        .find(|m| m.message_type == "summary")
        .ok_or_else(|| Error::Command("restic backup printed no summary".into()))?;

    Ok(SnapshotStats {
        name: summary.snapshot_id,
        path: path.to_string_lossy().into_owned(),
        total_size: format_bytes(summary.total_bytes_processed),
        uploaded: format_bytes(summary.data_added),
        processing_time: format!("{:.3}s", summary.total_duration),
        file_stats: FileStats {
            total_files: summary.total_files_processed,
            new_files: summary.files_new,
            modified_files: summary.files_changed,
            unmodified_files: summary.files_unmodified,
        },
    })
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.3} {}", UNITS[unit])
}

// ---------------------------------------------------------------------------
// Archiver
// ---------------------------------------------------------------------------

pub struct Archiver {
    runner: Arc<dyn CommandRunner>,
    repository: Repository,
    priority: PrioritySettings,
    cache_dir: Option<PathBuf>,
    max_connections: u32,
}

impl Archiver {
    pub fn new(cfg: &Config, secret: &SecretData, runner: Arc<dyn CommandRunner>, priority: PrioritySettings) -> Result<Self> {
        let repository = Repository::new(cfg, secret)?;
        info!(provider = ?repository.provider(), "archival repository configured");
        Ok(Self {
            runner,
            repository,
            priority,
            cache_dir: cfg.enable_cache.then(|| cfg.scratch_dir.join("restic-cache")),
            max_connections: cfg.max_connections,
        })
    }

    fn restic<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut cmd = CommandSpec::new(RESTIC_CMD).args(args);
        cmd = match &self.cache_dir {
            Some(dir) => cmd.arg("--cache-dir").arg(dir.to_string_lossy()),
            None => cmd.arg("--no-cache"),
        };
        if let Some(backend) = self.repository.provider.connections_option().filter(|_| self.max_connections > 0) {
            cmd = cmd
                .arg("-o")
                .arg(format!("{backend}.connections={}", self.max_connections));
        }
        self.priority.apply(cmd.envs(&self.repository.env))
    }

    /// Initialise the repository unless it already exists.
    pub async fn ensure_repository(&self) -> Result<()> {
        if self.runner.run(&self.restic(["cat", "config"])).await.is_ok() {
            return Ok(());
        }
        info!("repository not found; initialising");
        self.runner.run(&self.restic(["init"])).await?;
        Ok(())
    }

    /// Back up `dir` recorded under `host`.
    pub async fn backup(&self, dir: &Path, host: &str) -> Result<SnapshotStats> {
        let cmd = self.restic(["backup".to_string(), dir.to_string_lossy().into_owned()])
            .args(["--json", "--host", host]);
        let output = self.runner.run(&cmd).await?;
        let stats = parse_backup_summary(&output.stdout, dir)?;
        info!(
            snapshot = %stats.name,
            uploaded = %stats.uploaded,
            files = stats.file_stats.total_files,
            "backup completed"
        );
        Ok(stats)
    }

    /// Remove snapshots of `host` not kept by `policy`.
    pub async fn apply_retention(&self, policy: &RetentionPolicy, host: &str) -> Result<()> {
        if policy.is_empty() {
            return Ok(());
        }
        let mut cmd = self.restic(["forget", "--host", host]).args(policy.keep_args());
        if policy.prune {
            cmd = cmd.arg("--prune");
        }
        if policy.dry_run {
            cmd = cmd.arg("--dry-run");
        }
        self.runner.run(&cmd).await?;
        info!(host, prune = policy.prune, "retention policy applied");
        Ok(())
    }

    /// Restore `include` from each snapshot, or from the latest one of
    /// `host` when `snapshots` is empty.
    pub async fn restore(&self, snapshots: &[String], host: &str, include: &Path) -> Result<()> {
        let latest = ["latest".to_string()];
        let ids = if snapshots.is_empty() { &latest[..] } else { snapshots };
        for id in ids {
            let cmd = self
                .restic(["restore", id.as_str(), "--target", "/", "--host", host])
                .arg("--include")
                .arg(include.to_string_lossy());
            self.runner.run(&cmd).await.map_err(|e| {
                warn!(snapshot = %id, error = %e, "restore failed");
                e
            })?;
            info!(snapshot = %id, host, "snapshot restored");
        }
        Ok(())
    }
}
