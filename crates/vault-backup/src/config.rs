//! Configuration loading and validation for `vault-backup`.
//!
//! All values are read from environment variables at startup. The archival
//! task container is parameterised this way; the command line only selects
//! `backup` or `restore`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Validated run configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Name of the connection binding (`AppBinding`) of the target server. **Required.**
    pub appbinding: String,

    /// Namespace of the binding. Falls back to `NAMESPACE`.
    #[serde(default)]
    pub appbinding_namespace: Option<String>,

    /// Namespace the task runs in.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Archival-tool storage provider (`local`, `s3`, `gcs`, `azure`, `b2`,
    /// `swift`, `rest`). **Required.**
    pub provider: String,

    /// Secret holding the storage-destination credentials. **Required.**
    pub storage_secret_name: String,

    /// Namespace of the storage Secret. **Required.**
    pub storage_secret_namespace: String,

    /// Working directory for the snapshot file and key files. **Required.**
    pub interim_data_dir: PathBuf,

    /// Upper bound on the readiness poll, in seconds.
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,

    /// Extra whitespace-separated arguments for the server CLI.
    #[serde(default)]
    pub vault_args: String,

    /// Key prefix of the key set being backed up, or written on restore.
    #[serde(default)]
    pub key_prefix: Option<String>,

    /// Key prefix the backed-up key set was saved under (restore only).
    #[serde(default)]
    pub old_key_prefix: Option<String>,

    /// Restore into a different cluster than the one that produced the snapshot.
    #[serde(default)]
    pub force: bool,

    /// Bucket or container name of the storage destination.
    #[serde(default)]
    pub bucket: String,

    /// Custom storage endpoint (S3-compatible, REST server, local path).
    #[serde(default)]
    pub endpoint: String,

    /// Storage region.
    #[serde(default)]
    pub region: String,

    /// Repository path inside the bucket.
    #[serde(default)]
    pub path_prefix: String,

    /// Scratch space for per-run temporary files (CA bundle, credentials).
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    #[serde(default)]
    pub enable_cache: bool,

    /// Upload/download connection limit for the archival tool; 0 means unset.
    #[serde(default)]
    pub max_connections: u32,

    /// Host identity recorded with each snapshot.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Host whose snapshot is restored. Falls back to `HOSTNAME`.
    #[serde(default)]
    pub source_hostname: Option<String>,

    /// Snapshot ids to restore; empty restores the latest.
    #[serde(default)]
    pub snapshots: Vec<String>,

    /// Directory receiving `output.json`.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    #[serde(default)]
    pub retention_keep_last: Option<u32>,
    #[serde(default)]
    pub retention_keep_hourly: Option<u32>,
    #[serde(default)]
    pub retention_keep_daily: Option<u32>,
    #[serde(default)]
    pub retention_keep_weekly: Option<u32>,
    #[serde(default)]
    pub retention_keep_monthly: Option<u32>,
    #[serde(default)]
    pub retention_keep_yearly: Option<u32>,
    #[serde(default)]
    pub retention_keep_tags: Vec<String>,
    #[serde(default)]
    pub retention_prune: bool,
    #[serde(default)]
    pub retention_dry_run: bool,

    /// Cluster name used in the default key prefix.
    #[serde(default)]
    pub cluster_name: Option<String>,

    /// Features the license must cover.
    #[serde(default = "default_license_features")]
    pub license_features: Vec<String>,

    /// Resource-priority settings; parsed by [`crate::priority`].
    #[serde(default)]
    pub nice_adjustment: Option<String>,
    #[serde(default)]
    pub ionice_class: Option<String>,
    #[serde(default)]
    pub ionice_class_data: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_namespace() -> String {
    "default".into()
}
fn default_wait_timeout() -> u64 {
    300
}
fn default_scratch_dir() -> PathBuf {
    PathBuf::from("/tmp")
}
fn default_hostname() -> String {
    "host-0".into()
}
fn default_license_features() -> Vec<String> {
    vec!["stash-enterprise".into(), "kubedb-ext-stash".into()]
}
fn default_log_level() -> String {
    "info".into()
}

const LIST_KEYS: [&str; 3] = ["snapshots", "retention_keep_tags", "license_features"];

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent or cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::load(config::Environment::default())
    }

    fn load(env: config::Environment) -> Result<Self> {
        let mut env = env
            .try_parsing(true)
            .list_separator(",");
        for key in LIST_KEYS {
            env = env.with_list_parse_key(key);
        }

        let cfg = config::Config::builder()
            .add_source(env)
            .build()
            .context("failed to build configuration from environment")?;

        let mut c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        // An empty list variable splits into a single blank entry.
        for list in [&mut c.snapshots, &mut c.retention_keep_tags, &mut c.license_features] {
            list.retain(|item| !item.trim().is_empty());
        }
        if c.license_features.is_empty() {
            c.license_features = default_license_features();
        }

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.appbinding, "APPBINDING")?;
        ensure_non_empty(&self.provider, "PROVIDER")?;
        ensure_non_empty(&self.storage_secret_name, "STORAGE_SECRET_NAME")?;
        ensure_non_empty(&self.storage_secret_namespace, "STORAGE_SECRET_NAMESPACE")?;
        ensure_non_empty(&self.interim_data_dir.to_string_lossy(), "INTERIM_DATA_DIR")?;

        if self.interim_data_dir.parent().is_none() {
            anyhow::bail!("INTERIM_DATA_DIR must not be the filesystem root");
        }
        if self.wait_timeout_secs == 0 {
            anyhow::bail!("WAIT_TIMEOUT_SECS must be > 0");
        }
        Ok(())
    }

    /// Namespace of the connection binding.
    pub fn binding_namespace(&self) -> &str {
        self.appbinding_namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(&self.namespace)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn source_hostname(&self) -> &str {
        self.source_hostname
            .as_deref()
            .filter(|h| !h.is_empty())
            .unwrap_or(&self.hostname)
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}
