//! Command specifications for the server CLI and the process runner.
//!
//! A [`Session`] carries the environment every server CLI call needs
//! (CA bundle, token, address). It is built once per run and turned into
//! immutable [`CommandSpec`] values, which a [`CommandRunner`] executes.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use common::{Error, Result};
use tracing::{debug, info};

use crate::binding::{AppBinding, TOKEN_DATA_KEY};
use crate::cluster::{required_secret, Cluster};

pub const VAULT_CMD: &str = "vault";
pub const SNAPSHOT_FILE: &str = "backup.snap";
pub const CA_FILE: &str = "ca.crt";

pub const ENV_VAULT_ADDR: &str = "VAULT_ADDR";
pub const ENV_VAULT_TOKEN: &str = "VAULT_TOKEN";
pub const ENV_VAULT_CACERT: &str = "VAULT_CACERT";

/// Environment variables whose values never appear in debug output.
const SENSITIVE_ENV: &[&str] = &[
    ENV_VAULT_TOKEN,
    "AWS_SECRET_ACCESS_KEY",
    "AZURE_ACCOUNT_KEY",
    "B2_ACCOUNT_KEY",
    "RESTIC_PASSWORD",
    "OS_PASSWORD",
    "REST_SERVER_PASSWORD",
];

// ---------------------------------------------------------------------------
// Command specification
// ---------------------------------------------------------------------------

/// A program, its arguments and the extra environment of the child.
///
/// The child inherits the parent's environment; `env` is layered on top.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Append user-supplied arguments, split on whitespace.
    pub fn user_args(self, raw: &str) -> Self {
        self.args(raw.split_whitespace())
    }

    /// Run this command through a wrapper such as `nice -n 5`.
    pub fn wrapped_in(self, wrapper: &[String]) -> Self {
        let Some((program, rest)) = wrapper.split_first() else {
            return self;
        };
        let mut args: Vec<String> = rest.to_vec();
        args.push(self.program);
        args.extend(self.args);
        Self {
            program: program.clone(),
            args,
            env: self.env,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    #[cfg(test)]
    pub fn get_env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// `program arg1 arg2 ...`, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env: BTreeMap<&str, &str> = self
            .env
            .iter()
            .map(|(k, v)| {
                let shown = if SENSITIVE_ENV.contains(&k.as_str()) { "[REDACTED]" } else { v.as_str() };
                (k.as_str(), shown)
            })
            .collect();
        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &env)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. A non-zero exit status is [`Error::Command`].
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput>;
}

/// Runs commands as child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %command.display(), "running");
        let output = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Command(format!("failed to start {}: {e}", command.program)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(Error::Command(format!(
                "{} exited with {}: {}",
                command.program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(CommandOutput { stdout, stderr })
    }
}

// ---------------------------------------------------------------------------
// Server CLI session
// ---------------------------------------------------------------------------

/// Environment shared by every server CLI call of one run.
///
/// Each `with_*` call returns a new session; the CA file lives in a
/// scratch directory removed when the last clone is dropped.
#[derive(Clone, Default)]
pub struct Session {
    env: BTreeMap<String, String>,
    scratch: Option<Arc<tempfile::TempDir>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.env.get(ENV_VAULT_ADDR))
            .field("ca_cert", &self.env.get(ENV_VAULT_CACERT))
            .field("has_token", &self.env.contains_key(ENV_VAULT_TOKEN))
            .finish()
    }
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `ca_bundle` to a fresh directory under `scratch_root` and point
    /// `VAULT_CACERT` at it. Without a bundle the session is unchanged.
    pub fn with_ca_bundle(self, ca_bundle: Option<&[u8]>, scratch_root: &Path) -> Result<Self> {
        let Some(ca) = ca_bundle else {
            return Ok(self);
        };
        let dir = tempfile::Builder::new()
            .prefix("vault-tls-")
            .tempdir_in(scratch_root)
            .map_err(|e| Error::Write(format!("scratch dir in {}: {e}", scratch_root.display())))?;
        let path = dir.path().join(CA_FILE);
        fs::write(&path, ca).map_err(|e| Error::Write(format!("write {}: {e}", path.display())))?;

        let mut next = self;
        next.env
            .insert(ENV_VAULT_CACERT.into(), path.to_string_lossy().into_owned());
        next.scratch = Some(Arc::new(dir));
        Ok(next)
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.env.insert(ENV_VAULT_TOKEN.into(), token.to_string());
        self
    }

    pub fn with_address(mut self, address: &str) -> Self {
        self.env.insert(ENV_VAULT_ADDR.into(), address.to_string());
        self
    }

    #[cfg(test)]
    pub fn ca_cert_path(&self) -> Option<PathBuf> {
        self.env.get(ENV_VAULT_CACERT).map(PathBuf::from)
    }

    /// `vault operator raft snapshot save <path> [user args]`.
    pub fn snapshot_save(&self, snapshot: &Path, user_args: &str) -> CommandSpec {
        CommandSpec::new(VAULT_CMD)
            .args(["operator", "raft", "snapshot", "save"])
            .arg(snapshot.to_string_lossy())
            .user_args(user_args)
            .envs(&self.env)
    }

    /// `vault operator raft snapshot restore [-force] <path> [user args]`.
    pub fn snapshot_restore(&self, snapshot: &Path, force: bool, user_args: &str) -> CommandSpec {
        let mut cmd = CommandSpec::new(VAULT_CMD).args(["operator", "raft", "snapshot", "restore"]);
        if force {
            cmd = cmd.arg("-force");
        }
        cmd.arg(snapshot.to_string_lossy())
            .user_args(user_args)
            .envs(&self.env)
    }
}

/// Read the backup token Secret of `binding`, apply its secret transforms
/// and return the `token` entry.
pub async fn backup_token(cluster: &dyn Cluster, binding: &AppBinding) -> Result<String> {
    let secret_name = binding.parameters().backup_token_secret(&binding.name);
    let mut data = required_secret(cluster, &binding.namespace, &secret_name).await?;
    binding.transform_secret(cluster, &mut data).await?;

    let token = data.remove(TOKEN_DATA_KEY).ok_or_else(|| {
        Error::NotFound(format!(
            "{TOKEN_DATA_KEY} not found in secret {}/{secret_name}",
            binding.namespace
        ))
    })?;
    let token = String::from_utf8(token)
        .map_err(|_| Error::Config(format!("token in secret {}/{secret_name} is not UTF-8", binding.namespace)))?;
    info!(secret = %secret_name, "backup token loaded");
    Ok(token.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::tests::sample_binding;
    use crate::cluster::fake::FakeCluster;

    #[test]
    fn user_args_are_split_on_whitespace() {
        let cmd = CommandSpec::new("vault").arg("status").user_args("  -tls-skip-verify\t-format=json ");
        assert_eq!(cmd.get_args(), ["status", "-tls-skip-verify", "-format=json"]);
    }

    #[test]
    fn snapshot_save_command() {
        let s = Session::new().with_token("s.tok").with_address("https://vault-0.vault-internal.demo.svc:8200");
        let cmd = s.snapshot_save(Path::new("/data/backup.snap"), "-namespace=admin");
        assert_eq!(cmd.program(), "vault");
        assert_eq!(
            cmd.get_args(),
            ["operator", "raft", "snapshot", "save", "/data/backup.snap", "-namespace=admin"]
        );
        assert_eq!(cmd.get_env(ENV_VAULT_TOKEN), Some("s.tok"));
        assert_eq!(cmd.get_env(ENV_VAULT_ADDR), Some("https://vault-0.vault-internal.demo.svc:8200"));
    }

    #[test]
    fn snapshot_restore_places_force_before_path() {
        let s = Session::new();
        let forced = s.snapshot_restore(Path::new("/d/backup.snap"), true, "");
        assert_eq!(
            forced.get_args(),
            ["operator", "raft", "snapshot", "restore", "-force", "/d/backup.snap"]
        );
        let plain = s.snapshot_restore(Path::new("/d/backup.snap"), false, "");
        assert!(!plain.get_args().iter().any(|a| a == "-force"));
    }

    #[test]
    fn ca_bundle_is_written_and_exported() {
        let scratch = tempfile::tempdir().unwrap();
        let s = Session::new()
            .with_ca_bundle(Some(b"-----BEGIN CERTIFICATE-----"), scratch.path())
            .unwrap();
        let path = s.ca_cert_path().unwrap();
        assert!(path.starts_with(scratch.path()));
        assert!(path.ends_with(CA_FILE));
        assert_eq!(fs::read(&path).unwrap(), b"-----BEGIN CERTIFICATE-----");

        let cmd = s.snapshot_save(Path::new("/x"), "");
        assert_eq!(cmd.get_env(ENV_VAULT_CACERT), Some(path.to_str().unwrap()));

        drop(cmd);
        drop(s);
        assert!(!path.exists());
    }

    #[test]
    fn no_ca_bundle_leaves_session_unchanged() {
        let scratch = tempfile::tempdir().unwrap();
        let s = Session::new().with_ca_bundle(None, scratch.path()).unwrap();
        assert!(s.ca_cert_path().is_none());
        assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn sessions_are_values() {
        let base = Session::new().with_address("https://a");
        let with_token = base.clone().with_token("t");
        assert!(base.snapshot_save(Path::new("/x"), "").get_env(ENV_VAULT_TOKEN).is_none());
        assert_eq!(with_token.snapshot_save(Path::new("/x"), "").get_env(ENV_VAULT_TOKEN), Some("t"));
    }

    #[test]
    fn debug_redacts_token() {
        let cmd = Session::new().with_token("s.very-secret").snapshot_save(Path::new("/x"), "");
        let shown = format!("{cmd:?}");
        assert!(!shown.contains("s.very-secret"));
        assert!(shown.contains("[REDACTED]"));
        assert!(!format!("{:?}", Session::new().with_token("s.very-secret")).contains("s.very-secret"));
    }

    #[test]
    fn wrapped_command_keeps_env() {
        let cmd = CommandSpec::new("restic")
            .arg("backup")
            .env("RESTIC_REPOSITORY", "s3:bucket")
            .wrapped_in(&["nice".into(), "-n".into(), "5".into()]);
        assert_eq!(cmd.program(), "nice");
        assert_eq!(cmd.get_args(), ["-n", "5", "restic", "backup"]);
        assert_eq!(cmd.get_env("RESTIC_REPOSITORY"), Some("s3:bucket"));
    }

    #[tokio::test]
    async fn shell_runner_reports_non_zero_exit() {
        let err = ShellRunner
            .run(&CommandSpec::new("sh").args(["-c", "echo oops >&2; exit 3"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Command(_)));
        assert!(err.to_string().contains("oops"));
    }

    #[tokio::test]
    async fn shell_runner_passes_env() {
        let out = ShellRunner
            .run(&CommandSpec::new("sh").args(["-c", "printf %s \"$VAULT_ADDR\""]).env(ENV_VAULT_ADDR, "https://v:8200"))
            .await
            .unwrap();
        assert_eq!(out.stdout, "https://v:8200");
    }

    #[tokio::test]
    async fn backup_token_defaults_to_binding_named_secret() {
        let cluster = FakeCluster::default().with_secret("demo", "vault-backup-token", &[("token", "s.backup\n")]);
        let token = backup_token(&cluster, &sample_binding()).await.unwrap();
        assert_eq!(token, "s.backup");
    }

    #[tokio::test]
    async fn backup_token_missing_secret_is_not_found() {
        let err = backup_token(&FakeCluster::default(), &sample_binding()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
