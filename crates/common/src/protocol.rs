//! Wire and record types exchanged with external systems.
//!
//! The server types mirror the JSON bodies of the secrets server's
//! `sys/health` and `sys/leader` endpoints. The output records are the
//! per-host status documents written to `output.json` at the end of a run.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Server API
// ---------------------------------------------------------------------------

/// Response body for `GET /v1/sys/health`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthResponse {
    pub initialized: bool,
    pub sealed: bool,
    pub standby: bool,
    pub performance_standby: bool,
    pub version: String,
    pub cluster_name: String,
}

/// Response body for `GET /v1/sys/leader`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderResponse {
    pub ha_enabled: bool,
    pub is_self: bool,
    pub leader_address: String,
    pub leader_cluster_address: String,
}

// ---------------------------------------------------------------------------
// Output records
// ---------------------------------------------------------------------------

/// Reference to the object a backup or restore targeted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl TargetRef {
    /// Reference to a connection binding (`AppBinding`).
    pub fn app_binding(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            api_version: "appcatalog.appscode.com/v1alpha1".into(),
            kind: "AppBinding".into(),
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

/// Final phase of the work done for one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostPhase {
    Succeeded,
    Failed,
}

/// File counters reported by the archival tool for one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStats {
    pub total_files: u64,
    pub new_files: u64,
    pub modified_files: u64,
    pub unmodified_files: u64,
}

/// Statistics for one snapshot taken by the archival tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStats {
    pub name: String,
    pub path: String,
    pub total_size: String,
    pub uploaded: String,
    pub processing_time: String,
    pub file_stats: FileStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostBackupStats {
    pub hostname: String,
    pub phase: HostPhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshots: Vec<SnapshotStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupTargetStatus {
    #[serde(rename = "ref")]
    pub target: TargetRef,
    pub stats: Vec<HostBackupStats>,
}

/// Output record of a backup run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupOutput {
    pub backup_target_status: BackupTargetStatus,
}

impl BackupOutput {
    /// Record for a run that succeeded on `hostname`.
    pub fn succeeded(
        target: TargetRef,
        hostname: impl Into<String>,
        snapshots: Vec<SnapshotStats>,
        duration: impl Into<String>,
    ) -> Self {
        Self {
            backup_target_status: BackupTargetStatus {
                target,
                stats: vec![HostBackupStats {
                    hostname: hostname.into(),
                    phase: HostPhase::Succeeded,
                    snapshots,
                    duration: Some(duration.into()),
                    error: None,
                }],
            },
        }
    }

    /// Record for a run that failed on `hostname`.
    pub fn failed(target: TargetRef, hostname: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            backup_target_status: BackupTargetStatus {
                target,
                stats: vec![HostBackupStats {
                    hostname: hostname.into(),
                    phase: HostPhase::Failed,
                    snapshots: Vec::new(),
                    duration: None,
                    error: Some(error.into()),
                }],
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRestoreStats {
    pub hostname: String,
    pub phase: HostPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreTargetStatus {
    #[serde(rename = "ref")]
    pub target: TargetRef,
    pub stats: Vec<HostRestoreStats>,
}

/// Output record of a restore run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOutput {
    pub restore_target_status: RestoreTargetStatus,
}

impl RestoreOutput {
    pub fn succeeded(target: TargetRef, hostname: impl Into<String>, duration: impl Into<String>) -> Self {
        Self {
            restore_target_status: RestoreTargetStatus {
                target,
                stats: vec![HostRestoreStats {
                    hostname: hostname.into(),
                    phase: HostPhase::Succeeded,
                    duration: Some(duration.into()),
                    error: None,
                }],
            },
        }
    }

    pub fn failed(target: TargetRef, hostname: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            restore_target_status: RestoreTargetStatus {
                target,
                stats: vec![HostRestoreStats {
                    hostname: hostname.into(),
                    phase: HostPhase::Failed,
                    duration: None,
                    error: Some(error.into()),
                }],
            },
        }
    }
}
