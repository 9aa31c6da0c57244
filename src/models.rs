//! Core data model. Plain structs/enums; persistence lives in `db::*`.
//! These types are shared between the orchestrator, the access gate, and
//! the HTTP layer, so they derive `Serialize`/`Deserialize` uniformly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Audit level, controlling the fraction of the token budget spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    Full,
    Thorough,
    Opportunistic,
}

impl AuditLevel {
    /// Budget fraction of total project tokens allotted to this level.
    pub fn budget_pct(self) -> f64 {
        match self {
            AuditLevel::Full => 1.0,
            AuditLevel::Thorough => 0.33,
            AuditLevel::Opportunistic => 0.10,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuditLevel::Full => "full",
            AuditLevel::Thorough => "thorough",
            AuditLevel::Opportunistic => "opportunistic",
        }
    }
}

impl std::str::FromStr for AuditLevel {
    type Err = crate::error::AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(AuditLevel::Full),
            "thorough" => Ok(AuditLevel::Thorough),
            "opportunistic" => Ok(AuditLevel::Opportunistic),
            other => Err(crate::error::AuditError::config(format!(
                "unknown audit level: {other}"
            ))),
        }
    }
}

/// Audit lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Cloning,
    Classifying,
    Planning,
    Analyzing,
    Synthesizing,
    Completed,
    CompletedWithWarnings,
    Failed,
}

impl AuditStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AuditStatus::Completed | AuditStatus::CompletedWithWarnings | AuditStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuditStatus::Cloning => "cloning",
            AuditStatus::Classifying => "classifying",
            AuditStatus::Planning => "planning",
            AuditStatus::Analyzing => "analyzing",
            AuditStatus::Synthesizing => "synthesizing",
            AuditStatus::Completed => "completed",
            AuditStatus::CompletedWithWarnings => "completed_with_warnings",
            AuditStatus::Failed => "failed",
        }
    }
}

/// Finding severity, ordered ascending so the max over a set of findings
/// can be computed with a plain `max()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Informational,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Informational => "informational",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = crate::error::AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Severity::Critical),
            "high" => Ok(Severity::High),
            "medium" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            "informational" => Ok(Severity::Informational),
            other => Err(crate::error::AuditError::other(format!(
                "unknown severity: {other}"
            ))),
        }
    }
}

/// Finding status (mutable only by the project owner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingStatus {
    Open,
    Fixed,
    FalsePositive,
    Accepted,
    WontFix,
}

impl FindingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FindingStatus::Open => "open",
            FindingStatus::Fixed => "fixed",
            FindingStatus::FalsePositive => "false_positive",
            FindingStatus::Accepted => "accepted",
            FindingStatus::WontFix => "wont_fix",
        }
    }
}

impl std::str::FromStr for FindingStatus {
    type Err = crate::error::AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(FindingStatus::Open),
            "fixed" => Ok(FindingStatus::Fixed),
            "false_positive" => Ok(FindingStatus::FalsePositive),
            "accepted" => Ok(FindingStatus::Accepted),
            "wont_fix" => Ok(FindingStatus::WontFix),
            other => Err(crate::error::AuditError::other(format!(
                "unknown finding status: {other}"
            ))),
        }
    }
}

/// The role a component plays in its system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentRole {
    Server,
    Client,
    Library,
    Cli,
    Worker,
    Shared,
    Config,
    Test,
}

impl ComponentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ComponentRole::Server => "server",
            ComponentRole::Client => "client",
            ComponentRole::Library => "library",
            ComponentRole::Cli => "cli",
            ComponentRole::Worker => "worker",
            ComponentRole::Shared => "shared",
            ComponentRole::Config => "config",
            ComponentRole::Test => "test",
        }
    }
}

/// Where the threat model used for classification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatModelSource {
    Repo,
    Generated,
}

/// Access tier computed per report read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessTier {
    Owner,
    Requester,
    Public,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub github_org: String,
    pub github_entity_type: String,
    pub created_by: Uuid,
    pub name: String,
    pub category: Option<String>,
    pub description: Option<String>,
    pub involved_parties: Option<serde_json::Value>,
    pub threat_model: Option<serde_json::Value>,
    pub threat_model_source: Option<ThreatModelSource>,
    pub threat_model_files: Option<Vec<String>>,
    pub classification_audit_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: Uuid,
    pub repo_url: String,
    pub repo_name: String,
    pub local_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRepo {
    pub project_id: Uuid,
    pub repo_id: Uuid,
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub id: Uuid,
    pub project_id: Uuid,
    pub repo_id: Uuid,
    pub name: String,
    pub description: String,
    pub role: ComponentRole,
    pub file_patterns: Vec<String>,
    pub languages: Vec<String>,
    pub security_profile: Option<serde_json::Value>,
    pub estimated_files: i64,
    pub estimated_tokens: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub id: Uuid,
    pub project_id: Uuid,
    pub repo_id: Option<Uuid>,
    pub name: String,
    pub version: Option<String>,
    pub ecosystem: String,
    pub source_repo_url: Option<String>,
    pub linked_project_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    pub id: Uuid,
    pub project_id: Uuid,
    pub requester_id: Uuid,
    pub level: AuditLevel,
    pub is_incremental: bool,
    pub base_audit_id: Option<Uuid>,
    pub component_ids: Option<Vec<Uuid>>,
    pub status: AuditStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_files: i64,
    pub total_tokens: i64,
    pub files_to_analyze: i64,
    pub tokens_to_analyze: i64,
    pub files_analyzed: i64,
    pub progress_detail: ProgressDetail,
    pub report_summary: Option<ReportSummary>,
    pub max_severity: Option<Severity>,
    pub actual_cost_usd: f64,
    pub error_message: Option<String>,
    pub is_public: bool,
    pub publishable_after: Option<DateTime<Utc>>,
    pub owner_notified: bool,
    pub owner_notified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub diff_files_added: Option<i64>,
    pub diff_files_modified: Option<i64>,
    pub diff_files_deleted: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSummary {
    pub executive_summary: String,
    pub security_posture: String,
    pub responsible_disclosure: Option<String>,
    pub severity_counts: HashMap<String, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditCommit {
    pub audit_id: Uuid,
    pub repo_id: Uuid,
    pub commit_sha: String,
    pub branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: Uuid,
    pub audit_id: Uuid,
    pub component_id: Option<Uuid>,
    pub file_path: String,
    pub line_start: i64,
    pub line_end: i64,
    pub severity: Severity,
    pub cwe_id: Option<String>,
    pub cvss_score: Option<f64>,
    pub title: String,
    pub description: String,
    pub exploitation: Option<String>,
    pub recommendation: Option<String>,
    pub code_snippet: Option<String>,
    pub status: FindingStatus,
    pub fingerprint: String,
    pub resolved_in_audit_id: Option<Uuid>,
}

/// Tagged progress record. The `type` discriminator is persisted alongside
/// the payload so a reader can tell which phase produced a given row
/// without inspecting its shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressDetail {
    Cloning {
        current: i64,
        total: i64,
        repo_name: String,
        warnings: Vec<String>,
    },
    Planning {
        warnings: Vec<String>,
    },
    Analyzing {
        files: Vec<FileProgress>,
        warnings: Vec<String>,
    },
    Done {
        files: Vec<FileProgress>,
        warnings: Vec<String>,
    },
}

impl ProgressDetail {
    /// Mutable access to the `warnings` vec, regardless of variant —
    /// callers append non-fatal conditions as they occur.
    pub fn warnings_mut(&mut self) -> &mut Vec<String> {
        match self {
            ProgressDetail::Cloning { warnings, .. }
            | ProgressDetail::Planning { warnings }
            | ProgressDetail::Analyzing { warnings, .. }
            | ProgressDetail::Done { warnings, .. } => warnings,
        }
    }

    pub fn warnings(&self) -> &[String] {
        match self {
            ProgressDetail::Cloning { warnings, .. }
            | ProgressDetail::Planning { warnings }
            | ProgressDetail::Analyzing { warnings, .. }
            | ProgressDetail::Done { warnings, .. } => warnings,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileProgressStatus {
    Pending,
    Done,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileProgress {
    pub file: String,
    pub status: FileProgressStatus,
    pub findings_count: i64,
}

/// A file discovered by the repo store's code-file scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannedFile {
    pub relative_path: String,
    pub size: u64,
    pub rough_tokens: i64,
}
