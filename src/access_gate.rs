//! Access Gate (C9): computes a viewer's access tier for an audit and
//! redacts findings accordingly at read time (RULE-01..RULE-03), plus the
//! disclosure side effects (`notify_owner`, publish/unpublish) that move an
//! audit between tiers over time.

use crate::db::audits as audits_db;
use crate::error::Result;
use crate::models::{Audit, AccessTier, AuditStatus, Finding, FindingStatus, ReportSummary, Severity};
use crate::ownership::OwnershipResolver;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

/// Severities whose fields are nulled out for the `requester` tier
/// (RULE-02). `low` and `informational` findings stay fully visible.
const REQUESTER_REDACTED_SEVERITIES: [Severity; 3] =
    [Severity::Critical, Severity::High, Severity::Medium];

pub struct AccessGate<'a> {
    pool: &'a PgPool,
    ownership: &'a OwnershipResolver,
}

impl<'a> AccessGate<'a> {
    pub fn new(pool: &'a PgPool, ownership: &'a OwnershipResolver) -> Self {
        Self { pool, ownership }
    }

    /// `ResolveAccessTier(audit, viewer)`. `viewer_token` is only consulted
    /// when ownership must be checked against GitHub (cache miss).
    pub async fn resolve_tier(
        &self,
        audit: &Audit,
        viewer_id: Uuid,
        viewer_login: &str,
        viewer_token: &str,
    ) -> Result<AccessTier> {
        let is_requester = audit.requester_id == viewer_id;
        let is_public = audit.is_public;
        let auto_published =
            is_auto_published(audit.owner_notified, audit.publishable_after, Utc::now());

        // Ownership only needs resolving when it could change the outcome:
        // skip the GitHub round-trip once full access is already granted.
        let is_owner = if is_public || auto_published {
            false
        } else {
            let project = crate::db::projects::get_project(self.pool, audit.project_id).await?;
            self.ownership
                .resolve(viewer_id, viewer_login, &project.github_org, viewer_token, false)
                .await?
                .is_owner
        };

        Ok(resolve_tier(is_owner, is_requester, is_public, auto_published))
    }

    /// Build the tier-filtered report view for `GET /audit/{id}/report`.
    pub async fn report_view(&self, audit: &Audit, tier: AccessTier) -> Result<ReportView> {
        let findings = crate::db::findings::list_findings(self.pool, audit.id).await?;
        Ok(build_report_view(&findings, audit.report_summary.clone(), tier))
    }

    /// `notify_owner`: only valid once the audit has finished successfully
    /// (spec §4.9); never transitions `owner_notified` for an audit that is
    /// still running or that failed. Idempotent once notified — calling
    /// twice returns the existing `publishable_after` unchanged (RULE-22,
    /// P7).
    pub async fn notify_owner(&self, audit: &Audit) -> Result<Option<DateTime<Utc>>> {
        if audit.owner_notified {
            return Ok(audit.publishable_after);
        }
        if audit.status != AuditStatus::Completed {
            return Err(crate::error::AuditError::Forbidden(
                "owner can only be notified once the audit has completed".to_string(),
            ));
        }
        let now = Utc::now();
        let publishable_after = publishable_after_delta(audit.max_severity, now);
        audits_db::set_disclosure(self.pool, audit.id, publishable_after).await?;
        Ok(publishable_after)
    }

    pub async fn publish(&self, audit_id: Uuid) -> Result<()> {
        audits_db::set_public(self.pool, audit_id, true).await
    }

    /// Unpublish clears `is_public` and `publishable_after` (RULE-25).
    pub async fn unpublish(&self, audit_id: Uuid) -> Result<()> {
        audits_db::unpublish(self.pool, audit_id).await
    }
}

/// `isAutoPublished`: `publishable_after` is set, the owner has been
/// notified, and `now >= publishable_after` (RULE-24).
pub fn is_auto_published(
    owner_notified: bool,
    publishable_after: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    owner_notified && publishable_after.map(|t| now >= t).unwrap_or(false)
}

/// Pure tier computation, isolated from I/O so it can be exhaustively tested.
pub fn resolve_tier(
    is_owner: bool,
    is_requester: bool,
    is_public: bool,
    auto_published: bool,
) -> AccessTier {
    let full_access_for_all = is_public || auto_published;
    if full_access_for_all || is_owner {
        AccessTier::Owner
    } else if is_requester {
        AccessTier::Requester
    } else {
        AccessTier::Public
    }
}

/// `Delta(maxSeverity)`: critical -> 6 months, high/medium -> 3 months,
/// else -> no auto-publish (RULE-21).
pub fn publishable_after_delta(
    max_severity: Option<Severity>,
    notified_at: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match max_severity {
        Some(Severity::Critical) => Some(notified_at + Duration::days(30 * 6)),
        Some(Severity::High) | Some(Severity::Medium) => Some(notified_at + Duration::days(30 * 3)),
        _ => None,
    }
}

/// A finding view with tier-dependent fields nulled out.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RedactedFinding {
    pub id: Uuid,
    pub severity: Severity,
    pub cwe_id: Option<String>,
    pub repo_name: String,
    pub status: FindingStatus,
    pub file_path: Option<String>,
    pub line_start: Option<i64>,
    pub line_end: Option<i64>,
    pub cvss_score: Option<f64>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub exploitation: Option<String>,
    pub recommendation: Option<String>,
    pub code_snippet: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReportView {
    pub findings: Vec<RedactedFinding>,
    pub severity_counts: HashMap<String, i64>,
    pub redacted_severities: Vec<String>,
    pub report_summary: Option<ReportSummary>,
}

/// The repository name a finding belongs to, taken from the leading path
/// segment of `file_path` (findings are namespaced `<repoName>/<relpath>`).
pub fn repo_name_of(file_path: &str) -> String {
    file_path
        .split('/')
        .next()
        .unwrap_or(file_path)
        .to_string()
}

fn redact_for_requester(f: &Finding) -> RedactedFinding {
    let repo_name = repo_name_of(&f.file_path);
    if REQUESTER_REDACTED_SEVERITIES.contains(&f.severity) {
        RedactedFinding {
            id: f.id,
            severity: f.severity,
            cwe_id: f.cwe_id.clone(),
            repo_name,
            status: f.status,
            file_path: None,
            line_start: None,
            line_end: None,
            cvss_score: None,
            title: None,
            description: None,
            exploitation: None,
            recommendation: None,
            code_snippet: None,
        }
    } else {
        full_view(f, repo_name)
    }
}

fn full_view(f: &Finding, repo_name: String) -> RedactedFinding {
    RedactedFinding {
        id: f.id,
        severity: f.severity,
        cwe_id: f.cwe_id.clone(),
        repo_name,
        status: f.status,
        file_path: Some(f.file_path.clone()),
        line_start: Some(f.line_start),
        line_end: Some(f.line_end),
        cvss_score: f.cvss_score,
        title: Some(f.title.clone()),
        description: Some(f.description.clone()),
        exploitation: f.exploitation.clone(),
        recommendation: f.recommendation.clone(),
        code_snippet: f.code_snippet.clone(),
    }
}

/// Build the tier-filtered report view (RULE-01..RULE-03, P5).
pub fn build_report_view(
    findings: &[Finding],
    report_summary: Option<ReportSummary>,
    tier: AccessTier,
) -> ReportView {
    match tier {
        AccessTier::Owner => ReportView {
            findings: findings
                .iter()
                .map(|f| full_view(f, repo_name_of(&f.file_path)))
                .collect(),
            severity_counts: severity_counts(findings),
            redacted_severities: Vec::new(),
            report_summary,
        },
        AccessTier::Requester => ReportView {
            findings: findings.iter().map(redact_for_requester).collect(),
            severity_counts: severity_counts(findings),
            redacted_severities: REQUESTER_REDACTED_SEVERITIES
                .iter()
                .map(|s| s.as_str().to_string())
                .collect(),
            report_summary,
        },
        AccessTier::Public => {
            let mut present: Vec<Severity> = findings.iter().map(|f| f.severity).collect();
            present.sort();
            present.dedup();
            ReportView {
                findings: Vec::new(),
                severity_counts: severity_counts(findings),
                redacted_severities: present.iter().map(|s| s.as_str().to_string()).collect(),
                report_summary,
            }
        }
    }
}

fn severity_counts(findings: &[Finding]) -> HashMap<String, i64> {
    let mut counts = HashMap::new();
    for f in findings {
        *counts.entry(f.severity.as_str().to_string()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn finding(id: u8, severity: Severity, file: &str) -> Finding {
        Finding {
            id: Uuid::from_u128(id as u128),
            audit_id: Uuid::nil(),
            component_id: None,
            file_path: file.to_string(),
            line_start: 10,
            line_end: 12,
            severity,
            cwe_id: Some("CWE-89".to_string()),
            cvss_score: Some(9.1),
            title: "SQL Injection".to_string(),
            description: "desc".to_string(),
            exploitation: Some("poc".to_string()),
            recommendation: Some("fix".to_string()),
            code_snippet: Some("query(...)".to_string()),
            status: FindingStatus::Open,
            fingerprint: "abc".to_string(),
            resolved_in_audit_id: None,
        }
    }

    #[test]
    fn tier_owner_wins_over_everything_when_public() {
        assert_eq!(
            resolve_tier(false, false, true, false),
            AccessTier::Owner
        );
    }

    #[test]
    fn tier_auto_published_grants_owner_tier() {
        assert_eq!(resolve_tier(false, false, false, true), AccessTier::Owner);
    }

    #[test]
    fn tier_requester_without_ownership_or_public() {
        assert_eq!(resolve_tier(false, true, false, false), AccessTier::Requester);
    }

    #[test]
    fn tier_defaults_to_public() {
        assert_eq!(resolve_tier(false, false, false, false), AccessTier::Public);
    }

    #[test]
    fn auto_published_requires_both_notified_and_elapsed() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 4, 2, 0, 0, 0).unwrap();
        assert!(!is_auto_published(true, Some(later), t0));
        assert!(is_auto_published(true, Some(t0), later));
        assert!(!is_auto_published(false, Some(t0), later));
    }

    #[test]
    fn publishable_after_delta_by_severity() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            publishable_after_delta(Some(Severity::Critical), t0),
            Some(t0 + Duration::days(180))
        );
        assert_eq!(
            publishable_after_delta(Some(Severity::High), t0),
            Some(t0 + Duration::days(90))
        );
        assert_eq!(
            publishable_after_delta(Some(Severity::Medium), t0),
            Some(t0 + Duration::days(90))
        );
        assert_eq!(publishable_after_delta(Some(Severity::Low), t0), None);
        assert_eq!(publishable_after_delta(None, t0), None);
    }

    #[test]
    fn owner_tier_redacts_nothing() {
        let findings = vec![finding(1, Severity::Critical, "svc/a.rs")];
        let view = build_report_view(&findings, None, AccessTier::Owner);
        assert!(view.findings[0].title.is_some());
        assert!(view.redacted_severities.is_empty());
    }

    #[test]
    fn requester_tier_redacts_exactly_critical_high_medium() {
        let findings = vec![
            finding(1, Severity::Critical, "svc/a.rs"),
            finding(2, Severity::Low, "svc/b.rs"),
        ];
        let view = build_report_view(&findings, None, AccessTier::Requester);
        assert!(view.findings[0].title.is_none());
        assert_eq!(view.findings[0].repo_name, "svc");
        assert!(view.findings[1].title.is_some(), "low severity stays visible");
        assert_eq!(view.redacted_severities.len(), 3);
    }

    #[test]
    fn public_tier_returns_zero_findings() {
        let findings = vec![finding(1, Severity::Critical, "svc/a.rs")];
        let view = build_report_view(&findings, None, AccessTier::Public);
        assert!(view.findings.is_empty());
        assert_eq!(view.redacted_severities, vec!["critical".to_string()]);
        assert_eq!(view.severity_counts.get("critical"), Some(&1));
    }

    #[test]
    fn repo_name_of_takes_leading_segment() {
        assert_eq!(repo_name_of("backend/src/main.rs"), "backend");
        assert_eq!(repo_name_of("justafile.rs"), "justafile.rs");
    }
}
