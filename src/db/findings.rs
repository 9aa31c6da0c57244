//! Finding persistence: fingerprint-unique inserts, status mutation,
//! and the bookkeeping incremental audits use to carry findings forward
//! between runs.

use crate::error::Result;
use crate::models::{Finding, FindingStatus, Severity};
use sqlx::{PgPool, Row};
use uuid::Uuid;

fn row_to_finding(row: &sqlx::postgres::PgRow) -> Result<Finding> {
    let severity: String = row.try_get("severity")?;
    let status: String = row.try_get("status")?;
    Ok(Finding {
        id: row.try_get("id")?,
        audit_id: row.try_get("audit_id")?,
        component_id: row.try_get("component_id")?,
        file_path: row.try_get("file_path")?,
        line_start: row.try_get("line_start")?,
        line_end: row.try_get("line_end")?,
        severity: severity.parse().unwrap_or(Severity::Informational),
        cwe_id: row.try_get("cwe_id")?,
        cvss_score: row.try_get("cvss_score")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        exploitation: row.try_get("exploitation")?,
        recommendation: row.try_get("recommendation")?,
        code_snippet: row.try_get("code_snippet")?,
        status: status.parse().unwrap_or(FindingStatus::Open),
        fingerprint: row.try_get("fingerprint")?,
        resolved_in_audit_id: row.try_get("resolved_in_audit_id")?,
    })
}

/// Compute a finding's dedup fingerprint: first 16 hex chars of
/// SHA-256(`file:lineStart-lineEnd:title:snippet[0..100]`).
pub fn fingerprint(file: &str, line_start: i64, line_end: i64, title: &str, snippet: &str) -> String {
    use sha2::{Digest, Sha256};

    let snippet_prefix: String = snippet.chars().take(100).collect();
    let input = format!("{file}:{line_start}-{line_end}:{title}:{snippet_prefix}");
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Insert findings for an audit, skipping any whose fingerprint already
/// exists in this audit. Returns the findings actually inserted.
pub async fn insert_findings(
    pool: &PgPool,
    audit_id: Uuid,
    findings: Vec<Finding>,
) -> Result<Vec<Finding>> {
    let mut tx = pool.begin().await?;
    let mut inserted = Vec::with_capacity(findings.len());

    for f in findings {
        let result = sqlx::query(
            r#"
            INSERT INTO audit_findings
                (id, audit_id, component_id, file_path, line_start, line_end, severity,
                 cwe_id, cvss_score, title, description, exploitation, recommendation,
                 code_snippet, status, fingerprint, resolved_in_audit_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (audit_id, fingerprint) DO NOTHING
            "#,
        )
        .bind(f.id)
        .bind(audit_id)
        .bind(f.component_id)
        .bind(&f.file_path)
        .bind(f.line_start)
        .bind(f.line_end)
        .bind(f.severity.as_str())
        .bind(&f.cwe_id)
        .bind(f.cvss_score)
        .bind(&f.title)
        .bind(&f.description)
        .bind(&f.exploitation)
        .bind(&f.recommendation)
        .bind(&f.code_snippet)
        .bind(f.status.as_str())
        .bind(&f.fingerprint)
        .bind(f.resolved_in_audit_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() > 0 {
            inserted.push(f);
        }
    }

    tx.commit().await?;
    Ok(inserted)
}

pub async fn existing_fingerprints(pool: &PgPool, audit_id: Uuid) -> Result<std::collections::HashSet<String>> {
    let rows = sqlx::query("SELECT fingerprint FROM audit_findings WHERE audit_id = $1")
        .bind(audit_id)
        .fetch_all(pool)
        .await?;
    rows.into_iter()
        .map(|r| r.try_get::<String, _>("fingerprint").map_err(Into::into))
        .collect()
}

pub async fn list_findings(pool: &PgPool, audit_id: Uuid) -> Result<Vec<Finding>> {
    let rows = sqlx::query("SELECT * FROM audit_findings WHERE audit_id = $1 ORDER BY severity DESC, file_path")
        .bind(audit_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_finding).collect()
}

/// Findings with `status = 'open'` for a base audit, used when an
/// incremental audit inherits unresolved findings from its predecessor.
pub async fn list_open_findings(pool: &PgPool, audit_id: Uuid) -> Result<Vec<Finding>> {
    let rows = sqlx::query("SELECT * FROM audit_findings WHERE audit_id = $1 AND status = 'open'")
        .bind(audit_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_finding).collect()
}

/// Mark a base finding `resolved_in_audit_id` when its file was deleted in
/// the new audit and the finding is carried forward as `fixed`.
pub async fn set_resolved_in(pool: &PgPool, finding_id: Uuid, new_audit_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE audit_findings SET resolved_in_audit_id = $2 WHERE id = $1")
        .bind(finding_id)
        .bind(new_audit_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Mutate a finding's status. Callers must authorize (project owner only)
/// before calling this — see `access_gate`.
pub async fn set_status(pool: &PgPool, finding_id: Uuid, status: FindingStatus) -> Result<()> {
    sqlx::query("UPDATE audit_findings SET status = $2 WHERE id = $1")
        .bind(finding_id)
        .bind(status.as_str())
        .execute(pool)
        .await?;
    Ok(())
}

/// Attribute a finding to a component, e.g. once a project has components
/// defined and the orchestrator matches file paths against their patterns.
pub async fn set_component(pool: &PgPool, finding_id: Uuid, component_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE audit_findings SET component_id = $2 WHERE id = $1")
        .bind(finding_id)
        .bind(component_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_finding(pool: &PgPool, id: Uuid) -> Result<Option<Finding>> {
    let row = sqlx::query("SELECT * FROM audit_findings WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_finding).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic_and_depends_on_all_fields() {
        let a = fingerprint("src/a.rs", 10, 12, "SQL Injection", "let q = format!(...)");
        let b = fingerprint("src/a.rs", 10, 12, "SQL Injection", "let q = format!(...)");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);

        let c = fingerprint("src/a.rs", 11, 12, "SQL Injection", "let q = format!(...)");
        assert_ne!(a, c, "a one-line shift is treated as a distinct finding");
    }

    #[test]
    fn fingerprint_truncates_snippet_to_100_chars() {
        let long_snippet = "x".repeat(500);
        let short_snippet = format!("{}tail-that-is-ignored", "x".repeat(100));
        let a = fingerprint("f.rs", 1, 1, "t", &long_snippet);
        let b = fingerprint("f.rs", 1, 1, "t", &short_snippet);
        assert_eq!(a, b);
    }
}
