//! Audit persistence: creation, status transitions, commits, progress.
//!
//! Status transitions are single-writer per audit — callers own this by
//! only ever driving one orchestrator task per audit id; this module does
//! not itself serialize writes beyond normal row-level locking.

use crate::error::{AuditError, Result};
use crate::models::{
    Audit, AuditCommit, AuditLevel, AuditStatus, ProgressDetail, ReportSummary, Severity,
};
use sqlx::{PgPool, Row};
use uuid::Uuid;

fn level_to_str(l: AuditLevel) -> &'static str {
    l.as_str()
}

fn str_to_level(s: &str) -> AuditLevel {
    s.parse().unwrap_or(AuditLevel::Opportunistic)
}

fn status_to_str(s: AuditStatus) -> &'static str {
    s.as_str()
}

fn str_to_status(s: &str) -> AuditStatus {
    match s {
        "cloning" => AuditStatus::Cloning,
        "classifying" => AuditStatus::Classifying,
        "planning" => AuditStatus::Planning,
        "analyzing" => AuditStatus::Analyzing,
        "synthesizing" => AuditStatus::Synthesizing,
        "completed" => AuditStatus::Completed,
        "completed_with_warnings" => AuditStatus::CompletedWithWarnings,
        _ => AuditStatus::Failed,
    }
}

fn row_to_audit(row: &sqlx::postgres::PgRow) -> Result<Audit> {
    let level: String = row.try_get("level")?;
    let status: String = row.try_get("status")?;
    let progress_json: serde_json::Value = row.try_get("progress_detail")?;
    let progress_detail: ProgressDetail = serde_json::from_value(progress_json)?;
    let report_summary: Option<serde_json::Value> = row.try_get("report_summary")?;
    let max_severity: Option<String> = row.try_get("max_severity")?;

    Ok(Audit {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        requester_id: row.try_get("requester_id")?,
        level: str_to_level(&level),
        is_incremental: row.try_get("is_incremental")?,
        base_audit_id: row.try_get("base_audit_id")?,
        component_ids: row.try_get("component_ids")?,
        status: str_to_status(&status),
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        total_files: row.try_get("total_files")?,
        total_tokens: row.try_get("total_tokens")?,
        files_to_analyze: row.try_get("files_to_analyze")?,
        tokens_to_analyze: row.try_get("tokens_to_analyze")?,
        files_analyzed: row.try_get("files_analyzed")?,
        progress_detail,
        report_summary: report_summary
            .map(serde_json::from_value)
            .transpose()?,
        max_severity: max_severity.and_then(|s| s.parse().ok()),
        actual_cost_usd: row.try_get("actual_cost_usd")?,
        error_message: row.try_get("error_message")?,
        is_public: row.try_get("is_public")?,
        publishable_after: row.try_get("publishable_after")?,
        owner_notified: row.try_get("owner_notified")?,
        owner_notified_at: row.try_get("owner_notified_at")?,
        created_at: row.try_get("created_at")?,
        diff_files_added: row.try_get("diff_files_added")?,
        diff_files_modified: row.try_get("diff_files_modified")?,
        diff_files_deleted: row.try_get("diff_files_deleted")?,
    })
}

#[allow(clippy::too_many_arguments)]
pub async fn create_audit(
    pool: &PgPool,
    project_id: Uuid,
    requester_id: Uuid,
    level: AuditLevel,
    base_audit_id: Option<Uuid>,
    component_ids: Option<Vec<Uuid>>,
) -> Result<Audit> {
    let id = Uuid::new_v4();
    let is_incremental = base_audit_id.is_some();
    let initial_progress = ProgressDetail::Cloning {
        current: 0,
        total: 0,
        repo_name: String::new(),
        warnings: Vec::new(),
    };

    sqlx::query(
        r#"
        INSERT INTO audits
            (id, project_id, requester_id, level, is_incremental, base_audit_id,
             component_ids, status, started_at, progress_detail)
        VALUES ($1, $2, $3, $4, $5, $6, $7, 'cloning', now(), $8)
        "#,
    )
    .bind(id)
    .bind(project_id)
    .bind(requester_id)
    .bind(level_to_str(level))
    .bind(is_incremental)
    .bind(base_audit_id)
    .bind(component_ids)
    .bind(serde_json::to_value(&initial_progress)?)
    .execute(pool)
    .await?;

    get_audit(pool, id).await
}

pub async fn get_audit(pool: &PgPool, id: Uuid) -> Result<Audit> {
    let row = sqlx::query("SELECT * FROM audits WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AuditError::NotFound(format!("audit {id}")))?;
    row_to_audit(&row)
}

pub async fn update_progress(pool: &PgPool, id: Uuid, detail: &ProgressDetail) -> Result<()> {
    sqlx::query("UPDATE audits SET progress_detail = $2 WHERE id = $1")
        .bind(id)
        .bind(serde_json::to_value(detail)?)
        .execute(pool)
        .await?;
    Ok(())
}

/// Update progress and `files_analyzed` in the same statement, so a reader
/// never observes one without the other.
pub async fn update_progress_and_files_analyzed(
    pool: &PgPool,
    id: Uuid,
    detail: &ProgressDetail,
    files_analyzed: i64,
) -> Result<()> {
    sqlx::query("UPDATE audits SET progress_detail = $2, files_analyzed = $3 WHERE id = $1")
        .bind(id)
        .bind(serde_json::to_value(detail)?)
        .bind(files_analyzed)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_status(pool: &PgPool, id: Uuid, status: AuditStatus) -> Result<()> {
    sqlx::query("UPDATE audits SET status = $2 WHERE id = $1")
        .bind(id)
        .bind(status_to_str(status))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_totals(
    pool: &PgPool,
    id: Uuid,
    total_files: i64,
    total_tokens: i64,
) -> Result<()> {
    sqlx::query("UPDATE audits SET total_files = $2, total_tokens = $3 WHERE id = $1")
        .bind(id)
        .bind(total_files)
        .bind(total_tokens)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_plan_totals(
    pool: &PgPool,
    id: Uuid,
    files_to_analyze: i64,
    tokens_to_analyze: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE audits SET files_to_analyze = $2, tokens_to_analyze = $3 WHERE id = $1",
    )
    .bind(id)
    .bind(files_to_analyze)
    .bind(tokens_to_analyze)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_diff_counts(
    pool: &PgPool,
    id: Uuid,
    added: i64,
    modified: i64,
    deleted: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE audits SET
            diff_files_added = $2, diff_files_modified = $3, diff_files_deleted = $4
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(added)
    .bind(modified)
    .bind(deleted)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn add_cost(pool: &PgPool, id: Uuid, delta_usd: f64) -> Result<()> {
    sqlx::query("UPDATE audits SET actual_cost_usd = actual_cost_usd + $2 WHERE id = $1")
        .bind(id)
        .bind(delta_usd)
        .execute(pool)
        .await?;
    Ok(())
}

/// Mark the audit `failed`. Partial findings already inserted for this
/// audit are left in place, not deleted.
pub async fn mark_failed(pool: &PgPool, id: Uuid, message: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE audits SET
            status = 'failed',
            error_message = $2,
            completed_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(message)
    .execute(pool)
    .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn mark_completed(
    pool: &PgPool,
    id: Uuid,
    status: AuditStatus,
    report_summary: &ReportSummary,
    max_severity: Option<Severity>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE audits SET
            status = $2,
            report_summary = $3,
            max_severity = $4,
            completed_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(status_to_str(status))
    .bind(serde_json::to_value(report_summary)?)
    .bind(max_severity.map(|s| s.as_str()))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn upsert_commit(
    pool: &PgPool,
    audit_id: Uuid,
    repo_id: Uuid,
    commit_sha: &str,
    branch: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO audit_commits (audit_id, repo_id, commit_sha, branch)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (audit_id, repo_id) DO UPDATE SET
            commit_sha = EXCLUDED.commit_sha,
            branch = EXCLUDED.branch
        "#,
    )
    .bind(audit_id)
    .bind(repo_id)
    .bind(commit_sha)
    .bind(branch)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_commits(pool: &PgPool, audit_id: Uuid) -> Result<Vec<AuditCommit>> {
    let rows = sqlx::query("SELECT * FROM audit_commits WHERE audit_id = $1")
        .bind(audit_id)
        .fetch_all(pool)
        .await?;

    rows.into_iter()
        .map(|row| {
            Ok(AuditCommit {
                audit_id: row.try_get("audit_id")?,
                repo_id: row.try_get("repo_id")?,
                commit_sha: row.try_get("commit_sha")?,
                branch: row.try_get("branch")?,
            })
        })
        .collect()
}

/// Set the disclosure fields for `notify_owner`. This function always
/// overwrites; callers must check `owner_notified` first if notifying twice
/// should be a no-op.
pub async fn set_disclosure(
    pool: &PgPool,
    id: Uuid,
    publishable_after: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE audits SET
            owner_notified = TRUE,
            owner_notified_at = now(),
            publishable_after = $2
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(publishable_after)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_public(pool: &PgPool, id: Uuid, is_public: bool) -> Result<()> {
    sqlx::query("UPDATE audits SET is_public = $2 WHERE id = $1")
        .bind(id)
        .bind(is_public)
        .execute(pool)
        .await?;
    Ok(())
}

/// Unpublish: clears `is_public` and `publishable_after`.
pub async fn unpublish(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("UPDATE audits SET is_public = FALSE, publishable_after = NULL WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}
