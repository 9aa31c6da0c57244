//! Pool initialization and schema migration, on Postgres so array and
//! JSON columns map directly onto native types.

use crate::error::{AuditError, Result};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;

/// Create a connection pool and run migrations.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(AuditError::Db)?;

    run_migrations(&pool).await?;

    info!("database pool initialized, max_connections={max_connections}");
    Ok(pool)
}

/// Idempotently create every table the service depends on.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id UUID PRIMARY KEY,
            github_org TEXT NOT NULL,
            github_entity_type TEXT NOT NULL,
            created_by UUID NOT NULL,
            name TEXT NOT NULL,
            category TEXT,
            description TEXT,
            involved_parties JSONB,
            threat_model JSONB,
            threat_model_source TEXT,
            threat_model_files TEXT[],
            classification_audit_id UUID,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS repositories (
            id UUID PRIMARY KEY,
            repo_url TEXT NOT NULL,
            repo_name TEXT NOT NULL,
            local_path TEXT NOT NULL,
            UNIQUE (repo_url)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS project_repos (
            project_id UUID NOT NULL REFERENCES projects(id),
            repo_id UUID NOT NULL REFERENCES repositories(id),
            branch TEXT,
            PRIMARY KEY (project_id, repo_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS components (
            id UUID PRIMARY KEY,
            project_id UUID NOT NULL REFERENCES projects(id),
            repo_id UUID NOT NULL REFERENCES repositories(id),
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            role TEXT NOT NULL,
            file_patterns TEXT[] NOT NULL,
            languages TEXT[] NOT NULL,
            security_profile JSONB,
            estimated_files BIGINT NOT NULL DEFAULT 0,
            estimated_tokens BIGINT NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS project_dependencies (
            id UUID PRIMARY KEY,
            project_id UUID NOT NULL REFERENCES projects(id),
            repo_id UUID REFERENCES repositories(id),
            name TEXT NOT NULL,
            version TEXT,
            ecosystem TEXT NOT NULL,
            source_repo_url TEXT,
            linked_project_id UUID,
            UNIQUE (project_id, repo_id, name, ecosystem)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audits (
            id UUID PRIMARY KEY,
            project_id UUID NOT NULL REFERENCES projects(id),
            requester_id UUID NOT NULL,
            level TEXT NOT NULL,
            is_incremental BOOLEAN NOT NULL DEFAULT FALSE,
            base_audit_id UUID,
            component_ids UUID[],
            status TEXT NOT NULL,
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            total_files BIGINT NOT NULL DEFAULT 0,
            total_tokens BIGINT NOT NULL DEFAULT 0,
            files_to_analyze BIGINT NOT NULL DEFAULT 0,
            tokens_to_analyze BIGINT NOT NULL DEFAULT 0,
            files_analyzed BIGINT NOT NULL DEFAULT 0,
            progress_detail JSONB NOT NULL,
            report_summary JSONB,
            max_severity TEXT,
            actual_cost_usd DOUBLE PRECISION NOT NULL DEFAULT 0,
            error_message TEXT,
            is_public BOOLEAN NOT NULL DEFAULT FALSE,
            publishable_after TIMESTAMPTZ,
            owner_notified BOOLEAN NOT NULL DEFAULT FALSE,
            owner_notified_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            diff_files_added BIGINT,
            diff_files_modified BIGINT,
            diff_files_deleted BIGINT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_commits (
            audit_id UUID NOT NULL REFERENCES audits(id),
            repo_id UUID NOT NULL REFERENCES repositories(id),
            commit_sha TEXT NOT NULL,
            branch TEXT NOT NULL,
            PRIMARY KEY (audit_id, repo_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_findings (
            id UUID PRIMARY KEY,
            audit_id UUID NOT NULL REFERENCES audits(id),
            component_id UUID,
            file_path TEXT NOT NULL,
            line_start BIGINT NOT NULL,
            line_end BIGINT NOT NULL,
            severity TEXT NOT NULL,
            cwe_id TEXT,
            cvss_score DOUBLE PRECISION,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            exploitation TEXT,
            recommendation TEXT,
            code_snippet TEXT,
            status TEXT NOT NULL DEFAULT 'open',
            fingerprint TEXT NOT NULL,
            resolved_in_audit_id UUID,
            UNIQUE (audit_id, fingerprint)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_components (
            audit_id UUID NOT NULL REFERENCES audits(id),
            component_id UUID NOT NULL REFERENCES components(id),
            tokens_analyzed BIGINT NOT NULL DEFAULT 0,
            findings_count BIGINT NOT NULL DEFAULT 0,
            PRIMARY KEY (audit_id, component_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ownership_cache (
            user_id UUID NOT NULL,
            github_org TEXT NOT NULL,
            is_owner BOOLEAN NOT NULL,
            role TEXT,
            expires_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (user_id, github_org)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS model_pricing (
            model_id TEXT PRIMARY KEY,
            input_cost_per_mtok DOUBLE PRECISION NOT NULL,
            output_cost_per_mtok DOUBLE PRECISION NOT NULL,
            context_window BIGINT NOT NULL,
            max_output BIGINT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DatabaseHealth {
    pub connected: bool,
    pub pool_size: u32,
}

pub async fn health_check(pool: &PgPool) -> Result<DatabaseHealth> {
    let row: PgRow = sqlx::query("SELECT 1 AS ok").fetch_one(pool).await?;
    let ok: i32 = row.try_get("ok")?;
    Ok(DatabaseHealth {
        connected: ok == 1,
        pool_size: pool.size(),
    })
}
