//! Component + Dependency persistence.

use crate::error::Result;
use crate::models::{Component, ComponentRole, Dependency};
use sqlx::{PgPool, Row};
use uuid::Uuid;

fn str_to_role(s: &str) -> ComponentRole {
    match s {
        "server" => ComponentRole::Server,
        "client" => ComponentRole::Client,
        "library" => ComponentRole::Library,
        "cli" => ComponentRole::Cli,
        "worker" => ComponentRole::Worker,
        "shared" => ComponentRole::Shared,
        "config" => ComponentRole::Config,
        _ => ComponentRole::Test,
    }
}

fn row_to_component(row: &sqlx::postgres::PgRow) -> Result<Component> {
    let role: String = row.try_get("role")?;
    Ok(Component {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        repo_id: row.try_get("repo_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        role: str_to_role(&role),
        file_patterns: row.try_get("file_patterns")?,
        languages: row.try_get("languages")?,
        security_profile: row.try_get("security_profile")?,
        estimated_files: row.try_get("estimated_files")?,
        estimated_tokens: row.try_get("estimated_tokens")?,
    })
}

pub async fn list_components(pool: &PgPool, project_id: Uuid) -> Result<Vec<Component>> {
    let rows = sqlx::query("SELECT * FROM components WHERE project_id = $1")
        .bind(project_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_component).collect()
}

pub async fn get_components(pool: &PgPool, ids: &[Uuid]) -> Result<Vec<Component>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query("SELECT * FROM components WHERE id = ANY($1)")
        .bind(ids)
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_component).collect()
}

/// Replace a project's components, preserving any referenced by historical
/// audits, and fully replace its dependencies. Wrapped in a single
/// transaction.
pub async fn replace_components_and_dependencies(
    pool: &PgPool,
    project_id: Uuid,
    new_components: Vec<Component>,
    new_dependencies: Vec<Dependency>,
) -> Result<Vec<Uuid>> {
    let mut tx = pool.begin().await?;

    // Components referenced by any finding in a historical audit must survive
    // the delete, since Finding -> Component is a nullable weak reference
    // that would otherwise dangle.
    let referenced: Vec<Uuid> = sqlx::query(
        r#"
        SELECT DISTINCT component_id FROM audit_findings
        WHERE component_id IS NOT NULL
        AND audit_id IN (SELECT id FROM audits WHERE project_id = $1)
        "#,
    )
    .bind(project_id)
    .fetch_all(&mut *tx)
    .await?
    .into_iter()
    .map(|r| r.try_get::<Uuid, _>("component_id"))
    .collect::<std::result::Result<Vec<_>, _>>()?;

    sqlx::query("DELETE FROM components WHERE project_id = $1 AND NOT (id = ANY($2))")
        .bind(project_id)
        .bind(&referenced)
        .execute(&mut *tx)
        .await?;

    let mut new_ids = Vec::with_capacity(new_components.len());
    for c in &new_components {
        sqlx::query(
            r#"
            INSERT INTO components
                (id, project_id, repo_id, name, description, role, file_patterns,
                 languages, security_profile, estimated_files, estimated_tokens)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                role = EXCLUDED.role,
                file_patterns = EXCLUDED.file_patterns,
                languages = EXCLUDED.languages,
                security_profile = EXCLUDED.security_profile,
                estimated_files = EXCLUDED.estimated_files,
                estimated_tokens = EXCLUDED.estimated_tokens
            "#,
        )
        .bind(c.id)
        .bind(project_id)
        .bind(c.repo_id)
        .bind(&c.name)
        .bind(&c.description)
        .bind(c.role.as_str())
        .bind(&c.file_patterns)
        .bind(&c.languages)
        .bind(&c.security_profile)
        .bind(c.estimated_files)
        .bind(c.estimated_tokens)
        .execute(&mut *tx)
        .await?;
        new_ids.push(c.id);
    }

    // Dependencies are fully replaced; the component-without-repo_id dedup
    // path is dead after this blanket delete and is not built.
    sqlx::query("DELETE FROM project_dependencies WHERE project_id = $1")
        .bind(project_id)
        .execute(&mut *tx)
        .await?;

    for d in &new_dependencies {
        sqlx::query(
            r#"
            INSERT INTO project_dependencies
                (id, project_id, repo_id, name, version, ecosystem, source_repo_url, linked_project_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (project_id, repo_id, name, ecosystem) DO UPDATE SET
                version = EXCLUDED.version,
                source_repo_url = EXCLUDED.source_repo_url,
                linked_project_id = EXCLUDED.linked_project_id
            "#,
        )
        .bind(d.id)
        .bind(project_id)
        .bind(d.repo_id)
        .bind(&d.name)
        .bind(&d.version)
        .bind(&d.ecosystem)
        .bind(&d.source_repo_url)
        .bind(d.linked_project_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(new_ids)
}

/// Upsert an `audit_components` row.
pub async fn upsert_audit_component(
    pool: &PgPool,
    audit_id: Uuid,
    component_id: Uuid,
    tokens_analyzed: i64,
    findings_count: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO audit_components (audit_id, component_id, tokens_analyzed, findings_count)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (audit_id, component_id) DO UPDATE SET
            tokens_analyzed = EXCLUDED.tokens_analyzed,
            findings_count = EXCLUDED.findings_count
        "#,
    )
    .bind(audit_id)
    .bind(component_id)
    .bind(tokens_analyzed)
    .bind(findings_count)
    .execute(pool)
    .await?;
    Ok(())
}
