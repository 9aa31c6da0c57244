//! Project persistence: lookup/creation and classification writes.

use crate::error::{AuditError, Result};
use crate::models::{Project, ThreatModelSource};
use sqlx::{PgPool, Row};
use uuid::Uuid;

fn row_to_project(row: &sqlx::postgres::PgRow) -> Result<Project> {
    let threat_model_source: Option<String> = row.try_get("threat_model_source")?;
    Ok(Project {
        id: row.try_get("id")?,
        github_org: row.try_get("github_org")?,
        github_entity_type: row.try_get("github_entity_type")?,
        created_by: row.try_get("created_by")?,
        name: row.try_get("name")?,
        category: row.try_get("category")?,
        description: row.try_get("description")?,
        involved_parties: row.try_get("involved_parties")?,
        threat_model: row.try_get("threat_model")?,
        threat_model_source: threat_model_source.map(|s| match s.as_str() {
            "generated" => ThreatModelSource::Generated,
            _ => ThreatModelSource::Repo,
        }),
        threat_model_files: row.try_get("threat_model_files")?,
        classification_audit_id: row.try_get("classification_audit_id")?,
    })
}

/// Find an existing project for (creator, org, sorted repo name list), or
/// create a new one. Enforces at most one Project per
/// (creator, org, sorted repo name list).
pub async fn find_or_create_project(
    pool: &PgPool,
    created_by: Uuid,
    github_org: &str,
    github_entity_type: &str,
    name: &str,
    mut repo_names: Vec<String>,
) -> Result<Project> {
    repo_names.sort();

    // Look for a project owned by this creator in this org whose repos
    // (joined via project_repos -> repositories) match exactly.
    let candidates = sqlx::query("SELECT id FROM projects WHERE created_by = $1 AND github_org = $2")
        .bind(created_by)
        .bind(github_org)
        .fetch_all(pool)
        .await?;

    for row in candidates {
        let candidate_id: Uuid = row.try_get("id")?;
        let rows = sqlx::query(
            r#"
            SELECT r.repo_name FROM project_repos pr
            JOIN repositories r ON r.id = pr.repo_id
            WHERE pr.project_id = $1
            ORDER BY r.repo_name
            "#,
        )
        .bind(candidate_id)
        .fetch_all(pool)
        .await?;

        let mut existing: Vec<String> = Vec::with_capacity(rows.len());
        for r in rows {
            existing.push(r.try_get("repo_name")?);
        }

        if existing == repo_names {
            return get_project(pool, candidate_id).await;
        }
    }

    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO projects (id, github_org, github_entity_type, created_by, name)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(id)
    .bind(github_org)
    .bind(github_entity_type)
    .bind(created_by)
    .bind(name)
    .execute(pool)
    .await?;

    get_project(pool, id).await
}

pub async fn get_project(pool: &PgPool, id: Uuid) -> Result<Project> {
    let row = sqlx::query("SELECT * FROM projects WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AuditError::NotFound(format!("project {id}")))?;
    row_to_project(&row)
}

/// Persist classification results onto a Project. Classification fields are
/// set on first successful audit and never overwritten after — callers must
/// check `project.category.is_none()` before invoking this.
#[allow(clippy::too_many_arguments)]
pub async fn set_classification(
    pool: &PgPool,
    project_id: Uuid,
    category: &str,
    description: &str,
    involved_parties: &serde_json::Value,
    threat_model: &serde_json::Value,
    threat_model_source: ThreatModelSource,
    threat_model_files: &[String],
    classification_audit_id: Uuid,
) -> Result<()> {
    let source = match threat_model_source {
        ThreatModelSource::Repo => "repo",
        ThreatModelSource::Generated => "generated",
    };

    sqlx::query(
        r#"
        UPDATE projects SET
            category = $2,
            description = $3,
            involved_parties = $4,
            threat_model = $5,
            threat_model_source = $6,
            threat_model_files = $7,
            classification_audit_id = $8
        WHERE id = $1
        "#,
    )
    .bind(project_id)
    .bind(category)
    .bind(description)
    .bind(involved_parties)
    .bind(threat_model)
    .bind(source)
    .bind(threat_model_files)
    .bind(classification_audit_id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn add_repo(
    pool: &PgPool,
    project_id: Uuid,
    repo_id: Uuid,
    branch: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO project_repos (project_id, repo_id, branch)
        VALUES ($1, $2, $3)
        ON CONFLICT (project_id, repo_id) DO UPDATE SET branch = EXCLUDED.branch
        "#,
    )
    .bind(project_id)
    .bind(repo_id)
    .bind(branch)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_project_repos(
    pool: &PgPool,
    project_id: Uuid,
) -> Result<Vec<(crate::models::Repository, Option<String>)>> {
    let rows = sqlx::query(
        r#"
        SELECT r.id, r.repo_url, r.repo_name, r.local_path, pr.branch
        FROM project_repos pr
        JOIN repositories r ON r.id = pr.repo_id
        WHERE pr.project_id = $1
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push((
            crate::models::Repository {
                id: row.try_get("id")?,
                repo_url: row.try_get("repo_url")?,
                repo_name: row.try_get("repo_name")?,
                local_path: row.try_get("local_path")?,
            },
            row.try_get("branch")?,
        ));
    }
    Ok(out)
}

pub async fn find_or_create_repository(
    pool: &PgPool,
    repo_url: &str,
    repo_name: &str,
    local_path: &str,
) -> Result<crate::models::Repository> {
    if let Some(row) = sqlx::query("SELECT * FROM repositories WHERE repo_url = $1")
        .bind(repo_url)
        .fetch_optional(pool)
        .await?
    {
        return Ok(crate::models::Repository {
            id: row.try_get("id")?,
            repo_url: row.try_get("repo_url")?,
            repo_name: row.try_get("repo_name")?,
            local_path: row.try_get("local_path")?,
        });
    }

    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO repositories (id, repo_url, repo_name, local_path) VALUES ($1, $2, $3, $4)",
    )
    .bind(id)
    .bind(repo_url)
    .bind(repo_name)
    .bind(local_path)
    .execute(pool)
    .await?;

    Ok(crate::models::Repository {
        id,
        repo_url: repo_url.to_string(),
        repo_name: repo_name.to_string(),
        local_path: local_path.to_string(),
    })
}
