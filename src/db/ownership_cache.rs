//! Ownership cache persistence: caches resolved GitHub org membership per
//! user so repeated audits don't re-hit the GitHub API.

use crate::error::Result;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CacheRow {
    pub is_owner: bool,
    pub role: Option<String>,
    pub expires_at: DateTime<Utc>,
}

pub async fn get(pool: &PgPool, user_id: Uuid, github_org: &str) -> Result<Option<CacheRow>> {
    let row = sqlx::query(
        "SELECT is_owner, role, expires_at FROM ownership_cache WHERE user_id = $1 AND github_org = $2",
    )
    .bind(user_id)
    .bind(github_org)
    .fetch_optional(pool)
    .await?;

    row.map(|r| {
        Ok(CacheRow {
            is_owner: r.try_get("is_owner")?,
            role: r.try_get("role")?,
            expires_at: r.try_get("expires_at")?,
        })
    })
    .transpose()
}

/// Upsert is last-write-wins under a `(user, org)` key.
pub async fn upsert(
    pool: &PgPool,
    user_id: Uuid,
    github_org: &str,
    is_owner: bool,
    role: Option<&str>,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO ownership_cache (user_id, github_org, is_owner, role, expires_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (user_id, github_org) DO UPDATE SET
            is_owner = EXCLUDED.is_owner,
            role = EXCLUDED.role,
            expires_at = EXCLUDED.expires_at
        "#,
    )
    .bind(user_id)
    .bind(github_org)
    .bind(is_owner)
    .bind(role)
    .bind(expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Invalidate: delete all cached rows for the user (called on re-auth).
pub async fn invalidate(pool: &PgPool, user_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM ownership_cache WHERE user_id = $1")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}
