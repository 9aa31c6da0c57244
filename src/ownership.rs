//! Ownership Resolver (C5): resolves whether a user owns/administers a
//! GitHub organization, with a 15-minute cache.

use crate::db::ownership_cache;
use crate::error::Result;
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

const CACHE_TTL_MINUTES: i64 = 15;

#[derive(Debug, Clone)]
pub struct OwnershipResult {
    pub is_owner: bool,
    pub role: Option<String>,
    pub needs_reauth: bool,
    pub cached: bool,
}

#[derive(Deserialize)]
struct MembershipResponse {
    state: Option<String>,
    role: Option<String>,
}

#[derive(Deserialize)]
struct RepoPermissions {
    permissions: Option<RepoPermissionFlags>,
}

#[derive(Deserialize)]
struct RepoPermissionFlags {
    admin: Option<bool>,
}

pub struct OwnershipResolver {
    pool: PgPool,
    client: Client,
    github_api_base: String,
}

impl OwnershipResolver {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            client: Client::new(),
            github_api_base: "https://api.github.com".to_string(),
        }
    }

    pub fn with_api_base(pool: PgPool, github_api_base: impl Into<String>) -> Self {
        Self {
            pool,
            client: Client::new(),
            github_api_base: github_api_base.into(),
        }
    }

    /// `has_org_scope` is threaded through but currently unused; it is kept
    /// on the signature for a future check against OAuth scope grants.
    pub async fn resolve(
        &self,
        user_id: Uuid,
        user_login: &str,
        org: &str,
        token: &str,
        _has_org_scope: bool,
    ) -> Result<OwnershipResult> {
        if let Some(cached) = ownership_cache::get(&self.pool, user_id, org).await? {
            if cached.expires_at > Utc::now() {
                return Ok(OwnershipResult {
                    is_owner: cached.is_owner,
                    role: cached.role,
                    needs_reauth: false,
                    cached: true,
                });
            }
        }

        if user_login.eq_ignore_ascii_case(org) {
            let result = OwnershipResult {
                is_owner: true,
                role: Some("personal".to_string()),
                needs_reauth: false,
                cached: false,
            };
            self.cache_if_eligible(user_id, org, &result).await?;
            return Ok(result);
        }

        let result = self.resolve_via_membership(org, token).await?;
        self.cache_if_eligible(user_id, org, &result).await?;
        Ok(result)
    }

    async fn resolve_via_membership(&self, org: &str, token: &str) -> Result<OwnershipResult> {
        let url = format!("{}/user/memberships/orgs/{org}", self.github_api_base);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .header("User-Agent", "codewatch")
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let body: MembershipResponse = response.json().await?;
                let is_owner = body.state.as_deref() == Some("active")
                    && body.role.as_deref() == Some("admin");
                Ok(OwnershipResult {
                    is_owner,
                    role: body.role,
                    needs_reauth: false,
                    cached: false,
                })
            }
            StatusCode::FORBIDDEN => self.resolve_via_repo_permissions(org, token).await,
            StatusCode::UNAUTHORIZED => Ok(OwnershipResult {
                is_owner: false,
                role: None,
                needs_reauth: true,
                cached: false,
            }),
            StatusCode::NOT_FOUND => Ok(OwnershipResult {
                is_owner: false,
                role: None,
                needs_reauth: false,
                cached: false,
            }),
            other => Err(crate::error::AuditError::llm_api(format!(
                "unexpected GitHub membership response: {other}"
            ))),
        }
    }

    /// Third-party app restrictions on the org return 403 for the
    /// membership endpoint; fall back to inspecting permissions on one
    /// public org repo. Only `admin` counts as ownership.
    async fn resolve_via_repo_permissions(&self, org: &str, token: &str) -> Result<OwnershipResult> {
        let repos_url = format!("{}/orgs/{org}/repos?per_page=1&type=public", self.github_api_base);
        let repos: Vec<serde_json::Value> = self
            .client
            .get(&repos_url)
            .bearer_auth(token)
            .header("User-Agent", "codewatch")
            .send()
            .await?
            .json()
            .await?;

        let repo_name = match repos.first().and_then(|r| r["name"].as_str()) {
            Some(name) => name.to_string(),
            None => {
                return Ok(OwnershipResult {
                    is_owner: false,
                    role: None,
                    needs_reauth: false,
                    cached: false,
                })
            }
        };

        let repo_url = format!("{}/repos/{org}/{repo_name}", self.github_api_base);
        let repo: RepoPermissions = self
            .client
            .get(&repo_url)
            .bearer_auth(token)
            .header("User-Agent", "codewatch")
            .send()
            .await?
            .json()
            .await?;

        let is_admin = repo
            .permissions
            .and_then(|p| p.admin)
            .unwrap_or(false);

        Ok(OwnershipResult {
            is_owner: is_admin,
            role: if is_admin { Some("admin".to_string()) } else { None },
            needs_reauth: false,
            cached: false,
        })
    }

    /// `needs_reauth` results are never cached.
    async fn cache_if_eligible(
        &self,
        user_id: Uuid,
        org: &str,
        result: &OwnershipResult,
    ) -> Result<()> {
        if result.needs_reauth {
            return Ok(());
        }
        let expires_at = Utc::now() + ChronoDuration::minutes(CACHE_TTL_MINUTES);
        ownership_cache::upsert(
            &self.pool,
            user_id,
            org,
            result.is_owner,
            result.role.as_deref(),
            expires_at,
        )
        .await
    }

    pub async fn invalidate(&self, user_id: Uuid) -> Result<()> {
        ownership_cache::invalidate(&self.pool, user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    #[test]
    fn personal_shortcut_is_case_insensitive() {
        assert!("Acme".eq_ignore_ascii_case("acme"));
    }

    /// `connect_lazy` never opens a connection, so these tests can exercise
    /// the GitHub HTTP fallback chain without a live database — neither
    /// helper under test touches `self.pool`.
    fn lazy_resolver(database_url: &str, api_base: String) -> OwnershipResolver {
        let pool = PgPoolOptions::new()
            .connect_lazy(database_url)
            .expect("lazy pool never dials out");
        OwnershipResolver::with_api_base(pool, api_base)
    }

    #[tokio::test]
    async fn membership_admin_is_owner() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/user/memberships/orgs/acme")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"state":"active","role":"admin"}"#)
            .create_async()
            .await;

        let resolver = lazy_resolver("postgres://unused/unused", server.url());
        let result = resolver
            .resolve_via_membership("acme", "token")
            .await
            .unwrap();

        assert!(result.is_owner);
        assert_eq!(result.role.as_deref(), Some("admin"));
        assert!(!result.needs_reauth);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn membership_non_admin_member_is_not_owner() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/user/memberships/orgs/acme")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"state":"active","role":"member"}"#)
            .create_async()
            .await;

        let resolver = lazy_resolver("postgres://unused/unused", server.url());
        let result = resolver
            .resolve_via_membership("acme", "token")
            .await
            .unwrap();

        assert!(!result.is_owner);
    }

    #[tokio::test]
    async fn membership_unauthorized_requests_reauth() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/user/memberships/orgs/acme")
            .with_status(401)
            .create_async()
            .await;

        let resolver = lazy_resolver("postgres://unused/unused", server.url());
        let result = resolver
            .resolve_via_membership("acme", "token")
            .await
            .unwrap();

        assert!(result.needs_reauth);
        assert!(!result.is_owner);
    }

    #[tokio::test]
    async fn membership_forbidden_falls_back_to_repo_permissions() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/user/memberships/orgs/acme")
            .with_status(403)
            .create_async()
            .await;
        server
            .mock("GET", "/orgs/acme/repos?per_page=1&type=public")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"name":"widgets"}]"#)
            .create_async()
            .await;
        server
            .mock("GET", "/repos/acme/widgets")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"permissions":{"admin":true}}"#)
            .create_async()
            .await;

        let resolver = lazy_resolver("postgres://unused/unused", server.url());
        let result = resolver.resolve_via_membership("acme", "token").await.unwrap();

        assert!(result.is_owner);
        assert_eq!(result.role.as_deref(), Some("admin"));
    }

    #[tokio::test]
    async fn repo_permissions_fallback_with_no_public_repos_is_not_owner() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/user/memberships/orgs/acme")
            .with_status(403)
            .create_async()
            .await;
        server
            .mock("GET", "/orgs/acme/repos?per_page=1&type=public")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("[]")
            .create_async()
            .await;

        let resolver = lazy_resolver("postgres://unused/unused", server.url());
        let result = resolver.resolve_via_membership("acme", "token").await.unwrap();

        assert!(!result.is_owner);
        assert!(!result.needs_reauth);
    }
}
