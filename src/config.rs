//! Service configuration loaded from the environment: one env var per
//! field, sane defaults, no config-file parsing.

use std::path::PathBuf;

/// Process-wide configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string.
    pub database_url: String,
    /// Root directory under which repositories are cloned
    /// (`<reposRoot>/<host>/<owner>/<repo>`).
    pub repos_root: PathBuf,
    /// Max pool connections.
    pub db_max_connections: u32,
    /// Session max-age, in days (consumed by the out-of-scope session layer;
    /// kept here so every environment input is read from one place).
    pub session_max_age_days: i64,
    /// Optional gate password (out-of-scope password gate; surfaced only so
    /// downstream consumers can read it from one place).
    pub gate_password: Option<String>,
    /// Cookie HMAC secret (out-of-scope cookie plumbing; same rationale).
    pub cookie_hmac_secret: Option<String>,
    /// GitHub OAuth client id (out-of-scope OAuth URL construction; same
    /// rationale — the Ownership Resolver's GitHub REST calls reuse the
    /// resulting session token, not this id directly).
    pub github_oauth_client_id: Option<String>,
    pub github_oauth_client_secret: Option<String>,
}

impl Config {
    /// Load configuration from environment variables, applying `.env` first
    /// if present (non-fatal if missing).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/codewatch".to_string());

        let repos_root = std::env::var("CODEWATCH_REPOS_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/repos"));

        let db_max_connections = std::env::var("CODEWATCH_DB_MAX_CONN")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let session_max_age_days = std::env::var("CODEWATCH_SESSION_MAX_AGE_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let gate_password = std::env::var("CODEWATCH_GATE_PASSWORD").ok();
        let cookie_hmac_secret = std::env::var("CODEWATCH_COOKIE_SECRET").ok();
        let github_oauth_client_id = std::env::var("GITHUB_OAUTH_CLIENT_ID").ok();
        let github_oauth_client_secret = std::env::var("GITHUB_OAUTH_CLIENT_SECRET").ok();

        Self {
            database_url,
            repos_root,
            db_max_connections,
            session_max_age_days,
            gate_password,
            cookie_hmac_secret,
            github_oauth_client_id,
            github_oauth_client_secret,
        }
    }

    /// A redacted view suitable for startup logging — never log secrets.
    pub fn redacted_summary(&self) -> String {
        format!(
            "repos_root={} db_max_conn={} session_max_age_days={} gate_password={} cookie_secret={} oauth_client_id={}",
            self.repos_root.display(),
            self.db_max_connections,
            self.session_max_age_days,
            present(&self.gate_password),
            present(&self.cookie_hmac_secret),
            present(&self.github_oauth_client_id),
        )
    }
}

fn present(v: &Option<String>) -> &'static str {
    if v.is_some() {
        "<set>"
    } else {
        "<unset>"
    }
}
