//! Database module: connection pooling, schema migration, and
//! entity-scoped CRUD, following the teacher's `db::config` +
//! per-entity-file layout (`db::chunks`, `db::queue`, ...).

pub mod audits;
pub mod components;
pub mod config;
pub mod findings;
pub mod ownership_cache;
pub mod projects;

pub use config::{health_check, init_pool, DatabaseHealth};
