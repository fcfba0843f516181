//! Login record store
//!
//! Persists which users have authenticated to which clients. One table,
//! unique on (user_id, client_id). Transient backing-store errors
//! propagate to the processor so the upstream queue can redeliver.

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;

pub use memory::MemoryLoginStore;
pub use postgres::PgLoginStore;

#[async_trait]
pub trait LoginStore: Send + Sync {
    /// Record that `user_id` has logged into `client_id`.
    /// Idempotent: duplicate pairs must not error.
    async fn store_login(&self, user_id: &str, client_id: &str) -> Result<()>;

    /// All client IDs the user has logged into. No duplicates; order unspecified.
    async fn fetch_client_ids(&self, user_id: &str) -> Result<Vec<String>>;
}
