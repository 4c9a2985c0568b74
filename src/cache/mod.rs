//! Per-user permission matrix cache.
//!
//! Both backends keep reverse indices (role -> users, group -> users) written
//! alongside each matrix, so role and group invalidation never scan every
//! cached user. Index entries live for `index_ttl`, which is never shorter
//! than the matrix TTL.
//!
//! Every invalidation bumps a cache-wide generation and stamps the user, role
//! or group it touched with it. A matrix computed from storage is written with
//! [`PermissionCache::set_if_current`] and only lands when nothing it depends
//! on was stamped after the generation captured before the storage reads, so a
//! slow check can never re-cache data an invalidation already dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::{CacheBackend, CacheConfig};
use crate::errors::AppResult;
use crate::models::rbac::UserPermissionMatrix;

mod memory;
mod redis;

pub use self::memory::MemoryPermissionCache;
pub use self::redis::RedisPermissionCache;

#[async_trait]
pub trait PermissionCache: Send + Sync {
    /// Short backend name for health output.
    fn backend(&self) -> &'static str;

    async fn get(&self, user_id: Uuid) -> AppResult<Option<UserPermissionMatrix>>;

    /// Store the matrix and refresh the reverse indices for its roles and groups.
    async fn set(&self, user_id: Uuid, matrix: &UserPermissionMatrix, ttl: Duration) -> AppResult<()>;

    /// Current invalidation generation.
    async fn generation(&self) -> AppResult<u64>;

    /// Like [`set`](Self::set), but skipped when the user, one of the matrix
    /// roles or one of its groups was invalidated after `generation`.
    /// Returns whether the matrix was stored.
    async fn set_if_current(
        &self,
        user_id: Uuid,
        matrix: &UserPermissionMatrix,
        ttl: Duration,
        generation: u64,
    ) -> AppResult<bool>;

    /// Drop the user's matrix and tracking key.
    async fn invalidate_user(&self, user_id: Uuid) -> AppResult<()>;

    /// Drop the matrix of every user indexed under the role. Returns those users.
    async fn invalidate_role(&self, role_id: Uuid) -> AppResult<Vec<Uuid>>;

    /// Drop the matrix of every user indexed under the group. Returns those users.
    async fn invalidate_group(&self, group_id: Uuid) -> AppResult<Vec<Uuid>>;

    async fn health(&self) -> AppResult<()>;
}

/// Build the backend selected by configuration.
pub async fn build_cache(config: &CacheConfig) -> AppResult<Arc<dyn PermissionCache>> {
    match config.backend {
        CacheBackend::Memory => {
            let cache = Arc::new(MemoryPermissionCache::new(config.index_ttl));
            MemoryPermissionCache::spawn_sweeper(Arc::downgrade(&cache), config.ttl);
            tracing::info!(ttl_secs = config.ttl.as_secs(), "using in-process permission cache");
            Ok(cache)
        }
        CacheBackend::Redis => {
            let cache = RedisPermissionCache::connect(config).await?;
            tracing::info!(ttl_secs = config.ttl.as_secs(), "using redis permission cache");
            Ok(Arc::new(cache))
        }
    }
}
