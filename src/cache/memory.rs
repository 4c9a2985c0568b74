use std::collections::HashSet;
use std::sync::Weak;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::PermissionCache;
use crate::errors::AppResult;
use crate::models::rbac::UserPermissionMatrix;

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

type Stamps = DashMap<Uuid, Expiring<u64>>;

/// In-process cache backed by `DashMap`s. Expiry is checked on read and by a
/// periodic sweeper.
#[derive(Debug)]
pub struct MemoryPermissionCache {
    matrices: DashMap<Uuid, Expiring<UserPermissionMatrix>>,
    role_users: DashMap<Uuid, Expiring<HashSet<Uuid>>>,
    group_users: DashMap<Uuid, Expiring<HashSet<Uuid>>>,
    // roles and groups indexed for a user at its last write
    user_tracking: DashMap<Uuid, Expiring<(Vec<Uuid>, Vec<Uuid>)>>,
    // generation of the last invalidation touching each id
    user_stamps: Stamps,
    role_stamps: Stamps,
    group_stamps: Stamps,
    // writes and invalidations hold this for their whole critical section
    generation: Mutex<u64>,
    index_ttl: Duration,
}

impl MemoryPermissionCache {
    pub fn new(index_ttl: Duration) -> Self {
        Self {
            matrices: DashMap::new(),
            role_users: DashMap::new(),
            group_users: DashMap::new(),
            user_tracking: DashMap::new(),
            user_stamps: DashMap::new(),
            role_stamps: DashMap::new(),
            group_stamps: DashMap::new(),
            generation: Mutex::new(0),
            index_ttl,
        }
    }

    /// Number of live matrices.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.matrices.iter().filter(|e| e.value().is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.matrices.len();
        self.matrices.retain(|_, e| e.is_live(now));
        self.role_users.retain(|_, e| e.is_live(now));
        self.group_users.retain(|_, e| e.is_live(now));
        self.user_tracking.retain(|_, e| e.is_live(now));
        for stamps in [&self.user_stamps, &self.role_stamps, &self.group_stamps] {
            stamps.retain(|_, e| e.is_live(now));
        }
        before.saturating_sub(self.matrices.len())
    }

    /// Purge periodically until the cache is dropped.
    pub fn spawn_sweeper(cache: Weak<Self>, every: Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every.max(Duration::from_secs(1)));
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(cache) = cache.upgrade() else { break };
                let purged = cache.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "expired permission matrices purged");
                }
            }
        });
    }

    fn index_add(index: &DashMap<Uuid, Expiring<HashSet<Uuid>>>, key: Uuid, user_id: Uuid, ttl: Duration) {
        let now = Instant::now();
        let mut entry = index
            .entry(key)
            .or_insert_with(|| Expiring::new(HashSet::new(), ttl));
        if !entry.is_live(now) {
            entry.value.clear();
        }
        entry.value.insert(user_id);
        entry.expires_at = now + ttl;
    }

    fn index_remove(index: &DashMap<Uuid, Expiring<HashSet<Uuid>>>, key: Uuid, user_id: Uuid) {
        if let Some(mut entry) = index.get_mut(&key) {
            entry.value.remove(&user_id);
        }
    }

    fn take_index(index: &DashMap<Uuid, Expiring<HashSet<Uuid>>>, key: Uuid) -> Vec<Uuid> {
        let now = Instant::now();
        let mut users: Vec<Uuid> = index
            .remove(&key)
            .filter(|(_, e)| e.is_live(now))
            .map(|(_, e)| e.value.into_iter().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    fn drop_user(&self, user_id: Uuid) {
        self.matrices.remove(&user_id);
        self.user_tracking.remove(&user_id);
    }

    fn stamp(&self, stamps: &Stamps, id: Uuid, generation: &mut u64) {
        *generation += 1;
        stamps.insert(id, Expiring::new(*generation, self.index_ttl));
    }

    /// Whether the user, or any role or group of `matrix`, was invalidated
    /// after `generation`.
    fn stamped_after(&self, user_id: Uuid, matrix: &UserPermissionMatrix, generation: u64) -> bool {
        let newer = |stamps: &Stamps, id: &Uuid| stamps.get(id).is_some_and(|s| s.value > generation);
        newer(&self.user_stamps, &user_id)
            || matrix.all_role_ids().iter().any(|id| newer(&self.role_stamps, id))
            || matrix.group_ids.iter().any(|id| newer(&self.group_stamps, id))
    }

    fn write(&self, user_id: Uuid, matrix: &UserPermissionMatrix, ttl: Duration) {
        let index_ttl = self.index_ttl.max(ttl);
        let roles = matrix.all_role_ids();
        let groups = matrix.group_ids.clone();

        // unlink roles and groups the user no longer has
        if let Some((_, previous)) = self.user_tracking.remove(&user_id) {
            let (old_roles, old_groups) = previous.value;
            for role_id in old_roles.into_iter().filter(|r| !roles.contains(r)) {
                Self::index_remove(&self.role_users, role_id, user_id);
            }
            for group_id in old_groups.into_iter().filter(|g| !groups.contains(g)) {
                Self::index_remove(&self.group_users, group_id, user_id);
            }
        }

        for role_id in &roles {
            Self::index_add(&self.role_users, *role_id, user_id, index_ttl);
        }
        for group_id in &groups {
            Self::index_add(&self.group_users, *group_id, user_id, index_ttl);
        }

        self.user_tracking
            .insert(user_id, Expiring::new((roles, groups), index_ttl));
        self.matrices
            .insert(user_id, Expiring::new(matrix.clone(), ttl));
    }
}

#[async_trait]
impl PermissionCache for MemoryPermissionCache {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, user_id: Uuid) -> AppResult<Option<UserPermissionMatrix>> {
        let now = Instant::now();
        let hit = self
            .matrices
            .get(&user_id)
            .map(|e| (e.is_live(now), e.value.clone()));

        match hit {
            Some((true, matrix)) => Ok(Some(matrix)),
            Some((false, _)) => {
                self.matrices.remove_if(&user_id, |_, e| !e.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, user_id: Uuid, matrix: &UserPermissionMatrix, ttl: Duration) -> AppResult<()> {
        let _guard = self.generation.lock().await;
        self.write(user_id, matrix, ttl);
        Ok(())
    }

    async fn generation(&self) -> AppResult<u64> {
        Ok(*self.generation.lock().await)
    }

    async fn set_if_current(
        &self,
        user_id: Uuid,
        matrix: &UserPermissionMatrix,
        ttl: Duration,
        generation: u64,
    ) -> AppResult<bool> {
        let _guard = self.generation.lock().await;
        if self.stamped_after(user_id, matrix, generation) {
            return Ok(false);
        }
        self.write(user_id, matrix, ttl);
        Ok(true)
    }

    async fn invalidate_user(&self, user_id: Uuid) -> AppResult<()> {
        let mut generation = self.generation.lock().await;
        self.stamp(&self.user_stamps, user_id, &mut *generation);
        self.drop_user(user_id);
        Ok(())
    }

    async fn invalidate_role(&self, role_id: Uuid) -> AppResult<Vec<Uuid>> {
        let mut generation = self.generation.lock().await;
        self.stamp(&self.role_stamps, role_id, &mut *generation);
        let users = Self::take_index(&self.role_users, role_id);
        for user_id in &users {
            self.drop_user(*user_id);
        }
        Ok(users)
    }

    async fn invalidate_group(&self, group_id: Uuid) -> AppResult<Vec<Uuid>> {
        let mut generation = self.generation.lock().await;
        self.stamp(&self.group_stamps, group_id, &mut *generation);
        let users = Self::take_index(&self.group_users, group_id);
        for user_id in &users {
            self.drop_user(*user_id);
        }
        Ok(users)
    }

    async fn health(&self) -> AppResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    fn matrix_with(user_id: Uuid, roles: &[Uuid], groups: &[Uuid]) -> UserPermissionMatrix {
        let mut matrix = UserPermissionMatrix::empty(user_id);
        matrix.direct_roles = roles.to_vec();
        matrix.group_ids = groups.to_vec();
        matrix
    }

    #[tokio::test]
    async fn test_round_trip_and_invalidate_user() {
        let cache = MemoryPermissionCache::new(TTL * 2);
        let user = Uuid::new_v4();
        let matrix = matrix_with(user, &[Uuid::new_v4()], &[]);

        cache.set(user, &matrix, TTL).await.unwrap();
        assert_eq!(cache.get(user).await.unwrap(), Some(matrix));

        cache.invalidate_user(user).await.unwrap();
        assert_eq!(cache.get(user).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalidate_role_cascades_to_holders() {
        let cache = MemoryPermissionCache::new(TTL * 2);
        let role = Uuid::new_v4();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        cache.set(a, &matrix_with(a, &[role], &[]), TTL).await.unwrap();
        cache.set(b, &matrix_with(b, &[role], &[]), TTL).await.unwrap();
        cache.set(c, &matrix_with(c, &[Uuid::new_v4()], &[]), TTL).await.unwrap();

        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(cache.invalidate_role(role).await.unwrap(), expected);

        assert!(cache.get(a).await.unwrap().is_none());
        assert!(cache.get(b).await.unwrap().is_none());
        assert!(cache.get(c).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalidate_group_cascades_to_members() {
        let cache = MemoryPermissionCache::new(TTL * 2);
        let group = Uuid::new_v4();
        let member = Uuid::new_v4();

        cache.set(member, &matrix_with(member, &[], &[group]), TTL).await.unwrap();
        assert_eq!(cache.invalidate_group(group).await.unwrap(), vec![member]);
        assert!(cache.get(member).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rewrite_unlinks_dropped_roles() {
        let cache = MemoryPermissionCache::new(TTL * 2);
        let (old_role, new_role) = (Uuid::new_v4(), Uuid::new_v4());
        let user = Uuid::new_v4();

        cache.set(user, &matrix_with(user, &[old_role], &[]), TTL).await.unwrap();
        cache.set(user, &matrix_with(user, &[new_role], &[]), TTL).await.unwrap();

        assert!(cache.invalidate_role(old_role).await.unwrap().is_empty());
        assert!(cache.get(user).await.unwrap().is_some());
        assert_eq!(cache.invalidate_role(new_role).await.unwrap(), vec![user]);
    }

    #[tokio::test]
    async fn test_write_after_invalidation_is_rejected() {
        let cache = MemoryPermissionCache::new(TTL * 2);
        let role = Uuid::new_v4();
        let (user, other) = (Uuid::new_v4(), Uuid::new_v4());

        let before = cache.generation().await.unwrap();
        cache.invalidate_role(role).await.unwrap();

        // computed before the invalidation, written after it
        let stale = matrix_with(user, &[role], &[]);
        assert!(!cache.set_if_current(user, &stale, TTL, before).await.unwrap());
        assert!(cache.get(user).await.unwrap().is_none());

        // untouched dependencies still land
        let fresh = matrix_with(other, &[Uuid::new_v4()], &[]);
        assert!(cache.set_if_current(other, &fresh, TTL, before).await.unwrap());

        let now = cache.generation().await.unwrap();
        assert!(now > before);
        assert!(cache.set_if_current(user, &stale, TTL, now).await.unwrap());
        assert_eq!(cache.invalidate_role(role).await.unwrap(), vec![user]);
    }

    #[tokio::test]
    async fn test_user_and_group_invalidation_reject_older_writes() {
        let cache = MemoryPermissionCache::new(TTL * 2);
        let group = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let before = cache.generation().await.unwrap();
        cache.invalidate_user(a).await.unwrap();
        cache.invalidate_group(group).await.unwrap();

        assert!(!cache.set_if_current(a, &matrix_with(a, &[], &[]), TTL, before).await.unwrap());
        assert!(!cache.set_if_current(b, &matrix_with(b, &[], &[group]), TTL, before).await.unwrap());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_expired_entries_miss() {
        let cache = MemoryPermissionCache::new(Duration::from_millis(40));
        let user = Uuid::new_v4();

        cache
            .set(user, &matrix_with(user, &[], &[]), Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(cache.get(user).await.unwrap().is_none());
        assert_eq!(cache.purge_expired(), 0);
        assert!(cache.is_empty());
    }
}
