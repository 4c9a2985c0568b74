use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use uuid::Uuid;

use super::PermissionCache;
use crate::config::CacheConfig;
use crate::errors::{AppError, AppResult};
use crate::models::rbac::UserPermissionMatrix;

// KEYS: matrix, user_roles, user_groups, user stamp
// ARGV: generation (-1 = unconditional), payload, ttl, index ttl, prefix, user,
//       role count, role ids..., group ids...
const WRITE_MATRIX: &str = r#"
local generation = tonumber(ARGV[1])
local prefix, user = ARGV[5], ARGV[6]
local role_count = tonumber(ARGV[7])
local roles, groups = {}, {}
for i = 8, 7 + role_count do roles[#roles + 1] = ARGV[i] end
for i = 8 + role_count, #ARGV do groups[#groups + 1] = ARGV[i] end

local function newer(key)
  local stamp = redis.call('GET', key)
  return stamp and tonumber(stamp) > generation
end

if generation >= 0 then
  if newer(KEYS[4]) then return 0 end
  for _, id in ipairs(roles) do
    if newer(prefix .. ':stamp:role:' .. id) then return 0 end
  end
  for _, id in ipairs(groups) do
    if newer(prefix .. ':stamp:group:' .. id) then return 0 end
  end
end

for _, id in ipairs(redis.call('SMEMBERS', KEYS[2])) do
  redis.call('SREM', prefix .. ':role_users:' .. id, user)
end
for _, id in ipairs(redis.call('SMEMBERS', KEYS[3])) do
  redis.call('SREM', prefix .. ':group_users:' .. id, user)
end
redis.call('DEL', KEYS[2], KEYS[3])

for _, id in ipairs(roles) do
  local index = prefix .. ':role_users:' .. id
  redis.call('SADD', index, user)
  redis.call('EXPIRE', index, ARGV[4])
  redis.call('SADD', KEYS[2], id)
end
for _, id in ipairs(groups) do
  local index = prefix .. ':group_users:' .. id
  redis.call('SADD', index, user)
  redis.call('EXPIRE', index, ARGV[4])
  redis.call('SADD', KEYS[3], id)
end
redis.call('EXPIRE', KEYS[2], ARGV[4])
redis.call('EXPIRE', KEYS[3], ARGV[4])

redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
return 1
"#;

// KEYS: generation, stamp, index
// ARGV: stamp ttl, prefix
const DROP_INDEXED: &str = r#"
local generation = redis.call('INCR', KEYS[1])
redis.call('SET', KEYS[2], generation, 'EX', ARGV[1])
local users = redis.call('SMEMBERS', KEYS[3])
for _, user in ipairs(users) do
  redis.call('DEL', ARGV[2] .. ':matrix:' .. user, ARGV[2] .. ':user_roles:' .. user, ARGV[2] .. ':user_groups:' .. user)
end
redis.call('DEL', KEYS[3])
return users
"#;

// KEYS: generation, stamp, matrix, user_roles, user_groups
// ARGV: stamp ttl
const DROP_USER: &str = r#"
local generation = redis.call('INCR', KEYS[1])
redis.call('SET', KEYS[2], generation, 'EX', ARGV[1])
redis.call('DEL', KEYS[3], KEYS[4], KEYS[5])
return generation
"#;

/// Distributed cache. Layout under `{prefix}`:
///
/// - `matrix:{user}` serialized matrix (`SET EX`)
/// - `role_users:{role}` / `group_users:{group}` reverse index sets
/// - `user_roles:{user}` / `user_groups:{user}` tracking sets of the last write
/// - `generation` invalidation counter, `stamp:{user|role|group}:{id}` its
///   value at the last invalidation of that id
///
/// Writes and invalidations run as Lua scripts, so each one is atomic against
/// the others.
#[derive(Clone)]
pub struct RedisPermissionCache {
    conn: MultiplexedConnection,
    prefix: String,
    index_ttl: Duration,
    write_script: Script,
    drop_indexed_script: Script,
    drop_user_script: Script,
}

impl std::fmt::Debug for RedisPermissionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPermissionCache")
            .field("prefix", &self.prefix)
            .field("index_ttl", &self.index_ttl)
            .finish()
    }
}

fn secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn parse_members(members: Vec<String>, key: &str) -> Vec<Uuid> {
    let mut ids: Vec<Uuid> = members
        .iter()
        .filter_map(|m| match Uuid::parse_str(m) {
            Ok(id) => Some(id),
            Err(_) => {
                tracing::warn!(key = %key, member = %m, "ignoring malformed index member");
                None
            }
        })
        .collect();
    ids.sort();
    ids
}

impl RedisPermissionCache {
    pub async fn connect(config: &CacheConfig) -> AppResult<Self> {
        let url = config
            .redis_url
            .as_deref()
            .ok_or_else(|| AppError::configuration("REDIS_URL is required for the redis cache backend"))?;
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            prefix: config.key_prefix.clone(),
            index_ttl: config.index_ttl,
            write_script: Script::new(WRITE_MATRIX),
            drop_indexed_script: Script::new(DROP_INDEXED),
            drop_user_script: Script::new(DROP_USER),
        })
    }

    fn matrix_key(&self, user_id: Uuid) -> String {
        format!("{}:matrix:{}", self.prefix, user_id)
    }

    fn role_users_key(&self, role_id: Uuid) -> String {
        format!("{}:role_users:{}", self.prefix, role_id)
    }

    fn group_users_key(&self, group_id: Uuid) -> String {
        format!("{}:group_users:{}", self.prefix, group_id)
    }

    fn user_roles_key(&self, user_id: Uuid) -> String {
        format!("{}:user_roles:{}", self.prefix, user_id)
    }

    fn user_groups_key(&self, user_id: Uuid) -> String {
        format!("{}:user_groups:{}", self.prefix, user_id)
    }

    fn generation_key(&self) -> String {
        format!("{}:generation", self.prefix)
    }

    fn stamp_key(&self, kind: &str, id: Uuid) -> String {
        format!("{}:stamp:{}:{}", self.prefix, kind, id)
    }

    /// Run the write script. `generation` of `None` writes unconditionally.
    async fn write(
        &self,
        user_id: Uuid,
        matrix: &UserPermissionMatrix,
        ttl: Duration,
        generation: Option<u64>,
    ) -> AppResult<bool> {
        let payload = serde_json::to_string(matrix)?;
        let roles = matrix.all_role_ids();
        let generation = generation.map_or(-1, |g| i64::try_from(g).unwrap_or(i64::MAX));

        let mut invocation = self.write_script.prepare_invoke();
        invocation
            .key(self.matrix_key(user_id))
            .key(self.user_roles_key(user_id))
            .key(self.user_groups_key(user_id))
            .key(self.stamp_key("user", user_id))
            .arg(generation)
            .arg(payload)
            .arg(secs(ttl))
            .arg(secs(self.index_ttl.max(ttl)))
            .arg(&self.prefix)
            .arg(user_id.to_string())
            .arg(roles.len());
        for role_id in &roles {
            invocation.arg(role_id.to_string());
        }
        for group_id in &matrix.group_ids {
            invocation.arg(group_id.to_string());
        }

        let mut conn = self.conn.clone();
        let written: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(written == 1)
    }

    /// Bump the generation, stamp `kind:id`, and drop every user in the index.
    async fn drop_indexed(&self, kind: &str, id: Uuid, index_key: String) -> AppResult<Vec<Uuid>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = self
            .drop_indexed_script
            .key(self.generation_key())
            .key(self.stamp_key(kind, id))
            .key(&index_key)
            .arg(secs(self.index_ttl))
            .arg(&self.prefix)
            .invoke_async(&mut conn)
            .await?;
        Ok(parse_members(members, &index_key))
    }
}

#[async_trait]
impl PermissionCache for RedisPermissionCache {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, user_id: Uuid) -> AppResult<Option<UserPermissionMatrix>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.matrix_key(user_id)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, user_id: Uuid, matrix: &UserPermissionMatrix, ttl: Duration) -> AppResult<()> {
        self.write(user_id, matrix, ttl, None).await?;
        Ok(())
    }

    async fn generation(&self) -> AppResult<u64> {
        let mut conn = self.conn.clone();
        let generation: Option<u64> = conn.get(self.generation_key()).await?;
        Ok(generation.unwrap_or(0))
    }

    async fn set_if_current(
        &self,
        user_id: Uuid,
        matrix: &UserPermissionMatrix,
        ttl: Duration,
        generation: u64,
    ) -> AppResult<bool> {
        self.write(user_id, matrix, ttl, Some(generation)).await
    }

    async fn invalidate_user(&self, user_id: Uuid) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .drop_user_script
            .key(self.generation_key())
            .key(self.stamp_key("user", user_id))
            .key(self.matrix_key(user_id))
            .key(self.user_roles_key(user_id))
            .key(self.user_groups_key(user_id))
            .arg(secs(self.index_ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn invalidate_role(&self, role_id: Uuid) -> AppResult<Vec<Uuid>> {
        self.drop_indexed("role", role_id, self.role_users_key(role_id)).await
    }

    async fn invalidate_group(&self, group_id: Uuid) -> AppResult<Vec<Uuid>> {
        self.drop_indexed("group", group_id, self.group_users_key(group_id)).await
    }

    async fn health(&self) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(AppError::cache(format!("unexpected PING reply: {pong}")));
        }
        Ok(())
    }
}

/// These run against a live server and are skipped unless `REDIS_URL` is set.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheBackend;

    const TTL: Duration = Duration::from_secs(60);

    async fn connect() -> Option<RedisPermissionCache> {
        let url = std::env::var("REDIS_URL").ok()?;
        let config = CacheConfig {
            backend: CacheBackend::Redis,
            redis_url: Some(url),
            key_prefix: format!("authz-test-{}", Uuid::new_v4()),
            ..CacheConfig::default()
        };
        Some(RedisPermissionCache::connect(&config).await.expect("redis reachable"))
    }

    fn matrix_with(user_id: Uuid, roles: &[Uuid], groups: &[Uuid]) -> UserPermissionMatrix {
        let mut matrix = UserPermissionMatrix::empty(user_id);
        matrix.direct_roles = roles.to_vec();
        matrix.group_ids = groups.to_vec();
        matrix
    }

    #[tokio::test]
    async fn test_round_trip_and_invalidate_user() {
        let Some(cache) = connect().await else { return };
        let user = Uuid::new_v4();
        let matrix = matrix_with(user, &[Uuid::new_v4()], &[]);

        cache.set(user, &matrix, TTL).await.unwrap();
        assert_eq!(cache.get(user).await.unwrap(), Some(matrix));

        cache.invalidate_user(user).await.unwrap();
        assert_eq!(cache.get(user).await.unwrap(), None);
        cache.health().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalidate_role_cascades_to_holders() {
        let Some(cache) = connect().await else { return };
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
        let Some(cache) = connect().await else { return };
        let group = Uuid::new_v4();
        let member = Uuid::new_v4();

        cache.set(member, &matrix_with(member, &[], &[group]), TTL).await.unwrap();
        assert_eq!(cache.invalidate_group(group).await.unwrap(), vec![member]);
        assert!(cache.get(member).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rewrite_unlinks_dropped_roles() {
        let Some(cache) = connect().await else { return };
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
        let Some(cache) = connect().await else { return };
        let role = Uuid::new_v4();
        let user = Uuid::new_v4();

        let before = cache.generation().await.unwrap();
        cache.invalidate_role(role).await.unwrap();

        let stale = matrix_with(user, &[role], &[]);
        assert!(!cache.set_if_current(user, &stale, TTL, before).await.unwrap());
        assert!(cache.get(user).await.unwrap().is_none());

        let now = cache.generation().await.unwrap();
        assert!(now > before);
        assert!(cache.set_if_current(user, &stale, TTL, now).await.unwrap());
        assert_eq!(cache.invalidate_role(role).await.unwrap(), vec![user]);
    }
}
