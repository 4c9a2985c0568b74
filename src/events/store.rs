use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use super::AuthzEvent;
use crate::errors::AppResult;

/// Append-only, hash-chained log of every published event.
///
/// Each row stores `SHA256(prev_hash || payload)` so tampering with any row
/// breaks every later hash.
#[derive(Debug)]
pub struct EventStore {
    pool: SqlitePool,
    // the chain head must be read and written atomically
    append_lock: Mutex<()>,
}

impl EventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            append_lock: Mutex::new(()),
        }
    }

    pub async fn append(&self, event: &AuthzEvent) -> AppResult<()> {
        let payload = serde_json::to_string(event)?;

        let _guard = self.append_lock.lock().await;

        let prev_hash: Option<String> =
            sqlx::query_scalar("SELECT hash FROM event_store ORDER BY seq DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;

        let hash = chain_hash(prev_hash.as_deref(), &payload);

        sqlx::query(
            r#"
            INSERT INTO event_store (id, event_name, occurred_at, actor_id, target_id, payload, severity, prev_hash, hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.id.to_string())
        .bind(event.event_type.as_str())
        .bind(event.occurred_at)
        .bind(event.actor_id.map(|id| id.to_string()))
        .bind(&event.target_id)
        .bind(&payload)
        .bind(event.severity.as_str())
        .bind(&prev_hash)
        .bind(&hash)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Recompute the chain from the first row; false on the first mismatch.
    pub async fn verify_chain(&self) -> AppResult<bool> {
        let rows = sqlx::query("SELECT payload, prev_hash, hash FROM event_store ORDER BY seq ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut expected_prev: Option<String> = None;
        for row in rows {
            let payload: String = row.try_get("payload")?;
            let prev_hash: Option<String> = row.try_get("prev_hash")?;
            let hash: String = row.try_get("hash")?;

            if prev_hash != expected_prev || chain_hash(prev_hash.as_deref(), &payload) != hash {
                return Ok(false);
            }
            expected_prev = Some(hash);
        }

        Ok(true)
    }
}

fn chain_hash(prev_hash: Option<&str>, payload: &str) -> String {
    let mut hasher = Sha256::new();
    if let Some(prev) = prev_hash {
        hasher.update(prev.as_bytes());
    }
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_hash_depends_on_previous() {
        let first = chain_hash(None, "payload");
        let second = chain_hash(Some(&first), "payload");
        assert_ne!(first, second);
        assert_eq!(first.len(), 64);
        assert_eq!(first, chain_hash(None, "payload"));
    }
}
