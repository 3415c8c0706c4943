//! Redis backend for the metadata store
//!
//! Data model (all keys under a configurable prefix):
//! - `{prefix}:item:{pk}:{sk}` → Hash, one field per record field (JSON encoded)
//! - `{prefix}:partition:{pk}` → Sorted set of sort keys (score 0, lexicographic order)
//! - `{prefix}:partitions` → Set of all partition keys

use super::{FieldUpdate, Item, ItemKey, MetadataStore, SortOrder};
use anyhow::Context;
use async_trait::async_trait;
use faas_common::{Error, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info};

/// Applies field changes only while the hash exists, in one server-side step.
/// ARGV holds `(op, field, value)` triples; returns nil when the hash is missing.
const UPDATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return false
end
for i = 1, #ARGV, 3 do
    if ARGV[i] == 'set' then
        redis.call('HSET', KEYS[1], ARGV[i + 1], ARGV[i + 2])
    else
        redis.call('HINCRBY', KEYS[1], ARGV[i + 1], ARGV[i + 2])
    end
end
return redis.call('HGETALL', KEYS[1])
"#;

/// Redis-backed metadata store
pub struct RedisMetadataStore {
    conn: ConnectionManager,
    prefix: String,
    update_script: redis::Script,
}

fn redis_err(err: redis::RedisError) -> Error {
    Error::Redis(err.to_string())
}

fn encode(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn decode(key: &str, fields: HashMap<String, String>) -> Result<Item> {
    let mut item = Item::new();
    for (field, raw) in fields {
        let value = serde_json::from_str(&raw).map_err(|e| Error::InvalidRecord {
            key: key.to_string(),
            reason: format!("field {}: {}", field, e),
        })?;
        item.insert(field, value);
    }
    Ok(item)
}

/// Lexicographic bounds covering every member starting with `prefix`.
/// Sort keys are printable ASCII, so DEL (0x7f) sorts after all of them.
fn lex_bounds(prefix: &str) -> (String, String) {
    if prefix.is_empty() {
        ("-".to_string(), "+".to_string())
    } else {
        (format!("[{}", prefix), format!("({}\u{7f}", prefix))
    }
}

impl RedisMetadataStore {
    /// Connect to Redis
    pub async fn new(redis_url: &str, prefix: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;

        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;

        info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            update_script: redis::Script::new(UPDATE_SCRIPT),
        })
    }

    fn item_key(&self, key: &ItemKey) -> String {
        format!("{}:item:{}:{}", self.prefix, key.pk, key.sk)
    }

    fn partition_key(&self, pk: &str) -> String {
        format!("{}:partition:{}", self.prefix, pk)
    }

    fn partitions_key(&self) -> String {
        format!("{}:partitions", self.prefix)
    }

    /// Check the connection is alive
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for RedisMetadataStore {
    async fn put(&self, key: &ItemKey, item: Item) -> Result<()> {
        let item_key = self.item_key(key);
        let fields = item
            .iter()
            .map(|(field, value)| Ok((field.clone(), encode(value)?)))
            .collect::<Result<Vec<(String, String)>>>()?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(&item_key).ignore();
        if !fields.is_empty() {
            pipe.hset_multiple(&item_key, &fields).ignore();
        }
        pipe.zadd(self.partition_key(&key.pk), &key.sk, 0).ignore();
        pipe.sadd(self.partitions_key(), &key.pk).ignore();

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await.map_err(redis_err)?;

        debug!("Stored record {}", key);
        Ok(())
    }

    async fn get(&self, key: &ItemKey) -> Result<Option<Item>> {
        let item_key = self.item_key(key);
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(&item_key).await.map_err(redis_err)?;

        if fields.is_empty() {
            return Ok(None);
        }
        decode(&item_key, fields).map(Some)
    }

    async fn update(&self, key: &ItemKey, updates: &[FieldUpdate]) -> Result<Option<Item>> {
        let item_key = self.item_key(key);
        let mut conn = self.conn.clone();

        let mut invocation = self.update_script.prepare_invoke();
        invocation.key(&item_key);
        for update in updates {
            match update {
                FieldUpdate::Set(field, value) => {
                    invocation.arg("set").arg(field).arg(encode(value)?);
                }
                FieldUpdate::Increment(field, delta) => {
                    invocation.arg("incr").arg(field).arg(*delta);
                }
            }
        }

        let fields: Option<HashMap<String, String>> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;

        match fields {
            Some(fields) => decode(&item_key, fields).map(Some),
            None => {
                debug!("Skipping update of missing record {}", key);
                Ok(None)
            }
        }
    }

    async fn delete(&self, key: &ItemKey) -> Result<bool> {
        let item_key = self.item_key(key);
        let partition_key = self.partition_key(&key.pk);
        let mut conn = self.conn.clone();

        let removed: i64 = conn.del(&item_key).await.map_err(redis_err)?;
        let _: () = conn.zrem(&partition_key, &key.sk).await.map_err(redis_err)?;

        let remaining: i64 = conn.zcard(&partition_key).await.map_err(redis_err)?;
        if remaining == 0 {
            let _: () = conn
                .srem(self.partitions_key(), &key.pk)
                .await
                .map_err(redis_err)?;
        }

        Ok(removed > 0)
    }

    async fn query(
        &self,
        pk: &str,
        sk_prefix: &str,
        order: SortOrder,
        limit: Option<usize>,
    ) -> Result<Vec<Item>> {
        let partition_key = self.partition_key(pk);
        let (min, max) = lex_bounds(sk_prefix);
        let mut conn = self.conn.clone();

        let sort_keys: redis::RedisResult<Vec<String>> = match (order, limit) {
            (SortOrder::Ascending, None) => conn.zrangebylex(&partition_key, &min, &max).await,
            (SortOrder::Ascending, Some(count)) => {
                conn.zrangebylex_limit(&partition_key, &min, &max, 0, count as isize)
                    .await
            }
            (SortOrder::Descending, None) => conn.zrevrangebylex(&partition_key, &max, &min).await,
            (SortOrder::Descending, Some(count)) => {
                conn.zrevrangebylex_limit(&partition_key, &max, &min, 0, count as isize)
                    .await
            }
        };
        let sort_keys = sort_keys.map_err(redis_err)?;

        if sort_keys.is_empty() {
            return Ok(Vec::new());
        }

        let item_keys: Vec<String> = sort_keys
            .iter()
            .map(|sk| self.item_key(&ItemKey::new(pk, sk.as_str())))
            .collect();

        let mut pipe = redis::pipe();
        for item_key in &item_keys {
            pipe.hgetall(item_key);
        }
        let hashes: Vec<HashMap<String, String>> =
            pipe.query_async(&mut conn).await.map_err(redis_err)?;

        let mut items = Vec::with_capacity(hashes.len());
        for (item_key, fields) in item_keys.iter().zip(hashes) {
            // Index entries can briefly outlive their hash
            if fields.is_empty() {
                continue;
            }
            items.push(decode(item_key, fields)?);
        }
        Ok(items)
    }

    async fn scan(&self, pk_prefix: &str, sk_prefix: &str) -> Result<Vec<Item>> {
        let mut conn = self.conn.clone();
        let mut partitions: Vec<String> = conn
            .smembers(self.partitions_key())
            .await
            .map_err(redis_err)?;
        partitions.retain(|pk| pk.starts_with(pk_prefix));
        partitions.sort();

        let mut items = Vec::new();
        for pk in partitions {
            items.extend(self.query(&pk, sk_prefix, SortOrder::Ascending, None).await?);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::to_item;
    use serde_json::json;

    async fn get_test_store() -> RedisMetadataStore {
        RedisMetadataStore::new("redis://127.0.0.1:6379/15", "faas-test")
            .await
            .expect("Failed to connect to test Redis")
    }

    #[test]
    fn test_lex_bounds() {
        assert_eq!(lex_bounds(""), ("-".to_string(), "+".to_string()));
        assert_eq!(
            lex_bounds("FN#"),
            ("[FN#".to_string(), "(FN#\u{7f}".to_string())
        );
    }

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_update_increments_atomically() {
        let store = get_test_store().await;
        let key = ItemKey::new("WS#ws-redis", "METADATA");

        store
            .put(&key, to_item(&json!({ "id": "ws-redis", "functionCount": 0 })).unwrap())
            .await
            .unwrap();

        let updated = store
            .update(
                &key,
                &[
                    FieldUpdate::increment("functionCount", 2),
                    FieldUpdate::set("name", "renamed"),
                ],
            )
            .await
            .unwrap()
            .expect("record exists");

        assert_eq!(updated["functionCount"], 2);
        assert_eq!(updated["name"], "renamed");

        // Clean up
        assert!(store.delete(&key).await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_update_missing_record_writes_nothing() {
        let store = get_test_store().await;
        let key = ItemKey::new("WS#ws-redis-gone", "METADATA");
        store.delete(&key).await.unwrap();

        let updated = store
            .update(
                &key,
                &[
                    FieldUpdate::increment("functionCount", 1),
                    FieldUpdate::set("name", "ghost"),
                ],
            )
            .await
            .unwrap();

        assert!(updated.is_none());
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_query_by_prefix() {
        let store = get_test_store().await;

        for sk in ["LOG#2026-01-01T00:00:00.000001Z#a", "LOG#2026-01-02T00:00:00.000001Z#b"] {
            store
                .put(&ItemKey::new("FN#fn-redis", sk), to_item(&json!({ "sk": sk })).unwrap())
                .await
                .unwrap();
        }

        let newest = store
            .query("FN#fn-redis", "LOG#", SortOrder::Descending, Some(1))
            .await
            .unwrap();
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0]["sk"], "LOG#2026-01-02T00:00:00.000001Z#b");

        // Clean up
        for item in store.scan("FN#fn-redis", "LOG#").await.unwrap() {
            let sk = item["sk"].as_str().unwrap().to_string();
            store.delete(&ItemKey::new("FN#fn-redis", sk)).await.unwrap();
        }
    }
}
