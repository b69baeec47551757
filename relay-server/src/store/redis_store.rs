use std::collections::HashSet;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use super::{PresenceStore, StoreError};
use crate::UserId;

/// Seeds the pool exactly once per cluster. The marker key outlives the
/// list, so a fully drained pool is never refilled with duplicate IDs.
const SEED_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[2]) == 1 then
    return 0
end
for id = 0, tonumber(ARGV[1]) - 1 do
    redis.call('LPUSH', KEYS[1], id)
end
redis.call('SET', KEYS[2], ARGV[1])
return 1
";

/// Presence store backed by Redis.
///
/// Key layout (all under `prefix`):
/// - `{prefix}:identity_pool` list of free IDs (LPUSH to return, RPOP to take)
/// - `{prefix}:identity_pool:seeded` bootstrap marker
/// - `{prefix}:user:{id}` owning node, no expiry
/// - `{prefix}:node:{node}:members` set of user IDs on that node
/// - `{prefix}:nodes` hash of live nodes
pub struct RedisStore {
    conn: MultiplexedConnection,
    prefix: String,
    seed_script: redis::Script,
}

impl RedisStore {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            seed_script: redis::Script::new(SEED_SCRIPT),
        })
    }

    fn pool_key(&self) -> String {
        format!("{}:identity_pool", self.prefix)
    }

    fn seeded_key(&self) -> String {
        format!("{}:identity_pool:seeded", self.prefix)
    }

    fn user_key(&self, user: UserId) -> String {
        format!("{}:user:{user}", self.prefix)
    }

    fn members_key(&self, node: &str) -> String {
        format!("{}:node:{node}:members", self.prefix)
    }

    fn nodes_key(&self) -> String {
        format!("{}:nodes", self.prefix)
    }
}

fn parse_id(key: &str, value: String) -> Result<UserId, StoreError> {
    value
        .parse()
        .map_err(|_| StoreError::Corrupt { key: key.to_string(), value })
}

#[async_trait]
impl PresenceStore for RedisStore {
    async fn seed_pool(&self, size: u32) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let seeded: i64 = self
            .seed_script
            .key(self.pool_key())
            .key(self.seeded_key())
            .arg(size)
            .invoke_async(&mut conn)
            .await?;
        Ok(seeded == 1)
    }

    async fn pool_pop(&self) -> Result<Option<UserId>, StoreError> {
        let mut conn = self.conn.clone();
        let key = self.pool_key();
        let value: Option<String> = redis::cmd("RPOP").arg(&key).query_async(&mut conn).await?;
        value.map(|v| parse_id(&key, v)).transpose()
    }

    async fn pool_push(&self, id: UserId) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("LPUSH")
            .arg(self.pool_key())
            .arg(id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_owner(&self, user: UserId, node: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(self.user_key(user))
            .arg(node)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_owner(&self, user: UserId) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let owner: Option<String> = redis::cmd("GET")
            .arg(self.user_key(user))
            .query_async(&mut conn)
            .await?;
        Ok(owner)
    }

    async fn delete_owner(&self, user: UserId) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(self.user_key(user))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn add_member(&self, node: &str, user: UserId) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SADD")
            .arg(self.members_key(node))
            .arg(user)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove_member(&self, node: &str, user: UserId) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SREM")
            .arg(self.members_key(node))
            .arg(user)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn members(&self, node: &str) -> Result<Vec<UserId>, StoreError> {
        let mut conn = self.conn.clone();
        let key = self.members_key(node);
        let raw: Vec<String> = redis::cmd("SMEMBERS").arg(&key).query_async(&mut conn).await?;
        let mut ids = raw
            .into_iter()
            .map(|v| parse_id(&key, v))
            .collect::<Result<Vec<_>, _>>()?;
        ids.sort_unstable();
        Ok(ids)
    }

    async fn register_node(&self, node: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("HSET")
            .arg(self.nodes_key())
            .arg(node)
            .arg("ok")
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn deregister_node(&self, node: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("HDEL")
            .arg(self.nodes_key())
            .arg(node)
            .ignore()
            .cmd("DEL")
            .arg(self.members_key(node))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn live_nodes(&self) -> Result<HashSet<String>, StoreError> {
        let mut conn = self.conn.clone();
        let nodes: Vec<String> = redis::cmd("HKEYS")
            .arg(self.nodes_key())
            .query_async(&mut conn)
            .await?;
        Ok(nodes.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_id_reports_corrupt_values() {
        assert_eq!(parse_id("k", "12".into()).unwrap(), 12);
        let err = parse_id("k", "twelve".into()).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { ref value, .. } if value == "twelve"));
    }
}
