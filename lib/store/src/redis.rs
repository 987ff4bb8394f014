//! Redis-backed store driver.
//!
//! This is the broker-backed driver: all engine processes sharing one Redis
//! see the same keyspace, which is what makes the decide lock distributed
//! and crash recovery possible across hosts.
//!
//! Commands are issued through a [`ConnectionManager`], which transparently
//! reconnects after broker restarts. Conditional delete uses a Lua script so
//! the compare and the delete are atomic on the server.

use crate::error::StoreError;
use crate::store::{Store, StreamEntry};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{RedisError, Script};
use std::collections::HashMap;
use std::time::Duration;

const DELETE_IF_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis [`Store`] implementation.
pub struct RedisStore {
    conn: ConnectionManager,
    delete_if: Script,
}

impl RedisStore {
    /// Connects to Redis at the given URL (e.g. `redis://localhost:6379/0`).
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the initial connection fails.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(connection_err)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(connection_err)?;

        Ok(Self {
            conn,
            delete_if: Script::new(DELETE_IF_SCRIPT),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn connection_err(e: RedisError) -> StoreError {
    StoreError::Connection {
        message: e.to_string(),
    }
}

fn command_err(e: RedisError) -> StoreError {
    if e.is_connection_refusal() || e.is_io_error() {
        StoreError::Connection {
            message: e.to_string(),
        }
    } else {
        StoreError::Command {
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_err)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await
            .map_err(command_err)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<()>(&mut conn)
            .await
            .map_err(command_err)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_err)?;
        Ok(removed > 0)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        // SET NX replies OK on success and nil when the key already exists.
        let reply: Option<String> = cmd.query_async(&mut conn).await.map_err(command_err)?;
        Ok(reply.is_some())
    }

    async fn delete_if(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let deleted: i64 = self
            .delete_if
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(command_err)?;
        Ok(deleted > 0)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await
            .map_err(command_err)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn();
        let value: Option<String> = redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await
            .map_err(command_err)?;
        Ok(value)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_err)?;
        Ok(fields)
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await
            .map_err(command_err)?;
        Ok(removed > 0)
    }

    async fn stream_append(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<String, StoreError> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(key).arg("*");
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        let id: String = cmd.query_async(&mut conn).await.map_err(command_err)?;
        Ok(id)
    }

    async fn stream_range(
        &self,
        key: &str,
        from: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(key).arg(from.unwrap_or("-")).arg("+");
        if let Some(limit) = limit {
            cmd.arg("COUNT").arg(limit);
        }
        // XRANGE replies [[id, [field, value, ...]], ...].
        let raw: Vec<(String, Vec<String>)> =
            cmd.query_async(&mut conn).await.map_err(command_err)?;

        let entries = raw
            .into_iter()
            .map(|(id, flat)| {
                let fields = flat
                    .chunks_exact(2)
                    .map(|pair| (pair[0].clone(), pair[1].clone()))
                    .collect();
                StreamEntry { id, fields }
            })
            .collect();
        Ok(entries)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let added: i64 = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(command_err)?;
        Ok(added > 0)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(command_err)?;
        Ok(removed > 0)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_err)?;
        Ok(members)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(command_err)?;
        Ok(applied > 0)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(command_err)?;
        Ok(())
    }
}
