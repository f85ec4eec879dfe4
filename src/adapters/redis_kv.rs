//! Redis KV Store
//!
//! `KvStore` over the async redis driver. The `ConnectionManager` is created
//! on first use and dropped after a failed ping, so the next probe dials a
//! fresh connection.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use tracing::debug;

use crate::domain::ports::{KeyTtl, KvBatch, KvOp, KvStore, MemoryInfo};
use crate::error::{Error, Result};
use crate::kv::KvConfig;

/// Redis-backed KV store
pub struct RedisKvStore {
    client: redis::Client,
    manager: RwLock<Option<ConnectionManager>>,
}

impl RedisKvStore {
    pub fn new(config: &KvConfig) -> Result<Self> {
        let client = redis::Client::open(config.url())
            .map_err(|e| Error::Config(format!("Invalid redis URL: {}", e)))?;
        Ok(Self {
            client,
            manager: RwLock::new(None),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let cached = self.manager.read().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        debug!("Opening redis connection manager");
        let conn = ConnectionManager::new(self.client.clone()).await?;
        *self.manager.write() = Some(conn.clone());
        Ok(conn)
    }

    fn reset(&self) {
        *self.manager.write() = None;
    }
}

/// Whole seconds for `SETEX`/`EXPIRE`, never below one.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Parse the `INFO memory` section.
pub fn parse_memory_info(info: &str) -> MemoryInfo {
    let mut memory = MemoryInfo {
        fragmentation_ratio: 1.0,
        ..Default::default()
    };
    for line in info.lines() {
        let Some((field, value)) = line.trim().split_once(':') else {
            continue;
        };
        match field {
            "used_memory" => memory.used_bytes = value.parse().unwrap_or(0),
            "maxmemory" => memory.max_bytes = value.parse().unwrap_or(0),
            "mem_fragmentation_ratio" => {
                memory.fragmentation_ratio = value.parse().unwrap_or(1.0)
            }
            _ => {}
        }
    }
    memory
}

#[async_trait]
impl KvStore for RedisKvStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = match self.connection().await {
            Ok(conn) => conn,
            Err(e) => {
                self.reset();
                return Err(e);
            }
        };
        let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        if let Err(e) = pong {
            self.reset();
            return Err(e.into());
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_secs(ttl))
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let deleted: u64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(deleted)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let keys: Vec<String> = redis::cmd("KEYS").arg(pattern).query_async(&mut conn).await?;
        Ok(keys)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let mut conn = self.connection().await?;
        let secs: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        Ok(match secs {
            -2 => KeyTtl::Missing,
            s if s < 0 => KeyTtl::Persistent,
            s => KeyTtl::Expires(Duration::from_secs(s as u64)),
        })
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let added: u64 = redis::cmd("SADD")
            .arg(key)
            .arg(members)
            .query_async(&mut conn)
            .await?;
        Ok(added)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let members: Vec<String> = redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        Ok(members)
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        let mut conn = self.connection().await?;
        let count: u64 = redis::cmd("SCARD").arg(key).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn execute(&self, batch: KvBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for op in batch.into_ops() {
            match op {
                KvOp::SetEx { key, value, ttl } => {
                    pipe.cmd("SETEX").arg(key).arg(ttl_secs(ttl)).arg(value).ignore();
                }
                KvOp::Del { keys } => {
                    pipe.cmd("DEL").arg(keys).ignore();
                }
                KvOp::SAdd { key, members } => {
                    pipe.cmd("SADD").arg(key).arg(members).ignore();
                }
                KvOp::SRem { key, members } => {
                    pipe.cmd("SREM").arg(key).arg(members).ignore();
                }
                KvOp::ZAdd { key, member, score } => {
                    pipe.cmd("ZADD").arg(key).arg(score).arg(member).ignore();
                }
                KvOp::Expire { key, ttl } => {
                    pipe.cmd("EXPIRE").arg(key).arg(ttl_secs(ttl)).ignore();
                }
            }
        }

        let mut conn = self.connection().await?;
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn memory_info(&self) -> Result<MemoryInfo> {
        let mut conn = self.connection().await?;
        let info: String = redis::cmd("INFO").arg("memory").query_async(&mut conn).await?;
        Ok(parse_memory_info(&info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_info() {
        let info = "# Memory\r\nused_memory:1048576\r\nused_memory_human:1.00M\r\nmaxmemory:4194304\r\nmem_fragmentation_ratio:1.62\r\n";
        let memory = parse_memory_info(info);
        assert_eq!(memory.used_bytes, 1_048_576);
        assert_eq!(memory.max_bytes, 4_194_304);
        assert!((memory.fragmentation_ratio - 1.62).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_memory_info_defaults() {
        let memory = parse_memory_info("# Memory\r\n");
        assert_eq!(memory.used_bytes, 0);
        assert_eq!(memory.max_bytes, 0);
        assert_eq!(memory.fragmentation_ratio, 1.0);
    }

    #[test]
    fn test_ttl_secs_floor() {
        assert_eq!(ttl_secs(Duration::from_millis(200)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(600)), 600);
    }

    #[test]
    fn test_new_does_not_dial() {
        let store = RedisKvStore::new(&KvConfig {
            port: 1,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(store.name(), "redis");
        assert!(store.manager.read().is_none());
    }
}
