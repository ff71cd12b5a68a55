//! Redis cache adapter

use super::Cache;
use ::redis::aio::ConnectionManager;
use ::redis::{Client, RedisResult};
use async_trait::async_trait;
use mailsift_common::config::RedisConfig;
use mailsift_common::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::info;

/// Cache backed by a multiplexed Redis connection
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    timeout: Duration,
}

impl RedisCache {
    /// Connect to Redis
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        info!(url = %config.url, "Connecting to Redis");

        let client = Client::open(config.url.as_str())
            .map_err(|e| Error::Config(format!("Invalid Redis URL: {}", e)))?;

        let conn = tokio::time::timeout(config.timeout(), ConnectionManager::new(client))
            .await
            .map_err(|_| Error::Cache("Timed out connecting to Redis".to_string()))?
            .map_err(|e| Error::Cache(format!("Failed to connect: {}", e)))?;

        info!("Redis connection established");

        Ok(Self {
            conn,
            timeout: config.timeout(),
        })
    }

    /// Run one command future under the configured timeout
    async fn run<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::Cache(format!("{} failed: {}", op, e))),
            Err(_) => Err(Error::Cache(format!(
                "{} timed out after {:?}",
                op, self.timeout
            ))),
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl Cache for RedisCache {
    async fn get_counter(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        self.run("GET", async move {
            ::redis::cmd("GET")
                .arg(key)
                .query_async::<_, Option<i64>>(&mut conn)
                .await
        })
        .await
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut conn = self.conn.clone();
        let (count,): (i64,) = self
            .run("INCR", async move {
                ::redis::pipe()
                    .atomic()
                    .cmd("SET")
                    .arg(key)
                    .arg(0)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_millis(ttl))
                    .ignore()
                    .cmd("INCR")
                    .arg(key)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(count)
    }

    async fn set_union(&self, keys: &[String]) -> Result<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        self.run("SUNION", async move {
            ::redis::cmd("SUNION")
                .arg(keys)
                .query_async::<_, Vec<String>>(&mut conn)
                .await
        })
        .await
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        self.run("RPUSH", async move {
            ::redis::cmd("RPUSH")
                .arg(key)
                .arg(value)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        self.run("PUBLISH", async move {
            ::redis::cmd("PUBLISH")
                .arg(channel)
                .arg(message)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn sorted_set_score(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut conn = self.conn.clone();
        self.run("ZSCORE", async move {
            ::redis::cmd("ZSCORE")
                .arg(key)
                .arg(member)
                .query_async::<_, Option<f64>>(&mut conn)
                .await
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        self.run("DEL", async move {
            ::redis::cmd("DEL")
                .arg(key)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn set_add_and_push(
        &self,
        set_key: &str,
        member: &str,
        list_key: &str,
        value: &str,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        self.run("SADD/LPUSH", async move {
            ::redis::pipe()
                .atomic()
                .cmd("SADD")
                .arg(set_key)
                .arg(member)
                .ignore()
                .cmd("LPUSH")
                .arg(list_key)
                .arg(value)
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        self.run("HGETALL", async move {
            ::redis::cmd("HGETALL")
                .arg(key)
                .query_async::<_, HashMap<String, String>>(&mut conn)
                .await
        })
        .await
    }

    async fn hash_set_with_expiry(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        self.run("HSET", async move {
            ::redis::pipe()
                .atomic()
                .cmd("HSET")
                .arg(key)
                .arg(fields)
                .ignore()
                .cmd("PEXPIRE")
                .arg(key)
                .arg(ttl_millis(ttl))
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }
}
