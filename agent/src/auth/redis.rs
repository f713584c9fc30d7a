//! Redis-backed token store.

use std::time::Duration;

use ::redis::AsyncCommands;
use ::redis::aio::ConnectionManager;
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::TokenStore;

/// Lifetime of Redis-held tokens when none is configured.
pub const DEFAULT_REDIS_TTL: Duration = Duration::from_secs(5 * 60 * 60);

const KEY_PREFIX: &str = "run-agent:token:";

/// Token store shared across agent replicas. Expiry is delegated to Redis.
#[derive(Clone)]
pub struct RedisTokenStore {
    conn: ConnectionManager,
    ttl: Duration,
}

impl RedisTokenStore {
    pub async fn connect(url: &str, ttl: Option<Duration>) -> Result<Self> {
        let client = ::redis::Client::open(url).with_context(|| format!("parse redis url {url}"))?;
        let conn = ConnectionManager::new(client)
            .await
            .context("connect to redis")?;
        let ttl = ttl.unwrap_or(DEFAULT_REDIS_TTL);
        info!(ttl_secs = ttl.as_secs(), "redis token store connected");
        Ok(Self { conn, ttl })
    }
}

fn token_key(run_id: &str) -> String {
    format!("{KEY_PREFIX}{run_id}")
}

#[async_trait]
impl TokenStore for RedisTokenStore {
    async fn set(&self, run_id: &str, token: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(token_key(run_id), token, self.ttl.as_secs().max(1))
            .await
            .context("redis SET EX")
    }

    async fn get(&self, run_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get::<_, Option<String>>(token_key(run_id))
            .await
            .context("redis GET")
    }

    async fn delete(&self, run_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(token_key(run_id))
            .await
            .context("redis DEL")
    }
}
