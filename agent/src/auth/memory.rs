//! Process-local token store.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::TokenStore;

#[derive(Debug, Clone)]
struct TokenRecord {
    token: String,
    issued_at: DateTime<Utc>,
}

/// Process-local token store. Tokens expire after `ttl` when one is set.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    ttl: Option<Duration>,
    records: RwLock<HashMap<String, TokenRecord>>,
}

impl MemoryTokenStore {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            records: RwLock::new(HashMap::new()),
        }
    }

    fn is_live(&self, record: &TokenRecord, now: DateTime<Utc>) -> bool {
        let Some(ttl) = self.ttl else {
            return true;
        };
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now < record.issued_at + ttl,
            Err(_) => true,
        }
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn set(&self, run_id: &str, token: &str) -> Result<()> {
        let record = TokenRecord {
            token: token.to_string(),
            issued_at: Utc::now(),
        };
        self.records.write().await.insert(run_id.to_string(), record);
        Ok(())
    }

    async fn get(&self, run_id: &str) -> Result<Option<String>> {
        let now = Utc::now();
        let records = self.records.read().await;
        Ok(records
            .get(run_id)
            .filter(|record| self.is_live(record, now))
            .map(|record| record.token.clone()))
    }

    async fn delete(&self, run_id: &str) -> Result<()> {
        self.records.write().await.remove(run_id);
        Ok(())
    }
}
