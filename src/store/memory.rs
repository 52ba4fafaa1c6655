//! In-memory persistence gateway, same TTL semantics as the file store.
//! Backs unit tests and `MEMORY_STORE=1` development runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{GuildConfig, VerificationFilter, VerificationRecord, VerificationStore};
use crate::error::Result;

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<VerificationRecord>>,
    guilds: Mutex<HashMap<String, GuildConfig>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count of live records, expired ones included until a write purges
    /// them. Test helper.
    pub async fn record_count(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[async_trait]
impl VerificationStore for MemoryStore {
    async fn find_verification(
        &self,
        filter: VerificationFilter,
    ) -> Result<Option<VerificationRecord>> {
        let now = Utc::now();
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .find(|r| !r.is_expired(now) && filter.matches(r))
            .cloned())
    }

    async fn upsert_verification(&self, record: VerificationRecord) -> Result<()> {
        let now = Utc::now();
        let mut records = self.records.lock().await;
        records.retain(|r| !r.is_expired(now));

        match records.iter_mut().find(|r| {
            r.user_id == record.user_id && r.guild_id == record.guild_id && r.code == record.code
        }) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        Ok(())
    }

    async fn delete_verifications(&self, filter: VerificationFilter) -> Result<u64> {
        let now = Utc::now();
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|r| !r.is_expired(now) && !filter.matches(r));
        Ok((before - records.len()) as u64)
    }

    async fn find_guild_config(&self, guild_id: &str) -> Result<Option<GuildConfig>> {
        Ok(self.guilds.lock().await.get(guild_id).cloned())
    }

    async fn upsert_guild_config(&self, config: GuildConfig) -> Result<()> {
        self.guilds
            .lock()
            .await
            .insert(config.guild_id.clone(), config);
        Ok(())
    }
}
