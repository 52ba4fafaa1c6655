//! Persistence gateway for the two record types the bot keeps.
//!
//! The verification core only needs find/upsert/delete-by-filter over
//! [`VerificationRecord`] (with the store enforcing the 600 s TTL) and
//! find/upsert over [`GuildConfig`]. Everything behind this trait is
//! swappable: the file store is the production backend, the memory store
//! backs tests and `MEMORY_STORE=1` runs.

pub mod file;
pub mod memory;
pub mod records;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
pub use file::FileStore;
pub use memory::MemoryStore;
pub use records::{GuildConfig, VerificationRecord, RECORD_TTL_SECS};

/// Mongo-style filter over verification records; `None` fields match
/// everything.
#[derive(Debug, Clone, Default)]
pub struct VerificationFilter {
    pub user_id: Option<String>,
    pub guild_id: Option<String>,
    pub code: Option<String>,
    pub verified: Option<bool>,
}

impl VerificationFilter {
    pub fn user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn guild(mut self, guild_id: &str) -> Self {
        self.guild_id = Some(guild_id.to_string());
        self
    }

    pub fn code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }

    pub fn verified(mut self, verified: bool) -> Self {
        self.verified = Some(verified);
        self
    }

    pub fn matches(&self, record: &VerificationRecord) -> bool {
        self.user_id.as_deref().map_or(true, |v| v == record.user_id)
            && self
                .guild_id
                .as_deref()
                .map_or(true, |v| v == record.guild_id)
            && self.code.as_deref().map_or(true, |v| v == record.code)
            && self.verified.map_or(true, |v| v == record.verified)
    }
}

#[async_trait]
pub trait VerificationStore: Send + Sync {
    /// First live (non-expired) record matching the filter, or none.
    async fn find_verification(
        &self,
        filter: VerificationFilter,
    ) -> Result<Option<VerificationRecord>>;

    /// Insert, or replace the record with the same (user, guild, code).
    async fn upsert_verification(&self, record: VerificationRecord) -> Result<()>;

    /// Delete every record matching the filter; returns how many went.
    async fn delete_verifications(&self, filter: VerificationFilter) -> Result<u64>;

    async fn find_guild_config(&self, guild_id: &str) -> Result<Option<GuildConfig>>;

    async fn upsert_guild_config(&self, config: GuildConfig) -> Result<()>;
}

/// Shared store handle.
pub type SharedStore = Arc<dyn VerificationStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matches_on_all_set_fields() {
        let record = VerificationRecord::new("10", "20", "a@csi.edu", "000042");

        assert!(VerificationFilter::default().matches(&record));
        assert!(VerificationFilter::default()
            .user("10")
            .code("000042")
            .verified(false)
            .matches(&record));
        assert!(!VerificationFilter::default().user("11").matches(&record));
        assert!(!VerificationFilter::default()
            .user("10")
            .verified(true)
            .matches(&record));
    }
}
