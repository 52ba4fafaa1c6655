//! JSON-file backend for the persistence gateway.
//!
//! One file per record type under the state directory, written
//! atomically (temp file + rename). The TTL contract is enforced here:
//! expired verification records are invisible to reads and purged on
//! every write.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{GuildConfig, VerificationFilter, VerificationRecord, VerificationStore};
use crate::error::{BotError, Result};

const VERIFICATIONS_FILE: &str = "verifications.json";
const GUILDS_FILE: &str = "guilds.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VerificationDatabase {
    /// Schema version for migrations
    version: u32,
    records: Vec<VerificationRecord>,
}

impl Default for VerificationDatabase {
    fn default() -> Self {
        Self {
            version: 1,
            records: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GuildDatabase {
    version: u32,
    /// Guild ID -> config
    guilds: HashMap<String, GuildConfig>,
}

impl Default for GuildDatabase {
    fn default() -> Self {
        Self {
            version: 1,
            guilds: HashMap::new(),
        }
    }
}

pub struct FileStore {
    verifications_path: String,
    guilds_path: String,
    verifications: RwLock<VerificationDatabase>,
    guilds: RwLock<GuildDatabase>,
}

impl FileStore {
    /// Load both databases from `state_path`, creating empty ones for
    /// files that do not exist yet.
    pub async fn load(state_path: &str) -> Result<Self> {
        tokio::fs::create_dir_all(state_path).await.ok();

        let verifications_path = format!("{state_path}/{VERIFICATIONS_FILE}");
        let guilds_path = format!("{state_path}/{GUILDS_FILE}");

        let mut verifications: VerificationDatabase = load_json(&verifications_path).await?;
        let guilds: GuildDatabase = load_json(&guilds_path).await?;

        let before = verifications.records.len();
        let now = Utc::now();
        verifications.records.retain(|r| !r.is_expired(now));
        if verifications.records.len() < before {
            info!(
                "Dropped {} expired verification record(s) on load",
                before - verifications.records.len()
            );
        }

        Ok(Self {
            verifications_path,
            guilds_path,
            verifications: RwLock::new(verifications),
            guilds: RwLock::new(guilds),
        })
    }

    async fn save_verifications(&self, db: &VerificationDatabase) -> Result<()> {
        save_json(&self.verifications_path, db).await
    }

    async fn save_guilds(&self, db: &GuildDatabase) -> Result<()> {
        save_json(&self.guilds_path, db).await
    }
}

#[async_trait]
impl VerificationStore for FileStore {
    async fn find_verification(
        &self,
        filter: VerificationFilter,
    ) -> Result<Option<VerificationRecord>> {
        let now = Utc::now();
        let db = self.verifications.read().await;
        Ok(db
            .records
            .iter()
            .find(|r| !r.is_expired(now) && filter.matches(r))
            .cloned())
    }

    async fn upsert_verification(&self, record: VerificationRecord) -> Result<()> {
        let now = Utc::now();
        let mut db = self.verifications.write().await;
        db.records.retain(|r| !r.is_expired(now));

        match db.records.iter_mut().find(|r| {
            r.user_id == record.user_id && r.guild_id == record.guild_id && r.code == record.code
        }) {
            Some(existing) => *existing = record,
            None => db.records.push(record),
        }

        self.save_verifications(&db).await
    }

    async fn delete_verifications(&self, filter: VerificationFilter) -> Result<u64> {
        let now = Utc::now();
        let mut db = self.verifications.write().await;

        let before = db.records.len();
        db.records.retain(|r| !r.is_expired(now) && !filter.matches(r));
        let removed = (before - db.records.len()) as u64;

        if removed > 0 {
            debug!("Deleted {} verification record(s)", removed);
            self.save_verifications(&db).await?;
        }
        Ok(removed)
    }

    async fn find_guild_config(&self, guild_id: &str) -> Result<Option<GuildConfig>> {
        let db = self.guilds.read().await;
        Ok(db.guilds.get(guild_id).cloned())
    }

    async fn upsert_guild_config(&self, config: GuildConfig) -> Result<()> {
        let mut db = self.guilds.write().await;
        db.guilds.insert(config.guild_id.clone(), config);
        self.save_guilds(&db).await
    }
}

async fn load_json<T>(path: &str) -> Result<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    match tokio::fs::read_to_string(path).await {
        Ok(content) => serde_json::from_str(&content).map_err(|e| BotError::StateParse {
            path: path.to_string(),
            source: e,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(BotError::StateLoad {
            path: path.to_string(),
            source: e,
        }),
    }
}

/// Write to a temp file first, then rename for atomicity.
async fn save_json<T: Serialize>(path: &str, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;

    let temp_path = format!("{path}.tmp");
    tokio::fs::write(&temp_path, &content)
        .await
        .map_err(|e| BotError::StateSave {
            path: path.to_string(),
            source: e,
        })?;

    tokio::fs::rename(&temp_path, path)
        .await
        .map_err(|e| BotError::StateSave {
            path: path.to_string(),
            source: e,
        })?;

    Ok(())
}
