use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Store-enforced lifetime of a verification record, verified or not.
/// Mirrors the TTL index the production document store applies.
pub const RECORD_TTL_SECS: i64 = 600;

/// A single email-verification attempt, persisted for the OTP lookup.
///
/// Multiple records may exist historically for a user, but at most one
/// *unverified* record per (user, guild) pair is live at a time; callers
/// delete the old ones before inserting a replacement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationRecord {
    /// Discord user ID (snowflake as string).
    pub user_id: String,

    /// Guild the verification was started from.
    pub guild_id: String,

    /// Email address the code was sent to.
    pub email: String,

    /// The one-time code, fixed-width six digits.
    pub code: String,

    /// Whether the code was successfully submitted back.
    #[serde(default)]
    pub verified: bool,

    /// Creation instant; the TTL window counts from here.
    pub created_at: DateTime<Utc>,
}

impl VerificationRecord {
    pub fn new(user_id: &str, guild_id: &str, email: &str, code: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            guild_id: guild_id.to_string(),
            email: email.to_string(),
            code: code.to_string(),
            verified: false,
            created_at: Utc::now(),
        }
    }

    /// Whether the store TTL has elapsed for this record.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.created_at + Duration::seconds(RECORD_TTL_SECS) <= now
    }
}

/// Per-guild verification settings, upserted by admin commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuildConfig {
    /// Guild ID (snowflake as string), unique per record.
    pub guild_id: String,

    /// Email domains members may verify with.
    #[serde(default)]
    pub domains: Vec<String>,

    /// DM new members a verification prompt when they join.
    #[serde(default)]
    pub onjoin: bool,

    /// Name of the role granted on successful verification.
    #[serde(default = "default_role")]
    pub role: String,
}

impl GuildConfig {
    pub fn new(guild_id: &str) -> Self {
        Self {
            guild_id: guild_id.to_string(),
            domains: Vec::new(),
            onjoin: false,
            role: default_role(),
        }
    }

    /// Set-semantics add; duplicates are ignored.
    pub fn add_domain(&mut self, domain: &str) {
        if !self.domains.iter().any(|d| d == domain) {
            self.domains.push(domain.to_string());
        }
    }

    pub fn remove_domain(&mut self, domain: &str) {
        self.domains.retain(|d| d != domain);
    }
}

fn default_role() -> String {
    "Verified".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_expires_exactly_at_ttl() {
        let record = VerificationRecord::new("1", "2", "a@csi.edu", "000042");
        let now = record.created_at;

        assert!(!record.is_expired(now));
        assert!(!record.is_expired(now + Duration::seconds(RECORD_TTL_SECS - 1)));
        assert!(record.is_expired(now + Duration::seconds(RECORD_TTL_SECS)));
    }

    #[test]
    fn guild_config_defaults() {
        let config = GuildConfig::new("42");
        assert!(config.domains.is_empty());
        assert!(!config.onjoin);
        assert_eq!(config.role, "Verified");
    }

    #[test]
    fn add_domain_is_set_semantics() {
        let mut config = GuildConfig::new("42");
        config.add_domain("csi.edu");
        config.add_domain("csi.edu");
        config.add_domain("sakec.ac.in");
        assert_eq!(config.domains, vec!["csi.edu", "sakec.ac.in"]);

        config.remove_domain("csi.edu");
        assert_eq!(config.domains, vec!["sakec.ac.in"]);
    }

    #[test]
    fn guild_config_parses_with_missing_fields() {
        let config: GuildConfig = serde_json::from_str(r#"{"guild_id":"42"}"#).unwrap();
        assert_eq!(config.role, "Verified");
        assert!(!config.onjoin);
    }
}
