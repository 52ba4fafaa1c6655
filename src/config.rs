//! Process configuration sourced from environment variables.
//!
//! Required settings are checked up front; a missing one aborts startup
//! with the full list of what is absent, so operators fix the `.env` in
//! one pass instead of one crash at a time.

use std::collections::HashMap;

/// Environment variables that must be present for the bot to start.
pub const REQUIRED_ENV_VARS: [&str; 4] =
    ["DISCORD_TOKEN", "MAIL_API_URL", "MAIL_API_KEY", "MAIL_FROM"];

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Discord bot token.
    pub discord_token: String,
    /// Mail relay endpoint the verification emails are posted to.
    pub mail_api_url: String,
    /// Bearer token for the mail relay.
    pub mail_api_key: String,
    /// From-address stamped on verification emails.
    pub mail_from: String,
    /// Directory holding the JSON store files.
    pub state_path: String,
    /// Port for the HTTP health endpoint.
    pub health_port: u16,
    /// Run against the in-memory store instead of the file store.
    pub memory_store: bool,
}

impl AppConfig {
    /// Load from the process environment. Returns the enumerated list of
    /// missing required variables on failure.
    pub fn from_env() -> Result<Self, Vec<&'static str>> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    fn from_vars(vars: &HashMap<String, String>) -> Result<Self, Vec<&'static str>> {
        let missing: Vec<&'static str> = REQUIRED_ENV_VARS
            .iter()
            .filter(|name| vars.get(**name).map(|v| v.is_empty()).unwrap_or(true))
            .copied()
            .collect();

        if !missing.is_empty() {
            return Err(missing);
        }

        let get = |name: &str| vars.get(name).cloned().unwrap_or_default();

        Ok(Self {
            discord_token: get("DISCORD_TOKEN"),
            mail_api_url: get("MAIL_API_URL"),
            mail_api_key: get("MAIL_API_KEY"),
            mail_from: get("MAIL_FROM"),
            state_path: vars
                .get("STATE_PATH")
                .cloned()
                .unwrap_or_else(|| "state".to_string()),
            health_port: vars
                .get("PORT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(3000),
            memory_store: vars.get("MEMORY_STORE").map(|v| v == "1").unwrap_or(false),
        })
    }
}
