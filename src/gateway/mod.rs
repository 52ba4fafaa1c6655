//! Chat platform adapter: the capability surface the verification core
//! needs from Discord, behind a trait so the core can be exercised
//! without a gateway connection.

pub mod discord;

use std::sync::Arc;

use async_trait::async_trait;
use poise::serenity_prelude::{GuildId, UserId};
use tracing::{error, info, warn};

use crate::error::Result;
pub use discord::DiscordGateway;

/// Typed result of the bot permission query, checked once at preflight.
#[derive(Debug, Clone, Copy)]
pub struct BotCapabilities {
    pub manage_roles: bool,
    pub view_channel: bool,
}

impl BotCapabilities {
    /// Both capabilities are required before a verification may start.
    pub fn allows_verification(&self) -> bool {
        self.manage_roles && self.view_channel
    }
}

/// One role's standing relative to the bot, for operator diagnostics.
#[derive(Debug, Clone)]
pub struct RoleStanding {
    pub name: String,
    pub position: u16,
    pub is_bot_role: bool,
    pub manageable: bool,
}

/// Snapshot of a guild's role hierarchy as seen by the bot.
#[derive(Debug, Clone)]
pub struct RoleHierarchyReport {
    pub guild_id: GuildId,
    pub bot_role: String,
    pub bot_position: u16,
    /// All guild roles, highest position first.
    pub roles: Vec<RoleStanding>,
}

#[async_trait]
pub trait ChatGateway: Send + Sync {
    /// DM `text` to the user. Failure usually means closed DMs.
    async fn send_direct_message(&self, user_id: UserId, text: &str) -> Result<()>;

    /// Grant `role_name` to the member: case-insensitive lookup, created
    /// with defaults if missing, no-op success if already held.
    async fn assign_role(&self, user_id: UserId, guild_id: GuildId, role_name: &str) -> Result<()>;

    async fn capabilities(&self, guild_id: GuildId) -> Result<BotCapabilities>;

    async fn role_hierarchy_report(&self, guild_id: GuildId) -> Result<RoleHierarchyReport>;
}

/// Shared gateway handle.
pub type SharedGateway = Arc<dyn ChatGateway>;

/// Log a hierarchy snapshot for operator troubleshooting. End users never
/// see this; they get the generic failure DM.
pub fn log_role_hierarchy_report(report: &RoleHierarchyReport) {
    info!("========================================");
    info!("       ROLE HIERARCHY REPORT");
    info!("========================================");
    info!("Guild: {}", report.guild_id);
    info!(
        "Bot's highest role: '{}' (position {})",
        report.bot_role, report.bot_position
    );
    info!("");

    for role in &report.roles {
        let marker = if role.is_bot_role {
            "[BOT] "
        } else if role.manageable {
            "[OK]  "
        } else {
            "[HIGH]"
        };

        if role.manageable || role.is_bot_role {
            info!("  {} '{}' (position {})", marker, role.name, role.position);
        } else {
            warn!(
                "  {} '{}' (position {}) - at or above the bot, cannot be assigned",
                marker, role.name, role.position
            );
        }
    }

    if report.roles.iter().any(|r| !r.manageable && !r.is_bot_role) {
        error!("Fix: Discord Server Settings > Roles > drag the bot's role higher");
    }
    info!("========================================");
}
