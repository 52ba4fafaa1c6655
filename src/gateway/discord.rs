//! serenity-backed implementation of the chat gateway.

use std::sync::Arc;

use async_trait::async_trait;
use poise::serenity_prelude::{
    self as serenity, Colour, GuildId, Http, PartialGuild, Permissions, UserId,
};
use tracing::{error, info};

use super::{BotCapabilities, ChatGateway, RoleHierarchyReport, RoleStanding};
use crate::error::{BotError, Result};

/// Color given to an auto-created verified role.
const CREATED_ROLE_COLOUR: Colour = Colour::new(0x00FF00);

pub struct DiscordGateway {
    http: Arc<Http>,
}

impl DiscordGateway {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }

    async fn fetch_guild(&self, guild_id: GuildId) -> Result<PartialGuild> {
        guild_id
            .to_partial_guild(self.http.as_ref())
            .await
            .map_err(|_| BotError::GuildNotFound {
                id: guild_id.to_string(),
            })
    }

    /// Name and position of the bot's highest role. Falls back to
    /// @everyone (position 0) when the bot holds no role at all.
    async fn bot_highest_role(&self, guild: &PartialGuild) -> Result<(String, u16)> {
        let bot_user = self.http.get_current_user().await?;
        let bot_member = guild.member(self.http.as_ref(), bot_user.id).await?;

        let mut highest: Option<(String, u16)> = None;
        for role_id in &bot_member.roles {
            if let Some(role) = guild.roles.get(role_id) {
                if highest.as_ref().map_or(true, |(_, p)| role.position > *p) {
                    highest = Some((role.name.clone(), role.position));
                }
            }
        }
        Ok(highest.unwrap_or_else(|| ("@everyone".to_string(), 0)))
    }
}

#[async_trait]
impl ChatGateway for DiscordGateway {
    async fn send_direct_message(&self, user_id: UserId, text: &str) -> Result<()> {
        let channel = user_id
            .create_dm_channel(self.http.as_ref())
            .await
            .map_err(|_| BotError::DmUnreachable {
                user_id: user_id.to_string(),
            })?;

        channel
            .send_message(
                self.http.as_ref(),
                serenity::CreateMessage::new().content(text),
            )
            .await
            .map_err(|_| BotError::DmUnreachable {
                user_id: user_id.to_string(),
            })?;

        Ok(())
    }

    async fn assign_role(&self, user_id: UserId, guild_id: GuildId, role_name: &str) -> Result<()> {
        let guild = self.fetch_guild(guild_id).await?;

        let member = guild
            .member(self.http.as_ref(), user_id)
            .await
            .map_err(|e| BotError::RoleAssignmentFailed {
                role: role_name.to_string(),
                guild_id: guild_id.to_string(),
                reason: format!("member {user_id} not found: {e}"),
            })?;

        // Case-insensitive lookup; create the role if the guild lacks it.
        let role = match guild
            .roles
            .values()
            .find(|r| r.name.eq_ignore_ascii_case(role_name))
            .cloned()
        {
            Some(role) => role,
            None => {
                info!("Creating missing role: {}", role_name);
                guild_id
                    .create_role(
                        self.http.as_ref(),
                        serenity::EditRole::new()
                            .name(role_name)
                            .colour(CREATED_ROLE_COLOUR)
                            .permissions(Permissions::empty())
                            .audit_log_reason("Auto-created verified role"),
                    )
                    .await
                    .map_err(|e| BotError::RoleCreationFailed {
                        role: role_name.to_string(),
                        guild_id: guild_id.to_string(),
                        reason: e.to_string(),
                    })?
            }
        };

        // Idempotent: re-granting a held role is a success, not a side effect.
        if member.roles.contains(&role.id) {
            info!("User {} already has role {}", user_id, role.name);
            return Ok(());
        }

        let (bot_role, bot_position) = self.bot_highest_role(&guild).await?;
        if role.position >= bot_position {
            error!(
                "Cannot assign role '{}' (position {}) - bot's highest role is '{}' (position {})",
                role.name, role.position, bot_role, bot_position
            );
            return Err(BotError::RoleAssignmentFailed {
                role: role_name.to_string(),
                guild_id: guild_id.to_string(),
                reason: format!(
                    "role position {} is not below the bot's highest role position {}",
                    role.position, bot_position
                ),
            });
        }

        let bot_user = self.http.get_current_user().await?;
        let bot_member = guild.member(self.http.as_ref(), bot_user.id).await?;
        #[allow(deprecated)]
        let bot_permissions = guild.member_permissions(&bot_member);
        if !bot_permissions.contains(Permissions::MANAGE_ROLES) {
            return Err(BotError::RoleAssignmentFailed {
                role: role_name.to_string(),
                guild_id: guild_id.to_string(),
                reason: "bot is missing the Manage Roles permission".to_string(),
            });
        }

        member
            .add_role(self.http.as_ref(), role.id)
            .await
            .map_err(|e| BotError::RoleAssignmentFailed {
                role: role_name.to_string(),
                guild_id: guild_id.to_string(),
                reason: e.to_string(),
            })?;

        info!("Assigned role '{}' to user {}", role.name, user_id);
        Ok(())
    }

    async fn capabilities(&self, guild_id: GuildId) -> Result<BotCapabilities> {
        let guild = self.fetch_guild(guild_id).await?;

        let bot_user = self.http.get_current_user().await?;
        let bot_member = guild.member(self.http.as_ref(), bot_user.id).await?;
        #[allow(deprecated)]
        let permissions = guild.member_permissions(&bot_member);

        Ok(BotCapabilities {
            manage_roles: permissions.contains(Permissions::MANAGE_ROLES),
            view_channel: permissions.contains(Permissions::VIEW_CHANNEL),
        })
    }

    async fn role_hierarchy_report(&self, guild_id: GuildId) -> Result<RoleHierarchyReport> {
        let guild = self.fetch_guild(guild_id).await?;
        let (bot_role, bot_position) = self.bot_highest_role(&guild).await?;

        let mut roles: Vec<RoleStanding> = guild
            .roles
            .values()
            .map(|role| RoleStanding {
                name: role.name.clone(),
                position: role.position,
                is_bot_role: role.name == bot_role && role.position == bot_position,
                manageable: role.position < bot_position,
            })
            .collect();
        roles.sort_by(|a, b| b.position.cmp(&a.position));

        Ok(RoleHierarchyReport {
            guild_id,
            bot_role,
            bot_position,
            roles,
        })
    }
}
