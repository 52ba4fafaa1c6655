use poise::serenity_prelude as serenity;
use tracing::{error, info, warn};

use crate::gateway::log_role_hierarchy_report;
use crate::{Data, Error};

/// Handle when the bot joins a new guild or starts up
pub async fn handle_guild_create(
    _ctx: &serenity::Context,
    guild: &serenity::Guild,
    data: &Data,
) -> Result<(), Error> {
    info!("Processing guild: {} ({})", guild.name, guild.id);

    match data.gateway.capabilities(guild.id).await {
        Ok(caps) if caps.allows_verification() => {
            info!("Guild {}: verification capabilities OK", guild.id);
        }
        Ok(_) => {
            warn!(
                "Guild {}: bot is missing Manage Roles and/or View Channels - verification will be refused",
                guild.id
            );
            if let Ok(report) = data.gateway.role_hierarchy_report(guild.id).await {
                log_role_hierarchy_report(&report);
            }
        }
        Err(e) => {
            warn!("Guild {}: capability check failed: {}", guild.id, e);
        }
    }

    Ok(())
}

/// Handle when a new member joins the guild
pub async fn handle_member_add(
    ctx: &serenity::Context,
    new_member: &serenity::Member,
    data: &Data,
) -> Result<(), Error> {
    let guild_id = new_member.guild_id;

    info!(
        "New member joined: {} in guild {}",
        new_member.user.name, guild_id
    );

    let config = data
        .store
        .find_guild_config(&guild_id.to_string())
        .await?;
    if !config.map(|c| c.onjoin).unwrap_or(false) {
        return Ok(());
    }

    match new_member.user.create_dm_channel(&ctx.http).await {
        Ok(dm_channel) => {
            if let Err(e) = dm_channel
                .send_message(
                    &ctx.http,
                    serenity::CreateMessage::new().content(
                        "Welcome! Please verify your email address by using the `.verify` \
                         command in the server.",
                    ),
                )
                .await
            {
                error!("Could not send DM to {}: {}", new_member.user.name, e);
            }
        }
        Err(e) => {
            error!("Could not send DM to {}: {}", new_member.user.name, e);
        }
    }

    Ok(())
}
