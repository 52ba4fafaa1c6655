//! Admin commands mutating the per-guild verification settings.
//! Each one is an upsert against the guild config record; the config is
//! created on first use and never deleted.

use poise::serenity_prelude::GuildId;
use tracing::info;

use crate::store::GuildConfig;
use crate::{Context, Error};

/// Enable DMing new members a verification prompt when they join
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    default_member_permissions = "ADMINISTRATOR"
)]
pub async fn enableonjoin(ctx: Context<'_>) -> Result<(), Error> {
    set_onjoin(ctx, true).await
}

/// Disable DMing new members a verification prompt when they join
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    default_member_permissions = "ADMINISTRATOR"
)]
pub async fn disableonjoin(ctx: Context<'_>) -> Result<(), Error> {
    set_onjoin(ctx, false).await
}

/// Add an email domain to the allowlist
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    default_member_permissions = "ADMINISTRATOR"
)]
pub async fn domainadd(
    ctx: Context<'_>,
    #[description = "Email domain to allow, e.g. csi.edu"] domain: Option<String>,
) -> Result<(), Error> {
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    let Some(domain) = domain.filter(|d| !d.is_empty()) else {
        ctx.say("Please provide a domain to add.").await?;
        return Ok(());
    };

    let mut config = load_or_new(&ctx, guild_id).await?;
    config.add_domain(&domain);
    ctx.data().store.upsert_guild_config(config).await?;

    info!("Domain '{}' added to guild {}", domain, guild_id);
    ctx.say(format!("Domain {domain} has been added.")).await?;
    Ok(())
}

/// Remove an email domain from the allowlist
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    default_member_permissions = "ADMINISTRATOR"
)]
pub async fn domainremove(
    ctx: Context<'_>,
    #[description = "Email domain to remove"] domain: Option<String>,
) -> Result<(), Error> {
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    let Some(domain) = domain.filter(|d| !d.is_empty()) else {
        ctx.say("Please provide a domain to remove.").await?;
        return Ok(());
    };

    // No upsert here: removing from an unconfigured guild is a no-op.
    if let Some(mut config) = ctx
        .data()
        .store
        .find_guild_config(&guild_id.to_string())
        .await?
    {
        config.remove_domain(&domain);
        ctx.data().store.upsert_guild_config(config).await?;
    }

    info!("Domain '{}' removed from guild {}", domain, guild_id);
    ctx.say(format!("Domain {domain} has been removed.")).await?;
    Ok(())
}

/// Change the name of the role granted on verification
#[poise::command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR",
    default_member_permissions = "ADMINISTRATOR"
)]
pub async fn rolechange(
    ctx: Context<'_>,
    #[description = "Name of the new verified role"] role: Option<String>,
) -> Result<(), Error> {
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    let Some(role) = role.filter(|r| !r.is_empty()) else {
        ctx.say("Please provide the name of the new verified role.")
            .await?;
        return Ok(());
    };

    let mut config = load_or_new(&ctx, guild_id).await?;
    config.role = role.clone();
    ctx.data().store.upsert_guild_config(config).await?;

    info!("Verified role for guild {} changed to '{}'", guild_id, role);
    ctx.say(format!("Verified role has been changed to {role}."))
        .await?;
    Ok(())
}

async fn set_onjoin(ctx: Context<'_>, enabled: bool) -> Result<(), Error> {
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };

    let mut config = load_or_new(&ctx, guild_id).await?;
    config.onjoin = enabled;
    ctx.data().store.upsert_guild_config(config).await?;

    info!("onjoin set to {} for guild {}", enabled, guild_id);
    let state = if enabled { "enabled" } else { "disabled" };
    ctx.say(format!("Verification on join has been {state}."))
        .await?;
    Ok(())
}

async fn load_or_new(ctx: &Context<'_>, guild_id: GuildId) -> Result<GuildConfig, Error> {
    Ok(ctx
        .data()
        .store
        .find_guild_config(&guild_id.to_string())
        .await?
        .unwrap_or_else(|| GuildConfig::new(&guild_id.to_string())))
}
