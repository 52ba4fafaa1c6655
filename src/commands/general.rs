use tracing::info;

use crate::{Context, Error};

/// Check if the bot is running
#[poise::command(prefix_command, slash_command)]
pub async fn ping(ctx: Context<'_>) -> Result<(), Error> {
    info!("Ping command called by {}", ctx.author().name);
    ctx.send(
        poise::CreateReply::default()
            .content("Pong! Bot is working!")
            .ephemeral(true),
    )
    .await?;
    Ok(())
}

/// Show verification status and available commands for this server
#[poise::command(prefix_command, slash_command, guild_only)]
pub async fn vstatus(ctx: Context<'_>) -> Result<(), Error> {
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };

    let config = ctx
        .data()
        .store
        .find_guild_config(&guild_id.to_string())
        .await?;

    let domains = config
        .as_ref()
        .filter(|c| !c.domains.is_empty())
        .map(|c| c.domains.join(", "))
        .unwrap_or_else(|| "None".to_string());
    let onjoin = config.as_ref().map(|c| c.onjoin).unwrap_or(false);
    let role = config
        .as_ref()
        .map(|c| c.role.clone())
        .unwrap_or_else(|| "Verified".to_string());

    let ping = ctx.ping().await;

    ctx.say(format!(
        "```\
        \nPing: {}ms\
        \nUser commands:\
        \n   .verify -> Sends a DM to the user to verify their email\
        \n   .vstatus -> This help message\
        \n\
        \nAdmin commands:\
        \n - A domain must be added before users can be verified.\
        \n - Use .rolechange instead of server settings to change the name of the verified role.\
        \n   .enableonjoin -> Enables verifying users on join\
        \n   .disableonjoin -> Disables verifying users on join\
        \n   .domainadd domain -> Adds an email domain\
        \n   .domainremove domain -> Removes an email domain\
        \n   .rolechange role -> Changes the name of the verified role\
        \n\
        \nDomains: {}\
        \nVerify when a user joins? (default=False): {}\
        \nVerified role (default=Verified): {}```",
        ping.as_millis(),
        domains,
        onjoin,
        role
    ))
    .await?;

    Ok(())
}
