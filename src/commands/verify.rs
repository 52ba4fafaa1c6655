use tracing::info;

use crate::error::BotError;
use crate::{Context, Error};

/// Verify your email address to get access to the server
#[poise::command(prefix_command, slash_command, guild_only)]
pub async fn verify(ctx: Context<'_>) -> Result<(), Error> {
    let user_id = ctx.author().id;
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };

    match ctx
        .data()
        .session_manager
        .begin_verification(user_id, guild_id)
        .await
    {
        Ok(()) => {
            info!("Started verification DM flow for {}", ctx.author().name);
            ctx.send(
                poise::CreateReply::default()
                    .content("**Verification started.** I've sent you a DM with instructions.")
                    .ephemeral(true),
            )
            .await?;
        }
        Err(BotError::DmUnreachable { .. }) => {
            // The one failure we cannot report over DM.
            ctx.reply("I could not send you a DM. Please check your privacy settings.")
                .await?;
        }
        Err(e) => {
            // The session manager already DMed the reason.
            info!("Verification for {} not started: {}", ctx.author().name, e);
            ctx.send(
                poise::CreateReply::default()
                    .content("Check your DMs for details.")
                    .ephemeral(true),
            )
            .await?;
        }
    }

    Ok(())
}
