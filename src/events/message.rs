use poise::serenity_prelude as serenity;
use tracing::{debug, info};

use crate::{Data, Error};

/// Handle incoming messages
pub async fn handle_message(
    _ctx: &serenity::Context,
    msg: &serenity::Message,
    data: &Data,
) -> Result<(), Error> {
    // Ignore bot messages
    if msg.author.bot {
        return Ok(());
    }

    // DMs are the reply channel of the verification flow.
    if msg.guild_id.is_none() {
        debug!("Processing DM from: {}", msg.author.name);
        if let Err(e) = data
            .session_manager
            .handle_direct_message(msg.author.id, &msg.content)
            .await
        {
            // Terminal flow errors were already reported to the user.
            info!("Verification DM from {} ended with: {}", msg.author.name, e);
        }
    }

    Ok(())
}
