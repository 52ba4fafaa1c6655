use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use poise::serenity_prelude as serenity;
use tracing::{error, info, warn};

/// Discord bot gating server access behind institutional email verification
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Force re-sync of slash commands to all guilds (use when commands aren't showing up)
    #[arg(long, short = 's')]
    sync_commands: bool,

    /// Register commands per-guild instead of globally (faster for testing)
    #[arg(long)]
    guild_commands: bool,

    /// Specific guild ID to sync commands to (for testing)
    #[arg(long)]
    guild_id: Option<u64>,
}

mod commands;
mod config;
mod error;
mod events;
mod gateway;
mod mail;
mod managers;
mod store;
mod web;

use commands::{
    disableonjoin, domainadd, domainremove, enableonjoin, ping, rolechange, verify, vstatus,
};
use config::AppConfig;
use events::{handle_guild_create, handle_member_add, handle_message};
use gateway::{log_role_hierarchy_report, DiscordGateway, SharedGateway};
use mail::{HttpMailSender, MailSender};
use managers::SessionManager;
use store::{FileStore, MemoryStore, SharedStore};

type Error = Box<dyn std::error::Error + Send + Sync>;
type Context<'a> = poise::Context<'a, Data, Error>;

/// Shared application state
pub struct Data {
    pub session_manager: SessionManager,
    pub store: SharedStore,
    pub gateway: SharedGateway,
}

async fn event_handler(
    ctx: &serenity::Context,
    event: &serenity::FullEvent,
    _framework: poise::FrameworkContext<'_, Data, Error>,
    data: &Data,
) -> Result<(), Error> {
    match event {
        serenity::FullEvent::Message { new_message } => {
            if let Err(e) = handle_message(ctx, new_message, data).await {
                error!("Failed to handle message: {}", e);
            }
        }
        serenity::FullEvent::GuildMemberAddition { new_member } => {
            if let Err(e) = handle_member_add(ctx, new_member, data).await {
                error!("Failed to handle new member: {}", e);
            }
        }
        serenity::FullEvent::GuildCreate { guild, .. } => {
            if let Err(e) = handle_guild_create(ctx, guild, data).await {
                error!("Failed to handle guild create: {}", e);
            }
        }
        _ => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true),
        )
        .with(tracing_subscriber::filter::LevelFilter::INFO)
        .init();

    let app_config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(missing) => {
            error!("Missing environment variables:");
            for name in &missing {
                error!("   - {}", name);
            }
            error!("Please create a .env file with these variables");
            std::process::exit(1);
        }
    };

    // Extract bot/application ID from token (first part before the dot, base64 encoded)
    if let Some(bot_id_b64) = app_config.discord_token.split('.').next() {
        use base64::Engine;
        // Discord tokens use base64 without padding, sometimes URL-safe
        let decoded = base64::engine::general_purpose::STANDARD_NO_PAD
            .decode(bot_id_b64)
            .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(bot_id_b64));
        if let Ok(bytes) = decoded {
            if let Ok(id) = String::from_utf8(bytes) {
                info!(
                    "Bot ID: {} (configure intents at https://discord.com/developers/applications/{}/bot)",
                    id, id
                );
            }
        }
    }

    let store: SharedStore = if app_config.memory_store {
        warn!("MEMORY_STORE=1: verification records will not survive a restart");
        Arc::new(MemoryStore::new())
    } else {
        info!("Loading store from {}...", app_config.state_path);
        Arc::new(FileStore::load(&app_config.state_path).await?)
    };

    let mail: Arc<dyn MailSender> = Arc::new(HttpMailSender::new(
        &app_config.mail_api_url,
        &app_config.mail_api_key,
        &app_config.mail_from,
    )?);

    let health_port = app_config.health_port;
    tokio::spawn(async move {
        if let Err(e) = web::start_health_server(health_port).await {
            error!("Health server error: {}", e);
        }
    });

    // Extract CLI flags for use in setup
    let sync_commands = args.sync_commands;
    let guild_commands = args.guild_commands;
    let target_guild_id = args.guild_id;

    if sync_commands {
        info!("--sync-commands: Will force re-register slash commands");
    }
    if guild_commands {
        info!("--guild-commands: Will register commands per-guild (faster for testing)");
    } else {
        info!("Registering commands globally by default (takes up to 1 hour to propagate)");
    }
    if let Some(gid) = target_guild_id {
        info!("--guild-id: Targeting specific guild {}", gid);
    }

    let token = app_config.discord_token.clone();

    // Build framework
    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![
                ping(),
                verify(),
                vstatus(),
                enableonjoin(),
                disableonjoin(),
                domainadd(),
                domainremove(),
                rolechange(),
            ],
            prefix_options: poise::PrefixFrameworkOptions {
                prefix: Some(".".to_string()),
                ..Default::default()
            },
            event_handler: |ctx, event, framework, data| {
                Box::pin(event_handler(ctx, event, framework, data))
            },
            pre_command: |ctx| {
                Box::pin(async move {
                    info!(
                        "Command '{}' invoked by {} (ID: {}) in {}",
                        ctx.command().qualified_name,
                        ctx.author().name,
                        ctx.author().id,
                        ctx.guild_id()
                            .map(|g| g.to_string())
                            .unwrap_or_else(|| "DM".to_string())
                    );
                })
            },
            on_error: |error| {
                Box::pin(async move {
                    match error {
                        poise::FrameworkError::Command { error, ctx, .. } => {
                            error!(
                                "Error in command '{}': {}",
                                ctx.command().qualified_name,
                                error
                            );
                            let _ = ctx.say("An error occurred. Please try again.").await;
                        }
                        poise::FrameworkError::MissingBotPermissions {
                            missing_permissions,
                            ctx,
                            ..
                        } => {
                            error!(
                                "Bot missing permissions for '{}': {:?}",
                                ctx.command().qualified_name,
                                missing_permissions
                            );
                            let _ = ctx
                                .say(format!(
                                    "Bot is missing permissions: {:?}",
                                    missing_permissions
                                ))
                                .await;
                        }
                        poise::FrameworkError::MissingUserPermissions { ctx, .. } => {
                            error!(
                                "User {} lacks permissions for '{}'",
                                ctx.author().name,
                                ctx.command().qualified_name
                            );
                        }
                        poise::FrameworkError::GuildOnly { ctx, .. } => {
                            error!(
                                "Command '{}' is guild-only, used in DM by {}",
                                ctx.command().qualified_name,
                                ctx.author().name
                            );
                        }
                        other => {
                            error!("Other framework error: {}", other);
                        }
                    }
                })
            },
            ..Default::default()
        })
        .setup(move |ctx, ready, framework| {
            let store = store.clone();
            let mail = mail.clone();

            Box::pin(async move {
                info!("Bot logged in as: {}", ready.user.name);

                let gateway: SharedGateway = Arc::new(DiscordGateway::new(ctx.http.clone()));
                let session_manager =
                    SessionManager::new(gateway.clone(), store.clone(), mail.clone());
                session_manager.spawn_sweeper();

                // Verify the bot can actually do its job in each guild
                if ready.guilds.is_empty() {
                    warn!("Bot is not in any guilds - skipping capability check");
                }
                for guild in &ready.guilds {
                    match gateway.capabilities(guild.id).await {
                        Ok(caps) if caps.allows_verification() => {
                            info!("Guild {}: verification capabilities OK", guild.id);
                        }
                        Ok(_) => {
                            warn!(
                                "Guild {}: bot is missing Manage Roles and/or View Channels",
                                guild.id
                            );
                            if let Ok(report) = gateway.role_hierarchy_report(guild.id).await {
                                log_role_hierarchy_report(&report);
                            }
                        }
                        Err(e) => {
                            warn!("Guild {}: capability check failed: {}", guild.id, e);
                        }
                    }
                }

                // Determine which guilds to register commands for
                let guilds_to_register: Vec<serenity::GuildId> = if let Some(gid) = target_guild_id
                {
                    vec![serenity::GuildId::new(gid)]
                } else {
                    ready.guilds.iter().map(|g| g.id).collect()
                };

                if guild_commands || sync_commands {
                    // Register commands per-guild (faster for testing)
                    for guild_id in &guilds_to_register {
                        info!("Registering commands to guild: {}", guild_id);
                        if let Err(e) = poise::builtins::register_in_guild(
                            ctx,
                            &framework.options().commands,
                            *guild_id,
                        )
                        .await
                        {
                            error!("Failed to register commands for guild {}: {}", guild_id, e);
                        } else {
                            info!(
                                "Successfully registered {} commands for guild {}",
                                framework.options().commands.len(),
                                guild_id
                            );
                        }
                    }
                } else {
                    // Default: Register commands globally
                    info!("Registering commands globally...");
                    if let Err(e) =
                        poise::builtins::register_globally(ctx, &framework.options().commands).await
                    {
                        error!("Failed to register commands globally: {}", e);
                    } else {
                        info!(
                            "Successfully registered {} commands globally (may take up to 1 hour to propagate)",
                            framework.options().commands.len()
                        );
                    }
                }

                Ok(Data {
                    session_manager,
                    store,
                    gateway,
                })
            })
        })
        .build();

    let intents = serenity::GatewayIntents::non_privileged()
        | serenity::GatewayIntents::MESSAGE_CONTENT
        | serenity::GatewayIntents::GUILD_MEMBERS;

    let mut client = serenity::ClientBuilder::new(token, intents)
        .framework(framework)
        .await?;

    info!("Starting bot...");
    if let Err(e) = client.start().await {
        let err_str = e.to_string();
        if err_str.contains("Disallowed") || err_str.contains("intents") {
            error!("Failed to start bot: {}", e);
            error!("MESSAGE_CONTENT and GUILD_MEMBERS must be enabled in the Discord Developer Portal:");
            error!("https://discord.com/developers/applications -> Your App -> Bot -> Privileged Gateway Intents");
            return Err(anyhow::anyhow!(
                "Disallowed gateway intents; enable MESSAGE_CONTENT and GUILD_MEMBERS"
            ));
        }
        return Err(e.into());
    }
    warn!("Bot ended.");

    Ok(())
}
