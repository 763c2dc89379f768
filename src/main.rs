use std::env;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use case_warden::config::ModeratorConfig;
use case_warden::handlers::Handler;
use case_warden::logging::{self, CaseAuditLog};
use case_warden::moderation::{Moderator, SerenityBackend};
use case_warden::{BOT_NAME, Data, Error, commands};
use poise::serenity_prelude::{self as serenity};
use serenity::{GatewayIntents, Http};
use tracing::{error, info};

/// Config file used when `CASE_WARDEN_CONFIG` is not set
const DEFAULT_CONFIG_PATH: &str = "data/case_warden.yaml";

/// Main function to run the bot
async fn async_main() -> Result<(), Error> {
    // Initialize logging
    logging::init()?;

    // Load environment variables
    let token = env::var("DISCORD_TOKEN").map_err(|_| "DISCORD_TOKEN must be set")?;
    let config_path =
        env::var("CASE_WARDEN_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = ModeratorConfig::load(&config_path).await?;
    info!(config = ?config, "Loaded {BOT_NAME} config");

    // The moderator must load its cases before any command can run
    let ready = Arc::new(AtomicBool::new(false));
    let http = Arc::new(Http::new(&token));
    let backend = Arc::new(SerenityBackend::new(http, Arc::clone(&ready)));
    let moderator = Arc::new(Moderator::new(config, backend));
    moderator.subscribe(Arc::new(CaseAuditLog));
    moderator.init().await?;

    let data = Data::new(Arc::clone(&moderator), Arc::clone(&ready));

    // Configure the Poise framework
    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: commands::all(),
            pre_command: |ctx| {
                Box::pin(async move {
                    logging::log_command_start(ctx);
                })
            },
            post_command: |ctx| {
                Box::pin(async move {
                    logging::log_command_end(ctx);
                })
            },
            on_error: |error| {
                Box::pin(async move {
                    logging::log_command_error(&error);
                    if let poise::FrameworkError::Command { error, ctx, .. } = error {
                        let reply = poise::CreateReply::default()
                            .content(format!("Error: {error}"))
                            .ephemeral(true);
                        if let Err(e) = ctx.send(reply).await {
                            error!("Failed to report command error: {e}");
                        }
                    }
                })
            },
            ..Default::default()
        })
        .setup(|ctx, _ready, framework| {
            Box::pin(async move {
                logging::log_console("Registering commands".to_string());
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                Ok(data)
            })
        })
        .build();

    // Configure the Serenity client
    let intents = GatewayIntents::non_privileged();
    let mut client = serenity::ClientBuilder::new(token, intents)
        .event_handler(Handler::new(ready))
        .framework(framework)
        .await?;

    let shard_manager = Arc::clone(&client.shard_manager);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {e}");
            return;
        }
        info!("Shutting down");
        shard_manager.shutdown_all().await;
    });

    info!("Starting bot...");
    let result = client.start().await;
    moderator.shutdown().await;
    result?;

    Ok(())
}

fn main() {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: failed to start runtime: {err}");
            std::process::exit(1);
        }
    };

    // Handle any errors that occurred during execution
    if let Err(err) = runtime.block_on(async_main()) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
