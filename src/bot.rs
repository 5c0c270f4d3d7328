//! Discord Bot event handler and startup wiring

use crate::agent::GeminiAgent;
use crate::audio::monitor::MonitorLimits;
use crate::audio::playback::PlaybackDispatcher;
use crate::audio::registry::StreamRegistry;
use crate::commands;
use crate::config::Config;
use crate::database::Database;
use crate::gemini::GeminiClient;
use crate::pipeline::UtterancePipeline;
use crate::session::{spawn_speaker_loop, DiscordRegistry, VoiceSessionManager};
use crate::transcriber::GeminiTranscriber;
use crate::tts::SpeechService;
use serenity::all::{
    Client, Context, EventHandler, GatewayIntents, Guild, GuildId, Interaction, Ready, VoiceState,
};
use serenity::async_trait;
use songbird::driver::DecodeMode;
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

/// Bot state shared across handlers
pub struct BotState {
    pub config: Arc<Config>,
    pub session_manager: Arc<VoiceSessionManager>,
}

/// Main event handler for the bot
pub struct Handler {
    pub state: Arc<BotState>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("Logged in as {}", ready.user.name);

        let commands = commands::voice::register();

        // If guild ID is set, register to specific guild (faster for dev)
        if let Some(guild_id) = self.state.config.guild_id {
            let guild = GuildId::new(guild_id);
            match guild.set_commands(&ctx.http, commands).await {
                Ok(cmds) => info!("Registered {} guild commands", cmds.len()),
                Err(e) => error!("Failed to register guild commands: {}", e),
            }
        } else {
            match serenity::all::Command::set_global_commands(&ctx.http, commands).await {
                Ok(cmds) => info!("Registered {} global commands", cmds.len()),
                Err(e) => error!("Failed to register global commands: {}", e),
            }
        }
    }

    async fn guild_create(&self, ctx: Context, guild: Guild, _is_new: Option<bool>) {
        if !self.state.config.auto_join {
            return;
        }
        self.state
            .session_manager
            .handle_guild_available(ctx.cache.clone(), &guild)
            .await;
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        self.state
            .session_manager
            .handle_voice_state_update(ctx.cache.clone(), old, new)
            .await;
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command) = interaction {
            let result = match command.data.name.as_str() {
                "joinchannel" => {
                    commands::voice::handle_join(&ctx, &command, self.state.session_manager.clone()).await
                }
                "leavechannel" => {
                    commands::voice::handle_leave(&ctx, &command, self.state.session_manager.clone()).await
                }
                _ => Ok(()),
            };

            if let Err(e) = result {
                error!("Command error: {}", e);
            }
        }
    }
}

/// Create and run the Discord bot
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Arc::new(config);

    // Initialize database
    let db = Arc::new(Database::open(&config.database_path)?);

    let gemini = Arc::new(GeminiClient::new(config.gemini_api_key.clone())?);
    let agent = Arc::new(GeminiAgent::new(gemini.clone(), db, config.agent_name.clone()));
    let transcriber = Arc::new(GeminiTranscriber::new(gemini));
    let tts = Arc::new(SpeechService::from_config(&config)?);

    let (speaker_tx, speaker_rx) = mpsc::unbounded_channel();
    let registry: Arc<DiscordRegistry> = Arc::new(StreamRegistry::new(speaker_tx));
    let dispatcher = Arc::new(PlaybackDispatcher::new(registry.clone()));
    let pipeline = Arc::new(UtterancePipeline::new(transcriber, agent, tts, dispatcher));
    spawn_speaker_loop(registry.clone(), pipeline, MonitorLimits::default(), speaker_rx);

    // Receive needs decoded PCM, not raw Opus
    let songbird_config = songbird::Config::default().decode_mode(DecodeMode::Decode);
    let songbird = Songbird::serenity_from_config(songbird_config);

    let session_manager = Arc::new(VoiceSessionManager::new(songbird.clone(), registry));
    log_speaker_signals(session_manager.subscribe_signals());

    let state = Arc::new(BotState {
        config: config.clone(),
        session_manager,
    });

    let handler = Handler { state };

    // Create client with voice support
    let intents = GatewayIntents::non_privileged() | GatewayIntents::GUILD_VOICE_STATES;

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    info!("Starting bot...");
    client.start().await?;

    Ok(())
}

fn log_speaker_signals(mut signals: broadcast::Receiver<crate::session::SpeakerSignal>) {
    tokio::spawn(async move {
        loop {
            match signals.recv().await {
                Ok(signal) => debug!(
                    "[{}] User {} speaking: {}",
                    signal.guild_id, signal.user_id, signal.speaking
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Speaking signal log lagged, skipped {}", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
