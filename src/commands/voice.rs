//! Voice commands: /joinchannel, /leavechannel

use serenity::all::{
    ChannelId, ChannelType, CommandInteraction, CommandOptionType, Context, CreateCommand,
    CreateCommandOption, CreateInteractionResponse, CreateInteractionResponseMessage,
    EditInteractionResponse, ResolvedValue,
};
use std::sync::Arc;
use tracing::info;

use crate::session::{SessionError, VoiceSessionManager};

/// Register voice commands
pub fn register() -> Vec<CreateCommand> {
    vec![
        CreateCommand::new("joinchannel")
            .description("Join a voice channel and start listening")
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::Channel,
                    "channel",
                    "Voice channel to join (defaults to yours)",
                )
                .channel_types(vec![ChannelType::Voice, ChannelType::Stage])
                .required(false),
            ),
        CreateCommand::new("leavechannel").description("Leave the current voice channel"),
    ]
}

/// Channel passed as the `channel` option, if any
fn channel_option(command: &CommandInteraction) -> Option<ChannelId> {
    command
        .data
        .options()
        .into_iter()
        .find(|opt| opt.name == "channel")
        .and_then(|opt| match opt.value {
            ResolvedValue::Channel(channel) => Some(channel.id),
            _ => None,
        })
}

/// Handle /joinchannel command
pub async fn handle_join(
    ctx: &Context,
    command: &CommandInteraction,
    session_manager: Arc<VoiceSessionManager>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let guild_id = command.guild_id.ok_or("Must be used in a guild")?;

    let voice_channel_id = match channel_option(command) {
        Some(channel_id) => channel_id,
        None => {
            let current = ctx.cache.guild(guild_id).and_then(|guild| {
                guild
                    .voice_states
                    .get(&command.user.id)
                    .and_then(|vs| vs.channel_id)
            });
            match current {
                Some(channel_id) => channel_id,
                None => {
                    respond(ctx, command, "Join a voice channel first, or pick one with the channel option.").await?;
                    return Ok(());
                }
            }
        }
    };

    // Joining can take a few seconds
    command.defer(&ctx.http).await?;

    session_manager
        .join_channel(ctx.cache.clone(), guild_id, voice_channel_id)
        .await?;

    let channel_name = ctx
        .cache
        .channel(voice_channel_id)
        .map(|c| c.name.clone())
        .unwrap_or_else(|| "Unknown".to_string());

    let response = EditInteractionResponse::new().content(format!("Joined {} and listening.", channel_name));
    command.edit_response(&ctx.http, response).await?;

    info!("Joined guild {} channel {} by command", guild_id, voice_channel_id);
    Ok(())
}

/// Handle /leavechannel command
pub async fn handle_leave(
    ctx: &Context,
    command: &CommandInteraction,
    session_manager: Arc<VoiceSessionManager>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let guild_id = command.guild_id.ok_or("Must be used in a guild")?;

    match session_manager.leave_channel(guild_id).await {
        Ok(()) => respond(ctx, command, "Left the voice channel.").await?,
        Err(SessionError::NotConnected) => respond(ctx, command, "Not in a voice channel.").await?,
        Err(e) => return Err(e.into()),
    }

    info!("Leave requested in guild {}", guild_id);
    Ok(())
}

/// Helper to send a response
async fn respond(
    ctx: &Context,
    command: &CommandInteraction,
    content: &str,
) -> Result<(), serenity::Error> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(CreateInteractionResponseMessage::new().content(content)),
        )
        .await
}
