//! Voice channel presence and per-guild voice sessions
//!
//! Decides which channel to join, owns the songbird call per guild and
//! wires receive events into the speaker registry.

use crate::audio::monitor::{self, MonitorLimits};
use crate::audio::playback::{DiscordConnection, VoiceConnection};
use crate::audio::receiver::{ReceiverHandler, SpeakerHooks, VoiceReceiver};
use crate::audio::registry::{NewSpeaker, StreamRegistry};
use crate::pipeline::UtterancePipeline;
use dashmap::DashMap;
use serenity::all::{Cache, ChannelId, ChannelType, Guild, GuildId, UserId, VoiceState};
use songbird::{CoreEvent, Songbird};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to join voice channel: {0}")]
    Join(#[from] songbird::error::JoinError),
    #[error("Not connected to a voice channel in this guild")]
    NotConnected,
}

/// Speaking start/stop broadcast to interested listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakerSignal {
    pub guild_id: GuildId,
    pub user_id: u64,
    pub speaking: bool,
}

pub type DiscordRegistry = StreamRegistry<DiscordConnection>;

/// The bot's presence in one guild voice channel
pub struct VoiceSession {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    connection: DiscordConnection,
    registry: Arc<DiscordRegistry>,
    cache: Arc<Cache>,
    signals: broadcast::Sender<SpeakerSignal>,
}

impl VoiceSession {
    fn is_bot(&self, user_id: u64) -> bool {
        let uid = UserId::new(user_id);
        if uid == self.cache.current_user().id {
            return true;
        }
        self.cache.user(uid).map(|u| u.bot).unwrap_or(false)
    }

    /// Get user display name
    fn display_name(&self, user_id: u64) -> String {
        let uid = UserId::new(user_id);
        if let Some(guild) = self.cache.guild(self.guild_id) {
            if let Some(member) = guild.members.get(&uid) {
                return member.display_name().to_string();
            }
            if let Some(member) = guild.voice_states.get(&uid).and_then(|vs| vs.member.as_ref()) {
                return member.display_name().to_string();
            }
        }
        self.cache
            .user(uid)
            .map(|u| u.display_name().to_string())
            .unwrap_or_else(|| format!("User_{}", user_id))
    }

    /// Register a member for monitoring
    fn monitor(&self, user_id: u64) {
        let name = self.display_name(user_id);
        self.registry
            .ensure_monitored(user_id, &name, self.channel_id.get(), self.connection.clone());
    }

    /// Detach receive handlers from the call
    async fn close(&self) {
        self.connection.call().lock().await.remove_all_global_events();
        self.registry.release_channel(self.channel_id.get());
    }

    fn signal(&self, user_id: u64, speaking: bool) {
        // No subscribers is fine
        let _ = self.signals.send(SpeakerSignal {
            guild_id: self.guild_id,
            user_id,
            speaking,
        });
    }
}

impl SpeakerHooks for VoiceSession {
    fn speaking_started(&self, user_id: u64) {
        if self.is_bot(user_id) {
            return;
        }
        if self.connection.interrupt() {
            debug!("[{}] Barge-in from {} stopped reply playback", self.guild_id, user_id);
        }
        if !self.registry.is_monitored(user_id) {
            self.monitor(user_id);
        }
        self.signal(user_id, true);
    }

    fn speaking_stopped(&self, user_id: u64) {
        if self.is_bot(user_id) {
            return;
        }
        self.signal(user_id, false);
    }

    fn audio(&self, user_id: u64, pcm: Vec<u8>) {
        if !self.registry.push_chunk(user_id, pcm) {
            debug!("Chunk for user {} not delivered", user_id);
        }
    }

    fn client_disconnected(&self, user_id: u64) {
        self.registry.release(user_id);
    }

    fn driver_disconnected(&self) {
        warn!("[{}] Voice driver disconnected from {}", self.guild_id, self.channel_id);
        self.registry.release_channel(self.channel_id.get());
    }
}

/// Session manager for all guilds
pub struct VoiceSessionManager {
    songbird: Arc<Songbird>,
    registry: Arc<DiscordRegistry>,
    sessions: DashMap<GuildId, Arc<VoiceSession>>,
    signals: broadcast::Sender<SpeakerSignal>,
}

impl VoiceSessionManager {
    pub fn new(songbird: Arc<Songbird>, registry: Arc<DiscordRegistry>) -> Self {
        let (signals, _) = broadcast::channel(64);
        Self {
            songbird,
            registry,
            sessions: DashMap::new(),
            signals,
        }
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<SpeakerSignal> {
        self.signals.subscribe()
    }

    pub fn current_channel(&self, guild_id: GuildId) -> Option<ChannelId> {
        self.sessions.get(&guild_id).map(|r| r.value().channel_id)
    }

    /// Join the busiest voice channel of a freshly available guild
    pub async fn handle_guild_available(&self, cache: Arc<Cache>, guild: &Guild) {
        let occupancy = channel_occupancy(guild, cache.current_user().id);
        let Some(channel_id) = pick_busiest_channel(&occupancy) else {
            debug!("[{}] No occupied voice channel", guild.id);
            return;
        };

        info!("[{}] Joining busiest voice channel {}", guild.id, channel_id);
        if let Err(e) = self.join_channel(cache, guild.id, channel_id).await {
            warn!("[{}] Auto-join failed: {}", guild.id, e);
        }
    }

    /// Follow members into channels and release members who leave ours
    pub async fn handle_voice_state_update(&self, cache: Arc<Cache>, old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else {
            return;
        };
        let is_self = new.user_id == cache.current_user().id;
        let is_bot = is_self || new.member.as_ref().map(|m| m.user.bot).unwrap_or(false);
        let old_channel = old.as_ref().and_then(|vs| vs.channel_id);
        let current = self.current_channel(guild_id);

        let decision = voice_state_decision(is_self, is_bot, old_channel, new.channel_id, current);

        if decision.drop_session {
            if let Some((_, session)) = self.sessions.remove(&guild_id) {
                info!("[{}] Bot was disconnected from voice", guild_id);
                session.close().await;
            }
        }

        if decision.release_member {
            self.registry.release(new.user_id.get());
        }

        if let Some(target) = decision.follow {
            info!("[{}] Following member {} to channel {}", guild_id, new.user_id, target);
            if let Err(e) = self.join_channel(cache, guild_id, target).await {
                warn!("[{}] Failed to follow member: {}", guild_id, e);
            }
        }
    }

    /// Join `channel_id`, replacing any existing connection in the guild
    pub async fn join_channel(&self, cache: Arc<Cache>, guild_id: GuildId, channel_id: ChannelId) -> Result<(), SessionError> {
        if let Some((_, old)) = self.sessions.remove(&guild_id) {
            old.close().await;
            if let Err(e) = self.songbird.remove(guild_id).await {
                debug!("[{}] Teardown of previous connection: {}", guild_id, e);
            }
        }

        let call = self.songbird.join(guild_id, channel_id).await?;

        let session = Arc::new(VoiceSession {
            guild_id,
            channel_id,
            connection: DiscordConnection::new(guild_id, call.clone()),
            registry: self.registry.clone(),
            cache: cache.clone(),
            signals: self.signals.clone(),
        });

        let receiver = Arc::new(VoiceReceiver::new(session.clone()));
        {
            let mut handler = call.lock().await;
            for event in [
                CoreEvent::SpeakingStateUpdate,
                CoreEvent::VoiceTick,
                CoreEvent::ClientDisconnect,
                CoreEvent::DriverDisconnect,
            ] {
                handler.add_global_event(event.into(), ReceiverHandler(receiver.clone()));
            }
        }

        let members: Vec<u64> = cache
            .guild(guild_id)
            .map(|guild| {
                guild
                    .voice_states
                    .values()
                    .filter(|vs| vs.channel_id == Some(channel_id))
                    .map(|vs| vs.user_id.get())
                    .collect()
            })
            .unwrap_or_default();
        for user_id in members {
            if !session.is_bot(user_id) {
                session.monitor(user_id);
            }
        }

        self.sessions.insert(guild_id, session);
        info!("[{}] Joined voice channel {}", guild_id, channel_id);
        Ok(())
    }

    /// Leave the guild's voice channel and release its speakers
    pub async fn leave_channel(&self, guild_id: GuildId) -> Result<(), SessionError> {
        let Some((_, session)) = self.sessions.remove(&guild_id) else {
            return Err(SessionError::NotConnected);
        };

        session.close().await;
        if let Err(e) = self.songbird.remove(guild_id).await {
            warn!("[{}] Failed to leave voice channel: {}", guild_id, e);
        }
        info!(
            "[{}] Left voice channel {} ({} speaker(s) still monitored)",
            guild_id,
            session.channel_id,
            self.registry.speaker_count()
        );
        Ok(())
    }
}

/// Run one monitor per new speaker, feeding finished utterances to the pipeline
pub fn spawn_speaker_loop<C>(
    registry: Arc<StreamRegistry<C>>,
    pipeline: Arc<UtterancePipeline>,
    limits: MonitorLimits,
    mut events: mpsc::UnboundedReceiver<NewSpeaker>,
) -> JoinHandle<()>
where
    C: VoiceConnection,
{
    tokio::spawn(async move {
        while let Some(speaker) = events.recv().await {
            let NewSpeaker {
                user_id,
                display_name,
                channel_id,
                generation,
                stream,
            } = speaker;

            let task_registry = registry.clone();
            let pipeline = pipeline.clone();
            let handle = tokio::spawn(async move {
                monitor::watch(stream, limits, |utterance| {
                    debug!("Utterance from {} finalized: {} bytes", user_id, utterance.len());
                    pipeline.spawn_process(utterance, user_id, display_name.clone(), channel_id);
                })
                .await;
                task_registry.release_generation(user_id, generation);
            });
            registry.attach_listener(user_id, generation, handle.abort_handle());
        }
        debug!("Speaker event channel closed");
    })
}

/// Members per voice channel, in channel order, bots excluded
fn channel_occupancy(guild: &Guild, bot_id: UserId) -> Vec<(ChannelId, usize)> {
    let mut channels: Vec<_> = guild
        .channels
        .values()
        .filter(|c| matches!(c.kind, ChannelType::Voice | ChannelType::Stage))
        .map(|c| (c.position, c.id))
        .collect();
    channels.sort();

    channels
        .into_iter()
        .map(|(_, channel_id)| {
            let count = guild
                .voice_states
                .values()
                .filter(|vs| vs.channel_id == Some(channel_id))
                .filter(|vs| vs.user_id != bot_id)
                .filter(|vs| {
                    let member = vs.member.as_ref().or_else(|| guild.members.get(&vs.user_id));
                    !member.map(|m| m.user.bot).unwrap_or(false)
                })
                .count();
            (channel_id, count)
        })
        .collect()
}

/// Channel with the most members; ties go to the first one listed
pub fn pick_busiest_channel<T: Copy>(occupancy: &[(T, usize)]) -> Option<T> {
    let mut best: Option<(T, usize)> = None;
    for &(channel, count) in occupancy {
        if count == 0 {
            continue;
        }
        if best.map_or(true, |(_, top)| count > top) {
            best = Some((channel, count));
        }
    }
    best.map(|(channel, _)| channel)
}

/// What a voice state change means for the guild's session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceStateDecision<T> {
    /// The bot itself was disconnected from the channel it is in
    pub drop_session: bool,
    /// The member left the channel the bot is in
    pub release_member: bool,
    /// Channel to follow the member into
    pub follow: Option<T>,
}

pub fn voice_state_decision<T: Copy + PartialEq>(
    is_self: bool,
    is_bot: bool,
    old: Option<T>,
    new: Option<T>,
    current: Option<T>,
) -> VoiceStateDecision<T> {
    // Kicked or disconnected from outside. A late event for a channel we
    // already moved away from must not drop the new session.
    if is_self && new.is_none() {
        return VoiceStateDecision {
            drop_session: old.is_some() && old == current,
            release_member: false,
            follow: None,
        };
    }

    VoiceStateDecision {
        drop_session: false,
        release_member: old.is_some() && old == current && new != current,
        follow: follow_target(old, new, current, is_bot),
    }
}

/// Channel to move to after a member's voice state changed
pub fn follow_target<T: Copy + PartialEq>(old: Option<T>, new: Option<T>, current: Option<T>, is_bot: bool) -> Option<T> {
    if is_bot {
        return None;
    }
    let target = new?;
    if old == Some(target) || current == Some(target) {
        return None;
    }
    Some(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentError, AgentResponse, AgentRuntime, IncomingMessage, State};
    use crate::audio::monitor::MAX_UTTERANCE_BYTES;
    use crate::audio::playback::{AudioSink, PlaybackError};
    use crate::transcriber::{TranscribeError, Transcriber};
    use crate::tts::{SpeechAudio, SpeechSynthesizer, TtsError};
    use async_trait::async_trait;
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn test_pick_busiest_channel() {
        assert_eq!(pick_busiest_channel(&[(1u64, 1), (2, 3), (3, 2)]), Some(2));
        assert_eq!(pick_busiest_channel(&[(1u64, 2), (2, 2)]), Some(1));
        assert_eq!(pick_busiest_channel(&[(1u64, 0), (2, 0)]), None);
        assert_eq!(pick_busiest_channel::<u64>(&[]), None);
    }

    #[test]
    fn test_follow_target() {
        assert_eq!(follow_target(None, Some(5u64), None, false), Some(5));
        assert_eq!(follow_target(Some(4u64), Some(5), Some(4), false), Some(5));
        assert_eq!(follow_target(Some(4u64), Some(5), None, true), None);
        // mute/unmute keeps the channel
        assert_eq!(follow_target(Some(5u64), Some(5), None, false), None);
        assert_eq!(follow_target(Some(4u64), None, Some(4), false), None);
        assert_eq!(follow_target(Some(4u64), Some(5), Some(5), false), None);
    }

    #[test]
    fn test_self_disconnect_drops_only_current_session() {
        let kicked = voice_state_decision(true, true, Some(4u64), None, Some(4));
        assert!(kicked.drop_session);
        assert!(!kicked.release_member);
        assert_eq!(kicked.follow, None);

        // Late event from the channel we just left for 5
        let stale = voice_state_decision(true, true, Some(4u64), None, Some(5));
        assert!(!stale.drop_session);

        let unknown = voice_state_decision(true, true, None, None, Some(5u64));
        assert!(!unknown.drop_session);
    }

    #[test]
    fn test_member_leaving_our_channel_is_released() {
        let left = voice_state_decision(false, false, Some(4u64), None, Some(4));
        assert!(left.release_member);
        assert!(!left.drop_session);
        assert_eq!(left.follow, None);

        // Moving elsewhere releases and follows
        let moved = voice_state_decision(false, false, Some(4u64), Some(6), Some(4));
        assert!(moved.release_member);
        assert_eq!(moved.follow, Some(6));

        // Leaving some other channel does not touch our speakers
        let elsewhere = voice_state_decision(false, false, Some(6u64), None, Some(4));
        assert!(!elsewhere.release_member);

        let muted = voice_state_decision(false, false, Some(4u64), Some(4), Some(4));
        assert!(!muted.release_member);
        assert_eq!(muted.follow, None);
    }

    #[test]
    fn test_bots_are_released_but_not_followed() {
        let bot = voice_state_decision(false, true, Some(4u64), Some(6), Some(4));
        assert!(bot.release_member);
        assert_eq!(bot.follow, None);
    }

    #[derive(Clone)]
    struct NullConnection;

    #[async_trait]
    impl VoiceConnection for NullConnection {
        async fn play(&self, _audio: SpeechAudio) -> Result<(), PlaybackError> {
            Ok(())
        }

        fn interrupt(&self) -> bool {
            false
        }
    }

    /// Reports utterance sizes and hears nothing
    struct SizeTranscriber(mpsc::UnboundedSender<usize>);

    #[async_trait]
    impl Transcriber for SizeTranscriber {
        async fn transcribe(&self, audio: &[u8]) -> Result<String, TranscribeError> {
            let _ = self.0.send(audio.len());
            Ok(String::new())
        }
    }

    struct UnusedAgent;

    #[async_trait]
    impl AgentRuntime for UnusedAgent {
        fn agent_id(&self) -> Uuid {
            Uuid::nil()
        }

        fn agent_name(&self) -> &str {
            "Agent"
        }

        async fn ensure_user_exists(&self, _id: Uuid, _name: &str, _username: &str) -> Result<(), AgentError> {
            unreachable!()
        }

        async fn ensure_room_exists(&self, _id: Uuid) -> Result<(), AgentError> {
            unreachable!()
        }

        async fn ensure_participant_in_room(&self, _user_id: Uuid, _room_id: Uuid) -> Result<(), AgentError> {
            unreachable!()
        }

        async fn compose_state(&self, _message: &IncomingMessage) -> Result<State, AgentError> {
            unreachable!()
        }

        async fn handle_message(&self, _message: &IncomingMessage, _state: &State) -> Result<AgentResponse, AgentError> {
            unreachable!()
        }
    }

    struct UnusedTts;

    #[async_trait]
    impl SpeechSynthesizer for UnusedTts {
        async fn synthesize(&self, _text: &str) -> Result<SpeechAudio, TtsError> {
            unreachable!()
        }
    }

    struct UnusedSink;

    #[async_trait]
    impl AudioSink for UnusedSink {
        async fn play(&self, _user_id: u64, _audio: SpeechAudio) {
            unreachable!()
        }
    }

    fn speaker_loop() -> (Arc<StreamRegistry<NullConnection>>, mpsc::UnboundedReceiver<usize>) {
        let (speaker_tx, speaker_rx) = mpsc::unbounded_channel();
        let (size_tx, size_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(StreamRegistry::new(speaker_tx));
        let pipeline = Arc::new(UtterancePipeline::new(
            Arc::new(SizeTranscriber(size_tx)),
            Arc::new(UnusedAgent),
            Arc::new(UnusedTts),
            Arc::new(UnusedSink),
        ));
        spawn_speaker_loop(registry.clone(), pipeline, MonitorLimits::default(), speaker_rx);
        (registry, size_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_finalizes_utterance() {
        let (registry, mut sizes) = speaker_loop();
        registry.ensure_monitored(7, "Alice", 100, NullConnection);

        for len in [300_000, 300_000, 300_000, 50_000] {
            assert!(registry.push_chunk(7, vec![0u8; len]));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(sizes.recv().await, Some(950_000));
        assert!(registry.is_monitored(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_aborts_monitor() {
        let (registry, mut sizes) = speaker_loop();
        registry.ensure_monitored(7, "Alice", 100, NullConnection);

        assert!(registry.push_chunk(7, vec![0u8; 4_000]));
        tokio::time::sleep(Duration::from_millis(10)).await;
        registry.release(7);

        // Listener aborted with the registration
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(sizes.try_recv().is_err());
        assert!(!registry.is_monitored(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_cap_cuts_long_speech() {
        let (registry, mut sizes) = speaker_loop();
        registry.ensure_monitored(7, "Alice", 100, NullConnection);

        let chunk = MAX_UTTERANCE_BYTES / 4;
        for _ in 0..5 {
            assert!(registry.push_chunk(7, vec![0u8; chunk]));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(sizes.recv().await, Some(MAX_UTTERANCE_BYTES));
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(sizes.recv().await, Some(chunk));
    }
}
