//! Playback of synthesized replies into a voice call

use crate::audio::registry::StreamRegistry;
use crate::tts::SpeechAudio;
use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::all::GuildId;
use songbird::events::{Event, EventContext, EventHandler as VoiceEventHandler, TrackEvent};
use songbird::input::{AudioStream, Input, LiveInput};
use songbird::tracks::{PlayMode, TrackHandle};
use songbird::Call;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;
use symphonia::core::io::MediaSource;
use symphonia::core::probe::Hint;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("Track control failed: {0}")]
    Control(String),
}

/// A call that can play synthesized audio
#[async_trait]
pub trait VoiceConnection: Clone + Send + Sync + 'static {
    /// Start a fresh track, replacing whatever is playing
    async fn play(&self, audio: SpeechAudio) -> Result<(), PlaybackError>;

    /// Stop the current track. Returns true if something was playing.
    fn interrupt(&self) -> bool;
}

/// Destination for synthesized replies
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, user_id: u64, audio: SpeechAudio);
}

/// Routes audio to the connection of the user being answered
pub struct PlaybackDispatcher<C> {
    registry: Arc<StreamRegistry<C>>,
}

impl<C> PlaybackDispatcher<C> {
    pub fn new(registry: Arc<StreamRegistry<C>>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl<C: VoiceConnection> AudioSink for PlaybackDispatcher<C> {
    async fn play(&self, user_id: u64, audio: SpeechAudio) {
        let Some(connection) = self.registry.connection(user_id) else {
            warn!("No voice connection for user {}, dropping reply audio", user_id);
            return;
        };

        if let Err(e) = connection.play(audio).await {
            error!("Playback failed for user {}: {}", user_id, e);
        }
    }
}

/// Songbird call shared by every speaker of a guild
#[derive(Clone)]
pub struct DiscordConnection {
    guild_id: GuildId,
    call: Arc<tokio::sync::Mutex<Call>>,
    current: Arc<Mutex<Option<TrackHandle>>>,
}

impl DiscordConnection {
    pub fn new(guild_id: GuildId, call: Arc<tokio::sync::Mutex<Call>>) -> Self {
        Self {
            guild_id,
            call,
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn call(&self) -> Arc<tokio::sync::Mutex<Call>> {
        self.call.clone()
    }
}

/// Wrap an encoded clip so symphonia can probe it
fn to_input(audio: SpeechAudio) -> Input {
    let mut hint = Hint::new();
    hint.with_extension(audio.container.extension());

    let source: Box<dyn MediaSource> = Box::new(Cursor::new(audio.data));
    Input::Live(
        LiveInput::Raw(AudioStream {
            input: source,
            hint: Some(hint),
        }),
        None,
    )
}

#[async_trait]
impl VoiceConnection for DiscordConnection {
    async fn play(&self, audio: SpeechAudio) -> Result<(), PlaybackError> {
        let bytes = audio.data.len();
        let input = to_input(audio);

        let handle = {
            let mut call = self.call.lock().await;
            call.play_only_input(input)
        };

        let logger = PlaybackLogger {
            guild_id: self.guild_id,
            started: Instant::now(),
            current: self.current.clone(),
        };
        handle
            .add_event(Event::Track(TrackEvent::End), logger.clone())
            .map_err(|e| PlaybackError::Control(e.to_string()))?;
        handle
            .add_event(Event::Track(TrackEvent::Error), logger)
            .map_err(|e| PlaybackError::Control(e.to_string()))?;

        info!("[{}] Started reply playback ({} bytes)", self.guild_id, bytes);
        *self.current.lock() = Some(handle);
        Ok(())
    }

    fn interrupt(&self) -> bool {
        let Some(handle) = self.current.lock().take() else {
            return false;
        };
        match handle.stop() {
            Ok(()) => {
                info!("[{}] Interrupted reply playback", self.guild_id);
                true
            }
            Err(e) => {
                // Track already finished
                debug!("[{}] Stop ignored: {}", self.guild_id, e);
                false
            }
        }
    }
}

/// Logs how long a reply played and clears the current-track slot
#[derive(Clone)]
struct PlaybackLogger {
    guild_id: GuildId,
    started: Instant,
    current: Arc<Mutex<Option<TrackHandle>>>,
}

#[async_trait]
impl VoiceEventHandler for PlaybackLogger {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::Track(tracks) = ctx {
            for (state, handle) in tracks.iter() {
                if let PlayMode::Errored(e) = &state.playing {
                    error!("[{}] Player error: {}", self.guild_id, e);
                } else {
                    info!(
                        "[{}] Reply playback finished after {}ms",
                        self.guild_id,
                        self.started.elapsed().as_millis()
                    );
                }

                let mut current = self.current.lock();
                if current.as_ref().map(|h| h.uuid()) == Some(handle.uuid()) {
                    *current = None;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tts::AudioContainer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[derive(Clone, Default)]
    struct CountingConnection {
        plays: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl VoiceConnection for CountingConnection {
        async fn play(&self, _audio: SpeechAudio) -> Result<(), PlaybackError> {
            self.plays.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn interrupt(&self) -> bool {
            false
        }
    }

    fn clip() -> SpeechAudio {
        SpeechAudio {
            data: vec![1, 2, 3],
            container: AudioContainer::Wav,
        }
    }

    #[tokio::test]
    async fn test_unknown_user_creates_no_player() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry = Arc::new(StreamRegistry::new(tx));
        let other = CountingConnection::default();
        registry.ensure_monitored(7, "alice", 100, other.clone());
        let dispatcher = PlaybackDispatcher::new(registry.clone());

        dispatcher.play(42, clip()).await;

        assert_eq!(other.plays.load(Ordering::SeqCst), 0);
        assert!(registry.connection(42).is_none());
    }

    #[tokio::test]
    async fn test_plays_on_speaker_connection() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry = Arc::new(StreamRegistry::new(tx));
        let connection = CountingConnection::default();
        registry.ensure_monitored(7, "alice", 100, connection.clone());

        let dispatcher = PlaybackDispatcher::new(registry.clone());
        dispatcher.play(7, clip()).await;
        dispatcher.play(8, clip()).await;
        assert_eq!(connection.plays.load(Ordering::SeqCst), 1);

        registry.release(7);
        dispatcher.play(7, clip()).await;
        assert_eq!(connection.plays.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_input_is_live_raw() {
        assert!(matches!(to_input(clip()), Input::Live(LiveInput::Raw(_), None)));
    }
}
