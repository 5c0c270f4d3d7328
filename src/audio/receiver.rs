//! Voice receive handling
//!
//! Maps Discord SSRCs to users and forwards each user's decoded PCM
//! to the speaker hooks of the owning session.

use crate::audio::processor::AudioProcessor;
use dashmap::DashMap;
use parking_lot::Mutex;
use serenity::async_trait;
use songbird::events::{Event, EventContext, EventHandler as VoiceEventHandler};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Callbacks raised by the receiver, per guild call
pub trait SpeakerHooks: Send + Sync {
    /// A user went from silent to speaking
    fn speaking_started(&self, user_id: u64);

    /// A speaking user went quiet
    fn speaking_stopped(&self, user_id: u64);

    /// One tick of decoded 48 kHz stereo PCM (s16le) from a user
    fn audio(&self, user_id: u64, pcm: Vec<u8>);

    /// A user left the call
    fn client_disconnected(&self, user_id: u64);

    /// The bot's own voice connection dropped
    fn driver_disconnected(&self);
}

/// Receive state for a single call
pub struct VoiceReceiver {
    ssrc_users: DashMap<u32, u64>,
    speaking: Mutex<HashSet<u32>>,
    hooks: Arc<dyn SpeakerHooks>,
}

impl VoiceReceiver {
    pub fn new(hooks: Arc<dyn SpeakerHooks>) -> Self {
        Self {
            ssrc_users: DashMap::new(),
            speaking: Mutex::new(HashSet::new()),
            hooks,
        }
    }

    /// Record which user owns an SSRC
    pub fn on_speaking_update(&self, ssrc: u32, user_id: Option<u64>) {
        if let Some(user_id) = user_id {
            if self.ssrc_users.insert(ssrc, user_id).is_none() {
                debug!("Mapped SSRC {} to user {}", ssrc, user_id);
            }
        }
    }

    /// Process one 20ms tick
    pub fn on_tick<'a, S, Q>(&self, speaking: S, silent: Q)
    where
        S: IntoIterator<Item = (u32, Option<&'a [i16]>)>,
        Q: IntoIterator<Item = u32>,
    {
        for (ssrc, decoded) in speaking {
            let Some(user_id) = self.ssrc_users.get(&ssrc).map(|r| *r.value()) else {
                trace!("Audio from unmapped SSRC {}", ssrc);
                continue;
            };
            let Some(samples) = decoded.filter(|s| !s.is_empty()) else {
                continue;
            };

            let started = self.speaking.lock().insert(ssrc);
            if started {
                self.hooks.speaking_started(user_id);
            }
            self.hooks.audio(user_id, AudioProcessor::samples_to_bytes(samples));
        }

        let stopped: Vec<u32> = {
            let mut speaking = self.speaking.lock();
            silent.into_iter().filter(|ssrc| speaking.remove(ssrc)).collect()
        };
        for ssrc in stopped {
            if let Some(user_id) = self.ssrc_users.get(&ssrc).map(|r| *r.value()) {
                self.hooks.speaking_stopped(user_id);
            }
        }
    }

    pub fn on_client_disconnect(&self, user_id: u64) {
        let ssrcs: Vec<u32> = self
            .ssrc_users
            .iter()
            .filter(|r| *r.value() == user_id)
            .map(|r| *r.key())
            .collect();
        {
            let mut speaking = self.speaking.lock();
            for ssrc in &ssrcs {
                self.ssrc_users.remove(ssrc);
                speaking.remove(ssrc);
            }
        }
        info!("User {} left the call", user_id);
        self.hooks.client_disconnected(user_id);
    }

    pub fn on_driver_disconnect(&self) {
        self.ssrc_users.clear();
        self.speaking.lock().clear();
        self.hooks.driver_disconnected();
    }
}

/// Songbird event handler wrapping a shared receiver
#[derive(Clone)]
pub struct ReceiverHandler(pub Arc<VoiceReceiver>);

#[async_trait]
impl VoiceEventHandler for ReceiverHandler {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        match ctx {
            EventContext::SpeakingStateUpdate(speaking) => {
                self.0
                    .on_speaking_update(speaking.ssrc, speaking.user_id.map(|id| id.0));
            }
            EventContext::VoiceTick(tick) => {
                self.0.on_tick(
                    tick.speaking
                        .iter()
                        .map(|(ssrc, data)| (*ssrc, data.decoded_voice.as_deref())),
                    tick.silent.iter().copied(),
                );
            }
            EventContext::ClientDisconnect(disconnect) => {
                self.0.on_client_disconnect(disconnect.user_id.0);
            }
            EventContext::DriverDisconnect(_) => {
                self.0.on_driver_disconnect();
            }
            _ => {}
        }

        None
    }
}
