//! Utterance pipeline
//!
//! transcription -> agent -> speech synthesis -> playback, one detached task
//! per finalized utterance.

use crate::agent::{AgentError, AgentRuntime, IncomingMessage, MessageContent, VOICE_ACTION, VOICE_SOURCE};
use crate::audio::playback::AudioSink;
use crate::identity::VoiceRoomMapping;
use crate::transcriber::{TranscribeError, Transcriber};
use crate::tts::{SpeechSynthesizer, TtsError};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Transcription failed: {0}")]
    Transcription(#[from] TranscribeError),
    #[error("Agent failed: {0}")]
    Agent(#[from] AgentError),
    #[error("Speech synthesis failed: {0}")]
    Synthesis(#[from] TtsError),
}

/// How an utterance left the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Nothing intelligible was said
    NoSpeech,
    /// Text looked like a slash command
    Command,
    /// The agent had nothing to say
    NoReply,
    /// A reply was handed to playback
    Spoken,
}

pub struct UtterancePipeline {
    transcriber: Arc<dyn Transcriber>,
    agent: Arc<dyn AgentRuntime>,
    tts: Arc<dyn SpeechSynthesizer>,
    sink: Arc<dyn AudioSink>,
}

impl UtterancePipeline {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        agent: Arc<dyn AgentRuntime>,
        tts: Arc<dyn SpeechSynthesizer>,
        sink: Arc<dyn AudioSink>,
    ) -> Self {
        Self {
            transcriber,
            agent,
            tts,
            sink,
        }
    }

    /// Fire-and-forget processing of one utterance
    pub fn spawn_process(
        self: &Arc<Self>,
        raw: Vec<u8>,
        user_id: u64,
        user_name: String,
        channel_id: u64,
    ) -> JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline.process(&raw, user_id, &user_name, channel_id).await;
        })
    }

    /// Process one utterance, logging any failure
    pub async fn process(&self, raw: &[u8], user_id: u64, user_name: &str, channel_id: u64) {
        match self.run(raw, user_id, user_name, channel_id).await {
            Ok(outcome) => debug!("Utterance from {} handled: {:?}", user_id, outcome),
            Err(e) => error!("[{}] Error processing utterance from {}: {}", channel_id, user_id, e),
        }
    }

    pub async fn run(
        &self,
        raw: &[u8],
        user_id: u64,
        user_name: &str,
        channel_id: u64,
    ) -> Result<PipelineOutcome, PipelineError> {
        let text = self.transcriber.transcribe(raw).await?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(PipelineOutcome::NoSpeech);
        }
        if text.starts_with('/') {
            debug!("Ignoring command-like utterance from {}", user_id);
            return Ok(PipelineOutcome::Command);
        }
        info!("Heard {} ({}): {}", user_name, user_id, text);

        let agent_id = self.agent.agent_id();
        let ids = VoiceRoomMapping::new(agent_id, channel_id, user_id);
        let agent_name = self.agent.agent_name().to_string();

        self.agent.ensure_user_exists(agent_id, &agent_name, &agent_name).await?;
        self.agent.ensure_user_exists(ids.user_id, user_name, user_name).await?;
        self.agent.ensure_room_exists(ids.room_id).await?;
        self.agent.ensure_participant_in_room(ids.user_id, ids.room_id).await?;
        self.agent.ensure_participant_in_room(agent_id, ids.room_id).await?;

        let message = IncomingMessage {
            id: Uuid::new_v4(),
            user_id: ids.user_id,
            user_name: user_name.to_string(),
            agent_id,
            room_id: ids.room_id,
            content: MessageContent {
                text: text.to_string(),
                action: VOICE_ACTION.to_string(),
                source: VOICE_SOURCE.to_string(),
            },
        };

        let state = self.agent.compose_state(&message).await?;
        let response = self.agent.handle_message(&message, &state).await?;
        let Some(reply) = response.reply_text() else {
            return Ok(PipelineOutcome::NoReply);
        };

        let audio = self.tts.synthesize(reply).await?;
        if audio.is_empty() {
            return Ok(PipelineOutcome::NoReply);
        }
        self.sink.play(user_id, audio).await;

        Ok(PipelineOutcome::Spoken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentResponse, State};
    use crate::tts::{AudioContainer, SpeechAudio};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct FixedTranscriber(Result<String, ()>);

    #[async_trait]
    impl Transcriber for FixedTranscriber {
        async fn transcribe(&self, _audio: &[u8]) -> Result<String, TranscribeError> {
            match &self.0 {
                Ok(text) => Ok(text.clone()),
                Err(()) => Err(TranscribeError::Gemini(crate::gemini::GeminiError::RateLimitExceeded)),
            }
        }
    }

    #[derive(Default)]
    struct ScriptedAgent {
        response: AgentResponse,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AgentRuntime for ScriptedAgent {
        fn agent_id(&self) -> Uuid {
            crate::identity::agent_id("Echo")
        }

        fn agent_name(&self) -> &str {
            "Echo"
        }

        async fn ensure_user_exists(&self, _id: Uuid, name: &str, _username: &str) -> Result<(), AgentError> {
            self.calls.lock().push(format!("user:{}", name));
            Ok(())
        }

        async fn ensure_room_exists(&self, _id: Uuid) -> Result<(), AgentError> {
            self.calls.lock().push("room".to_string());
            Ok(())
        }

        async fn ensure_participant_in_room(&self, user_id: Uuid, _room_id: Uuid) -> Result<(), AgentError> {
            let who = if user_id == self.agent_id() { "agent" } else { "user" };
            self.calls.lock().push(format!("participant:{}", who));
            Ok(())
        }

        async fn compose_state(&self, message: &IncomingMessage) -> Result<State, AgentError> {
            self.calls.lock().push("compose".to_string());
            Ok(State {
                text: message.content.text.clone(),
                action: message.content.action.clone(),
                source: message.content.source.clone(),
                ..Default::default()
            })
        }

        async fn handle_message(&self, message: &IncomingMessage, state: &State) -> Result<AgentResponse, AgentError> {
            assert_eq!(state.action, "NONE");
            assert_eq!(state.source, "discord");
            self.calls.lock().push(format!("handle:{}", message.content.text));
            Ok(self.response.clone())
        }
    }

    #[derive(Default)]
    struct RecordingTts {
        spoken: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SpeechSynthesizer for RecordingTts {
        async fn synthesize(&self, text: &str) -> Result<SpeechAudio, TtsError> {
            self.spoken.lock().push(text.to_string());
            Ok(SpeechAudio {
                data: vec![0u8; 16],
                container: AudioContainer::Wav,
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        played: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl AudioSink for RecordingSink {
        async fn play(&self, user_id: u64, _audio: SpeechAudio) {
            self.played.lock().push(user_id);
        }
    }

    struct Harness {
        agent: Arc<ScriptedAgent>,
        tts: Arc<RecordingTts>,
        sink: Arc<RecordingSink>,
        pipeline: Arc<UtterancePipeline>,
    }

    fn harness(transcript: Result<String, ()>, response: AgentResponse) -> Harness {
        let agent = Arc::new(ScriptedAgent {
            response,
            ..Default::default()
        });
        let tts = Arc::new(RecordingTts::default());
        let sink = Arc::new(RecordingSink::default());
        let pipeline = Arc::new(UtterancePipeline::new(
            Arc::new(FixedTranscriber(transcript)),
            agent.clone(),
            tts.clone(),
            sink.clone(),
        ));
        Harness {
            agent,
            tts,
            sink,
            pipeline,
        }
    }

    #[tokio::test]
    async fn test_content_only_reply_is_spoken_verbatim() {
        let h = harness(
            Ok("what time is it".to_string()),
            AgentResponse {
                content: Some("It is noon.".to_string()),
                ..Default::default()
            },
        );

        let outcome = h.pipeline.run(&[0u8; 4], 7, "Alice", 100).await.unwrap();

        assert_eq!(outcome, PipelineOutcome::Spoken);
        assert_eq!(*h.tts.spoken.lock(), vec!["It is noon."]);
        assert_eq!(*h.sink.played.lock(), vec![7u64]);
        assert_eq!(
            *h.agent.calls.lock(),
            vec![
                "user:Echo",
                "user:Alice",
                "room",
                "participant:user",
                "participant:agent",
                "compose",
                "handle:what time is it",
            ]
        );
    }

    #[tokio::test]
    async fn test_slash_text_has_no_side_effects() {
        let h = harness(
            Ok("/help".to_string()),
            AgentResponse {
                text: Some("unused".to_string()),
                ..Default::default()
            },
        );

        let outcome = h.pipeline.run(&[0u8; 4], 7, "Alice", 100).await.unwrap();

        assert_eq!(outcome, PipelineOutcome::Command);
        assert!(h.agent.calls.lock().is_empty());
        assert!(h.tts.spoken.lock().is_empty());
        assert!(h.sink.played.lock().is_empty());
    }

    #[tokio::test]
    async fn test_empty_transcript_stops_early() {
        let h = harness(Ok("   ".to_string()), AgentResponse::default());

        let outcome = h.pipeline.run(&[0u8; 4], 7, "Alice", 100).await.unwrap();

        assert_eq!(outcome, PipelineOutcome::NoSpeech);
        assert!(h.agent.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_reply_without_text_is_not_synthesized() {
        let h = harness(Ok("hello".to_string()), AgentResponse::default());

        let outcome = h.pipeline.run(&[0u8; 4], 7, "Alice", 100).await.unwrap();

        assert_eq!(outcome, PipelineOutcome::NoReply);
        assert!(h.tts.spoken.lock().is_empty());
        assert!(h.sink.played.lock().is_empty());
    }

    #[tokio::test]
    async fn test_spawned_failure_is_swallowed() {
        let h = harness(Err(()), AgentResponse::default());

        h.pipeline
            .spawn_process(vec![0u8; 4], 7, "Alice".to_string(), 100)
            .await
            .unwrap();

        assert!(h.agent.calls.lock().is_empty());
        assert!(h.sink.played.lock().is_empty());
    }
}
