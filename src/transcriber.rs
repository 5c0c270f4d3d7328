//! Speech-to-text for finalized utterances

use crate::audio::processor::{AudioProcessor, ProcessorError, DISCORD_CHANNELS, DISCORD_SAMPLE_RATE};
use crate::gemini::{GeminiClient, GeminiError, PartRequest};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Utterances shorter than this are not worth a request
const MIN_SPEECH_MS: u64 = 200;

const TRANSCRIBE_PROMPT: &str = "Transcribe the speech in this audio clip verbatim. \
Reply with the spoken words only. If there is no intelligible speech, reply with nothing.";

#[derive(Error, Debug)]
pub enum TranscribeError {
    #[error("Gemini error: {0}")]
    Gemini(#[from] GeminiError),
    #[error("Audio error: {0}")]
    Audio(#[from] ProcessorError),
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Turn raw decoded PCM into text. Empty text means no speech.
    async fn transcribe(&self, audio: &[u8]) -> Result<String, TranscribeError>;
}

/// Sends utterances to Gemini as inline WAV
pub struct GeminiTranscriber {
    gemini: Arc<GeminiClient>,
}

impl GeminiTranscriber {
    pub fn new(gemini: Arc<GeminiClient>) -> Self {
        Self { gemini }
    }
}

#[async_trait]
impl Transcriber for GeminiTranscriber {
    async fn transcribe(&self, audio: &[u8]) -> Result<String, TranscribeError> {
        let duration_ms = AudioProcessor::pcm_duration_ms(audio.len(), DISCORD_SAMPLE_RATE, DISCORD_CHANNELS);
        if duration_ms < MIN_SPEECH_MS {
            debug!("Utterance too short to transcribe ({}ms)", duration_ms);
            return Ok(String::new());
        }

        let wav = AudioProcessor::pcm_to_wav(audio, DISCORD_SAMPLE_RATE, DISCORD_CHANNELS)?;
        let parts = vec![
            PartRequest::text(TRANSCRIBE_PROMPT),
            PartRequest::inline("audio/wav", STANDARD.encode(&wav)),
        ];

        let text = self.gemini.generate(None, parts, None).await?;
        let text = clean_transcript(&text);
        debug!("Transcribed {}ms of audio into {} chars", duration_ms, text.len());
        Ok(text)
    }
}

/// Normalize whitespace; a lone silence marker counts as no speech
fn clean_transcript(raw: &str) -> String {
    let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let lowered = text.to_lowercase();
    if matches!(lowered.as_str(), "[silence]" | "(silence)" | "[no speech]" | "[inaudible]") {
        return String::new();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_transcript() {
        assert_eq!(clean_transcript("  hello \n world "), "hello world");
        assert_eq!(clean_transcript("[Silence]"), "");
        assert_eq!(clean_transcript(""), "");
    }

    #[tokio::test]
    async fn test_short_audio_skips_request() {
        let gemini = Arc::new(GeminiClient::new("test-key".to_string()).unwrap());
        let transcriber = GeminiTranscriber::new(gemini);

        // 10ms of Discord audio
        let text = transcriber.transcribe(&vec![0u8; 1_920]).await.unwrap();
        assert!(text.is_empty());
    }
}
