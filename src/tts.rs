//! Text-to-speech backend selection
//!
//! ElevenLabs when an API key is configured, otherwise a local Piper voice
//! loaded once per process.

use crate::audio::processor::{AudioProcessor, ProcessorError};
use crate::config::Config;
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};
use uuid::Uuid;

const ELEVENLABS_API_BASE: &str = "https://api.elevenlabs.io/v1";
const ELEVENLABS_OUTPUT_FORMAT: &str = "mp3_44100_128";

/// Sample rate of the local engine's waveform
pub const LOCAL_SAMPLE_RATE: u32 = 22_050;

#[derive(Error, Debug)]
pub enum TtsError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {0}")]
    Api(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Audio error: {0}")]
    Audio(#[from] ProcessorError),
    #[error("Speech engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("Speech engine failed: {0}")]
    Engine(String),
    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Container of a synthesized clip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioContainer {
    Mp3,
    Wav,
}

impl AudioContainer {
    pub fn extension(&self) -> &'static str {
        match self {
            AudioContainer::Mp3 => "mp3",
            AudioContainer::Wav => "wav",
        }
    }
}

/// Encoded speech ready for playback
#[derive(Debug, Clone)]
pub struct SpeechAudio {
    pub data: Vec<u8>,
    pub container: AudioContainer,
}

impl SpeechAudio {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<SpeechAudio, TtsError>;
}

/// A neural voice producing a mono float waveform
#[async_trait]
pub trait LocalSpeechEngine: Send + Sync {
    fn sample_rate(&self) -> u32 {
        LOCAL_SAMPLE_RATE
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<f32>, TtsError>;
}

/// ElevenLabs TTS request
#[derive(Debug, Serialize)]
struct ElevenLabsRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

#[derive(Debug, Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: 0.5,
            similarity_boost: 0.75,
        }
    }
}

/// Premium remote synthesis
pub struct ElevenLabsClient {
    client: reqwest::Client,
    api_key: String,
    voice_id: String,
    model: String,
}

impl ElevenLabsClient {
    pub fn new(api_key: String, voice_id: String, model: String) -> Result<Self, TtsError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            api_key,
            voice_id,
            model,
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsClient {
    async fn synthesize(&self, text: &str) -> Result<SpeechAudio, TtsError> {
        let url = format!(
            "{}/text-to-speech/{}?output_format={}",
            ELEVENLABS_API_BASE, self.voice_id, ELEVENLABS_OUTPUT_FORMAT
        );

        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
            voice_settings: VoiceSettings::default(),
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("ElevenLabs TTS failed: {} - {}", status, body);
            return Err(TtsError::Api(format!("ElevenLabs TTS failed: {}", status)));
        }

        let data = response.bytes().await?.to_vec();
        debug!("ElevenLabs returned {} bytes", data.len());

        Ok(SpeechAudio {
            data,
            container: AudioContainer::Mp3,
        })
    }
}

/// Piper voice run through its command-line binary
pub struct PiperEngine {
    piper_path: PathBuf,
    model_path: PathBuf,
}

impl PiperEngine {
    /// Load a voice model
    pub fn create(piper_path: impl Into<PathBuf>, model_path: impl Into<PathBuf>) -> Result<Self, TtsError> {
        let model_path = model_path.into();
        if !model_path.exists() {
            return Err(TtsError::EngineUnavailable(format!(
                "Piper model not found: {}",
                model_path.display()
            )));
        }

        Ok(Self {
            piper_path: piper_path.into(),
            model_path,
        })
    }
}

#[async_trait]
impl LocalSpeechEngine for PiperEngine {
    async fn synthesize(&self, text: &str) -> Result<Vec<f32>, TtsError> {
        let mut child = Command::new(&self.piper_path)
            .arg("--model")
            .arg(&self.model_path)
            .arg("--output-raw")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TtsError::EngineUnavailable(format!("Failed to start Piper: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TtsError::Engine(format!("Piper error: {}", stderr.trim())));
        }

        Ok(pcm16_to_f32(&output.stdout))
    }
}

/// Scale 16-bit little-endian PCM into [-1.0, 1.0)
pub fn pcm16_to_f32(pcm: &[u8]) -> Vec<f32> {
    pcm.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

/// Result of loading the local engine
pub type EngineLoad = Result<Arc<dyn LocalSpeechEngine>, TtsError>;

/// Builds the local engine on first use
pub type EngineLoader = Box<dyn Fn() -> EngineLoad + Send + Sync>;

/// Chooses between the premium backend and the lazily loaded local voice
pub struct SpeechService {
    premium: Option<Arc<dyn SpeechSynthesizer>>,
    local: OnceCell<Arc<dyn LocalSpeechEngine>>,
    loader: EngineLoader,
    scratch_dir: PathBuf,
}

impl SpeechService {
    pub fn new(premium: Option<Arc<dyn SpeechSynthesizer>>, loader: EngineLoader, scratch_dir: PathBuf) -> Self {
        Self {
            premium,
            local: OnceCell::new(),
            loader,
            scratch_dir,
        }
    }

    /// Wire the backends named in the configuration
    pub fn from_config(config: &Config) -> Result<Self, TtsError> {
        let premium = match &config.elevenlabs_api_key {
            Some(key) => {
                info!("Using ElevenLabs speech synthesis");
                let client = ElevenLabsClient::new(
                    key.clone(),
                    config.elevenlabs_voice_id.clone(),
                    config.elevenlabs_model.clone(),
                )?;
                Some(Arc::new(client) as Arc<dyn SpeechSynthesizer>)
            }
            None => {
                info!("No ElevenLabs key, using local Piper voice");
                None
            }
        };

        let piper_path = config.piper_path.clone();
        let model_path = config.piper_model_path.clone();
        let loader: EngineLoader = Box::new(move || -> EngineLoad {
            let engine = PiperEngine::create(piper_path.clone(), model_path.clone())?;
            Ok(Arc::new(engine) as Arc<dyn LocalSpeechEngine>)
        });

        Ok(Self::new(premium, loader, config.temp_audio_dir.clone()))
    }

    /// Use an already built local engine
    pub fn with_local_engine(engine: Arc<dyn LocalSpeechEngine>, scratch_dir: PathBuf) -> Self {
        let service = Self::new(
            None,
            Box::new(|| -> EngineLoad {
                Err(TtsError::EngineUnavailable(
                    "local engine was injected".to_string(),
                ))
            }),
            scratch_dir,
        );
        // Fresh cell, cannot already be set
        let _ = service.local.set(engine);
        service
    }

    async fn local_engine(&self) -> Result<Arc<dyn LocalSpeechEngine>, TtsError> {
        let engine = self
            .local
            .get_or_try_init(|| async {
                info!("Loading local speech engine");
                (self.loader)()
            })
            .await?;
        Ok(engine.clone())
    }

    async fn synthesize_local(&self, text: &str) -> Result<SpeechAudio, TtsError> {
        let engine = self.local_engine().await?;
        let samples = engine.synthesize(text).await?;
        if samples.is_empty() {
            return Err(TtsError::Engine("engine produced no audio".to_string()));
        }

        let path = self.scratch_dir.join(format!("tts_{}.wav", Uuid::new_v4()));
        let sample_rate = engine.sample_rate();
        let write_path = path.clone();
        tokio::task::spawn_blocking(move || AudioProcessor::write_float_wav(&write_path, &samples, sample_rate))
            .await??;

        let data = read_scratch(&path).await;
        AudioProcessor::cleanup_files(&[path]);

        Ok(SpeechAudio {
            data: data?,
            container: AudioContainer::Wav,
        })
    }
}

async fn read_scratch(path: &Path) -> Result<Vec<u8>, TtsError> {
    Ok(tokio::fs::read(path).await?)
}

#[async_trait]
impl SpeechSynthesizer for SpeechService {
    async fn synthesize(&self, text: &str) -> Result<SpeechAudio, TtsError> {
        match &self.premium {
            Some(premium) => premium.synthesize(text).await,
            None => self.synthesize_local(text).await,
        }
    }
}
