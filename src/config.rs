//! Configuration management for VoiceAgentBot
//!
//! Loads settings from environment variables (.env file)

use std::env;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Discord bot token
    pub discord_token: String,
    /// Gemini API key (transcription and replies)
    pub gemini_api_key: String,
    /// Optional guild ID for development (faster command sync)
    pub guild_id: Option<u64>,
    /// Name the agent answers to
    pub agent_name: String,
    /// ElevenLabs API key; local Piper synthesis is used when absent
    pub elevenlabs_api_key: Option<String>,
    /// ElevenLabs voice
    pub elevenlabs_voice_id: String,
    /// ElevenLabs model
    pub elevenlabs_model: String,
    /// Piper executable
    pub piper_path: PathBuf,
    /// Piper voice model (.onnx)
    pub piper_model_path: PathBuf,
    /// Scratch directory for synthesized audio
    pub temp_audio_dir: PathBuf,
    /// SQLite database file
    pub database_path: PathBuf,
    /// Join the busiest voice channel when a guild becomes available
    pub auto_join: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let discord_token = env::var("DISCORD_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("DISCORD_TOKEN".to_string()))?;

        let gemini_api_key = env::var("GEMINI_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("GEMINI_API_KEY".to_string()))?;

        let guild_id = env::var("GUILD_ID")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<u64>()
                    .map_err(|_| ConfigError::InvalidValue("GUILD_ID".to_string(), s))
            })
            .transpose()?;

        let agent_name = env::var("AGENT_NAME")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "Agent".to_string());

        let elevenlabs_api_key = env::var("ELEVENLABS_API_KEY")
            .ok()
            .filter(|s| !s.is_empty());

        let elevenlabs_voice_id = env::var("ELEVENLABS_VOICE_ID")
            .unwrap_or_else(|_| voices::ELEVENLABS_RACHEL.to_string());

        let elevenlabs_model = env::var("ELEVENLABS_MODEL")
            .unwrap_or_else(|_| models::ELEVENLABS_TURBO.to_string());

        let piper_path = env::var("PIPER_PATH")
            .unwrap_or_else(|_| "piper".to_string())
            .into();

        let piper_model_path = env::var("PIPER_MODEL_PATH")
            .unwrap_or_else(|_| "models/en_US-lessac-medium.onnx".to_string())
            .into();

        let temp_audio_dir = env::var("TEMP_AUDIO_DIR")
            .unwrap_or_else(|_| "temp_audio".to_string())
            .into();

        let database_path = env::var("DATABASE_PATH")
            .unwrap_or_else(|_| "voice_agent.db".to_string())
            .into();

        let auto_join = env::var("AUTO_JOIN")
            .ok()
            .map(|s| parse_flag("AUTO_JOIN", &s))
            .transpose()?
            .unwrap_or(true);

        Ok(Self {
            discord_token,
            gemini_api_key,
            guild_id,
            agent_name,
            elevenlabs_api_key,
            elevenlabs_voice_id,
            elevenlabs_model,
            piper_path,
            piper_model_path,
            temp_audio_dir,
            database_path,
            auto_join,
        })
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue(name.to_string(), value.to_string())),
    }
}

/// Model identifiers
pub mod models {
    pub const GEMINI_FLASH: &str = "gemini-2.0-flash";
    pub const ELEVENLABS_TURBO: &str = "eleven_turbo_v2_5";
}

/// Default voices
pub mod voices {
    pub const ELEVENLABS_RACHEL: &str = "21m00Tcm4TlvDq8ikWAM";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("AUTO_JOIN", "true").unwrap());
        assert!(parse_flag("AUTO_JOIN", " ON ").unwrap());
        assert!(!parse_flag("AUTO_JOIN", "0").unwrap());
        assert!(matches!(
            parse_flag("AUTO_JOIN", "maybe"),
            Err(ConfigError::InvalidValue(name, _)) if name == "AUTO_JOIN"
        ));
    }
}
