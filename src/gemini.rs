//! Gemini REST client
//!
//! Shared by transcription (inline audio) and agent replies (text)

use crate::config::models;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Error, Debug)]
pub enum GeminiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {0}")]
    Api(String),
    #[error("Rate limit exceeded")]
    RateLimitExceeded,
}

/// Response from Gemini content generation
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

/// Request body for content generation
#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<ContentRequest>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<ContentRequest>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
struct ContentRequest {
    role: String,
    parts: Vec<PartRequest>,
}

/// One piece of a prompt
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum PartRequest {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

impl PartRequest {
    pub fn text(text: impl Into<String>) -> Self {
        PartRequest::Text { text: text.into() }
    }

    /// Base64 payload with its MIME type
    pub fn inline(mime_type: &str, data: String) -> Self {
        PartRequest::InlineData {
            inline_data: InlineData {
                mime_type: mime_type.to_string(),
                data,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationConfig {
    #[serde(rename = "responseMimeType", skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Gemini API client
pub struct GeminiClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl GeminiClient {
    /// Create a new client with the given API key
    pub fn new(api_key: String) -> Result<Self, GeminiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model: models::GEMINI_FLASH.to_string(),
        })
    }

    /// Run one generateContent call and return the first text part
    pub async fn generate(
        &self,
        system: Option<&str>,
        parts: Vec<PartRequest>,
        generation_config: Option<GenerationConfig>,
    ) -> Result<String, GeminiError> {
        let request = GenerateRequest {
            contents: vec![ContentRequest {
                role: "user".to_string(),
                parts,
            }],
            system_instruction: system.map(|s| ContentRequest {
                role: "system".to_string(),
                parts: vec![PartRequest::text(s)],
            }),
            generation_config,
        };

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            GEMINI_API_BASE, self.model, self.api_key
        );

        let response = self.client.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();

            if status.as_u16() == 429 || text.contains("Quota exceeded") {
                return Err(GeminiError::RateLimitExceeded);
            }

            error!("Generation failed: {} - {}", status, text);
            return Err(GeminiError::Api(format!("Generation failed: {}", status)));
        }

        let gen_response: GenerateResponse = response.json().await?;
        extract_text(gen_response)
    }
}

fn extract_text(response: GenerateResponse) -> Result<String, GeminiError> {
    if let Some(error) = response.error {
        return Err(GeminiError::Api(error.message));
    }

    let text = response
        .candidates
        .and_then(|c| c.into_iter().next())
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    debug!("Gemini returned {} chars", text.len());
    Ok(text)
}
