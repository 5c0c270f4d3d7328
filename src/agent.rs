//! Conversational agent backed by Gemini and the SQLite store
//!
//! Owns the accounts/rooms/participants bookkeeping and produces replies
//! for transcribed voice messages.

use crate::database::{Database, DatabaseError, Memory};
use crate::gemini::{GeminiClient, GeminiError, GenerationConfig, PartRequest};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Action tag attached to voice messages
pub const VOICE_ACTION: &str = "NONE";
/// Source tag attached to voice messages
pub const VOICE_SOURCE: &str = "discord";

/// Memories pulled into each composed state
const HISTORY_LIMIT: usize = 20;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("Gemini error: {0}")]
    Gemini(#[from] GeminiError),
}

/// Body of a message sent to the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContent {
    pub text: String,
    pub action: String,
    pub source: String,
}

/// A transcribed utterance addressed to the agent
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub id: Uuid,
    pub user_id: Uuid,
    pub user_name: String,
    pub agent_id: Uuid,
    pub room_id: Uuid,
    pub content: MessageContent,
}

/// Conversation context composed for one message
#[derive(Debug, Clone, Default)]
pub struct State {
    pub agent_name: String,
    pub sender_name: String,
    pub room_id: Uuid,
    /// "Name: text" lines, oldest first
    pub recent_messages: Vec<String>,
    pub text: String,
    pub action: String,
    pub source: String,
}

/// Agent reply payload. The reply text may arrive in any of the three
/// text fields depending on the responder.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentResponse {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
}

impl AgentResponse {
    /// First non-empty of `text`, `content`, `message`
    pub fn reply_text(&self) -> Option<&str> {
        [&self.text, &self.content, &self.message]
            .into_iter()
            .filter_map(|field| field.as_deref())
            .map(str::trim)
            .find(|text| !text.is_empty())
    }
}

/// Agent and message-routing collaborator used by the utterance pipeline
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    fn agent_id(&self) -> Uuid;

    fn agent_name(&self) -> &str;

    async fn ensure_user_exists(&self, id: Uuid, name: &str, username: &str) -> Result<(), AgentError>;

    async fn ensure_room_exists(&self, id: Uuid) -> Result<(), AgentError>;

    async fn ensure_participant_in_room(&self, user_id: Uuid, room_id: Uuid) -> Result<(), AgentError>;

    async fn compose_state(&self, message: &IncomingMessage) -> Result<State, AgentError>;

    async fn handle_message(&self, message: &IncomingMessage, state: &State) -> Result<AgentResponse, AgentError>;
}

/// Gemini-backed agent
pub struct GeminiAgent {
    gemini: Arc<GeminiClient>,
    db: Arc<Database>,
    agent_id: Uuid,
    agent_name: String,
}

impl GeminiAgent {
    pub fn new(gemini: Arc<GeminiClient>, db: Arc<Database>, agent_name: String) -> Self {
        Self {
            gemini,
            db,
            agent_id: crate::identity::agent_id(&agent_name),
            agent_name,
        }
    }

    fn system_prompt(&self) -> String {
        format!(
            "You are {name}, taking part in a Discord voice chat. Your replies are spoken aloud, \
             so keep them short and conversational and never use markdown, lists or emoji. \
             Answer with a JSON object of the form {{\"text\": \"<what {name} says>\"}}. \
             Use an empty text if nothing needs to be said.",
            name = self.agent_name
        )
    }

    fn remember(&self, room_id: Uuid, user_id: Uuid, text: &str) -> Result<(), AgentError> {
        self.db.add_memory(&Memory {
            id: Uuid::new_v4(),
            room_id,
            user_id,
            text: text.to_string(),
            created_at: Utc::now().timestamp_millis(),
        })?;
        Ok(())
    }
}

#[async_trait]
impl AgentRuntime for GeminiAgent {
    fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    fn agent_name(&self) -> &str {
        &self.agent_name
    }

    async fn ensure_user_exists(&self, id: Uuid, name: &str, username: &str) -> Result<(), AgentError> {
        self.db.ensure_account(id, name, username)?;
        Ok(())
    }

    async fn ensure_room_exists(&self, id: Uuid) -> Result<(), AgentError> {
        self.db.ensure_room(id)?;
        Ok(())
    }

    async fn ensure_participant_in_room(&self, user_id: Uuid, room_id: Uuid) -> Result<(), AgentError> {
        self.db.ensure_participant(user_id, room_id)?;
        Ok(())
    }

    async fn compose_state(&self, message: &IncomingMessage) -> Result<State, AgentError> {
        let memories = self.db.recent_memories(message.room_id, HISTORY_LIMIT)?;

        let mut recent_messages = Vec::with_capacity(memories.len());
        for memory in memories {
            let speaker = if memory.user_id == self.agent_id {
                self.agent_name.clone()
            } else {
                self.db
                    .account_name(memory.user_id)?
                    .unwrap_or_else(|| "Unknown".to_string())
            };
            recent_messages.push(format!("{}: {}", speaker, memory.text));
        }

        let participants = self.db.participant_count(message.room_id)?;
        debug!(
            "[{}] Composed state: {} participant(s), {} message(s) of history",
            message.room_id,
            participants,
            recent_messages.len()
        );

        Ok(State {
            agent_name: self.agent_name.clone(),
            sender_name: message.user_name.clone(),
            room_id: message.room_id,
            recent_messages,
            text: message.content.text.clone(),
            action: message.content.action.clone(),
            source: message.content.source.clone(),
        })
    }

    async fn handle_message(&self, message: &IncomingMessage, state: &State) -> Result<AgentResponse, AgentError> {
        self.remember(message.room_id, message.user_id, &message.content.text)?;

        let mut parts = Vec::new();
        if !state.recent_messages.is_empty() {
            parts.push(PartRequest::text(format!(
                "Conversation so far:\n{}\n---",
                state.recent_messages.join("\n")
            )));
        }
        parts.push(PartRequest::text(format!("{}: {}", state.sender_name, state.text)));

        let raw = self
            .gemini
            .generate(
                Some(&self.system_prompt()),
                parts,
                Some(GenerationConfig {
                    response_mime_type: Some("application/json".to_string()),
                    temperature: Some(0.7),
                }),
            )
            .await?;

        let response = parse_response(&raw);
        if let Some(reply) = response.reply_text() {
            self.remember(message.room_id, self.agent_id, reply)?;
            info!("[{}] Agent replied ({} chars)", message.room_id, reply.len());
        } else {
            debug!("[{}] Agent chose not to reply", message.room_id);
        }

        Ok(response)
    }
}

/// Read a JSON reply payload, treating anything else as plain content
fn parse_response(raw: &str) -> AgentResponse {
    let trimmed = raw.trim();
    match serde_json::from_str::<AgentResponse>(trimmed) {
        Ok(response) => response,
        Err(_) => AgentResponse {
            content: Some(trimmed.to_string()),
            ..Default::default()
        },
    }
}
