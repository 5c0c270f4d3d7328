//! Deterministic ids for agent conversation state
//!
//! Discord snowflakes are mapped onto UUIDs so the same channel and user
//! always land in the same room and account.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Hash a string into a stable v4-shaped UUID
pub fn string_to_uuid(input: &str) -> Uuid {
    let hash = Sha256::digest(input.as_bytes());

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[0..16]);

    // Version 4 / RFC4122 variant bits
    bytes[6] = (bytes[6] & 0x0F) | 0x40;
    bytes[8] = (bytes[8] & 0x3F) | 0x80;

    Uuid::from_bytes(bytes)
}

/// Ids correlating one voice conversation across agent calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceRoomMapping {
    pub agent_id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
}

impl VoiceRoomMapping {
    pub fn new(agent_id: Uuid, channel_id: u64, user_id: u64) -> Self {
        Self {
            agent_id,
            room_id: room_id(channel_id, agent_id),
            user_id: user_uuid(user_id),
        }
    }
}

pub fn agent_id(agent_name: &str) -> Uuid {
    string_to_uuid(agent_name)
}

/// Rooms are per channel and per agent
pub fn room_id(channel_id: u64, agent_id: Uuid) -> Uuid {
    string_to_uuid(&format!("{}-{}", channel_id, agent_id))
}

pub fn user_uuid(user_id: u64) -> Uuid {
    string_to_uuid(&user_id.to_string())
}
