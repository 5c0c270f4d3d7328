//! Slash commands

pub mod voice;
