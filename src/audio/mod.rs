//! Audio module for voice receive, segmentation and playback
//!
//! Decoded PCM flows receiver -> registry -> monitor; replies go out via playback

pub mod monitor;
pub mod playback;
pub mod processor;
pub mod receiver;
pub mod registry;
