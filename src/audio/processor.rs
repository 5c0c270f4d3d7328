//! Audio format helpers
//!
//! Converts between Discord's decoded PCM and the WAV containers the
//! transcription and synthesis backends exchange.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Discord decodes voice to 48kHz interleaved stereo
pub const DISCORD_SAMPLE_RATE: u32 = 48_000;
pub const DISCORD_CHANNELS: u16 = 2;

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

/// Audio processor for format operations
pub struct AudioProcessor;

impl AudioProcessor {
    /// Flatten decoded samples into little-endian bytes
    pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }

    /// Wrap 16-bit little-endian PCM in a WAV container.
    ///
    /// A trailing odd byte is ignored.
    pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32, channels: u16) -> Result<Vec<u8>, ProcessorError> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::with_capacity(44 + pcm.len()));
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
            for pair in pcm.chunks_exact(2) {
                writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
            }
            writer.finalize()?;
        }
        Ok(cursor.into_inner())
    }

    /// Write a mono float waveform to a WAV file
    pub fn write_float_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<(), ProcessorError> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };

        let mut writer = hound::WavWriter::create(path, spec)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
        debug!("Wrote {} samples to {:?}", samples.len(), path);
        Ok(())
    }

    /// Playback length of 16-bit PCM in milliseconds
    pub fn pcm_duration_ms(len: usize, sample_rate: u32, channels: u16) -> u64 {
        let bytes_per_second = sample_rate as u64 * channels as u64 * 2;
        if bytes_per_second == 0 {
            return 0;
        }
        len as u64 * 1000 / bytes_per_second
    }

    /// Clean up temporary audio files
    pub fn cleanup_files(paths: &[PathBuf]) {
        for path in paths {
            if path.exists() {
                match fs::remove_file(path) {
                    Ok(_) => debug!("Removed temp file: {:?}", path),
                    Err(e) => warn!("Failed to remove {:?}: {}", path, e),
                }
            }
        }
    }
}
