//! Silence-segmented utterance monitor
//!
//! Buffers one speaker's decoded audio and cuts it into utterances on
//! silence gaps or size caps.

use crate::audio::registry::SpeakerStream;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info};

/// Silence after which buffered audio counts as a finished utterance
pub const SILENCE_GAP_MS: u64 = 500;
/// Buffered bytes that force a flush even while the speaker keeps talking
pub const MAX_UTTERANCE_BYTES: usize = 1_000_000;
/// Bytes a single watched stream may deliver before the monitor stops
pub const HARD_CAP_BYTES: usize = 10_000_000;

/// Flush thresholds for a monitor
#[derive(Debug, Clone, Copy)]
pub struct MonitorLimits {
    pub silence_gap: Duration,
    pub max_utterance_bytes: usize,
    pub hard_cap_bytes: usize,
}

impl Default for MonitorLimits {
    fn default() -> Self {
        Self {
            silence_gap: Duration::from_millis(SILENCE_GAP_MS),
            max_utterance_bytes: MAX_UTTERANCE_BYTES,
            hard_cap_bytes: HARD_CAP_BYTES,
        }
    }
}

/// Chunks buffered since the last flush
#[derive(Debug, Default)]
struct UtteranceAccumulator {
    chunks: Vec<Vec<u8>>,
    total_len: usize,
    last_chunk_at: Option<Instant>,
}

impl UtteranceAccumulator {
    /// Append a chunk, returning the gap since the previous one
    fn push(&mut self, chunk: Vec<u8>, now: Instant) -> Duration {
        let gap = self
            .last_chunk_at
            .map(|last| now.saturating_duration_since(last))
            .unwrap_or_default();
        self.last_chunk_at = Some(now);
        self.total_len += chunk.len();
        self.chunks.push(chunk);
        gap
    }

    /// Concatenate and clear. Empty buffers yield nothing.
    fn take(&mut self) -> Option<Vec<u8>> {
        let total_len = std::mem::take(&mut self.total_len);
        let chunks = std::mem::take(&mut self.chunks);
        if total_len == 0 {
            return None;
        }

        let mut utterance = Vec::with_capacity(total_len);
        for chunk in chunks {
            utterance.extend_from_slice(&chunk);
        }
        Some(utterance)
    }
}

/// Per-stream buffering state machine.
///
/// Not reentrant: one monitor serves exactly one speaker's stream, and its
/// chunks must be fed in arrival order.
#[derive(Debug)]
pub struct UtteranceMonitor {
    limits: MonitorLimits,
    acc: UtteranceAccumulator,
    watched_bytes: usize,
    finished: bool,
}

impl UtteranceMonitor {
    pub fn new(limits: MonitorLimits) -> Self {
        Self {
            limits,
            acc: UtteranceAccumulator::default(),
            watched_bytes: 0,
            finished: false,
        }
    }

    /// Feed a chunk received now
    pub fn observe(&mut self, chunk: Vec<u8>) -> Option<Vec<u8>> {
        self.observe_at(chunk, Instant::now())
    }

    /// Feed a chunk received at `now`.
    ///
    /// The chunk is always part of the buffer before the flush check, so a
    /// flush returns everything since the previous flush including it.
    pub fn observe_at(&mut self, chunk: Vec<u8>, now: Instant) -> Option<Vec<u8>> {
        if self.finished {
            return None;
        }

        self.watched_bytes += chunk.len();
        let had_buffered = self.acc.total_len > 0;
        let gap = self.acc.push(chunk, now);

        if self.watched_bytes >= self.limits.hard_cap_bytes {
            info!("Stream hit hard cap after {} bytes, finalizing", self.watched_bytes);
            self.finished = true;
            return self.acc.take();
        }

        // A gap only ends an utterance that was already under way
        let silence_cut = had_buffered && gap > self.limits.silence_gap;
        if silence_cut || self.acc.total_len >= self.limits.max_utterance_bytes {
            debug!(
                "Flushing utterance: {} bytes, gap {}ms",
                self.acc.total_len,
                gap.as_millis()
            );
            return self.acc.take();
        }

        None
    }

    /// Flush if the stream has been silent longer than the gap
    pub fn poll_silence(&mut self, now: Instant) -> Option<Vec<u8>> {
        let last = self.acc.last_chunk_at?;
        if now.saturating_duration_since(last) > self.limits.silence_gap {
            self.acc.take()
        } else {
            None
        }
    }

    /// When a silence flush becomes due, if anything is buffered
    pub fn silence_deadline(&self) -> Option<Instant> {
        if self.acc.total_len == 0 {
            return None;
        }
        // Strictly greater than the gap
        self.acc
            .last_chunk_at
            .map(|last| last + self.limits.silence_gap + Duration::from_millis(1))
    }

    /// Flush whatever is buffered regardless of timing
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        self.finished = true;
        self.acc.take()
    }

    /// True once the hard cap was reached or the stream was finished
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn buffered_bytes(&self) -> usize {
        self.acc.total_len
    }
}

/// Drive a monitor over a chunk stream until it closes or hits the hard cap.
///
/// Every finalized utterance is handed to `on_utterance` as soon as it is cut.
pub async fn watch<F>(mut stream: SpeakerStream, limits: MonitorLimits, mut on_utterance: F)
where
    F: FnMut(Vec<u8>),
{
    let mut monitor = UtteranceMonitor::new(limits);

    loop {
        let deadline = monitor.silence_deadline();

        tokio::select! {
            biased;

            _ = sleep_until_deadline(deadline), if deadline.is_some() => {
                if let Some(utterance) = monitor.poll_silence(Instant::now()) {
                    on_utterance(utterance);
                }
            }
            chunk = stream.recv() => match chunk {
                Some(chunk) => {
                    if let Some(utterance) = monitor.observe(chunk) {
                        on_utterance(utterance);
                    }
                    if monitor.is_finished() {
                        break;
                    }
                }
                None => {
                    debug!("Speaker stream closed with {} bytes buffered", monitor.buffered_bytes());
                    if let Some(utterance) = monitor.finish() {
                        on_utterance(utterance);
                    }
                    break;
                }
            },
        }
    }

    stream.close();
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        time::sleep_until(deadline).await;
    }
}
