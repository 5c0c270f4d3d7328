//! Per-speaker stream registry
//!
//! Tracks one decode stream and one connection handle per speaking user.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Decoded chunks a subscription may hold before new ones are dropped
pub const SUBSCRIPTION_CAPACITY: usize = 512;

/// Raised when a user's decode stream is created
#[derive(Debug)]
pub struct NewSpeaker {
    pub user_id: u64,
    pub display_name: String,
    pub channel_id: u64,
    /// Registration generation, used to release only this registration
    pub generation: u64,
    /// Raw decoded audio chunks, in arrival order
    pub stream: SpeakerStream,
}

/// Receiving half of a speaker subscription.
///
/// Counts chunks as they are read so the registry can tell whether a
/// subscription still holds audio nobody has consumed.
#[derive(Debug)]
pub struct SpeakerStream {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Arc<AtomicUsize>,
}

impl SpeakerStream {
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        let chunk = self.rx.recv().await?;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Some(chunk)
    }

    pub fn close(&mut self) {
        self.rx.close();
    }
}

impl From<mpsc::Receiver<Vec<u8>>> for SpeakerStream {
    fn from(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }
}

fn subscription() -> (mpsc::Sender<Vec<u8>>, Arc<AtomicUsize>, SpeakerStream) {
    let (chunk_tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
    let pending = Arc::new(AtomicUsize::new(0));
    let stream = SpeakerStream {
        rx,
        pending: pending.clone(),
    };
    (chunk_tx, pending, stream)
}

/// A monitored user and the resources owned on their behalf
#[derive(Debug)]
pub struct SpeakerSession {
    pub user_id: u64,
    pub display_name: String,
    pub channel_id: u64,
    generation: u64,
    chunk_tx: mpsc::Sender<Vec<u8>>,
    pending: Arc<AtomicUsize>,
    listeners: Vec<AbortHandle>,
}

impl SpeakerSession {
    fn is_open(&self) -> bool {
        !self.chunk_tx.is_closed()
    }

    /// Chunks pushed but never read by the monitor.
    ///
    /// Survives the receiver being dropped, unlike the channel's own capacity.
    fn unread(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn detach(self) {
        debug!(
            "Detaching {} listener(s) for {} ({})",
            self.listeners.len(),
            self.display_name,
            self.user_id
        );
        for listener in self.listeners {
            listener.abort();
        }
    }
}

/// Registry of active speakers, keyed by platform user id.
///
/// `C` is the connection handle shared by every speaker of a call.
pub struct StreamRegistry<C> {
    streams: DashMap<u64, SpeakerSession>,
    connections: DashMap<u64, C>,
    events: mpsc::UnboundedSender<NewSpeaker>,
    next_generation: AtomicU64,
}

impl<C: Clone> StreamRegistry<C> {
    /// Create a registry; new speakers are announced on `events`
    pub fn new(events: mpsc::UnboundedSender<NewSpeaker>) -> Self {
        Self {
            streams: DashMap::new(),
            connections: DashMap::new(),
            events,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Make sure `user_id` has a live decode stream.
    ///
    /// No-op when a live registration exists. A closed subscription that was
    /// left with unread chunks also counts as live; it belongs to a monitor
    /// that is shutting down and will release its own registration.
    pub fn ensure_monitored(&self, user_id: u64, display_name: &str, channel_id: u64, connection: C) {
        let (generation, stream) = match self.streams.entry(user_id) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get();
                if existing.is_open() || existing.unread() > 0 {
                    debug!("User {} already monitored", user_id);
                    return;
                }
                let (chunk_tx, pending, stream) = subscription();
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let stale = occupied.insert(SpeakerSession {
                    user_id,
                    display_name: display_name.to_string(),
                    channel_id,
                    generation,
                    chunk_tx,
                    pending,
                    listeners: Vec::new(),
                });
                stale.detach();
                (generation, stream)
            }
            Entry::Vacant(vacant) => {
                let (chunk_tx, pending, stream) = subscription();
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                vacant.insert(SpeakerSession {
                    user_id,
                    display_name: display_name.to_string(),
                    channel_id,
                    generation,
                    chunk_tx,
                    pending,
                    listeners: Vec::new(),
                });
                (generation, stream)
            }
        };

        self.connections.insert(user_id, connection);

        info!("[{}] Monitoring new speaker {} ({})", channel_id, display_name, user_id);

        let event = NewSpeaker {
            user_id,
            display_name: display_name.to_string(),
            channel_id,
            generation,
            stream,
        };
        if self.events.send(event).is_err() {
            warn!("No consumer for new speaker events, releasing user {}", user_id);
            self.release(user_id);
        }
    }

    /// Track a task that must not outlive the registration
    pub fn attach_listener(&self, user_id: u64, generation: u64, listener: AbortHandle) {
        match self.streams.get_mut(&user_id) {
            Some(mut session) if session.generation == generation => {
                session.listeners.push(listener);
            }
            _ => {
                // Registration already gone
                listener.abort();
            }
        }
    }

    /// Forward a decoded chunk to the user's monitor without blocking.
    ///
    /// Returns false when the user is not monitored or the chunk was dropped.
    pub fn push_chunk(&self, user_id: u64, chunk: Vec<u8>) -> bool {
        let Some(session) = self.streams.get(&user_id) else {
            return false;
        };
        // Counted before sending so a fast reader never sees it go negative
        session.pending.fetch_add(1, Ordering::AcqRel);
        match session.chunk_tx.try_send(chunk) {
            Ok(()) => true,
            Err(e) => {
                session.pending.fetch_sub(1, Ordering::AcqRel);
                if let mpsc::error::TrySendError::Full(_) = e {
                    warn!("Speaker subscription full for user {}, dropping chunk", user_id);
                }
                false
            }
        }
    }

    /// Drop every resource held for `user_id`. Safe to call repeatedly.
    pub fn release(&self, user_id: u64) {
        let removed = self.streams.remove(&user_id);
        self.connections.remove(&user_id);
        if let Some((_, session)) = removed {
            info!("Released speaker stream for user {}", user_id);
            session.detach();
        }
    }

    /// Release only if `generation` is still the active registration
    pub fn release_generation(&self, user_id: u64, generation: u64) {
        let removed = self
            .streams
            .remove_if(&user_id, |_, session| session.generation == generation);
        if let Some((_, session)) = removed {
            self.connections.remove(&user_id);
            info!("Speaker stream closed for user {} (generation {})", user_id, generation);
            session.detach();
        }
    }

    /// Release every speaker registered for a channel
    pub fn release_channel(&self, channel_id: u64) {
        let users: Vec<u64> = self
            .streams
            .iter()
            .filter(|entry| entry.value().channel_id == channel_id)
            .map(|entry| *entry.key())
            .collect();
        for user_id in users {
            self.release(user_id);
        }
    }

    pub fn connection(&self, user_id: u64) -> Option<C> {
        self.connections.get(&user_id).map(|c| c.value().clone())
    }

    pub fn is_monitored(&self, user_id: u64) -> bool {
        self.streams.contains_key(&user_id)
    }

    pub fn speaker_count(&self) -> usize {
        self.streams.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (StreamRegistry<&'static str>, mpsc::UnboundedReceiver<NewSpeaker>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StreamRegistry::new(tx), rx)
    }

    #[test]
    fn test_ensure_monitored_is_idempotent() {
        let (registry, mut events) = registry();

        registry.ensure_monitored(7, "alice", 100, "call");
        let first = events.try_recv().unwrap();
        registry.ensure_monitored(7, "alice", 100, "call");

        assert!(events.try_recv().is_err());
        assert_eq!(registry.speaker_count(), 1);
        assert_eq!(first.user_id, 7);
        assert_eq!(first.display_name, "alice");
        assert_eq!(registry.connection(7), Some("call"));
    }

    #[test]
    fn test_release_twice_is_noop() {
        let (registry, mut events) = registry();

        registry.ensure_monitored(7, "alice", 100, "call");
        let _speaker = events.try_recv().unwrap();

        registry.release(7);
        assert!(!registry.is_monitored(7));
        assert!(registry.connection(7).is_none());

        registry.release(7);
        assert_eq!(registry.speaker_count(), 0);
    }

    #[test]
    fn test_closed_stream_is_reacquired() {
        let (registry, mut events) = registry();

        registry.ensure_monitored(7, "alice", 100, "call");
        let speaker = events.try_recv().unwrap();
        drop(speaker.stream);

        registry.ensure_monitored(7, "alice", 100, "call");
        let again = events.try_recv().expect("closed stream replaced");
        assert!(again.generation > speaker.generation);
        assert_eq!(registry.speaker_count(), 1);
    }

    #[test]
    fn test_closed_stream_with_unread_chunks_counts_as_active() {
        let (registry, mut events) = registry();

        registry.ensure_monitored(7, "alice", 100, "call");
        let speaker = events.try_recv().unwrap();
        assert!(registry.push_chunk(7, vec![1, 2, 3]));
        assert!(registry.push_chunk(7, vec![4]));
        drop(speaker.stream);

        registry.ensure_monitored(7, "alice", 100, "call");
        assert!(events.try_recv().is_err());
        assert_eq!(registry.speaker_count(), 1);

        // The stopping monitor releases its own registration
        registry.release_generation(7, speaker.generation);
        registry.ensure_monitored(7, "alice", 100, "call");
        assert!(events.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_fully_read_closed_stream_is_reacquired() {
        let (registry, mut events) = registry();

        registry.ensure_monitored(7, "alice", 100, "call");
        let mut speaker = events.try_recv().unwrap();
        assert!(registry.push_chunk(7, vec![1]));
        assert_eq!(speaker.stream.recv().await, Some(vec![1]));
        drop(speaker.stream);

        registry.ensure_monitored(7, "alice", 100, "call");
        let again = events.try_recv().expect("drained stream replaced");
        assert!(again.generation > speaker.generation);
    }

    #[test]
    fn test_stale_generation_does_not_release_new_registration() {
        let (registry, mut events) = registry();

        registry.ensure_monitored(7, "alice", 100, "call");
        let old = events.try_recv().unwrap();
        registry.release(7);
        registry.ensure_monitored(7, "alice", 100, "call");
        let new = events.try_recv().unwrap();

        registry.release_generation(7, old.generation);
        assert!(registry.is_monitored(7));

        registry.release_generation(7, new.generation);
        assert!(!registry.is_monitored(7));
    }

    #[tokio::test]
    async fn test_push_chunk_preserves_order() {
        let (registry, mut events) = registry();

        assert!(!registry.push_chunk(7, vec![0]));
        registry.ensure_monitored(7, "alice", 100, "call");
        let mut speaker = events.try_recv().unwrap();

        for i in 0..5u8 {
            assert!(registry.push_chunk(7, vec![i]));
        }
        for i in 0..5u8 {
            assert_eq!(speaker.stream.recv().await.unwrap(), vec![i]);
        }
    }

    #[tokio::test]
    async fn test_release_detaches_listeners() {
        let (registry, mut events) = registry();

        registry.ensure_monitored(7, "alice", 100, "call");
        let speaker = events.try_recv().unwrap();

        let listener = tokio::spawn(std::future::pending::<()>());
        registry.attach_listener(7, speaker.generation, listener.abort_handle());
        registry.release(7);

        assert!(listener.await.unwrap_err().is_cancelled());
    }

    #[test]
    fn test_release_channel() {
        let (registry, _events) = registry();

        registry.ensure_monitored(1, "a", 100, "call");
        registry.ensure_monitored(2, "b", 100, "call");
        registry.ensure_monitored(3, "c", 200, "other");

        registry.release_channel(100);
        assert!(!registry.is_monitored(1));
        assert!(!registry.is_monitored(2));
        assert!(registry.is_monitored(3));
    }
}
