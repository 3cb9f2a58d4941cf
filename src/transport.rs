//! Channel transport boundary and the in-process reference transport.
//!
//! The core never manages sockets: it opens named channels through a
//! [`ChannelTransport`] capability and sends/receives encoded
//! [`Frame`]s. The transport also carries the presence sub-protocol
//! (track/sync/join/leave) on the same channel.
//!
//! ```text
//! Session A ──open("doc:x:presence")──┐
//!                                     ├── ChannelCore ── broadcast fan-out
//! Session B ──open("doc:x:presence")──┘        │
//!                                       presence map + sync seq
//! ```
//!
//! [`InProcessTransport`] is the reference implementation: one broadcast
//! channel per name (every peer gets an independent buffered receiver),
//! plus a per-channel presence map. Tracking presence broadcasts a join
//! delta to others and a monotonically-stamped full snapshot to everyone;
//! closing a tracking handle broadcasts the leave. Tests substitute this
//! transport for the platform's real one.
//!
//! Reference: Kleppmann, Chapter 8 — Broadcast Protocols

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::CollabError;
use crate::presence::PresenceState;
use crate::protocol::{ChannelEvent, Frame, Purpose};

/// Per-subscription channel configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelConfig {
    /// Whether the subscriber receives its own broadcasts back.
    pub echo_self: bool,
    /// Identity key for presence tracking on this channel, if any.
    pub presence_key: Option<Uuid>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            echo_self: true,
            presence_key: None,
        }
    }
}

/// Factory for channel subscriptions.
pub trait ChannelTransport: Send + Sync {
    /// Open a named channel. Fails with [`CollabError::ChannelUnavailable`]
    /// when the transport cannot reach the channel; callers degrade to a
    /// local-only session.
    fn open(&self, channel: &str, config: ChannelConfig)
        -> Result<Box<dyn ChannelHandle>, CollabError>;
}

/// One open channel subscription. Closing must happen on every exit path;
/// a handle that tracked presence announces the departure when closed.
pub trait ChannelHandle: Send + Sync {
    /// Broadcast a frame to all subscribers. Returns the receiver count.
    fn send(&self, frame: &Frame) -> Result<usize, CollabError>;
    /// Start (or refresh) presence tracking for this handle's key.
    fn track_presence(&self, state: &PresenceState) -> Result<(), CollabError>;
    /// Independent buffered receiver of raw frames for this subscriber.
    fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>>;
    fn config(&self) -> &ChannelConfig;
    /// Idempotent teardown; releases the server-side tracking slot.
    fn close(&self);
}

// ───────────────────────────────────────────────────────────────────
// In-process transport
// ───────────────────────────────────────────────────────────────────

/// Shared state for one named channel.
struct ChannelCore {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    /// Tracked presence, keyed by presence key. BTreeMap keeps snapshot
    /// order stable across broadcasts.
    presence: Mutex<BTreeMap<Uuid, PresenceState>>,
    /// Monotonic stamp for sync snapshots on this channel.
    sync_seq: AtomicU64,
}

impl ChannelCore {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            presence: Mutex::new(BTreeMap::new()),
            sync_seq: AtomicU64::new(0),
        }
    }

    fn broadcast_frame(&self, frame: &Frame) -> usize {
        match frame.encode() {
            Ok(bytes) => self.sender.send(Arc::new(bytes)).unwrap_or(0),
            Err(e) => {
                log::warn!("failed to encode {} frame: {e}", frame.event.kind());
                0
            }
        }
    }

    /// Broadcast the full presence snapshot with the next seq stamp.
    fn broadcast_sync(&self) {
        let participants: Vec<PresenceState> = {
            let presence = self.presence.lock().expect("presence lock poisoned");
            presence.values().cloned().collect()
        };
        let seq = self.sync_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let frame = Frame::new(
            Uuid::nil(),
            Purpose::Presence,
            ChannelEvent::PresenceSync { seq, participants },
        );
        self.broadcast_frame(&frame);
    }
}

/// In-process [`ChannelTransport`] backed by tokio broadcast channels.
pub struct InProcessTransport {
    channels: Mutex<HashMap<String, Arc<ChannelCore>>>,
    capacity: usize,
    offline: AtomicBool,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// `capacity` bounds how many frames a lagging subscriber may buffer.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity,
            offline: AtomicBool::new(false),
        }
    }

    /// Simulate an unreachable transport: subsequent opens fail with
    /// `ChannelUnavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().expect("channel lock poisoned").len()
    }

    fn core(&self, channel: &str) -> Arc<ChannelCore> {
        let mut channels = self.channels.lock().expect("channel lock poisoned");
        channels
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(ChannelCore::new(self.capacity)))
            .clone()
    }
}

impl Default for InProcessTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelTransport for InProcessTransport {
    fn open(
        &self,
        channel: &str,
        config: ChannelConfig,
    ) -> Result<Box<dyn ChannelHandle>, CollabError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CollabError::ChannelUnavailable);
        }
        log::debug!("opening channel {channel}");
        Ok(Box::new(InProcessHandle {
            core: self.core(channel),
            config,
            tracked: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }
}

struct InProcessHandle {
    core: Arc<ChannelCore>,
    config: ChannelConfig,
    tracked: AtomicBool,
    closed: AtomicBool,
}

impl ChannelHandle for InProcessHandle {
    fn send(&self, frame: &Frame) -> Result<usize, CollabError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CollabError::ChannelUnavailable);
        }
        Ok(self.core.broadcast_frame(frame))
    }

    fn track_presence(&self, state: &PresenceState) -> Result<(), CollabError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CollabError::ChannelUnavailable);
        }
        let key = self.config.presence_key.unwrap_or(state.participant_id);
        let newly_tracked = {
            let mut presence = self.core.presence.lock().expect("presence lock poisoned");
            presence.insert(key, state.clone()).is_none()
        };
        self.tracked.store(true, Ordering::SeqCst);

        if newly_tracked {
            let join = Frame::new(
                key,
                Purpose::Presence,
                ChannelEvent::PresenceJoin {
                    state: state.clone(),
                },
            );
            self.core.broadcast_frame(&join);
        }
        // Every track (first or refresh) re-broadcasts the authoritative
        // snapshot; reconciliation converges from it alone if a delta is
        // lost.
        self.core.broadcast_sync();
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.core.sender.subscribe()
    }

    fn config(&self) -> &ChannelConfig {
        &self.config
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.tracked.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(key) = self.config.presence_key {
            let removed = {
                let mut presence = self.core.presence.lock().expect("presence lock poisoned");
                presence.remove(&key).is_some()
            };
            if removed {
                let leave = Frame::new(
                    key,
                    Purpose::Presence,
                    ChannelEvent::PresenceLeave {
                        participant_id: key,
                    },
                );
                self.core.broadcast_frame(&leave);
                self.core.broadcast_sync();
            }
        }
    }
}

impl Drop for InProcessHandle {
    fn drop(&mut self) {
        // Dropping a handle must release the tracking slot even if the
        // owner forgot to close explicitly.
        self.close();
    }
}
