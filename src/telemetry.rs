use crate::protocol::Snapshot;
use crate::safety::LimitReason;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{info, warn};

pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Consumer of per-tick snapshots. Publishing must not fail the tick.
pub trait SnapshotSink {
    fn publish(&mut self, snapshot: &Snapshot);
}

/// Fans snapshots out to any number of async subscribers. Slow subscribers
/// lag and lose the oldest snapshots.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Snapshot>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<Snapshot>) {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Snapshot> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl SnapshotSink for BroadcastSink {
    fn publish(&mut self, snapshot: &Snapshot) {
        // An error only means nobody is listening right now.
        let _ = self.tx.send(snapshot.clone());
    }
}

/// Keeps snapshots in memory, readable through a cloneable handle while the
/// sink itself is owned by the loop.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    snapshots: Arc<Mutex<Vec<Snapshot>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> RecordingHandle {
        RecordingHandle {
            snapshots: Arc::clone(&self.snapshots),
        }
    }
}

impl SnapshotSink for RecordingSink {
    fn publish(&mut self, snapshot: &Snapshot) {
        lock(&self.snapshots).push(snapshot.clone());
    }
}

#[derive(Debug, Clone)]
pub struct RecordingHandle {
    snapshots: Arc<Mutex<Vec<Snapshot>>>,
}

impl RecordingHandle {
    pub fn snapshots(&self) -> Vec<Snapshot> {
        lock(&self.snapshots).clone()
    }

    pub fn take(&self) -> Vec<Snapshot> {
        std::mem::take(&mut *lock(&self.snapshots))
    }

    pub fn len(&self) -> usize {
        lock(&self.snapshots).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.snapshots).is_empty()
    }

    pub fn last(&self) -> Option<Snapshot> {
        lock(&self.snapshots).last().cloned()
    }
}

fn lock(snapshots: &Mutex<Vec<Snapshot>>) -> MutexGuard<'_, Vec<Snapshot>> {
    // A panicking publisher cannot leave a half-pushed Vec behind.
    snapshots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Logs a periodic summary plus every change of the active limit.
#[derive(Debug)]
pub struct TracingSink {
    every: u64,
    last_reason: LimitReason,
}

impl TracingSink {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            last_reason: LimitReason::None,
        }
    }
}

impl SnapshotSink for TracingSink {
    fn publish(&mut self, snapshot: &Snapshot) {
        let reason = snapshot.safety.active_limit_reason;
        if reason != self.last_reason {
            if reason > self.last_reason {
                warn!(tick = snapshot.tick, from = ?self.last_reason, to = ?reason, "limit engaged");
            } else {
                info!(tick = snapshot.tick, from = ?self.last_reason, to = ?reason, "limit relaxed");
            }
            self.last_reason = reason;
        }

        if snapshot.tick % self.every == 0 {
            info!(
                tick = snapshot.tick,
                x = snapshot.state.x,
                y = snapshot.state.y,
                v = snapshot.state.linear_velocity,
                w = snapshot.state.angular_velocity,
                soc = snapshot.power.state_of_charge,
                "telemetry"
            );
        }
    }
}

/// Writes one JSON document per snapshot.
pub struct JsonLinesSink<W: Write> {
    writer: W,
    write_errors: u64,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            write_errors: 0,
        }
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors
    }
}

impl<W: Write> SnapshotSink for JsonLinesSink<W> {
    fn publish(&mut self, snapshot: &Snapshot) {
        let written = serde_json::to_writer(&mut self.writer, snapshot)
            .map_err(std::io::Error::from)
            .and_then(|_| self.writer.write_all(b"\n"));
        if let Err(e) = written {
            self.write_errors += 1;
            if self.write_errors == 1 {
                warn!("failed to write snapshot: {}", e);
            }
        }
    }
}
