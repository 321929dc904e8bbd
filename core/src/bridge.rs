//! Callback bridge (B, spec.md §4.5).
//!
//! The set of bundled callbacks the runtime installs by default: a
//! per-frame snapshot/record callback, a deferred-command drain callback,
//! and a shutdown callback that deregisters everything in reverse order.
//! The drain queue's queue-plus-condvar shape mirrors the teacher's
//! `neutronium::messagebus` dispatch queue; the gzip-wrapped,
//! length-prefixed record stream reuses the `t51core::net::frame` framing
//! idiom wrapped in `flate2`.

use std::collections::VecDeque;
use std::fs::File;
use std::io::Write;
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::{Condvar, Mutex};

use crate::command::{CommandManager, CommandOutcome};
use crate::storage::Storage;

pub const GAME_DATA_KEY: &str = "game_data";

/// A closure that must run on the host's main/game-loop thread, queued by
/// a handler that set the pending flag (spec.md §3, §4.2, §4.5).
pub struct DeferredCommand {
    pub queue_id: u64,
    pub task_id: u64,
    pub work: Box<dyn FnOnce() -> CommandOutcome + Send>,
}

struct DeferredQueueInner {
    items: Mutex<VecDeque<DeferredCommand>>,
    condvar: Condvar,
}

/// The concurrent queue from which the per-frame callback drains deferred
/// commands (spec.md's Glossary "Drain queue").
#[derive(Clone)]
pub struct DeferredQueue {
    inner: Arc<DeferredQueueInner>,
}

impl DeferredQueue {
    pub fn new() -> DeferredQueue {
        DeferredQueue {
            inner: Arc::new(DeferredQueueInner { items: Mutex::new(VecDeque::new()), condvar: Condvar::new() }),
        }
    }

    pub fn push(&self, command: DeferredCommand) {
        self.inner.items.lock().push_back(command);
        self.inner.condvar.notify_one();
    }

    /// Drain everything currently queued. Called from the per-frame
    /// callback, which runs on a hijacked host thread and must not block.
    pub fn drain_all(&self) -> Vec<DeferredCommand> {
        let mut items = self.inner.items.lock();
        items.drain(..).collect()
    }
}

impl Default for DeferredQueue {
    fn default() -> Self {
        DeferredQueue::new()
    }
}

/// One bundled callback's registration record, tracked so shutdown can
/// deregister everything in reverse order (spec.md §4.5).
struct RegisteredCallback {
    name: String,
    target_address: usize,
}

/// Optional gzip-wrapped, length-prefixed output stream for per-frame
/// snapshots (spec.md §6 "Persisted state layout").
pub struct RecordStream {
    encoder: Mutex<GzEncoder<File>>,
}

impl RecordStream {
    pub fn create(path: &str) -> std::io::Result<RecordStream> {
        let file = File::create(path)?;
        Ok(RecordStream { encoder: Mutex::new(GzEncoder::new(file, Compression::default())) })
    }

    /// Append one length-prefixed snapshot. No header, no index, no
    /// trailer; readers stop on EOF.
    pub fn append(&self, snapshot: &[u8]) -> std::io::Result<()> {
        let mut encoder = self.encoder.lock();
        encoder.write_all(&(snapshot.len() as u32).to_le_bytes())?;
        encoder.write_all(snapshot)?;
        Ok(())
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.encoder.lock().flush()
    }
}

/// Owns the bundled callbacks' shared state: the deferred-command queue,
/// an in-memory ring buffer of recent snapshots, and the optional record
/// streams configured at init time.
pub struct CallbackBridge<R: Send + Sync + 'static> {
    storage: Storage,
    manager: Arc<CommandManager<R>>,
    deferred: DeferredQueue,
    snapshots: Mutex<VecDeque<Vec<u8>>>,
    snapshot_ring_capacity: usize,
    snapshot_stream: Option<RecordStream>,
    traffic_stream: Option<RecordStream>,
    registered: Mutex<Vec<RegisteredCallback>>,
}

impl<R: Send + Sync + 'static> CallbackBridge<R> {
    pub fn new(
        storage: Storage,
        manager: Arc<CommandManager<R>>,
        snapshot_stream: Option<RecordStream>,
        traffic_stream: Option<RecordStream>,
    ) -> CallbackBridge<R> {
        storage.set(GAME_DATA_KEY, ());
        CallbackBridge {
            storage,
            manager,
            deferred: DeferredQueue::new(),
            snapshots: Mutex::new(VecDeque::new()),
            snapshot_ring_capacity: 256,
            snapshot_stream,
            traffic_stream,
            registered: Mutex::new(Vec::new()),
        }
    }

    pub fn deferred_queue(&self) -> DeferredQueue {
        self.deferred.clone()
    }

    pub fn note_registered(&self, name: &str, target_address: usize) {
        self.registered.lock().push(RegisteredCallback { name: name.to_string(), target_address });
    }

    /// The per-frame callback: append `snapshot` to the ring buffer and,
    /// if configured, the gzip record stream; then drain and run every
    /// deferred command, completing its result back through the manager.
    pub fn on_frame(&self, snapshot: Vec<u8>) {
        {
            let mut ring = self.snapshots.lock();
            ring.push_back(snapshot.clone());
            while ring.len() > self.snapshot_ring_capacity {
                ring.pop_front();
            }
        }
        if let Some(stream) = &self.snapshot_stream {
            if let Err(e) = stream.append(&snapshot) {
                tracing::warn!(error = %e, "failed to append snapshot to record stream");
            }
        }

        for deferred in self.deferred.drain_all() {
            let outcome = (deferred.work)();
            self.manager.complete_pending(deferred.queue_id, deferred.task_id, outcome);
        }
    }

    /// Record one raw host-traffic packet, if a traffic stream was
    /// configured at init time.
    pub fn on_raw_traffic(&self, packet: &[u8]) {
        if let Some(stream) = &self.traffic_stream {
            if let Err(e) = stream.append(packet) {
                tracing::warn!(error = %e, "failed to append traffic packet");
            }
        }
    }

    /// The game-loop-exit callback: deregister every bundled callback in
    /// reverse registration order, flush output streams, clear the
    /// `game_data` entry.
    pub fn on_shutdown<F>(&self, mut deregister: F)
    where
        F: FnMut(usize, &str),
    {
        let registered = std::mem::take(&mut *self.registered.lock());
        for cb in registered.into_iter().rev() {
            deregister(cb.target_address, &cb.name);
        }
        if let Some(stream) = &self.snapshot_stream {
            let _ = stream.flush();
        }
        if let Some(stream) = &self.traffic_stream {
            let _ = stream.flush();
        }
        self.storage.remove(GAME_DATA_KEY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Registry;

    fn bridge() -> CallbackBridge<()> {
        let storage = Storage::new();
        let registry: Registry<()> = Registry::new();
        let manager = Arc::new(CommandManager::new(registry));
        manager.bind_runtime(Arc::new(()));
        manager.start();
        CallbackBridge::new(storage, manager, None, None)
    }

    #[test]
    fn on_frame_drains_deferred_commands() {
        let b = bridge();
        b.deferred_queue().push(DeferredCommand {
            queue_id: 1,
            task_id: 1,
            work: Box::new(|| CommandOutcome::Ok(crate::message::Message::Ack)),
        });
        b.on_frame(vec![1, 2, 3]);
        assert!(b.deferred.drain_all().is_empty());
    }

    #[test]
    fn shutdown_deregisters_in_reverse_order() {
        let b = bridge();
        b.note_registered("first", 0x1000);
        b.note_registered("second", 0x2000);
        let mut order = Vec::new();
        b.on_shutdown(|addr, name| order.push((addr, name.to_string())));
        assert_eq!(order, vec![(0x2000, "second".to_string()), (0x1000, "first".to_string())]);
    }

    #[test]
    fn shutdown_clears_game_data_entry() {
        let b = bridge();
        b.storage.set(GAME_DATA_KEY, 7i32);
        b.on_shutdown(|_, _| {});
        assert!(b.storage.get::<i32>(GAME_DATA_KEY).is_err());
    }
}
