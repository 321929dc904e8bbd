//! Command manager: priority work queue, worker thread, per-queue result
//! tables (spec.md §4.2).
//!
//! Grounded on the teacher's `neutronium::messagebus` condvar-guarded
//! dispatch loop and `t51core::system::System::run`'s single-worker
//! execution model, generalized from a fixed per-tick system list to an
//! open, string-keyed handler registry.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::command::registry::Context;
use crate::command::{BuiltinKind, Command, CommandOutcome, Payload, Priority};
use crate::error::SchedulingError;
use crate::message::{CommandResult, Message, ResultCode};

use super::registry::Registry;

struct QueueItem {
    seq: u64,
    command: Command,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.command.priority == other.command.priority && self.seq == other.seq
    }
}
impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority sorts first; within the same priority, the
        // earlier-submitted (lower seq) item sorts first. BinaryHeap is a
        // max-heap, so seq comparison is reversed.
        self.command
            .priority
            .cmp(&other.command.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct WorkQueue {
    heap: Mutex<BinaryHeap<QueueItem>>,
    condvar: Condvar,
}

impl WorkQueue {
    fn new() -> WorkQueue {
        WorkQueue { heap: Mutex::new(BinaryHeap::new()), condvar: Condvar::new() }
    }

    fn push(&self, seq: u64, command: Command) {
        let mut heap = self.heap.lock();
        heap.push(QueueItem { seq, command });
        self.condvar.notify_one();
    }

    fn pop_blocking(&self) -> Command {
        let mut heap = self.heap.lock();
        loop {
            if let Some(item) = heap.pop() {
                return item.command;
            }
            self.condvar.wait(&mut heap);
        }
    }
}

/// A per-connection FIFO of completed results (spec.md §3 "Queue").
struct ResultQueue {
    results: Mutex<VecDeque<CommandResult>>,
    condvar: Condvar,
    destroyed: AtomicBool,
}

impl ResultQueue {
    fn new() -> ResultQueue {
        ResultQueue {
            results: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            destroyed: AtomicBool::new(false),
        }
    }

    fn push(&self, result: CommandResult) {
        self.results.lock().push_back(result);
        self.condvar.notify_all();
    }

    fn drain(&self, max_count: usize, timeout: Duration) -> crate::Result<Vec<CommandResult>> {
        let mut results = self.results.lock();
        let deadline = Instant::now() + timeout;
        while results.is_empty() && !self.destroyed.load(AtomicOrdering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = deadline - now;
            let timed_out = self.condvar.wait_for(&mut results, wait).timed_out();
            if timed_out {
                break;
            }
        }
        if self.destroyed.load(AtomicOrdering::SeqCst) && results.is_empty() {
            return Err(SchedulingError::WorkerStopped.into());
        }
        let drained: Vec<_> = results.drain(..results.len().min(max_count)).collect();
        Ok(drained)
    }
}

/// Drains the priority work queue on one worker thread and delivers
/// results into per-queue result tables.
pub struct CommandManager<R: Send + Sync + 'static> {
    registry: Arc<Registry<R>>,
    runtime: Arc<RwLock<Option<Arc<R>>>>,
    work: Arc<WorkQueue>,
    queues: Arc<Mutex<IndexMap<u64, Arc<ResultQueue>>>>,
    next_task_id: AtomicU64,
    next_seq: AtomicU64,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl<R: Send + Sync + 'static> CommandManager<R> {
    pub fn new(registry: Registry<R>) -> CommandManager<R> {
        CommandManager {
            registry: Arc::new(registry),
            runtime: Arc::new(RwLock::new(None)),
            work: Arc::new(WorkQueue::new()),
            queues: Arc::new(Mutex::new(IndexMap::new())),
            next_task_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
            worker: Mutex::new(None),
        }
    }

    /// Bind the runtime handle handlers will receive. Split from `new`
    /// because the runtime that owns a `CommandManager` typically needs to
    /// exist before handlers can reference it back.
    pub fn bind_runtime(&self, runtime: Arc<R>) {
        *self.runtime.write() = Some(runtime);
    }

    /// Start the worker thread. Idempotent no-op if already started.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let registry = self.registry.clone();
        let runtime = self.runtime.clone();
        let work = self.work.clone();
        let queues = self.queues.clone();
        let handle = std::thread::Builder::new()
            .name("instrument-worker".into())
            .spawn(move || Self::run(registry, runtime, work, queues))
            .expect("failed to spawn command worker thread");
        *worker = Some(handle);
    }

    fn run(
        registry: Arc<Registry<R>>,
        runtime: Arc<RwLock<Option<Arc<R>>>>,
        work: Arc<WorkQueue>,
        queues: Arc<Mutex<IndexMap<u64, Arc<ResultQueue>>>>,
    ) {
        loop {
            let command = work.pop_blocking();
            match command.payload {
                Payload::Shutdown => {
                    tracing::debug!("worker received shutdown, draining no further work");
                    let queues = queues.lock();
                    for q in queues.values() {
                        q.destroyed.store(true, AtomicOrdering::SeqCst);
                        q.condvar.notify_all();
                    }
                    return;
                }
                Payload::Builtin(BuiltinKind::CreateQueue) => {
                    queues.lock().insert(command.queue_id, Arc::new(ResultQueue::new()));
                }
                Payload::Builtin(BuiltinKind::DestroyQueue) => {
                    if let Some(q) = queues.lock().shift_remove(&command.queue_id) {
                        q.destroyed.store(true, AtomicOrdering::SeqCst);
                        q.condvar.notify_all();
                    }
                }
                Payload::User(message) => {
                    let outcome = {
                        let runtime_guard = runtime.read();
                        match (&*runtime_guard, registry.get(message.type_name())) {
                            (Some(rt), Some(handler)) => {
                                let ctx = Context {
                                    payload: &message,
                                    runtime: rt.as_ref(),
                                    queue_id: command.queue_id,
                                    task_id: command.task_id,
                                };
                                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(ctx))).unwrap_or_else(
                                    |_| CommandOutcome::Error(crate::error::handler_error("handler panicked").to_string()),
                                )
                            }
                            (_, None) => CommandOutcome::Error(format!(
                                "no handler registered for {}",
                                message.type_name()
                            )),
                            (None, _) => CommandOutcome::Error("runtime not bound".into()),
                        }
                    };

                    if matches!(outcome, CommandOutcome::Pending) {
                        // Transferred to B's deferred queue by the caller
                        // that set the pending flag; the worker does not
                        // push a result here (spec.md §4.2).
                        continue;
                    }

                    let result = outcome_to_result(command.task_id, outcome);
                    // A missing queue at result-push time discards the
                    // result silently: the client already disconnected.
                    if let Some(q) = queues.lock().get(&command.queue_id) {
                        q.push(result);
                    }
                }
            }
        }
    }

    /// Push a result for a pending command once its deferred invocation
    /// completes on the main/game-loop thread (spec.md §4.2, §4.5).
    pub fn complete_pending(&self, queue_id: u64, task_id: u64, outcome: CommandOutcome) {
        let result = outcome_to_result(task_id, outcome);
        if let Some(q) = self.queues.lock().get(&queue_id) {
            q.push(result);
        }
    }

    pub fn enqueue_user(&self, queue_id: u64, message: Message) -> crate::Result<u64> {
        if !self.queues.lock().contains_key(&queue_id) {
            return Err(SchedulingError::UnknownQueue(queue_id).into());
        }
        let task_id = self.next_task_id.fetch_add(1, AtomicOrdering::SeqCst);
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::SeqCst);
        self.work.push(
            seq,
            Command { queue_id, task_id, priority: Priority::User, payload: Payload::User(message) },
        );
        Ok(task_id)
    }

    pub fn enqueue_builtin(&self, kind: BuiltinKind, queue_id: u64) {
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::SeqCst);
        self.work.push(
            seq,
            Command { queue_id, task_id: 0, priority: Priority::QueueLifecycle, payload: Payload::Builtin(kind) },
        );
    }

    pub fn enqueue_shutdown(&self) {
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::SeqCst);
        self.work.push(
            seq,
            Command { queue_id: 0, task_id: 0, priority: Priority::Shutdown, payload: Payload::Shutdown },
        );
    }

    pub fn flush_results(&self, queue_id: u64, max_count: usize, timeout: Duration) -> crate::Result<Vec<CommandResult>> {
        let queue = self
            .queues
            .lock()
            .get(&queue_id)
            .cloned()
            .ok_or(SchedulingError::UnknownQueue(queue_id))?;
        queue.drain(max_count, timeout)
    }

    pub fn join(&self) {
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

fn outcome_to_result(task_id: u64, outcome: CommandOutcome) -> CommandResult {
    match outcome {
        CommandOutcome::Ok(message) => CommandResult {
            task_id,
            result: Some(message),
            result_code: ResultCode::Ok,
            error_message: None,
        },
        CommandOutcome::Error(message) => {
            CommandResult { task_id, result: None, result_code: ResultCode::Error, error_message: Some(message) }
        }
        CommandOutcome::Pending => unreachable!("pending outcomes are never converted directly"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    struct DummyRuntime;

    fn manager_with_echo_handler() -> CommandManager<DummyRuntime> {
        let mut registry: Registry<DummyRuntime> = Registry::new();
        registry.register(
            "StoreValue",
            Arc::new(|ctx: Context<'_, DummyRuntime>| match ctx.payload {
                Message::StoreValue { value, .. } => CommandOutcome::Ok(Message::StoreValueResult { result: value.clone() }),
                _ => CommandOutcome::Error("bad payload".into()),
            }),
        );
        let manager = CommandManager::new(registry);
        manager.bind_runtime(Arc::new(DummyRuntime));
        manager.start();
        manager
    }

    #[test]
    fn enqueue_user_on_unknown_queue_fails_synchronously() {
        let manager = manager_with_echo_handler();
        let err = manager.enqueue_user(99, Message::StoreValue { key: "k".into(), value: "v".into() }).unwrap_err();
        assert!(matches!(err, crate::Error::Scheduling(_)));
        manager.enqueue_shutdown();
        manager.join();
    }

    #[test]
    fn round_trip_store_value() {
        let manager = manager_with_echo_handler();
        manager.enqueue_builtin(BuiltinKind::CreateQueue, 1);
        // Give the worker a moment to process the create-queue builtin
        // ahead of the user command below (same priority tier, FIFO).
        let task_id = loop {
            match manager.enqueue_user(1, Message::StoreValue { key: "k".into(), value: "v".into() }) {
                Ok(id) => break id,
                Err(_) => std::thread::sleep(Duration::from_millis(1)),
            }
        };
        let results = manager.flush_results(1, 10, Duration::from_secs(1)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].task_id, task_id);
        assert_eq!(results[0].result_code, ResultCode::Ok);

        manager.enqueue_shutdown();
        manager.join();
    }

    #[test]
    fn poll_with_zero_timeout_never_blocks() {
        let manager = manager_with_echo_handler();
        manager.enqueue_builtin(BuiltinKind::CreateQueue, 2);
        std::thread::sleep(Duration::from_millis(5));
        let start = Instant::now();
        let results = manager.flush_results(2, 10, Duration::from_secs(0)).unwrap();
        assert!(results.is_empty());
        assert!(start.elapsed() < Duration::from_millis(200));
        manager.enqueue_shutdown();
        manager.join();
    }

    #[test]
    fn destroyed_queue_fails_inflight_flush() {
        let manager = manager_with_echo_handler();
        manager.enqueue_builtin(BuiltinKind::CreateQueue, 3);
        std::thread::sleep(Duration::from_millis(5));
        manager.enqueue_builtin(BuiltinKind::DestroyQueue, 3);
        std::thread::sleep(Duration::from_millis(5));
        let err = manager.flush_results(3, 10, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, crate::Error::Scheduling(_)));
        manager.enqueue_shutdown();
        manager.join();
    }
}
