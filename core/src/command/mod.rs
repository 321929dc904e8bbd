//! Command registry & manager (C, spec.md §4.2).

pub mod manager;
pub mod registry;

pub use manager::CommandManager;
pub use registry::{HandlerFn, Registry};

use crate::message::Message;

/// Priority classes; higher sorts first (spec.md §4.2's worker priority
/// order: Shutdown > queue lifecycle > user commands).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    User = 0,
    QueueLifecycle = 1,
    Shutdown = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    CreateQueue,
    DestroyQueue,
}

/// One unit of scheduled work (spec.md §3 "Command").
pub struct Command {
    pub queue_id: u64,
    pub task_id: u64,
    pub priority: Priority,
    pub payload: Payload,
}

/// Either a user-submitted message or a built-in queue-lifecycle/shutdown
/// action. Kept distinct from `Message` so the worker can special-case
/// built-ins without involving the handler registry.
pub enum Payload {
    User(Message),
    Builtin(BuiltinKind),
    Shutdown,
}

/// What a handler invocation produced. The `Pending` variant is the
/// explicit enum form of the source's side-channel boolean flag (spec.md
/// §9's re-architecture note): the worker does not push a result for a
/// pending command; a later call to `CommandManager::complete_pending`
/// does.
pub enum CommandOutcome {
    Ok(Message),
    Error(String),
    Pending,
}
