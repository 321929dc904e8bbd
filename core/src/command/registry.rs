//! `message-type-name -> handler` registry (spec.md §4.2).
//!
//! Grounded on the teacher's `IndexMap`-keyed lookup pattern in
//! `registry.rs`, keyed here by the wire message's type name instead of an
//! entity id.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::command::CommandOutcome;
use crate::message::Message;

/// Context a handler receives for one invocation: the unpacked payload and
/// the runtime handle it needs to read/write storage, hooks or the
/// deferred-command bridge. `Runtime` itself is defined in the
/// `instrument-runtime` crate; this crate only needs an opaque handle type
/// so the registry stays independent of it.
pub struct Context<'a, R> {
    pub payload: &'a Message,
    pub runtime: &'a R,
    pub queue_id: u64,
    pub task_id: u64,
}

pub type HandlerFn<R> = Arc<dyn Fn(Context<'_, R>) -> CommandOutcome + Send + Sync>;

/// Maps a message type name to the handler that processes it.
pub struct Registry<R> {
    handlers: IndexMap<&'static str, HandlerFn<R>>,
}

impl<R> Registry<R> {
    pub fn new() -> Registry<R> {
        Registry { handlers: IndexMap::new() }
    }

    pub fn register(&mut self, type_name: &'static str, handler: HandlerFn<R>) {
        self.handlers.insert(type_name, handler);
    }

    pub fn get(&self, type_name: &str) -> Option<&HandlerFn<R>> {
        self.handlers.get(type_name)
    }
}

impl<R> Default for Registry<R> {
    fn default() -> Self {
        Registry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;

    #[test]
    fn unregistered_type_returns_none() {
        let registry: Registry<Dummy> = Registry::new();
        assert!(registry.get("StoreValue").is_none());
    }

    #[test]
    fn registered_handler_is_found_by_name() {
        let mut registry: Registry<Dummy> = Registry::new();
        registry.register("StoreValue", Arc::new(|_ctx| CommandOutcome::Ok(Message::Ack)));
        assert!(registry.get("StoreValue").is_some());
    }
}
