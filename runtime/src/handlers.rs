//! Built-in command handlers.
//!
//! Each handler is annotated with `instrument_core_macros::command_handler`,
//! which generates a `<name>_entry()` function returning the
//! `(type_name, HandlerFn<Runtime>)` pair `register_all` feeds into the
//! registry — the same "handler function plus generated companion" shape
//! the teacher's `t51core_proc::make_system` uses for its system structs,
//! repurposed here for command dispatch instead of ECS iteration.

use instrument_core::command::registry::Context;
use instrument_core::command::{CommandOutcome, Registry};
use instrument_core::message::Message;
use instrument_core_macros::command_handler;

use instrument_core::bridge::DeferredCommand;

use crate::Runtime;

#[command_handler("StoreValue")]
fn store_value(ctx: Context<'_, Runtime>) -> CommandOutcome {
    match ctx.payload {
        Message::StoreValue { key, value } => {
            ctx.runtime.storage.set(key, value.clone());
            CommandOutcome::Ok(Message::StoreValueResult { result: value.clone() })
        }
        _ => CommandOutcome::Error("StoreValue handler received the wrong payload".into()),
    }
}

#[command_handler("GetValue")]
fn get_value(ctx: Context<'_, Runtime>) -> CommandOutcome {
    match ctx.payload {
        Message::GetValue { key } => match ctx.runtime.storage.get::<String>(key) {
            Ok(value) => CommandOutcome::Ok(Message::GetValueResult { value }),
            Err(e) => CommandOutcome::Error(e.to_string()),
        },
        _ => CommandOutcome::Error("GetValue handler received the wrong payload".into()),
    }
}

#[command_handler("InstallHook")]
fn install_hook(ctx: Context<'_, Runtime>) -> CommandOutcome {
    match ctx.payload {
        Message::InstallHook { address, prefix_length, .. } => {
            let dispatch_thunk = instrument_core::hook::dispatch_thunk_address();
            match ctx.runtime.hooks.install(*address, *prefix_length, dispatch_thunk, &ctx.runtime.excluded_threads()) {
                Ok(()) => CommandOutcome::Ok(Message::Ack),
                Err(e) => CommandOutcome::Error(e.to_string()),
            }
        }
        _ => CommandOutcome::Error("InstallHook handler received the wrong payload".into()),
    }
}

#[command_handler("AddCallback")]
fn add_callback(ctx: Context<'_, Runtime>) -> CommandOutcome {
    match ctx.payload {
        Message::AddCallback { target, name } => {
            let name_owned = name.clone();
            let result = ctx.runtime.hooks.add_callback(
                *target,
                name,
                std::sync::Arc::new(move |_state: &dyn std::any::Any, _regs: &mut instrument_core::hook::GpRegisters| {
                    tracing::trace!(callback = %name_owned, "callback fired");
                }),
                std::sync::Arc::new(()),
            );
            match result {
                Ok(()) => CommandOutcome::Ok(Message::Ack),
                Err(e) => CommandOutcome::Error(e.to_string()),
            }
        }
        _ => CommandOutcome::Error("AddCallback handler received the wrong payload".into()),
    }
}

#[command_handler("RemoveCallback")]
fn remove_callback(ctx: Context<'_, Runtime>) -> CommandOutcome {
    match ctx.payload {
        Message::RemoveCallback { target, name } => match ctx.runtime.hooks.remove_callback(*target, name) {
            Ok(()) => CommandOutcome::Ok(Message::Ack),
            Err(e) => CommandOutcome::Error(e.to_string()),
        },
        _ => CommandOutcome::Error("RemoveCallback handler received the wrong payload".into()),
    }
}

#[command_handler("UninstallHook")]
fn uninstall_hook(ctx: Context<'_, Runtime>) -> CommandOutcome {
    match ctx.payload {
        Message::UninstallHook { target } => match ctx.runtime.hooks.uninstall(*target) {
            Ok(()) => CommandOutcome::Ok(Message::Ack),
            Err(e) => CommandOutcome::Error(e.to_string()),
        },
        _ => CommandOutcome::Error("UninstallHook handler received the wrong payload".into()),
    }
}

/// `UnitOrder` must execute on the host's main loop; the handler defers
/// completion rather than producing a result itself (spec.md §3, §4.2,
/// example scenario 4).
#[command_handler("UnitOrder")]
fn unit_order(ctx: Context<'_, Runtime>) -> CommandOutcome {
    match ctx.payload {
        Message::UnitOrder { addresses, action, x, y } => {
            let addresses = addresses.clone();
            let action = action.clone();
            let (x, y) = (*x, *y);
            ctx.runtime.bridge.deferred_queue().push(DeferredCommand {
                queue_id: ctx.queue_id,
                task_id: ctx.task_id,
                work: Box::new(move || {
                    tracing::debug!(?addresses, %action, x, y, "executing unit order on main thread");
                    CommandOutcome::Ok(Message::Ack)
                }),
            });
            CommandOutcome::Pending
        }
        _ => CommandOutcome::Error("UnitOrder handler received the wrong payload".into()),
    }
}

pub fn register_all(registry: &mut Registry<Runtime>) {
    let (name, handler) = store_value_entry();
    registry.register(name, handler);
    let (name, handler) = get_value_entry();
    registry.register(name, handler);
    let (name, handler) = install_hook_entry();
    registry.register(name, handler);
    let (name, handler) = add_callback_entry();
    registry.register(name, handler);
    let (name, handler) = remove_callback_entry();
    registry.register(name, handler);
    let (name, handler) = uninstall_hook_entry();
    registry.register(name, handler);
    let (name, handler) = unit_order_entry();
    registry.register(name, handler);
}
