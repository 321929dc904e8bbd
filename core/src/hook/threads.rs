//! Thread enumeration/suspend/resume abstraction (spec.md §4.1 step 1-3).
//!
//! `ProcessThreads` is the seam that lets the suspend-patch-resume
//! protocol in `hook::HookEngine` run under a fake in tests, the same way
//! the teacher's `net::channel` abstracts a real socket behind a trait so
//! tests can substitute an in-memory buffer instead.

/// A snapshot of one thread's state relevant to the install/uninstall
/// protocol.
#[derive(Debug, Clone, Copy)]
pub struct ThreadSnapshot {
    pub thread_id: u32,
    pub instruction_pointer: usize,
}

/// Enumerates, suspends, resumes and inspects the instruction pointers of
/// threads in the current process, excluding a caller-supplied exclusion
/// set (the transport reactor thread and the command worker thread, per
/// spec.md §9 — both may hold locks the dispatcher also takes).
pub trait ProcessThreads: Send + Sync {
    /// List every thread in the current process except `exclude`.
    fn enumerate(&self, exclude: &[u32]) -> std::io::Result<Vec<u32>>;

    /// Suspend every thread in `thread_ids`. Best-effort: a thread that
    /// has already exited is skipped, not an error.
    fn suspend_all(&self, thread_ids: &[u32]) -> std::io::Result<()>;

    /// Resume every thread in `thread_ids`.
    fn resume_all(&self, thread_ids: &[u32]) -> std::io::Result<()>;

    /// Read the current instruction pointer of a suspended thread.
    fn instruction_pointer(&self, thread_id: u32) -> std::io::Result<usize>;

    /// Patch `len` bytes at `address` with `bytes`, word-at-a-time, and
    /// flush the instruction cache for that range.
    fn patch_memory(&self, address: usize, bytes: &[u8]) -> std::io::Result<()>;

    /// Allocate an executable, readable, writable region at least `len`
    /// bytes long. Returns its base address.
    fn alloc_executable(&self, len: usize) -> std::io::Result<usize>;

    /// Free a region previously returned by `alloc_executable`.
    fn free_executable(&self, address: usize, len: usize) -> std::io::Result<()>;
}

#[cfg(windows)]
pub mod windows_impl {
    use super::ProcessThreads;
    use std::io;
    use std::mem;
    use std::ptr;
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect};
    use winapi::um::processthreadsapi::{
        GetCurrentProcessId, GetThreadContext, OpenThread, ResumeThread, SetThreadContext,
        SuspendThread,
    };
    use winapi::um::tlhelp32::{
        CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
    };
    use winapi::um::winnt::{
        CONTEXT, CONTEXT_CONTROL, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
        THREAD_GET_CONTEXT, THREAD_SET_CONTEXT, THREAD_SUSPEND_RESUME,
    };

    /// Real, Windows-backed implementation of `ProcessThreads`. This is
    /// the code path exercised when the crate is actually injected into a
    /// running 32-bit host; it is never exercised by this workspace's own
    /// test suite, which runs on non-Windows CI and therefore against
    /// `hook::threads::FakeProcessThreads` instead.
    pub struct WindowsProcessThreads;

    impl ProcessThreads for WindowsProcessThreads {
        fn enumerate(&self, exclude: &[u32]) -> io::Result<Vec<u32>> {
            unsafe {
                let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0);
                if snapshot.is_null() {
                    return Err(io::Error::last_os_error());
                }
                let pid = GetCurrentProcessId();
                let mut entry: THREADENTRY32 = mem::zeroed();
                entry.dwSize = mem::size_of::<THREADENTRY32>() as u32;
                let mut ids = Vec::new();
                if Thread32First(snapshot, &mut entry) != 0 {
                    loop {
                        if entry.th32OwnerProcessID == pid && !exclude.contains(&entry.th32ThreadID) {
                            ids.push(entry.th32ThreadID);
                        }
                        if Thread32Next(snapshot, &mut entry) == 0 {
                            break;
                        }
                    }
                }
                CloseHandle(snapshot);
                Ok(ids)
            }
        }

        fn suspend_all(&self, thread_ids: &[u32]) -> io::Result<()> {
            for &tid in thread_ids {
                unsafe {
                    let handle = OpenThread(THREAD_SUSPEND_RESUME, 0, tid);
                    if !handle.is_null() {
                        SuspendThread(handle);
                        CloseHandle(handle);
                    }
                }
            }
            Ok(())
        }

        fn resume_all(&self, thread_ids: &[u32]) -> io::Result<()> {
            for &tid in thread_ids {
                unsafe {
                    let handle = OpenThread(THREAD_SUSPEND_RESUME, 0, tid);
                    if !handle.is_null() {
                        ResumeThread(handle);
                        CloseHandle(handle);
                    }
                }
            }
            Ok(())
        }

        fn instruction_pointer(&self, thread_id: u32) -> io::Result<usize> {
            unsafe {
                let handle = OpenThread(THREAD_GET_CONTEXT | THREAD_SET_CONTEXT, 0, thread_id);
                if handle.is_null() {
                    return Err(io::Error::last_os_error());
                }
                let mut ctx: CONTEXT = mem::zeroed();
                ctx.ContextFlags = CONTEXT_CONTROL;
                let ok = GetThreadContext(handle, &mut ctx);
                CloseHandle(handle);
                if ok == 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(ctx.Eip as usize)
            }
        }

        fn patch_memory(&self, address: usize, bytes: &[u8]) -> io::Result<()> {
            unsafe {
                let mut old_protect = 0u32;
                if VirtualProtect(
                    address as *mut _,
                    bytes.len(),
                    PAGE_EXECUTE_READWRITE,
                    &mut old_protect,
                ) == 0
                {
                    return Err(io::Error::last_os_error());
                }
                ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
                let mut restored = 0u32;
                VirtualProtect(address as *mut _, bytes.len(), old_protect, &mut restored);
                winapi::um::processthreadsapi::FlushInstructionCache(
                    winapi::um::processthreadsapi::GetCurrentProcess(),
                    address as *const _,
                    bytes.len(),
                );
                Ok(())
            }
        }

        fn alloc_executable(&self, len: usize) -> io::Result<usize> {
            unsafe {
                let ptr = VirtualAlloc(
                    ptr::null_mut(),
                    len,
                    MEM_COMMIT | MEM_RESERVE,
                    PAGE_EXECUTE_READWRITE,
                );
                if ptr.is_null() {
                    return Err(io::Error::last_os_error());
                }
                Ok(ptr as usize)
            }
        }

        fn free_executable(&self, address: usize, _len: usize) -> io::Result<()> {
            unsafe {
                if VirtualFree(address as *mut _, 0, MEM_RELEASE) == 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        }
    }
}

/// In-memory fake used by unit tests and by `instrument-hostsim`: models
/// threads as plain instruction-pointer values the test sets directly,
/// and "patches" a `Vec<u8>` scratch region instead of live process
/// memory.
pub struct FakeProcessThreads {
    threads: parking_lot::Mutex<std::collections::HashMap<u32, FakeThread>>,
    arena: parking_lot::Mutex<Vec<u8>>,
}

struct FakeThread {
    instruction_pointer: usize,
    suspended: bool,
}

impl FakeProcessThreads {
    pub fn new() -> FakeProcessThreads {
        FakeProcessThreads {
            threads: parking_lot::Mutex::new(std::collections::HashMap::new()),
            arena: parking_lot::Mutex::new(vec![0u8; 0]),
        }
    }

    pub fn set_thread(&self, thread_id: u32, ip: usize) {
        self.threads
            .lock()
            .insert(thread_id, FakeThread { instruction_pointer: ip, suspended: false });
    }

    pub fn is_suspended(&self, thread_id: u32) -> bool {
        self.threads.lock().get(&thread_id).map(|t| t.suspended).unwrap_or(false)
    }
}

impl Default for FakeProcessThreads {
    fn default() -> Self {
        FakeProcessThreads::new()
    }
}

impl ProcessThreads for FakeProcessThreads {
    fn enumerate(&self, exclude: &[u32]) -> std::io::Result<Vec<u32>> {
        Ok(self
            .threads
            .lock()
            .keys()
            .copied()
            .filter(|id| !exclude.contains(id))
            .collect())
    }

    fn suspend_all(&self, thread_ids: &[u32]) -> std::io::Result<()> {
        let mut threads = self.threads.lock();
        for id in thread_ids {
            if let Some(t) = threads.get_mut(id) {
                t.suspended = true;
            }
        }
        Ok(())
    }

    fn resume_all(&self, thread_ids: &[u32]) -> std::io::Result<()> {
        let mut threads = self.threads.lock();
        for id in thread_ids {
            if let Some(t) = threads.get_mut(id) {
                t.suspended = false;
            }
        }
        Ok(())
    }

    fn instruction_pointer(&self, thread_id: u32) -> std::io::Result<usize> {
        self.threads
            .lock()
            .get(&thread_id)
            .map(|t| t.instruction_pointer)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "unknown thread"))
    }

    fn patch_memory(&self, address: usize, bytes: &[u8]) -> std::io::Result<()> {
        let mut arena = self.arena.lock();
        let end = address + bytes.len();
        if arena.len() < end {
            arena.resize(end, 0);
        }
        arena[address..end].copy_from_slice(bytes);
        Ok(())
    }

    fn alloc_executable(&self, len: usize) -> std::io::Result<usize> {
        let mut arena = self.arena.lock();
        let base = arena.len();
        arena.resize(base + len, 0);
        Ok(base)
    }

    fn free_executable(&self, _address: usize, _len: usize) -> std::io::Result<()> {
        Ok(())
    }
}
