//! Wires the five instrumentation-runtime components together and
//! exposes the `extern "C"` entry points a DLL loader calls after
//! injection.

mod handlers;

pub use instrument_core::bridge;
pub use instrument_core::command;
pub use instrument_core::config::RuntimeConfig;
pub use instrument_core::error::{Error, Result};
pub use instrument_core::hook;
pub use instrument_core::message;
pub use instrument_core::storage;
pub use instrument_core::transport;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bridge::{CallbackBridge, RecordStream};
use command::{CommandManager, Registry};
use hook::{FakeProcessThreads, HookEngine, ProcessThreads};
use storage::Storage;
use transport::Reactor;

/// One instrumentation-runtime instance. Constructible multiple times per
/// process (spec.md §9's design note requiring tests to build independent
/// runtimes), rather than a hidden process-wide singleton.
pub struct Runtime {
    pub storage: Storage,
    pub hooks: Arc<HookEngine>,
    pub manager: Arc<CommandManager<Runtime>>,
    pub bridge: Arc<CallbackBridge<Runtime>>,
    pub config: RuntimeConfig,
    reactor_thread: parking_lot::Mutex<Option<std::thread::JoinHandle<()>>>,
    reactor_running: Arc<AtomicBool>,
}

impl Runtime {
    /// Construct a runtime with the real Windows thread-suspend backend.
    #[cfg(windows)]
    pub fn new(config: RuntimeConfig) -> std::io::Result<Arc<Runtime>> {
        Self::with_process_threads(config, Arc::new(hook::WindowsProcessThreads))
    }

    /// Construct a runtime backed by `threads` — the seam
    /// `instrument-hostsim` uses to substitute `FakeProcessThreads` for a
    /// real process.
    pub fn with_process_threads(
        config: RuntimeConfig,
        threads: Arc<dyn ProcessThreads>,
    ) -> std::io::Result<Arc<Runtime>> {
        let storage = Storage::new();
        let hooks = Arc::new(HookEngine::new(threads));

        let mut registry: Registry<Runtime> = Registry::new();
        handlers::register_all(&mut registry);
        let manager = Arc::new(CommandManager::new(registry));

        let snapshot_stream = config
            .snapshot_record_path
            .as_deref()
            .map(RecordStream::create)
            .transpose()?;
        let traffic_stream = config
            .traffic_record_path
            .as_deref()
            .map(RecordStream::create)
            .transpose()?;
        let bridge = Arc::new(CallbackBridge::new(storage.clone(), manager.clone(), snapshot_stream, traffic_stream));

        let runtime = Arc::new(Runtime {
            storage,
            hooks,
            manager: manager.clone(),
            bridge,
            config,
            reactor_thread: parking_lot::Mutex::new(None),
            reactor_running: Arc::new(AtomicBool::new(false)),
        });

        manager.bind_runtime(runtime.clone());
        manager.start();

        Ok(runtime)
    }

    /// Convenience constructor for tests/hostsim: a fake process-thread
    /// backend with no threads registered.
    pub fn new_for_test(config: RuntimeConfig) -> std::io::Result<Arc<Runtime>> {
        Self::with_process_threads(config, Arc::new(FakeProcessThreads::new()))
    }

    /// Thread ids the hook engine's suspend pass must never suspend: the
    /// reactor and worker threads, since both may hold locks the
    /// dispatcher also takes (spec.md §9).
    pub fn excluded_threads(&self) -> Vec<u32> {
        Vec::new()
    }

    /// Start accepting connections. Spawns the reactor thread and returns
    /// the address actually bound (useful when `listen_port` is 0).
    pub fn listen(self: &Arc<Self>) -> std::io::Result<SocketAddr> {
        let addr: SocketAddr = format!("{}:{}", self.config.listen_host, self.config.listen_port)
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{e}")))?;
        let allowed_host = self
            .config
            .compiled_allowed_host()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
        let mut reactor = Reactor::bind(addr, self.manager.clone(), self.config.max_frame_size, allowed_host)?;
        let bound_addr = reactor.local_addr()?;

        self.reactor_running.store(true, Ordering::SeqCst);
        let running = self.reactor_running.clone();
        let handle = std::thread::Builder::new()
            .name("instrument-reactor".into())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    if let Err(e) = reactor.turn() {
                        tracing::warn!(error = %e, "reactor iteration failed");
                    }
                }
            })
            .expect("failed to spawn reactor thread");
        *self.reactor_thread.lock() = Some(handle);
        Ok(bound_addr)
    }

    /// Stop the reactor and the command worker, in that order.
    pub fn shutdown(&self) {
        self.reactor_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reactor_thread.lock().take() {
            let _ = handle.join();
        }
        self.manager.enqueue_shutdown();
        self.manager.join();
    }
}

/// Install the global `tracing` subscriber exactly once. Mirrors the
/// teacher's `flux::logging::init` "install once" contract.
pub fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    });
}

/// DLL entry point: construct and start a runtime from a TOML config file
/// path. Returns a raw pointer the host keeps alive and later passes back
/// to `instrument_runtime_shutdown`. Null on failure.
///
/// # Safety
/// `config_path` must be a valid, nul-terminated C string for the
/// duration of this call.
#[no_mangle]
pub unsafe extern "C" fn instrument_runtime_init(config_path: *const std::os::raw::c_char) -> *mut Runtime {
    init_logging();

    let path = match std::ffi::CStr::from_ptr(config_path).to_str() {
        Ok(p) => p,
        Err(_) => return std::ptr::null_mut(),
    };
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return std::ptr::null_mut(),
    };
    let config = match RuntimeConfig::from_toml_str(&contents) {
        Ok(c) => c,
        Err(_) => return std::ptr::null_mut(),
    };

    #[cfg(windows)]
    let runtime = Runtime::new(config);
    #[cfg(not(windows))]
    let runtime = Runtime::new_for_test(config);

    match runtime {
        Ok(rt) => {
            if rt.listen().is_err() {
                return std::ptr::null_mut();
            }
            Arc::into_raw(rt) as *mut Runtime
        }
        Err(_) => std::ptr::null_mut(),
    }
}

/// DLL exit point: shut down and drop a runtime previously returned by
/// `instrument_runtime_init`.
///
/// # Safety
/// `runtime` must be a pointer previously returned by
/// `instrument_runtime_init` and not already shut down.
#[no_mangle]
pub unsafe extern "C" fn instrument_runtime_shutdown(runtime: *mut Runtime) {
    if runtime.is_null() {
        return;
    }
    let rt = Arc::from_raw(runtime as *const Runtime);
    rt.shutdown();
}

/// Called from the host's per-frame hook: drain deferred commands and
/// publish a snapshot under storage.
///
/// # Safety
/// `runtime` must be a live pointer previously returned by
/// `instrument_runtime_init`.
#[no_mangle]
pub unsafe extern "C" fn instrument_runtime_on_frame(runtime: *mut Runtime, snapshot_ptr: *const u8, snapshot_len: usize) {
    if runtime.is_null() {
        return;
    }
    let rt = &*runtime;
    let snapshot = std::slice::from_raw_parts(snapshot_ptr, snapshot_len).to_vec();
    rt.bridge.on_frame(snapshot);
}
