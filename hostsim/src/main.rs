//! Standalone host simulator.
//!
//! Stands in for the game process an injected runtime would normally live
//! inside: it owns a fake hookable update function, drives a fixed-rate
//! game loop calling into the runtime's per-frame callback, and exposes
//! the runtime's RPC listener on a real loopback socket. Grounded on
//! `server/services/authenticator/src/main.rs`'s clap-args-then-serve
//! shape, re-targeted from an HTTP auth service to this instrumentation
//! host.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use instrument_core::config::RuntimeConfig;
use instrument_runtime::Runtime;

#[derive(Parser, Debug)]
#[command(name = "instrument-hostsim", about = "Runs a simulated game host with the instrumentation runtime attached")]
struct Args {
    /// Path to a TOML config file. Falls back to defaults when omitted.
    #[arg(long)]
    config: Option<String>,

    /// Number of simulated frames to run before shutting down. 0 runs
    /// until interrupted.
    #[arg(long, default_value_t = 0)]
    frames: u64,

    /// Simulated frame interval, in milliseconds.
    #[arg(long, default_value_t = 16)]
    frame_interval_ms: u64,
}

/// A stand-in for a hookable update function inside the host process:
/// just an address-like counter and a tick count the fake hook target
/// touches. Nothing here is ever executed as machine code — the hook
/// engine's `FakeProcessThreads` backend never dereferences `instruction_pointer`
/// values as real addresses.
struct FakeHookTarget {
    tick: AtomicU32,
}

impl FakeHookTarget {
    fn update(&self) -> u32 {
        self.tick.fetch_add(1, Ordering::SeqCst)
    }
}

fn main() {
    let args = Args::parse();
    instrument_runtime::init_logging();

    let config = match &args.config {
        Some(path) => {
            let contents = std::fs::read_to_string(path).expect("failed to read config file");
            RuntimeConfig::from_toml_str(&contents).expect("failed to parse config file")
        }
        None => RuntimeConfig::default(),
    };

    let runtime = Runtime::new_for_test(config).expect("failed to construct runtime");
    let addr = runtime.listen().expect("failed to start RPC listener");
    tracing::info!(%addr, "hostsim listening");

    let target = Arc::new(FakeHookTarget { tick: AtomicU32::new(0) });
    let mut frame: u64 = 0;
    loop {
        if args.frames != 0 && frame >= args.frames {
            break;
        }
        let tick = target.update();
        let snapshot = serde_json::to_vec(&serde_json::json!({ "frame": frame, "tick": tick })).unwrap_or_default();
        runtime.bridge.on_frame(snapshot);

        std::thread::sleep(Duration::from_millis(args.frame_interval_ms));
        frame += 1;
    }

    tracing::info!(frames = frame, "hostsim shutting down");
    runtime.shutdown();
}
