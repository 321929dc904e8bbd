//! Core types and subsystems for the in-process instrumentation runtime.
//!
//! This crate implements the five components: the hook engine (`hook`), the
//! command registry and manager (`command`), the transport (`transport`),
//! the typed storage singleton (`storage`) and the callback bridge
//! (`bridge`). Wiring them into a running `Runtime` lives in the sibling
//! `instrument-runtime` crate; this crate only defines the pieces and their
//! contracts.

pub mod bridge;
pub mod command;
pub mod config;
pub mod error;
pub mod hook;
pub mod message;
pub mod storage;
pub mod transport;

pub use error::{Error, Result};
