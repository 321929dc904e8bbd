//! Transport (T, spec.md §4.3).

pub mod framing;
pub mod http;
pub mod reactor;

pub use reactor::Reactor;
