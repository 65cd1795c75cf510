//! Process supervision and the per-process event loop (§3, §4.3).

pub mod signals;
pub mod supervisor;

pub use supervisor::Reactor;
