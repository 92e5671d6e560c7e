//! Job runner: registry, cron timers, dispatcher and run history.
//!
//! Split into focused submodules:
//! - `core`: Runner struct, registration, scheduling API and read projections
//! - `dispatch`: per-schedule timer tasks and the single dispatcher loop
//! - `execution`: running one job to its terminal status

mod core;
mod dispatch;
mod execution;
#[cfg(test)]
mod tests;

pub use self::core::{Runner, ShutdownHandle};
