//! Plumbing shared by every stage of orderfile generation: running external
//! commands and driving Android devices and emulators over `adb`.
//!
//! Nothing in here talks to a process directly except
//! [`exec::SystemRunner`]. Everything else goes through the [`exec::Runner`]
//! trait, so device and emulator logic can be exercised against a scripted
//! runner.

pub mod android;
pub mod env;
pub mod exec;

pub use env::Env;
pub use exec::{Invocation, Output, Process, Runner, SystemRunner};
