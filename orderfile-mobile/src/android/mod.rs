pub mod adb;
pub mod device;
pub mod emulator;

pub use device::{ConnectionStatus, Device, install, select_device};
pub use emulator::{EmulatorOptions, EmulatorScope, PollPolicy};
