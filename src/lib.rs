//! Horizon Core - the scheduling and IPC core of a console microkernel
//!
//! This crate provides the kernel's thread scheduler, its synchronization
//! objects, port and session IPC, per-process handle tables and resource
//! limits. Hardware is reached only through [`arch::Platform`], so the same
//! core runs on a board or, with the `std` feature, on host threads.

#![no_std]
// Kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

// Core types
pub mod config;
pub mod result;
pub mod types;

pub mod arch;
pub mod console;
pub mod ipc;
pub mod kern;
pub mod svc;

pub use config::KernelConfig;
pub use kern::kernel::Kernel;
pub use result::{KernelError, KernelResult};

/// Kernel version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Kernel name
pub const NAME: &str = "Horizon Core";

/// Install the kernel logger at `level`
///
/// Output goes to the sink registered with [`console::set_sink`].
pub fn init(level: log::LevelFilter) {
    console::init(level);
    log::info!("{} {} starting", NAME, VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(NAME, "Horizon Core");
        assert!(!VERSION.is_empty());
    }
}
