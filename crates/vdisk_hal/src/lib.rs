//! vdisk Hardware Abstraction Layer (HAL)
//!
//! This crate isolates everything that touches the host directly: spawning
//! external tools, looking up file ownership and the identity of the current
//! process, and querying the kernel for loaded modules and block devices.
//!
//! The HAL is designed to:
//! - Keep subprocess handling behind a single trait so callers can be tested
//!   with scripted runners
//! - Keep platform-specific calls out of the provisioning engine

pub mod command;
pub mod error;
pub mod fs;
pub mod platform;

pub use error::{HalError, HalResult};

pub use command::{command_exists, CommandResult, CommandRunner, SystemRunner};
pub use fs::{current_owner, drop_cached_range, owner_of, Ownership};
pub use platform::{enumerate_block_devices, module_loaded};
