//! Shared types for the vessel container launcher.
//!
//! This crate holds everything that crosses a stage boundary: the error
//! taxonomy, the engine configuration record that STAGE1 serializes through
//! shared memory, the system configuration snapshot, and assorted constants.
//! The core runtime lives in the `vessel` crate; keeping these types in a
//! separate crate keeps the stage roles honest about what they may exchange.

pub mod config;
pub mod constants;
pub mod errors;
pub mod sysconf;

pub use config::EngineConfig;
pub use errors::{VesselError, VesselResult};
pub use sysconf::SystemConfig;
