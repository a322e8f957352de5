//! Vessel container launcher core.
//!
//! A single invocation moves through four process roles sharing one memory
//! region and three socketpairs:
//!
//! ```text
//! STAGE1 ──(engine config blob)──▶ fork ──▶ MASTER ◀──rpc──▶ RPC_SERVER
//!                                    │
//!                                    └────▶ STAGE2 (container process)
//! ```
//!
//! STAGE1 validates the request and opens images. MASTER plans and executes
//! the container filesystem by issuing typed requests to RPC_SERVER (the only
//! role that performs capability-requiring syscalls), then monitors the
//! container until exit. STAGE2 applies the final capability sets and execs
//! the user command after the RPC sibling has pivoted their shared root.

pub mod cleanup;
pub mod drivers;
pub mod image;
pub mod loopdev;
pub mod mainthread;
pub mod monitor;
pub mod mounts;
pub mod privilege;
pub mod rpc;
pub mod session;
pub mod stages;
pub mod starter;
pub mod util;

pub use vessel_shared::{EngineConfig, SystemConfig, VesselError, VesselResult};
