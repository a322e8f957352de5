//! Stage role bodies.
//!
//! One module per role: STAGE1 validates and resolves the launch, MASTER
//! drives container setup and monitors it, STAGE2 becomes the container.
//! (RPC_SERVER's body lives in [`crate::rpc::server`].) The starter binary
//! dispatches to these after reading the stage selector.

pub mod context;
pub mod master;
pub mod stage1;
pub mod stage2;

pub use context::ContainerContext;
