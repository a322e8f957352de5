//! The privileged RPC link between MASTER and RPC_SERVER.
//!
//! One connected `AF_UNIX/SOCK_STREAM` socket carries length-prefixed JSON
//! frames; requests are strictly synchronous, the client blocks on each
//! reply. A second socket exists only for `SCM_RIGHTS` descriptor transfers
//! (its payloads are a single null byte). The server side is the only code
//! in the process tree that performs capability-requiring syscalls, and each
//! handler escalates around exactly the work that needs it.

pub mod client;
pub mod fdpass;
pub mod msg;
pub mod server;
pub mod wire;

pub use client::RpcOps;
pub use msg::{Reply, Request, RpcFailure, RpcFailureKind};
pub use server::RpcServer;
