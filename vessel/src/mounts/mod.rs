//! Mount planning and execution.
//!
//! The container filesystem is assembled as a *plan*: a tag-ordered multiset
//! of mount points with per-tag before/after hooks. MASTER builds the plan
//! (`planner`), then drives it once (`exec`) against the [`ops::MountOps`]
//! seam — the RPC client in production, a recording fake in tests. Tag order
//! is total; within a tag, insertion order is preserved; remount and
//! propagation entries always follow the primary mount at the same
//! destination.

pub mod exec;
pub mod mountinfo;
pub mod ops;
pub mod plan;
pub mod planner;
pub mod point;
pub mod reconcile;

pub use exec::MountExecutor;
pub use ops::{ChrootMethod, LoopAttach, MountOps};
pub use plan::MountPlan;
pub use planner::Planner;
pub use point::{InternalFlags, MountPoint, Tag};
