//! The mount plan: tag-partitioned, ordered storage plus per-tag hooks.

use std::collections::BTreeMap;
use std::path::Path;

use vessel_shared::errors::{VesselError, VesselResult};

use crate::session::Session;

use super::ops::MountOps;
use super::point::{MountPoint, Tag};

/// Context handed to tag hooks.
pub struct HookContext<'a> {
    pub ops: &'a mut dyn MountOps,
    pub session: &'a mut Session,
}

/// A hook run before or after a tag's entries execute.
pub type Hook = Box<dyn FnMut(&mut HookContext) -> VesselResult<()> + Send>;

/// Tagged ordered multiset of mount points.
#[derive(Default)]
pub struct MountPlan {
    entries: BTreeMap<Tag, Vec<MountPoint>>,
    before_hooks: BTreeMap<Tag, Vec<Hook>>,
    after_hooks: BTreeMap<Tag, Vec<Hook>>,
}

impl MountPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry under a tag. Attached entries (remount/propagation)
    /// must follow a primary entry at the same destination somewhere in the
    /// plan; this is checked here so execution never discovers a dangling
    /// remount.
    pub fn add(&mut self, tag: Tag, point: MountPoint) -> VesselResult<()> {
        if point.is_attached() && !self.has_primary_for(&point.destination) {
            return Err(VesselError::Session(format!(
                "remount/propagation at {} has no prior mount",
                point.destination.display()
            )));
        }
        self.entries.entry(tag).or_default().push(point);
        Ok(())
    }

    pub fn add_before_hook(&mut self, tag: Tag, hook: Hook) {
        self.before_hooks.entry(tag).or_default().push(hook);
    }

    pub fn add_after_hook(&mut self, tag: Tag, hook: Hook) {
        self.after_hooks.entry(tag).or_default().push(hook);
    }

    /// Entries of one tag, insertion order.
    pub fn entries(&self, tag: Tag) -> &[MountPoint] {
        self.entries.get(&tag).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All entries in execution order.
    pub fn iter(&self) -> impl Iterator<Item = (Tag, &MountPoint)> {
        Tag::ORDER
            .iter()
            .flat_map(move |tag| self.entries(*tag).iter().map(move |p| (*tag, p)))
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The last non-attached entry at `destination`, i.e. the mount a
    /// remount reconciles against.
    pub fn primary_for(&self, destination: &Path) -> Option<&MountPoint> {
        self.iter()
            .map(|(_, p)| p)
            .filter(|p| !p.is_attached() && p.destination == destination)
            .last()
    }

    fn has_primary_for(&self, destination: &Path) -> bool {
        self.primary_for(destination).is_some()
    }

    pub(super) fn run_before_hooks(
        &mut self,
        tag: Tag,
        ctx: &mut HookContext,
    ) -> VesselResult<()> {
        if let Some(hooks) = self.before_hooks.get_mut(&tag) {
            for hook in hooks {
                hook(ctx)?;
            }
        }
        Ok(())
    }

    pub(super) fn run_after_hooks(&mut self, tag: Tag, ctx: &mut HookContext) -> VesselResult<()> {
        if let Some(hooks) = self.after_hooks.get_mut(&tag) {
            for hook in hooks {
                hook(ctx)?;
            }
        }
        Ok(())
    }

    /// Destinations in insertion order, for cleanup's reverse unmount walk.
    pub fn destinations(&self) -> Vec<std::path::PathBuf> {
        self.iter()
            .filter(|(_, p)| !p.is_attached())
            .map(|(_, p)| p.destination.clone())
            .collect()
    }
}
