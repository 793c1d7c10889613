//! Process group monitor.
//!
//! A process group here is the root process of a launch plus every process
//! it transitively forks, kept as one flat set. Descendants can be reported
//! in any order relative to the root's exit; only membership matters.

use crate::error::{Error, Result};
use crate::process::{self, ExitStatus};
use chrono::{DateTime, Utc};
use nix::unistd::Pid;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, warn};

/// Handle naming a tracked group.
///
/// The generation tells apart groups whose roots were given the same pid, so
/// a handle never reaches a later group that reuses its root pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupHandle {
    root: Pid,
    generation: u64,
}

impl GroupHandle {
    /// The directly launched process.
    pub fn root_pid(&self) -> Pid {
        self.root
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for GroupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.root, self.generation)
    }
}

/// Collects the exit status of a root process the kernel reported as exited.
pub trait Reaper {
    fn reap(&self, pid: Pid) -> Result<Option<ExitStatus>>;
}

/// Reaps with a blocking `waitpid` on the exact pid.
#[derive(Debug, Default)]
pub struct WaitReaper;

impl Reaper for WaitReaper {
    fn reap(&self, pid: Pid) -> Result<Option<ExitStatus>> {
        process::reap(pid)
    }
}

/// One root process and its flattened descendants.
#[derive(Debug, Clone)]
pub struct ProcessGroup {
    root_pid: Pid,
    root_exited: bool,
    root_exit_status: Option<ExitStatus>,
    descendants: BTreeSet<Pid>,
    started_at: DateTime<Utc>,
    tracking_errors: u32,
    completion_reported: bool,
}

impl ProcessGroup {
    pub fn new(root_pid: Pid) -> Self {
        Self {
            root_pid,
            root_exited: false,
            root_exit_status: None,
            descendants: BTreeSet::new(),
            started_at: Utc::now(),
            tracking_errors: 0,
            completion_reported: false,
        }
    }

    pub fn root_pid(&self) -> Pid {
        self.root_pid
    }

    pub fn root_exited(&self) -> bool {
        self.root_exited
    }

    pub fn root_exit_status(&self) -> Option<ExitStatus> {
        self.root_exit_status
    }

    pub fn descendants(&self) -> &BTreeSet<Pid> {
        &self.descendants
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn tracking_errors(&self) -> u32 {
        self.tracking_errors
    }

    /// Whether the root and every known descendant have exited.
    pub fn is_empty(&self) -> bool {
        self.root_exited && self.descendants.is_empty()
    }

    /// Add a reported descendant. Allowed after the root has exited.
    pub fn add_descendant(&mut self, pid: Pid) {
        self.descendants.insert(pid);
    }

    /// Record the exit of the root or a descendant.
    ///
    /// Returns true on the transition to fully exited, and only then.
    pub fn record_exit(&mut self, pid: Pid, status: ExitStatus) -> Result<bool> {
        if pid == self.root_pid {
            if self.root_exited {
                return Err(Error::invariant(format!(
                    "duplicate exit for root pid {}",
                    pid
                )));
            }
            self.root_exited = true;
            self.root_exit_status = Some(status);
        } else if !self.descendants.remove(&pid) {
            return Err(Error::invariant(format!(
                "pid {} is not a descendant of group {}",
                pid, self.root_pid
            )));
        }

        if self.is_empty() && !self.completion_reported {
            self.completion_reported = true;
            return Ok(true);
        }
        Ok(false)
    }

    /// Root pid (if still running) plus all live descendants.
    pub fn active_pids(&self) -> BTreeSet<Pid> {
        let mut pids = self.descendants.clone();
        if !self.root_exited {
            pids.insert(self.root_pid);
        }
        pids
    }

    pub fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            root_pid: (!self.root_exited).then_some(self.root_pid),
            active_pids: self.active_pids(),
            started_at: self.started_at,
            tracking_errors: self.tracking_errors,
        }
    }
}

/// Point-in-time view of one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSnapshot {
    /// Root pid, or `None` once the root has exited
    pub root_pid: Option<Pid>,
    /// Every process of the group still running
    pub active_pids: BTreeSet<Pid>,
    pub started_at: DateTime<Utc>,
    pub tracking_errors: u32,
}

impl Serialize for GroupSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("GroupSnapshot", 4)?;
        state.serialize_field("root_pid", &self.root_pid.map(Pid::as_raw))?;
        let active: Vec<i32> = self.active_pids.iter().map(|p| p.as_raw()).collect();
        state.serialize_field("active_pids", &active)?;
        state.serialize_field("started_at", &self.started_at)?;
        state.serialize_field("tracking_errors", &self.tracking_errors)?;
        state.end()
    }
}

/// Tracks every launched process group.
pub struct ProcessGroupMonitor {
    groups: BTreeMap<GroupHandle, ProcessGroup>,
    reaper: Box<dyn Reaper>,
    next_generation: u64,
}

impl ProcessGroupMonitor {
    pub fn new(reaper: Box<dyn Reaper>) -> Self {
        Self {
            groups: BTreeMap::new(),
            reaper,
            next_generation: 1,
        }
    }

    /// Start tracking a freshly forked root process.
    ///
    /// A completed group waiting for cleanup does not block a new group whose
    /// root was given the same pid.
    pub fn track(&mut self, root_pid: Pid) -> Result<GroupHandle> {
        let running = self
            .groups
            .iter()
            .any(|(handle, group)| handle.root == root_pid && !group.root_exited);
        if running {
            return Err(Error::invariant(format!(
                "process group {} is already tracked",
                root_pid
            )));
        }

        let handle = GroupHandle {
            root: root_pid,
            generation: self.next_generation,
        };
        self.next_generation += 1;
        self.groups.insert(handle, ProcessGroup::new(root_pid));
        info!(group = %handle, "Tracking process group");
        Ok(handle)
    }

    /// Record a descendant reported by the kernel.
    pub fn on_descendant_spawned(&mut self, handle: GroupHandle, child: Pid) -> Result<()> {
        let group = self.group_mut(handle)?;
        group.add_descendant(child);
        debug!(group = %handle, pid = child.as_raw(), "Descendant spawned");
        Ok(())
    }

    /// Record an exit; returns true when the whole group has now exited.
    ///
    /// The root is reaped right away so it never lingers as a zombie.
    pub fn on_exit(&mut self, handle: GroupHandle, pid: Pid, status: ExitStatus) -> Result<bool> {
        let group = self.groups.get_mut(&handle).ok_or(Error::GroupNotFound(handle.root.as_raw()))?;
        let fully_exited = group.record_exit(pid, status)?;

        if pid == handle.root_pid() {
            debug!(group = %handle, status = %status, "Root process exited");
            match self.reaper.reap(pid) {
                Ok(Some(reaped)) if reaped != status => {
                    warn!(group = %handle, reported = %status, reaped = %reaped, "Reaped status differs from reported status");
                }
                Ok(_) => {}
                Err(e) => warn!(group = %handle, error = %e, "Failed to reap root process"),
            }
        } else {
            debug!(group = %handle, pid = pid.as_raw(), "Descendant exited");
        }

        if fully_exited {
            info!(group = %handle, "Process group fully exited");
        }
        Ok(fully_exited)
    }

    /// Count a descendant the kernel failed to track.
    pub fn note_tracking_error(&mut self, handle: GroupHandle) -> Result<()> {
        let group = self.group_mut(handle)?;
        group.tracking_errors += 1;
        Ok(())
    }

    /// Root pid (if running) plus live descendants of a group.
    pub fn active_pids(&self, handle: GroupHandle) -> Result<BTreeSet<Pid>> {
        self.get(handle)
            .map(ProcessGroup::active_pids)
            .ok_or(Error::GroupNotFound(handle.root.as_raw()))
    }

    pub fn get(&self, handle: GroupHandle) -> Option<&ProcessGroup> {
        self.groups.get(&handle)
    }

    /// Stop tracking a group.
    pub fn remove(&mut self, handle: GroupHandle) -> Option<ProcessGroup> {
        let removed = self.groups.remove(&handle);
        if removed.is_some() {
            debug!(group = %handle, "Removed process group");
        }
        removed
    }

    pub fn handles(&self) -> Vec<GroupHandle> {
        self.groups.keys().copied().collect()
    }

    /// Snapshot of every tracked group, ordered by root pid.
    pub fn snapshot(&self) -> Vec<GroupSnapshot> {
        self.groups.values().map(ProcessGroup::snapshot).collect()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn group_mut(&mut self, handle: GroupHandle) -> Result<&mut ProcessGroup> {
        self.groups
            .get_mut(&handle)
            .ok_or(Error::GroupNotFound(handle.root.as_raw()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Records reap requests instead of calling waitpid.
    #[derive(Default, Clone)]
    struct RecordingReaper {
        reaped: Rc<RefCell<Vec<Pid>>>,
    }

    impl Reaper for RecordingReaper {
        fn reap(&self, pid: Pid) -> Result<Option<ExitStatus>> {
            self.reaped.borrow_mut().push(pid);
            Ok(None)
        }
    }

    fn pid(raw: i32) -> Pid {
        Pid::from_raw(raw)
    }

    fn ok() -> ExitStatus {
        ExitStatus::from_code(0)
    }

    fn monitor() -> (ProcessGroupMonitor, RecordingReaper) {
        let reaper = RecordingReaper::default();
        (ProcessGroupMonitor::new(Box::new(reaper.clone())), reaper)
    }

    #[test]
    fn test_root_only_group_completes_on_root_exit() {
        let (mut mon, reaper) = monitor();
        let group = mon.track(pid(400)).unwrap();

        assert!(mon.on_exit(group, pid(400), ok()).unwrap());
        assert_eq!(*reaper.reaped.borrow(), vec![pid(400)]);
        assert_eq!(
            mon.get(group).unwrap().root_exit_status(),
            Some(ExitStatus::from_code(0))
        );
    }

    #[test]
    fn test_completion_waits_for_descendants() {
        let (mut mon, _) = monitor();
        let group = mon.track(pid(400)).unwrap();
        mon.on_descendant_spawned(group, pid(401)).unwrap();

        assert!(!mon.on_exit(group, pid(400), ok()).unwrap());
        assert_eq!(mon.active_pids(group).unwrap(), BTreeSet::from([pid(401)]));
        assert!(mon.on_exit(group, pid(401), ok()).unwrap());
    }

    #[test]
    fn test_descendant_exit_after_root_exit_completes_group() {
        let (mut mon, _) = monitor();
        let group = mon.track(pid(400)).unwrap();
        mon.on_descendant_spawned(group, pid(500)).unwrap();
        mon.on_exit(group, pid(400), ok()).unwrap();

        assert!(mon.on_exit(group, pid(500), ok()).unwrap());
        assert!(mon.get(group).unwrap().is_empty());
    }

    #[test]
    fn test_descendant_reported_after_root_exit() {
        let (mut mon, _) = monitor();
        let group = mon.track(pid(400)).unwrap();
        mon.on_descendant_spawned(group, pid(401)).unwrap();
        assert!(!mon.on_exit(group, pid(400), ok()).unwrap());

        // grandchild reported after the root is gone
        mon.on_descendant_spawned(group, pid(402)).unwrap();
        assert!(!mon.on_exit(group, pid(401), ok()).unwrap());
        assert!(mon.on_exit(group, pid(402), ok()).unwrap());
    }

    #[test]
    fn test_unknown_descendant_exit_is_invariant_violation() {
        let (mut mon, _) = monitor();
        let group = mon.track(pid(400)).unwrap();
        assert_matches!(
            mon.on_exit(group, pid(999), ok()),
            Err(Error::Invariant(_))
        );
    }

    #[test]
    fn test_duplicate_descendant_exit_is_invariant_violation() {
        let (mut mon, _) = monitor();
        let group = mon.track(pid(400)).unwrap();
        mon.on_descendant_spawned(group, pid(401)).unwrap();
        mon.on_exit(group, pid(401), ok()).unwrap();
        assert_matches!(
            mon.on_exit(group, pid(401), ok()),
            Err(Error::Invariant(_))
        );
    }

    #[test]
    fn test_duplicate_root_exit_is_invariant_violation() {
        let (mut mon, _) = monitor();
        let group = mon.track(pid(400)).unwrap();
        mon.on_descendant_spawned(group, pid(401)).unwrap();
        mon.on_exit(group, pid(400), ok()).unwrap();
        assert_matches!(
            mon.on_exit(group, pid(400), ok()),
            Err(Error::Invariant(_))
        );
    }

    #[test]
    fn test_completion_reported_once() {
        let (mut mon, _) = monitor();
        let group = mon.track(pid(400)).unwrap();
        assert!(mon.on_exit(group, pid(400), ok()).unwrap());

        mon.on_descendant_spawned(group, pid(401)).unwrap();
        assert!(!mon.on_exit(group, pid(401), ok()).unwrap());
    }

    #[test]
    fn test_tracking_same_root_twice_is_rejected() {
        let (mut mon, _) = monitor();
        mon.track(pid(400)).unwrap();
        assert_matches!(mon.track(pid(400)), Err(Error::Invariant(_)));
    }

    #[test]
    fn test_reused_root_pid_is_a_new_group() {
        let (mut mon, _) = monitor();
        let old = mon.track(pid(400)).unwrap();
        assert!(mon.on_exit(old, pid(400), ok()).unwrap());

        // the old group is still waiting for cleanup when the pid comes back
        let new = mon.track(pid(400)).unwrap();
        assert_ne!(old, new);
        assert_eq!(new.root_pid(), pid(400));

        assert!(mon.remove(old).is_some());
        assert_eq!(mon.handles(), vec![new]);
        assert_eq!(mon.active_pids(new).unwrap(), BTreeSet::from([pid(400)]));
        assert!(mon.remove(old).is_none());
    }

    #[test]
    fn test_unknown_group() {
        let (mut mon, _) = monitor();
        let group = mon.track(pid(400)).unwrap();
        mon.remove(group);
        assert_matches!(
            mon.on_descendant_spawned(group, pid(401)),
            Err(Error::GroupNotFound(400))
        );
        assert_matches!(mon.active_pids(group), Err(Error::GroupNotFound(400)));
    }

    #[test]
    fn test_active_pids_include_running_root() {
        let (mut mon, _) = monitor();
        let group = mon.track(pid(400)).unwrap();
        mon.on_descendant_spawned(group, pid(402)).unwrap();
        mon.on_descendant_spawned(group, pid(401)).unwrap();
        mon.on_descendant_spawned(group, pid(401)).unwrap();

        assert_eq!(
            mon.active_pids(group).unwrap(),
            BTreeSet::from([pid(400), pid(401), pid(402)])
        );
    }

    #[test]
    fn test_snapshot_hides_exited_root() {
        let (mut mon, _) = monitor();
        let a = mon.track(pid(400)).unwrap();
        mon.track(pid(300)).unwrap();
        mon.on_descendant_spawned(a, pid(401)).unwrap();
        mon.on_exit(a, pid(400), ok()).unwrap();

        let snapshot = mon.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].root_pid, Some(pid(300)));
        assert_eq!(snapshot[1].root_pid, None);
        assert_eq!(snapshot[1].active_pids, BTreeSet::from([pid(401)]));
    }

    #[test]
    fn test_snapshot_serializes_raw_pids() {
        let (mut mon, _) = monitor();
        let group = mon.track(pid(400)).unwrap();
        mon.on_descendant_spawned(group, pid(401)).unwrap();

        let json = serde_json::to_value(&mon.snapshot()[0]).unwrap();
        assert_eq!(json["root_pid"], 400);
        assert_eq!(json["active_pids"], serde_json::json!([400, 401]));
        assert_eq!(json["tracking_errors"], 0);
    }

    #[test]
    fn test_tracking_errors_counted() {
        let (mut mon, _) = monitor();
        let group = mon.track(pid(400)).unwrap();
        mon.note_tracking_error(group).unwrap();
        assert_eq!(mon.get(group).unwrap().tracking_errors(), 1);
    }
}
