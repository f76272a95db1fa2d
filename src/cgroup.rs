//! Control-group tracking.
//!
//! Every started session owns a flat control group named after its id, so
//! resolving an arbitrary process back to its session is a matter of reading
//! the process's cgroup membership and matching the one path segment that
//! names a session. The tracker also implements the recursive teardown
//! primitives: killing and migrating an entire subtree of processes in the
//! face of concurrent forking.
//!
//! The raw kernel operations sit behind [`CgroupBackend`] so the convergence
//! logic can be exercised against a scripted process tree.

use std::{
    collections::HashSet,
    fmt, fs,
    io,
    path::{Path, PathBuf},
};

use rustix::process::{kill_process, Pid};
use tracing::{debug, trace, warn};

pub use rustix::process::Signal;

/// Primitive control-group operations, as provided by the kernel.
///
/// [`SysfsCgroup`] is the real implementation; tests substitute an in-memory
/// process tree.
pub trait CgroupBackend: fmt::Debug {
    /// Creates a group (and any missing parents).
    fn create(&mut self, group: &Path) -> io::Result<()>;

    /// Removes an empty group.
    fn remove(&mut self, group: &Path) -> io::Result<()>;

    /// Enumerates the pids currently member of `group`.
    fn processes(&mut self, group: &Path) -> io::Result<Vec<i32>>;

    /// Lists the direct child groups of `group`.
    fn subgroups(&mut self, group: &Path) -> io::Result<Vec<PathBuf>>;

    /// Delivers `signal` to a single process.
    fn signal(&mut self, pid: i32, signal: Signal) -> io::Result<()>;

    /// Moves a single process into `group`.
    fn attach(&mut self, group: &Path, pid: i32) -> io::Result<()>;
}

/// [`CgroupBackend`] against a mounted cgroup2 filesystem.
#[derive(Debug, Default)]
pub struct SysfsCgroup;

impl CgroupBackend for SysfsCgroup {
    fn create(&mut self, group: &Path) -> io::Result<()> {
        fs::create_dir_all(group)
    }

    fn remove(&mut self, group: &Path) -> io::Result<()> {
        fs::remove_dir(group)
    }

    fn processes(&mut self, group: &Path) -> io::Result<Vec<i32>> {
        let contents = fs::read_to_string(group.join("cgroup.procs"))?;
        Ok(contents.lines().filter_map(|line| line.trim().parse().ok()).collect())
    }

    fn subgroups(&mut self, group: &Path) -> io::Result<Vec<PathBuf>> {
        let mut children = Vec::new();
        for entry in fs::read_dir(group)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                children.push(entry.path());
            }
        }
        Ok(children)
    }

    fn signal(&mut self, pid: i32, signal: Signal) -> io::Result<()> {
        let pid = Pid::from_raw(pid)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid pid"))?;
        kill_process(pid, signal).map_err(io::Error::from)
    }

    fn attach(&mut self, group: &Path, pid: i32) -> io::Result<()> {
        fs::write(group.join("cgroup.procs"), pid.to_string())
    }
}

/// Maps sessions to control groups and drives recursive teardown.
#[derive(Debug)]
pub struct CgroupTracker {
    backend: Box<dyn CgroupBackend>,
    root: PathBuf,
    hierarchy: String,
}

impl CgroupTracker {
    /// Creates a tracker rooted at `<mount>/<name>`.
    pub fn new(backend: Box<dyn CgroupBackend>, mount: impl Into<PathBuf>, name: &str) -> CgroupTracker {
        let mount = mount.into();
        CgroupTracker {
            backend,
            root: mount.join(name),
            hierarchy: format!("/{}", name),
        }
    }

    /// Tracker against the kernel's cgroup2 mount.
    pub fn system() -> CgroupTracker {
        CgroupTracker::new(Box::<SysfsCgroup>::default(), "/sys/fs/cgroup", "sessiond")
    }

    /// Filesystem path of the group owned by `session`.
    pub fn session_group(&self, session: &str) -> PathBuf {
        self.root.join(escape(session))
    }

    pub(crate) fn create_session_group(&mut self, session: &str) -> io::Result<PathBuf> {
        let group = self.session_group(session);
        self.backend.create(&group)?;
        debug!(group = %group.display(), "Created session cgroup");
        Ok(group)
    }

    pub(crate) fn remove_session_group(&mut self, session: &str) {
        let group = self.session_group(session);
        if let Err(err) = self.backend.remove(&group) {
            if err.kind() != io::ErrorKind::NotFound {
                debug!(group = %group.display(), "Leaving session cgroup behind: {}", err);
            }
        }
    }

    pub(crate) fn attach(&mut self, group: &Path, pid: i32) -> io::Result<()> {
        self.backend.attach(group, pid)
    }

    /// Whether `group` currently has no member processes.
    ///
    /// A group that is already gone counts as empty; that is the normal
    /// state of affairs during teardown.
    pub(crate) fn group_is_empty(&mut self, group: &Path) -> bool {
        match self.backend.processes(group) {
            Ok(procs) => procs.is_empty(),
            Err(_) => true,
        }
    }

    /// Signals every process in the subtree rooted at `group` until a full
    /// enumeration pass turns up nothing new, then recurses into children.
    ///
    /// Returns the number of processes signalled. Converges even against
    /// forking members: each pass only has to signal the processes that
    /// appeared since the last one. Callers apply their own timeout.
    pub fn kill_recursive(&mut self, group: &Path, signal: Signal, exclude: &[i32]) -> io::Result<usize> {
        let mut seen = HashSet::new();
        self.kill_tree(group, signal, exclude, &mut seen)
    }

    fn kill_tree(
        &mut self,
        group: &Path,
        signal: Signal,
        exclude: &[i32],
        seen: &mut HashSet<i32>,
    ) -> io::Result<usize> {
        let mut killed = 0;

        loop {
            let procs = match self.backend.processes(group) {
                Ok(procs) => procs,
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(killed),
                Err(err) => return Err(err),
            };

            let mut progressed = false;
            for pid in procs {
                if exclude.contains(&pid) || !seen.insert(pid) {
                    continue;
                }
                progressed = true;

                match self.backend.signal(pid, signal) {
                    Ok(()) => killed += 1,
                    // raced against the process exiting on its own
                    Err(err) if err.raw_os_error() == Some(libc::ESRCH) => {}
                    Err(err) => warn!(pid, "Failed to signal process: {}", err),
                }
            }

            if !progressed {
                break;
            }
        }

        for child in self.subgroups_or_empty(group) {
            killed += self.kill_tree(&child, signal, exclude, seen)?;
        }

        Ok(killed)
    }

    /// Moves every process in the subtree rooted at `from` into `to`,
    /// with the same seen-set convergence as [`kill_recursive`].
    ///
    /// A process that cannot be attached to `to` itself is attached to the
    /// nearest ancestor of `to` that accepts it.
    ///
    /// [`kill_recursive`]: CgroupTracker::kill_recursive
    pub fn migrate_recursive(&mut self, from: &Path, to: &Path) -> io::Result<usize> {
        let mut seen = HashSet::new();
        self.migrate_tree(from, to, &mut seen)
    }

    fn migrate_tree(&mut self, from: &Path, to: &Path, seen: &mut HashSet<i32>) -> io::Result<usize> {
        let mut moved = 0;

        loop {
            let procs = match self.backend.processes(from) {
                Ok(procs) => procs,
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(moved),
                Err(err) => return Err(err),
            };

            let mut progressed = false;
            for pid in procs {
                if !seen.insert(pid) {
                    continue;
                }
                progressed = true;

                match self.attach_with_fallback(to, pid) {
                    Ok(()) => moved += 1,
                    Err(err) if err.raw_os_error() == Some(libc::ESRCH) => {}
                    Err(err) => warn!(pid, "Failed to migrate process: {}", err),
                }
            }

            if !progressed {
                break;
            }
        }

        for child in self.subgroups_or_empty(from) {
            moved += self.migrate_tree(&child, to, seen)?;
        }

        Ok(moved)
    }

    fn attach_with_fallback(&mut self, to: &Path, pid: i32) -> io::Result<()> {
        let first = match self.backend.attach(to, pid) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        for ancestor in to.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            if self.backend.attach(ancestor, pid).is_ok() {
                trace!(pid, group = %ancestor.display(), "Migrated to ancestor group");
                return Ok(());
            }
            if ancestor == self.root {
                break;
            }
        }

        Err(first)
    }

    fn subgroups_or_empty(&mut self, group: &Path) -> Vec<PathBuf> {
        match self.backend.subgroups(group) {
            Ok(children) => children,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                debug!(group = %group.display(), "Could not list child groups: {}", err);
                Vec::new()
            }
        }
    }

    /// Resolves a process to the id of the session whose group it sits in.
    ///
    /// Returns `Ok(None)` for processes outside the hierarchy and for
    /// processes that are already gone.
    pub fn session_of_pid(&self, pid: i32) -> io::Result<Option<String>> {
        let path = format!("/proc/{}/cgroup", pid);
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        Ok(session_from_proc_cgroup(&self.hierarchy, &contents))
    }
}

/// Escapes a session id for use as a cgroup directory name.
///
/// Names that would collide with kernel-owned files, or that already carry
/// the marker, get a `_` prefix. [`unescape`] reverses this.
pub(crate) fn escape(name: &str) -> String {
    if name.starts_with('_')
        || name.starts_with('.')
        || name.starts_with("cgroup.")
        || matches!(name, "tasks" | "notify_on_release" | "release_agent")
    {
        format!("_{}", name)
    } else {
        name.to_owned()
    }
}

/// Strips the escape marker applied by [`escape`], if present.
pub(crate) fn unescape(name: &str) -> &str {
    name.strip_prefix('_').unwrap_or(name)
}

/// Extracts a session id from the contents of `/proc/<pid>/cgroup`.
fn session_from_proc_cgroup(hierarchy: &str, contents: &str) -> Option<String> {
    for line in contents.lines() {
        // "0::/sessiond/c1" (v2) or "4:name=ctl:/sessiond/c1" (v1)
        let mut fields = line.splitn(3, ':');
        let _id = fields.next();
        let _controllers = fields.next();
        let Some(group) = fields.next() else { continue };

        if let Some(session) = session_from_group_path(hierarchy, group) {
            return Some(session);
        }
    }
    None
}

fn session_from_group_path(hierarchy: &str, group: &str) -> Option<String> {
    let rest = group.strip_prefix(hierarchy)?;
    let rest = rest.strip_prefix('/')?;
    let segment = rest.split('/').next()?;
    if segment.is_empty() {
        return None;
    }
    Some(unescape(segment).to_owned())
}

#[cfg(test)]
pub(crate) mod mem {
    use std::{
        cell::RefCell,
        collections::{BTreeMap, HashSet},
        io,
        path::{Path, PathBuf},
        rc::Rc,
    };

    use super::{CgroupBackend, Signal};

    #[derive(Debug, Default)]
    struct Tree {
        groups: BTreeMap<PathBuf, Vec<i32>>,
        fork_budget: u32,
        next_pid: i32,
        passes: usize,
        killed: Vec<(i32, Signal)>,
        reject_attach: HashSet<PathBuf>,
    }

    /// In-memory process tree whose members can "fork" between enumeration
    /// passes, for exercising the convergence loops.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct MemCgroup {
        inner: Rc<RefCell<Tree>>,
    }

    impl MemCgroup {
        pub(crate) fn new() -> MemCgroup {
            MemCgroup::default()
        }

        pub(crate) fn add_group(&self, group: impl Into<PathBuf>) {
            self.inner.borrow_mut().groups.entry(group.into()).or_default();
        }

        pub(crate) fn add_process(&self, group: impl Into<PathBuf>, pid: i32) {
            let mut inner = self.inner.borrow_mut();
            inner.groups.entry(group.into()).or_default().push(pid);
            inner.next_pid = inner.next_pid.max(pid);
        }

        /// Every subsequent enumeration spawns one fresh pid into the
        /// enumerated group, `budget` times in total.
        pub(crate) fn set_fork_budget(&self, budget: u32) {
            self.inner.borrow_mut().fork_budget = budget;
        }

        pub(crate) fn reject_attach(&self, group: impl Into<PathBuf>) {
            self.inner.borrow_mut().reject_attach.insert(group.into());
        }

        pub(crate) fn passes(&self) -> usize {
            self.inner.borrow().passes
        }

        pub(crate) fn killed(&self) -> Vec<(i32, Signal)> {
            self.inner.borrow().killed.clone()
        }

        pub(crate) fn clear_group(&self, group: impl Into<PathBuf>) {
            if let Some(procs) = self.inner.borrow_mut().groups.get_mut(&group.into()) {
                procs.clear();
            }
        }

        pub(crate) fn processes_in(&self, group: impl Into<PathBuf>) -> Vec<i32> {
            self.inner
                .borrow()
                .groups
                .get(&group.into())
                .cloned()
                .unwrap_or_default()
        }

        pub(crate) fn has_group(&self, group: impl Into<PathBuf>) -> bool {
            self.inner.borrow().groups.contains_key(&group.into())
        }
    }

    impl CgroupBackend for MemCgroup {
        fn create(&mut self, group: &Path) -> io::Result<()> {
            self.add_group(group);
            Ok(())
        }

        fn remove(&mut self, group: &Path) -> io::Result<()> {
            let mut inner = self.inner.borrow_mut();
            match inner.groups.get(group) {
                None => return Err(io::Error::from(io::ErrorKind::NotFound)),
                Some(procs) if !procs.is_empty() => {
                    return Err(io::Error::new(io::ErrorKind::Other, "group not empty"))
                }
                Some(_) => {}
            }
            inner.groups.remove(group);
            Ok(())
        }

        fn processes(&mut self, group: &Path) -> io::Result<Vec<i32>> {
            let mut inner = self.inner.borrow_mut();
            if !inner.groups.contains_key(group) {
                return Err(io::Error::from(io::ErrorKind::NotFound));
            }
            inner.passes += 1;
            if inner.fork_budget > 0 {
                inner.fork_budget -= 1;
                inner.next_pid += 1;
                let child = inner.next_pid;
                inner.groups.get_mut(group).unwrap().push(child);
            }
            Ok(inner.groups[group].clone())
        }

        fn subgroups(&mut self, group: &Path) -> io::Result<Vec<PathBuf>> {
            let inner = self.inner.borrow();
            if !inner.groups.contains_key(group) {
                return Err(io::Error::from(io::ErrorKind::NotFound));
            }
            Ok(inner
                .groups
                .keys()
                .filter(|candidate| candidate.parent() == Some(group))
                .cloned()
                .collect())
        }

        fn signal(&mut self, pid: i32, signal: Signal) -> io::Result<()> {
            let mut inner = self.inner.borrow_mut();
            let mut found = false;
            for procs in inner.groups.values_mut() {
                let before = procs.len();
                procs.retain(|p| *p != pid);
                found |= procs.len() != before;
            }
            if !found {
                return Err(io::Error::from_raw_os_error(libc::ESRCH));
            }
            inner.killed.push((pid, signal));
            Ok(())
        }

        fn attach(&mut self, group: &Path, pid: i32) -> io::Result<()> {
            let mut inner = self.inner.borrow_mut();
            if inner.reject_attach.contains(group) {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
            if !inner.groups.contains_key(group) {
                return Err(io::Error::from(io::ErrorKind::NotFound));
            }
            for procs in inner.groups.values_mut() {
                procs.retain(|p| *p != pid);
            }
            inner.groups.get_mut(group).unwrap().push(pid);
            Ok(())
        }
    }
}
