//! Construction-time options for a [`Manager`](crate::Manager).

use std::path::PathBuf;

/// Options controlling directory layout and process-teardown policy.
///
/// The defaults are the production paths; tests point the directories at
/// temporary locations instead.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the seat carrying the virtual terminals, `seat0` by default.
    pub primary_seat: String,
    /// Runtime directory holding the per-entity state files.
    pub run_dir: PathBuf,
    /// Directory holding the per-user linger marker files.
    pub linger_dir: PathBuf,
    /// Whether the processes of a fully logged-out user get killed.
    pub kill_user_processes: bool,
    /// If non-empty, only these users are ever subject to process killing.
    pub kill_only_users: Vec<String>,
    /// Users whose processes are never killed. Listing anyone here also
    /// lifts the built-in protection of root.
    pub kill_exclude_users: Vec<String>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            primary_seat: String::from("seat0"),
            run_dir: PathBuf::from("/run/sessiond"),
            linger_dir: PathBuf::from("/var/lib/sessiond/linger"),
            kill_user_processes: false,
            kill_only_users: Vec::new(),
            kill_exclude_users: Vec::new(),
        }
    }
}

impl Config {
    pub(crate) fn seats_dir(&self) -> PathBuf {
        self.run_dir.join("seats")
    }

    pub(crate) fn sessions_dir(&self) -> PathBuf {
        self.run_dir.join("sessions")
    }

    pub(crate) fn users_dir(&self) -> PathBuf {
        self.run_dir.join("users")
    }

    /// Whether a full logout of `name` escalates to killing the leftover
    /// processes of their sessions.
    pub(crate) fn shall_kill(&self, uid: u32, name: &str) -> bool {
        if self.kill_exclude_users.iter().any(|n| n == name) {
            return false;
        }

        // Root is spared unless an exclusion set was configured explicitly.
        if uid == 0 && self.kill_exclude_users.is_empty() {
            return false;
        }

        if !self.kill_only_users.is_empty() {
            return self.kill_only_users.iter().any(|n| n == name);
        }

        self.kill_user_processes
    }
}
