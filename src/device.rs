//! Seat-owned device records.

use std::path::{Path, PathBuf};

/// A kernel device attached to a seat.
///
/// A device flagged as `master` gives its seat a graphical/console presence;
/// seats keep their master devices ordered before the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub(crate) path: PathBuf,
    pub(crate) master: bool,
}

impl Device {
    pub(crate) fn new(path: PathBuf, master: bool) -> Device {
        Device { path, master }
    }

    /// The device node path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this is a master device.
    pub fn is_master(&self) -> bool {
        self.master
    }
}
