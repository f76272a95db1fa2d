//! Boundary to the device ACL applier.
//!
//! When the foreground session of a seat changes, the previous owner loses
//! access to the seat's devices and the new owner gains it. How that is
//! enforced (fd revocation, filesystem ACLs, ...) is a collaborator concern;
//! the arbiter only drives the protocol: pause the old session, flip the
//! ACLs, resume the new session. Failures here are logged and never stop a
//! switch — a later switch retries the work.

use std::{fmt, io};

use crate::device::Device;

/// Collaborator enforcing device access for the foreground session.
pub trait DeviceAccess: fmt::Debug {
    /// Suspends device access of a session about to lose the foreground.
    fn pause_device_access(&mut self, seat: &str, session: &str) -> io::Result<()>;

    /// Restores device access of a session holding (or regaining) the foreground.
    fn resume_device_access(&mut self, seat: &str, session: &str) -> io::Result<()>;

    /// Re-points the ACLs of the seat's devices from `old_uid` to `new_uid`.
    fn change_acls(
        &mut self,
        seat: &str,
        devices: &[Device],
        old_uid: Option<u32>,
        new_uid: Option<u32>,
    ) -> io::Result<()>;
}

/// A [`DeviceAccess`] that enforces nothing.
///
/// Useful for hosts where device access is managed out-of-band and in tests.
#[derive(Debug, Default)]
pub struct NoopDeviceAccess;

impl DeviceAccess for NoopDeviceAccess {
    fn pause_device_access(&mut self, _seat: &str, _session: &str) -> io::Result<()> {
        Ok(())
    }

    fn resume_device_access(&mut self, _seat: &str, _session: &str) -> io::Result<()> {
        Ok(())
    }

    fn change_acls(
        &mut self,
        _seat: &str,
        _devices: &[Device],
        _old_uid: Option<u32>,
        _new_uid: Option<u32>,
    ) -> io::Result<()> {
        Ok(())
    }
}
