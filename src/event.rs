//! Inbound kernel notifications.
//!
//! Device hotplug and console focus changes arrive from the surrounding
//! event loop as plain values of [`HardwareEvent`] and enter the state
//! machines through one dispatch function. Event *sources* producing these
//! values live in [`vt`](crate::vt) and, behind the `backend_udev` feature,
//! [`udev`](crate::udev).

use std::path::PathBuf;

use tracing::{debug, warn};

use crate::manager::Manager;

/// A kernel notification relevant to seat or session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardwareEvent {
    /// A seat-tagged device appeared.
    DeviceAdded {
        /// Device node path.
        path: PathBuf,
        /// Seat the device is tagged for; the primary seat when absent.
        seat: Option<String>,
        /// Whether the device gives its seat a graphical/console presence.
        master: bool,
    },
    /// A previously seen device went away.
    DeviceRemoved {
        /// Device node path.
        path: PathBuf,
    },
    /// The kernel switched the console to another VT.
    VtFocusChanged {
        /// Number of the now-focused VT.
        vtnr: u32,
    },
}

impl Manager {
    /// Feeds one kernel notification into the state machines.
    ///
    /// Events describe facts that already happened, so there is nothing to
    /// veto here: problems are logged and the event is otherwise dropped.
    pub fn dispatch(&mut self, event: HardwareEvent) {
        debug!(event = ?event, "Dispatching event");
        match event {
            HardwareEvent::DeviceAdded { path, seat, master } => {
                let seat_id = seat.unwrap_or_else(|| self.config.primary_seat.clone());
                if let Err(err) = self.seat_add_device(&seat_id, path, master) {
                    warn!(seat = %seat_id, "Ignoring device: {}", err);
                }
            }
            HardwareEvent::DeviceRemoved { path } => {
                self.remove_device(&path);
            }
            HardwareEvent::VtFocusChanged { vtnr } => {
                let seat_id = self.config.primary_seat.clone();
                if !self.seats.contains_key(&seat_id) {
                    return;
                }
                if let Err(err) = self.seat_active_vt_changed(&seat_id, vtnr) {
                    warn!(vtnr, "Ignoring console focus change: {}", err);
                }
            }
        }
    }
}
