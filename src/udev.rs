//! udev-driven device discovery.
//!
//! Turns udev "drm" subsystem traffic into [`HardwareEvent`]s: an initial
//! enumeration of the devices already present, then a monitor socket usable
//! as a calloop [`EventSource`] for hotplug. The seat a device belongs to
//! comes from its `ID_SEAT` property (absent means the primary seat); card
//! nodes count as master devices and give their seat a graphical presence.

use std::{
    collections::HashMap,
    fmt, io,
    os::unix::io::{AsFd, AsRawFd, BorrowedFd},
    path::PathBuf,
};

use calloop::{EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory};
use tracing::{debug, info};
use udev::{Enumerator, EventType, MonitorBuilder, MonitorSocket};

use crate::event::HardwareEvent;

#[derive(Debug, Clone)]
struct KnownDevice {
    path: PathBuf,
    seat: Option<String>,
    master: bool,
}

/// Watches udev for seat devices coming and going.
pub struct UdevWatcher {
    monitor: MonitorSocket,
    devices: HashMap<libc::dev_t, KnownDevice>,
    token: Option<Token>,
}

impl fmt::Debug for UdevWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdevWatcher")
            .field("devices", &self.devices)
            .finish_non_exhaustive()
    }
}

impl UdevWatcher {
    /// Enumerates the devices already present and opens the monitor socket.
    pub fn new() -> io::Result<UdevWatcher> {
        let mut devices = HashMap::new();

        let mut enumerator = Enumerator::new()?;
        enumerator.match_subsystem("drm")?;
        for device in enumerator.scan_devices()? {
            let (Some(devnum), Some(devnode)) = (device.devnum(), device.devnode()) else {
                continue;
            };
            devices.insert(
                devnum,
                KnownDevice {
                    path: devnode.to_path_buf(),
                    seat: seat_of(&device),
                    master: is_master(&device),
                },
            );
        }
        debug!(count = devices.len(), "Initial device scan complete");

        let monitor = MonitorBuilder::new()?.match_subsystem("drm")?.listen()?;

        Ok(UdevWatcher {
            monitor,
            devices,
            token: None,
        })
    }

    /// The devices found by the initial scan, as events ready to dispatch.
    pub fn initial_events(&self) -> Vec<HardwareEvent> {
        self.devices
            .values()
            .map(|device| HardwareEvent::DeviceAdded {
                path: device.path.clone(),
                seat: device.seat.clone(),
                master: device.master,
            })
            .collect()
    }
}

fn seat_of(device: &udev::Device) -> Option<String> {
    device
        .property_value("ID_SEAT")
        .map(|value| value.to_string_lossy().into_owned())
}

fn is_master(device: &udev::Device) -> bool {
    device.sysname().to_string_lossy().starts_with("card")
}

impl AsFd for UdevWatcher {
    fn as_fd(&self) -> BorrowedFd<'_> {
        // the monitor socket outlives every borrow of self
        unsafe { BorrowedFd::borrow_raw(self.monitor.as_raw_fd()) }
    }
}

impl EventSource for UdevWatcher {
    type Event = HardwareEvent;
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    fn process_events<F>(&mut self, _: Readiness, token: Token, mut callback: F) -> io::Result<PostAction>
    where
        F: FnMut(Self::Event, &mut ()) -> Self::Ret,
    {
        if Some(token) != self.token {
            return Ok(PostAction::Continue);
        }

        let events: Vec<udev::Event> = self.monitor.iter().collect();
        for event in events {
            match event.event_type() {
                EventType::Add => {
                    let (Some(devnum), Some(devnode)) = (event.devnum(), event.devnode()) else {
                        continue;
                    };
                    if self.devices.contains_key(&devnum) {
                        continue;
                    }

                    let known = KnownDevice {
                        path: devnode.to_path_buf(),
                        seat: seat_of(&event.device()),
                        master: is_master(&event.device()),
                    };
                    info!(device = %known.path.display(), master = known.master, "Device added");
                    let out = HardwareEvent::DeviceAdded {
                        path: known.path.clone(),
                        seat: known.seat.clone(),
                        master: known.master,
                    };
                    self.devices.insert(devnum, known);
                    callback(out, &mut ());
                }
                EventType::Remove => {
                    let Some(devnum) = event.devnum() else {
                        continue;
                    };
                    if let Some(known) = self.devices.remove(&devnum) {
                        info!(device = %known.path.display(), "Device removed");
                        callback(HardwareEvent::DeviceRemoved { path: known.path }, &mut ());
                    }
                }
                _ => {}
            }
        }

        Ok(PostAction::Continue)
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.token = Some(factory.token());
        unsafe { poll.register(self.as_fd(), Interest::READ, Mode::Level, self.token.unwrap()) }
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.token = Some(factory.token());
        poll.reregister(self.as_fd(), Interest::READ, Mode::Level, self.token.unwrap())
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.token = None;
        poll.unregister(self.as_fd())
    }
}
