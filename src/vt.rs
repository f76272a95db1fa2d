//! Virtual-terminal plumbing.
//!
//! The arbiter only ever needs two things from the console: the number of
//! the currently focused VT and a way to ask the kernel to switch. Both sit
//! behind [`VtControl`] so the state machines stay testable off a console.
//!
//! [`ConsoleVt`] is the kernel-backed implementation: focus queries read
//! `/sys/class/tty/tty0/active`, switch requests go through the legacy
//! `VT_ACTIVATE` ioctl on `/dev/tty0`. [`VtFocusSource`] watches the same
//! sysfs attribute and feeds focus changes into an event loop.

use std::{
    fmt, fs,
    io::{self, Read, Seek, SeekFrom},
    os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    path::Path,
};

use calloop::{EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory};
use rustix::fs::{Mode as FsMode, OFlags};
use scan_fmt::scan_fmt;
use tracing::debug;

use crate::event::HardwareEvent;

#[allow(dead_code)]
mod tty {
    pub const VT_ACTIVATE: libc::c_ulong = 0x5606;
    pub const VT_WAITACTIVE: libc::c_ulong = 0x5607;
}

const CONSOLE_PATH: &str = "/dev/tty0";
const ACTIVE_VT_PATH: &str = "/sys/class/tty/tty0/active";

/// Highest VT number the kernel can address.
pub const VT_RANGE_MAX: u32 = 63;

/// Errors of the VT layer
#[derive(Debug, thiserror::Error)]
pub enum VtError {
    /// No virtual terminals on this host
    #[error("Virtual terminals are not available")]
    NotAvailable,

    /// The console focus state could not be parsed
    #[error("Could not parse the console focus state")]
    Parse,

    /// Underlying I/O error
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Access to the kernel console, as consumed by the seat arbiter.
pub trait VtControl: fmt::Debug {
    /// Reads the number of the currently focused VT.
    fn current(&mut self) -> Result<u32, VtError>;

    /// Asks the kernel to switch the console to `vt`.
    ///
    /// The switch is asynchronous; completion is observed through a later
    /// focus-change event, not through this call returning.
    fn activate(&mut self, vt: u32) -> Result<(), VtError>;
}

/// [`VtControl`] via `/dev/tty0` and the legacy VT kernel interface.
#[derive(Debug)]
pub struct ConsoleVt {
    console: OwnedFd,
}

impl ConsoleVt {
    /// Opens the console. Fails on hosts without a VT subsystem.
    pub fn open() -> Result<ConsoleVt, VtError> {
        let console = rustix::fs::open(
            CONSOLE_PATH,
            OFlags::RDWR | OFlags::CLOEXEC | OFlags::NOCTTY,
            FsMode::empty(),
        )
        .map_err(io::Error::from)?;

        Ok(ConsoleVt { console })
    }
}

impl VtControl for ConsoleVt {
    fn current(&mut self) -> Result<u32, VtError> {
        let contents = fs::read_to_string(ACTIVE_VT_PATH)?;
        parse_active_vt(&contents)
    }

    fn activate(&mut self, vt: u32) -> Result<(), VtError> {
        if vt == 0 || vt > VT_RANGE_MAX {
            return Err(VtError::NotAvailable);
        }

        debug!(vt, "Requesting VT switch");
        let res = unsafe { libc::ioctl(self.console.as_raw_fd(), tty::VT_ACTIVATE, vt as libc::c_int) };
        if res < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

fn parse_active_vt(contents: &str) -> Result<u32, VtError> {
    scan_fmt!(contents.trim(), "tty{d}", u32).map_err(|_| VtError::Parse)
}

/// Event source watching the console focus.
///
/// Emits a [`HardwareEvent::VtFocusChanged`] whenever the kernel reports a
/// different VT as active. May be inserted into a calloop event loop.
#[derive(Debug)]
pub struct VtFocusSource {
    active: fs::File,
    token: Option<Token>,
}

impl VtFocusSource {
    /// Opens the sysfs attribute carrying the focused VT.
    pub fn new() -> io::Result<VtFocusSource> {
        VtFocusSource::from_path(Path::new(ACTIVE_VT_PATH))
    }

    fn from_path(path: &Path) -> io::Result<VtFocusSource> {
        Ok(VtFocusSource {
            active: fs::File::open(path)?,
            token: None,
        })
    }
}

impl AsFd for VtFocusSource {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.active.as_fd()
    }
}

impl EventSource for VtFocusSource {
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

        self.active.seek(SeekFrom::Start(0))?;
        let mut contents = String::new();
        self.active.read_to_string(&mut contents)?;

        match parse_active_vt(&contents) {
            Ok(vtnr) => callback(HardwareEvent::VtFocusChanged { vtnr }, &mut ()),
            Err(err) => debug!("Ignoring unparsable console focus state: {}", err),
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
