//! The registries and the verb surface exposed to the IPC layer.
//!
//! All entity records live in three insertion-ordered registries owned by
//! [`Manager`]; every operation takes the manager explicitly, there is no
//! global state. Mutation happens on one control loop only — see the crate
//! docs for the threading model.

use std::{collections::VecDeque, io};

use indexmap::IndexMap;
use tracing::debug;

use crate::{
    acl::DeviceAccess,
    cgroup::CgroupTracker,
    config::Config,
    gc::GcEntity,
    seat::{Seat, SeatError},
    session::{Session, SessionError},
    user::User,
    vt::{VtControl, VtError},
};

/// Errors of the manager's verb surface
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No seat with that name exists
    #[error("No seat named {0}")]
    NoSuchSeat(String),

    /// No session with that id exists
    #[error("No session with id {0}")]
    NoSuchSession(String),

    /// No user with that uid exists
    #[error("No user with uid {0}")]
    NoSuchUser(u32),

    /// A seat operation failed
    #[error(transparent)]
    Seat(#[from] SeatError),

    /// A session operation failed
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The VT layer failed
    #[error(transparent)]
    Vt(#[from] VtError),

    /// Underlying I/O error
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A change the IPC layer should broadcast to its clients.
///
/// Every mutating verb that changes membership or `active` status pushes
/// the matching notifications; the surrounding server drains them with
/// [`Manager::take_notifications`] after each dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A seat appeared.
    SeatAdded(String),
    /// A seat's properties changed.
    SeatChanged(String),
    /// A seat is gone.
    SeatRemoved(String),
    /// A session was created.
    SessionAdded(String),
    /// A session's properties changed.
    SessionChanged(String),
    /// A session is gone.
    SessionRemoved(String),
    /// A user record was created.
    UserAdded(u32),
    /// A user's properties changed.
    UserChanged(u32),
    /// A user record is gone.
    UserRemoved(u32),
}

/// The seat/session/user manager.
///
/// Owns the entity registries outright; cross-references between entities
/// are stored as ids and resolved through the registries, so a retired
/// entity becomes unresolvable instead of dangling.
#[derive(Debug)]
pub struct Manager {
    pub(crate) config: Config,
    pub(crate) seats: IndexMap<String, Seat>,
    pub(crate) sessions: IndexMap<String, Session>,
    pub(crate) users: IndexMap<u32, User>,
    pub(crate) gc_queue: VecDeque<GcEntity>,
    pub(crate) vt: Box<dyn VtControl>,
    pub(crate) device_access: Box<dyn DeviceAccess>,
    pub(crate) cgroups: CgroupTracker,
    pub(crate) session_counter: u64,
    notifications: VecDeque<Notification>,
}

impl Manager {
    /// Creates a manager and its runtime directories.
    pub fn new(
        config: Config,
        vt: Box<dyn VtControl>,
        device_access: Box<dyn DeviceAccess>,
        cgroups: CgroupTracker,
    ) -> io::Result<Manager> {
        for dir in [
            config.seats_dir(),
            config.sessions_dir(),
            config.users_dir(),
            config.linger_dir.clone(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }

        debug!(run_dir = %config.run_dir.display(), "Manager initialized");
        Ok(Manager {
            config,
            seats: IndexMap::new(),
            sessions: IndexMap::new(),
            users: IndexMap::new(),
            gc_queue: VecDeque::new(),
            vt,
            device_access,
            cgroups,
            session_counter: 0,
            notifications: VecDeque::new(),
        })
    }

    /// The configuration this manager runs with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The cgroup tracker in use.
    pub fn cgroups(&self) -> &CgroupTracker {
        &self.cgroups
    }

    /// Looks up a seat by name.
    pub fn seat(&self, id: &str) -> Option<&Seat> {
        self.seats.get(id)
    }

    /// All known seats, oldest first.
    pub fn seats(&self) -> impl Iterator<Item = &Seat> {
        self.seats.values()
    }

    /// Looks up a session by id.
    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// All known sessions, in creation order.
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Looks up a user by uid.
    pub fn user(&self, uid: u32) -> Option<&User> {
        self.users.get(&uid)
    }

    /// All known users, oldest record first.
    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    /// Resolves a process to the session whose control group it runs in.
    pub fn session_of_pid(&self, pid: i32) -> io::Result<Option<&Session>> {
        let Some(id) = self.cgroups.session_of_pid(pid)? else {
            return Ok(None);
        };
        Ok(self.sessions.get(&id))
    }

    /// Resolves a process to the user owning its session.
    pub fn user_of_pid(&self, pid: i32) -> io::Result<Option<&User>> {
        let Some(session) = self.session_of_pid(pid)? else {
            return Ok(None);
        };
        Ok(self.users.get(&session.uid()))
    }

    /// Drains the pending change notifications.
    pub fn take_notifications(&mut self) -> Vec<Notification> {
        self.notifications.drain(..).collect()
    }

    pub(crate) fn notify(&mut self, notification: Notification) {
        self.notifications.push_back(notification);
    }

    #[cfg(test)]
    pub(crate) fn gc_queue_len(&self) -> usize {
        self.gc_queue.len()
    }
}

/// Convenience constructor wiring the production collaborators: the kernel
/// console and the system cgroup2 mount.
///
/// The device ACL applier remains host policy and is passed in.
pub fn system_manager(config: Config, device_access: Box<dyn DeviceAccess>) -> Result<Manager, Error> {
    let vt: Box<dyn VtControl> = match crate::vt::ConsoleVt::open() {
        Ok(console) => Box::new(console),
        Err(err) => {
            debug!("Console not available, VT switching disabled: {}", err);
            Box::new(NoVt)
        }
    };
    Ok(Manager::new(config, vt, device_access, CgroupTracker::system())?)
}

/// [`VtControl`] for hosts without a console; every operation reports the
/// VT subsystem as unavailable.
#[derive(Debug, Default)]
pub struct NoVt;

impl VtControl for NoVt {
    fn current(&mut self) -> Result<u32, VtError> {
        Err(VtError::NotAvailable)
    }

    fn activate(&mut self, _vt: u32) -> Result<(), VtError> {
        Err(VtError::NotAvailable)
    }
}

impl Manager {
    /// Persists every entity's state file. Mostly useful right before the
    /// surrounding daemon hands over or shuts down.
    pub fn save_all(&self) {
        for id in self.seats.keys() {
            self.save_seat(id);
        }
        for id in self.sessions.keys() {
            self.save_session(id);
        }
        for uid in self.users.keys() {
            self.save_user(*uid);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        acl::fake::AclCall,
        event::HardwareEvent,
        manager::{Error, Notification},
        session::{NewSession, SessionError, SessionState},
        statefile,
        test_support::Fixture,
        user::UserState,
    };

    /// The walkthrough from the design discussion: a VT-capable seat0, one
    /// session on VT 3, a focus event promoting it.
    #[test]
    fn seat0_example_scenario() {
        let mut fx = Fixture::new();
        fx.start_seat0();

        let mut new = NewSession::user(1000, 1000, "u1000");
        new.seat = Some(String::from("seat0"));
        new.vtnr = 3;
        let c1 = fx.manager.create_session(new).unwrap();
        fx.manager.session_start(&c1).unwrap();

        // attached at position 3, nobody active until the kernel speaks
        let seat = fx.manager.seat("seat0").unwrap();
        assert_eq!(seat.session_at(3), Some(c1.as_str()));
        assert_eq!(seat.active_session(), None);

        fx.manager.dispatch(HardwareEvent::VtFocusChanged { vtnr: 3 });

        assert_eq!(
            fx.manager.seat("seat0").unwrap().active_session(),
            Some(c1.as_str())
        );
        assert_eq!(fx.manager.session(&c1).unwrap().state(), SessionState::Active);
        assert_eq!(fx.manager.user(1000).unwrap().state(), UserState::Active);
        assert!(fx.acl.calls().contains(&AclCall::Change {
            old: None,
            new: Some(1000)
        }));

        // persisted for collaborators: who is active, and whose
        let seat_file = statefile::load(&fx.manager.config().seats_dir().join("seat0")).unwrap();
        assert_eq!(seat_file.get("ACTIVE").map(String::as_str), Some(c1.as_str()));
        assert_eq!(seat_file.get("ACTIVE_UID").map(String::as_str), Some("1000"));
        assert_eq!(seat_file.get("CAN_TTY").map(String::as_str), Some("1"));

        let session_file =
            statefile::load(&fx.manager.config().sessions_dir().join(&c1)).unwrap();
        assert_eq!(session_file.get("STATE").map(String::as_str), Some("active"));
        assert_eq!(session_file.get("VTNR").map(String::as_str), Some("3"));
        assert_eq!(session_file.get("SEAT").map(String::as_str), Some("seat0"));

        let user_file = statefile::load(&fx.manager.config().users_dir().join("1000")).unwrap();
        assert_eq!(user_file.get("STATE").map(String::as_str), Some("active"));
    }

    #[test]
    fn activation_emits_notifications_for_everyone_affected() {
        let mut fx = Fixture::new();
        fx.start_seat0();
        let c1 = fx.open_vt_session(1000, 2);
        fx.manager.take_notifications();

        fx.manager.dispatch(HardwareEvent::VtFocusChanged { vtnr: 2 });

        let notifications = fx.manager.take_notifications();
        assert!(notifications.contains(&Notification::SeatChanged(String::from("seat0"))));
        assert!(notifications.contains(&Notification::SessionChanged(c1.clone())));
        assert!(notifications.contains(&Notification::UserChanged(1000)));
    }

    #[test]
    fn rejected_requests_leave_no_state_behind() {
        let mut fx = Fixture::new();
        fx.start_seat0();

        let mut new = NewSession::user(1000, 1000, "u1000");
        new.tty = Some(String::from("/dev/tty5"));
        new.display = Some(String::from(":0"));
        assert!(matches!(
            fx.manager.create_session(new),
            Err(Error::Session(SessionError::TerminalConflict))
        ));

        assert_eq!(fx.manager.sessions().count(), 0);
        assert!(fx.manager.user(1000).is_none());
    }

    #[test]
    fn session_ids_are_never_reused_within_a_run() {
        let mut fx = Fixture::new();
        fx.start_seat0();
        let c1 = fx.open_vt_session(1000, 2);
        fx.manager.session_terminate(&c1).unwrap();
        fx.manager.gc_run();

        let c2 = fx.open_vt_session(1000, 2);
        assert_ne!(c1, c2);
    }

    #[test]
    fn foreign_processes_resolve_to_no_session() {
        let fx = Fixture::new();
        let own_pid = std::process::id() as i32;
        assert!(fx.manager.session_of_pid(own_pid).unwrap().is_none());
        assert!(fx.manager.user_of_pid(own_pid).unwrap().is_none());
    }

    #[test]
    fn save_all_writes_every_entity() {
        let mut fx = Fixture::new();
        fx.start_seat0();
        let c1 = fx.open_vt_session(1000, 2);

        fx.manager.save_all();
        assert!(fx.manager.config().seats_dir().join("seat0").exists());
        assert!(fx.manager.config().sessions_dir().join(&c1).exists());
        assert!(fx.manager.config().users_dir().join("1000").exists());
    }
}
