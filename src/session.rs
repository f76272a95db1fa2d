//! Login sessions and their state machine.
//!
//! A session is one login instance, optionally bound to a seat and a
//! VT or display. Its lifecycle is `Opening → Online ⇄ Active → Closing`:
//! it may bounce between foreground and background as long as it lives, but
//! it never returns to `Opening` and nothing leaves `Closing`. The state is
//! derived from three fields (`started`, `active`, `stopping`) rather than
//! stored, which makes the forbidden transitions unrepresentable.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::{
    cgroup::Signal,
    manager::{Error, Manager, Notification},
    statefile::{self, flag},
    utils::DualTimestamp,
    vt::VT_RANGE_MAX,
};

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Resources are still being prepared.
    Opening,
    /// Logged in, not in the foreground.
    Online,
    /// Logged in and owning the seat's devices.
    Active,
    /// Logged out, residual processes still draining.
    Closing,
}

impl SessionState {
    /// The lowercase name used in state files.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Opening => "opening",
            SessionState::Online => "online",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
        }
    }
}

/// What kind of surface a session talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionKind {
    /// Nothing declared.
    #[default]
    Unspecified,
    /// A text console or terminal login.
    Tty,
    /// An X11 display.
    X11,
    /// A Wayland compositor.
    Wayland,
}

impl SessionKind {
    /// Whether sessions of this kind present a graphical surface.
    pub fn is_graphical(&self) -> bool {
        matches!(self, SessionKind::X11 | SessionKind::Wayland)
    }

    /// The lowercase name used in state files.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Unspecified => "unspecified",
            SessionKind::Tty => "tty",
            SessionKind::X11 => "x11",
            SessionKind::Wayland => "wayland",
        }
    }
}

/// Errors specific to session operations
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session is not attached to any seat
    #[error("Session is not attached to a seat")]
    NotAttached,

    /// A tty and a display cannot both be set
    #[error("A tty and a display are mutually exclusive")]
    TerminalConflict,

    /// The session has no processes to signal
    #[error("Session has no control group yet")]
    NotStarted,
}

/// Parameters of a session-open request.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    /// Owning user id.
    pub uid: u32,
    /// Primary group id of the owning user.
    pub gid: u32,
    /// Username of the owning user.
    pub name: String,
    /// Leader process of the login.
    pub leader: Option<i32>,
    /// Seat to attach to, if any.
    pub seat: Option<String>,
    /// VT number, non-zero only for sessions on the VT-capable seat.
    pub vtnr: u32,
    /// Kind of surface the session presents.
    pub kind: SessionKind,
    /// Controlling tty path.
    pub tty: Option<String>,
    /// X11/Wayland display name.
    pub display: Option<String>,
    /// Whether this is a remote login.
    pub remote: bool,
    /// Host the remote login came from.
    pub remote_host: Option<String>,
    /// Remote username, if different.
    pub remote_user: Option<String>,
}

impl NewSession {
    /// A local session-open request for the given user.
    pub fn user(uid: u32, gid: u32, name: impl Into<String>) -> NewSession {
        NewSession {
            uid,
            gid,
            name: name.into(),
            ..Default::default()
        }
    }
}

/// One login instance.
#[derive(Debug)]
pub struct Session {
    pub(crate) id: String,
    pub(crate) uid: u32,
    pub(crate) seat: Option<String>,
    pub(crate) vtnr: u32,
    pub(crate) position: u32,
    pub(crate) kind: SessionKind,
    pub(crate) tty: Option<String>,
    pub(crate) display: Option<String>,
    pub(crate) remote: bool,
    pub(crate) remote_host: Option<String>,
    pub(crate) remote_user: Option<String>,
    pub(crate) leader: Option<i32>,
    pub(crate) cgroup: Option<PathBuf>,
    pub(crate) started: bool,
    pub(crate) stopping: bool,
    pub(crate) active: bool,
    pub(crate) idle_hint: bool,
    pub(crate) idle_since: DualTimestamp,
    pub(crate) locked_hint: bool,
    pub(crate) in_gc_queue: bool,
}

impl Session {
    fn new(id: String, new: &NewSession) -> Session {
        Session {
            id,
            uid: new.uid,
            seat: None,
            vtnr: new.vtnr,
            position: 0,
            kind: new.kind,
            tty: new.tty.clone(),
            display: new.display.clone(),
            remote: new.remote,
            remote_host: new.remote_host.clone(),
            remote_user: new.remote_user.clone(),
            leader: new.leader,
            cgroup: None,
            started: false,
            stopping: false,
            active: false,
            idle_hint: false,
            idle_since: DualTimestamp::unset(),
            locked_hint: false,
            in_gc_queue: false,
        }
    }

    /// The session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Uid of the owning user.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// The seat this session is attached to, if any.
    pub fn seat(&self) -> Option<&str> {
        self.seat.as_deref()
    }

    /// The VT number, 0 when the session is not VT-backed.
    pub fn vtnr(&self) -> u32 {
        self.vtnr
    }

    /// The terminal position on the owning seat, 0 while unattached.
    pub fn position(&self) -> u32 {
        self.position
    }

    /// Kind of surface the session presents.
    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// The controlling tty, if any.
    pub fn tty(&self) -> Option<&str> {
        self.tty.as_deref()
    }

    /// The display name, if any.
    pub fn display(&self) -> Option<&str> {
        self.display.as_deref()
    }

    /// Whether this is a remote login.
    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// Leader process of the login, if known.
    pub fn leader(&self) -> Option<i32> {
        self.leader
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        if self.stopping {
            SessionState::Closing
        } else if !self.started {
            SessionState::Opening
        } else if self.active {
            SessionState::Active
        } else {
            SessionState::Online
        }
    }

    /// The idle hint together with the stamp of its last change.
    pub fn idle_hint(&self) -> (bool, DualTimestamp) {
        (self.idle_hint, self.idle_since)
    }

    /// Whether a lock-screen reported this session as locked.
    pub fn locked_hint(&self) -> bool {
        self.locked_hint
    }
}

/// Aggregated idle state of a seat or user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleHint {
    /// Whether every contributing session is idle.
    pub idle: bool,
    /// Stamp of the change that produced this aggregate.
    pub since: DualTimestamp,
}

/// Folds the idle hints of a set of sessions into one.
///
/// Two stamps are threaded through the pass: the latest among idle sessions
/// and the latest among busy ones. Any busy session wins and contributes its
/// stamp; an all-idle set reports the stamp of the session that went idle
/// last, so "idle since" reflects the moment the aggregate flipped.
pub(crate) fn aggregate_idle<'a>(sessions: impl Iterator<Item = &'a Session>) -> IdleHint {
    let mut latest_idle: Option<DualTimestamp> = None;
    let mut latest_busy: Option<DualTimestamp> = None;

    for session in sessions {
        let (idle, since) = session.idle_hint();
        let slot = if idle { &mut latest_idle } else { &mut latest_busy };
        if slot.map_or(true, |current| since > current) {
            *slot = Some(since);
        }
    }

    match latest_busy {
        Some(since) => IdleHint { idle: false, since },
        None => IdleHint {
            idle: true,
            since: latest_idle.unwrap_or_else(DualTimestamp::unset),
        },
    }
}

impl Manager {
    /// Creates a session from a session-open request.
    ///
    /// The owning user record is created lazily if this is their first
    /// session. The new session starts out `Opening`; call
    /// [`session_start`](Manager::session_start) once its resources exist.
    pub fn create_session(&mut self, new: NewSession) -> Result<String, Error> {
        if new.tty.is_some() && new.display.is_some() {
            return Err(SessionError::TerminalConflict.into());
        }

        // Validate the seat binding up front so a rejected request leaves
        // no trace.
        if let Some(seat_id) = &new.seat {
            let seat = self
                .seats
                .get(seat_id)
                .ok_or_else(|| Error::NoSuchSeat(seat_id.clone()))?;
            if seat.has_vts() != (new.vtnr != 0) {
                return Err(crate::seat::SeatError::VtMismatch.into());
            }
            if new.vtnr > VT_RANGE_MAX {
                return Err(crate::seat::SeatError::OutOfRange(new.vtnr).into());
            }
        }

        self.user_get_or_create(new.uid, new.gid, &new.name);
        self.user_start(new.uid);

        let id = self.allocate_session_id();
        info!(session = %id, uid = new.uid, "Creating session");

        self.sessions.insert(id.clone(), Session::new(id.clone(), &new));
        if let Some(user) = self.users.get_mut(&new.uid) {
            user.sessions.push(id.clone());
        }

        if let Some(seat_id) = &new.seat {
            let seat_id = seat_id.clone();
            self.seat_attach_session(&seat_id, &id)?;
        }

        self.save_session(&id);
        self.notify(Notification::SessionAdded(id.clone()));
        self.user_update_state(new.uid);

        Ok(id)
    }

    fn allocate_session_id(&mut self) -> String {
        loop {
            self.session_counter += 1;
            let id = format!("c{}", self.session_counter);
            if !self.sessions.contains_key(&id) {
                return id;
            }
        }
    }

    /// Marks a session's resources as prepared: creates its control group,
    /// migrates the leader into it and moves the session out of `Opening`.
    ///
    /// Idempotent; starting a closing session is a no-op.
    pub fn session_start(&mut self, id: &str) -> Result<(), Error> {
        let (uid, leader) = {
            let session = self
                .sessions
                .get(id)
                .ok_or_else(|| Error::NoSuchSession(id.to_owned()))?;
            if session.started || session.stopping {
                return Ok(());
            }
            (session.uid, session.leader)
        };

        let group = self.cgroups.create_session_group(id)?;
        if let Some(pid) = leader {
            if let Err(err) = self.cgroups.attach(&group, pid) {
                warn!(session = id, pid, "Failed to migrate leader into session cgroup: {}", err);
            }
        }

        if let Some(session) = self.sessions.get_mut(id) {
            session.cgroup = Some(group);
            session.started = true;
        }

        info!(session = id, uid, "Session started");
        self.save_session(id);
        self.notify(Notification::SessionChanged(id.to_owned()));
        self.user_update_state(uid);
        Ok(())
    }

    /// Brings a session to the foreground of its seat.
    ///
    /// On a VT-capable seat this requests a VT switch and defers the actual
    /// activation until the kernel confirms the focus change; elsewhere the
    /// session becomes active immediately.
    pub fn session_activate(&mut self, id: &str) -> Result<(), Error> {
        let (seat_id, vtnr) = {
            let session = self
                .sessions
                .get(id)
                .ok_or_else(|| Error::NoSuchSession(id.to_owned()))?;
            let seat_id = session.seat.clone().ok_or(SessionError::NotAttached)?;
            (seat_id, session.vtnr)
        };

        let has_vts = self.seats.get(&seat_id).map_or(false, |seat| seat.has_vts());
        if has_vts && vtnr > 0 {
            if let Some(seat) = self.seats.get_mut(&seat_id) {
                seat.pending_switch = Some(id.to_owned());
            }
            if let Err(err) = self.vt.activate(vtnr) {
                if let Some(seat) = self.seats.get_mut(&seat_id) {
                    seat.pending_switch = None;
                }
                return Err(err.into());
            }
            Ok(())
        } else {
            self.seat_set_active(&seat_id, Some(id.to_owned()))
        }
    }

    /// Logs a session out: marks it `Closing`, kills its leftover processes
    /// if the kill policy says so, unlinks its state file and schedules it
    /// for garbage collection.
    pub fn session_terminate(&mut self, id: &str) -> Result<(), Error> {
        self.session_stop(id, false)
    }

    pub(crate) fn session_stop(&mut self, id: &str, force: bool) -> Result<(), Error> {
        let (uid, cgroup) = {
            let session = self
                .sessions
                .get(id)
                .ok_or_else(|| Error::NoSuchSession(id.to_owned()))?;
            if session.stopping {
                return Ok(());
            }
            (session.uid, session.cgroup.clone())
        };

        let name = self.users.get(&uid).map(|u| u.name.clone()).unwrap_or_default();
        let shall_kill = force || self.config.shall_kill(uid, &name);

        if let Some(session) = self.sessions.get_mut(id) {
            session.stopping = true;
        }
        info!(session = id, uid, kill = shall_kill, "Stopping session");

        if shall_kill {
            if let Some(group) = &cgroup {
                // TERM first for orderly shutdown, then KILL for whatever is left.
                if let Err(err) = self.cgroups.kill_recursive(group, Signal::Term, &[]) {
                    warn!(session = id, "Failed to terminate session processes: {}", err);
                }
                if let Err(err) = self.cgroups.kill_recursive(group, Signal::Kill, &[]) {
                    warn!(session = id, "Failed to kill session processes: {}", err);
                }
            }
        }

        statefile::remove(&self.config.sessions_dir().join(id));
        self.notify(Notification::SessionChanged(id.to_owned()));
        self.gc_enqueue_session(id);
        self.user_update_state(uid);
        Ok(())
    }

    /// Sends `signal` to every process of the session.
    pub fn session_kill(&mut self, id: &str, signal: Signal) -> Result<usize, Error> {
        let group = self
            .sessions
            .get(id)
            .ok_or_else(|| Error::NoSuchSession(id.to_owned()))?
            .cgroup
            .clone()
            .ok_or(SessionError::NotStarted)?;
        Ok(self.cgroups.kill_recursive(&group, signal, &[])?)
    }

    /// Stores the session's idle hint. Returns whether the hint changed.
    pub fn session_set_idle_hint(&mut self, id: &str, idle: bool) -> Result<bool, Error> {
        let uid = {
            let session = self
                .sessions
                .get_mut(id)
                .ok_or_else(|| Error::NoSuchSession(id.to_owned()))?;
            if session.idle_hint == idle {
                return Ok(false);
            }
            session.idle_hint = idle;
            session.idle_since = DualTimestamp::now();
            session.uid
        };

        debug!(session = id, idle, "Session idle hint changed");
        self.save_session(id);
        self.notify(Notification::SessionChanged(id.to_owned()));
        // seat- and user-level aggregates shift with this hint
        if let Some(seat_id) = self.sessions.get(id).and_then(|s| s.seat.clone()) {
            self.notify(Notification::SeatChanged(seat_id));
        }
        self.notify(Notification::UserChanged(uid));
        Ok(true)
    }

    /// Stores the session's locked hint.
    pub fn session_set_locked_hint(&mut self, id: &str, locked: bool) -> Result<(), Error> {
        {
            let session = self
                .sessions
                .get_mut(id)
                .ok_or_else(|| Error::NoSuchSession(id.to_owned()))?;
            if session.locked_hint == locked {
                return Ok(());
            }
            session.locked_hint = locked;
        }
        self.save_session(id);
        self.notify(Notification::SessionChanged(id.to_owned()));
        Ok(())
    }

    /// Binds the session to a controlling tty.
    pub fn session_set_tty(&mut self, id: &str, tty: impl Into<String>) -> Result<(), Error> {
        {
            let session = self
                .sessions
                .get_mut(id)
                .ok_or_else(|| Error::NoSuchSession(id.to_owned()))?;
            if session.display.is_some() {
                return Err(SessionError::TerminalConflict.into());
            }
            session.tty = Some(tty.into());
        }
        self.save_session(id);
        Ok(())
    }

    /// Binds the session to an X11/Wayland display.
    pub fn session_set_display(&mut self, id: &str, display: impl Into<String>) -> Result<(), Error> {
        {
            let session = self
                .sessions
                .get_mut(id)
                .ok_or_else(|| Error::NoSuchSession(id.to_owned()))?;
            if session.tty.is_some() {
                return Err(SessionError::TerminalConflict.into());
            }
            session.display = Some(display.into());
        }
        self.save_session(id);
        Ok(())
    }

    /// Binds the session to its leader process.
    pub fn session_set_leader(&mut self, id: &str, pid: i32) -> Result<(), Error> {
        let cgroup = {
            let session = self
                .sessions
                .get_mut(id)
                .ok_or_else(|| Error::NoSuchSession(id.to_owned()))?;
            session.leader = Some(pid);
            session.cgroup.clone()
        };

        if let Some(group) = cgroup {
            if let Err(err) = self.cgroups.attach(&group, pid) {
                warn!(session = id, pid, "Failed to migrate leader into session cgroup: {}", err);
            }
        }
        self.save_session(id);
        Ok(())
    }

    /// Flips the foreground flag of a session, driven by the seat arbiter.
    pub(crate) fn session_set_active_flag(&mut self, id: &str, active: bool) {
        let uid = {
            let Some(session) = self.sessions.get_mut(id) else {
                return;
            };
            if session.active == active {
                return;
            }
            session.active = active;
            session.uid
        };

        self.save_session(id);
        self.notify(Notification::SessionChanged(id.to_owned()));
        self.user_update_state(uid);
    }

    pub(crate) fn save_session(&self, id: &str) {
        let Some(session) = self.sessions.get(id) else {
            return;
        };

        let mut pairs = vec![("UID", session.uid.to_string())];
        if let Some(user) = self.users.get(&session.uid) {
            pairs.push(("NAME", user.name.clone()));
        }
        pairs.push(("STATE", session.state().as_str().to_owned()));
        pairs.push(("ACTIVE", flag(session.state() == SessionState::Active)));
        pairs.push(("TYPE", session.kind.as_str().to_owned()));
        if let Some(seat) = &session.seat {
            pairs.push(("SEAT", seat.clone()));
        }
        if session.vtnr > 0 {
            pairs.push(("VTNR", session.vtnr.to_string()));
        }
        if let Some(tty) = &session.tty {
            pairs.push(("TTY", tty.clone()));
        }
        if let Some(display) = &session.display {
            pairs.push(("DISPLAY", display.clone()));
        }
        pairs.push(("REMOTE", flag(session.remote)));
        if let Some(host) = &session.remote_host {
            pairs.push(("REMOTE_HOST", host.clone()));
        }
        if let Some(user) = &session.remote_user {
            pairs.push(("REMOTE_USER", user.clone()));
        }
        if let Some(leader) = session.leader {
            pairs.push(("LEADER", leader.to_string()));
        }
        pairs.push(("IDLE_HINT", flag(session.idle_hint)));
        if session.idle_since.is_set() {
            pairs.push(("IDLE_HINT_MONOTONIC_USEC", session.idle_since.monotonic.as_micros().to_string()));
            pairs.push(("IDLE_HINT_REALTIME_USEC", session.idle_since.realtime.as_micros().to_string()));
        }
        pairs.push(("LOCKED_HINT", flag(session.locked_hint)));

        statefile::save(&self.config.sessions_dir().join(&session.id), &pairs);
    }

    /// Drops a retired session from the registries, nulling every
    /// back-reference first. Only the garbage collector calls this.
    pub(crate) fn session_finalize(&mut self, id: &str) {
        let Some(session) = self.sessions.get(id) else {
            return;
        };
        let uid = session.uid;
        let seat = session.seat.clone();
        debug!(session = id, "Retiring session");

        if let Some(seat_id) = seat {
            self.seat_detach_session(&seat_id, id);
            self.gc_enqueue_seat(&seat_id);
        }

        self.cgroups.remove_session_group(id);
        statefile::remove(&self.config.sessions_dir().join(id));

        if let Some(user) = self.users.get_mut(&uid) {
            user.sessions.retain(|s| s != id);
        }
        self.sessions.shift_remove(id);
        self.notify(Notification::SessionRemoved(id.to_owned()));

        self.gc_enqueue_user(uid);
        self.user_update_state(uid);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{aggregate_idle, NewSession, Session, SessionKind, SessionState};
    use crate::utils::DualTimestamp;

    fn session(id: &str, idle: Option<DualTimestamp>) -> Session {
        let mut s = Session::new(String::from(id), &NewSession::user(1000, 1000, "joe"));
        if let Some(since) = idle {
            s.idle_hint = true;
            s.idle_since = since;
        }
        s
    }

    fn stamp(micros: u64) -> DualTimestamp {
        DualTimestamp::from_parts(Duration::from_micros(micros), Duration::from_micros(micros))
    }

    #[test]
    fn state_is_derived_and_closing_is_terminal() {
        let mut s = session("c1", None);
        assert_eq!(s.state(), SessionState::Opening);

        s.started = true;
        assert_eq!(s.state(), SessionState::Online);

        s.active = true;
        assert_eq!(s.state(), SessionState::Active);
        s.active = false;
        assert_eq!(s.state(), SessionState::Online);

        s.stopping = true;
        assert_eq!(s.state(), SessionState::Closing);
        // no flag combination leaves Closing again
        s.active = true;
        assert_eq!(s.state(), SessionState::Closing);
    }

    #[test]
    fn graphical_kinds() {
        assert!(SessionKind::X11.is_graphical());
        assert!(SessionKind::Wayland.is_graphical());
        assert!(!SessionKind::Tty.is_graphical());
        assert!(!SessionKind::Unspecified.is_graphical());
    }

    #[test]
    fn one_busy_session_overrides_the_aggregate() {
        let sessions = [
            session("c1", Some(stamp(100))),
            session("c2", Some(stamp(200))),
            session("c3", None),
        ];
        let hint = aggregate_idle(sessions.iter());
        assert!(!hint.idle);
    }

    #[test]
    fn all_idle_reports_latest_contributing_change() {
        let sessions = [session("c1", Some(stamp(100))), session("c2", Some(stamp(200)))];
        let hint = aggregate_idle(sessions.iter());
        assert!(hint.idle);
        assert_eq!(hint.since, stamp(200));
    }

    #[test]
    fn busy_stamp_tracks_the_most_recent_busy_session() {
        let mut busy_old = session("c1", None);
        busy_old.idle_since = stamp(50);
        let mut busy_new = session("c2", None);
        busy_new.idle_since = stamp(300);
        let sessions = [busy_old, session("c3", Some(stamp(400))), busy_new];

        let hint = aggregate_idle(sessions.iter());
        assert!(!hint.idle);
        assert_eq!(hint.since, stamp(300));
    }

    #[test]
    fn aggregate_of_nothing_is_idle_with_unset_stamp() {
        let hint = aggregate_idle(std::iter::empty());
        assert!(hint.idle);
        assert!(!hint.since.is_set());
    }
}
