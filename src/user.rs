//! Users and their state machine.
//!
//! A user record exists while anything references it: a session, the linger
//! flag, or a teardown still draining. Its state is recomputed on every
//! membership change: `Active` if any owned session is in the foreground,
//! `Online` while sessions exist, `Lingering` when logged out but pinned by
//! the linger flag, `Closing` while draining, `Offline` otherwise.

use std::fs;

use tracing::{debug, info, warn};

use crate::{
    cgroup::Signal,
    manager::{Error, Manager, Notification},
    session::{aggregate_idle, IdleHint, SessionError, SessionState},
    statefile::{self, flag},
};

/// Lifecycle state of a [`User`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserState {
    /// Not logged in, not lingering.
    Offline,
    /// First session is being prepared.
    Opening,
    /// No sessions, kept alive by the linger flag.
    Lingering,
    /// Logged in, no foreground session.
    Online,
    /// Logged in with a foreground session.
    Active,
    /// Logged out, resources draining.
    Closing,
}

impl UserState {
    /// The lowercase name used in state files.
    pub fn as_str(&self) -> &'static str {
        match self {
            UserState::Offline => "offline",
            UserState::Opening => "opening",
            UserState::Lingering => "lingering",
            UserState::Online => "online",
            UserState::Active => "active",
            UserState::Closing => "closing",
        }
    }
}

/// A user known to the manager.
#[derive(Debug)]
pub struct User {
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) name: String,
    // owned sessions in creation order
    pub(crate) sessions: Vec<String>,
    pub(crate) display: Option<String>,
    pub(crate) linger: bool,
    pub(crate) state: UserState,
    pub(crate) started: bool,
    pub(crate) stopping: bool,
    pub(crate) in_gc_queue: bool,
}

impl User {
    fn new(uid: u32, gid: u32, name: String, linger: bool) -> User {
        User {
            uid,
            gid,
            name,
            sessions: Vec::new(),
            display: None,
            linger,
            state: UserState::Offline,
            started: false,
            stopping: false,
            in_gc_queue: false,
        }
    }

    /// The user id.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// The primary group id.
    pub fn gid(&self) -> u32 {
        self.gid
    }

    /// The username.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ids of the owned sessions, oldest first.
    pub fn sessions(&self) -> impl Iterator<Item = &str> {
        self.sessions.iter().map(String::as_str)
    }

    /// The elected display session, if any.
    pub fn display(&self) -> Option<&str> {
        self.display.as_deref()
    }

    /// Whether the user's resources outlive their logins.
    pub fn linger(&self) -> bool {
        self.linger
    }

    /// Current lifecycle state.
    pub fn state(&self) -> UserState {
        self.state
    }
}

impl Manager {
    /// Creates the user record for `uid` if none exists yet.
    ///
    /// A linger marker left behind by an earlier run is picked up here, so
    /// the flag survives restarts.
    pub fn user_get_or_create(&mut self, uid: u32, gid: u32, name: &str) {
        if self.users.contains_key(&uid) {
            return;
        }

        let linger = self.config.linger_dir.join(name).exists();
        debug!(uid, name, linger, "Creating user record");
        self.users
            .insert(uid, User::new(uid, gid, name.to_owned(), linger));
        self.notify(Notification::UserAdded(uid));
    }

    pub(crate) fn user_start(&mut self, uid: u32) {
        let Some(user) = self.users.get_mut(&uid) else {
            return;
        };
        if user.started {
            return;
        }
        user.started = true;
        user.state = UserState::Opening;

        info!(uid, "User logged in");
        self.save_user(uid);
        self.notify(Notification::UserChanged(uid));
    }

    /// Persists or clears the linger flag for a user, creating the user
    /// record if needed.
    ///
    /// With linger enabled a user's resources survive full logout; a fresh
    /// record can be created just to pre-enable the flag.
    pub fn user_set_linger(&mut self, uid: u32, gid: u32, name: &str, enable: bool) -> Result<(), Error> {
        self.user_get_or_create(uid, gid, name);

        let marker = self.config.linger_dir.join(name);
        if enable {
            fs::write(&marker, b"")?;
        } else if let Err(err) = fs::remove_file(&marker) {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(err.into());
            }
        }

        if let Some(user) = self.users.get_mut(&uid) {
            user.linger = enable;
        }
        info!(uid, linger = enable, "User linger changed");
        self.user_update_state(uid);
        self.save_user(uid);
        self.notify(Notification::UserChanged(uid));
        if !enable {
            self.gc_enqueue_user(uid);
        }
        Ok(())
    }

    /// Logs the user out everywhere: stops every session and schedules the
    /// record for garbage collection.
    pub fn user_terminate(&mut self, uid: u32) -> Result<(), Error> {
        let session_ids: Vec<String> = self
            .users
            .get(&uid)
            .ok_or(Error::NoSuchUser(uid))?
            .sessions
            .clone();

        info!(uid, "Stopping user");
        for id in &session_ids {
            if let Err(err) = self.session_stop(id, false) {
                warn!(uid, session = %id, "Failed to stop session: {}", err);
            }
        }

        if let Some(user) = self.users.get_mut(&uid) {
            user.stopping = true;
        }
        self.user_update_state(uid);
        self.gc_enqueue_user(uid);
        Ok(())
    }

    /// Sends `signal` to every process of every session of the user.
    pub fn user_kill(&mut self, uid: u32, signal: Signal) -> Result<usize, Error> {
        let session_ids: Vec<String> = self
            .users
            .get(&uid)
            .ok_or(Error::NoSuchUser(uid))?
            .sessions
            .clone();

        let mut killed = 0;
        for id in &session_ids {
            match self.session_kill(id, signal) {
                Ok(count) => killed += count,
                Err(Error::Session(SessionError::NotStarted)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(killed)
    }

    /// Idle hint of the user: idle iff every owned session is idle.
    pub fn user_get_idle_hint(&self, uid: u32) -> Result<IdleHint, Error> {
        let user = self.users.get(&uid).ok_or(Error::NoSuchUser(uid))?;
        Ok(aggregate_idle(
            user.sessions.iter().filter_map(|id| self.sessions.get(id)),
        ))
    }

    /// Recomputes the user's state and display election after a membership
    /// change.
    pub(crate) fn user_update_state(&mut self, uid: u32) {
        let Some(user) = self.users.get(&uid) else {
            return;
        };

        let mut any_active = false;
        let mut any_live = false;
        for id in &user.sessions {
            match self.sessions.get(id).map(|s| s.state()) {
                Some(SessionState::Active) => {
                    any_active = true;
                    any_live = true;
                }
                Some(SessionState::Opening) | Some(SessionState::Online) => any_live = true,
                Some(SessionState::Closing) | None => {}
            }
        }

        let state = if user.stopping {
            UserState::Closing
        } else if any_active {
            UserState::Active
        } else if any_live {
            UserState::Online
        } else if user.linger {
            UserState::Lingering
        } else if user.started {
            UserState::Closing
        } else {
            UserState::Offline
        };

        // display election: oldest graphical session, newest session as a
        // fallback, cleared once nothing is left
        let display = user
            .sessions
            .iter()
            .find(|id| {
                self.sessions
                    .get(id.as_str())
                    .map_or(false, |s| s.kind.is_graphical())
            })
            .or_else(|| user.sessions.last())
            .cloned();

        let changed = state != user.state || display != user.display;
        if changed {
            let Some(user) = self.users.get_mut(&uid) else {
                return;
            };
            let display_value = &display;
            debug!(uid, state = state.as_str(), display = ?display_value, "User state changed");
            user.state = state;
            user.display = display;
            self.save_user(uid);
            self.notify(Notification::UserChanged(uid));
        }
    }

    pub(crate) fn save_user(&self, uid: u32) {
        let Some(user) = self.users.get(&uid) else {
            return;
        };

        let mut pairs = vec![
            ("NAME", user.name.clone()),
            ("STATE", user.state.as_str().to_owned()),
            ("LINGER", flag(user.linger)),
        ];
        if let Some(display) = &user.display {
            pairs.push(("DISPLAY", display.clone()));
        }
        if !user.sessions.is_empty() {
            pairs.push(("SESSIONS", user.sessions.join(" ")));
        }

        statefile::save(&self.config.users_dir().join(uid.to_string()), &pairs);
    }

    /// Drops a retired user record. Only the garbage collector calls this.
    pub(crate) fn user_finalize(&mut self, uid: u32) {
        if !self.users.contains_key(&uid) {
            return;
        }
        debug!(uid, "Retiring user");
        statefile::remove(&self.config.users_dir().join(uid.to_string()));
        self.users.shift_remove(&uid);
        self.notify(Notification::UserRemoved(uid));
    }
}

#[cfg(test)]
mod tests {
    use super::UserState;
    use crate::{
        event::HardwareEvent,
        session::{NewSession, SessionKind},
        test_support::Fixture,
    };

    #[test]
    fn user_follows_its_sessions() {
        let mut fx = Fixture::new();
        fx.start_seat0();
        let c1 = fx.open_vt_session(1000, 2);
        assert_eq!(fx.manager.user(1000).unwrap().state(), UserState::Online);

        fx.manager.dispatch(HardwareEvent::VtFocusChanged { vtnr: 2 });
        assert_eq!(fx.manager.user(1000).unwrap().state(), UserState::Active);

        fx.manager.dispatch(HardwareEvent::VtFocusChanged { vtnr: 9 });
        assert_eq!(fx.manager.user(1000).unwrap().state(), UserState::Online);

        fx.manager.session_terminate(&c1).unwrap();
        assert_eq!(fx.manager.user(1000).unwrap().state(), UserState::Closing);

        fx.manager.gc_run();
        assert!(fx.manager.user(1000).is_none());
    }

    #[test]
    fn lingering_user_survives_logout() {
        let mut fx = Fixture::new();
        fx.start_seat0();
        let c1 = fx.open_vt_session(1000, 2);
        fx.manager.user_set_linger(1000, 1000, "u1000", true).unwrap();

        fx.manager.session_terminate(&c1).unwrap();
        fx.manager.gc_run();

        let user = fx.manager.user(1000).unwrap();
        assert_eq!(user.state(), UserState::Lingering);

        fx.manager.user_set_linger(1000, 1000, "u1000", false).unwrap();
        fx.manager.gc_run();
        assert!(fx.manager.user(1000).is_none());
    }

    #[test]
    fn linger_marker_survives_restart() {
        let mut fx = Fixture::new();
        fx.manager.user_set_linger(1000, 1000, "joe", true).unwrap();

        let mut manager = fx.rebuild_manager();
        manager.user_get_or_create(1000, 1000, "joe");
        assert!(manager.user(1000).unwrap().linger());
        assert_eq!(manager.user(1000).unwrap().state(), UserState::Offline);
    }

    #[test]
    fn pre_enabled_linger_pins_the_record() {
        let mut fx = Fixture::new();
        fx.manager.user_set_linger(1000, 1000, "joe", true).unwrap();
        // never started: the record exists, pinned by linger
        assert_eq!(fx.manager.user(1000).unwrap().state(), UserState::Lingering);
        fx.manager.gc_run();
        assert!(fx.manager.user(1000).is_some());
    }

    #[test]
    fn display_election_prefers_oldest_graphical_session() {
        let mut fx = Fixture::new();
        fx.start_seat0();
        let _tty = fx.open_vt_session(1000, 2);

        let mut new = NewSession::user(1000, 1000, "u1000");
        new.kind = SessionKind::Wayland;
        new.display = Some(String::from("wayland-0"));
        let gfx1 = fx.manager.create_session(new).unwrap();
        fx.manager.session_start(&gfx1).unwrap();

        let mut new = NewSession::user(1000, 1000, "u1000");
        new.kind = SessionKind::X11;
        new.display = Some(String::from(":0"));
        let _gfx2 = fx.manager.create_session(new).unwrap();

        assert_eq!(fx.manager.user(1000).unwrap().display(), Some(gfx1.as_str()));
    }

    #[test]
    fn display_election_falls_back_to_newest_session() {
        let mut fx = Fixture::new();
        fx.start_seat0();
        let _c1 = fx.open_vt_session(1000, 2);
        let c2 = fx.open_vt_session(1000, 3);

        assert_eq!(fx.manager.user(1000).unwrap().display(), Some(c2.as_str()));
    }

    #[test]
    fn display_cleared_when_its_session_goes_away() {
        let mut fx = Fixture::new();
        fx.start_seat0();

        let mut new = NewSession::user(1000, 1000, "u1000");
        new.kind = SessionKind::X11;
        new.display = Some(String::from(":0"));
        let gfx = fx.manager.create_session(new).unwrap();
        fx.manager.session_start(&gfx).unwrap();
        assert_eq!(fx.manager.user(1000).unwrap().display(), Some(gfx.as_str()));

        let tty = fx.open_vt_session(1000, 2);
        fx.manager.session_terminate(&gfx).unwrap();
        fx.manager.gc_run();

        assert_eq!(fx.manager.user(1000).unwrap().display(), Some(tty.as_str()));
    }

    #[test]
    fn idle_hint_aggregation_over_a_user() {
        let mut fx = Fixture::new();
        fx.start_seat0();
        let c1 = fx.open_vt_session(1000, 2);
        let c2 = fx.open_vt_session(1000, 3);
        let c3 = fx.open_vt_session(1000, 4);

        fx.manager.session_set_idle_hint(&c1, true).unwrap();
        fx.manager.session_set_idle_hint(&c2, true).unwrap();
        assert!(!fx.manager.user_get_idle_hint(1000).unwrap().idle);

        // dropping the busy session flips the aggregate; the stamp is the
        // most recent idle transition
        fx.manager.session_terminate(&c3).unwrap();
        fx.manager.gc_run();

        let hint = fx.manager.user_get_idle_hint(1000).unwrap();
        assert!(hint.idle);
        let (_, since_c2) = fx.manager.session(&c2).unwrap().idle_hint();
        assert_eq!(hint.since, since_c2);
    }

    #[test]
    fn kill_policy_gates_session_teardown() {
        let mut fx = Fixture::with_config(|config| config.kill_user_processes = true);
        fx.start_seat0();
        let c1 = fx.open_vt_session(1000, 2);
        let group = fx.manager.cgroups().session_group(&c1);
        fx.mem.add_process(&group, 4242);

        fx.manager.session_terminate(&c1).unwrap();
        assert!(fx.mem.processes_in(&group).is_empty());
        assert!(!fx.mem.killed().is_empty());
    }

    #[test]
    fn kill_policy_off_leaves_processes_alone() {
        let mut fx = Fixture::new();
        fx.start_seat0();
        let c1 = fx.open_vt_session(1000, 2);
        let group = fx.manager.cgroups().session_group(&c1);
        fx.mem.add_process(&group, 4242);

        fx.manager.session_terminate(&c1).unwrap();
        assert_eq!(fx.mem.processes_in(&group), vec![4242]);
        assert!(fx.mem.killed().is_empty());
    }

    #[test]
    fn user_terminate_stops_every_session() {
        let mut fx = Fixture::new();
        fx.start_seat0();
        let _c1 = fx.open_vt_session(1000, 2);
        let _c2 = fx.open_vt_session(1000, 3);

        fx.manager.user_terminate(1000).unwrap();
        assert_eq!(fx.manager.user(1000).unwrap().state(), UserState::Closing);

        fx.manager.gc_run();
        assert!(fx.manager.user(1000).is_none());
        assert_eq!(fx.manager.sessions().count(), 0);
    }
}
