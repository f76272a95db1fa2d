//! Deferred retirement of seats, sessions and users.
//!
//! Teardown is decoupled from the event that triggered it: anything that
//! *might* have become unreferenced is pushed onto a FIFO queue and looked
//! at during the next sweep. Enqueueing is idempotent and O(1) thanks to an
//! in-queue flag on the entity itself; entries that turn out to still be
//! referenced are dropped without fuss and re-enqueued by whatever touches
//! them next.

use rustix::{io::Errno, process::Pid};
use tracing::trace;

use crate::{manager::Manager, session::SessionState, user::UserState};

/// A queued reference to an entity awaiting a retirement check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GcEntity {
    Seat(String),
    Session(String),
    User(u32),
}

impl Manager {
    pub(crate) fn gc_enqueue_seat(&mut self, id: &str) {
        if let Some(seat) = self.seats.get_mut(id) {
            if !seat.in_gc_queue {
                seat.in_gc_queue = true;
                self.gc_queue.push_back(GcEntity::Seat(id.to_owned()));
            }
        }
    }

    pub(crate) fn gc_enqueue_session(&mut self, id: &str) {
        if let Some(session) = self.sessions.get_mut(id) {
            if !session.in_gc_queue {
                session.in_gc_queue = true;
                self.gc_queue.push_back(GcEntity::Session(id.to_owned()));
            }
        }
    }

    pub(crate) fn gc_enqueue_user(&mut self, uid: u32) {
        if let Some(user) = self.users.get_mut(&uid) {
            if !user.in_gc_queue {
                user.in_gc_queue = true;
                self.gc_queue.push_back(GcEntity::User(uid));
            }
        }
    }

    /// Sweeps the garbage-collection queue, retiring every queued entity
    /// that nothing references anymore.
    ///
    /// Retiring one entity may enqueue others (a session drags its seat and
    /// user in); the sweep keeps going until the queue is drained.
    pub fn gc_run(&mut self) {
        while let Some(entity) = self.gc_queue.pop_front() {
            match entity {
                GcEntity::Seat(id) => {
                    let Some(seat) = self.seats.get_mut(&id) else {
                        continue;
                    };
                    seat.in_gc_queue = false;
                    if self.seat_may_gc(&id) {
                        self.seat_finalize(&id);
                    } else {
                        trace!(seat = %id, "Seat still referenced");
                    }
                }
                GcEntity::Session(id) => {
                    let Some(session) = self.sessions.get_mut(&id) else {
                        continue;
                    };
                    session.in_gc_queue = false;
                    if self.session_may_gc(&id) {
                        self.session_finalize(&id);
                    } else {
                        trace!(session = %id, "Session still referenced");
                    }
                }
                GcEntity::User(uid) => {
                    let Some(user) = self.users.get_mut(&uid) else {
                        continue;
                    };
                    user.in_gc_queue = false;
                    if self.user_may_gc(uid) {
                        self.user_finalize(uid);
                    } else {
                        trace!(uid, "User still referenced");
                    }
                }
            }
        }
    }

    /// A seat retires once it was never (or no longer is) started, or it is
    /// a secondary seat with no master device left.
    fn seat_may_gc(&self, id: &str) -> bool {
        let Some(seat) = self.seats.get(id) else {
            return false;
        };
        !seat.started || (!seat.is_primary() && !seat.can_graphical())
    }

    /// A session retires once it is closing, its control group is empty or
    /// was never created, and its leader process is gone.
    fn session_may_gc(&mut self, id: &str) -> bool {
        let Some(session) = self.sessions.get(id) else {
            return false;
        };
        if session.state() != SessionState::Closing {
            return false;
        }
        if let Some(leader) = session.leader {
            if pid_is_alive(leader) {
                return false;
            }
        }
        match session.cgroup.clone() {
            Some(group) => self.cgroups.group_is_empty(&group),
            None => true,
        }
    }

    /// A user retires once they are fully logged out, not lingering, and
    /// own no sessions.
    fn user_may_gc(&self, uid: u32) -> bool {
        let Some(user) = self.users.get(&uid) else {
            return false;
        };
        matches!(user.state(), UserState::Closing | UserState::Offline) && user.sessions.is_empty()
    }
}

fn pid_is_alive(pid: i32) -> bool {
    let Some(pid) = Pid::from_raw(pid) else {
        return false;
    };
    !matches!(rustix::process::test_kill_process(pid), Err(err) if err == Errno::SRCH)
}

#[cfg(test)]
mod tests {
    use crate::{session::SessionState, test_support::Fixture};

    #[test]
    fn enqueue_is_idempotent() {
        let mut fx = Fixture::new();
        fx.start_seat0();
        let c1 = fx.open_vt_session(1000, 2);

        fx.manager.gc_enqueue_session(&c1);
        fx.manager.gc_enqueue_session(&c1);
        fx.manager.gc_enqueue_session(&c1);
        assert_eq!(fx.manager.gc_queue_len(), 1);

        // still online: the sweep drops the entry without retiring anything
        fx.manager.gc_run();
        assert!(fx.manager.session(&c1).is_some());
        assert_eq!(fx.manager.gc_queue_len(), 0);
    }

    #[test]
    fn closing_session_with_busy_cgroup_is_kept() {
        let mut fx = Fixture::new();
        fx.start_seat0();
        let c1 = fx.open_vt_session(1000, 2);
        let group = fx.manager.cgroups().session_group(&c1);
        fx.mem.add_process(&group, 4242);

        fx.manager.session_terminate(&c1).unwrap();
        fx.manager.gc_run();
        assert_eq!(fx.manager.session(&c1).unwrap().state(), SessionState::Closing);

        // the last process exits; the next relevant event re-enqueues
        fx.mem.clear_group(&group);
        fx.manager.gc_enqueue_session(&c1);
        fx.manager.gc_run();
        assert!(fx.manager.session(&c1).is_none());
    }

    #[test]
    fn secondary_seat_without_master_device_retires() {
        let mut fx = Fixture::new();
        fx.manager
            .seat_add_device("seat-spare", "/dev/dri/card1".into(), true)
            .unwrap();
        assert!(fx.manager.seat("seat-spare").is_some());

        fx.manager
            .dispatch(crate::event::HardwareEvent::DeviceRemoved {
                path: "/dev/dri/card1".into(),
            });
        fx.manager.gc_run();
        assert!(fx.manager.seat("seat-spare").is_none());
    }

    #[test]
    fn primary_seat_survives_device_loss() {
        let mut fx = Fixture::new();
        fx.start_seat0();
        fx.manager
            .dispatch(crate::event::HardwareEvent::DeviceRemoved {
                path: "/dev/dri/card0".into(),
            });
        fx.manager.gc_run();
        assert!(fx.manager.seat("seat0").is_some());
    }

    #[test]
    fn never_started_seat_retires() {
        let mut fx = Fixture::new();
        fx.manager.seat_get_or_create("seat0").unwrap();
        fx.manager.gc_enqueue_seat("seat0");
        fx.manager.gc_run();
        assert!(fx.manager.seat("seat0").is_none());
    }

    #[test]
    fn retiring_a_session_cascades_to_seat_and_user() {
        let mut fx = Fixture::new();
        fx.start_seat0();
        let c1 = fx.open_vt_session(1000, 2);

        fx.manager.session_terminate(&c1).unwrap();
        fx.manager.gc_run();

        assert!(fx.manager.session(&c1).is_none());
        assert!(fx.manager.user(1000).is_none());
        // the primary seat keeps its master device and stays
        assert!(fx.manager.seat("seat0").is_some());
    }
}
