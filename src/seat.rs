//! Seats, terminal positions and the active-session arbiter.
//!
//! A seat is a named grouping of physical devices one user can log into.
//! Exactly one seat (`seat0` by default) carries the kernel virtual
//! terminals; on that seat a session's *terminal position* is its VT number,
//! on every other seat positions are handed out first-fit. At any moment at
//! most one attached session is *active*, meaning it owns the seat's
//! devices; the arbiter in [`seat_active_vt_changed`] decides which one in
//! response to kernel focus changes.
//!
//! [`seat_active_vt_changed`]: Manager::seat_active_vt_changed

use smallvec::SmallVec;

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::{
    device::Device,
    manager::{Error, Manager, Notification},
    session::{aggregate_idle, IdleHint, SessionError, SessionState},
    statefile::{self, flag},
    vt::VT_RANGE_MAX,
};

bitflags::bitflags! {
    /// What a seat is capable of.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SeatCapabilities: u32 {
        /// The seat carries the kernel virtual terminals.
        const CAN_TTY = 0x1;
        /// The seat has a master device, i.e. a graphical/console presence.
        const CAN_GRAPHICAL = 0x2;
    }
}

/// Errors specific to seat operations
#[derive(Debug, thiserror::Error)]
pub enum SeatError {
    /// The seat id does not follow the required grammar
    #[error("Invalid seat identifier")]
    InvalidName,

    /// Terminal position 0 is reserved
    #[error("Terminal position 0 is reserved")]
    InvalidPosition,

    /// The position is beyond what the seat can address
    #[error("Terminal position {0} is not addressable on this seat")]
    OutOfRange(u32),

    /// No session occupies the requested position
    #[error("No session occupies terminal position {0}")]
    EmptyPosition(u32),

    /// No session occupies any position on this seat
    #[error("No session occupies a terminal position on this seat")]
    NoOccupiedPositions,

    /// The session is already attached to a seat
    #[error("Session is already attached to a seat")]
    AlreadyAttached,

    /// Session VT number and seat VT capability do not agree
    #[error("Virtual-terminal capability mismatch between seat and session")]
    VtMismatch,
}

/// Checks the seat id grammar: a `seat` prefix followed by ASCII
/// alphanumerics, `-` or `_`, at most 255 bytes overall.
pub fn seat_name_is_valid(name: &str) -> bool {
    name.starts_with("seat")
        && name.len() <= 255
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// A named grouping of devices a user can log into.
#[derive(Debug)]
pub struct Seat {
    pub(crate) id: String,
    pub(crate) primary: bool,
    pub(crate) devices: SmallVec<[Device; 2]>,
    pub(crate) sessions: SmallVec<[String; 4]>,
    // sparse terminal-position array, index 0 unused
    pub(crate) positions: Vec<Option<String>>,
    pub(crate) active: Option<String>,
    pub(crate) pending_switch: Option<String>,
    pub(crate) started: bool,
    pub(crate) in_gc_queue: bool,
}

impl Seat {
    fn new(id: String, primary: bool) -> Seat {
        Seat {
            id,
            primary,
            devices: SmallVec::new(),
            sessions: SmallVec::new(),
            positions: Vec::new(),
            active: None,
            pending_switch: None,
            started: false,
            in_gc_queue: false,
        }
    }

    /// The seat id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether this is the primary seat.
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// Whether this seat carries the kernel VTs. Only the primary seat does.
    pub fn has_vts(&self) -> bool {
        self.primary
    }

    /// Whether the seat has a graphical/console presence.
    pub fn can_graphical(&self) -> bool {
        self.devices.iter().any(|d| d.master)
    }

    /// The capability set of this seat.
    pub fn capabilities(&self) -> SeatCapabilities {
        let mut caps = SeatCapabilities::empty();
        if self.has_vts() {
            caps |= SeatCapabilities::CAN_TTY;
        }
        if self.can_graphical() {
            caps |= SeatCapabilities::CAN_GRAPHICAL;
        }
        caps
    }

    /// The currently active session, if any.
    pub fn active_session(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Ids of the attached sessions, in attach order.
    pub fn sessions(&self) -> impl Iterator<Item = &str> {
        self.sessions.iter().map(String::as_str)
    }

    /// The devices attached to this seat, masters first.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// The session occupying a terminal position.
    pub fn session_at(&self, position: usize) -> Option<&str> {
        self.positions.get(position).and_then(|slot| slot.as_deref())
    }

    fn first_free_position(&self) -> usize {
        let mut position = 1;
        while position < self.positions.len() && self.positions[position].is_some() {
            position += 1;
        }
        position
    }

    fn claim_position(&mut self, session: &str, position: usize) {
        if position == 0 {
            return;
        }
        if self.positions.len() <= position {
            self.positions.resize(position + 1, None);
        }
        // during a handover two sessions may carry the same position value;
        // the slot stays with the incumbent until it is evicted
        if self.positions[position].is_none() {
            self.positions[position] = Some(session.to_owned());
        }
    }

    fn clear_position(&mut self, position: usize, session: &str) {
        if let Some(slot) = self.positions.get_mut(position) {
            if slot.as_deref() == Some(session) {
                *slot = None;
            }
        }
    }

    fn scan_next(&self, from: usize) -> Option<&str> {
        let len = self.positions.len();
        if len == 0 {
            return None;
        }
        (from + 1..len)
            .chain(1..=from.min(len - 1))
            .find_map(|i| self.positions[i].as_deref())
    }

    fn scan_previous(&self, from: usize) -> Option<&str> {
        let len = self.positions.len();
        if len == 0 {
            return None;
        }
        (1..from)
            .rev()
            .chain((from.max(1)..len).rev())
            .find_map(|i| self.positions[i].as_deref())
    }

    fn add_device(&mut self, path: PathBuf, master: bool) -> bool {
        if let Some(device) = self.devices.iter_mut().find(|d| d.path == path) {
            device.master |= master;
            return false;
        }

        let device = Device::new(path, master);
        if master {
            let idx = self
                .devices
                .iter()
                .position(|d| !d.master)
                .unwrap_or(self.devices.len());
            self.devices.insert(idx, device);
        } else {
            self.devices.push(device);
        }
        true
    }

    fn remove_device(&mut self, path: &Path) -> Option<Device> {
        let idx = self.devices.iter().position(|d| d.path == path)?;
        Some(self.devices.remove(idx))
    }
}

impl Manager {
    /// Looks a seat up by id, creating it if it does not exist yet.
    ///
    /// Idempotent; the only failure is a malformed id.
    pub fn seat_get_or_create(&mut self, id: &str) -> Result<(), Error> {
        if !seat_name_is_valid(id) {
            return Err(SeatError::InvalidName.into());
        }

        if !self.seats.contains_key(id) {
            let primary = id == self.config.primary_seat;
            debug!(seat = id, primary, "Creating seat");
            self.seats.insert(id.to_owned(), Seat::new(id.to_owned(), primary));
        }
        Ok(())
    }

    /// Attaches a device to a seat, creating and starting the seat as needed.
    ///
    /// Re-adding a known device merges the master flag.
    pub fn seat_add_device(&mut self, seat_id: &str, path: PathBuf, master: bool) -> Result<(), Error> {
        self.seat_get_or_create(seat_id)?;

        let started = {
            let Some(seat) = self.seats.get_mut(seat_id) else {
                return Ok(());
            };
            if seat.add_device(path.clone(), master) {
                debug!(seat = seat_id, device = %path.display(), master, "Device attached");
            }
            seat.started
        };

        if started {
            self.save_seat(seat_id);
            self.notify(Notification::SeatChanged(seat_id.to_owned()));
        } else {
            self.seat_start(seat_id)?;
        }
        Ok(())
    }

    /// Detaches a device, wherever it is attached, and re-evaluates whether
    /// the owning seat still has a reason to exist.
    pub fn remove_device(&mut self, path: &Path) {
        let seat_id = self
            .seats
            .iter()
            .find(|(_, seat)| seat.devices.iter().any(|d| d.path == *path))
            .map(|(id, _)| id.clone());

        let Some(seat_id) = seat_id else {
            debug!(device = %path.display(), "Removed device was not attached to any seat");
            return;
        };

        if let Some(seat) = self.seats.get_mut(&seat_id) {
            seat.remove_device(path);
        }
        debug!(seat = %seat_id, device = %path.display(), "Device detached");
        self.save_seat(&seat_id);
        self.notify(Notification::SeatChanged(seat_id.clone()));
        self.gc_enqueue_seat(&seat_id);
    }

    /// Starts a seat: resolves the initially active session, persists state
    /// and announces the seat. Idempotent.
    pub fn seat_start(&mut self, seat_id: &str) -> Result<(), Error> {
        let has_vts = {
            let seat = self
                .seats
                .get_mut(seat_id)
                .ok_or_else(|| Error::NoSuchSeat(seat_id.to_owned()))?;
            if seat.started {
                return Ok(());
            }
            seat.started = true;
            seat.has_vts()
        };

        info!(seat = seat_id, "Seat appeared");

        // best-effort look at the previous run, before we overwrite the file
        let previous = statefile::load(&self.config.seats_dir().join(seat_id))
            .ok()
            .and_then(|mut values| values.remove("ACTIVE"));

        if has_vts {
            match self.vt.current() {
                Ok(vtnr) => {
                    let _ = self.seat_active_vt_changed(seat_id, vtnr);
                }
                Err(err) => debug!(seat = seat_id, "Could not read console focus: {}", err),
            }
        }

        let fallback = {
            let Some(seat) = self.seats.get(seat_id) else {
                return Ok(());
            };
            if seat.active.is_some() {
                None
            } else if has_vts {
                // the focused VT carries no session; prefer whoever was
                // active before the restart
                previous.filter(|id| {
                    seat.sessions.iter().any(|s| s == id)
                        && self
                            .sessions
                            .get(id)
                            .map_or(false, |s| s.state() != SessionState::Closing)
                })
            } else {
                seat.sessions.first().cloned()
            }
        };
        if let Some(id) = fallback {
            let _ = self.seat_set_active(seat_id, Some(id));
        }

        self.save_seat(seat_id);
        self.notify(Notification::SeatAdded(seat_id.to_owned()));
        Ok(())
    }

    /// Stops a seat: tears down every attached session (forcing the kill
    /// policy if requested) and schedules the seat for garbage collection.
    pub fn seat_stop(&mut self, seat_id: &str, force: bool) -> Result<(), Error> {
        let session_ids: Vec<String> = self
            .seats
            .get(seat_id)
            .ok_or_else(|| Error::NoSuchSeat(seat_id.to_owned()))?
            .sessions
            .to_vec();

        info!(seat = seat_id, force, "Stopping seat");
        for id in &session_ids {
            if let Err(err) = self.session_stop(id, force) {
                warn!(seat = seat_id, session = %id, "Failed to stop session: {}", err);
            }
        }

        if let Some(seat) = self.seats.get_mut(seat_id) {
            seat.started = false;
        }
        self.save_seat(seat_id);
        self.notify(Notification::SeatChanged(seat_id.to_owned()));
        self.gc_enqueue_seat(seat_id);
        Ok(())
    }

    /// Attaches a session to a seat and assigns its terminal position.
    ///
    /// On the VT-capable seat the position *is* the session's VT number;
    /// elsewhere the first free slot from 1 upward is claimed. Rejected when
    /// the seat's VT capability and the session's VT number disagree, or
    /// when the session already sits on a seat.
    pub fn seat_attach_session(&mut self, seat_id: &str, session_id: &str) -> Result<(), Error> {
        let (has_vts, vtnr) = {
            let seat = self
                .seats
                .get(seat_id)
                .ok_or_else(|| Error::NoSuchSeat(seat_id.to_owned()))?;
            let session = self
                .sessions
                .get(session_id)
                .ok_or_else(|| Error::NoSuchSession(session_id.to_owned()))?;

            if session.seat.is_some() {
                return Err(SeatError::AlreadyAttached.into());
            }
            if seat.has_vts() != (session.vtnr != 0) {
                return Err(SeatError::VtMismatch.into());
            }
            if session.vtnr > VT_RANGE_MAX {
                return Err(SeatError::OutOfRange(session.vtnr).into());
            }
            (seat.has_vts(), session.vtnr)
        };

        let position = {
            let Some(seat) = self.seats.get_mut(seat_id) else {
                return Ok(());
            };
            let position = if has_vts {
                vtnr as usize
            } else {
                seat.first_free_position()
            };
            seat.sessions.push(session_id.to_owned());
            seat.claim_position(session_id, position);
            position
        };

        if let Some(session) = self.sessions.get_mut(session_id) {
            session.seat = Some(seat_id.to_owned());
            session.position = position as u32;
        }
        debug!(seat = seat_id, session = session_id, position, "Session attached");

        // seats without VTs have no focus events; the first session wins
        let make_active = {
            let seat = self.seats.get(seat_id);
            seat.map_or(false, |s| !s.has_vts() && s.active.is_none())
        };
        if make_active {
            self.seat_set_active(seat_id, Some(session_id.to_owned()))?;
        }

        self.save_seat(seat_id);
        self.notify(Notification::SeatChanged(seat_id.to_owned()));
        Ok(())
    }

    /// Detaches a session from its seat, evicting its terminal position.
    ///
    /// If another still-attached session claims the same position value
    /// (a display-manager handover in flight), it inherits the slot rather
    /// than leaving it stale.
    pub fn seat_detach_session(&mut self, seat_id: &str, session_id: &str) {
        let position = self
            .sessions
            .get(session_id)
            .map(|s| s.position as usize)
            .unwrap_or(0);

        if let Some(session) = self.sessions.get_mut(session_id) {
            session.seat = None;
            session.position = 0;
        }

        let (was_active, non_vt) = {
            let Some(seat) = self.seats.get_mut(seat_id) else {
                return;
            };
            seat.sessions.retain(|id| id.as_str() != session_id);
            seat.clear_position(position, session_id);
            if seat.pending_switch.as_deref() == Some(session_id) {
                seat.pending_switch = None;
            }
            (seat.active.as_deref() == Some(session_id), !seat.has_vts())
        };
        debug!(seat = seat_id, session = session_id, "Session detached");

        // transient position sharing: re-install the other claimant
        let reinstall = {
            let Some(seat) = self.seats.get(seat_id) else {
                return;
            };
            if seat.session_at(position).is_none() {
                seat.sessions
                    .iter()
                    .find(|id| {
                        self.sessions
                            .get(id.as_str())
                            .map_or(false, |s| s.position as usize == position)
                    })
                    .cloned()
            } else {
                None
            }
        };
        if let Some(other) = reinstall {
            if let Some(seat) = self.seats.get_mut(seat_id) {
                seat.claim_position(&other, position);
            }
        }

        if was_active {
            let next = if non_vt {
                self.seats
                    .get(seat_id)
                    .and_then(|seat| seat.sessions.first().cloned())
            } else {
                None
            };
            let _ = self.seat_set_active(seat_id, next);
        }

        self.save_seat(seat_id);
        self.notify(Notification::SeatChanged(seat_id.to_owned()));
    }

    /// Makes `new` the active session of the seat, or clears the active
    /// session when `None`.
    ///
    /// Re-activating the current active session only re-grants device
    /// access; activity bookkeeping is left alone. Otherwise the old
    /// session's device access is paused and its state demoted, the device
    /// ACLs are re-pointed, and the new session is resumed and promoted.
    pub(crate) fn seat_set_active(&mut self, seat_id: &str, new: Option<String>) -> Result<(), Error> {
        let (same, old) = {
            let seat = self
                .seats
                .get_mut(seat_id)
                .ok_or_else(|| Error::NoSuchSeat(seat_id.to_owned()))?;

            if let Some(id) = &new {
                if !seat.sessions.iter().any(|s| s == id) {
                    return Err(SessionError::NotAttached.into());
                }
            }

            if seat.active == new {
                (true, None)
            } else {
                let old = seat.active.clone();
                seat.active = new.clone();
                seat.pending_switch = None;
                (false, old)
            }
        };

        if same {
            // resume-only: devices were paused externally, re-grant access
            if let Some(id) = &new {
                if let Err(err) = self.device_access.resume_device_access(seat_id, id) {
                    warn!(seat = seat_id, session = %id, "Failed to resume device access: {}", err);
                }
            }
            return Ok(());
        }

        info!(seat = seat_id, old = ?old, new = ?new, "Active session changed");

        if let Some(old_id) = &old {
            if let Err(err) = self.device_access.pause_device_access(seat_id, old_id) {
                warn!(seat = seat_id, session = %old_id, "Failed to pause device access: {}", err);
            }
            self.session_set_active_flag(old_id, false);
        }

        let old_uid = old.as_ref().and_then(|id| self.sessions.get(id)).map(|s| s.uid);
        let new_uid = new.as_ref().and_then(|id| self.sessions.get(id)).map(|s| s.uid);
        let devices: Vec<Device> = self
            .seats
            .get(seat_id)
            .map(|seat| seat.devices.to_vec())
            .unwrap_or_default();
        if let Err(err) = self
            .device_access
            .change_acls(seat_id, &devices, old_uid, new_uid)
        {
            warn!(seat = seat_id, "Failed to apply device ACLs: {}", err);
        }

        if let Some(new_id) = &new {
            if let Err(err) = self.device_access.resume_device_access(seat_id, new_id) {
                warn!(seat = seat_id, session = %new_id, "Failed to resume device access: {}", err);
            }
            self.session_set_active_flag(new_id, true);
        }

        self.save_seat(seat_id);
        self.notify(Notification::SeatChanged(seat_id.to_owned()));
        Ok(())
    }

    /// Reconciles the active session after the kernel reported VT `vtnr` as
    /// focused.
    ///
    /// Prefers a non-closing session on that VT; during the window where an
    /// old closing session and its replacement share the VT, the live one
    /// wins. A VT carrying no session at all clears the active session (the
    /// freshly spawned login prompt owns it now).
    pub fn seat_active_vt_changed(&mut self, seat_id: &str, vtnr: u32) -> Result<(), Error> {
        if vtnr == 0 {
            return Err(SeatError::InvalidPosition.into());
        }

        let candidate = {
            let seat = self
                .seats
                .get(seat_id)
                .ok_or_else(|| Error::NoSuchSeat(seat_id.to_owned()))?;
            if !seat.has_vts() {
                return Ok(());
            }

            let mut candidate: Option<String> = None;
            for id in &seat.sessions {
                let Some(session) = self.sessions.get(id.as_str()) else {
                    continue;
                };
                if session.vtnr != vtnr {
                    continue;
                }
                if session.state() != SessionState::Closing {
                    candidate = Some(id.clone());
                    break;
                }
                if candidate.is_none() {
                    candidate = Some(id.clone());
                }
            }
            candidate
        };

        debug!(seat = seat_id, vtnr, candidate = ?candidate, "Console focus changed");
        if let Some(seat) = self.seats.get_mut(seat_id) {
            seat.pending_switch = None;
        }
        self.seat_set_active(seat_id, candidate)
    }

    /// Activates the session at terminal position `position`.
    ///
    /// An unoccupied position on the VT-capable seat falls through to a raw
    /// VT activation (letting a login prompt spawn there), provided the
    /// position is inside the addressable VT range.
    pub fn seat_switch_to(&mut self, seat_id: &str, position: u32) -> Result<(), Error> {
        if position == 0 {
            return Err(SeatError::InvalidPosition.into());
        }

        let (occupant, has_vts) = {
            let seat = self
                .seats
                .get(seat_id)
                .ok_or_else(|| Error::NoSuchSeat(seat_id.to_owned()))?;
            (
                seat.session_at(position as usize).map(ToOwned::to_owned),
                seat.has_vts(),
            )
        };

        if let Some(id) = occupant {
            return self.session_activate(&id);
        }

        if !has_vts {
            return Err(SeatError::EmptyPosition(position).into());
        }
        if position > VT_RANGE_MAX {
            return Err(SeatError::OutOfRange(position).into());
        }
        Ok(self.vt.activate(position)?)
    }

    /// Activates the session at the next occupied terminal position,
    /// wrapping around once.
    pub fn seat_switch_to_next(&mut self, seat_id: &str) -> Result<(), Error> {
        self.seat_switch_cycle(seat_id, true)
    }

    /// Activates the session at the previous occupied terminal position,
    /// wrapping around once.
    pub fn seat_switch_to_previous(&mut self, seat_id: &str) -> Result<(), Error> {
        self.seat_switch_cycle(seat_id, false)
    }

    fn seat_switch_cycle(&mut self, seat_id: &str, forward: bool) -> Result<(), Error> {
        let target = {
            let seat = self
                .seats
                .get(seat_id)
                .ok_or_else(|| Error::NoSuchSeat(seat_id.to_owned()))?;
            let from = seat
                .active
                .as_ref()
                .and_then(|id| self.sessions.get(id))
                .map(|s| s.position as usize)
                .unwrap_or(0);

            let found = if forward {
                seat.scan_next(from)
            } else {
                seat.scan_previous(from)
            };
            found.map(ToOwned::to_owned)
        };

        match target {
            Some(id) => self.session_activate(&id),
            None => Err(SeatError::NoOccupiedPositions.into()),
        }
    }

    /// Idle hint of the seat: idle iff every attached session is idle.
    pub fn seat_get_idle_hint(&self, seat_id: &str) -> Result<IdleHint, Error> {
        let seat = self
            .seats
            .get(seat_id)
            .ok_or_else(|| Error::NoSuchSeat(seat_id.to_owned()))?;
        Ok(aggregate_idle(
            seat.sessions
                .iter()
                .filter_map(|id| self.sessions.get(id.as_str())),
        ))
    }

    pub(crate) fn save_seat(&self, seat_id: &str) {
        let Some(seat) = self.seats.get(seat_id) else {
            return;
        };

        let mut pairs = vec![
            ("IS_PRIMARY", flag(seat.primary)),
            ("CAN_TTY", flag(seat.has_vts())),
            ("CAN_GRAPHICAL", flag(seat.can_graphical())),
        ];
        if let Some(active) = &seat.active {
            pairs.push(("ACTIVE", active.clone()));
            if let Some(uid) = self.sessions.get(active).map(|s| s.uid) {
                pairs.push(("ACTIVE_UID", uid.to_string()));
            }
        }
        if !seat.sessions.is_empty() {
            let ids: Vec<&str> = seat.sessions.iter().map(String::as_str).collect();
            pairs.push(("SESSIONS", ids.join(" ")));
            let uids: Vec<String> = seat
                .sessions
                .iter()
                .filter_map(|id| self.sessions.get(id.as_str()))
                .map(|s| s.uid.to_string())
                .collect();
            pairs.push(("UIDS", uids.join(" ")));
        }

        statefile::save(&self.config.seats_dir().join(&seat.id), &pairs);
    }

    /// Drops a retired seat, tearing down whatever is still attached.
    /// Only the garbage collector calls this.
    pub(crate) fn seat_finalize(&mut self, seat_id: &str) {
        let Some(seat) = self.seats.get(seat_id) else {
            return;
        };
        let session_ids: Vec<String> = seat.sessions.to_vec();
        debug!(seat = seat_id, "Retiring seat");

        for id in &session_ids {
            let _ = self.session_stop(id, false);
        }
        for id in &session_ids {
            self.seat_detach_session(seat_id, id);
        }

        statefile::remove(&self.config.seats_dir().join(seat_id));
        self.seats.shift_remove(seat_id);
        self.notify(Notification::SeatRemoved(seat_id.to_owned()));
    }
}
