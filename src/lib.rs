#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # sessiond: a seat and login-session manager core
//!
//! This crate is the core of a login-session manager for multi-seat Linux
//! hosts. It tracks which users are logged in, on which seats, through
//! which sessions, and arbitrates which single session on a seat currently
//! owns the seat's devices. It is the authority other subsystems consult to
//! answer "who is logged in, where, and who may touch this device right
//! now".
//!
//! ## Structure of the crate
//!
//! - [`manager`] owns the entity registries and exposes the verb surface an
//!   IPC layer builds on; [`seat`], [`session`] and [`user`] carry the
//!   three entity state machines and their controllers, including the
//!   VT active-session arbiter.
//! - [`cgroup`] resolves processes to sessions and implements recursive
//!   kill/migrate over a session's control group.
//! - [`vt`] talks to the kernel console; [`event`] defines the inbound
//!   notification enum; behind the `backend_udev` feature, [`udev`] turns
//!   udev traffic into those notifications.
//! - [`acl`] is the boundary to the device ACL applier collaborator.
//!
//! ## The event loop and state handling
//!
//! Everything here is single-threaded and event-driven: one control loop
//! owns the [`Manager`] and feeds it [`HardwareEvent`]s and IPC verbs;
//! there is no internal locking because there is no concurrent writer. The
//! provided event sources ([`vt::VtFocusSource`], [`udev::UdevWatcher`])
//! implement [`calloop`]'s `EventSource` and slot into a calloop loop, but
//! any loop able to deliver the events works.
//!
//! Per-entity state files under the runtime directory are written with a
//! rename-into-place discipline for crash/restart recovery by
//! collaborators; the in-memory registries stay authoritative throughout.
//!
//! ## Logging
//!
//! This crate logs through [`tracing`]. Install a subscriber in the host
//! binary to see it; nothing is logged otherwise.

pub mod acl;
pub mod cgroup;
pub mod config;
pub mod device;
pub mod event;
mod gc;
pub mod manager;
pub mod seat;
pub mod session;
mod statefile;
#[cfg(feature = "backend_udev")]
pub mod udev;
pub mod user;
pub mod utils;
pub mod vt;

#[cfg(test)]
mod test_support;

pub use crate::{
    config::Config,
    event::HardwareEvent,
    manager::{system_manager, Error, Manager, Notification},
};
