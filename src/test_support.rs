//! Shared fixture for the crate's tests: a manager wired to scripted
//! collaborators and temporary directories.

use std::path::PathBuf;

use tempfile::TempDir;

use crate::{
    acl::fake::RecordingAcl,
    cgroup::{mem::MemCgroup, CgroupTracker},
    config::Config,
    event::HardwareEvent,
    manager::Manager,
    session::{NewSession, SessionKind},
    vt::fake::ScriptedVt,
};

/// Run tests with `RUST_LOG=sessiond=trace` to see what the manager does.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) struct Fixture {
    pub(crate) manager: Manager,
    pub(crate) vt: ScriptedVt,
    pub(crate) acl: RecordingAcl,
    pub(crate) mem: MemCgroup,
    config: Config,
    _tmp: TempDir,
}

impl Fixture {
    pub(crate) fn new() -> Fixture {
        Fixture::with_config(|_| {})
    }

    pub(crate) fn with_config(tweak: impl FnOnce(&mut Config)) -> Fixture {
        init_logging();
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut config = Config {
            run_dir: tmp.path().join("run"),
            linger_dir: tmp.path().join("linger"),
            ..Config::default()
        };
        tweak(&mut config);

        let vt = ScriptedVt::with_focus(1);
        let acl = RecordingAcl::default();
        let mem = MemCgroup::new();
        mem.add_group("/cg/sessiond");

        let manager = Manager::new(
            config.clone(),
            Box::new(vt.clone()),
            Box::new(acl.clone()),
            CgroupTracker::new(Box::new(mem.clone()), "/cg", "sessiond"),
        )
        .expect("manager");

        Fixture {
            manager,
            vt,
            acl,
            mem,
            config,
            _tmp: tmp,
        }
    }

    /// A fresh manager over the same directories and collaborators, as
    /// after a daemon restart.
    pub(crate) fn rebuild_manager(&self) -> Manager {
        Manager::new(
            self.config.clone(),
            Box::new(self.vt.clone()),
            Box::new(self.acl.clone()),
            CgroupTracker::new(Box::new(self.mem.clone()), "/cg", "sessiond"),
        )
        .expect("manager")
    }

    /// Brings up the VT-capable seat0 with one master device.
    pub(crate) fn start_seat0(&mut self) {
        self.manager.dispatch(HardwareEvent::DeviceAdded {
            path: PathBuf::from("/dev/dri/card0"),
            seat: None,
            master: true,
        });
    }

    /// Brings up a secondary (non-VT) seat with one master device.
    pub(crate) fn start_seat(&mut self, seat: &str) {
        self.manager.dispatch(HardwareEvent::DeviceAdded {
            path: PathBuf::from(format!("/dev/dri/by-seat/{}", seat)),
            seat: Some(seat.to_owned()),
            master: true,
        });
    }

    /// Opens and starts a tty session on seat0 bound to `vtnr`.
    pub(crate) fn open_vt_session(&mut self, uid: u32, vtnr: u32) -> String {
        let mut new = NewSession::user(uid, uid, format!("u{}", uid));
        new.seat = Some(String::from("seat0"));
        new.vtnr = vtnr;
        new.kind = SessionKind::Tty;
        let id = self.manager.create_session(new).expect("create session");
        self.manager.session_start(&id).expect("start session");
        id
    }

    /// Opens and starts a session on a seat without VTs.
    pub(crate) fn open_seat_session(&mut self, uid: u32, seat: &str) -> String {
        let mut new = NewSession::user(uid, uid, format!("u{}", uid));
        new.seat = Some(seat.to_owned());
        let id = self.manager.create_session(new).expect("create session");
        self.manager.session_start(&id).expect("start session");
        id
    }

    /// Lets the kernel report `vtnr` as the focused VT.
    pub(crate) fn focus_vt(&mut self, vtnr: u32) {
        self.vt.set_focus(vtnr);
        self.manager.dispatch(HardwareEvent::VtFocusChanged { vtnr });
    }
}
