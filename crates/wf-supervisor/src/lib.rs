//! Discovery, launch and supervision of the `watchfired` daemon.
//!
//! The daemon publishes a [`ConnectionDescriptor`] when it starts serving and
//! removes it on a graceful exit. [`Supervisor`] uses the presence of that
//! record to tell a crash (record left behind) from a shutdown.

mod descriptor;
mod error;
mod launcher;
mod liveness;
mod locator;
mod policy;
mod supervisor;

use std::path::PathBuf;
use std::sync::Arc;

pub use descriptor::{ConnectionDescriptor, DescriptorSource, DescriptorStore};
pub use error::SupervisorError;
pub use launcher::{DetachedLauncher, Launch};
pub use liveness::{probe, Liveness, LivenessProbe, SystemProbe};
pub use locator::{DaemonLocator, Locate};
pub use policy::{RestartPolicy, StartPolicy, WatchPolicy};
pub use supervisor::{DaemonSession, SessionState, Supervisor, SupervisorEvent, WatchExit};

/// Supervisor wired to the real filesystem, process table and `PATH`.
pub fn system_supervisor(descriptor_path: PathBuf, daemon_binary: Option<PathBuf>) -> Supervisor {
    let probe: Arc<dyn LivenessProbe> = Arc::new(SystemProbe);
    let store = DescriptorStore::with_probe(descriptor_path, Arc::clone(&probe));
    let locator = DaemonLocator::from_env(wf_util::DAEMON_BINARY_NAME, daemon_binary);
    Supervisor::new(
        Arc::new(store),
        Arc::new(locator),
        Arc::new(DetachedLauncher::new()),
        probe,
    )
}
