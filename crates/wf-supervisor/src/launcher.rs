use std::io;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::info;

pub trait Launch: Send + Sync {
    /// Starts the executable and returns without waiting for it.
    fn launch(&self, path: &Path) -> io::Result<()>;
}

/// Spawns the daemon in its own process group with no inherited stdio.
#[derive(Debug, Default, Clone)]
pub struct DetachedLauncher {
    args: Vec<String>,
}

impl DetachedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_args(args: Vec<String>) -> Self {
        Self { args }
    }
}

impl Launch for DetachedLauncher {
    fn launch(&self, path: &Path) -> io::Result<()> {
        let mut cmd = Command::new(path);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn()?;
        info!(
            pid = child.id().unwrap_or_default(),
            "launched daemon {}",
            path.display()
        );
        // Dropping the handle leaves the child running; tokio reaps it in the
        // background so an exited daemon does not linger as a zombie.
        drop(child);
        Ok(())
    }
}
