//! Side-effect free process liveness checks.

/// Outcome of signalling a pid with signal 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    NotFound,
    /// The pid exists but belongs to a process we may not signal, i.e. it
    /// was reused by something that is not our daemon.
    PermissionDenied,
}

impl Liveness {
    pub fn is_alive(self) -> bool {
        matches!(self, Liveness::Alive)
    }
}

pub trait LivenessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by `kill(pid, 0)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl LivenessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        probe(pid).is_alive()
    }
}

#[cfg(unix)]
pub fn probe(pid: u32) -> Liveness {
    // pid 0 and negative values address process groups, not a single process.
    let Ok(raw) = i32::try_from(pid) else {
        return Liveness::NotFound;
    };
    if raw <= 0 {
        return Liveness::NotFound;
    }
    // SAFETY: signal 0 performs only the existence and permission check and
    // delivers nothing; `raw` is a positive pid.
    let rc = unsafe { libc::kill(raw as libc::pid_t, 0) };
    if rc == 0 {
        return Liveness::Alive;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::EPERM) => Liveness::PermissionDenied,
        _ => Liveness::NotFound,
    }
}

#[cfg(not(unix))]
pub fn probe(_pid: u32) -> Liveness {
    Liveness::NotFound
}
