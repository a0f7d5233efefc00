use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wf_util::CancelToken;

use crate::descriptor::{ConnectionDescriptor, DescriptorSource};
use crate::error::SupervisorError;
use crate::launcher::Launch;
use crate::liveness::LivenessProbe;
use crate::locator::Locate;
use crate::policy::{RestartPolicy, StartPolicy, WatchPolicy};

const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Running,
    Restarting,
    ShuttingDown,
}

/// What the supervisor currently knows about the daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonSession {
    pub descriptor: Option<ConnectionDescriptor>,
    pub watched_pid: Option<u32>,
    pub state: SessionState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Ready(ConnectionDescriptor),
    Crashed {
        pid: u32,
    },
    Restarted(ConnectionDescriptor),
    RestartFailed {
        attempt: u32,
        error: String,
        retry_in: Duration,
    },
    RestartAbandoned {
        attempts: u32,
    },
    /// The daemon removed its descriptor before exiting.
    Shutdown,
}

/// Why the watch loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchExit {
    Shutdown,
    Abandoned,
    Cancelled,
    /// The loop was entered without a running daemon to watch.
    NotRunning,
}

enum RestartExit {
    Shutdown,
    Abandoned,
    Cancelled,
}

pub struct Supervisor {
    descriptors: Arc<dyn DescriptorSource>,
    locator: Arc<dyn Locate>,
    launcher: Arc<dyn Launch>,
    probe: Arc<dyn LivenessProbe>,
    start: StartPolicy,
    watch: WatchPolicy,
    restart: RestartPolicy,
    session: watch::Sender<DaemonSession>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl Supervisor {
    pub fn new(
        descriptors: Arc<dyn DescriptorSource>,
        locator: Arc<dyn Locate>,
        launcher: Arc<dyn Launch>,
        probe: Arc<dyn LivenessProbe>,
    ) -> Self {
        let (session, _) = watch::channel(DaemonSession::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            descriptors,
            locator,
            launcher,
            probe,
            start: StartPolicy::default(),
            watch: WatchPolicy::default(),
            restart: RestartPolicy::default(),
            session,
            events,
        }
    }

    pub fn with_start_policy(mut self, policy: StartPolicy) -> Self {
        self.start = policy;
        self
    }

    pub fn with_watch_policy(mut self, policy: WatchPolicy) -> Self {
        self.watch = policy;
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    pub fn session(&self) -> watch::Receiver<DaemonSession> {
        self.session.subscribe()
    }

    pub fn current(&self) -> DaemonSession {
        self.session.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Returns the live daemon, launching one and waiting for its
    /// descriptor if none is registered.
    pub async fn ensure_running(&self) -> Result<ConnectionDescriptor, SupervisorError> {
        self.ensure_running_until(None).await
    }

    pub async fn ensure_running_until(
        &self,
        cancel: Option<&CancelToken>,
    ) -> Result<ConnectionDescriptor, SupervisorError> {
        match self.acquire(cancel).await {
            Ok(descriptor) => {
                info!("daemon ready at {descriptor}");
                self.enter_running(&descriptor);
                self.emit(SupervisorEvent::Ready(descriptor.clone()));
                Ok(descriptor)
            }
            Err(err) => {
                if err.is_configuration() {
                    error!("{err}");
                }
                self.set_state(SessionState::Idle);
                Err(err)
            }
        }
    }

    /// Probes the watched pid every interval until the daemon shuts down,
    /// restarts are abandoned or `cancel` fires. Crashes are restarted in
    /// place.
    pub async fn run_watch(&self, cancel: &CancelToken) -> WatchExit {
        loop {
            if pause(self.watch.interval, Some(cancel)).await.is_err() {
                return WatchExit::Cancelled;
            }
            let Some(pid) = self.session.borrow().watched_pid else {
                return WatchExit::NotRunning;
            };
            if self.probe.is_alive(pid) {
                continue;
            }

            if self.descriptors.read_raw().is_none() {
                self.enter_shutdown(pid);
                return WatchExit::Shutdown;
            }

            warn!(pid, "daemon exited without removing its descriptor");
            self.session.send_modify(|session| {
                session.state = SessionState::Restarting;
                session.watched_pid = None;
            });
            self.emit(SupervisorEvent::Crashed { pid });

            match self.restart(pid, cancel).await {
                Ok(descriptor) => {
                    info!("daemon restarted at {descriptor}");
                    self.enter_running(&descriptor);
                    self.emit(SupervisorEvent::Restarted(descriptor));
                }
                Err(RestartExit::Shutdown) => return WatchExit::Shutdown,
                Err(RestartExit::Abandoned) => return WatchExit::Abandoned,
                Err(RestartExit::Cancelled) => return WatchExit::Cancelled,
            }
        }
    }

    pub fn spawn_watch(self: &Arc<Self>, cancel: CancelToken) -> JoinHandle<WatchExit> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move { supervisor.run_watch(&cancel).await })
    }

    async fn restart(
        &self,
        crashed_pid: u32,
        cancel: &CancelToken,
    ) -> Result<ConnectionDescriptor, RestartExit> {
        let mut failures = 0u32;
        loop {
            let err = match self.acquire(Some(cancel)).await {
                Ok(descriptor) => return Ok(descriptor),
                Err(SupervisorError::Cancelled) => return Err(RestartExit::Cancelled),
                Err(err) => err,
            };
            failures += 1;
            let Some(delay) = self.restart.delay_after(failures) else {
                error!(attempts = failures, "giving up on restarting the daemon: {err}");
                self.session.send_replace(DaemonSession::default());
                self.emit(SupervisorEvent::RestartAbandoned { attempts: failures });
                return Err(RestartExit::Abandoned);
            };
            warn!(attempt = failures, "daemon restart failed, retrying in {delay:?}: {err}");
            self.emit(SupervisorEvent::RestartFailed {
                attempt: failures,
                error: err.to_string(),
                retry_in: delay,
            });
            if pause(delay, Some(cancel)).await.is_err() {
                return Err(RestartExit::Cancelled);
            }
            if self.descriptors.read_raw().is_none() {
                self.enter_shutdown(crashed_pid);
                return Err(RestartExit::Shutdown);
            }
        }
    }

    async fn acquire(
        &self,
        cancel: Option<&CancelToken>,
    ) -> Result<ConnectionDescriptor, SupervisorError> {
        if let Some(descriptor) = self.descriptors.read() {
            return Ok(descriptor);
        }
        self.session.send_if_modified(|session| {
            if session.state == SessionState::Restarting {
                return false;
            }
            session.state = SessionState::Starting;
            true
        });

        let path = self
            .locator
            .find()
            .ok_or_else(|| SupervisorError::DaemonNotFound(self.locator.binary_name().to_string()))?;
        self.launcher
            .launch(&path)
            .map_err(|source| SupervisorError::Launch {
                path: path.clone(),
                source,
            })?;

        for attempt in 1..=self.start.max_attempts {
            pause(self.start.poll_interval, cancel).await?;
            if let Some(descriptor) = self.descriptors.read() {
                debug!(attempt, "daemon descriptor appeared");
                return Ok(descriptor);
            }
        }
        Err(SupervisorError::StartTimeout(self.start.budget()))
    }

    fn enter_running(&self, descriptor: &ConnectionDescriptor) {
        self.session.send_replace(DaemonSession {
            descriptor: Some(descriptor.clone()),
            watched_pid: Some(descriptor.pid),
            state: SessionState::Running,
        });
    }

    fn enter_shutdown(&self, pid: u32) {
        info!(pid, "daemon shut down");
        self.session.send_replace(DaemonSession {
            descriptor: None,
            watched_pid: None,
            state: SessionState::ShuttingDown,
        });
        self.emit(SupervisorEvent::Shutdown);
    }

    fn set_state(&self, state: SessionState) {
        self.session.send_modify(|session| session.state = state);
    }

    fn emit(&self, event: SupervisorEvent) {
        // No receivers is fine; observers come and go.
        let _ = self.events.send(event);
    }
}

async fn pause(duration: Duration, cancel: Option<&CancelToken>) -> Result<(), SupervisorError> {
    match cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => Err(SupervisorError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        },
        None => {
            tokio::time::sleep(duration).await;
            Ok(())
        }
    }
}
