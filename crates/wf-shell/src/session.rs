use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use wf_client::{
    AgentStreams, ConnectionState, Connector, ControlChannel, DaemonConnector,
    ReconnectController, StreamEnd, StreamEvent, StreamKind, StreamSource, SubscriptionManager,
};
use wf_supervisor::{
    system_supervisor, DescriptorStore, Supervisor, SupervisorError, SupervisorEvent,
};
use wf_telemetry as telemetry;
use wf_util::CancelToken;

use crate::config::ShellConfig;
use crate::events::{ShellEvent, ShellEventSender};
use crate::presentation::Overlay;

const PROJECT_STREAMS: [StreamKind; 2] = [StreamKind::Screen, StreamKind::Issues];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionExit {
    DaemonShutdown,
    RestartAbandoned,
    Interrupted,
}

/// Collaborators a session is assembled from.
pub(crate) struct SessionParts {
    pub(crate) supervisor: Arc<Supervisor>,
    pub(crate) channel: Arc<ControlChannel>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) streams: Arc<dyn StreamSource>,
}

impl SessionParts {
    pub(crate) fn system(config: &ShellConfig) -> Self {
        let descriptor_path = config.descriptor_path();
        let supervisor = system_supervisor(descriptor_path.clone(), config.daemon_binary())
            .with_start_policy(config.start_policy())
            .with_watch_policy(config.watch_policy())
            .with_restart_policy(config.restart_policy());
        let channel = Arc::new(ControlChannel::new(
            config.rpc_timeout(),
            config.connect_timeout(),
        ));
        let connector = DaemonConnector::new(
            Arc::new(DescriptorStore::new(descriptor_path)),
            Arc::clone(&channel),
        );
        Self {
            supervisor: Arc::new(supervisor),
            streams: Arc::new(AgentStreams::new(Arc::clone(&channel))),
            connector: Arc::new(connector),
            channel,
        }
    }
}

/// One supervised shell run: keeps the daemon alive, the channel connected
/// and the project streams subscribed until the daemon shuts down.
pub(crate) struct ShellSession {
    parts: SessionParts,
    reconnect: ReconnectController,
    subscriptions: SubscriptionManager,
    events: ShellEventSender,
    projects: Vec<String>,
    exit_delay: Duration,
}

impl ShellSession {
    pub(crate) fn new(
        parts: SessionParts,
        config: &ShellConfig,
        events: ShellEventSender,
        projects: Vec<String>,
    ) -> Self {
        let reconnect =
            ReconnectController::new(Arc::clone(&parts.connector), config.reconnect_interval());
        let subscriptions = SubscriptionManager::new(Arc::clone(&parts.streams));
        Self {
            parts,
            reconnect,
            subscriptions,
            events,
            projects,
            exit_delay: config.shutdown_exit_delay(),
        }
    }

    pub(crate) async fn run(
        self,
        interrupt: impl Future<Output = ()> + Send,
    ) -> Result<SessionExit, SupervisorError> {
        let mut supervisor_events = self.parts.supervisor.subscribe();
        let descriptor = self.parts.supervisor.ensure_running().await?;
        telemetry::event("daemon.ready", &[("pid", &descriptor.pid.to_string())]);
        if let Err(err) = self.parts.channel.init_from(&descriptor) {
            warn!("cannot bind control channel: {err}");
        }

        let (lost_tx, mut lost_rx) = mpsc::unbounded_channel::<()>();
        {
            let subscriptions = self.subscriptions.clone();
            let events = self.events.clone();
            let projects = self.projects.clone();
            self.reconnect.on_connected(move |_| {
                subscribe_projects(&subscriptions, &events, &lost_tx, &projects);
            });
        }

        let mut states = self.reconnect.watch_state();
        let initial = *states.borrow_and_update();
        self.events
            .send(ShellEvent::Overlay(Overlay::derive(initial, false)));
        let reconnect_task = self.reconnect.spawn();
        let cancel = CancelToken::new();
        let watch_task = self.parts.supervisor.spawn_watch(cancel.clone());

        tokio::pin!(interrupt);
        let exit = loop {
            tokio::select! {
                _ = &mut interrupt => break SessionExit::Interrupted,
                event = supervisor_events.recv() => match event {
                    Ok(event) => {
                        if let Some(exit) = self.on_supervisor_event(event) {
                            break exit;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "supervisor events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break SessionExit::Interrupted,
                },
                changed = states.changed() => {
                    if changed.is_ok() {
                        let state = *states.borrow_and_update();
                        self.on_connection_state(state);
                    }
                }
                Some(()) = lost_rx.recv() => self.reconnect.mark_disconnected(),
            }
        };

        if exit == SessionExit::DaemonShutdown {
            tokio::select! {
                _ = &mut interrupt => info!("interrupted during shutdown delay"),
                _ = tokio::time::sleep(self.exit_delay) => {}
            }
        }

        cancel.cancel();
        self.reconnect.stop();
        self.subscriptions.unsubscribe_everything();
        let _ = reconnect_task.await;
        let _ = watch_task.await;
        info!(?exit, "shell session ended");
        Ok(exit)
    }

    fn on_supervisor_event(&self, event: SupervisorEvent) -> Option<SessionExit> {
        match event {
            SupervisorEvent::Ready(_) => None,
            SupervisorEvent::Crashed { pid } => {
                telemetry::event("daemon.crash", &[("pid", &pid.to_string())]);
                self.subscriptions.unsubscribe_everything();
                self.reconnect.mark_disconnected();
                self.events
                    .log(format!("daemon (pid {pid}) crashed, restarting"));
                None
            }
            SupervisorEvent::Restarted(descriptor) => {
                telemetry::event("daemon.restarted", &[("pid", &descriptor.pid.to_string())]);
                if let Err(err) = self.parts.channel.init_from(&descriptor) {
                    warn!("cannot rebind control channel: {err}");
                }
                self.events
                    .log(format!("daemon restarted at {}", descriptor.endpoint()));
                None
            }
            SupervisorEvent::RestartFailed {
                attempt,
                error,
                retry_in,
            } => {
                self.events.log(format!(
                    "restart attempt {attempt} failed ({error}), retrying in {}s",
                    retry_in.as_secs()
                ));
                None
            }
            SupervisorEvent::RestartAbandoned { attempts } => {
                self.events
                    .log(format!("gave up restarting the daemon after {attempts} attempts"));
                Some(SessionExit::RestartAbandoned)
            }
            SupervisorEvent::Shutdown => {
                telemetry::event("daemon.shutdown", &[]);
                self.reconnect.stop();
                self.subscriptions.unsubscribe_everything();
                let overlay = Overlay::derive(self.reconnect.state(), true);
                self.events.send(ShellEvent::Overlay(overlay));
                Some(SessionExit::DaemonShutdown)
            }
        }
    }

    fn on_connection_state(&self, state: ConnectionState) {
        telemetry::event("shell.connection", &[("state", &format!("{state:?}"))]);
        self.events
            .send(ShellEvent::Overlay(Overlay::derive(state, false)));
    }
}

fn subscribe_projects(
    subscriptions: &SubscriptionManager,
    events: &ShellEventSender,
    lost: &mpsc::UnboundedSender<()>,
    projects: &[String],
) {
    for project in projects {
        for kind in PROJECT_STREAMS {
            let on_event = {
                let events = events.clone();
                let project = project.clone();
                move |event: StreamEvent| {
                    events.send(shell_event(&project, event));
                }
            };
            let on_end = {
                let events = events.clone();
                let lost = lost.clone();
                let project = project.clone();
                move |end: StreamEnd| {
                    if matches!(end, StreamEnd::Disconnected(_)) {
                        let _ = lost.send(());
                    }
                    if let Some(detail) = describe_end(&end) {
                        events.send(ShellEvent::StreamEnded {
                            project_id: project,
                            kind,
                            detail,
                        });
                    }
                }
            };
            subscriptions.subscribe(project, kind, on_event, on_end);
        }
    }
}

pub(crate) fn shell_event(project: &str, event: StreamEvent) -> ShellEvent {
    let project_id = project.to_string();
    match event {
        StreamEvent::Screen(frame) => ShellEvent::Screen { project_id, frame },
        StreamEvent::Issue(issue) => ShellEvent::Issue { project_id, issue },
        StreamEvent::RawOutput(data) => ShellEvent::Output { project_id, data },
    }
}

/// `None` for ends the user asked for.
pub(crate) fn describe_end(end: &StreamEnd) -> Option<String> {
    match end {
        StreamEnd::Cancelled => None,
        StreamEnd::Completed => Some("completed".to_string()),
        StreamEnd::Disconnected(status) => Some(format!("connection lost: {}", status.message())),
        StreamEnd::Failed(status) => Some(format!("{:?}: {}", status.code(), status.message())),
    }
}
