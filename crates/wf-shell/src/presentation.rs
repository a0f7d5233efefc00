use wf_client::ConnectionState;

use crate::events::ShellEvent;

/// What the shell shows on top of (or instead of) the project views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Overlay {
    Connecting,
    None,
    Reconnecting,
    /// Terminal: the daemon shut down on purpose and the shell will exit.
    ShutDown,
}

impl Overlay {
    pub(crate) fn derive(state: ConnectionState, shutdown_seen: bool) -> Self {
        if shutdown_seen {
            return Overlay::ShutDown;
        }
        match state {
            ConnectionState::NeverConnected => Overlay::Connecting,
            ConnectionState::Connected => Overlay::None,
            ConnectionState::DisconnectedAfterConnected => Overlay::Reconnecting,
        }
    }

    fn banner(self) -> &'static str {
        match self {
            Overlay::Connecting => "connecting to daemon...",
            Overlay::None => "connected",
            Overlay::Reconnecting => "connection lost, reconnecting...",
            Overlay::ShutDown => "daemon shut down, exiting",
        }
    }
}

/// Tracks the overlay so repeated identical states are rendered once.
#[derive(Debug)]
pub(crate) struct Presentation {
    overlay: Option<Overlay>,
}

impl Presentation {
    pub(crate) fn new() -> Self {
        Self { overlay: None }
    }

    /// Terminal lines for one event, if it changes what is shown.
    pub(crate) fn render(&mut self, event: &ShellEvent) -> Option<String> {
        match event {
            ShellEvent::Overlay(next) => {
                if self.overlay == Some(Overlay::ShutDown) || self.overlay == Some(*next) {
                    return None;
                }
                self.overlay = Some(*next);
                Some(format!("== {}", next.banner()))
            }
            ShellEvent::Screen { project_id, frame } => {
                let last = frame
                    .lines
                    .iter()
                    .rev()
                    .find(|line| !line.trim().is_empty())
                    .map(String::as_str)
                    .unwrap_or("");
                Some(format!(
                    "[{project_id}] screen {}x{} @{},{} | {last}",
                    frame.cols, frame.rows, frame.cursor_row, frame.cursor_col
                ))
            }
            ShellEvent::Issue { project_id, issue } => Some(match issue {
                Some(issue) => format!(
                    "[{project_id}] issue {}: {}",
                    issue.issue_type, issue.message
                ),
                None => format!("[{project_id}] issue cleared"),
            }),
            ShellEvent::Output { project_id, data } => {
                let text = String::from_utf8_lossy(data);
                Some(format!("[{project_id}] {}", text.trim_end()))
            }
            ShellEvent::StreamEnded {
                project_id,
                kind,
                detail,
            } => Some(format!("[{project_id}] {kind} stream ended: {detail}")),
            ShellEvent::Log(line) => Some(line.clone()),
        }
    }
}
