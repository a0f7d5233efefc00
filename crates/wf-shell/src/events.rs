use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use wf_client::StreamKind;
use wf_proto::watchfire::{AgentIssue, ScreenBuffer};

use crate::presentation::Overlay;

pub(crate) const DEFAULT_EVENT_QUEUE_SIZE: usize = 512;

/// Everything background tasks hand to the presentation loop.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ShellEvent {
    Overlay(Overlay),
    Screen {
        project_id: String,
        frame: ScreenBuffer,
    },
    Issue {
        project_id: String,
        issue: Option<AgentIssue>,
    },
    Output {
        project_id: String,
        data: Vec<u8>,
    },
    StreamEnded {
        project_id: String,
        kind: StreamKind,
        detail: String,
    },
    Log(String),
}

impl ShellEvent {
    fn screen_project(&self) -> Option<&str> {
        match self {
            ShellEvent::Screen { project_id, .. } => Some(project_id),
            _ => None,
        }
    }

    fn is_log(&self) -> bool {
        matches!(self, ShellEvent::Log(_))
    }
}

#[derive(Clone)]
pub(crate) struct ShellEventSender {
    inner: Arc<ShellEventQueue>,
}

pub(crate) struct ShellEventQueue {
    queue: Mutex<VecDeque<ShellEvent>>,
    notify: mpsc::Sender<()>,
    max_len: usize,
}

impl ShellEventQueue {
    pub(crate) fn new(max_len: usize) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (notify, notify_rx) = mpsc::channel(1);
        (
            Arc::new(Self {
                queue: Mutex::new(VecDeque::new()),
                notify,
                max_len: max_len.max(1),
            }),
            notify_rx,
        )
    }

    pub(crate) fn sender(self: &Arc<Self>) -> ShellEventSender {
        ShellEventSender {
            inner: Arc::clone(self),
        }
    }

    pub(crate) fn drain(&self) -> Vec<ShellEvent> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.drain(..).collect()
    }

    fn push(&self, event: ShellEvent) -> bool {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let was_empty = queue.is_empty();

        // Only the newest frame of a screen matters.
        if let Some(project) = event.screen_project() {
            if let Some(existing) = queue
                .iter_mut()
                .find(|queued| queued.screen_project() == Some(project))
            {
                *existing = event;
                return false;
            }
        }

        if queue.len() >= self.max_len {
            if let Some(pos) = queue.iter().position(ShellEvent::is_log) {
                queue.remove(pos);
            } else if event.is_log() {
                return false;
            } else {
                queue.pop_front();
            }
        }

        queue.push_back(event);
        if was_empty {
            let _ = self.notify.try_send(());
        }
        true
    }
}

impl ShellEventSender {
    /// Returns false when the event was coalesced into a queued one or
    /// dropped.
    pub(crate) fn send(&self, event: ShellEvent) -> bool {
        self.inner.push(event)
    }

    pub(crate) fn log(&self, line: impl Into<String>) {
        self.send(ShellEvent::Log(line.into()));
    }
}
