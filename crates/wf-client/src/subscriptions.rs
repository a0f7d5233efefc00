use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tonic::{Code, Status};
use tracing::{debug, info, warn};
use uuid::Uuid;
use wf_proto::watchfire::{AgentIssue, ScreenBuffer};
use wf_util::CancelToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Screen,
    Issues,
    RawOutput,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamKind::Screen => "screen",
            StreamKind::Issues => "issues",
            StreamKind::RawOutput => "raw-output",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Screen(ScreenBuffer),
    /// `None` when the daemon reports the previous issue as resolved.
    Issue(Option<AgentIssue>),
    RawOutput(Vec<u8>),
}

/// How a subscription ended. Delivered exactly once per subscription.
#[derive(Debug, Clone)]
pub enum StreamEnd {
    Cancelled,
    Completed,
    Disconnected(Status),
    Failed(Status),
}

impl StreamEnd {
    pub fn from_status(status: Status) -> Self {
        match status.code() {
            Code::Unavailable | Code::Cancelled => StreamEnd::Disconnected(status),
            _ => StreamEnd::Failed(status),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StreamEnd::Disconnected(_) | StreamEnd::Failed(_))
    }
}

pub type EventStream = BoxStream<'static, Result<StreamEvent, Status>>;

/// Opens the server stream behind a subscription.
#[tonic::async_trait]
pub trait StreamSource: Send + Sync {
    async fn open(&self, kind: StreamKind, subject: &str) -> Result<EventStream, Status>;
}

struct Callbacks {
    on_event: Box<dyn FnMut(StreamEvent) + Send>,
    on_end: Box<dyn FnOnce(StreamEnd) + Send>,
}

type Sink = Arc<Mutex<Option<Callbacks>>>;
type Key = (String, StreamKind);

struct Handle {
    id: Uuid,
    cancel: CancelToken,
    sink: Sink,
}

/// At most one live stream per `(subject, kind)`.
///
/// Callbacks run on the runtime and must not subscribe or unsubscribe the
/// subject they were registered for; doing so from another task is fine.
#[derive(Clone)]
pub struct SubscriptionManager {
    source: Arc<dyn StreamSource>,
    handles: Arc<Mutex<HashMap<Key, Handle>>>,
}

impl SubscriptionManager {
    pub fn new(source: Arc<dyn StreamSource>) -> Self {
        Self {
            source,
            handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Opens a stream for `(subject, kind)`, cancelling any stream already
    /// registered under that key first. Cancelling the returned token ends
    /// the subscription with [`StreamEnd::Cancelled`].
    pub fn subscribe(
        &self,
        subject: &str,
        kind: StreamKind,
        on_event: impl FnMut(StreamEvent) + Send + 'static,
        on_end: impl FnOnce(StreamEnd) + Send + 'static,
    ) -> CancelToken {
        let key: Key = (subject.to_string(), kind);
        let id = Uuid::new_v4();
        let cancel = CancelToken::new();
        let sink: Sink = Arc::new(Mutex::new(Some(Callbacks {
            on_event: Box::new(on_event),
            on_end: Box::new(on_end),
        })));
        // Swap under one lock so concurrent subscribers always see each other.
        let previous = lock(&self.handles).insert(
            key.clone(),
            Handle {
                id,
                cancel: cancel.clone(),
                sink: Arc::clone(&sink),
            },
        );
        if let Some(previous) = previous {
            debug!(subject, %kind, "superseding subscription");
            teardown(previous);
        }

        tokio::spawn(pump(
            Arc::clone(&self.source),
            Arc::clone(&self.handles),
            key,
            id,
            cancel.clone(),
            sink,
        ));
        cancel
    }

    pub fn unsubscribe(&self, subject: &str, kind: StreamKind) -> bool {
        let removed = lock(&self.handles).remove(&(subject.to_string(), kind));
        match removed {
            Some(handle) => {
                teardown(handle);
                true
            }
            None => false,
        }
    }

    /// Cancels every stream for `subject`. No callback registered for those
    /// streams runs after this returns, apart from the `Cancelled` ends
    /// delivered here.
    pub fn unsubscribe_all(&self, subject: &str) -> usize {
        let removed: Vec<Handle> = {
            let mut handles = lock(&self.handles);
            let keys: Vec<Key> = handles
                .keys()
                .filter(|(key_subject, _)| key_subject == subject)
                .cloned()
                .collect();
            keys.iter().filter_map(|key| handles.remove(key)).collect()
        };
        let count = removed.len();
        removed.into_iter().for_each(teardown);
        count
    }

    /// Cancels every stream, e.g. when the daemon behind them restarted.
    pub fn unsubscribe_everything(&self) -> usize {
        let removed: Vec<Handle> = lock(&self.handles).drain().map(|(_, handle)| handle).collect();
        let count = removed.len();
        removed.into_iter().for_each(teardown);
        count
    }

    pub fn is_active(&self, subject: &str, kind: StreamKind) -> bool {
        lock(&self.handles).contains_key(&(subject.to_string(), kind))
    }

    pub fn len(&self) -> usize {
        lock(&self.handles).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn teardown(handle: Handle) {
    handle.cancel.cancel();
    let callbacks = lock(&handle.sink).take();
    if let Some(callbacks) = callbacks {
        (callbacks.on_end)(StreamEnd::Cancelled);
    }
}

async fn pump(
    source: Arc<dyn StreamSource>,
    handles: Arc<Mutex<HashMap<Key, Handle>>>,
    key: Key,
    id: Uuid,
    cancel: CancelToken,
    sink: Sink,
) {
    let (subject, kind) = (key.0.as_str(), key.1);
    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        opened = source.open(kind, subject) => Some(opened),
    };

    let end = match opened {
        None => StreamEnd::Cancelled,
        Some(Err(status)) => StreamEnd::from_status(status),
        Some(Ok(mut stream)) => loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => break StreamEnd::Cancelled,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(event)) => {
                    let mut callbacks = lock(&sink);
                    match callbacks.as_mut() {
                        Some(callbacks) => (callbacks.on_event)(event),
                        None => break StreamEnd::Cancelled,
                    }
                }
                Some(Err(status)) => break StreamEnd::from_status(status),
                None => break StreamEnd::Completed,
            }
        },
    };

    {
        let mut handles = lock(&handles);
        if handles.get(&key).map(|handle| handle.id) == Some(id) {
            handles.remove(&key);
        }
    }

    let callbacks = lock(&sink).take();
    let Some(callbacks) = callbacks else {
        return;
    };
    match &end {
        StreamEnd::Cancelled | StreamEnd::Completed => {
            debug!(subject, %kind, "stream ended: {end:?}")
        }
        StreamEnd::Disconnected(status) => {
            info!(subject, %kind, "stream lost connection: {}", status.message())
        }
        StreamEnd::Failed(status) => warn!(subject, %kind, "stream failed: {status}"),
    }
    (callbacks.on_end)(end);
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use super::*;

    type Feed = mpsc::UnboundedSender<Result<StreamEvent, Status>>;

    #[derive(Default)]
    struct FakeSource {
        queued: Mutex<HashMap<Key, VecDeque<mpsc::UnboundedReceiver<Result<StreamEvent, Status>>>>>,
        refuse: Mutex<Option<Status>>,
    }

    impl FakeSource {
        fn feed(&self, subject: &str, kind: StreamKind) -> Feed {
            let (tx, rx) = mpsc::unbounded_channel();
            self.queued
                .lock()
                .unwrap()
                .entry((subject.to_string(), kind))
                .or_default()
                .push_back(rx);
            tx
        }
    }

    #[tonic::async_trait]
    impl StreamSource for FakeSource {
        async fn open(&self, kind: StreamKind, subject: &str) -> Result<EventStream, Status> {
            if let Some(status) = self.refuse.lock().unwrap().clone() {
                return Err(status);
            }
            let rx = self
                .queued
                .lock()
                .unwrap()
                .get_mut(&(subject.to_string(), kind))
                .and_then(VecDeque::pop_front);
            Ok(match rx {
                Some(rx) => UnboundedReceiverStream::new(rx).boxed(),
                None => futures_util::stream::pending().boxed(),
            })
        }
    }

    #[derive(Clone, Default)]
    struct Journal(Arc<Mutex<Vec<String>>>);

    impl Journal {
        fn callbacks(
            &self,
            name: &str,
        ) -> (
            impl FnMut(StreamEvent) + Send + 'static,
            impl FnOnce(StreamEnd) + Send + 'static,
        ) {
            let (events, ends) = (self.clone(), self.clone());
            let (event_name, end_name) = (name.to_string(), name.to_string());
            (
                move |event: StreamEvent| events.push(format!("{event_name}:{}", describe(&event))),
                move |end: StreamEnd| ends.push(format!("{end_name}:end:{}", end_label(&end))),
            )
        }

        fn push(&self, line: String) {
            self.0.lock().unwrap().push(line);
        }

        fn lines(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    fn describe(event: &StreamEvent) -> String {
        match event {
            StreamEvent::Screen(frame) => format!("screen:{}", frame.lines.join("|")),
            StreamEvent::Issue(Some(issue)) => format!("issue:{}", issue.issue_type),
            StreamEvent::Issue(None) => "issue:cleared".to_string(),
            StreamEvent::RawOutput(data) => format!("raw:{}", data.len()),
        }
    }

    fn end_label(end: &StreamEnd) -> &'static str {
        match end {
            StreamEnd::Cancelled => "cancelled",
            StreamEnd::Completed => "completed",
            StreamEnd::Disconnected(_) => "disconnected",
            StreamEnd::Failed(_) => "failed",
        }
    }

    fn frame(text: &str) -> Result<StreamEvent, Status> {
        Ok(StreamEvent::Screen(ScreenBuffer {
            project_id: "p1".into(),
            lines: vec![text.to_string()],
            ..Default::default()
        }))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn manager() -> (Arc<FakeSource>, SubscriptionManager) {
        let source = Arc::new(FakeSource::default());
        (source.clone(), SubscriptionManager::new(source))
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribe_supersedes_previous_stream() {
        let (source, manager) = manager();
        let journal = Journal::default();

        let first = source.feed("p1", StreamKind::Screen);
        let (on_event, on_end) = journal.callbacks("a");
        manager.subscribe("p1", StreamKind::Screen, on_event, on_end);
        settle().await;
        first.send(frame("one")).unwrap();
        settle().await;

        let second = source.feed("p1", StreamKind::Screen);
        let (on_event, on_end) = journal.callbacks("b");
        manager.subscribe("p1", StreamKind::Screen, on_event, on_end);
        assert_eq!(journal.lines(), vec!["a:screen:one", "a:end:cancelled"]);

        let _ = first.send(frame("late"));
        second.send(frame("two")).unwrap();
        settle().await;

        assert_eq!(
            journal.lines(),
            vec!["a:screen:one", "a:end:cancelled", "b:screen:two"]
        );
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_all_drops_buffered_messages() {
        let (source, manager) = manager();
        let journal = Journal::default();

        let screen = source.feed("p1", StreamKind::Screen);
        let issues = source.feed("p1", StreamKind::Issues);
        let other = source.feed("p2", StreamKind::Screen);
        let (on_event, on_end) = journal.callbacks("p1-screen");
        manager.subscribe("p1", StreamKind::Screen, on_event, on_end);
        let (on_event, on_end) = journal.callbacks("p1-issues");
        manager.subscribe("p1", StreamKind::Issues, on_event, on_end);
        let (on_event, on_end) = journal.callbacks("p2-screen");
        manager.subscribe("p2", StreamKind::Screen, on_event, on_end);
        settle().await;

        screen.send(frame("buffered")).unwrap();
        issues.send(Ok(StreamEvent::Issue(None))).unwrap();
        assert_eq!(manager.unsubscribe_all("p1"), 2);
        settle().await;

        let lines = journal.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines.contains(&"p1-screen:end:cancelled".to_string()));
        assert!(lines.contains(&"p1-issues:end:cancelled".to_string()));
        assert!(!manager.is_active("p1", StreamKind::Screen));
        assert!(manager.is_active("p2", StreamKind::Screen));

        other.send(frame("still here")).unwrap();
        settle().await;
        assert_eq!(journal.lines().last().unwrap(), "p2-screen:screen:still here");
    }

    #[tokio::test(start_paused = true)]
    async fn terminations_are_classified() {
        let (source, manager) = manager();
        let journal = Journal::default();

        let completed = source.feed("done", StreamKind::Screen);
        let failed = source.feed("broken", StreamKind::Screen);
        let lost = source.feed("lost", StreamKind::Issues);
        for (subject, kind) in [
            ("done", StreamKind::Screen),
            ("broken", StreamKind::Screen),
            ("lost", StreamKind::Issues),
        ] {
            let (on_event, on_end) = journal.callbacks(subject);
            manager.subscribe(subject, kind, on_event, on_end);
        }
        settle().await;

        drop(completed);
        failed.send(Err(Status::internal("boom"))).unwrap();
        lost.send(Err(Status::unavailable("daemon gone"))).unwrap();
        settle().await;

        let lines = journal.lines();
        assert!(lines.contains(&"done:end:completed".to_string()));
        assert!(lines.contains(&"broken:end:failed".to_string()));
        assert!(lines.contains(&"lost:end:disconnected".to_string()));
        assert!(manager.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refused_open_reports_disconnect() {
        let (source, manager) = manager();
        *source.refuse.lock().unwrap() = Some(Status::unavailable("connection refused"));
        let journal = Journal::default();

        let (on_event, on_end) = journal.callbacks("p1");
        manager.subscribe("p1", StreamKind::RawOutput, on_event, on_end);
        settle().await;

        assert_eq!(journal.lines(), vec!["p1:end:disconnected"]);
        assert!(!manager.is_active("p1", StreamKind::RawOutput));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_returned_token_ends_once() {
        let (source, manager) = manager();
        let journal = Journal::default();
        let feed = source.feed("p1", StreamKind::Screen);

        let (on_event, on_end) = journal.callbacks("p1");
        let token = manager.subscribe("p1", StreamKind::Screen, on_event, on_end);
        settle().await;
        token.cancel();
        let _ = feed.send(frame("after cancel"));
        settle().await;

        assert_eq!(journal.lines(), vec!["p1:end:cancelled"]);
        assert!(!manager.unsubscribe("p1", StreamKind::Screen));
    }

    #[test]
    fn concurrent_subscribers_keep_one_stream_per_key() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let (_source, manager) = manager();

        for round in 0..500 {
            let ends = Arc::new(std::sync::atomic::AtomicUsize::new(0));
            let barrier = Arc::new(std::sync::Barrier::new(2));
            let threads: Vec<_> = (0..2)
                .map(|_| {
                    let manager = manager.clone();
                    let barrier = barrier.clone();
                    let ends = ends.clone();
                    let handle = runtime.handle().clone();
                    std::thread::spawn(move || {
                        let _guard = handle.enter();
                        barrier.wait();
                        manager.subscribe(
                            "p1",
                            StreamKind::Screen,
                            |_| {},
                            move |_| {
                                ends.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            },
                        );
                    })
                })
                .collect();
            for thread in threads {
                thread.join().unwrap();
            }

            let superseded = ends.load(std::sync::atomic::Ordering::SeqCst);
            assert_eq!(superseded, 1, "round {round}: one of two subscribers must be cancelled");
            assert_eq!(manager.len(), 1);
            assert_eq!(manager.unsubscribe_all("p1"), 1);
            assert_eq!(ends.load(std::sync::atomic::Ordering::SeqCst), 2);
        }
    }

    #[test]
    fn status_codes_map_to_end_classes() {
        assert!(matches!(
            StreamEnd::from_status(Status::cancelled("x")),
            StreamEnd::Disconnected(_)
        ));
        assert!(matches!(
            StreamEnd::from_status(Status::permission_denied("x")),
            StreamEnd::Failed(_)
        ));
        assert!(!StreamEnd::Cancelled.is_error());
        assert!(!StreamEnd::Completed.is_error());
    }
}
