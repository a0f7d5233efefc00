use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use wf_supervisor::{ConnectionDescriptor, DescriptorSource};
use wf_util::CancelToken;

use crate::channel::ControlChannel;
use crate::error::ChannelError;

/// Connection as the presentation layer sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    NeverConnected,
    Connected,
    DisconnectedAfterConnected,
}

/// One attempt at getting a usable control channel.
#[tonic::async_trait]
pub trait Connector: Send + Sync {
    async fn acquire(&self) -> Result<ConnectionDescriptor, ChannelError>;
}

/// Reads the live descriptor, binds the control channel to it and checks
/// the daemon answers.
pub struct DaemonConnector {
    descriptors: Arc<dyn DescriptorSource>,
    channel: Arc<ControlChannel>,
}

impl DaemonConnector {
    pub fn new(descriptors: Arc<dyn DescriptorSource>, channel: Arc<ControlChannel>) -> Self {
        Self {
            descriptors,
            channel,
        }
    }
}

#[tonic::async_trait]
impl Connector for DaemonConnector {
    async fn acquire(&self) -> Result<ConnectionDescriptor, ChannelError> {
        let descriptor = self.descriptors.read().ok_or(ChannelError::NoDaemon)?;
        self.channel.init_from(&descriptor)?;
        self.channel.daemon_client()?.get_status(()).await?;
        Ok(descriptor)
    }
}

type RefreshHook = Box<dyn Fn(&ConnectionDescriptor) + Send + Sync>;

struct Inner {
    connector: Arc<dyn Connector>,
    interval: Duration,
    state: watch::Sender<ConnectionState>,
    disconnected: Notify,
    stopped: AtomicBool,
    stop: CancelToken,
    refresh: Mutex<Option<RefreshHook>>,
}

/// Keeps retrying connection acquisition while the shell is not
/// connected, until `stop` is called.
#[derive(Clone)]
pub struct ReconnectController {
    inner: Arc<Inner>,
}

impl ReconnectController {
    pub fn new(connector: Arc<dyn Connector>, interval: Duration) -> Self {
        let (state, _) = watch::channel(ConnectionState::NeverConnected);
        Self {
            inner: Arc::new(Inner {
                connector,
                interval,
                state,
                disconnected: Notify::new(),
                stopped: AtomicBool::new(false),
                stop: CancelToken::new(),
                refresh: Mutex::new(None),
            }),
        }
    }

    /// Called after every successful acquisition.
    pub fn on_connected(&self, hook: impl Fn(&ConnectionDescriptor) + Send + Sync + 'static) {
        *self
            .inner
            .refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Reports a lost channel. Ignored unless currently connected.
    pub fn mark_disconnected(&self) {
        let changed = self.inner.state.send_if_modified(|state| {
            if *state != ConnectionState::Connected {
                return false;
            }
            *state = ConnectionState::DisconnectedAfterConnected;
            true
        });
        if changed {
            info!("lost connection to daemon");
            self.inner.disconnected.notify_one();
        }
    }

    /// Permanently halts retrying. Safe to call repeatedly and from inside
    /// a connector or hook.
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            debug!("reconnect controller stopped");
        }
        self.inner.stop.cancel();
    }

    pub fn spawn(&self) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move { controller.run().await })
    }

    pub async fn run(&self) {
        loop {
            if self.is_stopped() {
                return;
            }
            if self.state() != ConnectionState::Connected {
                self.attempt().await;
                if self.is_stopped() {
                    return;
                }
                if self.state() != ConnectionState::Connected {
                    tokio::select! {
                        _ = self.inner.stop.cancelled() => return,
                        _ = tokio::time::sleep(self.inner.interval) => {}
                    }
                    continue;
                }
            }
            tokio::select! {
                _ = self.inner.stop.cancelled() => return,
                _ = self.inner.disconnected.notified() => {}
            }
            // A lost connection waits out one interval before the next attempt.
            tokio::select! {
                _ = self.inner.stop.cancelled() => return,
                _ = tokio::time::sleep(self.inner.interval) => {}
            }
        }
    }

    async fn attempt(&self) {
        match self.inner.connector.acquire().await {
            Ok(descriptor) => {
                if self.is_stopped() {
                    return;
                }
                info!("connected to daemon at {}", descriptor.endpoint());
                self.inner.state.send_replace(ConnectionState::Connected);
                if let Some(hook) = self
                    .inner
                    .refresh
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .as_ref()
                {
                    hook(&descriptor);
                }
            }
            Err(err) => debug!("daemon not reachable yet: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Default)]
    struct Script {
        outcomes: Mutex<VecDeque<bool>>,
        attempts: AtomicUsize,
        stop_on_failure: Mutex<Option<ReconnectController>>,
    }

    impl Script {
        fn new(outcomes: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.iter().copied().collect()),
                ..Self::default()
            })
        }

        fn push(&self, outcomes: &[bool]) {
            self.outcomes.lock().unwrap().extend(outcomes.iter().copied());
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[tonic::async_trait]
    impl Connector for Script {
        async fn acquire(&self) -> Result<ConnectionDescriptor, ChannelError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let ok = self.outcomes.lock().unwrap().pop_front().unwrap_or(false);
            if ok {
                return Ok(ConnectionDescriptor::new("localhost", 7000, 42));
            }
            if let Some(controller) = self.stop_on_failure.lock().unwrap().as_ref() {
                controller.stop();
            }
            Err(ChannelError::NoDaemon)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_on_interval_until_first_success() {
        let script = Script::new(&[false, false, true]);
        let controller = ReconnectController::new(script.clone(), Duration::from_secs(3));
        let refreshed = Arc::new(AtomicUsize::new(0));
        {
            let refreshed = refreshed.clone();
            controller.on_connected(move |_| {
                refreshed.fetch_add(1, Ordering::SeqCst);
            });
        }
        let task = controller.spawn();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(controller.state(), ConnectionState::NeverConnected);
        assert_eq!(script.attempts(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(controller.state(), ConnectionState::Connected);
        assert_eq!(script.attempts(), 3);
        assert_eq!(refreshed.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(script.attempts(), 3);

        controller.stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_after_success_never_reports_never_connected() {
        let script = Script::new(&[true]);
        let controller = ReconnectController::new(script.clone(), Duration::from_secs(3));
        let mut states = controller.watch_state();
        let task = controller.spawn();

        states
            .wait_for(|state| *state == ConnectionState::Connected)
            .await
            .unwrap();

        script.push(&[false, true]);
        controller.mark_disconnected();
        assert_eq!(controller.state(), ConnectionState::DisconnectedAfterConnected);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(script.attempts(), 1);
        assert_eq!(controller.state(), ConnectionState::DisconnectedAfterConnected);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(script.attempts(), 2);
        assert_eq!(controller.state(), ConnectionState::DisconnectedAfterConnected);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(script.attempts(), 3);
        assert_eq!(controller.state(), ConnectionState::Connected);

        controller.stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn flapping_connection_retries_on_interval() {
        let script = Script::new(&[true; 64]);
        let controller = ReconnectController::new(script.clone(), Duration::from_secs(3));
        {
            let flapping = controller.clone();
            controller.on_connected(move |_| flapping.mark_disconnected());
        }
        let task = controller.spawn();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(script.attempts(), 1);

        tokio::time::sleep(Duration::from_millis(29_490)).await;
        assert_eq!(script.attempts(), 10);
        assert_eq!(controller.state(), ConnectionState::DisconnectedAfterConnected);

        controller.stop();
        task.await.unwrap();
        controller.on_connected(|_| {});
    }

    #[tokio::test(start_paused = true)]
    async fn mark_disconnected_before_connecting_is_ignored() {
        let script = Script::new(&[]);
        let controller = ReconnectController::new(script, Duration::from_secs(3));
        controller.mark_disconnected();
        assert_eq!(controller.state(), ConnectionState::NeverConnected);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_inside_failed_attempt_schedules_nothing() {
        let script = Script::new(&[]);
        let controller = ReconnectController::new(script.clone(), Duration::from_secs(3));
        *script.stop_on_failure.lock().unwrap() = Some(controller.clone());

        controller.run().await;

        assert!(controller.is_stopped());
        assert_eq!(script.attempts(), 1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(script.attempts(), 1);

        // Break the test-only reference cycle.
        script.stop_on_failure.lock().unwrap().take();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_ends_retry_loop() {
        let script = Script::new(&[]);
        let controller = ReconnectController::new(script.clone(), Duration::from_secs(3));
        let task = controller.spawn();

        tokio::time::sleep(Duration::from_secs(7)).await;
        let attempts = script.attempts();
        assert_eq!(attempts, 3);

        controller.stop();
        controller.stop();
        task.await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(script.attempts(), attempts);
        assert_eq!(controller.state(), ConnectionState::NeverConnected);
    }
}
