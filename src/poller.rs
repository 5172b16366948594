// Client-side reconciliation against a running console
//
// The poller owns two kinds of loops: one slow device-list refresh, and one
// fast status refresh per watched session. Every loop is a `SupervisedTask`,
// so dropping the poller (or unwatching a session) stops it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::{Device, FlashSession, FlashState};
use crate::task::{SupervisedTask, lock};

/// Query surface the poller needs from the console.
pub trait ConsoleApi: Send + Sync + 'static {
    fn list_devices(&self) -> BoxFuture<'_, Result<Vec<Device>>>;

    /// `None` when the device has no session.
    fn flash_status<'a>(&'a self, device_id: &'a str) -> BoxFuture<'a, Result<Option<FlashSession>>>;
}

#[derive(Debug, Clone, Copy)]
pub struct PollerSettings {
    pub device_interval: Duration,
    pub session_interval: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            device_interval: Duration::from_secs(5),
            session_interval: Duration::from_secs(2),
        }
    }
}

/// Local picture of the console, as of the last successful polls.
#[derive(Debug, Clone, Default)]
pub struct ConsoleView {
    pub devices: Vec<Device>,
    pub sessions: BTreeMap<String, FlashSession>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollerEvent {
    DevicesUpdated(Vec<Device>),
    SessionUpdated(FlashSession),
    /// The session reached `completed` or `error`; its loop has stopped.
    SessionFinished(FlashSession),
    /// The session no longer exists on the server.
    SessionGone(String),
    PollFailed(String),
}

struct Shared<A> {
    api: A,
    view: Mutex<ConsoleView>,
    events: mpsc::UnboundedSender<PollerEvent>,
}

impl<A: ConsoleApi> Shared<A> {
    fn emit(&self, event: PollerEvent) {
        self.events.send(event).ok();
    }

    fn record_failure(&self, what: &str, error: String) {
        warn!("{} failed: {}", what, error);
        lock(&self.view).last_error = Some(error.clone());
        self.emit(PollerEvent::PollFailed(error));
    }

    async fn refresh_devices(&self) {
        match self.api.list_devices().await {
            Ok(devices) => {
                {
                    let mut view = lock(&self.view);
                    view.devices = devices.clone();
                    view.last_error = None;
                }
                self.emit(PollerEvent::DevicesUpdated(devices));
            }
            Err(e) => self.record_failure("Device refresh", e.to_string()),
        }
    }

    /// Returns whether the session is still worth polling.
    async fn poll_session(&self, device_id: &str) -> bool {
        let session = match self.api.flash_status(device_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                lock(&self.view).sessions.remove(device_id);
                info!("Session for {} disappeared", device_id);
                self.emit(PollerEvent::SessionGone(device_id.to_string()));
                return false;
            }
            Err(e) => {
                self.record_failure("Session refresh", e.to_string());
                return true;
            }
        };

        lock(&self.view)
            .sessions
            .insert(device_id.to_string(), session.clone());

        match session.state {
            FlashState::Completed => {
                self.emit(PollerEvent::SessionFinished(session));
                // The device reboots into the new system; pick it up again
                self.refresh_devices().await;
                false
            }
            FlashState::Error => {
                self.emit(PollerEvent::SessionFinished(session));
                false
            }
            _ => {
                self.emit(PollerEvent::SessionUpdated(session));
                true
            }
        }
    }
}

pub struct StatusPoller<A: ConsoleApi> {
    shared: Arc<Shared<A>>,
    settings: PollerSettings,
    device_loop: Option<SupervisedTask>,
    session_loops: HashMap<String, SupervisedTask>,
}

impl<A: ConsoleApi> StatusPoller<A> {
    pub fn new(api: A, settings: PollerSettings) -> (Self, mpsc::UnboundedReceiver<PollerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let poller = Self {
            shared: Arc::new(Shared {
                api,
                view: Mutex::new(ConsoleView::default()),
                events,
            }),
            settings,
            device_loop: None,
            session_loops: HashMap::new(),
        };
        (poller, rx)
    }

    pub fn api(&self) -> &A {
        &self.shared.api
    }

    /// Start the device-list loop. The first refresh happens immediately.
    pub fn start(&mut self) {
        if self.device_loop.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let interval = self.settings.device_interval;
        self.device_loop = Some(SupervisedTask::spawn("device-poll", move |cancel| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => shared.refresh_devices().await,
                }
            }
        }));
    }

    /// Stop every loop.
    pub fn stop(&mut self) {
        self.device_loop = None;
        self.session_loops.clear();
        debug!("Status poller stopped");
    }

    pub async fn refresh_devices(&self) {
        self.shared.refresh_devices().await;
    }

    /// Poll `device_id`'s session until it finishes or is unwatched.
    pub fn watch_session(&mut self, device_id: &str) {
        if self.is_watching(device_id) {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let interval = self.settings.session_interval;
        let id = device_id.to_string();
        let task = SupervisedTask::spawn("session-poll", move |cancel| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if !shared.poll_session(&id).await {
                            break;
                        }
                    }
                }
            }
            debug!("Stopped polling session for {}", id);
        });
        self.session_loops.insert(device_id.to_string(), task);
    }

    pub fn unwatch_session(&mut self, device_id: &str) {
        self.session_loops.remove(device_id);
        lock(&self.shared.view).sessions.remove(device_id);
    }

    pub fn is_watching(&self, device_id: &str) -> bool {
        self.session_loops
            .get(device_id)
            .is_some_and(|task| !task.is_finished())
    }

    pub fn view(&self) -> ConsoleView {
        lock(&self.shared.view).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConsoleError;
    use crate::models::AdbStatus;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeState {
        statuses: Mutex<VecDeque<Result<Option<FlashSession>>>>,
        device_failures: Mutex<bool>,
        status_calls: AtomicUsize,
        device_calls: AtomicUsize,
    }

    #[derive(Clone, Default)]
    struct FakeApi {
        state: Arc<FakeState>,
    }

    impl FakeApi {
        fn script(&self, statuses: Vec<Result<Option<FlashSession>>>) {
            *self.state.statuses.lock().unwrap() = statuses.into();
        }

        fn status_calls(&self) -> usize {
            self.state.status_calls.load(Ordering::SeqCst)
        }

        fn device_calls(&self) -> usize {
            self.state.device_calls.load(Ordering::SeqCst)
        }
    }

    impl ConsoleApi for FakeApi {
        fn list_devices(&self) -> BoxFuture<'_, Result<Vec<Device>>> {
            self.state.device_calls.fetch_add(1, Ordering::SeqCst);
            let fail = *self.state.device_failures.lock().unwrap();
            Box::pin(async move {
                if fail {
                    Err(ConsoleError::Api("connection refused".into()))
                } else {
                    Ok(vec![Device::new("SERIAL1", "Pixel 7", AdbStatus::Authorized)])
                }
            })
        }

        fn flash_status<'a>(&'a self, _device_id: &'a str) -> BoxFuture<'a, Result<Option<FlashSession>>> {
            self.state.status_calls.fetch_add(1, Ordering::SeqCst);
            let next = self
                .state
                .statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(None));
            Box::pin(async move { next })
        }
    }

    fn session(state: FlashState) -> FlashSession {
        let mut session = FlashSession::new("SERIAL1", "lineage.zip");
        session.state = state;
        session
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<PollerEvent>) -> PollerEvent {
        tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("no event")
            .expect("channel closed")
    }

    #[tokio::test(start_paused = true)]
    async fn completed_session_refreshes_devices_once_and_stops() {
        let api = FakeApi::default();
        api.script(vec![
            Ok(Some(session(FlashState::Downloading))),
            Err(ConsoleError::Api("timeout".into())),
            Ok(Some(session(FlashState::Completed))),
        ]);
        let (mut poller, mut rx) = StatusPoller::new(api.clone(), PollerSettings::default());

        poller.watch_session("SERIAL1");
        assert!(matches!(next_event(&mut rx).await, PollerEvent::SessionUpdated(_)));
        assert_eq!(next_event(&mut rx).await, PollerEvent::PollFailed("timeout".into()));
        assert!(poller.view().last_error.is_some());

        match next_event(&mut rx).await {
            PollerEvent::SessionFinished(s) => assert_eq!(s.state, FlashState::Completed),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(next_event(&mut rx).await, PollerEvent::DevicesUpdated(_)));
        assert_eq!(api.device_calls(), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(api.status_calls(), 3);
        assert!(!poller.is_watching("SERIAL1"));

        let view = poller.view();
        assert_eq!(view.sessions["SERIAL1"].state, FlashState::Completed);
        assert_eq!(view.devices.len(), 1);
        assert!(view.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn error_stops_polling_without_retry() {
        let api = FakeApi::default();
        api.script(vec![Ok(Some(session(FlashState::Error)))]);
        let (mut poller, mut rx) = StatusPoller::new(api.clone(), PollerSettings::default());

        poller.watch_session("SERIAL1");
        assert!(matches!(next_event(&mut rx).await, PollerEvent::SessionFinished(_)));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(api.status_calls(), 1);
        assert_eq!(api.device_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_session_stops_its_loop() {
        let api = FakeApi::default();
        let (mut poller, mut rx) = StatusPoller::new(api.clone(), PollerSettings::default());

        poller.watch_session("SERIAL1");
        assert_eq!(next_event(&mut rx).await, PollerEvent::SessionGone("SERIAL1".into()));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(api.status_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn device_loop_swallows_failures_and_keeps_going() {
        let api = FakeApi::default();
        let (mut poller, mut rx) = StatusPoller::new(api.clone(), PollerSettings::default());

        poller.start();
        assert!(matches!(next_event(&mut rx).await, PollerEvent::DevicesUpdated(_)));

        *api.state.device_failures.lock().unwrap() = true;
        assert!(matches!(next_event(&mut rx).await, PollerEvent::PollFailed(_)));
        let view = poller.view();
        assert_eq!(view.devices.len(), 1, "last good listing is kept");
        assert_eq!(view.last_error.as_deref(), Some("connection refused"));

        *api.state.device_failures.lock().unwrap() = false;
        assert!(matches!(next_event(&mut rx).await, PollerEvent::DevicesUpdated(_)));
        assert!(api.device_calls() >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_poller_stops_all_loops() {
        let api = FakeApi::default();
        api.script((0..100).map(|_| Ok(Some(session(FlashState::Flashing)))).collect());
        let (mut poller, mut rx) = StatusPoller::new(api.clone(), PollerSettings::default());

        poller.start();
        poller.watch_session("SERIAL1");
        next_event(&mut rx).await;
        next_event(&mut rx).await;
        drop(poller);

        let (devices, statuses) = (api.device_calls(), api.status_calls());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(api.device_calls(), devices);
        assert_eq!(api.status_calls(), statuses);
    }

    #[tokio::test(start_paused = true)]
    async fn unwatch_forgets_the_session() {
        let api = FakeApi::default();
        api.script((0..100).map(|_| Ok(Some(session(FlashState::Pushing)))).collect());
        let (mut poller, mut rx) = StatusPoller::new(api.clone(), PollerSettings::default());

        poller.watch_session("SERIAL1");
        poller.watch_session("SERIAL1");
        next_event(&mut rx).await;
        assert!(poller.is_watching("SERIAL1"));
        assert_eq!(api.status_calls(), 1);

        poller.unwatch_session("SERIAL1");
        assert!(!poller.is_watching("SERIAL1"));
        assert!(poller.view().sessions.is_empty());
    }
}
