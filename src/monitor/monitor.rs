// SPDX-License-Identifier: GPL-2.0-or-later

//! `MonitorManager` owns one `Monitor` per active show: it polls liveness
//! and, on an off->on transition, requests a Recorder. The manager is an
//! actor reached through a request channel, mirroring how other managers in
//! this lineage serialize mutation behind a single task rather than a
//! locked map directly exposed to callers.

use async_trait::async_trait;
use bout::{Bout, BoutFactory};
use common::{ArcLogger, LogEntry, LogLevel, ShowId};
use config::EngineConfig;
use dispatcher::{Dispatcher, Event, HandlerError, MonitorHandler};
use rand::Rng;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, RwLock,
    },
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Starting = 0,
    Pending = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

impl From<u8> for State {
    fn from(v: u8) -> Self {
        match v {
            0 => State::Starting,
            1 => State::Pending,
            2 => State::Running,
            3 => State::Stopping,
            _ => State::Stopped,
        }
    }
}

/// A Monitor state machine: `Starting -> Pending -> Running -> Stopping ->
/// Stopped`. Transitions are guarded by atomic compare-and-swap so `start`
/// and `stop` are idempotent and safe to call concurrently.
pub struct Monitor {
    state: AtomicU8,
    cancel: CancellationToken,
    join: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Monitor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(State::Starting as u8),
            cancel: CancellationToken::new(),
            join: tokio::sync::Mutex::new(None),
        })
    }

    /// Starts the poll loop. A second call on an already-started Monitor is
    /// a no-op: at most one loop ever runs per instance.
    async fn start(
        self: &Arc<Self>,
        bout: Arc<Bout>,
        config: Arc<RwLock<EngineConfig>>,
        logger: ArcLogger,
    ) {
        if self
            .state
            .compare_exchange(
                State::Starting as u8,
                State::Pending as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.state.store(State::Running as u8, Ordering::SeqCst);
            run_poll_loop(&bout, &config, &logger, &this.cancel).await;
            this.state.store(State::Stopped as u8, Ordering::SeqCst);
        });
        *self.join.lock().await = Some(handle);
    }

    /// Requests stop. Calling twice causes one cancellation and never
    /// panics.
    fn stop(&self) {
        let prev = self.state.swap(State::Stopping as u8, Ordering::SeqCst);
        if State::from(prev) != State::Stopped {
            self.cancel.cancel();
        } else {
            // Already stopped: restore, there's nothing to stop.
            self.state.store(State::Stopped as u8, Ordering::SeqCst);
        }
    }

    async fn join(&self) {
        let handle = self.join.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[allow(clippy::unwrap_used)]
async fn run_poll_loop(
    bout: &Bout,
    config: &Arc<RwLock<EngineConfig>>,
    logger: &ArcLogger,
    cancel: &CancellationToken,
) {
    let mut previously_live = false;
    loop {
        // Read fresh every tick so a hot-reloaded `snap_interval_sec` takes
        // effect on the very next sleep, not just at poll-loop startup.
        let snap_interval_sec = config.read().unwrap().snap_interval_sec;
        let sleep = jittered_delay(snap_interval_sec);
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(sleep) => {}
        }

        if let Err(e) = bout.snap().await {
            logger.log(LogEntry::new(
                LogLevel::Trace,
                "monitor",
                Some(bout.id().clone()),
                format!("snap failed: {e}"),
            ));
            continue;
        }

        let (_, live) = bout.stream_url();
        if !previously_live && live {
            bout.add_recorder().await;
        }
        previously_live = live;
    }
}

/// `snap_interval_sec +/- N(0, 3s)`, floored at one second.
fn jittered_delay(snap_interval_sec: u32) -> std::time::Duration {
    let mut rng = rand::rng();
    let jitter_ms: i64 = (rng.random::<f64>() - 0.5) * 2.0 * 3000.0;
    let base_ms = i64::from(snap_interval_sec) * 1000;
    let total_ms = (base_ms + jitter_ms).max(1000);
    #[allow(clippy::cast_sign_loss)]
    std::time::Duration::from_millis(total_ms as u64)
}

#[derive(Debug, Error)]
pub enum NewMonitorManagerError {
    #[error("channel closed")]
    ChannelClosed,
}

enum MonitorManagerRequest {
    AddMonitor {
        show_id: ShowId,
        res: oneshot::Sender<Result<(), HandlerError>>,
    },
    RemoveMonitor {
        show_id: ShowId,
        res: oneshot::Sender<Result<(), HandlerError>>,
    },
    Shutdown {
        res: oneshot::Sender<()>,
    },
}

/// Handle to the `MonitorManager` actor. Implements `MonitorHandler` so it
/// can be registered directly with the `Dispatcher`.
pub struct MonitorManager {
    requests: mpsc::Sender<MonitorManagerRequest>,
}

impl MonitorManager {
    #[must_use]
    pub fn new(
        bout_factory: BoutFactory,
        dispatcher: Arc<Dispatcher>,
        logger: ArcLogger,
        config: Arc<RwLock<EngineConfig>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(run_monitor_manager(
            rx,
            bout_factory,
            dispatcher,
            logger,
            config,
        ));
        Self { requests: tx }
    }

    /// Stops every active Monitor and waits for their loops to exit.
    pub async fn shutdown(&self) {
        let (res, rx) = oneshot::channel();
        if self
            .requests
            .send(MonitorManagerRequest::Shutdown { res })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

#[async_trait]
impl MonitorHandler for MonitorManager {
    async fn add_monitor(&self, show_id: ShowId) -> Result<(), HandlerError> {
        let (res, rx) = oneshot::channel();
        self.requests
            .send(MonitorManagerRequest::AddMonitor {
                show_id: show_id.clone(),
                res,
            })
            .await
            .map_err(|_| HandlerError::NotFound(show_id))?;
        rx.await.unwrap_or(Ok(()))
    }

    async fn remove_monitor(&self, show_id: ShowId) -> Result<(), HandlerError> {
        let (res, rx) = oneshot::channel();
        self.requests
            .send(MonitorManagerRequest::RemoveMonitor {
                show_id: show_id.clone(),
                res,
            })
            .await
            .map_err(|_| HandlerError::NotFound(show_id))?;
        rx.await.unwrap_or(Ok(()))
    }
}

struct MonitorManagerState {
    monitors: HashMap<ShowId, Arc<Monitor>>,
    bout_factory: BoutFactory,
    dispatcher: Arc<Dispatcher>,
    logger: ArcLogger,
    config: Arc<RwLock<EngineConfig>>,
}

async fn run_monitor_manager(
    mut requests: mpsc::Receiver<MonitorManagerRequest>,
    bout_factory: BoutFactory,
    dispatcher: Arc<Dispatcher>,
    logger: ArcLogger,
    config: Arc<RwLock<EngineConfig>>,
) {
    let mut state = MonitorManagerState {
        monitors: HashMap::new(),
        bout_factory,
        dispatcher,
        logger,
        config,
    };

    while let Some(req) = requests.recv().await {
        match req {
            MonitorManagerRequest::AddMonitor { show_id, res } => {
                let result = add_monitor(&mut state, show_id).await;
                let _ = res.send(result);
            }
            MonitorManagerRequest::RemoveMonitor { show_id, res } => {
                let result = remove_monitor(&mut state, &show_id);
                let _ = res.send(result);
            }
            MonitorManagerRequest::Shutdown { res } => {
                let monitors: Vec<Arc<Monitor>> = state.monitors.drain().map(|(_, m)| m).collect();
                for monitor in &monitors {
                    monitor.stop();
                }
                for monitor in &monitors {
                    monitor.join().await;
                }
                let _ = res.send(());
                return;
            }
        }
    }
}

async fn add_monitor(
    state: &mut MonitorManagerState,
    show_id: ShowId,
) -> Result<(), HandlerError> {
    // First tear down any Recorder for this show (idempotent) so the
    // alternation invariant holds even if a caller races AddMonitor with a
    // still-running Recorder.
    let _ = state
        .dispatcher
        .dispatch(Event::RemoveRecorder(show_id.clone()))
        .await;

    if state.monitors.contains_key(&show_id) {
        return Err(HandlerError::AlreadyExists(show_id));
    }

    let bout = Arc::new(state.bout_factory.make(show_id.clone()));
    let monitor = Monitor::new();
    monitor
        .start(bout, state.config.clone(), state.logger.clone())
        .await;
    state.monitors.insert(show_id, monitor);
    Ok(())
}

fn remove_monitor(state: &mut MonitorManagerState, show_id: &ShowId) -> Result<(), HandlerError> {
    let Some(monitor) = state.monitors.remove(show_id) else {
        return Err(HandlerError::NotFound(show_id.clone()));
    };
    // Stopping is async-initiated; shutdown() is what waits for `join()`.
    monitor.stop();
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use common::DummyLogger;
    use registry::ShowRegistry;
    use site::{ScriptedSiteDriver, StreamSnapshot};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn test_registry_and_factory() -> (
        Arc<ShowRegistry>,
        BoutFactory,
        Arc<Dispatcher>,
        Arc<RwLock<config::EngineConfig>>,
    ) {
        let registry = Arc::new(ShowRegistry::new());
        let config = Arc::new(RwLock::new(config::EngineConfig::default()));
        let dispatcher = Arc::new(Dispatcher::new(DummyLogger::new()));
        let site_factory: bout::SiteDriverFactory = Arc::new(|_| {
            Box::new(ScriptedSiteDriver::new(
                "fake",
                vec![StreamSnapshot::default()],
            ))
        });
        let factory = BoutFactory::new(
            registry.clone(),
            config.clone(),
            dispatcher.clone(),
            site_factory,
        );
        (registry, factory, dispatcher, config)
    }

    fn spec(id: &str) -> registry::ShowSpec {
        let now = chrono::Utc::now();
        registry::ShowSpec {
            id: id.parse().unwrap(),
            platform: "douyin".to_owned(),
            room_id: "r".to_owned(),
            enabled: true,
            streamer_name: "s".to_owned(),
            output_template: String::new(),
            save_dir: String::new(),
            parser: "flv".to_owned(),
            post_actions: vec![],
            split_rule: registry::SplitRule::default(),
            date_created: now,
            date_updated: now,
        }
    }

    #[tokio::test]
    async fn add_monitor_twice_is_idempotent() {
        let (registry, factory, dispatcher, config) = test_registry_and_factory();
        registry.set(spec("a"));
        let logger = DummyLogger::new();
        let manager = Arc::new(MonitorManager::new(factory, dispatcher, logger, config));

        manager.add_monitor("a".parse().unwrap()).await.unwrap();
        let err = manager
            .add_monitor("a".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::AlreadyExists(_)));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn remove_unknown_monitor_errors() {
        let (_registry, factory, dispatcher, config) = test_registry_and_factory();
        let manager = MonitorManager::new(factory, dispatcher, DummyLogger::new(), config);
        let err = manager
            .remove_monitor("missing".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::NotFound(_)));
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        for _ in 0..20 {
            let d = jittered_delay(15);
            assert!(d.as_millis() >= 1000);
            assert!(d.as_millis() <= 18_000);
        }
    }

    #[tokio::test]
    async fn monitor_stop_twice_does_not_panic() {
        let monitor = Monitor::new();
        let registry = Arc::new(ShowRegistry::new());
        registry.set(spec("a"));
        let (_, factory, _dispatcher, config) = {
            let config = Arc::new(RwLock::new(config::EngineConfig::default()));
            let dispatcher = Arc::new(Dispatcher::new(DummyLogger::new()));
            let site_factory: bout::SiteDriverFactory =
                Arc::new(|_| Box::new(ScriptedSiteDriver::new("fake", vec![StreamSnapshot::default()])));
            (
                registry.clone(),
                BoutFactory::new(
                    registry.clone(),
                    config.clone(),
                    dispatcher.clone(),
                    site_factory,
                ),
                dispatcher,
                config,
            )
        };
        let bout = Arc::new(factory.make("a".parse().unwrap()));
        monitor.start(bout, config, DummyLogger::new()).await;
        monitor.stop();
        monitor.stop();
        monitor.join().await;
    }

    #[tokio::test]
    async fn off_to_on_transition_emits_add_recorder() {
        let registry = Arc::new(ShowRegistry::new());
        registry.set(spec("a"));
        let config = Arc::new(RwLock::new(config::EngineConfig {
            snap_interval_sec: 1,
            ..config::EngineConfig::default()
        }));
        let dispatcher = Arc::new(Dispatcher::new(DummyLogger::new()));

        struct CountingRecorderHandler {
            adds: Arc<AtomicUsize>,
        }
        #[async_trait]
        impl dispatcher::RecorderHandler for CountingRecorderHandler {
            async fn add_recorder(&self, _show_id: ShowId) -> Result<(), HandlerError> {
                self.adds.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }
            async fn remove_recorder(&self, _show_id: ShowId) -> Result<(), HandlerError> {
                Ok(())
            }
        }
        let adds = Arc::new(AtomicUsize::new(0));
        dispatcher.register_recorder_handler(Arc::new(CountingRecorderHandler { adds: adds.clone() }));

        let site_factory: bout::SiteDriverFactory = Arc::new(|_| {
            Box::new(ScriptedSiteDriver::new(
                "fake",
                vec![
                    StreamSnapshot {
                        live: false,
                        ..Default::default()
                    },
                    StreamSnapshot {
                        live: true,
                        stream_url: Some("u".to_owned()),
                        ..Default::default()
                    },
                ],
            ))
        });
        let factory = BoutFactory::new(registry, config.clone(), dispatcher.clone(), site_factory);
        let bout = Arc::new(factory.make("a".parse().unwrap()));
        let monitor = Monitor::new();
        monitor.start(bout, config, DummyLogger::new()).await;

        tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
        monitor.stop();
        monitor.join().await;

        assert!(adds.load(AtomicOrdering::SeqCst) >= 1);
    }
}
