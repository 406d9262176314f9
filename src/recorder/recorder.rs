// SPDX-License-Identifier: GPL-2.0-or-later

//! Recorder captures one show's stream to disk and hands the finished file
//! to the uploader. `RecorderManager` owns one Recorder per show currently
//! being captured and runs the Splitter/StallDetector supervisors over its
//! table.
//!
//! Recorder's own state machine mirrors Monitor's, but the manager around it
//! is a plain read-write-locked map rather than a mailbox actor: handler
//! bodies never hold the lock across an await (`remove_recorder` releases it
//! before calling `stop()`), so a lock-free mailbox buys nothing here.

use async_trait::async_trait;
use bout::Bout;
use common::{ArcLogger, LogEntry, LogLevel, ShowId};
use config::EngineConfig;
use dispatcher::{HandlerError, RecorderHandler};
use parser::{Parser, ParserRegistry};
use std::{
    collections::HashMap,
    path::Path,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex, RwLock,
    },
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uploader::{TaskGroup, UploaderPool};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Starting = 0,
    Pending = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

/// A recording session: `Starting -> Pending -> Running -> Stopping ->
/// Stopped`, exactly one `record()` call per instance (see design note on
/// rotation via `restart_recorder` instead of an internal loop).
pub struct Recorder {
    state: AtomicU8,
    cancel: CancellationToken,
    parser: Mutex<Option<Arc<dyn Parser>>>,
    started_at: Mutex<Option<Instant>>,
    output_path: Mutex<Option<String>>,
    join: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("parser: {0}")]
    Parser(#[from] parser::ParserRegistryError),

    #[error("no stream url after retries")]
    NoStreamUrl,

    #[error("resolve output path: {0}")]
    Resolve(#[from] bout::ResolveOutputPathError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

const SNAP_RETRIES: u32 = 3;
const SNAP_RETRY_DELAY: Duration = Duration::from_secs(5);
const SMALL_FILE_THRESHOLD: u64 = 1_000_000;

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(State::Starting as u8),
            cancel: CancellationToken::new(),
            parser: Mutex::new(None),
            started_at: Mutex::new(None),
            output_path: Mutex::new(None),
            join: tokio::sync::Mutex::new(None),
        })
    }

    async fn start(
        self: &Arc<Self>,
        bout: Arc<Bout>,
        parser_registry: Arc<ParserRegistry>,
        uploader: Arc<UploaderPool>,
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
            run_session(&this, &bout, &parser_registry, &uploader, &logger).await;
            this.state.store(State::Stopped as u8, Ordering::SeqCst);
        });
        *self.join.lock().await = Some(handle);
    }

    #[allow(clippy::unwrap_used)]
    fn stop(&self) {
        let prev = self.state.swap(State::Stopping as u8, Ordering::SeqCst);
        if prev == State::Stopped as u8 {
            self.state.store(State::Stopped as u8, Ordering::SeqCst);
            return;
        }
        self.cancel.cancel();
        if let Some(parser) = self.parser.lock().unwrap().as_ref() {
            parser.stop();
        }
    }

    async fn join(&self) {
        let handle = self.join.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    #[allow(clippy::unwrap_used)]
    fn set_session(&self, started_at: Instant, output_path: String) {
        *self.started_at.lock().unwrap() = Some(started_at);
        *self.output_path.lock().unwrap() = Some(output_path);
    }

    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn output_path(&self) -> Option<String> {
        self.output_path.lock().unwrap().clone()
    }

    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn started_at(&self) -> Option<Instant> {
        *self.started_at.lock().unwrap()
    }
}

async fn run_session(
    recorder: &Arc<Recorder>,
    bout: &Arc<Bout>,
    parser_registry: &Arc<ParserRegistry>,
    uploader: &Arc<UploaderPool>,
    logger: &ArcLogger,
) {
    bout.remove_monitor().await;

    if let Err(e) = record(recorder, bout, parser_registry, uploader, logger).await {
        logger.log(LogEntry::new(
            LogLevel::Error,
            "recorder",
            Some(bout.id().clone()),
            format!("record failed: {e}"),
        ));
    }

    if !recorder.cancel.is_cancelled() {
        bout.add_monitor().await;
    }
}

#[allow(clippy::unwrap_used)]
async fn record(
    recorder: &Arc<Recorder>,
    bout: &Arc<Bout>,
    parser_registry: &Arc<ParserRegistry>,
    uploader: &Arc<UploaderPool>,
    logger: &ArcLogger,
) -> Result<(), RecordError> {
    let tag = bout.parser_tag().unwrap_or_default();
    let new_parser: Arc<dyn Parser> = Arc::from(parser_registry.build(&tag)?);

    let mut stream_url = None;
    for attempt in 0..SNAP_RETRIES {
        if bout.snap().await.is_ok() {
            let (url, live) = bout.stream_url();
            if live {
                if let Some(url) = url {
                    stream_url = Some(url);
                    break;
                }
            }
        }
        logger.log(LogEntry::new(
            LogLevel::Warning,
            "recorder",
            Some(bout.id().clone()),
            format!("snap attempt {} did not yield a stream url", attempt + 1),
        ));
        if attempt + 1 < SNAP_RETRIES {
            tokio::time::sleep(SNAP_RETRY_DELAY).await;
        }
    }
    let stream_url = stream_url.ok_or(RecordError::NoStreamUrl)?;

    let output_path = bout.resolve_output_path(chrono::Utc::now())?;
    if let Some(parent) = Path::new(&output_path).parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    recorder.set_session(Instant::now(), output_path.clone());
    *recorder.parser.lock().unwrap() = Some(new_parser);
    let parser_handle = recorder.parser.lock().unwrap().clone();
    let Some(parser_handle) = parser_handle else {
        return Ok(());
    };

    if let Err(e) = parser_handle.parse(&stream_url, Path::new(&output_path)).await {
        logger.log(LogEntry::new(
            LogLevel::Warning,
            "recorder",
            Some(bout.id().clone()),
            format!("parser ended: {e}"),
        ));
    }

    finalize(bout, uploader, logger, &output_path).await;
    Ok(())
}

async fn finalize(bout: &Bout, uploader: &UploaderPool, logger: &ArcLogger, output_path: &str) {
    let meta = match tokio::fs::metadata(output_path).await {
        Ok(meta) => meta,
        Err(e) => {
            logger.log(LogEntry::new(
                LogLevel::Error,
                "recorder",
                Some(bout.id().clone()),
                format!("stat '{output_path}' failed: {e}"),
            ));
            return;
        }
    };

    if meta.len() < SMALL_FILE_THRESHOLD {
        if let Err(e) = tokio::fs::remove_file(output_path).await {
            logger.log(LogEntry::new(
                LogLevel::Error,
                "recorder",
                Some(bout.id().clone()),
                format!("remove small file '{output_path}' failed: {e}"),
            ));
        }
        return;
    }

    uploader.submit(vec![TaskGroup {
        filepath: output_path.to_owned(),
        actions: bout.post_actions(),
    }]);
}

struct RecorderEntry {
    bout: Arc<Bout>,
    recorder: Arc<Recorder>,
}

/// Owns one Recorder per show currently being captured.
pub struct RecorderManager {
    recorders: RwLock<HashMap<ShowId, RecorderEntry>>,
    bout_factory: bout::BoutFactory,
    parser_registry: Arc<ParserRegistry>,
    uploader: Arc<UploaderPool>,
    logger: ArcLogger,
}

impl RecorderManager {
    #[must_use]
    pub fn new(
        bout_factory: bout::BoutFactory,
        parser_registry: Arc<ParserRegistry>,
        uploader: Arc<UploaderPool>,
        logger: ArcLogger,
    ) -> Self {
        Self {
            recorders: RwLock::new(HashMap::new()),
            bout_factory,
            parser_registry,
            uploader,
            logger,
        }
    }

    #[must_use]
    pub fn logger(&self) -> ArcLogger {
        self.logger.clone()
    }

    #[allow(clippy::unwrap_used)]
    fn snapshot(&self) -> Vec<(Arc<Bout>, Arc<Recorder>)> {
        self.recorders
            .read()
            .unwrap()
            .values()
            .map(|e| (e.bout.clone(), e.recorder.clone()))
            .collect()
    }

    /// Stops every active Recorder and waits for its session to finish.
    #[allow(clippy::unwrap_used)]
    pub async fn shutdown(&self) {
        let entries: Vec<RecorderEntry> = self.recorders.write().unwrap().drain().map(|(_, e)| e).collect();
        for entry in &entries {
            entry.recorder.stop();
        }
        for entry in &entries {
            entry.recorder.join().await;
        }
    }
}

#[async_trait]
impl RecorderHandler for RecorderManager {
    #[allow(clippy::unwrap_used)]
    async fn add_recorder(&self, show_id: ShowId) -> Result<(), HandlerError> {
        if self.recorders.read().unwrap().contains_key(&show_id) {
            return Err(HandlerError::AlreadyExists(show_id));
        }

        let bout = Arc::new(self.bout_factory.make(show_id.clone()));
        let recorder = Recorder::new();
        recorder
            .start(
                bout.clone(),
                self.parser_registry.clone(),
                self.uploader.clone(),
                self.logger.clone(),
            )
            .await;

        let mut recorders = self.recorders.write().unwrap();
        if recorders.contains_key(&show_id) {
            recorder.stop();
            return Err(HandlerError::AlreadyExists(show_id));
        }
        recorders.insert(show_id, RecorderEntry { bout, recorder });
        Ok(())
    }

    #[allow(clippy::unwrap_used)]
    async fn remove_recorder(&self, show_id: ShowId) -> Result<(), HandlerError> {
        let entry = self.recorders.write().unwrap().remove(&show_id);
        let Some(entry) = entry else {
            return Err(HandlerError::NotFound(show_id));
        };
        // Stop is non-blocking; the lock above is already released.
        entry.recorder.stop();
        Ok(())
    }
}

/// Ticks every `split_check_sec` (re-read from `config` each iteration, so a
/// hot reload takes effect on the next wait rather than at task startup);
/// restarts any recorder whose `SplitRule` is satisfied by its elapsed time
/// or current output size.
#[allow(clippy::unwrap_used)]
pub async fn run_splitter(
    manager: Arc<RecorderManager>,
    config: Arc<RwLock<EngineConfig>>,
    cancel: CancellationToken,
) {
    loop {
        let interval_sec = config.read().unwrap().split_check_sec;
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(Duration::from_secs(u64::from(interval_sec.max(1)))) => {}
        }

        for (bout, recorder) in manager.snapshot() {
            let (Some(started_at), Some(output_path)) = (recorder.started_at(), recorder.output_path()) else {
                continue;
            };
            let elapsed_sec = started_at.elapsed().as_secs();
            let size = tokio::fs::metadata(&output_path).await.map(|m| m.len()).unwrap_or(0);
            if bout.split_satisfied(elapsed_sec, size) {
                manager.logger.log(LogEntry::new(
                    LogLevel::Info,
                    "recorder",
                    Some(bout.id().clone()),
                    "restart by split rule".to_owned(),
                ));
                bout.restart_recorder().await;
            }
        }
    }
}

/// Hand-rolled TTL cache of `output_path -> (last_size, inserted_at)`. No
/// external cache crate is needed for a map this small and short-lived.
struct StallCache {
    entries: HashMap<String, (u64, Instant)>,
}

impl StallCache {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    fn purge_expired(&mut self, ttl: Duration) {
        let now = Instant::now();
        self.entries
            .retain(|_, (_, inserted)| now.duration_since(*inserted) < ttl);
    }

    /// Returns true iff the current size is unchanged (or smaller) than the
    /// last observation. Always refreshes the entry. A missing entry (first
    /// observation) is never stalled.
    fn observe(&mut self, key: &str, current_size: u64) -> bool {
        let stalled = self
            .entries
            .get(key)
            .is_some_and(|(prev_size, _)| current_size <= *prev_size);
        self.entries.insert(key.to_owned(), (current_size, Instant::now()));
        stalled
    }
}

/// Ticks every `stall_check_sec` (re-read from `config` each iteration);
/// restarts any recorder whose output size has not grown since the previous
/// tick.
#[allow(clippy::unwrap_used)]
pub async fn run_stall_detector(
    manager: Arc<RecorderManager>,
    config: Arc<RwLock<EngineConfig>>,
    cancel: CancellationToken,
) {
    let mut cache = StallCache::new();
    loop {
        let interval_sec = config.read().unwrap().stall_check_sec;
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(Duration::from_secs(u64::from(interval_sec.max(1)))) => {}
        }

        cache.purge_expired(Duration::from_secs(u64::from(interval_sec.max(1)) + 1));
        for (bout, recorder) in manager.snapshot() {
            let Some(output_path) = recorder.output_path() else {
                continue;
            };
            let Ok(meta) = tokio::fs::metadata(&output_path).await else {
                continue;
            };
            if cache.observe(&output_path, meta.len()) {
                manager.logger.log(LogEntry::new(
                    LogLevel::Info,
                    "recorder",
                    Some(bout.id().clone()),
                    "restart by stall detector".to_owned(),
                ));
                bout.restart_recorder().await;
            }
        }
    }
}
