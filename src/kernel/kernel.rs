// SPDX-License-Identifier: GPL-2.0-or-later

//! Composition root. Wires `ShowRegistry`, `Dispatcher`, `MonitorManager`,
//! `RecorderManager` and `UploaderPool` together, applies hot updates coming
//! from the out-of-scope admin/config collaborator, and orchestrates
//! graceful shutdown in the order the concurrency model requires: Recorders,
//! then Monitors, then the UploaderPool, so no new work can enter a stage
//! that has already stopped accepting it.

use bout::BoutFactory;
use common::{ArcLogger, LogEntry, LogLevel, ShowId};
use config::EngineConfig;
use dispatcher::Dispatcher;
use monitor::MonitorManager;
use parser::ParserRegistry;
use recorder::RecorderManager;
use registry::ShowRegistry;
use site::SiteDriver;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uploader::{UploadClient, UploaderPool};

pub use bout::SiteDriverFactory;
pub use log::Logger;

/// Builds the engine's own broadcast-based `Logger` (crate `log`) as an
/// `ArcLogger`, for embedders that want the real logger rather than
/// supplying their own `ILogger` impl.
#[must_use]
pub fn default_logger() -> ArcLogger {
    Arc::new(Logger::default())
}

/// Thin aggregate of the per-subsystem errors: the Kernel is a composition
/// root whose own operations mostly delegate, so unlike the other crates'
/// error enums it carries no distinct variants of its own.
#[derive(Debug, Error)]
pub enum Error {
    #[error("parse core_config: {0}")]
    ParseConfig(#[from] config::ParseCoreConfigError),

    #[error("unrecognized config key: '{0}'")]
    UnknownConfigKey(String),
}

/// Everything the Kernel needs to construct its Managers, supplied by the
/// embedding process at startup. `SiteDriver`s, `Parser`s and the
/// `UploadClient` are external collaborators (see §6 of the design): the
/// engine only knows their trait contracts.
pub struct KernelDeps {
    pub logger: ArcLogger,
    pub site_factory: SiteDriverFactory,
    pub parser_registry: ParserRegistry,
    pub upload_client: Arc<dyn UploadClient>,
}

/// Composition root and lifecycle controller.
pub struct Kernel {
    registry: Arc<ShowRegistry>,
    config: Arc<RwLock<EngineConfig>>,
    dispatcher: Arc<Dispatcher>,
    bout_factory: BoutFactory,
    monitor_manager: Arc<MonitorManager>,
    recorder_manager: Arc<RecorderManager>,
    uploader: Arc<UploaderPool>,
    logger: ArcLogger,
    supervisor_cancel: CancellationToken,
    supervisors: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Kernel {
    /// Builds every Manager and registers them with a fresh `Dispatcher`.
    /// Does not start anything yet — call `run()` for that.
    #[must_use]
    pub fn new(config: EngineConfig, deps: KernelDeps) -> Self {
        let KernelDeps {
            logger,
            site_factory,
            parser_registry,
            upload_client,
        } = deps;

        let registry = Arc::new(ShowRegistry::new());
        let config = Arc::new(RwLock::new(config));
        let dispatcher = Arc::new(Dispatcher::new(logger.clone()));
        let bout_factory = BoutFactory::new(
            registry.clone(),
            config.clone(),
            dispatcher.clone(),
            site_factory,
        );

        let uploader = Arc::new(UploaderPool::new(logger.clone(), upload_client));

        let monitor_manager = Arc::new(MonitorManager::new(
            bout_factory.clone(),
            dispatcher.clone(),
            logger.clone(),
            config.clone(),
        ));
        let recorder_manager = Arc::new(RecorderManager::new(
            bout_factory.clone(),
            Arc::new(parser_registry),
            uploader.clone(),
            logger.clone(),
        ));

        dispatcher.register_monitor_handler(monitor_manager.clone());
        dispatcher.register_recorder_handler(recorder_manager.clone());

        Self {
            registry,
            config,
            dispatcher,
            bout_factory,
            monitor_manager,
            recorder_manager,
            uploader,
            logger,
            supervisor_cancel: CancellationToken::new(),
            supervisors: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Loads `specs` into the registry (applying defaults) and, for every
    /// enabled one, emits `AddMonitor`. Starts the Splitter, StallDetector,
    /// UploaderPool and its concurrency scaler. Runs the UploaderPool
    /// prerun first if uploads are enabled.
    #[allow(clippy::unwrap_used)]
    pub async fn run(&self, specs: Vec<registry::ShowSpec>) {
        let (default_save_dir, default_out_template, uploader_concurrency, upload_enabled, upload_cookie_file, upload_threads) = {
            let cfg = self.config.read().unwrap();
            (
                cfg.default_save_dir.clone(),
                cfg.default_out_template.clone(),
                cfg.uploader_concurrency,
                cfg.upload_enabled,
                cfg.upload_cookie_file.clone(),
                cfg.upload_threads,
            )
        };

        for mut spec in specs {
            spec.apply_defaults(&default_save_dir, &default_out_template);
            let enabled = spec.enabled;
            let id = spec.id.clone();
            self.registry.set(spec);
            if enabled {
                let bout = self.bout_factory.make(id);
                bout.add_monitor().await;
            }
        }

        if upload_enabled {
            self.uploader
                .prerun(&default_save_dir, &upload_cookie_file, upload_threads)
                .await;
        }
        self.uploader.run(uploader_concurrency).await;

        let mut supervisors = self.supervisors.lock().await;
        supervisors.push(tokio::spawn(recorder::run_splitter(
            self.recorder_manager.clone(),
            self.config.clone(),
            self.supervisor_cancel.clone(),
        )));
        supervisors.push(tokio::spawn(recorder::run_stall_detector(
            self.recorder_manager.clone(),
            self.config.clone(),
            self.supervisor_cancel.clone(),
        )));
        supervisors.push(tokio::spawn(run_uploader_scaler(
            self.uploader.clone(),
            self.config.clone(),
            self.supervisor_cancel.clone(),
        )));
    }

    /// For each spec: if enabled, insert-or-replace and emit `AddMonitor`
    /// only when it wasn't already present; if disabled, emit
    /// `RemoveMonitor` + `RemoveRecorder` then delete from the registry.
    /// Each id is handled independently — one's failure never blocks or
    /// rolls back another's (open question resolved in design notes).
    #[allow(clippy::unwrap_used)]
    pub async fn upsert_show(&self, specs: Vec<registry::ShowSpec>) {
        let (default_save_dir, default_out_template) = {
            let cfg = self.config.read().unwrap();
            (cfg.default_save_dir.clone(), cfg.default_out_template.clone())
        };

        for mut spec in specs {
            spec.apply_defaults(&default_save_dir, &default_out_template);
            if spec.enabled {
                self.update_show(spec).await;
            } else {
                self.delete_show(&spec.id).await;
            }
        }
    }

    async fn update_show(&self, spec: registry::ShowSpec) {
        let id = spec.id.clone();
        let already_present = self.registry.get(&id).is_some();
        self.registry.set(spec);
        if !already_present {
            let bout = self.bout_factory.make(id);
            bout.add_monitor().await;
        }
    }

    async fn delete_show(&self, id: &ShowId) {
        let bout = self.bout_factory.make(id.clone());
        bout.remove_monitor().await;
        bout.remove_recorder().await;
        self.registry.delete(id);
    }

    /// Recognizes a single config key, `core_config`: JSON-decodes `value`
    /// into an `EngineConfig` and replaces the process config in place so
    /// readers see a consistent new value on their next access.
    pub fn update_config(&self, key: &str, value: &str) -> Result<(), Error> {
        if key != config::CORE_CONFIG_KEY {
            return Err(Error::UnknownConfigKey(key.to_owned()));
        }
        let new_config = config::parse_core_config(value)?;
        #[allow(clippy::unwrap_used)]
        {
            *self.config.write().unwrap() = new_config;
        }
        self.logger.log(LogEntry::new(
            LogLevel::Info,
            "kernel",
            None,
            "config reloaded".to_owned(),
        ));
        Ok(())
    }

    /// Stops RecorderManager, then MonitorManager, then UploaderPool, in
    /// that order so no new work enters a stage that already stopped
    /// accepting it. Each stop waits for its children to finish.
    pub async fn shutdown(&self) {
        self.supervisor_cancel.cancel();

        self.recorder_manager.shutdown().await;
        self.monitor_manager.shutdown().await;
        self.uploader.stop().await;

        let mut supervisors = self.supervisors.lock().await;
        for handle in supervisors.drain(..) {
            let _ = handle.await;
        }

        self.logger.log(LogEntry::new(
            LogLevel::Info,
            "kernel",
            None,
            "shutdown complete".to_owned(),
        ));
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ShowRegistry> {
        &self.registry
    }

    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn config_snapshot(&self) -> EngineConfig {
        self.config.read().unwrap().clone()
    }
}

/// How often `run_uploader_scaler` re-reads `uploader_concurrency`.
const UPLOADER_SCALE_CHECK_SEC: u64 = 5;

/// Watches `config.uploader_concurrency` and grows the pool to match a
/// raised value. `UploaderPool` has no mechanism to retire a worker
/// mid-queue, so a lowered value is not applied to already-spawned
/// workers — only growth is hot-reloadable.
#[allow(clippy::unwrap_used)]
async fn run_uploader_scaler(
    uploader: Arc<UploaderPool>,
    config: Arc<RwLock<EngineConfig>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(std::time::Duration::from_secs(UPLOADER_SCALE_CHECK_SEC)) => {}
        }
        let target = config.read().unwrap().uploader_concurrency;
        uploader.scale_to(target).await;
    }
}

/// Convenience constructor for a single `SiteDriver` used for every
/// platform, handy for embedders that only target one site or for tests.
#[must_use]
pub fn single_site_factory<F, D>(build: F) -> SiteDriverFactory
where
    F: Fn(&str) -> D + Send + Sync + 'static,
    D: SiteDriver + 'static,
{
    Arc::new(move |platform: &str| Box::new(build(platform)) as Box<dyn SiteDriver>)
}
