// SPDX-License-Identifier: GPL-2.0-or-later

//! Bout: a per-show facade combining `ShowRegistry` lookup and `SiteDriver`,
//! and the only thing in the engine that emits events to the `Dispatcher`.
//!
//! Bout does not own its `ShowSpec` — it re-resolves by id on every access
//! (`refresh`), so a deleted show degrades gracefully instead of panicking.
//! It is cheap to construct: `BoutFactory::make` builds one on demand
//! wherever a `ShowId` needs to act on its show (Monitor, Recorder, the
//! managers' dispatcher-handler bodies).

use chrono::{DateTime, Utc};
use common::ShowId;
use dispatcher::{Dispatcher, Event, HandlerError};
use registry::{PostActionSpec, ShowRegistry, ShowSpec, SplitRule};
use site::{SiteDriver, SiteError, StreamSnapshot};
use std::{
    sync::{Arc, Mutex, RwLock},
};
use template::TemplateContext;
use thiserror::Error;

pub type SiteDriverFactory = Arc<dyn Fn(&str) -> Box<dyn SiteDriver> + Send + Sync>;

#[derive(Debug, Error)]
pub enum ResolveOutputPathError {
    #[error("render template: {0}")]
    Render(#[from] template::TemplateError),

    #[error("show not found")]
    ShowGone,
}

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("dispatch: {0}")]
    Dispatch(#[from] dispatcher::DispatchError),
}

struct BoutState {
    cached_platform_room: Option<(String, String)>,
    driver: Option<Arc<dyn SiteDriver>>,
    spec: Option<ShowSpec>,
    snapshot: StreamSnapshot,
}

/// Per-show runtime object mediating registry, site driver, and dispatcher.
pub struct Bout {
    show_id: ShowId,
    registry: Arc<ShowRegistry>,
    config: Arc<RwLock<config::EngineConfig>>,
    dispatcher: Arc<Dispatcher>,
    site_factory: SiteDriverFactory,
    state: Mutex<BoutState>,
}

impl Bout {
    #[must_use]
    pub fn id(&self) -> &ShowId {
        &self.show_id
    }

    /// Re-reads the spec from the registry; if `(platform, room_id)`
    /// changed, rebuilds the `SiteDriver`. Applies spec defaulting (parser,
    /// `save_dir`, `out_tmpl`). A no-op if the spec has been deleted.
    #[allow(clippy::unwrap_used)]
    pub fn refresh(&self) {
        let Some(mut spec) = self.registry.get(&self.show_id) else {
            // Spec was deleted between calls: keep serving the last cached
            // values rather than erroring.
            return;
        };

        let cfg = self.config.read().unwrap().clone();
        spec.apply_defaults(&cfg.default_save_dir, &cfg.default_out_template);

        let mut state = self.state.lock().unwrap();
        let platform_room = (spec.platform.clone(), spec.room_id.clone());
        if state.cached_platform_room.as_ref() != Some(&platform_room) {
            state.driver = Some(Arc::from((self.site_factory)(&spec.platform)));
            state.cached_platform_room = Some(platform_room);
        }
        state.spec = Some(spec);
    }

    /// Calls `refresh()`, then invokes `SiteDriver::snap(cookie)` with a
    /// platform-derived cookie.
    pub async fn snap(&self) -> Result<(), SiteError> {
        self.refresh();

        #[allow(clippy::unwrap_used)]
        let (room_id, platform, driver) = {
            let state = self.state.lock().unwrap();
            let Some(spec) = &state.spec else {
                return Ok(());
            };
            (spec.room_id.clone(), spec.platform.clone(), state.driver.clone())
        };
        let Some(driver) = driver else {
            return Err(SiteError::UnsupportedPlatform(platform));
        };

        let cookie = {
            #[allow(clippy::unwrap_used)]
            let cfg = self.config.read().unwrap();
            match platform.as_str() {
                "douyin" => cfg.douyin_cookie.clone(),
                "kuaishou" => cfg.kuaishou_cookie.clone(),
                _ => String::new(),
            }
        };

        // Dropped the lock guard above before this await: the driver
        // handle is an owned `Arc` clone, not a borrow through the mutex.
        let snapshot = driver.snap(&room_id, &cookie).await?;

        #[allow(clippy::unwrap_used)]
        {
            self.state.lock().unwrap().snapshot = snapshot;
        }
        Ok(())
    }

    /// `(url, live)` from the latest snapshot.
    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn stream_url(&self) -> (Option<String>, bool) {
        let state = self.state.lock().unwrap();
        (state.snapshot.stream_url.clone(), state.snapshot.live)
    }

    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn room_name(&self) -> Option<String> {
        self.state.lock().unwrap().snapshot.room_name.clone()
    }

    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn streamer_name(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .snapshot
            .streamer_name
            .clone()
            .or_else(|| state.spec.as_ref().map(|s| s.streamer_name.clone()))
    }

    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn site_name(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.driver.as_ref().map(|d| d.name().to_owned())
    }

    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn parser_tag(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .spec
            .as_ref()
            .map(|s| s.parser.clone())
    }

    /// Renders `output_template` against `{StreamerName, RoomName, SiteName,
    /// now}`, sanitizes the result, joins with the (also templated)
    /// `save_dir`, and forces the extension per the show's parser tag.
    #[allow(clippy::unwrap_used)]
    pub fn resolve_output_path(&self, now: DateTime<Utc>) -> Result<String, ResolveOutputPathError> {
        let state = self.state.lock().unwrap();
        let Some(spec) = state.spec.clone() else {
            return Err(ResolveOutputPathError::ShowGone);
        };
        let snapshot = state.snapshot.clone();
        drop(state);

        let ctx = TemplateContext {
            streamer_name: snapshot
                .streamer_name
                .unwrap_or_else(|| spec.streamer_name.clone()),
            room_name: snapshot.room_name.unwrap_or_default(),
            site_name: self.site_name().unwrap_or_default(),
        };

        let filename = template::render(&spec.output_template, ctx.clone(), now)?;
        let filename = template::sanitize_component(&filename);
        let filename = parser::force_extension(&filename, &spec.parser);

        let save_dir = template::render(&spec.save_dir, ctx, now)?;

        Ok(format!("{save_dir}/{filename}"))
    }

    /// Deep copy; actions are never shared across tasks.
    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn post_actions(&self) -> Vec<PostActionSpec> {
        self.state
            .lock()
            .unwrap()
            .spec
            .as_ref()
            .map(|s| s.post_actions.clone())
            .unwrap_or_default()
    }

    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn split_rule(&self) -> SplitRule {
        self.state
            .lock()
            .unwrap()
            .spec
            .as_ref()
            .map(|s| s.split_rule)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn split_satisfied(&self, elapsed_sec: u64, current_size: u64) -> bool {
        self.split_rule().satisfied(elapsed_sec, current_size)
    }

    /// Emits `AddMonitor`. `AlreadyExists` is logged and swallowed: emitters
    /// log and continue, per the engine's error handling design.
    pub async fn add_monitor(&self) {
        self.emit(Event::AddMonitor(self.show_id.clone())).await;
    }

    pub async fn remove_monitor(&self) {
        self.emit(Event::RemoveMonitor(self.show_id.clone())).await;
    }

    pub async fn add_recorder(&self) {
        self.emit(Event::AddRecorder(self.show_id.clone())).await;
    }

    pub async fn remove_recorder(&self) {
        self.emit(Event::RemoveRecorder(self.show_id.clone())).await;
    }

    /// `remove_recorder` followed synchronously by `add_recorder`.
    pub async fn restart_recorder(&self) {
        self.remove_recorder().await;
        self.add_recorder().await;
    }

    async fn emit(&self, event: Event) {
        if let Err(e) = self.dispatcher.dispatch(event).await {
            match e {
                dispatcher::DispatchError::Handler(HandlerError::AlreadyExists(_)) => {}
                dispatcher::DispatchError::Handler(HandlerError::NotFound(_)) => {}
                dispatcher::DispatchError::NoHandler(_) => {}
            }
        }
    }
}

/// Builds `Bout`s on demand. Holds the shared handles every Bout needs;
/// constructing a Bout itself is cheap.
#[derive(Clone)]
pub struct BoutFactory {
    registry: Arc<ShowRegistry>,
    config: Arc<RwLock<config::EngineConfig>>,
    dispatcher: Arc<Dispatcher>,
    site_factory: SiteDriverFactory,
}

impl BoutFactory {
    #[must_use]
    pub fn new(
        registry: Arc<ShowRegistry>,
        config: Arc<RwLock<config::EngineConfig>>,
        dispatcher: Arc<Dispatcher>,
        site_factory: SiteDriverFactory,
    ) -> Self {
        Self {
            registry,
            config,
            dispatcher,
            site_factory,
        }
    }

    #[must_use]
    pub fn make(&self, show_id: ShowId) -> Bout {
        Bout {
            show_id,
            registry: self.registry.clone(),
            config: self.config.clone(),
            dispatcher: self.dispatcher.clone(),
            site_factory: self.site_factory.clone(),
            state: Mutex::new(BoutState {
                cached_platform_room: None,
                driver: None,
                spec: None,
                snapshot: StreamSnapshot::default(),
            }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use common::DummyLogger;
    use registry::ShowSpec;
    use site::ScriptedSiteDriver;

    fn spec(id: &str) -> ShowSpec {
        let now = Utc::now();
        ShowSpec {
            id: id.parse().unwrap(),
            platform: "douyin".to_owned(),
            room_id: "r1".to_owned(),
            enabled: true,
            streamer_name: "s".to_owned(),
            output_template: "out".to_owned(),
            save_dir: "/tmp".to_owned(),
            parser: "flv".to_owned(),
            post_actions: vec![PostActionSpec::Trash],
            split_rule: SplitRule::default(),
            date_created: now,
            date_updated: now,
        }
    }

    fn factory_with_driver(registry: Arc<ShowRegistry>) -> BoutFactory {
        let config = Arc::new(RwLock::new(config::EngineConfig::default()));
        let dispatcher = Arc::new(Dispatcher::new(DummyLogger::new()));
        let site_factory: SiteDriverFactory = Arc::new(|_platform| {
            Box::new(ScriptedSiteDriver::new(
                "fake",
                vec![StreamSnapshot {
                    live: true,
                    stream_url: Some("u".to_owned()),
                    streamer_name: Some("s".to_owned()),
                    room_name: Some("r".to_owned()),
                    ..Default::default()
                }],
            ))
        });
        BoutFactory::new(registry, config, dispatcher, site_factory)
    }

    #[tokio::test]
    async fn refresh_is_noop_after_delete() {
        let registry = Arc::new(ShowRegistry::new());
        registry.set(spec("a"));
        let factory = factory_with_driver(registry.clone());
        let bout = factory.make("a".parse().unwrap());
        bout.snap().await.unwrap();
        assert!(bout.stream_url().1);

        registry.delete(&"a".parse().unwrap());
        bout.refresh();
        // Still reports the last cached snapshot.
        assert!(bout.stream_url().1);
    }

    #[tokio::test]
    async fn post_actions_is_a_deep_copy() {
        let registry = Arc::new(ShowRegistry::new());
        registry.set(spec("a"));
        let factory = factory_with_driver(registry);
        let bout = factory.make("a".parse().unwrap());
        bout.refresh();

        let mut actions = bout.post_actions();
        actions.push(PostActionSpec::Archive);
        assert_eq!(bout.post_actions().len(), 1);
        assert_eq!(actions.len(), 2);
    }

    #[test]
    fn resolve_output_path_before_refresh_errors() {
        let registry = Arc::new(ShowRegistry::new());
        let factory = factory_with_driver(registry);
        let bout = factory.make("a".parse().unwrap());
        bout.resolve_output_path(Utc::now()).unwrap_err();
    }
}
