// SPDX-License-Identifier: GPL-2.0-or-later

//! The in-process event bus wiring Bout to the managers.
//!
//! Rather than a dynamic map of boxed `{EventKind -> handler}` entries, the
//! bus is a sum type (`Event`) paired with a fixed record of two typed
//! handler slots (`MonitorHandler`, `RecorderHandler`). This keeps
//! registration exhaustive at compile time — adding a new `EventKind`
//! requires adding a field here, not just remembering to register a string
//! key — while preserving the "one handler per kind, synchronous dispatch"
//! behavior the original design has.

use async_trait::async_trait;
use common::{ArcLogger, LogEntry, LogLevel, ShowId};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    AddMonitor,
    RemoveMonitor,
    AddRecorder,
    RemoveRecorder,
}

#[derive(Clone, Debug)]
pub enum Event {
    AddMonitor(ShowId),
    RemoveMonitor(ShowId),
    AddRecorder(ShowId),
    RemoveRecorder(ShowId),
}

impl Event {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Event::AddMonitor(_) => EventKind::AddMonitor,
            Event::RemoveMonitor(_) => EventKind::RemoveMonitor,
            Event::AddRecorder(_) => EventKind::AddRecorder,
            Event::RemoveRecorder(_) => EventKind::RemoveRecorder,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("already exists: '{0}'")]
    AlreadyExists(ShowId),

    #[error("not found: '{0}'")]
    NotFound(ShowId),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no handler registered for {0:?}")]
    NoHandler(EventKind),

    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),
}

#[async_trait]
pub trait MonitorHandler: Send + Sync {
    async fn add_monitor(&self, show_id: ShowId) -> Result<(), HandlerError>;
    async fn remove_monitor(&self, show_id: ShowId) -> Result<(), HandlerError>;
}

#[async_trait]
pub trait RecorderHandler: Send + Sync {
    async fn add_recorder(&self, show_id: ShowId) -> Result<(), HandlerError>;
    async fn remove_recorder(&self, show_id: ShowId) -> Result<(), HandlerError>;
}

/// Typed `EventKind -> handler` record. Each kind has exactly one registered
/// handler; a second registration overwrites the first and logs a warning.
/// Dispatch is synchronous on the caller's task: handlers serialize
/// per-resource via their own locks, so synchronous dispatch keeps ordering
/// obvious and propagates errors directly to the emitter.
pub struct Dispatcher {
    monitor_handler: RwLock<Option<Arc<dyn MonitorHandler>>>,
    recorder_handler: RwLock<Option<Arc<dyn RecorderHandler>>>,
    logger: ArcLogger,
}

impl Dispatcher {
    #[must_use]
    pub fn new(logger: ArcLogger) -> Self {
        Self {
            monitor_handler: RwLock::new(None),
            recorder_handler: RwLock::new(None),
            logger,
        }
    }

    #[allow(clippy::unwrap_used)]
    pub fn register_monitor_handler(&self, handler: Arc<dyn MonitorHandler>) {
        let mut slot = self.monitor_handler.write().unwrap();
        if slot.is_some() {
            self.logger.log(LogEntry::new(
                LogLevel::Warning,
                "dispatch",
                None,
                "monitor handler overwritten".to_owned(),
            ));
        }
        *slot = Some(handler);
    }

    #[allow(clippy::unwrap_used)]
    pub fn register_recorder_handler(&self, handler: Arc<dyn RecorderHandler>) {
        let mut slot = self.recorder_handler.write().unwrap();
        if slot.is_some() {
            self.logger.log(LogEntry::new(
                LogLevel::Warning,
                "dispatch",
                None,
                "recorder handler overwritten".to_owned(),
            ));
        }
        *slot = Some(handler);
    }

    /// Calls the handler registered for `event.kind()` and returns its
    /// result. `AlreadyExists`/`NotFound` are returned to the caller, not
    /// swallowed here — Bout is responsible for deciding those are
    /// non-fatal.
    pub async fn dispatch(&self, event: Event) -> Result<(), DispatchError> {
        match event {
            Event::AddMonitor(id) => {
                #[allow(clippy::unwrap_used)]
                let handler = self.monitor_handler.read().unwrap().clone();
                let handler = handler.ok_or(DispatchError::NoHandler(EventKind::AddMonitor))?;
                Ok(handler.add_monitor(id).await?)
            }
            Event::RemoveMonitor(id) => {
                #[allow(clippy::unwrap_used)]
                let handler = self.monitor_handler.read().unwrap().clone();
                let handler = handler.ok_or(DispatchError::NoHandler(EventKind::RemoveMonitor))?;
                Ok(handler.remove_monitor(id).await?)
            }
            Event::AddRecorder(id) => {
                #[allow(clippy::unwrap_used)]
                let handler = self.recorder_handler.read().unwrap().clone();
                let handler = handler.ok_or(DispatchError::NoHandler(EventKind::AddRecorder))?;
                Ok(handler.add_recorder(id).await?)
            }
            Event::RemoveRecorder(id) => {
                #[allow(clippy::unwrap_used)]
                let handler = self.recorder_handler.read().unwrap().clone();
                let handler =
                    handler.ok_or(DispatchError::NoHandler(EventKind::RemoveRecorder))?;
                Ok(handler.remove_recorder(id).await?)
            }
        }
    }
}
