// SPDX-License-Identifier: GPL-2.0-or-later

//! The `SiteDriver` plugin contract. Per-platform "snap" drivers (flv/HLS
//! URL discovery, cookie handling, login walls) are external collaborators;
//! this crate only defines the interface and the transient snapshot type
//! Bout consumes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result of a single probe of a platform for current live status.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamSnapshot {
    pub stream_url: Option<String>,
    pub live: bool,
    pub room_name: Option<String>,
    pub streamer_name: Option<String>,
    pub captured_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum SiteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("not permitted: {0}")]
    NotPermitted(String),

    #[error("unsupported platform: '{0}'")]
    UnsupportedPlatform(String),
}

/// Given platform+`room_id` (+cookie), produces a `StreamSnapshot`.
#[async_trait]
pub trait SiteDriver: Send + Sync {
    fn name(&self) -> &str;

    async fn snap(&self, room_id: &str, cookie: &str) -> Result<StreamSnapshot, SiteError>;

    /// Parses a room URL into `(platform, room_id)`, if this driver
    /// recognizes the URL's domain.
    fn permit(&self, url: &str) -> Result<(String, String), SiteError>;
}

/// A deterministic fake used by tests elsewhere in the workspace: returns a
/// scripted sequence of snapshots, one per call, repeating the last one once
/// exhausted.
pub struct ScriptedSiteDriver {
    name: String,
    script: std::sync::Mutex<Vec<StreamSnapshot>>,
}

impl ScriptedSiteDriver {
    #[must_use]
    pub fn new(name: &str, script: Vec<StreamSnapshot>) -> Self {
        Self {
            name: name.to_owned(),
            script: std::sync::Mutex::new(script),
        }
    }
}

#[async_trait]
impl SiteDriver for ScriptedSiteDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn snap(&self, _room_id: &str, _cookie: &str) -> Result<StreamSnapshot, SiteError> {
        #[allow(clippy::unwrap_used)]
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            Ok(script.remove(0))
        } else {
            Ok(script.first().cloned().unwrap_or_default())
        }
    }

    fn permit(&self, _url: &str) -> Result<(String, String), SiteError> {
        Err(SiteError::UnsupportedPlatform(self.name.clone()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_driver_advances_and_sticks_on_last() {
        let driver = ScriptedSiteDriver::new(
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
        );

        let first = driver.snap("r", "").await.unwrap();
        assert!(!first.live);

        let second = driver.snap("r", "").await.unwrap();
        assert!(second.live);

        let third = driver.snap("r", "").await.unwrap();
        assert!(third.live);
    }
}
