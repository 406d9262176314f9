// SPDX-License-Identifier: GPL-2.0-or-later

//! The concurrent `ShowId -> ShowSpec` map: the single source of truth for
//! per-show settings. Bout never owns a `ShowSpec`; it re-resolves by id on
//! every access against this registry.

use chrono::{DateTime, Utc};
use common::ShowId;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::RwLock};
use thiserror::Error;

/// Parser tag recognized by the `parser` crate's registry.
pub type ParserTag = String;

/// A single post-recording action, in the order it must run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PostActionSpec {
    /// Delete the recorded file.
    Trash,

    /// Move the recorded file into an `archive/` directory.
    Archive,

    /// Hand the file to the external upload collaborator.
    Upload {
        cookie_file: String,
        threads: u32,
    },

    /// Spawn a child process. Unrecognized tags fall back to this at the
    /// uploader layer, but specs constructed directly always pick it
    /// explicitly.
    Shell { args: Vec<String> },
}

/// `{maxFileSize?, maxDuration?}`; valid iff at least one field is positive.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SplitRule {
    /// Bytes. Zero means "no size bound".
    #[serde(default)]
    pub max_file_size: u64,

    /// Seconds. Zero means "no duration bound".
    #[serde(default)]
    pub max_duration_sec: u64,
}

impl SplitRule {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.max_file_size > 0 || self.max_duration_sec > 0
    }

    /// Satisfied iff any configured bound has been reached. An invalid rule
    /// (both bounds zero) is never satisfied.
    #[must_use]
    pub fn satisfied(&self, elapsed_sec: u64, current_size: u64) -> bool {
        let duration_hit = self.max_duration_sec > 0 && elapsed_sec >= self.max_duration_sec;
        let size_hit = self.max_file_size > 0 && current_size >= self.max_file_size;
        duration_hit || size_hit
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShowSpec {
    pub id: ShowId,
    pub platform: String,
    pub room_id: String,
    pub enabled: bool,
    pub streamer_name: String,

    #[serde(default)]
    pub output_template: String,

    #[serde(default)]
    pub save_dir: String,

    /// Empty resolves to `streamlink` for platforms in
    /// `{youtube, twitch, streamlink}`, else `flv`.
    #[serde(default)]
    pub parser: ParserTag,

    #[serde(default)]
    pub post_actions: Vec<PostActionSpec>,

    #[serde(default)]
    pub split_rule: SplitRule,

    pub date_created: DateTime<Utc>,
    pub date_updated: DateTime<Utc>,
}

const STREAMLINK_PLATFORMS: [&str; 3] = ["youtube", "twitch", "streamlink"];

impl ShowSpec {
    /// Fills in parser, `save_dir` and `output_template` defaults the same
    /// way the upstream admin collaborator does before a spec is ever handed
    /// to a Bout.
    pub fn apply_defaults(&mut self, default_save_dir: &str, default_out_template: &str) {
        if self.parser.is_empty() {
            self.parser = if STREAMLINK_PLATFORMS.contains(&self.platform.as_str()) {
                "streamlink".to_owned()
            } else {
                "flv".to_owned()
            };
        }
        if self.save_dir.is_empty() {
            self.save_dir = default_save_dir.to_owned();
        }
        if self.output_template.is_empty() {
            self.output_template = default_out_template.to_owned();
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShowRegistryError {
    #[error("show not found: '{0}'")]
    NotFound(ShowId),
}

/// Concurrent map `ShowId -> ShowSpec`. Many concurrent readers, one writer
/// at a time; all reads copy values out so callers never hold the lock
/// across an await.
#[derive(Default)]
pub struct ShowRegistry {
    shows: RwLock<HashMap<ShowId, ShowSpec>>,
}

impl ShowRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn get(&self, id: &ShowId) -> Option<ShowSpec> {
        self.shows.read().unwrap().get(id).cloned()
    }

    /// Insert-or-replace. Never rekeys: the `ShowId` in `spec` is used as-is.
    #[allow(clippy::unwrap_used)]
    pub fn set(&self, spec: ShowSpec) {
        self.shows.write().unwrap().insert(spec.id.clone(), spec);
    }

    #[allow(clippy::unwrap_used)]
    pub fn delete(&self, id: &ShowId) -> Option<ShowSpec> {
        self.shows.write().unwrap().remove(id)
    }

    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn len(&self) -> usize {
        self.shows.read().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates a read-consistent snapshot. `f` returning `false` stops
    /// iteration early. No ordering guarantee.
    #[allow(clippy::unwrap_used)]
    pub fn each<F>(&self, mut f: F)
    where
        F: FnMut(&ShowSpec) -> bool,
    {
        let snapshot: Vec<ShowSpec> = self.shows.read().unwrap().values().cloned().collect();
        for spec in &snapshot {
            if !f(spec) {
                break;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn spec(id: &str, platform: &str) -> ShowSpec {
        let now = Utc::now();
        ShowSpec {
            id: id.parse().unwrap(),
            platform: platform.to_owned(),
            room_id: "r".to_owned(),
            enabled: true,
            streamer_name: "s".to_owned(),
            output_template: String::new(),
            save_dir: String::new(),
            parser: String::new(),
            post_actions: Vec::new(),
            split_rule: SplitRule::default(),
            date_created: now,
            date_updated: now,
        }
    }

    #[test]
    fn set_get_delete() {
        let reg = ShowRegistry::new();
        reg.set(spec("a", "douyin"));
        assert!(reg.get(&"a".parse().unwrap()).is_some());
        assert_eq!(reg.len(), 1);

        reg.delete(&"a".parse().unwrap());
        assert!(reg.get(&"a".parse().unwrap()).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn set_never_rekeys_on_update() {
        let reg = ShowRegistry::new();
        reg.set(spec("a", "douyin"));
        let mut updated = spec("a", "kuaishou");
        updated.streamer_name = "new-name".to_owned();
        reg.set(updated);

        assert_eq!(reg.len(), 1);
        let got = reg.get(&"a".parse().unwrap()).unwrap();
        assert_eq!(got.platform, "kuaishou");
        assert_eq!(got.streamer_name, "new-name");
    }

    #[test]
    fn each_stops_early() {
        let reg = ShowRegistry::new();
        reg.set(spec("a", "douyin"));
        reg.set(spec("b", "douyin"));
        reg.set(spec("c", "douyin"));

        let mut seen = 0;
        reg.each(|_| {
            seen += 1;
            seen < 2
        });
        assert_eq!(seen, 2);
    }

    #[test_case("youtube", "streamlink"; "youtube defaults to streamlink")]
    #[test_case("twitch", "streamlink"; "twitch defaults to streamlink")]
    #[test_case("streamlink", "streamlink"; "streamlink stays streamlink")]
    #[test_case("douyin", "flv"; "unknown platform defaults to flv")]
    fn apply_defaults_picks_parser(platform: &str, want_parser: &str) {
        let mut s = spec("a", platform);
        s.apply_defaults("/tmp", "tmpl");
        assert_eq!(s.parser, want_parser);
    }

    #[test]
    fn apply_defaults_does_not_override_explicit_parser() {
        let mut s = spec("a", "youtube");
        s.parser = "yt-dlp".to_owned();
        s.apply_defaults("/tmp", "tmpl");
        assert_eq!(s.parser, "yt-dlp");
    }

    #[test_case(0, 0, 10, 100, false; "invalid rule never satisfied")]
    #[test_case(60, 0, 59, 0, false; "duration not yet reached")]
    #[test_case(60, 0, 60, 0, true; "duration exactly reached")]
    #[test_case(0, 1000, 0, 999, false; "size not yet reached")]
    #[test_case(0, 1000, 0, 1000, true; "size exactly reached")]
    fn split_rule_satisfied(
        max_duration_sec: u64,
        max_file_size: u64,
        elapsed_sec: u64,
        current_size: u64,
        want: bool,
    ) {
        let rule = SplitRule {
            max_file_size,
            max_duration_sec,
        };
        assert_eq!(rule.satisfied(elapsed_sec, current_size), want);
    }

    #[test]
    fn split_rule_monotonic() {
        let rule = SplitRule {
            max_file_size: 0,
            max_duration_sec: 60,
        };
        assert!(rule.satisfied(60, 0));
        assert!(rule.satisfied(61, 0));
        assert!(!rule.satisfied(59, 0));
    }
}
