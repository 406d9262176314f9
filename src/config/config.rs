// SPDX-License-Identifier: GPL-2.0-or-later

//! Process-wide engine configuration.
//!
//! The engine never reads this from disk or an HTTP request itself — parsing,
//! watching and persisting `EngineConfig` is the embedding collaborator's job
//! (see `update_config` on the kernel). This crate only owns the type, its
//! defaults and the validation the engine depends on at runtime.

use common::LogLevel;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The well-known key recognized by `Kernel::update_config`.
pub const CORE_CONFIG_KEY: &str = "core_config";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "default_snap_interval_sec")]
    pub snap_interval_sec: u32,

    #[serde(default = "default_split_check_sec")]
    pub split_check_sec: u32,

    #[serde(default = "default_stall_check_sec")]
    pub stall_check_sec: u32,

    #[serde(default = "default_uploader_concurrency")]
    pub uploader_concurrency: usize,

    #[serde(default)]
    pub default_save_dir: String,

    #[serde(default)]
    pub default_out_template: String,

    #[serde(default)]
    pub log_dir: String,

    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    #[serde(default)]
    pub douyin_cookie: String,

    #[serde(default)]
    pub kuaishou_cookie: String,

    #[serde(default)]
    pub upload_enabled: bool,

    #[serde(default)]
    pub upload_cookie_file: String,

    #[serde(default = "default_upload_threads")]
    pub upload_threads: u32,
}

fn default_snap_interval_sec() -> u32 {
    15
}

fn default_split_check_sec() -> u32 {
    60
}

fn default_stall_check_sec() -> u32 {
    300
}

fn default_uploader_concurrency() -> usize {
    1
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_upload_threads() -> u32 {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snap_interval_sec: default_snap_interval_sec(),
            split_check_sec: default_split_check_sec(),
            stall_check_sec: default_stall_check_sec(),
            uploader_concurrency: default_uploader_concurrency(),
            default_save_dir: String::new(),
            default_out_template: String::new(),
            log_dir: String::new(),
            log_level: default_log_level(),
            douyin_cookie: String::new(),
            kuaishou_cookie: String::new(),
            upload_enabled: false,
            upload_cookie_file: String::new(),
            upload_threads: default_upload_threads(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ValidateConfigError {
    #[error("snap_interval_sec must be greater than zero")]
    SnapIntervalZero,

    #[error("split_check_sec must be greater than zero")]
    SplitCheckZero,

    #[error("stall_check_sec must be greater than zero")]
    StallCheckZero,

    #[error("uploader_concurrency must be at least one")]
    UploaderConcurrencyZero,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ValidateConfigError> {
        use ValidateConfigError::{
            SnapIntervalZero, SplitCheckZero, StallCheckZero, UploaderConcurrencyZero,
        };
        if self.snap_interval_sec == 0 {
            return Err(SnapIntervalZero);
        }
        if self.split_check_sec == 0 {
            return Err(SplitCheckZero);
        }
        if self.stall_check_sec == 0 {
            return Err(StallCheckZero);
        }
        if self.uploader_concurrency == 0 {
            return Err(UploaderConcurrencyZero);
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ParseCoreConfigError {
    #[error("decode json: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("validate: {0}")]
    Validate(#[from] ValidateConfigError),
}

/// Decodes and validates a `core_config` value as sent through `update_config`.
pub fn parse_core_config(value: &str) -> Result<EngineConfig, ParseCoreConfigError> {
    let cfg: EngineConfig = serde_json::from_str(value)?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn default_values_match_collaborator_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.snap_interval_sec, 15);
        assert_eq!(cfg.split_check_sec, 60);
        assert_eq!(cfg.stall_check_sec, 300);
        assert_eq!(cfg.uploader_concurrency, 1);
    }

    #[test_case("snap_interval_sec"; "snap interval")]
    #[test_case("split_check_sec"; "split check")]
    #[test_case("stall_check_sec"; "stall check")]
    #[test_case("uploader_concurrency"; "uploader concurrency")]
    fn rejects_zero_value(field: &str) {
        let mut cfg = EngineConfig::default();
        match field {
            "snap_interval_sec" => cfg.snap_interval_sec = 0,
            "split_check_sec" => cfg.split_check_sec = 0,
            "stall_check_sec" => cfg.stall_check_sec = 0,
            "uploader_concurrency" => cfg.uploader_concurrency = 0,
            _ => unreachable!(),
        }
        cfg.validate().unwrap_err();
    }

    #[test]
    fn parse_core_config_fills_defaults() {
        let cfg = parse_core_config("{}").unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn parse_core_config_rejects_invalid() {
        parse_core_config(r#"{"snap_interval_sec":0}"#).unwrap_err();
    }
}
