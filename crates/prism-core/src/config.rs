// SPDX-License-Identifier: CEPL-1.0
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "prism.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct EngineConfig {
    #[serde(default)]
    pub window: WindowCfg,
    #[serde(default)]
    pub render: RenderCfg,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WindowCfg {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RenderCfg {
    #[serde(default = "default_clear")]
    pub clear_color: [f32; 4],
    #[serde(default)]
    pub present_mode: PresentModeCfg,
    /// Upper bound on fence waits and image acquisition, in milliseconds.
    /// Zero keeps the waits unbounded.
    #[serde(default)]
    pub frame_timeout_ms: u64,
    #[serde(default = "default_staging_capacity")]
    pub staging_capacity: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresentModeCfg {
    #[default]
    Fifo,
    Mailbox,
    Immediate,
}

impl Default for WindowCfg {
    fn default() -> Self {
        WindowCfg {
            title: default_title(),
            width: default_width(),
            height: default_height(),
        }
    }
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: default_clear(),
            present_mode: PresentModeCfg::Fifo,
            frame_timeout_ms: 0,
            staging_capacity: default_staging_capacity(),
        }
    }
}

impl RenderCfg {
    /// Timeout in nanoseconds, as the Vulkan wait calls take it.
    pub fn frame_timeout_ns(&self) -> u64 {
        if self.frame_timeout_ms == 0 {
            u64::MAX
        } else {
            self.frame_timeout_ms.saturating_mul(1_000_000)
        }
    }
}

fn default_title() -> String {
    "prism".to_owned()
}
fn default_width() -> u32 {
    1280
}
fn default_height() -> u32 {
    720
}
fn default_clear() -> [f32; 4] {
    [0.1, 0.1, 0.1, 1.0]
}
fn default_staging_capacity() -> u64 {
    10_000
}

impl EngineConfig {
    pub fn from_toml(src: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(src).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let src = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml(&src, path)
    }

    /// Missing file means defaults; a broken one is reported and also falls back.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::read(path) {
            Ok(cfg) => {
                info!("config loaded from {}", path.display());
                cfg
            }
            Err(ConfigError::Io { .. }) => EngineConfig::default(),
            Err(e) => {
                warn!("{e}; using defaults");
                EngineConfig::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = EngineConfig::from_toml("", Path::new("prism.toml")).unwrap();
        assert_eq!(cfg.window.width, 1280);
        assert_eq!(cfg.render.present_mode, PresentModeCfg::Fifo);
        assert_eq!(cfg.render.staging_capacity, 10_000);
        assert_eq!(cfg.render.frame_timeout_ns(), u64::MAX);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let src = r#"
            [render]
            present_mode = "mailbox"
            frame_timeout_ms = 250
        "#;
        let cfg = EngineConfig::from_toml(src, Path::new("prism.toml")).unwrap();
        assert_eq!(cfg.render.present_mode, PresentModeCfg::Mailbox);
        assert_eq!(cfg.render.frame_timeout_ns(), 250_000_000);
        assert_eq!(cfg.render.clear_color, [0.1, 0.1, 0.1, 1.0]);
        assert_eq!(cfg.window.title, "prism");
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let err = EngineConfig::from_toml("[render\n", Path::new("bad.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file_falls_back() {
        let cfg = EngineConfig::load_or_default(Path::new("/nonexistent/prism.toml"));
        assert_eq!(cfg.window.height, 720);
    }
}
