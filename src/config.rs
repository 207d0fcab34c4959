// src/config.rs

//! Runtime configuration.
//!
//! The client takes no command-line flags. Defaults reproduce the stock
//! behaviour (a 0.1-unit wireframe cube on `zigen-0` rotating once every ten
//! seconds); a JSON file named by `ZCMS_CONFIG` may override any subset of the
//! fields.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

/// Environment variable naming an optional JSON config file.
pub const CONFIG_ENV_VAR: &str = "ZCMS_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub cuboid: CuboidConfig,
    pub animation: AnimationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Socket name, resolved against `$XDG_RUNTIME_DIR` unless absolute.
    pub socket_name: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            socket_name: "zigen-0".to_string(),
        }
    }
}

/// Extent of the cuboid and how it maps to geometry.
///
/// The window is negotiated at `extent / half_size_divisor` while vertices are
/// drawn at `±extent / vertex_extent_divisor`. With the defaults (2 and 3) the
/// drawn wireframe is smaller than the negotiated bounds; the two are kept
/// independent on purpose.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CuboidConfig {
    pub width: f32,
    pub height: f32,
    pub depth: f32,
    pub half_size_divisor: f32,
    pub vertex_extent_divisor: f32,
}

impl Default for CuboidConfig {
    fn default() -> Self {
        CuboidConfig {
            width: 0.1,
            height: 0.1,
            depth: 0.1,
            half_size_divisor: 2.0,
            vertex_extent_divisor: 3.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnimationConfig {
    /// Frame-time units (milliseconds) per full rotation.
    pub rotation_period_ms: u32,
    /// Shader uniform receiving the rotation angle.
    pub uniform_name: String,
    /// Stop cleanly after this many frames; runs until told to stop if unset.
    pub max_frames: Option<u64>,
}

impl Default for AnimationConfig {
    fn default() -> Self {
        AnimationConfig {
            rotation_period_ms: 10_000,
            uniform_name: "theta".to_string(),
            max_frames: None,
        }
    }
}

impl Config {
    /// Loads from `ZCMS_CONFIG` when set, otherwise returns the defaults.
    pub fn load() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Self::from_file(&PathBuf::from(path)),
            None => {
                info!("{} not set; using default configuration", CONFIG_ENV_VAR);
                Ok(Self::default())
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_json(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(text).context("Failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.cuboid;
        for (name, value) in [
            ("cuboid.width", c.width),
            ("cuboid.height", c.height),
            ("cuboid.depth", c.depth),
            ("cuboid.half_size_divisor", c.half_size_divisor),
            ("cuboid.vertex_extent_divisor", c.vertex_extent_divisor),
        ] {
            if !value.is_finite() || value <= 0.0 {
                bail!("{} must be a positive finite number, got {}", name, value);
            }
        }
        if self.animation.rotation_period_ms == 0 {
            bail!("animation.rotation_period_ms must be non-zero");
        }
        let uniform = &self.animation.uniform_name;
        if uniform.is_empty() || uniform.contains('\0') {
            bail!("animation.uniform_name must be non-empty and free of NUL bytes");
        }
        if self.animation.max_frames == Some(0) {
            bail!("animation.max_frames must be at least 1 when set");
        }
        if self.connection.socket_name.is_empty() {
            bail!("connection.socket_name must not be empty");
        }
        Ok(())
    }
}
