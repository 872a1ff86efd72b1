//! Output configuration
//!
//! Loaded from a TOML file with `LIVEVIEW__SECTION__KEY` environment
//! overrides. Every section has defaults, so a file only needs to list the
//! cameras.
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:8082"
//!
//! [encoder]
//! output_width = 640
//! output_height = 320
//! bitrate = "1000k"
//!
//! [cameras.front]
//! width = 1280
//! height = 720
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::birdseye::BIRDSEYE_CHANNEL;
use crate::error::{Error, Result};
use crate::frame::store::DEFAULT_SHM_ROOT;
use crate::frame::FrameShape;
use crate::server::ServerConfig;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "LIVEVIEW";

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub server: ServerConfig,
    pub encoder: EncoderConfig,
    pub birdseye: BirdseyeConfig,
    pub frame_store: FrameStoreConfig,
    pub queue: QueueConfig,
    pub cameras: BTreeMap<String, CameraConfig>,
}

/// Settings shared by every encoder subprocess
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Encoder executable
    pub program: String,
    /// Width of the encoded stream
    pub output_width: u32,
    /// Height of the encoded stream
    pub output_height: u32,
    /// Target bitrate, in the encoder's notation
    pub bitrate: String,
    /// Grace period between terminate and kill
    pub shutdown_timeout_secs: u64,
    /// Largest chunk read from the encoder at once
    pub read_chunk_size: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            output_width: 640,
            output_height: 320,
            bitrate: "1000k".to_string(),
            shutdown_timeout_secs: 30,
            read_chunk_size: 64 * 1024,
        }
    }
}

impl EncoderConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Birdseye canvas settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BirdseyeConfig {
    pub width: u32,
    pub height: u32,
    /// How long after its last object a camera stays on the canvas
    pub activity_window_secs: f64,
}

impl Default for BirdseyeConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            activity_window_secs: 30.0,
        }
    }
}

impl BirdseyeConfig {
    pub fn shape(&self) -> FrameShape {
        FrameShape::new(self.width, self.height)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FrameStoreConfig {
    /// Directory the producer's named frame buffers live in
    pub root: PathBuf,
}

impl Default for FrameStoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_SHM_ROOT),
        }
    }
}

/// Metadata queue settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Wait per dequeue before re-checking for shutdown
    pub timeout_secs: f64,
    /// Bound of the metadata channel
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10.0,
            capacity: 64,
        }
    }
}

impl QueueConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }
}

/// Per-camera input frame size
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CameraConfig {
    pub width: u32,
    pub height: u32,
}

impl CameraConfig {
    pub fn shape(&self) -> FrameShape {
        FrameShape::new(self.width, self.height)
    }
}

impl OutputConfig {
    /// Load from a TOML file, then apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: OutputConfig = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Add a camera
    pub fn camera(mut self, name: impl Into<String>, width: u32, height: u32) -> Self {
        self.cameras
            .insert(name.into(), CameraConfig { width, height });
        self
    }

    /// Check the constraints serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(Error::InvalidConfig("no cameras configured".into()));
        }
        if self.cameras.contains_key(BIRDSEYE_CHANNEL) {
            return Err(Error::InvalidConfig(format!(
                "camera name '{}' is reserved",
                BIRDSEYE_CHANNEL
            )));
        }

        let shapes = self
            .cameras
            .iter()
            .map(|(name, camera)| (name.as_str(), camera.shape()))
            .chain(std::iter::once((BIRDSEYE_CHANNEL, self.birdseye.shape())));
        for (name, shape) in shapes {
            if shape.is_empty() || shape.width % 2 != 0 || shape.height % 2 != 0 {
                return Err(Error::InvalidConfig(format!(
                    "{}: frame size {} must be non-zero and even",
                    name, shape
                )));
            }
        }

        if self.encoder.read_chunk_size == 0 {
            return Err(Error::InvalidConfig("encoder.read_chunk_size must be > 0".into()));
        }

        Ok(())
    }
}
