//! Configuration types for RetroHD

use crate::error::{Error, Result};
use crate::models::{ModelName, SCALES};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Per-job pipeline configuration
///
/// Immutable once a pipeline is built from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Super-resolution model family
    pub model: ModelName,
    /// Integer scale factor (2..=4)
    pub scale: u32,
    /// Run colorization before upscaling
    pub colorize: bool,
}

impl PipelineConfig {
    /// Validated configuration
    pub fn new(model: ModelName, scale: u32, colorize: bool) -> Result<Self> {
        if !SCALES.contains(&scale) {
            return Err(Error::Config(format!(
                "Scale factor must be between {} and {}, got {}",
                SCALES.start(),
                SCALES.end(),
                scale
            )));
        }
        Ok(Self {
            model,
            scale,
            colorize,
        })
    }

    /// Build from a textual model name, as received from a caller
    pub fn parse(model: &str, scale: u32, colorize: bool) -> Result<Self> {
        Self::new(ModelName::parse(model, scale)?, scale, colorize)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: ModelName::Fsrcnn,
            scale: 4,
            colorize: false,
        }
    }
}

/// Default pipeline settings from the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineDefaults {
    pub model: String,
    pub scale: u32,
    pub colorize: bool,
    /// Scale used for live streams (lower keeps the frame rate up)
    pub live_scale: u32,
}

impl Default for PipelineDefaults {
    fn default() -> Self {
        Self {
            model: "fsrcnn".into(),
            scale: 4,
            colorize: false,
            live_scale: 2,
        }
    }
}

/// Extra model registry entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    pub scale: u32,
    /// File name inside the cache directory
    pub file: String,
    pub url: Option<String>,
}

/// Model cache and registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Directory model files are cached in
    pub cache_dir: PathBuf,
    /// Colorization model file inside the cache directory
    pub colorizer_file: String,
    /// Where to fetch the colorization model from
    pub colorizer_url: Option<String>,
    /// Additional or overriding super-resolution entries
    pub extra: Vec<ModelEntry>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("models"),
            colorizer_file: "colorizer.onnx".into(),
            colorizer_url: None,
            extra: Vec::new(),
        }
    }
}

/// Encoder configuration for the silent upscaled video
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Preferred FFmpeg encoder
    pub codec: String,
    /// Encoder used when the preferred one is not compiled in
    pub fallback_codec: String,
    /// x264 preset
    pub preset: String,
    /// Constant rate factor (quality-based)
    pub crf: u8,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            codec: "libx264".into(),
            fallback_codec: "mpeg4".into(),
            preset: "medium".into(),
            crf: 18,
        }
    }
}

impl EncoderConfig {
    pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = codec.into();
        self
    }

    pub fn with_crf(mut self, crf: u8) -> Self {
        self.crf = crf;
        self
    }

    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = preset.into();
        self
    }
}

/// Live presentation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// FFmpeg output device (sdl, xv, fbdev, v4l2, ...)
    pub device: String,
    /// Device target (window title for sdl/xv, device node otherwise)
    pub target: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            device: "sdl".into(),
            target: "RetroHD - Live AI Upscale".into(),
        }
    }
}

impl DisplayConfig {
    pub fn with_device(mut self, device: impl Into<String>, target: impl Into<String>) -> Self {
        self.device = device.into();
        self.target = target.into();
        self
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineDefaults,
    pub models: ModelsConfig,
    pub encoder: EncoderConfig,
    pub display: DisplayConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| Error::Config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file if given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<()> {
        for scale in [self.pipeline.scale, self.pipeline.live_scale] {
            if !SCALES.contains(&scale) {
                return Err(Error::Config(format!("Unsupported scale {}", scale)));
            }
        }
        ModelName::parse(&self.pipeline.model, self.pipeline.scale)?;
        if self.encoder.crf > 51 {
            return Err(Error::Config(format!("crf {} out of range 0-51", self.encoder.crf)));
        }
        Ok(())
    }

    /// Default file job configuration
    pub fn file_pipeline(&self) -> Result<PipelineConfig> {
        PipelineConfig::parse(&self.pipeline.model, self.pipeline.scale, self.pipeline.colorize)
    }

    /// Default live job configuration
    pub fn live_pipeline(&self) -> Result<PipelineConfig> {
        PipelineConfig::parse(
            &self.pipeline.model,
            self.pipeline.live_scale,
            self.pipeline.colorize,
        )
    }
}
