//! Per-frame processing pipeline
//!
//! Frame in, frame out: optional colorization followed by super-resolution.
//! Models are resolved and loaded when the pipeline is built, so a bad
//! model name or missing file fails the job before any frame is read.

mod colorize;
mod superres;

pub use colorize::{ColorizationStage, LIGHTNESS_CENTER, TILE_SIZE};
pub use superres::SuperResolutionStage;

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::models::ModelRegistry;
use crate::types::{Frame, Resolution};

/// Ordered colorize -> upscale chain bound to one configuration
pub struct FramePipeline {
    config: PipelineConfig,
    colorizer: Option<ColorizationStage>,
    upscaler: SuperResolutionStage,
}

impl FramePipeline {
    /// Build the pipeline, acquiring every model it needs
    pub fn load(config: PipelineConfig, registry: &ModelRegistry) -> Result<Self> {
        // Both lookups happen before any download
        registry.resolve(config.model, config.scale)?;
        if config.colorize {
            registry.colorizer()?;
        }

        tracing::info!(
            "Loading pipeline: {} x{}{}",
            config.model.display_name(),
            config.scale,
            if config.colorize { " + colorization" } else { "" }
        );

        let colorizer = if config.colorize {
            Some(ColorizationStage::load(registry)?)
        } else {
            None
        };
        let upscaler = SuperResolutionStage::load(registry, config.model, config.scale)?;

        Self::from_stages(config, colorizer, upscaler)
    }

    /// Assemble a pipeline from already loaded stages
    pub fn from_stages(
        config: PipelineConfig,
        colorizer: Option<ColorizationStage>,
        upscaler: SuperResolutionStage,
    ) -> Result<Self> {
        if upscaler.scale() != config.scale || upscaler.model() != config.model {
            return Err(Error::Config(format!(
                "Upscaler {} x{} does not match configured {} x{}",
                upscaler.model(),
                upscaler.scale(),
                config.model,
                config.scale
            )));
        }
        if colorizer.is_some() != config.colorize {
            return Err(Error::Config(format!(
                "Colorization stage {} but colorize = {}",
                if colorizer.is_some() { "present" } else { "missing" },
                config.colorize
            )));
        }

        Ok(Self {
            config,
            colorizer,
            upscaler,
        })
    }

    /// Run one frame through every enabled stage
    pub fn process(&self, frame: Frame) -> Result<Frame> {
        let frame = match &self.colorizer {
            Some(stage) => stage.apply(frame)?,
            None => frame,
        };
        self.upscaler.apply(frame)
    }

    pub fn config(&self) -> PipelineConfig {
        self.config
    }

    pub fn scale(&self) -> u32 {
        self.config.scale
    }

    /// Resolution every processed frame will have
    pub fn output_resolution(&self, input: Resolution) -> Resolution {
        input.scaled(self.config.scale)
    }
}
