//! Colorization stage
//!
//! The network sees a fixed-size lightness tile centred on zero and predicts
//! the a/b chrominance planes, which are stretched back over the full-size
//! lightness of the original frame.

use crate::error::{Error, Result};
use crate::models::{Capability, FeatureMap, ModelRegistry, TractCapability};
use crate::processing::{bgr_to_lab, lab_to_bgr, resize_plane, LabImage, Plane, ScaleAlgorithm};
use crate::types::Frame;

/// Side length of the square lightness tile the network consumes
pub const TILE_SIZE: u32 = 224;

/// Lightness value mapped to zero before inference
pub const LIGHTNESS_CENTER: f32 = 50.0;

/// Predicts chrominance for a frame, keeping its lightness
pub struct ColorizationStage {
    capability: Box<dyn Capability>,
    tile: u32,
}

impl ColorizationStage {
    pub fn new(capability: Box<dyn Capability>) -> Self {
        Self {
            capability,
            tile: TILE_SIZE,
        }
    }

    /// Override the tile size (for networks exported at another resolution)
    pub fn with_tile(mut self, tile: u32) -> Self {
        self.tile = tile;
        self
    }

    /// Fetch if needed and load the registered colorization model
    pub fn load(registry: &ModelRegistry) -> Result<Self> {
        let descriptor = registry.colorizer()?;
        let path = registry.ensure_local(descriptor)?;
        let capability = TractCapability::load(path)?;
        Ok(Self::new(Box::new(capability)))
    }

    /// Colorize a frame at its own resolution
    ///
    /// Output is always three-channel BGR; a grayscale input gains colour.
    pub fn apply(&self, frame: Frame) -> Result<Frame> {
        let (w, h) = (frame.width, frame.height);
        if w == 0 || h == 0 {
            return Err(Error::Inference("Cannot colorize an empty frame".into()));
        }

        let lab = bgr_to_lab(&frame)?;

        let tile = resize_plane(&lab.l, self.tile, self.tile, ScaleAlgorithm::Bilinear)?
            .map(|v| v - LIGHTNESS_CENTER);
        let input = FeatureMap::new(self.tile as usize, self.tile as usize, 1, tile.data)?;

        let out = self.capability.infer(&input)?;
        if out.channels != 2 || out.height == 0 || out.width == 0 {
            return Err(Error::Inference(format!(
                "{} produced {}x{}x{}, expected two chrominance channels",
                self.capability.label(),
                out.width,
                out.height,
                out.channels
            )));
        }

        let (ow, oh) = (out.width as u32, out.height as u32);
        let a = Plane::from_data(ow, oh, out.channel(0));
        let b = Plane::from_data(ow, oh, out.channel(1));

        let colorized = lab_to_bgr(&LabImage {
            l: lab.l,
            a: resize_plane(&a, w, h, ScaleAlgorithm::Bilinear)?,
            b: resize_plane(&b, w, h, ScaleAlgorithm::Bilinear)?,
        })?;

        Ok(colorized.with_index(frame.index))
    }
}
