//! Super-resolution stage
//!
//! Luma-only networks (FSRCNN, ESPCN, LapSRN) enlarge the normalized Y
//! channel; chroma is interpolated bicubically. EDSR enlarges mean-shifted
//! BGR directly.

use crate::error::{Error, Result};
use crate::models::{Capability, FeatureMap, ModelName, ModelRegistry, TractCapability};
use crate::processing::{bgr_to_ycrcb, resize_plane, ycrcb_to_bgr, Plane, ScaleAlgorithm, YCrCbImage};
use crate::types::{ColorSpace, Frame};

/// Per-channel BGR mean EDSR was trained with
const EDSR_MEAN: [f32; 3] = [103.1545782, 111.561547, 114.35629928];

/// Enlarges frames by the scale compiled into its model
pub struct SuperResolutionStage {
    capability: Box<dyn Capability>,
    model: ModelName,
    scale: u32,
}

impl SuperResolutionStage {
    /// Wrap an already loaded capability
    pub fn new(capability: Box<dyn Capability>, model: ModelName, scale: u32) -> Self {
        Self {
            capability,
            model,
            scale,
        }
    }

    /// Resolve, fetch if needed, and load the model for (model, scale)
    pub fn load(registry: &ModelRegistry, model: ModelName, scale: u32) -> Result<Self> {
        let descriptor = registry.resolve(model, scale)?;
        let path = registry.ensure_local(descriptor)?;
        let capability = TractCapability::load(path)?;
        Ok(Self::new(Box::new(capability), model, scale))
    }

    /// Scale factor bound to the loaded model
    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn model(&self) -> ModelName {
        self.model
    }

    /// Enlarge a frame to exactly `width*scale x height*scale`
    pub fn apply(&self, frame: Frame) -> Result<Frame> {
        if !frame.is_consistent() || frame.width == 0 || frame.height == 0 {
            return Err(Error::Inference(format!(
                "Malformed {}x{} frame ({} bytes)",
                frame.width,
                frame.height,
                frame.data.len()
            )));
        }

        let index = frame.index;
        let out = if self.model.is_luma_only() {
            self.upscale_luma(&frame)?
        } else {
            self.upscale_color(frame)?
        };

        Ok(out.with_index(index))
    }

    fn target_size(&self, frame: &Frame) -> (u32, u32) {
        (frame.width * self.scale, frame.height * self.scale)
    }

    fn check_output(&self, out: &FeatureMap, width: u32, height: u32, channels: usize) -> Result<()> {
        if out.shape() != (height as usize, width as usize, channels) {
            return Err(Error::Inference(format!(
                "{} produced {}x{}x{}, expected {}x{}x{}",
                self.capability.label(),
                out.width,
                out.height,
                out.channels,
                width,
                height,
                channels
            )));
        }
        Ok(())
    }

    fn upscale_luma(&self, frame: &Frame) -> Result<Frame> {
        let (tw, th) = self.target_size(frame);
        let image = bgr_to_ycrcb(frame)?;

        let input = FeatureMap::new(
            frame.height as usize,
            frame.width as usize,
            1,
            image.y.data,
        )?;
        let out = self.capability.infer(&input)?;
        self.check_output(&out, tw, th, 1)?;

        let chroma = match image.chroma {
            Some((cr, cb)) => Some((
                resize_plane(&cr, tw, th, ScaleAlgorithm::Bicubic)?,
                resize_plane(&cb, tw, th, ScaleAlgorithm::Bicubic)?,
            )),
            None => None,
        };

        ycrcb_to_bgr(&YCrCbImage {
            y: Plane::from_data(tw, th, out.data),
            chroma,
        })
    }

    fn upscale_color(&self, frame: Frame) -> Result<Frame> {
        let (tw, th) = self.target_size(&frame);
        let was_gray = frame.color == ColorSpace::Gray;
        let bgr = frame.into_bgr();

        let data = bgr
            .data
            .chunks_exact(3)
            .flat_map(|px| (0..3).map(move |c| px[c] as f32 - EDSR_MEAN[c]))
            .collect();
        let input = FeatureMap::new(bgr.height as usize, bgr.width as usize, 3, data)?;

        let out = self.capability.infer(&input)?;
        self.check_output(&out, tw, th, 3)?;

        let pixels: Vec<u8> = out
            .data
            .chunks_exact(3)
            .flat_map(|px| (0..3).map(move |c| (px[c] + EDSR_MEAN[c]).round().clamp(0.0, 255.0) as u8))
            .collect();
        let upscaled = Frame::from_data(pixels, tw, th, ColorSpace::Bgr);

        if was_gray {
            let y = bgr_to_ycrcb(&upscaled)?.y;
            ycrcb_to_bgr(&YCrCbImage { y, chroma: None })
        } else {
            Ok(upscaled)
        }
    }
}
