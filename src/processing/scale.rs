//! Plane scaling

use super::Plane;
use crate::error::{Error, Result};

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma};

/// Scaling algorithm
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScaleAlgorithm {
    /// Nearest neighbor (fastest, pixelated)
    Nearest,
    /// Bilinear (fast, smooth)
    #[default]
    Bilinear,
    /// Bicubic (balanced)
    Bicubic,
    /// Lanczos (best quality, slowest)
    Lanczos,
}

impl ScaleAlgorithm {
    fn filter(&self) -> FilterType {
        match self {
            ScaleAlgorithm::Nearest => FilterType::Nearest,
            ScaleAlgorithm::Bilinear => FilterType::Triangle,
            ScaleAlgorithm::Bicubic => FilterType::CatmullRom,
            ScaleAlgorithm::Lanczos => FilterType::Lanczos3,
        }
    }
}

/// Resize a float plane to `dst_width x dst_height`
///
/// `image` clamps float samples to 0..=1 while filtering, so samples are
/// mapped into that range from the plane's own min/max and back afterwards.
/// Overshoot from the filter kernel is clipped to the source range.
pub fn resize_plane(
    plane: &Plane,
    dst_width: u32,
    dst_height: u32,
    algorithm: ScaleAlgorithm,
) -> Result<Plane> {
    if dst_width == 0 || dst_height == 0 || plane.width == 0 || plane.height == 0 {
        return Err(Error::Inference(format!(
            "Cannot resize {}x{} plane to {}x{}",
            plane.width, plane.height, dst_width, dst_height
        )));
    }

    if plane.width == dst_width && plane.height == dst_height {
        return Ok(plane.clone());
    }

    let (lo, hi) = plane
        .data
        .iter()
        .fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let span = hi - lo;
    if !span.is_finite() || span < f32::EPSILON {
        return Ok(Plane::filled(dst_width, dst_height, lo));
    }

    let normalized: Vec<f32> = plane.data.iter().map(|v| (v - lo) / span).collect();
    let img = ImageBuffer::<Luma<f32>, Vec<f32>>::from_raw(plane.width, plane.height, normalized)
        .ok_or_else(|| Error::Inference("Plane buffer too small".into()))?;

    let resized = imageops::resize(&img, dst_width, dst_height, algorithm.filter());
    let data = resized.into_raw().into_iter().map(|v| v * span + lo).collect();

    Ok(Plane::from_data(dst_width, dst_height, data))
}
