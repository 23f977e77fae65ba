//! Frame processing module
//!
//! Numeric helpers shared by the pipeline stages:
//! - Float plane resizing
//! - BGR <-> YCrCb conversion (super-resolution luma path)
//! - BGR <-> CIE L*a*b* conversion (colorization working space)

mod convert;
mod scale;

pub use convert::{bgr_to_lab, bgr_to_ycrcb, lab_to_bgr, ycrcb_to_bgr, LabImage, YCrCbImage};
pub use scale::{resize_plane, ScaleAlgorithm};

/// A single channel of `f32` samples, row-major
#[derive(Debug, Clone, PartialEq)]
pub struct Plane {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl Plane {
    /// Create a plane filled with one value
    pub fn filled(width: u32, height: u32, value: f32) -> Self {
        Self {
            width,
            height,
            data: vec![value; width as usize * height as usize],
        }
    }

    /// Create a plane from existing samples
    pub fn from_data(width: u32, height: u32, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), width as usize * height as usize);
        Self {
            width,
            height,
            data,
        }
    }

    /// Sample at (x, y)
    pub fn at(&self, x: u32, y: u32) -> f32 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    /// Apply a function to every sample
    pub fn map(mut self, f: impl Fn(f32) -> f32) -> Self {
        self.data.iter_mut().for_each(|v| *v = f(*v));
        self
    }
}
