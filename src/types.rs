//! Common types used throughout RetroHD

use serde::{Deserialize, Serialize};

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Calculate total pixels
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Resolution enlarged by an integer factor
    pub fn scaled(&self, scale: u32) -> Self {
        Self::new(self.width * scale, self.height * scale)
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Framerate representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Framerate {
    pub num: u32,
    pub den: u32,
}

impl Framerate {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    pub const FPS_25: Self = Self::new(25, 1);
    pub const FPS_30: Self = Self::new(30, 1);

    /// Get framerate as f64
    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }

    /// Is this a usable rate (non-zero numerator and denominator)?
    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }
}

impl Default for Framerate {
    fn default() -> Self {
        Self::FPS_25
    }
}

impl std::fmt::Display for Framerate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.den == 1 {
            write!(f, "{} fps", self.num)
        } else {
            write!(f, "{:.2} fps", self.as_f64())
        }
    }
}

/// Colour layout of a frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ColorSpace {
    /// Packed 8-bit B, G, R (device native order)
    #[default]
    Bgr,
    /// Single 8-bit luminance channel
    Gray,
}

impl ColorSpace {
    /// Number of interleaved channels
    pub fn channels(&self) -> usize {
        match self {
            ColorSpace::Bgr => 3,
            ColorSpace::Gray => 1,
        }
    }
}

/// A decoded video frame
///
/// Rows are tightly packed: `data.len() == width * height * channels`.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Raw pixel data
    pub data: Vec<u8>,
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Colour layout
    pub color: ColorSpace,
    /// Position in the source stream (0-based)
    pub index: u64,
}

impl Frame {
    /// Create a black frame
    pub fn new(width: u32, height: u32, color: ColorSpace) -> Self {
        let size = width as usize * height as usize * color.channels();
        Self {
            data: vec![0u8; size],
            width,
            height,
            color,
            index: 0,
        }
    }

    /// Create a frame from existing data
    pub fn from_data(data: Vec<u8>, width: u32, height: u32, color: ColorSpace) -> Self {
        Self {
            data,
            width,
            height,
            color,
            index: 0,
        }
    }

    /// Set the stream position
    pub fn with_index(mut self, index: u64) -> Self {
        self.index = index;
        self
    }

    /// Number of interleaved channels
    pub fn channels(&self) -> usize {
        self.color.channels()
    }

    /// Get resolution
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Bytes the buffer must hold for its dimensions
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels()
    }

    /// Does the buffer length agree with the declared shape?
    pub fn is_consistent(&self) -> bool {
        self.data.len() == self.expected_len()
    }

    /// Convert to packed BGR, replicating luminance for grayscale frames
    pub fn into_bgr(self) -> Frame {
        match self.color {
            ColorSpace::Bgr => self,
            ColorSpace::Gray => {
                let data = self.data.iter().flat_map(|&v| [v, v, v]).collect();
                Frame {
                    data,
                    color: ColorSpace::Bgr,
                    ..self
                }
            }
        }
    }
}

/// Properties of an opened video source
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceInfo {
    /// Frame dimensions
    pub resolution: Resolution,
    /// Source framerate
    pub framerate: Framerate,
    /// Total frames, if the container reports it (never for live streams)
    pub total_frames: Option<u64>,
}

/// File job progress, pushed at every frame boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Frames written to the sink
    pub completed: u64,
    /// Total frames, if known
    pub total: Option<u64>,
}

impl Progress {
    /// Completion ratio in 0..=1, if the total is known
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(total) if total > 0 => Some((self.completed as f64 / total as f64).min(1.0)),
            _ => None,
        }
    }
}
