//! Inference runtime
//!
//! Stages talk to loaded models through the [`Capability`] trait only; the
//! tract-backed implementation handles graph formats and tensor layouts.

use crate::error::{Error, Result};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tract_onnx::prelude::*;

/// Dense `f32` feature map in height x width x channels order
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMap {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub data: Vec<f32>,
}

impl FeatureMap {
    pub fn new(height: usize, width: usize, channels: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != height * width * channels {
            return Err(Error::Inference(format!(
                "Feature map {}x{}x{} cannot hold {} values",
                height,
                width,
                channels,
                data.len()
            )));
        }
        Ok(Self {
            height,
            width,
            channels,
            data,
        })
    }

    /// Shape as (height, width, channels)
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.height, self.width, self.channels)
    }

    /// Extract one channel as a contiguous plane
    pub fn channel(&self, c: usize) -> Vec<f32> {
        self.data
            .iter()
            .skip(c)
            .step_by(self.channels)
            .copied()
            .collect()
    }
}

/// A loaded model with a single inference contract
pub trait Capability: Send + Sync {
    /// Run the model on one feature map
    fn infer(&self, input: &FeatureMap) -> Result<FeatureMap>;

    /// Short label for logs
    fn label(&self) -> &str;
}

impl<T: Capability + ?Sized> Capability for Arc<T> {
    fn infer(&self, input: &FeatureMap) -> Result<FeatureMap> {
        (**self).infer(input)
    }

    fn label(&self) -> &str {
        (**self).label()
    }
}

/// Tensor layout expected by a graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    /// Batch, channels, height, width (ONNX)
    Nchw,
    /// Batch, height, width, channels (TensorFlow)
    Nhwc,
}

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// tract-backed capability for `.onnx` and TensorFlow `.pb` graphs
///
/// Graphs are optimized lazily for each input shape; frames of a job share
/// one shape so in practice a single plan is built.
pub struct TractCapability {
    label: String,
    model: InferenceModel,
    layout: TensorLayout,
    plans: Mutex<HashMap<(usize, usize, usize), Arc<Plan>>>,
}

impl TractCapability {
    /// Load a model file, picking the parser from its extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        let (model, layout) = match ext.as_deref() {
            Some("onnx") => (
                tract_onnx::onnx()
                    .model_for_path(path)
                    .map_err(|e| load_error(path, e))?,
                TensorLayout::Nchw,
            ),
            Some("pb") => (
                tract_tensorflow::tensorflow()
                    .model_for_path(path)
                    .map_err(|e| load_error(path, e))?,
                TensorLayout::Nhwc,
            ),
            _ => {
                return Err(Error::ModelAcquisition(format!(
                    "Unsupported model format: {}",
                    path.display()
                )))
            }
        };

        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| PathBuf::from(path).display().to_string());

        tracing::info!("Loaded model {} ({:?})", label, layout);

        Ok(Self {
            label,
            model,
            layout,
            plans: Mutex::new(HashMap::new()),
        })
    }

    /// Layout of the graph's input/output tensors
    pub fn layout(&self) -> TensorLayout {
        self.layout
    }

    fn plan_for(&self, shape: (usize, usize, usize)) -> Result<Arc<Plan>> {
        let mut plans = self.plans.lock();
        if let Some(plan) = plans.get(&shape) {
            return Ok(plan.clone());
        }

        let (h, w, c) = shape;
        let dims = match self.layout {
            TensorLayout::Nchw => [1, c, h, w],
            TensorLayout::Nhwc => [1, h, w, c],
        };

        tracing::debug!("Optimizing {} for input {:?}", self.label, dims);

        let plan = self
            .model
            .clone()
            .with_input_fact(0, f32::fact(dims).into())
            .and_then(|m| m.into_optimized())
            .and_then(|m| m.into_runnable())
            .map_err(|e| {
                Error::Inference(format!("{} rejects input {:?}: {}", self.label, dims, e))
            })?;

        let plan = Arc::new(plan);
        plans.insert(shape, plan.clone());
        Ok(plan)
    }

    fn to_tensor(&self, input: &FeatureMap) -> Result<Tensor> {
        let (h, w, c) = input.shape();
        let array = match self.layout {
            TensorLayout::Nhwc => {
                tract_ndarray::Array4::from_shape_vec((1, h, w, c), input.data.clone())
            }
            TensorLayout::Nchw => {
                let mut planar = Vec::with_capacity(input.data.len());
                for ch in 0..c {
                    planar.extend(input.channel(ch));
                }
                tract_ndarray::Array4::from_shape_vec((1, c, h, w), planar)
            }
        }
        .map_err(|e| Error::Inference(e.to_string()))?;

        Ok(array.into())
    }

    fn from_tensor(&self, output: &Tensor) -> Result<FeatureMap> {
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| Error::Inference(format!("{} output: {}", self.label, e)))?;

        let shape = view.shape().to_vec();
        if shape.len() != 4 || shape[0] != 1 {
            return Err(Error::Inference(format!(
                "{} produced tensor of shape {:?}, expected a single 4D image",
                self.label, shape
            )));
        }

        let view = view
            .into_dimensionality::<tract_ndarray::Ix4>()
            .map_err(|e| Error::Inference(e.to_string()))?;
        let (h, w, c) = match self.layout {
            TensorLayout::Nchw => (shape[2], shape[3], shape[1]),
            TensorLayout::Nhwc => (shape[1], shape[2], shape[3]),
        };

        let mut data = Vec::with_capacity(h * w * c);
        for y in 0..h {
            for x in 0..w {
                for ch in 0..c {
                    let v = match self.layout {
                        TensorLayout::Nchw => view[[0, ch, y, x]],
                        TensorLayout::Nhwc => view[[0, y, x, ch]],
                    };
                    data.push(v);
                }
            }
        }

        FeatureMap::new(h, w, c, data)
    }
}

fn load_error(path: &Path, e: impl std::fmt::Display) -> Error {
    Error::ModelAcquisition(format!("Failed to load {}: {}", path.display(), e))
}

impl Capability for TractCapability {
    fn infer(&self, input: &FeatureMap) -> Result<FeatureMap> {
        let plan = self.plan_for(input.shape())?;
        let tensor = self.to_tensor(input)?;

        let outputs = plan
            .run(tvec!(tensor.into()))
            .map_err(|e| Error::Inference(format!("{} failed: {}", self.label, e)))?;

        // Multi-scale graphs (LapSRN) emit intermediate outputs first
        let output = outputs
            .last()
            .ok_or_else(|| Error::Inference(format!("{} produced no output", self.label)))?;

        self.from_tensor(output)
    }

    fn label(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_map_shape_check() {
        assert!(FeatureMap::new(2, 2, 3, vec![0.0; 12]).is_ok());
        assert!(matches!(
            FeatureMap::new(2, 2, 3, vec![0.0; 11]),
            Err(Error::Inference(_))
        ));
    }

    #[test]
    fn test_feature_map_channel() {
        let map = FeatureMap::new(1, 2, 2, vec![1.0, 10.0, 2.0, 20.0]).unwrap();
        assert_eq!(map.channel(0), vec![1.0, 2.0]);
        assert_eq!(map.channel(1), vec![10.0, 20.0]);
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.caffemodel");
        std::fs::write(&path, b"x").unwrap();
        assert!(matches!(
            TractCapability::load(&path),
            Err(Error::ModelAcquisition(_))
        ));
    }

    #[test]
    fn test_corrupt_onnx_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.onnx");
        std::fs::write(&path, b"not a protobuf graph").unwrap();
        assert!(TractCapability::load(&path).is_err());
    }
}
