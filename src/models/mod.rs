//! Model registry
//!
//! Maps a (model name, scale) pair to the file a super-resolution capability
//! is loaded from and the URL it can be fetched from. The registry never
//! substitutes a different model: an unregistered pair is an error.

mod cache;
mod runtime;

pub use cache::{Fetcher, HttpFetcher, ModelCache};
pub use runtime::{Capability, FeatureMap, TensorLayout, TractCapability};

use crate::config::ModelsConfig;
use crate::error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Supported super-resolution model families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelName {
    /// FSRCNN - Fast & sharp
    Fsrcnn,
    /// EDSR - Ultra quality, slow
    Edsr,
    /// LapSRN - Deep Laplacian reconstruction
    Lapsrn,
    /// ESPCN - Sub-pixel convolution, fastest
    Espcn,
}

impl ModelName {
    pub const ALL: [ModelName; 4] = [
        ModelName::Fsrcnn,
        ModelName::Edsr,
        ModelName::Lapsrn,
        ModelName::Espcn,
    ];

    /// Lowercase identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelName::Fsrcnn => "fsrcnn",
            ModelName::Edsr => "edsr",
            ModelName::Lapsrn => "lapsrn",
            ModelName::Espcn => "espcn",
        }
    }

    /// Human-readable description
    pub fn display_name(&self) -> &'static str {
        match self {
            ModelName::Fsrcnn => "FSRCNN (Fast & Sharp)",
            ModelName::Edsr => "EDSR (Ultra Quality - Slow)",
            ModelName::Lapsrn => "LapSRN (Deep Reconstruction)",
            ModelName::Espcn => "ESPCN (Realtime)",
        }
    }

    /// Does the network operate on luminance only?
    ///
    /// EDSR consumes full mean-shifted BGR; the others take normalized Y and
    /// leave chroma to interpolation.
    pub fn is_luma_only(&self) -> bool {
        !matches!(self, ModelName::Edsr)
    }

    /// Parse a model name, rejecting anything outside the known families
    pub fn parse(name: &str, scale: u32) -> Result<Self> {
        name.parse().map_err(|_| Error::UnknownModel {
            name: name.to_string(),
            scale,
        })
    }
}

impl std::str::FromStr for ModelName {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ModelName::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or(())
    }
}

impl std::fmt::Display for ModelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a model file provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelId {
    SuperResolution { name: ModelName, scale: u32 },
    Colorization,
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelId::SuperResolution { name, scale } => write!(f, "{}_x{}", name, scale),
            ModelId::Colorization => f.write_str("colorizer"),
        }
    }
}

/// Where a model lives locally and where it can be fetched from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub id: ModelId,
    /// Path inside the model cache
    pub path: PathBuf,
    /// Retrieval URL (None = must be provisioned by hand)
    pub url: Option<String>,
}

impl ModelDescriptor {
    /// Scale compiled into a super-resolution model
    pub fn scale(&self) -> Option<u32> {
        match self.id {
            ModelId::SuperResolution { scale, .. } => Some(scale),
            ModelId::Colorization => None,
        }
    }
}

/// Built-in super-resolution models: (name, scale, file, url)
const BUILTIN_MODELS: &[(ModelName, u32, &str, &str)] = &[
    (ModelName::Fsrcnn, 2, "FSRCNN_x2.pb", "https://github.com/Saafke/FSRCNN_Tensorflow/raw/master/models/FSRCNN_x2.pb"),
    (ModelName::Fsrcnn, 3, "FSRCNN_x3.pb", "https://github.com/Saafke/FSRCNN_Tensorflow/raw/master/models/FSRCNN_x3.pb"),
    (ModelName::Fsrcnn, 4, "FSRCNN_x4.pb", "https://github.com/Saafke/FSRCNN_Tensorflow/raw/master/models/FSRCNN_x4.pb"),
    (ModelName::Edsr, 2, "EDSR_x2.pb", "https://github.com/Saafke/EDSR_Tensorflow/raw/master/models/EDSR_x2.pb"),
    (ModelName::Edsr, 3, "EDSR_x3.pb", "https://github.com/Saafke/EDSR_Tensorflow/raw/master/models/EDSR_x3.pb"),
    (ModelName::Edsr, 4, "EDSR_x4.pb", "https://github.com/Saafke/EDSR_Tensorflow/raw/master/models/EDSR_x4.pb"),
    (ModelName::Lapsrn, 2, "LapSRN_x2.pb", "https://github.com/fannymonori/TF-LapSRN/raw/master/export_models/LapSRN_x2.pb"),
    (ModelName::Lapsrn, 4, "LapSRN_x4.pb", "https://github.com/fannymonori/TF-LapSRN/raw/master/export_models/LapSRN_x4.pb"),
    (ModelName::Espcn, 2, "ESPCN_x2.pb", "https://github.com/fannymonori/TF-ESPCN/raw/master/export/ESPCN_x2.pb"),
    (ModelName::Espcn, 3, "ESPCN_x3.pb", "https://github.com/fannymonori/TF-ESPCN/raw/master/export/ESPCN_x3.pb"),
    (ModelName::Espcn, 4, "ESPCN_x4.pb", "https://github.com/fannymonori/TF-ESPCN/raw/master/export/ESPCN_x4.pb"),
];

/// Supported scale factors
pub const SCALES: std::ops::RangeInclusive<u32> = 2..=4;

/// Registry of known models backed by a shared on-disk cache
pub struct ModelRegistry {
    cache: Arc<ModelCache>,
    fetcher: Arc<dyn Fetcher>,
    models: BTreeMap<(ModelName, u32), ModelDescriptor>,
    colorizer: Option<ModelDescriptor>,
}

impl ModelRegistry {
    /// Empty registry over a cache directory
    pub fn empty(cache_dir: impl AsRef<Path>) -> Self {
        Self {
            cache: ModelCache::shared(cache_dir),
            fetcher: Arc::new(HttpFetcher::new()),
            models: BTreeMap::new(),
            colorizer: None,
        }
    }

    /// Registry with the built-in super-resolution models
    pub fn builtin(cache_dir: impl AsRef<Path>) -> Self {
        let mut registry = Self::empty(cache_dir);
        for &(name, scale, file, url) in BUILTIN_MODELS {
            registry.register(name, scale, file, Some(url.to_string()));
        }
        registry
    }

    /// Registry described by configuration: built-ins, extra entries, colorizer
    pub fn from_config(config: &ModelsConfig) -> Result<Self> {
        let mut registry = Self::builtin(&config.cache_dir);
        for entry in &config.extra {
            let name = ModelName::parse(&entry.name, entry.scale)?;
            if !SCALES.contains(&entry.scale) {
                return Err(Error::Config(format!(
                    "Model {} has unsupported scale {}",
                    entry.name, entry.scale
                )));
            }
            registry.register(name, entry.scale, &entry.file, entry.url.clone());
        }
        registry.set_colorizer(&config.colorizer_file, config.colorizer_url.clone());
        Ok(registry)
    }

    /// Replace the fetcher used for downloads
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Register (or replace) the descriptor for a (name, scale) pair
    pub fn register(&mut self, name: ModelName, scale: u32, file: &str, url: Option<String>) {
        let descriptor = ModelDescriptor {
            id: ModelId::SuperResolution { name, scale },
            path: self.cache.root().join(file),
            url,
        };
        self.models.insert((name, scale), descriptor);
    }

    /// Register the colorization model
    pub fn set_colorizer(&mut self, file: &str, url: Option<String>) {
        self.colorizer = Some(ModelDescriptor {
            id: ModelId::Colorization,
            path: self.cache.root().join(file),
            url,
        });
    }

    /// Look up the descriptor for a (name, scale) pair
    pub fn resolve(&self, name: ModelName, scale: u32) -> Result<&ModelDescriptor> {
        self.models
            .get(&(name, scale))
            .ok_or_else(|| Error::UnknownModel {
                name: name.to_string(),
                scale,
            })
    }

    /// Look up by textual name (as received from a caller)
    pub fn resolve_str(&self, name: &str, scale: u32) -> Result<&ModelDescriptor> {
        self.resolve(ModelName::parse(name, scale)?, scale)
    }

    /// Colorization model descriptor
    pub fn colorizer(&self) -> Result<&ModelDescriptor> {
        self.colorizer
            .as_ref()
            .ok_or_else(|| Error::Config("No colorization model registered".into()))
    }

    /// Make sure the model file is present locally, downloading it if needed
    pub fn ensure_local(&self, descriptor: &ModelDescriptor) -> Result<PathBuf> {
        self.cache.ensure_local(descriptor, self.fetcher.as_ref())
    }

    /// All registered super-resolution descriptors
    pub fn descriptors(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.models.values()
    }

    /// Shared cache backing this registry
    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }
}
