//! Pipeline configuration, loadable from TOML.
//!
//! Every field has a default matching the reference pipeline, so an empty
//! document (or no document at all) yields a working configuration:
//!
//! ```toml
//! [bake]
//! image_size = 1024
//! output_dir = "out/segmentation_maps"
//!
//! [queue]
//! timeout = 120.0
//! ```

use std::{fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Render back-end the bake operator runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderEngine {
    Cycles,
    Eevee,
}

/// Compute device requested for baking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeDevice {
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BakeConfig {
    /// Side length of every segmentation-map image.
    pub image_size: u32,
    /// Bleed in texels around each baked face.
    pub margin: u32,
    pub render_engine: Option<RenderEngine>,
    pub device: ComputeDevice,
    /// Directory baked segmentation maps are written to.
    pub output_dir: PathBuf,
    /// Distance under which vertices are welded before an object without
    /// materials is unwrapped.
    pub merge_threshold: f32,
}

impl Default for BakeConfig {
    fn default() -> Self {
        Self {
            image_size: 512,
            margin: 0,
            render_engine: Some(RenderEngine::Cycles),
            device: ComputeDevice::Gpu,
            output_dir: PathBuf::from("segmentation_maps"),
            merge_threshold: 0.0001,
        }
    }
}

/// Parameters forwarded to the external image generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub model: String,
    pub seamless_axes: String,
    pub negative_prompt: String,
    pub seed: u64,
    pub steps: u32,
    pub cfg_scale: f32,
    pub scheduler: String,
    pub width: u32,
    pub height: u32,
    /// Control-net model used when a segmentation map conditions the request.
    pub control_net: String,
    pub conditioning_scale: f32,
    /// Prompt used when a segmentation map exists for the task.
    pub conditioned_prompt: String,
    /// Prompt used when no segmentation map exists for the task.
    pub unconditioned_prompt: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: "v1-5-pruned-emaonly".into(),
            seamless_axes: "xy".into(),
            negative_prompt: " ".into(),
            seed: 1_902_589_880,
            steps: 15,
            cfg_scale: 7.0,
            scheduler: "KDPM2 Ancestral Discrete".into(),
            width: 768,
            height: 768,
            control_net: "models--lllyasviel--control_v11p_sd15_seg".into(),
            conditioning_scale: 5.0,
            conditioned_prompt: "a (realistic:1.0) style texture, (concrete: 0.2), (damaged: 1.0), \
                                 (wood:0.8), octane render, unreal engine, redshift render"
                .into(),
            unconditioned_prompt: "a (realistic:1.0) style texture, (small texture:0.5), \
                                   (wood texture:0.5), (old:0.5), octane render, unreal engine, \
                                   redshift render"
                .into(),
        }
    }
}

/// Cadence and ceiling of a bounded polling loop, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub poll_interval: f32,
    pub timeout: f32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_interval: 0.5,
            timeout: 60.0,
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f32(self.poll_interval.max(f32::EPSILON))
    }

    pub fn ceiling(&self) -> Duration {
        Duration::from_secs_f32(self.timeout.max(0.0))
    }
}

/// Names of the collections the segmentation driver walks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionNames {
    pub imported: String,
    pub tileable: String,
}

impl Default for CollectionNames {
    fn default() -> Self {
        Self {
            imported: "Imported Objects".into(),
            tileable: "Tileable Objects".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub bake: BakeConfig,
    pub generation: GenerationConfig,
    pub queue: PollConfig,
    pub control: PollConfig,
    pub collections: CollectionNames,
    /// Appended to the display name of every temporary material.
    pub temporary_suffix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bake: BakeConfig::default(),
            generation: GenerationConfig::default(),
            queue: PollConfig::default(),
            control: PollConfig::default(),
            collections: CollectionNames::default(),
            temporary_suffix: "_new".into(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Reads a TOML file; missing keys keep their defaults.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let content = fs::read_to_string(path.into())?;
        Self::from_toml_str(&content)
    }
}
