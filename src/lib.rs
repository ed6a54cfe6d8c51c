//! `bevy_island_bake`: segmentation-map baking and texture generation for
//! scenes of imported meshes.
//!
//! # Architecture
//! A mesh's faces are grouped into islands ([`islands::detect_islands`]) over
//! its [`mesh::FaceGraph`].  The materializer swaps in temporary flat-coloured
//! materials, one per material slot or per island, and the bake orchestrator
//! bakes them into segmentation maps through a [`bake::RenderHost`], then puts
//! the original materials back.
//!
//! Texture generation runs as a single-flight queue
//! ([`queue::TextureQueue`]) inside the [`TexturePipeline`] resource.  Each
//! material slot becomes one request to a [`generator::GenerationBackend`],
//! conditioned on its segmentation map when one exists; results are wired
//! into the material's base colour.  [`IslandBakePlugin`] polls the queue and
//! serves the [`control`] surface every frame.
//!
//! # Usage
//! ```rust,ignore
//! let backend = PooledGenerator::new(ProceduralGenerator::default())?;
//! let (surface, handle) = ControlSurface::new(config.control);
//! App::new()
//!     .add_plugins((MinimalPlugins, IslandBakePlugin))
//!     .insert_resource(TexturePipeline::new(scene, config, backend))
//!     .insert_resource(surface);
//! // Elsewhere: handle.send(Request::post("/generate_texture"))
//! ```

pub mod bake;
pub mod config;
pub mod control;
pub mod error;
pub mod generator;
pub mod islands;
pub mod materializer;
pub mod mesh;
pub mod noise;
pub mod normal;
pub mod pipeline;
pub mod queue;
pub mod scene;
pub mod shading;
pub mod texture;

pub use bake::{RenderHost, SoftwareBaker, run_segmentation};
pub use config::PipelineConfig;
pub use control::{ControlHandle, ControlSurface, Request, Response};
pub use error::{PipelineError, Result};
pub use generator::{GenerationBackend, ImageGenerator, PooledGenerator, ProceduralGenerator};
pub use islands::{Island, detect_islands};
pub use pipeline::{RunStatus, TexturePipeline};
pub use scene::Scene;
pub use texture::{TextureError, TextureMap};

use bevy::prelude::*;

/// Bevy plugin. Registers the control-surface and queue-polling systems.
///
/// Both systems idle until the app inserts a [`TexturePipeline`] (and, for
/// the control surface, a [`ControlSurface`]).
pub struct IslandBakePlugin;

impl Plugin for IslandBakePlugin {
    fn build(&self, app: &mut App) {
        app.add_systems(
            Update,
            (
                control::serve_control_requests
                    .run_if(resource_exists::<ControlSurface>)
                    .run_if(resource_exists::<TexturePipeline>),
                queue::poll_generation_queue.run_if(resource_exists::<TexturePipeline>),
            )
                .chain(),
        );
    }
}
