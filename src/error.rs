//! Error taxonomy shared by every pipeline stage.

use std::{fmt, time::Duration};

use thiserror::Error;

use crate::texture::TextureError;

/// Kind of scene entity referenced by a [`PipelineError::MissingEntity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Object,
    Collection,
    Material,
    Image,
    Mesh,
    ShadingNode,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EntityKind::Object => "Object",
            EntityKind::Collection => "Collection",
            EntityKind::Material => "Material",
            EntityKind::Image => "Image",
            EntityKind::Mesh => "Mesh",
            EntityKind::ShadingNode => "Shading node",
        };
        f.write_str(label)
    }
}

/// Top-level error type for the bake and generation pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A referenced object, collection, material, image or shading node does not exist.
    #[error("{kind} '{name}' not found")]
    MissingEntity { kind: EntityKind, name: String },

    /// The bake operator, the image generator or the host render setup failed.
    #[error("external operation failed: {0}")]
    ExternalOperation(String),

    /// Texture generation did not report completion within its ceiling.
    #[error("texture generation timed out after {waited:?}")]
    Timeout { waited: Duration },

    /// Recorded pipeline state disagrees with the scene it is applied to.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Texture(#[from] TextureError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Encode(#[from] image::ImageError),

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("could not start the generation pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

impl PipelineError {
    pub fn missing(kind: EntityKind, name: impl Into<String>) -> Self {
        PipelineError::MissingEntity {
            kind,
            name: name.into(),
        }
    }

    /// Status code reported by the control surface for this error.
    pub fn status(&self) -> u16 {
        match self {
            PipelineError::MissingEntity { .. } => 404,
            _ => 500,
        }
    }
}

/// Convenience type alias for results using [`PipelineError`].
pub type Result<T> = std::result::Result<T, PipelineError>;
