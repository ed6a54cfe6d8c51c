//! Materials and their node-based shading networks.
//!
//! A network exposes typed accessors for the inputs the pipeline drives
//! (base colour, metallic, roughness, normal) instead of looking nodes up by
//! display name.  A network without a principled surface node has none of
//! those inputs; callers treat that as a soft failure for the material.

use bevy::color::LinearRgba;

use crate::{
    error::{EntityKind, PipelineError, Result},
    scene::ImageId,
};

/// Index of an image-texture node within its network.
pub type NodeId = usize;

/// A shader input with an unlinked default and an optional incoming link.
#[derive(Debug, Clone, PartialEq)]
pub struct SocketInput<T> {
    pub default_value: T,
    pub link: Option<NodeId>,
}

impl<T> SocketInput<T> {
    pub fn new(default_value: T) -> Self {
        Self {
            default_value,
            link: None,
        }
    }

    pub fn is_linked(&self) -> bool {
        self.link.is_some()
    }
}

/// The surface node every baked or generated texture is wired into.
#[derive(Debug, Clone, PartialEq)]
pub struct PrincipledBsdf {
    pub base_color: SocketInput<LinearRgba>,
    pub metallic: SocketInput<f32>,
    pub roughness: SocketInput<f32>,
    pub normal: Option<NodeId>,
}

impl Default for PrincipledBsdf {
    fn default() -> Self {
        Self {
            base_color: SocketInput::new(LinearRgba::new(0.8, 0.8, 0.8, 1.0)),
            metallic: SocketInput::new(0.0),
            roughness: SocketInput::new(0.5),
            normal: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorSpace {
    #[default]
    Srgb,
    NonColor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTextureNode {
    pub label: String,
    pub image: Option<ImageId>,
    pub color_space: ColorSpace,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShadingNetwork {
    image_nodes: Vec<ImageTextureNode>,
    principled: Option<PrincipledBsdf>,
    active: Option<NodeId>,
}

impl Default for ShadingNetwork {
    fn default() -> Self {
        Self {
            image_nodes: Vec::new(),
            principled: Some(PrincipledBsdf::default()),
            active: None,
        }
    }
}

impl ShadingNetwork {
    /// A network holding no surface node.
    pub fn bare() -> Self {
        Self {
            principled: None,
            ..Self::default()
        }
    }

    pub fn principled(&self) -> Option<&PrincipledBsdf> {
        self.principled.as_ref()
    }

    pub fn base_color_input(&self) -> Option<&SocketInput<LinearRgba>> {
        self.principled.as_ref().map(|p| &p.base_color)
    }

    pub fn base_color_input_mut(&mut self) -> Option<&mut SocketInput<LinearRgba>> {
        self.principled.as_mut().map(|p| &mut p.base_color)
    }

    pub fn metallic_input(&self) -> Option<&SocketInput<f32>> {
        self.principled.as_ref().map(|p| &p.metallic)
    }

    pub fn metallic_input_mut(&mut self) -> Option<&mut SocketInput<f32>> {
        self.principled.as_mut().map(|p| &mut p.metallic)
    }

    pub fn roughness_input(&self) -> Option<&SocketInput<f32>> {
        self.principled.as_ref().map(|p| &p.roughness)
    }

    /// Adds an image-texture node and makes it the active node.
    pub fn add_image_node(&mut self, image: ImageId, label: impl Into<String>) -> NodeId {
        self.image_nodes.push(ImageTextureNode {
            label: label.into(),
            image: Some(image),
            color_space: ColorSpace::Srgb,
        });
        let id = self.image_nodes.len() - 1;
        self.active = Some(id);
        id
    }

    pub fn image_node(&self, node: NodeId) -> Option<&ImageTextureNode> {
        self.image_nodes.get(node)
    }

    pub fn image_node_mut(&mut self, node: NodeId) -> Option<&mut ImageTextureNode> {
        self.image_nodes.get_mut(node)
    }

    pub fn image_nodes(&self) -> impl Iterator<Item = (NodeId, &ImageTextureNode)> {
        self.image_nodes.iter().enumerate()
    }

    /// First node sampling `image`.
    pub fn find_image_node(&self, image: ImageId) -> Option<NodeId> {
        self.image_nodes.iter().position(|n| n.image == Some(image))
    }

    /// Image of the active node: the target a bake writes into.
    pub fn active_image(&self) -> Option<ImageId> {
        self.active
            .and_then(|node| self.image_nodes.get(node))
            .and_then(|node| node.image)
    }

    /// Image currently driving the base colour, if any.
    pub fn base_color_image(&self) -> Option<ImageId> {
        self.base_color_input()
            .and_then(|input| input.link)
            .and_then(|node| self.image_nodes.get(node))
            .and_then(|node| node.image)
    }

    /// Image currently driving metallic, if any.
    pub fn metallic_image(&self) -> Option<ImageId> {
        self.metallic_input()
            .and_then(|input| input.link)
            .and_then(|node| self.image_nodes.get(node))
            .and_then(|node| node.image)
    }

    pub fn link_base_color(&mut self, node: NodeId) -> Result<()> {
        self.check_node(node)?;
        let input = self.base_color_input_mut().ok_or_else(missing_surface)?;
        input.link = Some(node);
        Ok(())
    }

    pub fn link_metallic(&mut self, node: NodeId) -> Result<()> {
        self.check_node(node)?;
        let input = self.metallic_input_mut().ok_or_else(missing_surface)?;
        input.link = Some(node);
        Ok(())
    }

    /// Removes the metallic link, returning the node it came from.
    pub fn unlink_metallic(&mut self) -> Option<NodeId> {
        self.metallic_input_mut().and_then(|input| input.link.take())
    }

    pub fn link_normal(&mut self, node: NodeId) -> Result<()> {
        self.check_node(node)?;
        let principled = self.principled.as_mut().ok_or_else(missing_surface)?;
        principled.normal = Some(node);
        if let Some(image_node) = self.image_nodes.get_mut(node) {
            image_node.color_space = ColorSpace::NonColor;
        }
        Ok(())
    }

    fn check_node(&self, node: NodeId) -> Result<()> {
        if node < self.image_nodes.len() {
            Ok(())
        } else {
            Err(PipelineError::missing(
                EntityKind::ShadingNode,
                format!("image texture #{node}"),
            ))
        }
    }
}

fn missing_surface() -> PipelineError {
    PipelineError::missing(EntityKind::ShadingNode, "Principled BSDF")
}

/// Marks a material the pipeline created for one bake pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporaryTag {
    /// Name of the original material this one stands in for; `None` when it
    /// stands in for no material and is simply dropped on restoration.
    pub restoration_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub name: String,
    pub temporary: Option<TemporaryTag>,
    pub shading: ShadingNetwork,
    /// Viewport display scalars.
    pub diffuse_color: LinearRgba,
    pub metallic: f32,
    pub roughness: f32,
}

impl Material {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            temporary: None,
            shading: ShadingNetwork::default(),
            diffuse_color: LinearRgba::new(0.8, 0.8, 0.8, 1.0),
            metallic: 0.0,
            roughness: 0.4,
        }
    }

    /// Temporary stand-in for the material named `restoration_key`.
    pub fn temporary(name: impl Into<String>, restoration_key: impl Into<String>) -> Self {
        Self {
            temporary: Some(TemporaryTag {
                restoration_key: Some(restoration_key.into()),
            }),
            ..Self::new(name)
        }
    }

    /// Temporary material with no original behind it.
    pub fn scratch(name: impl Into<String>) -> Self {
        Self {
            temporary: Some(TemporaryTag {
                restoration_key: None,
            }),
            ..Self::new(name)
        }
    }

    pub fn with_shading(mut self, shading: ShadingNetwork) -> Self {
        self.shading = shading;
        self
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary.is_some()
    }

    pub fn restoration_key(&self) -> Option<&str> {
        self.temporary
            .as_ref()
            .and_then(|t| t.restoration_key.as_deref())
    }

    /// Flat colour the surface shows when its base colour is unlinked.
    pub fn surface_color(&self) -> Option<LinearRgba> {
        self.shading.base_color_input().map(|input| input.default_value)
    }
}

#[cfg(test)]
mod tests {
    use slotmap::SlotMap;

    use super::*;
    use crate::scene::SceneImage;

    fn image_ids(n: usize) -> Vec<ImageId> {
        let mut images: SlotMap<ImageId, SceneImage> = SlotMap::with_key();
        (0..n)
            .map(|i| images.insert(SceneImage::placeholder(format!("img{i}"))))
            .collect()
    }

    #[test]
    fn newest_image_node_becomes_bake_target() {
        let ids = image_ids(2);
        let mut net = ShadingNetwork::default();
        net.add_image_node(ids[0], "first");
        assert_eq!(net.active_image(), Some(ids[0]));
        net.add_image_node(ids[1], "second");
        assert_eq!(net.active_image(), Some(ids[1]));
        assert_eq!(net.find_image_node(ids[0]), Some(0));
    }

    #[test]
    fn linking_base_color_requires_a_surface_node() {
        let ids = image_ids(1);
        let mut bare = ShadingNetwork::bare();
        let node = bare.add_image_node(ids[0], "tex");
        let err = bare.link_base_color(node).unwrap_err();
        assert_eq!(err.status(), 404);

        let mut net = ShadingNetwork::default();
        let node = net.add_image_node(ids[0], "tex");
        net.link_base_color(node).unwrap();
        assert_eq!(net.base_color_image(), Some(ids[0]));
    }

    #[test]
    fn metallic_round_trips_through_unlink() {
        let ids = image_ids(1);
        let mut net = ShadingNetwork::default();
        let node = net.add_image_node(ids[0], "metal");
        net.link_metallic(node).unwrap();
        assert_eq!(net.metallic_image(), Some(ids[0]));
        assert_eq!(net.unlink_metallic(), Some(node));
        assert!(!net.metallic_input().unwrap().is_linked());
        assert_eq!(net.unlink_metallic(), None);
    }

    #[test]
    fn normal_link_switches_node_to_non_color() {
        let ids = image_ids(1);
        let mut net = ShadingNetwork::default();
        let node = net.add_image_node(ids[0], "normal");
        net.link_normal(node).unwrap();
        assert_eq!(net.principled().unwrap().normal, Some(node));
        assert_eq!(net.image_node(node).unwrap().color_space, ColorSpace::NonColor);
    }

    #[test]
    fn temporary_tag_carries_restoration_key() {
        let temp = Material::temporary("Wood_new", "Wood");
        assert!(temp.is_temporary());
        assert_eq!(temp.restoration_key(), Some("Wood"));
        assert!(!Material::new("Wood").is_temporary());

        let scratch = Material::scratch("Island_Crate_0_new");
        assert!(scratch.is_temporary());
        assert_eq!(scratch.restoration_key(), None);
    }
}
