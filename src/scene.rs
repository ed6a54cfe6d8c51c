//! Arena owning every object, material, image and collection of a scene.
//!
//! Entities reference each other through generational keys, so the pipeline
//! can add and remove temporary materials and images while other stages hold
//! ids.  Names are unique per entity kind; clashes get a `.001`-style suffix
//! the way the host application names its data blocks.

use std::path::PathBuf;

use bevy::image::Image;
use serde::Serialize;
use slotmap::{Key, SlotMap};

use crate::{
    config::{ComputeDevice, RenderEngine},
    error::{EntityKind, PipelineError, Result},
    mesh::PolyMesh,
    shading::Material,
};

slotmap::new_key_type! {
    /// Unique identifier for an object in the scene.
    pub struct ObjectId;
    /// Unique identifier for a material in the scene.
    pub struct MaterialId;
    /// Unique identifier for an image in the scene.
    pub struct ImageId;
}

/// Stable numeric id reported to control-surface clients.
pub fn external_id(key: impl Key) -> u64 {
    key.data().as_ffi()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectKind {
    Mesh,
    Empty,
    Camera,
    Light,
}

#[derive(Debug, Clone)]
pub struct SceneObject {
    pub name: String,
    pub kind: ObjectKind,
    pub mesh: Option<PolyMesh>,
    pub material_slots: Vec<Option<MaterialId>>,
}

impl SceneObject {
    pub fn new(name: impl Into<String>, kind: ObjectKind) -> Self {
        Self {
            name: name.into(),
            kind,
            mesh: None,
            material_slots: Vec::new(),
        }
    }

    pub fn with_mesh(name: impl Into<String>, mesh: PolyMesh) -> Self {
        Self {
            mesh: Some(mesh),
            ..Self::new(name, ObjectKind::Mesh)
        }
    }

    pub fn is_mesh(&self) -> bool {
        self.kind == ObjectKind::Mesh && self.mesh.is_some()
    }

    /// Materials bound to the object's slots, skipping empty slots.
    pub fn materials(&self) -> impl Iterator<Item = MaterialId> + '_ {
        self.material_slots.iter().flatten().copied()
    }
}

/// An image data block plus the bookkeeping the host keeps for it.
#[derive(Debug, Clone)]
pub struct SceneImage {
    pub name: String,
    pub image: Image,
    /// Where the image was last written to disk.
    pub filepath: Option<PathBuf>,
    /// Whether the pixels are embedded in the scene rather than referenced.
    pub packed: bool,
}

impl SceneImage {
    pub fn new(name: impl Into<String>, image: Image) -> Self {
        Self {
            name: name.into(),
            image,
            filepath: None,
            packed: false,
        }
    }

    /// A 1×1 image, for data blocks whose pixels do not matter.
    pub fn placeholder(name: impl Into<String>) -> Self {
        Self::new(name, Image::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    pub name: String,
    pub objects: Vec<ObjectId>,
}

/// Bake pass configuration handed to the bake operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BakePass {
    pub use_pass_direct: bool,
    pub use_pass_indirect: bool,
    /// Clear the target before baking.
    pub use_clear: bool,
    pub margin: u32,
    /// Write results into image data blocks rather than vertex colours.
    pub save_external: bool,
}

impl Default for BakePass {
    fn default() -> Self {
        Self {
            use_pass_direct: true,
            use_pass_indirect: true,
            use_clear: true,
            margin: 16,
            save_external: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderSettings {
    pub engine: Option<RenderEngine>,
    pub device: ComputeDevice,
    pub bake: BakePass,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            engine: Some(RenderEngine::Eevee),
            device: ComputeDevice::Cpu,
            bake: BakePass::default(),
        }
    }
}

/// What [`Scene::purge_orphans`] removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgedOrphans {
    pub materials: usize,
    pub images: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Scene {
    /// Version string of the host application.
    pub version: String,
    pub render: RenderSettings,
    objects: SlotMap<ObjectId, SceneObject>,
    materials: SlotMap<MaterialId, Material>,
    images: SlotMap<ImageId, SceneImage>,
    collections: Vec<Collection>,
}

impl Scene {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..Self::default()
        }
    }

    // --- Objects ---

    /// Adds `object`, renaming it when its name is taken.
    pub fn add_object(&mut self, mut object: SceneObject) -> ObjectId {
        object.name = unique_name(&object.name, |n| self.object_by_name(n).is_some());
        self.objects.insert(object)
    }

    /// The object behind `id`, if it still exists.
    pub fn object(&self, id: ObjectId) -> Option<&SceneObject> {
        self.objects.get(id)
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut SceneObject> {
        self.objects.get_mut(id)
    }

    /// Like [`Scene::object`], but a missing object is an error.
    pub fn try_object(&self, id: ObjectId) -> Result<&SceneObject> {
        self.objects
            .get(id)
            .ok_or_else(|| PipelineError::missing(EntityKind::Object, format!("{id:?}")))
    }

    /// Like [`Scene::object_mut`], but a missing object is an error.
    pub fn try_object_mut(&mut self, id: ObjectId) -> Result<&mut SceneObject> {
        self.objects
            .get_mut(id)
            .ok_or_else(|| PipelineError::missing(EntityKind::Object, format!("{id:?}")))
    }

    /// Id of the object named exactly `name`.
    pub fn object_by_name(&self, name: &str) -> Option<ObjectId> {
        self.objects
            .iter()
            .find_map(|(id, o)| (o.name == name).then_some(id))
    }

    /// Every object with its id, in insertion order.
    pub fn objects(&self) -> impl Iterator<Item = (ObjectId, &SceneObject)> {
        self.objects.iter()
    }

    /// Snapshot of object ids, for loops that mutate the scene.
    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.objects.keys().collect()
    }

    /// Appends a material slot bound to `material`.
    pub fn append_material(&mut self, object: ObjectId, material: MaterialId) -> Result<usize> {
        let object = self.try_object_mut(object)?;
        object.material_slots.push(Some(material));
        Ok(object.material_slots.len() - 1)
    }

    // --- Materials ---

    /// Adds `material`, renaming it when its name is taken.
    pub fn add_material(&mut self, mut material: Material) -> MaterialId {
        material.name = unique_name(&material.name, |n| self.material_by_name(n).is_some());
        self.materials.insert(material)
    }

    /// The material behind `id`, if it still exists.
    pub fn material(&self, id: MaterialId) -> Option<&Material> {
        self.materials.get(id)
    }

    pub fn material_mut(&mut self, id: MaterialId) -> Option<&mut Material> {
        self.materials.get_mut(id)
    }

    /// Like [`Scene::material_mut`], but a missing material is an error.
    pub fn try_material_mut(&mut self, id: MaterialId) -> Result<&mut Material> {
        self.materials
            .get_mut(id)
            .ok_or_else(|| PipelineError::missing(EntityKind::Material, format!("{id:?}")))
    }

    /// Id of the material named exactly `name`.
    pub fn material_by_name(&self, name: &str) -> Option<MaterialId> {
        self.materials
            .iter()
            .find_map(|(id, m)| (m.name == name).then_some(id))
    }

    pub fn materials(&self) -> impl Iterator<Item = (MaterialId, &Material)> {
        self.materials.iter()
    }

    /// Deletes a material; slots still bound to it dangle until rebound.
    pub fn remove_material(&mut self, id: MaterialId) -> Option<Material> {
        self.materials.remove(id)
    }

    /// Number of material slots, across all objects, bound to `material`.
    pub fn material_users(&self, material: MaterialId) -> usize {
        self.objects
            .values()
            .flat_map(|o| o.material_slots.iter())
            .filter(|slot| **slot == Some(material))
            .count()
    }

    /// Removes materials bound to no slot, then images no material node
    /// references.
    pub fn purge_orphans(&mut self) -> PurgedOrphans {
        let materials: Vec<MaterialId> = self
            .materials
            .keys()
            .filter(|&id| self.material_users(id) == 0)
            .collect();
        for &id in &materials {
            self.materials.remove(id);
        }
        let images: Vec<ImageId> = self
            .images
            .keys()
            .filter(|&id| self.image_users(id) == 0)
            .collect();
        for &id in &images {
            self.images.remove(id);
        }
        PurgedOrphans {
            materials: materials.len(),
            images: images.len(),
        }
    }

    // --- Images ---

    /// Adds an image data block, renaming it when its name is taken.
    pub fn add_image(&mut self, name: impl Into<String>, image: Image) -> ImageId {
        let name = unique_name(&name.into(), |n| self.image_by_name(n).is_some());
        self.images.insert(SceneImage::new(name, image))
    }

    pub fn image(&self, id: ImageId) -> Option<&SceneImage> {
        self.images.get(id)
    }

    pub fn image_mut(&mut self, id: ImageId) -> Option<&mut SceneImage> {
        self.images.get_mut(id)
    }

    /// Id of the image named exactly `name`.
    pub fn image_by_name(&self, name: &str) -> Option<ImageId> {
        self.images
            .iter()
            .find_map(|(id, i)| (i.name == name).then_some(id))
    }

    /// Every image with its id, in insertion order.
    pub fn images(&self) -> impl Iterator<Item = (ImageId, &SceneImage)> {
        self.images.iter()
    }

    pub fn remove_image(&mut self, id: ImageId) -> Option<SceneImage> {
        self.images.remove(id)
    }

    /// Number of image nodes, across all materials, sampling `image`.
    pub fn image_users(&self, image: ImageId) -> usize {
        self.materials
            .values()
            .flat_map(|m| m.shading.image_nodes())
            .filter(|(_, node)| node.image == Some(image))
            .count()
    }

    // --- Collections ---

    /// Returns the collection named `name`, creating it when absent.
    pub fn ensure_collection(&mut self, name: &str) -> &mut Collection {
        let index = match self.collections.iter().position(|c| c.name == name) {
            Some(index) => index,
            None => {
                self.collections.push(Collection {
                    name: name.to_owned(),
                    objects: Vec::new(),
                });
                self.collections.len() - 1
            }
        };
        &mut self.collections[index]
    }

    /// Links `object` into `collection`, unlinking it from every other one.
    pub fn move_to_collection(&mut self, object: ObjectId, collection: &str) {
        for c in &mut self.collections {
            c.objects.retain(|o| *o != object);
        }
        self.ensure_collection(collection).objects.push(object);
    }

    /// The collection named `name`.
    pub fn collection(&self, name: &str) -> Option<&Collection> {
        self.collections.iter().find(|c| c.name == name)
    }

    /// Every collection, in creation order.
    pub fn collections(&self) -> &[Collection] {
        &self.collections
    }
}

/// `base`, or `base.001`, `base.002`, … whichever is free first.
fn unique_name(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_owned();
    }
    (1..)
        .map(|n| format!("{base}.{n:03}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| base.to_owned())
}
