//! Temporary materials and target images for one object's bake.
//!
//! An object with several materials gets one temporary stand-in per
//! material slot, swapped into the slot in place ("multiple" mode).  An
//! object with a single material gets one temporary material per island,
//! all baking into one shared image ("single" mode).  Each stand-in shows a
//! random flat colour so the resulting segmentation map tells regions apart.
//!
//! Everything needed to undo the swap is captured first in a
//! [`MaterialSnapshot`].

use bevy::{
    color::LinearRgba,
    log::{debug, info, warn},
};
use rand::Rng;

use crate::{
    config::PipelineConfig,
    error::{EntityKind, PipelineError, Result},
    islands::{Island, detect_islands},
    mesh::FaceSource,
    scene::{ImageId, MaterialId, ObjectId, Scene},
    shading::Material,
    texture::blank_image,
};

/// Name of the segmentation map baked for slot/target `index` (1-based).
pub fn segmentation_map_name(object: &str, index: usize) -> String {
    format!("{object}_{index}_T_SegmentationMap")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BakeMode {
    /// One shared target image, one temporary material per island.
    Single,
    /// One target image and temporary material per material slot.
    Multiple,
}

/// Slot bindings and per-face material indices before the swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterialSnapshot {
    pub object: ObjectId,
    pub slots: Vec<Option<MaterialId>>,
    pub face_materials: Vec<usize>,
}

impl MaterialSnapshot {
    pub fn capture(scene: &Scene, object: ObjectId) -> Result<Self> {
        let obj = scene.try_object(object)?;
        Ok(Self {
            object,
            slots: obj.material_slots.clone(),
            face_materials: obj
                .mesh
                .as_ref()
                .map(|m| m.material_indices())
                .unwrap_or_default(),
        })
    }
}

/// One image the bake operator fills.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BakeTarget {
    /// 1-based index used in file and image names.
    pub index: usize,
    pub image: ImageId,
    /// Temporary materials whose faces bake into `image`.
    pub materials: Vec<MaterialId>,
}

#[derive(Debug, Clone)]
pub struct BakePlan {
    pub object: ObjectId,
    pub mode: BakeMode,
    pub islands: Vec<Island>,
    pub targets: Vec<BakeTarget>,
    pub snapshot: MaterialSnapshot,
}

/// Gives a material-less object a default original material.
///
/// Returns the new material, or `None` when the object already had slots.
pub fn ensure_material(scene: &mut Scene, object: ObjectId) -> Result<Option<MaterialId>> {
    let obj = scene.try_object(object)?;
    if !obj.material_slots.is_empty() {
        return Ok(None);
    }
    let name = format!("Material_{}", obj.name);
    let material = scene.add_material(Material::new(name));
    scene.append_material(object, material)?;
    info!("[SEGMENTATION] Created default material for {object:?}");
    Ok(Some(material))
}

/// Independent uniform draw per colour component.
pub fn random_color(rng: &mut impl Rng) -> LinearRgba {
    LinearRgba::new(
        rng.random::<f32>(),
        rng.random::<f32>(),
        rng.random::<f32>(),
        rng.random::<f32>(),
    )
}

/// Inserts temporary materials and target images for `object`.
pub fn materialize(
    scene: &mut Scene,
    object: ObjectId,
    config: &PipelineConfig,
    rng: &mut impl Rng,
) -> Result<BakePlan> {
    if !scene.try_object(object)?.is_mesh() {
        let name = scene.try_object(object)?.name.clone();
        return Err(PipelineError::missing(EntityKind::Mesh, name));
    }
    ensure_material(scene, object)?;

    let snapshot = MaterialSnapshot::capture(scene, object)?;
    let obj = scene.try_object(object)?;
    let islands = obj
        .mesh
        .as_ref()
        .map(|m| detect_islands(&m.face_graph()))
        .unwrap_or_default();
    debug!("{} has {} islands", obj.name, islands.len());

    let (mode, targets) = if snapshot.slots.len() > 1 {
        (
            BakeMode::Multiple,
            materialize_per_slot(scene, object, config, rng)?,
        )
    } else {
        (
            BakeMode::Single,
            materialize_per_island(scene, object, &islands, config, rng)?,
        )
    };

    Ok(BakePlan {
        object,
        mode,
        islands,
        targets,
        snapshot,
    })
}

fn materialize_per_slot(
    scene: &mut Scene,
    object: ObjectId,
    config: &PipelineConfig,
    rng: &mut impl Rng,
) -> Result<Vec<BakeTarget>> {
    let obj = scene.try_object(object)?;
    let object_name = obj.name.clone();
    let slots = obj.material_slots.clone();
    let mut targets = Vec::with_capacity(slots.len());

    for (slot, original) in slots.into_iter().enumerate() {
        let Some(original) = original else {
            warn!("[SEGMENTATION] {object_name}: slot {slot} is empty, nothing to segment");
            continue;
        };
        let original_name = match scene.material(original) {
            Some(m) => m.name.clone(),
            None => {
                warn!("[SEGMENTATION] {object_name}: slot {slot} points at a removed material");
                continue;
            }
        };

        let mut temp = Material::temporary(
            format!("{original_name}{}", config.temporary_suffix),
            original_name,
        );
        set_placeholder_color(&mut temp, random_color(rng));

        let index = slot + 1;
        let image = scene.add_image(
            segmentation_map_name(&object_name, index),
            blank_image(config.bake.image_size, config.bake.image_size)?,
        );
        temp.shading.add_image_node(image, "Segmentation Map");
        let temp = scene.add_material(temp);

        let obj = scene.try_object_mut(object)?;
        obj.material_slots[slot] = Some(temp);

        targets.push(BakeTarget {
            index,
            image,
            materials: vec![temp],
        });
    }

    Ok(targets)
}

fn materialize_per_island(
    scene: &mut Scene,
    object: ObjectId,
    islands: &[Island],
    config: &PipelineConfig,
    rng: &mut impl Rng,
) -> Result<Vec<BakeTarget>> {
    let object_name = scene.try_object(object)?.name.clone();
    let image = scene.add_image(
        segmentation_map_name(&object_name, 1),
        blank_image(config.bake.image_size, config.bake.image_size)?,
    );

    let Some(mut edit) = scene.try_object(object)?.mesh.as_ref().map(|m| m.edit()) else {
        return Err(PipelineError::missing(EntityKind::Mesh, object_name));
    };

    let mut materials = Vec::with_capacity(islands.len());
    for (i, island) in islands.iter().enumerate() {
        let mut temp = Material::scratch(format!(
            "Island_{object_name}_{i}{}",
            config.temporary_suffix
        ));
        set_placeholder_color(&mut temp, random_color(rng));
        temp.shading.add_image_node(image, "Segmentation Map");
        let temp = scene.add_material(temp);
        let slot = scene.append_material(object, temp)?;

        for &face in &island.faces {
            if let Some(f) = edit.faces.get_mut(face) {
                f.material_index = slot;
            }
        }
        materials.push(temp);
    }

    if let Some(mesh) = scene.try_object_mut(object)?.mesh.as_mut() {
        mesh.apply_edit(&edit);
    }

    Ok(vec![BakeTarget {
        index: 1,
        image,
        materials,
    }])
}

fn set_placeholder_color(material: &mut Material, color: LinearRgba) {
    if let Some(input) = material.shading.base_color_input_mut() {
        input.default_value = color;
    }
    material.diffuse_color = color;
}

/// Metallic state taken out of the way of a diffuse bake.
#[derive(Debug, Clone, PartialEq)]
pub struct MetallicStash {
    pub object: ObjectId,
    /// Image that drove metallic, per slot, before it was unlinked.
    pub linked_images: Vec<Option<ImageId>>,
    /// First slot's material and its metallic value before it was zeroed.
    pub previous_value: Option<(MaterialId, f32)>,
}

/// Unlinks image textures from every slot's metallic input and zeroes the
/// first slot's metallic value.
pub fn stash_metallic(scene: &mut Scene, object: ObjectId) -> Result<MetallicStash> {
    let slots = scene.try_object(object)?.material_slots.clone();
    let mut linked_images = Vec::with_capacity(slots.len());

    for slot in &slots {
        let image = slot.and_then(|id| scene.material_mut(id)).and_then(|m| {
            let image = m.shading.metallic_image()?;
            m.shading.unlink_metallic();
            Some(image)
        });
        linked_images.push(image);
    }

    let previous_value = slots.first().copied().flatten().and_then(|id| {
        let input = scene.material_mut(id)?.shading.metallic_input_mut()?;
        let previous = input.default_value;
        input.default_value = 0.0;
        Some((id, previous))
    });

    Ok(MetallicStash {
        object,
        linked_images,
        previous_value,
    })
}

/// Reverts [`stash_metallic`].
///
/// The stash must line up slot-for-slot with the object; a count mismatch
/// leaves the links unrestored and reports an invariant violation.
pub fn restore_metallic(scene: &mut Scene, stash: &MetallicStash) -> Result<()> {
    if let Some((material, value)) = stash.previous_value {
        if let Some(input) = scene
            .material_mut(material)
            .and_then(|m| m.shading.metallic_input_mut())
        {
            input.default_value = value;
        }
    }

    let slots = scene.try_object(stash.object)?.material_slots.clone();
    if slots.len() != stash.linked_images.len() {
        return Err(PipelineError::InvariantViolation(format!(
            "{} metallic links recorded for {} material slots",
            stash.linked_images.len(),
            slots.len()
        )));
    }

    for (slot, image) in slots.iter().zip(&stash.linked_images) {
        let (Some(material), Some(image)) = (slot, image) else {
            continue;
        };
        let Some(material) = scene.material_mut(*material) else {
            continue;
        };
        match material.shading.find_image_node(*image) {
            Some(node) => material.shading.link_metallic(node)?,
            None => warn!(
                "[SEGMENTATION] {}: metallic image node is gone, not relinking",
                material.name
            ),
        }
    }
    Ok(())
}
