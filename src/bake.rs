//! Diffuse baking of segmentation maps and restoration of original materials.
//!
//! The bake operator itself is external: anything implementing [`RenderHost`]
//! can fill target images.  [`SoftwareBaker`] is a CPU reference host that
//! rasterises each face's UV polygon with its flat surface colour, which is
//! exactly what a diffuse pass with direct and indirect light disabled
//! captures.
//!
//! A failed bake is fatal for that object only: [`run_segmentation`] logs it,
//! restores the object's materials and moves on to the next object.

use std::{
    collections::{HashMap, HashSet},
    fs, mem,
    path::PathBuf,
};

use bevy::{
    color::LinearRgba,
    image::Image,
    log::{error, info, warn},
};
use rand::Rng;

use crate::{
    config::{ComputeDevice, PipelineConfig, RenderEngine},
    error::{EntityKind, PipelineError, Result},
    materializer::{
        BakeMode, BakePlan, BakeTarget, MaterialSnapshot, ensure_material, materialize,
        restore_metallic, stash_metallic,
    },
    mesh::PolyMesh,
    scene::{BakePass, ImageId, MaterialId, ObjectId, PurgedOrphans, Scene},
    shading::Material,
    texture::{encode_color, image_size, pixels_mut, save_png},
};

/// Surface property a bake captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BakeType {
    Diffuse,
}

/// Fixed parameters of the smart UV projection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmartProjectParams {
    /// Radians.
    pub angle_limit: f32,
    pub island_margin: f32,
    pub area_weight: f32,
    pub correct_aspect: bool,
    pub scale_to_bounds: bool,
}

impl Default for SmartProjectParams {
    fn default() -> Self {
        Self {
            angle_limit: 1.151_917,
            island_margin: 0.0,
            area_weight: 0.0,
            correct_aspect: true,
            scale_to_bounds: false,
        }
    }
}

/// One bake invocation.
pub struct BakeRequest<'a> {
    pub object: &'a str,
    pub mesh: &'a PolyMesh,
    pub bake_type: BakeType,
    pub pass: BakePass,
    pub engine: Option<RenderEngine>,
    pub device: ComputeDevice,
    /// Flat colour per face; `None` for faces that do not bake into `target`.
    pub face_colors: &'a [Option<LinearRgba>],
    pub target: &'a mut Image,
}

/// The host's bake and UV operators.
pub trait RenderHost {
    fn bake(&mut self, request: BakeRequest<'_>) -> Result<()>;

    fn unwrap_uvs(&mut self, mesh: &mut PolyMesh, params: &SmartProjectParams) -> Result<()>;
}

/// CPU reference implementation of [`RenderHost`].
#[derive(Debug, Clone)]
pub struct SoftwareBaker {
    /// Devices this host accepts bake requests for.
    pub devices: Vec<ComputeDevice>,
}

impl Default for SoftwareBaker {
    fn default() -> Self {
        Self {
            devices: vec![ComputeDevice::Cpu, ComputeDevice::Gpu],
        }
    }
}

impl SoftwareBaker {
    pub fn cpu_only() -> Self {
        Self {
            devices: vec![ComputeDevice::Cpu],
        }
    }
}

impl RenderHost for SoftwareBaker {
    fn bake(&mut self, request: BakeRequest<'_>) -> Result<()> {
        if request.engine.is_none() {
            return Err(PipelineError::ExternalOperation(
                "no render engine is active".into(),
            ));
        }
        if !self.devices.contains(&request.device) {
            return Err(PipelineError::ExternalOperation(format!(
                "{:?} compute is unavailable",
                request.device
            )));
        }
        if !request.mesh.has_uvs() {
            return Err(PipelineError::ExternalOperation(format!(
                "{} has no UV map",
                request.object
            )));
        }

        let (width, height) = image_size(request.target);
        let (w, h) = (width as usize, height as usize);
        let Some(texels) = pixels_mut(request.target) else {
            return Err(PipelineError::missing(
                EntityKind::Image,
                format!("pixels of {}'s bake target", request.object),
            ));
        };
        if request.pass.use_clear {
            for px in texels.chunks_exact_mut(4) {
                px.copy_from_slice(&[0, 0, 0, 255]);
            }
        }

        let mut written = vec![false; w * h];
        for (polygon, color) in request.mesh.polygons.iter().zip(request.face_colors) {
            let Some(color) = color else { continue };
            let mut rgba = encode_color(*color);
            rgba[3] = 255;
            let corners: Vec<[f32; 2]> = polygon
                .uvs
                .iter()
                .map(|uv| [uv[0] * width as f32, (1.0 - uv[1]) * height as f32])
                .collect();
            for i in 1..corners.len().saturating_sub(1) {
                fill_triangle(
                    texels,
                    &mut written,
                    (w, h),
                    [corners[0], corners[i], corners[i + 1]],
                    rgba,
                );
            }
        }

        for _ in 0..request.pass.margin {
            if !bleed_once(texels, &mut written, w, h) {
                break;
            }
        }
        Ok(())
    }

    fn unwrap_uvs(&mut self, mesh: &mut PolyMesh, params: &SmartProjectParams) -> Result<()> {
        let count = mesh.polygons.len();
        if count == 0 {
            return Ok(());
        }
        let cells = (count as f32).sqrt().ceil() as usize;
        let cell = 1.0 / cells as f32;
        let inset = params.island_margin.clamp(0.0, 0.5) * cell;

        for (k, polygon) in mesh.polygons.iter_mut().enumerate() {
            let points: Vec<[f32; 3]> = polygon
                .vertices
                .iter()
                .map(|&v| mesh.positions.get(v as usize).copied().unwrap_or([0.0; 3]))
                .collect();
            let flat = project_to_dominant_plane(&points);

            let (mut min, mut max) = ([f32::INFINITY; 2], [f32::NEG_INFINITY; 2]);
            for p in &flat {
                for axis in 0..2 {
                    min[axis] = min[axis].min(p[axis]);
                    max[axis] = max[axis].max(p[axis]);
                }
            }
            let mut extent = [
                (max[0] - min[0]).max(f32::EPSILON),
                (max[1] - min[1]).max(f32::EPSILON),
            ];
            if params.correct_aspect {
                let side = extent[0].max(extent[1]);
                extent = [side, side];
            }

            let origin = [
                (k % cells) as f32 * cell + inset,
                (k / cells) as f32 * cell + inset,
            ];
            let span = cell - 2.0 * inset;
            polygon.uvs = flat
                .iter()
                .map(|p| {
                    [
                        origin[0] + (p[0] - min[0]) / extent[0] * span,
                        origin[1] + (p[1] - min[1]) / extent[1] * span,
                    ]
                })
                .collect();
        }
        Ok(())
    }
}

/// Drops the axis the polygon faces most, using the Newell normal.
fn project_to_dominant_plane(points: &[[f32; 3]]) -> Vec<[f32; 2]> {
    let mut normal = [0.0f32; 3];
    for (i, a) in points.iter().enumerate() {
        let b = points[(i + 1) % points.len()];
        normal[0] += (a[1] - b[1]) * (a[2] + b[2]);
        normal[1] += (a[2] - b[2]) * (a[0] + b[0]);
        normal[2] += (a[0] - b[0]) * (a[1] + b[1]);
    }
    let abs = normal.map(f32::abs);
    let (u, v) = if abs[2] >= abs[0] && abs[2] >= abs[1] {
        (0, 1)
    } else if abs[1] >= abs[0] {
        (0, 2)
    } else {
        (1, 2)
    };
    points.iter().map(|p| [p[u], p[v]]).collect()
}

/// Fills every texel whose centre lies inside `tri` (pixel coordinates).
fn fill_triangle(
    texels: &mut [u8],
    written: &mut [bool],
    (w, h): (usize, usize),
    tri: [[f32; 2]; 3],
    rgba: [u8; 4],
) {
    let edge = |a: [f32; 2], b: [f32; 2], p: [f32; 2]| {
        (b[0] - a[0]) * (p[1] - a[1]) - (b[1] - a[1]) * (p[0] - a[0])
    };
    let area = edge(tri[0], tri[1], tri[2]);
    if area.abs() <= f32::EPSILON {
        return;
    }

    let min_x = tri.iter().map(|p| p[0]).fold(f32::INFINITY, f32::min).floor().max(0.0) as usize;
    let min_y = tri.iter().map(|p| p[1]).fold(f32::INFINITY, f32::min).floor().max(0.0) as usize;
    let max_x = (tri.iter().map(|p| p[0]).fold(f32::NEG_INFINITY, f32::max).ceil() as usize).min(w);
    let max_y = (tri.iter().map(|p| p[1]).fold(f32::NEG_INFINITY, f32::max).ceil() as usize).min(h);

    for y in min_y..max_y {
        for x in min_x..max_x {
            let p = [x as f32 + 0.5, y as f32 + 0.5];
            let w0 = edge(tri[1], tri[2], p) / area;
            let w1 = edge(tri[2], tri[0], p) / area;
            let w2 = edge(tri[0], tri[1], p) / area;
            if w0 >= -1e-4 && w1 >= -1e-4 && w2 >= -1e-4 {
                let idx = y * w + x;
                texels[idx * 4..idx * 4 + 4].copy_from_slice(&rgba);
                written[idx] = true;
            }
        }
    }
}

/// Grows baked texels one step into their unbaked 4-neighbours.
///
/// Returns `false` once nothing changed.
fn bleed_once(texels: &mut [u8], written: &mut [bool], w: usize, h: usize) -> bool {
    let mut grown = Vec::new();
    for y in 0..h {
        for x in 0..w {
            if written[y * w + x] {
                continue;
            }
            let source = [
                (x > 0).then(|| y * w + x - 1),
                (x + 1 < w).then(|| y * w + x + 1),
                (y > 0).then(|| (y - 1) * w + x),
                (y + 1 < h).then(|| (y + 1) * w + x),
            ]
            .into_iter()
            .flatten()
            .find(|&n| written[n]);
            if let Some(source) = source {
                grown.push((y * w + x, source));
            }
        }
    }
    for &(idx, source) in &grown {
        let (dst, src) = (idx * 4, source * 4);
        texels.copy_within(src..src + 4, dst);
        written[idx] = true;
    }
    !grown.is_empty()
}

/// File stem of the persisted bake for target `index` (1-based).
pub fn baked_texture_name(object: &str, index: usize) -> String {
    format!("{object}_{index}_BakedTexture")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BakedImage {
    pub index: usize,
    pub image: ImageId,
    pub path: PathBuf,
}

/// Outcome of a successful [`bake_object`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectBake {
    pub object: ObjectId,
    pub mode: BakeMode,
    pub islands: usize,
    pub images: Vec<BakedImage>,
}

/// Points the scene's render settings at a flat diffuse bake.
pub fn configure_render(scene: &mut Scene, config: &PipelineConfig) {
    scene.render.engine = config.bake.render_engine;
    scene.render.device = config.bake.device;
    scene.render.bake = BakePass {
        use_pass_direct: false,
        use_pass_indirect: false,
        use_clear: false,
        margin: config.bake.margin,
        save_external: true,
    };
}

/// Segments, bakes and restores one object.
///
/// Original materials are restored whether or not the bake succeeded.
pub fn bake_object(
    scene: &mut Scene,
    host: &mut dyn RenderHost,
    object: ObjectId,
    config: &PipelineConfig,
    rng: &mut impl Rng,
) -> Result<ObjectBake> {
    configure_render(scene, config);

    let had_material = !scene.try_object(object)?.material_slots.is_empty();
    if !had_material {
        ensure_material(scene, object)?;
    }
    let needs_unwrap = !had_material
        || scene
            .try_object(object)?
            .mesh
            .as_ref()
            .is_some_and(|m| !m.has_uvs());
    if needs_unwrap {
        if let Some(mesh) = scene.try_object_mut(object)?.mesh.as_mut() {
            if !had_material {
                mesh.weld_vertices(config.bake.merge_threshold);
            }
            host.unwrap_uvs(mesh, &SmartProjectParams::default())?;
        }
    }

    let stash = stash_metallic(scene, object)?;
    let plan = match materialize(scene, object, config, rng) {
        Ok(plan) => plan,
        Err(err) => {
            restore_metallic(scene, &stash)?;
            return Err(err);
        }
    };

    let baked = bake_targets(scene, host, &plan, config);

    let restored = restore_materials(scene, &plan.snapshot);
    purge_temporary_materials(scene);
    let relinked = restore_metallic(scene, &stash);

    let images = baked?;
    restored?;
    relinked?;

    let name = &scene.try_object(object)?.name;
    info!("[SEGMENTATION] {name}: baked {} image(s)", images.len());
    Ok(ObjectBake {
        object,
        mode: plan.mode,
        islands: plan.islands.len(),
        images,
    })
}

fn bake_targets(
    scene: &mut Scene,
    host: &mut dyn RenderHost,
    plan: &BakePlan,
    config: &PipelineConfig,
) -> Result<Vec<BakedImage>> {
    fs::create_dir_all(&config.bake.output_dir)?;
    let mut baked = Vec::with_capacity(plan.targets.len());
    for target in &plan.targets {
        baked.push(bake_target(scene, host, plan.object, target, config)?);
    }
    Ok(baked)
}

fn bake_target(
    scene: &mut Scene,
    host: &mut dyn RenderHost,
    object: ObjectId,
    target: &BakeTarget,
    config: &PipelineConfig,
) -> Result<BakedImage> {
    let face_colors = face_colors_for(scene, object, &target.materials)?;
    let missing_image = || PipelineError::missing(EntityKind::Image, format!("{:?}", target.image));

    let mut pixels = mem::take(&mut scene.image_mut(target.image).ok_or_else(missing_image)?.image);
    let obj = scene.try_object(object)?;
    let outcome = match obj.mesh.as_ref() {
        Some(mesh) => host.bake(BakeRequest {
            object: &obj.name,
            mesh,
            bake_type: BakeType::Diffuse,
            pass: scene.render.bake,
            engine: scene.render.engine,
            device: scene.render.device,
            face_colors: &face_colors,
            target: &mut pixels,
        }),
        None => Err(PipelineError::missing(EntityKind::Mesh, obj.name.clone())),
    };
    let file_stem = baked_texture_name(&obj.name, target.index);

    let image = scene.image_mut(target.image).ok_or_else(missing_image)?;
    image.image = pixels;
    outcome?;

    image.packed = true;
    let path = config.bake.output_dir.join(format!("{file_stem}.png"));
    save_png(&image.image, &path)?;
    image.filepath = Some(path.clone());

    Ok(BakedImage {
        index: target.index,
        image: target.image,
        path,
    })
}

/// Flat colour for faces bound to one of `materials`, `None` for the rest.
fn face_colors_for(
    scene: &Scene,
    object: ObjectId,
    materials: &[MaterialId],
) -> Result<Vec<Option<LinearRgba>>> {
    let obj = scene.try_object(object)?;
    let Some(mesh) = obj.mesh.as_ref() else {
        return Err(PipelineError::missing(EntityKind::Mesh, obj.name.clone()));
    };
    Ok(mesh
        .polygons
        .iter()
        .map(|p| {
            let material = obj.material_slots.get(p.material_index).copied().flatten()?;
            if !materials.contains(&material) {
                return None;
            }
            scene.material(material)?.surface_color()
        })
        .collect())
}

/// Puts the original materials back into `snapshot.object`'s slots.
///
/// Each temporary material is swapped for the original its restoration key
/// names, looked up among the snapshot's own materials before the rest of
/// the scene; slots still holding temporary materials afterwards are removed
/// and per-face material indices are written back.  A slot or face count
/// that no longer matches the snapshot stops the restoration for this object.
pub fn restore_materials(scene: &mut Scene, snapshot: &MaterialSnapshot) -> Result<()> {
    let slots = scene.try_object(snapshot.object)?.material_slots.clone();
    let original_named = |key: &str| {
        let is_original = |m: &Material| !m.is_temporary() && m.name == key;
        snapshot
            .slots
            .iter()
            .flatten()
            .copied()
            .find(|&id| scene.material(id).is_some_and(is_original))
            .or_else(|| {
                scene
                    .materials()
                    .find_map(|(id, m)| is_original(m).then_some(id))
            })
    };
    let mut restored = Vec::with_capacity(slots.len());
    for slot in slots {
        let substitute = slot
            .and_then(|id| scene.material(id))
            .and_then(|m| m.restoration_key())
            .and_then(original_named);
        let bound = substitute.or(slot);
        let temporary = bound
            .and_then(|id| scene.material(id))
            .is_some_and(|m| m.is_temporary());
        if !temporary {
            restored.push(bound);
        }
    }

    let obj = scene.try_object_mut(snapshot.object)?;
    if restored.len() != snapshot.slots.len() {
        return Err(PipelineError::InvariantViolation(format!(
            "{}: {} material slots after restoration, {} recorded",
            obj.name,
            restored.len(),
            snapshot.slots.len()
        )));
    }
    if restored != snapshot.slots {
        warn!("[SEGMENTATION] {}: restored slots differ from the recorded ones", obj.name);
    }
    obj.material_slots = restored;

    if let Some(mesh) = obj.mesh.as_mut() {
        if mesh.polygons.len() != snapshot.face_materials.len() {
            return Err(PipelineError::InvariantViolation(format!(
                "{}: {} faces, {} material indices recorded",
                obj.name,
                mesh.polygons.len(),
                snapshot.face_materials.len()
            )));
        }
        for (polygon, &index) in mesh.polygons.iter_mut().zip(&snapshot.face_materials) {
            polygon.material_index = index;
        }
    }
    Ok(())
}

/// Deletes temporary materials no slot uses any more.
pub fn purge_temporary_materials(scene: &mut Scene) -> usize {
    let unused: Vec<MaterialId> = scene
        .materials()
        .filter(|(id, m)| m.is_temporary() && scene.material_users(*id) == 0)
        .map(|(id, _)| id)
        .collect();
    for &id in &unused {
        scene.remove_material(id);
    }
    unused.len()
}

/// Result of walking the imported and tileable collections.
#[derive(Debug, Default)]
pub struct SegmentationReport {
    pub baked: Vec<ObjectBake>,
    pub failed: Vec<(String, PipelineError)>,
}

/// Objects of the imported collection that need their own segmentation map.
///
/// Objects that share one material with others are represented by the first
/// of their group; only the first group sharing several materials is baked;
/// objects sharing nothing are each baked.
pub fn plan_segmentation(scene: &Scene, config: &PipelineConfig) -> Vec<ObjectId> {
    let Some(imported) = scene.collection(&config.collections.imported) else {
        return Vec::new();
    };
    let meshes: Vec<ObjectId> = imported
        .objects
        .iter()
        .copied()
        .filter(|&id| scene.object(id).is_some_and(|o| o.is_mesh()))
        .collect();

    let mut by_uv: HashMap<Vec<[u32; 2]>, Vec<&str>> = HashMap::new();
    for &id in &meshes {
        if let Some(obj) = scene.object(id) {
            if let Some(signature) = obj.mesh.as_ref().and_then(|m| m.uv_signature()) {
                by_uv.entry(signature).or_default().push(&obj.name);
            }
        }
    }
    for names in by_uv.values().filter(|names| names.len() > 1) {
        info!("[SEGMENTATION] Objects with the same UV: {names:?}");
    }

    let mut users: Vec<(MaterialId, Vec<ObjectId>)> = Vec::new();
    for &id in &meshes {
        let Some(obj) = scene.object(id) else { continue };
        for material in obj.materials() {
            match users.iter_mut().find(|(m, _)| *m == material) {
                Some((_, objects)) => {
                    if !objects.contains(&id) {
                        objects.push(id);
                    }
                }
                None => users.push((material, vec![id])),
            }
        }
    }
    let groups: Vec<&Vec<ObjectId>> = users
        .iter()
        .map(|(_, objects)| objects)
        .filter(|objects| objects.len() > 1)
        .collect();

    let mut planned = Vec::new();
    let mut multi_material_done = false;
    for group in &groups {
        let used: HashSet<MaterialId> = group
            .iter()
            .filter_map(|&id| scene.object(id))
            .flat_map(|o| o.materials())
            .collect();
        if used.len() == 1 {
            planned.push(group[0]);
        } else if !multi_material_done {
            multi_material_done = true;
            planned.push(group[0]);
        }
    }
    let grouped: HashSet<ObjectId> = groups.iter().flat_map(|g| g.iter().copied()).collect();
    planned.extend(meshes.iter().copied().filter(|id| !grouped.contains(id)));

    let mut seen = HashSet::new();
    planned.retain(|id| seen.insert(*id));
    planned
}

/// Bakes a segmentation map for every object that needs one.
pub fn run_segmentation(
    scene: &mut Scene,
    host: &mut dyn RenderHost,
    config: &PipelineConfig,
    rng: &mut impl Rng,
) -> SegmentationReport {
    let mut report = SegmentationReport::default();

    let purged = scene.purge_orphans();
    if purged != PurgedOrphans::default() {
        info!(
            "[CLEANUP] Removed {} material(s) and {} image(s) with no users",
            purged.materials, purged.images
        );
    }

    let tileable = match scene.collection(&config.collections.tileable) {
        Some(c) => c.objects.clone(),
        None => {
            warn!("Collection '{}' not found", config.collections.tileable);
            return report;
        }
    };
    if scene.collection(&config.collections.imported).is_none() {
        warn!("Collection '{}' not found", config.collections.imported);
        return report;
    }

    for id in tileable {
        let Some(obj) = scene.object(id) else { continue };
        if !obj.is_mesh() || !obj.material_slots.is_empty() {
            continue;
        }
        let name = obj.name.clone();
        let prepared = ensure_material(scene, id).and_then(|_| {
            match scene.try_object_mut(id)?.mesh.as_mut() {
                Some(mesh) => {
                    mesh.weld_vertices(config.bake.merge_threshold);
                    host.unwrap_uvs(mesh, &SmartProjectParams::default())
                }
                None => Ok(()),
            }
        });
        match prepared {
            Ok(()) => info!("[UVMAP] {name} done"),
            Err(err) => warn!("[UVMAP] {name}: {err}"),
        }
    }

    for id in plan_segmentation(scene, config) {
        let name = scene
            .object(id)
            .map(|o| o.name.clone())
            .unwrap_or_default();
        match bake_object(scene, host, id, config, rng) {
            Ok(bake) => report.baked.push(bake),
            Err(err) => {
                error!("[SEGMENTATION] {name}: {err}");
                report.failed.push((name, err));
            }
        }
    }
    report
}
