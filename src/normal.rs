//! Colour-to-normal post pass for tileable assets.
//!
//! Luminance of a base-colour texture stands in for height; central
//! differences of that height give a tangent-space normal encoded as RGBA8:
//!   R = X  (tangent)
//!   G = Y  (bitangent, toward –V)
//!   B = Z  (outward)
//!   A = 255
//! Values are remapped from [-1, 1] to [0, 255].

use std::collections::HashSet;

use bevy::log::{info, warn};

use crate::{
    error::{EntityKind, PipelineError, Result},
    scene::{ImageId, MaterialId, Scene},
    texture::{image_from_pixels, image_size, pixels, srgb_to_linear},
};

/// Gradient scale used by [`color_to_normals`].
pub const NORMAL_STRENGTH: f32 = 0.02;

/// Convert normalised heights `[0, 1]` into a tangent-space normal map.
///
/// Neighbour lookups wrap toroidally, since every source texture tiles.  The
/// gradient is divided by the sample spacing in UV space, so a given
/// `strength` gives the same steepness at any resolution.
pub fn height_to_normal(heights: &[f64], width: u32, height: u32, strength: f32) -> Vec<u8> {
    if width == 0 || height == 0 {
        return Vec::new();
    }
    let w = width as usize;
    let h = height as usize;
    let s = strength as f64;

    let mut out = vec![0u8; w * h * 4];

    for y in 0..h {
        for x in 0..w {
            let (xm, xp) = ((x + w - 1) % w, (x + 1) % w);
            let (ym, yp) = ((y + h - 1) % h, (y + 1) % h);

            let left = heights[y * w + xm];
            let right = heights[y * w + xp];
            let above = heights[ym * w + x];
            let below = heights[yp * w + x];

            // Central differences span two texels.
            let dx = (right - left) * s * w as f64 / 2.0;
            let dy = (below - above) * s * h as f64 / 2.0;

            let len = (dx * dx + dy * dy + 1.0).sqrt();
            let idx = (y * w + x) * 4;
            out[idx] = encode_normal(-dx / len);
            out[idx + 1] = encode_normal(dy / len);
            out[idx + 2] = encode_normal(1.0 / len);
            out[idx + 3] = 255;
        }
    }

    out
}

/// Rec. 709 luminance of RGBA8 sRGB texels, in `[0, 1]`.
pub fn luminance_heights(texels: &[u8]) -> Vec<f64> {
    texels
        .chunks_exact(4)
        .map(|px| {
            let r = srgb_to_linear(px[0]) as f64;
            let g = srgb_to_linear(px[1]) as f64;
            let b = srgb_to_linear(px[2]) as f64;
            0.2126 * r + 0.7152 * g + 0.0722 * b
        })
        .collect()
}

/// Name of the normal map derived from `image`.
pub fn normal_map_name(image: &str) -> String {
    format!("{image}_Normal")
}

/// Derives and links a normal map for every material in `collection` whose
/// base colour is driven by an image.
///
/// Materials that already have a normal input linked are left alone.
/// Returns the number of normal maps created.
pub fn color_to_normals(scene: &mut Scene, collection: &str) -> Result<usize> {
    let Some(objects) = scene.collection(collection).map(|c| c.objects.clone()) else {
        return Err(PipelineError::missing(EntityKind::Collection, collection));
    };

    let mut seen = HashSet::new();
    let materials: Vec<MaterialId> = objects
        .iter()
        .filter_map(|&id| scene.object(id))
        .flat_map(|o| o.materials())
        .filter(|id| seen.insert(*id))
        .collect();

    let mut created = 0;
    for material in materials {
        let Some((source, name)) = normal_source(scene, material) else {
            continue;
        };
        let Some(scene_image) = scene.image(source) else {
            continue;
        };
        let (width, height) = image_size(&scene_image.image);
        let heights = luminance_heights(pixels(&scene_image.image));
        let normals = height_to_normal(&heights, width, height, NORMAL_STRENGTH);
        let normal_name = normal_map_name(&scene_image.name);
        let image = scene.add_image(normal_name, image_from_pixels(normals, width, height)?);

        let material = scene.try_material_mut(material)?;
        let node = material.shading.add_image_node(image, "Normal Map");
        match material.shading.link_normal(node) {
            Ok(()) => {
                created += 1;
                info!("[NORMAL MAP] {name} done");
            }
            Err(e) => warn!("[NORMAL MAP] {name}: {e}"),
        }
    }
    Ok(created)
}

/// Base-colour image of a material still lacking a normal map.
fn normal_source(scene: &Scene, material: MaterialId) -> Option<(ImageId, String)> {
    let material = scene.material(material)?;
    if material.shading.principled()?.normal.is_some() {
        return None;
    }
    let image = material.shading.base_color_image()?;
    Some((image, material.name.clone()))
}

#[inline]
fn encode_normal(n: f64) -> u8 {
    ((n * 0.5 + 0.5).clamp(0.0, 1.0) * 255.0).round() as u8
}
