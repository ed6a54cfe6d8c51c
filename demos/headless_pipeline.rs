//! `headless_pipeline`: bakes segmentation maps for a small scene, then
//! drives one texture-generation run through the control surface.
//!
//! Run with:
//!   cargo run --example headless_pipeline [config.toml]

use std::{
    sync::{Mutex, mpsc},
    time::Duration,
};

use bevy::{app::ScheduleRunnerPlugin, log::LogPlugin, prelude::*};
use bevy_island_bake::{
    ControlHandle, ControlSurface, IslandBakePlugin, PipelineConfig, PooledGenerator,
    ProceduralGenerator, Request, Scene, SoftwareBaker, TexturePipeline,
    control::Body,
    mesh::{PolyMesh, Polygon},
    scene::SceneObject,
    shading::Material,
    texture::save_png,
};
use rand::{SeedableRng, rngs::StdRng};

/// Unit cube with every face mapped onto its own UV column.
fn crate_mesh() -> PolyMesh {
    let positions = vec![
        [0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0],
        [1.0, 1.0, 0.0],
        [0.0, 1.0, 0.0],
        [0.0, 0.0, 1.0],
        [1.0, 0.0, 1.0],
        [1.0, 1.0, 1.0],
        [0.0, 1.0, 1.0],
    ];
    let loops = [
        [0, 3, 2, 1],
        [4, 5, 6, 7],
        [0, 1, 5, 4],
        [2, 3, 7, 6],
        [1, 2, 6, 5],
        [0, 4, 7, 3],
    ];
    let mut mesh = PolyMesh::new("CrateMesh", positions);
    for (i, l) in loops.iter().enumerate() {
        let u0 = i as f32 / 6.0;
        let u1 = (i + 1) as f32 / 6.0;
        mesh.polygons.push(
            Polygon::new(l.to_vec())
                .with_uvs(vec![[u0, 0.0], [u1, 0.0], [u1, 1.0], [u0, 1.0]])
                .with_material(usize::from(i >= 3)),
        );
    }
    mesh
}

fn build_scene(config: &PipelineConfig) -> Scene {
    let mut scene = Scene::new("4.1.0");
    let crate_id = scene.add_object(SceneObject::with_mesh("Crate", crate_mesh()));
    for name in ["Planks", "Straps"] {
        let material = scene.add_material(Material::new(name));
        if let Err(e) = scene.append_material(crate_id, material) {
            error!("{e}");
        }
    }
    scene.move_to_collection(crate_id, &config.collections.imported);

    let floor = scene.add_object(SceneObject::with_mesh("Floor", crate_mesh()));
    scene.move_to_collection(floor, &config.collections.tileable);
    scene
}

#[derive(Resource)]
struct Client {
    handle: ControlHandle,
    // Mutex makes the receiver Sync so it can live in a resource.
    pending: Option<Mutex<mpsc::Receiver<bevy_island_bake::Response>>>,
}

fn main() -> bevy_island_bake::Result<()> {
    let mut config = match std::env::args().nth(1) {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    config.generation.width = 256;
    config.generation.height = 256;

    let mut pipeline = TexturePipeline::new(
        build_scene(&config),
        config.clone(),
        PooledGenerator::new(ProceduralGenerator::default())?,
    );
    let mut rng = StdRng::seed_from_u64(7);
    let report = pipeline.run_segmentation(&mut SoftwareBaker::default(), &mut rng);
    println!(
        "baked {} object(s), {} failure(s)",
        report.baked.len(),
        report.failed.len()
    );

    let (surface, handle) = ControlSurface::new(config.control);
    App::new()
        .add_plugins((
            MinimalPlugins.set(ScheduleRunnerPlugin::run_loop(Duration::from_millis(16))),
            LogPlugin::default(),
            IslandBakePlugin,
        ))
        .insert_resource(pipeline)
        .insert_resource(surface)
        .insert_resource(Client {
            handle,
            pending: None,
        })
        .add_systems(Startup, trigger_generation)
        .add_systems(Update, report_and_exit)
        .run();
    Ok(())
}

fn trigger_generation(mut client: ResMut<Client>) {
    match client.handle.send(Request::post("/generate_texture")) {
        Ok(rx) => client.pending = Some(Mutex::new(rx)),
        Err(e) => error!("{e}"),
    }
}

fn report_and_exit(
    client: Res<Client>,
    pipeline: Res<TexturePipeline>,
    mut exit: MessageWriter<AppExit>,
) {
    let Some(pending) = client.pending.as_ref() else {
        exit.write(AppExit::error());
        return;
    };
    let Ok(rx) = pending.lock() else {
        return;
    };
    let Ok(response) = rx.try_recv() else {
        return;
    };
    match &response.body {
        Body::Json(body) => println!("{} {body}", response.status),
        Body::Text(body) => println!("{} {body}", response.status),
    }

    let out = &pipeline.config.bake.output_dir;
    for (_, image) in pipeline.scene.images() {
        if !image.name.contains("_T_New_") {
            continue;
        }
        let path = out.join(format!("{}.png", image.name));
        match save_png(&image.image, &path) {
            Ok(()) => println!("wrote {}", path.display()),
            Err(e) => error!("{}: {e}", path.display()),
        }
    }
    exit.write(AppExit::Success);
}
