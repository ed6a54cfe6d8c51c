use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    time::Duration,
};

use bevy::{prelude::*, time::TimeUpdateStrategy};
use bevy_island_bake::{
    ControlHandle, ControlSurface, GenerationBackend, ImageGenerator, IslandBakePlugin,
    PipelineConfig, PooledGenerator, ProceduralGenerator, Request, Response, Scene, SoftwareBaker,
    TexturePipeline,
    config::PollConfig,
    generator::{GenerationRequest, PendingGeneration},
    mesh::{PolyMesh, Polygon},
    scene::SceneObject,
    shading::Material,
};
use rand::{SeedableRng, rngs::StdRng};

const STEP: Duration = Duration::from_millis(250);

/// Runs the procedural generator synchronously, counting conditioned requests.
#[derive(Default)]
struct InlineBackend {
    conditioned: Arc<AtomicUsize>,
}

impl GenerationBackend for InlineBackend {
    fn dispatch(&self, request: GenerationRequest) -> PendingGeneration {
        if request.conditioning.is_some() {
            self.conditioned.fetch_add(1, Ordering::SeqCst);
        }
        PendingGeneration::ready(ProceduralGenerator::default().generate(&request))
    }
}

struct NeverBackend;

impl GenerationBackend for NeverBackend {
    fn dispatch(&self, _: GenerationRequest) -> PendingGeneration {
        let (sender, pending) = PendingGeneration::channel();
        // Leaked so the channel stays open without ever delivering.
        std::mem::forget(sender);
        pending
    }
}

/// Two quads side by side covering the UV square.
fn strip(name: &str) -> PolyMesh {
    PolyMesh::new(
        name,
        vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [2.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [1.0, 1.0, 0.0],
            [2.0, 1.0, 0.0],
        ],
    )
    .with_polygon(
        Polygon::new(vec![0, 1, 4, 3])
            .with_uvs(vec![[0.0, 0.0], [0.5, 0.0], [0.5, 1.0], [0.0, 1.0]])
            .with_material(0),
    )
    .with_polygon(
        Polygon::new(vec![1, 2, 5, 4])
            .with_uvs(vec![[0.5, 0.0], [1.0, 0.0], [1.0, 1.0], [0.5, 1.0]])
            .with_material(1),
    )
}

fn test_config(tag: &str) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.bake.image_size = 32;
    config.bake.output_dir =
        std::env::temp_dir().join(format!("island-bake-app-{tag}-{}", std::process::id()));
    config.generation.width = 32;
    config.generation.height = 32;
    config
}

fn furnished_scene(config: &PipelineConfig) -> Scene {
    let mut scene = Scene::new("4.1.0");
    let chair = scene.add_object(SceneObject::with_mesh("Chair", strip("ChairMesh")));
    for name in ["Wood", "Metal"] {
        let material = scene.add_material(Material::new(name));
        scene.append_material(chair, material).unwrap();
    }
    scene.move_to_collection(chair, &config.collections.imported);

    let wall = scene.add_object(SceneObject::with_mesh("Wall", strip("WallMesh")));
    scene.move_to_collection(wall, &config.collections.tileable);
    scene
}

fn app_with(pipeline: TexturePipeline, poll: PollConfig) -> (App, ControlHandle) {
    let (surface, handle) = ControlSurface::new(poll);
    let mut app = App::new();
    app.add_plugins((MinimalPlugins, IslandBakePlugin))
        .insert_resource(TimeUpdateStrategy::ManualDuration(STEP))
        .insert_resource(pipeline)
        .insert_resource(surface);
    (app, handle)
}

fn await_response(app: &mut App, rx: &mpsc::Receiver<Response>, max_frames: usize) -> Response {
    for _ in 0..max_frames {
        app.update();
        if let Ok(response) = rx.try_recv() {
            return response;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("no response after {max_frames} frames");
}

#[test]
fn segmentation_then_generation_textures_every_material() {
    let config = test_config("full");
    let mut pipeline =
        TexturePipeline::new(furnished_scene(&config), config.clone(), InlineBackend::default());

    let report =
        pipeline.run_segmentation(&mut SoftwareBaker::default(), &mut StdRng::seed_from_u64(3));
    assert!(report.failed.is_empty(), "{:?}", report.failed);
    assert_eq!(report.baked.len(), 1);
    assert_eq!(report.baked[0].images.len(), 2);
    for image in &report.baked[0].images {
        assert!(image.path.exists());
    }
    // Restoration left the chair's materials as they were.
    let scene = &pipeline.scene;
    let chair = scene.object_by_name("Chair").unwrap();
    let names: Vec<_> = scene
        .object(chair)
        .unwrap()
        .materials()
        .map(|m| scene.material(m).unwrap().name.clone())
        .collect();
    assert_eq!(names, ["Wood", "Metal"]);

    let (mut app, handle) = app_with(pipeline, config.control);
    let rx = handle.send(Request::post("/generate_texture")).unwrap();
    let response = await_response(&mut app, &rx, 200);
    assert_eq!(response.status, 200);
    assert_eq!(response.json().unwrap()["message"], "DreamTextures");

    let pipeline = app.world().resource::<TexturePipeline>();
    let scene = &pipeline.scene;
    for name in ["Wood", "Metal", "Material_Wall"] {
        let material = scene.material(scene.material_by_name(name).unwrap()).unwrap();
        let image = material.shading.base_color_image().unwrap();
        assert_eq!(scene.image(image).unwrap().name, format!("{name}_T_New_BaseColor"));
    }
    // Only tileable assets get a derived normal map.
    assert!(scene.image_by_name("Material_Wall_T_New_BaseColor_Normal").is_some());
    assert!(scene.image_by_name("Wood_T_New_BaseColor_Normal").is_none());

    let rx = handle.send(Request::get("/material/Wood")).unwrap();
    let response = await_response(&mut app, &rx, 5);
    let textures = &response.json().unwrap()["material"]["textures"];
    assert_eq!(textures[0]["image"], "Wood_T_New_BaseColor");

    std::fs::remove_dir_all(&config.bake.output_dir).ok();
}

#[test]
fn segmentation_maps_condition_generation() {
    let config = test_config("conditioned");
    let backend = InlineBackend::default();
    let conditioned = backend.conditioned.clone();
    let mut pipeline = TexturePipeline::new(furnished_scene(&config), config.clone(), backend);
    pipeline.run_segmentation(&mut SoftwareBaker::default(), &mut StdRng::seed_from_u64(3));

    let (mut app, handle) = app_with(pipeline, config.control);
    let rx = handle.send(Request::post("/generate_texture")).unwrap();
    assert_eq!(await_response(&mut app, &rx, 200).status, 200);
    // Chair_1 and Chair_2 segmentation maps exist; the wall was never baked.
    assert_eq!(conditioned.load(Ordering::SeqCst), 2);

    std::fs::remove_dir_all(&config.bake.output_dir).ok();
}

#[test]
fn stalled_generation_reports_timeout() {
    let config = test_config("stalled");
    let pipeline = TexturePipeline::new(furnished_scene(&config), config.clone(), NeverBackend);
    let (mut app, handle) = app_with(pipeline, config.control);

    let rx = handle.send(Request::post("/generate_texture")).unwrap();
    let response = await_response(&mut app, &rx, 400);
    assert_eq!(response.status, 500);
    assert_eq!(response.json().unwrap()["error"], "DreamTextures timed out");
    assert!(!app.world().resource::<TexturePipeline>().in_process());
}

#[test]
fn missing_object_is_not_found_over_the_app() {
    let config = test_config("missing");
    let pipeline = TexturePipeline::new(furnished_scene(&config), config.clone(), NeverBackend);
    let (mut app, handle) = app_with(pipeline, config.control);

    let rx = handle.send(Request::get("/object/Sofa")).unwrap();
    let response = await_response(&mut app, &rx, 5);
    assert_eq!(response.status, 404);
    assert_eq!(response.json().unwrap()["error"], "Object 'Sofa' not found");
}

#[test]
fn pooled_procedural_generator_drives_a_run() {
    let mut config = test_config("pooled");
    // Real threads: give the run plenty of virtual time.
    config.queue.timeout = 3600.0;
    config.control.timeout = 3600.0;
    let backend = PooledGenerator::new(ProceduralGenerator::default()).unwrap();
    let pipeline = TexturePipeline::new(furnished_scene(&config), config.clone(), backend);
    let (mut app, handle) = app_with(pipeline, config.control);

    let rx = handle.send(Request::post("/generate_texture")).unwrap();
    let response = await_response(&mut app, &rx, 5_000);
    assert_eq!(response.status, 200);
}
