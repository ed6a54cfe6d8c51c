//! Request/response control surface over the run context.
//!
//! Requests are plain `(method, path)` pairs answered with a status code and
//! a JSON (or, for `/version`, text) body, so any transport can sit in front
//! of it.  Clients hold a [`ControlHandle`]; the [`serve_control_requests`]
//! system answers queries against the scene on the next frame and keeps
//! `POST /generate_texture` callers waiting until their run finishes or the
//! control ceiling elapses.
//!
//! Queries observe the scene as it is between frames and may see a run's
//! temporary state.

use std::{
    sync::{Mutex, mpsc},
    time::Duration,
};

use bevy::{
    ecs::system::{Res, ResMut},
    log::{debug, error, info, warn},
    prelude::Resource,
    time::{Time, Timer, TimerMode},
};
use serde_json::{Value, json};

use crate::{
    config::PollConfig,
    error::{EntityKind, PipelineError},
    pipeline::{RunId, RunStatus, TexturePipeline},
    scene::{ObjectId, Scene, SceneObject, external_id},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub path: String,
}

impl Request {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
        }
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(Value),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Body,
}

impl Response {
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            body: Body::Json(body),
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: Body::Text(body.into()),
        }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: Body::Json(json!({ "error": message.into() })),
        }
    }

    pub fn json(&self) -> Option<&Value> {
        match &self.body {
            Body::Json(value) => Some(value),
            Body::Text(_) => None,
        }
    }
}

impl From<PipelineError> for Response {
    fn from(err: PipelineError) -> Self {
        Response::error(err.status(), err.to_string())
    }
}

/// Answers a read-only query against `scene`.
///
/// `POST /generate_texture` is not a query; [`serve_control_requests`]
/// handles it.
pub fn route(scene: &Scene, request: &Request) -> Response {
    let path = request.path.trim_end_matches('/');
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();

    if request.method == Method::Post {
        return Response::error(405, format!("{} does not accept POST", request.path));
    }
    match segments.as_slice() {
        ["version"] => Response::text(scene.version.clone()),
        ["objects"] => Response::ok(json!({
            "objects": scene.objects().map(|(id, o)| object_summary(id, o)).collect::<Vec<_>>()
        })),
        ["object", name] => object_detail(scene, name).unwrap_or_else(Response::from),
        ["collections"] => Response::ok(json!({
            "collections": scene
                .collections()
                .iter()
                .enumerate()
                .map(|(i, c)| json!({ "name": c.name, "id": i }))
                .collect::<Vec<_>>()
        })),
        ["collection", name] => match scene.collection(name) {
            Some(collection) => Response::ok(json!({
                "objects": collection
                    .objects
                    .iter()
                    .filter_map(|&id| scene.object(id).map(|o| object_summary(id, o)))
                    .collect::<Vec<_>>()
            })),
            None => PipelineError::missing(EntityKind::Collection, *name).into(),
        },
        ["materials"] => Response::ok(json!({
            "materials": scene
                .materials()
                .map(|(id, m)| json!({ "name": m.name, "id": external_id(id) }))
                .collect::<Vec<_>>()
        })),
        ["material", name] => material_detail(scene, name).unwrap_or_else(Response::from),
        ["object" | "collection" | "material"] => {
            Response::error(404, format!("{} needs a name", request.path))
        }
        [name] if !name.is_empty() => Response::ok(json!({ "message": format!("Hello, {name}") })),
        _ => Response::error(404, format!("no route for {}", request.path)),
    }
}

fn object_summary(id: ObjectId, object: &SceneObject) -> Value {
    json!({ "name": object.name, "id": external_id(id), "type": object.kind })
}

fn object_detail(scene: &Scene, name: &str) -> Result<Response, PipelineError> {
    let id = scene
        .object_by_name(name)
        .ok_or_else(|| PipelineError::missing(EntityKind::Object, name))?;
    let object = scene.try_object(id)?;

    let mut body = json!({ "object": object_summary(id, object) });
    if !object.material_slots.is_empty() {
        body["materials"] = object
            .material_slots
            .iter()
            .copied()
            .map(|slot| match slot.and_then(|m| scene.material(m).map(|mat| (m, mat))) {
                Some((id, material)) => json!({ "name": material.name, "id": external_id(id) }),
                None => Value::Null,
            })
            .collect();
    }
    if let Some(mesh) = object.mesh.as_ref() {
        body["mesh"] = json!({ "name": mesh.name, "faces": mesh.face_count() });
    }
    Ok(Response::ok(body))
}

fn material_detail(scene: &Scene, name: &str) -> Result<Response, PipelineError> {
    let id = scene
        .material_by_name(name)
        .ok_or_else(|| PipelineError::missing(EntityKind::Material, name))?;
    let Some(material) = scene.material(id) else {
        return Err(PipelineError::missing(EntityKind::Material, name));
    };
    let textures: Vec<Value> = material
        .shading
        .image_nodes()
        .map(|(_, node)| {
            let image = node.image.and_then(|i| scene.image(i)).map(|i| i.name.clone());
            json!({ "name": node.label, "type": "TEX_IMAGE", "image": image })
        })
        .collect();
    let c = material.diffuse_color;
    Ok(Response::ok(json!({
        "material": {
            "name": material.name,
            "textures": textures,
            "id": external_id(id),
            "diffuse_color": [c.red, c.green, c.blue, c.alpha],
            "metallic": material.metallic,
            "roughness": material.roughness,
        }
    })))
}

struct Envelope {
    request: Request,
    reply: mpsc::Sender<Response>,
}

/// Client side of the control surface.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<Envelope>,
}

impl ControlHandle {
    /// Queues `request`; the response arrives on the returned receiver.
    pub fn send(&self, request: Request) -> Result<mpsc::Receiver<Response>, PipelineError> {
        let (reply, rx) = mpsc::channel();
        self.tx
            .send(Envelope { request, reply })
            .map_err(|_| PipelineError::ExternalOperation("control surface is gone".into()))?;
        Ok(rx)
    }
}

/// A `POST /generate_texture` caller waiting on its run.
struct TriggerWait {
    run: RunId,
    reply: mpsc::Sender<Response>,
    timer: Timer,
    waited: Duration,
}

#[derive(Resource)]
pub struct ControlSurface {
    // Mutex makes the receiver Sync so it can live in a resource.
    requests: Mutex<mpsc::Receiver<Envelope>>,
    waits: Vec<TriggerWait>,
    poll: PollConfig,
}

impl ControlSurface {
    pub fn new(poll: PollConfig) -> (Self, ControlHandle) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                requests: Mutex::new(rx),
                waits: Vec::new(),
                poll,
            },
            ControlHandle { tx },
        )
    }

    pub fn waiting(&self) -> usize {
        self.waits.len()
    }

    fn take_requests(&self) -> Vec<Envelope> {
        match self.requests.lock() {
            Ok(rx) => rx.try_iter().collect(),
            Err(_) => {
                error!("control request channel poisoned");
                Vec::new()
            }
        }
    }

    /// Answers queued requests and re-checks waiting triggers.
    pub fn serve(&mut self, pipeline: &mut TexturePipeline, delta: Duration) {
        for Envelope { request, reply } in self.take_requests() {
            debug!("control: {:?} {}", request.method, request.path);
            let trigger = request.method == Method::Post
                && request.path.trim_end_matches('/') == "/generate_texture";
            if trigger {
                let run = pipeline.start_generation();
                let wait = TriggerWait {
                    run,
                    reply,
                    timer: Timer::new(self.poll.interval(), TimerMode::Repeating),
                    waited: Duration::ZERO,
                };
                // A run that finished on the spot answers without waiting.
                if let Some(wait) = self.resolve(pipeline, wait) {
                    self.waits.push(wait);
                }
            } else {
                reply.send(route(&pipeline.scene, &request)).ok();
            }
        }

        let ceiling = self.poll.ceiling();
        let interval = self.poll.interval();
        let mut still_waiting = Vec::with_capacity(self.waits.len());
        for mut wait in std::mem::take(&mut self.waits) {
            wait.timer.tick(delta);
            let checks = wait.timer.times_finished_this_tick();
            if checks == 0 {
                still_waiting.push(wait);
                continue;
            }
            wait.waited += interval * checks;
            let Some(wait) = self.resolve(pipeline, wait) else {
                continue;
            };
            if wait.waited >= ceiling {
                warn!("[Request: DreamTextures] Timed out");
                wait.reply
                    .send(Response::error(500, "DreamTextures timed out"))
                    .ok();
            } else {
                debug!("[Request: DreamTextures] In progress...");
                still_waiting.push(wait);
            }
        }
        self.waits = still_waiting;
    }

    /// Replies if the wait's run is over; hands the wait back otherwise.
    fn resolve(&self, pipeline: &TexturePipeline, wait: TriggerWait) -> Option<TriggerWait> {
        let response = match pipeline.status(wait.run) {
            Some(RunStatus::Running) => return Some(wait),
            Some(RunStatus::Completed(report)) => {
                info!("[Request: DreamTextures] Done: {report:?}");
                Response::ok(json!({ "message": "DreamTextures" }))
            }
            Some(RunStatus::TimedOut(_)) => Response::error(500, "DreamTextures timed out"),
            None => Response::error(500, format!("run {} is unknown", wait.run)),
        };
        wait.reply.send(response).ok();
        None
    }
}

/// Bevy system: serves the control surface once per frame.
pub fn serve_control_requests(
    time: Res<Time>,
    mut surface: ResMut<ControlSurface>,
    mut pipeline: ResMut<TexturePipeline>,
) {
    surface.serve(&mut pipeline, time.delta());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::PipelineConfig,
        mesh::fixtures,
        queue::tests::{InstantBackend, StalledBackend, textured_scene},
        scene::ObjectKind,
        shading::Material,
        texture::blank_image,
    };

    fn sample_scene() -> Scene {
        let (mut scene, chair, _) = textured_scene(&["Wood", "Metal"]);
        scene.add_object(SceneObject::new("Camera", ObjectKind::Camera));
        scene.move_to_collection(chair, "Imported Objects");
        scene
    }

    fn body(response: &Response) -> &Value {
        response.json().expect("json body")
    }

    #[test]
    fn version_is_plain_text() {
        let response = route(&sample_scene(), &Request::get("/version"));
        assert_eq!(response, Response::text("4.1.0"));
    }

    #[test]
    fn objects_list_names_ids_and_types() {
        let response = route(&sample_scene(), &Request::get("/objects"));
        let objects = body(&response)["objects"].as_array().unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0]["name"], "Chair");
        assert_eq!(objects[0]["type"], "MESH");
        assert_eq!(objects[1]["type"], "CAMERA");
        assert!(objects[0]["id"].is_u64());
    }

    #[test]
    fn object_detail_includes_materials_and_mesh() {
        let response = route(&sample_scene(), &Request::get("/object/Chair"));
        assert_eq!(response.status, 200);
        let json = body(&response);
        assert_eq!(json["object"]["name"], "Chair");
        assert_eq!(json["materials"][1]["name"], "Metal");
        assert_eq!(json["mesh"]["faces"], 2);

        let camera = route(&sample_scene(), &Request::get("/object/Camera"));
        assert!(body(&camera).get("mesh").is_none());
        assert!(body(&camera).get("materials").is_none());
    }

    #[test]
    fn unknown_object_is_not_found() {
        let response = route(&sample_scene(), &Request::get("/object/Sofa"));
        assert_eq!(response.status, 404);
        let json = body(&response);
        assert_eq!(json["error"], "Object 'Sofa' not found");
        assert!(json.get("object").is_none());
    }

    #[test]
    fn collection_routes() {
        let scene = sample_scene();
        let listing = route(&scene, &Request::get("/collections"));
        assert_eq!(body(&listing)["collections"][0]["name"], "Imported Objects");

        let members = route(&scene, &Request::get("/collection/Imported Objects"));
        assert_eq!(body(&members)["objects"][0]["name"], "Chair");

        let missing = route(&scene, &Request::get("/collection/Props"));
        assert_eq!(missing.status, 404);
        assert_eq!(body(&missing)["error"], "Collection 'Props' not found");
    }

    #[test]
    fn material_detail_lists_textures_and_scalars() {
        let mut scene = sample_scene();
        let image = scene.add_image("Wood_T_New_BaseColor", blank_image(2, 2).unwrap());
        let wood = scene.material_by_name("Wood").unwrap();
        scene
            .material_mut(wood)
            .unwrap()
            .shading
            .add_image_node(image, "Base Color");

        let response = route(&scene, &Request::get("/material/Wood"));
        let material = &body(&response)["material"];
        assert_eq!(material["textures"][0]["name"], "Base Color");
        assert_eq!(material["textures"][0]["type"], "TEX_IMAGE");
        assert_eq!(material["textures"][0]["image"], "Wood_T_New_BaseColor");
        assert_eq!(material["diffuse_color"].as_array().unwrap().len(), 4);
        assert!(material["roughness"].is_number());

        assert_eq!(route(&scene, &Request::get("/material/Glass")).status, 404);
        assert_eq!(route(&scene, &Request::get("/materials")).status, 200);
    }

    #[test]
    fn fallback_route_greets() {
        let response = route(&sample_scene(), &Request::get("/world"));
        assert_eq!(body(&response)["message"], "Hello, world");
    }

    #[test]
    fn detail_routes_without_a_name_are_not_found() {
        let scene = sample_scene();
        for path in ["/object/", "/object", "/collection/", "/material/"] {
            let response = route(&scene, &Request::get(path));
            assert_eq!(response.status, 404, "{path}");
            assert!(body(&response).get("message").is_none(), "{path}");
        }
    }

    #[test]
    fn empty_generation_answers_immediately() {
        let mut pipeline = TexturePipeline::new(
            Scene::new("4.1.0"),
            PipelineConfig::default(),
            InstantBackend::default(),
        );
        let (mut surface, handle) = ControlSurface::new(PollConfig::default());
        let rx = handle.send(Request::post("/generate_texture")).unwrap();
        surface.serve(&mut pipeline, Duration::ZERO);
        let response = rx.try_recv().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(body(&response)["message"], "DreamTextures");
        assert_eq!(surface.waiting(), 0);
    }

    #[test]
    fn stalled_generation_answers_with_timeout() {
        let (scene, _, _) = textured_scene(&["Wood"]);
        let mut pipeline =
            TexturePipeline::new(scene, PipelineConfig::default(), StalledBackend::default());
        let (mut surface, handle) = ControlSurface::new(PollConfig::default());
        let rx = handle.send(Request::post("/generate_texture")).unwrap();

        surface.serve(&mut pipeline, Duration::ZERO);
        assert!(rx.try_recv().is_err());
        surface.serve(&mut pipeline, Duration::from_secs(30));
        assert!(rx.try_recv().is_err());
        surface.serve(&mut pipeline, Duration::from_secs(30));

        let response = rx.try_recv().unwrap();
        assert_eq!(response.status, 500);
        assert_eq!(body(&response)["error"], "DreamTextures timed out");
    }

    #[test]
    fn queries_see_the_scene_between_frames() {
        let mut scene = Scene::new("4.1.0");
        let object = scene.add_object(SceneObject::with_mesh("Wall", fixtures::grid(1, 1)));
        let paint = scene.add_material(Material::new("Paint"));
        scene.append_material(object, paint).unwrap();
        let mut pipeline =
            TexturePipeline::new(scene, PipelineConfig::default(), InstantBackend::default());
        let (mut surface, handle) = ControlSurface::new(PollConfig::default());

        let rx = handle.send(Request::get("/object/Wall")).unwrap();
        surface.serve(&mut pipeline, Duration::ZERO);
        assert_eq!(rx.try_recv().unwrap().status, 200);
    }

    #[test]
    fn post_to_a_query_route_is_rejected() {
        assert_eq!(route(&sample_scene(), &Request::post("/objects")).status, 405);
    }
}
