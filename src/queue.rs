//! Single-flight texture-generation queue.
//!
//! Each call to [`TextureQueue::poll`] advances the state machine by one
//! step:
//!
//! ```text
//! Idle ─► Dispatching ─► AwaitingExternalResult ─► Applying ─► Idle | Drained
//!                                 │
//!                                 └──────────────► TimedOut
//! ```
//!
//! `Idle` and `Dispatching` resolve within the call that finds them, so a poll
//! from `Idle` ends in `AwaitingExternalResult`.  Every later poll is one
//! check of the in-flight generation and counts one interval towards the
//! ceiling.  At most one task is ever in flight; [`TextureQueue::in_process`]
//! is set before dispatch and cleared after the result was applied or the
//! wait timed out.

use std::{collections::VecDeque, time::Duration};

use bevy::{
    ecs::system::{Res, ResMut},
    log::{debug, error, info, warn},
    time::Time,
};

use crate::{
    config::{GenerationConfig, PollConfig},
    error::{EntityKind, PipelineError, Result},
    generator::{GenerationBackend, GenerationPoll, GenerationRequest, PendingGeneration},
    materializer::segmentation_map_name,
    pipeline::TexturePipeline,
    scene::{MaterialId, ObjectId, Scene},
    texture::{TextureMap, image_from_pixels, image_size, pixels},
};

/// One pending generation: a material slot of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationTask {
    pub object: ObjectId,
    pub material: MaterialId,
    /// 1-based slot position, matching segmentation-map names.
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Dispatching,
    AwaitingExternalResult,
    Applying,
    TimedOut,
    Drained,
}

impl QueueState {
    pub fn is_terminal(self) -> bool {
        matches!(self, QueueState::TimedOut | QueueState::Drained)
    }
}

/// Counters reported once a run ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueReport {
    pub dispatched: usize,
    pub applied: usize,
    pub skipped: usize,
    /// Tasks never dispatched because the run timed out.
    pub abandoned: usize,
}

struct InFlight {
    task: GenerationTask,
    pending: PendingGeneration,
    waited: Duration,
    polls: u32,
    result: Option<TextureMap>,
}

/// Name of the image a generated base colour is stored in.
pub fn generated_texture_name(material: &str) -> String {
    format!("{material}_T_New_BaseColor")
}

pub struct TextureQueue {
    tasks: VecDeque<GenerationTask>,
    state: QueueState,
    in_flight: Option<InFlight>,
    in_process: bool,
    interval: Duration,
    ceiling: Duration,
    report: QueueReport,
}

impl TextureQueue {
    /// A queue over `tasks`, in order.  An empty queue starts out drained.
    pub fn new(tasks: impl IntoIterator<Item = GenerationTask>, poll: &PollConfig) -> Self {
        let tasks: VecDeque<_> = tasks.into_iter().collect();
        let state = if tasks.is_empty() {
            QueueState::Drained
        } else {
            QueueState::Idle
        };
        Self {
            tasks,
            state,
            in_flight: None,
            in_process: false,
            interval: poll.interval(),
            ceiling: poll.ceiling(),
            report: QueueReport::default(),
        }
    }

    /// One task per material slot of every mesh object, in scene order.
    pub fn from_scene(scene: &Scene, poll: &PollConfig) -> Self {
        let mut tasks = Vec::new();
        for (object, obj) in scene.objects() {
            if !obj.is_mesh() {
                continue;
            }
            for (slot, material) in obj.material_slots.iter().enumerate() {
                let Some(material) = *material else { continue };
                if scene.material(material).is_some_and(|m| m.is_temporary()) {
                    continue;
                }
                tasks.push(GenerationTask {
                    object,
                    material,
                    index: slot + 1,
                });
            }
        }
        Self::new(tasks, poll)
    }

    /// Current step of the state machine.
    pub fn state(&self) -> QueueState {
        self.state
    }

    /// `true` between a dispatch and the moment its result is taken.
    pub fn in_process(&self) -> bool {
        self.in_process
    }

    /// Material of the task in flight.
    pub fn current_material(&self) -> Option<MaterialId> {
        self.in_flight.as_ref().map(|f| f.task.material)
    }

    /// Result checks made for the task in flight.
    pub fn polls(&self) -> u32 {
        self.in_flight.as_ref().map_or(0, |f| f.polls)
    }

    /// Tasks not yet dispatched.
    pub fn remaining(&self) -> usize {
        self.tasks.len()
    }

    /// Tally of the tasks settled so far.
    pub fn report(&self) -> QueueReport {
        self.report
    }

    /// Advances the state machine by one step and returns the new state.
    pub fn poll(
        &mut self,
        scene: &mut Scene,
        backend: &dyn GenerationBackend,
        config: &GenerationConfig,
    ) -> QueueState {
        match self.state {
            QueueState::Idle | QueueState::Dispatching => self.dispatch_next(scene, backend, config),
            QueueState::AwaitingExternalResult => self.check_result(),
            QueueState::Applying => self.apply(scene),
            QueueState::TimedOut | QueueState::Drained => {}
        }
        // A ready result is applied within the same poll that received it.
        if self.state == QueueState::Applying {
            self.apply(scene);
        }
        self.state
    }

    fn dispatch_next(
        &mut self,
        scene: &Scene,
        backend: &dyn GenerationBackend,
        config: &GenerationConfig,
    ) {
        let Some(task) = self.tasks.pop_front() else {
            self.finish_task();
            return;
        };
        self.state = QueueState::Dispatching;
        debug!("queue: Idle -> Dispatching {task:?}");

        let request = match build_request(scene, &task, config) {
            Ok(request) => request,
            Err(e) => {
                warn!("[DREAM TEXTURE] skipping task {}: {e}", task.index);
                self.report.skipped += 1;
                self.finish_task();
                return;
            }
        };
        if let Ok(json) = serde_json::to_string(&request) {
            debug!("queue: request {json}");
        }

        self.in_process = true;
        let pending = backend.dispatch(request);
        self.report.dispatched += 1;
        info!(
            "[DREAM TEXTURE] Generating texture {} for {:?}",
            task.index, task.material
        );
        self.in_flight = Some(InFlight {
            task,
            pending,
            waited: Duration::ZERO,
            polls: 0,
            result: None,
        });
        self.state = QueueState::AwaitingExternalResult;
    }

    fn check_result(&mut self) {
        let Some(flight) = self.in_flight.as_mut() else {
            self.finish_task();
            return;
        };
        flight.polls += 1;
        match flight.pending.try_take() {
            GenerationPoll::Ready(map) => {
                flight.result = Some(map);
                self.state = QueueState::Applying;
            }
            GenerationPoll::Failed(e) => {
                warn!("[DREAM TEXTURE] generation failed for task {}: {e}", flight.task.index);
                self.report.skipped += 1;
                self.in_flight = None;
                self.finish_task();
            }
            GenerationPoll::Pending => {
                flight.waited += self.interval;
                debug!("queue: poll {} waiting {:?}", flight.polls, flight.waited);
                if flight.waited >= self.ceiling {
                    let waited = flight.waited;
                    self.time_out(waited);
                }
            }
        }
    }

    fn apply(&mut self, scene: &mut Scene) {
        let Some(flight) = self.in_flight.take() else {
            self.finish_task();
            return;
        };
        let outcome = match flight.result {
            Some(map) => apply_texture(scene, flight.task.material, map),
            None => Err(PipelineError::InvariantViolation(
                "applying a task without a result".into(),
            )),
        };
        match outcome {
            Ok(()) => self.report.applied += 1,
            Err(e) => {
                warn!("[DREAM TEXTURE] {e}");
                self.report.skipped += 1;
            }
        }
        self.finish_task();
    }

    fn time_out(&mut self, waited: Duration) {
        let error = PipelineError::Timeout { waited };
        error!("[DREAM TEXTURE] {error}");
        self.in_flight = None;
        self.in_process = false;
        self.report.abandoned = self.tasks.len();
        self.tasks.clear();
        self.state = QueueState::TimedOut;
    }

    fn finish_task(&mut self) {
        self.in_process = false;
        self.in_flight = None;
        self.state = if self.tasks.is_empty() {
            info!("[DREAM TEXTURE] Queue drained");
            QueueState::Drained
        } else {
            QueueState::Idle
        };
    }
}

/// Request for `task`, conditioned on its segmentation map when one exists.
///
/// The prompt template follows the same test: a map named after the task's
/// object and index selects the conditioned prompt. Whether the template
/// choice is meant to hinge on bake-time naming is unconfirmed.
fn build_request(
    scene: &Scene,
    task: &GenerationTask,
    config: &GenerationConfig,
) -> Result<GenerationRequest> {
    let obj = scene.try_object(task.object)?;
    if scene.material(task.material).is_none() {
        return Err(PipelineError::missing(
            EntityKind::Material,
            format!("{:?}", task.material),
        ));
    }
    let segmentation = scene
        .image_by_name(&segmentation_map_name(&obj.name, task.index))
        .and_then(|id| scene.image(id))
        .map(|image| {
            let (width, height) = image_size(&image.image);
            TextureMap::new(pixels(&image.image).to_vec(), width, height)
        })
        .transpose()?;
    Ok(GenerationRequest::from_config(config, segmentation))
}

/// Copies `map` into a new image and wires it into `material`'s base colour.
///
/// An existing base-colour texture node is repointed at the new image;
/// otherwise a node is added.  A material without a surface node keeps the
/// image unlinked and reports a soft failure.
pub fn apply_texture(scene: &mut Scene, material: MaterialId, map: TextureMap) -> Result<()> {
    let name = scene
        .material(material)
        .map(|m| m.name.clone())
        .ok_or_else(|| PipelineError::missing(EntityKind::Material, format!("{material:?}")))?;
    let image = scene.add_image(
        generated_texture_name(&name),
        image_from_pixels(map.pixels, map.width, map.height)?,
    );

    let shading = &mut scene.try_material_mut(material)?.shading;
    let linked = shading.base_color_input().and_then(|input| input.link);
    match linked {
        Some(node) => {
            if let Some(node) = shading.image_node_mut(node) {
                node.image = Some(image);
            }
        }
        None => {
            let node = shading.add_image_node(image, "Base Color");
            shading.link_base_color(node)?;
        }
    }
    info!("[DREAM TEXTURE] {name} textured");
    Ok(())
}

/// Bevy system: advances the active generation run on the configured cadence.
pub fn poll_generation_queue(time: Res<Time>, mut pipeline: ResMut<TexturePipeline>) {
    pipeline.tick(time.delta());
}
