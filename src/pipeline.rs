//! The run context: one resource owning the scene, the configuration, the
//! generation backend and the active generation run.
//!
//! Every stage takes what it needs from here by reference; nothing in the
//! crate keeps process-wide state of its own.

use std::{collections::HashMap, time::Duration};

use bevy::{
    log::{info, warn},
    prelude::Resource,
    time::{Timer, TimerMode},
};
use rand::Rng;

use crate::{
    bake::{RenderHost, SegmentationReport, run_segmentation},
    config::PipelineConfig,
    generator::GenerationBackend,
    normal::color_to_normals,
    queue::{QueueReport, QueueState, TextureQueue},
    scene::Scene,
};

/// Identifies one generation run.
pub type RunId = u64;

/// How many of the most recent finished runs keep their status.
pub const FINISHED_RUNS_KEPT: u64 = 16;

/// State of a generation run, as seen by callers waiting on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed(QueueReport),
    TimedOut(QueueReport),
}

struct ActiveRun {
    id: RunId,
    queue: TextureQueue,
    timer: Timer,
}

#[derive(Resource)]
pub struct TexturePipeline {
    pub scene: Scene,
    pub config: PipelineConfig,
    backend: Box<dyn GenerationBackend>,
    active: Option<ActiveRun>,
    next_run: RunId,
    finished: HashMap<RunId, RunStatus>,
}

impl TexturePipeline {
    pub fn new(
        scene: Scene,
        config: PipelineConfig,
        backend: impl GenerationBackend + 'static,
    ) -> Self {
        Self {
            scene,
            config,
            backend: Box::new(backend),
            active: None,
            next_run: 1,
            finished: HashMap::new(),
        }
    }

    /// Bakes segmentation maps for the imported and tileable collections.
    pub fn run_segmentation(
        &mut self,
        host: &mut dyn RenderHost,
        rng: &mut impl Rng,
    ) -> SegmentationReport {
        run_segmentation(&mut self.scene, host, &self.config, rng)
    }

    /// Starts a generation run over every material slot in the scene.
    ///
    /// While a run is active, the active run is returned instead of starting
    /// a second one.
    pub fn start_generation(&mut self) -> RunId {
        if let Some(run) = &self.active {
            info!("[DREAM TEXTURE] Joining run {}", run.id);
            return run.id;
        }

        let id = self.next_run;
        self.next_run += 1;
        let mut queue = TextureQueue::from_scene(&self.scene, &self.config.queue);
        info!(
            "[DREAM TEXTURE] Run {id} started with {} task(s)",
            queue.remaining()
        );
        // Dispatch the first task right away; later polls follow the timer.
        queue.poll(&mut self.scene, self.backend.as_ref(), &self.config.generation);
        let timer = Timer::new(self.config.queue.interval(), TimerMode::Repeating);
        self.active = Some(ActiveRun { id, queue, timer });
        self.settle();
        id
    }

    /// Advances the active run by `delta` of host time.
    pub fn tick(&mut self, delta: Duration) {
        let Some(run) = self.active.as_mut() else {
            return;
        };
        run.timer.tick(delta);
        for _ in 0..run.timer.times_finished_this_tick() {
            let state = run
                .queue
                .poll(&mut self.scene, self.backend.as_ref(), &self.config.generation);
            if state.is_terminal() {
                break;
            }
        }
        self.settle();
    }

    /// Status of `run`; `None` once it is unknown or too old to remember.
    pub fn status(&self, run: RunId) -> Option<RunStatus> {
        match &self.active {
            Some(active) if active.id == run => Some(RunStatus::Running),
            _ => self.finished.get(&run).copied(),
        }
    }

    pub fn active_run(&self) -> Option<RunId> {
        self.active.as_ref().map(|r| r.id)
    }

    /// `true` while a generation is in flight.
    pub fn in_process(&self) -> bool {
        self.active.as_ref().is_some_and(|r| r.queue.in_process())
    }

    pub fn queue_state(&self) -> Option<QueueState> {
        self.active.as_ref().map(|r| r.queue.state())
    }

    /// Retires the active run once its queue reached a terminal state.
    fn settle(&mut self) {
        let Some(run) = self.active.as_ref() else {
            return;
        };
        let report = run.queue.report();
        let status = match run.queue.state() {
            QueueState::Drained => RunStatus::Completed(report),
            QueueState::TimedOut => RunStatus::TimedOut(report),
            _ => return,
        };
        let id = run.id;
        self.active = None;

        if matches!(status, RunStatus::Completed(_)) {
            match color_to_normals(&mut self.scene, &self.config.collections.tileable) {
                Ok(count) => info!("[NORMAL MAP] {count} normal map(s) derived"),
                Err(e) => warn!("[NORMAL MAP] {e}"),
            }
        }
        info!("[DREAM TEXTURE] Run {id} finished: {status:?}");
        self.finished.retain(|&run, _| run + FINISHED_RUNS_KEPT > id);
        self.finished.insert(id, status);
    }
}
