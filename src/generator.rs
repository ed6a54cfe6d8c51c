//! The external image-generator seam.
//!
//! A [`GenerationBackend`] accepts a [`GenerationRequest`] and hands back a
//! [`PendingGeneration`] immediately; the queue polls it with
//! [`PendingGeneration::try_take`] on its own cadence and never blocks.
//!
//! [`PooledGenerator`] adapts any blocking [`ImageGenerator`] into a backend
//! by running it on a private [`rayon`] pool with a single worker, so at most
//! one generation is ever in flight.  [`ProceduralGenerator`] is the offline
//! reference generator: seamless fractal noise, tinted by the conditioning
//! image when one is supplied.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
    mpsc,
};

use noise::{Fbm, MultiFractal, Perlin};
use serde::Serialize;

use crate::{
    config::GenerationConfig,
    error::{PipelineError, Result},
    noise::{SeamlessAxes, SeamlessNoise, normalize},
    texture::{TextureMap, linear_to_srgb, srgb_to_linear, validate_dimensions},
};

/// Segmentation map plus the control-net settings it is applied with.
#[derive(Debug, Clone, Serialize)]
pub struct Conditioning {
    #[serde(skip)]
    pub image: TextureMap,
    pub control_net: String,
    pub scale: f32,
}

/// Everything the generator needs for one texture.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub seamless_axes: String,
    pub seed: u64,
    pub steps: u32,
    pub cfg_scale: f32,
    pub scheduler: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditioning: Option<Conditioning>,
}

impl GenerationRequest {
    /// Builds a request from the configured settings.
    ///
    /// A segmentation map selects the conditioned prompt and attaches the
    /// control net; without one the unconditioned prompt is used.
    pub fn from_config(config: &GenerationConfig, segmentation_map: Option<TextureMap>) -> Self {
        let prompt = match segmentation_map {
            Some(_) => config.conditioned_prompt.clone(),
            None => config.unconditioned_prompt.clone(),
        };
        Self {
            model: config.model.clone(),
            prompt,
            negative_prompt: config.negative_prompt.clone(),
            width: config.width,
            height: config.height,
            seamless_axes: config.seamless_axes.clone(),
            seed: config.seed,
            steps: config.steps,
            cfg_scale: config.cfg_scale,
            scheduler: config.scheduler.clone(),
            conditioning: segmentation_map.map(|image| Conditioning {
                image,
                control_net: config.control_net.clone(),
                scale: config.conditioning_scale,
            }),
        }
    }
}

/// A blocking text-to-image generator.
pub trait ImageGenerator: Send + Sync {
    fn generate(&self, request: &GenerationRequest) -> Result<TextureMap>;
}

/// Starts generations without waiting for them.
pub trait GenerationBackend: Send + Sync {
    fn dispatch(&self, request: GenerationRequest) -> PendingGeneration;
}

/// Outcome of one non-blocking check on a [`PendingGeneration`].
#[derive(Debug)]
pub enum GenerationPoll {
    Pending,
    Ready(TextureMap),
    Failed(PipelineError),
}

/// Worker side of a [`PendingGeneration`].
pub struct GenerationSender {
    tx: mpsc::SyncSender<Result<TextureMap>>,
    cancelled: Arc<AtomicBool>,
}

impl GenerationSender {
    /// `true` once the pending handle was dropped.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn send(self, result: Result<TextureMap>) {
        // The receiver may already be gone; nothing to deliver to then.
        self.tx.send(result).ok();
    }
}

/// A generation in flight.
///
/// Dropping it raises a cancellation flag; a worker that has not started yet
/// sees the flag and skips the work.
pub struct PendingGeneration {
    // Mutex makes the handle Sync so it can live inside a Bevy resource.
    rx: Mutex<mpsc::Receiver<Result<TextureMap>>>,
    cancelled: Arc<AtomicBool>,
}

impl Drop for PendingGeneration {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

impl PendingGeneration {
    /// A connected sender/pending pair, for backends that deliver results
    /// themselves.
    pub fn channel() -> (GenerationSender, Self) {
        let cancelled = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::sync_channel(1);
        (
            GenerationSender {
                tx,
                cancelled: Arc::clone(&cancelled),
            },
            Self {
                rx: Mutex::new(rx),
                cancelled,
            },
        )
    }

    /// Already-finished generation.
    pub fn ready(result: Result<TextureMap>) -> Self {
        let (sender, pending) = Self::channel();
        sender.send(result);
        pending
    }

    pub fn try_take(&self) -> GenerationPoll {
        let Ok(rx) = self.rx.lock() else {
            return GenerationPoll::Failed(PipelineError::ExternalOperation(
                "generation channel poisoned".into(),
            ));
        };
        match rx.try_recv() {
            Ok(Ok(map)) => GenerationPoll::Ready(map),
            Ok(Err(e)) => GenerationPoll::Failed(e),
            Err(mpsc::TryRecvError::Empty) => GenerationPoll::Pending,
            Err(mpsc::TryRecvError::Disconnected) => GenerationPoll::Failed(
                PipelineError::ExternalOperation("generation worker exited without a result".into()),
            ),
        }
    }
}

/// Runs an [`ImageGenerator`] on a private single-thread pool.
///
/// The pool is isolated from the application's global rayon pool so a long
/// generation never starves unrelated parallel work.
pub struct PooledGenerator<G> {
    generator: Arc<G>,
    pool: rayon::ThreadPool,
}

impl<G: ImageGenerator + 'static> PooledGenerator<G> {
    pub fn new(generator: G) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .thread_name(|i| format!("texture-gen-{i}"))
            .build()?;
        Ok(Self {
            generator: Arc::new(generator),
            pool,
        })
    }
}

impl<G: ImageGenerator + 'static> GenerationBackend for PooledGenerator<G> {
    fn dispatch(&self, request: GenerationRequest) -> PendingGeneration {
        let (sender, pending) = PendingGeneration::channel();
        let generator = Arc::clone(&self.generator);
        self.pool.spawn(move || {
            if !sender.is_cancelled() {
                let result = generator.generate(&request);
                sender.send(result);
            }
        });
        pending
    }
}

/// Offline [`ImageGenerator`] producing seamless fractal-noise textures.
#[derive(Debug, Clone)]
pub struct ProceduralGenerator {
    /// Torus radius in noise space; larger means finer detail.
    pub frequency: f64,
    pub octaves: usize,
    /// Linear colour used when no conditioning image is supplied.
    pub base_color: [f32; 3],
}

impl Default for ProceduralGenerator {
    fn default() -> Self {
        Self {
            frequency: 3.0,
            octaves: 5,
            base_color: [0.45, 0.32, 0.2],
        }
    }
}

impl ImageGenerator for ProceduralGenerator {
    fn generate(&self, request: &GenerationRequest) -> Result<TextureMap> {
        let (width, height) = (request.width, request.height);
        validate_dimensions(width, height)?;

        let fbm: Fbm<Perlin> = Fbm::new(request.seed as u32).set_octaves(self.octaves);
        let noise = SeamlessNoise::new(
            fbm,
            self.frequency,
            SeamlessAxes::parse(&request.seamless_axes),
        );
        let tint = request.conditioning.as_ref().map(|c| &c.image);

        let mut pixels = vec![0u8; width as usize * height as usize * 4];
        for y in 0..height {
            for x in 0..width {
                let u = x as f64 / width as f64;
                let v = y as f64 / height as f64;
                let shade = (0.6 + 0.8 * (normalize(noise.get(u, v)) - 0.5)) as f32;
                let base = match tint {
                    Some(map) => sample_linear(map, u, v),
                    None => self.base_color,
                };
                let idx = (y as usize * width as usize + x as usize) * 4;
                for c in 0..3 {
                    pixels[idx + c] = linear_to_srgb(base[c] * shade);
                }
                pixels[idx + 3] = 255;
            }
        }

        Ok(TextureMap::new(pixels, width, height)?)
    }
}

/// Nearest-texel lookup returning linear RGB.
fn sample_linear(map: &TextureMap, u: f64, v: f64) -> [f32; 3] {
    let x = ((u * map.width as f64) as usize).min(map.width as usize - 1);
    let y = ((v * map.height as f64) as usize).min(map.height as usize - 1);
    let idx = (y * map.width as usize + x) * 4;
    match map.pixels.get(idx..idx + 3) {
        Some(px) => [
            srgb_to_linear(px[0]),
            srgb_to_linear(px[1]),
            srgb_to_linear(px[2]),
        ],
        None => [0.0; 3],
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn small_request(conditioning: Option<TextureMap>) -> GenerationRequest {
        let mut config = GenerationConfig::default();
        config.width = 32;
        config.height = 32;
        GenerationRequest::from_config(&config, conditioning)
    }

    fn solid(width: u32, height: u32, rgba: [u8; 4]) -> TextureMap {
        TextureMap::new(rgba.repeat((width * height) as usize), width, height).unwrap()
    }

    #[test]
    fn segmentation_map_selects_the_conditioned_prompt() {
        let config = GenerationConfig::default();
        let plain = GenerationRequest::from_config(&config, None);
        assert_eq!(plain.prompt, config.unconditioned_prompt);
        assert!(plain.conditioning.is_none());

        let conditioned = GenerationRequest::from_config(&config, Some(solid(2, 2, [0; 4])));
        assert_eq!(conditioned.prompt, config.conditioned_prompt);
        let conditioning = conditioned.conditioning.unwrap();
        assert_eq!(conditioning.control_net, config.control_net);
        assert_eq!(conditioning.scale, 5.0);
    }

    #[test]
    fn request_serializes_without_pixels() {
        let json = serde_json::to_value(small_request(Some(solid(2, 2, [9; 4])))).unwrap();
        assert_eq!(json["seed"], 1_902_589_880u64);
        assert_eq!(json["conditioning"]["scale"], 5.0);
        assert!(json["conditioning"].get("image").is_none());
    }

    #[test]
    fn procedural_output_matches_request() {
        let map = ProceduralGenerator::default()
            .generate(&small_request(None))
            .unwrap();
        assert_eq!((map.width, map.height), (32, 32));
        assert_eq!(map.pixels.len(), 32 * 32 * 4);
        assert!(map.pixels.chunks_exact(4).all(|px| px[3] == 255));
        let first = &map.pixels[0..3];
        assert!(map.pixels.chunks_exact(4).any(|px| &px[0..3] != first));
    }

    #[test]
    fn procedural_output_is_deterministic_per_seed() {
        let generator = ProceduralGenerator::default();
        let a = generator.generate(&small_request(None)).unwrap();
        let b = generator.generate(&small_request(None)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn conditioning_tints_the_output() {
        let generator = ProceduralGenerator::default();
        let red = generator
            .generate(&small_request(Some(solid(4, 4, [255, 0, 0, 255]))))
            .unwrap();
        assert!(red.pixels.chunks_exact(4).all(|px| px[1] == 0 && px[2] == 0));
    }

    #[test]
    fn zero_sized_requests_fail() {
        let mut request = small_request(None);
        request.width = 0;
        let err = ProceduralGenerator::default().generate(&request).unwrap_err();
        assert!(matches!(err, PipelineError::Texture(_)));
    }

    #[test]
    fn pooled_generation_completes_without_blocking_dispatch() {
        let backend = PooledGenerator::new(ProceduralGenerator::default()).unwrap();
        let pending = backend.dispatch(small_request(None));
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match pending.try_take() {
                GenerationPoll::Ready(map) => {
                    assert_eq!(map.width, 32);
                    break;
                }
                GenerationPoll::Pending if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                other => panic!("unexpected poll result {other:?}"),
            }
        }
    }

    #[test]
    fn dropped_sender_reports_failure() {
        let (sender, pending) = PendingGeneration::channel();
        assert!(matches!(pending.try_take(), GenerationPoll::Pending));
        drop(sender);
        assert!(matches!(pending.try_take(), GenerationPoll::Failed(_)));
    }

    #[test]
    fn dropping_pending_cancels() {
        let (sender, pending) = PendingGeneration::channel();
        drop(pending);
        assert!(sender.is_cancelled());
    }
}
