//! Pipeline controller.
//!
//! [`StereoEngine`] owns the two frame rings, one dedicated worker thread,
//! and a binary wake semaphore. Producers `submit` frames into the ingress
//! ring (last-mode, overwriting: the worker always sees the newest frame
//! when the consumer falls behind); the worker runs the configured stage
//! chain and commits results into the egress ring (FIFO, no overwrite: the
//! consumer observes results strictly in completion order); consumers poll
//! `fetch_result`.
//!
//! Stage dispatch per frame, by start mode and shutter mode:
//!
//! | stereo_matching | frame_decoder | shutter          | action |
//! |-----------------|---------------|------------------|--------|
//! | on              | —             | any              | matcher → optional filter |
//! | off             | on            | double combined  | decoder double-shutter → optional filter |
//! | off             | on            | other            | decoder single → optional filter |
//! | off             | off           | any              | pass-through copy |
//!
//! Stage errors do not abort the pipeline: they are recorded on the result
//! and the worker moves on. `stop` terminates the worker cooperatively
//! (semaphore release, then a 10 ms poll up to 1 s); after that, `submit`
//! fails with `NotRunning`. `terminate` is idempotent.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Condvar, Mutex};

use crate::block::BlockDisparity;
use crate::config::EngineConfig;
use crate::decoder::FrameDecoder;
use crate::error::{StereoError, StereoResult};
use crate::filter::{self, DisparityFilter, FilterTunables};
use crate::frame::{FrameSlot, ImageFrame, ResultFrame, ShutterMode, StageStatus};
use crate::matcher::{self, MatcherTunables, StereoMatcher};
use crate::params::{ParamCell, ParameterSet};
use crate::ring::FrameRing;

/// Display name of the external decoder stage.
pub const DECODER_STAGE_NAME: &str = "Frame Decoder";

/// Worker poll interval.
const WAIT_INTERVAL: Duration = Duration::from_millis(10);

/// Maximum time `stop` waits for the worker to acknowledge termination.
const STOP_POLL_COUNT: usize = 100;

/// Number of band worker threads per signal-processing stage.
const STAGE_BANDS: usize = crate::band::DEFAULT_BANDS;

/// Which stages run, selected at `start`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StartMode {
    /// Run the block matcher.
    pub stereo_matching: bool,
    /// Run the external frame decoder (when the matcher is off).
    pub frame_decoder: bool,
    /// Run the disparity filter after matcher or decoder.
    pub disparity_filter: bool,
}

/// Binary semaphore waking the worker; extra releases saturate at one
/// permit, mirroring a slow worker dropping wakeups rather than queueing
/// them.
struct WakeSemaphore {
    permit: Mutex<bool>,
    signal: Condvar,
}

impl WakeSemaphore {
    fn new() -> Self {
        Self {
            permit: Mutex::new(false),
            signal: Condvar::new(),
        }
    }

    fn release(&self) {
        let mut permit = self.permit.lock();
        *permit = true;
        self.signal.notify_one();
    }

    fn acquire_timeout(&self, timeout: Duration) -> bool {
        let mut permit = self.permit.lock();
        if !*permit {
            self.signal.wait_for(&mut permit, timeout);
        }
        if *permit {
            *permit = false;
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
struct EngineStats {
    frames_dropped: AtomicU64,
    hard_errors: AtomicU64,
}

/// State shared between the API side and the worker thread.
struct EngineShared {
    wake: WakeSemaphore,
    mode: Mutex<StartMode>,
    running: AtomicBool,
    terminate_request: AtomicBool,
    terminate_done: AtomicBool,
    stats: EngineStats,
}

type SharedDecoder = Arc<Mutex<Box<dyn FrameDecoder>>>;

/// The pipeline engine.
pub struct StereoEngine {
    cfg: EngineConfig,
    shared: Arc<EngineShared>,
    ingress: Arc<FrameRing<ImageFrame>>,
    egress: Arc<FrameRing<ResultFrame>>,
    worker: Option<std::thread::JoinHandle<()>>,
    matcher_params: Option<Arc<ParamCell<MatcherTunables>>>,
    filter_params: Option<Arc<ParamCell<FilterTunables>>>,
    filter_dump: Option<Arc<AtomicBool>>,
    decoder: Option<SharedDecoder>,
    terminated: bool,
}

impl StereoEngine {
    /// Initialise the engine without a frame decoder.
    pub fn init(cfg: EngineConfig) -> StereoResult<Self> {
        Self::init_inner(cfg, None)
    }

    /// Initialise the engine with an external frame-decoder collaborator.
    pub fn init_with_decoder(
        cfg: EngineConfig,
        decoder: Box<dyn FrameDecoder>,
    ) -> StereoResult<Self> {
        Self::init_inner(cfg, Some(Arc::new(Mutex::new(decoder))))
    }

    fn init_inner(cfg: EngineConfig, decoder: Option<SharedDecoder>) -> StereoResult<Self> {
        cfg.validate()?;
        cfg.init_tracing();

        std::fs::create_dir_all(&cfg.configuration_path)?;

        let (width, height) = (cfg.max_image_width, cfg.max_image_height);

        let (matcher, matcher_params) = if cfg.enabled_stages.stereo_matching {
            let tunables =
                MatcherTunables::load_or_create(&cfg.configuration_path, cfg.camera_model)?;
            let (matcher, cell) = StereoMatcher::new(STAGE_BANDS, tunables)?;
            (Some(matcher), Some(cell))
        } else {
            (None, None)
        };

        let (filter, filter_params, filter_dump) = if cfg.enabled_stages.disparity_filter {
            let tunables =
                FilterTunables::load_or_create(&cfg.configuration_path, cfg.camera_model)?;
            let (filter, cell, dump) = DisparityFilter::new(
                STAGE_BANDS,
                tunables,
                width,
                height,
                cfg.configuration_path.clone(),
            )?;
            (Some(filter), Some(cell), Some(dump))
        } else {
            (None, None, None)
        };

        let decoder = if cfg.enabled_stages.frame_decoder {
            decoder
        } else {
            None
        };

        let ingress: Arc<FrameRing<ImageFrame>> =
            FrameRing::new(true, true, cfg.max_buffer_count, || {
                ImageFrame::with_max_size(width, height)
            });
        let egress: Arc<FrameRing<ResultFrame>> =
            FrameRing::new(false, false, cfg.max_buffer_count, || {
                ResultFrame::with_max_size(width, height)
            });

        let shared = Arc::new(EngineShared {
            wake: WakeSemaphore::new(),
            mode: Mutex::new(StartMode::default()),
            running: AtomicBool::new(false),
            terminate_request: AtomicBool::new(false),
            terminate_done: AtomicBool::new(false),
            stats: EngineStats::default(),
        });

        let worker = Worker {
            shared: Arc::clone(&shared),
            ingress: Arc::clone(&ingress),
            egress: Arc::clone(&egress),
            matcher,
            filter,
            decoder: decoder.clone(),
            scratch: BlockDisparity::with_max_size(width, height),
            last_completed: None,
        };

        let handle = std::thread::Builder::new()
            .name("pipeline-worker".to_string())
            .spawn(move || worker.run())
            .map_err(|e| StereoError::Resource(format!("failed to spawn pipeline worker: {e}")))?;

        tracing::info!(
            width,
            height,
            buffers = cfg.max_buffer_count,
            model = ?cfg.camera_model,
            "pipeline engine initialised"
        );

        Ok(Self {
            cfg,
            shared,
            ingress,
            egress,
            worker: Some(handle),
            matcher_params,
            filter_params,
            filter_dump,
            decoder,
            terminated: false,
        })
    }

    /// Begin processing with the given stage selection.
    pub fn start(&self, mode: StartMode) -> StereoResult<()> {
        if self.is_terminated() {
            return Err(StereoError::NotRunning);
        }
        if mode.stereo_matching && self.matcher_params.is_none() {
            return Err(StereoError::Configuration(
                "stereo matching requested but not enabled at init".to_string(),
            ));
        }
        if mode.frame_decoder && !mode.stereo_matching && self.decoder.is_none() {
            return Err(StereoError::Configuration(
                "frame decoder requested but no decoder installed".to_string(),
            ));
        }
        if mode.disparity_filter && self.filter_params.is_none() {
            return Err(StereoError::Configuration(
                "disparity filter requested but not enabled at init".to_string(),
            ));
        }

        *self.shared.mode.lock() = mode;
        self.shared.running.store(true, Ordering::Release);
        tracing::info!(?mode, "pipeline started");
        Ok(())
    }

    /// Stop the pipeline: request termination, wake the worker once, and
    /// poll for its acknowledgement at 10 ms for up to 1 s.
    pub fn stop(&self) -> StereoResult<()> {
        if self.shared.terminate_done.load(Ordering::Acquire) {
            return Ok(());
        }

        self.shared.running.store(false, Ordering::Release);
        self.shared.terminate_request.store(true, Ordering::Release);
        self.shared.wake.release();

        for _ in 0..STOP_POLL_COUNT {
            if self.shared.terminate_done.load(Ordering::Acquire) {
                break;
            }
            std::thread::sleep(WAIT_INTERVAL);
        }

        if self.shared.terminate_done.load(Ordering::Acquire) {
            tracing::info!("pipeline stopped");
        } else {
            tracing::warn!("pipeline worker did not acknowledge stop within 1s");
        }
        Ok(())
    }

    /// Submit a frame for processing. The frame is deep-copied into an
    /// ingress slot; the oldest unprocessed frame is overwritten when the
    /// pipeline falls behind.
    pub fn submit(&self, frame: &ImageFrame) -> StereoResult<()> {
        if self.is_terminated() {
            return Err(StereoError::NotRunning);
        }

        let timestamp = Utc::now().timestamp_millis().max(0) as u64;
        let mut slot = self.ingress.acquire_put(timestamp)?;
        slot.copy_from(frame);
        slot.commit(true);
        self.shared.wake.release();

        tracing::trace!(frame = frame.frame_no(), "frame submitted");
        Ok(())
    }

    /// Fetch the next completed result, copying it into `out`. Never
    /// blocks: returns `NoData` immediately when nothing is pending.
    pub fn fetch_result(&self, out: &mut ResultFrame) -> StereoResult<()> {
        match self.egress.acquire_get() {
            Ok(slot) => {
                out.copy_from(&slot);
                Ok(())
            }
            Err(StereoError::NoData) => {
                if self.is_terminated() {
                    Err(StereoError::NotRunning)
                } else {
                    Err(StereoError::NoData)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Tear down the worker thread. Idempotent; also called on drop.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        let _ = self.stop();
        if let Some(handle) = self.worker.take() {
            if self.shared.terminate_done.load(Ordering::Acquire) {
                let _ = handle.join();
            } else {
                tracing::warn!("abandoning unresponsive pipeline worker");
            }
        }
        self.terminated = true;
        tracing::info!("pipeline engine terminated");
    }

    fn is_terminated(&self) -> bool {
        self.terminated || self.shared.terminate_request.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Stage registry & parameters
    // ------------------------------------------------------------------

    /// Number of stages the engine knows about.
    pub fn stage_count(&self) -> usize {
        3
    }

    /// Display name of a stage.
    pub fn stage_name(&self, index: usize) -> StereoResult<&'static str> {
        match index {
            0 => Ok(matcher::STAGE_NAME),
            1 => Ok(DECODER_STAGE_NAME),
            2 => Ok(filter::STAGE_NAME),
            _ => Err(StereoError::UnknownStage(index)),
        }
    }

    /// Flat parameter view of a stage.
    pub fn stage_parameters(&self, index: usize) -> StereoResult<ParameterSet> {
        match index {
            0 => self
                .matcher_params
                .as_ref()
                .map(|cell| cell.snapshot().parameter_set())
                .ok_or_else(|| StereoError::Configuration("stage not enabled".to_string())),
            1 => Ok(self
                .decoder
                .as_ref()
                .map(|d| d.lock().parameter_set())
                .unwrap_or_default()),
            2 => self
                .filter_params
                .as_ref()
                .map(|cell| cell.snapshot().parameter_set())
                .ok_or_else(|| StereoError::Configuration("stage not enabled".to_string())),
            _ => Err(StereoError::UnknownStage(index)),
        }
    }

    /// Apply a flat parameter view to a stage. The worker observes the
    /// update at the top of its next invocation. With `persist`, the
    /// stage's parameter file is rewritten as well.
    pub fn set_stage_parameters(
        &self,
        index: usize,
        set: &ParameterSet,
        persist: bool,
    ) -> StereoResult<()> {
        match index {
            0 => {
                let cell = self
                    .matcher_params
                    .as_ref()
                    .ok_or_else(|| StereoError::Configuration("stage not enabled".to_string()))?;
                let mut tunables = cell.snapshot();
                tunables.apply_parameter_set(set)?;
                if persist {
                    tunables.save(&MatcherTunables::file_path(
                        &self.cfg.configuration_path,
                        self.cfg.camera_model,
                    ))?;
                }
                cell.store(tunables);
                Ok(())
            }
            1 => match self.decoder.as_ref() {
                Some(decoder) => decoder.lock().apply_parameter_set(set),
                None => Err(StereoError::Configuration(
                    "no frame decoder installed".to_string(),
                )),
            },
            2 => {
                let cell = self
                    .filter_params
                    .as_ref()
                    .ok_or_else(|| StereoError::Configuration("stage not enabled".to_string()))?;
                let mut tunables = cell.snapshot();
                tunables.apply_parameter_set(set)?;
                if persist {
                    tunables.save(&FilterTunables::file_path(
                        &self.cfg.configuration_path,
                        self.cfg.camera_model,
                    ))?;
                }
                cell.store(tunables);
                Ok(())
            }
            _ => Err(StereoError::UnknownStage(index)),
        }
    }

    /// Reload a stage's tunables from an arbitrary parameter file.
    pub fn reload_stage_parameters_from_file(
        &self,
        index: usize,
        path: &Path,
    ) -> StereoResult<()> {
        match index {
            0 => {
                let cell = self
                    .matcher_params
                    .as_ref()
                    .ok_or_else(|| StereoError::Configuration("stage not enabled".to_string()))?;
                cell.store(MatcherTunables::load(path)?);
                Ok(())
            }
            1 => Err(StereoError::Configuration(
                "frame decoder parameters are managed by the decoder collaborator".to_string(),
            )),
            2 => {
                let cell = self
                    .filter_params
                    .as_ref()
                    .ok_or_else(|| StereoError::Configuration("stage not enabled".to_string()))?;
                cell.store(FilterTunables::load(path)?);
                Ok(())
            }
            _ => Err(StereoError::UnknownStage(index)),
        }
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Frames lost to ingress overwriting plus frames the worker dropped on
    /// egress backpressure.
    pub fn frames_dropped(&self) -> u64 {
        self.ingress.dropped() + self.shared.stats.frames_dropped.load(Ordering::Relaxed)
    }

    /// Invariant violations observed by the worker.
    pub fn hard_errors(&self) -> u64 {
        self.shared.stats.hard_errors.load(Ordering::Relaxed)
    }

    /// Write the averaged block grid of the next processed frame as CSV.
    pub fn request_block_dump(&self) {
        if let Some(dump) = &self.filter_dump {
            dump.store(true, Ordering::Release);
        }
    }

    /// Number of committed results waiting in the egress ring.
    pub fn pending_results(&self) -> usize {
        self.egress.committed()
    }
}

impl Drop for StereoEngine {
    fn drop(&mut self) {
        self.terminate();
    }
}

// ============================================================================
// Worker
// ============================================================================

struct Worker {
    shared: Arc<EngineShared>,
    ingress: Arc<FrameRing<ImageFrame>>,
    egress: Arc<FrameRing<ResultFrame>>,
    matcher: Option<StereoMatcher>,
    filter: Option<DisparityFilter>,
    decoder: Option<SharedDecoder>,
    scratch: BlockDisparity,
    last_completed: Option<Instant>,
}

impl Worker {
    fn run(mut self) {
        tracing::debug!("pipeline worker running");

        loop {
            if self.shared.terminate_request.load(Ordering::Acquire) {
                break;
            }
            if !self.shared.running.load(Ordering::Acquire) {
                // Paused: leave submitted wakeups pending for start.
                std::thread::sleep(WAIT_INTERVAL);
                continue;
            }
            if !self.shared.wake.acquire_timeout(WAIT_INTERVAL) {
                continue;
            }
            if self.shared.terminate_request.load(Ordering::Acquire) {
                break;
            }
            self.drain_one();
        }

        self.shared.terminate_done.store(true, Ordering::Release);
        tracing::debug!("pipeline worker exited");
    }

    fn drain_one(&mut self) {
        let input = match self.ingress.acquire_get() {
            Ok(slot) => slot,
            Err(StereoError::NoData) => return,
            Err(e) => {
                self.shared.stats.hard_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "ingress ring failure");
                return;
            }
        };

        let timestamp = input.timestamp();
        let mut output = match self.egress.acquire_put(timestamp) {
            Ok(slot) => slot,
            Err(StereoError::NoSlot) => {
                // Backpressure: release the frame without a result.
                self.shared.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(frame = input.frame_no(), "egress full, dropping frame");
                return;
            }
            Err(e) => {
                self.shared.stats.hard_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "egress ring failure");
                return;
            }
        };

        let mode = *self.shared.mode.lock();
        let valid = self.process(&input, &mut output, mode);
        output.commit(valid);
    }

    fn process(&mut self, input: &ImageFrame, result: &mut ResultFrame, mode: StartMode) -> bool {
        result.clear();
        result.image.copy_from(input);

        if mode.stereo_matching {
            self.run_matching(input, result, mode.disparity_filter);
        } else if mode.frame_decoder {
            self.run_decoding(input, result, mode.disparity_filter);
        }
        // Both stages off: pass-through copy.

        let now = Instant::now();
        result.proc.tact_time = self
            .last_completed
            .map(|t| now.duration_since(t).as_millis() as u64)
            .unwrap_or(0);
        self.last_completed = Some(now);
        result.completed_at = Some(Utc::now());

        tracing::debug!(
            frame = input.frame_no(),
            error_code = result.proc.error_code,
            "frame processed"
        );
        true
    }

    fn run_matching(&mut self, input: &ImageFrame, result: &mut ResultFrame, with_filter: bool) {
        let Some(matcher) = self.matcher.as_mut() else {
            result.proc.error_code = -1;
            result.proc.stage_status.push(StageStatus {
                name: matcher::STAGE_NAME.to_string(),
                error_code: -1,
                processing_time: Duration::ZERO,
            });
            return;
        };

        let latest = input.slot(FrameSlot::Latest);

        let begun = Instant::now();
        let status = matcher.matching(&latest.p1, &latest.p2, &mut self.scratch);
        let code = stage_code(&status);
        result.proc.stage_status.push(StageStatus {
            name: matcher::STAGE_NAME.to_string(),
            error_code: code,
            processing_time: begun.elapsed(),
        });
        if code != 0 {
            result.proc.error_code = code;
            return;
        }

        let mut filtered = false;
        if with_filter {
            if let Some(filter) = self.filter.as_mut() {
                let begun = Instant::now();
                match filter.average_disparity(&latest.p1, &mut self.scratch) {
                    Ok(applied) => {
                        filtered = applied;
                        result.proc.stage_status.push(StageStatus {
                            name: filter::STAGE_NAME.to_string(),
                            error_code: 0,
                            processing_time: begun.elapsed(),
                        });
                    }
                    Err(e) => {
                        let code = stage_code(&Err(e));
                        result.proc.stage_status.push(StageStatus {
                            name: filter::STAGE_NAME.to_string(),
                            error_code: code,
                            processing_time: begun.elapsed(),
                        });
                        result.proc.error_code = code;
                    }
                }
            }
        }

        if !filtered {
            if let Some(matcher) = self.matcher.as_ref() {
                matcher.spread_disparity(&mut self.scratch);
            }
        }

        write_outputs(&self.scratch, result);
    }

    fn run_decoding(&mut self, input: &ImageFrame, result: &mut ResultFrame, with_filter: bool) {
        let Some(decoder) = self.decoder.clone() else {
            result.proc.error_code = -1;
            result.proc.stage_status.push(StageStatus {
                name: DECODER_STAGE_NAME.to_string(),
                error_code: -1,
                processing_time: Duration::ZERO,
            });
            return;
        };

        let begun = Instant::now();
        let status = {
            let mut decoder = decoder.lock();
            if input.shutter_mode == ShutterMode::DoubleCombined {
                decoder.decode_double_shutter(input, &mut result.image, &mut self.scratch)
            } else {
                decoder.decode(input, &mut result.image, &mut self.scratch)
            }
        };
        let code = stage_code(&status);
        result.proc.stage_status.push(StageStatus {
            name: DECODER_STAGE_NAME.to_string(),
            error_code: code,
            processing_time: begun.elapsed(),
        });
        if code != 0 {
            result.proc.error_code = code;
            return;
        }

        let mut filtered = false;
        if with_filter {
            if let Some(filter) = self.filter.as_mut() {
                // Edge detection runs on the merged image when the decoder
                // produced one.
                let merged = result.image.slot(FrameSlot::Merged);
                let reference = if merged.p1.is_present() {
                    &merged.p1
                } else {
                    &input.slot(FrameSlot::Latest).p1
                };

                let begun = Instant::now();
                match filter.average_disparity(reference, &mut self.scratch) {
                    Ok(applied) => {
                        filtered = applied;
                        result.proc.stage_status.push(StageStatus {
                            name: filter::STAGE_NAME.to_string(),
                            error_code: 0,
                            processing_time: begun.elapsed(),
                        });
                    }
                    Err(e) => {
                        let code = stage_code(&Err(e));
                        result.proc.stage_status.push(StageStatus {
                            name: filter::STAGE_NAME.to_string(),
                            error_code: code,
                            processing_time: begun.elapsed(),
                        });
                        result.proc.error_code = code;
                    }
                }
            }
        }

        if !filtered {
            filter::disparity_image(&mut self.scratch, &crate::filter::LimitParams::default());
        }

        write_outputs(&self.scratch, result);
    }
}

/// Copy the per-pixel outputs of the stage chain into the result slot.
fn write_outputs(scratch: &BlockDisparity, result: &mut ResultFrame) {
    let g = scratch.geom;
    if g.image_width == 0 {
        return;
    }
    let n = g.image_width * g.image_height;

    result
        .disparity_display
        .fill(g.image_width, g.image_height, 1, &scratch.display[..n]);

    let depth = &mut result.image.slot_mut(FrameSlot::Latest).depth;
    depth.width = g.image_width;
    depth.height = g.image_height;
    depth.data[..n].copy_from_slice(&scratch.pixel_disp[..n]);
}

fn stage_code(status: &StereoResult<()>) -> i32 {
    match status {
        Ok(()) => 0,
        Err(StereoError::Stage { code, .. }) => *code,
        Err(_) => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnabledStages, LogLevel};

    fn test_config(dir: &Path) -> EngineConfig {
        EngineConfig {
            max_image_width: 320,
            max_image_height: 64,
            max_buffer_count: 4,
            enabled_stages: EnabledStages {
                stereo_matching: true,
                frame_decoder: false,
                disparity_filter: true,
            },
            configuration_path: dir.to_path_buf(),
            log_path: None,
            log_level: LogLevel::Warn,
            camera_model: crate::config::CameraModel::Xc,
        }
    }

    #[test]
    fn test_init_creates_parameter_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = StereoEngine::init(test_config(dir.path())).unwrap();

        assert!(dir.path().join("StereoMatchingParameter_XC.ini").exists());
        assert!(dir.path().join("DisparityFilterParameter_XC.ini").exists());
        engine.terminate();
    }

    #[test]
    fn test_init_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.max_buffer_count = 0;
        assert!(matches!(
            StereoEngine::init(cfg),
            Err(StereoError::Configuration(_))
        ));
    }

    #[test]
    fn test_stage_registry() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = StereoEngine::init(test_config(dir.path())).unwrap();

        assert_eq!(engine.stage_count(), 3);
        assert_eq!(engine.stage_name(0).unwrap(), "Stereo Matching");
        assert_eq!(engine.stage_name(1).unwrap(), "Frame Decoder");
        assert_eq!(engine.stage_name(2).unwrap(), "Disparity Filter");
        assert!(matches!(
            engine.stage_name(3),
            Err(StereoError::UnknownStage(3))
        ));
        engine.terminate();
    }

    #[test]
    fn test_start_rejects_missing_decoder() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.enabled_stages.frame_decoder = true;
        let mut engine = StereoEngine::init(cfg).unwrap();

        let mode = StartMode {
            stereo_matching: false,
            frame_decoder: true,
            disparity_filter: false,
        };
        assert!(matches!(
            engine.start(mode),
            Err(StereoError::Configuration(_))
        ));
        engine.terminate();
    }

    #[test]
    fn test_parameter_update_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = StereoEngine::init(test_config(dir.path())).unwrap();

        let mut set = engine.stage_parameters(0).unwrap();
        assert!(set.set(
            "Matching",
            "crstthr",
            crate::params::ParameterValue::Int(66)
        ));
        engine.set_stage_parameters(0, &set, true).unwrap();

        // Persisted to the model-specific file.
        let reloaded =
            MatcherTunables::load(&dir.path().join("StereoMatchingParameter_XC.ini")).unwrap();
        assert_eq!(reloaded.matching.contrast_threshold, 66);

        // And readable back through the registry.
        let round = engine.stage_parameters(0).unwrap();
        assert_eq!(
            round.get("Matching", "crstthr").map(|e| e.value.as_i32()),
            Some(66)
        );
        engine.terminate();
    }

    #[test]
    fn test_reload_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = StereoEngine::init(test_config(dir.path())).unwrap();

        let path = dir.path().join("alternative.ini");
        let mut tunables = MatcherTunables::default();
        tunables.matching.depth = 64;
        tunables.save(&path).unwrap();

        engine.reload_stage_parameters_from_file(0, &path).unwrap();
        let set = engine.stage_parameters(0).unwrap();
        assert_eq!(
            set.get("Matching", "depth").map(|e| e.value.as_i32()),
            Some(64)
        );
        engine.terminate();
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = StereoEngine::init(test_config(dir.path())).unwrap();
        engine.terminate();
        engine.terminate();
        assert!(matches!(
            engine.submit(&ImageFrame::with_max_size(8, 8)),
            Err(StereoError::NotRunning)
        ));
    }

    #[test]
    fn test_wake_semaphore_is_binary() {
        let sem = WakeSemaphore::new();
        sem.release();
        sem.release();
        sem.release();
        assert!(sem.acquire_timeout(Duration::from_millis(1)));
        // Extra releases saturated into the single permit.
        assert!(!sem.acquire_timeout(Duration::from_millis(1)));
    }
}
