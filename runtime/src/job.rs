//! Job controller
//!
//! Drives one burst through the state machine
//! `Captured -> Gating -> Aligning -> Tiling -> Stitching -> Validating ->
//! Done`, with `Cancelled` and `Failed` reachable from any non-terminal
//! state. Tiles run on a bounded worker pool; the controller thread is the
//! single writer that commits tiles, persists checkpoints and emits
//! progress.

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::device::DeviceCapabilities;
use crate::progress::{ProgressSink, Stage};
use crate::{JobError, Result};
use burst_align::{AlignmentEngine, AlignmentMap, FrameGate};
use burst_core::{CapturedFrame, FrameSet};
use burst_fusion::{
    stitch, FinishedTile, FusionAccumulator, FusionConfig, FusionError, QualityMetrics,
    QualityValidator, RefineStage, ResultStatus, TileGrid, TileRegion, TileStats,
};
use burst_imgproc::{laplacian_variance, pyr_down, resize_rgb, Interpolation};
use image::RgbImage;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Foreground,
    Background,
}

/// Cooperative cancellation flag, checked at tile granularity.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runtime-mutable job priority shared between handle and workers.
#[derive(Debug, Clone)]
pub struct PriorityHandle(Arc<AtomicU8>);

impl PriorityHandle {
    pub fn new(priority: Priority) -> Self {
        let h = Self(Arc::new(AtomicU8::new(0)));
        h.set(priority);
        h
    }

    pub fn set(&self, priority: Priority) {
        let v = match priority {
            Priority::Foreground => 0,
            Priority::Background => 1,
        };
        self.0.store(v, Ordering::SeqCst);
    }

    pub fn get(&self) -> Priority {
        match self.0.load(Ordering::SeqCst) {
            0 => Priority::Foreground,
            _ => Priority::Background,
        }
    }
}

#[derive(Clone)]
pub struct JobOptions {
    pub fusion: FusionConfig,
    pub gate: FrameGate,
    pub alignment: AlignmentEngine,
    /// `None` disables refinement outright; background priority skips it
    /// per tile either way.
    pub refinement: Option<RefineStage>,
    pub validator: QualityValidator,
    pub capabilities: DeviceCapabilities,
    pub priority: Priority,
    pub timeout: Option<Duration>,
    /// Explicit seed source from a previous alignment of the same burst.
    pub cached_alignment: Option<AlignmentMap>,
    pub checkpoint_store: Option<Arc<dyn CheckpointStore>>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            fusion: FusionConfig::default(),
            gate: FrameGate::default(),
            alignment: AlignmentEngine::default(),
            refinement: Some(RefineStage::default()),
            validator: QualityValidator::default(),
            capabilities: DeviceCapabilities::probe(),
            priority: Priority::Foreground,
            timeout: None,
            cached_alignment: None,
            checkpoint_store: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FusionResult {
    pub image: RgbImage,
    pub metrics: QualityMetrics,
    pub rejected_frame_count: usize,
    pub status: ResultStatus,
}

/// One burst submission: frames, options and the control channels.
pub struct PipelineJob {
    pub id: u64,
    frames: Vec<CapturedFrame>,
    options: JobOptions,
    cancel: CancelToken,
    priority: PriorityHandle,
    progress: ProgressSink,
}

impl PipelineJob {
    pub fn new(id: u64, frames: Vec<CapturedFrame>, options: JobOptions) -> Self {
        let priority = PriorityHandle::new(options.priority);
        Self {
            id,
            frames,
            options,
            cancel: CancelToken::new(),
            priority,
            progress: ProgressSink::disabled(),
        }
    }

    pub fn with_channels(
        mut self,
        cancel: CancelToken,
        priority: PriorityHandle,
        progress: ProgressSink,
    ) -> Self {
        self.cancel = cancel;
        self.priority = priority;
        self.progress = progress;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn priority_handle(&self) -> PriorityHandle {
        self.priority.clone()
    }
}

enum TileMessage {
    Done(Box<FinishedTile>),
    Skipped(usize),
    Failed(usize, FusionError),
}

pub struct JobController;

impl JobController {
    pub fn run(job: PipelineJob) -> Result<FusionResult> {
        let PipelineJob {
            id,
            frames,
            options,
            cancel,
            priority,
            progress,
        } = job;

        let scale = options.fusion.scale_factor.max(1);
        let input_count = frames.len();
        let store = options.checkpoint_store.clone();

        let started = Instant::now();
        let deadline = options.timeout.map(|t| started + t);

        progress.emit(Stage::Captured, 0, 0);
        check_cancelled(&cancel, id, store.as_deref(), &progress)?;

        // Gating and alignment resolve globally before any tile work, so a
        // doomed burst never wastes tile computation.
        progress.emit(Stage::Gating, 0, 0);
        let mut set = match options.gate.gate(frames.clone()) {
            Ok(set) => set,
            Err(e) => {
                log::warn!("job {id}: gating failed ({e}), using single-frame fallback");
                let reference = sharpest_raw(&frames)
                    .ok_or_else(|| JobError::Worker("empty burst submission".into()))?;
                return finish_single_frame(
                    reference,
                    input_count,
                    scale,
                    id,
                    store.as_deref(),
                    &progress,
                );
            }
        };
        check_cancelled(&cancel, id, store.as_deref(), &progress)?;

        progress.emit(Stage::Aligning, 0, 0);
        let alignment = match options
            .alignment
            .align(&mut set, options.cached_alignment.as_ref())
        {
            Ok(map) => map,
            Err(e) => {
                log::warn!("job {id}: alignment failed ({e}), using single-frame fallback");
                return finish_single_frame(
                    set.reference(),
                    input_count,
                    scale,
                    id,
                    store.as_deref(),
                    &progress,
                );
            }
        };
        let rejected = input_count - alignment.included_count();
        check_cancelled(&cancel, id, store.as_deref(), &progress)?;

        let out_w = set.width() * scale;
        let out_h = set.height() * scale;
        let grid = match TileGrid::for_budget(
            out_w,
            out_h,
            options.fusion.tile_size,
            options.fusion.overlap,
            scale,
            set.len(),
            &options.capabilities.budget(),
        ) {
            Ok(grid) => grid,
            Err(FusionError::MemoryPressure(msg)) => {
                log::error!("job {id}: cannot schedule tiles ({msg}), degrading to single frame");
                return finish_single_frame(
                    set.reference(),
                    input_count,
                    scale,
                    id,
                    store.as_deref(),
                    &progress,
                );
            }
            Err(e) => return Err(JobError::Worker(e.to_string())),
        };

        let total = grid.len();
        let mut committed: Vec<Option<FinishedTile>> = vec![None; total];

        if let Some(store) = &store {
            match store.load(id) {
                Ok(Some(ckpt))
                    if ckpt.output_width == out_w
                        && ckpt.output_height == out_h
                        && ckpt.tile_size == grid.tile_size
                        && ckpt.overlap == grid.overlap
                        && ckpt.committed.len() == total =>
                {
                    log::info!(
                        "job {id}: resuming at tile {} of {total}",
                        ckpt.resume_point()
                    );
                    let flags = ckpt.committed;
                    for tile in ckpt.tiles {
                        let index = tile.region.index;
                        if index < total && flags[index] {
                            committed[index] = Some(tile);
                        }
                    }
                }
                Ok(Some(_)) => {
                    log::warn!("job {id}: checkpoint geometry mismatch, starting fresh");
                }
                Ok(None) => {}
                Err(e) => log::warn!("job {id}: checkpoint load failed: {e}"),
            }
        }

        let done = committed.iter().filter(|t| t.is_some()).count();
        progress.emit(Stage::Tiling, done, total);

        let pending: Vec<TileRegion> = grid
            .tiles()
            .iter()
            .filter(|r| committed[r.index].is_none())
            .copied()
            .collect();

        if !pending.is_empty() {
            run_tiling(
                id,
                &pending,
                &mut committed,
                &set,
                &alignment,
                &options,
                &grid,
                (out_w, out_h),
                &cancel,
                &priority,
                &progress,
                store.as_deref(),
                deadline,
                started,
            )?;
        }
        check_cancelled(&cancel, id, store.as_deref(), &progress)?;

        progress.emit(Stage::Stitching, total, total);
        let tiles: Vec<FinishedTile> = committed.into_iter().flatten().collect();
        if tiles.len() != total {
            return Err(JobError::Worker(format!(
                "{} of {total} tiles missing after tiling",
                total - tiles.len()
            )));
        }
        let image = stitch(&tiles, out_w, out_h, grid.overlap);

        progress.emit(Stage::Validating, total, total);
        let stats: Vec<TileStats> = tiles.iter().map(|t| t.stats).collect();
        let metrics = options.validator.validate(
            &image,
            set.reference().image(),
            &stats,
            alignment.mean_confidence(),
            rejected,
        );

        if let Some(store) = &store {
            if let Err(e) = store.clear(id) {
                log::warn!("job {id}: checkpoint clear failed: {e}");
            }
        }

        progress.emit(Stage::Done, total, total);
        log::info!(
            "job {id}: done in {} ms, detail gain {:.3}, {} rejected frame(s)",
            started.elapsed().as_millis(),
            metrics.detail_gain,
            rejected
        );

        Ok(FusionResult {
            image,
            status: metrics.status,
            rejected_frame_count: rejected,
            metrics,
        })
    }
}

/// Fan pending tiles out to the worker pool and commit results one at a
/// time on this thread. Timeout and cancellation are observed between tile
/// commits only; a tile either commits whole or not at all.
#[allow(clippy::too_many_arguments)]
fn run_tiling(
    id: u64,
    pending: &[TileRegion],
    committed: &mut [Option<FinishedTile>],
    set: &FrameSet,
    alignment: &AlignmentMap,
    options: &JobOptions,
    grid: &TileGrid,
    output: (u32, u32),
    cancel: &CancelToken,
    priority: &PriorityHandle,
    progress: &ProgressSink,
    store: Option<&dyn CheckpointStore>,
    deadline: Option<Instant>,
    started: Instant,
) -> Result<()> {
    let total = grid.len();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.capabilities.worker_threads)
        .thread_name(|i| format!("sr-tile-{i}"))
        .build()
        .map_err(|e| JobError::Worker(e.to_string()))?;

    let shared_set = Arc::new(set.clone());
    let shared_alignment = Arc::new(alignment.clone());
    let accumulator = Arc::new(FusionAccumulator::new(
        options.fusion.loss,
        options.fusion.irls_iterations,
        options.fusion.scale_factor.max(1),
    ));
    let refinement = options.refinement.clone().map(Arc::new);
    let ceiling = options.capabilities.tile_working_set_bytes;

    let (tx, rx) = mpsc::channel::<TileMessage>();
    for region in pending.iter().copied() {
        let tx = tx.clone();
        let set = Arc::clone(&shared_set);
        let alignment = Arc::clone(&shared_alignment);
        let accumulator = Arc::clone(&accumulator);
        let refinement = refinement.clone();
        let cancel = cancel.clone();
        let priority = priority.clone();

        pool.spawn(move || {
            if cancel.is_cancelled() {
                let _ = tx.send(TileMessage::Skipped(region.index));
                return;
            }
            if priority.get() == Priority::Background {
                std::thread::yield_now();
            }

            // Background jobs trade the polish pass for less CPU time;
            // counts and fused values are unaffected.
            let refine = match priority.get() {
                Priority::Foreground => refinement.as_deref(),
                Priority::Background => None,
            };

            let message = match fuse_tile(&region, &set, &alignment, &accumulator, refine, ceiling)
            {
                Ok(tile) => TileMessage::Done(Box::new(tile)),
                Err(e) => TileMessage::Failed(region.index, e),
            };
            let _ = tx.send(message);
        });
    }
    drop(tx);

    let mut outcome: Option<JobError> = None;
    let mut remaining = pending.len();

    while remaining > 0 {
        let message = match rx.recv() {
            Ok(m) => m,
            Err(_) => break,
        };
        remaining -= 1;

        if outcome.is_none() {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    log::warn!("job {id}: wall-clock budget exhausted");
                    outcome = Some(JobError::Timeout {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                    cancel.cancel();
                }
            }
        }
        if outcome.is_none() && cancel.is_cancelled() {
            outcome = Some(JobError::Cancelled);
        }

        match message {
            TileMessage::Done(tile) if outcome.is_none() => {
                let index = tile.region.index;
                committed[index] = Some(*tile);
                let done = committed.iter().filter(|t| t.is_some()).count();

                if let Some(store) = store {
                    save_checkpoint(store, id, output, grid, committed);
                }
                progress.emit(Stage::Tiling, done, total);

                if priority.get() == Priority::Background {
                    // Pacing yield between tile commits.
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            // Results landing after cancel/timeout are discarded, never
            // half-committed.
            TileMessage::Done(_) | TileMessage::Skipped(_) => {}
            TileMessage::Failed(index, FusionError::MemoryPressure(msg)) => {
                if outcome.is_none() {
                    log::error!("job {id}: tile {index} memory pressure: {msg}");
                    outcome = Some(JobError::MemoryPressure(msg));
                    cancel.cancel();
                }
            }
            TileMessage::Failed(index, e) => {
                if outcome.is_none() {
                    outcome = Some(JobError::Worker(format!("tile {index}: {e}")));
                    cancel.cancel();
                }
            }
        }
    }

    let done = committed.iter().filter(|t| t.is_some()).count();
    match outcome {
        None => Ok(()),
        Some(JobError::Cancelled) => {
            if let Some(store) = store {
                let _ = store.clear(id);
            }
            progress.emit(Stage::Cancelled, done, total);
            Err(JobError::Cancelled)
        }
        Some(err) => {
            // Timeout keeps its checkpoint so the job can resume later.
            progress.emit(Stage::Failed, done, total);
            Err(err)
        }
    }
}

/// Fuse one tile, splitting into quadrants once when the measured working
/// set exceeds the ceiling.
fn fuse_tile(
    region: &TileRegion,
    set: &FrameSet,
    alignment: &AlignmentMap,
    accumulator: &FusionAccumulator,
    refinement: Option<&RefineStage>,
    ceiling: usize,
) -> std::result::Result<FinishedTile, FusionError> {
    let scale = accumulator.scale;

    if measured_working_set(region, set, alignment, scale) <= ceiling {
        let mut tile = accumulator.accumulate(region, set, alignment);
        if let Some(stage) = refinement {
            stage.refine(&mut tile);
        }
        return Ok(tile);
    }

    log::warn!(
        "tile {}: working set over ceiling, retrying as quadrants",
        region.index
    );

    let quadrants = split_region(region);
    for q in &quadrants {
        let need = measured_working_set(q, set, alignment, scale);
        if need > ceiling {
            return Err(FusionError::MemoryPressure(format!(
                "tile {} quadrant needs {need} bytes, ceiling {ceiling}",
                region.index
            )));
        }
    }

    let area = region.ext_area();
    let mut pixels = vec![0.0f32; area * 3];
    let mut counts = vec![0u16; area];
    let mut confidence_weighted = 0.0f64;

    for q in &quadrants {
        let sub = accumulator.accumulate(q, set, alignment);
        let off_x = (q.ext_x - region.ext_x) as usize;
        let off_y = (q.ext_y - region.ext_y) as usize;
        let sub_w = q.ext_width as usize;

        for row in 0..q.ext_height as usize {
            let src = row * sub_w;
            let dst = (off_y + row) * region.ext_width as usize + off_x;
            counts[dst..dst + sub_w].copy_from_slice(&sub.counts[src..src + sub_w]);
            pixels[dst * 3..(dst + sub_w) * 3].copy_from_slice(&sub.pixels[src * 3..(src + sub_w) * 3]);
        }
        confidence_weighted += sub.stats.mean_confidence as f64 * q.ext_area() as f64;
    }

    let covered = counts.iter().filter(|&&c| c > 0).count();
    let contribution_total: u64 = counts.iter().map(|&c| c as u64).sum();
    let stats = TileStats {
        mean_contribution: contribution_total as f32 / area as f32,
        coverage: covered as f32 / area as f32,
        mean_confidence: (confidence_weighted / area as f64) as f32,
    };

    let mut tile = FinishedTile {
        region: *region,
        pixels,
        counts,
        stats,
    };
    if let Some(stage) = refinement {
        stage.refine(&mut tile);
    }
    Ok(tile)
}

/// Bytes this tile actually needs at once: the inverse-mapped source window
/// of every included frame plus the accumulation planes.
fn measured_working_set(
    region: &TileRegion,
    set: &FrameSet,
    alignment: &AlignmentMap,
    scale: u32,
) -> usize {
    let mut bytes = region.ext_area() * (3 * 4 + 2);
    for frame in set.frames() {
        if let Some(result) = alignment.get(frame.id) {
            if let Some(window) =
                region.source_window(&result.transform, scale, frame.width(), frame.height())
            {
                bytes += window.width as usize * window.height as usize * 3;
            }
        }
    }
    bytes
}

/// Split a region's extent into four quadrant sub-regions.
fn split_region(region: &TileRegion) -> Vec<TileRegion> {
    let half_w = (region.ext_width / 2).max(1);
    let half_h = (region.ext_height / 2).max(1);

    let mut out = Vec::with_capacity(4);
    for (qx, qy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
        let x = region.ext_x + qx * half_w;
        let y = region.ext_y + qy * half_h;
        let width = if qx == 0 {
            half_w
        } else {
            region.ext_width - half_w
        };
        let height = if qy == 0 {
            half_h
        } else {
            region.ext_height - half_h
        };
        if width == 0 || height == 0 {
            continue;
        }
        out.push(TileRegion {
            index: region.index,
            x,
            y,
            width,
            height,
            ext_x: x,
            ext_y: y,
            ext_width: width,
            ext_height: height,
        });
    }
    out
}

fn save_checkpoint(
    store: &dyn CheckpointStore,
    id: u64,
    output: (u32, u32),
    grid: &TileGrid,
    committed: &[Option<FinishedTile>],
) {
    let checkpoint = Checkpoint {
        job_id: id,
        stage: Stage::Tiling,
        output_width: output.0,
        output_height: output.1,
        tile_size: grid.tile_size,
        overlap: grid.overlap,
        committed: committed.iter().map(|t| t.is_some()).collect(),
        tiles: committed.iter().flatten().cloned().collect(),
    };
    if let Err(e) = store.save(&checkpoint) {
        log::warn!("job {id}: checkpoint save failed: {e}");
    }
}

fn check_cancelled(
    cancel: &CancelToken,
    id: u64,
    store: Option<&dyn CheckpointStore>,
    progress: &ProgressSink,
) -> Result<()> {
    if cancel.is_cancelled() {
        if let Some(store) = store {
            let _ = store.clear(id);
        }
        progress.emit(Stage::Cancelled, 0, 0);
        return Err(JobError::Cancelled);
    }
    Ok(())
}

/// Degraded path: bicubic upscale of the best single frame. Contribution is
/// one frame everywhere and the result is flagged low confidence.
fn finish_single_frame(
    reference: &CapturedFrame,
    input_count: usize,
    scale: u32,
    id: u64,
    store: Option<&dyn CheckpointStore>,
    progress: &ProgressSink,
) -> Result<FusionResult> {
    let image = resize_rgb(
        reference.image(),
        reference.width() * scale,
        reference.height() * scale,
        Interpolation::Cubic,
    );

    if let Some(store) = store {
        let _ = store.clear(id);
    }

    let rejected = input_count.saturating_sub(1);
    let metrics = QualityMetrics::single_frame(rejected);
    progress.emit(Stage::Done, 0, 0);

    Ok(FusionResult {
        image,
        metrics,
        rejected_frame_count: rejected,
        status: ResultStatus::LowConfidence,
    })
}

fn sharpest_raw(frames: &[CapturedFrame]) -> Option<&CapturedFrame> {
    let scores: Vec<f32> = frames
        .iter()
        .map(|f| laplacian_variance(&pyr_down(f.gray())))
        .collect();
    scores
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| &frames[i])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn priority_handle_is_shared() {
        let handle = PriorityHandle::new(Priority::Foreground);
        let clone = handle.clone();
        clone.set(Priority::Background);
        assert_eq!(handle.get(), Priority::Background);
    }

    #[test]
    fn split_region_tiles_the_extent() {
        let region = TileRegion {
            index: 3,
            x: 10,
            y: 20,
            width: 50,
            height: 30,
            ext_x: 8,
            ext_y: 18,
            ext_width: 54,
            ext_height: 34,
        };
        let quadrants = split_region(&region);
        assert_eq!(quadrants.len(), 4);

        let area: usize = quadrants.iter().map(|q| q.ext_area()).sum();
        assert_eq!(area, region.ext_area());
        for q in &quadrants {
            assert_eq!(q.index, 3);
            assert!(q.ext_x >= region.ext_x);
            assert!(q.ext_x + q.ext_width <= region.ext_x + region.ext_width);
        }
    }
}
