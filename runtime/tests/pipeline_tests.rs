use burst_core::{CapturedFrame, ExposureInfo, FrameId, RotationSample};
use burst_fusion::ResultStatus;
use burst_runtime::{
    submit_frames, Checkpoint, CheckpointResult, CheckpointStore, DeviceCapabilities, DeviceTier,
    JobController, JobError, JobOptions, MemoryCheckpointStore, PipelineJob, Priority,
    ProgressEvent, ProgressSink, Stage,
};
use image::RgbImage;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn textured_frame(id: u32, shift: (f32, f32)) -> CapturedFrame {
    let mut img = RgbImage::new(96, 96);
    for y in 0..96 {
        for x in 0..96 {
            let fx = x as f32 - shift.0;
            let fy = y as f32 - shift.1;
            let v = 128.0
                + 70.0 * (fx * 0.35).sin() * (fy * 0.27).cos()
                + 30.0 * (fx * 0.11 + fy * 0.07).sin();
            let v = v.clamp(0.0, 255.0) as u8;
            img.put_pixel(x, y, image::Rgb([v, v, v]));
        }
    }
    CapturedFrame::new(
        FrameId(id),
        img,
        id as u64 * 33,
        RotationSample::default(),
        ExposureInfo::default(),
    )
}

fn burst() -> Vec<CapturedFrame> {
    [(0.0, 0.0), (1.5, 0.5), (-0.5, 1.0), (0.5, -1.5), (2.0, 2.0), (-1.0, -1.0)]
        .iter()
        .enumerate()
        .map(|(i, &s)| textured_frame(i as u32, s))
        .collect()
}

fn test_options() -> JobOptions {
    JobOptions {
        capabilities: DeviceCapabilities::for_tier(DeviceTier::High, 2),
        ..JobOptions::default()
    }
}

/// Store that remembers every checkpoint ever saved, so tests can replay the
/// exact state a process would have held after tile `k`.
#[derive(Default)]
struct RecordingStore {
    inner: MemoryCheckpointStore,
    history: Mutex<Vec<Checkpoint>>,
}

impl CheckpointStore for RecordingStore {
    fn save(&self, checkpoint: &Checkpoint) -> CheckpointResult<()> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(checkpoint.clone());
        self.inner.save(checkpoint)
    }

    fn load(&self, job_id: u64) -> CheckpointResult<Option<Checkpoint>> {
        self.inner.load(job_id)
    }

    fn clear(&self, job_id: u64) -> CheckpointResult<()> {
        self.inner.clear(job_id)
    }
}

fn run_sync(
    id: u64,
    frames: Vec<CapturedFrame>,
    options: JobOptions,
) -> (
    burst_runtime::Result<burst_runtime::FusionResult>,
    Vec<ProgressEvent>,
) {
    let (tx, rx) = mpsc::channel();
    let priority = options.priority;
    let job = PipelineJob::new(id, frames, options).with_channels(
        burst_runtime::CancelToken::new(),
        burst_runtime::PriorityHandle::new(priority),
        ProgressSink::new(tx),
    );
    let result = JobController::run(job);
    let events: Vec<ProgressEvent> = rx.try_iter().collect();
    (result, events)
}

#[test]
fn full_pipeline_reaches_done_with_upscaled_output() {
    let (result, events) = run_sync(1, burst(), test_options());
    let result = result.unwrap();

    assert_eq!(result.image.width(), 192);
    assert_eq!(result.image.height(), 192);
    assert!(result.metrics.mean_contribution >= 2.0);

    assert_eq!(events.first().map(|e| e.stage), Some(Stage::Captured));
    assert_eq!(events.last().map(|e| e.stage), Some(Stage::Done));
    for stage in [Stage::Gating, Stage::Aligning, Stage::Tiling, Stage::Stitching, Stage::Validating] {
        assert!(events.iter().any(|e| e.stage == stage), "missing {stage:?}");
    }

    let tiling: Vec<&ProgressEvent> = events.iter().filter(|e| e.stage == Stage::Tiling).collect();
    assert!(tiling.len() > 1);
    let total = tiling[0].tiles_total;
    assert_eq!(tiling.last().unwrap().tiles_completed, total);
}

#[test]
fn single_frame_burst_degrades_to_low_confidence_upscale() {
    let frames = vec![textured_frame(0, (0.0, 0.0))];
    let (result, _) = run_sync(2, frames, test_options());
    let result = result.unwrap();

    assert_eq!(result.status, ResultStatus::LowConfidence);
    assert_eq!(result.metrics.mean_contribution, 1.0);
    assert_eq!(result.rejected_frame_count, 0);
    assert_eq!(result.image.width(), 192);
    assert_eq!(result.image.height(), 192);
}

#[test]
fn cancel_mid_tiling_reaches_cancelled_and_clears_checkpoint() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let options = JobOptions {
        fusion: burst_fusion::FusionConfig {
            tile_size: 32,
            overlap: 8,
            ..burst_fusion::FusionConfig::default()
        },
        capabilities: DeviceCapabilities::for_tier(DeviceTier::Low, 1),
        checkpoint_store: Some(store.clone()),
        // Background pacing widens the window between commits so the
        // cancellation below always lands mid-tiling.
        priority: Priority::Background,
        ..JobOptions::default()
    };

    let handle = submit_frames(burst(), options).unwrap();
    let id = handle.id();

    // Wait until at least one tile commits, then pull the plug.
    loop {
        let event = handle
            .progress()
            .recv_timeout(Duration::from_secs(30))
            .expect("job stalled before first tile commit");
        if event.stage == Stage::Tiling && event.tiles_completed >= 1 {
            handle.cancel();
            break;
        }
        if matches!(event.stage, Stage::Done | Stage::Failed | Stage::Cancelled) {
            panic!("job finished before cancellation could land");
        }
    }

    match handle.wait() {
        Err(JobError::Cancelled) => {}
        other => panic!("expected Cancelled, got {other:?}"),
    }
    assert!(store.load(id).unwrap().is_none(), "checkpoint must be gone");
}

#[test]
fn resume_after_interruption_reproduces_uninterrupted_output() {
    let frames = burst();

    let mut options = test_options();
    options.fusion.tile_size = 48;
    options.fusion.overlap = 8;

    // Uninterrupted baseline.
    let (baseline, _) = run_sync(10, frames.clone(), options.clone());
    let baseline = baseline.unwrap();

    // A full run whose every checkpoint is recorded.
    let recorder = Arc::new(RecordingStore::default());
    let mut recorded_options = options.clone();
    recorded_options.checkpoint_store = Some(recorder.clone());
    let (recorded, _) = run_sync(11, frames.clone(), recorded_options);
    assert_eq!(
        recorded.unwrap().image.as_raw(),
        baseline.image.as_raw(),
        "checkpointing must not perturb the output"
    );

    // Replay the store state a process would have held after 3 commits.
    let mut snapshot = {
        let history = recorder.history.lock().unwrap();
        history
            .iter()
            .find(|c| c.committed_count() == 3)
            .expect("no checkpoint with 3 commits recorded")
            .clone()
    };
    snapshot.job_id = 12;

    let resumed_store = Arc::new(MemoryCheckpointStore::new());
    resumed_store.save(&snapshot).unwrap();

    let mut resumed_options = options.clone();
    resumed_options.checkpoint_store = Some(resumed_store.clone());
    let (resumed, events) = run_sync(12, frames, resumed_options);
    let resumed = resumed.unwrap();

    // Resume starts at the first uncommitted tile...
    let first_tiling = events
        .iter()
        .find(|e| e.stage == Stage::Tiling)
        .expect("no tiling event");
    assert_eq!(first_tiling.tiles_completed, 3);

    // ...and the final image matches the uninterrupted run exactly.
    assert_eq!(resumed.image.as_raw(), baseline.image.as_raw());
    assert!(resumed_store.load(12).unwrap().is_none());
}

#[test]
fn zero_timeout_fails_between_tiles_with_timeout_error() {
    let mut options = test_options();
    options.timeout = Some(Duration::ZERO);

    let (result, events) = run_sync(20, burst(), options);
    match result {
        Err(JobError::Timeout { .. }) => {}
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert!(events.iter().any(|e| e.stage == Stage::Failed));
}

#[test]
fn background_priority_changes_polish_but_not_contributions() {
    let foreground = run_sync(30, burst(), test_options()).0.unwrap();

    let mut options = test_options();
    options.priority = Priority::Background;
    let (tx, rx) = mpsc::channel();
    let job = PipelineJob::new(31, burst(), options.clone()).with_channels(
        burst_runtime::CancelToken::new(),
        burst_runtime::PriorityHandle::new(Priority::Background),
        ProgressSink::new(tx),
    );
    let background = JobController::run(job).unwrap();
    drop(rx);

    assert_eq!(
        foreground.metrics.mean_contribution,
        background.metrics.mean_contribution
    );
    assert_eq!(foreground.image.width(), background.image.width());
}

#[test]
fn runtime_priority_flip_is_accepted_mid_job() {
    let handle = submit_frames(burst(), test_options()).unwrap();
    handle.set_priority(Priority::Background);
    handle.set_priority(Priority::Foreground);
    let result = handle.wait().unwrap();
    assert_eq!(result.image.width(), 192);
}
