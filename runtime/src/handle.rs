//! Burst submission and job handles
//!
//! `submit_burst` is the entry point the capture subsystem calls; the
//! returned handle carries the lifecycle surface the UI layer drives:
//! priority, cancellation, progress and the final result.

use crate::job::{
    CancelToken, FusionResult, JobController, JobOptions, PipelineJob, Priority, PriorityHandle,
};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::{JobError, Result};
use burst_core::{CapturedFrame, ExposureInfo, FrameId, RotationSample};
use image::RgbImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::thread::JoinHandle;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Nominal burst frame spacing used when the capture layer supplies no
/// timestamps.
const FRAME_INTERVAL_MS: u64 = 33;

pub struct JobHandle {
    id: u64,
    cancel: CancelToken,
    priority: PriorityHandle,
    progress: Receiver<ProgressEvent>,
    worker: Option<JoinHandle<Result<FusionResult>>>,
}

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Request cooperative cancellation; the job stops at its next tile
    /// boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Change priority at runtime; takes effect from the next tile.
    pub fn set_priority(&self, priority: Priority) {
        self.priority.set(priority);
    }

    /// Progress events, one per state transition and tile commit.
    pub fn progress(&self) -> &Receiver<ProgressEvent> {
        &self.progress
    }

    /// Block until the job reaches a terminal state.
    pub fn wait(mut self) -> Result<FusionResult> {
        let worker = self
            .worker
            .take()
            .ok_or_else(|| JobError::Worker("result already consumed".into()))?;
        worker
            .join()
            .map_err(|_| JobError::Worker("job thread panicked".into()))?
    }
}

/// Submit raw burst images with their per-frame motion samples.
pub fn submit_burst(
    images: Vec<RgbImage>,
    motion_samples: Vec<RotationSample>,
    options: JobOptions,
) -> Result<JobHandle> {
    let frames = frames_from_burst(images, motion_samples);
    submit_frames(frames, options)
}

/// Submit pre-built frames (capture layers that track exposure metadata).
pub fn submit_frames(frames: Vec<CapturedFrame>, options: JobOptions) -> Result<JobHandle> {
    spawn_job(NEXT_JOB_ID.fetch_add(1, Ordering::SeqCst), frames, options)
}

/// Resume a previously interrupted job. The capture store re-supplies the
/// burst; committed tiles are restored from the checkpoint store in
/// `options` and are not recomputed.
pub fn resume(
    job_id: u64,
    images: Vec<RgbImage>,
    motion_samples: Vec<RotationSample>,
    options: JobOptions,
) -> Result<JobHandle> {
    let frames = frames_from_burst(images, motion_samples);
    spawn_job(job_id, frames, options)
}

fn frames_from_burst(
    images: Vec<RgbImage>,
    motion_samples: Vec<RotationSample>,
) -> Vec<CapturedFrame> {
    images
        .into_iter()
        .enumerate()
        .map(|(i, image)| {
            let rotation = motion_samples.get(i).copied().unwrap_or_default();
            CapturedFrame::new(
                FrameId(i as u32),
                image,
                i as u64 * FRAME_INTERVAL_MS,
                rotation,
                ExposureInfo::default(),
            )
        })
        .collect()
}

fn spawn_job(id: u64, frames: Vec<CapturedFrame>, options: JobOptions) -> Result<JobHandle> {
    let cancel = CancelToken::new();
    let priority = PriorityHandle::new(options.priority);
    let (tx, rx) = std::sync::mpsc::channel();

    let job = PipelineJob::new(id, frames, options).with_channels(
        cancel.clone(),
        priority.clone(),
        ProgressSink::new(tx),
    );

    let worker = std::thread::Builder::new()
        .name(format!("sr-job-{id}"))
        .spawn(move || JobController::run(job))
        .map_err(|e| JobError::Worker(e.to_string()))?;

    Ok(JobHandle {
        id,
        cancel,
        priority,
        progress: rx,
        worker: Some(worker),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_frames_carry_their_motion_samples() {
        let images = vec![RgbImage::new(8, 8), RgbImage::new(8, 8)];
        let motion = vec![
            RotationSample::new(0.01, 0.0, 0.0),
            RotationSample::new(0.0, 0.02, 0.0),
        ];

        let frames = frames_from_burst(images, motion);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].id, FrameId(0));
        assert_eq!(frames[1].rotation.ry, 0.02);
        assert_eq!(frames[1].timestamp_ms, FRAME_INTERVAL_MS);
    }

    #[test]
    fn missing_motion_samples_default_to_static() {
        let frames = frames_from_burst(vec![RgbImage::new(4, 4)], vec![]);
        assert_eq!(frames[0].rotation.magnitude(), 0.0);
    }
}
