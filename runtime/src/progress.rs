//! Progress event stream
//!
//! The controller emits an event after every tile commit and state
//! transition. Subscribers hold the receiving end of a channel; a dropped
//! receiver never stalls the job.

use serde::{Deserialize, Serialize};
use std::sync::mpsc::Sender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Captured,
    Gating,
    Aligning,
    Tiling,
    Stitching,
    Validating,
    Done,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub tiles_completed: usize,
    pub tiles_total: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<Sender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn new(tx: Sender<ProgressEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, stage: Stage, tiles_completed: usize, tiles_total: usize) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ProgressEvent {
                stage,
                tiles_completed,
                tiles_total,
            });
        }
    }
}
