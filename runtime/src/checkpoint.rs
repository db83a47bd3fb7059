//! Durable job checkpoints
//!
//! A checkpoint records which tiles have committed, together with their
//! fused payloads, so a job interrupted by a process restart resumes at the
//! first uncommitted tile. Frame buffers are not serialized; the capture
//! store re-supplies them and the deterministic gate/alignment stages
//! reproduce the original worklist.
//!
//! The store is single-writer: only the job controller thread saves or
//! clears records.

use crate::progress::Stage;
use burst_fusion::FinishedTile;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: u64,
    pub stage: Stage,
    pub output_width: u32,
    pub output_height: u32,
    pub tile_size: u32,
    pub overlap: u32,
    /// One flag per tile in raster order.
    pub committed: Vec<bool>,
    /// Payloads of the committed tiles, ascending tile index.
    pub tiles: Vec<FinishedTile>,
}

impl Checkpoint {
    pub fn committed_count(&self) -> usize {
        self.committed.iter().filter(|&&c| c).count()
    }

    /// First uncommitted tile index, or the tile count when all committed.
    pub fn resume_point(&self) -> usize {
        self.committed
            .iter()
            .position(|&c| !c)
            .unwrap_or(self.committed.len())
    }
}

pub type CheckpointResult<T> = std::result::Result<T, CheckpointError>;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub trait CheckpointStore: Send + Sync {
    fn save(&self, checkpoint: &Checkpoint) -> CheckpointResult<()>;
    fn load(&self, job_id: u64) -> CheckpointResult<Option<Checkpoint>>;
    fn clear(&self, job_id: u64) -> CheckpointResult<()>;
}

/// In-memory store; survives within one process only. Used by tests and as
/// a staging layer for hosts without durable storage.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    slots: Mutex<HashMap<u64, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> CheckpointResult<()> {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(checkpoint.job_id, checkpoint.clone());
        Ok(())
    }

    fn load(&self, job_id: u64) -> CheckpointResult<Option<Checkpoint>> {
        Ok(self
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_id)
            .cloned())
    }

    fn clear(&self, job_id: u64) -> CheckpointResult<()> {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job_id);
        Ok(())
    }
}

/// One JSON file per job under a spool directory.
#[derive(Debug, Clone)]
pub struct JsonCheckpointStore {
    dir: PathBuf,
}

impl JsonCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, job_id: u64) -> PathBuf {
        self.dir.join(format!("job-{job_id}.ckpt.json"))
    }
}

impl CheckpointStore for JsonCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> CheckpointResult<()> {
        std::fs::create_dir_all(&self.dir)?;

        // Write-then-rename keeps a crash from truncating the previous
        // record.
        let tmp = self.path(checkpoint.job_id).with_extension("tmp");
        let file = std::fs::File::create(&tmp)?;
        serde_json::to_writer(std::io::BufWriter::new(file), checkpoint)?;
        std::fs::rename(&tmp, self.path(checkpoint.job_id))?;
        Ok(())
    }

    fn load(&self, job_id: u64) -> CheckpointResult<Option<Checkpoint>> {
        let path = self.path(job_id);
        if !path.exists() {
            return Ok(None);
        }
        let file = std::fs::File::open(path)?;
        let checkpoint = serde_json::from_reader(std::io::BufReader::new(file))?;
        Ok(Some(checkpoint))
    }

    fn clear(&self, job_id: u64) -> CheckpointResult<()> {
        let path = self.path(job_id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burst_fusion::{TileRegion, TileStats};

    fn sample_checkpoint(job_id: u64) -> Checkpoint {
        let region = TileRegion {
            index: 0,
            x: 0,
            y: 0,
            width: 32,
            height: 32,
            ext_x: 0,
            ext_y: 0,
            ext_width: 32,
            ext_height: 32,
        };
        Checkpoint {
            job_id,
            stage: Stage::Tiling,
            output_width: 64,
            output_height: 64,
            tile_size: 32,
            overlap: 8,
            committed: vec![true, false, false, false],
            tiles: vec![FinishedTile {
                region,
                pixels: vec![1.5; 32 * 32 * 3],
                counts: vec![2; 32 * 32],
                stats: TileStats::default(),
            }],
        }
    }

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryCheckpointStore::new();
        store.save(&sample_checkpoint(7)).unwrap();

        let loaded = store.load(7).unwrap().unwrap();
        assert_eq!(loaded.committed_count(), 1);
        assert_eq!(loaded.resume_point(), 1);
        assert_eq!(loaded.tiles[0].counts[0], 2);

        store.clear(7).unwrap();
        assert!(store.load(7).unwrap().is_none());
    }

    #[test]
    fn json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCheckpointStore::new(dir.path());
        store.save(&sample_checkpoint(42)).unwrap();

        // A fresh handle sees the record, as after a process restart.
        let reopened = JsonCheckpointStore::new(dir.path());
        let loaded = reopened.load(42).unwrap().unwrap();
        assert_eq!(loaded.job_id, 42);
        assert_eq!(loaded.tiles.len(), 1);
        assert!((loaded.tiles[0].pixels[0] - 1.5).abs() < 1e-6);

        reopened.clear(42).unwrap();
        assert!(reopened.load(42).unwrap().is_none());
    }

    #[test]
    fn missing_record_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCheckpointStore::new(dir.path());
        assert!(store.load(999).unwrap().is_none());
        store.clear(999).unwrap();
    }

    #[test]
    fn resume_point_of_complete_checkpoint_is_len() {
        let mut ckpt = sample_checkpoint(1);
        ckpt.committed = vec![true; 4];
        assert_eq!(ckpt.resume_point(), 4);
    }
}
