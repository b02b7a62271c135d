//! # Shot storage
//!
//! The compiled shot (instruction tables, wait table, acquisition windows) is produced
//! by an external compiler and persisted in some file format. This crate only sees it
//! through the [`ShotStore`] trait: the sequencing core loads what it needs at the start
//! of a buffered run and writes the measured results back at the end of it.
//!
//! [`MemoryShotStore`] keeps everything in memory. It is what the control crate's tests
//! and demo binary use, and a convenient staging area for callers that compile shots
//! on the fly.
//!
//! ## Thread safety
//!
//! A single store is shared by every device controller of an experiment, each of which
//! runs on its own thread. Methods therefore take `&self` and implementations are
//! expected to use interior mutability.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::channel::ChannelValues;
use crate::error::StoreError;
use crate::instruction::InstructionTable;
use crate::timeline::{AcquisitionWindow, Trace};
use crate::wait::{WaitRecord, WaitSpec};

/// Identifier of a shot, typically the path of the shot file
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShotId(pub String);

impl fmt::Display for ShotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl From<&str> for ShotId {
    fn from(value: &str) -> Self {
        ShotId(value.to_string())
    }
}

/// Everything a device reports back for one shot
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShotResults {
    pub device: String,
    pub waits: Vec<WaitRecord>,
    pub traces: Vec<Trace>,
    pub final_values: ChannelValues,
    pub failed_shot: bool,
}

/// Source of compiled shots and sink for measured results. See the [module docs](self).
pub trait ShotStore: Send + Sync {
    /// Instruction table of `device` for this shot. `None` if the device sits the shot out.
    fn load_instructions(&self, shot_id: &ShotId, device: &str) -> Option<InstructionTable>;
    /// Wait table of the shot, in scripted order
    fn load_wait_table(&self, shot_id: &ShotId) -> Vec<WaitSpec>;
    /// Acquisition windows requested from `device`
    fn load_acquisition_windows(&self, shot_id: &ShotId, device: &str) -> Vec<AcquisitionWindow>;
    fn save_results(&self, shot_id: &ShotId, results: ShotResults) -> Result<(), StoreError>;
}

#[derive(Default)]
struct ShotEntry {
    tables: HashMap<String, InstructionTable>,
    waits: Vec<WaitSpec>,
    windows: HashMap<String, Vec<AcquisitionWindow>>,
    results: HashMap<String, ShotResults>,
}

/// In-memory [`ShotStore`]
#[derive(Default)]
pub struct MemoryShotStore {
    shots: RwLock<HashMap<ShotId, ShotEntry>>,
}

impl MemoryShotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a shot with an empty wait table. Re-adding an existing shot clears it.
    pub fn add_shot(&self, shot_id: &ShotId) {
        self.shots.write().insert(shot_id.clone(), ShotEntry::default());
    }

    pub fn set_table(&self, shot_id: &ShotId, table: InstructionTable) {
        let mut shots = self.shots.write();
        let entry = shots.entry(shot_id.clone()).or_default();
        entry.tables.insert(table.device().to_string(), table);
    }

    pub fn set_waits(&self, shot_id: &ShotId, waits: Vec<WaitSpec>) {
        self.shots.write().entry(shot_id.clone()).or_default().waits = waits;
    }

    pub fn set_windows(&self, shot_id: &ShotId, device: &str, windows: Vec<AcquisitionWindow>) {
        self.shots
            .write()
            .entry(shot_id.clone())
            .or_default()
            .windows
            .insert(device.to_string(), windows);
    }

    /// Results saved by `device` for this shot, if any
    pub fn results(&self, shot_id: &ShotId, device: &str) -> Option<ShotResults> {
        self.shots
            .read()
            .get(shot_id)
            .and_then(|entry| entry.results.get(device).cloned())
    }
}

impl ShotStore for MemoryShotStore {
    fn load_instructions(&self, shot_id: &ShotId, device: &str) -> Option<InstructionTable> {
        self.shots
            .read()
            .get(shot_id)
            .and_then(|entry| entry.tables.get(device).cloned())
    }

    fn load_wait_table(&self, shot_id: &ShotId) -> Vec<WaitSpec> {
        self.shots
            .read()
            .get(shot_id)
            .map(|entry| entry.waits.clone())
            .unwrap_or_default()
    }

    fn load_acquisition_windows(&self, shot_id: &ShotId, device: &str) -> Vec<AcquisitionWindow> {
        self.shots
            .read()
            .get(shot_id)
            .and_then(|entry| entry.windows.get(device).cloned())
            .unwrap_or_default()
    }

    fn save_results(&self, shot_id: &ShotId, results: ShotResults) -> Result<(), StoreError> {
        let mut shots = self.shots.write();
        let entry = shots
            .get_mut(shot_id)
            .ok_or_else(|| StoreError::UnknownShot(shot_id.to_string()))?;
        if entry.results.contains_key(&results.device) {
            return Err(StoreError::AlreadySaved(shot_id.to_string()));
        }
        entry.results.insert(results.device.clone(), results);
        Ok(())
    }
}
