//! Smart programming.
//!
//! [`ProgramCache`] remembers the last instruction table that was successfully written to
//! a device. When the next shot asks for a table, only the rows that differ are rewritten,
//! unless so much changed that one bulk transfer is cheaper.
//!
//! ## Decision
//!
//! A full rewrite is issued when the request is `fresh`, when nothing is cached, when the
//! device does not support smart programming, when the cached table belongs to another
//! device or column layout, or when the fraction of differing rows exceeds
//! [`CacheConfig::diff_threshold`]. Otherwise only the differing rows are written.
//!
//! Rows are compared element-wise with a relative float tolerance. Rows past the end of the
//! shorter table count as differing, so a length change alone is never mistaken for an
//! unchanged table.
//!
//! ## Failure
//!
//! The cache only reflects what the hardware is known to hold. Any failed write clears it,
//! so the next request falls back to a full rewrite.

use std::fmt;

use log::{debug, info, warn};
use shotseq_backend::*;

use crate::config::CacheConfig;
use crate::error::*;
use crate::hw::Channel;

/// Why a table was written in full
#[derive(Clone, Debug, PartialEq)]
pub enum FullReason {
    Fresh,
    Cold,
    NoSmartProgramming,
    Inconsistent,
    Threshold { diff_count: usize, n: usize },
}
impl fmt::Display for FullReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FullReason::Fresh => write!(f, "fresh request"),
            FullReason::Cold => write!(f, "empty cache"),
            FullReason::NoSmartProgramming => write!(f, "no smart programming"),
            FullReason::Inconsistent => write!(f, "inconsistent cache"),
            FullReason::Threshold { diff_count, n } => {
                write!(f, "{diff_count} of {n} rows differ")
            }
        }
    }
}

/// What [`ProgramCache::program`] sent to the device
#[derive(Clone, Debug, PartialEq)]
pub enum ProgramReport {
    Full { reason: FullReason, rows: usize },
    Incremental { rows: Vec<usize> },
    Unchanged,
}
impl ProgramReport {
    pub fn is_full(&self) -> bool {
        matches!(self, ProgramReport::Full { .. })
    }
}

/// Row-level difference between the cached and the requested table
#[derive(Clone, Debug, PartialEq)]
pub struct DiffResult {
    /// Indices of the requested table that must be written
    pub changed: Vec<usize>,
    /// Differing rows plus the length difference
    pub diff_count: usize,
    /// Length of the longer table
    pub n: usize,
}
impl DiffResult {
    pub fn fraction(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.diff_count as f64 / self.n as f64
        }
    }
}

/// Compares two tables row by row
pub fn diff_tables(cached: &InstructionTable, new: &InstructionTable, rel_tol: f64) -> DiffResult {
    let common = cached.len().min(new.len());
    let mut changed: Vec<usize> = (0..common)
        .filter(|&i| !cached.rows()[i].approx_eq(&new.rows()[i], rel_tol))
        .collect();
    let diff_count = changed.len() + cached.len().abs_diff(new.len());
    changed.extend(common..new.len());
    DiffResult {
        changed,
        diff_count,
        n: cached.len().max(new.len()),
    }
}

enum Plan {
    Full(FullReason),
    Incremental(DiffResult),
    Unchanged,
}

pub struct ProgramCache {
    entry: Option<InstructionTable>,
    cfg: CacheConfig,
}

impl ProgramCache {
    pub fn new(cfg: CacheConfig) -> Self {
        Self { entry: None, cfg }
    }

    pub fn is_primed(&self) -> bool {
        self.entry.is_some()
    }
    pub fn cached(&self) -> Option<&InstructionTable> {
        self.entry.as_ref()
    }
    pub fn invalidate(&mut self) {
        if self.entry.take().is_some() {
            debug!("Program cache invalidated");
        }
    }

    /// Brings the device table in line with `table`, writing as little as possible.
    /// On any error the cache is invalidated before the error is returned.
    pub fn program<C: Channel + ?Sized>(
        &mut self,
        chan: &mut C,
        table: &InstructionTable,
        fresh: bool,
    ) -> SeqResult<ProgramReport> {
        let res = self.program_inner(chan, table, fresh);
        if res.is_err() {
            self.invalidate();
        }
        res
    }

    fn plan(&self, smart: bool, table: &InstructionTable, fresh: bool) -> Plan {
        if fresh {
            return Plan::Full(FullReason::Fresh);
        }
        if !smart {
            return Plan::Full(FullReason::NoSmartProgramming);
        }
        let cached = match &self.entry {
            None => return Plan::Full(FullReason::Cold),
            Some(cached) => cached,
        };
        if !cached.same_layout(table) {
            warn!(
                "{}",
                SeqError::CacheInconsistency(format!(
                    "cached table targets {} with {} columns, requested table targets {} with {} columns; rewriting in full",
                    cached.device(),
                    cached.columns().len(),
                    table.device(),
                    table.columns().len()
                ))
            );
            return Plan::Full(FullReason::Inconsistent);
        }
        let diff = diff_tables(cached, table, self.cfg.rel_tol);
        if diff.diff_count == 0 {
            Plan::Unchanged
        } else if diff.fraction() > self.cfg.diff_threshold {
            Plan::Full(FullReason::Threshold {
                diff_count: diff.diff_count,
                n: diff.n,
            })
        } else {
            Plan::Incremental(diff)
        }
    }

    fn program_inner<C: Channel + ?Sized>(
        &mut self,
        chan: &mut C,
        table: &InstructionTable,
        fresh: bool,
    ) -> SeqResult<ProgramReport> {
        let smart = chan.channel_set().smart_programming();
        let old_len = self.entry.as_ref().map(|t| t.len());

        match self.plan(smart, table, fresh) {
            Plan::Unchanged => {
                info!("{}: table unchanged, nothing to write", chan.device_name());
                Ok(ProgramReport::Unchanged)
            }
            Plan::Full(reason) => {
                info!(
                    "{}: writing all {} rows ({reason})",
                    chan.device_name(),
                    table.len()
                );
                self.entry = None;
                if chan.supports_bulk() {
                    chan.write_table(table.rows())?;
                } else {
                    for (idx, row) in table.rows().iter().enumerate() {
                        chan.write_row(idx, row)?;
                    }
                    chan.set_length(table.len())?;
                }
                self.entry = Some(table.clone());
                Ok(ProgramReport::Full {
                    reason,
                    rows: table.len(),
                })
            }
            Plan::Incremental(diff) => {
                info!(
                    "{}: rewriting {} of {} rows",
                    chan.device_name(),
                    diff.changed.len(),
                    table.len()
                );
                for &idx in diff.changed.iter() {
                    debug!("{}: row {idx} <- {}", chan.device_name(), table.rows()[idx]);
                    chan.write_row(idx, &table.rows()[idx])?;
                }
                if old_len != Some(table.len()) {
                    chan.set_length(table.len())?;
                }
                self.entry = Some(table.clone());
                Ok(ProgramReport::Incremental { rows: diff.changed })
            }
        }
    }
}
