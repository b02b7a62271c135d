//! Provides definitions for compiled instruction rows and tables.
//!
//! ## Main Structures and Enumerations:
//!
//! - `RowTiming`: how a row is scheduled, either an explicit timestamp (`At`) or a
//!   repeat-count/period pair (`Repeat`) for pulse generators that count clock cycles.
//!
//! - `FieldVal`: a single register field or channel value of a row. Float fields are
//!   compared with a relative tolerance, integer fields exactly.
//!
//! - `InstructionRow`: one scheduled hardware event.
//!
//! - `InstructionTable`: the ordered rows of one device for one shot, together with the
//!   device identity and the column layout (which channel each field drives).
//!
//! ## Invariants:
//!
//! Tables are immutable once built. [`InstructionTable::new`] checks that every row has
//! one field per column and that the effective start time never decreases. Deserialized
//! tables go through the same checks. A `Repeat`
//! row starts where the previous row ended; an `At(t)` row starts at `t` and has no
//! duration of its own.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::channel::{ChannelId, ChannelSet, ChannelValues};
use crate::error::TableError;
use crate::utils::rel_eq;

/// Scheduling of a single row
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum RowTiming {
    /// Row starts at an explicit time (seconds)
    At(f64),
    /// Row is held for `count` periods of `period` seconds
    Repeat { count: u32, period: f64 },
}
impl RowTiming {
    /// Duration occupied by the row. Zero for explicitly timed rows.
    pub fn duration(&self) -> f64 {
        match self {
            RowTiming::At(_) => 0.0,
            RowTiming::Repeat { count, period } => *count as f64 * period,
        }
    }

    pub fn approx_eq(&self, other: &RowTiming, rel_tol: f64) -> bool {
        match (self, other) {
            (RowTiming::At(a), RowTiming::At(b)) => rel_eq(*a, *b, rel_tol),
            (
                RowTiming::Repeat { count: c1, period: p1 },
                RowTiming::Repeat { count: c2, period: p2 },
            ) => c1 == c2 && rel_eq(*p1, *p2, rel_tol),
            _ => false,
        }
    }
}

/// Register field or channel value
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum FieldVal {
    Float(f64),
    Int(i64),
}
impl FieldVal {
    pub fn as_f64(&self) -> f64 {
        match self {
            FieldVal::Float(v) => *v,
            FieldVal::Int(v) => *v as f64,
        }
    }

    pub fn approx_eq(&self, other: &FieldVal, rel_tol: f64) -> bool {
        match (self, other) {
            (FieldVal::Float(a), FieldVal::Float(b)) => rel_eq(*a, *b, rel_tol),
            (FieldVal::Int(a), FieldVal::Int(b)) => a == b,
            _ => false,
        }
    }
}
impl fmt::Display for FieldVal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldVal::Float(v) => write!(f, "{v}"),
            FieldVal::Int(v) => write!(f, "{v}"),
        }
    }
}

/// One scheduled hardware event: timing plus one field per table column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstructionRow {
    pub timing: RowTiming,
    pub fields: Vec<FieldVal>,
}
impl InstructionRow {
    /// Row starting at time `t` with float fields
    pub fn at(t: f64, fields: &[f64]) -> Self {
        Self {
            timing: RowTiming::At(t),
            fields: fields.iter().map(|v| FieldVal::Float(*v)).collect(),
        }
    }

    /// Row held for `count` periods with float fields
    pub fn repeat(count: u32, period: f64, fields: &[f64]) -> Self {
        Self {
            timing: RowTiming::Repeat { count, period },
            fields: fields.iter().map(|v| FieldVal::Float(*v)).collect(),
        }
    }

    /// Compares two rows: timing and every field, floats with relative tolerance `rel_tol`.
    ///
    /// ```
    /// use shotseq_backend::instruction::*;
    ///
    /// let a = InstructionRow::at(1.0, &[0.5, 2.0]);
    /// let b = InstructionRow::at(1.0, &[0.5 + 1e-13, 2.0]);
    /// assert!(a.approx_eq(&b, 1e-9));
    /// assert!(!a.approx_eq(&InstructionRow::at(1.0, &[0.6, 2.0]), 1e-9));
    /// ```
    pub fn approx_eq(&self, other: &InstructionRow, rel_tol: f64) -> bool {
        self.timing.approx_eq(&other.timing, rel_tol)
            && self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .zip(other.fields.iter())
                .all(|(a, b)| a.approx_eq(b, rel_tol))
    }
}
impl fmt::Display for InstructionRow {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let fields_string = self
            .fields
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<String>>()
            .join(", ");
        match self.timing {
            RowTiming::At(t) => write!(f, "[t={t}, {{{fields_string}}}]"),
            RowTiming::Repeat { count, period } => {
                write!(f, "[{count}x{period}, {{{fields_string}}}]")
            }
        }
    }
}

/// Ordered instruction rows for one device and one shot.
///
/// The device name and column layout together form the table's identity, which the
/// programming cache checks before it trusts an index-aligned comparison.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTable")]
pub struct InstructionTable {
    device: String,
    columns: Vec<ChannelId>,
    rows: Vec<InstructionRow>,
}

/// Unchecked serialized form of an [`InstructionTable`]
#[derive(Deserialize)]
struct RawTable {
    device: String,
    columns: Vec<ChannelId>,
    rows: Vec<InstructionRow>,
}

impl TryFrom<RawTable> for InstructionTable {
    type Error = TableError;
    fn try_from(raw: RawTable) -> Result<Self, Self::Error> {
        Self::new(&raw.device, raw.columns, raw.rows)
    }
}

impl InstructionTable {
    /// Builds and validates a table.
    ///
    /// # Errors
    /// - [`TableError::RowWidth`] if a row does not carry one field per column.
    /// - [`TableError::BadTiming`] for non-finite or negative times and periods.
    /// - [`TableError::NonMonotonicTime`] if a row starts before the previous one.
    ///
    /// # Examples
    ///
    /// ```
    /// use shotseq_backend::channel::ChannelId;
    /// use shotseq_backend::instruction::*;
    ///
    /// let table = InstructionTable::new(
    ///     "Dev1",
    ///     vec![ChannelId::Analog(0)],
    ///     vec![InstructionRow::at(0.0, &[1.0]), InstructionRow::at(0.5, &[2.0])],
    /// )
    /// .unwrap();
    /// assert_eq!(table.len(), 2);
    ///
    /// let backwards = InstructionTable::new(
    ///     "Dev1",
    ///     vec![ChannelId::Analog(0)],
    ///     vec![InstructionRow::at(1.0, &[1.0]), InstructionRow::at(0.5, &[2.0])],
    /// );
    /// assert!(backwards.is_err());
    /// ```
    pub fn new(
        device: &str,
        columns: Vec<ChannelId>,
        rows: Vec<InstructionRow>,
    ) -> Result<Self, TableError> {
        let mut cursor = 0.0;
        for (i, row) in rows.iter().enumerate() {
            if row.fields.len() != columns.len() {
                return Err(TableError::RowWidth {
                    row: i,
                    expected: columns.len(),
                    found: row.fields.len(),
                });
            }
            let start = match row.timing {
                RowTiming::At(t) => {
                    if !t.is_finite() || t < 0.0 {
                        return Err(TableError::BadTiming {
                            row: i,
                            msg: format!("timestamp {t}"),
                        });
                    }
                    t
                }
                RowTiming::Repeat { period, .. } => {
                    if !period.is_finite() || period < 0.0 {
                        return Err(TableError::BadTiming {
                            row: i,
                            msg: format!("period {period}"),
                        });
                    }
                    cursor
                }
            };
            // An explicit timestamp may not land inside the previous repeat block
            if start < cursor {
                return Err(TableError::NonMonotonicTime {
                    row: i,
                    start,
                    prev: cursor,
                });
            }
            cursor = start + row.timing.duration();
        }
        Ok(Self {
            device: device.to_string(),
            columns,
            rows,
        })
    }

    /// A table without rows. Used for devices that sit a shot out.
    pub fn empty(device: &str, columns: Vec<ChannelId>) -> Self {
        Self {
            device: device.to_string(),
            columns,
            rows: Vec::new(),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }
    pub fn columns(&self) -> &[ChannelId] {
        &self.columns
    }
    pub fn rows(&self) -> &[InstructionRow] {
        &self.rows
    }
    pub fn row(&self, idx: usize) -> Option<&InstructionRow> {
        self.rows.get(idx)
    }
    pub fn len(&self) -> usize {
        self.rows.len()
    }
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Two tables can be compared row by row only if they target the same device
    /// with the same column layout.
    pub fn same_layout(&self, other: &InstructionTable) -> bool {
        self.device == other.device && self.columns == other.columns
    }

    /// Effective start time of every row
    pub fn start_times(&self) -> Vec<f64> {
        let mut cursor = 0.0;
        self.rows
            .iter()
            .map(|row| {
                let start = match row.timing {
                    RowTiming::At(t) => t,
                    RowTiming::Repeat { .. } => cursor,
                };
                cursor = start + row.timing.duration();
                start
            })
            .collect()
    }

    /// End of the last row: its timestamp, or the end of its repeat block
    pub fn stop_time(&self) -> f64 {
        match (self.start_times().last(), self.rows.last()) {
            (Some(start), Some(row)) => start + row.timing.duration(),
            _ => 0.0,
        }
    }

    /// Checks the row count against a device-specific maximum.
    /// Meant for table builders, the sequencing core does not enforce it.
    pub fn check_capacity(&self, max: usize) -> Result<(), TableError> {
        if self.rows.len() > max {
            return Err(TableError::Capacity {
                device: self.device.clone(),
                len: self.rows.len(),
                max,
            });
        }
        Ok(())
    }

    /// Output values left on the device after the table ran: the last row's fields
    /// mapped onto the columns. Empty for tables without rows or columns.
    pub fn final_values(&self, set: &ChannelSet) -> Result<ChannelValues, TableError> {
        let mut vals = IndexMap::new();
        if let Some(last) = self.rows.last() {
            for (id, field) in self.columns.iter().zip(last.fields.iter()) {
                vals.insert(*id, field.as_f64());
            }
        }
        ChannelValues::new(set, vals)
    }
}

impl fmt::Display for InstructionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InstructionTable({}, {} columns, {} rows)",
            self.device,
            self.columns.len(),
            self.rows.len()
        )
    }
}
