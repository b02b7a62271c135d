//! Runtime of the buffered-shot sequencing core.
//!
//! [`SequenceController`] drives one device through a shot: smart programming through the
//! [`ProgramCache`], wait measurement on the [`WaitMonitor`] thread and acquisition slicing
//! with the [`AcquisitionTimeline`]. [`Experiment`] runs a shot on several devices at once.
//! Hardware is reached only through the traits in [`hw`]; [`mock`] implements them in memory.

pub mod acquisition;
pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod experiment;
pub mod hw;
pub mod mock;
pub mod monitor;
pub mod notify;

pub use crate::acquisition::*;
pub use crate::cache::*;
pub use crate::config::*;
pub use crate::controller::*;
pub use crate::error::*;
pub use crate::event::*;
pub use crate::experiment::*;
pub use crate::hw::*;
pub use crate::monitor::*;
pub use crate::notify::*;
