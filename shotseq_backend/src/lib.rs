//! Data model of the buffered-shot sequencing core.
//!
//! This crate holds everything that does not touch hardware: typed channel values,
//! compiled instruction tables, wait records, acquisition windows with their slicing
//! arithmetic, and the [`ShotStore`] interface through which shots are loaded and
//! results saved. The companion crate `shotctrl_backend` drives actual devices with it.

pub mod channel;
pub mod error;
pub mod instruction;
pub mod shot;
pub mod timeline;
pub mod utils;
pub mod wait;

pub use channel::*;
pub use error::*;
pub use instruction::*;
pub use shot::*;
pub use timeline::*;
pub use utils::*;
pub use wait::*;
