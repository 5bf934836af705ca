//! Configuration for the raster cache.
//!
//! Provides human-readable byte-size parsing and resolution of the
//! process-wide memory and disk budgets.

mod budget;
mod size;

pub use budget::{detect_total_memory, CacheBudget, DISK_SIZE_ENV, MEM_SIZE_ENV};
pub use size::{format_size, parse_size, SizeParseError};
