//! Two-tier raster cache with budgeted LRU eviction.
//!
//! A process-wide [`CacheRegistry`] tracks every [`TrackedReader`] against a
//! shared memory and disk budget, evicting oldest-accessed entries when a
//! reservation would exceed the memory ceiling. Cache files materialize
//! lazily and survive the in-memory data they back.

mod directory;
mod file;
mod reader;
mod registry;

pub use directory::{default_cache_dir, has_no_cache_file};
pub use file::{CacheFileHeader, FILE_EXTENSION};
pub use reader::{ReaderId, TrackedReader};
pub use registry::{CacheHandle, CacheRegistry, MaterializedRaster};
