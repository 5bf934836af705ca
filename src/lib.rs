//! rastercache - budget-governed caching for large gridded raster datasets.
//!
//! This library provides a two-tier (in-memory + on-disk) cache for decoded
//! raster data, with process-wide memory and disk budgets, least-recently-used
//! eviction, and lazy materialization of on-disk cache files.
//!
//! # High-Level API
//!
//! A [`cache::CacheRegistry`] owns the budget accounting for all tracked
//! readers. Raster-loading code obtains a [`cache::CacheHandle`] bound to a
//! cache directory and registers its raw readers there:
//!
//! ```no_run
//! use rastercache::cache::CacheRegistry;
//! use rastercache::config::CacheBudget;
//! use rastercache::raster::{GeoReference, InMemoryReader, RasterDataInfo, RasterRect};
//!
//! let registry = CacheRegistry::new(CacheBudget::resolve());
//! let handle = registry.get_or_create(None, false);
//!
//! let source = InMemoryReader::new(
//!     64,
//!     64,
//!     RasterDataInfo::new(1, 1),
//!     GeoReference::new(0.0, 0.0, 1.0, -1.0),
//!     vec![0u8; 64 * 64],
//! )
//! .unwrap();
//!
//! let reader = handle.register(Box::new(source));
//! let window = reader.read_rect(&RasterRect::new(0, 0, 16, 16)).unwrap();
//! assert_eq!(window.len(), 16 * 16);
//! ```
//!
//! The registry never touches pixel data itself; it orchestrates budget
//! accounting and delegates flushing and discarding to the tracked readers.

pub mod cache;
pub mod config;
pub mod raster;

/// Version of the rastercache library.
///
/// Defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
