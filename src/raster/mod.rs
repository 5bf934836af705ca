//! Raster collaborator interfaces.
//!
//! The cache core never decodes pixel data itself; it works against the
//! [`RasterReader`] trait and the small geometry types defined here.
//! Format-specific decoders live outside this crate and plug in through
//! the trait.

mod reader;
mod types;

pub use reader::{InMemoryReader, RasterReader};
pub use types::{GeoReference, RasterDataInfo, RasterIoError, RasterRect};

pub(crate) use types::copy_window;
