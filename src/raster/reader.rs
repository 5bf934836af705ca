//! The raw raster reader contract consumed by the cache.

use std::path::Path;

use super::types::{copy_window, GeoReference, RasterDataInfo, RasterIoError, RasterRect};

/// A raw, format-specific raster reader.
///
/// Implementations decode pixel data from some backing source (a file, a
/// remote coverage, an in-memory buffer). The cache wraps every registered
/// reader in a tracked entry and only ever calls back into the source when
/// its decoded data is not already materialized.
pub trait RasterReader: Send + Sync {
    /// Stable identifier of the data location backing this reader, used for
    /// cache-entry identity and cache-file naming. `None` for anonymous
    /// scratch readers.
    fn location_id(&self) -> Option<String>;

    /// Raster width in pixels.
    fn width(&self) -> u32;

    /// Raster height in pixels.
    fn height(&self) -> u32;

    /// Sample layout of the raster.
    fn data_info(&self) -> RasterDataInfo;

    /// Geo-reference of the raster.
    fn geo_reference(&self) -> GeoReference;

    /// Decode the pixels covered by `rect` into a freshly allocated
    /// row-major buffer.
    ///
    /// The rectangle must lie within the raster bounds.
    fn read_rect(&self, rect: &RasterRect) -> Result<Vec<u8>, RasterIoError>;

    /// Policy hint: whether a disk cache file should be kept for this
    /// reader. Scratch readers without a re-readable source say `false`.
    fn should_create_cache_file(&self) -> bool {
        true
    }

    /// The backing file, if the source is file-based. Used for staleness
    /// checks against the source's modification time.
    fn file(&self) -> Option<&Path> {
        None
    }
}

/// A raster held entirely in memory.
///
/// Without a location this is a pure scratch buffer: it refuses disk cache
/// files since nothing could ever re-find one, so evicting it is plain data
/// loss the caller opted into. Attaching a location with
/// [`with_location`](Self::with_location) makes the raster a deduplicable,
/// disk-cacheable entry.
pub struct InMemoryReader {
    width: u32,
    height: u32,
    data_info: RasterDataInfo,
    geo_reference: GeoReference,
    data: Vec<u8>,
    location: Option<String>,
}

impl InMemoryReader {
    /// Create a reader over a filled row-major buffer.
    ///
    /// Fails if the buffer length does not match the declared geometry.
    pub fn new(
        width: u32,
        height: u32,
        data_info: RasterDataInfo,
        geo_reference: GeoReference,
        data: Vec<u8>,
    ) -> Result<Self, RasterIoError> {
        let expected = width as usize * height as usize * data_info.pixel_size();
        if data.len() != expected {
            return Err(RasterIoError::BufferMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data_info,
            geo_reference,
            data,
            location: None,
        })
    }

    /// Attach a stable location identifier, making the reader a deduplicable
    /// cache entry instead of an anonymous one.
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

impl RasterReader for InMemoryReader {
    fn location_id(&self) -> Option<String> {
        self.location.clone()
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn data_info(&self) -> RasterDataInfo {
        self.data_info
    }

    fn geo_reference(&self) -> GeoReference {
        self.geo_reference
    }

    fn read_rect(&self, rect: &RasterRect) -> Result<Vec<u8>, RasterIoError> {
        if !rect.fits_within(self.width, self.height) {
            return Err(RasterIoError::out_of_bounds(rect, self.width, self.height));
        }
        Ok(copy_window(
            &self.data,
            self.width,
            rect,
            self.data_info.pixel_size(),
        ))
    }

    fn should_create_cache_file(&self) -> bool {
        self.location.is_some()
    }
}
