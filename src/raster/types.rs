//! Core geometry and sample-layout types for raster data.

use thiserror::Error;

/// A pixel-aligned rectangle within a raster, origin at the top-left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterRect {
    /// Column of the left edge.
    pub x: u32,
    /// Row of the top edge.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl RasterRect {
    /// Create a new rectangle.
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Number of pixels covered by the rectangle.
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Whether the rectangle lies entirely within a raster of the given
    /// dimensions.
    pub fn fits_within(&self, raster_width: u32, raster_height: u32) -> bool {
        u64::from(self.x) + u64::from(self.width) <= u64::from(raster_width)
            && u64::from(self.y) + u64::from(self.height) <= u64::from(raster_height)
    }
}

/// Sample layout of a raster: bands per pixel and bytes per sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterDataInfo {
    /// Number of bands (e.g., 3 for RGB).
    pub bands: u8,
    /// Bytes per sample (e.g., 1 for 8-bit data).
    pub bytes_per_sample: u8,
}

impl RasterDataInfo {
    /// Create a new sample layout description.
    pub fn new(bands: u8, bytes_per_sample: u8) -> Self {
        Self {
            bands,
            bytes_per_sample,
        }
    }

    /// Bytes occupied by a single pixel.
    pub fn pixel_size(&self) -> usize {
        usize::from(self.bands) * usize::from(self.bytes_per_sample)
    }
}

/// Affine geo-reference of a raster: world coordinates of the raster origin
/// and the world extent of one pixel along each axis.
///
/// Axis-aligned only; shearing rasters are not handled by this cache.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoReference {
    /// World x of the raster origin (top-left pixel corner).
    pub origin_x: f64,
    /// World y of the raster origin.
    pub origin_y: f64,
    /// World extent of one pixel along x.
    pub resolution_x: f64,
    /// World extent of one pixel along y (negative for north-up rasters).
    pub resolution_y: f64,
}

impl GeoReference {
    /// Create a new geo-reference.
    pub fn new(origin_x: f64, origin_y: f64, resolution_x: f64, resolution_y: f64) -> Self {
        Self {
            origin_x,
            origin_y,
            resolution_x,
            resolution_y,
        }
    }
}

/// Errors surfaced by raster readers.
#[derive(Debug, Error)]
pub enum RasterIoError {
    /// I/O failure while reading raster data.
    #[error("raster I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested window does not lie within the raster.
    #[error("window {x},{y} {width}x{height} outside raster {raster_width}x{raster_height}")]
    OutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        raster_width: u32,
        raster_height: u32,
    },

    /// The supplied buffer does not match the declared raster geometry.
    #[error("buffer of {actual} bytes does not match raster layout requiring {expected} bytes")]
    BufferMismatch { expected: usize, actual: usize },
}

impl RasterIoError {
    pub(crate) fn out_of_bounds(rect: &RasterRect, raster_width: u32, raster_height: u32) -> Self {
        Self::OutOfBounds {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
            raster_width,
            raster_height,
        }
    }
}

/// Copy the pixels covered by `rect` out of a row-major buffer spanning a
/// raster `raster_width` pixels wide.
///
/// The rectangle must fit within the source raster; callers validate bounds
/// before calling.
pub(crate) fn copy_window(
    data: &[u8],
    raster_width: u32,
    rect: &RasterRect,
    pixel_size: usize,
) -> Vec<u8> {
    let row_stride = raster_width as usize * pixel_size;
    let window_stride = rect.width as usize * pixel_size;
    let mut out = Vec::with_capacity(rect.height as usize * window_stride);

    for row in 0..rect.height as usize {
        let start = (rect.y as usize + row) * row_stride + rect.x as usize * pixel_size;
        out.extend_from_slice(&data[start..start + window_stride]);
    }
    out
}
