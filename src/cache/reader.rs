//! Tracked cache entries wrapping raw raster readers.
//!
//! A [`TrackedReader`] owns a raw [`RasterReader`] and a slot for the fully
//! decoded pixel buffer. The buffer materializes lazily on the first window
//! read, from the disk cache file when a valid one exists and from the
//! backing source otherwise, and can be discarded at any time by the
//! registry's eviction pass. Reads after a discard simply re-materialize.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::raster::{
    copy_window, GeoReference, RasterDataInfo, RasterIoError, RasterRect, RasterReader,
};

use super::file::{read_cache_file, write_cache_file, CacheFileHeader};
use super::registry::CacheRegistry;

/// Process-wide logical clock for last-access ordering. Strictly monotonic,
/// unlike wall time, so eviction order is deterministic even for accesses
/// within the same millisecond.
static ACCESS_CLOCK: AtomicU64 = AtomicU64::new(1);

fn next_access_stamp() -> u64 {
    ACCESS_CLOCK.fetch_add(1, Ordering::Relaxed)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Identity of a cache entry: the logical raster-data location it wraps.
///
/// Two tracked readers with equal ids are the same entry; the registry
/// deduplicates on this, never on object identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReaderId(String);

impl ReaderId {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReaderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

struct BufferState {
    /// Fully decoded row-major pixel data, present only while materialized.
    buffer: Option<Vec<u8>>,
    /// Whether the buffer holds data the cache file does not.
    dirty: bool,
}

/// A cache entry: a raw reader plus budget-tracked in-memory pixel data and
/// an optional on-disk cache file.
pub struct TrackedReader {
    id: ReaderId,
    source: Option<Box<dyn RasterReader>>,
    cache_file: Option<PathBuf>,
    width: u32,
    height: u32,
    data_info: RasterDataInfo,
    geo_reference: GeoReference,
    registry: Weak<CacheRegistry>,
    state: Mutex<BufferState>,
    /// Logical last-access stamp, for LRU ordering.
    last_access: AtomicU64,
    /// Wall-clock time of the last read, for source staleness checks.
    last_read_millis: AtomicU64,
}

impl TrackedReader {
    pub(crate) fn new(
        id: ReaderId,
        source: Box<dyn RasterReader>,
        cache_file: Option<PathBuf>,
        registry: Weak<CacheRegistry>,
    ) -> Arc<Self> {
        let width = source.width();
        let height = source.height();
        let data_info = source.data_info();
        let geo_reference = source.geo_reference();
        Arc::new(Self {
            id,
            source: Some(source),
            cache_file,
            width,
            height,
            data_info,
            geo_reference,
            registry,
            state: Mutex::new(BufferState {
                buffer: None,
                dirty: false,
            }),
            last_access: AtomicU64::new(next_access_stamp()),
            last_read_millis: AtomicU64::new(now_millis()),
        })
    }

    /// Construct an entry backed by an existing cache file.
    ///
    /// Returns `Ok(None)` when the file is not a valid cache file, or when
    /// its recorded geometry contradicts the supplied source.
    pub(crate) fn from_cache_file(
        id: ReaderId,
        path: &Path,
        source: Option<Box<dyn RasterReader>>,
        registry: Weak<CacheRegistry>,
    ) -> io::Result<Option<Arc<Self>>> {
        let Some(header) = CacheFileHeader::read_from(path)? else {
            return Ok(None);
        };
        if let Some(src) = &source {
            if src.width() != header.width
                || src.height() != header.height
                || src.data_info() != header.data_info
            {
                debug!(
                    path = %path.display(),
                    "cache file geometry does not match its source, ignoring it"
                );
                return Ok(None);
            }
        }
        Ok(Some(Arc::new(Self {
            id,
            source,
            cache_file: Some(path.to_path_buf()),
            width: header.width,
            height: header.height,
            data_info: header.data_info,
            geo_reference: header.geo_reference,
            registry,
            state: Mutex::new(BufferState {
                buffer: None,
                dirty: false,
            }),
            last_access: AtomicU64::new(next_access_stamp()),
            last_read_millis: AtomicU64::new(now_millis()),
        })))
    }

    pub fn id(&self) -> &ReaderId {
        &self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data_info(&self) -> RasterDataInfo {
        self.data_info
    }

    pub fn geo_reference(&self) -> GeoReference {
        self.geo_reference
    }

    /// Last-access stamp from the process-wide logical clock.
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    /// Current best estimate of heap bytes held for decoded pixel data.
    /// Zero once discarded.
    pub fn approx_memory(&self) -> u64 {
        self.state
            .lock()
            .unwrap()
            .buffer
            .as_ref()
            .map(|b| b.len() as u64)
            .unwrap_or(0)
    }

    /// Bytes occupied by the on-disk cache file, or zero if none exists.
    pub fn cache_file_size(&self) -> u64 {
        self.cache_file
            .as_ref()
            .and_then(|p| fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Whether this entry is permitted to keep a disk cache file.
    pub fn can_create_cache_file(&self) -> bool {
        self.cache_file.is_some()
    }

    pub fn cache_file(&self) -> Option<&Path> {
        self.cache_file.as_deref()
    }

    fn full_len(&self) -> usize {
        self.width as usize * self.height as usize * self.data_info.pixel_size()
    }

    fn header(&self) -> CacheFileHeader {
        CacheFileHeader {
            width: self.width,
            height: self.height,
            data_info: self.data_info,
            geo_reference: self.geo_reference,
        }
    }

    /// Read the pixels covered by `rect`, materializing the full buffer
    /// first if needed.
    pub fn read_rect(&self, rect: &RasterRect) -> Result<Vec<u8>, RasterIoError> {
        if !rect.fits_within(self.width, self.height) {
            return Err(RasterIoError::out_of_bounds(rect, self.width, self.height));
        }
        self.invalidate_if_stale();
        self.last_access
            .store(next_access_stamp(), Ordering::Relaxed);
        self.last_read_millis.store(now_millis(), Ordering::Relaxed);

        let pixel_size = self.data_info.pixel_size();
        {
            let state = self.state.lock().unwrap();
            if let Some(buffer) = &state.buffer {
                return Ok(copy_window(buffer, self.width, rect, pixel_size));
            }
        }

        // Materialize with the buffer lock released: reserving may trigger
        // eviction, and eviction can call back into this reader's discard.
        if let Some(registry) = self.registry.upgrade() {
            registry.reserve(self.full_len() as u64);
        }
        let (data, dirty) = self.materialize()?;

        let mut state = self.state.lock().unwrap();
        if state.buffer.is_none() {
            state.dirty = dirty;
        }
        let buffer = state.buffer.get_or_insert(data);
        Ok(copy_window(buffer, self.width, rect, pixel_size))
    }

    /// Produce the full pixel buffer, preferring the cache file over the
    /// backing source. The bool is the dirty flag for the new buffer.
    fn materialize(&self) -> Result<(Vec<u8>, bool), RasterIoError> {
        if let Some(path) = &self.cache_file {
            match read_cache_file(path) {
                Ok(Some((header, payload))) if header == self.header() => {
                    return Ok((payload, false));
                }
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    debug!(
                        path = %path.display(),
                        error = %err,
                        "failed to read cache file, falling back to the source"
                    );
                }
            }
        }
        match &self.source {
            Some(source) => {
                let data = source.read_rect(&RasterRect::new(0, 0, self.width, self.height))?;
                Ok((data, true))
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "cache file is no longer readable and the entry has no backing source",
            )
            .into()),
        }
    }

    /// Write dirty in-memory data to the cache file. A no-op when there is
    /// no cache file, no buffer, or nothing dirty.
    pub fn flush(&self) -> io::Result<()> {
        let Some(path) = &self.cache_file else {
            return Ok(());
        };
        let mut state = self.state.lock().unwrap();
        let Some(buffer) = &state.buffer else {
            return Ok(());
        };
        if !state.dirty {
            return Ok(());
        }
        let bytes = buffer.len();
        write_cache_file(path, &self.header(), buffer)?;
        state.dirty = false;
        debug!(
            reader = %self.id,
            path = %path.display(),
            bytes,
            "flushed buffer to cache file"
        );
        Ok(())
    }

    /// Release in-memory pixel data, optionally deleting the cache file.
    /// Returns the bytes of memory released.
    pub fn discard(&self, delete_file: bool) -> u64 {
        let freed = {
            let mut state = self.state.lock().unwrap();
            state.dirty = false;
            state.buffer.take().map(|b| b.len() as u64).unwrap_or(0)
        };
        if delete_file {
            if let Some(path) = &self.cache_file {
                match fs::remove_file(path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => {
                        warn!(
                            path = %path.display(),
                            error = %err,
                            "failed to delete cache file"
                        );
                    }
                }
            }
        }
        freed
    }

    /// Drop cached state when the backing source file has been modified
    /// since our last read.
    fn invalidate_if_stale(&self) {
        let Some(source) = &self.source else {
            return;
        };
        let Some(path) = source.file() else {
            return;
        };
        let Some(modified) = fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        else {
            return;
        };
        if modified.as_millis() as u64 > self.last_read_millis.load(Ordering::Relaxed) {
            debug!(
                reader = %self.id,
                source = %path.display(),
                "source file changed since last read, invalidating cached data"
            );
            let freed = self.discard(true);
            if freed > 0 {
                if let Some(registry) = self.registry.upgrade() {
                    registry.release(freed);
                }
            }
        }
    }
}
