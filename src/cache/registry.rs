//! The process-wide cache registry: budget accounting and eviction.
//!
//! One [`CacheRegistry`] tracks every reader admitted anywhere in the
//! process against a shared memory and disk budget. Handles bind the
//! registry to a resolved cache directory; all handles share the same
//! accounting state.
//!
//! Budget pressure is relieved best-effort: a reservation always commits,
//! even when eviction could not free enough. The running totals are
//! estimates that drift as readers mutate their own state, and a full
//! resync reconciles them whenever an eviction pass misses its target or
//! touches more than half the readers.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CacheBudget;
use crate::raster::{RasterIoError, RasterRect, RasterReader};

use super::directory::{default_cache_dir, resolve_directory, IdentifierTable};
use super::file::FILE_EXTENSION;
use super::reader::{ReaderId, TrackedReader};

/// Share of the memory budget that eviction drives usage down to. Well
/// below 100% so that a reservation at the boundary does not trigger an
/// eviction pass on every subsequent call.
const EVICTION_TARGET_PERCENT: u64 = 50;

struct Accounting {
    readers: HashMap<ReaderId, Arc<TrackedReader>>,
    /// Approximate aggregate in-memory footprint; reconciled by resync.
    used_memory: u64,
    /// Approximate aggregate cache-file footprint; reconciled by resync.
    used_disk: u64,
}

/// Process-wide registry of tracked readers with memory and disk budget
/// accounting.
///
/// Construct one per process (or per test) and hand out [`CacheHandle`]s
/// via [`CacheRegistry::get_or_create`].
pub struct CacheRegistry {
    budget: Mutex<CacheBudget>,
    accounting: Mutex<Accounting>,
    /// Every distinct cache directory a handle was issued for.
    directories: DashMap<PathBuf, ()>,
    identifiers: IdentifierTable,
    /// Cache files with no stable identity, deleted when the registry goes.
    anonymous_files: Mutex<Vec<PathBuf>>,
    anonymous_seq: AtomicU64,
}

impl CacheRegistry {
    /// Create a registry governed by the given budget.
    pub fn new(budget: CacheBudget) -> Arc<Self> {
        Arc::new(Self {
            budget: Mutex::new(budget),
            accounting: Mutex::new(Accounting {
                readers: HashMap::new(),
                used_memory: 0,
                used_disk: 0,
            }),
            directories: DashMap::new(),
            identifiers: IdentifierTable::default(),
            anonymous_files: Mutex::new(Vec::new()),
            anonymous_seq: AtomicU64::new(0),
        })
    }

    /// Obtain a handle bound to a cache directory.
    ///
    /// `None` selects the default directory. A missing directory is created
    /// when `create_if_missing` is set and otherwise replaced by the
    /// default; this never fails. Handles for the same resolved path are
    /// interchangeable views of the same shared state.
    pub fn get_or_create(
        self: &Arc<Self>,
        directory: Option<&Path>,
        create_if_missing: bool,
    ) -> CacheHandle {
        let directory = resolve_directory(directory, create_if_missing);
        self.directories.insert(directory.clone(), ());
        CacheHandle {
            registry: Arc::clone(self),
            directory,
        }
    }

    /// Current budget in force.
    pub fn budget(&self) -> CacheBudget {
        *self.budget.lock().unwrap()
    }

    /// Approximate aggregate in-memory bytes across all tracked readers.
    pub fn used_memory(&self) -> u64 {
        self.accounting.lock().unwrap().used_memory
    }

    /// Approximate aggregate cache-file bytes across all tracked readers.
    pub fn used_disk(&self) -> u64 {
        self.accounting.lock().unwrap().used_disk
    }

    /// Number of tracked readers.
    pub fn reader_count(&self) -> usize {
        self.accounting.lock().unwrap().readers.len()
    }

    /// Reserve memory for an imminent buffer allocation, evicting
    /// least-recently-used readers first when the reservation would exceed
    /// the memory budget.
    ///
    /// The reservation always commits; the returned total may still be over
    /// budget when nothing was left to evict.
    pub fn reserve(&self, bytes: u64) -> u64 {
        let budget = *self.budget.lock().unwrap();
        let mut guard = self.accounting.lock().unwrap();
        let acct = &mut *guard;
        if acct.used_memory.saturating_add(bytes) > budget.max_memory_bytes {
            Self::evict(bytes, budget, acct);
        }
        acct.used_memory = acct.used_memory.saturating_add(bytes);
        debug!(
            reserved = bytes,
            used_memory = acct.used_memory,
            "committed memory reservation"
        );
        acct.used_memory
    }

    /// Return memory a reader released outside an eviction pass.
    pub(crate) fn release(&self, bytes: u64) {
        let mut acct = self.accounting.lock().unwrap();
        acct.used_memory = acct.used_memory.saturating_sub(bytes);
    }

    /// Free memory by walking readers oldest-accessed first, driving usage
    /// toward the eviction target.
    fn evict(incoming: u64, budget: CacheBudget, acct: &mut Accounting) {
        // Divide first; budgets near u64::MAX would overflow the product.
        let target = budget.max_memory_bytes / 100 * EVICTION_TARGET_PERCENT;
        let mut snapshot: Vec<Arc<TrackedReader>> = acct.readers.values().cloned().collect();
        snapshot.sort_by_key(|reader| reader.last_access());

        let total = snapshot.len();
        let mut touched = 0usize;
        let mut projected = acct.used_memory.saturating_add(incoming);

        for reader in &snapshot {
            if projected <= target {
                break;
            }
            touched += 1;

            if acct.used_disk > budget.max_disk_bytes && reader.cache_file_size() > 0 {
                // Disk is over budget too: drop this reader's file outright
                // instead of flushing anything new to disk.
                let disk_freed = reader.cache_file_size();
                let memory_freed = reader.discard(true);
                acct.used_memory = acct.used_memory.saturating_sub(memory_freed);
                acct.used_disk = acct.used_disk.saturating_sub(disk_freed);
                projected = projected.saturating_sub(memory_freed);
                debug!(
                    reader = %reader.id(),
                    memory_freed,
                    disk_freed,
                    "evicted reader and deleted its cache file"
                );
            } else if reader.approx_memory() > 0 && reader.can_create_cache_file() {
                let disk_before = reader.cache_file_size();
                if let Err(err) = reader.flush() {
                    warn!(
                        reader = %reader.id(),
                        error = %err,
                        "failed to flush reader during eviction, discarding anyway"
                    );
                }
                let memory_freed = reader.discard(false);
                let disk_after = reader.cache_file_size();
                acct.used_memory = acct.used_memory.saturating_sub(memory_freed);
                acct.used_disk = acct
                    .used_disk
                    .saturating_sub(disk_before)
                    .saturating_add(disk_after);
                projected = projected.saturating_sub(memory_freed);
                debug!(
                    reader = %reader.id(),
                    memory_freed,
                    disk_bytes = disk_after,
                    "flushed reader to disk and discarded its buffer"
                );
            } else if reader.approx_memory() > 0 {
                // No cache file allowed; the data is reconstructible from
                // the original source, so dropping it is acceptable.
                let memory_freed = reader.discard(false);
                acct.used_memory = acct.used_memory.saturating_sub(memory_freed);
                projected = projected.saturating_sub(memory_freed);
                debug!(reader = %reader.id(), memory_freed, "discarded memory-only reader");
            }
        }

        if projected > target || touched * 2 > total {
            Self::resync(acct);
        }
    }

    /// Recompute both running totals from live per-reader state, correcting
    /// accumulated drift.
    fn resync(acct: &mut Accounting) {
        let mut memory = 0u64;
        let mut disk = 0u64;
        for reader in acct.readers.values() {
            memory = memory.saturating_add(reader.approx_memory());
            disk = disk.saturating_add(reader.cache_file_size());
        }
        debug!(
            used_memory = memory,
            used_disk = disk,
            readers = acct.readers.len(),
            "resynced cache accounting from reader state"
        );
        acct.used_memory = memory;
        acct.used_disk = disk;
    }

    /// Write every reader's dirty in-memory state to its cache file without
    /// discarding the in-memory copy.
    pub fn flush_all(&self) {
        let snapshot: Vec<Arc<TrackedReader>> = {
            let acct = self.accounting.lock().unwrap();
            acct.readers.values().cloned().collect()
        };
        for reader in &snapshot {
            if let Err(err) = reader.flush() {
                warn!(reader = %reader.id(), error = %err, "failed to flush reader");
            }
        }
        // Flushing grows cache files behind the incremental accounting.
        let mut acct = self.accounting.lock().unwrap();
        Self::resync(&mut acct);
    }

    /// Discard every reader's in-memory data, keeping all cache files.
    ///
    /// Dirty buffers are flushed first, so disposal never loses data that a
    /// cache file could have preserved.
    pub fn dispose_all(&self) {
        let mut guard = self.accounting.lock().unwrap();
        let acct = &mut *guard;
        let mut released = 0u64;
        for reader in acct.readers.values() {
            if let Err(err) = reader.flush() {
                warn!(reader = %reader.id(), error = %err, "failed to flush reader");
            }
            released = released.saturating_add(reader.discard(false));
        }
        Self::resync(acct);
        info!(
            bytes_released = released,
            readers = acct.readers.len(),
            "disposed of all in-memory raster data"
        );
    }

    /// Drop every tracked reader and zero the accounting.
    ///
    /// With `delete_files` set, cache files are deleted and every cache
    /// directory other than the default is removed, best-effort.
    pub fn clear(&self, delete_files: bool) {
        let readers: Vec<Arc<TrackedReader>> = {
            let mut acct = self.accounting.lock().unwrap();
            acct.used_memory = 0;
            acct.used_disk = 0;
            acct.readers.drain().map(|(_, reader)| reader).collect()
        };
        for reader in &readers {
            reader.discard(delete_files);
        }
        self.identifiers.clear();

        if delete_files {
            let default = default_cache_dir();
            let default = fs::canonicalize(&default).unwrap_or(default);
            for entry in self.directories.iter() {
                if entry.key() != &default {
                    if let Err(err) = fs::remove_dir_all(entry.key()) {
                        warn!(
                            directory = %entry.key().display(),
                            error = %err,
                            "could not remove cache directory"
                        );
                    }
                }
            }
        }
        self.directories.clear();
        debug!(readers = readers.len(), delete_files, "cleared the cache registry");
    }

    /// [`clear`](Self::clear) followed by re-resolving the budget from the
    /// environment.
    pub fn reset(&self, delete_files: bool) {
        self.clear(delete_files);
        let budget = CacheBudget::resolve();
        *self.budget.lock().unwrap() = budget;
    }

    /// Derive the cache-file path for a raster identified by `identifier`
    /// under `directory`.
    ///
    /// Without an identifier the file gets a random name and is remembered
    /// for deletion when the registry is dropped, since nothing could ever
    /// re-find it.
    fn cache_file_path(&self, directory: &Path, identifier: Option<&str>) -> PathBuf {
        match identifier {
            Some(identifier) => {
                // Short names come from the location's file stem; the full
                // location disambiguates same-named rasters elsewhere.
                let base = Path::new(identifier)
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .unwrap_or(identifier);
                let short = self.identifiers.unique_identifier(base, identifier);
                directory.join(format!("{short}.{FILE_EXTENSION}"))
            }
            None => {
                let path = directory.join(format!("{}.{FILE_EXTENSION}", Uuid::new_v4()));
                self.anonymous_files.lock().unwrap().push(path.clone());
                path
            }
        }
    }

    fn register_in(
        self: &Arc<Self>,
        directory: &Path,
        reader: Box<dyn RasterReader>,
    ) -> Arc<TrackedReader> {
        let location = reader.location_id();
        let id = match &location {
            Some(location) => ReaderId::new(location.clone()),
            None => ReaderId::new(format!(
                "anonymous-{}",
                self.anonymous_seq.fetch_add(1, Ordering::Relaxed)
            )),
        };
        {
            let acct = self.accounting.lock().unwrap();
            if let Some(existing) = acct.readers.get(&id) {
                debug!(reader = %id, "reader already registered, reusing the existing entry");
                return Arc::clone(existing);
            }
        }
        let cache_file = if reader.should_create_cache_file() {
            Some(self.cache_file_path(directory, location.as_deref()))
        } else {
            None
        };
        let tracked = TrackedReader::new(id, reader, cache_file, Arc::downgrade(self));
        self.admit(tracked)
    }

    fn create_from_cache_in(
        self: &Arc<Self>,
        directory: &Path,
        source: Option<Box<dyn RasterReader>>,
        identifier: &str,
    ) -> Option<MaterializedRaster> {
        let path = self.cache_file_path(directory, Some(identifier));
        if !path.is_file() {
            return None;
        }
        let restored = TrackedReader::from_cache_file(
            ReaderId::new(identifier),
            &path,
            source,
            Arc::downgrade(self),
        );
        match restored {
            Ok(Some(tracked)) => Some(MaterializedRaster {
                reader: self.admit(tracked),
            }),
            Ok(None) => {
                debug!(path = %path.display(), "cache file failed validation, treating as a miss");
                None
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "could not open cache file, treating as a miss"
                );
                None
            }
        }
    }

    /// Add a tracked reader to the accounting, deduplicating by identity.
    fn admit(&self, tracked: Arc<TrackedReader>) -> Arc<TrackedReader> {
        let mut guard = self.accounting.lock().unwrap();
        let acct = &mut *guard;
        match acct.readers.entry(tracked.id().clone()) {
            Entry::Occupied(existing) => Arc::clone(existing.get()),
            Entry::Vacant(slot) => {
                acct.used_memory = acct.used_memory.saturating_add(tracked.approx_memory());
                acct.used_disk = acct.used_disk.saturating_add(tracked.cache_file_size());
                debug!(
                    reader = %tracked.id(),
                    used_memory = acct.used_memory,
                    used_disk = acct.used_disk,
                    "registered reader"
                );
                slot.insert(Arc::clone(&tracked));
                tracked
            }
        }
    }
}

impl Drop for CacheRegistry {
    fn drop(&mut self) {
        let files = std::mem::take(&mut *self.anonymous_files.lock().unwrap());
        for path in files {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    debug!(
                        path = %path.display(),
                        error = %err,
                        "could not remove anonymous cache file"
                    );
                }
            }
        }
    }
}

/// A view of the shared registry bound to one resolved cache directory.
///
/// Cheap to clone; all handles feed the same accounting.
#[derive(Clone)]
pub struct CacheHandle {
    registry: Arc<CacheRegistry>,
    directory: PathBuf,
}

impl CacheHandle {
    /// The resolved cache directory this handle writes cache files to.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// The registry backing this handle.
    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    /// Wrap a raw reader in a tracked cache entry and admit it.
    ///
    /// Registering a reader whose location is already tracked returns the
    /// existing entry unchanged.
    pub fn register(&self, reader: Box<dyn RasterReader>) -> Arc<TrackedReader> {
        self.registry.register_in(&self.directory, reader)
    }

    /// Derive the cache-file path for `identifier` under this handle's
    /// directory. `None` yields a randomly named file that is deleted when
    /// the registry is dropped.
    pub fn create_cache_file(&self, identifier: Option<&str>) -> PathBuf {
        self.registry.cache_file_path(&self.directory, identifier)
    }

    /// Reconstruct a raster directly from the cache file for `identifier`,
    /// bypassing the original format entirely.
    ///
    /// Returns `None` when no such file exists or it fails validation;
    /// absence is a miss, never an error and never an empty raster.
    pub fn create_from_cache(
        &self,
        source: Option<Box<dyn RasterReader>>,
        identifier: &str,
    ) -> Option<MaterializedRaster> {
        self.registry
            .create_from_cache_in(&self.directory, source, identifier)
    }
}

/// A raster view reconstructed from a cache file, served by a tracked
/// reader like any other entry.
pub struct MaterializedRaster {
    reader: Arc<TrackedReader>,
}

impl MaterializedRaster {
    pub fn width(&self) -> u32 {
        self.reader.width()
    }

    pub fn height(&self) -> u32 {
        self.reader.height()
    }

    /// Read a pixel window through the backing tracked reader.
    pub fn read_rect(&self, rect: &RasterRect) -> Result<Vec<u8>, RasterIoError> {
        self.reader.read_rect(rect)
    }

    /// The tracked reader serving this raster.
    pub fn reader(&self) -> &Arc<TrackedReader> {
        &self.reader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{GeoReference, InMemoryReader, RasterDataInfo};
    use tempfile::TempDir;

    fn raster(fill: u8, location: &str) -> Box<dyn RasterReader> {
        Box::new(
            InMemoryReader::new(
                4,
                4,
                RasterDataInfo::new(1, 1),
                GeoReference::new(0.0, 0.0, 1.0, -1.0),
                vec![fill; 16],
            )
            .unwrap()
            .with_location(location),
        )
    }

    fn budget(memory: u64, disk: u64) -> CacheBudget {
        CacheBudget {
            max_memory_bytes: memory,
            max_disk_bytes: disk,
        }
    }

    #[test]
    fn reservation_always_commits() {
        let registry = CacheRegistry::new(budget(100, 1000));
        assert_eq!(registry.reserve(80), 80);
        // The over-budget second call still commits. Its eviction pass
        // finds no readers, misses the target, and resyncs against live
        // reader state, which also drops the first, never-anchored
        // reservation from the estimate.
        assert_eq!(registry.reserve(80), 80);
        assert_eq!(registry.used_memory(), 80);
    }

    #[test]
    fn eviction_target_handles_huge_budgets() {
        let registry = CacheRegistry::new(budget(u64::MAX - 1, 1000));
        assert_eq!(registry.reserve(u64::MAX), u64::MAX);
    }

    #[test]
    fn duplicate_registration_reuses_the_entry() {
        let temp = TempDir::new().unwrap();
        let registry = CacheRegistry::new(budget(1 << 20, 1 << 20));
        let handle = registry.get_or_create(Some(temp.path()), false);

        let first = handle.register(raster(1, "dem"));
        let second = handle.register(raster(2, "dem"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.reader_count(), 1);
    }

    #[test]
    fn anonymous_cache_files_are_deleted_on_drop() {
        let temp = TempDir::new().unwrap();
        let path = {
            let registry = CacheRegistry::new(budget(1 << 20, 1 << 20));
            let handle = registry.get_or_create(Some(temp.path()), false);
            let path = handle.create_cache_file(None);
            fs::write(&path, b"scratch").unwrap();
            assert!(path.is_file());
            path
        };
        assert!(!path.exists());
    }

    #[test]
    fn named_cache_files_survive_drop() {
        let temp = TempDir::new().unwrap();
        let path = {
            let registry = CacheRegistry::new(budget(1 << 20, 1 << 20));
            let handle = registry.get_or_create(Some(temp.path()), false);
            let path = handle.create_cache_file(Some("dem"));
            fs::write(&path, b"persistent").unwrap();
            path
        };
        assert!(path.is_file());
    }

    #[test]
    fn cache_file_names_use_the_location_stem() {
        let temp = TempDir::new().unwrap();
        let registry = CacheRegistry::new(budget(1 << 20, 1 << 20));
        let handle = registry.get_or_create(Some(temp.path()), false);

        let first = handle.create_cache_file(Some("/data/a/dem.tif"));
        let second = handle.create_cache_file(Some("/data/b/dem.tif"));
        assert_eq!(
            first.file_name().and_then(|n| n.to_str()),
            Some("dem.rcache")
        );
        assert_eq!(
            second.file_name().and_then(|n| n.to_str()),
            Some("dem_1.rcache")
        );
        // Asking again for a known location stays stable.
        let again = handle.create_cache_file(Some("/data/b/dem.tif"));
        assert_eq!(again, second);
    }

    #[test]
    fn create_from_cache_misses_on_absent_file() {
        let temp = TempDir::new().unwrap();
        let registry = CacheRegistry::new(budget(1 << 20, 1 << 20));
        let handle = registry.get_or_create(Some(temp.path()), false);
        assert!(handle.create_from_cache(None, "never-written").is_none());
    }
}
