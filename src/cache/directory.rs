//! Cache-directory resolution and cache-file identifier bookkeeping.

use std::fs;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use tracing::warn;

/// The process default cache directory, under the system temp dir.
pub fn default_cache_dir() -> PathBuf {
    std::env::temp_dir().join("rastercache")
}

/// Resolve a requested cache directory to the absolute path used as the
/// registry key.
///
/// A missing directory is created when `create_if_missing` is set;
/// otherwise, and on any creation failure, the default directory is used
/// instead. Resolution never fails.
pub(crate) fn resolve_directory(directory: Option<&Path>, create_if_missing: bool) -> PathBuf {
    let resolved = match directory {
        None => ensure_default(),
        Some(dir) if dir.is_dir() => dir.to_path_buf(),
        Some(dir) if create_if_missing => match fs::create_dir_all(dir) {
            Ok(()) => dir.to_path_buf(),
            Err(err) => {
                warn!(
                    directory = %dir.display(),
                    error = %err,
                    "could not create cache directory, using the default instead"
                );
                ensure_default()
            }
        },
        Some(dir) => {
            warn!(
                directory = %dir.display(),
                "cache directory does not exist, using the default instead"
            );
            ensure_default()
        }
    };
    // Canonical keying, so "./cache" and its absolute form share one entry.
    fs::canonicalize(&resolved).unwrap_or(resolved)
}

fn ensure_default() -> PathBuf {
    let dir = default_cache_dir();
    if let Err(err) = fs::create_dir_all(&dir) {
        warn!(
            directory = %dir.display(),
            error = %err,
            "could not create the default cache directory"
        );
    }
    dir
}

/// Check whether caching is disabled for a source raster file via a
/// sentinel placed next to it.
///
/// `<name>.no-cache` disables caching for every resolution level of the
/// raster; `<name>.no-cache-<level>` disables it for one level only. I/O
/// trouble while probing reads as "no sentinel present".
pub fn has_no_cache_file(source: &Path, level: Option<u32>) -> bool {
    let Some(name) = source.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let parent = source.parent().unwrap_or_else(|| Path::new("."));
    if parent.join(format!("{name}.no-cache")).exists() {
        return true;
    }
    match level {
        Some(level) => parent.join(format!("{name}.no-cache-{level}")).exists(),
        None => false,
    }
}

/// Process-wide table of short cache-file identifiers already issued, used
/// to keep generated names short while distinguishing same-named rasters
/// living at different locations.
///
/// Append-only between wholesale resets; entries are never dropped on
/// access.
#[derive(Default)]
pub(crate) struct IdentifierTable {
    issued: DashMap<String, String>,
}

impl IdentifierTable {
    /// Return a short identifier for `location`, derived from `base` and
    /// suffixed until it no longer collides with an identifier issued for a
    /// different location. Stable for repeated calls with the same inputs.
    pub(crate) fn unique_identifier(&self, base: &str, location: &str) -> String {
        let base = file_safe(base);
        let mut candidate = base.clone();
        let mut index = 0u32;
        loop {
            match self.issued.entry(candidate.clone()) {
                dashmap::mapref::entry::Entry::Occupied(entry) if entry.get() == location => {
                    return candidate;
                }
                dashmap::mapref::entry::Entry::Occupied(_) => {
                    index += 1;
                    candidate = format!("{base}_{index}");
                }
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(location.to_string());
                    return candidate;
                }
            }
        }
    }

    pub(crate) fn clear(&self) {
        self.issued.clear();
    }
}

/// Reduce an identifier to a filename-safe stem.
fn file_safe(identifier: &str) -> String {
    let safe: String = identifier
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if safe.is_empty() {
        "raster".to_string()
    } else {
        safe
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_directory_without_create_falls_back_to_default() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("absent");
        let resolved = resolve_directory(Some(&missing), false);
        assert_ne!(resolved, missing);
        assert!(resolved.ends_with("rastercache"));
    }

    #[test]
    fn missing_directory_with_create_is_created() {
        let temp = TempDir::new().unwrap();
        let wanted = temp.path().join("fresh");
        let resolved = resolve_directory(Some(&wanted), true);
        assert!(wanted.is_dir());
        assert_eq!(resolved, fs::canonicalize(&wanted).unwrap());
    }

    #[test]
    fn level_free_sentinel_covers_all_levels() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("dem.tif");
        fs::write(&source, b"raster").unwrap();
        fs::write(temp.path().join("dem.tif.no-cache"), b"").unwrap();

        assert!(has_no_cache_file(&source, None));
        assert!(has_no_cache_file(&source, Some(0)));
        assert!(has_no_cache_file(&source, Some(3)));
    }

    #[test]
    fn level_specific_sentinel_covers_only_its_level() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("dem.tif");
        fs::write(&source, b"raster").unwrap();
        fs::write(temp.path().join("dem.tif.no-cache-2"), b"").unwrap();

        assert!(!has_no_cache_file(&source, None));
        assert!(!has_no_cache_file(&source, Some(1)));
        assert!(has_no_cache_file(&source, Some(2)));
    }

    #[test]
    fn no_sentinel_means_caching_allowed() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("dem.tif");
        assert!(!has_no_cache_file(&source, None));
        assert!(!has_no_cache_file(&source, Some(0)));
    }

    #[test]
    fn identifier_is_stable_for_the_same_location() {
        let table = IdentifierTable::default();
        let first = table.unique_identifier("dem", "/a/dem.tif");
        let again = table.unique_identifier("dem", "/a/dem.tif");
        assert_eq!(first, "dem");
        assert_eq!(again, "dem");
    }

    #[test]
    fn same_name_different_location_gets_a_suffix() {
        let table = IdentifierTable::default();
        assert_eq!(table.unique_identifier("dem", "/a/dem.tif"), "dem");
        assert_eq!(table.unique_identifier("dem", "/b/dem.tif"), "dem_1");
        assert_eq!(table.unique_identifier("dem", "/c/dem.tif"), "dem_2");
        // Re-asking for an already-suffixed location stays stable.
        assert_eq!(table.unique_identifier("dem", "/b/dem.tif"), "dem_1");
    }

    #[test]
    fn unsafe_characters_are_replaced() {
        let table = IdentifierTable::default();
        let ident = table.unique_identifier("wms:layer/0", "wms:layer/0");
        assert_eq!(ident, "wms_layer_0");
    }
}
