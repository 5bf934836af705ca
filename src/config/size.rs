//! Human-readable byte-size parsing (e.g., "1024m", "20GB").

use thiserror::Error;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * 1024 * 1024;

/// Error parsing a size expression.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid size '{input}' - expected a byte count or a K/M/G suffixed value like '1024m'")]
pub struct SizeParseError {
    input: String,
}

impl SizeParseError {
    fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// Parse a human-readable size expression into bytes.
///
/// Accepts bare byte counts and `K`/`KB`, `M`/`MB`, `G`/`GB` suffixes
/// (1024-based), case-insensitive, with surrounding whitespace tolerated.
///
/// # Examples
///
/// ```
/// use rastercache::config::parse_size;
///
/// assert_eq!(parse_size("4096").unwrap(), 4096);
/// assert_eq!(parse_size("1024m").unwrap(), 1024 * 1024 * 1024);
/// assert_eq!(parse_size(" 20 GB ").unwrap(), 20 * 1024 * 1024 * 1024);
/// ```
pub fn parse_size(s: &str) -> Result<u64, SizeParseError> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(SizeParseError::new(s));
    }

    let (digits, multiplier) = split_suffix(trimmed);
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| SizeParseError::new(trimmed))?;

    value
        .checked_mul(multiplier)
        .ok_or_else(|| SizeParseError::new(trimmed))
}

/// Split a trimmed size expression into its numeric part and the byte
/// multiplier implied by its suffix.
fn split_suffix(s: &str) -> (&str, u64) {
    const SUFFIXES: [(&str, u64); 6] = [
        ("GB", GIB),
        ("MB", MIB),
        ("KB", KIB),
        ("G", GIB),
        ("M", MIB),
        ("K", KIB),
    ];

    let upper = s.to_ascii_uppercase();
    for (suffix, multiplier) in SUFFIXES {
        if upper.ends_with(suffix) {
            return (&s[..s.len() - suffix.len()], multiplier);
        }
    }
    (s, 1)
}

/// Format a byte count as a human-readable string.
///
/// Uses the largest 1024-based unit that divides the value evenly, so the
/// output can be parsed back by [`parse_size`] without loss.
pub fn format_size(bytes: u64) -> String {
    if bytes >= GIB && bytes % GIB == 0 {
        format!("{}GB", bytes / GIB)
    } else if bytes >= MIB && bytes % MIB == 0 {
        format!("{}MB", bytes / MIB)
    } else if bytes >= KIB && bytes % KIB == 0 {
        format!("{}KB", bytes / KIB)
    } else {
        format!("{bytes}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_bytes() {
        assert_eq!(parse_size("0").unwrap(), 0);
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("999999").unwrap(), 999999);
    }

    #[test]
    fn parse_suffixed_values() {
        assert_eq!(parse_size("1K").unwrap(), 1024);
        assert_eq!(parse_size("100kb").unwrap(), 100 * 1024);
        assert_eq!(parse_size("1024m").unwrap(), 1024 * MIB);
        assert_eq!(parse_size("500MB").unwrap(), 500 * MIB);
        assert_eq!(parse_size("20G").unwrap(), 20 * GIB);
        assert_eq!(parse_size("20gb").unwrap(), 20 * GIB);
    }

    #[test]
    fn parse_tolerates_whitespace() {
        assert_eq!(parse_size("  2GB  ").unwrap(), 2 * GIB);
        assert_eq!(parse_size("2 GB").unwrap(), 2 * GIB);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("abc").is_err());
        assert!(parse_size("-1G").is_err());
        assert!(parse_size("1.5GB").is_err());
        assert!(parse_size("2TB").is_err());
    }

    #[test]
    fn parse_rejects_overflow() {
        assert!(parse_size("99999999999999999999G").is_err());
        assert!(parse_size(&format!("{}G", u64::MAX)).is_err());
    }

    #[test]
    fn format_picks_largest_even_unit() {
        assert_eq!(format_size(1024), "1KB");
        assert_eq!(format_size(20 * GIB), "20GB");
        assert_eq!(format_size(500 * MIB), "500MB");
        assert_eq!(format_size(1000), "1000");
    }

    #[test]
    fn format_parse_roundtrip() {
        for s in ["1KB", "500MB", "2GB", "20GB"] {
            let bytes = parse_size(s).unwrap();
            assert_eq!(format_size(bytes), s);
        }
    }
}
