//! On-disk cache-file codec.
//!
//! A cache file is a fixed little-endian header carrying the raster geometry
//! followed by the raw row-major pixel payload. The header is validated on
//! read; anything that fails validation is reported as "no usable cache
//! file" rather than an error, since a stale or foreign file is an ordinary
//! cache miss.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::raster::{GeoReference, RasterDataInfo};

/// File extension for raster cache files, without the leading dot.
pub const FILE_EXTENSION: &str = "rcache";

const MAGIC: [u8; 4] = *b"RCHE";
const VERSION: u16 = 1;

/// Serialized header length in bytes.
const HEADER_LEN: u64 = 4 + 2 + 4 + 4 + 1 + 1 + 32 + 8;

/// Header of a cache file: enough to reconstruct an in-memory raster view
/// without consulting the original source format.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheFileHeader {
    pub width: u32,
    pub height: u32,
    pub data_info: RasterDataInfo,
    pub geo_reference: GeoReference,
}

impl CacheFileHeader {
    /// Payload length implied by the declared geometry.
    pub fn payload_len(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * self.data_info.pixel_size() as u64
    }

    /// Read and validate the header of the cache file at `path`.
    ///
    /// Returns `Ok(None)` when the file exists but is not a valid cache
    /// file (wrong magic, unknown version, or a size that contradicts the
    /// declared geometry).
    pub fn read_from(path: &Path) -> io::Result<Option<Self>> {
        let mut reader = fs::File::open(path)?;
        let file_len = reader.metadata()?.len();
        if file_len < HEADER_LEN {
            return Ok(None);
        }

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Ok(None);
        }
        if read_u16(&mut reader)? != VERSION {
            return Ok(None);
        }

        let width = read_u32(&mut reader)?;
        let height = read_u32(&mut reader)?;
        let bands = read_u8(&mut reader)?;
        let bytes_per_sample = read_u8(&mut reader)?;
        let geo_reference = GeoReference::new(
            read_f64(&mut reader)?,
            read_f64(&mut reader)?,
            read_f64(&mut reader)?,
            read_f64(&mut reader)?,
        );
        let payload_len = read_u64(&mut reader)?;

        let header = Self {
            width,
            height,
            data_info: RasterDataInfo::new(bands, bytes_per_sample),
            geo_reference,
        };
        if payload_len != header.payload_len() || file_len != HEADER_LEN + payload_len {
            return Ok(None);
        }
        Ok(Some(header))
    }
}

/// Write a complete cache file: header plus pixel payload.
///
/// The payload length must match the header's declared geometry.
pub(crate) fn write_cache_file(
    path: &Path,
    header: &CacheFileHeader,
    payload: &[u8],
) -> io::Result<()> {
    if payload.len() as u64 != header.payload_len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "payload of {} bytes does not match declared geometry ({} bytes)",
                payload.len(),
                header.payload_len()
            ),
        ));
    }

    let mut out = io::BufWriter::new(fs::File::create(path)?);
    out.write_all(&MAGIC)?;
    out.write_all(&VERSION.to_le_bytes())?;
    out.write_all(&header.width.to_le_bytes())?;
    out.write_all(&header.height.to_le_bytes())?;
    out.write_all(&[header.data_info.bands, header.data_info.bytes_per_sample])?;
    out.write_all(&header.geo_reference.origin_x.to_le_bytes())?;
    out.write_all(&header.geo_reference.origin_y.to_le_bytes())?;
    out.write_all(&header.geo_reference.resolution_x.to_le_bytes())?;
    out.write_all(&header.geo_reference.resolution_y.to_le_bytes())?;
    out.write_all(&(payload.len() as u64).to_le_bytes())?;
    out.write_all(payload)?;
    out.flush()
}

/// Read and validate a complete cache file.
///
/// Returns `Ok(None)` for files that fail header validation.
pub(crate) fn read_cache_file(path: &Path) -> io::Result<Option<(CacheFileHeader, Vec<u8>)>> {
    let Some(header) = CacheFileHeader::read_from(path)? else {
        return Ok(None);
    };

    let mut reader = fs::File::open(path)?;
    reader.seek(SeekFrom::Start(HEADER_LEN))?;
    let mut payload = Vec::with_capacity(header.payload_len() as usize);
    reader.read_to_end(&mut payload)?;
    if payload.len() as u64 != header.payload_len() {
        return Ok(None);
    }
    Ok(Some((header, payload)))
}

fn read_u8(r: &mut impl Read) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u16(r: &mut impl Read) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(r: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f64(r: &mut impl Read) -> io::Result<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_header() -> CacheFileHeader {
        CacheFileHeader {
            width: 4,
            height: 3,
            data_info: RasterDataInfo::new(2, 1),
            geo_reference: GeoReference::new(10.0, 20.0, 0.5, -0.5),
        }
    }

    #[test]
    fn roundtrip_header_and_payload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("raster.rcache");
        let header = test_header();
        let payload: Vec<u8> = (0..24).collect();

        write_cache_file(&path, &header, &payload).unwrap();

        let (read_header, read_payload) = read_cache_file(&path).unwrap().unwrap();
        assert_eq!(read_header, header);
        assert_eq!(read_payload, payload);
    }

    #[test]
    fn rejects_payload_geometry_mismatch_on_write() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("raster.rcache");
        let result = write_cache_file(&path, &test_header(), &[0u8; 10]);
        assert!(result.is_err());
    }

    #[test]
    fn foreign_file_reads_as_invalid() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("note.rcache");
        fs::write(&path, b"definitely not a cache file, but long enough to hold a header ......")
            .unwrap();
        assert!(CacheFileHeader::read_from(&path).unwrap().is_none());
    }

    #[test]
    fn truncated_file_reads_as_invalid() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("raster.rcache");
        let payload: Vec<u8> = (0..24).collect();
        write_cache_file(&path, &test_header(), &payload).unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();
        assert!(CacheFileHeader::read_from(&path).unwrap().is_none());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let temp = TempDir::new().unwrap();
        let result = CacheFileHeader::read_from(&temp.path().join("absent.rcache"));
        assert!(result.is_err());
    }
}
