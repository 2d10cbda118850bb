//! GGUF model files
//!
//! Header checks run before a file is handed to llama.cpp, so a wrong or
//! truncated file fails fast with a readable error instead of a backend abort.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use thiserror::Error;

use crate::inference::error::ModelLoadError;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// Header size: magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
const HEADER_LEN: u64 = 24;

/// GGUF header problems
#[derive(Debug, Error)]
pub enum GgufError {
    #[error("Failed to open file: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a GGUF file (magic 0x{0:08X})")]
    InvalidMagic(u32),

    #[error("unsupported GGUF version {0}")]
    UnsupportedVersion(u32),

    #[error("file too small to be valid GGUF")]
    FileTooSmall,

    #[error("GGUF file declares no tensors")]
    NoTensors,
}

impl From<GgufError> for ModelLoadError {
    fn from(e: GgufError) -> Self {
        ModelLoadError::InvalidModelFile(e.to_string())
    }
}

/// Fixed-size GGUF header
#[derive(Debug, Clone, PartialEq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

/// Reads and checks the header of a GGUF file
pub fn read_gguf_header<P: AsRef<Path>>(path: P) -> Result<GgufHeader, GgufError> {
    let file = File::open(path)?;
    if file.metadata()?.len() < HEADER_LEN {
        return Err(GgufError::FileTooSmall);
    }
    let mut reader = BufReader::new(file);

    let magic = read_u32(&mut reader)?;
    if magic != GGUF_MAGIC {
        return Err(GgufError::InvalidMagic(magic));
    }

    // GGUF v2 and v3 use 64-bit counts; v1 is long gone
    let version = read_u32(&mut reader)?;
    if !(2..=3).contains(&version) {
        return Err(GgufError::UnsupportedVersion(version));
    }

    let tensor_count = read_u64(&mut reader)?;
    if tensor_count == 0 {
        return Err(GgufError::NoTensors);
    }

    Ok(GgufHeader {
        version,
        tensor_count,
        metadata_kv_count: read_u64(&mut reader)?,
    })
}

fn read_u32(reader: &mut impl Read) -> Result<u32, GgufError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> Result<u64, GgufError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
pub(crate) fn write_test_gguf(path: &Path, version: u32, tensors: u64) {
    use std::io::Write;

    let mut file = File::create(path).unwrap();
    file.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap();
    file.write_all(&version.to_le_bytes()).unwrap();
    file.write_all(&tensors.to_le_bytes()).unwrap();
    file.write_all(&5u64.to_le_bytes()).unwrap();
    file.flush().unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_valid_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tiny.gguf");
        write_test_gguf(&path, 3, 10);

        let header = read_gguf_header(&path).unwrap();
        assert_eq!(
            header,
            GgufHeader {
                version: 3,
                tensor_count: 10,
                metadata_kv_count: 5
            }
        );
    }

    #[test]
    fn test_invalid_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.gguf");
        let mut file = File::create(&path).unwrap();
        file.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        file.write_all(&[0u8; 20]).unwrap();

        assert!(matches!(
            read_gguf_header(&path),
            Err(GgufError::InvalidMagic(0xDEADBEEF))
        ));
    }

    #[test]
    fn test_truncated_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.gguf");
        File::create(&path)
            .unwrap()
            .write_all(&GGUF_MAGIC.to_le_bytes())
            .unwrap();

        assert!(matches!(read_gguf_header(&path), Err(GgufError::FileTooSmall)));
    }

    #[test]
    fn test_unsupported_version_and_empty_model() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("old.gguf");
        write_test_gguf(&old, 1, 10);
        assert!(matches!(read_gguf_header(&old), Err(GgufError::UnsupportedVersion(1))));

        let empty = dir.path().join("empty.gguf");
        write_test_gguf(&empty, 3, 0);
        assert!(matches!(read_gguf_header(&empty), Err(GgufError::NoTensors)));
    }

    #[test]
    fn test_converts_to_load_error() {
        let err: ModelLoadError = GgufError::FileTooSmall.into();
        assert!(matches!(err, ModelLoadError::InvalidModelFile(_)));
    }
}
