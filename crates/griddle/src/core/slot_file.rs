//! On-disk format of saved slots.
//!
//! ```text
//! b"GRDL" | u32 LE version | u64 LE header length | JSON header | engine blob
//! ```
//!
//! The header records the positions the blob holds; the blob itself is the
//! engine's own serialization and is passed through untouched.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use crate::engine::StateBlob;
use crate::error::TaskError;
use crate::tokens::TokenSequence;

const MAGIC: &[u8; 4] = b"GRDL";
const VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Header {
    n_positions: usize,
    tokens: TokenSequence,
}

/// Reject names that could escape the slot directory or are unusable as file names.
pub(crate) fn validate_filename(name: &str) -> Result<(), TaskError> {
    let invalid = name.is_empty()
        || name.len() > 255
        || name == "."
        || name == ".."
        || name.starts_with('.')
        || name.chars().any(|c| matches!(c, '/' | '\\' | ':' | '\0') || c.is_control());
    if invalid {
        return Err(TaskError::SlotFile(format!("invalid file name '{name}'")));
    }
    Ok(())
}

/// Resolve `name` inside `dir`, or explain why slot files are unavailable.
pub(crate) fn resolve(dir: Option<&Path>, name: &str) -> Result<PathBuf, TaskError> {
    let dir = dir.ok_or_else(|| TaskError::SlotFile("slot save/restore is not enabled".into()))?;
    validate_filename(name)?;
    Ok(dir.join(name))
}

/// Write a slot file. Returns the number of bytes written.
pub(crate) fn write(path: &Path, tokens: &TokenSequence, blob: &StateBlob) -> Result<usize, TaskError> {
    let header = serde_json::to_vec(&Header {
        n_positions: tokens.len(),
        tokens: tokens.clone(),
    })
    .map_err(|e| TaskError::SlotFile(e.to_string()))?;

    let mut bytes = Vec::with_capacity(16 + header.len() + blob.len());
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&VERSION.to_le_bytes());
    bytes.extend_from_slice(&(header.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&header);
    bytes.extend_from_slice(&blob.0);

    let mut file = fs::File::create(path).map_err(|e| io_error(path, e))?;
    file.write_all(&bytes).map_err(|e| io_error(path, e))?;
    file.sync_all().map_err(|e| io_error(path, e))?;
    Ok(bytes.len())
}

/// Read a slot file back into its token prefix and engine blob.
pub(crate) fn read(path: &Path) -> Result<(TokenSequence, StateBlob), TaskError> {
    let mut bytes = Vec::new();
    fs::File::open(path)
        .and_then(|mut f| f.read_to_end(&mut bytes))
        .map_err(|e| io_error(path, e))?;

    let corrupt = || TaskError::SlotFile(format!("{} is not a slot file", path.display()));
    if bytes.len() < 16 || &bytes[..4] != MAGIC {
        return Err(corrupt());
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().map_err(|_| corrupt())?);
    if version != VERSION {
        return Err(TaskError::SlotFile(format!("unsupported slot file version {version}")));
    }
    let header_len = u64::from_le_bytes(bytes[8..16].try_into().map_err(|_| corrupt())?) as usize;
    let header_end = 16usize.checked_add(header_len).filter(|end| *end <= bytes.len()).ok_or_else(corrupt)?;

    let header: Header = serde_json::from_slice(&bytes[16..header_end])
        .map_err(|e| TaskError::SlotFile(e.to_string()))?;
    if header.n_positions != header.tokens.len() {
        return Err(corrupt());
    }
    Ok((header.tokens, StateBlob(bytes[header_end..].to_vec())))
}

fn io_error(path: &Path, err: std::io::Error) -> TaskError {
    TaskError::SlotFile(format!("{}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_validation() {
        assert!(validate_filename("slot0.bin").is_ok());
        assert!(validate_filename("../etc/passwd").is_err());
        assert!(validate_filename("a/b").is_err());
        assert!(validate_filename("..").is_err());
        assert!(validate_filename("").is_err());
        assert!(validate_filename(".hidden").is_err());
    }

    #[test]
    fn test_resolve_requires_directory() {
        assert!(resolve(None, "a.bin").is_err());
        let dir = PathBuf::from("/tmp/slots");
        assert_eq!(resolve(Some(&dir), "a.bin").unwrap(), dir.join("a.bin"));
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slot.bin");
        let tokens = TokenSequence::from_tokens([4, 5, 6]);
        let blob = StateBlob(vec![1, 2, 3, 4, 5]);

        let n = write(&path, &tokens, &blob).unwrap();
        assert_eq!(n, std::fs::metadata(&path).unwrap().len() as usize);

        let (read_tokens, read_blob) = read(&path).unwrap();
        assert_eq!(read_tokens, tokens);
        assert_eq!(read_blob, blob);
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.bin");
        std::fs::write(&path, b"definitely not a slot file").unwrap();
        assert!(read(&path).is_err());
        assert!(read(&dir.path().join("missing.bin")).is_err());
    }
}
