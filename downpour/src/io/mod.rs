//! Crash-safe on-disk store.
//!
//! Two persistence modes with different durability/latency trade-offs:
//!
//! - Small text/binary records (the download state): write-new,
//!   displace-old, promote-new. The new content is streamed to a side file,
//!   the existing primary is renamed to a backup slot, and the side file is
//!   renamed into the primary name. At every instant at least one of
//!   {primary, backup} is a complete prior version; a crash can only leave
//!   "old version still primary" or "new version promoted", never a torn
//!   file.
//!
//! - Large framed records (the piece-list snapshot, rewritten on every
//!   progress tick): a dual-slot format over `{name}.1`/`{name}.2`. Each
//!   write targets the slot that is not the most recently validated one, so
//!   the previous valid slot stays untouched while the new one is written;
//!   roles are then rotated through a uniquely named scratch path. A slot is
//!   valid only if its recorded trailer offset is in bounds and the four
//!   bytes there equal the `END.` magic, so a write torn by a crash is
//!   detected and the other slot is used.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;

/// Trailing magic marker proving a framed slot was completely written.
const FRAME_MAGIC: &[u8; 4] = b"END.";

fn write_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Write {
        path: path.to_path_buf(),
        source,
    }
}

fn read_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Read {
        path: path.to_path_buf(),
        source,
    }
}

/// Atomically replace the small record `name` in `dir` with `bytes`.
pub fn write_bytes(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
    let side = dir.join(format!("{name}.bak"));
    let backup = dir.join(format!("~{name}"));
    let primary = dir.join(name);

    fs::write(&side, bytes).map_err(|e| write_err(&side, e))?;

    if primary.exists() {
        if backup.exists() {
            fs::remove_file(&backup).map_err(|e| write_err(&backup, e))?;
        }
        fs::rename(&primary, &backup).map_err(|e| write_err(&backup, e))?;
    }
    fs::rename(&side, &primary).map_err(|e| write_err(&primary, e))?;
    Ok(())
}

/// Atomically replace the small record `name` in `dir` with `text`.
pub fn write_text(dir: &Path, name: &str, text: &str) -> Result<(), StoreError> {
    write_bytes(dir, name, text.as_bytes())
}

/// Read the small record `name`, preferring the primary file and falling
/// back to the backup slot. Returns `None` when neither exists.
pub fn read_bytes(dir: &Path, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
    for candidate in [dir.join(name), dir.join(format!("~{name}"))] {
        if candidate.exists() {
            match fs::read(&candidate) {
                Ok(bytes) => return Ok(Some(bytes)),
                Err(e) => {
                    debug!(path = %candidate.display(), error = %e, "record unreadable, trying backup");
                    continue;
                }
            }
        }
    }
    Ok(None)
}

/// Read the small text record `name`; see [`read_bytes`].
pub fn read_text(dir: &Path, name: &str) -> Result<Option<String>, StoreError> {
    match read_bytes(dir, name)? {
        Some(bytes) => {
            let path = dir.join(name);
            let text = String::from_utf8(bytes).map_err(|e| {
                read_err(&path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            })?;
            Ok(Some(text))
        }
        None => Ok(None),
    }
}

/// Write `payload` into one slot of the dual-slot framed record `name`.
///
/// The first-ever write creates `{name}.1` directly. Subsequent writes go to
/// `{name}.2` and the slots are rotated through a uniquely named scratch
/// path, so there is no window where both slots are simultaneously invalid.
pub fn write_framed(dir: &Path, name: &str, payload: &[u8]) -> Result<(), StoreError> {
    let slot1 = dir.join(format!("{name}.1"));
    let slot2 = dir.join(format!("{name}.2"));

    if !slot1.exists() {
        write_frame(&slot1, payload)?;
        return Ok(());
    }

    write_frame(&slot2, payload)?;
    let scratch = dir.join(format!("{name}.3.{}", Uuid::new_v4()));
    fs::rename(&slot1, &scratch).map_err(|e| write_err(&scratch, e))?;
    fs::rename(&slot2, &slot1).map_err(|e| write_err(&slot1, e))?;
    fs::rename(&scratch, &slot2).map_err(|e| write_err(&slot2, e))?;
    Ok(())
}

/// Read the framed record `name`, trying `{name}.1` then `{name}.2`.
///
/// Returns `None` when no slot holds a valid frame (missing files, or both
/// slots torn by a crash).
pub fn read_framed(dir: &Path, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
    for slot in [dir.join(format!("{name}.1")), dir.join(format!("{name}.2"))] {
        if !slot.exists() {
            continue;
        }
        match read_frame(&slot) {
            Ok(Some(payload)) => return Ok(Some(payload)),
            Ok(None) => {
                debug!(path = %slot.display(), "framed slot invalid, trying other slot");
            }
            Err(e) => {
                debug!(path = %slot.display(), error = %e, "framed slot unreadable, trying other slot");
            }
        }
    }
    Ok(None)
}

/// Frame layout: 4-byte LE offset of the trailing magic, the payload, and
/// the magic itself at that offset.
fn write_frame(path: &PathBuf, payload: &[u8]) -> Result<(), StoreError> {
    let marker_offset = 4u32 + payload.len() as u32;
    let mut file = fs::File::create(path).map_err(|e| write_err(path, e))?;
    file.write_all(&marker_offset.to_le_bytes())
        .and_then(|_| file.write_all(payload))
        .and_then(|_| file.write_all(FRAME_MAGIC))
        .map_err(|e| write_err(path, e))?;
    Ok(())
}

fn read_frame(path: &PathBuf) -> Result<Option<Vec<u8>>, StoreError> {
    let mut file = fs::File::open(path).map_err(|e| read_err(path, e))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).map_err(|e| read_err(path, e))?;

    if bytes.len() < 8 {
        return Ok(None);
    }
    let marker_offset = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if marker_offset < 4 || marker_offset + 4 > bytes.len() {
        return Ok(None);
    }
    if &bytes[marker_offset..marker_offset + 4] != FRAME_MAGIC {
        return Ok(None);
    }
    Ok(Some(bytes[4..marker_offset].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        write_text(dir.path(), "state.json", "{\"id\":1}").unwrap();
        assert_eq!(
            read_text(dir.path(), "state.json").unwrap().unwrap(),
            "{\"id\":1}"
        );
    }

    #[test]
    fn test_read_missing_record_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(read_text(dir.path(), "absent").unwrap().is_none());
    }

    #[test]
    fn test_rewrite_keeps_backup_of_previous_version() {
        let dir = TempDir::new().unwrap();
        write_text(dir.path(), "state.json", "v1").unwrap();
        write_text(dir.path(), "state.json", "v2").unwrap();

        assert_eq!(read_text(dir.path(), "state.json").unwrap().unwrap(), "v2");
        assert_eq!(
            fs::read_to_string(dir.path().join("~state.json")).unwrap(),
            "v1"
        );
    }

    #[test]
    fn test_read_falls_back_to_backup_when_primary_missing() {
        // Simulates a crash between displacing the old primary and
        // promoting the new side file.
        let dir = TempDir::new().unwrap();
        write_text(dir.path(), "state.json", "v1").unwrap();
        write_text(dir.path(), "state.json", "v2").unwrap();
        fs::remove_file(dir.path().join("state.json")).unwrap();

        assert_eq!(read_text(dir.path(), "state.json").unwrap().unwrap(), "v1");
    }

    #[test]
    fn test_framed_roundtrip_single_slot() {
        let dir = TempDir::new().unwrap();
        write_framed(dir.path(), "chunks.db", b"payload-1").unwrap();

        assert!(dir.path().join("chunks.db.1").exists());
        assert_eq!(
            read_framed(dir.path(), "chunks.db").unwrap().unwrap(),
            b"payload-1"
        );
    }

    #[test]
    fn test_framed_rotation_keeps_previous_version_in_slot_two() {
        let dir = TempDir::new().unwrap();
        write_framed(dir.path(), "chunks.db", b"gen-1").unwrap();
        write_framed(dir.path(), "chunks.db", b"gen-2").unwrap();

        assert_eq!(
            read_framed(dir.path(), "chunks.db").unwrap().unwrap(),
            b"gen-2"
        );
        assert_eq!(read_frame(&dir.path().join("chunks.db.2")).unwrap().unwrap(), b"gen-1");
    }

    #[test]
    fn test_torn_slot_falls_back_to_valid_slot() {
        let dir = TempDir::new().unwrap();
        write_framed(dir.path(), "chunks.db", b"gen-1").unwrap();
        write_framed(dir.path(), "chunks.db", b"gen-2").unwrap();

        // Simulated crash mid-write: truncate the current slot so the magic
        // marker is gone.
        let slot1 = dir.path().join("chunks.db.1");
        let bytes = fs::read(&slot1).unwrap();
        fs::write(&slot1, &bytes[..bytes.len() - 2]).unwrap();

        assert_eq!(
            read_framed(dir.path(), "chunks.db").unwrap().unwrap(),
            b"gen-1"
        );
    }

    #[test]
    fn test_corrupt_offset_is_rejected() {
        let dir = TempDir::new().unwrap();
        let slot1 = dir.path().join("chunks.db.1");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(b"garbage");
        fs::write(&slot1, &bytes).unwrap();

        assert!(read_framed(dir.path(), "chunks.db").unwrap().is_none());
    }

    #[test]
    fn test_empty_payload_frame() {
        let dir = TempDir::new().unwrap();
        write_framed(dir.path(), "chunks.db", b"").unwrap();
        assert_eq!(read_framed(dir.path(), "chunks.db").unwrap().unwrap(), b"");
    }

    proptest! {
        #[test]
        fn prop_framed_roundtrip_arbitrary_payload(
            payload in proptest::collection::vec(any::<u8>(), 0..4096)
        ) {
            let dir = TempDir::new().unwrap();
            write_framed(dir.path(), "chunks.db", &payload).unwrap();
            write_framed(dir.path(), "chunks.db", &payload).unwrap();
            prop_assert_eq!(
                read_framed(dir.path(), "chunks.db").unwrap().unwrap(),
                payload
            );
        }
    }
}
