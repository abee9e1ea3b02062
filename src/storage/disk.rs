//! Durable JSON documents and filesystem queries

use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, warn};

use crate::core::StoreError;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write `value` to `path` so readers see either the old or the new document.
///
/// Serializes to `<path>.tmp`, fsyncs it, renames over `path`, then fsyncs
/// the directory so the rename itself survives power loss.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = tmp_path(path);

    {
        let mut file = File::create(&tmp).map_err(io_err(&tmp))?;
        file.write_all(&bytes).map_err(io_err(&tmp))?;
        file.sync_all().map_err(io_err(&tmp))?;
    }

    fs::rename(&tmp, path).map_err(io_err(path))?;

    if let Some(dir) = path.parent() {
        if let Ok(dir) = File::open(dir) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Load a JSON document, or `T::default()` if it is absent.
///
/// A document that cannot be parsed is moved aside as
/// `<path>.corrupt-<unix_ts>` and treated as absent.
pub fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(io_err(path)(e)),
    };

    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(value),
        Err(e) => {
            let quarantine = corrupt_path(path);
            error!(
                "State file {:?} is corrupt ({}); moving it to {:?} and starting empty",
                path, e, quarantine
            );
            if let Err(e) = fs::rename(path, &quarantine) {
                warn!("Failed to quarantine {:?}: {}", path, e);
            }
            Ok(T::default())
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn corrupt_path(path: &Path) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".corrupt-{}", ts));
    path.with_file_name(name)
}

/// Free space available to unprivileged users on the filesystem holding `path`
#[cfg(unix)]
pub fn available_bytes(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    // SAFETY: statvfs only writes into the zeroed struct we own
    unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
            warn!("statvfs({:?}) failed: {}", path, std::io::Error::last_os_error());
            return None;
        }
        #[allow(clippy::unnecessary_cast)]
        Some(stat.f_bavail as u64 * stat.f_frsize as u64)
    }
}

#[cfg(not(unix))]
pub fn available_bytes(_path: &Path) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn atomic_write_replaces_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");

        let mut doc = BTreeMap::new();
        doc.insert("a".to_string(), 1u32);
        write_json_atomic(&path, &doc).unwrap();
        doc.insert("b".to_string(), 2);
        write_json_atomic(&path, &doc).unwrap();

        let loaded: BTreeMap<String, u32> = load_json_or_default(&path).unwrap();
        assert_eq!(loaded, doc);
        assert!(!dir.path().join("doc.json.tmp").exists());
    }

    #[test]
    fn missing_document_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Vec<u32> = load_json_or_default(&dir.path().join("none.json")).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn corrupt_document_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        fs::write(&path, b"{not json").unwrap();

        let loaded: Vec<u32> = load_json_or_default(&path).unwrap();
        assert!(loaded.is_empty());
        assert!(!path.exists());

        let quarantined: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("queue.json.corrupt-"))
            .collect();
        assert_eq!(quarantined.len(), 1);
    }

    #[test]
    fn statvfs_reports_space() {
        let dir = tempfile::tempdir().unwrap();
        assert!(available_bytes(dir.path()).is_some());
    }
}
