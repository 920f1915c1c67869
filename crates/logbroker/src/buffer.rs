// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Append-only file holding log records that have not been delivered yet.
//!
//! Every operation takes the store's lock, so an append can never land
//! between the moment a flush reads the file and the moment it clears it.
//! Flushes remember how many bytes they read ([`BufferSnapshot`]) and
//! [`DurableStore::clear_snapshot`] removes only that prefix: records that
//! arrived while the batch was on the wire stay buffered.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tracing::{debug, warn};

use crate::codec::{self, BufferRecord};
use crate::error::BufferError;

/// Records read from the buffer together with the number of bytes they
/// were decoded from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferSnapshot {
    pub records: Vec<BufferRecord>,
    pub len: u64,
}

impl BufferSnapshot {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug)]
pub struct DurableStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DurableStore {
    /// Nothing touches the disk until the first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // The lock guards no data, a panic while holding it leaves nothing inconsistent.
    fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends one record per line, all stamped with the current UTC time,
    /// and fsyncs before returning.
    pub fn append<S: AsRef<str>>(&self, lines: &[S]) -> Result<(), BufferError> {
        if lines.is_empty() {
            return Ok(());
        }
        let timestamp = codec::format_timestamp(Utc::now());
        let mut payload = String::new();
        for line in lines {
            let message = line.as_ref().trim_end_matches(&['\n', '\r'][..]);
            codec::encode_into(&BufferRecord::new(timestamp.as_str(), message), &mut payload);
        }

        let _guard = self.lock();
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| BufferError::io("create directory for", parent, e))?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| BufferError::io("open", &self.path, e))?;

        let partial = ends_with_partial_line(&mut file)
            .map_err(|e| BufferError::io("inspect", &self.path, e))?;
        if partial {
            warn!(
                "BUFFER | {} ends with a partial line, starting new records on a fresh line",
                self.path.display()
            );
            payload.insert(0, '\n');
        }

        file.write_all(payload.as_bytes())
            .and_then(|()| file.flush())
            .and_then(|()| file.sync_all())
            .map_err(|e| BufferError::io("append to", &self.path, e))?;

        debug!("BUFFER | Appended {} records", lines.len());
        Ok(())
    }

    /// Reads and decodes every record. A missing file is an empty buffer.
    pub fn read_all(&self) -> Result<Vec<BufferRecord>, BufferError> {
        Ok(self.snapshot()?.records)
    }

    pub fn snapshot(&self) -> Result<BufferSnapshot, BufferError> {
        let _guard = self.lock();
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BufferSnapshot::default()),
            Err(e) => return Err(BufferError::io("read", &self.path, e)),
        };

        let content = String::from_utf8_lossy(&bytes);
        let mut records = Vec::new();
        let mut malformed = 0usize;
        for line in content.split('\n').filter(|line| !line.is_empty()) {
            let (record, well_formed) = codec::decode(line);
            if !well_formed {
                malformed += 1;
            }
            records.push(record);
        }
        if malformed > 0 {
            warn!(
                "BUFFER | {malformed} malformed lines in {}, forwarding them with an empty message",
                self.path.display()
            );
        }

        Ok(BufferSnapshot {
            records,
            len: bytes.len() as u64,
        })
    }

    /// Truncates the buffer to empty. The file itself is kept.
    pub fn clear(&self) -> Result<(), BufferError> {
        let _guard = self.lock();
        let Some(file) = self.open_existing()? else {
            return Ok(());
        };
        truncate(&file).map_err(|e| BufferError::io("truncate", &self.path, e))
    }

    /// Removes the first `snapshot.len` bytes, keeping whatever was appended
    /// after the snapshot was taken.
    pub fn clear_snapshot(&self, snapshot: &BufferSnapshot) -> Result<(), BufferError> {
        let _guard = self.lock();
        let Some(mut file) = self.open_existing()? else {
            return Ok(());
        };
        let len = file
            .metadata()
            .map_err(|e| BufferError::io("stat", &self.path, e))?
            .len();

        if len == snapshot.len {
            return truncate(&file).map_err(|e| BufferError::io("truncate", &self.path, e));
        }
        if len < snapshot.len {
            warn!(
                "BUFFER | {} shrank from {} to {} bytes since it was read, keeping it as is",
                self.path.display(),
                snapshot.len,
                len
            );
            return Ok(());
        }

        let mut tail = Vec::with_capacity((len - snapshot.len) as usize);
        file.seek(SeekFrom::Start(snapshot.len))
            .and_then(|_| file.read_to_end(&mut tail))
            .map_err(|e| BufferError::io("read tail of", &self.path, e))?;
        self.replace_contents(&tail)?;

        debug!(
            "BUFFER | Cleared {} delivered bytes, kept {} bytes appended during flush",
            snapshot.len,
            tail.len()
        );
        Ok(())
    }

    fn open_existing(&self) -> Result<Option<File>, BufferError> {
        match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BufferError::io("open", &self.path, e)),
        }
    }

    /// Writes `contents` to a sibling file and renames it over the buffer.
    fn replace_contents(&self, contents: &[u8]) -> Result<(), BufferError> {
        let mut file_name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        file_name.push(".compact");
        let tmp_path = self.path.with_file_name(file_name);

        let mut tmp = File::create(&tmp_path).map_err(|e| BufferError::io("create", &tmp_path, e))?;
        tmp.write_all(contents)
            .and_then(|()| tmp.sync_all())
            .map_err(|e| BufferError::io("write", &tmp_path, e))?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path).map_err(|e| BufferError::io("replace", &self.path, e))?;
        if let Some(parent) = self.path.parent() {
            fsync_dir(parent).map_err(|e| BufferError::io("sync directory of", &self.path, e))?;
        }
        Ok(())
    }
}

fn truncate(file: &File) -> io::Result<()> {
    file.set_len(0)?;
    file.sync_all()
}

fn ends_with_partial_line(file: &mut File) -> io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

#[cfg(unix)]
fn fsync_dir(dir: &Path) -> io::Result<()> {
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    File::open(dir)?.sync_all()
}

// Directories cannot be opened as files on Windows, the rename is durable on its own.
#[cfg(not(unix))]
fn fsync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tracing_test::traced_test;

    fn messages(records: &[BufferRecord]) -> Vec<&str> {
        records.iter().map(|r| r.message.as_str()).collect()
    }

    #[test]
    fn test_read_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = DurableStore::new(dir.path().join("buffer.log"));
        assert!(store.read_all().unwrap().is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_append_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("buffer.log");
        let store = DurableStore::new(&path);

        store.append(&["hello"]).unwrap();

        assert!(path.exists());
        assert_eq!(messages(&store.read_all().unwrap()), vec!["hello"]);
    }

    #[test]
    fn test_append_survives_restart_with_shared_timestamp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buffer.log");
        DurableStore::new(&path).append(&["a", "b", "c"]).unwrap();

        let records = DurableStore::new(&path).read_all().unwrap();
        assert_eq!(messages(&records), vec!["a", "b", "c"]);
        assert!(records.iter().all(|r| r.timestamp == records[0].timestamp));
        assert_eq!(records[0].timestamp.len(), "YYYY-MM-DD HH:MM:SS".len());
    }

    #[test]
    fn test_append_is_monotonic() {
        let dir = tempdir().unwrap();
        let store = DurableStore::new(dir.path().join("buffer.log"));
        store.append(&["1", "2"]).unwrap();
        store.append(&["3"]).unwrap();
        assert_eq!(messages(&store.read_all().unwrap()), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_append_strips_line_terminators_and_escapes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buffer.log");
        let store = DurableStore::new(&path);
        store.append(&["with\ttab\r\n", "back\\slash"]).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert!(raw.contains("with\\ttab\n"));
        assert!(raw.contains("back\\\\slash\n"));
        assert_eq!(
            messages(&store.read_all().unwrap()),
            vec!["with\ttab", "back\\slash"]
        );
    }

    #[test]
    fn test_append_repairs_partial_last_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buffer.log");
        fs::write(&path, "2024-01-01 00:00:00\ttorn wri").unwrap();

        let store = DurableStore::new(&path);
        store.append(&["next"]).unwrap();

        assert_eq!(messages(&store.read_all().unwrap()), vec!["torn wri", "next"]);
    }

    #[test]
    #[traced_test]
    fn test_malformed_lines_are_kept() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buffer.log");
        fs::write(&path, "no separator here\n2024-01-01 00:00:00\tok\n\n").unwrap();

        let records = DurableStore::new(&path).read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], BufferRecord::new("no separator here", ""));
        assert_eq!(records[1].message, "ok");
        assert!(logs_contain("1 malformed lines"));
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buffer.log");
        fs::write(&path, b"2024-01-01 00:00:00\tbad \xff byte\n").unwrap();

        let records = DurableStore::new(&path).read_all().unwrap();
        assert_eq!(records[0].message, "bad \u{fffd} byte");
    }

    #[test]
    fn test_clear_keeps_file_and_allows_append() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sub").join("buffer.log");
        let store = DurableStore::new(&path);
        store.append(&["a"]).unwrap();

        store.clear().unwrap();
        assert!(path.exists());
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        assert!(store.read_all().unwrap().is_empty());

        store.append(&["b"]).unwrap();
        assert_eq!(messages(&store.read_all().unwrap()), vec!["b"]);
    }

    #[test]
    fn test_clear_missing_file_is_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buffer.log");
        let store = DurableStore::new(&path);
        store.clear().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_clear_snapshot_keeps_records_appended_after_read() {
        let dir = tempdir().unwrap();
        let store = DurableStore::new(dir.path().join("buffer.log"));
        store.append(&["a", "b", "c"]).unwrap();

        let snapshot = store.snapshot().unwrap();
        assert_eq!(messages(&snapshot.records), vec!["a", "b", "c"]);

        store.append(&["d"]).unwrap();
        store.clear_snapshot(&snapshot).unwrap();

        assert_eq!(messages(&store.read_all().unwrap()), vec!["d"]);
        store.append(&["e"]).unwrap();
        assert_eq!(messages(&store.read_all().unwrap()), vec!["d", "e"]);
    }

    #[test]
    fn test_clear_snapshot_without_new_records_truncates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buffer.log");
        let store = DurableStore::new(&path);
        store.append(&["a"]).unwrap();

        let snapshot = store.snapshot().unwrap();
        store.clear_snapshot(&snapshot).unwrap();

        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_clear_snapshot_leaves_shrunk_file_alone() {
        let dir = tempdir().unwrap();
        let store = DurableStore::new(dir.path().join("buffer.log"));
        store.append(&["a", "b"]).unwrap();
        let snapshot = store.snapshot().unwrap();

        store.clear().unwrap();
        store.append(&["x"]).unwrap();
        store.clear_snapshot(&snapshot).unwrap();

        assert_eq!(messages(&store.read_all().unwrap()), vec!["x"]);
    }

    #[test]
    fn test_concurrent_appends_do_not_interleave() {
        let dir = tempdir().unwrap();
        let store = std::sync::Arc::new(DurableStore::new(dir.path().join("buffer.log")));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    let lines: Vec<String> =
                        (0..25).map(|j| format!("writer-{i}-line-{j}")).collect();
                    store.append(&lines).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let records = store.read_all().unwrap();
        assert_eq!(records.len(), 200);
        for i in 0..8 {
            let own: Vec<_> = records
                .iter()
                .filter(|r| r.message.starts_with(&format!("writer-{i}-")))
                .map(|r| r.message.clone())
                .collect();
            let expected: Vec<_> = (0..25).map(|j| format!("writer-{i}-line-{j}")).collect();
            assert_eq!(own, expected);
        }
    }
}
