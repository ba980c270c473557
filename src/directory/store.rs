//! Buffer Store
//!
//! Owner-side storage for published buffer payloads. Small buffers
//! stay resident in memory; payloads at or above the spill threshold
//! are written to a file under the storage directory and read back on
//! demand, keeping large published data off the heap.

use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, warn};

use super::DirectoryError;

enum Slot {
    Resident(Bytes),
    Spilled { size: u64 },
}

pub struct BufferStore {
    dir: PathBuf,
    spill_threshold: usize,
    slots: DashMap<String, Slot>,
}

impl BufferStore {
    pub fn new(dir: PathBuf, spill_threshold: usize) -> Result<Self, DirectoryError> {
        fs::create_dir_all(&dir)
            .map_err(|e| DirectoryError::Storage(format!("create {}: {}", dir.display(), e)))?;
        Ok(Self {
            dir,
            spill_threshold,
            slots: DashMap::new(),
        })
    }

    /// Store a payload under `buffer_id`, replacing any previous one.
    pub fn insert(&self, buffer_id: &str, data: Bytes) -> Result<(), DirectoryError> {
        let spilling = data.len() >= self.spill_threshold;
        let slot = if spilling {
            let path = self.spill_path(buffer_id);
            fs::write(&path, &data)
                .map_err(|e| DirectoryError::Storage(format!("write {}: {}", path.display(), e)))?;
            debug!("Buffer '{}': spilled {} bytes to disk", buffer_id, data.len());
            Slot::Spilled {
                size: data.len() as u64,
            }
        } else {
            Slot::Resident(data)
        };

        // A resident slot replacing a spilled one leaves the old file
        // stale; a spilled slot has already overwritten it.
        if let Some(Slot::Spilled { .. }) = self.slots.insert(buffer_id.to_string(), slot) {
            if !spilling {
                let _ = fs::remove_file(self.spill_path(buffer_id));
            }
        }
        Ok(())
    }

    pub fn get(&self, buffer_id: &str) -> Result<Option<Bytes>, DirectoryError> {
        match self.slots.get(buffer_id).as_deref() {
            None => Ok(None),
            Some(Slot::Resident(data)) => Ok(Some(data.clone())),
            Some(Slot::Spilled { .. }) => {
                let path = self.spill_path(buffer_id);
                let data = fs::read(&path).map_err(|e| {
                    DirectoryError::Storage(format!("read {}: {}", path.display(), e))
                })?;
                Ok(Some(Bytes::from(data)))
            }
        }
    }

    pub fn contains(&self, buffer_id: &str) -> bool {
        self.slots.contains_key(buffer_id)
    }

    /// Remove a payload; returns its size if it was present.
    pub fn remove(&self, buffer_id: &str) -> Option<u64> {
        match self.slots.remove(buffer_id)? {
            (_, Slot::Resident(data)) => Some(data.len() as u64),
            (_, Slot::Spilled { size }) => {
                let path = self.spill_path(buffer_id);
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Buffer '{}': failed to delete spill file: {}", buffer_id, e);
                }
                Some(size)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Spill file path: buffer ids are user-supplied, so the file name
    /// is the hex encoding of the id rather than the id itself.
    fn spill_path(&self, buffer_id: &str) -> PathBuf {
        let mut name = String::with_capacity(buffer_id.len() * 2 + 4);
        for byte in buffer_id.as_bytes() {
            let _ = write!(name, "{:02x}", byte);
        }
        name.push_str(".buf");
        self.dir.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(threshold: usize) -> (BufferStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = BufferStore::new(dir.path().join("buffers"), threshold).unwrap();
        (store, dir)
    }

    #[test]
    fn small_buffer_stays_resident() {
        let (store, dir) = store(1024);
        store.insert("b1", Bytes::from_static(b"hello")).unwrap();

        assert_eq!(store.get("b1").unwrap(), Some(Bytes::from_static(b"hello")));
        // Nothing spilled
        let spilled = fs::read_dir(dir.path().join("buffers")).unwrap().count();
        assert_eq!(spilled, 0);
    }

    #[test]
    fn large_buffer_spills_and_reads_back() {
        let (store, dir) = store(16);
        let payload = Bytes::from(vec![7u8; 64]);
        store.insert("big", payload.clone()).unwrap();

        let spilled = fs::read_dir(dir.path().join("buffers")).unwrap().count();
        assert_eq!(spilled, 1);
        assert_eq!(store.get("big").unwrap(), Some(payload));
    }

    #[test]
    fn remove_reports_size_and_deletes_spill_file() {
        let (store, dir) = store(16);
        store.insert("big", Bytes::from(vec![1u8; 32])).unwrap();
        store.insert("small", Bytes::from_static(b"x")).unwrap();

        assert_eq!(store.remove("big"), Some(32));
        assert_eq!(store.remove("small"), Some(1));
        assert_eq!(store.remove("missing"), None);

        let spilled = fs::read_dir(dir.path().join("buffers")).unwrap().count();
        assert_eq!(spilled, 0);
        assert!(store.is_empty());
    }

    #[test]
    fn path_safe_buffer_ids() {
        let (store, _dir) = store(4);
        store
            .insert("../../etc/passwd", Bytes::from(vec![0u8; 16]))
            .unwrap();
        assert!(store.get("../../etc/passwd").unwrap().is_some());
    }
}
