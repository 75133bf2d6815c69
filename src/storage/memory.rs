//! In-memory storage implementation for testing and temporary indexes.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::error::{Result, TsurugiError};
use crate::storage::traits::{Storage, StorageConfig, StorageInput, StorageOutput};

/// An in-memory storage implementation.
///
/// Files live in a shared map, so cloning the handle (or keeping the `Arc`
/// across a simulated restart) preserves the stored bytes. This is the
/// backend the crash-recovery tests run against.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    /// The files stored in memory.
    files: Arc<Mutex<AHashMap<String, Vec<u8>>>>,
    /// Storage configuration.
    #[allow(dead_code)]
    config: StorageConfig,
}

impl MemoryStorage {
    /// Create a new memory storage.
    pub fn new(config: StorageConfig) -> Self {
        MemoryStorage {
            files: Arc::new(Mutex::new(AHashMap::new())),
            config,
        }
    }

    /// Create a new memory storage with default configuration.
    pub fn new_default() -> Self {
        Self::new(StorageConfig::default())
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Get the total size of all files.
    pub fn total_size(&self) -> u64 {
        self.files.lock().values().map(|data| data.len() as u64).sum()
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .cloned()
            .ok_or_else(|| TsurugiError::storage(format!("file not found: {name}")))?;
        Ok(Box::new(MemoryInput {
            cursor: Cursor::new(data),
        }))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.files.lock().insert(name.to_string(), Vec::new());
        Ok(Box::new(MemoryOutput {
            name: name.to_string(),
            buffer: Vec::new(),
            files: self.files.clone(),
        }))
    }

    fn create_output_append(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let existing = self
            .files
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone();
        Ok(Box::new(MemoryOutput {
            name: name.to_string(),
            buffer: existing,
            files: self.files.clone(),
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.files
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| TsurugiError::storage(format!("file not found: {name}")))
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.files.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.files
            .lock()
            .get(name)
            .map(|data| data.len() as u64)
            .ok_or_else(|| TsurugiError::storage(format!("file not found: {name}")))
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Read side of a memory file.
#[derive(Debug)]
struct MemoryInput {
    cursor: Cursor<Vec<u8>>,
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.cursor.get_ref().len() as u64)
    }
}

/// Write side of a memory file. Bytes become visible on flush.
#[derive(Debug)]
struct MemoryOutput {
    name: String,
    buffer: Vec<u8>,
    files: Arc<Mutex<AHashMap<String, Vec<u8>>>>,
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.files
            .lock()
            .insert(self.name.clone(), self.buffer.clone());
        Ok(())
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.flush()?;
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.buffer.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_back() {
        let storage = MemoryStorage::new_default();
        let mut out = storage.create_output("a.bin").unwrap();
        out.write_all(b"hello").unwrap();
        out.flush_and_sync().unwrap();

        let mut input = storage.open_input("a.bin").unwrap();
        let mut buf = Vec::new();
        input.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
        assert_eq!(storage.file_size("a.bin").unwrap(), 5);
    }

    #[test]
    fn test_append_preserves_existing_bytes() {
        let storage = MemoryStorage::new_default();
        let mut out = storage.create_output("log").unwrap();
        out.write_all(b"one").unwrap();
        out.flush_and_sync().unwrap();
        drop(out);

        let mut out = storage.create_output_append("log").unwrap();
        assert_eq!(out.position().unwrap(), 3);
        out.write_all(b"two").unwrap();
        out.flush_and_sync().unwrap();

        let mut input = storage.open_input("log").unwrap();
        let mut buf = Vec::new();
        input.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"onetwo");
    }

    #[test]
    fn test_delete_missing_file_is_an_error() {
        let storage = MemoryStorage::new_default();
        assert!(storage.delete_file("nope").is_err());
        assert!(!storage.file_exists("nope"));
    }
}
