//! File-based storage implementation.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, TsurugiError};
use crate::storage::traits::{Storage, StorageConfig, StorageInput, StorageOutput};

/// A file-based storage implementation rooted at a single directory.
#[derive(Debug)]
pub struct FileStorage {
    /// The root directory for storage.
    directory: PathBuf,
    /// Storage configuration.
    config: StorageConfig,
}

impl FileStorage {
    /// Create a new file storage in the given directory.
    pub fn new<P: AsRef<Path>>(directory: P, config: StorageConfig) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();

        if !directory.exists() {
            std::fs::create_dir_all(&directory).map_err(|e| {
                TsurugiError::storage(format!("failed to create directory: {e}"))
            })?;
        }
        if !directory.is_dir() {
            return Err(TsurugiError::storage(format!(
                "path is not a directory: {}",
                directory.display()
            )));
        }

        Ok(FileStorage { directory, config })
    }

    /// Get the full path for a file name.
    fn file_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let path = self.file_path(name);
        let file = File::open(&path)
            .map_err(|e| TsurugiError::storage(format!("failed to open {name}: {e}")))?;
        let size = file
            .metadata()
            .map_err(|e| TsurugiError::storage(format!("failed to stat {name}: {e}")))?
            .len();
        Ok(Box::new(FileInput {
            reader: BufReader::with_capacity(self.config.buffer_size, file),
            size,
        }))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let path = self.file_path(name);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| TsurugiError::storage(format!("failed to create {name}: {e}")))?;
        Ok(Box::new(FileOutput::new(file, &self.config)))
    }

    fn create_output_append(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let path = self.file_path(name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| TsurugiError::storage(format!("failed to append {name}: {e}")))?;
        let position = file
            .metadata()
            .map_err(|e| TsurugiError::storage(format!("failed to stat {name}: {e}")))?
            .len();
        let mut output = FileOutput::new(file, &self.config);
        output.position = position;
        Ok(Box::new(output))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.file_path(name).is_file()
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        std::fs::remove_file(self.file_path(name))
            .map_err(|e| TsurugiError::storage(format!("failed to delete {name}: {e}")))
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = std::fs::read_dir(&self.directory)
            .map_err(|e| TsurugiError::storage(format!("failed to list directory: {e}")))?;
        for entry in entries {
            let entry =
                entry.map_err(|e| TsurugiError::storage(format!("failed to list entry: {e}")))?;
            if entry.path().is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        std::fs::metadata(self.file_path(name))
            .map(|m| m.len())
            .map_err(|e| TsurugiError::storage(format!("failed to stat {name}: {e}")))
    }

    fn sync(&self) -> Result<()> {
        // Sync the directory entry itself so renames and deletes survive power loss.
        #[cfg(unix)]
        {
            let dir = File::open(&self.directory)
                .map_err(|e| TsurugiError::storage(format!("failed to open directory: {e}")))?;
            dir.sync_all()
                .map_err(|e| TsurugiError::storage(format!("failed to sync directory: {e}")))?;
        }
        Ok(())
    }
}

/// Buffered read side of a stored file.
#[derive(Debug)]
struct FileInput {
    reader: BufReader<File>,
    size: u64,
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for FileInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }
}

/// Buffered write side of a stored file.
#[derive(Debug)]
struct FileOutput {
    writer: BufWriter<File>,
    position: u64,
    sync_writes: bool,
}

impl FileOutput {
    fn new(file: File, config: &StorageConfig) -> Self {
        FileOutput {
            writer: BufWriter::with_capacity(config.buffer_size, file),
            position: 0,
            sync_writes: config.sync_writes,
        }
    }
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.writer.write(buf)?;
        self.position += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl StorageOutput for FileOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        if self.sync_writes {
            self.writer
                .get_ref()
                .sync_all()
                .map_err(|e| TsurugiError::storage(format!("fsync failed: {e}")))?;
        }
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path(), StorageConfig::default()).unwrap();

        let mut out = storage.create_output("seg_1.json").unwrap();
        out.write_all(b"{\"x\":1}").unwrap();
        out.flush_and_sync().unwrap();
        drop(out);

        assert!(storage.file_exists("seg_1.json"));
        assert_eq!(storage.list_files().unwrap(), vec!["seg_1.json"]);

        let mut input = storage.open_input("seg_1.json").unwrap();
        let mut buf = String::new();
        input.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "{\"x\":1}");
    }

    #[test]
    fn test_append_resumes_at_end_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path(), StorageConfig::default()).unwrap();

        let mut out = storage.create_output_append("translog-1.tlog").unwrap();
        out.write_all(b"abc").unwrap();
        out.flush_and_sync().unwrap();
        drop(out);

        let out = storage.create_output_append("translog-1.tlog").unwrap();
        assert_eq!(out.position().unwrap(), 3);
    }
}
