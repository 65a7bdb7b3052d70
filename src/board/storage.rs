use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{check_bounds, ConfigStore, Result, CONFIG_SIZE};

/// Configuration region kept in a file on disk.
///
/// A missing or short file is created and zero-padded to the region size.
#[derive(Debug)]
pub struct FileConfig {
    path: PathBuf,
    file: File,
}

impl FileConfig {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len() as usize;
        if len < CONFIG_SIZE {
            file.seek(SeekFrom::Start(len as u64))?;
            file.write_all(&vec![0u8; CONFIG_SIZE - len])?;
            file.flush()?;
            log::info!("Initialized configuration file {}", path.display());
        }

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfig {
    fn config_read(&mut self, offset: usize, dest: &mut [u8]) -> Result<()> {
        check_bounds(offset, dest.len())?;
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.read_exact(dest)?;
        Ok(())
    }

    fn config_write(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        check_bounds(offset, src.len())?;
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.write_all(src)?;
        self.file.flush()?;
        Ok(())
    }
}

/// Configuration region held in memory, lost when dropped
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    bytes: [u8; CONFIG_SIZE],
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self {
            bytes: [0; CONFIG_SIZE],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore for MemoryConfig {
    fn config_read(&mut self, offset: usize, dest: &mut [u8]) -> Result<()> {
        check_bounds(offset, dest.len())?;
        dest.copy_from_slice(&self.bytes[offset..offset + dest.len()]);
        Ok(())
    }

    fn config_write(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        check_bounds(offset, src.len())?;
        self.bytes[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }
}
