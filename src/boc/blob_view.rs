//! Random-access byte sources for the lazy deserializer

use crate::{Error, Result};
use bytes::Bytes;
use memmap2::Mmap;
use parking_lot::RwLock;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// A read-only blob addressed by byte offset
pub trait BlobView: Send + Sync {
    fn size(&self) -> u64;

    /// Read exactly `len` bytes at `offset`
    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes>;
}

fn check_range(size: u64, offset: u64, len: usize) -> Result<()> {
    let end = offset.checked_add(len as u64).ok_or_else(|| {
        Error::BocParse(format!("read range overflows at offset {}", offset))
    })?;
    if end > size {
        return Err(Error::NotEnoughData {
            needed: end,
            available: size,
        });
    }
    Ok(())
}

/// Blob held in memory
pub struct BufferBlobView {
    data: Bytes,
}

impl BufferBlobView {
    pub fn new(data: impl Into<Bytes>) -> Self {
        BufferBlobView { data: data.into() }
    }
}

impl BlobView for BufferBlobView {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        check_range(self.size(), offset, len)?;
        let start = offset as usize;
        Ok(self.data.slice(start..start + len))
    }
}

/// Blob read from a file with positioned reads
pub struct FileBlobView {
    file: RwLock<File>,
    size: u64,
}

impl FileBlobView {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let size = file.metadata()?.len();
        Ok(FileBlobView {
            file: RwLock::new(file),
            size,
        })
    }
}

impl BlobView for FileBlobView {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        check_range(self.size, offset, len)?;
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;

        let mut data = vec![0u8; len];
        file.read_exact(&mut data)?;
        Ok(Bytes::from(data))
    }
}

/// Blob backed by a read-only memory map of a file
pub struct MmapBlobView {
    mmap: Mmap,
}

impl MmapBlobView {
    /// Map `path` for reading
    ///
    /// The file must not be modified while the view is alive.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(MmapBlobView { mmap })
    }
}

impl BlobView for MmapBlobView {
    fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        check_range(self.size(), offset, len)?;
        let start = offset as usize;
        Ok(Bytes::copy_from_slice(&self.mmap[start..start + len]))
    }
}
