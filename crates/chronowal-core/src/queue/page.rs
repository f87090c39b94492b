//! Memory-mapped pages
//!
//! A [`MappedPage`] is a fixed-capacity, file-backed byte arena. Every typed
//! accessor bounds-checks its range and returns an error instead of touching
//! memory outside the mapping. Pages are only msynced on [`MappedPage::sync`].
//!
//! A [`MetaPage`] is a small mapped page holding two little-endian `i64`
//! sequence fields at offsets 0 and 8, used by both the queue
//! (appended/acknowledged) and consumer groups (consumed/acknowledged).

use crate::{Error, Result};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Size of a meta page in bytes
pub const META_PAGE_SIZE: usize = 64;

const META_FIRST_OFFSET: usize = 0;
const META_SECOND_OFFSET: usize = 8;
const META_MAGIC_OFFSET: usize = 16;
const META_MAGIC: u32 = 0x4357_4D31; // "CWM1"

/// Fixed-size memory-mapped file
pub struct MappedPage {
    path: PathBuf,
    file: File,
    mmap: RwLock<MmapMut>,
    size: usize,
}

impl MappedPage {
    /// Open or create a page of exactly `size` bytes.
    ///
    /// Returns the page and whether the file was freshly created.
    pub fn open<P: AsRef<Path>>(path: P, size: usize) -> Result<(Self, bool)> {
        let path = path.as_ref().to_path_buf();
        if size == 0 {
            return Err(Error::page(format!("zero-sized page {}", path.display())));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let current = file.metadata()?.len() as usize;
        let created = current == 0;
        if current != size {
            if !created && current > size {
                return Err(Error::page(format!(
                    "page {} has size {}, expected {}",
                    path.display(),
                    current,
                    size
                )));
            }
            file.set_len(size as u64)?;
        }

        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };

        Ok((
            Self {
                path,
                file,
                mmap: RwLock::new(mmap),
                size,
            },
            created,
        ))
    }

    /// Page size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Backing file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::page(format!(
                "access beyond page {}: offset={}, len={}, size={}",
                self.path.display(),
                offset,
                len,
                self.size
            ))),
        }
    }

    /// Copy `len` bytes starting at `offset`
    pub fn read_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check(offset, len)?;
        Ok(self.mmap.read()[offset..offset + len].to_vec())
    }

    /// Write `data` at `offset`
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        self.mmap.write()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Read a little-endian `u64`
    pub fn read_u64(&self, offset: usize) -> Result<u64> {
        self.check(offset, 8)?;
        let guard = self.mmap.read();
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&guard[offset..offset + 8]);
        Ok(u64::from_le_bytes(buf))
    }

    /// Write a little-endian `u64`
    pub fn write_u64(&self, offset: usize, value: u64) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Read a little-endian `i64`
    pub fn read_i64(&self, offset: usize) -> Result<i64> {
        self.read_u64(offset).map(|v| v as i64)
    }

    /// Write a little-endian `i64`
    pub fn write_i64(&self, offset: usize, value: i64) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Read a little-endian `u32`
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        self.check(offset, 4)?;
        let guard = self.mmap.read();
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&guard[offset..offset + 4]);
        Ok(u32::from_le_bytes(buf))
    }

    /// Write a little-endian `u32`
    pub fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Flush the mapping to stable storage
    pub fn sync(&self) -> Result<()> {
        self.mmap.read().flush()?;
        Ok(())
    }

    /// Flush and remove the backing file.
    ///
    /// The mapping stays valid until the page is dropped, so readers that
    /// still hold the page keep working.
    pub fn remove(&self) -> Result<()> {
        self.file.sync_all()?;
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

impl std::fmt::Debug for MappedPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedPage")
            .field("path", &self.path)
            .field("size", &self.size)
            .finish()
    }
}

/// Two persisted sequence fields
#[derive(Debug)]
pub struct MetaPage {
    page: MappedPage,
}

impl MetaPage {
    /// Open a meta page, initializing both fields to `initial` when the file
    /// is new.
    pub fn open<P: AsRef<Path>>(path: P, initial: (i64, i64)) -> Result<Self> {
        let (page, created) = MappedPage::open(path, META_PAGE_SIZE)?;
        let meta = Self { page };

        if created {
            meta.store(initial.0, initial.1)?;
            meta.page.write_u32(META_MAGIC_OFFSET, META_MAGIC)?;
            meta.page.sync()?;
        } else if meta.page.read_u32(META_MAGIC_OFFSET)? != META_MAGIC {
            return Err(Error::page(format!(
                "meta page {} is not initialized",
                meta.page.path().display()
            )));
        }

        Ok(meta)
    }

    /// Load both fields
    pub fn load(&self) -> Result<(i64, i64)> {
        Ok((
            self.page.read_i64(META_FIRST_OFFSET)?,
            self.page.read_i64(META_SECOND_OFFSET)?,
        ))
    }

    /// Store both fields
    pub fn store(&self, first: i64, second: i64) -> Result<()> {
        self.page.write_i64(META_FIRST_OFFSET, first)?;
        self.page.write_i64(META_SECOND_OFFSET, second)
    }

    /// Flush to stable storage
    pub fn sync(&self) -> Result<()> {
        self.page.sync()
    }

    /// Backing file path
    pub fn path(&self) -> &Path {
        self.page.path()
    }
}
