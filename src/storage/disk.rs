use crate::error::{DbError, DbResult};
use crate::storage::page::{Page, PageId, PAGE_SIZE};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Durable per-table page storage, consumed by the page cache.
///
/// Implementations read and write whole fixed-size pages; the file offset of
/// a page is `page_no * PAGE_SIZE`.
pub trait PageStore: Send + Sync {
    fn read_page(&self, pid: PageId) -> DbResult<Page>;
    fn write_page(&self, page: &Page) -> DbResult<()>;
    fn page_count(&self) -> DbResult<u32>;
}

/// A file of fixed-size pages.
pub struct PagedFile {
    file: Mutex<File>,
}

impl PagedFile {
    pub fn create(path: &Path) -> DbResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn open(path: &Path) -> DbResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Opens `path`, creating an empty file if it does not exist yet.
    pub fn open_or_create(path: &Path) -> DbResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn read_page(&self, pid: PageId, buf: &mut [u8; PAGE_SIZE]) -> DbResult<()> {
        let mut file = self.file.lock();
        let offset = Self::page_offset(pid.page_no);
        if offset >= file.metadata()?.len() {
            return Err(DbError::PageNotFound(pid));
        }
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Writes a full page durably, extending the file if needed.
    pub fn write_page(&self, page_no: u32, data: &[u8; PAGE_SIZE]) -> DbResult<()> {
        let mut file = self.file.lock();
        let offset = Self::page_offset(page_no);
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    pub fn page_count(&self) -> DbResult<u32> {
        let file = self.file.lock();
        Ok((file.metadata()?.len() / PAGE_SIZE as u64) as u32)
    }

    fn page_offset(page_no: u32) -> u64 {
        page_no as u64 * PAGE_SIZE as u64
    }
}
