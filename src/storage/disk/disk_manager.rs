use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Page, PageId, INVALID_PAGE_ID, PAGE_SIZE};

#[derive(Error, Debug)]
pub enum DiskManagerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),
}

/// Result type for disk manager operations
pub type Result<T> = std::result::Result<T, DiskManagerError>;

/// DiskManager handles the raw I/O for the paged data file and the
/// append-only log file.
pub struct DiskManager {
    db_file: Mutex<File>,
    log_file: Mutex<File>,
    log_path: PathBuf,
    next_page_id: AtomicI32,
}

impl DiskManager {
    /// Open or create the database file and its sibling log file
    /// (`<db_path>.log`)
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&db_path)?;

        let mut log_path = db_path.as_ref().as_os_str().to_os_string();
        log_path.push(".log");
        let log_path = PathBuf::from(log_path);
        let log_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&log_path)?;

        // Resume allocation past whatever the file already holds. Page 0 is
        // reserved for the header page, so allocation starts at 1.
        let file_size = db_file.metadata()?.len();
        let next_page_id = ((file_size / PAGE_SIZE as u64) as PageId).max(1);

        Ok(Self {
            db_file: Mutex::new(db_file),
            log_file: Mutex::new(log_file),
            log_path,
            next_page_id: AtomicI32::new(next_page_id),
        })
    }

    /// Read a page from disk. Reading past the end of the file yields a
    /// zeroed page image rather than an error.
    pub fn read_page(&self, page_id: PageId, page: &mut Page) -> Result<()> {
        if page_id == INVALID_PAGE_ID || page_id < 0 {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }

        let offset = page_id as u64 * PAGE_SIZE as u64;
        let mut file = self.db_file.lock();
        let file_size = file.metadata()?.len();

        if offset + PAGE_SIZE as u64 > file_size {
            page.reset();
            page.set_page_id(page_id);
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut page.data)?;
        page.page_id = page_id;

        Ok(())
    }

    /// Write a page to disk at `page_id * PAGE_SIZE`
    pub fn write_page(&self, page: &Page) -> Result<()> {
        if page.page_id == INVALID_PAGE_ID || page.page_id < 0 {
            return Err(DiskManagerError::InvalidPageId(page.page_id));
        }

        let offset = page.page_id as u64 * PAGE_SIZE as u64;
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&page.data)?;
        file.flush()?;

        Ok(())
    }

    /// Hand out the next monotonic page id
    pub fn allocate_page(&self) -> PageId {
        self.next_page_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Mark a page as free. Space reclamation is left to compaction, so
    /// this is a no-op beyond validation.
    pub fn deallocate_page(&self, page_id: PageId) -> Result<()> {
        if page_id == INVALID_PAGE_ID || page_id < 0 {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }
        Ok(())
    }

    /// Has this page ever been written to disk?
    pub fn check_page_valid(&self, page_id: PageId) -> bool {
        if page_id < 0 {
            return false;
        }
        let file = self.db_file.lock();
        match file.metadata() {
            Ok(meta) => (page_id as u64 + 1) * PAGE_SIZE as u64 <= meta.len(),
            Err(_) => false,
        }
    }

    /// Append raw bytes to the log file. The data is synced before this
    /// returns, so the caller may treat it as durable.
    pub fn write_log(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut file = self.log_file.lock();
        file.seek(SeekFrom::End(0))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    /// Read log bytes at `offset` into `buf`. Returns false at end of file.
    /// A partial tail read zero-fills the remainder of `buf`.
    pub fn read_log(&self, buf: &mut [u8], offset: u64) -> Result<bool> {
        let mut file = self.log_file.lock();
        let file_size = file.metadata()?.len();
        if offset >= file_size {
            return Ok(false);
        }

        file.seek(SeekFrom::Start(offset))?;
        let readable = ((file_size - offset) as usize).min(buf.len());
        file.read_exact(&mut buf[..readable])?;
        buf[readable..].fill(0);

        Ok(true)
    }

    /// Size of the log file in bytes
    pub fn log_size(&self) -> Result<u64> {
        Ok(self.log_file.lock().metadata()?.len())
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}
