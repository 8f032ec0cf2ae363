use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::common::types::{
    FrameId, Page, PageId, PagePtr, BUCKET_SIZE, INVALID_PAGE_ID,
};
use crate::storage::buffer::error::{BufferPoolError, Result};
use crate::storage::buffer::replacer::ClockReplacer;
use crate::storage::disk::DiskManager;
use crate::storage::hash::ExtendibleHashTable;
use crate::transaction::wal::log_manager::LogManager;

/// Per-frame bookkeeping, guarded by the manager-wide mutex
struct FrameMeta {
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
}

struct BufferCore {
    frames: Vec<FrameMeta>,
    free_list: VecDeque<FrameId>,
    /// Resident dirty pages, keyed by page id
    dirty_pages: HashMap<PageId, FrameId>,
}

/// Buffer pool manager: a fixed array of frames over the paged data file.
///
/// One mutex serializes all metadata mutation (pin counts, dirty flags,
/// free list). The page table and the replacer are self-synchronized leaf
/// structures called under that mutex. Page payloads are guarded by the
/// per-page latch in `PagePtr`, which is held by clients, never by the
/// manager.
pub struct BufferPoolManager {
    pool_size: usize,
    pages: Vec<PagePtr>,
    core: Mutex<BufferCore>,
    page_table: ExtendibleHashTable<PageId, FrameId>,
    replacer: ClockReplacer<FrameId>,
    disk_manager: Arc<DiskManager>,
    log_manager: Option<Arc<LogManager>>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, db_path: impl AsRef<Path>) -> Result<Self> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        Ok(Self::with_disk_manager(pool_size, disk_manager, None))
    }

    /// Construct a pool that enforces write-ahead logging before evicting
    /// dirty pages
    pub fn new_with_wal(
        pool_size: usize,
        db_path: impl AsRef<Path>,
        log_manager: Arc<LogManager>,
    ) -> Result<Self> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        Ok(Self::with_disk_manager(
            pool_size,
            disk_manager,
            Some(log_manager),
        ))
    }

    pub fn with_disk_manager(
        pool_size: usize,
        disk_manager: Arc<DiskManager>,
        log_manager: Option<Arc<LogManager>>,
    ) -> Self {
        let mut pages = Vec::with_capacity(pool_size);
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);
        for frame_id in 0..pool_size {
            pages.push(Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID))));
            frames.push(FrameMeta {
                page_id: INVALID_PAGE_ID,
                pin_count: 0,
                is_dirty: false,
            });
            free_list.push_back(frame_id);
        }

        Self {
            pool_size,
            pages,
            core: Mutex::new(BufferCore {
                frames,
                free_list,
                dirty_pages: HashMap::new(),
            }),
            page_table: ExtendibleHashTable::new(BUCKET_SIZE),
            replacer: ClockReplacer::new(),
            disk_manager,
            log_manager,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    /// Fetch a page, pinning it. Fails with `BufferPoolFull` only when
    /// every frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidOperation(
                "cannot fetch the invalid page id".to_string(),
            ));
        }

        let mut core = self.core.lock();

        // Resident: bump the pin; a 0 -> 1 transition leaves the replacer
        if let Some(frame_id) = self.page_table.find(&page_id) {
            let meta = &mut core.frames[frame_id];
            meta.pin_count += 1;
            if meta.pin_count == 1 {
                self.replacer.erase(&frame_id);
            }
            return Ok(Arc::clone(&self.pages[frame_id]));
        }

        // Miss: take a frame and read the page image into it
        let frame_id = self.acquire_frame(&mut core)?;
        {
            let mut page = self.pages[frame_id].write();
            self.disk_manager.read_page(page_id, &mut page)?;
        }
        let meta = &mut core.frames[frame_id];
        meta.page_id = page_id;
        meta.pin_count = 1;
        meta.is_dirty = false;
        self.page_table.insert(page_id, frame_id);

        Ok(Arc::clone(&self.pages[frame_id]))
    }

    /// Drop one pin. The dirty flag is sticky: once set it survives until
    /// the page is flushed.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<()> {
        let mut core = self.core.lock();
        let frame_id = self
            .page_table
            .find(&page_id)
            .ok_or(BufferPoolError::PageNotFound(page_id))?;

        let meta = &mut core.frames[frame_id];
        if meta.pin_count == 0 {
            return Err(BufferPoolError::NotPinned(page_id));
        }
        meta.is_dirty |= is_dirty;
        meta.pin_count -= 1;
        let dirty = meta.is_dirty;

        if meta.pin_count == 0 {
            // No thread may drop a page's last pin while holding its latch
            debug_assert!(
                self.pages[frame_id].try_write().is_some(),
                "page {} unpinned to zero while latched",
                page_id
            );
            self.replacer.insert(frame_id);
        }
        if dirty {
            core.dirty_pages.insert(page_id, frame_id);
        }

        Ok(())
    }

    /// Synchronously write a resident dirty page and clear its flag
    pub fn flush_page(&self, page_id: PageId) -> Result<()> {
        let mut core = self.core.lock();
        let frame_id = self
            .page_table
            .find(&page_id)
            .ok_or(BufferPoolError::PageNotFound(page_id))?;

        if core.frames[frame_id].is_dirty {
            {
                let page = self.pages[frame_id].read();
                self.disk_manager.write_page(&page)?;
            }
            core.frames[frame_id].is_dirty = false;
            core.dirty_pages.remove(&page_id);
        }

        Ok(())
    }

    /// Flush every dirty page in the pool
    pub fn flush_all_pages(&self) -> Result<()> {
        let mut core = self.core.lock();
        let entries: Vec<(PageId, FrameId)> =
            core.dirty_pages.iter().map(|(&p, &f)| (p, f)).collect();
        for (page_id, frame_id) in entries {
            {
                let page = self.pages[frame_id].read();
                self.disk_manager.write_page(&page)?;
            }
            core.frames[frame_id].is_dirty = false;
            core.dirty_pages.remove(&page_id);
        }
        Ok(())
    }

    /// Allocate a page on disk and pin a zeroed frame for it
    pub fn new_page(&self) -> Result<(PagePtr, PageId)> {
        let mut core = self.core.lock();
        let frame_id = self.acquire_frame(&mut core)?;

        let page_id = self.disk_manager.allocate_page();
        {
            let mut page = self.pages[frame_id].write();
            page.reset();
            page.set_page_id(page_id);
        }
        let meta = &mut core.frames[frame_id];
        meta.page_id = page_id;
        meta.pin_count = 1;
        meta.is_dirty = false;
        self.page_table.insert(page_id, frame_id);

        Ok((Arc::clone(&self.pages[frame_id]), page_id))
    }

    /// Remove a page from the pool and deallocate it on disk. Fails with
    /// `PagePinned` when the page is still in use; callers racing an
    /// unpin simply retry or give up.
    pub fn delete_page(&self, page_id: PageId) -> Result<()> {
        let mut core = self.core.lock();

        if let Some(frame_id) = self.page_table.find(&page_id) {
            if core.frames[frame_id].pin_count > 0 {
                return Err(BufferPoolError::PagePinned(page_id));
            }

            self.page_table.remove(&page_id);
            self.replacer.erase(&frame_id);
            core.dirty_pages.remove(&page_id);
            {
                let mut page = self.pages[frame_id].write();
                page.reset();
            }
            let meta = &mut core.frames[frame_id];
            meta.page_id = INVALID_PAGE_ID;
            meta.pin_count = 0;
            meta.is_dirty = false;
            core.free_list.push_back(frame_id);
        }

        self.disk_manager.deallocate_page(page_id)?;
        Ok(())
    }

    /// Take a frame from the free list, or evict a victim. A dirty victim
    /// is written back first; when logging is enabled and the victim's
    /// page LSN is past the persistent LSN, this blocks (with the manager
    /// mutex released) until the flush worker has made the log durable.
    fn acquire_frame(&self, core: &mut MutexGuard<'_, BufferCore>) -> Result<FrameId> {
        if let Some(frame_id) = core.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = self.replacer.victim().ok_or(BufferPoolError::BufferPoolFull)?;
        let meta = &core.frames[frame_id];
        assert_eq!(meta.pin_count, 0, "replacer produced a pinned frame");
        let old_page_id = meta.page_id;
        let dirty = meta.is_dirty;

        // Unmap the old page before any wait, so a concurrent fetch of it
        // misses instead of re-pinning a frame that is mid-eviction
        if old_page_id != INVALID_PAGE_ID {
            self.page_table.remove(&old_page_id);
        }

        if dirty {
            if let Some(log_manager) = &self.log_manager {
                if log_manager.logging_enabled() {
                    let page_lsn = self.pages[frame_id].read().lsn();
                    if page_lsn > log_manager.persistent_lsn() {
                        debug!(
                            "eviction of page {} waits for WAL (page lsn {})",
                            old_page_id, page_lsn
                        );
                        let waiter = log_manager.add_eviction_waiter(old_page_id);
                        log_manager.wake_flush_worker();
                        MutexGuard::unlocked(core, || {
                            waiter.wait();
                        });
                        log_manager.remove_eviction_waiter(old_page_id);
                    }
                }
            }

            {
                let page = self.pages[frame_id].read();
                self.disk_manager.write_page(&page)?;
            }
            core.frames[frame_id].is_dirty = false;
            core.dirty_pages.remove(&old_page_id);
        }

        Ok(frame_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn test_pool(pool_size: usize) -> (BufferPoolManager, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let pool = BufferPoolManager::new(pool_size, file.path()).unwrap();
        (pool, file)
    }

    #[test]
    fn test_pool_exhaustion() {
        let (pool, _file) = test_pool(3);

        let mut pinned = Vec::new();
        for _ in 0..3 {
            pinned.push(pool.new_page().unwrap());
        }
        assert!(matches!(
            pool.new_page(),
            Err(BufferPoolError::BufferPoolFull)
        ));

        // Releasing one pin frees a frame
        pool.unpin_page(pinned[0].1, false).unwrap();
        assert!(pool.new_page().is_ok());
    }

    #[test]
    fn test_unpin_errors() {
        let (pool, _file) = test_pool(2);
        let (_, page_id) = pool.new_page().unwrap();

        assert!(matches!(
            pool.unpin_page(999, false),
            Err(BufferPoolError::PageNotFound(_))
        ));
        pool.unpin_page(page_id, false).unwrap();
        assert!(matches!(
            pool.unpin_page(page_id, false),
            Err(BufferPoolError::NotPinned(_))
        ));
    }

    #[test]
    fn test_dirty_flag_is_sticky() {
        let (pool, _file) = test_pool(2);
        let (page, page_id) = pool.new_page().unwrap();

        {
            let mut guard = page.write();
            guard.data[64] = 0xCD;
        }
        // Pin twice, mark dirty once, then unpin clean: still dirty
        pool.fetch_page(page_id).unwrap();
        pool.unpin_page(page_id, true).unwrap();
        pool.unpin_page(page_id, false).unwrap();

        // Eviction must write the page back
        let (_, a) = pool.new_page().unwrap();
        let (_, b) = pool.new_page().unwrap();
        let fetched = pool.fetch_page(page_id).unwrap();
        assert_eq!(fetched.read().data[64], 0xCD);

        pool.unpin_page(page_id, false).unwrap();
        pool.unpin_page(a, false).unwrap();
        pool.unpin_page(b, false).unwrap();
    }

    #[test]
    fn test_delete_pinned_page_fails() {
        let (pool, _file) = test_pool(2);
        let (_, page_id) = pool.new_page().unwrap();

        assert!(matches!(
            pool.delete_page(page_id),
            Err(BufferPoolError::PagePinned(_))
        ));
        pool.unpin_page(page_id, false).unwrap();
        pool.delete_page(page_id).unwrap();

        // The frame is back on the free list
        assert!(pool.new_page().is_ok());
    }

    #[test]
    fn test_eviction_roundtrip() {
        let (pool, _file) = test_pool(2);

        let mut ids = Vec::new();
        for i in 0..4u8 {
            let (page, page_id) = pool.new_page().unwrap();
            page.write().data[100] = i;
            pool.unpin_page(page_id, true).unwrap();
            ids.push(page_id);
        }

        for (i, &page_id) in ids.iter().enumerate() {
            let page = pool.fetch_page(page_id).unwrap();
            assert_eq!(page.read().data[100], i as u8);
            pool.unpin_page(page_id, false).unwrap();
        }
    }
}
