use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info};
use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

use crate::common::types::{Lsn, PageId, TxnId, INVALID_LSN, LOG_BUFFER_SIZE, LOG_TIMEOUT};
use crate::storage::disk::{DiskManager, DiskManagerError};
use crate::transaction::wal::log_record::LogRecord;

/// How long an appender sleeps when both buffers are saturated
const FLUSH_RETRY_SLEEP: Duration = Duration::from_millis(10);

/// Error type for log manager operations
#[derive(Error, Debug)]
pub enum LogManagerError {
    #[error("Disk manager error: {0}")]
    DiskError(#[from] DiskManagerError),

    #[error("Log record of {0} bytes exceeds the log buffer")]
    RecordTooLarge(usize),
}

/// Result type for log manager operations
pub type Result<T> = std::result::Result<T, LogManagerError>;

/// Configuration for the log manager
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Size of each of the two log buffers in bytes
    pub buffer_size: usize,

    /// Upper bound on time between unconditional flush attempts
    pub flush_timeout: Duration,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            buffer_size: LOG_BUFFER_SIZE,
            flush_timeout: LOG_TIMEOUT,
        }
    }
}

/// One-shot durability signal fulfilled by the flush worker with the
/// persistent LSN of the completed cycle
pub struct FlushWaiter {
    state: Mutex<Option<Lsn>>,
    cv: Condvar,
}

impl FlushWaiter {
    fn new() -> Self {
        Self {
            state: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    /// Block until the next flush cycle completes
    pub fn wait(&self) -> Lsn {
        let mut state = self.state.lock();
        while state.is_none() {
            self.cv.wait(&mut state);
        }
        state.expect("fulfilled")
    }

    fn fulfill(&self, lsn: Lsn) {
        *self.state.lock() = Some(lsn);
        self.cv.notify_all();
    }
}

struct LogCore {
    /// Buffer currently accepting appends
    log_buffer: Vec<u8>,
    /// Buffer being drained to disk
    flush_buffer: Vec<u8>,
    /// Valid bytes in `log_buffer`
    bytes_written: usize,
    /// Valid bytes in `flush_buffer` once a swap has been scheduled
    drained: usize,
    next_lsn: Lsn,
    persistent_lsn: Lsn,
    flushing: bool,
    /// Buffer pool threads blocked on eviction durability, keyed by the
    /// page id being evicted
    eviction_waiters: HashMap<PageId, Arc<FlushWaiter>>,
    /// Committing transactions blocked on group commit
    commit_waiters: HashMap<TxnId, Arc<FlushWaiter>>,
}

impl LogCore {
    fn swap_buffers(&mut self) {
        mem::swap(&mut self.log_buffer, &mut self.flush_buffer);
        self.drained = self.bytes_written;
        self.bytes_written = 0;
    }

    fn fulfill_waiters(&mut self) {
        let lsn = self.persistent_lsn;
        for (_, waiter) in self.eviction_waiters.drain() {
            waiter.fulfill(lsn);
        }
        for (_, waiter) in self.commit_waiters.drain() {
            waiter.fulfill(lsn);
        }
    }
}

/// Write-ahead log manager: double-buffered appends with a dedicated
/// flush worker providing group commit and eviction durability signals.
pub struct LogManager {
    config: LogConfig,
    disk_manager: Arc<DiskManager>,
    core: Mutex<LogCore>,
    flush_cv: Condvar,
    enabled: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LogManager {
    pub fn new(disk_manager: Arc<DiskManager>) -> Self {
        Self::with_config(disk_manager, LogConfig::default())
    }

    pub fn with_config(disk_manager: Arc<DiskManager>, config: LogConfig) -> Self {
        Self {
            core: Mutex::new(LogCore {
                log_buffer: vec![0; config.buffer_size],
                flush_buffer: vec![0; config.buffer_size],
                bytes_written: 0,
                drained: 0,
                next_lsn: 0,
                persistent_lsn: INVALID_LSN,
                flushing: false,
                eviction_waiters: HashMap::new(),
                commit_waiters: HashMap::new(),
            }),
            config,
            disk_manager,
            flush_cv: Condvar::new(),
            enabled: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    /// Enable logging and start the flush worker
    pub fn run_flush_worker(self: &Arc<Self>) {
        if self.enabled.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("wal-flush".to_string())
            .spawn(move || manager.flush_loop())
            .expect("failed to spawn flush worker");
        *self.worker.lock() = Some(handle);
        info!("WAL flush worker started");
    }

    /// Disable logging, drain pending records, and join the worker
    pub fn stop_flush_worker(&self) {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            return;
        }
        self.flush_cv.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        info!("WAL flush worker stopped");
    }

    pub fn logging_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Highest LSN known durable in the log file
    pub fn persistent_lsn(&self) -> Lsn {
        self.core.lock().persistent_lsn
    }

    pub fn next_lsn(&self) -> Lsn {
        self.core.lock().next_lsn
    }

    /// Append a record to the log buffer, assigning its LSN. Blocks only
    /// when both buffers are saturated.
    pub fn append_log_record(&self, record: &mut LogRecord) -> Result<Lsn> {
        let size = record.serialized_size();
        if size > self.config.buffer_size {
            return Err(LogManagerError::RecordTooLarge(size));
        }

        let mut core = self.core.lock();

        // Both buffers full: the flush worker owns one, wait for it
        while core.bytes_written + size > self.config.buffer_size && core.flushing {
            MutexGuard::unlocked(&mut core, || thread::sleep(FLUSH_RETRY_SLEEP));
        }

        if core.bytes_written + size > self.config.buffer_size {
            core.swap_buffers();
            core.flushing = true;
            self.flush_cv.notify_one();
        }

        // A thread that slept through the swap above can find the fresh
        // buffer already refilled; re-check before writing
        while core.bytes_written + size > self.config.buffer_size && core.flushing {
            MutexGuard::unlocked(&mut core, || thread::sleep(FLUSH_RETRY_SLEEP));
        }
        assert!(core.bytes_written + size <= self.config.buffer_size);

        let lsn = core.next_lsn;
        record.lsn = lsn;
        record.size = size as u32;
        let start = core.bytes_written;
        record.serialize_into(&mut core.log_buffer[start..start + size]);
        core.next_lsn += size as Lsn;
        core.bytes_written += size;

        Ok(lsn)
    }

    /// Force a swap-and-signal; used by the buffer pool when evicting a
    /// page whose LSN is past the persistent LSN
    pub fn wake_flush_worker(&self) {
        let mut core = self.core.lock();
        // An in-flight flush owns the flush buffer; we cannot piggyback on
        // it because our records may be in the other buffer
        while core.flushing {
            MutexGuard::unlocked(&mut core, || thread::sleep(FLUSH_RETRY_SLEEP));
        }
        core.swap_buffers();
        core.flushing = true;
        drop(core);
        self.flush_cv.notify_one();
    }

    /// Register a durability waiter for an eviction of `page_id`
    pub fn add_eviction_waiter(&self, page_id: PageId) -> Arc<FlushWaiter> {
        let waiter = Arc::new(FlushWaiter::new());
        self.core
            .lock()
            .eviction_waiters
            .insert(page_id, Arc::clone(&waiter));
        waiter
    }

    /// Drop the eviction waiter for `page_id` if one is still registered
    pub fn remove_eviction_waiter(&self, page_id: PageId) {
        self.core.lock().eviction_waiters.remove(&page_id);
    }

    /// Register a group-commit waiter for `txn_id`
    pub fn add_commit_waiter(&self, txn_id: TxnId) -> Arc<FlushWaiter> {
        let waiter = Arc::new(FlushWaiter::new());
        self.core
            .lock()
            .commit_waiters
            .insert(txn_id, Arc::clone(&waiter));
        waiter
    }

    fn flush_loop(&self) {
        while self.enabled.load(Ordering::SeqCst) {
            let mut core = self.core.lock();

            let deadline = Instant::now() + self.config.flush_timeout;
            let mut scheduled = core.flushing;
            while !scheduled && self.enabled.load(Ordering::SeqCst) {
                let timed_out = self.flush_cv.wait_until(&mut core, deadline).timed_out();
                scheduled = core.flushing;
                if timed_out {
                    break;
                }
            }
            if !self.enabled.load(Ordering::SeqCst) {
                break;
            }

            if scheduled {
                // A swapped-out buffer is waiting for us
                let drained = core.drained;
                if let Err(e) = self.disk_manager.write_log(&core.flush_buffer[..drained]) {
                    error!("WAL flush failed: {}", e);
                    continue;
                }
                core.flushing = false;
                debug!("flushed {} scheduled bytes", drained);
            } else if core.bytes_written > 0 {
                // Timeout with pending records: swap and drain them now
                core.swap_buffers();
                let drained = core.drained;
                if let Err(e) = self.disk_manager.write_log(&core.flush_buffer[..drained]) {
                    error!("WAL flush failed: {}", e);
                    continue;
                }
                debug!("flushed {} bytes on timeout", drained);
            }

            core.persistent_lsn = core.next_lsn;
            core.fulfill_waiters();
        }

        // Final drain so nothing appended before shutdown is lost
        let mut core = self.core.lock();
        if core.flushing {
            let drained = core.drained;
            if let Err(e) = self.disk_manager.write_log(&core.flush_buffer[..drained]) {
                error!("WAL final flush failed: {}", e);
                return;
            }
            core.flushing = false;
        }
        if core.bytes_written > 0 {
            core.swap_buffers();
            let drained = core.drained;
            if let Err(e) = self.disk_manager.write_log(&core.flush_buffer[..drained]) {
                error!("WAL final flush failed: {}", e);
                return;
            }
        }
        core.persistent_lsn = core.next_lsn;
        core.fulfill_waiters();
    }
}

impl Drop for LogManager {
    fn drop(&mut self) {
        self.stop_flush_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::wal::log_record::{LogRecord, LOG_HEADER_SIZE};
    use tempfile::NamedTempFile;

    fn test_manager() -> (Arc<LogManager>, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let disk = Arc::new(DiskManager::new(file.path()).unwrap());
        (Arc::new(LogManager::new(disk)), file)
    }

    #[test]
    fn test_lsn_is_byte_offset() {
        let (manager, _file) = test_manager();

        let mut begin = LogRecord::new_begin(1);
        let lsn0 = manager.append_log_record(&mut begin).unwrap();
        assert_eq!(lsn0, 0);

        let mut commit = LogRecord::new_commit(1, lsn0);
        let lsn1 = manager.append_log_record(&mut commit).unwrap();
        assert_eq!(lsn1, LOG_HEADER_SIZE as Lsn);
        assert_eq!(manager.next_lsn(), 2 * LOG_HEADER_SIZE as Lsn);
    }

    #[test]
    fn test_wake_flush_worker_makes_records_durable() {
        let (manager, _file) = test_manager();
        manager.run_flush_worker();

        let mut begin = LogRecord::new_begin(1);
        let lsn = manager.append_log_record(&mut begin).unwrap();

        let waiter = manager.add_eviction_waiter(3);
        manager.wake_flush_worker();
        let persistent = waiter.wait();
        assert!(persistent > lsn);
        assert!(manager.persistent_lsn() > lsn);

        manager.stop_flush_worker();
    }

    #[test]
    fn test_stop_drains_pending_records() {
        let (manager, file) = test_manager();
        manager.run_flush_worker();

        let mut begin = LogRecord::new_begin(9);
        manager.append_log_record(&mut begin).unwrap();
        manager.stop_flush_worker();

        let disk = DiskManager::new(file.path()).unwrap();
        let mut buf = vec![0u8; 64];
        assert!(disk.read_log(&mut buf, 0).unwrap());
        let record = LogRecord::deserialize(&buf).unwrap();
        assert_eq!(record.txn_id, 9);
    }

    #[test]
    fn test_oversized_record_rejected() {
        let file = NamedTempFile::new().unwrap();
        let disk = Arc::new(DiskManager::new(file.path()).unwrap());
        let manager = LogManager::with_config(
            disk,
            LogConfig {
                buffer_size: 64,
                flush_timeout: Duration::from_millis(50),
            },
        );

        let mut record = LogRecord::new_insert(
            1,
            INVALID_LSN,
            crate::common::types::Rid::new(1, 0),
            crate::common::types::Tuple::new(vec![0; 128]),
        );
        assert!(matches!(
            manager.append_log_record(&mut record),
            Err(LogManagerError::RecordTooLarge(_))
        ));
    }
}
