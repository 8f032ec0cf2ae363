use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::NamedTempFile;

use petradb::storage::buffer::BufferPoolManager;
use petradb::storage::disk::DiskManager;
use petradb::transaction::wal::log_manager::{LogConfig, LogManager};

// Create a temporary database file for testing
#[allow(dead_code)]
pub fn create_temp_db_file() -> Result<(NamedTempFile, String)> {
    let file = NamedTempFile::new()?;
    let path = file.path().to_str().unwrap().to_string();
    Ok((file, path))
}

// Create a buffer pool manager with a temporary database
#[allow(dead_code)]
pub fn create_test_buffer_pool(pool_size: usize) -> Result<(Arc<BufferPoolManager>, NamedTempFile)> {
    let (file, path) = create_temp_db_file()?;
    let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, path)?);
    Ok((buffer_pool, file))
}

// Create a WAL-enabled stack sharing one disk manager: log manager with a
// short flush timeout, flush worker running, and a buffer pool wired to it
#[allow(dead_code)]
pub fn create_wal_stack(
    pool_size: usize,
) -> Result<(Arc<BufferPoolManager>, Arc<LogManager>, Arc<DiskManager>, NamedTempFile)> {
    let (file, path) = create_temp_db_file()?;
    let disk_manager = Arc::new(DiskManager::new(&path)?);
    let log_manager = Arc::new(LogManager::with_config(
        Arc::clone(&disk_manager),
        LogConfig {
            buffer_size: 4096 * 16,
            flush_timeout: Duration::from_millis(50),
        },
    ));
    log_manager.run_flush_worker();
    let buffer_pool = Arc::new(BufferPoolManager::with_disk_manager(
        pool_size,
        Arc::clone(&disk_manager),
        Some(Arc::clone(&log_manager)),
    ));
    Ok((buffer_pool, log_manager, disk_manager, file))
}
