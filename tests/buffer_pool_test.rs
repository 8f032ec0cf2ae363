use anyhow::Result;

use petradb::storage::buffer::BufferPoolError;

mod common;
use common::create_test_buffer_pool;

#[test]
fn test_new_page() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10)?;

    let (page, page_id) = buffer_pool.new_page()?;
    assert!(page_id > 0);
    {
        let page_guard = page.read();
        assert_eq!(page_guard.page_id, page_id);
    }

    buffer_pool.unpin_page(page_id, false)?;
    Ok(())
}

#[test]
fn test_fetch_page() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10)?;

    let (_, page_id) = buffer_pool.new_page()?;
    buffer_pool.unpin_page(page_id, false)?;

    let fetched_page = buffer_pool.fetch_page(page_id)?;
    {
        let page_guard = fetched_page.read();
        assert_eq!(page_guard.page_id, page_id);
    }

    buffer_pool.unpin_page(page_id, false)?;
    Ok(())
}

#[test]
fn test_page_modification_survives_eviction() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(3)?;

    let (page, page_id) = buffer_pool.new_page()?;
    {
        let mut page_guard = page.write();
        let test_data = b"Test Data";
        page_guard.data[100..100 + test_data.len()].copy_from_slice(test_data);
    }
    buffer_pool.unpin_page(page_id, true)?;

    // Fill the pool so the dirty page gets evicted
    for _ in 0..3 {
        let (_, other) = buffer_pool.new_page()?;
        buffer_pool.unpin_page(other, true)?;
    }

    let fetched_page = buffer_pool.fetch_page(page_id)?;
    {
        let page_guard = fetched_page.read();
        assert_eq!(&page_guard.data[100..109], b"Test Data");
    }
    buffer_pool.unpin_page(page_id, false)?;
    Ok(())
}

#[test]
fn test_all_frames_pinned_fails() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(3)?;

    let mut page_ids = Vec::new();
    for _ in 0..3 {
        let (_, page_id) = buffer_pool.new_page()?;
        page_ids.push(page_id);
    }

    assert!(matches!(
        buffer_pool.new_page(),
        Err(BufferPoolError::BufferPoolFull)
    ));
    assert!(matches!(
        buffer_pool.fetch_page(999),
        Err(BufferPoolError::BufferPoolFull)
    ));

    for page_id in page_ids {
        buffer_pool.unpin_page(page_id, false)?;
    }
    Ok(())
}

#[test]
fn test_unpin_nonresident_page_fails() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(4)?;

    assert!(matches!(
        buffer_pool.unpin_page(42, false),
        Err(BufferPoolError::PageNotFound(42))
    ));
    Ok(())
}

#[test]
fn test_delete_pinned_page_has_no_effect() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(4)?;

    let (_, page_id) = buffer_pool.new_page()?;
    assert!(matches!(
        buffer_pool.delete_page(page_id),
        Err(BufferPoolError::PagePinned(_))
    ));

    // The page is still resident and usable
    let fetched = buffer_pool.fetch_page(page_id)?;
    assert_eq!(fetched.read().page_id, page_id);
    buffer_pool.unpin_page(page_id, false)?;
    buffer_pool.unpin_page(page_id, false)?;

    buffer_pool.delete_page(page_id)?;
    Ok(())
}

#[test]
fn test_flush_all_pages() -> Result<()> {
    let (buffer_pool, _temp_file) = create_test_buffer_pool(10)?;

    let mut page_ids = Vec::new();
    for i in 0..5u8 {
        let (page, page_id) = buffer_pool.new_page()?;
        page.write().data[200] = i;
        buffer_pool.unpin_page(page_id, true)?;
        page_ids.push(page_id);
    }

    buffer_pool.flush_all_pages()?;

    for (i, &page_id) in page_ids.iter().enumerate() {
        let page = buffer_pool.fetch_page(page_id)?;
        assert_eq!(page.read().data[200], i as u8);
        buffer_pool.unpin_page(page_id, false)?;
    }
    Ok(())
}

#[test]
fn test_concurrent_pin_unpin() -> Result<()> {
    use std::thread;

    let (buffer_pool, _temp_file) = create_test_buffer_pool(8)?;

    let mut page_ids = Vec::new();
    for _ in 0..4 {
        let (_, page_id) = buffer_pool.new_page()?;
        buffer_pool.unpin_page(page_id, false)?;
        page_ids.push(page_id);
    }

    let mut handles = Vec::new();
    for t in 0..4usize {
        let buffer_pool = buffer_pool.clone();
        let page_ids = page_ids.clone();
        handles.push(thread::spawn(move || {
            for round in 0..50 {
                let page_id = page_ids[(t + round) % page_ids.len()];
                let page = buffer_pool.fetch_page(page_id).unwrap();
                {
                    let mut guard = page.write();
                    guard.data[500 + t] = guard.data[500 + t].wrapping_add(1);
                }
                buffer_pool.unpin_page(page_id, true).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // Every frame must be unpinned again: the whole pool is reclaimable
    for _ in 0..8 {
        let (_, page_id) = buffer_pool.new_page()?;
        buffer_pool.unpin_page(page_id, false)?;
    }
    Ok(())
}
