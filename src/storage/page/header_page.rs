use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Page, PageId, PAGE_SIZE};

use super::error::{PageError, Result};

// Layout after the common prefix:
//   record_count: u32 at 8..12
//   records at 12 + i * 36: name ([u8; 32], zero padded) then root: i32
const RECORD_COUNT_OFFSET: usize = 8;
const RECORDS_OFFSET: usize = 12;
const NAME_SIZE: usize = 32;
const RECORD_SIZE: usize = NAME_SIZE + 4;

/// The header page (page id 0) maps index names to their root page ids.
/// The B+tree updates its record here on every root change.
pub struct HeaderPage;

impl HeaderPage {
    pub fn record_count(page: &Page) -> u32 {
        LittleEndian::read_u32(&page.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4])
    }

    /// Append a (name, root) record. Fails if the name already exists.
    pub fn insert_record(page: &mut Page, name: &str, root: PageId) -> Result<()> {
        if name.len() > NAME_SIZE {
            return Err(PageError::NameTooLong(name.to_string()));
        }
        if Self::find_record(page, name).is_some() {
            return Err(PageError::RecordExists(name.to_string()));
        }

        let count = Self::record_count(page) as usize;
        let base = RECORDS_OFFSET + count * RECORD_SIZE;
        if base + RECORD_SIZE > PAGE_SIZE {
            return Err(PageError::InsufficientSpace);
        }

        page.data[base..base + NAME_SIZE].fill(0);
        page.data[base..base + name.len()].copy_from_slice(name.as_bytes());
        LittleEndian::write_i32(&mut page.data[base + NAME_SIZE..base + RECORD_SIZE], root);
        LittleEndian::write_u32(
            &mut page.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4],
            count as u32 + 1,
        );

        Ok(())
    }

    /// Update the root recorded for `name`
    pub fn update_record(page: &mut Page, name: &str, root: PageId) -> Result<()> {
        match Self::find_record(page, name) {
            Some(index) => {
                let base = RECORDS_OFFSET + index * RECORD_SIZE;
                LittleEndian::write_i32(&mut page.data[base + NAME_SIZE..base + RECORD_SIZE], root);
                Ok(())
            }
            None => Err(PageError::RecordNotFound(name.to_string())),
        }
    }

    /// Look up the root recorded for `name`
    pub fn get_record(page: &Page, name: &str) -> Option<PageId> {
        Self::find_record(page, name).map(|index| {
            let base = RECORDS_OFFSET + index * RECORD_SIZE;
            LittleEndian::read_i32(&page.data[base + NAME_SIZE..base + RECORD_SIZE])
        })
    }

    fn find_record(page: &Page, name: &str) -> Option<usize> {
        let count = Self::record_count(page) as usize;
        let needle = name.as_bytes();
        (0..count).find(|&index| {
            let base = RECORDS_OFFSET + index * RECORD_SIZE;
            let stored = &page.data[base..base + NAME_SIZE];
            &stored[..needle.len()] == needle && stored[needle.len()..].iter().all(|&b| b == 0)
        })
    }
}
