use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Page, PageId, Rid, SlotNum, Tuple, PAGE_SIZE};

use super::error::{PageError, Result};

// Layout after the common prefix (page id at 0..4, LSN at 4..8):
//   prev_page_id: i32   at  8..12
//   next_page_id: i32   at 12..16
//   free_space_ptr: u32 at 16..20   (tuple bytes grow down from PAGE_SIZE)
//   tuple_count: u32    at 20..24   (slot entries, including tombstones)
//   slot array          at 24..     (offset: u32, size: u32) per slot
const PREV_PAGE_ID_OFFSET: usize = 8;
const NEXT_PAGE_ID_OFFSET: usize = 12;
const FREE_SPACE_PTR_OFFSET: usize = 16;
const TUPLE_COUNT_OFFSET: usize = 20;
const SLOT_ARRAY_OFFSET: usize = 24;
const SLOT_SIZE: usize = 8;

/// High bit of a slot's size field marks the tuple logically deleted
const DELETE_FLAG: u32 = 1 << 31;

/// Slotted tuple page. All functions operate on a `Page` whose write latch
/// the caller already holds.
pub struct TablePage;

impl TablePage {
    /// Initialize a fresh table page
    pub fn init(page: &mut Page, page_id: PageId, prev_page_id: PageId) {
        page.set_page_id(page_id);
        LittleEndian::write_i32(
            &mut page.data[PREV_PAGE_ID_OFFSET..PREV_PAGE_ID_OFFSET + 4],
            prev_page_id,
        );
        LittleEndian::write_i32(
            &mut page.data[NEXT_PAGE_ID_OFFSET..NEXT_PAGE_ID_OFFSET + 4],
            crate::common::types::INVALID_PAGE_ID,
        );
        Self::set_free_space_ptr(page, PAGE_SIZE as u32);
        Self::set_tuple_count(page, 0);
    }

    pub fn prev_page_id(page: &Page) -> PageId {
        LittleEndian::read_i32(&page.data[PREV_PAGE_ID_OFFSET..PREV_PAGE_ID_OFFSET + 4])
    }

    pub fn next_page_id(page: &Page) -> PageId {
        LittleEndian::read_i32(&page.data[NEXT_PAGE_ID_OFFSET..NEXT_PAGE_ID_OFFSET + 4])
    }

    pub fn set_next_page_id(page: &mut Page, next: PageId) {
        LittleEndian::write_i32(&mut page.data[NEXT_PAGE_ID_OFFSET..NEXT_PAGE_ID_OFFSET + 4], next);
    }

    pub fn tuple_count(page: &Page) -> u32 {
        LittleEndian::read_u32(&page.data[TUPLE_COUNT_OFFSET..TUPLE_COUNT_OFFSET + 4])
    }

    /// Insert a tuple, assigning the next slot in append order
    pub fn insert_tuple(page: &mut Page, tuple: &Tuple) -> Result<Rid> {
        let count = Self::tuple_count(page) as usize;
        let fsp = Self::free_space_ptr(page) as usize;
        let slot_end = SLOT_ARRAY_OFFSET + (count + 1) * SLOT_SIZE;
        let len = tuple.len();

        if fsp < len || slot_end > fsp - len {
            return Err(PageError::InsufficientSpace);
        }

        let start = fsp - len;
        page.data[start..fsp].copy_from_slice(tuple.data());
        Self::set_slot(page, count as SlotNum, start as u32, len as u32);
        Self::set_free_space_ptr(page, start as u32);
        Self::set_tuple_count(page, count as u32 + 1);

        Ok(Rid::new(page.page_id, count as SlotNum))
    }

    /// Fetch a live tuple
    pub fn get_tuple(page: &Page, rid: Rid) -> Result<Tuple> {
        let (offset, size) = Self::checked_slot(page, rid)?;
        if size & DELETE_FLAG != 0 || size == 0 {
            return Err(PageError::TupleDeleted(rid));
        }
        let start = offset as usize;
        Ok(Tuple::new(page.data[start..start + size as usize].to_vec()))
    }

    /// Set the delete bit without reclaiming space
    pub fn mark_delete(page: &mut Page, rid: Rid) -> Result<()> {
        let (offset, size) = Self::checked_slot(page, rid)?;
        if size & DELETE_FLAG != 0 || size == 0 {
            return Err(PageError::TupleDeleted(rid));
        }
        Self::set_slot(page, rid.slot_num, offset, size | DELETE_FLAG);
        Ok(())
    }

    /// Clear the delete bit set by `mark_delete`
    pub fn rollback_delete(page: &mut Page, rid: Rid) -> Result<()> {
        let (offset, size) = Self::checked_slot(page, rid)?;
        if size & DELETE_FLAG == 0 {
            return Err(PageError::TupleNotDeleted(rid));
        }
        Self::set_slot(page, rid.slot_num, offset, size & !DELETE_FLAG);
        Ok(())
    }

    /// Physically remove the tuple, compacting the tuple storage region.
    /// The slot becomes a tombstone; slot numbers of other tuples are
    /// unchanged.
    pub fn apply_delete(page: &mut Page, rid: Rid) -> Result<()> {
        let (offset, raw_size) = Self::checked_slot(page, rid)?;
        let size = raw_size & !DELETE_FLAG;
        if size == 0 {
            return Err(PageError::TupleDeleted(rid));
        }

        let fsp = Self::free_space_ptr(page) as usize;
        let start = offset as usize;

        // Shift everything below the deleted tuple up by its size
        page.data.copy_within(fsp..start, fsp + size as usize);
        Self::set_free_space_ptr(page, fsp as u32 + size);
        Self::set_slot(page, rid.slot_num, 0, 0);

        // Fix offsets of tuples that lived below the removed one
        let count = Self::tuple_count(page);
        for slot in 0..count {
            let (o, s) = Self::slot(page, slot);
            if s != 0 && o < offset {
                Self::set_slot(page, slot, o + size, s);
            }
        }

        Ok(())
    }

    /// Replace the tuple at `rid`, returning the old image
    pub fn update_tuple(page: &mut Page, rid: Rid, new_tuple: &Tuple) -> Result<Tuple> {
        let (offset, size) = Self::checked_slot(page, rid)?;
        if size & DELETE_FLAG != 0 || size == 0 {
            return Err(PageError::TupleDeleted(rid));
        }

        let old = Tuple::new(
            page.data[offset as usize..(offset + size) as usize].to_vec(),
        );
        let new_len = new_tuple.len() as u32;

        if new_len == size {
            page.data[offset as usize..(offset + size) as usize]
                .copy_from_slice(new_tuple.data());
            return Ok(old);
        }

        // Space check before any mutation: removing the old image frees
        // `size` bytes
        let fsp = Self::free_space_ptr(page);
        let slot_end = (SLOT_ARRAY_OFFSET + Self::tuple_count(page) as usize * SLOT_SIZE) as u32;
        if fsp + size - slot_end < new_len {
            return Err(PageError::InsufficientSpace);
        }

        Self::apply_delete(page, rid)?;
        let fsp = Self::free_space_ptr(page);
        let start = fsp - new_len;
        page.data[start as usize..fsp as usize].copy_from_slice(new_tuple.data());
        Self::set_slot(page, rid.slot_num, start, new_len);
        Self::set_free_space_ptr(page, start);

        Ok(old)
    }

    fn checked_slot(page: &Page, rid: Rid) -> Result<(u32, u32)> {
        if rid.slot_num >= Self::tuple_count(page) {
            return Err(PageError::InvalidSlot(rid));
        }
        Ok(Self::slot(page, rid.slot_num))
    }

    fn slot(page: &Page, slot_num: SlotNum) -> (u32, u32) {
        let base = SLOT_ARRAY_OFFSET + slot_num as usize * SLOT_SIZE;
        (
            LittleEndian::read_u32(&page.data[base..base + 4]),
            LittleEndian::read_u32(&page.data[base + 4..base + 8]),
        )
    }

    fn set_slot(page: &mut Page, slot_num: SlotNum, offset: u32, size: u32) {
        let base = SLOT_ARRAY_OFFSET + slot_num as usize * SLOT_SIZE;
        LittleEndian::write_u32(&mut page.data[base..base + 4], offset);
        LittleEndian::write_u32(&mut page.data[base + 4..base + 8], size);
    }

    fn free_space_ptr(page: &Page) -> u32 {
        LittleEndian::read_u32(&page.data[FREE_SPACE_PTR_OFFSET..FREE_SPACE_PTR_OFFSET + 4])
    }

    fn set_free_space_ptr(page: &mut Page, ptr: u32) {
        LittleEndian::write_u32(&mut page.data[FREE_SPACE_PTR_OFFSET..FREE_SPACE_PTR_OFFSET + 4], ptr);
    }

    fn set_tuple_count(page: &mut Page, count: u32) {
        LittleEndian::write_u32(&mut page.data[TUPLE_COUNT_OFFSET..TUPLE_COUNT_OFFSET + 4], count);
    }
}
