use std::sync::Arc;

use parking_lot::MutexGuard;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{PageId, PageWriteGuard};
use crate::index::btree::codec::{deserialize_node, serialize_node};
use crate::index::btree::error::Result;
use crate::index::btree::node::BTreeNode;
use crate::storage::buffer::BufferPoolManager;

/// A write-latched, pinned page together with its deserialized node.
/// Releasing re-serializes the node iff it was modified.
pub struct LatchedNode<K: Serialize + Clone + Ord> {
    pub page_id: PageId,
    pub guard: PageWriteGuard,
    pub node: BTreeNode<K>,
    pub dirty: bool,
}

/// The ordered set of latches a structure-modifying descent holds: the
/// root-pointer mutex at the top, then write latches from some ancestor
/// down to the current node. Crabbing releases the prefix as soon as a
/// child proves safe.
pub struct LatchStack<'a, K: Serialize + Clone + Ord> {
    buffer_pool: &'a Arc<BufferPoolManager>,
    root_guard: Option<MutexGuard<'a, PageId>>,
    pub entries: Vec<LatchedNode<K>>,
}

impl<'a, K> LatchStack<'a, K>
where
    K: Serialize + DeserializeOwned + Clone + Ord,
{
    pub fn new(
        buffer_pool: &'a Arc<BufferPoolManager>,
        root_guard: MutexGuard<'a, PageId>,
    ) -> Self {
        Self {
            buffer_pool,
            root_guard: Some(root_guard),
            entries: Vec::new(),
        }
    }

    /// Fetch, write-latch, and deserialize `page_id`, pushing it as the
    /// new bottom of the crabbed path
    pub fn push(&mut self, page_id: PageId) -> Result<()> {
        let page_ptr = self.buffer_pool.fetch_page(page_id)?;
        let guard = page_ptr.write_arc();
        let node = deserialize_node(&guard)?;
        self.entries.push(LatchedNode {
            page_id,
            guard,
            node,
            dirty: false,
        });
        Ok(())
    }

    pub fn last(&self) -> &LatchedNode<K> {
        self.entries.last().expect("non-empty latch stack")
    }

    pub fn last_mut(&mut self) -> &mut LatchedNode<K> {
        self.entries.last_mut().expect("non-empty latch stack")
    }

    pub fn holds_root_guard(&self) -> bool {
        self.root_guard.is_some()
    }

    /// Redirect the root pointer; only legal while the root mutex is
    /// still held
    pub fn set_root(&mut self, page_id: PageId) {
        **self
            .root_guard
            .as_mut()
            .expect("root pointer update without the root mutex") = page_id;
    }

    /// The current node is safe: everything above it can be unlatched
    pub fn release_ancestors(&mut self) -> Result<()> {
        self.root_guard = None;
        while self.entries.len() > 1 {
            let entry = self.entries.remove(0);
            Self::release_entry(self.buffer_pool, entry)?;
        }
        Ok(())
    }

    /// Unlatch and unpin the whole path, writing back modified nodes
    pub fn release_all(&mut self) -> Result<()> {
        self.root_guard = None;
        while let Some(entry) = self.entries.pop() {
            Self::release_entry(self.buffer_pool, entry)?;
        }
        Ok(())
    }

    /// Remove and release the entry at `index` without touching the rest
    pub fn release_at(&mut self, index: usize) -> Result<()> {
        let entry = self.entries.remove(index);
        Self::release_entry(self.buffer_pool, entry)?;
        Ok(())
    }

    /// Remove the entry at `index` from the stack, handing it to the
    /// caller (used when the page itself is about to be deleted)
    pub fn take_at(&mut self, index: usize) -> LatchedNode<K> {
        self.entries.remove(index)
    }

    pub fn release_entry(
        buffer_pool: &Arc<BufferPoolManager>,
        mut entry: LatchedNode<K>,
    ) -> Result<()> {
        if entry.dirty {
            serialize_node(&entry.node, &mut entry.guard)?;
        }
        let page_id = entry.page_id;
        let dirty = entry.dirty;
        drop(entry.guard);
        buffer_pool.unpin_page(page_id, dirty)?;
        Ok(())
    }
}

impl<'a, K: Serialize + Clone + Ord> Drop for LatchStack<'a, K> {
    fn drop(&mut self) {
        // Backstop for error paths: write back what we can and always
        // drop the pins
        self.root_guard = None;
        while let Some(mut entry) = self.entries.pop() {
            if entry.dirty {
                let _ = serialize_node(&entry.node, &mut entry.guard);
            }
            let page_id = entry.page_id;
            let dirty = entry.dirty;
            drop(entry.guard);
            let _ = self.buffer_pool.unpin_page(page_id, dirty);
        }
    }
}
