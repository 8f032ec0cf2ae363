use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{PageId, Rid, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::index::btree::codec::{calculate_order, deserialize_node};
use crate::index::btree::error::Result;
use crate::index::btree::node::BTreeNode;
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::HeaderPage;

/// Disk-backed B+tree index over buffer-pool pages.
///
/// The tree persists its root page id in the header page under
/// `index_name` and guards the in-memory root pointer with a mutex that
/// doubles as the top of the latch-crabbing order.
pub struct BTreeIndex<K> {
    pub(crate) index_name: String,
    pub(crate) buffer_pool: Arc<BufferPoolManager>,
    pub(crate) root: Mutex<PageId>,
    pub(crate) order: usize,
    pub(crate) _phantom: PhantomData<K>,
}

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Open or create the index named `index_name`, with the node fan-out
    /// derived from the page size
    pub fn new(index_name: &str, buffer_pool: Arc<BufferPoolManager>) -> Result<Self> {
        Self::new_with_order(index_name, buffer_pool, calculate_order::<K>())
    }

    /// Open or create the index with an explicit fan-out; small orders
    /// make split and coalesce paths reachable with few keys
    pub fn new_with_order(
        index_name: &str,
        buffer_pool: Arc<BufferPoolManager>,
        order: usize,
    ) -> Result<Self> {
        assert!(order >= 3, "B+tree order must be at least 3");

        let root_page_id = {
            let page_ptr = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
            let root = {
                let mut page = page_ptr.write();
                match HeaderPage::get_record(&page, index_name) {
                    Some(root) => root,
                    None => {
                        HeaderPage::insert_record(&mut page, index_name, INVALID_PAGE_ID)?;
                        INVALID_PAGE_ID
                    }
                }
            };
            buffer_pool.unpin_page(HEADER_PAGE_ID, true)?;
            root
        };

        Ok(Self {
            index_name: index_name.to_string(),
            buffer_pool,
            root: Mutex::new(root_page_id),
            order,
            _phantom: PhantomData,
        })
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn is_empty(&self) -> bool {
        *self.root.lock() == INVALID_PAGE_ID
    }

    /// Point lookup with hand-over-hand read latching: the child's latch
    /// is acquired before the parent's is dropped.
    pub fn get_value(&self, key: &K) -> Result<Option<Rid>> {
        let root_guard = self.root.lock();
        let root_id = *root_guard;
        if root_id == INVALID_PAGE_ID {
            return Ok(None);
        }

        let page_ptr = self.buffer_pool.fetch_page(root_id)?;
        let mut guard = page_ptr.read_arc();
        drop(root_guard);

        let mut page_id = root_id;
        loop {
            let node: BTreeNode<K> = deserialize_node(&guard)?;
            if node.is_leaf() {
                let result = node.leaf_lookup(key);
                drop(guard);
                self.buffer_pool.unpin_page(page_id, false)?;
                return Ok(result);
            }

            let child_id = node.child_for(key);
            let child_ptr = self.buffer_pool.fetch_page(child_id)?;
            let child_guard = child_ptr.read_arc();
            drop(guard);
            self.buffer_pool.unpin_page(page_id, false)?;
            guard = child_guard;
            page_id = child_id;
        }
    }

    /// Record a root change in the header page. Callers hold the root
    /// mutex across this so header updates serialize with root changes.
    pub(crate) fn persist_root(&self, root_page_id: PageId) -> Result<()> {
        let page_ptr = self.buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        {
            let mut page = page_ptr.write();
            HeaderPage::update_record(&mut page, &self.index_name, root_page_id)?;
        }
        self.buffer_pool.unpin_page(HEADER_PAGE_ID, true)?;
        Ok(())
    }
}
