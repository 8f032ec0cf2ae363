use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::codec::deserialize_node;
use crate::index::btree::error::Result;
use crate::index::btree::node::BTreeNode;
use crate::storage::buffer::BufferPoolManager;

use super::base::BTreeIndex;

/// Forward iterator over leaf entries in key order. Holds a pin on the
/// current leaf (no latch between steps) and walks the leaf chain,
/// unpinning each leaf as it moves off it.
pub struct BTreeIterator<K> {
    buffer_pool: Arc<BufferPoolManager>,
    page_id: PageId,
    node: Option<BTreeNode<K>>,
    index: usize,
}

impl<K> BTreeIterator<K>
where
    K: Clone + Ord + DeserializeOwned,
{
    pub(crate) fn new(
        buffer_pool: Arc<BufferPoolManager>,
        page_id: PageId,
        node: BTreeNode<K>,
        index: usize,
    ) -> Self {
        Self {
            buffer_pool,
            page_id,
            node: Some(node),
            index,
        }
    }

    pub(crate) fn exhausted(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            buffer_pool,
            page_id: INVALID_PAGE_ID,
            node: None,
            index: 0,
        }
    }

    /// True once the iterator has no further entries to produce
    pub fn is_end(&self) -> bool {
        match &self.node {
            None => true,
            Some(node) => {
                node.next_page_id == INVALID_PAGE_ID && self.index >= node.keys.len()
            }
        }
    }
}

impl<K> Iterator for BTreeIterator<K>
where
    K: Clone + Ord + DeserializeOwned,
{
    type Item = (K, Rid);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = self.node.as_ref()?;
            if self.index < node.keys.len() {
                let item = (node.keys[self.index].clone(), node.values[self.index]);
                self.index += 1;
                return Some(item);
            }

            // Off the end of this leaf: follow the chain
            let next_id = node.next_page_id;
            let _ = self.buffer_pool.unpin_page(self.page_id, false);
            if next_id == INVALID_PAGE_ID {
                self.node = None;
                return None;
            }

            let page_ptr = match self.buffer_pool.fetch_page(next_id) {
                Ok(page_ptr) => page_ptr,
                Err(_) => {
                    self.node = None;
                    return None;
                }
            };
            let next_node = {
                let guard = page_ptr.read();
                deserialize_node::<K>(&guard)
            };
            match next_node {
                Ok(next_node) => {
                    self.page_id = next_id;
                    self.node = Some(next_node);
                    self.index = 0;
                }
                Err(_) => {
                    let _ = self.buffer_pool.unpin_page(next_id, false);
                    self.node = None;
                    return None;
                }
            }
        }
    }
}

impl<K> Drop for BTreeIterator<K> {
    fn drop(&mut self) {
        if self.node.is_some() {
            let _ = self.buffer_pool.unpin_page(self.page_id, false);
        }
    }
}

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Iterate from the smallest key
    pub fn begin(&self) -> Result<BTreeIterator<K>> {
        self.make_iterator(None)
    }

    /// Iterate from the first key >= `key`
    pub fn begin_at(&self, key: &K) -> Result<BTreeIterator<K>> {
        self.make_iterator(Some(key))
    }

    /// All rids for keys in `[start, end]`
    pub fn range_scan(&self, start: &K, end: &K) -> Result<Vec<Rid>> {
        if start > end {
            return Ok(Vec::new());
        }
        let mut result = Vec::new();
        for (key, rid) in self.begin_at(start)? {
            if &key > end {
                break;
            }
            result.push(rid);
        }
        Ok(result)
    }

    fn make_iterator(&self, key: Option<&K>) -> Result<BTreeIterator<K>> {
        let root_guard = self.root.lock();
        let root_id = *root_guard;
        if root_id == INVALID_PAGE_ID {
            return Ok(BTreeIterator::exhausted(Arc::clone(&self.buffer_pool)));
        }

        let page_ptr = self.buffer_pool.fetch_page(root_id)?;
        let mut guard = page_ptr.read_arc();
        drop(root_guard);

        let mut page_id = root_id;
        loop {
            let node: BTreeNode<K> = deserialize_node(&guard)?;
            if node.is_leaf() {
                let index = match key {
                    Some(key) => node.leaf_lower_bound(key),
                    None => 0,
                };
                drop(guard);
                // The pin moves into the iterator
                return Ok(BTreeIterator::new(
                    Arc::clone(&self.buffer_pool),
                    page_id,
                    node,
                    index,
                ));
            }

            let child_id = match key {
                Some(key) => node.child_for(key),
                None => node.children[0],
            };
            let child_ptr = self.buffer_pool.fetch_page(child_id)?;
            let child_guard = child_ptr.read_arc();
            drop(guard);
            self.buffer_pool.unpin_page(page_id, false)?;
            guard = child_guard;
            page_id = child_id;
        }
    }
}
