use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::codec::{deserialize_node, serialize_node};
use crate::index::btree::error::Result;
use crate::index::btree::index::latch::{LatchStack, LatchedNode};
use crate::index::btree::node::BTreeNode;

use super::base::BTreeIndex;

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Insert a key/rid pair. Keys are unique: returns false and leaves
    /// the tree untouched when the key is already present.
    pub fn insert(&self, key: K, rid: Rid) -> Result<bool> {
        let mut root_guard = self.root.lock();

        if *root_guard == INVALID_PAGE_ID {
            let page_id = self.start_new_tree(&key, rid)?;
            *root_guard = page_id;
            self.persist_root(page_id)?;
            return Ok(true);
        }

        let root_id = *root_guard;
        let mut stack = LatchStack::new(&self.buffer_pool, root_guard);
        stack.push(root_id)?;

        // Write crabbing: keep ancestors latched only until a child
        // proves it can absorb the insert without splitting
        while !stack.last().node.is_leaf() {
            let child_id = stack.last().node.child_for(&key);
            stack.push(child_id)?;
            if stack.last().node.size() < self.order {
                stack.release_ancestors()?;
            }
        }

        if !stack.last_mut().node.leaf_insert(key, rid) {
            stack.release_all()?;
            return Ok(false);
        }
        stack.last_mut().dirty = true;

        if stack.last().node.size() > self.order {
            self.split_upward(&mut stack)?;
        }

        stack.release_all()?;
        Ok(true)
    }

    /// Seed a one-entry leaf as the root of a previously empty tree
    fn start_new_tree(&self, key: &K, rid: Rid) -> Result<PageId> {
        let (page_ptr, page_id) = self.buffer_pool.new_page()?;
        let mut node = BTreeNode::new_leaf();
        node.leaf_insert(key.clone(), rid);

        let written = {
            let mut page = page_ptr.write();
            serialize_node(&node, &mut page)
        };
        if let Err(e) = written {
            self.buffer_pool.unpin_page(page_id, false)?;
            let _ = self.buffer_pool.delete_page(page_id);
            return Err(e);
        }
        self.buffer_pool.unpin_page(page_id, true)?;
        Ok(page_id)
    }

    /// Resolve overflow from the deepest retained node upward, splitting
    /// until the path is within bounds. Each split releases the child it
    /// finished with before touching the parent, so a parent split never
    /// re-latches a page this operation already holds. Only the root can
    /// overflow at the bottom of the retained stack; everything else
    /// retained was unsafe and therefore has its parent latched above it.
    fn split_upward(&self, stack: &mut LatchStack<'_, K>) -> Result<()> {
        loop {
            let level = stack.entries.len() - 1;
            if stack.entries[level].node.size() <= self.order {
                return Ok(());
            }

            let (separator, mut sibling) = self.split_entry(&mut stack.entries[level])?;

            if level == 0 {
                debug_assert!(stack.holds_root_guard(), "root split without the root mutex");
                let old_root_id = stack.entries[0].page_id;

                let mut new_root = BTreeNode::new_internal();
                new_root.keys.push(separator);
                new_root.children.push(old_root_id);
                new_root.children.push(sibling.page_id);

                let (root_ptr, new_root_id) = self.buffer_pool.new_page()?;
                let written = {
                    let mut page = root_ptr.write();
                    serialize_node(&new_root, &mut page)
                };
                if let Err(e) = written {
                    self.buffer_pool.unpin_page(new_root_id, false)?;
                    let _ = self.buffer_pool.delete_page(new_root_id);
                    LatchStack::release_entry(&self.buffer_pool, sibling)?;
                    return Err(e);
                }
                self.buffer_pool.unpin_page(new_root_id, true)?;

                stack.entries[0].node.parent_page_id = new_root_id;
                stack.entries[0].dirty = true;
                sibling.node.parent_page_id = new_root_id;
                LatchStack::release_entry(&self.buffer_pool, sibling)?;

                stack.set_root(new_root_id);
                self.persist_root(new_root_id)?;
                return Ok(());
            }

            let parent_id = stack.entries[level - 1].page_id;
            sibling.node.parent_page_id = parent_id;
            let sibling_id = sibling.page_id;
            LatchStack::release_entry(&self.buffer_pool, sibling)?;

            let parent = &mut stack.entries[level - 1];
            parent.node.insert_child(separator, sibling_id);
            parent.dirty = true;

            // The split child is final; drop its latch so a parent split
            // that reassigns it can adopt it like any other child
            stack.release_at(level)?;
        }
    }

    /// Split one overflowing node, producing a write-latched sibling
    /// holding the upper half and the separator to push into the parent
    fn split_entry(&self, entry: &mut LatchedNode<K>) -> Result<(K, LatchedNode<K>)> {
        let (page_ptr, page_id) = self.buffer_pool.new_page()?;
        let guard = page_ptr.write_arc();

        let (separator, mut node) = if entry.node.is_leaf() {
            let (separator, mut sibling) = entry.node.split_leaf();
            sibling.next_page_id = entry.node.next_page_id;
            entry.node.next_page_id = page_id;
            (separator, sibling)
        } else {
            entry.node.split_internal()
        };
        node.parent_page_id = entry.node.parent_page_id;
        entry.dirty = true;

        let sibling = LatchedNode {
            page_id,
            guard,
            node,
            dirty: true,
        };

        // Children that moved to the sibling now live under a new parent
        if !sibling.node.is_leaf() {
            let moved = sibling.node.children.clone();
            if let Err(e) = self.adopt_children(&moved, page_id) {
                drop(sibling.guard);
                self.buffer_pool.unpin_page(page_id, false)?;
                let _ = self.buffer_pool.delete_page(page_id);
                return Err(e);
            }
        }

        Ok((separator, sibling))
    }

    /// Rewrite the parent pointer of each page in `children`
    pub(crate) fn adopt_children(&self, children: &[PageId], parent: PageId) -> Result<()> {
        for &child_id in children {
            let page_ptr = self.buffer_pool.fetch_page(child_id)?;
            {
                let mut page = page_ptr.write();
                let mut node: BTreeNode<K> = deserialize_node(&page)?;
                node.parent_page_id = parent;
                serialize_node(&node, &mut page)?;
            }
            self.buffer_pool.unpin_page(child_id, true)?;
        }
        Ok(())
    }
}
