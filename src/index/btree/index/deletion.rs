use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{PageId, INVALID_PAGE_ID};
use crate::index::btree::codec::{deserialize_node, serialize_node};
use crate::index::btree::error::Result;
use crate::index::btree::index::latch::{LatchStack, LatchedNode};
use crate::index::btree::node::BTreeNode;
use crate::storage::buffer::BufferPoolError;

use super::base::BTreeIndex;

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Remove `key` from the tree. Removing an absent key is a no-op.
    pub fn remove(&self, key: &K) -> Result<()> {
        let root_guard = self.root.lock();
        let root_id = *root_guard;
        if root_id == INVALID_PAGE_ID {
            return Ok(());
        }

        let mut stack = LatchStack::new(&self.buffer_pool, root_guard);
        stack.push(root_id)?;

        // Write crabbing with the delete safety predicate: a child above
        // minimum fill cannot propagate an underflow upward
        while !stack.last().node.is_leaf() {
            let child_id = stack.last().node.child_for(key);
            stack.push(child_id)?;
            if stack.last().node.size() > BTreeNode::<K>::min_size(self.order) {
                stack.release_ancestors()?;
            }
        }

        if !stack.last_mut().node.leaf_remove(key) {
            stack.release_all()?;
            return Ok(());
        }
        stack.last_mut().dirty = true;

        self.rebalance_upward(&mut stack)?;
        stack.release_all()?;
        Ok(())
    }

    /// Fix underflow from the leaf upward along the retained path. Each
    /// coalesce consumes the bottom stack entry, so the current node is
    /// always the last one.
    fn rebalance_upward(&self, stack: &mut LatchStack<'_, K>) -> Result<()> {
        loop {
            let level = stack.entries.len() - 1;

            if level == 0 {
                // Only the true root is exempt from minimum fill; a
                // retained non-root bottom was delete-safe on descent
                if stack.holds_root_guard() {
                    self.adjust_root(stack)?;
                }
                return Ok(());
            }

            if stack.entries[level].node.size() >= BTreeNode::<K>::min_size(self.order) {
                return Ok(());
            }

            if !self.coalesce_or_redistribute(stack, level)? {
                return Ok(());
            }
        }
    }

    /// Rebalance the underflowing node at `level` against a sibling.
    /// Returns true when an entry was removed from the parent (which may
    /// now underflow itself).
    fn coalesce_or_redistribute(
        &self,
        stack: &mut LatchStack<'_, K>,
        level: usize,
    ) -> Result<bool> {
        let node_id = stack.entries[level].page_id;
        let parent = &stack.entries[level - 1];
        let node_idx = parent
            .node
            .child_position(node_id)
            .expect("node listed under its parent");

        // Prefer the right neighbor; the rightmost child leans left
        let (sibling_idx, sibling_is_right) = if node_idx + 1 < parent.node.children.len() {
            (node_idx + 1, true)
        } else {
            (node_idx - 1, false)
        };
        let sibling_id = parent.node.children[sibling_idx];

        let sibling_ptr = self.buffer_pool.fetch_page(sibling_id)?;
        let sibling_guard = sibling_ptr.write_arc();
        let sibling_node: BTreeNode<K> = deserialize_node(&sibling_guard)?;
        let sibling = LatchedNode {
            page_id: sibling_id,
            guard: sibling_guard,
            node: sibling_node,
            dirty: false,
        };

        let total = stack.entries[level].node.size() + sibling.node.size();
        if total <= self.order - 1 {
            self.coalesce(stack, level, node_idx, sibling, sibling_is_right)?;
            Ok(true)
        } else {
            self.redistribute(stack, level, node_idx, sibling, sibling_is_right)?;
            Ok(false)
        }
    }

    /// Merge the node at `level` with its sibling. Entries always move
    /// leftward so the leaf chain stays intact; the vacated page is
    /// deleted and the separator removed from the parent.
    fn coalesce(
        &self,
        stack: &mut LatchStack<'_, K>,
        level: usize,
        node_idx: usize,
        mut sibling: LatchedNode<K>,
        sibling_is_right: bool,
    ) -> Result<()> {
        let mut adopted: Option<(Vec<PageId>, PageId)> = None;

        if sibling_is_right {
            // Pull the right sibling's entries into the node
            let (head, tail) = stack.entries.split_at_mut(level);
            let parent = &mut head[level - 1];
            let node = &mut tail[0];

            let separator = parent.node.keys.remove(node_idx);
            parent.node.children.remove(node_idx + 1);
            parent.dirty = true;

            if node.node.is_leaf() {
                node.node.keys.append(&mut sibling.node.keys);
                node.node.values.append(&mut sibling.node.values);
                node.node.next_page_id = sibling.node.next_page_id;
            } else {
                node.node.keys.push(separator);
                node.node.keys.append(&mut sibling.node.keys);
                let moved = sibling.node.children.clone();
                node.node.children.append(&mut sibling.node.children);
                adopted = Some((moved, node.page_id));
            }
            node.dirty = true;

            if let Some((children, new_parent)) = adopted {
                self.adopt_children(&children, new_parent)?;
            }

            // The sibling page is empty now; unlatch, unpin, delete
            let sibling_id = sibling.page_id;
            drop(sibling.guard);
            self.buffer_pool.unpin_page(sibling_id, false)?;
            self.discard_page(sibling_id)?;

            // The merged node is final; release it so the parent becomes
            // the bottom of the stack
            stack.release_at(level)?;
        } else {
            // Rightmost child: push the node's entries into the left
            // sibling and delete the node itself
            let (head, tail) = stack.entries.split_at_mut(level);
            let parent = &mut head[level - 1];
            let node = &mut tail[0];

            let separator = parent.node.keys.remove(node_idx - 1);
            parent.node.children.remove(node_idx);
            parent.dirty = true;

            if sibling.node.is_leaf() {
                sibling.node.keys.append(&mut node.node.keys);
                sibling.node.values.append(&mut node.node.values);
                sibling.node.next_page_id = node.node.next_page_id;
            } else {
                sibling.node.keys.push(separator);
                sibling.node.keys.append(&mut node.node.keys);
                let moved = node.node.children.clone();
                sibling.node.children.append(&mut node.node.children);
                adopted = Some((moved, sibling.page_id));
            }
            sibling.dirty = true;

            if let Some((children, new_parent)) = adopted {
                self.adopt_children(&children, new_parent)?;
            }

            LatchStack::release_entry(&self.buffer_pool, sibling)?;

            let node_entry = stack.take_at(level);
            let node_id = node_entry.page_id;
            drop(node_entry.guard);
            self.buffer_pool.unpin_page(node_id, false)?;
            self.discard_page(node_id)?;
        }

        Ok(())
    }

    /// Shift one entry across the sibling boundary and refresh the
    /// parent's separator
    fn redistribute(
        &self,
        stack: &mut LatchStack<'_, K>,
        level: usize,
        node_idx: usize,
        mut sibling: LatchedNode<K>,
        sibling_is_right: bool,
    ) -> Result<()> {
        let mut adopted: Option<(Vec<PageId>, PageId)> = None;

        {
            let (head, tail) = stack.entries.split_at_mut(level);
            let parent = &mut head[level - 1];
            let node = &mut tail[0];

            if sibling_is_right {
                let separator_idx = node_idx;
                if node.node.is_leaf() {
                    let key = sibling.node.keys.remove(0);
                    let value = sibling.node.values.remove(0);
                    node.node.keys.push(key);
                    node.node.values.push(value);
                    parent.node.keys[separator_idx] = sibling.node.keys[0].clone();
                } else {
                    let moved_child = sibling.node.children.remove(0);
                    let new_separator = sibling.node.keys.remove(0);
                    let old_separator =
                        std::mem::replace(&mut parent.node.keys[separator_idx], new_separator);
                    node.node.keys.push(old_separator);
                    node.node.children.push(moved_child);
                    adopted = Some((vec![moved_child], node.page_id));
                }
            } else {
                let separator_idx = node_idx - 1;
                if node.node.is_leaf() {
                    let key = sibling.node.keys.pop().expect("non-empty sibling");
                    let value = sibling.node.values.pop().expect("non-empty sibling");
                    node.node.keys.insert(0, key.clone());
                    node.node.values.insert(0, value);
                    parent.node.keys[separator_idx] = key;
                } else {
                    let moved_child = sibling.node.children.pop().expect("non-empty sibling");
                    let new_separator = sibling.node.keys.pop().expect("non-empty sibling");
                    let old_separator =
                        std::mem::replace(&mut parent.node.keys[separator_idx], new_separator);
                    node.node.keys.insert(0, old_separator);
                    node.node.children.insert(0, moved_child);
                    adopted = Some((vec![moved_child], node.page_id));
                }
            }

            node.dirty = true;
            parent.dirty = true;
            sibling.dirty = true;
        }

        if let Some((children, new_parent)) = adopted {
            self.adopt_children(&children, new_parent)?;
        }
        LatchStack::release_entry(&self.buffer_pool, sibling)?;

        Ok(())
    }

    /// Collapse the root when deletion has emptied it: a bare leaf root
    /// empties the whole tree; an internal root with a single child hands
    /// the root to that child.
    fn adjust_root(&self, stack: &mut LatchStack<'_, K>) -> Result<()> {
        debug_assert_eq!(stack.entries.len(), 1);

        let root_is_leaf = stack.entries[0].node.is_leaf();
        if root_is_leaf {
            if !stack.entries[0].node.keys.is_empty() {
                return Ok(());
            }

            let old_root = stack.take_at(0);
            let old_root_id = old_root.page_id;
            drop(old_root.guard);
            self.buffer_pool.unpin_page(old_root_id, false)?;
            self.discard_page(old_root_id)?;

            stack.set_root(INVALID_PAGE_ID);
            self.persist_root(INVALID_PAGE_ID)?;
            return Ok(());
        }

        if stack.entries[0].node.children.len() > 1 {
            return Ok(());
        }

        let child_id = stack.entries[0].node.children[0];
        {
            let child_ptr = self.buffer_pool.fetch_page(child_id)?;
            {
                let mut page = child_ptr.write();
                let mut child: BTreeNode<K> = deserialize_node(&page)?;
                child.parent_page_id = INVALID_PAGE_ID;
                serialize_node(&child, &mut page)?;
            }
            self.buffer_pool.unpin_page(child_id, true)?;
        }

        let old_root = stack.take_at(0);
        let old_root_id = old_root.page_id;
        drop(old_root.guard);
        self.buffer_pool.unpin_page(old_root_id, false)?;
        self.discard_page(old_root_id)?;

        stack.set_root(child_id);
        self.persist_root(child_id)?;
        Ok(())
    }

    /// Delete a detached page, tolerating the losing side of a pin race
    fn discard_page(&self, page_id: PageId) -> Result<()> {
        match self.buffer_pool.delete_page(page_id) {
            Ok(()) | Err(BufferPoolError::PagePinned(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
