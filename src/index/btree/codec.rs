use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::mem;

use crate::common::types::{Page, Rid, PAGE_PREFIX_SIZE, PAGE_SIZE};
use crate::index::btree::error::{BTreeError, Result};
use crate::index::btree::node::BTreeNode;

/// Bytes reserved for the common page prefix, the payload length word,
/// and per-node header fields inside the serialized payload
const NODE_HEADER_RESERVE: usize = 64;

/// Payload length word sits right after the common page prefix
const PAYLOAD_LEN_OFFSET: usize = PAGE_PREFIX_SIZE;
const PAYLOAD_OFFSET: usize = PAYLOAD_LEN_OFFSET + 4;

/// Serialize a node into the page bytes after the common prefix
pub fn serialize_node<K>(node: &BTreeNode<K>, page: &mut Page) -> Result<()>
where
    K: Serialize + Clone + Ord,
{
    let payload = bincode::serialize(node)
        .map_err(|e| BTreeError::SerializationError(e.to_string()))?;
    if PAYLOAD_OFFSET + payload.len() > PAGE_SIZE {
        return Err(BTreeError::NodeTooLarge);
    }

    LittleEndian::write_u32(
        &mut page.data[PAYLOAD_LEN_OFFSET..PAYLOAD_OFFSET],
        payload.len() as u32,
    );
    page.data[PAYLOAD_OFFSET..PAYLOAD_OFFSET + payload.len()].copy_from_slice(&payload);

    Ok(())
}

/// Deserialize the node stored in a page
pub fn deserialize_node<K>(page: &Page) -> Result<BTreeNode<K>>
where
    K: DeserializeOwned + Clone + Ord,
{
    let len = LittleEndian::read_u32(&page.data[PAYLOAD_LEN_OFFSET..PAYLOAD_OFFSET]) as usize;
    if len == 0 || PAYLOAD_OFFSET + len > PAGE_SIZE {
        return Err(BTreeError::InvalidPageFormat);
    }
    bincode::deserialize(&page.data[PAYLOAD_OFFSET..PAYLOAD_OFFSET + len])
        .map_err(|e| BTreeError::DeserializationError(e.to_string()))
}

/// Max entries per node, derived from the page size and the serialized
/// entry footprint. An estimate: per-entry slack absorbs bincode framing.
pub fn calculate_order<K>() -> usize {
    let key_size = mem::size_of::<K>();
    let value_size = mem::size_of::<Rid>();
    let order = (PAGE_SIZE - NODE_HEADER_RESERVE) / (key_size + value_size + 8);
    order.max(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::INVALID_PAGE_ID;

    #[test]
    fn test_node_roundtrip() {
        let mut node: BTreeNode<i64> = BTreeNode::new_leaf();
        node.leaf_insert(10, Rid::new(1, 0));
        node.leaf_insert(20, Rid::new(1, 1));
        node.next_page_id = 7;

        let mut page = Page::new(3);
        serialize_node(&node, &mut page).unwrap();
        let decoded: BTreeNode<i64> = deserialize_node(&page).unwrap();

        assert_eq!(decoded.keys, node.keys);
        assert_eq!(decoded.values, node.values);
        assert_eq!(decoded.next_page_id, 7);
        assert_eq!(decoded.parent_page_id, INVALID_PAGE_ID);
        assert!(decoded.is_leaf());
    }

    #[test]
    fn test_full_node_fits_in_page() {
        let order = calculate_order::<i64>();
        let mut node: BTreeNode<i64> = BTreeNode::new_leaf();
        for k in 0..=order as i64 {
            node.leaf_insert(k, Rid::new(0, k as u32));
        }

        // One entry past the order (the transient overflow before a
        // split) must still serialize
        let mut page = Page::new(1);
        serialize_node(&node, &mut page).unwrap();
    }

    #[test]
    fn test_empty_page_is_invalid() {
        let page = Page::new(1);
        assert!(matches!(
            deserialize_node::<i64>(&page),
            Err(BTreeError::InvalidPageFormat)
        ));
    }
}
