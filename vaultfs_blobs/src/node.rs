//! Node layout and tree geometry for the balanced block tree.
//!
//! ```text
//! leaf:  depth(1=0) || used_byte_count(4, LE) || user-bytes, padded to leaf_capacity
//! inner: depth(1>=1) || child_count(4, LE)    || child-block-ids, padded with zero-ids to fanout
//! ```

use vaultfs_core::{BlockId, VaultFsError, VaultFsResult};

pub const NODE_HEADER_LEN: usize = 1 + 4;
const BLOCK_ID_LEN: usize = vaultfs_core::BLOCK_ID_LEN;

#[derive(Debug, Clone, Copy)]
pub struct TreeGeometry {
    pub leaf_capacity: usize,
    pub fanout: usize,
}

impl TreeGeometry {
    pub fn for_payload_size(payload_size: usize) -> VaultFsResult<Self> {
        let leaf_capacity = payload_size.checked_sub(NODE_HEADER_LEN).ok_or_else(|| {
            VaultFsError::InvalidArgument(format!(
                "block payload of {payload_size} bytes too small for a tree node header"
            ))
        })?;
        let fanout = leaf_capacity / BLOCK_ID_LEN;
        if fanout == 0 {
            return Err(VaultFsError::InvalidArgument(
                "block payload too small to hold even one child id".into(),
            ));
        }
        Ok(Self {
            leaf_capacity,
            fanout,
        })
    }

    /// Maximum number of bytes a subtree rooted at `depth` can cover.
    pub fn capacity_at_depth(&self, depth: u8) -> u64 {
        let mut cap = self.leaf_capacity as u64;
        for _ in 0..depth {
            cap = cap.saturating_mul(self.fanout as u64);
        }
        cap
    }
}

#[derive(Debug, Clone)]
pub enum Node {
    Leaf { used: u32, data: Vec<u8> },
    Inner { children: Vec<BlockId> },
}

impl Node {
    pub fn empty_leaf(geometry: &TreeGeometry) -> Self {
        Node::Leaf {
            used: 0,
            data: vec![0u8; geometry.leaf_capacity],
        }
    }

    pub fn encode(&self, depth: u8, geometry: &TreeGeometry) -> Vec<u8> {
        let mut out = Vec::with_capacity(NODE_HEADER_LEN + geometry.leaf_capacity);
        out.push(depth);
        match self {
            Node::Leaf { used, data } => {
                out.extend_from_slice(&used.to_le_bytes());
                out.extend_from_slice(data);
                out.resize(NODE_HEADER_LEN + geometry.leaf_capacity, 0);
            }
            Node::Inner { children } => {
                out.extend_from_slice(&(children.len() as u32).to_le_bytes());
                for child in children {
                    out.extend_from_slice(child.as_bytes());
                }
                for _ in children.len()..geometry.fanout {
                    out.extend_from_slice(BlockId::ZERO.as_bytes());
                }
            }
        }
        out
    }

    pub fn decode(bytes: &[u8], geometry: &TreeGeometry) -> VaultFsResult<(u8, Self)> {
        if bytes.len() < NODE_HEADER_LEN {
            return Err(VaultFsError::BadFormat("tree node shorter than header".into()));
        }
        let depth = bytes[0];
        let count = u32::from_le_bytes(bytes[1..5].try_into().unwrap());
        let body = &bytes[NODE_HEADER_LEN..];
        if depth == 0 {
            let used = count;
            if used as usize > geometry.leaf_capacity {
                return Err(VaultFsError::BadFormat(
                    "leaf node used-byte-count exceeds capacity".into(),
                ));
            }
            Ok((
                depth,
                Node::Leaf {
                    used,
                    data: body.to_vec(),
                },
            ))
        } else {
            let count = count as usize;
            if count > geometry.fanout {
                return Err(VaultFsError::BadFormat(
                    "inner node child-count exceeds fanout".into(),
                ));
            }
            let mut children = Vec::with_capacity(count);
            for i in 0..count {
                let start = i * BLOCK_ID_LEN;
                let mut raw = [0u8; BLOCK_ID_LEN];
                raw.copy_from_slice(&body[start..start + BLOCK_ID_LEN]);
                children.push(BlockId::from_bytes(raw));
            }
            Ok((depth, Node::Inner { children }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_roundtrips() {
        let geometry = TreeGeometry::for_payload_size(37).unwrap();
        let mut data = vec![0u8; geometry.leaf_capacity];
        data[0] = 9;
        let node = Node::Leaf { used: 1, data: data.clone() };
        let encoded = node.encode(0, &geometry);
        let (depth, decoded) = Node::decode(&encoded, &geometry).unwrap();
        assert_eq!(depth, 0);
        match decoded {
            Node::Leaf { used, data: d } => {
                assert_eq!(used, 1);
                assert_eq!(d, data);
            }
            _ => panic!("expected leaf"),
        }
    }

    #[test]
    fn inner_roundtrips_and_pads_with_zero_ids() {
        let geometry = TreeGeometry::for_payload_size(5 + 16 * 4).unwrap();
        let children = vec![BlockId::random(), BlockId::random()];
        let node = Node::Inner { children: children.clone() };
        let encoded = node.encode(1, &geometry);
        let (depth, decoded) = Node::decode(&encoded, &geometry).unwrap();
        assert_eq!(depth, 1);
        match decoded {
            Node::Inner { children: c } => assert_eq!(c, children),
            _ => panic!("expected inner"),
        }
    }
}
