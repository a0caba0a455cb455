//! Length bookkeeping for the nested SEQUENCEs a rewrite resizes.
//!
//! A change in one content length can change the width of its own length
//! octets, which in turn changes the content length of the parent. Each node
//! holds the bytes it owns directly plus its child nodes; resolving walks the
//! tree until no length moves any more.

use tracing::debug;

use super::der::{self, TlvRegion};
use super::errors::{CrlError, CrlResult};

/// Handle of a node in a [`LengthCascade`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
struct Node {
    tag: u8,
    parent: Option<usize>,
    depth: usize,
    /// Content bytes not owned by a child node
    own_len: usize,
    omit_if_empty: bool,
    original: Option<TlvRegion>,
    content_len: usize,
}

#[derive(Debug, Clone, Default)]
pub struct LengthCascade {
    nodes: Vec<Node>,
    resolved: bool,
}

impl LengthCascade {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, tag: u8, parent: Option<usize>, own_len: usize) -> NodeId {
        let depth = parent.map_or(0, |p| self.nodes[p].depth + 1);
        self.nodes.push(Node {
            tag,
            parent,
            depth,
            own_len,
            omit_if_empty: false,
            original: None,
            content_len: own_len,
        });
        self.resolved = false;
        NodeId(self.nodes.len() - 1)
    }

    pub fn add_root(&mut self, tag: u8, own_len: usize) -> NodeId {
        self.push(tag, None, own_len)
    }

    pub fn add_child(&mut self, parent: NodeId, tag: u8, own_len: usize) -> NodeId {
        self.push(tag, Some(parent.0), own_len)
    }

    /// Drop the node entirely, header included, when it ends up with no content
    pub fn omit_if_empty(&mut self, id: NodeId) {
        self.nodes[id.0].omit_if_empty = true;
        self.resolved = false;
    }

    /// Remember where the element sat in the source, for diagnostics
    pub fn set_original(&mut self, id: NodeId, region: TlvRegion) {
        self.nodes[id.0].original = Some(region);
    }

    fn is_present(&self, index: usize) -> bool {
        let node = &self.nodes[index];
        !(node.omit_if_empty && node.content_len == 0)
    }

    fn encoded_len(&self, index: usize) -> usize {
        if self.is_present(index) {
            der::encoded_len(self.nodes[index].content_len)
        } else {
            0
        }
    }

    /// Recompute content lengths until they stop changing.
    ///
    /// Passes visit children before parents, so the cascade settles within
    /// one pass per nesting level at most.
    pub fn resolve(&mut self) -> CrlResult<()> {
        let max_depth = self.nodes.iter().map(|n| n.depth).max().unwrap_or(0);
        let max_passes = max_depth + 2;

        let mut order: Vec<usize> = (0..self.nodes.len()).collect();
        order.sort_by(|a, b| self.nodes[*b].depth.cmp(&self.nodes[*a].depth));

        for pass in 1..=max_passes {
            let mut changed = false;
            for &index in &order {
                let children: usize = (0..self.nodes.len())
                    .filter(|&c| self.nodes[c].parent == Some(index))
                    .map(|c| self.encoded_len(c))
                    .sum();
                let content_len = self.nodes[index].own_len + children;
                if content_len != self.nodes[index].content_len {
                    self.nodes[index].content_len = content_len;
                    changed = true;
                }
            }
            if !changed {
                debug!("Length cascade settled after {pass} pass(es)");
                self.resolved = true;
                self.log_growth();
                return Ok(());
            }
        }

        Err(CrlError::format(
            "Length cascade did not settle; nested lengths are inconsistent",
        ))
    }

    fn log_growth(&self) {
        for node in &self.nodes {
            if let Some(original) = node.original {
                let header_len = der::header_len(node.content_len);
                if header_len != original.header.header_len {
                    debug!(
                        "Element 0x{:02X} at offset {} changes header width {} -> {} ({} -> {} bytes)",
                        node.tag,
                        original.offset,
                        original.header.header_len,
                        header_len,
                        original.content_len(),
                        node.content_len
                    );
                }
            }
        }
    }

    pub fn content_len(&self, id: NodeId) -> usize {
        self.nodes[id.0].content_len
    }

    /// Whether the node is written at all
    pub fn is_present_node(&self, id: NodeId) -> bool {
        self.is_present(id.0)
    }

    /// Tag and length octets for the node
    pub fn header(&self, id: NodeId) -> CrlResult<Vec<u8>> {
        if !self.resolved {
            return Err(CrlError::format("Length cascade used before it was resolved"));
        }
        let node = &self.nodes[id.0];
        Ok(der::encode_header(node.tag, node.content_len))
    }

    /// Total encoded size of the node, zero if omitted
    pub fn total_len(&self, id: NodeId) -> usize {
        self.encoded_len(id.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crl::der::tag;

    #[test]
    fn test_single_level() {
        let mut cascade = LengthCascade::new();
        let root = cascade.add_root(tag::SEQUENCE, 10);
        cascade.resolve().unwrap();
        assert_eq!(cascade.content_len(root), 10);
        assert_eq!(cascade.header(root).unwrap(), vec![0x30, 0x0A]);
    }

    #[test]
    fn test_child_growth_ripples_to_parents() {
        let mut cascade = LengthCascade::new();
        let outer = cascade.add_root(tag::SEQUENCE, 10);
        let tbs = cascade.add_child(outer, tag::SEQUENCE, 100);
        // 128 bytes of entries need two length octets
        let revoked = cascade.add_child(tbs, tag::SEQUENCE, 128);
        cascade.resolve().unwrap();

        assert_eq!(cascade.content_len(revoked), 128);
        assert_eq!(cascade.total_len(revoked), 131);
        assert_eq!(cascade.content_len(tbs), 231);
        assert_eq!(cascade.total_len(tbs), 234);
        assert_eq!(cascade.content_len(outer), 244);
        assert_eq!(cascade.header(tbs).unwrap(), vec![0x30, 0x81, 0xE7]);
    }

    #[test]
    fn test_width_change_crosses_256() {
        let mut cascade = LengthCascade::new();
        let outer = cascade.add_root(tag::SEQUENCE, 0);
        let inner = cascade.add_child(outer, tag::SEQUENCE, 253);
        cascade.resolve().unwrap();

        // 253 content + 3 header bytes = 256, which needs 0x82 form in the parent
        assert_eq!(cascade.content_len(outer), 256);
        assert_eq!(cascade.header(outer).unwrap(), vec![0x30, 0x82, 0x01, 0x00]);
    }

    #[test]
    fn test_empty_child_is_omitted() {
        let mut cascade = LengthCascade::new();
        let outer = cascade.add_root(tag::SEQUENCE, 5);
        let revoked = cascade.add_child(outer, tag::SEQUENCE, 0);
        cascade.omit_if_empty(revoked);
        cascade.resolve().unwrap();

        assert!(!cascade.is_present_node(revoked));
        assert_eq!(cascade.total_len(revoked), 0);
        assert_eq!(cascade.content_len(outer), 5);
    }

    #[test]
    fn test_header_requires_resolution() {
        let mut cascade = LengthCascade::new();
        let root = cascade.add_root(tag::SEQUENCE, 1);
        assert!(cascade.header(root).is_err());
    }
}
