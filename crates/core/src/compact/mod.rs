//! Byte-packed, pre-order encoding of a finished calling-context tree.
//!
//! Every node is a fixed-size big-endian header followed by its child
//! offsets:
//!
//! | field        | width | notes                                  |
//! |--------------|-------|----------------------------------------|
//! | method id    | 2     | 0 is the synthetic thread node          |
//! | calls        | 4     |                                         |
//! | total time 0 | 5     | cleansed microseconds                   |
//! | self time 0  | 5     |                                         |
//! | total time 1 | 5     | only in two-timestamp containers        |
//! | self time 1  | 5     | only in two-timestamp containers        |
//! | children     | 2     |                                         |
//! | offsets      | 3/4   | one per child, width fixed per container |
//!
//! The root lives at offset 0 and every child follows its parent. Offsets
//! never leave this module; callers navigate with opaque [`NodeRef`]s.

mod encode;

use byteorder::{BigEndian, ByteOrder};
use callprof_protocol::MethodId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub use encode::encode_call_tree;

use crate::timing::TimeStream;

/// Largest value a 5-byte time field holds.
pub const MAX_TIME: u64 = (1 << 40) - 1;

/// Containers up to this size use 3-byte child offsets.
const MAX_3_BYTE_OFFSET: usize = 0xFF_FFFF;

const OFF_METHOD_ID: usize = 0;
const OFF_N_CALLS: usize = 2;
const OFF_TOTAL_0: usize = 6;
const OFF_SELF_0: usize = 11;
const OFF_TOTAL_1: usize = 16;
const OFF_SELF_1: usize = 21;
const TIME_BYTES: usize = 5;

/// Children beyond this count do not fit the 2-byte field and are dropped.
pub const MAX_CHILDREN: usize = u16::MAX as usize;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompactError {
    #[error("compact data is empty")]
    Empty,
    #[error("node at offset {offset} runs past the end of the data ({len} bytes)")]
    Truncated { offset: usize, len: usize },
    #[error("node expected at offset {expected}, child offset points to {found}")]
    NotPreOrder { expected: usize, found: usize },
    #[error("{0} trailing bytes after the last node")]
    TrailingBytes(usize),
}

/// Field layout shared by every node of one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NodeLayout {
    two_timestamps: bool,
    offset_width: usize,
}

impl NodeLayout {
    fn header_size(self) -> usize {
        header_size(self.two_timestamps)
    }

    fn n_children_at(self) -> usize {
        self.header_size() - 2
    }

    fn for_len(two_timestamps: bool, len: usize) -> Self {
        Self {
            two_timestamps,
            offset_width: if len <= MAX_3_BYTE_OFFSET { 3 } else { 4 },
        }
    }
}

/// Size of a node header without child offsets: 18 or 28 bytes.
pub fn header_size(two_timestamps: bool) -> usize {
    if two_timestamps { 28 } else { 18 }
}

/// Handle to one node of a [`CompactTree`]. Only valid for the tree that
/// produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeRef(u32);

impl NodeRef {
    fn offset(self) -> usize {
        self.0 as usize
    }
}

/// Immutable compact calling-context tree.
#[derive(Clone, PartialEq, Eq)]
pub struct CompactTree {
    data: Vec<u8>,
    layout: NodeLayout,
}

impl std::fmt::Debug for CompactTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactTree")
            .field("bytes", &self.data.len())
            .field("two_timestamps", &self.layout.two_timestamps)
            .field("offset_width", &self.layout.offset_width)
            .finish()
    }
}

impl CompactTree {
    /// Validates and adopts previously encoded bytes.
    pub fn from_bytes(data: Vec<u8>, two_timestamps: bool) -> Result<Self, CompactError> {
        if data.is_empty() {
            return Err(CompactError::Empty);
        }
        let tree = Self {
            layout: NodeLayout::for_len(two_timestamps, data.len()),
            data,
        };
        tree.validate()?;
        Ok(tree)
    }

    /// Walks the tree in pre-order and checks that nodes are laid out back to
    /// back exactly in that order.
    fn validate(&self) -> Result<(), CompactError> {
        let len = self.data.len();
        let header = self.layout.header_size();
        let width = self.layout.offset_width;
        let mut next = 0usize;
        let mut stack = vec![0usize];

        while let Some(offset) = stack.pop() {
            if offset != next {
                return Err(CompactError::NotPreOrder {
                    expected: next,
                    found: offset,
                });
            }
            if offset + header > len {
                return Err(CompactError::Truncated { offset, len });
            }
            let n = usize::from(BigEndian::read_u16(
                &self.data[offset + self.layout.n_children_at()..],
            ));
            let end = offset + header + n * width;
            if end > len {
                return Err(CompactError::Truncated { offset, len });
            }
            next = end;
            for i in (0..n).rev() {
                let slot = offset + header + i * width;
                stack.push(BigEndian::read_uint(&self.data[slot..], width) as usize);
            }
        }
        if next != len {
            return Err(CompactError::TrailingBytes(len - next));
        }
        Ok(())
    }

    pub fn root(&self) -> NodeRef {
        NodeRef(0)
    }

    pub fn two_timestamps(&self) -> bool {
        self.layout.two_timestamps
    }

    /// Header size of this container's nodes.
    pub fn node_size(&self) -> usize {
        self.layout.header_size()
    }

    /// Width of each child offset, 3 or 4 bytes.
    pub fn offset_width(&self) -> usize {
        self.layout.offset_width
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// True when the thread node has no children.
    pub fn is_empty(&self) -> bool {
        self.n_children(self.root()) == 0
    }

    pub fn node_count(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self.root()];
        while let Some(node) = stack.pop() {
            count += 1;
            stack.extend(self.children(node));
        }
        count
    }

    pub fn method_id(&self, node: NodeRef) -> MethodId {
        BigEndian::read_u16(&self.data[node.offset() + OFF_METHOD_ID..])
    }

    pub fn n_calls(&self, node: NodeRef) -> u32 {
        BigEndian::read_u32(&self.data[node.offset() + OFF_N_CALLS..])
    }

    fn read_time(&self, node: NodeRef, field: usize) -> u64 {
        BigEndian::read_uint(&self.data[node.offset() + field..], TIME_BYTES)
    }

    /// Cleansed total time in microseconds; 0 for the thread-CPU stream of a
    /// single-timestamp container.
    pub fn total_time(&self, node: NodeRef, stream: TimeStream) -> u64 {
        match stream {
            TimeStream::Absolute => self.read_time(node, OFF_TOTAL_0),
            TimeStream::ThreadCpu if self.layout.two_timestamps => {
                self.read_time(node, OFF_TOTAL_1)
            }
            TimeStream::ThreadCpu => 0,
        }
    }

    pub fn self_time(&self, node: NodeRef, stream: TimeStream) -> u64 {
        match stream {
            TimeStream::Absolute => self.read_time(node, OFF_SELF_0),
            TimeStream::ThreadCpu if self.layout.two_timestamps => {
                self.read_time(node, OFF_SELF_1)
            }
            TimeStream::ThreadCpu => 0,
        }
    }

    pub fn n_children(&self, node: NodeRef) -> usize {
        usize::from(BigEndian::read_u16(
            &self.data[node.offset() + self.layout.n_children_at()..],
        ))
    }

    pub fn child(&self, node: NodeRef, index: usize) -> Option<NodeRef> {
        if index >= self.n_children(node) {
            return None;
        }
        let width = self.layout.offset_width;
        let slot = node.offset() + self.layout.header_size() + index * width;
        Some(NodeRef(BigEndian::read_uint(&self.data[slot..], width) as u32))
    }

    pub fn children(&self, node: NodeRef) -> impl Iterator<Item = NodeRef> + '_ {
        (0..self.n_children(node)).filter_map(move |i| self.child(node, i))
    }

    /// Decodes the whole tree into owned nodes.
    pub fn to_owned_tree(&self) -> OwnedNode {
        self.to_owned_node(self.root())
    }

    fn to_owned_node(&self, node: NodeRef) -> OwnedNode {
        OwnedNode {
            method_id: self.method_id(node),
            n_calls: self.n_calls(node),
            total_time: [
                self.total_time(node, TimeStream::Absolute),
                self.total_time(node, TimeStream::ThreadCpu),
            ],
            self_time: [
                self.self_time(node, TimeStream::Absolute),
                self.self_time(node, TimeStream::ThreadCpu),
            ],
            children: self
                .children(node)
                .map(|c| self.to_owned_node(c))
                .collect(),
        }
    }

    /// Encodes an owned tree as-is; totals are taken from the nodes, not
    /// recomputed.
    pub fn from_owned(root: &OwnedNode, two_timestamps: bool) -> Self {
        fn count(node: &OwnedNode, dropped: &mut usize) -> usize {
            let children = node.encoded_children();
            *dropped += node.children.len() - children.len();
            1 + children.iter().map(|c| count(c, dropped)).sum::<usize>()
        }
        let mut dropped = 0;
        let len = count(root, &mut dropped);
        if dropped > 0 {
            warn!(dropped, limit = MAX_CHILDREN, "node has too many children; extra callees dropped");
        }
        let mut writer = CompactWriter::new(len, two_timestamps);
        let mut stack = vec![(root, None::<(usize, usize)>)];
        while let Some((node, slot)) = stack.pop() {
            let children = node.encoded_children();
            let offset = writer.alloc_node(node.method_id, node.n_calls, children.len());
            writer.set_times(offset, node.total_time, node.self_time);
            if let Some((parent, index)) = slot {
                writer.set_child(parent, index, offset);
            }
            for (i, child) in children.iter().enumerate().rev() {
                stack.push((child, Some((offset, i))));
            }
        }
        writer.finish()
    }
}

/// Decoded node, used to build or inspect trees outside the byte form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedNode {
    pub method_id: MethodId,
    pub n_calls: u32,
    pub total_time: [u64; 2],
    pub self_time: [u64; 2],
    pub children: Vec<OwnedNode>,
}

impl OwnedNode {
    pub fn new(method_id: MethodId, n_calls: u32, self_time: u64, total_time: u64) -> Self {
        Self {
            method_id,
            n_calls,
            total_time: [total_time, 0],
            self_time: [self_time, 0],
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<OwnedNode>) -> Self {
        self.children = children;
        self
    }

    fn encoded_children(&self) -> &[OwnedNode] {
        &self.children[..self.children.len().min(MAX_CHILDREN)]
    }
}

/// Writes nodes into a buffer sized exactly for a known node count.
///
/// Nodes must be allocated in pre-order; each child slot is back-patched
/// once the child's offset is known.
pub(crate) struct CompactWriter {
    data: Vec<u8>,
    layout: NodeLayout,
    next: usize,
}

impl CompactWriter {
    pub(crate) fn new(node_count: usize, two_timestamps: bool) -> Self {
        let node_count = node_count.max(1);
        let header = header_size(two_timestamps);
        let edges = node_count - 1;
        let len3 = node_count * header + edges * 3;
        let offset_width = if len3 <= MAX_3_BYTE_OFFSET { 3 } else { 4 };
        let len = node_count * header + edges * offset_width;
        Self {
            data: vec![0; len],
            layout: NodeLayout {
                two_timestamps,
                offset_width,
            },
            next: 0,
        }
    }

    /// Reserves a node with room for `n_children` offsets and returns its
    /// offset.
    pub(crate) fn alloc_node(&mut self, method_id: MethodId, n_calls: u32, n_children: usize) -> usize {
        let offset = self.next;
        let n_children = u16::try_from(n_children).unwrap_or(u16::MAX);
        let header = self.layout.header_size();
        let end = offset + header + usize::from(n_children) * self.layout.offset_width;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        BigEndian::write_u16(&mut self.data[offset + OFF_METHOD_ID..], method_id);
        BigEndian::write_u32(&mut self.data[offset + OFF_N_CALLS..], n_calls);
        BigEndian::write_u16(
            &mut self.data[offset + self.layout.n_children_at()..],
            n_children,
        );
        self.next = end;
        offset
    }

    pub(crate) fn set_times(&mut self, offset: usize, total: [u64; 2], self_time: [u64; 2]) {
        let mut put = |field: usize, value: u64| {
            BigEndian::write_uint(
                &mut self.data[offset + field..],
                value.min(MAX_TIME),
                TIME_BYTES,
            );
        };
        put(OFF_TOTAL_0, total[0]);
        put(OFF_SELF_0, self_time[0]);
        if self.layout.two_timestamps {
            put(OFF_TOTAL_1, total[1]);
            put(OFF_SELF_1, self_time[1]);
        }
    }

    pub(crate) fn set_child(&mut self, parent: usize, index: usize, child: usize) {
        let width = self.layout.offset_width;
        let slot = parent + self.layout.header_size() + index * width;
        BigEndian::write_uint(&mut self.data[slot..], child as u64, width);
    }

    pub(crate) fn finish(mut self) -> CompactTree {
        self.data.truncate(self.next);
        debug_assert_eq!(
            NodeLayout::for_len(self.layout.two_timestamps, self.data.len()),
            self.layout
        );
        CompactTree {
            data: self.data,
            layout: self.layout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_children_past_the_limit_are_dropped() {
        let leaves = (0..=MAX_CHILDREN).map(|i| OwnedNode::new((i % 7) as MethodId, 1, 1, 1)).collect();
        let root = OwnedNode::new(0, 1, 0, 70_000).with_children(leaves);
        let tree = CompactTree::from_owned(&root, false);
        assert_eq!(tree.n_children(tree.root()), MAX_CHILDREN);
        assert_eq!(tree.node_count(), MAX_CHILDREN + 1);
        assert_eq!(tree.total_time(tree.root(), TimeStream::Absolute), 70_000);
    }

    fn sample() -> OwnedNode {
        OwnedNode::new(0, 1, 0, 210).with_children(vec![
            OwnedNode::new(1, 1, 10, 210).with_children(vec![OwnedNode::new(2, 2, 200, 200)]),
        ])
    }

    #[test]
    fn layout_sizes() {
        assert_eq!(header_size(false), 18);
        assert_eq!(header_size(true), 28);
        let tree = CompactTree::from_owned(&sample(), false);
        assert_eq!(tree.byte_len(), 3 * 18 + 2 * 3);
        assert_eq!(tree.offset_width(), 3);
        assert_eq!(tree.node_size(), 18);
    }

    #[test]
    fn fields_read_back() {
        let tree = CompactTree::from_owned(&sample(), false);
        let root = tree.root();
        assert_eq!(tree.method_id(root), 0);
        assert_eq!(tree.n_children(root), 1);
        let a = tree.child(root, 0).unwrap();
        assert!(a > root);
        assert_eq!(tree.method_id(a), 1);
        assert_eq!(tree.total_time(a, TimeStream::Absolute), 210);
        assert_eq!(tree.self_time(a, TimeStream::Absolute), 10);
        assert_eq!(tree.total_time(a, TimeStream::ThreadCpu), 0);
        let b = tree.child(a, 0).unwrap();
        assert_eq!(tree.n_calls(b), 2);
        assert_eq!(tree.child(b, 0), None);
        assert_eq!(tree.node_count(), 3);
    }

    #[test]
    fn raw_bytes_are_big_endian() {
        let tree = CompactTree::from_owned(&sample(), false);
        let bytes = tree.as_bytes();
        // thread node: id 0, one call, one child at offset 21
        assert_eq!(&bytes[0..6], &[0, 0, 0, 0, 0, 1]);
        assert_eq!(&bytes[16..21], &[0, 1, 0, 0, 21]);
    }

    #[test]
    fn two_timestamp_round_trip() {
        let mut root = sample();
        root.children[0].total_time[1] = 99;
        root.children[0].self_time[1] = 9;
        let tree = CompactTree::from_owned(&root, true);
        assert_eq!(tree.node_size(), 28);
        assert_eq!(tree.to_owned_tree(), root);
    }

    #[test]
    fn times_are_clamped_to_field_width() {
        let root = OwnedNode::new(0, 1, 0, u64::MAX);
        let tree = CompactTree::from_owned(&root, false);
        assert_eq!(tree.total_time(tree.root(), TimeStream::Absolute), MAX_TIME);
    }

    #[test]
    fn from_bytes_validates() {
        let tree = CompactTree::from_owned(&sample(), false);
        let bytes = tree.as_bytes().to_vec();
        assert_eq!(
            CompactTree::from_bytes(bytes.clone(), false).unwrap(),
            tree
        );
        assert_eq!(
            CompactTree::from_bytes(Vec::new(), false),
            Err(CompactError::Empty)
        );
        assert!(matches!(
            CompactTree::from_bytes(bytes[..30].to_vec(), false),
            Err(CompactError::Truncated { .. })
        ));
        let mut trailing = bytes.clone();
        trailing.push(0);
        assert_eq!(
            CompactTree::from_bytes(trailing, false),
            Err(CompactError::TrailingBytes(1))
        );
        let mut backwards = bytes;
        backwards[20] = 0;
        assert!(matches!(
            CompactTree::from_bytes(backwards, false),
            Err(CompactError::NotPreOrder { .. })
        ));
    }

    #[test]
    fn wide_containers_use_four_byte_offsets() {
        let writer = CompactWriter::new(1_000_000, false);
        assert_eq!(writer.layout.offset_width, 4);
        let writer = CompactWriter::new(1000, false);
        assert_eq!(writer.layout.offset_width, 3);
    }
}
