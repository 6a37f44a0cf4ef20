use callprof_protocol::{MethodId, THREAD_METHOD_ID};

/// Index of a node inside its [`CallTree`] arena.
pub type NodeIdx = usize;

/// Whether a node's method passed the instrumentation filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    Passed,
    /// Folded into the caller when the tree is encoded.
    Filtered,
}

/// Mutable calling-context node, accumulated while events stream in.
///
/// Times are raw timer counts, indexed by stream (absolute, thread-CPU).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InProgressNode {
    pub method_id: MethodId,
    pub n_calls: u64,
    pub net_time: [u64; 2],
    pub wait_time: [u64; 2],
    pub sleep_time: [u64; 2],
    pub status: FilterStatus,
    pub children: Vec<NodeIdx>,
}

impl InProgressNode {
    fn new(method_id: MethodId, status: FilterStatus) -> Self {
        Self {
            method_id,
            n_calls: 0,
            net_time: [0; 2],
            wait_time: [0; 2],
            sleep_time: [0; 2],
            status,
            children: Vec::new(),
        }
    }

    fn absorb_times(&mut self, other: &InProgressNode) {
        for i in 0..2 {
            self.net_time[i] += other.net_time[i];
            self.wait_time[i] += other.wait_time[i];
            self.sleep_time[i] += other.sleep_time[i];
        }
    }
}

/// Per-thread calling-context tree under construction.
///
/// Nodes live in an arena owned by the tree; parents refer to children by
/// index. Index 0 is the synthetic thread node. Children at one call site are
/// unique per method id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTree {
    nodes: Vec<InProgressNode>,
    filtered: usize,
}

impl CallTree {
    pub const ROOT: NodeIdx = 0;

    pub fn new() -> Self {
        Self {
            nodes: vec![InProgressNode::new(THREAD_METHOD_ID, FilterStatus::Passed)],
            filtered: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True until the first method node is attached.
    pub fn is_empty(&self) -> bool {
        self.nodes[Self::ROOT].children.is_empty()
    }

    pub fn node(&self, idx: NodeIdx) -> &InProgressNode {
        &self.nodes[idx]
    }

    pub fn node_mut(&mut self, idx: NodeIdx) -> &mut InProgressNode {
        &mut self.nodes[idx]
    }

    pub fn has_filtered(&self) -> bool {
        self.filtered > 0
    }

    pub fn find_child(&self, parent: NodeIdx, method: MethodId) -> Option<NodeIdx> {
        self.nodes[parent]
            .children
            .iter()
            .copied()
            .find(|&c| self.nodes[c].method_id == method)
    }

    /// Returns the `method` child of `parent`, creating it if needed, and
    /// counts one more call on it.
    pub fn enter_child(&mut self, parent: NodeIdx, method: MethodId, status: FilterStatus) -> NodeIdx {
        let idx = match self.find_child(parent, method) {
            Some(idx) => idx,
            None => {
                let idx = self.nodes.len();
                self.nodes.push(InProgressNode::new(method, status));
                self.nodes[parent].children.push(idx);
                if status == FilterStatus::Filtered {
                    self.filtered += 1;
                }
                idx
            }
        };
        self.nodes[idx].n_calls += 1;
        idx
    }

    /// Copy of the tree in which every filtered node has been merged into its
    /// nearest passing ancestor: its times become the ancestor's, and its
    /// children are re-parented (and merged by method id) there.
    pub fn folded(&self) -> CallTree {
        let mut out = CallTree::new();
        out.nodes[Self::ROOT].absorb_times(&self.nodes[Self::ROOT]);
        out.nodes[Self::ROOT].n_calls = self.nodes[Self::ROOT].n_calls;
        self.fold_children(Self::ROOT, &mut out, Self::ROOT);
        out
    }

    fn fold_children(&self, src: NodeIdx, out: &mut CallTree, dst: NodeIdx) {
        for &child in &self.nodes[src].children {
            let node = &self.nodes[child];
            if node.status == FilterStatus::Filtered {
                out.nodes[dst].absorb_times(node);
                self.fold_children(child, out, dst);
            } else {
                let target = match out.find_child(dst, node.method_id) {
                    Some(idx) => idx,
                    None => {
                        let idx = out.nodes.len();
                        out.nodes
                            .push(InProgressNode::new(node.method_id, FilterStatus::Passed));
                        out.nodes[dst].children.push(idx);
                        idx
                    }
                };
                out.nodes[target].n_calls += node.n_calls;
                out.nodes[target].absorb_times(node);
                self.fold_children(child, out, target);
            }
        }
    }
}

impl Default for CallTree {
    fn default() -> Self {
        Self::new()
    }
}
