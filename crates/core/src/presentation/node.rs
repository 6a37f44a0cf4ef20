use std::collections::HashMap;
use std::ops::{Add, AddAssign, Sub};
use std::sync::{Arc, OnceLock};

use callprof_protocol::{MethodId, SharedStr, THREAD_METHOD_ID};
use parking_lot::RwLock;
use serde::Serialize;

use super::filter::NameFilter;
use super::sort::SortConfig;
use crate::compact::{CompactTree, NodeRef};
use crate::model::MethodTable;
use crate::timing::TimeStream;

pub const SELF_TIME_NAME: &str = "Self time";
pub const FILTERED_NAME: &str = "<filtered>";
pub const CONTEXT_CALLS_NAME: &str = "<context calls>";

/// What a node stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NodeKind {
    Method,
    /// Root of a thread, or of several threads merged together.
    Thread,
    /// Leaf holding a method's own time next to its callees.
    SelfTime,
    /// Everything the active filter hid at one level.
    Filtered,
    /// Share of a reverse-tree node not explained by deeper callers.
    ContextCalls,
}

/// Scalar values of a node. Signed so that differences use the same type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeValues {
    pub n_calls: i64,
    pub total_time: [i64; 2],
    pub self_time: [i64; 2],
}

impl NodeValues {
    pub(crate) fn of(tree: &CompactTree, node: NodeRef) -> Self {
        let time = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);
        Self {
            n_calls: i64::from(tree.n_calls(node)),
            total_time: [
                time(tree.total_time(node, TimeStream::Absolute)),
                time(tree.total_time(node, TimeStream::ThreadCpu)),
            ],
            self_time: [
                time(tree.self_time(node, TimeStream::Absolute)),
                time(tree.self_time(node, TimeStream::ThreadCpu)),
            ],
        }
    }

    pub fn total(&self, stream: TimeStream) -> i64 {
        self.total_time[stream.index()]
    }

    pub fn self_of(&self, stream: TimeStream) -> i64 {
        self.self_time[stream.index()]
    }
}

impl Add for NodeValues {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            n_calls: self.n_calls + rhs.n_calls,
            total_time: [
                self.total_time[0] + rhs.total_time[0],
                self.total_time[1] + rhs.total_time[1],
            ],
            self_time: [
                self.self_time[0] + rhs.self_time[0],
                self.self_time[1] + rhs.self_time[1],
            ],
        }
    }
}

impl AddAssign for NodeValues {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for NodeValues {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self {
            n_calls: self.n_calls - rhs.n_calls,
            total_time: [
                self.total_time[0] - rhs.total_time[0],
                self.total_time[1] - rhs.total_time[1],
            ],
            self_time: [
                self.self_time[0] - rhs.self_time[0],
                self.self_time[1] - rhs.self_time[1],
            ],
        }
    }
}

impl std::iter::Sum for NodeValues {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

/// Capabilities shared by every node representation: presentation, reverse
/// and diff nodes.
pub trait TreeNode: Sized {
    fn kind(&self) -> NodeKind;
    fn name(&self) -> SharedStr;
    fn values(&self) -> NodeValues;
    /// Share of the root's absolute total time, in percent.
    fn percent(&self) -> f64;
    /// Children in the current sort order.
    fn children(&self) -> Vec<Arc<Self>>;
}

pub(crate) fn percent_of(part: i64, whole: i64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

pub(crate) fn sort_nodes<N: TreeNode>(nodes: &mut [Arc<N>], sort: &SortConfig) {
    nodes.sort_by(|a, b| {
        sort.compare(
            (a.name().as_str(), &a.values()),
            (b.name().as_str(), &b.values()),
        )
    });
}

/// Everything the nodes of one logical root share.
pub(crate) struct TreeContext {
    pub(crate) trees: Vec<Arc<CompactTree>>,
    pub(crate) names: Arc<MethodTable>,
    pub(crate) filter: NameFilter,
    pub(crate) sort: Arc<RwLock<SortConfig>>,
    pub(crate) root_total: i64,
}

/// Lazily expanded view over one or more compact nodes.
///
/// Nodes that share a name under the same parent are merged, so one
/// presentation node may stand for several compact nodes, possibly in
/// different threads' trees.
pub struct PresentationNode {
    kind: NodeKind,
    method_id: MethodId,
    name: SharedStr,
    values: NodeValues,
    refs: Vec<(usize, NodeRef)>,
    ctx: Arc<TreeContext>,
    children: OnceLock<Vec<Arc<PresentationNode>>>,
}

impl std::fmt::Debug for PresentationNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresentationNode")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("values", &self.values)
            .field("refs", &self.refs.len())
            .finish_non_exhaustive()
    }
}

impl PresentationNode {
    pub(crate) fn thread_root(ctx: Arc<TreeContext>, name: SharedStr) -> Arc<Self> {
        let refs: Vec<_> = ctx
            .trees
            .iter()
            .enumerate()
            .map(|(i, t)| (i, t.root()))
            .collect();
        Arc::new(Self::backed(NodeKind::Thread, THREAD_METHOD_ID, name, refs, ctx))
    }

    fn backed(
        kind: NodeKind,
        method_id: MethodId,
        name: SharedStr,
        refs: Vec<(usize, NodeRef)>,
        ctx: Arc<TreeContext>,
    ) -> Self {
        let values = refs
            .iter()
            .map(|&(t, r)| NodeValues::of(&ctx.trees[t], r))
            .sum();
        Self {
            kind,
            method_id,
            name,
            values,
            refs,
            ctx,
            children: OnceLock::new(),
        }
    }

    fn synthetic(kind: NodeKind, method_id: MethodId, name: &str, values: NodeValues, ctx: Arc<TreeContext>) -> Self {
        Self {
            kind,
            method_id,
            name: name.into(),
            values,
            refs: Vec::new(),
            ctx,
            children: OnceLock::new(),
        }
    }

    /// Method id of the node; the thread id slot (0) for thread and
    /// filtered nodes.
    pub fn method_id(&self) -> MethodId {
        self.method_id
    }

    /// Number of compact nodes merged into this one.
    pub fn source_count(&self) -> usize {
        self.refs.len()
    }

    /// Children in first-seen order, before sorting.
    fn raw_children(&self) -> &[Arc<PresentationNode>] {
        self.children.get_or_init(|| self.build_children())
    }

    fn build_children(&self) -> Vec<Arc<PresentationNode>> {
        if matches!(self.kind, NodeKind::SelfTime | NodeKind::ContextCalls) {
            return Vec::new();
        }
        let ctx = &self.ctx;

        let mut index: HashMap<SharedStr, usize> = HashMap::new();
        let mut groups: Vec<(SharedStr, MethodId, Vec<(usize, NodeRef)>)> = Vec::new();
        for &(t, node) in &self.refs {
            let tree = &ctx.trees[t];
            for child in tree.children(node) {
                let id = tree.method_id(child);
                let name = ctx.names.display_name(id);
                match index.get(&name) {
                    Some(&g) => groups[g].2.push((t, child)),
                    None => {
                        index.insert(name.clone(), groups.len());
                        groups.push((name, id, vec![(t, child)]));
                    }
                }
            }
        }

        let mut out = Vec::with_capacity(groups.len() + 1);
        let mut hidden = Vec::new();
        for (name, id, refs) in groups {
            if ctx.filter.matches(name.as_str()) {
                out.push(Arc::new(Self::backed(
                    NodeKind::Method,
                    id,
                    name,
                    refs,
                    Arc::clone(ctx),
                )));
            } else {
                hidden.extend(refs);
            }
        }
        if !hidden.is_empty() {
            out.push(Arc::new(Self::backed(
                NodeKind::Filtered,
                THREAD_METHOD_ID,
                FILTERED_NAME.into(),
                hidden,
                Arc::clone(ctx),
            )));
        }

        if self.kind == NodeKind::Filtered {
            if let [only] = out.as_slice() {
                if only.kind == NodeKind::Filtered {
                    return only.raw_children().to_vec();
                }
            }
        }

        if self.kind == NodeKind::Method && self.refs.len() == 1 && !out.is_empty() {
            let own = NodeValues {
                n_calls: self.values.n_calls,
                total_time: self.values.self_time,
                self_time: self.values.self_time,
            };
            out.push(Arc::new(Self::synthetic(
                NodeKind::SelfTime,
                self.method_id,
                SELF_TIME_NAME,
                own,
                Arc::clone(ctx),
            )));
        }
        out
    }
}

impl TreeNode for PresentationNode {
    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn name(&self) -> SharedStr {
        self.name.clone()
    }

    fn values(&self) -> NodeValues {
        self.values
    }

    fn percent(&self) -> f64 {
        percent_of(self.values.total_time[0], self.ctx.root_total)
    }

    fn children(&self) -> Vec<Arc<Self>> {
        let mut children = self.raw_children().to_vec();
        sort_nodes(&mut children, &self.ctx.sort.read());
        children
    }
}
