//! "Callers of M" trees.
//!
//! One depth-first pass over each compact tree finds every occurrence of the
//! target method and folds its caller chain, innermost caller first, into a
//! free-form tree. Chains stop below the thread node.

use std::collections::HashMap;
use std::sync::Arc;

use callprof_protocol::{MethodId, SharedStr, THREAD_METHOD_ID};
use parking_lot::RwLock;

use crate::compact::{CompactTree, NodeRef};
use crate::model::MethodTable;
use crate::presentation::{
    CONTEXT_CALLS_NAME, NodeKind, NodeValues, SortConfig, TreeNode, percent_of, sort_nodes,
};

struct Draft {
    method_id: MethodId,
    values: NodeValues,
    /// Share of `values` whose caller chain ends at this node.
    terminal: NodeValues,
    children: Vec<usize>,
    index: HashMap<MethodId, usize>,
    context_calls: bool,
}

impl Draft {
    fn new(method_id: MethodId) -> Self {
        Self {
            context_calls: false,
            method_id,
            values: NodeValues::default(),
            terminal: NodeValues::default(),
            children: Vec::new(),
            index: HashMap::new(),
        }
    }
}

struct Shared {
    sort: RwLock<SortConfig>,
    root_total: i64,
}

/// Node of a reverse tree. Children are the callers of the parent.
pub struct ReverseNode {
    kind: NodeKind,
    method_id: MethodId,
    name: SharedStr,
    values: NodeValues,
    children: Vec<Arc<ReverseNode>>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ReverseNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReverseNode")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("values", &self.values)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

impl ReverseNode {
    pub fn method_id(&self) -> MethodId {
        self.method_id
    }
}

impl TreeNode for ReverseNode {
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
        percent_of(self.values.total_time[0], self.shared.root_total)
    }

    fn children(&self) -> Vec<Arc<Self>> {
        let mut children = self.children.clone();
        sort_nodes(&mut children, &self.shared.sort.read());
        children
    }
}

/// Reverse tree for one target method.
#[derive(Debug)]
pub struct ReverseTree {
    root: Arc<ReverseNode>,
    occurrences: u64,
}

impl ReverseTree {
    pub fn build(
        trees: &[Arc<CompactTree>],
        names: &MethodTable,
        target: MethodId,
        sort: SortConfig,
    ) -> Self {
        let mut drafts = vec![Draft::new(target)];
        let mut occurrences = 0;
        for tree in trees {
            occurrences += collect(tree, target, &mut drafts);
        }
        add_context_calls(&mut drafts);

        let shared = Arc::new(Shared {
            sort: RwLock::new(sort),
            root_total: drafts[0].values.total_time[0],
        });
        let root = freeze(drafts, names, &shared);
        Self { root, occurrences }
    }

    pub fn root(&self) -> Arc<ReverseNode> {
        Arc::clone(&self.root)
    }

    /// How many nodes of the forward trees were the target method.
    pub fn occurrences(&self) -> u64 {
        self.occurrences
    }

    pub fn set_sort(&self, sort: SortConfig) {
        *self.root.shared.sort.write() = sort;
    }
}

fn child_of(drafts: &mut Vec<Draft>, parent: usize, method_id: MethodId) -> usize {
    if let Some(&idx) = drafts[parent].index.get(&method_id) {
        return idx;
    }
    let idx = drafts.len();
    drafts.push(Draft::new(method_id));
    drafts[parent].children.push(idx);
    drafts[parent].index.insert(method_id, idx);
    idx
}

/// Walks one tree and folds every occurrence of `target` into `drafts`.
fn collect(tree: &CompactTree, target: MethodId, drafts: &mut Vec<Draft>) -> u64 {
    let mut occurrences = 0;
    // (node, depth) pending visits, and the current path from the root.
    let mut pending = vec![(tree.root(), 0usize)];
    let mut path: Vec<NodeRef> = Vec::new();
    let mut target_on_path = 0usize;

    while let Some((node, depth)) = pending.pop() {
        while path.len() > depth {
            if let Some(left) = path.pop() {
                if tree.method_id(left) == target {
                    target_on_path -= 1;
                }
            }
        }

        let id = tree.method_id(node);
        if id == target && id != THREAD_METHOD_ID {
            occurrences += 1;
            let mut values = NodeValues::of(tree, node);
            if target_on_path > 0 {
                // Time of nested activations is already inside the outer one.
                values = NodeValues {
                    n_calls: values.n_calls,
                    ..NodeValues::default()
                };
            }
            drafts[0].values += values;
            let mut current = 0;
            for &caller in path.iter().rev() {
                let caller_id = tree.method_id(caller);
                if caller_id == THREAD_METHOD_ID {
                    break;
                }
                current = child_of(drafts, current, caller_id);
                drafts[current].values += values;
            }
            drafts[current].terminal += values;
        }

        if id == target {
            target_on_path += 1;
        }
        path.push(node);
        let children: Vec<_> = tree.children(node).collect();
        pending.extend(children.into_iter().rev().map(|c| (c, depth + 1)));
    }
    occurrences
}

/// Gives every node that both has callers and ends some chains a synthetic
/// child holding the ending share, so children always sum to their parent.
fn add_context_calls(drafts: &mut Vec<Draft>) {
    for idx in 0..drafts.len() {
        let terminal = drafts[idx].terminal;
        if drafts[idx].children.is_empty() || terminal == NodeValues::default() {
            continue;
        }
        let synthetic = drafts.len();
        let mut draft = Draft::new(drafts[idx].method_id);
        draft.values = terminal;
        draft.terminal = terminal;
        draft.context_calls = true;
        drafts.push(draft);
        drafts[idx].children.push(synthetic);
    }
}

/// Children always have larger indices than their parent, so building from
/// the back sees every child before its parent.
fn freeze(drafts: Vec<Draft>, names: &MethodTable, shared: &Arc<Shared>) -> Arc<ReverseNode> {
    let mut built: Vec<Option<Arc<ReverseNode>>> = vec![None; drafts.len()];
    for (idx, draft) in drafts.into_iter().enumerate().rev() {
        let (kind, name) = if draft.context_calls {
            (NodeKind::ContextCalls, SharedStr::from(CONTEXT_CALLS_NAME))
        } else {
            (NodeKind::Method, names.display_name(draft.method_id))
        };
        let children = draft
            .children
            .iter()
            .filter_map(|&c| built[c].take())
            .collect();
        built[idx] = Some(Arc::new(ReverseNode {
            kind,
            method_id: draft.method_id,
            name,
            values: draft.values,
            children,
            shared: Arc::clone(shared),
        }));
    }
    built
        .into_iter()
        .next()
        .flatten()
        .unwrap_or_else(|| {
            Arc::new(ReverseNode {
                kind: NodeKind::Method,
                method_id: THREAD_METHOD_ID,
                name: SharedStr::default(),
                values: NodeValues::default(),
                children: Vec::new(),
                shared: Arc::clone(shared),
            })
        })
}
