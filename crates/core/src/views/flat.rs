use std::sync::Arc;

use callprof_protocol::{MethodId, SharedStr, THREAD_METHOD_ID};
use serde::Serialize;
use tracing::warn;

use crate::compact::{CompactTree, NodeRef};
use crate::context::SessionContext;
use crate::model::MethodTable;
use crate::presentation::{SortConfig, SortKey};
use crate::timing::TimeStream;

/// A single row of the flat profile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlatRow {
    pub method_id: MethodId,
    pub name: SharedStr,
    pub self_time: [u64; 2],
    pub total_time: [u64; 2],
    pub n_invocations: u64,
    /// Self time as a share of the whole-graph net time.
    pub percent: f64,
}

/// Per-method totals, ignoring calling context.
///
/// Accrued into dense arrays indexed by method id, then compacted to the
/// methods that were invoked at all. Rows are addressed through a sort
/// permutation over the compacted arrays.
#[derive(Debug, Clone)]
pub struct FlatProfile {
    names: Arc<MethodTable>,
    method_ids: Vec<MethodId>,
    self_time: [Vec<u64>; 2],
    total_time: [Vec<u64>; 2],
    n_invocations: Vec<u64>,
    order: Vec<usize>,
    whole_graph_net_time: [u64; 2],
    two_timestamps: bool,
}

enum Visit {
    Enter(NodeRef),
    Leave(usize),
}

struct Accrual {
    self_time: [Vec<u64>; 2],
    total_time: [Vec<u64>; 2],
    n_invocations: Vec<u64>,
    on_path: Vec<u32>,
    bounds_errors: u64,
}

impl Accrual {
    fn new(len: usize) -> Self {
        Self {
            self_time: [vec![0; len], vec![0; len]],
            total_time: [vec![0; len], vec![0; len]],
            n_invocations: vec![0; len],
            on_path: vec![0; len],
            bounds_errors: 0,
        }
    }

    /// Depth-first walk of one tree. Total time is only taken from the
    /// outermost activation of a method on any path.
    fn walk(&mut self, tree: &CompactTree) {
        let len = self.n_invocations.len();
        let mut stack = vec![Visit::Enter(tree.root())];
        while let Some(visit) = stack.pop() {
            let node = match visit {
                Visit::Leave(idx) => {
                    self.on_path[idx] -= 1;
                    continue;
                }
                Visit::Enter(node) => node,
            };
            let id = tree.method_id(node);
            let idx = usize::from(id);
            if id != THREAD_METHOD_ID {
                if idx >= len {
                    if self.bounds_errors == 0 {
                        warn!(method_id = id, table_len = len, "method id outside the name table");
                    }
                    self.bounds_errors += 1;
                } else {
                    for stream in TimeStream::ALL {
                        let i = stream.index();
                        self.self_time[i][idx] += tree.self_time(node, stream);
                        if self.on_path[idx] == 0 {
                            self.total_time[i][idx] += tree.total_time(node, stream);
                        }
                    }
                    self.n_invocations[idx] += u64::from(tree.n_calls(node));
                    self.on_path[idx] += 1;
                    stack.push(Visit::Leave(idx));
                }
            }
            let children: Vec<_> = tree.children(node).collect();
            stack.extend(children.into_iter().rev().map(Visit::Enter));
        }
    }
}

impl FlatProfile {
    /// Builds one profile over `trees`, summing all of them into the same
    /// rows.
    pub fn build(trees: &[Arc<CompactTree>], names: Arc<MethodTable>, ctx: &SessionContext) -> Self {
        let mut acc = Accrual::new(names.len());
        let mut whole_graph_net_time = [0u64; 2];
        for tree in trees {
            acc.walk(tree);
            for stream in TimeStream::ALL {
                whole_graph_net_time[stream.index()] += tree.total_time(tree.root(), stream);
            }
        }
        ctx.add_bounds_errors(acc.bounds_errors);

        let kept: Vec<usize> = (0..acc.n_invocations.len())
            .filter(|&i| acc.n_invocations[i] > 0)
            .collect();
        let pick = |v: &[u64]| kept.iter().map(|&i| v[i]).collect::<Vec<_>>();
        let mut profile = Self {
            method_ids: kept.iter().map(|&i| i as MethodId).collect(),
            self_time: [pick(&acc.self_time[0]), pick(&acc.self_time[1])],
            total_time: [pick(&acc.total_time[0]), pick(&acc.total_time[1])],
            n_invocations: pick(&acc.n_invocations),
            order: (0..kept.len()).collect(),
            whole_graph_net_time,
            two_timestamps: trees.iter().any(|t| t.two_timestamps()),
            names,
        };
        profile.sort(SortConfig::new(SortKey::SelfTime0, true));
        profile
    }

    pub fn len(&self) -> usize {
        self.method_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.method_ids.is_empty()
    }

    pub fn two_timestamps(&self) -> bool {
        self.two_timestamps
    }

    pub fn names(&self) -> &Arc<MethodTable> {
        &self.names
    }

    pub fn whole_graph_net_time(&self, stream: TimeStream) -> u64 {
        self.whole_graph_net_time[stream.index()]
    }

    /// Reorders rows. Ties fall back to the method name.
    pub fn sort(&mut self, sort: SortConfig) {
        let mut order = std::mem::take(&mut self.order);
        let name = |i: usize| self.names.display_name(self.method_ids[i]);
        order.sort_by(|&a, &b| {
            let primary = match sort.key {
                SortKey::Name => name(a).cmp(&name(b)),
                SortKey::TotalTime0 => self.total_time[0][a].cmp(&self.total_time[0][b]),
                SortKey::TotalTime1 => self.total_time[1][a].cmp(&self.total_time[1][b]),
                SortKey::SelfTime0 => self.self_time[0][a].cmp(&self.self_time[0][b]),
                SortKey::Calls => self.n_invocations[a].cmp(&self.n_invocations[b]),
            };
            let primary = if sort.descending {
                primary.reverse()
            } else {
                primary
            };
            primary.then_with(|| name(a).cmp(&name(b)))
        });
        self.order = order;
    }

    /// Row at position `row` of the current order.
    pub fn row(&self, row: usize) -> Option<FlatRow> {
        let i = *self.order.get(row)?;
        let method_id = self.method_ids[i];
        Some(FlatRow {
            method_id,
            name: self.names.display_name(method_id),
            self_time: [self.self_time[0][i], self.self_time[1][i]],
            total_time: [self.total_time[0][i], self.total_time[1][i]],
            n_invocations: self.n_invocations[i],
            percent: if self.whole_graph_net_time[0] == 0 {
                0.0
            } else {
                self.self_time[0][i] as f64 * 100.0 / self.whole_graph_net_time[0] as f64
            },
        })
    }

    pub fn rows(&self) -> impl Iterator<Item = FlatRow> + '_ {
        (0..self.len()).filter_map(|r| self.row(r))
    }

    /// Position of `method_id` in the current order.
    pub fn find(&self, method_id: MethodId) -> Option<usize> {
        let i = self.method_ids.binary_search(&method_id).ok()?;
        self.order.iter().position(|&o| o == i)
    }
}
