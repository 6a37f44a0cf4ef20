//! Differences between two snapshots, always second minus first.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use callprof_protocol::{MethodId, MethodName, SharedStr, THREAD_METHOD_ID};
use parking_lot::RwLock;
use serde::Serialize;

use super::flat::FlatProfile;
use crate::compact::{CompactTree, OwnedNode};
use crate::context::SessionContext;
use crate::error::ProfilerError;
use crate::model::{CpuSnapshot, ThreadSelector, ViewKind};
use crate::presentation::{
    FilterConfig, NodeKind, NodeValues, PresentationNode, PresentationTree, SortConfig, TreeNode,
    sort_nodes,
};

/// Method id in the combined id space of a diff: positive ids resolve in the
/// first snapshot, negative ids (negated) in the second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DiffMethodId(pub i32);

impl DiffMethodId {
    pub fn first(id: MethodId) -> Self {
        Self(i32::from(id))
    }

    pub fn second(id: MethodId) -> Self {
        Self(-i32::from(id))
    }

    pub fn in_first(self) -> bool {
        self.0 >= 0
    }

    /// The id in whichever snapshot it belongs to.
    pub fn raw(self) -> MethodId {
        MethodId::try_from(self.0.unsigned_abs()).unwrap_or(THREAD_METHOD_ID)
    }
}

/// Pairs two snapshots for comparison.
#[derive(Debug, Clone)]
pub struct SnapshotDiff {
    first: Arc<CpuSnapshot>,
    second: Arc<CpuSnapshot>,
}

impl SnapshotDiff {
    pub fn new(first: Arc<CpuSnapshot>, second: Arc<CpuSnapshot>) -> Self {
        Self { first, second }
    }

    pub fn first(&self) -> &Arc<CpuSnapshot> {
        &self.first
    }

    pub fn second(&self) -> &Arc<CpuSnapshot> {
        &self.second
    }

    pub fn resolve(&self, view: ViewKind, id: DiffMethodId) -> Option<MethodName> {
        let snapshot = if id.in_first() { &self.first } else { &self.second };
        snapshot.names(view).get(id.raw()).cloned()
    }

    /// A thread id must exist in at least one snapshot; the other side then
    /// reads as an empty tree.
    fn check_selector(&self, selector: ThreadSelector) -> Result<(), ProfilerError> {
        if let ThreadSelector::Thread(id) = selector {
            if self.first.thread(id).is_none() && self.second.thread(id).is_none() {
                return Err(ProfilerError::UnknownThread(id));
            }
        }
        Ok(())
    }

    /// Tree difference of the two snapshots' presentation roots.
    pub fn tree(
        &self,
        view: ViewKind,
        selector: ThreadSelector,
        sort: SortConfig,
        filter: FilterConfig,
    ) -> Result<Arc<DiffNode>, ProfilerError> {
        self.check_selector(selector)?;
        let root_name = match selector {
            ThreadSelector::Thread(id) if self.second.thread(id).is_none() => {
                self.first.root_name(selector)
            }
            _ => self.second.root_name(selector),
        };
        let left = PresentationTree::with_filter(
            side_trees(&self.first, view, selector)?,
            self.first.names(view),
            root_name.clone(),
            sort,
            filter.clone(),
        )?
        .root();
        let right = PresentationTree::with_filter(
            side_trees(&self.second, view, selector)?,
            self.second.names(view),
            root_name,
            sort,
            filter,
        )?
        .root();
        Ok(DiffNode::root(left, right, sort))
    }

    pub fn flat(
        &self,
        view: ViewKind,
        selector: ThreadSelector,
        ctx: &SessionContext,
    ) -> Result<FlatDiff, ProfilerError> {
        self.check_selector(selector)?;
        let left = FlatProfile::build(
            &side_trees(&self.first, view, selector)?,
            self.first.names(view),
            ctx,
        );
        let right = FlatProfile::build(
            &side_trees(&self.second, view, selector)?,
            self.second.names(view),
            ctx,
        );
        Ok(FlatDiff::new(&left, &right))
    }
}

/// Trees of one side. A thread this snapshot never saw is an empty tree.
fn side_trees(
    snapshot: &CpuSnapshot,
    view: ViewKind,
    selector: ThreadSelector,
) -> Result<Vec<Arc<CompactTree>>, ProfilerError> {
    match snapshot.trees(view, selector) {
        Err(ProfilerError::UnknownThread(_)) => Ok(vec![Arc::new(CompactTree::from_owned(
            &OwnedNode::default(),
            snapshot.two_timestamps(),
        ))]),
        other => other,
    }
}

/// Node of a tree difference. Stands for the same-named nodes of each side;
/// either side may be empty.
pub struct DiffNode {
    kind: NodeKind,
    name: SharedStr,
    method_id: DiffMethodId,
    left: Vec<Arc<PresentationNode>>,
    right: Vec<Arc<PresentationNode>>,
    sort: Arc<RwLock<SortConfig>>,
    children: OnceLock<Vec<Arc<DiffNode>>>,
}

impl std::fmt::Debug for DiffNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiffNode")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("method_id", &self.method_id)
            .field("left", &self.left.len())
            .field("right", &self.right.len())
            .finish_non_exhaustive()
    }
}

type Group = (SharedStr, Vec<Arc<PresentationNode>>);

/// Children of every node in `nodes`, same-named siblings collapsed.
fn grouped_children(nodes: &[Arc<PresentationNode>]) -> Vec<Group> {
    let mut index: HashMap<SharedStr, usize> = HashMap::new();
    let mut groups: Vec<Group> = Vec::new();
    for node in nodes {
        for child in node.children() {
            let name = child.name();
            match index.get(&name) {
                Some(&g) => groups[g].1.push(child),
                None => {
                    index.insert(name.clone(), groups.len());
                    groups.push((name, vec![child]));
                }
            }
        }
    }
    groups
}

impl DiffNode {
    pub fn root(left: Arc<PresentationNode>, right: Arc<PresentationNode>, sort: SortConfig) -> Arc<Self> {
        Arc::new(Self {
            kind: NodeKind::Thread,
            name: right.name(),
            method_id: DiffMethodId::first(THREAD_METHOD_ID),
            left: vec![left],
            right: vec![right],
            sort: Arc::new(RwLock::new(sort)),
            children: OnceLock::new(),
        })
    }

    fn paired(&self, name: SharedStr, left: Vec<Arc<PresentationNode>>, right: Vec<Arc<PresentationNode>>) -> Arc<Self> {
        let method_id = match (left.first(), right.first()) {
            (Some(l), _) => DiffMethodId::first(l.method_id()),
            (None, Some(r)) => DiffMethodId::second(r.method_id()),
            (None, None) => DiffMethodId::first(THREAD_METHOD_ID),
        };
        let kind = left
            .first()
            .or(right.first())
            .map_or(NodeKind::Method, |n| n.kind());
        Arc::new(Self {
            kind,
            name,
            method_id,
            left,
            right,
            sort: Arc::clone(&self.sort),
            children: OnceLock::new(),
        })
    }

    pub fn method_id(&self) -> DiffMethodId {
        self.method_id
    }

    pub fn left_values(&self) -> NodeValues {
        self.left.iter().map(|n| n.values()).sum()
    }

    pub fn right_values(&self) -> NodeValues {
        self.right.iter().map(|n| n.values()).sum()
    }

    /// True when the node exists on only one side.
    pub fn is_unmatched(&self) -> bool {
        self.left.is_empty() || self.right.is_empty()
    }

    pub fn set_sort(&self, sort: SortConfig) {
        *self.sort.write() = sort;
    }

    fn build_children(&self) -> Vec<Arc<DiffNode>> {
        let left = grouped_children(&self.left);
        let mut right = grouped_children(&self.right);
        let mut out = Vec::with_capacity(left.len().max(right.len()));
        for (name, l) in left {
            let r = match right.iter().position(|(n, _)| *n == name) {
                Some(pos) => right.remove(pos).1,
                None => Vec::new(),
            };
            out.push(self.paired(name, l, r));
        }
        for (name, r) in right {
            out.push(self.paired(name, Vec::new(), r));
        }
        out
    }
}

impl TreeNode for DiffNode {
    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn name(&self) -> SharedStr {
        self.name.clone()
    }

    fn values(&self) -> NodeValues {
        self.right_values() - self.left_values()
    }

    fn percent(&self) -> f64 {
        let right: f64 = self.right.iter().map(|n| n.percent()).sum();
        let left: f64 = self.left.iter().map(|n| n.percent()).sum();
        right - left
    }

    fn children(&self) -> Vec<Arc<Self>> {
        let mut children = self
            .children
            .get_or_init(|| self.build_children())
            .clone();
        sort_nodes(&mut children, &self.sort.read());
        children
    }
}

/// One row of a flat-profile difference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlatDiffRow {
    pub method_id: DiffMethodId,
    pub name: SharedStr,
    pub self_time: [i64; 2],
    pub total_time: [i64; 2],
    pub n_invocations: i64,
    pub percent: f64,
}

/// Rows of two flat profiles paired by method name.
#[derive(Debug, Clone, Default)]
pub struct FlatDiff {
    rows: Vec<FlatDiffRow>,
}

impl FlatDiff {
    pub fn new(left: &FlatProfile, right: &FlatProfile) -> Self {
        let signed = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);
        let mut rows = Vec::with_capacity(left.len().max(right.len()));
        let mut index: HashMap<SharedStr, usize> = HashMap::new();

        for row in left.rows() {
            index.insert(row.name.clone(), rows.len());
            rows.push(FlatDiffRow {
                method_id: DiffMethodId::first(row.method_id),
                name: row.name,
                self_time: row.self_time.map(|v| -signed(v)),
                total_time: row.total_time.map(|v| -signed(v)),
                n_invocations: -signed(row.n_invocations),
                percent: -row.percent,
            });
        }
        for row in right.rows() {
            let target = match index.get(&row.name) {
                Some(&i) => &mut rows[i],
                None => {
                    index.insert(row.name.clone(), rows.len());
                    rows.push(FlatDiffRow {
                        method_id: DiffMethodId::second(row.method_id),
                        name: row.name.clone(),
                        self_time: [0; 2],
                        total_time: [0; 2],
                        n_invocations: 0,
                        percent: 0.0,
                    });
                    let last = rows.len() - 1;
                    &mut rows[last]
                }
            };
            for i in 0..2 {
                target.self_time[i] += signed(row.self_time[i]);
                target.total_time[i] += signed(row.total_time[i]);
            }
            target.n_invocations += signed(row.n_invocations);
            target.percent += row.percent;
        }

        rows.sort_by(|a, b| {
            b.self_time[0]
                .abs()
                .cmp(&a.self_time[0].abs())
                .then_with(|| a.name.cmp(&b.name))
        });
        Self { rows }
    }

    pub fn rows(&self) -> &[FlatDiffRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// True when every row is all zero.
    pub fn is_zero(&self) -> bool {
        self.rows.iter().all(|r| {
            r.self_time == [0; 2] && r.total_time == [0; 2] && r.n_invocations == 0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MethodTable, ThreadData, ThreadTimes};

    fn snapshot(b_time: u64, with_c: bool) -> Arc<CpuSnapshot> {
        snapshot_on(1, b_time, with_c)
    }

    fn snapshot_on(thread: u32, b_time: u64, with_c: bool) -> Arc<CpuSnapshot> {
        let methods = MethodTable::from_methods([
            MethodName::new("app.A", "run", "()V"),
            MethodName::new("app.B", "work", "()V"),
            MethodName::new("app.C", "extra", "()V"),
        ]);
        let mut children = vec![OwnedNode::new(2, 1, b_time, b_time)];
        let mut total = 10 + b_time;
        if with_c {
            children.push(OwnedNode::new(3, 1, 5, 5));
            total += 5;
        }
        let root = OwnedNode::new(0, 1, 0, total)
            .with_children(vec![OwnedNode::new(1, 1, 10, total).with_children(children)]);
        Arc::new(CpuSnapshot::new(
            0,
            100,
            false,
            methods,
            vec![ThreadData::new(
                thread,
                "main",
                CompactTree::from_owned(&root, false),
                ThreadTimes::default(),
            )],
        ))
    }

    fn assert_all_zero(node: &Arc<DiffNode>) {
        assert_eq!(node.values(), NodeValues::default(), "{}", node.name());
        assert_eq!(node.percent(), 0.0);
        for child in node.children() {
            assert_all_zero(&child);
        }
    }

    #[test]
    fn signed_ids() {
        assert_eq!(DiffMethodId::first(4).0, 4);
        assert_eq!(DiffMethodId::second(4).0, -4);
        assert_eq!(DiffMethodId::second(4).raw(), 4);
        assert!(!DiffMethodId::second(4).in_first());
    }

    #[test]
    fn identical_snapshots_diff_to_zero() {
        let s = snapshot(40, true);
        let diff = SnapshotDiff::new(Arc::clone(&s), s);
        let root = diff
            .tree(ViewKind::Method, ThreadSelector::Thread(1), SortConfig::default(), FilterConfig::default())
            .unwrap();
        assert_all_zero(&root);
        let flat = diff
            .flat(ViewKind::Method, ThreadSelector::All, &SessionContext::new())
            .unwrap();
        assert!(flat.is_zero());
        assert_eq!(flat.len(), 3);
    }

    #[test]
    fn values_are_second_minus_first() {
        let diff = SnapshotDiff::new(snapshot(40, false), snapshot(70, true));
        let root = diff
            .tree(ViewKind::Method, ThreadSelector::Thread(1), SortConfig::default(), FilterConfig::default())
            .unwrap();
        assert_eq!(root.values().total_time[0], 35);

        let run = &root.children()[0];
        let children = run.children();
        let work = children.iter().find(|c| c.name() == "app.B.work").unwrap();
        assert_eq!(work.values().total_time[0], 30);
        assert!(!work.is_unmatched());

        let extra = children.iter().find(|c| c.name() == "app.C.extra").unwrap();
        assert!(extra.is_unmatched());
        assert_eq!(extra.values().total_time[0], 5);
        assert_eq!(extra.method_id(), DiffMethodId::second(3));
        assert_eq!(
            diff.resolve(ViewKind::Method, extra.method_id()).unwrap().method,
            "extra"
        );
    }

    #[test]
    fn percent_delta_is_difference_of_percents() {
        let diff = SnapshotDiff::new(snapshot(40, false), snapshot(70, true));
        let root = diff
            .tree(ViewKind::Method, ThreadSelector::Thread(1), SortConfig::default(), FilterConfig::default())
            .unwrap();
        let run = &root.children()[0];
        let work = run
            .children()
            .into_iter()
            .find(|c| c.name() == "app.B.work")
            .unwrap();
        let expected = 70.0 * 100.0 / 85.0 - 40.0 * 100.0 / 50.0;
        assert!((work.percent() - expected).abs() < 1e-9);
    }

    #[test]
    fn flat_rows_pair_by_name() {
        let diff = SnapshotDiff::new(snapshot(40, false), snapshot(70, true));
        let flat = diff
            .flat(ViewKind::Method, ThreadSelector::Thread(1), &SessionContext::new())
            .unwrap();
        let work = flat.rows().iter().find(|r| r.name == "app.B.work").unwrap();
        assert_eq!(work.self_time[0], 30);
        assert_eq!(work.method_id, DiffMethodId::first(2));
        let extra = flat.rows().iter().find(|r| r.name == "app.C.extra").unwrap();
        assert_eq!(extra.method_id, DiffMethodId::second(3));
        assert_eq!(extra.n_invocations, 1);
        assert_eq!(flat.rows()[0].name, "app.B.work");
    }

    #[test]
    fn thread_on_one_side_diffs_against_nothing() {
        let diff = SnapshotDiff::new(snapshot_on(1, 40, false), snapshot_on(2, 70, true));
        let root = diff
            .tree(ViewKind::Method, ThreadSelector::Thread(2), SortConfig::default(), FilterConfig::default())
            .unwrap();
        assert_eq!(root.name(), "main");
        assert_eq!(root.values().total_time[0], 85);
        let run = &root.children()[0];
        assert!(run.is_unmatched());
        assert_eq!(run.method_id(), DiffMethodId::second(1));

        let gone = diff
            .tree(ViewKind::Method, ThreadSelector::Thread(1), SortConfig::default(), FilterConfig::default())
            .unwrap();
        assert_eq!(gone.values().total_time[0], -50);

        let flat = diff
            .flat(ViewKind::Class, ThreadSelector::Thread(1), &SessionContext::new())
            .unwrap();
        let b = flat.rows().iter().find(|r| r.name == "app.B").unwrap();
        assert_eq!(b.self_time[0], -40);

        assert!(matches!(
            diff.tree(ViewKind::Method, ThreadSelector::Thread(3), SortConfig::default(), FilterConfig::default()),
            Err(ProfilerError::UnknownThread(3))
        ));
    }
}
