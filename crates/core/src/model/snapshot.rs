use std::sync::{Arc, OnceLock};

use callprof_protocol::{MethodId, SharedStr, ThreadId};
use serde::{Deserialize, Serialize};

use super::names::{MethodTable, OwnerMapping};
use crate::compact::CompactTree;
use crate::context::SessionContext;
use crate::error::ProfilerError;
use crate::presentation::{FilterConfig, PresentationTree, SortConfig};
use crate::views::{FlatProfile, ReverseTree, aggregate};

/// Aggregation level of a view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViewKind {
    #[default]
    Method,
    Class,
    Package,
}

/// Which threads a view covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThreadSelector {
    Thread(ThreadId),
    /// Every thread merged under one root.
    All,
}

pub const ALL_THREADS_NAME: &str = "All threads";

/// Whole-thread time totals, in microseconds, indexed by stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadTimes {
    /// Wall time spent inside root methods, as measured.
    pub gross_time: [u64; 2],
    /// Gross time with per-call instrumentation overhead removed.
    pub pure_time: [u64; 2],
    /// Sum of all cleansed self times in the thread's tree.
    pub net_time: [u64; 2],
    pub total_invocations: u64,
    pub display_whole_thread_cpu: bool,
}

/// One thread's frozen results.
#[derive(Debug)]
pub struct ThreadData {
    pub id: ThreadId,
    pub name: SharedStr,
    pub times: ThreadTimes,
    method_tree: Arc<CompactTree>,
    class_tree: OnceLock<Arc<CompactTree>>,
    package_tree: OnceLock<Arc<CompactTree>>,
}

impl ThreadData {
    pub fn new(id: ThreadId, name: impl Into<SharedStr>, tree: CompactTree, times: ThreadTimes) -> Self {
        Self {
            id,
            name: name.into(),
            times,
            method_tree: Arc::new(tree),
            class_tree: OnceLock::new(),
            package_tree: OnceLock::new(),
        }
    }

    pub fn method_tree(&self) -> &Arc<CompactTree> {
        &self.method_tree
    }
}

/// Frozen results of one profiling epoch.
///
/// Holds the method-level compact tree of every thread. Class and package
/// trees are derived from them on first use and kept.
#[derive(Debug)]
pub struct CpuSnapshot {
    begin_time: i64,
    time_taken: i64,
    two_timestamps: bool,
    methods: Arc<MethodTable>,
    threads: Vec<ThreadData>,
    class_mapping: OnceLock<OwnerMapping>,
    package_mapping: OnceLock<OwnerMapping>,
}

impl CpuSnapshot {
    pub fn new(
        begin_time: i64,
        time_taken: i64,
        two_timestamps: bool,
        methods: MethodTable,
        mut threads: Vec<ThreadData>,
    ) -> Self {
        threads.sort_by_key(|t| t.id);
        Self {
            begin_time,
            time_taken,
            two_timestamps,
            methods: Arc::new(methods),
            threads,
            class_mapping: OnceLock::new(),
            package_mapping: OnceLock::new(),
        }
    }

    /// Start of the epoch, milliseconds since the Unix epoch.
    pub fn begin_time(&self) -> i64 {
        self.begin_time
    }

    /// Length of the epoch in milliseconds.
    pub fn time_taken(&self) -> i64 {
        self.time_taken
    }

    pub fn two_timestamps(&self) -> bool {
        self.two_timestamps
    }

    pub fn methods(&self) -> &Arc<MethodTable> {
        &self.methods
    }

    pub fn threads(&self) -> &[ThreadData] {
        &self.threads
    }

    pub fn thread(&self, id: ThreadId) -> Option<&ThreadData> {
        self.threads
            .binary_search_by_key(&id, |t| t.id)
            .ok()
            .map(|i| &self.threads[i])
    }

    fn mapping(&self, view: ViewKind) -> Option<&OwnerMapping> {
        match view {
            ViewKind::Method => None,
            ViewKind::Class => Some(
                self.class_mapping
                    .get_or_init(|| OwnerMapping::by_class(&self.methods)),
            ),
            ViewKind::Package => Some(
                self.package_mapping
                    .get_or_init(|| OwnerMapping::by_package(&self.methods)),
            ),
        }
    }

    /// Name table that resolves the ids of `view`'s trees.
    pub fn names(&self, view: ViewKind) -> Arc<MethodTable> {
        match self.mapping(view) {
            Some(mapping) => Arc::clone(&mapping.names),
            None => Arc::clone(&self.methods),
        }
    }

    /// Owner id of `method` in a class or package view.
    pub fn owner_of(&self, view: ViewKind, method: MethodId) -> MethodId {
        self.mapping(view).map_or(method, |m| m.owner(method))
    }

    fn thread_tree(&self, thread: &ThreadData, view: ViewKind) -> Arc<CompactTree> {
        let cell = match view {
            ViewKind::Method => return Arc::clone(&thread.method_tree),
            ViewKind::Class => &thread.class_tree,
            ViewKind::Package => &thread.package_tree,
        };
        let tree = cell.get_or_init(|| match self.mapping(view) {
            Some(mapping) => Arc::new(aggregate(&thread.method_tree, mapping)),
            None => Arc::clone(&thread.method_tree),
        });
        Arc::clone(tree)
    }

    /// Compact trees for `view` covering `selector`.
    pub fn trees(&self, view: ViewKind, selector: ThreadSelector) -> Result<Vec<Arc<CompactTree>>, ProfilerError> {
        match selector {
            ThreadSelector::Thread(id) => {
                let thread = self.thread(id).ok_or(ProfilerError::UnknownThread(id))?;
                Ok(vec![self.thread_tree(thread, view)])
            }
            ThreadSelector::All => Ok(self
                .threads
                .iter()
                .map(|t| self.thread_tree(t, view))
                .collect()),
        }
    }

    pub fn root_name(&self, selector: ThreadSelector) -> SharedStr {
        match selector {
            ThreadSelector::Thread(id) => self
                .thread(id)
                .map_or_else(|| format!("Thread {id}").into(), |t| t.name.clone()),
            ThreadSelector::All => ALL_THREADS_NAME.into(),
        }
    }

    pub fn presentation(
        &self,
        view: ViewKind,
        selector: ThreadSelector,
        sort: SortConfig,
        filter: FilterConfig,
    ) -> Result<PresentationTree, ProfilerError> {
        PresentationTree::with_filter(
            self.trees(view, selector)?,
            self.names(view),
            self.root_name(selector),
            sort,
            filter,
        )
    }

    pub fn flat_profile(
        &self,
        view: ViewKind,
        selector: ThreadSelector,
        ctx: &SessionContext,
    ) -> Result<FlatProfile, ProfilerError> {
        Ok(FlatProfile::build(
            &self.trees(view, selector)?,
            self.names(view),
            ctx,
        ))
    }

    /// Callers of `method`. In class and package views `method` is a
    /// method-level id and is mapped to its owner first.
    pub fn reverse_tree(
        &self,
        view: ViewKind,
        selector: ThreadSelector,
        method: MethodId,
        sort: SortConfig,
    ) -> Result<ReverseTree, ProfilerError> {
        let target = self.owner_of(view, method);
        Ok(ReverseTree::build(
            &self.trees(view, selector)?,
            &self.names(view),
            target,
            sort,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compact::OwnedNode;
    use crate::presentation::TreeNode;
    use crate::timing::TimeStream;
    use callprof_protocol::MethodName;

    fn snapshot() -> CpuSnapshot {
        let methods = MethodTable::from_methods([
            MethodName::new("app.Svc", "a", "()V"),
            MethodName::new("app.Svc", "b", "()V"),
            MethodName::new("lib.Io", "read", "()V"),
        ]);
        let tree = |scale: u64| {
            let root = OwnedNode::new(0, 1, 0, 30 * scale).with_children(vec![
                OwnedNode::new(1, 1, 5 * scale, 30 * scale).with_children(vec![
                    OwnedNode::new(2, 1, 10 * scale, 25 * scale)
                        .with_children(vec![OwnedNode::new(3, 1, 15 * scale, 15 * scale)]),
                ]),
            ]);
            CompactTree::from_owned(&root, false)
        };
        CpuSnapshot::new(
            0,
            1000,
            false,
            methods,
            vec![
                ThreadData::new(7, "worker", tree(2), ThreadTimes::default()),
                ThreadData::new(1, "main", tree(1), ThreadTimes::default()),
            ],
        )
    }

    #[test]
    fn threads_are_ordered_by_id() {
        let s = snapshot();
        let ids: Vec<_> = s.threads().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 7]);
        assert_eq!(s.thread(7).unwrap().name, "worker");
        assert!(s.thread(3).is_none());
        assert!(matches!(
            s.trees(ViewKind::Method, ThreadSelector::Thread(3)),
            Err(ProfilerError::UnknownThread(3))
        ));
    }

    #[test]
    fn class_trees_are_derived_once() {
        let s = snapshot();
        let first = s.trees(ViewKind::Class, ThreadSelector::Thread(1)).unwrap();
        let again = s.trees(ViewKind::Class, ThreadSelector::Thread(1)).unwrap();
        assert!(Arc::ptr_eq(&first[0], &again[0]));
        let svc = first[0].child(first[0].root(), 0).unwrap();
        assert_eq!(first[0].self_time(svc, TimeStream::Absolute), 15);
        assert_eq!(s.names(ViewKind::Class).display_name(first[0].method_id(svc)), "app.Svc");
    }

    #[test]
    fn all_threads_view_merges() {
        let s = snapshot();
        let view = s
            .presentation(
                ViewKind::Method,
                ThreadSelector::All,
                SortConfig::default(),
                FilterConfig::default(),
            )
            .unwrap();
        let root = view.root();
        assert_eq!(root.name(), ALL_THREADS_NAME);
        assert_eq!(root.values().total_time[0], 90);

        let flat = s
            .flat_profile(ViewKind::Method, ThreadSelector::All, &SessionContext::new())
            .unwrap();
        assert_eq!(flat.row(flat.find(3).unwrap()).unwrap().self_time[0], 45);
    }

    #[test]
    fn reverse_tree_in_package_view_maps_target() {
        let s = snapshot();
        let rev = s
            .reverse_tree(ViewKind::Package, ThreadSelector::Thread(1), 3, SortConfig::default())
            .unwrap();
        let root = rev.root();
        assert_eq!(root.name(), "lib");
        assert_eq!(root.children()[0].name(), "app");
    }
}
