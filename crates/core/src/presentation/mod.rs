//! On-demand, filterable and sortable views over compact trees.
//!
//! A [`PresentationTree`] is one logical root. Its sort setting is shared by
//! every node below it and may change at any time; a filter change builds a
//! fresh root because the filter decides which nodes exist.

mod export;
mod filter;
mod node;
mod sort;

use std::sync::Arc;

use callprof_protocol::SharedStr;
use parking_lot::RwLock;

pub use export::{ExportRow, export_rows, export_rows_to_depth};
pub use filter::{FilterConfig, FilterMode, NameFilter};
pub use node::{
    CONTEXT_CALLS_NAME, FILTERED_NAME, NodeKind, NodeValues, PresentationNode, SELF_TIME_NAME,
    TreeNode,
};
pub use sort::{SortConfig, SortKey};

pub(crate) use node::{percent_of, sort_nodes};

use crate::compact::CompactTree;
use crate::error::ProfilerError;
use crate::model::MethodTable;
use crate::timing::TimeStream;
use node::TreeContext;

pub struct PresentationTree {
    trees: Vec<Arc<CompactTree>>,
    names: Arc<MethodTable>,
    root_name: SharedStr,
    sort: Arc<RwLock<SortConfig>>,
    current: RwLock<(FilterConfig, Arc<PresentationNode>)>,
}

impl std::fmt::Debug for PresentationTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresentationTree")
            .field("trees", &self.trees.len())
            .field("root_name", &self.root_name)
            .field("sort", &*self.sort.read())
            .field("filter", &self.current.read().0)
            .finish()
    }
}

impl PresentationTree {
    /// Root over the given trees. Several trees are merged under one thread
    /// node.
    pub fn new(
        trees: Vec<Arc<CompactTree>>,
        names: Arc<MethodTable>,
        root_name: impl Into<SharedStr>,
        sort: SortConfig,
    ) -> Self {
        let root_name = root_name.into();
        let sort = Arc::new(RwLock::new(sort));
        let filter = FilterConfig::default();
        let root = Self::build_root(
            &trees,
            &names,
            &root_name,
            &sort,
            NameFilter::All,
        );
        Self {
            trees,
            names,
            root_name,
            sort,
            current: RwLock::new((filter, root)),
        }
    }

    pub fn with_filter(
        trees: Vec<Arc<CompactTree>>,
        names: Arc<MethodTable>,
        root_name: impl Into<SharedStr>,
        sort: SortConfig,
        filter: FilterConfig,
    ) -> Result<Self, ProfilerError> {
        let tree = Self::new(trees, names, root_name, sort);
        tree.set_filter(filter)?;
        Ok(tree)
    }

    fn build_root(
        trees: &[Arc<CompactTree>],
        names: &Arc<MethodTable>,
        root_name: &SharedStr,
        sort: &Arc<RwLock<SortConfig>>,
        filter: NameFilter,
    ) -> Arc<PresentationNode> {
        let root_total = trees
            .iter()
            .map(|t| i64::try_from(t.total_time(t.root(), TimeStream::Absolute)).unwrap_or(i64::MAX))
            .sum();
        let ctx = Arc::new(TreeContext {
            trees: trees.to_vec(),
            names: Arc::clone(names),
            filter,
            sort: Arc::clone(sort),
            root_total,
        });
        PresentationNode::thread_root(ctx, root_name.clone())
    }

    pub fn root(&self) -> Arc<PresentationNode> {
        Arc::clone(&self.current.read().1)
    }

    pub fn names(&self) -> &Arc<MethodTable> {
        &self.names
    }

    pub fn trees(&self) -> &[Arc<CompactTree>] {
        &self.trees
    }

    pub fn filter(&self) -> FilterConfig {
        self.current.read().0.clone()
    }

    /// Applies a filter and returns the root for it. Setting the filter that
    /// is already active returns the same root.
    pub fn set_filter(&self, filter: FilterConfig) -> Result<Arc<PresentationNode>, ProfilerError> {
        if self.current.read().0 == filter {
            return Ok(self.root());
        }
        let compiled = filter.compile()?;
        let root = Self::build_root(
            &self.trees,
            &self.names,
            &self.root_name,
            &self.sort,
            compiled,
        );
        let mut current = self.current.write();
        *current = (filter, Arc::clone(&root));
        Ok(root)
    }

    pub fn sort(&self) -> SortConfig {
        *self.sort.read()
    }

    /// Changes sibling order for every node of this root, including nodes
    /// handed out earlier.
    pub fn set_sort(&self, sort: SortConfig) {
        *self.sort.write() = sort;
    }
}
