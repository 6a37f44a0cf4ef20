use std::sync::Arc;

use serde::Serialize;

use super::node::TreeNode;

/// One line of a flattened subtree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRow {
    pub depth: usize,
    pub name: String,
    pub percent: f64,
    pub total_time0: i64,
    pub n_calls: i64,
}

/// Flattens `root` and its descendants in pre-order, children in their
/// current sort order.
pub fn export_rows<N: TreeNode>(root: &Arc<N>) -> Vec<ExportRow> {
    export_rows_to_depth(root, usize::MAX)
}

/// Like [`export_rows`], but stops descending below `max_depth`.
pub fn export_rows_to_depth<N: TreeNode>(root: &Arc<N>, max_depth: usize) -> Vec<ExportRow> {
    let mut rows = Vec::new();
    let mut stack = vec![(Arc::clone(root), 0usize)];
    while let Some((node, depth)) = stack.pop() {
        let values = node.values();
        rows.push(ExportRow {
            depth,
            name: node.name().to_string(),
            percent: node.percent(),
            total_time0: values.total_time[0],
            n_calls: values.n_calls,
        });
        if depth < max_depth {
            for child in node.children().into_iter().rev() {
                stack.push((child, depth + 1));
            }
        }
    }
    rows
}
