use std::borrow::Cow;

use tracing::warn;

use super::{CompactTree, CompactWriter, MAX_CHILDREN};
use crate::context::SessionContext;
use crate::model::{CallTree, NodeIdx};
use crate::timing::{TimeStream, TimingAdjuster};

fn encoded_children(tree: &CallTree, idx: NodeIdx) -> &[NodeIdx] {
    let children = &tree.node(idx).children;
    &children[..children.len().min(MAX_CHILDREN)]
}

/// Freezes an in-progress tree into compact form.
///
/// Filtered nodes are folded into their callers first. Self times are
/// cleansed per node; totals are the bottom-up sums of cleansed self times.
/// The thread node carries no self time of its own.
pub fn encode_call_tree(
    tree: &CallTree,
    two_timestamps: bool,
    adjuster: &TimingAdjuster,
    ctx: &SessionContext,
) -> CompactTree {
    let tree: Cow<'_, CallTree> = if tree.has_filtered() {
        Cow::Owned(tree.folded())
    } else {
        Cow::Borrowed(tree)
    };
    let streams: &[TimeStream] = if two_timestamps {
        &TimeStream::ALL
    } else {
        &TimeStream::ALL[..1]
    };

    // Pre-order allocation, remembering where each node landed.
    let mut order: Vec<(NodeIdx, usize)> = Vec::with_capacity(tree.len());
    let mut stack = vec![(CallTree::ROOT, None::<(usize, usize)>)];
    let mut reachable = 0;
    let mut dropped = 0;
    {
        let mut pending = vec![CallTree::ROOT];
        while let Some(idx) = pending.pop() {
            reachable += 1;
            let children = encoded_children(&tree, idx);
            dropped += tree.node(idx).children.len() - children.len();
            pending.extend_from_slice(children);
        }
    }
    if dropped > 0 {
        warn!(dropped, limit = MAX_CHILDREN, "call tree node has too many children; extra callees dropped");
        ctx.add_dropped_children(dropped as u64);
    }
    let mut writer = CompactWriter::new(reachable, two_timestamps);
    while let Some((idx, slot)) = stack.pop() {
        let node = tree.node(idx);
        let children = encoded_children(&tree, idx);
        let n_calls = if idx == CallTree::ROOT {
            1
        } else {
            u32::try_from(node.n_calls).unwrap_or(u32::MAX)
        };
        let offset = writer.alloc_node(node.method_id, n_calls, children.len());
        if let Some((parent, i)) = slot {
            writer.set_child(parent, i, offset);
        }
        order.push((idx, offset));
        for (i, &child) in children.iter().enumerate().rev() {
            stack.push((child, Some((offset, i))));
        }
    }

    // Reverse pre-order visits every child before its parent.
    let mut totals = vec![[0u64; 2]; tree.len()];
    for &(idx, offset) in order.iter().rev() {
        let node = tree.node(idx);
        let children = encoded_children(&tree, idx);
        let callee_calls: u64 = children.iter().map(|&c| tree.node(c).n_calls).sum();
        let mut self_time = [0u64; 2];
        let mut total = [0u64; 2];
        for &stream in streams {
            let i = stream.index();
            if idx != CallTree::ROOT && node.net_time[i] > 0 {
                self_time[i] =
                    adjuster.cleanse_self_reported(node.net_time[i], node.n_calls, callee_calls, stream, ctx);
            }
            total[i] = children
                .iter()
                .fold(self_time[i], |acc, &c| acc.saturating_add(totals[c][i]));
        }
        totals[idx] = total;
        writer.set_times(offset, total, self_time);
    }

    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FilterStatus;
    use crate::timing::TimingCalibration;

    /// Thread -> A -> B(x2), B self 100 counts per call, A 10 counts of its own.
    fn simple_tree() -> CallTree {
        let mut tree = CallTree::new();
        let a = tree.enter_child(CallTree::ROOT, 1, FilterStatus::Passed);
        let b = tree.enter_child(a, 2, FilterStatus::Passed);
        tree.enter_child(a, 2, FilterStatus::Passed);
        tree.node_mut(a).net_time[0] = 10;
        tree.node_mut(b).net_time[0] = 200;
        tree
    }

    #[test]
    fn simple_tree_scenario() {
        let ctx = SessionContext::new();
        let compact = encode_call_tree(&simple_tree(), false, &TimingAdjuster::default(), &ctx);
        let root = compact.root();
        assert_eq!(compact.method_id(root), 0);
        assert_eq!(compact.total_time(root, TimeStream::Absolute), 210);
        assert_eq!(compact.self_time(root, TimeStream::Absolute), 0);

        let a = compact.child(root, 0).unwrap();
        assert_eq!(compact.n_calls(a), 1);
        assert_eq!(compact.total_time(a, TimeStream::Absolute), 210);
        assert_eq!(compact.self_time(a, TimeStream::Absolute), 10);

        let b = compact.child(a, 0).unwrap();
        assert_eq!(compact.n_calls(b), 2);
        assert_eq!(compact.total_time(b, TimeStream::Absolute), 200);
        assert_eq!(compact.self_time(b, TimeStream::Absolute), 200);
    }

    #[test]
    fn overhead_is_removed_and_clamped() {
        let adjuster = TimingAdjuster::new(TimingCalibration {
            method_entry_exit_inner_time: [20.0, 0.0],
            method_entry_exit_outer_time: [1.0, 0.0],
            ..TimingCalibration::default()
        });
        let ctx = SessionContext::new();
        let compact = encode_call_tree(&simple_tree(), false, &adjuster, &ctx);
        let a = compact.child(compact.root(), 0).unwrap();
        let b = compact.child(a, 0).unwrap();
        // A: 10 - 1*20 - 2*1 < 0
        assert_eq!(compact.self_time(a, TimeStream::Absolute), 0);
        // B: 200 - 2*20
        assert_eq!(compact.self_time(b, TimeStream::Absolute), 160);
        assert_eq!(compact.total_time(a, TimeStream::Absolute), 160);

        let stats = ctx.stats();
        assert_eq!(stats.clamped_nodes, 1);
        assert_eq!(stats.clamped_micros, 12);
        assert_eq!(stats.injected_code_micros, 22 + 40);
    }

    #[test]
    fn filtered_nodes_fold_into_caller() {
        let mut tree = simple_tree();
        let a = tree.find_child(CallTree::ROOT, 1).unwrap();
        let lib = tree.enter_child(a, 3, FilterStatus::Filtered);
        tree.node_mut(lib).net_time[0] = 5;
        let compact = encode_call_tree(&tree, false, &TimingAdjuster::default(), &SessionContext::new());
        let a = compact.child(compact.root(), 0).unwrap();
        assert_eq!(compact.n_children(a), 1);
        assert_eq!(compact.self_time(a, TimeStream::Absolute), 15);
        assert_eq!(compact.total_time(compact.root(), TimeStream::Absolute), 215);
    }

    #[test]
    fn second_stream_is_encoded_in_two_timestamp_mode() {
        let mut tree = simple_tree();
        let a = tree.find_child(CallTree::ROOT, 1).unwrap();
        tree.node_mut(a).net_time[1] = 7;
        let compact = encode_call_tree(&tree, true, &TimingAdjuster::default(), &SessionContext::new());
        assert!(compact.two_timestamps());
        let a = compact.child(compact.root(), 0).unwrap();
        assert_eq!(compact.self_time(a, TimeStream::ThreadCpu), 7);
        assert_eq!(compact.total_time(compact.root(), TimeStream::ThreadCpu), 7);
    }

    #[test]
    fn empty_tree_encodes_thread_node_only() {
        let compact = encode_call_tree(&CallTree::new(), false, &TimingAdjuster::default(), &SessionContext::new());
        assert!(compact.is_empty());
        assert_eq!(compact.node_count(), 1);
        assert_eq!(compact.byte_len(), 18);
    }

    #[test]
    fn children_past_the_limit_are_dropped_and_counted() {
        let mut tree = CallTree::new();
        let a = tree.enter_child(CallTree::ROOT, 1, FilterStatus::Passed);
        let leaf = tree.enter_child(a, 2, FilterStatus::Passed);
        tree.node_mut(a).net_time[0] = 3;
        tree.node_mut(leaf).net_time[0] = 1;
        // One callee repeated in every slot; each slot still encodes as its own node.
        tree.node_mut(a).children.resize(MAX_CHILDREN + 2, leaf);

        let ctx = SessionContext::new();
        let compact = encode_call_tree(&tree, false, &TimingAdjuster::default(), &ctx);
        let a = compact.child(compact.root(), 0).unwrap();
        assert_eq!(compact.n_children(a), MAX_CHILDREN);
        assert_eq!(compact.node_count(), 2 + MAX_CHILDREN);
        assert_eq!(
            compact.total_time(a, TimeStream::Absolute),
            3 + MAX_CHILDREN as u64
        );
        assert_eq!(ctx.stats().dropped_children, 2);
    }
}
