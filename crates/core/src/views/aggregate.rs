use std::collections::HashMap;

use callprof_protocol::{MethodId, THREAD_METHOD_ID};

use crate::compact::{CompactTree, CompactWriter, MAX_CHILDREN, NodeRef};
use crate::model::OwnerMapping;
use crate::timing::TimeStream;

/// Owner-level node while the aggregated tree is assembled.
struct MergedNode {
    owner: MethodId,
    n_calls: u64,
    total_time: [u64; 2],
    self_time: [u64; 2],
    children: Vec<usize>,
    index: HashMap<MethodId, usize>,
}

impl MergedNode {
    fn new(owner: MethodId) -> Self {
        Self {
            owner,
            n_calls: 0,
            total_time: [0; 2],
            self_time: [0; 2],
            children: Vec::new(),
            index: HashMap::new(),
        }
    }
}

/// Re-expresses a method-level tree at class or package level.
///
/// A run of calls that stays within one owner collapses into a single node
/// carrying the self time of every member. Calls into a different owner
/// become children, grouped by owner. Calls and total time come from the
/// first member of each run only, since its total already covers the rest.
pub fn aggregate(tree: &CompactTree, mapping: &OwnerMapping) -> CompactTree {
    let root = tree.root();
    let mut merged = vec![MergedNode::new(THREAD_METHOD_ID)];
    merged[0].n_calls = u64::from(tree.n_calls(root));
    for stream in TimeStream::ALL {
        merged[0].total_time[stream.index()] = tree.total_time(root, stream);
    }

    // (target merged node, compact node whose children are scanned into it)
    let mut pending: Vec<(usize, NodeRef)> = vec![(0, root)];
    while let Some((target, node)) = pending.pop() {
        let mut next = Vec::with_capacity(tree.n_children(node));
        for child in tree.children(node) {
            let owner = mapping.owner(tree.method_id(child));
            let into = if target != 0 && merged[target].owner == owner {
                target
            } else {
                let idx = match merged[target].index.get(&owner) {
                    Some(&idx) => idx,
                    None => {
                        let idx = merged.len();
                        merged.push(MergedNode::new(owner));
                        merged[target].children.push(idx);
                        merged[target].index.insert(owner, idx);
                        idx
                    }
                };
                merged[idx].n_calls += u64::from(tree.n_calls(child));
                for stream in TimeStream::ALL {
                    merged[idx].total_time[stream.index()] += tree.total_time(child, stream);
                }
                idx
            };
            for stream in TimeStream::ALL {
                merged[into].self_time[stream.index()] += tree.self_time(child, stream);
            }
            next.push((into, child));
        }
        pending.extend(next.into_iter().rev());
    }

    encode(&merged, tree.two_timestamps())
}

fn encode(merged: &[MergedNode], two_timestamps: bool) -> CompactTree {
    let children_of = |idx: usize| {
        let c = &merged[idx].children;
        &c[..c.len().min(MAX_CHILDREN)]
    };
    let mut count = 0;
    let mut stack = vec![0usize];
    while let Some(idx) = stack.pop() {
        count += 1;
        stack.extend_from_slice(children_of(idx));
    }

    let mut writer = CompactWriter::new(count, two_timestamps);
    let mut stack = vec![(0usize, None::<(usize, usize)>)];
    while let Some((idx, slot)) = stack.pop() {
        let node = &merged[idx];
        let children = children_of(idx);
        let n_calls = u32::try_from(node.n_calls).unwrap_or(u32::MAX);
        let offset = writer.alloc_node(node.owner, n_calls, children.len());
        writer.set_times(offset, node.total_time, node.self_time);
        if let Some((parent, i)) = slot {
            writer.set_child(parent, i, offset);
        }
        for (i, &child) in children.iter().enumerate().rev() {
            stack.push((child, Some((offset, i))));
        }
    }
    writer.finish()
}
