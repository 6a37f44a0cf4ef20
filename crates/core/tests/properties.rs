//! Property tests over randomly shaped call histories.

use std::sync::Arc;

use callprof_core::compact::{CompactTree, NodeRef, OwnedNode, encode_call_tree};
use callprof_core::model::{CallTree, FilterStatus, NodeIdx};
use callprof_core::presentation::{NodeValues, export_rows};
use callprof_core::timing::TimingAdjuster;
use callprof_core::views::SnapshotDiff;
use callprof_core::{
    CpuResults, EngineConfig, FilterConfig, FilterMode, MethodTable, SessionContext, SortConfig,
    ThreadSelector, TimeStream, TreeNode, ViewKind,
};
use callprof_protocol::{CallEvent, MethodName, MethodType, Timestamps};
use proptest::prelude::*;

#[derive(Debug, Clone)]
struct Call {
    method: u16,
    before: u64,
    after: u64,
    children: Vec<Call>,
}

fn call_strategy() -> impl Strategy<Value = Call> {
    let leaf = (2u16..=5, 0u64..50, 0u64..50).prop_map(|(method, before, after)| Call {
        method,
        before,
        after,
        children: Vec::new(),
    });
    leaf.prop_recursive(4, 48, 4, |inner| {
        (2u16..=5, 0u64..50, 0u64..50, prop::collection::vec(inner, 0..4)).prop_map(
            |(method, before, after, children)| Call {
                method,
                before,
                after,
                children,
            },
        )
    })
}

fn emit(call: &Call, thread: u32, clock: &mut u64, out: &mut Vec<CallEvent>) {
    out.push(CallEvent::entry(thread, call.method, MethodType::Normal, Timestamps::abs_only(*clock)));
    *clock += call.before;
    for child in &call.children {
        emit(child, thread, clock, out);
    }
    *clock += call.after;
    out.push(CallEvent::exit(thread, call.method, MethodType::Normal, Timestamps::abs_only(*clock)));
}

/// Events for one thread whose root method wraps `calls`; returns the
/// elapsed time too.
fn thread_events(thread: u32, calls: &[Call]) -> (Vec<CallEvent>, u64) {
    let mut out = vec![
        CallEvent::NewThread {
            thread,
            name: format!("t{thread}"),
        },
        CallEvent::entry(thread, 1, MethodType::Root, Timestamps::abs_only(0)),
    ];
    let mut clock = 1;
    for call in calls {
        emit(call, thread, &mut clock, &mut out);
    }
    clock += 1;
    out.push(CallEvent::exit(thread, 1, MethodType::Root, Timestamps::abs_only(clock)));
    (out, clock)
}

fn names() -> MethodTable {
    MethodTable::from_methods([
        MethodName::new("app.Main", "main", "()V"),
        MethodName::new("app.Parser", "parse", "()V"),
        MethodName::new("app.Parser", "token", "()V"),
        MethodName::new("io.Reader", "read", "()I"),
        MethodName::new("io.Buffer", "fill", "()V"),
    ])
}

fn owned_strategy() -> impl Strategy<Value = OwnedNode> {
    let leaf = (1u16..500, 1u32..10_000, 0u64..1 << 34).prop_map(|(id, calls, t)| {
        OwnedNode::new(id, calls, t, t)
    });
    leaf.prop_recursive(5, 64, 6, |inner| {
        (1u16..500, 1u32..10_000, 0u64..1 << 30, prop::collection::vec(inner, 0..6)).prop_map(
            |(id, calls, own, children)| {
                let total = children.iter().map(|c| c.total_time[0]).sum::<u64>() + own;
                OwnedNode::new(id, calls, own, total).with_children(children)
            },
        )
    })
}

/// Node of a randomly shaped in-progress tree. Filtered methods use ids
/// from 100 up so they never merge with a passing sibling.
#[derive(Debug, Clone)]
struct Shape {
    method: u16,
    calls: u8,
    net: [u64; 2],
    filtered: bool,
    children: Vec<Shape>,
}

fn shape_fields() -> (impl Strategy<Value = bool>, std::ops::Range<u16>, std::ops::Range<u8>, std::ops::Range<u64>, std::ops::Range<u64>) {
    (any::<bool>(), 1u16..8, 1u8..4, 0u64..1 << 20, 0u64..1 << 20)
}

fn shape_strategy() -> impl Strategy<Value = Shape> {
    let leaf = shape_fields().prop_map(|(filtered, id, calls, t0, t1)| Shape {
        method: if filtered { id + 100 } else { id },
        calls,
        net: [t0, t1],
        filtered,
        children: Vec::new(),
    });
    leaf.prop_recursive(5, 96, 5, |inner| {
        (shape_fields(), prop::collection::vec(inner, 0..5)).prop_map(
            |((filtered, id, calls, t0, t1), children)| Shape {
                method: if filtered { id + 100 } else { id },
                calls,
                net: [t0, t1],
                filtered,
                children,
            },
        )
    })
}

fn plant(tree: &mut CallTree, parent: NodeIdx, shape: &Shape) {
    let status = if shape.filtered {
        FilterStatus::Filtered
    } else {
        FilterStatus::Passed
    };
    let mut idx = parent;
    for _ in 0..shape.calls {
        idx = tree.enter_child(parent, shape.method, status);
    }
    let node = tree.node_mut(idx);
    node.net_time[0] += shape.net[0];
    node.net_time[1] += shape.net[1];
    for child in &shape.children {
        plant(tree, idx, child);
    }
}

fn net_sum(shape: &Shape, stream: usize) -> u64 {
    shape.net[stream] + shape.children.iter().map(|c| net_sum(c, stream)).sum::<u64>()
}

/// Walks `expected` and `compact` side by side and returns the node's
/// totals, checking every field on the way.
fn assert_encoded(
    expected: &CallTree,
    idx: NodeIdx,
    compact: &CompactTree,
    node: NodeRef,
    streams: &[TimeStream],
) -> Result<[u64; 2], TestCaseError> {
    let want = expected.node(idx);
    prop_assert_eq!(compact.method_id(node), want.method_id);
    prop_assert_eq!(want.status, FilterStatus::Passed);
    let calls = if idx == CallTree::ROOT { 1 } else { want.n_calls };
    prop_assert_eq!(u64::from(compact.n_calls(node)), calls);
    prop_assert_eq!(compact.n_children(node), want.children.len());

    let mut totals = [0u64; 2];
    for &stream in streams {
        let i = stream.index();
        let own = if idx == CallTree::ROOT { 0 } else { want.net_time[i] };
        prop_assert_eq!(compact.self_time(node, stream), own);
        totals[i] = own;
    }
    for (&child_idx, child) in want.children.iter().zip(compact.children(node)) {
        let child_totals = assert_encoded(expected, child_idx, compact, child, streams)?;
        for &stream in streams {
            totals[stream.index()] += child_totals[stream.index()];
        }
    }
    for &stream in streams {
        prop_assert_eq!(compact.total_time(node, stream), totals[stream.index()]);
    }
    Ok(totals)
}

fn streams(two_ts: bool) -> &'static [TimeStream] {
    if two_ts { &TimeStream::ALL } else { &[TimeStream::Absolute] }
}

#[test]
fn wide_tree_switches_to_four_byte_offsets() {
    let mut tree = CallTree::new();
    let a = tree.enter_child(CallTree::ROOT, 1, FilterStatus::Passed);
    for i in 1..=100 {
        let b = tree.enter_child(a, i, FilterStatus::Passed);
        for j in 1..=100 {
            let c = tree.enter_child(b, j, FilterStatus::Passed);
            for k in 1..=60 {
                let leaf = tree.enter_child(c, k, FilterStatus::Passed);
                tree.node_mut(leaf).net_time = [1, 2];
            }
        }
    }
    let ctx = SessionContext::new();
    let adjuster = TimingAdjuster::default();

    let narrow = encode_call_tree(&tree, false, &adjuster, &ctx);
    assert_eq!(narrow.offset_width(), 3);

    let wide = encode_call_tree(&tree, true, &adjuster, &ctx);
    assert_eq!(wide.offset_width(), 4);
    assert_eq!(wide.node_count(), tree.len());
    assert!(wide.byte_len() > 0xFF_FFFF);
    let totals = assert_encoded(&tree, CallTree::ROOT, &wide, wide.root(), streams(true)).unwrap();
    assert_eq!(totals, [600_000, 1_200_000]);

    let last = [0, 99, 99, 59]
        .iter()
        .try_fold(wide.root(), |node, &i| wide.child(node, i))
        .unwrap();
    assert_eq!(wide.method_id(last), 60);
    assert_eq!(wide.n_children(last), 0);
    assert_eq!(wide.self_time(last, TimeStream::ThreadCpu), 2);
    assert_eq!(wide.total_time(last, TimeStream::Absolute), 1);
    assert_eq!(ctx.stats().dropped_children, 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_encoded_tree_matches_call_tree(
        top in prop::collection::vec(shape_strategy(), 0..5),
        two_ts in any::<bool>(),
    ) {
        let mut tree = CallTree::new();
        for shape in &top {
            // The thread node carries no time, so its direct callees pass.
            plant(&mut tree, CallTree::ROOT, &Shape { filtered: false, method: shape.method % 100, ..shape.clone() });
        }
        let ctx = SessionContext::new();
        let compact = encode_call_tree(&tree, two_ts, &TimingAdjuster::default(), &ctx);

        let folded;
        let expected = if tree.has_filtered() {
            folded = tree.folded();
            &folded
        } else {
            &tree
        };
        prop_assert_eq!(compact.node_count(), expected.len());
        let totals = assert_encoded(expected, CallTree::ROOT, &compact, compact.root(), streams(two_ts))?;
        for &stream in streams(two_ts) {
            let i = stream.index();
            prop_assert_eq!(totals[i], top.iter().map(|s| net_sum(s, i)).sum::<u64>());
        }
    }

    #[test]
    fn prop_self_time_conserved(
        first in prop::collection::vec(call_strategy(), 1..4),
        second in prop::collection::vec(call_strategy(), 0..3),
    ) {
        let results = CpuResults::new(EngineConfig::default(), Arc::new(names()), None);
        let (events, elapsed_1) = thread_events(1, &first);
        results.process_events(&events);
        let (events, elapsed_2) = thread_events(2, &second);
        results.process_events(&events);

        let snapshot = results.materialize().unwrap();
        prop_assert_eq!(snapshot.thread(1).unwrap().times.net_time[0], elapsed_1);
        prop_assert_eq!(snapshot.thread(2).unwrap().times.net_time[0], elapsed_2);
        for view in [ViewKind::Method, ViewKind::Class, ViewKind::Package] {
            let flat = results.flat_profile(view, ThreadSelector::All).unwrap();
            let self_sum: u64 = flat.rows().map(|r| r.self_time[0]).sum();
            prop_assert_eq!(self_sum, elapsed_1 + elapsed_2);
            for row in flat.rows() {
                prop_assert!(row.total_time[0] >= row.self_time[0]);
                prop_assert!(row.total_time[0] <= elapsed_1 + elapsed_2);
            }
        }
    }

    #[test]
    fn prop_reverse_tree_children_sum_to_parent(
        calls in prop::collection::vec(call_strategy(), 1..4),
        target in 2u16..=5,
    ) {
        let results = CpuResults::new(EngineConfig::default(), Arc::new(names()), None);
        results.process_events(&thread_events(1, &calls).0);
        let rev = results.reverse_tree(ViewKind::Method, ThreadSelector::All, target).unwrap();
        let mut stack = vec![rev.root()];
        while let Some(node) = stack.pop() {
            let children = node.children();
            if !children.is_empty() {
                let sum: i64 = children.iter().map(|c| c.values().total(TimeStream::Absolute)).sum();
                prop_assert_eq!(sum, node.values().total(TimeStream::Absolute));
            }
            stack.extend(children);
        }
    }

    #[test]
    fn prop_diff_with_itself_is_zero(calls in prop::collection::vec(call_strategy(), 1..4)) {
        let results = CpuResults::new(EngineConfig::default(), Arc::new(names()), None);
        results.process_events(&thread_events(1, &calls).0);
        let snapshot = results.materialize().unwrap();
        let diff = SnapshotDiff::new(Arc::clone(&snapshot), snapshot);
        let ctx = SessionContext::new();
        prop_assert!(diff.flat(ViewKind::Method, ThreadSelector::All, &ctx).unwrap().is_zero());

        let root = diff
            .tree(ViewKind::Method, ThreadSelector::All, SortConfig::default(), FilterConfig::default())
            .unwrap();
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            prop_assert_eq!(node.values(), NodeValues::default());
            prop_assert_eq!(node.percent(), 0.0);
            stack.extend(node.children());
        }
    }

    #[test]
    fn prop_refiltering_is_idempotent(
        calls in prop::collection::vec(call_strategy(), 1..4),
        term in prop::sample::select(vec!["Parser", "io", "read", "app.Main"]),
        mode in prop::sample::select(vec![FilterMode::Contains, FilterMode::StartsWith, FilterMode::EndsWith]),
    ) {
        let results = CpuResults::new(EngineConfig::default(), Arc::new(names()), None);
        results.process_events(&thread_events(1, &calls).0);
        let tree = results
            .presentation_root(ViewKind::Method, ThreadSelector::Thread(1), FilterConfig::default())
            .unwrap();
        let unfiltered = export_rows(&tree.root());

        let filter = FilterConfig::new(term, mode);
        let once = export_rows(&tree.set_filter(filter.clone()).unwrap());
        let twice = export_rows(&tree.set_filter(filter).unwrap());
        prop_assert_eq!(&once, &twice);
        prop_assert_eq!(once[0].total_time0, unfiltered[0].total_time0);

        let back = export_rows(&tree.set_filter(FilterConfig::default()).unwrap());
        prop_assert_eq!(back, unfiltered);
    }

    #[test]
    fn prop_compact_round_trip(root in owned_strategy(), two_ts in any::<bool>()) {
        let tree = CompactTree::from_owned(&root, two_ts);
        prop_assert_eq!(tree.to_owned_tree(), root.clone());
        let reparsed = CompactTree::from_bytes(tree.as_bytes().to_vec(), two_ts).unwrap();
        prop_assert_eq!(reparsed.to_owned_tree(), root);
    }
}
