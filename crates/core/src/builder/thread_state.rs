use callprof_protocol::{BlockReason, MethodId, MethodType, ThreadId, Timestamps};

use crate::model::{CallTree, FilterStatus, NodeIdx};

#[derive(Debug, Clone, Copy)]
struct Frame {
    node: NodeIdx,
    /// Popping this frame leaves one level of root reentrancy.
    opens_root: bool,
}

/// Result of feeding one event into a [`ThreadState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// Root entry while already inside a root method; processed anyway.
    RootReentered,
    /// The event has no meaning in the current state and was dropped.
    Ignored,
    /// Exit for a method other than the one on top of the stack. The stack is
    /// left untouched.
    Mismatch { on_stack: MethodId },
}

/// Per-thread state machine: `NoRoot -> InRoot(depth) -> NoRoot`.
///
/// Timestamps are raw timer counts indexed by stream. The clock runs against
/// the node on top of the stack and is charged to it whenever the stack
/// changes or the thread blocks.
#[derive(Debug)]
pub struct ThreadState {
    pub(crate) id: ThreadId,
    pub(crate) name: String,
    pub(crate) tree: CallTree,
    stack: Vec<Frame>,
    root_depth: u32,
    last_stamp: [u64; 2],
    root_entry_stamp: [u64; 2],
    pub(crate) gross_time: [u64; 2],
    pub(crate) total_invocations: u64,
    blocked: Option<(BlockReason, [u64; 2])>,
    servlet_open: bool,
}

impl ThreadState {
    pub fn new(id: ThreadId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            tree: CallTree::new(),
            stack: vec![Frame {
                node: CallTree::ROOT,
                opens_root: false,
            }],
            root_depth: 0,
            last_stamp: [0; 2],
            root_entry_stamp: [0; 2],
            gross_time: [0; 2],
            total_invocations: 0,
            blocked: None,
            servlet_open: false,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tree(&self) -> &CallTree {
        &self.tree
    }

    pub fn in_root(&self) -> bool {
        self.root_depth > 0
    }

    pub fn root_depth(&self) -> u32 {
        self.root_depth
    }

    /// Method ids on the current path, outermost first, without the thread
    /// node.
    pub fn stack_methods(&self) -> Vec<MethodId> {
        self.stack[1..]
            .iter()
            .map(|f| self.tree.node(f.node).method_id)
            .collect()
    }

    fn base_len(&self) -> usize {
        1 + usize::from(self.servlet_open)
    }

    fn top(&self) -> NodeIdx {
        self.stack.last().map_or(CallTree::ROOT, |f| f.node)
    }

    /// Unstamped events reuse the last stamp, so they add no time.
    fn now(&self, stamp: Option<Timestamps>) -> [u64; 2] {
        match stamp {
            Some(s) => [s.abs, s.cpu.unwrap_or(self.last_stamp[1])],
            None => self.last_stamp,
        }
    }

    /// Charges the time since the last stamp to the node on top of the stack.
    fn charge(&mut self, now: [u64; 2]) {
        let top = self.top();
        let node = self.tree.node_mut(top);
        for (i, net) in node.net_time.iter_mut().enumerate() {
            *net += now[i].saturating_sub(self.last_stamp[i]);
        }
        self.last_stamp = now;
    }

    pub fn enter(
        &mut self,
        method: MethodId,
        kind: MethodType,
        stamp: Option<Timestamps>,
        status: FilterStatus,
    ) -> Transition {
        let was_in_root = self.in_root();
        let opens_root = match kind {
            MethodType::Root => true,
            MethodType::Marker => !was_in_root,
            MethodType::Normal => false,
        };
        if !was_in_root && !opens_root {
            return Transition::Ignored;
        }

        let now = self.now(stamp);
        if was_in_root {
            self.charge(now);
        } else {
            self.last_stamp = now;
        }
        self.blocked = None;

        if opens_root {
            self.root_depth += 1;
            if self.root_depth == 1 {
                self.root_entry_stamp = now;
            }
        }

        let node = self.tree.enter_child(self.top(), method, status);
        self.stack.push(Frame { node, opens_root });
        self.total_invocations += 1;

        if was_in_root && kind == MethodType::Root {
            Transition::RootReentered
        } else {
            Transition::Applied
        }
    }

    pub fn exit(&mut self, method: MethodId, stamp: Option<Timestamps>) -> Transition {
        if !self.in_root() || self.stack.len() <= self.base_len() {
            return Transition::Ignored;
        }
        let Some(frame) = self.stack.last().copied() else {
            return Transition::Ignored;
        };
        let on_stack = self.tree.node(frame.node).method_id;
        if on_stack != method {
            return Transition::Mismatch { on_stack };
        }

        let now = self.now(stamp);
        self.charge(now);
        self.blocked = None;
        self.stack.pop();

        if frame.opens_root {
            self.root_depth -= 1;
            if self.root_depth == 0 {
                for i in 0..2 {
                    self.gross_time[i] += now[i].saturating_sub(self.root_entry_stamp[i]);
                }
                if self.servlet_open {
                    self.stack.pop();
                    self.servlet_open = false;
                }
            }
        }
        Transition::Applied
    }

    /// Stops the clock on the current method.
    pub fn block_entry(&mut self, reason: BlockReason, stamp: Timestamps) -> Transition {
        if !self.in_root() {
            return Transition::Ignored;
        }
        let now = self.now(Some(stamp));
        self.charge(now);
        self.blocked = Some((reason, now));
        Transition::Applied
    }

    /// Restarts the clock and books the blocked interval as wait or sleep
    /// time, and also as net time when `count_as_net` is set.
    pub fn block_exit(&mut self, stamp: Timestamps, count_as_net: bool) -> Transition {
        if !self.in_root() {
            return Transition::Ignored;
        }
        let Some((reason, start)) = self.blocked.take() else {
            return Transition::Ignored;
        };
        let now = self.now(Some(stamp));
        let top = self.top();
        let node = self.tree.node_mut(top);
        for i in 0..2 {
            let interval = now[i].saturating_sub(start[i]);
            match reason {
                BlockReason::Sleep => node.sleep_time[i] += interval,
                BlockReason::Monitor | BlockReason::Wait | BlockReason::Park => {
                    node.wait_time[i] += interval
                }
            }
            if count_as_net {
                node.net_time[i] += interval;
            }
        }
        self.last_stamp = now;
        Transition::Applied
    }

    pub fn block_reason(&self) -> Option<BlockReason> {
        self.blocked.map(|(r, _)| r)
    }

    /// All threads stopped at absolute time `time`: flush what the running
    /// method has used so far.
    pub fn suspend(&mut self, time: u64) {
        if self.in_root() && self.blocked.is_none() {
            let now = [time, self.last_stamp[1]];
            self.charge(now);
        }
    }

    /// Threads restarted at `time` after a pause of `pause` counts. The pause
    /// is charged to nobody and does not count as gross time either.
    pub fn resume(&mut self, time: u64, pause: u64) {
        if !self.in_root() {
            return;
        }
        self.root_entry_stamp[0] += pause;
        match &mut self.blocked {
            Some((_, start)) => start[0] += pause,
            None => self.last_stamp[0] = time,
        }
    }

    /// Shifts every reference stamp forward by `delta` to hide a
    /// profiler-side pause.
    pub fn adjust_time(&mut self, delta: Timestamps) {
        let d = [delta.abs, delta.cpu.unwrap_or(0)];
        for i in 0..2 {
            self.last_stamp[i] += d[i];
            self.root_entry_stamp[i] += d[i];
            if let Some((_, start)) = &mut self.blocked {
                start[i] += d[i];
            }
        }
    }

    /// Opens a request boundary node under the thread node; root activations
    /// attach below it until the outermost root exits.
    pub fn open_servlet(&mut self, id: MethodId) -> Transition {
        if self.in_root() {
            return Transition::Ignored;
        }
        if self.servlet_open {
            self.stack.truncate(1);
        }
        let node = self
            .tree
            .enter_child(CallTree::ROOT, id, FilterStatus::Passed);
        self.stack.push(Frame {
            node,
            opens_root: false,
        });
        self.servlet_open = true;
        Transition::Applied
    }
}
