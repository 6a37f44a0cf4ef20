//! Event-driven construction of per-thread calling-context trees.
//!
//! Thread-scoped events only need shared access to the builder plus the
//! thread's own lock. Events that change the thread table or process-wide
//! clocks need exclusive access; [`CallGraphBuilder::process_shared`] reports
//! those back so the caller can retry under the exclusive gate.

mod thread_state;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use callprof_protocol::{CallEvent, MethodId, MethodName, ThreadId, THREAD_METHOD_ID};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

pub use thread_state::{ThreadState, Transition};

use crate::context::SessionContext;
use crate::model::{FilterStatus, InstrumentationFilter, MethodNameResolver, MethodTable};

/// First id handed out to servlet boundary nodes; later ones count down.
pub const FIRST_SERVLET_ID: MethodId = 0xFFFF;

/// Options the builder reads from the engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuilderOptions {
    pub exclude_wait_time: bool,
    pub exclude_sleep_time: bool,
}

impl Default for BuilderOptions {
    fn default() -> Self {
        Self {
            exclude_wait_time: true,
            exclude_sleep_time: true,
        }
    }
}

/// Outcome of [`CallGraphBuilder::process_shared`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    Done,
    /// The event touches shared builder state; call
    /// [`CallGraphBuilder::process`] with exclusive access.
    NeedsExclusive,
}

pub struct CallGraphBuilder {
    threads: BTreeMap<ThreadId, Mutex<ThreadState>>,
    resolver: Arc<dyn MethodNameResolver>,
    filter: Option<Arc<dyn InstrumentationFilter>>,
    filter_cache: Mutex<HashMap<MethodId, FilterStatus>>,
    servlets: HashMap<String, MethodId>,
    servlet_names: Vec<(MethodId, MethodName)>,
    next_servlet_id: MethodId,
    suspended_at: Option<u64>,
    stack_mismatch_logged: AtomicBool,
    options: BuilderOptions,
    begin_time: i64,
    ctx: Arc<SessionContext>,
}

impl std::fmt::Debug for CallGraphBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallGraphBuilder")
            .field("threads", &self.threads.len())
            .field("servlets", &self.servlet_names.len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

impl CallGraphBuilder {
    pub fn new(
        resolver: Arc<dyn MethodNameResolver>,
        filter: Option<Arc<dyn InstrumentationFilter>>,
        options: BuilderOptions,
        ctx: Arc<SessionContext>,
    ) -> Self {
        Self {
            threads: BTreeMap::new(),
            resolver,
            filter,
            filter_cache: Mutex::new(HashMap::new()),
            servlets: HashMap::new(),
            servlet_names: Vec::new(),
            next_servlet_id: FIRST_SERVLET_ID,
            suspended_at: None,
            stack_mismatch_logged: AtomicBool::new(false),
            options,
            begin_time: now_millis(),
            ctx,
        }
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub fn options(&self) -> BuilderOptions {
        self.options
    }

    /// Wall-clock start of the current epoch, in milliseconds since the Unix
    /// epoch.
    pub fn begin_time(&self) -> i64 {
        self.begin_time
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn thread_ids(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.threads.keys().copied()
    }

    /// Locks one thread's state.
    pub fn thread(&self, id: ThreadId) -> Option<MutexGuard<'_, ThreadState>> {
        self.threads.get(&id).map(Mutex::lock)
    }

    /// Locks each thread in id order and hands it to `f`.
    pub fn for_each_thread(&self, mut f: impl FnMut(&ThreadState)) {
        for state in self.threads.values() {
            f(&state.lock());
        }
    }

    /// Name table covering every instrumented method plus the synthetic
    /// servlet boundary names.
    pub fn method_table(&self) -> MethodTable {
        let mut table = MethodTable::new();
        for id in 1..self.resolver.method_count() {
            let Ok(id) = MethodId::try_from(id) else {
                break;
            };
            if let Some(name) = self.resolver.resolve(id) {
                table.set(id, name);
            }
        }
        for (id, name) in &self.servlet_names {
            table.set(*id, name.clone());
        }
        table
    }

    pub fn synthetic_names(&self) -> &[(MethodId, MethodName)] {
        &self.servlet_names
    }

    /// Processes a thread-scoped event with shared access only. Returns
    /// [`Ingest::NeedsExclusive`] without side effects for events that
    /// mutate shared state.
    pub fn process_shared(&self, event: &CallEvent) -> Ingest {
        match event {
            CallEvent::NewThread { .. }
            | CallEvent::ThreadsSuspend { .. }
            | CallEvent::ThreadsResume { .. } => Ingest::NeedsExclusive,
            CallEvent::ServletRequest { path, .. } if !self.servlets.contains_key(path) => {
                Ingest::NeedsExclusive
            }
            _ => {
                self.apply_thread_event(event);
                Ingest::Done
            }
        }
    }

    /// Processes any event. Requires exclusive access to the builder.
    pub fn process(&mut self, event: &CallEvent) {
        match event {
            CallEvent::NewThread { thread, name } => {
                self.ctx.add_events(1);
                match self.threads.get_mut(thread) {
                    Some(existing) => {
                        debug!(thread, name = name.as_str(), "thread announced twice, keeping state");
                        existing.get_mut().name.clone_from(name);
                    }
                    None => {
                        debug!(thread, name = name.as_str(), "new thread");
                        self.threads
                            .insert(*thread, Mutex::new(ThreadState::new(*thread, name.clone())));
                    }
                }
            }
            CallEvent::ThreadsSuspend { time } => {
                self.ctx.add_events(1);
                for state in self.threads.values_mut() {
                    state.get_mut().suspend(*time);
                }
                self.suspended_at = Some(*time);
            }
            CallEvent::ThreadsResume { time } => {
                self.ctx.add_events(1);
                let Some(start) = self.suspended_at.take() else {
                    trace!(time, "resume without suspend");
                    self.ctx.add_ignored_events(1);
                    return;
                };
                let pause = time.saturating_sub(start);
                for state in self.threads.values_mut() {
                    state.get_mut().resume(*time, pause);
                }
            }
            CallEvent::ServletRequest { path, .. } => {
                if !self.servlets.contains_key(path) {
                    self.allocate_servlet(path);
                }
                self.apply_thread_event(event);
            }
            _ => self.apply_thread_event(event),
        }
    }

    pub fn process_all<'e>(&mut self, events: impl IntoIterator<Item = &'e CallEvent>) {
        for event in events {
            self.process(event);
        }
    }

    /// Drops every thread and starts a new epoch.
    pub fn reset(&mut self) {
        self.threads.clear();
        self.filter_cache.get_mut().clear();
        self.servlets.clear();
        self.servlet_names.clear();
        self.next_servlet_id = FIRST_SERVLET_ID;
        self.suspended_at = None;
        self.stack_mismatch_logged.store(false, Ordering::Relaxed);
        self.begin_time = now_millis();
    }

    fn allocate_servlet(&mut self, path: &str) {
        let id = self.next_servlet_id;
        if id == THREAD_METHOD_ID || usize::from(id) < self.resolver.method_count() {
            warn!(path, "servlet id space exhausted");
            return;
        }
        self.next_servlet_id -= 1;
        self.servlets.insert(path.to_owned(), id);
        self.servlet_names
            .push((id, MethodName::new("[servlet]", path, "")));
    }

    fn filter_status(&self, method: MethodId) -> FilterStatus {
        let Some(filter) = &self.filter else {
            return FilterStatus::Passed;
        };
        let mut cache = self.filter_cache.lock();
        *cache.entry(method).or_insert_with(|| {
            // Unresolvable methods stay visible; hiding them would lose time.
            match self.resolver.resolve(method) {
                Some(name) if !filter.passes(name.class.as_str()) => FilterStatus::Filtered,
                _ => FilterStatus::Passed,
            }
        })
    }

    fn apply_thread_event(&self, event: &CallEvent) {
        self.ctx.add_events(1);
        let Some(thread) = event.thread() else {
            return;
        };
        let Some(state) = self.threads.get(&thread) else {
            self.ctx.add_ignored_events(1);
            return;
        };

        let transition = match event {
            CallEvent::MethodEntry {
                method,
                kind,
                stamp,
                ..
            } => {
                let status = self.filter_status(*method);
                state.lock().enter(*method, *kind, *stamp, status)
            }
            CallEvent::MethodExit { method, stamp, .. } => state.lock().exit(*method, *stamp),
            CallEvent::BlockEntry { reason, stamp, .. } => {
                state.lock().block_entry(*reason, *stamp)
            }
            CallEvent::BlockExit { reason, stamp, .. } => {
                let excluded = match reason {
                    callprof_protocol::BlockReason::Sleep => self.options.exclude_sleep_time,
                    _ => self.options.exclude_wait_time,
                };
                state.lock().block_exit(*stamp, !excluded)
            }
            CallEvent::TimeAdjust { delta, .. } => {
                state.lock().adjust_time(*delta);
                Transition::Applied
            }
            CallEvent::ServletRequest { path, .. } => match self.servlets.get(path) {
                Some(id) => state.lock().open_servlet(*id),
                None => Transition::Ignored,
            },
            CallEvent::NewThread { .. }
            | CallEvent::ThreadsSuspend { .. }
            | CallEvent::ThreadsResume { .. } => Transition::Ignored,
        };

        match transition {
            Transition::Applied => {}
            Transition::RootReentered => {
                debug!(thread, "root method entered while already in a root method");
            }
            Transition::Ignored => {
                trace!(thread, ?event, "event ignored in current state");
                self.ctx.add_ignored_events(1);
            }
            Transition::Mismatch { on_stack } => {
                self.ctx.add_stack_mismatches(1);
                if !self.stack_mismatch_logged.swap(true, Ordering::Relaxed) {
                    warn!(
                        thread,
                        ?event,
                        on_stack,
                        "exit does not match the method on top of the stack; dropping it"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CallTree;
    use callprof_protocol::{BlockReason, MethodType, Timestamps};

    struct Names(Vec<MethodName>);

    impl MethodNameResolver for Names {
        fn method_count(&self) -> usize {
            self.0.len() + 1
        }

        fn resolve(&self, id: MethodId) -> Option<MethodName> {
            self.0.get(usize::from(id).checked_sub(1)?).cloned()
        }
    }

    fn names() -> Arc<Names> {
        Arc::new(Names(vec![
            MethodName::new("app.Main", "run", "()V"),
            MethodName::new("app.Work", "step", "()V"),
            MethodName::new("lib.Util", "helper", "()V"),
        ]))
    }

    fn builder() -> CallGraphBuilder {
        CallGraphBuilder::new(
            names(),
            None,
            BuilderOptions::default(),
            Arc::new(SessionContext::new()),
        )
    }

    fn ts(t: u64) -> Timestamps {
        Timestamps::abs_only(t)
    }

    fn new_thread(id: ThreadId) -> CallEvent {
        CallEvent::NewThread {
            thread: id,
            name: format!("t{id}"),
        }
    }

    #[test]
    fn events_for_unknown_threads_are_no_ops() {
        let mut b = builder();
        b.process(&CallEvent::entry(9, 1, MethodType::Root, ts(0)));
        assert_eq!(b.thread_count(), 0);
        assert_eq!(b.context().stats().ignored_events, 1);
    }

    #[test]
    fn builds_per_thread_trees() {
        let mut b = builder();
        b.process_all(&[
            new_thread(1),
            new_thread(2),
            CallEvent::entry(1, 1, MethodType::Root, ts(0)),
            CallEvent::entry(2, 2, MethodType::Root, ts(0)),
            CallEvent::entry(1, 2, MethodType::Normal, ts(10)),
            CallEvent::exit(1, 2, MethodType::Normal, ts(30)),
            CallEvent::exit(1, 1, MethodType::Root, ts(40)),
            CallEvent::exit(2, 2, MethodType::Root, ts(5)),
        ]);
        let t1 = b.thread(1).unwrap();
        let a = t1.tree().find_child(CallTree::ROOT, 1).unwrap();
        assert!(t1.tree().find_child(a, 2).is_some());
        assert_eq!(t1.gross_time[0], 40);
        drop(t1);
        let t2 = b.thread(2).unwrap();
        assert!(t2.tree().find_child(CallTree::ROOT, 2).is_some());
        assert_eq!(t2.gross_time[0], 5);
    }

    #[test]
    fn mismatches_are_counted_every_time() {
        let mut b = builder();
        b.process_all(&[
            new_thread(1),
            CallEvent::entry(1, 1, MethodType::Root, ts(0)),
            CallEvent::exit(1, 3, MethodType::Normal, ts(1)),
            CallEvent::exit(1, 3, MethodType::Normal, ts(2)),
        ]);
        assert_eq!(b.context().stats().stack_mismatches, 2);
        assert!(b.thread(1).unwrap().in_root());
    }

    #[test]
    fn structural_events_need_exclusive_access() {
        let b = builder();
        assert_eq!(b.process_shared(&new_thread(1)), Ingest::NeedsExclusive);
        assert_eq!(
            b.process_shared(&CallEvent::ThreadsSuspend { time: 1 }),
            Ingest::NeedsExclusive
        );
        assert_eq!(
            b.process_shared(&CallEvent::entry(1, 1, MethodType::Root, ts(0))),
            Ingest::Done
        );
    }

    #[test]
    fn suspension_applies_to_every_thread() {
        let mut b = builder();
        b.process_all(&[
            new_thread(1),
            new_thread(2),
            CallEvent::entry(1, 1, MethodType::Root, ts(0)),
            CallEvent::entry(2, 1, MethodType::Root, ts(0)),
            CallEvent::ThreadsSuspend { time: 10 },
            CallEvent::ThreadsResume { time: 110 },
            CallEvent::exit(1, 1, MethodType::Root, ts(120)),
            CallEvent::exit(2, 1, MethodType::Root, ts(130)),
        ]);
        for (id, expected) in [(1, 20), (2, 30)] {
            let t = b.thread(id).unwrap();
            let a = t.tree().find_child(CallTree::ROOT, 1).unwrap();
            assert_eq!(t.tree().node(a).net_time[0], expected);
            assert_eq!(t.gross_time[0], expected);
        }
    }

    #[test]
    fn wait_time_can_count_as_net_time() {
        let ctx = Arc::new(SessionContext::new());
        let options = BuilderOptions {
            exclude_wait_time: false,
            exclude_sleep_time: true,
        };
        let mut b = CallGraphBuilder::new(names(), None, options, ctx);
        b.process_all(&[
            new_thread(1),
            CallEvent::entry(1, 1, MethodType::Root, ts(0)),
            CallEvent::BlockEntry {
                thread: 1,
                reason: BlockReason::Wait,
                stamp: ts(10),
            },
            CallEvent::BlockExit {
                thread: 1,
                reason: BlockReason::Wait,
                stamp: ts(50),
            },
            CallEvent::exit(1, 1, MethodType::Root, ts(60)),
        ]);
        let t = b.thread(1).unwrap();
        let a = t.tree().node(t.tree().find_child(CallTree::ROOT, 1).unwrap());
        assert_eq!(a.wait_time[0], 40);
        assert_eq!(a.net_time[0], 60);
    }

    #[test]
    fn filtered_classes_are_tagged() {
        let filter: Arc<dyn InstrumentationFilter> =
            Arc::new(|class: &str| !class.starts_with("lib."));
        let mut b = CallGraphBuilder::new(
            names(),
            Some(filter),
            BuilderOptions::default(),
            Arc::new(SessionContext::new()),
        );
        b.process_all(&[
            new_thread(1),
            CallEvent::entry(1, 1, MethodType::Root, ts(0)),
            CallEvent::entry(1, 3, MethodType::Normal, ts(1)),
            CallEvent::exit(1, 3, MethodType::Normal, ts(2)),
            CallEvent::exit(1, 1, MethodType::Root, ts(3)),
        ]);
        let t = b.thread(1).unwrap();
        assert!(t.tree().has_filtered());
        let a = t.tree().find_child(CallTree::ROOT, 1).unwrap();
        assert_eq!(t.tree().node(a).status, FilterStatus::Passed);
    }

    #[test]
    fn servlet_requests_get_synthetic_names() {
        let mut b = builder();
        b.process_all(&[
            new_thread(1),
            CallEvent::ServletRequest {
                thread: 1,
                kind: 0,
                path: "/index".into(),
            },
            CallEvent::entry(1, 1, MethodType::Root, ts(0)),
            CallEvent::exit(1, 1, MethodType::Root, ts(4)),
        ]);
        let table = b.method_table();
        assert_eq!(
            table.display_name(FIRST_SERVLET_ID).as_str(),
            "[servlet]./index"
        );
        let t = b.thread(1).unwrap();
        assert!(t.tree().find_child(CallTree::ROOT, FIRST_SERVLET_ID).is_some());
    }

    #[test]
    fn reset_starts_a_new_epoch() {
        let mut b = builder();
        b.process_all(&[
            new_thread(1),
            CallEvent::entry(1, 1, MethodType::Root, ts(0)),
            CallEvent::exit(1, 2, MethodType::Normal, ts(1)),
        ]);
        b.reset();
        assert_eq!(b.thread_count(), 0);
        assert!(b.synthetic_names().is_empty());
        assert!(!b.stack_mismatch_logged.load(Ordering::Relaxed));
    }
}
