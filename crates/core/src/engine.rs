//! The results engine: event ingestion, materialization and memoized views.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use callprof_protocol::{CallEvent, EventDecoder, MethodId};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::builder::{BuilderOptions, CallGraphBuilder, Ingest, ThreadState, now_millis};
use crate::compact::{CompactTree, encode_call_tree};
use crate::config::EngineConfig;
use crate::context::{SessionContext, SessionStats};
use crate::error::ProfilerError;
use crate::model::{
    CpuSnapshot, InstrumentationFilter, MethodNameResolver, ThreadData, ThreadSelector, ThreadTimes,
    ViewKind,
};
use crate::presentation::{FilterConfig, PresentationTree};
use crate::timing::{TimeStream, TimingAdjuster};
use crate::views::{FlatProfile, ReverseTree};

/// Memoization key of a derived view.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ViewKey {
    view: ViewKind,
    selector: ThreadSelector,
    method: Option<MethodId>,
    filter: FilterConfig,
}

#[derive(Default)]
struct ViewCache {
    generation: u64,
    presentation: HashMap<ViewKey, Arc<PresentationTree>>,
    flat: HashMap<ViewKey, Arc<FlatProfile>>,
    reverse: HashMap<ViewKey, Arc<ReverseTree>>,
}

impl ViewCache {
    fn clear(&mut self, generation: u64) {
        self.generation = generation;
        self.presentation.clear();
        self.flat.clear();
        self.reverse.clear();
    }
}

#[derive(Default)]
struct Current {
    generation: u64,
    snapshot: Option<Arc<CpuSnapshot>>,
}

/// Shared entry point for ingestion threads and query threads.
///
/// Ingestion takes the gate in shared mode for ordinary events and in
/// exclusive mode for events that change the thread table. Materialization
/// holds the shared gate, so it sees whole events only. Reset takes it
/// exclusively.
pub struct CpuResults {
    config: EngineConfig,
    adjuster: TimingAdjuster,
    ctx: Arc<SessionContext>,
    gate: RwLock<CallGraphBuilder>,
    current: Mutex<Current>,
    cache: Mutex<ViewCache>,
}

impl std::fmt::Debug for CpuResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuResults")
            .field("config", &self.config)
            .field("generation", &self.current.lock().generation)
            .finish_non_exhaustive()
    }
}

impl CpuResults {
    pub fn new(
        config: EngineConfig,
        resolver: Arc<dyn MethodNameResolver>,
        filter: Option<Arc<dyn InstrumentationFilter>>,
    ) -> Self {
        let ctx = Arc::new(SessionContext::new());
        let options = BuilderOptions {
            exclude_wait_time: config.exclude_wait_time,
            exclude_sleep_time: config.exclude_sleep_time,
        };
        Self {
            adjuster: TimingAdjuster::new(config.calibration.clone()),
            gate: RwLock::new(CallGraphBuilder::new(resolver, filter, options, Arc::clone(&ctx))),
            ctx,
            config,
            current: Mutex::new(Current::default()),
            cache: Mutex::new(ViewCache::default()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub fn stats(&self) -> SessionStats {
        self.ctx.stats()
    }

    pub fn process_event(&self, event: &CallEvent) {
        let outcome = self.gate.read().process_shared(event);
        if outcome == Ingest::NeedsExclusive {
            self.gate.write().process(event);
        }
    }

    pub fn process_events<'e>(&self, events: impl IntoIterator<Item = &'e CallEvent>) {
        for event in events {
            self.process_event(event);
        }
    }

    /// Decodes and processes a raw event buffer. Events before a truncated
    /// record are kept; the error reports how many were applied.
    pub fn process_buffer(&self, buf: &[u8]) -> Result<usize, ProfilerError> {
        let mut decoder = EventDecoder::new(buf, self.config.two_timestamps);
        let mut processed = 0;
        let mut failure = None;
        for item in decoder.by_ref() {
            match item {
                Ok(event) => {
                    self.process_event(&event);
                    processed += 1;
                }
                Err(e) => {
                    warn!(error = %e, processed, "event buffer cut short");
                    failure = Some(e);
                    break;
                }
            }
        }
        self.ctx.add_unknown_tags(decoder.unknown_tags());
        self.ctx.add_malformed_strings(decoder.malformed_strings());
        match failure {
            Some(source) => Err(ProfilerError::PartialBuffer { processed, source }),
            None => Ok(processed),
        }
    }

    fn thread_times(&self, state: &ThreadState, tree: &CompactTree) -> ThreadTimes {
        let streams = if self.config.two_timestamps { 2 } else { 1 };
        let mut times = ThreadTimes {
            total_invocations: state.total_invocations,
            display_whole_thread_cpu: self.config.two_timestamps && self.config.thread_cpu_timer_on,
            ..ThreadTimes::default()
        };
        for &stream in &TimeStream::ALL[..streams] {
            let i = stream.index();
            let raw = state.gross_time[i];
            times.gross_time[i] = self.adjuster.counts_to_micros(raw, stream);
            times.pure_time[i] = self
                .adjuster
                .cleanse_gross(raw, state.total_invocations, stream)
                .micros;
            times.net_time[i] = tree.total_time(tree.root(), stream);
        }
        times
    }

    fn build_snapshot(&self, builder: &CallGraphBuilder) -> Result<CpuSnapshot, ProfilerError> {
        let two_timestamps = self.config.two_timestamps;
        let mut threads = Vec::with_capacity(builder.thread_count());
        let mut has_data = false;
        builder.for_each_thread(|state| {
            let tree = encode_call_tree(state.tree(), two_timestamps, &self.adjuster, &self.ctx);
            has_data |= !tree.is_empty();
            let times = self.thread_times(state, &tree);
            threads.push(ThreadData::new(state.id(), state.name(), tree, times));
        });
        if !has_data {
            return Err(ProfilerError::NoDataAvailable);
        }
        debug!(threads = threads.len(), "snapshot materialized");
        Ok(CpuSnapshot::new(
            builder.begin_time(),
            now_millis().saturating_sub(builder.begin_time()),
            two_timestamps,
            builder.method_table(),
            threads,
        ))
    }

    fn publish(&self, snapshot: CpuSnapshot) -> Arc<CpuSnapshot> {
        let snapshot = Arc::new(snapshot);
        let generation = {
            let mut current = self.current.lock();
            current.generation += 1;
            current.snapshot = Some(Arc::clone(&snapshot));
            current.generation
        };
        self.cache.lock().clear(generation);
        snapshot
    }

    /// Freezes every thread's tree into a new snapshot. Ingestion may go on
    /// afterwards; the snapshot does not change.
    pub fn materialize(&self) -> Result<Arc<CpuSnapshot>, ProfilerError> {
        let snapshot = {
            let builder = self.gate.read();
            self.build_snapshot(&builder)?
        };
        Ok(self.publish(snapshot))
    }

    /// Materializes and starts a new epoch in one step, so no event falls
    /// between the two.
    pub fn materialize_and_reset(&self) -> Result<Arc<CpuSnapshot>, ProfilerError> {
        let snapshot = {
            let mut builder = self.gate.write();
            let snapshot = self.build_snapshot(&builder)?;
            builder.reset();
            snapshot
        };
        Ok(self.publish(snapshot))
    }

    /// Most recent snapshot, if one was materialized in this epoch.
    pub fn snapshot(&self) -> Option<Arc<CpuSnapshot>> {
        self.current.lock().snapshot.clone()
    }

    /// Discards every thread, the current snapshot, all cached views and the
    /// session counters.
    pub fn reset(&self) {
        let mut builder = self.gate.write();
        builder.reset();
        let generation = {
            let mut current = self.current.lock();
            current.generation += 1;
            current.snapshot = None;
            current.generation
        };
        self.cache.lock().clear(generation);
        self.ctx.reset();
        debug!("results reset");
    }

    /// Current snapshot and its generation, materializing one if needed.
    fn current(&self) -> Result<(Arc<CpuSnapshot>, u64), ProfilerError> {
        {
            let current = self.current.lock();
            if let Some(snapshot) = &current.snapshot {
                return Ok((Arc::clone(snapshot), current.generation));
            }
        }
        self.materialize()?;
        let current = self.current.lock();
        match &current.snapshot {
            Some(snapshot) => Ok((Arc::clone(snapshot), current.generation)),
            None => Err(ProfilerError::NoDataAvailable),
        }
    }

    fn memoized<T>(
        &self,
        generation: u64,
        key: ViewKey,
        slot: fn(&mut ViewCache) -> &mut HashMap<ViewKey, Arc<T>>,
        compute: impl FnOnce() -> Result<T, ProfilerError>,
    ) -> Result<Arc<T>, ProfilerError> {
        {
            let mut cache = self.cache.lock();
            if cache.generation != generation {
                cache.clear(generation);
            }
            if let Some(hit) = slot(&mut cache).get(&key) {
                return Ok(Arc::clone(hit));
            }
        }
        let value = Arc::new(compute()?);
        let mut cache = self.cache.lock();
        if cache.generation == generation {
            return Ok(Arc::clone(slot(&mut cache).entry(key).or_insert(value)));
        }
        Ok(value)
    }

    pub fn presentation_root(
        &self,
        view: ViewKind,
        selector: ThreadSelector,
        filter: FilterConfig,
    ) -> Result<Arc<PresentationTree>, ProfilerError> {
        let (snapshot, generation) = self.current()?;
        let key = ViewKey {
            view,
            selector,
            method: None,
            filter: filter.clone(),
        };
        self.memoized(generation, key, |c| &mut c.presentation, || {
            snapshot.presentation(view, selector, self.config.sort, filter)
        })
    }

    pub fn flat_profile(&self, view: ViewKind, selector: ThreadSelector) -> Result<Arc<FlatProfile>, ProfilerError> {
        let (snapshot, generation) = self.current()?;
        let key = ViewKey {
            view,
            selector,
            method: None,
            filter: FilterConfig::default(),
        };
        self.memoized(generation, key, |c| &mut c.flat, || {
            snapshot.flat_profile(view, selector, &self.ctx)
        })
    }

    pub fn reverse_tree(
        &self,
        view: ViewKind,
        selector: ThreadSelector,
        method: MethodId,
    ) -> Result<Arc<ReverseTree>, ProfilerError> {
        let (snapshot, generation) = self.current()?;
        let key = ViewKey {
            view,
            selector,
            method: Some(method),
            filter: FilterConfig::default(),
        };
        self.memoized(generation, key, |c| &mut c.reverse, || {
            snapshot.reverse_tree(view, selector, method, self.config.sort)
        })
    }
}
