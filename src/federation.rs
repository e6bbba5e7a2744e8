//! Fans one query out to the selected backends and merges their graphs.
//!
//! Every compiled query runs as its own task. The tasks of one backend share
//! a [`BackendRun`]: one relation collector, one statistics accumulator and
//! one result cap. When the backend's unique relation count reaches the cap
//! its tasks drop their record streams and the backend contributes
//! statistics instead of relations.

use crate::ast::Query;
use crate::cache::{cache_key, CacheEntry, CacheStore, MemoryCache};
use crate::compiler::NativeQuery;
use crate::config::{ServerConfig, GLOBAL_SOURCE};
use crate::error::{ConfigError, ExecutionError};
use crate::extract::{extract_relations, RelationCollector};
use crate::normalizer::{prepare, specialize, target_source};
use crate::processor::PostProcessor;
use crate::record::Record;
use crate::registry::{Backend, BackendRegistry};
use crate::relation::{GraphRelation, RelationDefinition};
use crate::stats::{SourceStats, StatsAccumulator};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct SearchLimits {
    /// Upper bound for `LIMIT` rowcounts
    pub max_rowcount: u64,
    /// Unique relations one backend may collect before it is truncated
    pub result_cap: usize,
}

impl SearchLimits {
    pub fn uniform(limit: u64) -> Self {
        Self {
            max_rowcount: limit,
            result_cap: usize::try_from(limit).unwrap_or(usize::MAX),
        }
    }
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self::uniform(500)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Cancelling stops every task of the search
    pub cancel: CancellationToken,
}

impl SearchOptions {
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self { cancel }
    }
}

/// Merged outcome of one search
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub relations: Vec<GraphRelation>,
    /// Backend name → top values, for backends that hit the result cap
    pub stats: BTreeMap<String, SourceStats>,
    pub truncated: bool,
    /// Backend name → native queries sent
    pub debug: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AggregateResult {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    fn from_cache(entry: CacheEntry) -> Self {
        Self {
            truncated: !entry.stats.is_empty(),
            relations: entry.relations,
            stats: entry.stats,
            ..Self::default()
        }
    }
}

/// Progress of one backend, shared by the tasks of its compiled queries
struct BackendRun {
    backend: Arc<Backend>,
    cap: usize,
    /// Child of the search token, cancelled once the cap is reached
    cancel: CancellationToken,
    progress: Mutex<BackendProgress>,
}

#[derive(Default)]
struct BackendProgress {
    collector: RelationCollector,
    stats: StatsAccumulator,
    truncated: bool,
}

impl BackendRun {
    fn new(backend: Arc<Backend>, cap: usize, search: &CancellationToken) -> Self {
        let progress = BackendProgress {
            stats: StatsAccumulator::new(&backend.config.stats_fields),
            ..BackendProgress::default()
        };
        Self {
            backend,
            cap,
            cancel: search.child_token(),
            progress: Mutex::new(progress),
        }
    }

    fn is_truncated(&self) -> bool {
        self.progress.lock().truncated
    }

    /// Adds one record. Returns `false` once the backend is truncated; the
    /// record that finds the cap reached cancels the sibling tasks.
    fn accept(&self, definitions: &[RelationDefinition], record: &Record) -> bool {
        let mut progress = self.progress.lock();
        if progress.truncated {
            return false;
        }
        if progress.collector.len() >= self.cap {
            progress.truncated = true;
            self.cancel.cancel();
            return false;
        }
        progress.stats.update(record);
        extract_relations(self.backend.name(), definitions, record, &mut progress.collector);
        true
    }

    fn finish(&self) -> BackendProgress {
        std::mem::take(&mut *self.progress.lock())
    }
}

pub struct Federator {
    registry: Arc<BackendRegistry>,
    cache: Option<Arc<dyn CacheStore>>,
    processors: Vec<Box<dyn PostProcessor>>,
    limits: SearchLimits,
}

impl Federator {
    pub fn new(registry: Arc<BackendRegistry>, limits: SearchLimits) -> Self {
        Self {
            registry,
            cache: None,
            processors: Vec::new(),
            limits,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self, ConfigError> {
        let registry = Arc::new(BackendRegistry::from_config(&config.sources));
        let mut federator = Self::new(registry, SearchLimits::uniform(config.limit));

        if config.cache.enabled {
            federator = federator.with_cache(Arc::new(MemoryCache::with_ttl(chrono::Duration::seconds(
                config.cache.ttl_seconds,
            ))));
        }
        for definition in &config.processors {
            let processor = definition
                .clone()
                .build()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            federator = federator.with_processor(processor);
        }
        Ok(federator)
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Processors run in the order they are added
    pub fn with_processor(mut self, processor: Box<dyn PostProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn limits(&self) -> SearchLimits {
        self.limits
    }

    /// Searches the source named in the query's `FROM` clause
    pub async fn query(&self, raw: &str, options: &SearchOptions) -> AggregateResult {
        match target_source(raw) {
            Ok(source) => self.search(&source, raw, options).await,
            Err(e) => AggregateResult::failed(e.to_string()),
        }
    }

    /// Searches one backend, or every global-eligible backend when `source`
    /// is `global`. Never fails as a whole: errors end up in
    /// [`AggregateResult::error`] next to whatever was collected.
    pub async fn search(&self, source: &str, raw: &str, options: &SearchOptions) -> AggregateResult {
        let mut warnings = Vec::new();

        let key = cache_key(raw);
        if let Some(cache) = &self.cache {
            match cache.get(&key).await {
                Ok(Some(entry)) => {
                    tracing::info!(source, sql = raw, "query from cache");
                    return AggregateResult::from_cache(entry);
                }
                Ok(None) => {}
                Err(e) => warnings.push(format!("Can't query cache: {}", e)),
            }
        }

        let backends = if source == GLOBAL_SOURCE {
            self.registry.eligible_for_global()
        } else {
            match self.registry.lookup(source) {
                Some(backend) => vec![backend],
                None => return AggregateResult::failed("Unknown data source requested"),
            }
        };

        let query = match prepare(raw, self.limits.max_rowcount) {
            Ok(query) => query,
            Err(e) => {
                tracing::warn!(source, sql = raw, error = %e, "invalid query");
                return AggregateResult::failed(e.to_string());
            }
        };

        let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut debug: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut runs = Vec::new();
        let mut tasks = JoinSet::new();

        for backend in backends {
            let run = Arc::new(BackendRun::new(Arc::clone(&backend), self.limits.result_cap, &options.cancel));
            for native in self.compile_for(&backend, &query, &errors) {
                tracing::info!(source = %backend.name(), sql = raw, native = %native, "new request");
                debug.entry(backend.name().to_string()).or_default().push(native.to_string());
                tasks.spawn(run_task(Arc::clone(&run), native, Arc::clone(&errors)));
            }
            runs.push(run);
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                errors.lock().push(format!("search task failed: {}", e));
            }
        }

        let mut collector = RelationCollector::new();
        let mut stats: BTreeMap<String, SourceStats> = BTreeMap::new();
        let mut truncated = false;
        for run in &runs {
            let progress = run.finish();
            if progress.truncated {
                tracing::info!(source = %run.backend.name(), cap = run.cap, "result cap reached, returning statistics");
                truncated = true;
                stats.insert(run.backend.name().to_string(), progress.stats.top());
            } else {
                collector.merge(progress.collector);
            }
        }
        let mut relations = collector.into_relations();
        let errors = std::mem::take(&mut *errors.lock());

        for processor in &self.processors {
            if let Err(e) = processor.process(&mut relations) {
                tracing::warn!(plugin = processor.name(), error = %e, "post-processing failed");
                warnings.push(e.to_string());
            }
        }

        let failed = !errors.is_empty();
        if failed {
            tracing::error!(source, sql = raw, errors = ?errors, "search error");
        }
        tracing::debug!(source, relations = relations.len(), truncated, "search finished");

        if !failed && warnings.is_empty() {
            if let Some(cache) = &self.cache {
                let entry = CacheEntry::new(relations.clone(), stats.clone());
                if let Err(e) = cache.put(&key, entry).await {
                    tracing::warn!(error = %e, "can't cache search result");
                }
            }
        }

        let messages: Vec<String> = errors.into_iter().chain(warnings).collect();
        AggregateResult {
            relations,
            stats,
            truncated,
            debug,
            error: (!messages.is_empty()).then(|| messages.join("; ")),
        }
    }

    /// Native queries for one backend. Failures are recorded in `errors` and
    /// yield nothing.
    fn compile_for(&self, backend: &Backend, query: &Query, errors: &Mutex<Vec<String>>) -> Vec<NativeQuery> {
        let queries = match specialize(query, &backend.normalize_options()) {
            Ok(queries) => queries,
            Err(e) => {
                errors.lock().push(format!("{} - {}", backend.name(), e));
                return Vec::new();
            }
        };

        let mut compiled = Vec::with_capacity(queries.len());
        for query in &queries {
            match backend.compiler.compile(query) {
                Ok(result) => {
                    if !result.optimizations.is_empty() {
                        tracing::debug!(source = %backend.name(), optimizations = ?result.optimizations, "query optimized");
                    }
                    compiled.push(result.native);
                }
                Err(e) => errors.lock().push(format!("{} - {}", backend.name(), e)),
            }
        }
        compiled
    }
}

async fn run_task(run: Arc<BackendRun>, native: NativeQuery, errors: Arc<Mutex<Vec<String>>>) {
    let timeout = run.backend.timeout();
    let outcome = tokio::select! {
        _ = run.cancel.cancelled() => Err(ExecutionError::Cancelled),
        result = tokio::time::timeout(timeout, collect(&run, &native)) => {
            result.unwrap_or(Err(ExecutionError::Timeout(timeout)))
        }
    };

    match outcome {
        Ok(()) => {}
        // a sibling task reached the cap
        Err(ExecutionError::Cancelled) if run.is_truncated() => {}
        Err(e) => errors.lock().push(format!("{} - {}", run.backend.name(), e)),
    }
}

/// Streams the records of one native query into the backend's run. Returns
/// as soon as the backend is truncated, dropping the stream.
async fn collect(run: &BackendRun, native: &NativeQuery) -> Result<(), ExecutionError> {
    let backend = &run.backend;
    let definitions = backend.relations.snapshot();

    let mut records = backend.executor.execute(native).await?;
    while let Some(record) = records.next().await {
        let record = record?;
        if !run.accept(&definitions, &record) {
            break;
        }
        backend.observe(&record);
    }
    Ok(())
}
