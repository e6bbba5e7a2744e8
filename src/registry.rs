//! Registry mapping source names to their compiler and executor.

use crate::backends::build_backend;
use crate::compiler::QueryCompiler;
use crate::config::SourceConfig;
use crate::error::ExecutionError;
use crate::executor::Executor;
use crate::normalizer::NormalizeOptions;
use crate::record::Record;
use crate::relation::RelationSet;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// One configured source, ready to serve queries
pub struct Backend {
    pub config: SourceConfig,
    pub compiler: Box<dyn QueryCompiler>,
    pub executor: Box<dyn Executor>,
    pub relations: RelationSet,
}

impl Backend {
    pub fn new(config: SourceConfig, compiler: Box<dyn QueryCompiler>, executor: Box<dyn Executor>) -> Self {
        let relations = RelationSet::new(config.relations.clone());
        Self {
            config,
            compiler,
            executor,
            relations,
        }
    }

    pub fn from_config(config: SourceConfig) -> Result<Self, ExecutionError> {
        let (compiler, executor) = build_backend(&config)?;
        Ok(Self::new(config, compiler, executor))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn normalize_options(&self) -> NormalizeOptions<'_> {
        NormalizeOptions {
            include_datetime: self.config.include_datetime,
            rename: &self.config.replace_fields,
            supports_native_booleans: self.config.supports_native_booleans,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    /// Publishes the relation definition inferred from `record` when the
    /// source infers definitions and this one is new. Searches already
    /// running keep the snapshot they started with.
    pub fn observe(&self, record: &Record) {
        let definition = match self.config.infer_relations.as_ref().and_then(|i| i.infer(record)) {
            Some(definition) => definition,
            None => return,
        };
        if self.relations.contains(&definition) {
            return;
        }
        if self.relations.append([definition]) > 0 {
            tracing::debug!(source = %self.name(), definitions = self.relations.len(), "relation definition inferred");
        }
    }

    /// Physical field names translated back to user-facing ones
    pub async fn user_fields(&self) -> Result<Vec<String>, ExecutionError> {
        let reverse: HashMap<&str, &str> = self
            .config
            .replace_fields
            .iter()
            .map(|(user, physical)| (physical.as_str(), user.as_str()))
            .collect();
        let fields = self.executor.fields().await?;
        Ok(fields
            .into_iter()
            .map(|field| reverse.get(field.as_str()).map_or(field.clone(), |user| user.to_string()))
            .collect())
    }
}

pub type BackendMap = BTreeMap<String, Arc<Backend>>;

/// Readers work on a snapshot, so a reload never affects running searches.
#[derive(Default)]
pub struct BackendRegistry {
    backends: RwLock<Arc<BackendMap>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_backends(backends: impl IntoIterator<Item = Backend>) -> Self {
        let registry = Self::new();
        registry.reload(backends);
        registry
    }

    /// Builds every configured source. Sources that fail to set up are
    /// logged and left out.
    pub fn from_config(sources: &[SourceConfig]) -> Self {
        let backends = sources.iter().filter_map(|source| match Backend::from_config(source.clone()) {
            Ok(backend) => {
                tracing::info!(source = %source.name, "backend initialized");
                Some(backend)
            }
            Err(e) => {
                tracing::error!(source = %source.name, error = %e, "can't set up backend");
                None
            }
        });
        Self::from_backends(backends)
    }

    pub fn snapshot(&self) -> Arc<BackendMap> {
        Arc::clone(&self.backends.read())
    }

    /// Adds or replaces one backend
    pub fn register(&self, backend: Backend) {
        let mut current = self.backends.write();
        let mut next = BackendMap::clone(&current);
        next.insert(backend.name().to_string(), Arc::new(backend));
        *current = Arc::new(next);
    }

    /// Replaces the whole set of backends
    pub fn reload(&self, backends: impl IntoIterator<Item = Backend>) {
        let next: BackendMap = backends
            .into_iter()
            .map(|backend| (backend.name().to_string(), Arc::new(backend)))
            .collect();
        *self.backends.write() = Arc::new(next);
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Backend>> {
        self.backends.read().get(name).cloned()
    }

    pub fn eligible_for_global(&self) -> Vec<Arc<Backend>> {
        self.backends
            .read()
            .values()
            .filter(|backend| backend.config.in_global)
            .cloned()
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.backends.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Union of all backends' user-facing field names, sorted. Backends
    /// failing to list their fields are skipped.
    pub async fn field_list(&self) -> Vec<String> {
        let snapshot = self.snapshot();
        let mut fields = BTreeSet::new();
        for backend in snapshot.values() {
            match backend.user_fields().await {
                Ok(list) => fields.extend(list),
                Err(e) => tracing::warn!(source = %backend.name(), error = %e, "can't get fields"),
            }
        }
        fields.into_iter().collect()
    }
}
