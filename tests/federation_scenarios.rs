use async_trait::async_trait;
use futures::StreamExt;
use query_federator::backends::{DocumentExecutor, KeyValueExecutor};
use query_federator::cache::{CacheEntry, CacheStore, MemoryCache};
use query_federator::compiler::NativeQuery;
use query_federator::config::SourceConfig;
use query_federator::document_compiler::DocumentCompiler;
use query_federator::executor::{Executor, RecordStream};
use query_federator::lookup_compiler::LookupCompiler;
use query_federator::normalizer::prepare;
use query_federator::processor::ProcessorDefinition;
use query_federator::record::Record;
use query_federator::relation::GraphRelation;
use query_federator::error::CacheError;
use query_federator::{
    AggregateResult, Backend, BackendRegistry, ExecutionError, Federator, SearchLimits, SearchOptions,
};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn relations() -> Value {
    json!([{
        "from": { "id": "ip", "group": "ip", "search": "ip", "attributes": ["asn"] },
        "to": { "id": "domain", "group": "domain", "search": "domain" }
    }])
}

fn source(name: &str, in_global: bool, extra: Value) -> SourceConfig {
    let mut config = json!({
        "name": name,
        "inGlobal": in_global,
        "supportsSQL": true,
        "statsFields": ["port"],
        "relations": relations(),
        "backend": { "type": "document", "path": "unused.json" }
    });
    if let (Some(target), Some(extra)) = (config.as_object_mut(), extra.as_object()) {
        target.extend(extra.clone());
    }
    serde_json::from_value(config).unwrap()
}

fn records(value: Value) -> Vec<Record> {
    serde_json::from_value(value).unwrap()
}

fn dns_records() -> Vec<Record> {
    records(json!([
        { "ip": "1.1.1.1", "domain": "one.one", "asn": 13335, "port": 53 },
        { "ip": "8.8.8.8", "domain": "dns.google", "asn": 15169, "port": 53 },
        { "ip": "9.9.9.9", "domain": "quad9.net", "asn": 19281, "port": 443 }
    ]))
}

fn document(name: &str, in_global: bool, documents: Vec<Record>) -> Backend {
    Backend::new(
        source(name, in_global, json!({})),
        Box::new(DocumentCompiler::new()),
        Box::new(DocumentExecutor::new(documents)),
    )
}

fn keyvalue(name: &str, documents: Vec<Record>) -> Backend {
    Backend::new(
        source(name, true, json!({ "supportsSQL": false })),
        Box::new(LookupCompiler::new("ip")),
        Box::new(KeyValueExecutor::new("ip", documents)),
    )
}

fn custom(name: &str, extra: Value, executor: impl Executor + 'static) -> Backend {
    Backend::new(source(name, true, extra), Box::new(DocumentCompiler::new()), Box::new(executor))
}

fn federator(backends: impl IntoIterator<Item = Backend>) -> Federator {
    Federator::new(Arc::new(BackendRegistry::from_backends(backends)), SearchLimits::default())
}

async fn search(federator: &Federator, source: &str, raw: &str) -> AggregateResult {
    federator.search(source, raw, &SearchOptions::default()).await
}

/// `(from, to, from attributes)` of every relation, ignoring the source
fn triples(relations: &[GraphRelation]) -> BTreeSet<(String, String, String)> {
    relations
        .iter()
        .map(|r| {
            (
                r.from.id.to_string(),
                r.to.id.to_string(),
                serde_json::to_string(&r.from.attributes).unwrap(),
            )
        })
        .collect()
}

/// Yields distinct records forever
struct Endless;

#[async_trait]
impl Executor for Endless {
    async fn execute(&self, _query: &NativeQuery) -> Result<RecordStream, ExecutionError> {
        let stream = futures::stream::iter(0u64..).map(|i| {
            Ok::<Record, ExecutionError>(serde_json::from_value(json!({
                "ip": format!("10.0.0.{}", i),
                "domain": "flood.example",
                "port": i % 3
            }))
            .unwrap())
        });
        Ok(stream.boxed())
    }

    async fn fields(&self) -> Result<Vec<String>, ExecutionError> {
        Ok(Vec::new())
    }
}

/// Never produces anything
struct Stalled;

#[async_trait]
impl Executor for Stalled {
    async fn execute(&self, _query: &NativeQuery) -> Result<RecordStream, ExecutionError> {
        Ok(futures::stream::pending::<Result<Record, ExecutionError>>().boxed())
    }

    async fn fields(&self) -> Result<Vec<String>, ExecutionError> {
        Ok(Vec::new())
    }
}

struct Broken;

#[async_trait]
impl Executor for Broken {
    async fn execute(&self, _query: &NativeQuery) -> Result<RecordStream, ExecutionError> {
        Err(ExecutionError::Backend("connection refused".to_string()))
    }

    async fn fields(&self) -> Result<Vec<String>, ExecutionError> {
        Err(ExecutionError::Backend("connection refused".to_string()))
    }
}

/// Counts executions of the wrapped executor
struct Counting {
    inner: DocumentExecutor,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Executor for Counting {
    async fn execute(&self, query: &NativeQuery) -> Result<RecordStream, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(query).await
    }

    async fn fields(&self) -> Result<Vec<String>, ExecutionError> {
        self.inner.fields().await
    }
}

/// A cache whose store is down
struct OfflineCache;

#[async_trait]
impl CacheStore for OfflineCache {
    async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Err(CacheError::Unavailable("connection reset".to_string()))
    }

    async fn put(&self, _key: &str, _entry: CacheEntry) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("connection reset".to_string()))
    }
}

#[test]
fn scenario_a_limit_is_normalized() {
    let query = prepare("FROM ips WHERE ip='8.8.8.8' LIMIT 5,1", 500).unwrap();
    assert_eq!(query.offset, 5);
    assert_eq!(query.rowcount, 1);
}

#[tokio::test]
async fn scenario_b_disjunction_is_split_in_order() {
    let federator = federator([keyvalue("kv", dns_records())]);
    let result = search(&federator, "kv", "FROM kv WHERE ip='1.1.1.1' OR ip='8.8.8.8' OR ip='9.9.9.9'").await;

    assert_eq!(result.error, None);
    assert_eq!(result.debug["kv"], vec!["ip=1.1.1.1", "ip=8.8.8.8", "ip=9.9.9.9"]);
    assert_eq!(result.relations.len(), 3);
}

#[tokio::test]
async fn split_queries_match_native_disjunction() {
    let federator = federator([document("doc", true, dns_records()), keyvalue("kv", dns_records())]);
    let predicate = "WHERE ip='1.1.1.1' OR (ip='9.9.9.9' OR ip='7.7.7.7')";

    let native = search(&federator, "doc", &format!("FROM doc {}", predicate)).await;
    let split = search(&federator, "kv", &format!("FROM kv {}", predicate)).await;

    assert_eq!(split.debug["kv"].len(), 3);
    assert_eq!(native.debug["doc"].len(), 1);
    assert_eq!(triples(&native.relations), triples(&split.relations));
    assert_eq!(native.relations.len(), 2);
}

#[tokio::test]
async fn scenario_c_identical_relations_collapse_across_backends() {
    let record = || records(json!([{ "ip": "1.2.3.4", "domain": "evil.com", "asn": 64500 }]));
    let federator = federator([document("first", true, record()), document("second", true, record())]);

    let result = search(&federator, "global", "FROM global WHERE ip='1.2.3.4'").await;
    assert_eq!(result.error, None);
    assert_eq!(result.relations.len(), 1);
}

#[tokio::test]
async fn scenario_c_differing_attributes_are_both_kept() {
    let federator = federator([
        document("first", true, records(json!([{ "ip": "1.2.3.4", "domain": "evil.com", "asn": 1 }]))),
        document("second", true, records(json!([{ "ip": "1.2.3.4", "domain": "evil.com", "asn": 2 }]))),
    ]);

    let result = search(&federator, "global", "FROM global WHERE ip='1.2.3.4'").await;
    assert_eq!(result.relations.len(), 2);
}

#[tokio::test]
async fn scenario_d_like_compiles_to_anchored_prefix() {
    let federator = federator([document("doc", true, dns_records())]);
    let result = search(&federator, "doc", "FROM doc WHERE domain LIKE 'D%'").await;

    assert!(result.debug["doc"][0].contains(r#""$regex":"^D.*""#));
    assert!(result.debug["doc"][0].contains(r#""$options":"i""#));
    assert_eq!(result.relations.len(), 1);
    assert_eq!(result.relations[0].to.id, json!("dns.google"));
}

#[tokio::test]
async fn cap_replaces_relations_with_statistics() {
    let registry = BackendRegistry::from_backends([custom("endless", json!({}), Endless), document("doc", true, dns_records())]);
    let federator = Federator::new(Arc::new(registry), SearchLimits::uniform(5));

    let result = search(&federator, "global", "FROM global WHERE port = exist").await;

    assert!(result.truncated);
    assert_eq!(result.error, None);
    assert!(result.relations.iter().all(|r| r.source == "doc"));
    assert_eq!(result.relations.len(), 3);

    let ports = result.stats["endless"].get("port").unwrap();
    assert!(ports.len() <= 10);
    assert!(ports.windows(2).all(|w| w[0].count >= w[1].count));
    assert_eq!(ports.iter().map(|e| e.count).sum::<u64>(), 5);
    assert!(!result.stats.contains_key("doc"));
}

#[tokio::test]
async fn split_queries_share_one_cap_per_backend() {
    let documents = records(json!([
        { "ip": "1.1.1.1", "domain": "a.one" }, { "ip": "1.1.1.1", "domain": "b.one" },
        { "ip": "8.8.8.8", "domain": "a.google" }, { "ip": "8.8.8.8", "domain": "b.google" },
        { "ip": "9.9.9.9", "domain": "a.quad9" }, { "ip": "9.9.9.9", "domain": "b.quad9" }
    ]));
    let registry = BackendRegistry::from_backends([keyvalue("kv", documents)]);
    let federator = Federator::new(Arc::new(registry), SearchLimits::uniform(2));

    let result = search(&federator, "kv", "FROM kv WHERE ip IN ('1.1.1.1', '8.8.8.8', '9.9.9.9')").await;

    assert_eq!(result.error, None);
    assert_eq!(result.debug["kv"].len(), 3);
    assert!(result.truncated);
    assert!(result.relations.is_empty());
    assert!(result.stats.contains_key("kv"));
}

#[tokio::test]
async fn truncated_sub_query_discards_sibling_relations() {
    let documents = records(json!([
        { "ip": "1.1.1.1", "domain": "a.one", "port": 53 },
        { "ip": "1.1.1.1", "domain": "b.one", "port": 53 },
        { "ip": "1.1.1.1", "domain": "c.one", "port": 853 },
        { "ip": "8.8.8.8", "domain": "dns.google", "port": 53 }
    ]));
    let registry = BackendRegistry::from_backends([keyvalue("kv", documents), document("doc", true, dns_records())]);
    let federator = Federator::new(Arc::new(registry), SearchLimits::uniform(2));

    let result = search(&federator, "global", "FROM global WHERE ip='1.1.1.1' OR ip='8.8.8.8'").await;

    assert_eq!(result.error, None);
    assert!(result.truncated);
    assert!(result.relations.iter().all(|r| r.source == "doc"));
    assert_eq!(result.relations.len(), 2);
    assert!(result.stats.contains_key("kv"));
    assert!(!result.stats.contains_key("doc"));
}

#[tokio::test]
async fn inferred_relations_apply_to_later_searches() {
    let documents = records(json!([
        { "type": "ip-src", "ip-src": "1.2.3.4", "event": "42", "comment": "c2" },
        { "type": "domain", "domain": "evil.com", "event": "42" }
    ]));
    let typed = Backend::new(
        source(
            "typed",
            true,
            json!({
                "relations": [],
                "inferRelations": {
                    "typeField": "type",
                    "groups": { "ip-src": "ip" },
                    "fromAttributes": ["comment"],
                    "to": { "id": "event", "group": "event", "search": "event" }
                }
            }),
        ),
        Box::new(DocumentCompiler::new()),
        Box::new(DocumentExecutor::new(documents)),
    );
    let federator = federator([typed]);
    let raw = "FROM typed WHERE event='42'";

    let first = search(&federator, "typed", raw).await;
    assert_eq!(first.error, None);
    assert!(first.relations.is_empty());

    let backend = federator.registry().lookup("typed").unwrap();
    assert_eq!(backend.relations.len(), 2);

    let second = search(&federator, "typed", raw).await;
    assert_eq!(second.relations.len(), 2);
    let ip = second.relations.iter().find(|r| r.from.id == json!("1.2.3.4")).unwrap();
    assert_eq!(ip.from.group, "ip");
    assert_eq!(ip.to.id, json!("42"));
    assert_eq!(ip.from.attributes.as_ref().unwrap()["comment"], json!("c2"));
    assert_eq!(backend.relations.len(), 2);
}

#[tokio::test]
async fn global_skips_backends_not_in_global() {
    let federator = federator([document("public", true, dns_records()), document("private", false, dns_records())]);
    let result = search(&federator, "global", "FROM global WHERE ip='8.8.8.8'").await;

    assert!(result.debug.contains_key("public"));
    assert!(!result.debug.contains_key("private"));

    let direct = search(&federator, "private", "FROM private WHERE ip='8.8.8.8'").await;
    assert_eq!(direct.relations.len(), 1);
}

#[tokio::test]
async fn backend_errors_are_aggregated_without_losing_results() {
    let federator = federator([
        custom("broken", json!({}), Broken),
        document("doc", true, dns_records()),
        keyvalue("kv", dns_records()),
    ]);

    let result = search(&federator, "global", "FROM global WHERE ip='8.8.8.8' OR port=443").await;
    let error = result.error.unwrap();

    assert!(error.contains("broken - connection refused"));
    assert!(error.contains("kv - "));
    assert_eq!(result.relations.len(), 2);
}

#[tokio::test]
async fn unknown_source_and_invalid_query_fail_before_execution() {
    let calls = Arc::new(AtomicUsize::new(0));
    let executor = Counting { inner: DocumentExecutor::new(dns_records()), calls: Arc::clone(&calls) };
    let federator = federator([custom("doc", json!({}), executor)]);

    let unknown = search(&federator, "nope", "FROM nope WHERE ip='1.1.1.1'").await;
    assert_eq!(unknown.error.as_deref(), Some("Unknown data source requested"));

    let invalid = search(&federator, "doc", "SELECT DISTINCT * FROM doc WHERE ip='1.1.1.1'").await;
    assert!(invalid.error.unwrap().contains("DISTINCT"));
    assert!(invalid.debug.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn slow_backend_times_out() {
    let federator = federator([custom("slow", json!({ "timeoutSecs": 1 }), Stalled), document("doc", true, dns_records())]);
    let result = search(&federator, "global", "FROM global WHERE ip='1.1.1.1'").await;

    assert!(result.error.unwrap().starts_with("slow - query timed out"));
    assert_eq!(result.relations.len(), 1);
}

#[tokio::test]
async fn caller_cancellation_stops_every_task() {
    let federator = federator([custom("a", json!({}), Stalled), custom("b", json!({}), Stalled)]);
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
    }

    let result = federator
        .search("global", "FROM global WHERE ip='1.1.1.1'", &SearchOptions::with_cancel(cancel))
        .await;
    let error = result.error.unwrap();
    assert!(error.contains("a - search cancelled"));
    assert!(error.contains("b - search cancelled"));
}

#[tokio::test]
async fn cache_hit_skips_backends() {
    let calls = Arc::new(AtomicUsize::new(0));
    let executor = Counting { inner: DocumentExecutor::new(dns_records()), calls: Arc::clone(&calls) };
    let cache = Arc::new(MemoryCache::new());
    let federator = federator([custom("doc", json!({}), executor)]).with_cache(cache.clone());

    let first = search(
        &federator,
        "doc",
        "FROM doc WHERE port=53 AND datetime BETWEEN '2023-01-01T10:21:37.000Z' AND '2023-01-02T10:21:37.000Z'",
    )
    .await;
    let second = search(
        &federator,
        "doc",
        "FROM doc WHERE port=53 AND datetime BETWEEN '2023-01-01T10:25:00.000Z' AND '2023-01-02T10:25:00.000Z'",
    )
    .await;

    assert_eq!(first.error, None);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.relations, second.relations);
    assert!(second.debug.is_empty());
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn failed_searches_are_not_cached() {
    let cache = Arc::new(MemoryCache::new());
    let federator = federator([custom("broken", json!({}), Broken)]).with_cache(cache.clone());

    let result = search(&federator, "broken", "FROM broken WHERE ip='1.1.1.1'").await;
    assert!(result.error.is_some());
    assert!(cache.get("FROM broken WHERE ip='1.1.1.1'").await.unwrap().is_none());
}

#[tokio::test]
async fn unavailable_cache_is_a_warning() {
    let federator = federator([document("doc", true, dns_records())]).with_cache(Arc::new(OfflineCache));
    let result = search(&federator, "doc", "FROM doc WHERE ip='8.8.8.8'").await;

    assert_eq!(result.error.as_deref(), Some("Can't query cache: cache store unavailable: connection reset"));
    assert_eq!(result.relations.len(), 1);
}

#[tokio::test]
async fn processor_failures_become_warnings() {
    let taxonomy: ProcessorDefinition = serde_json::from_value(json!({
        "plugin": "taxonomy", "name": "tax", "field": "id", "group": "domain",
        "taxonomy": { "dns.google": "public-resolvers" }
    }))
    .unwrap();
    let modify: ProcessorDefinition = serde_json::from_value(json!({
        "plugin": "modify", "name": "strip", "modify": [ { "field": "asn", "regex": "x", "replacement": "" } ]
    }))
    .unwrap();
    let cache = Arc::new(MemoryCache::new());
    let documents = records(json!([{ "ip": "8.8.8.8", "domain": "dns.google", "asn": { "nested": true } }]));
    let federator = federator([document("doc", true, documents)])
        .with_processor(taxonomy.build().unwrap())
        .with_processor(modify.build().unwrap())
        .with_cache(cache.clone());

    let result = search(&federator, "doc", "FROM doc WHERE ip='8.8.8.8'").await;

    assert!(result.error.unwrap().starts_with("strip: "));
    assert_eq!(result.relations.len(), 2);
    assert_eq!(result.relations[1].to.id, json!("public-resolvers"));
    assert!(cache.is_empty());
}

#[tokio::test]
async fn query_routes_by_from_clause() {
    let federator = federator([document("doc", true, dns_records())]);
    let result = federator.query("FROM doc WHERE asn >= 15169", &SearchOptions::default()).await;

    assert_eq!(result.error, None);
    assert_eq!(result.relations.len(), 2);
    assert!(result.relations.iter().all(|r| r.source == "doc"));
}

#[tokio::test]
async fn field_list_covers_every_backend() {
    let federator = federator([document("doc", true, dns_records()), custom("broken", json!({}), Broken)]);
    assert_eq!(federator.registry().field_list().await, vec!["asn", "domain", "ip", "port"]);
}
