//! Bounded per-field statistics, returned instead of relations when a
//! backend produces too many results.

use crate::record::{value_to_string, Record};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Entries surfaced per field
pub const TOP_ENTRIES: usize = 10;

/// Occurrence counters for one search. Never shared between searches.
#[derive(Debug, Default, Clone)]
pub struct StatsAccumulator {
    fields: BTreeMap<String, HashMap<String, u64>>,
}

impl StatsAccumulator {
    pub fn new(fields: &[String]) -> Self {
        Self {
            fields: fields.iter().map(|f| (f.clone(), HashMap::new())).collect(),
        }
    }

    pub fn is_tracking(&self) -> bool {
        !self.fields.is_empty()
    }

    /// Counts the record's value of every tracked field. Missing, null and
    /// empty values are skipped.
    pub fn update(&mut self, record: &Record) {
        for (field, counts) in self.fields.iter_mut() {
            let Some(value) = record.lookup(field) else {
                continue;
            };
            let text = value_to_string(value);
            if text.is_empty() {
                continue;
            }
            *counts.entry(text).or_insert(0) += 1;
        }
    }

    /// Top entries per field, by count descending then value ascending.
    /// Fields without any observed value are left out.
    pub fn top(&self) -> SourceStats {
        let fields = self
            .fields
            .iter()
            .filter(|(_, counts)| !counts.is_empty())
            .map(|(field, counts)| {
                let mut entries: Vec<StatEntry> = counts
                    .iter()
                    .map(|(value, count)| StatEntry {
                        value: value.clone(),
                        count: *count,
                    })
                    .collect();
                entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
                entries.truncate(TOP_ENTRIES);
                (field.clone(), entries)
            })
            .collect();
        SourceStats(fields)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatEntry {
    pub value: String,
    pub count: u64,
}

/// Field → top entries of one backend
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceStats(pub BTreeMap<String, Vec<StatEntry>>);

impl SourceStats {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&[StatEntry]> {
        self.0.get(field).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_top_is_bounded_and_sorted() {
        let mut stats = StatsAccumulator::new(&["port".to_string()]);
        for port in 0..15u64 {
            for _ in 0..=port {
                stats.update(&record(json!({ "port": port })));
            }
        }

        let top = stats.top();
        let ports = top.get("port").unwrap();
        assert_eq!(ports.len(), TOP_ENTRIES);
        assert_eq!(ports[0], StatEntry { value: "14".into(), count: 15 });
        assert!(ports.windows(2).all(|w| w[0].count >= w[1].count));
    }

    #[test]
    fn test_empty_and_missing_values_are_skipped() {
        let mut stats = StatsAccumulator::new(&["a".to_string(), "b".to_string()]);
        stats.update(&record(json!({ "a": "", "b": null })));
        stats.update(&record(json!({ "c": 1 })));

        assert!(stats.top().is_empty());
    }

    #[test]
    fn test_ties_are_ordered_by_value() {
        let mut stats = StatsAccumulator::new(&["geo.country".to_string()]);
        for country in ["LV", "EE", "LT"] {
            stats.update(&record(json!({ "geo": { "country": country } })));
        }
        let values: Vec<_> = stats.top().get("geo.country").unwrap().iter().map(|e| e.value.clone()).collect();
        assert_eq!(values, vec!["EE", "LT", "LV"]);
    }
}
