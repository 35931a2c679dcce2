//! EXPLAIN baselines: capture plan documents, derive metrics, and compare
//! them against later runs with per-metric tolerances.
//!
//! The full `EXPLAIN (FORMAT JSON)` document is stored verbatim; a small
//! derived-metrics record lives beside it and drives comparisons.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::runner::Session;

/// Metrics derived from one EXPLAIN document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanMetrics {
    pub total_cost: f64,
    /// Estimated rows, or actual rows under ANALYZE.
    pub rows: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planning_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_hit_blocks: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_read_blocks: Option<i64>,
    #[serde(default)]
    pub analyze: bool,
}

/// Capture the plan for an already literal-substituted statement.
pub fn capture_plan(
    session: &mut Session,
    sql: &str,
    analyze: bool,
) -> Result<(serde_json::Value, PlanMetrics)> {
    let explain = if analyze {
        format!("EXPLAIN (ANALYZE, BUFFERS, FORMAT JSON) {sql}")
    } else {
        format!("EXPLAIN (FORMAT JSON) {sql}")
    };

    let rows = session.simple_rows(&explain)?;
    let text: String = rows
        .iter()
        .filter_map(|r| r.first().cloned().flatten())
        .collect::<Vec<_>>()
        .join("\n");
    let doc: serde_json::Value =
        serde_json::from_str(&text).context("parsing EXPLAIN output")?;

    let metrics = derive_metrics(&doc, analyze)?;
    Ok((doc, metrics))
}

/// Pull the derived metrics out of an EXPLAIN JSON document.
pub fn derive_metrics(doc: &serde_json::Value, analyze: bool) -> Result<PlanMetrics> {
    let entry = doc
        .as_array()
        .and_then(|a| a.first())
        .context("EXPLAIN document is not a non-empty array")?;
    let plan = entry
        .get("Plan")
        .context("EXPLAIN document has no Plan node")?;

    let rows_key = if analyze { "Actual Rows" } else { "Plan Rows" };
    Ok(PlanMetrics {
        total_cost: plan
            .get("Total Cost")
            .and_then(|v| v.as_f64())
            .context("plan has no Total Cost")?,
        rows: plan.get(rows_key).and_then(|v| v.as_f64()).unwrap_or(0.0),
        planning_ms: entry.get("Planning Time").and_then(|v| v.as_f64()),
        execution_ms: entry.get("Execution Time").and_then(|v| v.as_f64()),
        shared_hit_blocks: plan.get("Shared Hit Blocks").and_then(|v| v.as_i64()),
        shared_read_blocks: plan.get("Shared Read Blocks").and_then(|v| v.as_i64()),
        analyze,
    })
}

/// One metric's movement between baseline and current plan.
#[derive(Debug, Clone, Serialize)]
pub struct MetricDrift {
    pub metric: String,
    pub baseline: f64,
    pub current: f64,
    pub regression: bool,
}

const RELATIVE_THRESHOLD: f64 = 0.20;

/// Compare a current plan against its baseline.
///
/// A continuous metric regresses when it worsens by more than 20 %
/// relative *and* more than its absolute epsilon (1.0 for costs, 1 ms for
/// times, 1 for rows). Buffer counts are compared exactly, but only when
/// both sides ran under ANALYZE.
pub fn compare(baseline: &PlanMetrics, current: &PlanMetrics) -> Vec<MetricDrift> {
    let mut drifts = Vec::new();

    drifts.push(continuous(
        "total_cost",
        baseline.total_cost,
        current.total_cost,
        1.0,
    ));
    drifts.push(continuous("rows", baseline.rows, current.rows, 1.0));
    if let (Some(b), Some(c)) = (baseline.planning_ms, current.planning_ms) {
        drifts.push(continuous("planning_ms", b, c, 1.0));
    }
    if let (Some(b), Some(c)) = (baseline.execution_ms, current.execution_ms) {
        drifts.push(continuous("execution_ms", b, c, 1.0));
    }

    if baseline.analyze && current.analyze {
        if let (Some(b), Some(c)) = (baseline.shared_hit_blocks, current.shared_hit_blocks) {
            drifts.push(exact("shared_hit_blocks", b, c));
        }
        if let (Some(b), Some(c)) = (baseline.shared_read_blocks, current.shared_read_blocks) {
            drifts.push(exact("shared_read_blocks", b, c));
        }
    }

    drifts
}

fn continuous(metric: &str, baseline: f64, current: f64, epsilon: f64) -> MetricDrift {
    let delta = current - baseline;
    let relative = if baseline.abs() > f64::EPSILON {
        delta / baseline
    } else if delta > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };
    MetricDrift {
        metric: metric.to_string(),
        baseline,
        current,
        regression: relative > RELATIVE_THRESHOLD && delta > epsilon,
    }
}

fn exact(metric: &str, baseline: i64, current: i64) -> MetricDrift {
    MetricDrift {
        metric: metric.to_string(),
        baseline: baseline as f64,
        current: current as f64,
        regression: baseline != current,
    }
}

pub fn has_regression(drifts: &[MetricDrift]) -> bool {
    drifts.iter().any(|d| d.regression)
}

/// Correlation record for one baseline file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineRecord {
    pub snapshot_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_tag: Option<String>,
    pub created: DateTime<Utc>,
}

/// `regresql/baselines.json`: expected-file path to snapshot correlation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BaselineIndex {
    pub entries: BTreeMap<String, BaselineRecord>,
}

impl BaselineIndex {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut text = serde_json::to_string_pretty(self).context("serialising baselines")?;
        text.push('\n');
        crate::driver::write_atomic(path, text.as_bytes())
            .with_context(|| format!("writing {}", path.display()))
    }

    pub fn record(&mut self, baseline_rel: &str, record: BaselineRecord) {
        self.entries.insert(baseline_rel.to_string(), record);
    }
}

/// Result of correlating baselines with the current snapshot.
#[derive(Debug, Default)]
pub struct BaselineCheck {
    pub current: Vec<String>,
    /// (path, recorded hash): captured under a different snapshot.
    pub outdated: Vec<(String, String)>,
    /// Indexed but the baseline file is gone.
    pub orphaned: Vec<String>,
}

/// Correlate every indexed baseline with the current snapshot hash.
pub fn check_baselines(
    index: &BaselineIndex,
    expected_dir: &Path,
    current_hash: Option<&str>,
) -> BaselineCheck {
    let mut check = BaselineCheck::default();
    for (rel, record) in &index.entries {
        if !expected_dir.join(rel).is_file() {
            check.orphaned.push(rel.clone());
        } else if Some(record.snapshot_hash.as_str()) == current_hash {
            check.current.push(rel.clone());
        } else {
            check
                .outdated
                .push((rel.clone(), record.snapshot_hash.clone()));
        }
    }
    check
}

#[cfg(test)]
mod tests {
    use super::*;

    fn explain_doc() -> serde_json::Value {
        serde_json::json!([{
            "Plan": {
                "Node Type": "Seq Scan",
                "Total Cost": 35.50,
                "Plan Rows": 100,
                "Shared Hit Blocks": 12,
                "Shared Read Blocks": 0
            },
            "Planning Time": 0.2,
            "Execution Time": 1.5
        }])
    }

    fn metrics(cost: f64, rows: f64) -> PlanMetrics {
        PlanMetrics {
            total_cost: cost,
            rows,
            planning_ms: None,
            execution_ms: None,
            shared_hit_blocks: None,
            shared_read_blocks: None,
            analyze: false,
        }
    }

    #[test]
    fn test_derive_metrics() {
        let m = derive_metrics(&explain_doc(), false).unwrap();
        assert_eq!(m.total_cost, 35.50);
        assert_eq!(m.rows, 100.0);
        assert_eq!(m.planning_ms, Some(0.2));
        assert_eq!(m.execution_ms, Some(1.5));
        assert_eq!(m.shared_hit_blocks, Some(12));
    }

    #[test]
    fn test_small_drift_is_not_regression() {
        // +10 % relative: under the 20 % gate.
        let drifts = compare(&metrics(100.0, 10.0), &metrics(110.0, 10.0));
        assert!(!has_regression(&drifts));
    }

    #[test]
    fn test_relative_and_absolute_must_both_trip() {
        // +50 % relative but only +0.5 absolute: under the cost epsilon.
        let drifts = compare(&metrics(1.0, 10.0), &metrics(1.5, 10.0));
        assert!(!has_regression(&drifts));

        // +50 % relative and +50 absolute: regression.
        let drifts = compare(&metrics(100.0, 10.0), &metrics(150.0, 10.0));
        assert!(has_regression(&drifts));
    }

    #[test]
    fn test_improvement_is_never_regression() {
        let drifts = compare(&metrics(100.0, 10.0), &metrics(10.0, 10.0));
        assert!(!has_regression(&drifts));
    }

    #[test]
    fn test_buffers_exact_under_analyze() {
        let mut baseline = metrics(10.0, 1.0);
        baseline.analyze = true;
        baseline.shared_hit_blocks = Some(5);
        let mut current = baseline.clone();
        current.shared_hit_blocks = Some(6);
        let drifts = compare(&baseline, &current);
        assert!(has_regression(&drifts));
    }

    #[test]
    fn test_buffers_ignored_without_analyze() {
        let mut baseline = metrics(10.0, 1.0);
        baseline.shared_hit_blocks = Some(5);
        let mut current = baseline.clone();
        current.shared_hit_blocks = Some(6);
        let drifts = compare(&baseline, &current);
        assert!(!has_regression(&drifts));
    }

    #[test]
    fn test_check_baselines_buckets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a/q.plan.json"), b"[]").unwrap();
        std::fs::write(dir.path().join("a/r.plan.json"), b"[]").unwrap();

        let mut index = BaselineIndex::default();
        index.record(
            "a/q.plan.json",
            BaselineRecord {
                snapshot_hash: "h1".to_string(),
                snapshot_tag: None,
                created: Utc::now(),
            },
        );
        index.record(
            "a/r.plan.json",
            BaselineRecord {
                snapshot_hash: "h2".to_string(),
                snapshot_tag: None,
                created: Utc::now(),
            },
        );
        index.record(
            "a/gone.plan.json",
            BaselineRecord {
                snapshot_hash: "h1".to_string(),
                snapshot_tag: None,
                created: Utc::now(),
            },
        );

        let check = check_baselines(&index, dir.path(), Some("h1"));
        assert_eq!(check.current, vec!["a/q.plan.json"]);
        assert_eq!(check.outdated.len(), 1);
        assert_eq!(check.outdated[0].0, "a/r.plan.json");
        assert_eq!(check.orphaned, vec!["a/gone.plan.json"]);
    }
}
