//! Declarative YAML fixtures: static rows and generated rows, applied in
//! foreign-key-safe order inside a single transaction.

pub mod generator;
pub mod graph;
pub mod scaffold;

use anyhow::{bail, Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;

use crate::introspect::SchemaInfo;
use crate::plan::PlanValue;
use crate::runner::Session;
use graph::DepGraph;

/// One fixture document (`fixtures/<name>.yaml`). Unknown keys are
/// rejected at parse time.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Fixture {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<TableData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generate: Vec<GenerateSpec>,
}

/// Static rows for one table.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TableData {
    pub table: String,
    pub rows: Vec<BTreeMap<String, PlanValue>>,
}

/// Generated rows for one table: `count` rows, one generator per column.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GenerateSpec {
    pub table: String,
    pub count: usize,
    pub columns: BTreeMap<String, String>,
}

impl Fixture {
    /// Every table this fixture writes to.
    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self
            .data
            .iter()
            .map(|d| d.table.clone())
            .chain(self.generate.iter().map(|g| g.table.clone()))
            .collect();
        tables.sort();
        tables.dedup();
        tables
    }
}

/// A problem found while loading or validating fixtures. Collected, not
/// thrown, so `validate` can report everything at once.
#[derive(Debug, Clone)]
pub struct FixtureIssue {
    pub fixture: Option<String>,
    pub message: String,
}

impl std::fmt::Display for FixtureIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.fixture {
            Some(name) => write!(f, "{}: {}", name, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// All fixtures of a suite, keyed by declared name.
#[derive(Debug, Clone, Default)]
pub struct FixtureSet {
    pub fixtures: BTreeMap<String, Fixture>,
}

impl FixtureSet {
    /// Scan `fixtures/*.yaml`. Parse failures are isolated per file so
    /// validation can list them all.
    pub fn load_dir(dir: &Path) -> Result<(Self, Vec<FixtureIssue>)> {
        let mut set = Self::default();
        let mut issues = Vec::new();

        if !dir.is_dir() {
            return Ok((set, issues));
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("reading fixtures directory {}", dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .map(|e| e == "yaml" || e == "yml")
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        for path in paths {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading fixture {}", path.display()))?;
            match serde_yaml_ng::from_str::<Fixture>(&text) {
                Ok(fixture) => {
                    if set.fixtures.contains_key(&fixture.name) {
                        issues.push(FixtureIssue {
                            fixture: Some(fixture.name.clone()),
                            message: format!(
                                "duplicate fixture name (also declared in {})",
                                path.display()
                            ),
                        });
                    } else {
                        set.fixtures.insert(fixture.name.clone(), fixture);
                    }
                }
                Err(e) => issues.push(FixtureIssue {
                    fixture: None,
                    message: format!("{}: {}", path.display(), e),
                }),
            }
        }

        Ok((set, issues))
    }

    pub fn names(&self) -> Vec<String> {
        self.fixtures.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&Fixture> {
        self.fixtures.get(name)
    }

    fn dep_graph(&self) -> (DepGraph, Vec<FixtureIssue>) {
        let mut graph = DepGraph::new(self.names());
        let mut issues = Vec::new();
        for fixture in self.fixtures.values() {
            for dep in &fixture.depends_on {
                if !graph.add_dependency(&fixture.name, dep) {
                    issues.push(FixtureIssue {
                        fixture: Some(fixture.name.clone()),
                        message: format!("depends on unknown fixture \"{dep}\""),
                    });
                }
            }
        }
        (graph, issues)
    }

    /// Application order (dependencies first). Cycles are fatal and name
    /// every member.
    pub fn apply_order(&self) -> Result<Vec<String>> {
        let (graph, issues) = self.dep_graph();
        if let Some(issue) = issues.first() {
            bail!("{issue}");
        }
        let result = graph.topo_order();
        if !result.cyclic.is_empty() {
            bail!(
                "fixture dependency cycle involving: {}",
                result.cyclic.join(", ")
            );
        }
        Ok(result.order)
    }

    /// Restrict to `names` plus their transitive dependencies.
    pub fn subset(&self, names: &[String]) -> Result<FixtureSet> {
        let mut selected = BTreeMap::new();
        let mut stack: Vec<String> = names.to_vec();
        while let Some(name) = stack.pop() {
            if selected.contains_key(&name) {
                continue;
            }
            let fixture = self
                .fixtures
                .get(&name)
                .with_context(|| format!("unknown fixture \"{name}\""))?;
            for dep in &fixture.depends_on {
                stack.push(dep.clone());
            }
            selected.insert(name, fixture.clone());
        }
        Ok(FixtureSet { fixtures: selected })
    }
}

/// Validate every fixture against the introspected schema. Returns all
/// problems; empty means valid.
pub fn validate(set: &FixtureSet, schema: &SchemaInfo) -> Vec<FixtureIssue> {
    let mut issues = Vec::new();

    let (graph, graph_issues) = set.dep_graph();
    issues.extend(graph_issues);
    let topo = graph.topo_order();
    if !topo.cyclic.is_empty() {
        issues.push(FixtureIssue {
            fixture: None,
            message: format!(
                "dependency cycle involving: {}",
                topo.cyclic.join(", ")
            ),
        });
    }

    // (table, rendered pk) -> fixture, for cross-fixture duplicate detection.
    let mut pk_seen: BTreeMap<(String, String), String> = BTreeMap::new();

    for fixture in set.fixtures.values() {
        for data in &fixture.data {
            let Some(table) = schema.table(&data.table) else {
                issues.push(FixtureIssue {
                    fixture: Some(fixture.name.clone()),
                    message: format!("table \"{}\" does not exist", data.table),
                });
                continue;
            };
            for (i, row) in data.rows.iter().enumerate() {
                for column in row.keys() {
                    if table.column(column).is_none() {
                        issues.push(FixtureIssue {
                            fixture: Some(fixture.name.clone()),
                            message: format!(
                                "table \"{}\" has no column \"{}\" (row {})",
                                data.table, column, i
                            ),
                        });
                    }
                }
                if !table.primary_key.is_empty() {
                    if let Some(key) = pk_of(row, &table.primary_key) {
                        let slot = (data.table.clone(), key.clone());
                        if let Some(owner) = pk_seen.get(&slot) {
                            if owner != &fixture.name {
                                issues.push(FixtureIssue {
                                    fixture: Some(fixture.name.clone()),
                                    message: format!(
                                        "row {} duplicates primary key ({}) in table \"{}\" already declared by fixture \"{}\"",
                                        i, key, data.table, owner
                                    ),
                                });
                            }
                        } else {
                            pk_seen.insert(slot, fixture.name.clone());
                        }
                    }
                }
            }
        }

        for spec in &fixture.generate {
            let Some(table) = schema.table(&spec.table) else {
                issues.push(FixtureIssue {
                    fixture: Some(fixture.name.clone()),
                    message: format!("table \"{}\" does not exist", spec.table),
                });
                continue;
            };
            for (column, generator) in &spec.columns {
                if table.column(column).is_none() {
                    issues.push(FixtureIssue {
                        fixture: Some(fixture.name.clone()),
                        message: format!(
                            "table \"{}\" has no column \"{}\"",
                            spec.table, column
                        ),
                    });
                }
                if let Err(e) = generator::parse(generator) {
                    issues.push(FixtureIssue {
                        fixture: Some(fixture.name.clone()),
                        message: format!("column \"{}\": {}", column, e),
                    });
                }
            }
        }
    }

    issues
}

fn pk_of(row: &BTreeMap<String, PlanValue>, pk: &[String]) -> Option<String> {
    let mut parts = Vec::with_capacity(pk.len());
    for column in pk {
        parts.push(row.get(column)?.as_text());
    }
    Some(parts.join(","))
}

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// TRUNCATE targeted tables (CASCADE, children first) before inserting.
    pub truncate: bool,
    /// Restrict to these fixtures (plus dependencies); None applies all.
    pub names: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub applied: Vec<String>,
    pub rows_inserted: u64,
    pub truncated: Vec<String>,
}

/// Apply fixtures inside a single transaction. Any failure rolls back and
/// surfaces an actionable error naming the fixture and table.
pub fn apply(
    session: &mut Session,
    set: &FixtureSet,
    schema: &SchemaInfo,
    options: &ApplyOptions,
) -> Result<ApplyReport> {
    let selected = match &options.names {
        Some(names) => set.subset(names)?,
        None => set.clone(),
    };
    let order = selected.apply_order()?;

    session.begin()?;
    match apply_in_tx(session, &selected, schema, options, &order) {
        Ok(report) => {
            session.commit()?;
            Ok(report)
        }
        Err(e) => {
            let _ = session.rollback();
            Err(e)
        }
    }
}

fn apply_in_tx(
    session: &mut Session,
    set: &FixtureSet,
    schema: &SchemaInfo,
    options: &ApplyOptions,
    order: &[String],
) -> Result<ApplyReport> {
    let mut report = ApplyReport::default();

    if options.truncate {
        let mut tables: Vec<String> = set
            .fixtures
            .values()
            .flat_map(|f| f.tables())
            .collect();
        tables.sort();
        tables.dedup();
        for table in schema.reverse_fk_order(&tables) {
            session
                .batch_execute(&format!("TRUNCATE {} CASCADE", quote_ident(&table)))
                .with_context(|| format!("truncating table \"{table}\""))?;
            report.truncated.push(table);
        }
    }

    for name in order {
        let fixture = set.fixtures.get(name).expect("order comes from the set");

        for data in &fixture.data {
            for row in &data.rows {
                report.rows_inserted +=
                    insert_row(session, name, &data.table, row)?;
            }
        }

        for spec in &fixture.generate {
            let rows = generator::expand(spec, generator::fixture_seed(name))
                .with_context(|| format!("expanding generators for fixture \"{name}\""))?;
            for row in &rows {
                report.rows_inserted += insert_row(session, name, &spec.table, row)?;
            }
        }

        report.applied.push(name.clone());
    }

    Ok(report)
}

fn insert_row(
    session: &mut Session,
    fixture: &str,
    table: &str,
    row: &BTreeMap<String, PlanValue>,
) -> Result<u64> {
    if row.is_empty() {
        bail!("fixture \"{fixture}\": empty row for table \"{table}\"");
    }

    let columns: Vec<&String> = row.keys().collect();
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=columns.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        column_list,
        placeholders
    );

    let values: Vec<&(dyn ToSql + Sync)> = row
        .values()
        .map(|v| v as &(dyn ToSql + Sync))
        .collect();

    session.execute_raw(&sql, &values).map_err(|e| {
        let code = e.code().cloned();
        let message = e
            .as_db_error()
            .map(|db| db.message().to_string())
            .unwrap_or_else(|| e.to_string());

        if code == Some(SqlState::GENERATED_ALWAYS) {
            anyhow::anyhow!(
                "fixture \"{fixture}\": table \"{table}\" has a GENERATED ALWAYS \
                 identity column; drop it from the fixture row, or alter the \
                 column to GENERATED BY DEFAULT ({message})"
            )
        } else if code == Some(SqlState::UNIQUE_VIOLATION) {
            anyhow::anyhow!(
                "fixture \"{fixture}\": duplicate key in table \"{table}\"; \
                 another fixture or the snapshot already inserted this row, \
                 consider apply with truncation or disjoint key ranges ({message})"
            )
        } else {
            anyhow::anyhow!("fixture \"{fixture}\": insert into \"{table}\" failed: {message}")
        }
    })
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspect::{ColumnInfo, SchemaInfo, TableInfo};

    fn schema(tables: &[(&str, &[&str], &[&str])]) -> SchemaInfo {
        let mut info = SchemaInfo::default();
        for (name, columns, pk) in tables {
            info.tables.insert(
                name.to_string(),
                TableInfo {
                    name: name.to_string(),
                    columns: columns
                        .iter()
                        .map(|c| ColumnInfo {
                            name: c.to_string(),
                            data_type: "text".to_string(),
                            nullable: true,
                            default: None,
                            identity: false,
                            generated: false,
                        })
                        .collect(),
                    primary_key: pk.iter().map(|c| c.to_string()).collect(),
                    foreign_keys: Vec::new(),
                },
            );
        }
        info
    }

    fn fixture(yaml: &str) -> Fixture {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    fn set_of(fixtures: Vec<Fixture>) -> FixtureSet {
        FixtureSet {
            fixtures: fixtures.into_iter().map(|f| (f.name.clone(), f)).collect(),
        }
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = serde_yaml_ng::from_str::<Fixture>("name: a\nbogus: 1\n").unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_cycle_names_both_members() {
        let set = set_of(vec![
            fixture("name: a\ndepends_on: [b]\n"),
            fixture("name: b\ndepends_on: [a]\n"),
        ]);
        let err = set.apply_order().unwrap_err().to_string();
        assert!(err.contains("a") && err.contains("b"), "got: {err}");
    }

    #[test]
    fn test_apply_order_dependencies_first() {
        let set = set_of(vec![
            fixture("name: orders\ndepends_on: [users]\n"),
            fixture("name: users\n"),
        ]);
        assert_eq!(set.apply_order().unwrap(), vec!["users", "orders"]);
    }

    #[test]
    fn test_validate_missing_table_and_column() {
        let schema = schema(&[("users", &["id", "name"], &["id"])]);
        let set = set_of(vec![fixture(
            "name: a\ndata:\n  - table: ghosts\n    rows: [{id: 1}]\n  - table: users\n    rows: [{id: 1, nope: x}]\n",
        )]);
        let issues = validate(&set, &schema);
        assert_eq!(issues.len(), 2);
        assert!(issues[0].message.contains("ghosts"));
        assert!(issues[1].message.contains("nope"));
    }

    #[test]
    fn test_validate_duplicate_pk_across_fixtures() {
        let schema = schema(&[("users", &["id"], &["id"])]);
        let set = set_of(vec![
            fixture("name: a\ndata:\n  - table: users\n    rows: [{id: 1}]\n"),
            fixture("name: b\ndata:\n  - table: users\n    rows: [{id: 1}]\n"),
        ]);
        let issues = validate(&set, &schema);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("duplicates primary key"));
    }

    #[test]
    fn test_subset_pulls_dependencies() {
        let set = set_of(vec![
            fixture("name: a\n"),
            fixture("name: b\ndepends_on: [a]\n"),
            fixture("name: c\n"),
        ]);
        let subset = set.subset(&["b".to_string()]).unwrap();
        assert_eq!(subset.names(), vec!["a", "b"]);
    }
}
