//! Scaffold a skeleton fixture from the live schema and planner stats.
//!
//! Generators are guessed from column type plus `pg_stats`; anything the
//! guesser cannot place becomes a warning, never an error.

use std::collections::BTreeMap;

use super::{Fixture, GenerateSpec};
use crate::introspect::{ColumnInfo, ColumnStats, SchemaInfo};

#[derive(Debug, Clone)]
pub struct ScaffoldOptions {
    /// Restrict to these tables; None scaffolds every table.
    pub tables: Option<Vec<String>>,
    /// Row count per generate spec.
    pub count: usize,
}

impl Default for ScaffoldOptions {
    fn default() -> Self {
        Self {
            tables: None,
            count: 10,
        }
    }
}

#[derive(Debug)]
pub struct ScaffoldResult {
    pub fixture: Fixture,
    pub warnings: Vec<String>,
}

/// Build a skeleton fixture named `name` covering the selected tables,
/// parents before children so the emitted YAML reads in insert order.
pub fn scaffold(
    schema: &SchemaInfo,
    stats: &[ColumnStats],
    name: &str,
    options: &ScaffoldOptions,
) -> ScaffoldResult {
    let mut warnings = Vec::new();

    let selected: Vec<String> = match &options.tables {
        Some(tables) => {
            let mut known = Vec::new();
            for table in tables {
                if schema.table(table).is_some() {
                    known.push(table.clone());
                } else {
                    warnings.push(format!("table \"{table}\" does not exist, skipped"));
                }
            }
            known
        }
        None => schema.table_names(),
    };

    let topo = schema.fk_graph().topo_order();
    let mut ordered: Vec<String> = topo
        .order
        .into_iter()
        .filter(|t| selected.contains(t))
        .collect();
    for cyclic in topo.cyclic {
        if selected.contains(&cyclic) {
            warnings.push(format!(
                "table \"{cyclic}\" participates in a foreign-key cycle; review its position"
            ));
            ordered.push(cyclic);
        }
    }

    let mut generate = Vec::new();
    for table_name in &ordered {
        let table = schema.table(table_name).expect("selected from the schema");
        let mut columns = BTreeMap::new();

        for column in &table.columns {
            if column.identity || column.generated {
                continue;
            }
            if column.default.is_some() && !table.primary_key.contains(&column.name) {
                // Defaults fill themselves in; scaffold only what must be set.
                continue;
            }
            let unique = is_unique(stats, table_name, &column.name)
                || (table.primary_key.len() == 1 && table.primary_key[0] == column.name);
            match guess_generator(column, unique) {
                Some(generator) => {
                    columns.insert(column.name.clone(), generator);
                }
                None => warnings.push(format!(
                    "{}.{}: no generator for type \"{}\", fill in manually",
                    table_name, column.name, column.data_type
                )),
            }
        }

        generate.push(GenerateSpec {
            table: table_name.clone(),
            count: options.count,
            columns,
        });
    }

    ScaffoldResult {
        fixture: Fixture {
            name: name.to_string(),
            description: Some("scaffolded from schema, edit before use".to_string()),
            depends_on: Vec::new(),
            data: Vec::new(),
            generate,
        },
        warnings,
    }
}

/// Planner statistics mark a column unique-ish with a negative n_distinct.
fn is_unique(stats: &[ColumnStats], table: &str, column: &str) -> bool {
    stats
        .iter()
        .find(|s| s.table == table && s.column == column)
        .map(|s| s.n_distinct < 0.0)
        .unwrap_or(false)
}

fn guess_generator(column: &ColumnInfo, unique: bool) -> Option<String> {
    let ty = column.data_type.as_str();
    match ty {
        "smallint" | "integer" | "bigint" => Some("sequence".to_string()),
        "uuid" => Some("uuid".to_string()),
        "boolean" => Some("choice(true, false)".to_string()),
        "text" | "character varying" | "character" => {
            if unique {
                Some("uuid".to_string())
            } else {
                Some("lorem".to_string())
            }
        }
        "date" | "timestamp without time zone" | "timestamp with time zone" => {
            Some("now".to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspect::{ForeignKey, FkAction, TableInfo};

    fn column(name: &str, data_type: &str) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable: true,
            default: None,
            identity: false,
            generated: false,
        }
    }

    fn schema() -> SchemaInfo {
        let mut info = SchemaInfo::default();
        info.tables.insert(
            "users".to_string(),
            TableInfo {
                name: "users".to_string(),
                columns: vec![
                    column("id", "integer"),
                    column("email", "text"),
                    column("bio", "text"),
                    column("settings", "jsonb"),
                ],
                primary_key: vec!["id".to_string()],
                foreign_keys: Vec::new(),
            },
        );
        info.tables.insert(
            "orders".to_string(),
            TableInfo {
                name: "orders".to_string(),
                columns: vec![column("id", "integer"), column("user_id", "integer")],
                primary_key: vec!["id".to_string()],
                foreign_keys: vec![ForeignKey {
                    name: "orders_user_id_fkey".to_string(),
                    columns: vec!["user_id".to_string()],
                    referenced_table: "users".to_string(),
                    referenced_columns: vec!["id".to_string()],
                    on_delete: FkAction::NoAction,
                    on_update: FkAction::NoAction,
                }],
            },
        );
        info
    }

    #[test]
    fn test_parents_come_first() {
        let result = scaffold(&schema(), &[], "base", &ScaffoldOptions::default());
        let tables: Vec<&str> = result
            .fixture
            .generate
            .iter()
            .map(|g| g.table.as_str())
            .collect();
        assert_eq!(tables, vec!["users", "orders"]);
    }

    #[test]
    fn test_unique_stat_switches_generator() {
        let stats = vec![ColumnStats {
            table: "users".to_string(),
            column: "email".to_string(),
            null_frac: 0.0,
            n_distinct: -1.0,
        }];
        let result = scaffold(&schema(), &stats, "base", &ScaffoldOptions::default());
        let users = &result.fixture.generate[0];
        assert_eq!(users.columns["email"], "uuid");
        assert_eq!(users.columns["bio"], "lorem");
    }

    #[test]
    fn test_unsupported_type_warns() {
        let result = scaffold(&schema(), &[], "base", &ScaffoldOptions::default());
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("settings") && w.contains("jsonb")));
    }
}
