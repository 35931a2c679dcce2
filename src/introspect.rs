//! Schema introspection for the public schema.
//!
//! Loaded once per command invocation and passed down; fixture validation,
//! application ordering, and scaffolding all read from the same cache.

use ahash::AHashMap;
use anyhow::{Context, Result};

use crate::fixtures::graph::DepGraph;
use crate::runner::Session;

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    /// GENERATED ... AS IDENTITY
    pub identity: bool,
    /// Generated (computed) column; never insertable.
    pub generated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FkAction {
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl FkAction {
    fn from_code(code: &str) -> Self {
        match code {
            "r" => FkAction::Restrict,
            "c" => FkAction::Cascade,
            "n" => FkAction::SetNull,
            "d" => FkAction::SetDefault,
            _ => FkAction::NoAction,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForeignKey {
    pub name: String,
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
    pub on_delete: FkAction,
    pub on_update: FkAction,
}

#[derive(Debug, Clone, Default)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableInfo {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Introspected public schema, keyed by table name.
#[derive(Debug, Clone, Default)]
pub struct SchemaInfo {
    pub tables: AHashMap<String, TableInfo>,
}

impl SchemaInfo {
    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.get(name)
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// FK dependency graph over all tables (child depends on parent).
    pub fn fk_graph(&self) -> DepGraph {
        let mut graph = DepGraph::new(self.table_names());
        for table in self.tables.values() {
            for fk in &table.foreign_keys {
                graph.add_dependency(&table.name, &fk.referenced_table);
            }
        }
        graph
    }

    /// Order the given tables children-first, the safe order for
    /// `TRUNCATE ... CASCADE`. Cyclic tables keep name order at the end.
    pub fn reverse_fk_order(&self, tables: &[String]) -> Vec<String> {
        let result = self.fk_graph().topo_order();
        let mut ordered: Vec<String> = result
            .order
            .iter()
            .rev()
            .filter(|t| tables.contains(t))
            .cloned()
            .collect();
        let mut leftover: Vec<String> = tables
            .iter()
            .filter(|t| !ordered.contains(t))
            .cloned()
            .collect();
        leftover.sort();
        ordered.extend(leftover);
        ordered
    }
}

/// Load columns, primary keys, and foreign keys for the public schema.
pub fn introspect(session: &mut Session) -> Result<SchemaInfo> {
    let mut info = SchemaInfo::default();

    let rows = session
        .query(
            "SELECT table_name::text, column_name::text, data_type::text, \
                    is_nullable::text, column_default::text, \
                    is_identity::text, is_generated::text \
             FROM information_schema.columns \
             WHERE table_schema = 'public' \
             ORDER BY table_name, ordinal_position",
            &[],
        )
        .context("introspecting columns")?;

    for row in rows {
        let table: String = row.get(0);
        let entry = info
            .tables
            .entry(table.clone())
            .or_insert_with(|| TableInfo {
                name: table,
                ..TableInfo::default()
            });
        let nullable: String = row.get(3);
        let identity: String = row.get(5);
        let generated: String = row.get(6);
        entry.columns.push(ColumnInfo {
            name: row.get(1),
            data_type: row.get(2),
            nullable: nullable == "YES",
            default: row.get(4),
            identity: identity == "YES",
            generated: generated == "ALWAYS",
        });
    }

    let rows = session
        .query(
            "SELECT rel.relname::text, att.attname::text \
             FROM pg_constraint con \
             JOIN pg_class rel ON rel.oid = con.conrelid \
             JOIN pg_namespace nsp ON nsp.oid = rel.relnamespace \
             CROSS JOIN LATERAL unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord) \
             JOIN pg_attribute att ON att.attrelid = rel.oid AND att.attnum = k.attnum \
             WHERE con.contype = 'p' AND nsp.nspname = 'public' \
             ORDER BY rel.relname, k.ord",
            &[],
        )
        .context("introspecting primary keys")?;

    for row in rows {
        let table: String = row.get(0);
        if let Some(entry) = info.tables.get_mut(&table) {
            entry.primary_key.push(row.get(1));
        }
    }

    let rows = session
        .query(
            "SELECT con.conname::text, rel.relname::text, frel.relname::text, \
                    con.confdeltype::text, con.confupdtype::text, \
                    att.attname::text, fatt.attname::text \
             FROM pg_constraint con \
             JOIN pg_class rel ON rel.oid = con.conrelid \
             JOIN pg_class frel ON frel.oid = con.confrelid \
             JOIN pg_namespace nsp ON nsp.oid = rel.relnamespace \
             CROSS JOIN LATERAL unnest(con.conkey, con.confkey) \
                  WITH ORDINALITY AS k(attnum, fattnum, ord) \
             JOIN pg_attribute att ON att.attrelid = rel.oid AND att.attnum = k.attnum \
             JOIN pg_attribute fatt ON fatt.attrelid = frel.oid AND fatt.attnum = k.fattnum \
             WHERE con.contype = 'f' AND nsp.nspname = 'public' \
             ORDER BY rel.relname, con.conname, k.ord",
            &[],
        )
        .context("introspecting foreign keys")?;

    for row in rows {
        let name: String = row.get(0);
        let table: String = row.get(1);
        let Some(entry) = info.tables.get_mut(&table) else {
            continue;
        };
        if entry.foreign_keys.last().map(|fk| fk.name.as_str()) != Some(name.as_str()) {
            entry.foreign_keys.push(ForeignKey {
                name: name.clone(),
                columns: Vec::new(),
                referenced_table: row.get(2),
                referenced_columns: Vec::new(),
                on_delete: FkAction::from_code(row.get::<_, String>(3).as_str()),
                on_update: FkAction::from_code(row.get::<_, String>(4).as_str()),
            });
        }
        let fk = entry.foreign_keys.last_mut().expect("just pushed");
        fk.columns.push(row.get(5));
        fk.referenced_columns.push(row.get(6));
    }

    Ok(info)
}

/// Per-column planner statistics used by fixture scaffolding.
#[derive(Debug, Clone)]
pub struct ColumnStats {
    pub table: String,
    pub column: String,
    pub null_frac: f64,
    /// Negative values mean "unique-ish": -1 is fully distinct.
    pub n_distinct: f64,
}

pub fn column_stats(session: &mut Session) -> Result<Vec<ColumnStats>> {
    let rows = session
        .query(
            "SELECT tablename::text, attname::text, \
                    null_frac::float8, n_distinct::float8 \
             FROM pg_stats WHERE schemaname = 'public' \
             ORDER BY tablename, attname",
            &[],
        )
        .context("reading pg_stats")?;

    Ok(rows
        .iter()
        .map(|row| ColumnStats {
            table: row.get(0),
            column: row.get(1),
            null_frac: row.get::<_, f64>(2),
            n_distinct: row.get::<_, f64>(3),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_with(tables: &[(&str, &[(&str, &str)])]) -> SchemaInfo {
        let mut info = SchemaInfo::default();
        for (name, fks) in tables {
            let mut table = TableInfo {
                name: name.to_string(),
                ..TableInfo::default()
            };
            for (i, (cols, referenced)) in fks.iter().enumerate() {
                table.foreign_keys.push(ForeignKey {
                    name: format!("{name}_fk{i}"),
                    columns: vec![cols.to_string()],
                    referenced_table: referenced.to_string(),
                    referenced_columns: vec!["id".to_string()],
                    on_delete: FkAction::NoAction,
                    on_update: FkAction::NoAction,
                });
            }
            info.tables.insert(name.to_string(), table);
        }
        info
    }

    #[test]
    fn test_reverse_fk_order_children_first() {
        let info = schema_with(&[
            ("users", &[]),
            ("orders", &[("user_id", "users")]),
            ("order_items", &[("order_id", "orders")]),
        ]);
        let order = info.reverse_fk_order(&[
            "users".to_string(),
            "orders".to_string(),
            "order_items".to_string(),
        ]);
        assert_eq!(order, vec!["order_items", "orders", "users"]);
    }

    #[test]
    fn test_fk_action_codes() {
        assert_eq!(FkAction::from_code("c"), FkAction::Cascade);
        assert_eq!(FkAction::from_code("a"), FkAction::NoAction);
        assert_eq!(FkAction::from_code("n"), FkAction::SetNull);
    }
}
