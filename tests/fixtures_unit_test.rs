//! Integration tests for fixture loading, validation, ordering, and
//! generator expansion.

use regresql::fixtures::{self, generator, Fixture, FixtureSet, GenerateSpec};
use regresql::introspect::{ColumnInfo, SchemaInfo, TableInfo};
use regresql::plan::PlanValue;
use std::path::Path;
use tempfile::TempDir;

fn write(dir: &Path, name: &str, content: &str) {
    std::fs::write(dir.join(name), content).unwrap();
}

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

#[test]
fn test_load_dir_collects_fixtures_and_issues() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "users.yaml", "name: users\n");
    write(dir.path(), "orders.yml", "name: orders\ndepends_on: [users]\n");
    write(dir.path(), "broken.yaml", "name: [not a string\n");
    write(dir.path(), "notes.txt", "not a fixture");

    let (set, issues) = FixtureSet::load_dir(dir.path()).unwrap();
    assert_eq!(set.names(), vec!["orders", "users"]);
    assert_eq!(issues.len(), 1);
    assert!(issues[0].message.contains("broken.yaml"));
}

#[test]
fn test_load_missing_dir_is_empty() {
    let dir = TempDir::new().unwrap();
    let (set, issues) = FixtureSet::load_dir(&dir.path().join("nope")).unwrap();
    assert!(set.fixtures.is_empty());
    assert!(issues.is_empty());
}

#[test]
fn test_unknown_fixture_keys_rejected() {
    let err = serde_yaml_ng::from_str::<Fixture>("name: a\nsurprise: 1\n").unwrap_err();
    assert!(err.to_string().contains("surprise"));
}

#[test]
fn test_cycle_validation_names_members() {
    // Scenario: A depends on B, B depends on A; validate names both.
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.yaml", "name: a\ndepends_on: [b]\n");
    write(dir.path(), "b.yaml", "name: b\ndepends_on: [a]\n");

    let (set, _) = FixtureSet::load_dir(dir.path()).unwrap();
    let issues = fixtures::validate(&set, &SchemaInfo::default());
    let cycle = issues
        .iter()
        .find(|i| i.message.contains("cycle"))
        .expect("cycle issue");
    assert!(cycle.message.contains('a') && cycle.message.contains('b'));

    let err = set.apply_order().unwrap_err().to_string();
    assert!(err.contains("cycle"));
}

#[test]
fn test_apply_order_is_topological() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "c.yaml", "name: c\ndepends_on: [b]\n");
    write(dir.path(), "b.yaml", "name: b\ndepends_on: [a]\n");
    write(dir.path(), "a.yaml", "name: a\n");

    let (set, _) = FixtureSet::load_dir(dir.path()).unwrap();
    assert_eq!(set.apply_order().unwrap(), vec!["a", "b", "c"]);
}

#[test]
fn test_validate_against_schema() {
    let schema = schema(&[("users", &["id", "email"], &["id"])]);
    let set: FixtureSet = {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "bad.yaml",
            concat!(
                "name: bad\n",
                "data:\n",
                "  - table: missing_table\n",
                "    rows: [{id: 1}]\n",
                "  - table: users\n",
                "    rows: [{id: 1, phone: '555'}]\n",
            ),
        );
        FixtureSet::load_dir(dir.path()).unwrap().0
    };

    let issues = fixtures::validate(&set, &schema);
    assert_eq!(issues.len(), 2);
    assert!(issues[0].message.contains("missing_table"));
    assert!(issues[1].message.contains("phone"));
}

#[test]
fn test_duplicate_pk_across_fixtures_flagged() {
    let schema = schema(&[("users", &["id"], &["id"])]);
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "one.yaml",
        "name: one\ndata:\n  - table: users\n    rows: [{id: 1}]\n",
    );
    write(
        dir.path(),
        "two.yaml",
        "name: two\ndata:\n  - table: users\n    rows: [{id: 1}]\n",
    );

    let (set, _) = FixtureSet::load_dir(dir.path()).unwrap();
    let issues = fixtures::validate(&set, &schema);
    assert_eq!(issues.len(), 1);
    assert!(issues[0].message.contains("duplicates primary key"));
}

#[test]
fn test_subset_includes_transitive_dependencies() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.yaml", "name: a\n");
    write(dir.path(), "b.yaml", "name: b\ndepends_on: [a]\n");
    write(dir.path(), "c.yaml", "name: c\ndepends_on: [b]\n");
    write(dir.path(), "d.yaml", "name: d\n");

    let (set, _) = FixtureSet::load_dir(dir.path()).unwrap();
    let subset = set.subset(&["c".to_string()]).unwrap();
    assert_eq!(subset.names(), vec!["a", "b", "c"]);
    assert!(set.subset(&["ghost".to_string()]).is_err());
}

#[test]
fn test_generator_expansion_deterministic() {
    let spec = GenerateSpec {
        table: "users".to_string(),
        count: 5,
        columns: [
            ("id".to_string(), "sequence(100)".to_string()),
            ("email".to_string(), "uuid".to_string()),
            ("bio".to_string(), "lorem(4)".to_string()),
            ("role".to_string(), "choice(admin, member)".to_string()),
        ]
        .into_iter()
        .collect(),
    };

    let seed = generator::fixture_seed("users-fixture");
    let first = generator::expand(&spec, seed).unwrap();
    let second = generator::expand(&spec, seed).unwrap();
    assert_eq!(first, second);

    assert_eq!(first.len(), 5);
    assert_eq!(first[0]["id"], PlanValue::Int(100));
    assert_eq!(first[4]["id"], PlanValue::Int(104));
    for row in &first {
        match &row["role"] {
            PlanValue::Text(role) => assert!(role == "admin" || role == "member"),
            other => panic!("unexpected role value: {other:?}"),
        }
        match &row["bio"] {
            PlanValue::Text(bio) => assert_eq!(bio.split(' ').count(), 4),
            other => panic!("unexpected bio value: {other:?}"),
        }
    }
}

#[test]
fn test_generator_specs_validated() {
    let schema = schema(&[("users", &["id"], &["id"])]);
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "gen.yaml",
        concat!(
            "name: gen\n",
            "generate:\n",
            "  - table: users\n",
            "    count: 3\n",
            "    columns:\n",
            "      id: fibonacci\n",
        ),
    );

    let (set, _) = FixtureSet::load_dir(dir.path()).unwrap();
    let issues = fixtures::validate(&set, &schema);
    assert_eq!(issues.len(), 1);
    assert!(issues[0].message.contains("fibonacci"));
}

#[test]
fn test_fixture_tables_deduplicated() {
    let fixture: Fixture = serde_yaml_ng::from_str(concat!(
        "name: mix\n",
        "data:\n",
        "  - table: users\n",
        "    rows: []\n",
        "generate:\n",
        "  - table: users\n",
        "    count: 1\n",
        "    columns: {id: sequence}\n",
        "  - table: orders\n",
        "    count: 1\n",
        "    columns: {id: sequence}\n",
    ))
    .unwrap();
    assert_eq!(fixture.tables(), vec!["orders", "users"]);
}
