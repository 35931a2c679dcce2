//! Integration tests for suite discovery and the expected-file layout.

use regresql::plan::resolve_bindings;
use regresql::suite::{artifact_rel_path, binding_label, Artifact, Coverage, Suite};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn project() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "a.sql", "SELECT 1 AS n;\n");
    write(
        root,
        "queries/b.sql",
        "-- name: byId\nSELECT * FROM t WHERE id = :id;\n",
    );
    write(
        root,
        "regresql/plans/queries/b.yaml",
        "byId:\n  - id: 1\n  - id: 2\n",
    );
    // Files under regresql/ and hidden directories are not suite files.
    write(root, "regresql/expected/ignored.sql", "SELECT 0;\n");
    write(root, ".git/hooks/hook.sql", "SELECT 0;\n");
    dir
}

#[test]
fn test_discovery_sorted_and_filtered() {
    let dir = project();
    let suite = Suite::new(dir.path(), None);

    let files = suite.discover(None).unwrap();
    let rels: Vec<PathBuf> = files.iter().map(|f| f.rel.clone()).collect();
    assert_eq!(rels, vec![PathBuf::from("a.sql"), PathBuf::from("queries/b.sql")]);

    let filter = regex::Regex::new("^queries/").unwrap();
    let files = suite.discover(Some(&filter)).unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].rel, PathBuf::from("queries/b.sql"));
}

#[test]
fn test_plan_attached_from_plans_tree() {
    let dir = project();
    let suite = Suite::new(dir.path(), None);
    let files = suite.discover(None).unwrap();

    assert!(files[0].plan.is_none());
    let plan = files[1].plan.as_ref().unwrap();
    assert_eq!(plan.statements["byId"].len(), 2);
}

#[test]
fn test_coverage_markers() {
    let dir = project();
    let suite = Suite::new(dir.path(), None);
    let files = suite.discover(None).unwrap();

    assert_eq!(files[0].coverage(), Coverage::Full);
    assert_eq!(files[1].coverage(), Coverage::Full);
    assert_eq!(Coverage::Partial.marker(), '~');
    assert_eq!(Coverage::None.marker(), ' ');
}

#[test]
fn test_expected_paths_for_plan_bindings() {
    // Scenario: b.sql's byId with two bindings lands at b/byId.0.out, b/byId.1.out.
    let dir = project();
    let suite = Suite::new(dir.path(), None);
    let files = suite.discover(None).unwrap();

    let b = &files[1];
    let stmt = &b.statements[0];
    let resolved = resolve_bindings(stmt, b.plan.as_ref());
    let paths: Vec<PathBuf> = resolved
        .bindings
        .iter()
        .map(|binding| artifact_rel_path(b, stmt, binding, Artifact::Expected))
        .collect();
    assert_eq!(
        paths,
        vec![
            PathBuf::from("queries/b/byId.0.out"),
            PathBuf::from("queries/b/byId.1.out"),
        ]
    );
}

#[test]
fn test_implicit_statement_expected_path_collapses() {
    // Scenario: a.sql with only the implicit statement maps to expected/a.out.
    let dir = project();
    let suite = Suite::new(dir.path(), None);
    let files = suite.discover(None).unwrap();

    let a = &files[0];
    let stmt = &a.statements[0];
    let resolved = resolve_bindings(stmt, None);
    let path = artifact_rel_path(a, stmt, &resolved.bindings[0], Artifact::Expected);
    assert_eq!(path, PathBuf::from("a.out"));
}

#[test]
fn test_baseline_and_metrics_paths() {
    let dir = project();
    let suite = Suite::new(dir.path(), None);
    let files = suite.discover(None).unwrap();

    let a = &files[0];
    let stmt = &a.statements[0];
    let resolved = resolve_bindings(stmt, None);
    assert_eq!(
        artifact_rel_path(a, stmt, &resolved.bindings[0], Artifact::Baseline),
        PathBuf::from("a.plan.json")
    );
    assert_eq!(
        artifact_rel_path(a, stmt, &resolved.bindings[0], Artifact::Metrics),
        PathBuf::from("a.metrics.json")
    );
}

#[test]
fn test_binding_labels() {
    let dir = project();
    let suite = Suite::new(dir.path(), None);
    let files = suite.discover(None).unwrap();

    let b = &files[1];
    let stmt = &b.statements[0];
    let resolved = resolve_bindings(stmt, b.plan.as_ref());
    assert_eq!(
        binding_label(b, stmt, &resolved.bindings[1]),
        "queries/b.sql:byId[1]"
    );
}

#[test]
fn test_layout_paths() {
    let dir = TempDir::new().unwrap();
    let suite = Suite::new(dir.path(), None);
    assert!(suite.config_path().ends_with("regresql/regress.yaml"));
    assert!(suite.expected_dir().ends_with("regresql/expected"));
    assert!(suite.plans_dir().ends_with("regresql/plans"));
    assert!(suite.fixtures_dir().ends_with("regresql/fixtures"));
    assert!(suite.snapshots_dir().ends_with("regresql/snapshots"));
    assert!(suite.lock_path().ends_with("regresql/.lock"));
}

#[test]
fn test_sql_root_override() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "src/sql/q.sql", "SELECT 1;\n");
    write(dir.path(), "other.sql", "SELECT 2;\n");

    let suite = Suite::new(dir.path(), Some(Path::new("src/sql")));
    let files = suite.discover(None).unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].rel, PathBuf::from("q.sql"));
}
