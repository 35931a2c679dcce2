//! Suite discovery: walk the SQL root, split files, attach plan files.
//!
//! The suite layout is the persistence interface. A project tree carries a
//! `regresql/` directory next to the SQL files holding config, expected
//! outputs, plans, fixtures, and snapshots.

use anyhow::{Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};

use crate::plan::{self, Plan, ResolvedBinding, StatementBindings};
use crate::query::{self, Statement};

pub const REGRES_DIR: &str = "regresql";
pub const CONFIG_FILE: &str = "regress.yaml";
pub const EXPECTED_DIR: &str = "expected";
pub const PLANS_DIR: &str = "plans";
pub const FIXTURES_DIR: &str = "fixtures";
pub const SNAPSHOTS_DIR: &str = "snapshots";

/// A project's regresql layout, rooted at the directory holding `regresql/`.
#[derive(Debug, Clone)]
pub struct Suite {
    /// Project root (`-C` directory).
    pub project_root: PathBuf,
    /// SQL discovery root; defaults to the project root.
    pub sql_root: PathBuf,
}

impl Suite {
    pub fn new(project_root: &Path, sql_root: Option<&Path>) -> Self {
        let sql_root = match sql_root {
            Some(p) if p.is_absolute() => p.to_path_buf(),
            Some(p) => project_root.join(p),
            None => project_root.to_path_buf(),
        };
        Self {
            project_root: project_root.to_path_buf(),
            sql_root,
        }
    }

    pub fn regres_dir(&self) -> PathBuf {
        self.project_root.join(REGRES_DIR)
    }

    pub fn config_path(&self) -> PathBuf {
        self.regres_dir().join(CONFIG_FILE)
    }

    pub fn expected_dir(&self) -> PathBuf {
        self.regres_dir().join(EXPECTED_DIR)
    }

    pub fn plans_dir(&self) -> PathBuf {
        self.regres_dir().join(PLANS_DIR)
    }

    pub fn fixtures_dir(&self) -> PathBuf {
        self.regres_dir().join(FIXTURES_DIR)
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.regres_dir().join(SNAPSHOTS_DIR)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.regres_dir().join(".lock")
    }

    /// Discover SQL files under the root, split them, and attach plans.
    /// `filter` matches against the file's relative path.
    pub fn discover(&self, filter: Option<&Regex>) -> Result<Vec<SuiteFile>> {
        let mut paths = Vec::new();
        walk_sql_files(&self.sql_root, &mut paths)
            .with_context(|| format!("walking SQL root {}", self.sql_root.display()))?;
        paths.sort();

        let mut files = Vec::new();
        for path in paths {
            let rel = path
                .strip_prefix(&self.sql_root)
                .expect("walked path is under the root")
                .to_path_buf();
            if let Some(re) = filter {
                if !re.is_match(&rel.to_string_lossy()) {
                    continue;
                }
            }

            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading SQL file {}", path.display()))?;
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let statements = query::split_file(&stem, &text);

            let plan_path = self.plans_dir().join(plan::plan_rel_path(&rel));
            let plan = if plan_path.is_file() {
                Some(Plan::load(&plan_path)?)
            } else {
                None
            };

            files.push(SuiteFile {
                path,
                rel,
                stem,
                statements,
                plan,
            });
        }

        Ok(files)
    }
}

fn walk_sql_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if path.is_dir() {
            if name == REGRES_DIR || name.starts_with('.') {
                continue;
            }
            walk_sql_files(&path, out)?;
        } else if path.extension().map(|e| e == "sql").unwrap_or(false) {
            out.push(path);
        }
    }
    Ok(())
}

/// One discovered SQL file with its statements and optional plan.
#[derive(Debug, Clone)]
pub struct SuiteFile {
    pub path: PathBuf,
    /// Path relative to the SQL root.
    pub rel: PathBuf,
    /// File stem; names the implicit statement.
    pub stem: String,
    pub statements: Vec<Statement>,
    pub plan: Option<Plan>,
}

/// Plan coverage marker for discovery listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    Full,
    Partial,
    None,
}

impl Coverage {
    pub fn marker(self) -> char {
        match self {
            Coverage::Full => '+',
            Coverage::Partial => '~',
            Coverage::None => ' ',
        }
    }
}

impl SuiteFile {
    /// Resolve bindings for every statement in file order.
    pub fn resolve(&self) -> Vec<(Statement, StatementBindings)> {
        self.statements
            .iter()
            .map(|stmt| (stmt.clone(), plan::resolve_bindings(stmt, self.plan.as_ref())))
            .collect()
    }

    /// Statement names in the plan with no matching statement.
    pub fn unknown_plan_names(&self) -> Vec<String> {
        let known: Vec<&str> = self.statements.iter().map(|s| s.name.as_str()).collect();
        self.plan
            .as_ref()
            .map(|p| p.unknown_names(&known).iter().map(|s| s.to_string()).collect())
            .unwrap_or_default()
    }

    pub fn coverage(&self) -> Coverage {
        let resolved = self.resolve();
        let bound = resolved
            .iter()
            .filter(|(_, b)| !b.bindings.is_empty())
            .count();
        if bound == resolved.len() && !resolved.is_empty() {
            Coverage::Full
        } else if bound > 0 {
            Coverage::Partial
        } else {
            Coverage::None
        }
    }

    /// Relative path with the `.sql` extension removed.
    pub fn stem_rel(&self) -> PathBuf {
        self.rel.with_extension("")
    }
}

/// On-disk artifact kinds derived from a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Expected,
    Baseline,
    Metrics,
}

impl Artifact {
    fn extension(self) -> &'static str {
        match self {
            Artifact::Expected => "out",
            Artifact::Baseline => "plan.json",
            Artifact::Metrics => "metrics.json",
        }
    }
}

/// Compute the artifact path for a binding, relative to `expected/`.
///
/// The implicit statement (named after the file) collapses onto the file
/// stem itself; named statements nest under a directory per file. The
/// binding index is omitted when the statement has exactly one binding.
pub fn artifact_rel_path(
    file: &SuiteFile,
    stmt: &Statement,
    binding: &ResolvedBinding,
    artifact: Artifact,
) -> PathBuf {
    let stem_rel = file.stem_rel();
    let base = if stmt.name == file.stem {
        stem_rel
    } else {
        stem_rel.join(&stmt.name)
    };

    let mut name = base
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !binding.single {
        name.push_str(&format!(".{}", binding.index));
    }
    name.push('.');
    name.push_str(artifact.extension());

    base.with_file_name(name)
}

/// Human-readable binding identifier for reports and error messages.
pub fn binding_label(file: &SuiteFile, stmt: &Statement, binding: &ResolvedBinding) -> String {
    if binding.single {
        format!("{}:{}", file.rel.display(), stmt.name)
    } else {
        format!("{}:{}[{}]", file.rel.display(), stmt.name, binding.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::resolve_bindings;

    fn file_with(text: &str, rel: &str, plan_yaml: Option<&str>) -> SuiteFile {
        let rel = PathBuf::from(rel);
        let stem = rel
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap();
        SuiteFile {
            path: PathBuf::from("/tmp").join(&rel),
            rel: rel.clone(),
            stem: stem.clone(),
            statements: query::split_file(&stem, text),
            plan: plan_yaml.map(|y| serde_yaml_ng::from_str(y).unwrap()),
        }
    }

    #[test]
    fn test_implicit_statement_collapses_path() {
        let file = file_with("SELECT 1;", "a.sql", None);
        let stmt = &file.statements[0];
        let resolved = resolve_bindings(stmt, None);
        let path = artifact_rel_path(&file, stmt, &resolved.bindings[0], Artifact::Expected);
        assert_eq!(path, PathBuf::from("a.out"));
    }

    #[test]
    fn test_named_statement_indexed_paths() {
        let file = file_with(
            "-- name: byId\nSELECT * FROM t WHERE id = :id;",
            "b.sql",
            Some("byId:\n  - id: 1\n  - id: 2\n"),
        );
        let stmt = &file.statements[0];
        let resolved = resolve_bindings(stmt, file.plan.as_ref());
        assert_eq!(resolved.bindings.len(), 2);
        let p0 = artifact_rel_path(&file, stmt, &resolved.bindings[0], Artifact::Expected);
        let p1 = artifact_rel_path(&file, stmt, &resolved.bindings[1], Artifact::Expected);
        assert_eq!(p0, PathBuf::from("b/byId.0.out"));
        assert_eq!(p1, PathBuf::from("b/byId.1.out"));
    }

    #[test]
    fn test_nested_rel_path_preserved() {
        let file = file_with(
            "-- name: q\nSELECT 1;",
            "queries/reports/daily.sql",
            None,
        );
        let stmt = &file.statements[0];
        let resolved = resolve_bindings(stmt, None);
        let path = artifact_rel_path(&file, stmt, &resolved.bindings[0], Artifact::Baseline);
        assert_eq!(path, PathBuf::from("queries/reports/daily/q.plan.json"));
    }

    #[test]
    fn test_coverage_markers() {
        let full = file_with("SELECT 1;", "a.sql", None);
        assert_eq!(full.coverage(), Coverage::Full);

        let none = file_with("SELECT :x;", "a.sql", None);
        assert_eq!(none.coverage(), Coverage::None);

        let partial = file_with(
            "-- name: p\nSELECT :x;\n-- name: q\nSELECT 1;",
            "a.sql",
            None,
        );
        assert_eq!(partial.coverage(), Coverage::Partial);
    }
}
