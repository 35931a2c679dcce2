//! End-to-end pipelines combining the suite walker, runner, serialiser,
//! differ, explain, fixture, and snapshot engines.
//!
//! Every pipeline follows the same discipline: take the project lock, open
//! one session, restore the snapshot unless told otherwise, apply fixtures
//! when enabled, then run bindings file by file inside transactions.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use regex::Regex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::config::RegressConfig;
use crate::differ::unified_diff;
use crate::explain::{self, BaselineIndex, BaselineRecord, MetricDrift, PlanMetrics};
use crate::fixtures::{self, FixtureSet};
use crate::introspect;
use crate::lock::Lock;
use crate::plan::{self, ResolvedBinding};
use crate::query::Statement;
use crate::report::{TestCase, TestReport, Verdict};
use crate::runner::Session;
use crate::serializer;
use crate::snapshot::{self, RestoreOptions, SnapshotMetadata, SnapshotRecord};
use crate::suite::{artifact_rel_path, binding_label, Artifact, Suite, SuiteFile};

/// Write a file via temp-file + rename so crashes never leave torn files.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)
        .with_context(|| format!("creating {}", parent.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(&parent)
        .with_context(|| format!("creating temp file in {}", parent.display()))?;
    tmp.write_all(bytes)?;
    tmp.persist(path)
        .with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

/// Which snapshot to restore before running.
#[derive(Debug, Clone)]
pub enum RestorePolicy {
    /// `--no-restore`: keep the database as-is.
    Skip,
    /// Restore the current snapshot if one exists.
    Current,
    /// `--snapshot`: restore a specific tag or hash prefix.
    Named(String),
}

/// Everything a pipeline run needs, prepared once.
pub struct RunContext {
    pub session: Session,
    /// The snapshot in effect, for baseline correlation.
    pub snapshot: Option<SnapshotRecord>,
    _lock: Lock,
}

pub fn prepare(
    suite: &Suite,
    config: &RegressConfig,
    restore: RestorePolicy,
    timeout_ms: Option<u64>,
) -> Result<RunContext> {
    let lock = Lock::acquire(&suite.lock_path())?;
    let mut session = Session::connect(&config.pguri)?;
    if let Some(ms) = timeout_ms {
        session.set_statement_timeout(ms)?;
    }

    let metadata = SnapshotMetadata::load(&snapshot::metadata_path(suite))?;
    let record = match &restore {
        RestorePolicy::Skip => metadata.current.clone(),
        RestorePolicy::Current => metadata.current.clone(),
        RestorePolicy::Named(query) => Some(metadata.resolve(Some(query.as_str()))?.clone()),
    };

    if let Some(record) = &record {
        if !matches!(restore, RestorePolicy::Skip) {
            let dump = snapshot::resolve_dump_path(suite, &record.path);
            snapshot::restore(
                config,
                &mut session,
                &dump,
                &RestoreOptions {
                    clean: true,
                    format: Some(record.format),
                    timeout: Duration::from_secs(600),
                },
            )
            .with_context(|| format!("restoring snapshot {}", short_hash(&record.hash)))?;
        }
    }

    if config.fixtures_enabled {
        let (set, issues) = FixtureSet::load_dir(&suite.fixtures_dir())?;
        if let Some(issue) = issues.first() {
            bail!("fixture load failed: {issue}");
        }
        if !set.fixtures.is_empty() {
            let schema_info = introspect::introspect(&mut session)?;
            fixtures::apply(
                &mut session,
                &set,
                &schema_info,
                &fixtures::ApplyOptions::default(),
            )
            .context("applying fixtures")?;
        }
    }

    Ok(RunContext {
        session,
        snapshot: record,
        _lock: lock,
    })
}

pub fn short_hash(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}

/// One executed binding and its serialised output.
#[derive(Debug, Clone)]
pub struct RunItem {
    pub file_rel: PathBuf,
    pub stmt: Statement,
    pub binding: ResolvedBinding,
    pub label: String,
    pub expected_rel: PathBuf,
    /// The SQL with parameter values substituted, display only.
    pub display_sql: String,
    /// Serialised result set, or serialised error.
    pub output: String,
    pub error: Option<String>,
    pub elapsed_ms: f64,
}

/// A statement or binding that did not execute.
#[derive(Debug, Clone)]
pub struct SkippedItem {
    pub label: String,
    pub file: String,
    pub stmt: String,
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct SuiteRun {
    pub items: Vec<RunItem>,
    /// Whole statements skipped (parameterised without a plan).
    pub skipped: Vec<SkippedItem>,
    /// Individual bindings rejected by plan validation.
    pub issues: Vec<SkippedItem>,
    /// Plan names with no matching statement.
    pub warnings: Vec<String>,
}

/// Execute every binding of every file. Each file runs in one transaction;
/// a failed binding rolls it back, is recorded, and a fresh transaction
/// serves the rest. The commit policy decides the end-of-file fate.
pub fn execute_suite(
    session: &mut Session,
    files: &[SuiteFile],
    commit: bool,
) -> Result<SuiteRun> {
    let mut run = SuiteRun::default();

    for file in files {
        for name in file.unknown_plan_names() {
            run.warnings.push(format!(
                "{}: plan entry \"{}\" matches no statement",
                file.rel.display(),
                name
            ));
        }

        session.begin()?;
        for (stmt, resolved) in file.resolve() {
            if let Some(reason) = &resolved.skipped {
                run.skipped.push(SkippedItem {
                    label: format!("{}:{}", file.rel.display(), stmt.name),
                    file: file.rel.display().to_string(),
                    stmt: stmt.name.clone(),
                    index: 0,
                    reason: reason.clone(),
                });
            }
            for issue in &resolved.issues {
                run.issues.push(SkippedItem {
                    label: format!("{}:{}[{}]", file.rel.display(), issue.stmt, issue.index),
                    file: file.rel.display().to_string(),
                    stmt: issue.stmt.clone(),
                    index: issue.index,
                    reason: issue.message.clone(),
                });
            }

            for binding in &resolved.bindings {
                let started = Instant::now();
                let outcome = session.execute_binding(&stmt, &binding.values);
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

                let (output, error) = match outcome {
                    Ok(rs) => (serializer::serialize(&rs), None),
                    Err(e) => {
                        // The failed transaction is unusable; restart it so
                        // the remaining bindings run clean.
                        session.rollback()?;
                        session.begin()?;
                        (serializer::serialize_error(&e.message), Some(e.message))
                    }
                };

                run.items.push(RunItem {
                    file_rel: file.rel.clone(),
                    stmt: stmt.clone(),
                    binding: binding.clone(),
                    label: binding_label(file, &stmt, binding),
                    expected_rel: artifact_rel_path(file, &stmt, binding, Artifact::Expected),
                    display_sql: plan::substitute_literals(&stmt.body, &binding.values),
                    output,
                    error,
                    elapsed_ms,
                });
            }
        }
        if commit {
            session.commit()?;
        } else {
            session.rollback()?;
        }
    }

    Ok(run)
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub run: Option<Regex>,
    pub dry_run: bool,
    pub interactive: bool,
    /// Only write expected files that do not exist yet.
    pub pending: bool,
    pub commit: bool,
    pub no_restore: bool,
    pub snapshot: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Default)]
pub struct UpdateReport {
    pub written: Vec<String>,
    pub would_write: Vec<String>,
    pub unchanged: Vec<String>,
    pub declined: Vec<String>,
    pub existing: Vec<String>,
    pub skipped: Vec<SkippedItem>,
    pub issues: Vec<SkippedItem>,
    pub warnings: Vec<String>,
    pub snapshot: Option<SnapshotRecord>,
}

/// Materialise expected outputs for every binding.
pub fn update(suite: &Suite, config: &RegressConfig, options: &UpdateOptions) -> Result<UpdateReport> {
    let restore = if options.no_restore {
        RestorePolicy::Skip
    } else {
        match &options.snapshot {
            Some(query) => RestorePolicy::Named(query.clone()),
            None => RestorePolicy::Current,
        }
    };
    let mut ctx = prepare(suite, config, restore, options.timeout_ms)?;

    let files = suite.discover(options.run.as_ref())?;
    let run = execute_suite(&mut ctx.session, &files, options.commit)?;

    let expected_dir = suite.expected_dir();
    let baselines_path = suite.regres_dir().join("baselines.json");
    let mut index = BaselineIndex::load(&baselines_path)?;
    let mut report = UpdateReport {
        skipped: run.skipped,
        issues: run.issues,
        warnings: run.warnings,
        snapshot: ctx.snapshot.clone(),
        ..UpdateReport::default()
    };

    for item in &run.items {
        let target = expected_dir.join(&item.expected_rel);
        let rel = item.expected_rel.to_string_lossy().replace('\\', "/");

        if options.pending && target.is_file() {
            report.existing.push(rel);
            continue;
        }

        let previous = std::fs::read_to_string(&target).ok();
        if previous.as_deref() == Some(item.output.as_str()) {
            report.unchanged.push(rel);
            continue;
        }

        if options.dry_run {
            report.would_write.push(rel);
            continue;
        }

        if options.interactive {
            if let Some(diff) = unified_diff(
                previous.as_deref().unwrap_or(""),
                &item.output,
                &format!("expected/{rel}"),
                "new",
                3,
            ) {
                println!("{}", item.label);
                print!("{diff}");
            }
            if !confirm(&format!("write expected/{rel}?"))? {
                report.declined.push(rel);
                continue;
            }
        }

        write_atomic(&target, item.output.as_bytes())
            .with_context(|| format!("writing expected file for {}", item.label))?;
        if let Some(snapshot) = &ctx.snapshot {
            index.record(
                &rel,
                BaselineRecord {
                    snapshot_hash: snapshot.hash.clone(),
                    snapshot_tag: snapshot.tag.clone(),
                    created: Utc::now(),
                },
            );
        }
        report.written.push(rel);
    }

    if !options.dry_run && !report.written.is_empty() {
        index.save(&baselines_path)?;
    }

    Ok(report)
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    let answer = answer.trim().to_lowercase();
    Ok(answer == "y" || answer == "yes")
}

#[derive(Debug, Clone, Default)]
pub struct TestOptions {
    pub run: Option<Regex>,
    pub commit: bool,
    pub timeout_ms: Option<u64>,
}

/// Execute every binding and compare against the expected files.
pub fn test(suite: &Suite, config: &RegressConfig, options: &TestOptions) -> Result<TestReport> {
    let started = Utc::now();
    let clock = Instant::now();
    let mut ctx = prepare(suite, config, RestorePolicy::Current, options.timeout_ms)?;

    let files = suite.discover(options.run.as_ref())?;
    let run = execute_suite(&mut ctx.session, &files, options.commit)?;

    let expected_dir = suite.expected_dir();
    let mut report = TestReport::new(started);

    for item in &run.items {
        let target = expected_dir.join(&item.expected_rel);
        let rel = item.expected_rel.to_string_lossy().replace('\\', "/");
        let file = item.file_rel.display().to_string();

        let case = match std::fs::read_to_string(&target) {
            Err(_) => TestCase {
                label: item.label.clone(),
                file,
                stmt: item.stmt.name.clone(),
                index: item.binding.index,
                verdict: Verdict::Error,
                message: Some(format!(
                    "missing expected file expected/{rel}; run `regresql update`"
                )),
                diff: None,
                sql: Some(item.display_sql.clone()),
                elapsed_ms: item.elapsed_ms,
            },
            Ok(expected) => match unified_diff(
                &expected,
                &item.output,
                &format!("expected/{rel}"),
                "actual",
                3,
            ) {
                None => TestCase {
                    label: item.label.clone(),
                    file,
                    stmt: item.stmt.name.clone(),
                    index: item.binding.index,
                    verdict: Verdict::Pass,
                    message: None,
                    diff: None,
                    sql: None,
                    elapsed_ms: item.elapsed_ms,
                },
                Some(diff) => TestCase {
                    label: item.label.clone(),
                    file,
                    stmt: item.stmt.name.clone(),
                    index: item.binding.index,
                    verdict: Verdict::Fail,
                    message: item.error.clone(),
                    diff: Some(diff),
                    sql: Some(item.display_sql.clone()),
                    elapsed_ms: item.elapsed_ms,
                },
            },
        };
        report.cases.push(case);
    }

    let noted = run
        .skipped
        .iter()
        .map(|s| (s, Verdict::Skip))
        .chain(run.issues.iter().map(|i| (i, Verdict::Error)));
    for (skip, verdict) in noted {
        report.cases.push(TestCase {
            label: skip.label.clone(),
            file: skip.file.clone(),
            stmt: skip.stmt.clone(),
            index: skip.index,
            verdict,
            message: Some(skip.reason.clone()),
            diff: None,
            sql: None,
            elapsed_ms: 0.0,
        });
    }

    report.elapsed_ms = clock.elapsed().as_secs_f64() * 1000.0;
    Ok(report)
}

#[derive(Debug, Clone, Default)]
pub struct BaselineOptions {
    pub run: Option<Regex>,
    pub analyze: bool,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Default)]
pub struct BaselineReport {
    pub captured: Vec<String>,
    /// Baselines whose metrics drifted past the thresholds.
    pub regressions: Vec<(String, Vec<MetricDrift>)>,
    pub skipped: Vec<SkippedItem>,
    pub issues: Vec<SkippedItem>,
}

/// Capture EXPLAIN baselines for every binding, comparing against any
/// previous metrics before overwriting them.
pub fn baseline(
    suite: &Suite,
    config: &RegressConfig,
    options: &BaselineOptions,
) -> Result<BaselineReport> {
    let mut ctx = prepare(suite, config, RestorePolicy::Current, options.timeout_ms)?;

    let files = suite.discover(options.run.as_ref())?;
    let expected_dir = suite.expected_dir();
    let baselines_path = suite.regres_dir().join("baselines.json");
    let mut index = BaselineIndex::load(&baselines_path)?;
    let mut report = BaselineReport::default();

    for file in &files {
        // EXPLAIN ANALYZE executes the statement, so baselines run under
        // the same rollback discipline as update and test.
        ctx.session.begin()?;
        for (stmt, resolved) in file.resolve() {
            if let Some(reason) = &resolved.skipped {
                report.skipped.push(SkippedItem {
                    label: format!("{}:{}", file.rel.display(), stmt.name),
                    file: file.rel.display().to_string(),
                    stmt: stmt.name.clone(),
                    index: 0,
                    reason: reason.clone(),
                });
            }
            for issue in &resolved.issues {
                report.issues.push(SkippedItem {
                    label: format!("{}:{}[{}]", file.rel.display(), issue.stmt, issue.index),
                    file: file.rel.display().to_string(),
                    stmt: issue.stmt.clone(),
                    index: issue.index,
                    reason: issue.message.clone(),
                });
            }

            for binding in &resolved.bindings {
                let label = binding_label(file, &stmt, binding);
                let sql = plan::substitute_literals(&stmt.body, &binding.values);

                let (doc, metrics) =
                    match explain::capture_plan(&mut ctx.session, &sql, options.analyze) {
                        Ok(captured) => captured,
                        Err(e) => {
                            ctx.session.rollback()?;
                            ctx.session.begin()?;
                            report.issues.push(SkippedItem {
                                label: label.clone(),
                                file: file.rel.display().to_string(),
                                stmt: stmt.name.clone(),
                                index: binding.index,
                                reason: e.to_string(),
                            });
                            continue;
                        }
                    };

                let baseline_rel = artifact_rel_path(file, &stmt, binding, Artifact::Baseline);
                let metrics_rel = artifact_rel_path(file, &stmt, binding, Artifact::Metrics);
                let metrics_path = expected_dir.join(&metrics_rel);

                if let Ok(text) = std::fs::read_to_string(&metrics_path) {
                    if let Ok(previous) = serde_json::from_str::<PlanMetrics>(&text) {
                        let drifts = explain::compare(&previous, &metrics);
                        if explain::has_regression(&drifts) {
                            report.regressions.push((label.clone(), drifts));
                        }
                    }
                }

                let doc_text = serde_json::to_string_pretty(&doc)?;
                write_atomic(
                    &expected_dir.join(&baseline_rel),
                    format!("{doc_text}\n").as_bytes(),
                )?;
                let metrics_text = serde_json::to_string_pretty(&metrics)?;
                write_atomic(&metrics_path, format!("{metrics_text}\n").as_bytes())?;

                if let Some(snapshot) = &ctx.snapshot {
                    index.record(
                        &baseline_rel.to_string_lossy().replace('\\', "/"),
                        BaselineRecord {
                            snapshot_hash: snapshot.hash.clone(),
                            snapshot_tag: snapshot.tag.clone(),
                            created: Utc::now(),
                        },
                    );
                }
                report.captured.push(label);
            }
        }
        ctx.session.rollback()?;
    }

    index.save(&baselines_path)?;
    Ok(report)
}

#[derive(Debug, Clone, Default)]
pub struct MigrateOptions {
    pub script: Option<PathBuf>,
    pub command: Option<String>,
    pub keep_temp: bool,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Default)]
pub struct MigrateReport {
    /// (label, unified diff before → after)
    pub changed: Vec<(String, String)>,
    pub unchanged: usize,
    pub skipped: Vec<SkippedItem>,
    pub issues: Vec<SkippedItem>,
    /// Where the before/after trees were kept, with `--keep-temp`.
    pub kept: Option<PathBuf>,
}

/// Run all bindings, apply a migration, run again, and diff.
pub fn migrate(
    suite: &Suite,
    config: &RegressConfig,
    options: &MigrateOptions,
) -> Result<MigrateReport> {
    match (&options.script, &options.command) {
        (Some(_), Some(_)) => bail!("migrate takes either --script or --command, not both"),
        (None, None) => bail!("migrate needs --script or --command"),
        _ => {}
    }

    let mut ctx = prepare(suite, config, RestorePolicy::Current, options.timeout_ms)?;
    let files = suite.discover(None)?;

    let before = execute_suite(&mut ctx.session, &files, false)?;

    if let Some(script) = &options.script {
        let path = if script.is_absolute() {
            script.clone()
        } else {
            suite.project_root.join(script)
        };
        snapshot::apply_sql_file(config, &path, Duration::from_secs(600))
            .with_context(|| format!("applying migration script {}", path.display()))?;
    }
    if let Some(command) = &options.command {
        snapshot::process::ToolCommand::shell(command)
            .env("PGURI", &config.pguri)
            .timeout(Duration::from_secs(600))
            .run()
            .context("migration command failed")?;
    }

    let after = execute_suite(&mut ctx.session, &files, false)?;

    let mut report = MigrateReport {
        skipped: before.skipped.clone(),
        issues: before.issues.clone(),
        ..MigrateReport::default()
    };

    for before_item in &before.items {
        let Some(after_item) = after.items.iter().find(|i| i.label == before_item.label)
        else {
            continue;
        };
        match unified_diff(&before_item.output, &after_item.output, "before", "after", 3) {
            Some(diff) => report.changed.push((before_item.label.clone(), diff)),
            None => report.unchanged += 1,
        }
    }

    if options.keep_temp {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let root = suite.regres_dir().join(format!("migrate-{stamp}"));
        for (tree, run) in [("before", &before), ("after", &after)] {
            for item in &run.items {
                write_atomic(
                    &root.join(tree).join(&item.expected_rel),
                    item.output.as_bytes(),
                )?;
            }
        }
        report.kept = Some(root);
    }

    Ok(report)
}

#[derive(Debug, Clone)]
pub struct SnapshotDiffOptions {
    pub from: String,
    pub to: String,
    pub query: Option<Regex>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Default)]
pub struct SnapshotDiffReport {
    pub changed: Vec<(String, String)>,
    pub unchanged: usize,
    pub from_hash: String,
    pub to_hash: String,
}

/// Restore two snapshots in sequence against the single configured
/// database, capturing all bindings after each, and diff per binding.
pub fn diff_snapshots(
    suite: &Suite,
    config: &RegressConfig,
    options: &SnapshotDiffOptions,
) -> Result<SnapshotDiffReport> {
    let _lock = Lock::acquire(&suite.lock_path())?;
    let mut session = Session::connect(&config.pguri)?;
    if let Some(ms) = options.timeout_ms {
        session.set_statement_timeout(ms)?;
    }

    let metadata = SnapshotMetadata::load(&snapshot::metadata_path(suite))?;
    let from = metadata.resolve(Some(options.from.as_str()))?.clone();
    let to = metadata.resolve(Some(options.to.as_str()))?.clone();

    let files = suite.discover(options.query.as_ref())?;

    let mut capture = |session: &mut Session, record: &SnapshotRecord| -> Result<SuiteRun> {
        let dump = snapshot::resolve_dump_path(suite, &record.path);
        snapshot::restore(
            config,
            session,
            &dump,
            &RestoreOptions {
                clean: true,
                format: Some(record.format),
                timeout: Duration::from_secs(600),
            },
        )
        .with_context(|| format!("restoring snapshot {}", short_hash(&record.hash)))?;
        execute_suite(session, &files, false)
    };

    let before = capture(&mut session, &from)?;
    let after = capture(&mut session, &to)?;

    let mut report = SnapshotDiffReport {
        from_hash: from.hash.clone(),
        to_hash: to.hash.clone(),
        ..SnapshotDiffReport::default()
    };

    for before_item in &before.items {
        let Some(after_item) = after.items.iter().find(|i| i.label == before_item.label)
        else {
            continue;
        };
        match unified_diff(
            &before_item.output,
            &after_item.output,
            &format!("{} @ {}", before_item.label, short_hash(&from.hash)),
            &format!("{} @ {}", after_item.label, short_hash(&to.hash)),
            3,
        ) {
            Some(diff) => report.changed.push((before_item.label.clone(), diff)),
            None => report.unchanged += 1,
        }
    }

    Ok(report)
}
