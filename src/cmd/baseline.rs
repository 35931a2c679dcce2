use anyhow::Result;
use std::path::PathBuf;

use crate::driver::{self, BaselineOptions};
use crate::explain::{self, BaselineIndex};
use crate::snapshot::{metadata_path, SnapshotMetadata};

/// `baseline`: capture EXPLAIN baselines, reporting drift against any
/// previous metrics before overwriting them.
pub fn run(dir: PathBuf, analyze: bool, run: Option<String>, timeout: Option<u64>) -> Result<()> {
    let (suite, config) = super::load_project(&dir)?;

    let options = BaselineOptions {
        run: super::compile_filter(run)?,
        analyze,
        timeout_ms: timeout.map(|s| s * 1000),
    };
    let report = driver::baseline(&suite, &config, &options)?;

    for label in &report.captured {
        println!("captured {label}");
    }
    for skip in &report.skipped {
        println!("skip {} ({})", skip.label, skip.reason);
    }
    for issue in &report.issues {
        eprintln!("error {}: {}", issue.label, issue.reason);
    }
    for (label, drifts) in &report.regressions {
        println!("plan drift in {label}:");
        for drift in drifts {
            if drift.regression {
                println!(
                    "  {}: {} -> {}",
                    drift.metric, drift.baseline, drift.current
                );
            }
        }
    }

    println!(
        "{} captured, {} with drift, {} skipped",
        report.captured.len(),
        report.regressions.len(),
        report.skipped.len()
    );

    if !report.issues.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

/// `check-baselines`: correlate the index with the current snapshot.
pub fn check(dir: PathBuf) -> Result<()> {
    let (suite, _config) = super::load_project(&dir)?;

    let index = BaselineIndex::load(&suite.regres_dir().join("baselines.json"))?;
    let metadata = SnapshotMetadata::load(&metadata_path(&suite))?;
    let current_hash = metadata.current.as_ref().map(|r| r.hash.clone());

    let check = explain::check_baselines(
        &index,
        &suite.expected_dir(),
        current_hash.as_deref(),
    );

    if index.entries.is_empty() {
        println!("no baselines recorded; run `regresql baseline` first");
        return Ok(());
    }

    println!("current ({}):", check.current.len());
    for rel in &check.current {
        println!("  {rel}");
    }
    if !check.outdated.is_empty() {
        println!("outdated ({}):", check.outdated.len());
        for (rel, hash) in &check.outdated {
            println!("  {} (captured under {})", rel, driver::short_hash(hash));
        }
    }
    if !check.orphaned.is_empty() {
        println!("orphaned ({}):", check.orphaned.len());
        for rel in &check.orphaned {
            println!("  {rel} (file missing)");
        }
    }

    if !check.outdated.is_empty() || !check.orphaned.is_empty() {
        println!("run `regresql update` and `regresql baseline` to refresh");
        std::process::exit(1);
    }
    Ok(())
}
