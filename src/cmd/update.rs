use anyhow::Result;
use std::path::PathBuf;

use crate::driver::{self, UpdateOptions};

#[allow(clippy::too_many_arguments)]
pub fn run(
    dir: PathBuf,
    run: Option<String>,
    dry_run: bool,
    interactive: bool,
    pending: bool,
    commit: bool,
    no_restore: bool,
    snapshot: Option<String>,
    timeout: Option<u64>,
) -> Result<()> {
    let (suite, config) = super::load_project(&dir)?;

    let options = UpdateOptions {
        run: super::compile_filter(run)?,
        dry_run,
        interactive,
        pending,
        commit,
        no_restore,
        snapshot,
        timeout_ms: timeout.map(|s| s * 1000),
    };
    let report = driver::update(&suite, &config, &options)?;

    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    for rel in &report.would_write {
        println!("would write expected/{rel}");
    }
    for rel in &report.written {
        println!("wrote expected/{rel}");
    }
    for rel in &report.declined {
        println!("declined expected/{rel}");
    }
    for skip in &report.skipped {
        println!("skip {} ({})", skip.label, skip.reason);
    }
    for issue in &report.issues {
        eprintln!("error {}: {}", issue.label, issue.reason);
    }

    let mut summary = vec![format!("{} written", report.written.len())];
    if dry_run {
        summary = vec![format!("{} would be written", report.would_write.len())];
    }
    if !report.unchanged.is_empty() {
        summary.push(format!("{} unchanged", report.unchanged.len()));
    }
    if !report.existing.is_empty() {
        summary.push(format!("{} existing kept", report.existing.len()));
    }
    if !report.skipped.is_empty() {
        summary.push(format!("{} skipped", report.skipped.len()));
    }
    if let Some(snapshot) = &report.snapshot {
        summary.push(format!(
            "snapshot {}",
            driver::short_hash(&snapshot.hash)
        ));
    }
    println!("{}", summary.join(", "));

    if !report.issues.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}
