use anyhow::Result;
use std::path::PathBuf;

use crate::driver::{self, MigrateOptions};

pub fn run(
    dir: PathBuf,
    script: Option<PathBuf>,
    command: Option<String>,
    keep_temp: bool,
    timeout: Option<u64>,
) -> Result<()> {
    let (suite, config) = super::load_project(&dir)?;

    let report = driver::migrate(
        &suite,
        &config,
        &MigrateOptions {
            script,
            command,
            keep_temp,
            timeout_ms: timeout.map(|s| s * 1000),
        },
    )?;

    for skip in &report.skipped {
        println!("skip {} ({})", skip.label, skip.reason);
    }
    for issue in &report.issues {
        eprintln!("error {}: {}", issue.label, issue.reason);
    }
    for (label, diff) in &report.changed {
        println!("changed {label}");
        for line in diff.lines() {
            println!("  {line}");
        }
    }

    println!(
        "{} changed, {} unchanged",
        report.changed.len(),
        report.unchanged
    );
    if let Some(kept) = &report.kept {
        println!("before/after trees kept under {}", kept.display());
    }
    Ok(())
}
