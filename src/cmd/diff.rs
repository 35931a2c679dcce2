use anyhow::Result;
use std::path::PathBuf;

use crate::driver::{self, short_hash, SnapshotDiffOptions};

pub fn run(
    dir: PathBuf,
    from: String,
    to: String,
    query: Option<String>,
    timeout: Option<u64>,
) -> Result<()> {
    let (suite, config) = super::load_project(&dir)?;

    let report = driver::diff_snapshots(
        &suite,
        &config,
        &SnapshotDiffOptions {
            from,
            to,
            query: super::compile_filter(query)?,
            timeout_ms: timeout.map(|s| s * 1000),
        },
    )?;

    for (label, diff) in &report.changed {
        println!("changed {label}");
        for line in diff.lines() {
            println!("  {line}");
        }
    }

    println!(
        "{} changed, {} unchanged between {} and {}",
        report.changed.len(),
        report.unchanged,
        short_hash(&report.from_hash),
        short_hash(&report.to_hash),
    );
    Ok(())
}
