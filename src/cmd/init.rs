use anyhow::{bail, Result};
use std::path::PathBuf;

use crate::config::RegressConfig;
use crate::suite::Suite;

/// Dump files stay out of version control; the metadata does not.
const SNAPSHOTS_GITIGNORE: &str = "*\n!.gitignore\n!metadata.json\n";

pub fn run(dir: PathBuf, use_fixtures: bool) -> Result<()> {
    let suite = Suite::new(&dir, None);
    let config_path = suite.config_path();
    if config_path.exists() {
        bail!(
            "{} already exists; edit it or remove it to re-initialise",
            config_path.display()
        );
    }

    let mut dirs = vec![
        suite.regres_dir(),
        suite.expected_dir(),
        suite.plans_dir(),
        suite.snapshots_dir(),
    ];
    if use_fixtures {
        dirs.push(suite.fixtures_dir());
    }
    for dir in &dirs {
        std::fs::create_dir_all(dir)?;
        println!("created {}", dir.display());
    }

    let config = RegressConfig {
        pguri: std::env::var("PGURI")
            .unwrap_or_else(|_| "postgres://localhost/your_database".to_string()),
        fixtures_enabled: use_fixtures,
        ..RegressConfig::default()
    };
    config.save(&config_path)?;
    println!("created {}", config_path.display());

    std::fs::write(
        suite.snapshots_dir().join(".gitignore"),
        SNAPSHOTS_GITIGNORE,
    )?;

    println!();
    println!("Next steps:");
    println!("  1. Review {} (pguri)", config_path.display());
    println!("  2. Seed plan files:          regresql add");
    println!("  3. Build or capture a state: regresql snapshot build");
    println!("  4. Materialise expectations: regresql update");
    Ok(())
}
