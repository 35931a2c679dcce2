use anyhow::{bail, Context, Result};
use std::path::PathBuf;

use super::FixtureCommands;
use crate::driver::write_atomic;
use crate::fixtures::{self, scaffold, ApplyOptions, FixtureSet};
use crate::introspect;
use crate::lock::Lock;
use crate::runner::Session;

pub fn run(dir: PathBuf, command: FixtureCommands) -> Result<()> {
    let (suite, config) = super::load_project(&dir)?;

    match command {
        FixtureCommands::List => {
            let (set, issues) = FixtureSet::load_dir(&suite.fixtures_dir())?;
            if set.fixtures.is_empty() && issues.is_empty() {
                println!("no fixtures under {}", suite.fixtures_dir().display());
                return Ok(());
            }
            for fixture in set.fixtures.values() {
                let tables = fixture.tables();
                print!("{}", fixture.name);
                if !fixture.depends_on.is_empty() {
                    print!(" (depends on {})", fixture.depends_on.join(", "));
                }
                if !tables.is_empty() {
                    print!(" -> {}", tables.join(", "));
                }
                println!();
                if let Some(description) = &fixture.description {
                    println!("    {description}");
                }
            }
            for issue in &issues {
                eprintln!("error: {issue}");
            }
            if !issues.is_empty() {
                std::process::exit(1);
            }
            Ok(())
        }

        FixtureCommands::Validate => {
            let (set, mut problems) = FixtureSet::load_dir(&suite.fixtures_dir())?;
            let mut session = Session::connect(&config.pguri)?;
            let schema = introspect::introspect(&mut session)?;
            problems.extend(fixtures::validate(&set, &schema));

            if problems.is_empty() {
                println!(
                    "{} fixture{} valid",
                    set.fixtures.len(),
                    if set.fixtures.len() == 1 { "" } else { "s" }
                );
                Ok(())
            } else {
                for problem in &problems {
                    eprintln!("error: {problem}");
                }
                eprintln!("{} problem(s) found", problems.len());
                std::process::exit(1);
            }
        }

        FixtureCommands::Show { name } => {
            let (set, _issues) = FixtureSet::load_dir(&suite.fixtures_dir())?;
            let fixture = set
                .get(&name)
                .with_context(|| format!("unknown fixture \"{name}\""))?;
            print!("{}", serde_yaml_ng::to_string(fixture)?);
            Ok(())
        }

        FixtureCommands::Apply { names, truncate } => {
            let (set, issues) = FixtureSet::load_dir(&suite.fixtures_dir())?;
            if let Some(issue) = issues.first() {
                bail!("fixture load failed: {issue}");
            }
            if set.fixtures.is_empty() {
                bail!("no fixtures under {}", suite.fixtures_dir().display());
            }

            let _lock = Lock::acquire(&suite.lock_path())?;
            let mut session = Session::connect(&config.pguri)?;
            let schema = introspect::introspect(&mut session)?;
            let report = fixtures::apply(
                &mut session,
                &set,
                &schema,
                &ApplyOptions {
                    truncate,
                    names: if names.is_empty() { None } else { Some(names) },
                },
            )?;

            for table in &report.truncated {
                println!("truncated {table}");
            }
            println!(
                "applied {} fixture{} ({} rows)",
                report.applied.len(),
                if report.applied.len() == 1 { "" } else { "s" },
                report.rows_inserted
            );
            Ok(())
        }

        FixtureCommands::Deps => {
            let (set, issues) = FixtureSet::load_dir(&suite.fixtures_dir())?;
            if let Some(issue) = issues.first() {
                bail!("fixture load failed: {issue}");
            }
            match set.apply_order() {
                Ok(order) => {
                    for (i, name) in order.iter().enumerate() {
                        let fixture = set.get(name).expect("order comes from the set");
                        if fixture.depends_on.is_empty() {
                            println!("{}. {}", i + 1, name);
                        } else {
                            println!("{}. {} (after {})", i + 1, name, fixture.depends_on.join(", "));
                        }
                    }
                    Ok(())
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    std::process::exit(1);
                }
            }
        }

        FixtureCommands::Scaffold {
            name,
            tables,
            counts,
            force,
        } => {
            let name = name.unwrap_or_else(|| "scaffold".to_string());
            let target = suite.fixtures_dir().join(format!("{name}.yaml"));
            if target.exists() && !force {
                bail!("{} already exists (--force to overwrite)", target.display());
            }

            let mut session = Session::connect(&config.pguri)?;
            let schema = introspect::introspect(&mut session)?;
            if schema.tables.is_empty() {
                bail!("no tables in the public schema; restore or build a snapshot first");
            }
            let stats = introspect::column_stats(&mut session)?;

            let result = scaffold::scaffold(
                &schema,
                &stats,
                &name,
                &scaffold::ScaffoldOptions {
                    tables: tables.map(|list| {
                        list.split(',')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect()
                    }),
                    count: counts,
                },
            );

            let yaml = serde_yaml_ng::to_string(&result.fixture)?;
            write_atomic(&target, yaml.as_bytes())?;
            println!("wrote {}", target.display());
            for warning in &result.warnings {
                println!("warning: {warning}");
            }
            Ok(())
        }
    }
}
