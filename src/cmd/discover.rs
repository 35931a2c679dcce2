use anyhow::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::driver::write_atomic;
use crate::plan::{self, PlanValue};

/// `discover`: list files, statements, and plan coverage.
pub fn run(dir: PathBuf, queries: bool) -> Result<()> {
    let (suite, _config) = super::load_project(&dir)?;
    let files = suite.discover(None)?;

    if files.is_empty() {
        println!("no SQL files under {}", suite.sql_root.display());
        return Ok(());
    }

    for file in &files {
        println!(
            "{} {} ({} statement{})",
            file.coverage().marker(),
            file.rel.display(),
            file.statements.len(),
            if file.statements.len() == 1 { "" } else { "s" },
        );
        if queries {
            for stmt in &file.statements {
                if stmt.params.is_empty() {
                    println!("    {}", stmt.name);
                } else {
                    let params: Vec<String> =
                        stmt.params.iter().map(|p| format!(":{p}")).collect();
                    println!("    {} ({})", stmt.name, params.join(", "));
                }
            }
        }
        for name in file.unknown_plan_names() {
            println!("    warning: plan entry \"{name}\" matches no statement");
        }
    }
    Ok(())
}

/// `add`: seed plan files for parameterised statements.
pub fn add(dir: PathBuf, force: bool) -> Result<()> {
    let (suite, _config) = super::load_project(&dir)?;
    let files = suite.discover(None)?;
    let plans_dir = suite.plans_dir();

    let mut seeded = 0;
    for file in &files {
        let parameterised: Vec<_> = file
            .statements
            .iter()
            .filter(|s| !s.params.is_empty())
            .collect();
        if parameterised.is_empty() {
            continue;
        }

        let plan_path = plans_dir.join(plan::plan_rel_path(&file.rel));
        if plan_path.exists() && !force {
            println!("exists {} (--force to overwrite)", plan_path.display());
            continue;
        }

        let mut statements = BTreeMap::new();
        for stmt in parameterised {
            let binding: BTreeMap<String, PlanValue> = stmt
                .params
                .iter()
                .map(|p| (p.clone(), PlanValue::Null))
                .collect();
            statements.insert(stmt.name.clone(), vec![binding]);
        }
        let plan = plan::Plan { statements };
        let yaml = serde_yaml_ng::to_string(&plan)?;
        write_atomic(&plan_path, yaml.as_bytes())?;
        println!("seeded {}", plan_path.display());
        seeded += 1;
    }

    if seeded == 0 {
        println!("nothing to seed; no parameterised statements without plans");
    }
    Ok(())
}
