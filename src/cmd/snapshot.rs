use anyhow::Result;
use std::path::PathBuf;

use super::SnapshotCommands;
use crate::driver::short_hash;
use crate::lock::Lock;
use crate::runner::Session;
use crate::snapshot::{
    self, metadata_path, BuildOptions, CaptureOptions, RestoreOptions, SnapshotMetadata,
    SnapshotRecord, TagOptions,
};

pub fn run(dir: PathBuf, command: SnapshotCommands) -> Result<()> {
    let (suite, config) = super::load_project(&dir)?;

    match command {
        SnapshotCommands::Capture {
            format,
            schema_only,
            section,
            output,
            note,
        } => {
            let _lock = Lock::acquire(&suite.lock_path())?;
            let mut session = Session::connect(&config.pguri)?;
            let record = snapshot::capture(
                &suite,
                &config,
                &mut session,
                &CaptureOptions {
                    format,
                    schema_only,
                    section,
                    output,
                    note,
                    ..CaptureOptions::default()
                },
            )?;
            print_record_line(&record, true);
            Ok(())
        }

        SnapshotCommands::Restore {
            target,
            clean,
            format,
        } => {
            let _lock = Lock::acquire(&suite.lock_path())?;
            let mut session = Session::connect(&config.pguri)?;
            let metadata = SnapshotMetadata::load(&metadata_path(&suite))?;

            // A target naming an on-disk dump restores it directly; anything
            // else resolves through the metadata.
            let (dump, record_format) = match &target {
                Some(t) if PathBuf::from(t).exists() && metadata.find(t).is_none() => {
                    (PathBuf::from(t), None)
                }
                other => {
                    let record = metadata.resolve(other.as_deref())?;
                    (
                        snapshot::resolve_dump_path(&suite, &record.path),
                        Some(record.format),
                    )
                }
            };

            snapshot::restore(
                &config,
                &mut session,
                &dump,
                &RestoreOptions {
                    clean,
                    format: format.or(record_format),
                    ..RestoreOptions::default()
                },
            )?;
            println!("restored {}", dump.display());
            Ok(())
        }

        SnapshotCommands::Build {
            schema,
            migrations,
            fixtures,
            format,
            output,
            note,
        } => {
            let _lock = Lock::acquire(&suite.lock_path())?;
            let mut session = Session::connect(&config.pguri)?;
            let record = snapshot::build(
                &suite,
                &config,
                &mut session,
                &BuildOptions {
                    schema,
                    migrations,
                    migration_command: None,
                    fixtures: fixtures.map(|list| {
                        list.split(',')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect()
                    }),
                    format,
                    output,
                    note,
                    ..BuildOptions::default()
                },
            )?;
            print_record_line(&record, true);
            if !record.migrations_applied.is_empty() {
                println!("migrations applied: {}", record.migrations_applied.join(", "));
            }
            if !record.fixtures_used.is_empty() {
                println!("fixtures applied: {}", record.fixtures_used.join(", "));
            }
            Ok(())
        }

        SnapshotCommands::Info { target } => {
            let metadata = SnapshotMetadata::load(&metadata_path(&suite))?;
            let record = metadata.resolve(target.as_deref())?;
            print_record_full(record);
            Ok(())
        }

        SnapshotCommands::Tag {
            target,
            tag,
            note,
            archive,
        } => {
            let record = snapshot::tag(
                &suite,
                &TagOptions {
                    query: target,
                    tag,
                    note,
                    archive,
                },
            )?;
            print_record_line(&record, false);
            Ok(())
        }

        SnapshotCommands::List => {
            let metadata = SnapshotMetadata::load(&metadata_path(&suite))?;
            if metadata.history.is_empty() {
                println!("no snapshots recorded");
                return Ok(());
            }
            let current_hash = metadata.current.as_ref().map(|r| r.hash.clone());
            let mut records: Vec<&SnapshotRecord> = metadata.history.iter().collect();
            records.sort_by_key(|r| r.created);
            for record in records {
                let marker = if Some(&record.hash) == current_hash.as_ref() {
                    '*'
                } else {
                    ' '
                };
                println!(
                    "{} {} {} {:>10} {} {}",
                    marker,
                    short_hash(&record.hash),
                    record.created.format("%Y-%m-%d %H:%M:%S"),
                    record.size_bytes,
                    record.tag.as_deref().unwrap_or("-"),
                    record.note.as_deref().unwrap_or(""),
                );
            }
            Ok(())
        }
    }
}

fn print_record_line(record: &SnapshotRecord, with_path: bool) {
    let mut line = format!(
        "snapshot {} ({}, {} bytes)",
        short_hash(&record.hash),
        record.format,
        record.size_bytes
    );
    if let Some(tag) = &record.tag {
        line.push_str(&format!(" tag={tag}"));
    }
    if with_path {
        line.push_str(&format!(" at {}", record.path.display()));
    }
    println!("{line}");
}

fn print_record_full(record: &SnapshotRecord) {
    println!("hash:    {}", record.hash);
    println!("path:    {}", record.path.display());
    println!("format:  {}", record.format);
    println!("size:    {} bytes", record.size_bytes);
    println!("created: {}", record.created.to_rfc3339());
    if let Some(tag) = &record.tag {
        println!("tag:     {tag}");
    }
    if let Some(note) = &record.note {
        println!("note:    {note}");
    }
    if let Some(path) = &record.schema_path {
        println!(
            "schema:  {} ({})",
            path.display(),
            record
                .schema_hash
                .as_deref()
                .map(short_hash)
                .unwrap_or("-")
        );
    }
    if !record.migrations_applied.is_empty() {
        println!("migrations: {}", record.migrations_applied.join(", "));
    }
    if let Some(command) = &record.migration_command {
        println!("migration command: {command}");
    }
    if !record.fixtures_used.is_empty() {
        println!("fixtures: {}", record.fixtures_used.join(", "));
    }
    println!(
        "server:  {} (major {})",
        record.server.version, record.server.major
    );
    for (name, setting) in &record.server.planner {
        println!("  {name} = {setting}");
    }
}
