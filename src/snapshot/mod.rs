//! Snapshot lifecycle: capture, restore, build, tag, list.
//!
//! A snapshot is a dump of the database plus a metadata record that
//! identifies it: content hash, server context, and the inputs that built
//! it. `metadata.json` is committed; the dump files are not.

pub mod hash;
pub mod process;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::RegressConfig;
use crate::driver::write_atomic;
use crate::fixtures::{self, FixtureSet};
use crate::introspect;
use crate::runner::Session;
use crate::suite::Suite;
use process::ToolCommand;

/// Dump format, mirroring pg_dump's `--format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DumpFormat {
    #[default]
    Custom,
    Plain,
    Directory,
}

impl std::str::FromStr for DumpFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "custom" | "c" => Ok(DumpFormat::Custom),
            "plain" | "p" => Ok(DumpFormat::Plain),
            "directory" | "d" => Ok(DumpFormat::Directory),
            _ => Err(format!(
                "unknown dump format: {}. Valid options: custom, plain, directory",
                s
            )),
        }
    }
}

impl std::fmt::Display for DumpFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DumpFormat::Custom => f.write_str("custom"),
            DumpFormat::Plain => f.write_str("plain"),
            DumpFormat::Directory => f.write_str("directory"),
        }
    }
}

impl DumpFormat {
    fn flag(self) -> &'static str {
        match self {
            DumpFormat::Custom => "custom",
            DumpFormat::Plain => "plain",
            DumpFormat::Directory => "directory",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            DumpFormat::Custom => "dump",
            DumpFormat::Plain => "sql",
            DumpFormat::Directory => "dir",
        }
    }
}

/// Server version and the planner settings that shape query plans.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerContext {
    pub version: String,
    pub major: u32,
    #[serde(default)]
    pub planner: BTreeMap<String, String>,
}

/// One snapshot's metadata record. Readers must tolerate unknown keys,
/// which serde does by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub path: PathBuf,
    pub format: DumpFormat,
    pub size_bytes: u64,
    /// Content hash: dump hash for captures, build hash for builds.
    pub hash: String,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrations_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrations_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub migrations_applied: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_command_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fixtures_used: Vec<String>,
    #[serde(default)]
    pub server: ServerContext,
}

/// `snapshots/metadata.json`: the current snapshot plus full history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<SnapshotRecord>,
    #[serde(default)]
    pub history: Vec<SnapshotRecord>,
}

pub fn metadata_path(suite: &Suite) -> PathBuf {
    suite.snapshots_dir().join("metadata.json")
}

impl SnapshotMetadata {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut text = serde_json::to_string_pretty(self).context("serialising metadata")?;
        text.push('\n');
        write_atomic(path, text.as_bytes())
            .with_context(|| format!("writing {}", path.display()))
    }

    /// Find a record by exact tag, then by hash prefix, newest first.
    pub fn find(&self, query: &str) -> Option<&SnapshotRecord> {
        self.history
            .iter()
            .rev()
            .find(|r| r.tag.as_deref() == Some(query))
            .or_else(|| self.history.iter().rev().find(|r| r.hash.starts_with(query)))
    }

    /// Resolve a record for restore: named, or the current one.
    pub fn resolve(&self, query: Option<&str>) -> Result<&SnapshotRecord> {
        match query {
            Some(q) => self
                .find(q)
                .with_context(|| format!("no snapshot matches \"{q}\"")),
            None => self
                .current
                .as_ref()
                .context("no current snapshot; run `regresql snapshot capture` or `build`"),
        }
    }

    /// Append to history and make current.
    pub fn push(&mut self, record: SnapshotRecord) {
        self.current = Some(record.clone());
        self.history.push(record);
    }
}

/// Read server version and the fixed planner GUC list.
pub fn capture_server_context(session: &mut Session) -> Result<ServerContext> {
    let version = session
        .scalar("SHOW server_version")?
        .context("server did not report a version")?;
    let major = parse_major(&version);

    let mut planner = BTreeMap::new();
    let rows = session.simple_rows(
        "SELECT name, setting FROM pg_settings \
         WHERE name LIKE 'enable\\_%' \
            OR name IN ('random_page_cost', 'work_mem', 'effective_cache_size', \
                        'default_statistics_target', 'jit') \
         ORDER BY name",
    )?;
    for row in rows {
        if let (Some(Some(name)), Some(Some(setting))) = (row.first(), row.get(1)) {
            planner.insert(name.clone(), setting.clone());
        }
    }

    Ok(ServerContext {
        version,
        major,
        planner,
    })
}

fn parse_major(version: &str) -> u32 {
    version
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn dump_size(path: &Path) -> Result<u64> {
    if path.is_dir() {
        let mut total = 0;
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            if entry.path().is_dir() {
                total += dump_size(&entry.path())?;
            } else {
                total += entry.metadata()?.len();
            }
        }
        Ok(total)
    } else {
        Ok(std::fs::metadata(path)?.len())
    }
}

/// Resolve a possibly relative dump path against the project root.
pub fn resolve_dump_path(suite: &Suite, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        suite.project_root.join(path)
    }
}

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub format: Option<DumpFormat>,
    pub schema_only: bool,
    pub section: Option<String>,
    pub output: Option<PathBuf>,
    pub note: Option<String>,
    pub timeout: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            format: None,
            schema_only: false,
            section: None,
            output: None,
            note: None,
            timeout: Duration::from_secs(600),
        }
    }
}

/// Dump the live database and record the snapshot.
pub fn capture(
    suite: &Suite,
    config: &RegressConfig,
    session: &mut Session,
    options: &CaptureOptions,
) -> Result<SnapshotRecord> {
    let format = options.format.unwrap_or(config.snapshot.format);
    let rel_path = options
        .output
        .clone()
        .or_else(|| config.snapshot.path.clone())
        .unwrap_or_else(|| default_dump_path(format));
    let target = resolve_dump_path(suite, &rel_path);

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    run_pg_dump(config, format, &target, options)?;

    let server = capture_server_context(session)?;
    let record = SnapshotRecord {
        path: rel_path,
        format,
        size_bytes: dump_size(&target)?,
        hash: hash::hash_dump(&target)?,
        created: Utc::now(),
        tag: None,
        note: options.note.clone(),
        schema_path: None,
        schema_hash: None,
        migrations_dir: None,
        migrations_hash: None,
        migrations_applied: Vec::new(),
        migration_command: None,
        migration_command_hash: None,
        fixtures_used: Vec::new(),
        server,
    };

    let meta_path = metadata_path(suite);
    let mut metadata = SnapshotMetadata::load(&meta_path)?;
    metadata.push(record.clone());
    metadata.save(&meta_path)?;

    Ok(record)
}

fn default_dump_path(format: DumpFormat) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    PathBuf::from(crate::suite::REGRES_DIR)
        .join(crate::suite::SNAPSHOTS_DIR)
        .join(format!("snapshot-{}.{}", stamp, format.extension()))
}

fn run_pg_dump(
    config: &RegressConfig,
    format: DumpFormat,
    target: &Path,
    options: &CaptureOptions,
) -> Result<()> {
    let mut cmd = ToolCommand::new("pg_dump")
        .arg("--dbname")
        .arg(&config.pguri)
        .arg("--format")
        .arg(format.flag())
        .arg("--file")
        .arg(target.to_string_lossy().into_owned())
        .env("PGURI", &config.pguri)
        .timeout(options.timeout);
    if options.schema_only {
        cmd = cmd.arg("--schema-only");
    }
    if let Some(section) = &options.section {
        cmd = cmd.arg("--section").arg(section);
    }
    cmd.run().context("pg_dump failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Drop and recreate the public schema before restoring.
    pub clean: bool,
    pub format: Option<DumpFormat>,
    pub timeout: Duration,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            clean: false,
            format: None,
            timeout: Duration::from_secs(600),
        }
    }
}

/// Restore a dump into the configured database.
pub fn restore(
    config: &RegressConfig,
    session: &mut Session,
    dump: &Path,
    options: &RestoreOptions,
) -> Result<()> {
    if !dump.exists() {
        bail!(
            "dump {} does not exist; snapshot files are not committed, rebuild or recapture it",
            dump.display()
        );
    }
    let format = match options.format {
        Some(f) => f,
        None => detect_format(dump)?,
    };

    if public_schema_populated(session)? {
        if options.clean {
            clean_public_schema(session)?;
        } else {
            bail!("database public schema is not empty; pass --clean to drop and restore");
        }
    }

    let major = capture_server_context(session)?.major;

    match format {
        DumpFormat::Plain => {
            ToolCommand::new("psql")
                .arg("--dbname")
                .arg(&config.pguri)
                .arg("--quiet")
                .arg("-v")
                .arg("ON_ERROR_STOP=1")
                .arg("--file")
                .arg(dump.to_string_lossy().into_owned())
                .env("PGURI", &config.pguri)
                .timeout(options.timeout)
                .run()
                .context("psql restore failed")?;
        }
        DumpFormat::Custom | DumpFormat::Directory => {
            let mut cmd = ToolCommand::new("pg_restore")
                .arg("--dbname")
                .arg(&config.pguri)
                .arg("--no-owner")
                .env("PGURI", &config.pguri)
                .timeout(options.timeout);
            if major >= 18 {
                // Restoring planner statistics keeps EXPLAIN baselines
                // comparable without a fresh ANALYZE.
                cmd = cmd.arg("--with-statistics");
            }
            cmd = cmd.arg(dump.to_string_lossy().into_owned());
            cmd.run().context("pg_restore failed")?;
        }
    }

    Ok(())
}

/// Format auto-detection: directory, PGDMP magic, else plain.
fn detect_format(dump: &Path) -> Result<DumpFormat> {
    if dump.is_dir() {
        return Ok(DumpFormat::Directory);
    }
    let mut magic = [0u8; 5];
    let mut file = std::fs::File::open(dump)
        .with_context(|| format!("opening {}", dump.display()))?;
    let n = std::io::Read::read(&mut file, &mut magic)?;
    if n == 5 && &magic == b"PGDMP" {
        Ok(DumpFormat::Custom)
    } else {
        Ok(DumpFormat::Plain)
    }
}

pub fn public_schema_populated(session: &mut Session) -> Result<bool> {
    let count = session
        .scalar(
            "SELECT count(*) FROM pg_class c \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = 'public' AND c.relkind IN ('r', 'p', 'v', 'S')",
        )?
        .unwrap_or_default();
    Ok(count.parse::<i64>().unwrap_or(0) > 0)
}

pub fn clean_public_schema(session: &mut Session) -> Result<()> {
    session
        .batch_execute("DROP SCHEMA IF EXISTS public CASCADE; CREATE SCHEMA public")
        .context("cleaning public schema")
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub schema: Option<PathBuf>,
    pub migrations: Option<PathBuf>,
    pub migration_command: Option<String>,
    pub fixtures: Option<Vec<String>>,
    pub format: Option<DumpFormat>,
    pub output: Option<PathBuf>,
    pub note: Option<String>,
    pub timeout: Duration,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            schema: None,
            migrations: None,
            migration_command: None,
            fixtures: None,
            format: None,
            output: None,
            note: None,
            timeout: Duration::from_secs(600),
        }
    }
}

/// Compose a snapshot from scratch: clean schema, apply schema file and
/// migrations (or a migration command), apply fixtures, dump, and record
/// with a build hash composed from the inputs.
pub fn build(
    suite: &Suite,
    config: &RegressConfig,
    session: &mut Session,
    options: &BuildOptions,
) -> Result<SnapshotRecord> {
    let schema = options
        .schema
        .clone()
        .or_else(|| config.snapshot.schema.clone());
    let migrations_dir = options
        .migrations
        .clone()
        .or_else(|| config.snapshot.migrations.clone());
    let migration_command = options
        .migration_command
        .clone()
        .or_else(|| config.snapshot.migration_command.clone());

    if migrations_dir.is_some() && migration_command.is_some() {
        bail!("snapshot build takes either a migrations directory or a migration command, not both");
    }

    clean_public_schema(session)?;

    let mut schema_hash = None;
    if let Some(schema_rel) = &schema {
        let schema_path = resolve_dump_path(suite, schema_rel);
        apply_sql_file(config, &schema_path, options.timeout)
            .with_context(|| format!("applying schema {}", schema_path.display()))?;
        schema_hash = Some(hash::hash_file(&schema_path)?);
    }

    let mut migrations_applied = Vec::new();
    let mut migrations_hash = None;
    if let Some(dir_rel) = &migrations_dir {
        let dir = resolve_dump_path(suite, dir_rel);
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
            .with_context(|| format!("reading migrations directory {}", dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "sql").unwrap_or(false))
            .collect();
        files.sort();

        let mut hashes = Vec::new();
        for file in files {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            apply_sql_file(config, &file, options.timeout)
                .with_context(|| format!("applying migration {name}"))?;
            hashes.push((name.clone(), hash::hash_file(&file)?));
            migrations_applied.push(name);
        }
        migrations_hash = Some(hash::hash_migrations(&hashes));
    }

    let mut migration_command_hash = None;
    if let Some(command) = &migration_command {
        ToolCommand::shell(command)
            .env("PGURI", &config.pguri)
            .timeout(options.timeout)
            .run()
            .context("migration command failed")?;
        migration_command_hash = Some(hash::hash_str(command));
    }

    let mut fixtures_used = Vec::new();
    let mut fixture_hashes = Vec::new();
    let selected = options
        .fixtures
        .clone()
        .or_else(|| {
            if config.snapshot.fixtures.is_empty() {
                None
            } else {
                Some(config.snapshot.fixtures.clone())
            }
        });
    let apply_fixtures = selected.is_some() || config.fixtures_enabled;
    if apply_fixtures {
        let (set, issues) = FixtureSet::load_dir(&suite.fixtures_dir())?;
        if let Some(issue) = issues.first() {
            bail!("fixture load failed: {issue}");
        }
        if !set.fixtures.is_empty() {
            let schema_info = introspect::introspect(session)?;
            let report = fixtures::apply(
                session,
                &set,
                &schema_info,
                &fixtures::ApplyOptions {
                    truncate: false,
                    names: selected,
                },
            )?;
            for name in &report.applied {
                let fixture = set.get(name).expect("applied from the set");
                let canonical =
                    serde_yaml_ng::to_string(fixture).context("serialising fixture")?;
                fixture_hashes.push(hash::hash_str(&canonical));
            }
            fixtures_used = report.applied;
        }
    }

    let format = options.format.unwrap_or(config.snapshot.format);
    let rel_path = options
        .output
        .clone()
        .or_else(|| config.snapshot.path.clone())
        .unwrap_or_else(|| default_dump_path(format));
    let target = resolve_dump_path(suite, &rel_path);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let capture_options = CaptureOptions {
        format: Some(format),
        timeout: options.timeout,
        ..CaptureOptions::default()
    };
    run_pg_dump(config, format, &target, &capture_options)?;

    let server = capture_server_context(session)?;
    let build_hash = hash::compose_build_hash(
        schema_hash.as_deref(),
        migrations_hash.as_deref(),
        migration_command_hash.as_deref(),
        &fixture_hashes,
        server.major,
    );

    let record = SnapshotRecord {
        path: rel_path,
        format,
        size_bytes: dump_size(&target)?,
        hash: build_hash,
        created: Utc::now(),
        tag: None,
        note: options.note.clone(),
        schema_path: schema,
        schema_hash,
        migrations_dir,
        migrations_hash,
        migrations_applied,
        migration_command,
        migration_command_hash,
        fixtures_used,
        server,
    };

    let meta_path = metadata_path(suite);
    let mut metadata = SnapshotMetadata::load(&meta_path)?;
    metadata.push(record.clone());
    metadata.save(&meta_path)?;

    Ok(record)
}

/// Run a SQL file against the configured database through psql.
pub fn apply_sql_file(config: &RegressConfig, path: &Path, timeout: Duration) -> Result<()> {
    ToolCommand::new("psql")
        .arg("--dbname")
        .arg(&config.pguri)
        .arg("--quiet")
        .arg("-v")
        .arg("ON_ERROR_STOP=1")
        .arg("--file")
        .arg(path.to_string_lossy().into_owned())
        .env("PGURI", &config.pguri)
        .timeout(timeout)
        .run()?;
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct TagOptions {
    /// Hash prefix or existing tag.
    pub query: String,
    pub tag: Option<String>,
    pub note: Option<String>,
    /// Copy the dump file aside.
    pub archive: Option<PathBuf>,
}

/// Tag or annotate an existing snapshot record.
pub fn tag(suite: &Suite, options: &TagOptions) -> Result<SnapshotRecord> {
    let meta_path = metadata_path(suite);
    let mut metadata = SnapshotMetadata::load(&meta_path)?;

    let hash = metadata
        .find(&options.query)
        .with_context(|| format!("no snapshot matches \"{}\"", options.query))?
        .hash
        .clone();

    let mut updated = None;
    for record in metadata.history.iter_mut() {
        if record.hash == hash {
            if options.tag.is_some() {
                record.tag = options.tag.clone();
            }
            if options.note.is_some() {
                record.note = options.note.clone();
            }
            updated = Some(record.clone());
        }
    }
    if let Some(current) = metadata.current.as_mut() {
        if current.hash == hash {
            if options.tag.is_some() {
                current.tag = options.tag.clone();
            }
            if options.note.is_some() {
                current.note = options.note.clone();
            }
        }
    }

    let record = updated.context("snapshot record disappeared while tagging")?;

    if let Some(archive) = &options.archive {
        let source = resolve_dump_path(suite, &record.path);
        if source.is_dir() {
            bail!("archiving directory-format dumps is not supported; copy the directory manually");
        }
        if let Some(parent) = archive.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&source, archive).with_context(|| {
            format!(
                "archiving {} to {}",
                source.display(),
                archive.display()
            )
        })?;
    }

    metadata.save(&meta_path)?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(hash: &str, tag: Option<&str>) -> SnapshotRecord {
        SnapshotRecord {
            path: PathBuf::from("regresql/snapshots/s.dump"),
            format: DumpFormat::Custom,
            size_bytes: 1,
            hash: hash.to_string(),
            created: Utc::now(),
            tag: tag.map(|t| t.to_string()),
            note: None,
            schema_path: None,
            schema_hash: None,
            migrations_dir: None,
            migrations_hash: None,
            migrations_applied: Vec::new(),
            migration_command: None,
            migration_command_hash: None,
            fixtures_used: Vec::new(),
            server: ServerContext::default(),
        }
    }

    #[test]
    fn test_find_prefers_tag_over_prefix() {
        let mut metadata = SnapshotMetadata::default();
        metadata.push(record("abc123", None));
        metadata.push(record("abd456", Some("abc")));
        let found = metadata.find("abc").unwrap();
        assert_eq!(found.hash, "abd456");
    }

    #[test]
    fn test_find_by_hash_prefix() {
        let mut metadata = SnapshotMetadata::default();
        metadata.push(record("deadbeef", None));
        assert!(metadata.find("dead").is_some());
        assert!(metadata.find("beef").is_none());
    }

    #[test]
    fn test_metadata_round_trip_ignores_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        let mut metadata = SnapshotMetadata::default();
        metadata.push(record("cafe", Some("baseline")));
        metadata.save(&path).unwrap();

        // A future writer adds keys; this reader must keep working.
        let mut doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        doc["future_field"] = serde_json::json!({"x": 1});
        doc["current"]["another"] = serde_json::json!(true);
        std::fs::write(&path, serde_json::to_string(&doc).unwrap()).unwrap();

        let loaded = SnapshotMetadata::load(&path).unwrap();
        assert_eq!(loaded.current.unwrap().hash, "cafe");
        assert_eq!(loaded.history.len(), 1);
    }

    #[test]
    fn test_parse_major() {
        assert_eq!(parse_major("16.3"), 16);
        assert_eq!(parse_major("18beta1"), 18);
        assert_eq!(parse_major("garbage"), 0);
    }

    #[test]
    fn test_format_round_trip() {
        for fmt in [DumpFormat::Custom, DumpFormat::Plain, DumpFormat::Directory] {
            let parsed: DumpFormat = fmt.to_string().parse().unwrap();
            assert_eq!(parsed, fmt);
        }
        assert!("tar".parse::<DumpFormat>().is_err());
    }
}
