//! Integration tests for snapshot metadata, tagging, and content hashing.

use chrono::Utc;
use regresql::snapshot::{
    self, hash, metadata_path, DumpFormat, ServerContext, SnapshotMetadata, SnapshotRecord,
    TagOptions,
};
use regresql::suite::Suite;
use std::path::PathBuf;
use tempfile::TempDir;

fn record(hash: &str) -> SnapshotRecord {
    SnapshotRecord {
        path: PathBuf::from("regresql/snapshots/test.dump"),
        format: DumpFormat::Custom,
        size_bytes: 128,
        hash: hash.to_string(),
        created: Utc::now(),
        tag: None,
        note: None,
        schema_path: None,
        schema_hash: None,
        migrations_dir: None,
        migrations_hash: None,
        migrations_applied: Vec::new(),
        migration_command: None,
        migration_command_hash: None,
        fixtures_used: Vec::new(),
        server: ServerContext {
            version: "16.3".to_string(),
            major: 16,
            planner: [("jit".to_string(), "off".to_string())].into_iter().collect(),
        },
    }
}

#[test]
fn test_metadata_save_load_round_trip() {
    let dir = TempDir::new().unwrap();
    let suite = Suite::new(dir.path(), None);
    let path = metadata_path(&suite);

    let mut metadata = SnapshotMetadata::default();
    metadata.push(record("aaa111"));
    metadata.push(record("bbb222"));
    metadata.save(&path).unwrap();

    let loaded = SnapshotMetadata::load(&path).unwrap();
    assert_eq!(loaded.history.len(), 2);
    assert_eq!(loaded.current.unwrap().hash, "bbb222");
    assert_eq!(loaded.history[0].server.planner["jit"], "off");
}

#[test]
fn test_load_missing_metadata_is_default() {
    let dir = TempDir::new().unwrap();
    let suite = Suite::new(dir.path(), None);
    let metadata = SnapshotMetadata::load(&metadata_path(&suite)).unwrap();
    assert!(metadata.current.is_none());
    assert!(metadata.history.is_empty());
}

#[test]
fn test_resolve_named_and_current() {
    let mut metadata = SnapshotMetadata::default();
    metadata.push(record("abc123"));

    assert_eq!(metadata.resolve(None).unwrap().hash, "abc123");
    assert_eq!(metadata.resolve(Some("abc")).unwrap().hash, "abc123");
    assert!(metadata.resolve(Some("zzz")).is_err());

    let empty = SnapshotMetadata::default();
    assert!(empty.resolve(None).is_err());
}

#[test]
fn test_tag_mutates_only_tag_and_note() {
    let dir = TempDir::new().unwrap();
    let suite = Suite::new(dir.path(), None);
    let path = metadata_path(&suite);

    let mut metadata = SnapshotMetadata::default();
    metadata.push(record("cafe01"));
    metadata.save(&path).unwrap();

    let tagged = snapshot::tag(
        &suite,
        &TagOptions {
            query: "cafe".to_string(),
            tag: Some("baseline".to_string()),
            note: Some("before refactor".to_string()),
            archive: None,
        },
    )
    .unwrap();
    assert_eq!(tagged.tag.as_deref(), Some("baseline"));

    let loaded = SnapshotMetadata::load(&path).unwrap();
    let entry = &loaded.history[0];
    assert_eq!(entry.tag.as_deref(), Some("baseline"));
    assert_eq!(entry.note.as_deref(), Some("before refactor"));
    assert_eq!(entry.hash, "cafe01");
    assert_eq!(loaded.current.unwrap().tag.as_deref(), Some("baseline"));

    // Re-tagging by the tag name finds the same record.
    let retagged = snapshot::tag(
        &suite,
        &TagOptions {
            query: "baseline".to_string(),
            tag: Some("v2".to_string()),
            note: None,
            archive: None,
        },
    )
    .unwrap();
    assert_eq!(retagged.hash, "cafe01");
    assert_eq!(retagged.note.as_deref(), Some("before refactor"));
}

#[test]
fn test_tag_archives_dump_file() {
    let dir = TempDir::new().unwrap();
    let suite = Suite::new(dir.path(), None);
    let dump_rel = PathBuf::from("regresql/snapshots/test.dump");
    std::fs::create_dir_all(suite.snapshots_dir()).unwrap();
    std::fs::write(dir.path().join(&dump_rel), b"PGDMP...").unwrap();

    let mut metadata = SnapshotMetadata::default();
    metadata.push(record("feed42"));
    metadata.save(&metadata_path(&suite)).unwrap();

    let archive = dir.path().join("archive/kept.dump");
    snapshot::tag(
        &suite,
        &TagOptions {
            query: "feed".to_string(),
            tag: None,
            note: None,
            archive: Some(archive.clone()),
        },
    )
    .unwrap();
    assert_eq!(std::fs::read(&archive).unwrap(), b"PGDMP...");
}

#[test]
fn test_unknown_tag_query_fails() {
    let dir = TempDir::new().unwrap();
    let suite = Suite::new(dir.path(), None);
    let mut metadata = SnapshotMetadata::default();
    metadata.push(record("aaa"));
    metadata.save(&metadata_path(&suite)).unwrap();

    let err = snapshot::tag(
        &suite,
        &TagOptions {
            query: "zzz".to_string(),
            tag: Some("t".to_string()),
            note: None,
            archive: None,
        },
    )
    .unwrap_err()
    .to_string();
    assert!(err.contains("no snapshot matches"), "got: {err}");
}

#[test]
fn test_build_hash_composition() {
    let fixtures = vec![hash::hash_str("fixture-a"), hash::hash_str("fixture-b")];
    let base = hash::compose_build_hash(Some("s"), Some("m"), None, &fixtures, 16);

    // Identical inputs agree.
    assert_eq!(
        base,
        hash::compose_build_hash(Some("s"), Some("m"), None, &fixtures, 16)
    );
    // Every input participates.
    assert_ne!(
        base,
        hash::compose_build_hash(Some("S"), Some("m"), None, &fixtures, 16)
    );
    assert_ne!(
        base,
        hash::compose_build_hash(Some("s"), Some("m"), None, &fixtures[..1].to_vec(), 16)
    );
    assert_ne!(
        base,
        hash::compose_build_hash(Some("s"), Some("m"), None, &fixtures, 17)
    );
}

#[test]
fn test_migrations_hash_is_order_sensitive() {
    let a = ("001_init.sql".to_string(), hash::hash_str("create"));
    let b = ("002_data.sql".to_string(), hash::hash_str("insert"));
    assert_ne!(
        hash::hash_migrations(&[a.clone(), b.clone()]),
        hash::hash_migrations(&[b, a])
    );
}

#[test]
fn test_dump_format_parsing() {
    assert_eq!("custom".parse::<DumpFormat>().unwrap(), DumpFormat::Custom);
    assert_eq!("p".parse::<DumpFormat>().unwrap(), DumpFormat::Plain);
    assert_eq!(
        "DIRECTORY".parse::<DumpFormat>().unwrap(),
        DumpFormat::Directory
    );
    assert!("tar".parse::<DumpFormat>().is_err());

    // Metadata serialises formats in lowercase.
    let json = serde_json::to_string(&DumpFormat::Directory).unwrap();
    assert_eq!(json, "\"directory\"");
}
