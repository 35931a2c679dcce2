//! Content addressing for snapshots and their inputs.
//!
//! Everything is SHA-256 rendered as lowercase hex. The build hash
//! composes input hashes so two builds from identical inputs agree even
//! when the dump files differ byte-wise (dumps embed timestamps).

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn hash_str(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// Streamed hash of a single file.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("opening {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("reading {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash of a directory-format dump: member paths and content digests in
/// sorted order, so the result is independent of directory iteration.
pub fn hash_dir(path: &Path) -> Result<String> {
    let mut members = Vec::new();
    collect_files(path, path, &mut members)?;
    members.sort();

    let mut hasher = Sha256::new();
    for rel in members {
        hasher.update(rel.as_bytes());
        hasher.update([0]);
        hasher.update(hash_file(&path.join(&rel))?.as_bytes());
        hasher.update([0]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("reading directory {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .expect("member is under the root")
                .to_string_lossy()
                .replace('\\', "/");
            out.push(rel);
        }
    }
    Ok(())
}

/// Hash of a dump target, file or directory format.
pub fn hash_dump(path: &Path) -> Result<String> {
    if path.is_dir() {
        hash_dir(path)
    } else {
        hash_file(path)
    }
}

/// Migrations hash: ordered filenames with their content hashes.
pub fn hash_migrations(applied: &[(String, String)]) -> String {
    let mut hasher = Sha256::new();
    for (name, content_hash) in applied {
        hasher.update(name.as_bytes());
        hasher.update([0]);
        hasher.update(content_hash.as_bytes());
        hasher.update([0]);
    }
    hex::encode(hasher.finalize())
}

/// The build hash: schema ‖ migrations ‖ migration command ‖ fixtures ‖
/// server major. Absent inputs contribute a fixed empty marker so adding
/// one later changes the hash.
pub fn compose_build_hash(
    schema_hash: Option<&str>,
    migrations_hash: Option<&str>,
    migration_command_hash: Option<&str>,
    fixture_hashes: &[String],
    server_major: u32,
) -> String {
    let mut hasher = Sha256::new();
    for part in [schema_hash, migrations_hash, migration_command_hash] {
        hasher.update(part.unwrap_or("-").as_bytes());
        hasher.update([0]);
    }
    for fixture in fixture_hashes {
        hasher.update(fixture.as_bytes());
        hasher.update([0]);
    }
    hasher.update(server_major.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
