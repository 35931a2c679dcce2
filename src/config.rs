//! Project configuration: `regresql/regress.yaml`.
//!
//! Loaded once per command and passed down explicitly. The environment
//! overrides the file: `PGURI` replaces the connection string wholesale,
//! `PG_USER`/`PG_PASSWORD` splice credentials into it.

use anyhow::{bail, Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::snapshot::DumpFormat;
use crate::suite::Suite;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RegressConfig {
    /// Connection string for the test database.
    pub pguri: String,
    /// SQL discovery root, relative to the project root. Defaults to it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub fixtures_enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SnapshotConfig {
    /// Dump target; defaults to a timestamped file under `snapshots/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub format: DumpFormat,
    /// Schema file applied first by `snapshot build`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<PathBuf>,
    /// Directory of migration files applied in lexicographic order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrations: Option<PathBuf>,
    /// External migration command; mutually exclusive with `migrations`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_command: Option<String>,
    /// Fixtures applied by `snapshot build`, in dependency order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fixtures: Vec<String>,
}

impl Default for RegressConfig {
    fn default() -> Self {
        Self {
            pguri: String::new(),
            root: None,
            snapshot: SnapshotConfig::default(),
            fixtures_enabled: false,
        }
    }
}

impl RegressConfig {
    /// Load the suite's config and apply environment overrides.
    /// Missing or unparsable config is fatal at command start.
    pub fn load(suite: &Suite) -> Result<Self> {
        let path = suite.config_path();
        let mut config = Self::load_file(&path)?;
        if config.pguri.trim().is_empty() && std::env::var("PGURI").is_err() {
            bail!("{}: `pguri` is empty and PGURI is not set", path.display());
        }
        config.apply_env();
        Ok(config)
    }

    /// Parse a config file without consulting the environment.
    pub fn load_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| {
            format!(
                "reading {}; run `regresql init` to create a project",
                path.display()
            )
        })?;
        serde_yaml_ng::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Environment overrides, applied after file load.
    pub fn apply_env(&mut self) {
        if let Ok(uri) = std::env::var("PGURI") {
            if !uri.trim().is_empty() {
                self.pguri = uri;
            }
        }
        let user = std::env::var("PG_USER").ok().filter(|s| !s.is_empty());
        let password = std::env::var("PG_PASSWORD").ok().filter(|s| !s.is_empty());
        if user.is_some() || password.is_some() {
            self.pguri = splice_credentials(&self.pguri, user.as_deref(), password.as_deref());
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_yaml_ng::to_string(self).context("serialising config")?;
        crate::driver::write_atomic(path, text.as_bytes())
            .with_context(|| format!("writing {}", path.display()))
    }

    /// Dotted-key read for `config get`.
    pub fn get_key(&self, key: &str) -> Result<String> {
        let value = match key {
            "pguri" => self.pguri.clone(),
            "root" => self
                .root
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            "fixtures_enabled" => self.fixtures_enabled.to_string(),
            "snapshot.path" => self
                .snapshot
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            "snapshot.format" => self.snapshot.format.to_string(),
            "snapshot.schema" => self
                .snapshot
                .schema
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            "snapshot.migrations" => self
                .snapshot
                .migrations
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            "snapshot.migration_command" => {
                self.snapshot.migration_command.clone().unwrap_or_default()
            }
            "snapshot.fixtures" => self.snapshot.fixtures.join(","),
            _ => bail!("unknown config key \"{key}\""),
        };
        Ok(value)
    }

    /// Dotted-key write for `config set`.
    pub fn set_key(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "pguri" => self.pguri = value.to_string(),
            "root" => {
                self.root = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "fixtures_enabled" => {
                self.fixtures_enabled = value
                    .parse()
                    .map_err(|_| anyhow::anyhow!("fixtures_enabled must be true or false"))?
            }
            "snapshot.path" => {
                self.snapshot.path = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "snapshot.format" => self.snapshot.format = value.parse().map_err(anyhow::Error::msg)?,
            "snapshot.schema" => {
                self.snapshot.schema = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "snapshot.migrations" => {
                self.snapshot.migrations = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "snapshot.migration_command" => {
                self.snapshot.migration_command = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "snapshot.fixtures" => {
                self.snapshot.fixtures = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            }
            _ => bail!("unknown config key \"{key}\""),
        }
        Ok(())
    }
}

/// Replace the userinfo section of a connection URI.
fn splice_credentials(uri: &str, user: Option<&str>, password: Option<&str>) -> String {
    let Some(proto_end) = uri.find("://") else {
        return uri.to_string();
    };
    let rest = &uri[proto_end + 3..];
    let (old_creds, host) = match rest.rfind('@') {
        Some(at) => (Some(&rest[..at]), &rest[at + 1..]),
        None => (None, rest),
    };
    let (old_user, old_password) = match old_creds {
        Some(creds) => match creds.split_once(':') {
            Some((u, p)) => (Some(u), Some(p)),
            None => (Some(creds), None),
        },
        None => (None, None),
    };

    let user = user.or(old_user).unwrap_or_default();
    let password = password.or(old_password);

    let mut out = String::new();
    out.push_str(&uri[..proto_end + 3]);
    if !user.is_empty() || password.is_some() {
        out.push_str(user);
        if let Some(p) = password {
            out.push(':');
            out.push_str(p);
        }
        out.push('@');
    }
    out.push_str(host);
    out
}
