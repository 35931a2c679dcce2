//! Plan files: YAML documents binding named parameters to concrete values.
//!
//! A plan maps statement names to a list of bindings; executing a statement
//! once per binding is what turns one SQL file into a set of regression
//! cases. Binding values are scalars of unknown SQL type, modelled as a
//! tagged variant and converted at the driver boundary.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::query::Statement;

/// A scalar value supplied by a plan or fixture document.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl PlanValue {
    /// Render as a SQL literal, for display in error messages and for
    /// EXPLAIN capture. Never used for regular execution, which binds
    /// values through the driver.
    pub fn to_sql_literal(&self) -> String {
        match self {
            PlanValue::Null => "NULL".to_string(),
            PlanValue::Bool(true) => "TRUE".to_string(),
            PlanValue::Bool(false) => "FALSE".to_string(),
            PlanValue::Int(i) => i.to_string(),
            PlanValue::Float(f) => f.to_string(),
            PlanValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
            PlanValue::Timestamp(ts) => {
                format!("'{}'", ts.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
        }
    }

    /// Plain text rendering, used when the driver infers TEXT.
    pub fn as_text(&self) -> String {
        match self {
            PlanValue::Null => String::new(),
            PlanValue::Bool(b) => b.to_string(),
            PlanValue::Int(i) => i.to_string(),
            PlanValue::Float(f) => f.to_string(),
            PlanValue::Text(s) => s.clone(),
            PlanValue::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::Micros, true),
        }
    }
}

impl fmt::Display for PlanValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql_literal())
    }
}

impl<'de> Deserialize<'de> for PlanValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = PlanValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a scalar (null, bool, number, or string)")
            }

            fn visit_unit<E>(self) -> Result<PlanValue, E> {
                Ok(PlanValue::Null)
            }

            fn visit_none<E>(self) -> Result<PlanValue, E> {
                Ok(PlanValue::Null)
            }

            fn visit_bool<E>(self, v: bool) -> Result<PlanValue, E> {
                Ok(PlanValue::Bool(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<PlanValue, E> {
                Ok(PlanValue::Int(v))
            }

            fn visit_u64<E>(self, v: u64) -> Result<PlanValue, E>
            where
                E: de::Error,
            {
                i64::try_from(v)
                    .map(PlanValue::Int)
                    .map_err(|_| E::custom(format!("integer out of range: {v}")))
            }

            fn visit_f64<E>(self, v: f64) -> Result<PlanValue, E> {
                Ok(PlanValue::Float(v))
            }

            fn visit_str<E>(self, v: &str) -> Result<PlanValue, E> {
                // RFC 3339 strings classify as timestamps so they can bind
                // to timestamp columns without a cast in the statement.
                match DateTime::parse_from_rfc3339(v) {
                    Ok(ts) => Ok(PlanValue::Timestamp(ts.with_timezone(&Utc))),
                    Err(_) => Ok(PlanValue::Text(v.to_string())),
                }
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

impl Serialize for PlanValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            PlanValue::Null => serializer.serialize_unit(),
            PlanValue::Bool(b) => serializer.serialize_bool(*b),
            PlanValue::Int(i) => serializer.serialize_i64(*i),
            PlanValue::Float(f) => serializer.serialize_f64(*f),
            PlanValue::Text(s) => serializer.serialize_str(s),
            PlanValue::Timestamp(ts) => {
                serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
        }
    }
}

impl schemars::JsonSchema for PlanValue {
    fn schema_name() -> String {
        "Scalar".to_string()
    }

    fn json_schema(_gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        // Any YAML scalar: null, bool, number, or string.
        schemars::schema::Schema::Bool(true)
    }
}

/// One concrete assignment of values to a statement's parameters.
pub type Binding = BTreeMap<String, PlanValue>;

/// A parsed plan file: statement name to list of bindings.
#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(transparent)]
pub struct Plan {
    pub statements: BTreeMap<String, Vec<Binding>>,
}

impl Plan {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading plan file {}", path.display()))?;
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml_ng::from_str(&text)
            .with_context(|| format!("parsing plan file {}", path.display()))
    }

    /// Statement names present in the plan but absent from the file.
    /// Surfaced as warnings, never fatal.
    pub fn unknown_names<'a>(&'a self, known: &[&str]) -> Vec<&'a str> {
        self.statements
            .keys()
            .filter(|name| !known.contains(&name.as_str()))
            .map(|s| s.as_str())
            .collect()
    }
}

/// Plan file path for a SQL file, relative to the plans directory.
pub fn plan_rel_path(sql_rel: &Path) -> PathBuf {
    sql_rel.with_extension("yaml")
}

/// One validated, executable binding of a statement.
#[derive(Debug, Clone)]
pub struct ResolvedBinding {
    /// Position within the statement's binding list.
    pub index: usize,
    /// True when the statement has exactly one binding (index omitted from paths).
    pub single: bool,
    pub values: Binding,
}

/// A binding rejected during plan validation. Other bindings proceed.
#[derive(Debug, Clone)]
pub struct BindingIssue {
    pub stmt: String,
    pub index: usize,
    pub message: String,
}

/// Outcome of crossing one statement with its plan entry.
#[derive(Debug, Clone, Default)]
pub struct StatementBindings {
    pub bindings: Vec<ResolvedBinding>,
    pub issues: Vec<BindingIssue>,
    /// Set when the whole statement is skipped (parameterised, no plan).
    pub skipped: Option<String>,
}

/// Cross a statement's discovered parameters with its plan bindings.
///
/// A statement with zero parameters gets an implicit single empty binding.
/// A parameterised statement without a plan entry is skipped with a reason.
/// Bindings missing a required parameter, or carrying an unknown one, are
/// rejected individually.
pub fn resolve_bindings(stmt: &Statement, plan: Option<&Plan>) -> StatementBindings {
    let entry = plan.and_then(|p| p.statements.get(&stmt.name));

    let raw: Vec<Binding> = match entry {
        Some(bindings) if !bindings.is_empty() => bindings.clone(),
        _ => {
            if stmt.params.is_empty() {
                vec![Binding::new()]
            } else {
                return StatementBindings {
                    skipped: Some(format!(
                        "statement references {} but has no plan bindings",
                        describe_params(&stmt.params)
                    )),
                    ..Default::default()
                };
            }
        }
    };

    let single = raw.len() == 1;
    let mut out = StatementBindings::default();

    for (index, values) in raw.into_iter().enumerate() {
        let missing: Vec<&String> = stmt
            .params
            .iter()
            .filter(|p| !values.contains_key(*p))
            .collect();
        let extra: Vec<&String> = values
            .keys()
            .filter(|k| !stmt.params.contains(*k))
            .collect();

        if !missing.is_empty() {
            out.issues.push(BindingIssue {
                stmt: stmt.name.clone(),
                index,
                message: format!(
                    "binding {} is missing parameter(s): {}",
                    index,
                    join_names(&missing)
                ),
            });
        } else if !extra.is_empty() {
            out.issues.push(BindingIssue {
                stmt: stmt.name.clone(),
                index,
                message: format!(
                    "binding {} has unknown parameter(s): {}",
                    index,
                    join_names(&extra)
                ),
            });
        } else {
            out.bindings.push(ResolvedBinding {
                index,
                single,
                values,
            });
        }
    }

    out
}

fn describe_params(params: &[String]) -> String {
    if params.len() == 1 {
        format!("parameter :{}", params[0])
    } else {
        format!(
            "parameters {}",
            params
                .iter()
                .map(|p| format!(":{p}"))
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

fn join_names(names: &[&String]) -> String {
    names
        .iter()
        .map(|n| n.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Substitute binding values into a statement body as SQL literals.
/// Display and EXPLAIN only; regular execution binds through the driver.
pub fn substitute_literals(body: &str, binding: &Binding) -> String {
    crate::query::replace_params(body, |name| {
        binding.get(name).map(|v| v.to_sql_literal())
    })
}
