//! Row generators for fixture `generate` specs.
//!
//! A generator is written as a short spec string: `sequence`,
//! `sequence(100)`, `choice(red, green, blue)`, `lorem`, `lorem(5)`,
//! `uuid`, `now`, `now(-2h)`. Expansion is deterministic for a given
//! per-fixture seed; only `now` reads the clock.

use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use fake::faker::lorem::en::Words;
use fake::Fake;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::GenerateSpec;
use crate::plan::PlanValue;

#[derive(Debug, Clone, PartialEq)]
pub enum Generator {
    /// Monotonic integers starting at `start`.
    Sequence { start: i64 },
    /// Uniform pick from the listed options.
    Choice { options: Vec<String> },
    /// `words` lorem words joined by spaces.
    Lorem { words: Option<usize> },
    /// Random (seed-derived) UUID.
    Uuid,
    /// Current time shifted by `offset_secs`.
    Now { offset_secs: i64 },
}

/// Parse a generator spec string.
pub fn parse(spec: &str) -> Result<Generator> {
    let spec = spec.trim();
    let (head, arg) = match spec.find('(') {
        Some(open) => {
            let Some(stripped) = spec[open..].strip_suffix(')') else {
                bail!("malformed generator \"{spec}\": missing closing parenthesis");
            };
            (&spec[..open], Some(stripped[1..].trim()))
        }
        None => (spec, None),
    };

    match head {
        "sequence" => {
            let start = match arg {
                Some(a) if !a.is_empty() => a
                    .parse()
                    .map_err(|_| anyhow::anyhow!("sequence start must be an integer: \"{a}\""))?,
                _ => 1,
            };
            Ok(Generator::Sequence { start })
        }
        "choice" => {
            let options: Vec<String> = arg
                .unwrap_or("")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if options.is_empty() {
                bail!("choice generator needs at least one option");
            }
            Ok(Generator::Choice { options })
        }
        "lorem" => {
            let words = match arg {
                Some(a) if !a.is_empty() => Some(
                    a.parse()
                        .map_err(|_| anyhow::anyhow!("lorem word count must be an integer: \"{a}\""))?,
                ),
                _ => None,
            };
            Ok(Generator::Lorem { words })
        }
        "uuid" => Ok(Generator::Uuid),
        "now" => {
            let offset_secs = match arg {
                Some(a) if !a.is_empty() => parse_offset(a)?,
                _ => 0,
            };
            Ok(Generator::Now { offset_secs })
        }
        other => bail!(
            "unknown generator \"{other}\"; expected sequence, choice, lorem, uuid, or now"
        ),
    }
}

/// Parse `now` offsets: `-30s`, `+5m`, `-2h`, `+1d` (bare numbers are seconds).
fn parse_offset(arg: &str) -> Result<i64> {
    let (number, unit) = match arg.chars().last() {
        Some(u) if u.is_ascii_alphabetic() => (&arg[..arg.len() - 1], u),
        _ => (arg, 's'),
    };
    let value: i64 = number
        .parse()
        .map_err(|_| anyhow::anyhow!("malformed time offset \"{arg}\""))?;
    let scale = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86_400,
        other => bail!("unknown offset unit '{other}' in \"{arg}\" (use s, m, h, or d)"),
    };
    Ok(value * scale)
}

/// Per-fixture seed derived from the fixture name.
pub fn fixture_seed(name: &str) -> u64 {
    let digest = Sha256::digest(name.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("sha256 is 32 bytes"))
}

/// Expand one generate spec into concrete rows.
///
/// Each column gets its own rng stream derived from the fixture seed and
/// the column name, so adding a column never reshuffles its neighbours.
pub fn expand(spec: &GenerateSpec, seed: u64) -> Result<Vec<BTreeMap<String, PlanValue>>> {
    let mut columns = Vec::with_capacity(spec.columns.len());
    for (name, generator_spec) in &spec.columns {
        let generator = parse(generator_spec)?;
        let rng = StdRng::seed_from_u64(seed ^ fixture_seed(name));
        columns.push((name.clone(), generator, rng));
    }

    let mut rows = Vec::with_capacity(spec.count);
    for i in 0..spec.count {
        let mut row = BTreeMap::new();
        for (name, generator, rng) in columns.iter_mut() {
            row.insert(name.clone(), next_value(generator, rng, i));
        }
        rows.push(row);
    }
    Ok(rows)
}

fn next_value(generator: &Generator, rng: &mut StdRng, index: usize) -> PlanValue {
    match generator {
        Generator::Sequence { start } => PlanValue::Int(start + index as i64),
        Generator::Choice { options } => {
            let pick = rng.random_range(0..options.len());
            PlanValue::Text(options[pick].clone())
        }
        Generator::Lorem { words } => {
            let count = words.unwrap_or_else(|| rng.random_range(3..8));
            let words: Vec<String> = Words(count..count + 1).fake_with_rng(rng);
            PlanValue::Text(words.join(" "))
        }
        Generator::Uuid => {
            let bytes: [u8; 16] = rng.random();
            PlanValue::Text(uuid::Builder::from_random_bytes(bytes).into_uuid().to_string())
        }
        Generator::Now { offset_secs } => {
            PlanValue::Timestamp(Utc::now() + Duration::seconds(*offset_secs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(count: usize, columns: &[(&str, &str)]) -> GenerateSpec {
        GenerateSpec {
            table: "t".to_string(),
            count,
            columns: columns
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_parse_forms() {
        assert_eq!(parse("sequence").unwrap(), Generator::Sequence { start: 1 });
        assert_eq!(
            parse("sequence(100)").unwrap(),
            Generator::Sequence { start: 100 }
        );
        assert_eq!(
            parse("choice(a, b)").unwrap(),
            Generator::Choice {
                options: vec!["a".to_string(), "b".to_string()]
            }
        );
        assert_eq!(parse("lorem").unwrap(), Generator::Lorem { words: None });
        assert_eq!(parse("uuid").unwrap(), Generator::Uuid);
        assert_eq!(parse("now(-2h)").unwrap(), Generator::Now { offset_secs: -7200 });
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!(parse("bogus").is_err());
        assert!(parse("choice()").is_err());
        assert!(parse("now(-2y)").is_err());
        assert!(parse("sequence(ten)").is_err());
    }

    #[test]
    fn test_sequence_values() {
        let rows = expand(&spec(3, &[("id", "sequence(10)")]), 42).unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(
            ids,
            vec![PlanValue::Int(10), PlanValue::Int(11), PlanValue::Int(12)]
        );
    }

    #[test]
    fn test_expansion_deterministic_for_seed() {
        let s = spec(5, &[("name", "lorem"), ("color", "choice(red,green,blue)")]);
        let a = expand(&s, 7).unwrap();
        let b = expand(&s, 7).unwrap();
        assert_eq!(a, b);
        let c = expand(&s, 8).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_column_streams_independent() {
        let wide = expand(&spec(4, &[("a", "uuid"), ("b", "uuid")]), 3).unwrap();
        let narrow = expand(&spec(4, &[("a", "uuid")]), 3).unwrap();
        for i in 0..4 {
            assert_eq!(wide[i]["a"], narrow[i]["a"]);
        }
        assert_ne!(wide[0]["a"], wide[0]["b"]);
    }

    #[test]
    fn test_uuid_shape() {
        let rows = expand(&spec(1, &[("u", "uuid")]), 1).unwrap();
        if let PlanValue::Text(u) = &rows[0]["u"] {
            assert_eq!(u.len(), 36);
        } else {
            panic!("expected text uuid");
        }
    }
}
