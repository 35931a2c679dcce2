//! SQL file model: statement splitting and named-parameter discovery.
//!
//! A SQL file is an ordered sequence of named statements. A statement opens
//! at a `-- name: <ident>` marker line; text before the first marker belongs
//! to an implicit statement named after the file. Parameters are `:ident`
//! tokens found outside string literals, quoted identifiers, and comments.

use once_cell::sync::Lazy;
use regex::Regex;

static NAME_MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*--\s*name:\s*([A-Za-z_][A-Za-z0-9_]*)\s*$").unwrap());

/// A single named statement inside a SQL file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// Statement name (marker identifier, or the file stem for the implicit one).
    pub name: String,
    /// Statement body with surrounding whitespace and trailing semicolons stripped.
    pub body: String,
    /// Named parameters in first-occurrence order, deduplicated.
    pub params: Vec<String>,
}

impl Statement {
    fn from_body(name: &str, raw: &str) -> Option<Self> {
        let body = trim_body(raw);
        if body.is_empty() {
            return None;
        }
        let params = scan_params(&body);
        Some(Self {
            name: name.to_string(),
            body,
            params,
        })
    }
}

/// Split a SQL file into its named statements.
///
/// `file_stem` names the implicit statement formed by any text before the
/// first `-- name:` marker. Statements with empty bodies are dropped.
pub fn split_file(file_stem: &str, text: &str) -> Vec<Statement> {
    let mut statements = Vec::new();
    let mut current_name = file_stem.to_string();
    let mut current_body = String::new();

    for line in text.lines() {
        if let Some(caps) = NAME_MARKER_RE.captures(line) {
            if let Some(stmt) = Statement::from_body(&current_name, &current_body) {
                statements.push(stmt);
            }
            current_name = caps[1].to_string();
            current_body.clear();
        } else {
            current_body.push_str(line);
            current_body.push('\n');
        }
    }

    if let Some(stmt) = Statement::from_body(&current_name, &current_body) {
        statements.push(stmt);
    }

    statements
}

/// Strip surrounding whitespace and trailing semicolons from a statement body.
fn trim_body(raw: &str) -> String {
    let mut body = raw.trim();
    while let Some(stripped) = body.strip_suffix(';') {
        body = stripped.trim_end();
    }
    body.to_string()
}

/// Discover named parameters in a statement body, preserving the order of
/// first occurrence. `::type` casts and `:ident` sequences inside strings,
/// quoted identifiers, or comments are never parameters.
pub fn scan_params(body: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for (_, _, name) in param_spans(body) {
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}

/// Rewrite `:name` parameter references to the driver's positional `$n`
/// placeholders, numbering by position in `params`.
pub fn rewrite_placeholders(body: &str, params: &[String]) -> String {
    replace_params(body, |name| {
        params
            .iter()
            .position(|p| p == name)
            .map(|i| format!("${}", i + 1))
    })
}

/// Replace every parameter reference using `f`. References for which `f`
/// returns `None` are left untouched.
pub fn replace_params<F>(body: &str, f: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let spans = param_spans(body);
    if spans.is_empty() {
        return body.to_string();
    }

    let mut out = String::with_capacity(body.len());
    let mut last = 0;
    for (start, end, name) in spans {
        out.push_str(&body[last..start]);
        match f(&name) {
            Some(replacement) => out.push_str(&replacement),
            None => out.push_str(&body[start..end]),
        }
        last = end;
    }
    out.push_str(&body[last..]);
    out
}

/// Scan a statement body for `:ident` parameter tokens, honouring SQL
/// lexical contexts. Returns byte ranges (start of `:`, end past the
/// identifier) and the identifier itself.
fn param_spans(body: &str) -> Vec<(usize, usize, String)> {
    let bytes = body.as_bytes();
    let len = bytes.len();
    let mut spans = Vec::new();

    let mut i = 0;
    let mut in_single = false;
    let mut in_double = false;
    let mut in_line_comment = false;
    let mut block_depth = 0usize;
    let mut dollar_tag: Option<String> = None;

    while i < len {
        let b = bytes[i];

        if in_line_comment {
            if b == b'\n' {
                in_line_comment = false;
            }
            i += 1;
            continue;
        }

        if block_depth > 0 {
            if b == b'/' && i + 1 < len && bytes[i + 1] == b'*' {
                block_depth += 1;
                i += 2;
            } else if b == b'*' && i + 1 < len && bytes[i + 1] == b'/' {
                block_depth -= 1;
                i += 2;
            } else {
                i += 1;
            }
            continue;
        }

        if let Some(ref tag) = dollar_tag {
            // Inside $tag$ ... $tag$; look for the closer.
            if b == b'$' {
                let closer_len = tag.len() + 2;
                if i + closer_len <= len {
                    let candidate = &body[i..i + closer_len];
                    if candidate.starts_with('$')
                        && candidate.ends_with('$')
                        && &candidate[1..closer_len - 1] == tag.as_str()
                    {
                        dollar_tag = None;
                        i += closer_len;
                        continue;
                    }
                }
            }
            i += 1;
            continue;
        }

        if in_single {
            if b == b'\'' {
                // A doubled quote reads as leave-then-reenter, which is
                // equivalent to the '' escape.
                in_single = false;
            }
            i += 1;
            continue;
        }

        if in_double {
            if b == b'"' {
                in_double = false;
            }
            i += 1;
            continue;
        }

        match b {
            b'\'' => {
                in_single = true;
                i += 1;
            }
            b'"' => {
                in_double = true;
                i += 1;
            }
            b'-' if i + 1 < len && bytes[i + 1] == b'-' => {
                in_line_comment = true;
                i += 2;
            }
            b'/' if i + 1 < len && bytes[i + 1] == b'*' => {
                block_depth = 1;
                i += 2;
            }
            b'$' => {
                if let Some(tag_end) = dollar_quote_opener(bytes, i) {
                    dollar_tag = Some(body[i + 1..tag_end].to_string());
                    i = tag_end + 1;
                } else {
                    i += 1;
                }
            }
            b':' => {
                // `::type` casts are not parameters; skip the whole token.
                if i + 1 < len && bytes[i + 1] == b':' {
                    i += 2;
                    continue;
                }
                let start = i + 1;
                let end = ident_end(bytes, start);
                if end > start {
                    spans.push((i, end, body[start..end].to_string()));
                    i = end;
                } else {
                    i += 1;
                }
            }
            _ => {
                i += 1;
            }
        }
    }

    spans
}

/// If `bytes[at]` starts a dollar-quote opener (`$tag$` with tag empty or an
/// identifier), return the index of the closing `$` of the opener.
fn dollar_quote_opener(bytes: &[u8], at: usize) -> Option<usize> {
    debug_assert_eq!(bytes[at], b'$');
    let mut j = at + 1;
    if j < bytes.len() && (bytes[j].is_ascii_alphabetic() || bytes[j] == b'_') {
        j += 1;
        while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
            j += 1;
        }
    }
    if j < bytes.len() && bytes[j] == b'$' {
        Some(j)
    } else {
        None
    }
}

/// End index of an identifier starting at `start` (`[A-Za-z_][A-Za-z0-9_]*`).
fn ident_end(bytes: &[u8], start: usize) -> usize {
    let len = bytes.len();
    if start >= len || !(bytes[start].is_ascii_alphabetic() || bytes[start] == b'_') {
        return start;
    }
    let mut end = start + 1;
    while end < len && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
        end += 1;
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_implicit_statement() {
        let stmts = split_file("a", "SELECT 1 AS n;\n");
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].name, "a");
        assert_eq!(stmts[0].body, "SELECT 1 AS n");
        assert!(stmts[0].params.is_empty());
    }

    #[test]
    fn test_split_named_statements() {
        let text = "-- name: byId\nSELECT * FROM t WHERE id = :id;\n\n-- name: all\nSELECT * FROM t;\n";
        let stmts = split_file("b", text);
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0].name, "byId");
        assert_eq!(stmts[0].params, vec!["id"]);
        assert_eq!(stmts[1].name, "all");
        assert!(stmts[1].params.is_empty());
    }

    #[test]
    fn test_split_implicit_before_named() {
        let text = "SELECT 1;\n-- name: second\nSELECT 2;\n";
        let stmts = split_file("mixed", text);
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0].name, "mixed");
        assert_eq!(stmts[1].name, "second");
    }

    #[test]
    fn test_marker_line_not_in_body() {
        let stmts = split_file("f", "-- name: q\nSELECT 1;\n");
        assert_eq!(stmts[0].body, "SELECT 1");
    }

    #[test]
    fn test_params_order_and_dedup() {
        let params = scan_params("SELECT * FROM t WHERE a = :b AND c = :a AND d = :b");
        assert_eq!(params, vec!["b", "a"]);
    }

    #[test]
    fn test_cast_is_not_param() {
        let params = scan_params("SELECT '2024-01-01'::date, :day");
        assert_eq!(params, vec!["day"]);
    }

    #[test]
    fn test_param_contexts_ignored() {
        let body = "SELECT ':a', \":b\", -- :c\n/* :d /* :e */ */ $q$:f$q$, :real";
        assert_eq!(scan_params(body), vec!["real"]);
    }

    #[test]
    fn test_anonymous_dollar_quote() {
        assert!(scan_params("SELECT $$:not_a_param$$").is_empty());
    }

    #[test]
    fn test_doubled_quote_escape() {
        let params = scan_params("SELECT 'it''s :not', :yes");
        assert_eq!(params, vec!["yes"]);
    }

    #[test]
    fn test_rewrite_placeholders() {
        let params = vec!["id".to_string(), "name".to_string()];
        let sql = rewrite_placeholders("SELECT :id, :name, :id::text", &params);
        assert_eq!(sql, "SELECT $1, $2, $1::text");
    }
}
