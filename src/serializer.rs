//! Stable textual serialisation of result sets.
//!
//! The serialised form is the on-disk oracle for regression detection, so
//! it must be byte-identical across runs and platforms: `\n` separators,
//! tab-separated cells, canonical cell renderings produced by the runner.

/// A single cell: `None` is SQL NULL.
pub type Cell = Option<String>;

/// An executed query's captured output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

/// Serialise a result set:
///
/// - line 1: tab-separated column names,
/// - line 2: tab-separated dashes matching each name's display width,
/// - one line per row, cells tab-separated, NULL as the bare literal,
/// - `(<N> rows)` footer, trailing newline.
pub fn serialize(rs: &ResultSet) -> String {
    let mut out = String::new();

    out.push_str(&rs.columns.join("\t"));
    out.push('\n');

    let dashes: Vec<String> = rs
        .columns
        .iter()
        .map(|c| "-".repeat(c.chars().count().max(1)))
        .collect();
    out.push_str(&dashes.join("\t"));
    out.push('\n');

    for row in &rs.rows {
        let cells: Vec<&str> = row.iter().map(|c| render_cell(c)).collect();
        out.push_str(&cells.join("\t"));
        out.push('\n');
    }

    let noun = if rs.rows.len() == 1 { "row" } else { "rows" };
    out.push_str(&format!("({} {})\n", rs.rows.len(), noun));
    out
}

/// Serialise an execution error so update can materialise it and test can
/// match against an error-expecting file.
pub fn serialize_error(message: &str) -> String {
    format!("ERROR: {}\n", message.trim_end())
}

/// NULL serialises as the bare literal; a *string* that spells NULL is
/// quoted to stay distinguishable.
fn render_cell(cell: &Cell) -> &str {
    match cell {
        None => "NULL",
        Some(s) if s == "NULL" => "\"NULL\"",
        Some(s) => s.as_str(),
    }
}
