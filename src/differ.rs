//! Deterministic line diff between expected and actual serialisations.
//!
//! Equality is byte-exact; the unified output exists for humans and for
//! report formats. Tolerant comparison lives only in the explain module.

/// Compute a unified diff between two texts. Returns `None` when equal.
pub fn unified_diff(
    old: &str,
    new: &str,
    old_label: &str,
    new_label: &str,
    context: usize,
) -> Option<String> {
    if old == new {
        return None;
    }

    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    let ops = diff_ops(&old_lines, &new_lines);

    let mut out = String::new();
    out.push_str(&format!("--- {}\n+++ {}\n", old_label, new_label));

    for hunk in hunks(&ops, context) {
        let (old_start, old_count, new_start, new_count) = hunk_header(&ops[hunk.clone()]);
        out.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            old_start, old_count, new_start, new_count
        ));
        for op in &ops[hunk] {
            match op {
                Op::Equal(i, _) => {
                    out.push(' ');
                    out.push_str(old_lines[*i]);
                }
                Op::Delete(i) => {
                    out.push('-');
                    out.push_str(old_lines[*i]);
                }
                Op::Insert(j) => {
                    out.push('+');
                    out.push_str(new_lines[*j]);
                }
            }
            out.push('\n');
        }
    }

    Some(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    /// (old index, new index)
    Equal(usize, usize),
    Delete(usize),
    Insert(usize),
}

impl Op {
    fn is_change(&self) -> bool {
        !matches!(self, Op::Equal(_, _))
    }
}

/// LCS-based edit script. Common prefix/suffix are stripped first so the
/// quadratic table only covers the changed middle.
fn diff_ops(old: &[&str], new: &[&str]) -> Vec<Op> {
    let mut prefix = 0;
    while prefix < old.len() && prefix < new.len() && old[prefix] == new[prefix] {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < old.len() - prefix
        && suffix < new.len() - prefix
        && old[old.len() - 1 - suffix] == new[new.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let old_mid = &old[prefix..old.len() - suffix];
    let new_mid = &new[prefix..new.len() - suffix];

    let mut ops = Vec::with_capacity(old.len() + new.len());
    for i in 0..prefix {
        ops.push(Op::Equal(i, i));
    }

    // LCS length table over the middle sections.
    let n = old_mid.len();
    let m = new_mid.len();
    let mut table = vec![0u32; (n + 1) * (m + 1)];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i * (m + 1) + j] = if old_mid[i] == new_mid[j] {
                table[(i + 1) * (m + 1) + j + 1] + 1
            } else {
                table[(i + 1) * (m + 1) + j].max(table[i * (m + 1) + j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old_mid[i] == new_mid[j] {
            ops.push(Op::Equal(prefix + i, prefix + j));
            i += 1;
            j += 1;
        } else if table[(i + 1) * (m + 1) + j] >= table[i * (m + 1) + j + 1] {
            ops.push(Op::Delete(prefix + i));
            i += 1;
        } else {
            ops.push(Op::Insert(prefix + j));
            j += 1;
        }
    }
    while i < n {
        ops.push(Op::Delete(prefix + i));
        i += 1;
    }
    while j < m {
        ops.push(Op::Insert(prefix + j));
        j += 1;
    }

    for k in 0..suffix {
        ops.push(Op::Equal(
            old.len() - suffix + k,
            new.len() - suffix + k,
        ));
    }

    ops
}

/// Group the edit script into hunks: runs of changes padded with up to
/// `context` equal lines, merged when their context overlaps.
fn hunks(ops: &[Op], context: usize) -> Vec<std::ops::Range<usize>> {
    let mut ranges: Vec<std::ops::Range<usize>> = Vec::new();

    let mut idx = 0;
    while idx < ops.len() {
        if !ops[idx].is_change() {
            idx += 1;
            continue;
        }
        let start = idx.saturating_sub(context);
        let mut end = idx + 1;
        let mut quiet = 0;
        let mut last_change = idx;
        while end < ops.len() && quiet < context * 2 {
            if ops[end].is_change() {
                quiet = 0;
                last_change = end;
            } else {
                quiet += 1;
            }
            end += 1;
        }
        let end = (last_change + 1 + context).min(ops.len());

        match ranges.last_mut() {
            Some(prev) if prev.end >= start => prev.end = end,
            _ => ranges.push(start..end),
        }
        idx = end;
    }

    ranges
}

fn hunk_header(ops: &[Op]) -> (usize, usize, usize, usize) {
    let mut old_start = None;
    let mut new_start = None;
    let mut old_count = 0;
    let mut new_count = 0;

    for op in ops {
        match op {
            Op::Equal(i, j) => {
                old_start.get_or_insert(*i);
                new_start.get_or_insert(*j);
                old_count += 1;
                new_count += 1;
            }
            Op::Delete(i) => {
                old_start.get_or_insert(*i);
                old_count += 1;
            }
            Op::Insert(j) => {
                new_start.get_or_insert(*j);
                new_count += 1;
            }
        }
    }

    // Unified headers are 1-based; a zero count keeps the 0 start.
    let old_start = old_start.map(|s| s + 1).unwrap_or(0);
    let new_start = new_start.map(|s| s + 1).unwrap_or(0);
    let old_start = if old_count == 0 { old_start.saturating_sub(1) } else { old_start };
    let new_start = if new_count == 0 { new_start.saturating_sub(1) } else { new_start };
    (old_start, old_count, new_start, new_count)
}
