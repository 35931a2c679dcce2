//! Test report rendering: console, JUnit XML, JSON, GitHub Actions
//! annotations, and TAP (pgtap-style).

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Output format for `regresql test`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    #[default]
    Console,
    Junit,
    Json,
    GithubActions,
    Pgtap,
}

impl std::str::FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "console" => Ok(Self::Console),
            "junit" => Ok(Self::Junit),
            "json" => Ok(Self::Json),
            "github-actions" | "github" => Ok(Self::GithubActions),
            "pgtap" | "tap" => Ok(Self::Pgtap),
            _ => Err(format!(
                "unknown report format: {}. Use: console, junit, json, github-actions, pgtap",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
    Error,
    Skip,
}

/// One binding's verdict.
#[derive(Debug, Clone, Serialize)]
pub struct TestCase {
    /// `file:stmt[index]`
    pub label: String,
    pub file: String,
    pub stmt: String,
    pub index: usize,
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    /// The SQL that ran, with parameter values substituted for display.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    pub elapsed_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub started: DateTime<Utc>,
    pub elapsed_ms: f64,
    pub cases: Vec<TestCase>,
}

impl TestReport {
    pub fn new(started: DateTime<Utc>) -> Self {
        Self {
            started,
            elapsed_ms: 0.0,
            cases: Vec::new(),
        }
    }

    pub fn count(&self, verdict: Verdict) -> usize {
        self.cases.iter().filter(|c| c.verdict == verdict).count()
    }

    /// True when any binding diverged or errored.
    pub fn failed(&self) -> bool {
        self.cases
            .iter()
            .any(|c| matches!(c.verdict, Verdict::Fail | Verdict::Error))
    }
}

pub fn render(report: &TestReport, format: ReportFormat) -> String {
    match format {
        ReportFormat::Console => render_console(report),
        ReportFormat::Junit => render_junit(report),
        ReportFormat::Json => {
            let mut out =
                serde_json::to_string_pretty(report).expect("report serialises");
            out.push('\n');
            out
        }
        ReportFormat::GithubActions => render_github(report),
        ReportFormat::Pgtap => render_tap(report),
    }
}

fn render_console(report: &TestReport) -> String {
    let mut out = String::new();
    for case in &report.cases {
        let status = match case.verdict {
            Verdict::Pass => "ok  ",
            Verdict::Fail => "FAIL",
            Verdict::Error => "ERR ",
            Verdict::Skip => "skip",
        };
        out.push_str(&format!(
            "{} {} ({:.1} ms)\n",
            status, case.label, case.elapsed_ms
        ));
        if let Some(message) = &case.message {
            out.push_str(&format!("     {}\n", message));
        }
        if case.verdict == Verdict::Fail {
            if let Some(sql) = &case.sql {
                out.push_str(&format!("     sql: {}\n", sql));
            }
        }
        if let Some(diff) = &case.diff {
            for line in diff.lines() {
                out.push_str(&format!("     {}\n", line));
            }
        }
    }
    out.push_str(&format!(
        "\n{} passed, {} failed, {} errored, {} skipped ({:.1} ms)\n",
        report.count(Verdict::Pass),
        report.count(Verdict::Fail),
        report.count(Verdict::Error),
        report.count(Verdict::Skip),
        report.elapsed_ms
    ));
    out
}

fn render_junit(report: &TestReport) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str(&format!(
        "<testsuite name=\"regresql\" tests=\"{}\" failures=\"{}\" errors=\"{}\" skipped=\"{}\" time=\"{:.3}\" timestamp=\"{}\">\n",
        report.cases.len(),
        report.count(Verdict::Fail),
        report.count(Verdict::Error),
        report.count(Verdict::Skip),
        report.elapsed_ms / 1000.0,
        report.started.format("%Y-%m-%dT%H:%M:%S"),
    ));
    for case in &report.cases {
        out.push_str(&format!(
            "  <testcase classname=\"{}\" name=\"{}\" time=\"{:.3}\"",
            xml_escape(&case.file),
            xml_escape(&case.label),
            case.elapsed_ms / 1000.0,
        ));
        match case.verdict {
            Verdict::Pass => out.push_str("/>\n"),
            Verdict::Fail => {
                out.push_str(">\n    <failure message=\"output diverged\">");
                out.push_str(&xml_escape(case.diff.as_deref().unwrap_or("")));
                out.push_str("</failure>\n  </testcase>\n");
            }
            Verdict::Error => {
                out.push_str(">\n    <error message=\"");
                out.push_str(&xml_escape(case.message.as_deref().unwrap_or("error")));
                out.push_str("\"/>\n  </testcase>\n");
            }
            Verdict::Skip => {
                out.push_str(">\n    <skipped message=\"");
                out.push_str(&xml_escape(case.message.as_deref().unwrap_or("skipped")));
                out.push_str("\"/>\n  </testcase>\n");
            }
        }
    }
    out.push_str("</testsuite>\n");
    out
}

fn render_github(report: &TestReport) -> String {
    let mut out = String::new();
    for case in &report.cases {
        match case.verdict {
            Verdict::Fail => out.push_str(&format!(
                "::error file={},title=regresql {}::{}\n",
                case.file,
                case.label,
                github_escape(case.diff.as_deref().unwrap_or("output diverged")),
            )),
            Verdict::Error => out.push_str(&format!(
                "::error file={},title=regresql {}::{}\n",
                case.file,
                case.label,
                github_escape(case.message.as_deref().unwrap_or("error")),
            )),
            Verdict::Skip => out.push_str(&format!(
                "::notice file={},title=regresql {}::{}\n",
                case.file,
                case.label,
                github_escape(case.message.as_deref().unwrap_or("skipped")),
            )),
            Verdict::Pass => {}
        }
    }
    out.push_str(&format!(
        "::notice title=regresql::{} passed, {} failed, {} errored, {} skipped\n",
        report.count(Verdict::Pass),
        report.count(Verdict::Fail),
        report.count(Verdict::Error),
        report.count(Verdict::Skip),
    ));
    out
}

fn render_tap(report: &TestReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("1..{}\n", report.cases.len()));
    for (i, case) in report.cases.iter().enumerate() {
        let n = i + 1;
        match case.verdict {
            Verdict::Pass => out.push_str(&format!("ok {} - {}\n", n, case.label)),
            Verdict::Skip => out.push_str(&format!(
                "ok {} - {} # SKIP {}\n",
                n,
                case.label,
                case.message.as_deref().unwrap_or("")
            )),
            Verdict::Fail | Verdict::Error => {
                out.push_str(&format!("not ok {} - {}\n", n, case.label));
                let detail = case
                    .diff
                    .as_deref()
                    .or(case.message.as_deref())
                    .unwrap_or("");
                for line in detail.lines() {
                    out.push_str(&format!("# {}\n", line));
                }
            }
        }
    }
    out
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Workflow commands carry data on one line; escape the separators.
fn github_escape(s: &str) -> String {
    s.replace('%', "%25").replace('\r', "%0D").replace('\n', "%0A")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> TestReport {
        let mut report = TestReport::new(Utc::now());
        report.elapsed_ms = 12.5;
        report.cases = vec![
            TestCase {
                label: "a.sql:a".to_string(),
                file: "a.sql".to_string(),
                stmt: "a".to_string(),
                index: 0,
                verdict: Verdict::Pass,
                message: None,
                diff: None,
                sql: None,
                elapsed_ms: 1.0,
            },
            TestCase {
                label: "b.sql:byId[1]".to_string(),
                file: "b.sql".to_string(),
                stmt: "byId".to_string(),
                index: 1,
                verdict: Verdict::Fail,
                message: None,
                diff: Some("--- expected\n+++ actual\n@@ -1,1 +1,1 @@\n-1\n+2\n".to_string()),
                sql: Some("SELECT * FROM t WHERE id = 2".to_string()),
                elapsed_ms: 2.0,
            },
            TestCase {
                label: "c.sql:c".to_string(),
                file: "c.sql".to_string(),
                stmt: "c".to_string(),
                index: 0,
                verdict: Verdict::Skip,
                message: Some("no plan bindings".to_string()),
                diff: None,
                sql: None,
                elapsed_ms: 0.0,
            },
        ];
        report
    }

    #[test]
    fn test_failed_flag() {
        assert!(sample_report().failed());
        let mut passing = sample_report();
        passing.cases.retain(|c| c.verdict != Verdict::Fail);
        assert!(!passing.failed());
    }

    #[test]
    fn test_console_summary_line() {
        let out = render(&sample_report(), ReportFormat::Console);
        assert!(out.contains("1 passed, 1 failed, 0 errored, 1 skipped"));
        assert!(out.contains("FAIL b.sql:byId[1]"));
    }

    #[test]
    fn test_junit_shape() {
        let out = render(&sample_report(), ReportFormat::Junit);
        assert!(out.contains("<testsuite name=\"regresql\" tests=\"3\" failures=\"1\""));
        assert!(out.contains("<failure message=\"output diverged\">"));
        assert!(out.contains("<skipped message=\"no plan bindings\"/>"));
    }

    #[test]
    fn test_json_round_trips() {
        let out = render(&sample_report(), ReportFormat::Json);
        let doc: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(doc["cases"].as_array().unwrap().len(), 3);
        assert_eq!(doc["cases"][1]["verdict"], "fail");
    }

    #[test]
    fn test_github_annotations_one_line_each() {
        let out = render(&sample_report(), ReportFormat::GithubActions);
        let error_lines: Vec<&str> =
            out.lines().filter(|l| l.starts_with("::error")).collect();
        assert_eq!(error_lines.len(), 1);
        assert!(error_lines[0].contains("%0A"));
    }

    #[test]
    fn test_tap_plan_and_verdicts() {
        let out = render(&sample_report(), ReportFormat::Pgtap);
        assert!(out.starts_with("1..3\n"));
        assert!(out.contains("ok 1 - a.sql:a"));
        assert!(out.contains("not ok 2 - b.sql:byId[1]"));
        assert!(out.contains("# SKIP no plan bindings"));
    }
}
