//! Reports over a fuzz run
//!
//! A report tabulates each target's cases together with what the embedding
//! search did on them, and lists the shrunk counterexamples. Counterexamples
//! of embedding targets carry a scenario file that `embed-chains --scenario`
//! replays.

use crate::runner::{FuzzFailure, FuzzResult, SearchStats};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzReport {
    pub generated_at: DateTime<Utc>,
    /// `branch@commit` of the checkout the run was built from
    pub revision: Option<String>,
    pub environment: String,
    pub results: Vec<FuzzResult>,
    pub summary: ReportSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSummary {
    pub targets: usize,
    pub targets_failed: usize,
    pub cases: u64,
    pub cases_failed: u64,
    pub duration_ms: f64,
    /// Search outcomes over every embedding target
    pub search: SearchStats,
}

/// A reported failure of one target
#[derive(Debug, Clone, Copy)]
pub struct Counterexample<'a> {
    pub target: &'a str,
    /// 1-based within the target
    pub index: usize,
    pub failure: &'a FuzzFailure,
}

impl Counterexample<'_> {
    /// Name of the scenario file under a `write_scenarios` directory
    pub fn scenario_file(&self) -> String {
        format!("{}-{}.json", self.target, self.index)
    }
}

impl FuzzReport {
    pub fn new(results: Vec<FuzzResult>) -> Self {
        let mut search = SearchStats::default();
        for result in &results {
            search.merge(&result.search);
        }
        let summary = ReportSummary {
            targets: results.len(),
            targets_failed: results.iter().filter(|r| !r.passed).count(),
            cases: results.iter().map(|r| r.cases_run).sum(),
            cases_failed: results.iter().map(|r| r.cases_failed).sum(),
            duration_ms: results.iter().map(|r| r.duration_ms).sum(),
            search,
        };
        Self {
            generated_at: Utc::now(),
            revision: revision(),
            environment: environment_name(),
            results,
            summary,
        }
    }

    pub fn counterexamples(&self) -> impl Iterator<Item = Counterexample<'_>> {
        self.results.iter().flat_map(|result| {
            result
                .failures
                .iter()
                .enumerate()
                .map(move |(i, failure)| Counterexample {
                    target: &result.name,
                    index: i + 1,
                    failure,
                })
        })
    }

    /// Write every replayable counterexample into `dir` as a scenario file.
    pub fn write_scenarios(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        fs::create_dir_all(dir)?;
        let mut written = Vec::new();
        for example in self.counterexamples() {
            let Some(scenario) = &example.failure.scenario else {
                continue;
            };
            let path = dir.join(example.scenario_file());
            fs::write(&path, serde_json::to_vec_pretty(scenario)?)?;
            written.push(path);
        }
        Ok(written)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// One testsuite per target; search outcomes go into its properties.
    pub fn to_junit_xml(&self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        let _ = writeln!(
            xml,
            "<testsuites name=\"chain-embedding\" tests=\"{}\" failures=\"{}\" time=\"{:.3}\">",
            self.summary.cases,
            self.summary.cases_failed,
            self.summary.duration_ms / 1000.0
        );

        for result in &self.results {
            let seconds = result.duration_ms / 1000.0;
            let _ = writeln!(
                xml,
                "  <testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" time=\"{:.3}\">",
                escape_xml(&result.name),
                result.cases_run,
                result.cases_failed,
                seconds
            );
            let stats = &result.search;
            if stats.searched() > 0 {
                xml.push_str("    <properties>\n");
                let mut property = |name: &str, value: String| {
                    let _ = writeln!(xml, "      <property name=\"{}\" value=\"{}\"/>", name, value);
                };
                property("mapped", stats.mapped.to_string());
                property("unmappable", stats.unmappable.to_string());
                property("backtracks", stats.backtracks.to_string());
                property("max_backtracks", stats.max_backtracks.to_string());
                if let Some(min) = stats.min_remaining_latency {
                    property("min_remaining_latency", format!("{}", min));
                }
                xml.push_str("    </properties>\n");
            }

            if result.failures.is_empty() && result.passed {
                let _ = writeln!(xml, "    <testcase name=\"{}\" time=\"{:.3}\"/>", escape_xml(&result.name), seconds);
            }
            for (i, failure) in result.failures.iter().enumerate() {
                let body = match &failure.scenario {
                    Some(scenario) => scenario.to_string(),
                    None => failure.input.clone().unwrap_or_default(),
                };
                let _ = writeln!(
                    xml,
                    "    <testcase name=\"{}#{}\"><failure message=\"{}\">{}</failure></testcase>",
                    escape_xml(&result.name),
                    i + 1,
                    escape_xml(&failure.message),
                    escape_xml(&body)
                );
            }
            xml.push_str("  </testsuite>\n");
        }

        xml.push_str("</testsuites>\n");
        xml
    }

    pub fn to_markdown(&self) -> String {
        let s = &self.summary;
        let mut md = String::from("# Chain embedding fuzz run\n\n");
        let _ = write!(md, "{}", self.generated_at.format("%Y-%m-%d %H:%M UTC"));
        if let Some(revision) = &self.revision {
            let _ = write!(md, " on `{}`", revision);
        }
        let _ = writeln!(md, " ({})\n", self.environment);
        let _ = writeln!(
            md,
            "{} cases over {} targets in {:.0} ms, {} failed in {} targets.",
            s.cases, s.targets, s.duration_ms, s.cases_failed, s.targets_failed
        );
        if s.search.searched() > 0 {
            let _ = writeln!(
                md,
                "Searches: {} mapped ({:.1}%), {} unmappable, {:.2} backtracks per mapping (max {}), tightest budget left {}.",
                s.search.mapped,
                s.search.mapped_rate() * 100.0,
                s.search.unmappable,
                s.search.mean_backtracks(),
                s.search.max_backtracks,
                fmt_latency(s.search.min_remaining_latency)
            );
        }

        md.push_str("\n| Target | Cases | Failed | Mapped | Unmappable | Backtracks mean / max | Latency left min / mean |\n");
        md.push_str("|--------|------:|-------:|-------:|-----------:|----------------------:|------------------------:|\n");
        for result in &self.results {
            let stats = &result.search;
            let _ = write!(md, "| {} {} | {} | {} ", mark(result), result.name, result.cases_run, result.cases_failed);
            if stats.searched() == 0 {
                md.push_str("| - | - | - | - |\n");
            } else {
                let _ = writeln!(
                    md,
                    "| {} | {} | {:.2} / {} | {} / {} |",
                    stats.mapped,
                    stats.unmappable,
                    stats.mean_backtracks(),
                    stats.max_backtracks,
                    fmt_latency(stats.min_remaining_latency),
                    fmt_latency(stats.mean_remaining_latency())
                );
            }
        }

        let mut examples = self.counterexamples().peekable();
        if examples.peek().is_some() {
            md.push_str("\n## Counterexamples\n");
        }
        for example in examples {
            let failure = example.failure;
            let _ = writeln!(md, "\n### {} #{}\n\n{}\n", example.target, example.index, failure.message);
            if let Some(input) = &failure.input {
                let shrunk = if failure.shrunk { "shrunk" } else { "as generated" };
                let _ = writeln!(md, "Input ({}): `{}`\n", shrunk, input);
            }
            if let Some(scenario) = &failure.scenario {
                let _ = writeln!(
                    md,
                    "Replay with `embed-chains --scenario {}`:\n\n```json\n{}\n```",
                    example.scenario_file(),
                    serde_json::to_string_pretty(scenario).unwrap_or_default()
                );
            }
        }
        md
    }

    pub fn print(&self) {
        println!("{}", self.to_markdown());
    }
}

fn mark(result: &FuzzResult) -> &'static str {
    if result.passed {
        "✓"
    } else {
        "✗"
    }
}

fn fmt_latency(latency: Option<f64>) -> String {
    latency.map_or_else(|| "-".to_string(), |l| format!("{:.2}", l))
}

fn git(args: &[&str]) -> Option<String> {
    std::process::Command::new("git")
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn revision() -> Option<String> {
    let commit = git(&["rev-parse", "--short", "HEAD"])?;
    Some(match git(&["branch", "--show-current"]) {
        Some(branch) => format!("{}@{}", branch, commit),
        None => commit,
    })
}

fn environment_name() -> String {
    if std::env::var("CI").is_ok() {
        "CI".to_string()
    } else {
        "local".to_string()
    }
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
