//! Fuzz test runner
//!
//! Drives proptest strategies outside of `cargo test`, shrinking each
//! failing input before it is reported. Passing cases feed per-target
//! search statistics; failing embedding cases can carry a scenario that
//! `embed-chains` replays.

use proptest::strategy::{Strategy, ValueTree};
use proptest::test_runner::{Config, RngAlgorithm, TestRng, TestRunner};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;
use std::time::{Duration, Instant};
use tracing::{debug, info};

// ============================================================================
// Configuration
// ============================================================================

/// Fuzz test configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzConfig {
    /// Number of test cases to run
    pub cases: u64,
    /// Maximum shrink iterations on failure
    pub max_shrink_iters: u32,
    /// Random seed (0 = random)
    pub seed: u64,
    /// Failures kept per target
    pub max_failures: usize,
}

impl Default for FuzzConfig {
    fn default() -> Self {
        Self {
            cases: 1_000,
            max_shrink_iters: 1000,
            seed: 0,
            max_failures: 10,
        }
    }
}

impl FuzzConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cases(mut self, n: u64) -> Self {
        self.cases = n;
        self
    }

    pub fn seed(mut self, s: u64) -> Self {
        self.seed = s;
        self
    }

    pub fn max_shrink_iters(mut self, n: u32) -> Self {
        self.max_shrink_iters = n;
        self
    }

    /// Generate proptest config from this
    pub fn to_proptest_config(&self) -> Config {
        let mut config = Config::default();
        config.cases = self.cases.min(u32::MAX as u64) as u32;
        config.max_shrink_iters = self.max_shrink_iters;
        if self.seed != 0 {
            config.rng_algorithm = RngAlgorithm::ChaCha;
        }
        config
    }

    fn test_runner(&self) -> TestRunner {
        let config = self.to_proptest_config();
        if self.seed == 0 {
            return TestRunner::new(config);
        }
        let mut seed = [0u8; 32];
        for chunk in seed.chunks_mut(8) {
            chunk.copy_from_slice(&self.seed.to_le_bytes());
        }
        TestRunner::new_with_rng(config, TestRng::from_seed(RngAlgorithm::ChaCha, &seed))
    }
}

// ============================================================================
// Search statistics
// ============================================================================

/// What a passing case exercised.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CaseOutcome {
    /// Nothing to report beyond passing
    Checked,
    /// The request was embedded; the tightest chain had
    /// `min_remaining_latency` left
    Mapped {
        backtracks: usize,
        min_remaining_latency: f64,
    },
    /// The engine reported that no embedding exists
    Unmappable,
}

impl From<()> for CaseOutcome {
    fn from(_: ()) -> Self {
        CaseOutcome::Checked
    }
}

/// Embedding outcomes of the passing cases of one target
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchStats {
    pub mapped: u64,
    pub unmappable: u64,
    pub backtracks: u64,
    pub max_backtracks: usize,
    /// Tightest leftover chain budget over all mapped cases
    pub min_remaining_latency: Option<f64>,
    pub remaining_latency_sum: f64,
}

impl SearchStats {
    pub fn record(&mut self, outcome: CaseOutcome) {
        match outcome {
            CaseOutcome::Checked => {}
            CaseOutcome::Mapped {
                backtracks,
                min_remaining_latency,
            } => {
                self.mapped += 1;
                self.backtracks += backtracks as u64;
                self.max_backtracks = self.max_backtracks.max(backtracks);
                self.remaining_latency_sum += min_remaining_latency;
                self.min_remaining_latency = Some(
                    self.min_remaining_latency
                        .map_or(min_remaining_latency, |m| m.min(min_remaining_latency)),
                );
            }
            CaseOutcome::Unmappable => self.unmappable += 1,
        }
    }

    pub fn merge(&mut self, other: &SearchStats) {
        self.mapped += other.mapped;
        self.unmappable += other.unmappable;
        self.backtracks += other.backtracks;
        self.max_backtracks = self.max_backtracks.max(other.max_backtracks);
        self.remaining_latency_sum += other.remaining_latency_sum;
        self.min_remaining_latency = match (self.min_remaining_latency, other.min_remaining_latency) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }

    /// Cases that ran the search to the end
    pub fn searched(&self) -> u64 {
        self.mapped + self.unmappable
    }

    pub fn mapped_rate(&self) -> f64 {
        match self.searched() {
            0 => 0.0,
            n => self.mapped as f64 / n as f64,
        }
    }

    pub fn mean_backtracks(&self) -> f64 {
        match self.mapped {
            0 => 0.0,
            n => self.backtracks as f64 / n as f64,
        }
    }

    pub fn mean_remaining_latency(&self) -> Option<f64> {
        (self.mapped > 0).then(|| self.remaining_latency_sum / self.mapped as f64)
    }
}

// ============================================================================
// Results
// ============================================================================

/// Result of a fuzz test run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzResult {
    /// Test name
    pub name: String,
    /// Total cases run
    pub cases_run: u64,
    /// Cases that passed
    pub cases_passed: u64,
    /// Cases that failed
    pub cases_failed: u64,
    pub duration_ms: f64,
    /// Cases per second
    pub throughput: f64,
    /// Failure details if any
    pub failures: Vec<FuzzFailure>,
    /// Whether test passed overall
    pub passed: bool,
    #[serde(default)]
    pub search: SearchStats,
}

impl FuzzResult {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cases_run: 0,
            cases_passed: 0,
            cases_failed: 0,
            duration_ms: 0.0,
            throughput: 0.0,
            failures: Vec::new(),
            passed: true,
            search: SearchStats::default(),
        }
    }

    pub fn record_pass(&mut self) {
        self.cases_run += 1;
        self.cases_passed += 1;
    }

    pub fn record_outcome(&mut self, outcome: CaseOutcome) {
        self.search.record(outcome);
        self.record_pass();
    }

    pub fn record_fail(&mut self, failure: FuzzFailure) {
        self.cases_run += 1;
        self.cases_failed += 1;
        self.passed = false;
        self.failures.push(failure);
    }

    pub fn finalize(&mut self, duration: Duration) {
        self.duration_ms = duration.as_secs_f64() * 1000.0;
        if self.duration_ms > 0.0 {
            self.throughput = self.cases_run as f64 * 1000.0 / self.duration_ms;
        }
    }

    /// Print summary to stdout
    pub fn print_summary(&self) {
        println!("╔════════════════════════════════════════════════════════════╗");
        println!("║ Fuzz Test: {:<48} ║", self.name);
        println!("╠════════════════════════════════════════════════════════════╣");
        println!(
            "║ Cases: {:>10} | Passed: {:>10} | Failed: {:>10} ║",
            self.cases_run, self.cases_passed, self.cases_failed
        );
        println!(
            "║ Duration: {:>7.0} ms | Throughput: {:>10.0} cases/sec   ║",
            self.duration_ms, self.throughput
        );
        println!(
            "║ Status: {:<52} ║",
            if self.passed { "✓ PASSED" } else { "✗ FAILED" }
        );
        if self.search.searched() > 0 {
            println!(
                "║ Mapped: {:>9} | Unmappable: {:>7} | Backtracks: {:>6} ║",
                self.search.mapped, self.search.unmappable, self.search.backtracks
            );
        }
        println!("╚════════════════════════════════════════════════════════════╝");

        if !self.failures.is_empty() {
            println!("\nFailures:");
            for (i, f) in self.failures.iter().enumerate().take(5) {
                println!("  [{}] {}", i + 1, f.message);
                if let Some(ref input) = f.input {
                    println!("      Input: {}", input);
                }
            }
            if self.failures.len() > 5 {
                println!("  ... and {} more", self.failures.len() - 5);
            }
        }
    }
}

/// Details of a test failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzFailure {
    pub message: String,
    pub input: Option<String>,
    pub shrunk: bool,
    /// The failing input as an `embed-chains` scenario
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<Value>,
}

// ============================================================================
// Runner
// ============================================================================

/// Main fuzz test runner
pub struct FuzzRunner {
    config: FuzzConfig,
    results: Vec<FuzzResult>,
}

impl FuzzRunner {
    pub fn new(config: FuzzConfig) -> Self {
        Self {
            config,
            results: Vec::new(),
        }
    }

    pub fn with_default_config() -> Self {
        Self::new(FuzzConfig::default())
    }

    pub fn config(&self) -> &FuzzConfig {
        &self.config
    }

    /// Run `check` against `config.cases` inputs drawn from `strategy`.
    pub fn run<S, F, O>(&mut self, name: &str, strategy: S, check: F) -> &FuzzResult
    where
        S: Strategy,
        S::Value: Debug,
        F: Fn(S::Value) -> Result<O, String>,
        O: Into<CaseOutcome>,
    {
        self.run_replayable(name, strategy, check, |_| None)
    }

    /// Like [`FuzzRunner::run`], attaching `replay` of each reported input
    /// to its failure.
    pub fn run_replayable<S, F, O, R>(&mut self, name: &str, strategy: S, check: F, replay: R) -> &FuzzResult
    where
        S: Strategy,
        S::Value: Debug,
        F: Fn(S::Value) -> Result<O, String>,
        O: Into<CaseOutcome>,
        R: Fn(&S::Value) -> Option<Value>,
    {
        info!("Fuzzing {} with {} cases", name, self.config.cases);
        let mut result = FuzzResult::new(name);
        let mut runner = self.config.test_runner();
        let start = Instant::now();

        for i in 0..self.config.cases {
            let mut tree = match strategy.new_tree(&mut runner) {
                Ok(tree) => tree,
                Err(reason) => {
                    result.record_fail(FuzzFailure {
                        message: format!("input generation rejected: {:?}", reason),
                        input: Some(format!("case {}", i)),
                        shrunk: false,
                        scenario: None,
                    });
                    continue;
                }
            };
            match check(tree.current()) {
                Ok(outcome) => result.record_outcome(outcome.into()),
                Err(message) if result.failures.len() < self.config.max_failures => {
                    let failure = self.shrink(&mut tree, &check, &replay, message);
                    debug!("{} failed at case {}: {}", name, i, failure.message);
                    result.record_fail(failure);
                }
                Err(_) => {
                    result.cases_run += 1;
                    result.cases_failed += 1;
                    result.passed = false;
                }
            }
        }

        result.finalize(start.elapsed());
        self.results.push(result);
        &self.results[self.results.len() - 1]
    }

    /// Simplify a failing input for as long as it keeps failing.
    fn shrink<T, F, O, R>(&self, tree: &mut T, check: &F, replay: &R, message: String) -> FuzzFailure
    where
        T: ValueTree,
        T::Value: Debug,
        F: Fn(T::Value) -> Result<O, String>,
        R: Fn(&T::Value) -> Option<Value>,
    {
        let failing = |tree: &T, message: String, shrunk: bool| {
            let input = tree.current();
            FuzzFailure {
                message,
                input: Some(format!("{:?}", input)),
                shrunk,
                scenario: replay(&input),
            }
        };
        let mut failure = failing(&*tree, message, false);
        let mut iters = 0;
        let mut moved = tree.simplify();
        while moved && iters < self.config.max_shrink_iters {
            iters += 1;
            match check(tree.current()) {
                Err(message) => {
                    failure = failing(&*tree, message, true);
                    moved = tree.simplify();
                }
                Ok(_) => moved = tree.complicate(),
            }
        }
        failure
    }

    /// Get all results
    pub fn results(&self) -> &[FuzzResult] {
        &self.results
    }

    pub fn into_results(self) -> Vec<FuzzResult> {
        self.results
    }

    /// Print summary of all tests
    pub fn print_all_summaries(&self) {
        for result in &self.results {
            result.print_summary();
            println!();
        }

        let total_cases: u64 = self.results.iter().map(|r| r.cases_run).sum();
        let total_passed: u64 = self.results.iter().map(|r| r.cases_passed).sum();
        let total_failed: u64 = self.results.iter().map(|r| r.cases_failed).sum();
        let all_passed = self.results.iter().all(|r| r.passed);

        println!("════════════════════════════════════════════════════════════════");
        println!(
            "TOTAL: {} tests, {} cases, {} passed, {} failed",
            self.results.len(),
            total_cases,
            total_passed,
            total_failed
        );
        println!(
            "OVERALL: {}",
            if all_passed { "✓ ALL PASSED" } else { "✗ SOME FAILED" }
        );
        println!("════════════════════════════════════════════════════════════════");
    }

    /// Export results to JSON
    pub fn export_json(&self) -> String {
        serde_json::to_string_pretty(&self.results).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = FuzzConfig::default();
        assert_eq!(config.cases, 1_000);
        assert_eq!(config.to_proptest_config().cases, 1_000);
    }

    #[test]
    fn test_runner_basic() {
        let mut runner = FuzzRunner::new(FuzzConfig::new().cases(200));

        let result = runner.run("test_always_pass", 0u32..100, |_| Ok(()));
        assert!(result.passed);
        assert_eq!(result.cases_passed, 200);
    }

    #[test]
    fn test_runner_shrinks_failures() {
        let config = FuzzConfig::new().cases(100).seed(7);
        let mut runner = FuzzRunner::new(config);

        let result = runner.run("test_large_fail", 0u32..1000, |v| {
            if v >= 10 {
                Err(format!("{} too large", v))
            } else {
                Ok(())
            }
        });

        assert!(!result.passed);
        assert_eq!(result.cases_passed + result.cases_failed, 100);
        let first = &result.failures[0];
        assert_eq!(first.input.as_deref(), Some("10"));
    }

    #[test]
    fn test_runner_collects_search_stats() {
        let mut runner = FuzzRunner::new(FuzzConfig::new().cases(100).seed(3));
        let result = runner.run("test_outcomes", 0u32..10, |v| {
            Ok::<_, String>(if v % 2 == 0 {
                CaseOutcome::Mapped {
                    backtracks: v as usize,
                    min_remaining_latency: 1.0 + v as f64,
                }
            } else {
                CaseOutcome::Unmappable
            })
        });

        let stats = &result.search;
        assert!(result.passed);
        assert_eq!(stats.searched(), 100);
        assert!(stats.max_backtracks <= 8);
        assert!(stats.min_remaining_latency.map_or(true, |m| m >= 1.0));
        assert_eq!(stats.mean_remaining_latency().is_some(), stats.mapped > 0);
    }

    #[test]
    fn test_failures_carry_replay_of_shrunk_input() {
        let mut runner = FuzzRunner::new(FuzzConfig::new().cases(100).seed(7));
        let result = runner.run_replayable(
            "test_replay",
            0u32..1000,
            |v| if v >= 10 { Err(format!("{} too large", v)) } else { Ok(()) },
            |v| Some(serde_json::json!({ "value": v })),
        );

        let first = &result.failures[0];
        assert_eq!(first.scenario, Some(serde_json::json!({ "value": 10 })));
        assert_eq!(result.search, SearchStats::default());
    }

    #[test]
    fn test_stats_merge() {
        let mut a = SearchStats::default();
        a.record(CaseOutcome::Mapped {
            backtracks: 2,
            min_remaining_latency: 4.0,
        });
        let mut b = SearchStats::default();
        b.record(CaseOutcome::Unmappable);
        b.record(CaseOutcome::Mapped {
            backtracks: 0,
            min_remaining_latency: 1.0,
        });
        b.record(CaseOutcome::Checked);

        a.merge(&b);
        assert_eq!(a.searched(), 3);
        assert_eq!(a.max_backtracks, 2);
        assert_eq!(a.min_remaining_latency, Some(1.0));
        assert_eq!(a.mean_backtracks(), 1.0);
        assert_eq!(a.mean_remaining_latency(), Some(2.5));
    }

    #[test]
    fn test_seeded_runs_repeat() {
        let config = FuzzConfig::new().cases(50).seed(42);
        let check = |v: u32| if v % 7 == 0 { Err(v.to_string()) } else { Ok(()) };
        let a = FuzzRunner::new(config.clone()).run("a", 0u32..1000, check).cases_failed;
        let b = FuzzRunner::new(config).run("b", 0u32..1000, check).cases_failed;
        assert_eq!(a, b);
    }
}
