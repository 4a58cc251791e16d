//! Chain Embedding Fuzz Runner CLI
//!
//! Usage:
//!   embed-fuzz run [--cases N] [--seed S] [--output FORMAT] [--scenarios DIR]
//!   embed-fuzz list
//!   embed-fuzz report <json-file> [--output FORMAT]
//!
//! Examples:
//!   embed-fuzz run                        # Run all targets with defaults
//!   embed-fuzz run --cases 10000          # 10k cases per target
//!   embed-fuzz run --output junit         # JUnit XML for CI
//!   embed-fuzz run --scenarios failing/   # Save counterexamples for embed-chains
//!   embed-fuzz report results.json        # Re-generate report from JSON

use clap::{Parser, Subcommand, ValueEnum};
use fuzz_harness::prelude::*;
use fuzz_harness::reports::FuzzReport;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "embed-fuzz", about = "Property-based fuzzing of the chain embedding engine")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run all fuzz targets
    Run {
        /// Number of test cases per target
        #[arg(long, default_value_t = 1_000)]
        cases: u64,

        /// Random seed (0 = random)
        #[arg(long, default_value_t = 0)]
        seed: u64,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,

        /// Directory for counterexample scenario files
        #[arg(long)]
        scenarios: Option<PathBuf>,
    },
    /// List available fuzz targets
    List,
    /// Generate report from JSON results
    Report {
        json: PathBuf,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
    Junit,
    Markdown,
}

const TARGETS: [(&str, &str); 5] = [
    ("ledger_lifo", "Restores undo subtractions exactly, newest first"),
    ("latency_triangle", "No non-SAP relay beats the oracle distance"),
    ("bounded_search", "Search terminates with a well-formed mapping"),
    ("resource_conservation", "Ledger holds exactly what the mapping uses"),
    ("undo_lifo", "Undoing every committed unit restores ledger and budgets"),
];

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::WARN };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Failed to install tracing subscriber");
    }

    match args.command {
        Command::Run {
            cases,
            seed,
            output,
            scenarios,
        } => run_fuzz_targets(FuzzConfig::new().cases(cases).seed(seed), output, scenarios.as_deref()),
        Command::List => list_targets(),
        Command::Report { json, output } => generate_report(&json, output),
    }
}

fn emit(report: &FuzzReport, output: OutputFormat) {
    match output {
        OutputFormat::Json => println!("{}", report.to_json()),
        OutputFormat::Junit => println!("{}", report.to_junit_xml()),
        OutputFormat::Markdown => println!("{}", report.to_markdown()),
        OutputFormat::Text => report.print(),
    }
}

fn run_fuzz_targets(config: FuzzConfig, output: OutputFormat, scenarios: Option<&Path>) -> ExitCode {
    info!("Chain embedding fuzz runner: {} cases per target, seed {}", config.cases, config.seed);

    let mut runner = FuzzRunner::new(config);
    runner.run("ledger_lifo", ledger_case(), |case| check_ledger_lifo(&case));
    runner.run("latency_triangle", substrate_spec(), |spec| check_latency_triangle(&spec));
    let replay = |case: &EmbeddingCase| Some(case.to_scenario_json());
    runner.run_replayable("bounded_search", embedding_case(), |case| check_bounded_search(&case), replay);
    runner.run_replayable(
        "resource_conservation",
        embedding_case(),
        |case| check_resource_conservation(&case),
        replay,
    );
    runner.run_replayable("undo_lifo", embedding_case(), |case| check_undo_restores_start(&case), replay);

    if output == OutputFormat::Text {
        runner.print_all_summaries();
    }
    let report = FuzzReport::new(runner.into_results());
    emit(&report, output);
    if let Some(dir) = scenarios {
        match report.write_scenarios(dir) {
            Ok(written) => info!("Wrote {} counterexample scenarios to {:?}", written.len(), dir),
            Err(e) => error!("Failed to write scenarios to {:?}: {}", dir, e),
        }
    }

    if report.summary.targets_failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

fn list_targets() -> ExitCode {
    println!("Available fuzz targets:");
    println!();
    for (name, description) in TARGETS {
        println!("  {:<24} {}", name, description);
    }
    println!();
    println!("Run with: embed-fuzz run [--cases N]");
    ExitCode::SUCCESS
}

fn generate_report(path: &Path, output: OutputFormat) -> ExitCode {
    let json = match fs::read_to_string(path) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to read {:?}: {}", path, e);
            return ExitCode::from(1);
        }
    };
    // accept either a saved report or a bare result list
    let results = match serde_json::from_str::<FuzzReport>(&json) {
        Ok(report) => report.results,
        Err(_) => match serde_json::from_str::<Vec<FuzzResult>>(&json) {
            Ok(results) => results,
            Err(e) => {
                error!("Failed to parse JSON: {}", e);
                return ExitCode::from(1);
            }
        },
    };
    emit(&FuzzReport::new(results), output);
    ExitCode::SUCCESS
}
