//! Console output for the runner

use clap::ValueEnum;
use serde::Serialize;

use duptest_e2e::runner::{TestDescription, TestSuiteResult};

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable lines
    #[default]
    Plain,
    /// JSON document
    Json,
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => print_error(&format!("could not encode output: {}", e)),
    }
}

/// Print the `--desc` listing
pub fn print_descriptions(items: &[TestDescription], format: OutputFormat) {
    match format {
        OutputFormat::Plain => {
            for item in items {
                println!("Test: {} {}", item.path.display(), item.description);
            }
        }
        OutputFormat::Json => print_json(items),
    }
}

/// Print the outcome of a run, with the diagnostic of the failing test
pub fn print_suite(results: &TestSuiteResult, format: OutputFormat) {
    match format {
        OutputFormat::Plain => {
            if let Some(failed) = results.first_failure() {
                print_error(&format!(
                    "{}: {}",
                    failed.path.display(),
                    failed.error.as_deref().unwrap_or("unknown error")
                ));
                if let Some(diagnostic) = &failed.diagnostic {
                    eprintln!("{}", diagnostic);
                }
            } else {
                print_success(&format!(
                    "{} test(s) passed in {} ms",
                    results.passed, results.duration_ms
                ));
            }
        }
        OutputFormat::Json => print_json(results),
    }
}

/// Print success message
pub fn print_success(message: &str) {
    println!("✅ {}", message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("❌ {}", message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("⚠️  {}", message);
}
