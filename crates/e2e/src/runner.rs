//! Main test runner that orchestrates capture servers, the player and the engine

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info};

use crate::assert::{AssertionEngine, Verification};
use crate::capture::{CaptureRecord, CaptureSet};
use crate::config::HarnessConfig;
use crate::discovery::find_spec_files;
use crate::error::{E2eError, E2eResult};
use crate::player::{OriginalResponse, RequestPlayer};
use crate::spec::TestCase;

/// Result of running a single test file
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub path: PathBuf,
    pub description: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
    /// RECEIVED / EXPECTED report for a failed test
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

/// Result of a run, which stops at the first failure
#[derive(Debug, Clone, Serialize)]
pub struct TestSuiteResult {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub results: Vec<TestResult>,
}

impl TestSuiteResult {
    pub fn success(&self) -> bool {
        self.failed == 0
    }

    pub fn first_failure(&self) -> Option<&TestResult> {
        self.results.iter().find(|r| !r.success)
    }
}

/// A described test file, for `--desc`
#[derive(Debug, Clone, Serialize)]
pub struct TestDescription {
    pub path: PathBuf,
    pub description: String,
}

/// Main duplication test runner
pub struct TestRunner {
    config: HarnessConfig,
    player: RequestPlayer,
    engine: AssertionEngine,

    /// Running capture servers (none in curl-only mode)
    captures: Option<CaptureSet>,
}

impl TestRunner {
    pub fn new(config: HarnessConfig) -> E2eResult<Self> {
        config.validate()?;

        let player = RequestPlayer::new(&config.proxy)?;
        let engine = AssertionEngine::new(
            config.capture.primary_port,
            config.capture.secondary_port,
            config.wait_timeout(),
            config.timing.clone(),
        )
        .with_settle(config.settle());

        Ok(Self {
            config,
            player,
            engine,
            captures: None,
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Matching spec files in run order
    pub fn discover(&self) -> E2eResult<Vec<PathBuf>> {
        find_spec_files(&self.config.spec_dir, &self.config.test_glob)
    }

    /// Parse every matching file and return its description
    pub fn describe(&self) -> E2eResult<Vec<TestDescription>> {
        let files = self.discover()?;
        if files.is_empty() {
            return Err(E2eError::NoTestFiles(self.config.test_pattern()));
        }

        files
            .into_iter()
            .map(|path| {
                let case = TestCase::from_file(&path, self.config.format)?;
                Ok(TestDescription {
                    path,
                    description: case.description,
                })
            })
            .collect()
    }

    /// Start both capture servers
    pub async fn start_captures(&mut self) -> E2eResult<()> {
        if self.captures.is_some() {
            return Ok(()); // Already running
        }

        let captures = CaptureSet::start(&self.config.capture).await?;

        // Ephemeral ports are only known once bound
        self.engine
            .set_ports(captures.primary.port(), captures.secondary.port());

        self.captures = Some(captures);
        Ok(())
    }

    /// Ports the capture servers listen on, once started
    pub fn capture_ports(&self) -> Option<(u16, u16)> {
        self.captures
            .as_ref()
            .map(|c| (c.primary.port(), c.secondary.port()))
    }

    /// Stop both capture servers
    pub fn stop_captures(&mut self) {
        if let Some(mut captures) = self.captures.take() {
            captures.stop();
        }
    }

    /// Discover and run every matching file, tearing capture servers down afterwards
    pub async fn run_all(&mut self) -> E2eResult<TestSuiteResult> {
        let files = self.discover()?;
        if files.is_empty() {
            return Err(E2eError::NoTestFiles(self.config.test_pattern()));
        }

        let result = self.run_files(&files).await;
        self.stop_captures();
        result
    }

    /// Run files in order, stopping at the first failing one
    pub async fn run_files(&mut self, files: &[PathBuf]) -> E2eResult<TestSuiteResult> {
        let start = Instant::now();
        let mut results = Vec::new();
        let mut passed = 0;
        let mut failed = 0;

        if !self.config.curl_only {
            self.start_captures().await?;
        }

        info!("Running {} test(s)...", files.len());

        for path in files {
            let result = self.run_file(path).await?;
            if result.success {
                passed += 1;
                info!("✓ {} ({} ms)", path.display(), result.duration_ms);
                results.push(result);
            } else {
                failed += 1;
                error!(
                    "✗ {} - {}",
                    path.display(),
                    result.error.as_deref().unwrap_or("unknown error")
                );
                results.push(result);
                break;
            }
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Test Results: {} passed, {} failed, {} not run ({} ms)",
            passed,
            failed,
            files.len() - passed - failed,
            duration_ms
        );

        Ok(TestSuiteResult {
            total: files.len(),
            passed,
            failed,
            duration_ms,
            results,
        })
    }

    /// Parse and run one spec file.
    ///
    /// A malformed file or an invalid pattern is a harness error and aborts
    /// the run; an unreachable proxy fails only this test.
    pub async fn run_file(&mut self, path: &Path) -> E2eResult<TestResult> {
        info!("Test: {}", path.display());
        let case = TestCase::from_file(path, self.config.format)?;
        self.run_case(path, &case).await
    }

    pub async fn run_case(&mut self, path: &Path, case: &TestCase) -> E2eResult<TestResult> {
        let start = Instant::now();
        debug!("Running test: {}", case.description);

        let response = match self.player.play(case).await {
            Ok(response) => response,
            Err(e @ E2eError::Transport { .. }) => {
                return Ok(TestResult {
                    path: path.to_path_buf(),
                    description: case.description.clone(),
                    success: false,
                    duration_ms: start.elapsed().as_millis() as u64,
                    diagnostic: Some(diagnostic(None, &[], case)),
                    error: Some(e.to_string()),
                });
            }
            Err(e) => return Err(e),
        };

        let verification = match self.captures.as_mut() {
            Some(captures) => {
                self.engine
                    .verify(case, &response, captures.queue())
                    .await?
            }
            None => self.verify_response_only(case, &response),
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let (error, diagnostic) = match &verification.result {
            Ok(()) => (None, None),
            Err(failure) => (
                Some(failure.to_string()),
                Some(diagnostic(Some(&response), &verification.captures, case)),
            ),
        };

        Ok(TestResult {
            path: path.to_path_buf(),
            description: case.description.clone(),
            success: verification.passed(),
            duration_ms,
            error,
            diagnostic,
        })
    }

    /// Curl-only mode: nothing is listening for duplicates
    fn verify_response_only(&self, case: &TestCase, response: &OriginalResponse) -> Verification {
        Verification {
            captures: Vec::new(),
            result: self.engine.check_response(case, response),
        }
    }
}

impl Drop for TestRunner {
    fn drop(&mut self) {
        self.stop_captures();
    }
}

/// Both views needed to diagnose a failure: what arrived and what was expected
fn diagnostic(
    response: Option<&OriginalResponse>,
    captures: &[CaptureRecord],
    case: &TestCase,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "########### RECEIVED ###############");
    match response {
        Some(response) => {
            let _ = writeln!(
                out,
                "Response: {} in {} ms\n  body: {}",
                response.status,
                response.elapsed_ms,
                response.body.trim_end()
            );
        }
        None => {
            let _ = writeln!(out, "Response: none");
        }
    }
    if captures.is_empty() {
        let _ = writeln!(out, "Duplicates: none");
    }
    for (i, record) in captures.iter().enumerate() {
        let _ = writeln!(out, "Duplicate #{}:\n{}", i + 1, record);
    }
    let _ = writeln!(out, "########### EXPECTED ###############");
    let _ = write!(out, "{}", case);
    out
}
