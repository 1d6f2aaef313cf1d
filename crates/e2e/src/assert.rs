//! Assertion engine - decides whether the proxy duplicated exactly as specified

use std::time::Duration;

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::capture::{CaptureQueue, CaptureRecord};
use crate::config::TimingConfig;
use crate::error::{E2eError, E2eResult};
use crate::player::OriginalResponse;
use crate::spec::{DestinationMode, TestCase};

/// Ways the proxy can get duplication wrong
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Failure {
    #[error("Response mismatch: expected '{expected}', received '{received}'")]
    ResponseMismatch { expected: String, received: String },

    #[error("Timing violation: {elapsed_ms} ms outside [{min_ms}, {max_ms}] ms")]
    TimingViolation {
        elapsed_ms: u64,
        min_ms: u64,
        max_ms: u64,
    },

    #[error("Request not duplicated: nothing arrived for {expected_path}")]
    MissingDuplicate { expected_path: String },

    #[error("Unexpected duplicate received on port {port}: {path}")]
    UnexpectedDuplicate { path: String, port: u16 },

    #[error("Multi destination violation: {0}")]
    MultiDestinationViolation(String),

    #[error("Path did not match: expected '{expected}', received '{received}'")]
    PathMismatch { expected: String, received: String },

    #[error("Body did not match /{pattern}/: {body}")]
    BodyMismatch { pattern: String, body: String },

    #[error("No header line matches /{pattern}/")]
    HeaderMissing { pattern: String },

    #[error("Wrong destination: expected port {expected}, received on {received}")]
    WrongDestination { expected: u16, received: u16 },
}

/// Outcome of verifying one test case
#[derive(Debug, Clone)]
pub struct Verification {
    /// Records consumed from the queue while verifying
    pub captures: Vec<CaptureRecord>,
    pub result: Result<(), Failure>,
}

impl Verification {
    fn new(captures: Vec<CaptureRecord>, result: Result<(), Failure>) -> Self {
        Self { captures, result }
    }

    pub fn passed(&self) -> bool {
        self.result.is_ok()
    }
}

/// Compares what the proxy did with what a test case expects
#[derive(Debug, Clone)]
pub struct AssertionEngine {
    primary_port: u16,
    secondary_port: u16,
    wait: Duration,
    /// Extra listening time after the expected duplicates matched
    settle: Duration,
    timing: TimingConfig,
}

/// Default for [`AssertionEngine::with_settle`]
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(200);

impl AssertionEngine {
    pub fn new(primary_port: u16, secondary_port: u16, wait: Duration, timing: TimingConfig) -> Self {
        Self {
            primary_port,
            secondary_port,
            wait,
            settle: DEFAULT_SETTLE,
            timing,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Point destination checks at the ports the capture servers actually bound
    pub fn set_ports(&mut self, primary_port: u16, secondary_port: u16) {
        self.primary_port = primary_port;
        self.secondary_port = secondary_port;
    }

    /// Checks on the original response alone
    pub fn check_response(&self, case: &TestCase, response: &OriginalResponse) -> Result<(), Failure> {
        if !case.expected_response_body.is_empty() {
            let received = response.body.trim_end();
            if received != case.expected_response_body {
                return Err(Failure::ResponseMismatch {
                    expected: case.expected_response_body.clone(),
                    received: received.to_string(),
                });
            }
        }

        if self.is_timed(&case.request_path) {
            let (min_ms, max_ms) = self.timing.window();
            if !(min_ms..=max_ms).contains(&response.elapsed_ms) {
                return Err(Failure::TimingViolation {
                    elapsed_ms: response.elapsed_ms,
                    min_ms,
                    max_ms,
                });
            }
        }

        Ok(())
    }

    fn is_timed(&self, path: &str) -> bool {
        let marker = self.timing.sleep_marker.to_lowercase();
        !marker.is_empty() && path.to_lowercase().contains(&marker)
    }

    /// Full verification: response checks, then drain the queue.
    ///
    /// Errors are reserved for broken test files (invalid patterns).
    pub async fn verify(
        &self,
        case: &TestCase,
        response: &OriginalResponse,
        queue: &mut CaptureQueue,
    ) -> E2eResult<Verification> {
        if let Err(failure) = self.check_response(case, response) {
            return Ok(Verification::new(Vec::new(), Err(failure)));
        }

        let matcher = RecordMatcher::compile(case)?;
        let mut captures = Vec::new();

        let Some(first) = queue.recv_timeout(self.wait).await else {
            let result = if case.expects_duplicate() {
                Err(Failure::MissingDuplicate {
                    expected_path: case.expected_dup_path.clone(),
                })
            } else {
                Ok(())
            };
            return Ok(Verification::new(captures, result));
        };
        debug!("Received duplicate:\n{}", first);
        captures.push(first);

        if !case.expects_duplicate() {
            let result = Err(Failure::UnexpectedDuplicate {
                path: captures[0].path.clone(),
                port: captures[0].source_port,
            });
            return Ok(Verification::new(captures, result));
        }

        if let Err(failure) = self.check_record(case, &matcher, &captures[0]) {
            return Ok(Verification::new(captures, Err(failure)));
        }

        if case.destination_mode != DestinationMode::Multi {
            let result = self.expect_no_more(queue, &mut captures).await;
            return Ok(Verification::new(captures, result));
        }

        let Some(second) = queue.recv_timeout(self.wait).await else {
            let result = Err(Failure::MultiDestinationViolation(
                "second duplicate never arrived".to_string(),
            ));
            return Ok(Verification::new(captures, result));
        };
        debug!("Received second duplicate:\n{}", second);
        captures.push(second);

        if captures[1].source_port == captures[0].source_port {
            let result = Err(Failure::MultiDestinationViolation(format!(
                "both duplicates sent to port {}",
                captures[0].source_port
            )));
            return Ok(Verification::new(captures, result));
        }

        if let Err(failure) = self.check_record(case, &matcher, &captures[1]) {
            return Ok(Verification::new(captures, Err(failure)));
        }

        let result = self.expect_no_more(queue, &mut captures).await;
        Ok(Verification::new(captures, result))
    }

    /// Duplication is exact: anything arriving within the settle window
    /// after the expected records is one duplicate too many.
    async fn expect_no_more(
        &self,
        queue: &mut CaptureQueue,
        captures: &mut Vec<CaptureRecord>,
    ) -> Result<(), Failure> {
        let Some(extra) = queue.recv_timeout(self.settle).await else {
            return Ok(());
        };
        debug!("Received extra duplicate:\n{}", extra);
        let failure = Failure::UnexpectedDuplicate {
            path: extra.path.clone(),
            port: extra.source_port,
        };
        captures.push(extra);
        Err(failure)
    }

    /// Per-record match: path, body, headers, destination
    pub fn check_record(
        &self,
        case: &TestCase,
        matcher: &RecordMatcher,
        record: &CaptureRecord,
    ) -> Result<(), Failure> {
        if record.path != case.expected_dup_path {
            return Err(Failure::PathMismatch {
                expected: case.expected_dup_path.clone(),
                received: record.path.clone(),
            });
        }

        if !matcher.body.is_match(&record.body) {
            return Err(Failure::BodyMismatch {
                pattern: case.expected_dup_body_pattern.clone(),
                body: record.body.clone(),
            });
        }

        for header in &matcher.headers {
            if !record.header_lines.iter().any(|line| header.is_match(line)) {
                return Err(Failure::HeaderMissing {
                    pattern: header.as_str().to_string(),
                });
            }
        }

        let expected_port = match case.destination_mode {
            DestinationMode::Default => Some(self.primary_port),
            DestinationMode::Secondary => Some(self.secondary_port),
            DestinationMode::Multi => None,
        };
        match expected_port {
            Some(expected) if expected != record.source_port => Err(Failure::WrongDestination {
                expected,
                received: record.source_port,
            }),
            _ => Ok(()),
        }
    }
}

/// Compiled patterns of one test case
#[derive(Debug, Clone)]
pub struct RecordMatcher {
    body: Regex,
    headers: Vec<Regex>,
}

impl RecordMatcher {
    pub fn compile(case: &TestCase) -> E2eResult<Self> {
        let body = RegexBuilder::new(&case.expected_dup_body_pattern)
            .multi_line(true)
            .dot_matches_new_line(true)
            .build()
            .map_err(|source| E2eError::InvalidPattern {
                pattern: case.expected_dup_body_pattern.clone(),
                source,
            })?;

        let headers = case
            .expected_dup_header_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| E2eError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<E2eResult<Vec<_>>>()?;

        Ok(Self { body, headers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureSender;
    use crate::spec::SpecFormat;
    use test_case::test_case;

    const PRIMARY: u16 = 8043;
    const SECONDARY: u16 = 16555;

    fn engine() -> AssertionEngine {
        AssertionEngine::new(
            PRIMARY,
            SECONDARY,
            Duration::from_millis(150),
            TimingConfig::default(),
        )
        .with_settle(Duration::from_millis(50))
    }

    fn case(dup_path: &str, body_pattern: &str, mode: DestinationMode) -> TestCase {
        TestCase {
            format: SpecFormat::Dup,
            description: "scenario".to_string(),
            request_path: "/a".to_string(),
            request_body: String::new(),
            expected_dup_path: dup_path.to_string(),
            expected_dup_header_patterns: Vec::new(),
            expected_dup_body_pattern: body_pattern.to_string(),
            expected_response_body: String::new(),
            destination: String::new(),
            destination_mode: mode,
        }
    }

    fn record(path: &str, body: &str, port: u16) -> CaptureRecord {
        CaptureRecord {
            method: "POST".to_string(),
            path: path.to_string(),
            header_lines: vec![
                "Host: localhost".to_string(),
                "X-Dup: yes".to_string(),
                "Content-Type: text/xml".to_string(),
            ],
            body: body.to_string(),
            source_port: port,
        }
    }

    fn response(body: &str, elapsed_ms: u64) -> OriginalResponse {
        OriginalResponse {
            status: 200,
            headers: Vec::new(),
            body: body.to_string(),
            elapsed_ms,
        }
    }

    fn queue_with(records: Vec<CaptureRecord>) -> (CaptureQueue, CaptureSender) {
        let queue = CaptureQueue::new();
        let sender = queue.sender();
        for r in records {
            sender.send(r).unwrap();
        }
        (queue, sender)
    }

    #[tokio::test]
    async fn test_matching_duplicate_on_primary_passes() {
        let (mut queue, _tx) = queue_with(vec![record("/a", "hello world", PRIMARY)]);
        let verification = engine()
            .verify(&case("/a", "hello", DestinationMode::Default), &response("", 10), &mut queue)
            .await
            .unwrap();
        assert!(verification.passed(), "{:?}", verification.result);
        assert_eq!(verification.captures.len(), 1);
    }

    #[tokio::test]
    async fn test_secondary_expected_but_primary_received() {
        let (mut queue, _tx) = queue_with(vec![record("/a", "hello world", PRIMARY)]);
        let verification = engine()
            .verify(&case("/a", "hello", DestinationMode::Secondary), &response("", 10), &mut queue)
            .await
            .unwrap();
        assert_eq!(
            verification.result,
            Err(Failure::WrongDestination {
                expected: SECONDARY,
                received: PRIMARY
            })
        );
    }

    #[tokio::test]
    async fn test_no_duplicate_expected_and_none_arrives() {
        let (mut queue, _tx) = queue_with(vec![]);
        let verification = engine()
            .verify(&case("", "", DestinationMode::Default), &response("", 10), &mut queue)
            .await
            .unwrap();
        assert!(verification.passed());
        assert!(verification.captures.is_empty());
    }

    #[tokio::test]
    async fn test_unexpected_duplicate_fails() {
        let (mut queue, _tx) = queue_with(vec![record("/a", "", PRIMARY)]);
        let verification = engine()
            .verify(&case("", "", DestinationMode::Default), &response("", 10), &mut queue)
            .await
            .unwrap();
        assert!(matches!(
            verification.result,
            Err(Failure::UnexpectedDuplicate { port: PRIMARY, .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_duplicate_fails() {
        let (mut queue, _tx) = queue_with(vec![]);
        let verification = engine()
            .verify(&case("/a", "", DestinationMode::Default), &response("", 10), &mut queue)
            .await
            .unwrap();
        assert!(matches!(
            verification.result,
            Err(Failure::MissingDuplicate { .. })
        ));
    }

    #[tokio::test]
    async fn test_multi_accepts_either_order() {
        for ports in [(PRIMARY, SECONDARY), (SECONDARY, PRIMARY)] {
            let (mut queue, _tx) = queue_with(vec![
                record("/a", "hello", ports.0),
                record("/a", "hello", ports.1),
            ]);
            let verification = engine()
                .verify(&case("/a", "hello", DestinationMode::Multi), &response("", 10), &mut queue)
                .await
                .unwrap();
            assert!(verification.passed(), "{:?}", verification.result);
            assert_eq!(verification.captures.len(), 2);
        }
    }

    #[tokio::test]
    async fn test_extra_duplicate_after_match_fails() {
        let (mut queue, _tx) = queue_with(vec![
            record("/a", "hello", PRIMARY),
            record("/a", "hello", SECONDARY),
        ]);
        let verification = engine()
            .verify(&case("/a", "hello", DestinationMode::Default), &response("", 10), &mut queue)
            .await
            .unwrap();
        assert_eq!(
            verification.result,
            Err(Failure::UnexpectedDuplicate {
                path: "/a".to_string(),
                port: SECONDARY
            })
        );
        assert_eq!(verification.captures.len(), 2);
        assert!(queue.recv_timeout(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_third_duplicate_under_multi_fails() {
        let (mut queue, _tx) = queue_with(vec![
            record("/a", "hello", PRIMARY),
            record("/a", "hello", SECONDARY),
            record("/a", "hello", PRIMARY),
        ]);
        let verification = engine()
            .verify(&case("/a", "hello", DestinationMode::Multi), &response("", 10), &mut queue)
            .await
            .unwrap();
        assert!(matches!(
            verification.result,
            Err(Failure::UnexpectedDuplicate { port: PRIMARY, .. })
        ));
        assert_eq!(verification.captures.len(), 3);
    }

    #[tokio::test]
    async fn test_multi_on_same_port_fails() {
        let (mut queue, _tx) = queue_with(vec![
            record("/a", "hello", PRIMARY),
            record("/a", "hello", PRIMARY),
        ]);
        let verification = engine()
            .verify(&case("/a", "hello", DestinationMode::Multi), &response("", 10), &mut queue)
            .await
            .unwrap();
        assert!(matches!(
            verification.result,
            Err(Failure::MultiDestinationViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_multi_missing_second_fails() {
        let (mut queue, _tx) = queue_with(vec![record("/a", "hello", SECONDARY)]);
        let verification = engine()
            .verify(&case("/a", "hello", DestinationMode::Multi), &response("", 10), &mut queue)
            .await
            .unwrap();
        assert!(matches!(
            verification.result,
            Err(Failure::MultiDestinationViolation(_))
        ));
        assert_eq!(verification.captures.len(), 1);
    }

    #[tokio::test]
    async fn test_multi_second_record_is_matched_too() {
        let (mut queue, _tx) = queue_with(vec![
            record("/a", "hello", PRIMARY),
            record("/b", "hello", SECONDARY),
        ]);
        let verification = engine()
            .verify(&case("/a", "hello", DestinationMode::Multi), &response("", 10), &mut queue)
            .await
            .unwrap();
        assert!(matches!(
            verification.result,
            Err(Failure::PathMismatch { .. })
        ));
    }

    #[test]
    fn test_header_patterns_are_subset_regex() {
        let mut expected = case("/a", "", DestinationMode::Default);
        expected.expected_dup_header_patterns = vec!["^X-Dup: y".to_string(), "(?i)content-type".to_string()];
        let matcher = RecordMatcher::compile(&expected).unwrap();
        assert!(engine()
            .check_record(&expected, &matcher, &record("/a", "", PRIMARY))
            .is_ok());

        expected.expected_dup_header_patterns.push("X-Missing".to_string());
        let matcher = RecordMatcher::compile(&expected).unwrap();
        assert_eq!(
            engine().check_record(&expected, &matcher, &record("/a", "", PRIMARY)),
            Err(Failure::HeaderMissing {
                pattern: "X-Missing".to_string()
            })
        );
    }

    #[test]
    fn test_body_pattern_spans_lines() {
        let expected = case("/a", "^<id>.*</id>$", DestinationMode::Default);
        let matcher = RecordMatcher::compile(&expected).unwrap();
        let multi_line = record("/a", "<req>\n<id>4\n2</id>\n</req>", PRIMARY);
        assert!(engine().check_record(&expected, &matcher, &multi_line).is_ok());

        let other = record("/a", "<req/>", PRIMARY);
        assert!(matches!(
            engine().check_record(&expected, &matcher, &other),
            Err(Failure::BodyMismatch { .. })
        ));
    }

    #[test]
    fn test_path_must_match_exactly() {
        let expected = case("/a", "", DestinationMode::Default);
        let matcher = RecordMatcher::compile(&expected).unwrap();
        assert!(matches!(
            engine().check_record(&expected, &matcher, &record("/a?x=1", "", PRIMARY)),
            Err(Failure::PathMismatch { .. })
        ));
    }

    #[test]
    fn test_response_body_compared_after_trailing_whitespace() {
        let mut expected = case("", "", DestinationMode::Default);
        expected.expected_response_body = "proxied".to_string();
        assert!(engine().check_response(&expected, &response("proxied\r\n", 5)).is_ok());
        assert!(matches!(
            engine().check_response(&expected, &response("other", 5)),
            Err(Failure::ResponseMismatch { .. })
        ));
    }

    #[test_case(1498, false ; "just below window")]
    #[test_case(1499, true ; "lower bound")]
    #[test_case(1500, true ; "configured delay")]
    #[test_case(1549, true ; "inside upper slack")]
    #[test_case(1551, true ; "upper bound")]
    #[test_case(1552, false ; "just above window")]
    fn test_sleep_marker_timing_window(elapsed_ms: u64, passes: bool) {
        let mut expected = case("", "", DestinationMode::Default);
        expected.request_path = "/dup/SLEEP/x".to_string();
        let result = engine().check_response(&expected, &response("", elapsed_ms));
        assert_eq!(result.is_ok(), passes, "{:?}", result);
    }

    #[test]
    fn test_timing_ignored_without_marker() {
        let expected = case("", "", DestinationMode::Default);
        assert!(engine().check_response(&expected, &response("", 9000)).is_ok());
    }

    #[tokio::test]
    async fn test_invalid_pattern_is_harness_error() {
        let (mut queue, _tx) = queue_with(vec![]);
        let err = engine()
            .verify(&case("/a", "(unclosed", DestinationMode::Default), &response("", 1), &mut queue)
            .await
            .unwrap_err();
        assert!(matches!(err, E2eError::InvalidPattern { .. }));
    }

    #[test]
    fn test_lookaround_and_backreference_are_not_supported() {
        for pattern in ["(?=<id>)", "(a)\\1"] {
            let expected = case("/a", pattern, DestinationMode::Default);
            assert!(matches!(
                RecordMatcher::compile(&expected),
                Err(E2eError::InvalidPattern { .. })
            ));
        }
    }
}
