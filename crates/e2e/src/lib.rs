//! duptest E2E harness
//!
//! Black-box verification of an HTTP-duplicating reverse proxy:
//! - Parses section-delimited spec files (tee and dup layouts)
//! - Runs two capture servers standing in for duplication targets
//! - Plays the original request against the proxy
//! - Drains captured duplicates and checks them against regex expectations
//!
//! Patterns use the [`regex`](https://docs.rs/regex) crate syntax, which has
//! no lookaround and no backreferences. A request file relying on either
//! fails with [`E2eError::InvalidPattern`] and stops the run.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TestRunner (driver)                     │
//! │    ├── discover() -> sorted spec files                      │
//! │    ├── start_captures() -> CaptureSet                       │
//! │    ├── RequestPlayer::play(case) -> OriginalResponse        │
//! │    └── AssertionEngine::verify(case, response, queue)       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CaptureSet                                                 │
//! │    ├── primary   CaptureServer ──┐                          │
//! │    ├── secondary CaptureServer ──┴──> CaptureQueue (mpsc)   │
//! │    └── queue.recv_timeout(wait) -> Option<CaptureRecord>    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod assert;
pub mod capture;
pub mod config;
pub mod discovery;
pub mod error;
pub mod player;
pub mod runner;
pub mod spec;

pub use assert::{AssertionEngine, Failure, Verification};
pub use capture::{CaptureRecord, CaptureServer, CaptureSet};
pub use config::HarnessConfig;
pub use error::{E2eError, E2eResult};
pub use runner::{TestResult, TestRunner, TestSuiteResult};
pub use spec::{DestinationMode, FormatChoice, TestCase};
