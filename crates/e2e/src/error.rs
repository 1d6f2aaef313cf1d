//! Error types for the duplication harness
//!
//! `E2eError` covers everything that stops the harness itself (bad test
//! files, unreachable proxy, capture servers that cannot bind). Wrong proxy
//! behaviour is reported separately through [`crate::assert::Failure`].

use std::net::SocketAddr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Malformed spec {origin}: expected {expected}, found {found}")]
    MalformedSpec {
        origin: String,
        expected: &'static str,
        found: String,
    },

    #[error("Invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Transport error for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Capture server '{name}' could not bind {addr}: {source}")]
    CaptureBind {
        name: String,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Capture server at {0} not accepting connections after {1} attempts")]
    CaptureStartup(SocketAddr, usize),

    #[error("No files matching {0}")]
    NoTestFiles(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl E2eError {
    /// Process exit status for a run that ended with this error.
    ///
    /// `1` is reserved for a failing test, `3` for an empty test selection,
    /// everything that breaks the harness itself exits with `2`.
    pub fn exit_code(&self) -> i32 {
        match self {
            E2eError::Transport { .. } => 1,
            E2eError::NoTestFiles(_) => 3,
            _ => 2,
        }
    }
}

pub type E2eResult<T> = Result<T, E2eError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_distinguish_empty_selection_from_setup_failure() {
        let empty = E2eError::NoTestFiles("data/*.req".to_string());
        let setup = E2eError::Config("secondary port equals primary port".to_string());

        assert_eq!(empty.exit_code(), 3);
        assert_eq!(setup.exit_code(), 2);
    }

    #[test]
    fn test_malformed_spec_names_missing_sentinel() {
        let err = E2eError::MalformedSpec {
            origin: "data/broken.req".to_string(),
            expected: "==EOF==",
            found: "end of input".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("==EOF=="));
        assert!(message.contains("data/broken.req"));
    }
}
