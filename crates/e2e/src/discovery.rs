//! Test file discovery: glob resolution under the spec directory

use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::debug;

use crate::error::{E2eError, E2eResult};

/// Translate a shell-style glob into an anchored regex.
///
/// `*` and `?` stay inside one path component, `**` crosses components.
pub fn glob_to_regex(pattern: &str) -> E2eResult<Regex> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                // `**/` also matches zero directories
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|source| E2eError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Resolve `pattern` relative to `dir`, sorted lexicographically on path.
pub fn find_spec_files(dir: &Path, pattern: &str) -> E2eResult<Vec<PathBuf>> {
    let matcher = glob_to_regex(pattern)?;
    let recursive = pattern.contains('/') || pattern.contains("**");

    let mut walker = walkdir::WalkDir::new(dir).min_depth(1);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut files: Vec<PathBuf> = walker
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .strip_prefix(dir)
                .ok()
                .map(|rel| matcher.is_match(&rel.to_string_lossy().replace('\\', "/")))
                .unwrap_or(false)
        })
        .map(|e| e.into_path())
        .collect();

    files.sort();
    debug!("{} file(s) match {} in {}", files.len(), pattern, dir.display());
    Ok(files)
}
