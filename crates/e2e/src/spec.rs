//! Section-delimited request files (tee and dup layouts)
//!
//! A spec file is a sequence of sections, each closed by a sentinel line
//! such as `==DESC==`. Two wire variants exist: the original "tee" layout
//! and the "dup" layout, which adds a section of header patterns. Both are
//! read by the same forward scan, driven by a [`Schema`].

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{E2eError, E2eResult};

/// Value of the destination field selecting MULTI mode
pub const MULTI_DESTINATION: &str = "MULTI";

/// Wire variant of a spec file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecFormat {
    Tee,
    Dup,
}

/// Variant selection: forced, or detected from the file content
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatChoice {
    #[default]
    Auto,
    Tee,
    Dup,
}

/// Field a section feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Description,
    RequestPath,
    RequestBody,
    DupPath,
    DupHeaders,
    DupBody,
    ResponseBody,
    Destination,
}

impl Field {
    /// List-valued fields keep one entry per line instead of being flattened
    pub fn is_list(self) -> bool {
        matches!(self, Field::DupHeaders)
    }
}

/// One section: the lines read up to `sentinel` feed `field`.
/// `None` marks the preamble before the first sentinel, which is discarded.
#[derive(Debug, Clone, Copy)]
pub struct Section {
    pub sentinel: &'static str,
    pub field: Option<Field>,
}

const fn section(sentinel: &'static str, field: Option<Field>) -> Section {
    Section { sentinel, field }
}

/// Ordered section layout of one wire variant
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    pub format: SpecFormat,
    pub sections: &'static [Section],
}

pub const TEE_SCHEMA: Schema = Schema {
    format: SpecFormat::Tee,
    sections: &[
        section("==DESC==", None),
        section("==HEADER==", Some(Field::Description)),
        section("==BODY==", Some(Field::RequestPath)),
        section("==THEADER==", Some(Field::RequestBody)),
        section("==TBODY==", Some(Field::DupPath)),
        section("==RBODY==", Some(Field::DupBody)),
        section("==DEST==", Some(Field::ResponseBody)),
        section("==EOF==", Some(Field::Destination)),
    ],
};

pub const DUP_SCHEMA: Schema = Schema {
    format: SpecFormat::Dup,
    sections: &[
        section("==DESC==", None),
        section("==REQURL==", Some(Field::Description)),
        section("==REQBODY==", Some(Field::RequestPath)),
        section("==DUPURL==", Some(Field::RequestBody)),
        section("==DUPHEADER==", Some(Field::DupPath)),
        section("==DUPBODY==", Some(Field::DupHeaders)),
        section("==RESPBODY==", Some(Field::DupBody)),
        section("==DUPDESTPORT==", Some(Field::ResponseBody)),
        section("==EOF==", Some(Field::Destination)),
    ],
};

impl Schema {
    pub fn for_format(format: SpecFormat) -> Self {
        match format {
            SpecFormat::Tee => TEE_SCHEMA,
            SpecFormat::Dup => DUP_SCHEMA,
        }
    }

    /// Pick the layout for `content`: a dup-only sentinel anywhere selects `Dup`
    pub fn detect(content: &str) -> Self {
        let is_dup = content.lines().map(str::trim).any(|line| {
            DUP_SCHEMA
                .sections
                .iter()
                .filter(|s| !TEE_SCHEMA.sections.iter().any(|t| t.sentinel == s.sentinel))
                .any(|s| s.sentinel == line)
        });
        if is_dup {
            DUP_SCHEMA
        } else {
            TEE_SCHEMA
        }
    }

    pub fn resolve(choice: FormatChoice, content: &str) -> Self {
        match choice {
            FormatChoice::Auto => Self::detect(content),
            FormatChoice::Tee => TEE_SCHEMA,
            FormatChoice::Dup => DUP_SCHEMA,
        }
    }
}

/// Where the duplicate is expected to land
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationMode {
    /// Primary capture port
    Default,
    /// Secondary capture port
    Secondary,
    /// One duplicate on each port
    Multi,
}

impl DestinationMode {
    pub fn from_field(value: &str) -> Self {
        match value {
            "" => DestinationMode::Default,
            MULTI_DESTINATION => DestinationMode::Multi,
            _ => DestinationMode::Secondary,
        }
    }
}

/// A parsed test case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub format: SpecFormat,
    pub description: String,
    pub request_path: String,
    pub request_body: String,
    /// Empty means no duplicate may arrive
    pub expected_dup_path: String,
    pub expected_dup_header_patterns: Vec<String>,
    pub expected_dup_body_pattern: String,
    /// Empty means the original response body is not checked
    pub expected_response_body: String,
    /// Raw destination field
    pub destination: String,
    pub destination_mode: DestinationMode,
}

impl TestCase {
    /// Parse a spec from text. `origin` names the source in errors.
    pub fn parse(content: &str, origin: &str, choice: FormatChoice) -> E2eResult<Self> {
        let schema = Schema::resolve(choice, content);
        let mut lines = content.lines().map(str::trim);

        let mut case = TestCase {
            format: schema.format,
            description: String::new(),
            request_path: String::new(),
            request_body: String::new(),
            expected_dup_path: String::new(),
            expected_dup_header_patterns: Vec::new(),
            expected_dup_body_pattern: String::new(),
            expected_response_body: String::new(),
            destination: String::new(),
            destination_mode: DestinationMode::Default,
        };

        for section in schema.sections {
            let consumed = consume(&mut lines, section.sentinel, origin)?;
            let Some(field) = section.field else {
                continue;
            };
            if field.is_list() {
                case.set_list(
                    field,
                    consumed
                        .into_iter()
                        .filter(|l| !l.is_empty())
                        .map(str::to_string)
                        .collect(),
                );
            } else {
                case.set_text(field, consumed.concat());
            }
        }

        case.destination_mode = DestinationMode::from_field(&case.destination);
        Ok(case)
    }

    /// Parse a spec file
    pub fn from_file(path: &Path, choice: FormatChoice) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content, &path.display().to_string(), choice)
    }

    /// Whether any duplicate delivery is expected
    pub fn expects_duplicate(&self) -> bool {
        !self.expected_dup_path.is_empty()
    }

    fn set_text(&mut self, field: Field, value: String) {
        match field {
            Field::Description => self.description = value,
            Field::RequestPath => self.request_path = value,
            Field::RequestBody => self.request_body = value,
            Field::DupPath => self.expected_dup_path = value,
            Field::DupBody => self.expected_dup_body_pattern = value,
            Field::ResponseBody => self.expected_response_body = value,
            Field::Destination => self.destination = value,
            Field::DupHeaders => self.expected_dup_header_patterns = vec![value],
        }
    }

    fn set_list(&mut self, field: Field, values: Vec<String>) {
        if field == Field::DupHeaders {
            self.expected_dup_header_patterns = values;
        }
    }
}

/// Read lines up to `sentinel`, returning the lines before it.
fn consume<'a, I>(lines: &mut I, sentinel: &'static str, origin: &str) -> E2eResult<Vec<&'a str>>
where
    I: Iterator<Item = &'a str>,
{
    let mut consumed = Vec::new();
    for line in lines.by_ref() {
        if line == sentinel {
            return Ok(consumed);
        }
        if looks_like_sentinel(line) {
            return Err(E2eError::MalformedSpec {
                origin: origin.to_string(),
                expected: sentinel,
                found: line.to_string(),
            });
        }
        consumed.push(line);
    }
    Err(E2eError::MalformedSpec {
        origin: origin.to_string(),
        expected: sentinel,
        found: "end of input".to_string(),
    })
}

/// `==NAME==` with an upper-case name
fn looks_like_sentinel(line: &str) -> bool {
    line.len() > 4
        && line.starts_with("==")
        && line.ends_with("==")
        && line[2..line.len() - 2]
            .chars()
            .all(|c| c.is_ascii_uppercase() || c == '_')
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  desc: {}", self.description)?;
        writeln!(f, "  path: {}", self.request_path)?;
        writeln!(f, "  body: {}", self.request_body)?;
        writeln!(f, "  response body: {}", self.expected_response_body)?;
        writeln!(f, "  dup path: {}", self.expected_dup_path)?;
        for pattern in &self.expected_dup_header_patterns {
            writeln!(f, "  dup header: {}", pattern)?;
        }
        writeln!(f, "  dup body: {}", self.expected_dup_body_pattern)?;
        write!(
            f,
            "  destination: {:?} ({})",
            self.destination_mode, self.destination
        )
    }
}
