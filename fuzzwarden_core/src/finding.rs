//! The finding record persisted for every crash, leak or sanitizer report.

use crate::stacktrace::StackFrame;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

/// Serialized in upper case so records stay readable by tools that
/// expect the protobuf enum names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    #[default]
    UnknownError,
    CompilationError,
    Crash,
    Warning,
    RuntimeError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeverityLevel {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Severity {
    // the established JSON name for the level
    #[serde(rename = "description", default, skip_serializing_if = "Option::is_none")]
    pub level: Option<SeverityLevel>,
    #[serde(default, skip_serializing_if = "is_zero_score")]
    pub score: f32,
}

fn is_zero_score(score: &f32) -> bool {
    *score == 0.0
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExternalDetail {
    #[serde(default, skip_serializing_if = "is_zero_id")]
    pub id: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

fn is_zero_id(id: &i64) -> bool {
    *id == 0
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Link {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
}

/// Background information about a class of bug, such as a heap buffer
/// overflow, attached to findings of that class.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mitigation: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owasp_details: Option<ExternalDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwe_details: Option<ExternalDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "type", default)]
    pub error_type: ErrorType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub more_details: Option<ErrorDetails>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack_trace: Vec<StackFrame>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fuzz_test: String,

    /// Where the crashing input was copied in the seed corpus. Only known
    /// to the process that saved the finding.
    #[serde(skip)]
    pub seed_path: Option<PathBuf>,
}

impl Finding {
    pub fn new(error_type: ErrorType, details: impl Into<String>, first_log: String) -> Self {
        Self {
            name: String::new(),
            error_type,
            input_data: Vec::new(),
            logs: vec![first_log],
            details: details.into(),
            more_details: None,
            created_at: Utc::now(),
            input_file: None,
            stack_trace: Vec::new(),
            fuzz_test: String::new(),
            seed_path: None,
        }
    }

    /// `[name] <error type> in <function> (<location>)`
    pub fn short_description_with_name(&self) -> String {
        format!("[{}] {}", self.name, self.short_description())
    }

    pub fn short_description(&self) -> String {
        self.short_description_columns().join(" ")
    }

    /// The bug class, followed by the innermost user frame if known.
    pub fn short_description_columns(&self) -> Vec<String> {
        let error_type = match self.error_type {
            ErrorType::Crash
                if self.details == "detected memory leaks"
                    || self.details.contains("Security Issue:") =>
            {
                self.details.clone()
            }
            ErrorType::Crash => self
                .details
                .split(' ')
                .next()
                .unwrap_or_default()
                .replace('-', " "),
            ErrorType::RuntimeError => self
                .details
                .split(':')
                .next()
                .unwrap_or_default()
                .to_string(),
            _ => self.details.clone(),
        };

        let mut columns = vec![error_type];
        if let Some(frame) = self.stack_trace.first() {
            columns.push(format!("in {} ({})", frame.function, frame.location()));
        }
        columns
    }

    /// Attaches the entry of `catalog` whose name matches this finding's
    /// bug class. Without a match, a stub carrying the finding's name and
    /// any previously known severity is attached instead.
    pub fn enhance_with_error_details(&mut self, catalog: Option<&[ErrorDetails]>) {
        let Some(catalog) = catalog else {
            return;
        };
        let class = self
            .short_description_columns()
            .into_iter()
            .next()
            .unwrap_or_default();

        let matched = catalog
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(&class))
            .cloned();

        let details = match matched {
            Some(details) => details,
            None => {
                info!("No error details found for finding {}", self.name);
                ErrorDetails {
                    name: self.name.clone(),
                    severity: self
                        .more_details
                        .as_ref()
                        .and_then(|d| d.severity.clone())
                        .or_else(|| Some(Severity::default())),
                    owasp_details: Some(ExternalDetail::default()),
                    cwe_details: Some(ExternalDetail::default()),
                    ..Default::default()
                }
            }
        };
        self.more_details = Some(details);
    }
}

/// Length of the hex prefix of the md5 digest used as finding name.
const NAME_HEX_LEN: usize = 16;

/// Stable name of a finding triggered by `input`.
pub fn name_for_input(input: &[u8]) -> String {
    let digest = format!("{:x}", md5::compute(input));
    digest[..NAME_HEX_LEN].to_string()
}

/// Name for findings without a readable crashing input, e.g. leaks
/// reported at exit. Derived from the bug class and crash site.
pub fn name_for_report(details: &str, top_frame: Option<&StackFrame>) -> String {
    let mut key = details.to_string();
    if let Some(frame) = top_frame {
        key.push('\n');
        key.push_str(&frame.function);
        key.push('\n');
        key.push_str(&frame.location());
    }
    name_for_input(key.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> StackFrame {
        StackFrame {
            source_file: "src/explore_me.cpp".to_string(),
            function: "exploreMe".to_string(),
            line: 18,
            column: 11,
        }
    }

    #[test]
    fn crash_description_uses_first_word() {
        let mut finding = Finding::new(
            ErrorType::Crash,
            "heap-buffer-overflow on address 0x6020000",
            "==1==ERROR: AddressSanitizer: heap-buffer-overflow".to_string(),
        );
        finding.name = "a1b2c3d4e5f60718".to_string();
        finding.stack_trace.push(frame());
        assert_eq!(
            finding.short_description_with_name(),
            "[a1b2c3d4e5f60718] heap buffer overflow in exploreMe (src/explore_me.cpp:18:11)"
        );
    }

    #[test]
    fn leaks_and_security_issues_keep_full_details() {
        let leak = Finding::new(ErrorType::Crash, "detected memory leaks", String::new());
        assert_eq!(leak.short_description(), "detected memory leaks");

        let jazzer = Finding::new(
            ErrorType::Crash,
            "Security Issue: Remote Code Execution",
            String::new(),
        );
        assert_eq!(jazzer.short_description(), "Security Issue: Remote Code Execution");
    }

    #[test]
    fn runtime_error_description_stops_at_colon() {
        let ub = Finding::new(
            ErrorType::RuntimeError,
            "undefined behavior: signed integer overflow",
            String::new(),
        );
        assert_eq!(ub.short_description_columns(), vec!["undefined behavior"]);
    }

    #[test]
    fn json_uses_established_names() {
        let mut finding = Finding::new(ErrorType::RuntimeError, "undefined behavior: x", "l".into());
        finding.name = "n".to_string();
        let json = serde_json::to_value(&finding).unwrap();
        assert_eq!(json["type"], "RUNTIME_ERROR");
        assert!(json.get("input_file").is_none());
        assert!(json.get("stack_trace").is_none());
        assert!(json.get("seed_path").is_none());

        let back: Finding = serde_json::from_value(json).unwrap();
        assert_eq!(back.error_type, ErrorType::RuntimeError);
        assert_eq!(back.logs, vec!["l".to_string()]);
    }

    #[test]
    fn enhances_with_matching_details() {
        let mut finding = Finding::new(
            ErrorType::Crash,
            "heap-buffer-overflow on address",
            String::new(),
        );
        let catalog = vec![ErrorDetails {
            id: "heap_buffer_overflow".to_string(),
            name: "Heap Buffer Overflow".to_string(),
            severity: Some(Severity {
                level: Some(SeverityLevel::Critical),
                score: 9.0,
            }),
            ..Default::default()
        }];
        finding.enhance_with_error_details(Some(catalog.as_slice()));
        assert_eq!(
            finding.more_details.as_ref().unwrap().id,
            "heap_buffer_overflow"
        );
    }

    #[test]
    fn unmatched_details_keep_previous_severity() {
        let mut finding = Finding::new(ErrorType::Crash, "stack-overflow", String::new());
        finding.name = "deadbeef".to_string();
        finding.more_details = Some(ErrorDetails {
            severity: Some(Severity {
                level: Some(SeverityLevel::High),
                score: 7.5,
            }),
            ..Default::default()
        });
        finding.enhance_with_error_details(Some(&[][..]));
        let details = finding.more_details.unwrap();
        assert_eq!(details.name, "deadbeef");
        assert_eq!(details.severity.unwrap().level, Some(SeverityLevel::High));
    }

    #[test]
    fn no_catalog_leaves_finding_untouched() {
        let mut finding = Finding::new(ErrorType::Crash, "x", String::new());
        finding.enhance_with_error_details(None);
        assert!(finding.more_details.is_none());
    }

    #[test]
    fn names_are_content_derived() {
        let name = name_for_input(b"FUZZ");
        assert_eq!(name.len(), 16);
        assert_eq!(name, &format!("{:x}", md5::compute(b"FUZZ"))[..16]);
        assert_eq!(name, name_for_input(b"FUZZ"));
        assert_ne!(name, name_for_input(b"FUZZ\n"));

        let f = frame();
        assert_ne!(
            name_for_report("detected memory leaks", Some(&f)),
            name_for_report("detected memory leaks", None)
        );
    }
}
