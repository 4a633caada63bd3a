//! Line-by-line classification of engine output.
//!
//! The [`Classifier`] is fed one line at a time and answers with the
//! [`Report`]s that line completes. A crash banner opens a finding block;
//! following lines are appended to it until libFuzzer reports where it
//! wrote the crashing input. Engines that keep fuzzing after a report
//! (`halt_on_error=0`, Jazzer's `--keep_going`) never write that line, so
//! the next banner or status line closes the block as well, as does the
//! end of the stream. Only the open block is ever buffered, and its log
//! is capped at [`MAX_FINDING_LOG_LINES`].

use crate::finding::{ErrorType, Finding, name_for_input, name_for_report};
use crate::metrics::{FuzzingMetric, MetricsTracker, StatsLine, parse_stats_line};
use crate::stacktrace::{is_frame_line, parse_frame};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

/// Default minimum spacing between two emitted metric samples.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(1);

/// Lines kept in the log of one finding. Later lines of the block are
/// still reported as [`Report::Log`].
pub const MAX_FINDING_LOG_LINES: usize = 1000;

/// Structured events derived from the engine output.
#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    Finding(Box<Finding>),
    Metric(FuzzingMetric),
    /// Any line that is not a status line, in output order.
    Log(String),
}

static RUNTIME_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\S+ runtime error: (?P<error_type>[^:]+)").expect("runtime error pattern is valid")
});

static SANITIZER_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"==\d+==\s*(ERROR|WARNING):.*Sanitizer:\s(?P<error_type>.+)")
        .expect("sanitizer error pattern is valid")
});

static LIBFUZZER_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"==\d+==\s*ERROR: libFuzzer: (?P<error_type>.+)")
        .expect("libFuzzer error pattern is valid")
});

static JAVA_EXCEPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^== Java Exception: (?P<class>[^:\s]+)(?::\s*(?P<msg>.*))?")
        .expect("java exception pattern is valid")
});

static FATAL_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"==\d+==.*Sanitizer.*fatal error\.").expect("fatal error pattern is valid")
});

static TEST_UNIT_WRITTEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Test unit written to (?P<path>\S+)").expect("test unit pattern is valid")
});

/// Recognizes the first line of a finding.
pub fn parse_banner(line: &str) -> Option<Finding> {
    if let Some(caps) = RUNTIME_ERROR.captures(line) {
        return Some(Finding::new(
            ErrorType::RuntimeError,
            format!("undefined behavior: {}", &caps["error_type"]),
            line.to_string(),
        ));
    }
    if let Some(caps) = SANITIZER_ERROR
        .captures(line)
        .or_else(|| LIBFUZZER_ERROR.captures(line))
    {
        return Some(Finding::new(
            ErrorType::Crash,
            caps["error_type"].trim_end(),
            line.to_string(),
        ));
    }
    if let Some(caps) = JAVA_EXCEPTION.captures(line) {
        let class = &caps["class"];
        let msg = caps.name("msg").map(|m| m.as_str()).unwrap_or_default();
        let short_class = class.rsplit('.').next().unwrap_or(class);
        let details = if short_class.starts_with("FuzzerSecurityIssue") {
            format!("Security Issue: {msg}")
        } else if msg.is_empty() {
            class.to_string()
        } else {
            format!("{class}: {msg}")
        };
        return Some(Finding::new(ErrorType::Crash, details, line.to_string()));
    }
    if FATAL_ERROR.is_match(line) {
        return Some(Finding::new(ErrorType::Crash, "", line.to_string()));
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TraceState {
    NotStarted,
    InTrace,
    Done,
}

#[derive(Debug)]
struct OpenBlock {
    finding: Finding,
    trace: TraceState,
}

impl OpenBlock {
    fn append(&mut self, line: &str) {
        if self.finding.logs.len() >= MAX_FINDING_LOG_LINES {
            return;
        }
        self.finding.logs.push(line.to_string());
        if is_frame_line(line) {
            match self.trace {
                TraceState::NotStarted | TraceState::InTrace => {
                    self.trace = TraceState::InTrace;
                    if let Some(frame) = parse_frame(line) {
                        self.finding.stack_trace.push(frame);
                    }
                }
                TraceState::Done => {}
            }
        } else if self.trace == TraceState::InTrace {
            self.trace = TraceState::Done;
        }
    }
}

#[derive(Debug)]
pub struct Classifier {
    fuzz_test: String,
    metrics_interval: Duration,
    tracker: MetricsTracker,
    last_emitted: Option<DateTime<Utc>>,
    pending_metric: Option<FuzzingMetric>,
    open: Option<OpenBlock>,
}

impl Classifier {
    pub fn new(fuzz_test: impl Into<String>) -> Self {
        Self {
            fuzz_test: fuzz_test.into(),
            metrics_interval: DEFAULT_METRICS_INTERVAL,
            tracker: MetricsTracker::new(),
            last_emitted: None,
            pending_metric: None,
            open: None,
        }
    }

    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    pub fn has_open_finding(&self) -> bool {
        self.open.is_some()
    }

    pub fn push_line(&mut self, line: &str) -> Vec<Report> {
        self.push_line_at(line, Utc::now())
    }

    /// Like [`push_line`](Self::push_line) with an explicit clock, so
    /// metric throttling is deterministic.
    pub fn push_line_at(&mut self, line: &str, now: DateTime<Utc>) -> Vec<Report> {
        let mut reports = Vec::new();

        if let Some(stats) = parse_stats_line(line) {
            // the engine is fuzzing again, so the open report is complete
            if let Some(block) = self.open.take() {
                reports.push(self.close(block, None));
            }
            if let Some(metric) = self.observe(stats, now) {
                reports.push(Report::Metric(metric));
            }
            return reports;
        }

        if let Some(finding) = parse_banner(line) {
            if let Some(block) = self.open.take() {
                reports.push(self.close(block, None));
            }
            debug!("Finding reported: {}", finding.details);
            self.open = Some(OpenBlock {
                finding,
                trace: TraceState::NotStarted,
            });
            reports.push(Report::Log(line.to_string()));
            return reports;
        }

        reports.push(Report::Log(line.to_string()));
        if let Some(block) = self.open.as_mut() {
            block.append(line);
            if let Some(caps) = TEST_UNIT_WRITTEN.captures(line) {
                let input = PathBuf::from(&caps["path"]);
                if let Some(block) = self.open.take() {
                    reports.push(self.close(block, Some(input)));
                }
            }
        }
        reports
    }

    /// Feeds the tracker and returns the sample if it is due.
    fn observe(&mut self, stats: StatsLine, now: DateTime<Utc>) -> Option<FuzzingMetric> {
        let metric = self.tracker.observe(stats, now);
        let due = self.last_emitted.is_none_or(|last| {
            (now - last)
                .to_std()
                .is_ok_and(|elapsed| elapsed >= self.metrics_interval)
        });
        if due {
            self.last_emitted = Some(now);
            self.pending_metric = None;
            Some(metric)
        } else {
            self.pending_metric = Some(metric);
            None
        }
    }

    /// Flushes the last unreported metric sample and finalizes a finding
    /// still open at the end of the stream.
    pub fn finish(&mut self) -> Vec<Report> {
        let mut reports = Vec::new();
        if let Some(metric) = self.pending_metric.take() {
            reports.push(Report::Metric(metric));
        }
        if let Some(block) = self.open.take() {
            reports.push(self.close(block, None));
        }
        reports
    }

    fn close(&self, block: OpenBlock, input: Option<PathBuf>) -> Report {
        let mut finding = block.finding;
        finding.fuzz_test = self.fuzz_test.clone();

        let content = input.as_deref().and_then(|path| fs::read(path).ok());
        finding.name = match &content {
            Some(bytes) => name_for_input(bytes),
            None => name_for_report(&finding.details, finding.stack_trace.first()),
        };
        finding.input_file = input;
        Report::Finding(Box::new(finding))
    }
}
