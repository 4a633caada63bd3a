//! Fuzzing statistics parsed from the engine's periodic status lines.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// One sample of the engine's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuzzingMetric {
    pub timestamp: DateTime<Utc>,
    pub total_executions: u64,
    pub executions_per_second: u64,
    pub features: i32,
    pub edges: i32,
    pub corpus_size: i32,
    pub seconds_since_last_feature: u64,
    pub seconds_since_last_edge: u64,
}

/// The raw numbers of a libFuzzer status line such as
/// `#4096	pulse  cov: 43 ft: 61 corp: 9/123b lim: 43 exec/s: 2048 rss: 31Mb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsLine {
    pub total_executions: u64,
    pub executions_per_second: u64,
    pub edges: i32,
    pub features: i32,
    pub corpus_size: i32,
}

static STATS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^#(?P<execs>\d+)\s+(?P<event>[A-Za-z]+)\s+cov:\s*(?P<cov>\d+)\s+ft:\s*(?P<ft>\d+)\s+corp:\s*(?P<corp>\d+)/\S+(?:.*?\sexec/s:\s*(?P<eps>\d+))?",
    )
    .expect("stats line pattern is valid")
});

/// Parses a libFuzzer (or Jazzer) status line.
pub fn parse_stats_line(line: &str) -> Option<StatsLine> {
    let caps = STATS_LINE.captures(line)?;
    Some(StatsLine {
        total_executions: caps["execs"].parse().ok()?,
        executions_per_second: caps
            .name("eps")
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0),
        edges: caps["cov"].parse().ok()?,
        features: caps["ft"].parse().ok()?,
        corpus_size: caps["corp"].parse().ok()?,
    })
}

/// Turns status lines into [`FuzzingMetric`]s, remembering when coverage
/// last grew.
#[derive(Debug, Default)]
pub struct MetricsTracker {
    last: Option<StatsLine>,
    last_feature_at: Option<DateTime<Utc>>,
    last_edge_at: Option<DateTime<Utc>>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, stats: StatsLine, now: DateTime<Utc>) -> FuzzingMetric {
        let (prev_features, prev_edges) = self
            .last
            .map(|s| (s.features, s.edges))
            .unwrap_or((-1, -1));
        if stats.features > prev_features || self.last_feature_at.is_none() {
            self.last_feature_at = Some(now);
        }
        if stats.edges > prev_edges || self.last_edge_at.is_none() {
            self.last_edge_at = Some(now);
        }
        self.last = Some(stats);

        FuzzingMetric {
            timestamp: now,
            total_executions: stats.total_executions,
            executions_per_second: stats.executions_per_second,
            features: stats.features,
            edges: stats.edges,
            corpus_size: stats.corpus_size,
            seconds_since_last_feature: seconds_between(self.last_feature_at, now),
            seconds_since_last_edge: seconds_between(self.last_edge_at, now),
        }
    }
}

fn seconds_between(earlier: Option<DateTime<Utc>>, now: DateTime<Utc>) -> u64 {
    earlier
        .map(|t| (now - t).num_seconds().max(0) as u64)
        .unwrap_or(0)
}

/// End-of-run numbers shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PerformanceSummary {
    pub duration_secs: u64,
    pub total_executions: u64,
    pub average_executions_per_second: u64,
    pub corpus_entries: i32,
    pub features: i32,
    pub edges: i32,
    pub findings: usize,
    pub new_findings: usize,
}

impl PerformanceSummary {
    /// Summarizes a run from its first and last samples. With a single
    /// sample the duration is zero and the engine's own rate is used.
    pub fn from_samples(
        first: &FuzzingMetric,
        last: &FuzzingMetric,
        findings: usize,
        new_findings: usize,
    ) -> Self {
        let duration_secs = (last.timestamp - first.timestamp).num_seconds().max(0) as u64;
        let average_executions_per_second = if duration_secs == 0 {
            last.executions_per_second
        } else {
            last.total_executions / duration_secs
        };
        Self {
            duration_secs,
            total_executions: last.total_executions,
            average_executions_per_second,
            corpus_entries: last.corpus_size,
            features: last.features,
            edges: last.edges,
            findings,
            new_findings,
        }
    }
}

impl fmt::Display for PerformanceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Execution time:      {}s", self.duration_secs)?;
        writeln!(f, "Executions:          {}", self.total_executions)?;
        writeln!(
            f,
            "Average exec/s:      {}",
            self.average_executions_per_second
        )?;
        writeln!(f, "Corpus entries:      {}", self.corpus_entries)?;
        writeln!(f, "Features:            {}", self.features)?;
        writeln!(f, "Edges:               {}", self.edges)?;
        write!(
            f,
            "Findings:            {} ({} new)",
            self.findings, self.new_findings
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn parses_new_and_pulse_lines() {
        let stats = parse_stats_line(
            "#4096\tpulse  cov: 43 ft: 61 corp: 9/123b lim: 43 exec/s: 2048 rss: 31Mb",
        )
        .unwrap();
        assert_eq!(
            stats,
            StatsLine {
                total_executions: 4096,
                executions_per_second: 2048,
                edges: 43,
                features: 61,
                corpus_size: 9,
            }
        );

        let new = parse_stats_line("#12\tNEW    cov: 5 ft: 6 corp: 2/3b lim: 4 exec/s: 0 rss: 30Mb L: 2/2 MS: 1 ChangeBit-")
            .unwrap();
        assert_eq!(new.total_executions, 12);
        assert_eq!(new.corpus_size, 2);
    }

    #[test]
    fn exec_rate_is_optional() {
        let stats = parse_stats_line("#2\tINITED cov: 3 ft: 3 corp: 1/1b").unwrap();
        assert_eq!(stats.executions_per_second, 0);
    }

    #[test]
    fn ignores_other_lines() {
        assert!(parse_stats_line("INFO: Seed: 1234").is_none());
        assert!(parse_stats_line("#0 0x4f3a2b in parse_header /src/parser.c:42").is_none());
        assert!(parse_stats_line("Done 1000 runs in 2 second(s)").is_none());
    }

    #[test]
    fn tracks_stagnation() {
        let mut tracker = MetricsTracker::new();
        let mut stats = parse_stats_line("#2\tINITED cov: 3 ft: 3 corp: 1/1b exec/s: 0").unwrap();
        let first = tracker.observe(stats, at(0));
        assert_eq!(first.seconds_since_last_feature, 0);

        stats.features = 5;
        stats.total_executions = 100;
        let second = tracker.observe(stats, at(10));
        assert_eq!(second.seconds_since_last_feature, 0);
        assert_eq!(second.seconds_since_last_edge, 10);

        stats.total_executions = 5000;
        let third = tracker.observe(stats, at(25));
        assert_eq!(third.seconds_since_last_feature, 15);
        assert_eq!(third.seconds_since_last_edge, 25);
    }

    #[test]
    fn summary_uses_first_and_last_sample() {
        let mut tracker = MetricsTracker::new();
        let first = tracker.observe(
            parse_stats_line("#2\tINITED cov: 3 ft: 3 corp: 1/1b exec/s: 0").unwrap(),
            at(0),
        );
        let last = tracker.observe(
            parse_stats_line("#20000\tDONE   cov: 9 ft: 14 corp: 4/20b exec/s: 1900 rss: 31Mb")
                .unwrap(),
            at(10),
        );
        let summary = PerformanceSummary::from_samples(&first, &last, 2, 1);
        assert_eq!(summary.duration_secs, 10);
        assert_eq!(summary.average_executions_per_second, 2000);
        assert_eq!(summary.corpus_entries, 4);
        assert!(summary.to_string().contains("Findings:            2 (1 new)"));
    }
}
