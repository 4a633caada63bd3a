use crate::classifier::Report;
use crate::finding::{ErrorDetails, Finding};
use crate::metrics::{FuzzingMetric, PerformanceSummary};
use crate::store::{FindingStore, SaveOutcome, StoreError};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// A `ReportSink` receives the structured events of a run as they happen.
///
/// Sinks are invoked by the [`ReportHandler`] after a finding has been
/// persisted, so anything a sink sees is already on disk.
pub trait ReportSink: Send {
    /// Returns a static string identifying the sink in error messages.
    fn name(&self) -> &'static str;

    /// Called once per finding, new or already known.
    fn on_finding(&mut self, finding: &Finding, is_new: bool) -> Result<(), anyhow::Error>;

    /// Called for every metric sample emitted by the classifier.
    fn on_metric(&mut self, _metric: &FuzzingMetric) -> Result<(), anyhow::Error> {
        Ok(())
    }

    /// Called for every non-status output line of the engine.
    fn on_log(&mut self, _line: &str) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

/// Forwards everything to `tracing`: findings at info, engine output at
/// debug.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn name(&self) -> &'static str {
        "TracingSink"
    }

    fn on_finding(&mut self, finding: &Finding, is_new: bool) -> Result<(), anyhow::Error> {
        if is_new {
            info!("New finding: {}", finding.short_description_with_name());
        } else {
            info!(
                "Finding {} was already reported earlier",
                finding.short_description_with_name()
            );
        }
        Ok(())
    }

    fn on_metric(&mut self, metric: &FuzzingMetric) -> Result<(), anyhow::Error> {
        debug!(
            "execs: {} exec/s: {} edges: {} features: {} corpus: {}",
            metric.total_executions,
            metric.executions_per_second,
            metric.edges,
            metric.features,
            metric.corpus_size
        );
        Ok(())
    }

    fn on_log(&mut self, line: &str) -> Result<(), anyhow::Error> {
        debug!("{}", line);
        Ok(())
    }
}

/// Writes each finding as one line of JSON.
pub struct JsonSink<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> JsonSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> ReportSink for JsonSink<W> {
    fn name(&self) -> &'static str {
        "JsonSink"
    }

    fn on_finding(&mut self, finding: &Finding, _is_new: bool) -> Result<(), anyhow::Error> {
        serde_json::to_writer(&mut self.out, finding)?;
        writeln!(self.out)?;
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to persist finding: {0}")]
    Store(#[from] StoreError),
    #[error("Report sink '{sink}' failed: {source}")]
    Sink {
        sink: &'static str,
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ReportHandlerOptions {
    pub project_dir: PathBuf,
    /// Crashing inputs are copied here so later runs replay them.
    pub seed_corpus_dir: PathBuf,
    pub error_details: Option<Vec<ErrorDetails>>,
}

/// Persists findings and keeps the run's statistics.
pub struct ReportHandler {
    store: FindingStore,
    seed_corpus_dir: PathBuf,
    error_details: Option<Vec<ErrorDetails>>,
    sinks: Vec<Box<dyn ReportSink>>,
    findings: Vec<Finding>,
    new_findings: usize,
    first_metric: Option<FuzzingMetric>,
    last_metric: Option<FuzzingMetric>,
}

impl ReportHandler {
    pub fn new(options: ReportHandlerOptions) -> Self {
        Self {
            store: FindingStore::new(options.project_dir),
            seed_corpus_dir: options.seed_corpus_dir,
            error_details: options.error_details,
            sinks: Vec::new(),
            findings: Vec::new(),
            new_findings: 0,
            first_metric: None,
            last_metric: None,
        }
    }

    pub fn add_sink(&mut self, sink: Box<dyn ReportSink>) {
        self.sinks.push(sink);
    }

    pub fn handle(&mut self, report: Report) -> Result<(), ReportError> {
        match report {
            Report::Finding(finding) => self.handle_finding(*finding),
            Report::Metric(metric) => {
                self.notify(|sink| sink.on_metric(&metric))?;
                if self.first_metric.is_none() {
                    self.first_metric = Some(metric.clone());
                }
                self.last_metric = Some(metric);
                Ok(())
            }
            Report::Log(line) => self.notify(|sink| sink.on_log(&line)),
        }
    }

    fn handle_finding(&mut self, mut finding: Finding) -> Result<(), ReportError> {
        let is_new = !self.store.exists(&finding.name);
        if is_new {
            if finding.input_file.is_some() {
                self.store
                    .copy_input_file_and_update(&mut finding, &self.seed_corpus_dir)?;
            }
            finding.enhance_with_error_details(self.error_details.as_deref());
            if self.store.save(&finding)? == SaveOutcome::Saved {
                self.new_findings += 1;
            }
        }
        self.notify(|sink| sink.on_finding(&finding, is_new))?;
        self.findings.push(finding);
        Ok(())
    }

    fn notify<F>(&mut self, mut call: F) -> Result<(), ReportError>
    where
        F: FnMut(&mut dyn ReportSink) -> Result<(), anyhow::Error>,
    {
        for sink in self.sinks.iter_mut() {
            call(sink.as_mut()).map_err(|source| ReportError::Sink {
                sink: sink.name(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn has_findings(&self) -> bool {
        !self.findings.is_empty()
    }

    pub fn new_findings(&self) -> usize {
        self.new_findings
    }

    pub fn first_metric(&self) -> Option<&FuzzingMetric> {
        self.first_metric.as_ref()
    }

    pub fn last_metric(&self) -> Option<&FuzzingMetric> {
        self.last_metric.as_ref()
    }

    /// Summary of the run, or `None` if the engine never reported a
    /// status line. `corpus_entries` overrides the engine's in-memory
    /// corpus size with the number of files actually on disk.
    pub fn final_metrics(&self, corpus_entries: Option<usize>) -> Option<PerformanceSummary> {
        let (first, last) = self.first_metric.as_ref().zip(self.last_metric.as_ref())?;
        let mut summary =
            PerformanceSummary::from_samples(first, last, self.findings.len(), self.new_findings);
        if let Some(entries) = corpus_entries {
            summary.corpus_entries = i32::try_from(entries).unwrap_or(i32::MAX);
        }
        Some(summary)
    }

    pub fn print_final_metrics<W: Write>(
        &self,
        out: &mut W,
        corpus_entries: Option<usize>,
    ) -> io::Result<()> {
        match self.final_metrics(corpus_entries) {
            Some(summary) => writeln!(out, "{summary}"),
            None => Ok(()),
        }
    }

    /// Tells the user where new crashing inputs went.
    pub fn print_crashing_input_note<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let seeds: Vec<&Path> = self
            .findings
            .iter()
            .filter_map(|f| f.seed_path.as_deref())
            .collect();
        if seeds.is_empty() {
            return Ok(());
        }
        writeln!(
            out,
            "Note: The reproducing inputs have been copied to the seed corpus at:\n"
        )?;
        for seed in seeds {
            writeln!(out, "    {}", seed.display())?;
        }
        writeln!(
            out,
            "\nThey will be used as seed inputs for all future runs of the fuzz test."
        )
    }
}

/// Number of files below the given corpus directories. Missing
/// directories count as empty.
pub fn count_corpus_entries(dirs: &[PathBuf]) -> io::Result<usize> {
    let mut count = 0;
    let mut pending: Vec<PathBuf> = dirs.iter().filter(|d| d.is_dir()).cloned().collect();
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                count += 1;
            }
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Classifier;
    use crate::finding::ErrorType;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingSink {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl ReportSink for RecordingSink {
        fn name(&self) -> &'static str {
            "RecordingSink"
        }

        fn on_finding(&mut self, finding: &Finding, is_new: bool) -> Result<(), anyhow::Error> {
            self.events
                .lock()
                .unwrap()
                .push(format!("finding {} new={is_new}", finding.name));
            Ok(())
        }

        fn on_metric(&mut self, metric: &FuzzingMetric) -> Result<(), anyhow::Error> {
            self.events
                .lock()
                .unwrap()
                .push(format!("metric {}", metric.total_executions));
            Ok(())
        }
    }

    struct FailingSink;

    impl ReportSink for FailingSink {
        fn name(&self) -> &'static str {
            "FailingSink"
        }

        fn on_finding(&mut self, _finding: &Finding, _is_new: bool) -> Result<(), anyhow::Error> {
            Err(anyhow::anyhow!("disk full"))
        }
    }

    fn handler(project: &Path) -> ReportHandler {
        ReportHandler::new(ReportHandlerOptions {
            project_dir: project.to_path_buf(),
            seed_corpus_dir: project.join("seeds"),
            error_details: None,
        })
    }

    fn crash_report(input: &Path) -> Vec<Report> {
        let mut classifier = Classifier::new("fuzz_me");
        let written = format!("Test unit written to {}", input.display());
        let mut reports = Vec::new();
        for line in [
            "#2\tINITED cov: 3 ft: 3 corp: 1/1b exec/s: 0",
            "==9==ERROR: AddressSanitizer: SEGV on unknown address 0x000000000000",
            written.as_str(),
        ] {
            reports.extend(classifier.push_line(line));
        }
        reports.extend(classifier.finish());
        reports
    }

    #[test]
    fn persists_new_findings_once() {
        let project = tempfile::tempdir().unwrap();
        let input = project.path().join("crash-0");
        fs::write(&input, b"A").unwrap();
        let sink = RecordingSink::default();

        let mut first = handler(project.path());
        first.add_sink(Box::new(sink.clone()));
        for report in crash_report(&input) {
            first.handle(report).unwrap();
        }
        assert!(first.has_findings());
        assert_eq!(first.new_findings(), 1);
        let name = first.findings()[0].name.clone();
        assert!(project.path().join("seeds").join(&name).is_file());

        let mut second = handler(project.path());
        second.add_sink(Box::new(sink.clone()));
        for report in crash_report(&input) {
            second.handle(report).unwrap();
        }
        assert_eq!(second.new_findings(), 0);

        let events = sink.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "metric 2".to_string(),
                format!("finding {name} new=true"),
                "metric 2".to_string(),
                format!("finding {name} new=false"),
            ]
        );
    }

    #[test]
    fn sink_errors_are_surfaced() {
        let project = tempfile::tempdir().unwrap();
        let mut handler = handler(project.path());
        handler.add_sink(Box::new(FailingSink));
        let mut finding = Finding::new(ErrorType::Crash, "x", "l".to_string());
        finding.name = "abc".to_string();
        let err = handler
            .handle(Report::Finding(Box::new(finding)))
            .unwrap_err();
        assert!(matches!(err, ReportError::Sink { sink: "FailingSink", .. }));
    }

    #[test]
    fn json_sink_writes_one_line_per_finding() {
        let mut sink = JsonSink::new(Vec::new());
        let mut finding = Finding::new(ErrorType::Warning, "w", "l".to_string());
        finding.name = "n".to_string();
        sink.on_finding(&finding, true).unwrap();
        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(out.lines().count(), 1);
        assert!(out.contains("\"type\":\"WARNING\""));
    }

    #[test]
    fn final_metrics_need_a_sample() {
        let project = tempfile::tempdir().unwrap();
        let handler = handler(project.path());
        assert!(handler.final_metrics(None).is_none());
        let mut out = Vec::new();
        handler.print_final_metrics(&mut out, None).unwrap();
        handler.print_crashing_input_note(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn counts_corpus_files_recursively() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"1").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b"), b"2").unwrap();
        let count =
            count_corpus_entries(&[dir.path().to_path_buf(), dir.path().join("missing")]).unwrap();
        assert_eq!(count, 2);
    }
}
