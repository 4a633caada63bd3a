//! Running a fuzz test under libFuzzer or Jazzer.
//!
//! Both engines speak the libFuzzer command line and output format, so a
//! run differs only in how the argv and environment are put together. The
//! supervising loop is shared: output lines go through the
//! [`Classifier`] into the [`ReportHandler`] while the process runs.

use crate::binding::Binding;
use crate::cancel::CancelToken;
use crate::classifier::{Classifier, DEFAULT_METRICS_INTERVAL};
use crate::envutil::{EnvError, EnvOverlay, join_options};
use crate::finding::ErrorDetails;
use crate::process::{self, ProcessCommand, ProcessError};
use crate::report::{ReportError, ReportHandler, ReportHandlerOptions, ReportSink};
use crate::sandbox::{SandboxError, SandboxOptions, SandboxSession, is_minijail_log_line};
use crate::tools::{Tool, ToolError, ToolFinder};
use serde::Deserialize;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Set in the environment of every fuzz test, so that a fuzz test which
/// itself invokes fuzzwarden does not recurse.
pub const NO_CIFUZZ_ENV: &str = "NO_CIFUZZ";

const JAZZER_MAIN_CLASS: &str = "com.code_intelligence.jazzer.Jazzer";

// The JVM's default maximum heap is 1800 MB; libFuzzer's default RSS
// limit is too close to it and aborts runs with spurious OOMs.
const JAZZER_RSS_LIMIT_ARG: &str = "-rss_limit_mb=3000";

const ASAN_OPTIONS: &str = "allocator_may_return_null=1:detect_leaks=1:\
detect_stack_use_after_return=1:handle_abort=1:print_scariness=1:symbolize=1";
const UBSAN_OPTIONS: &str = "halt_on_error=1:print_stacktrace=1:print_summary=1:symbolize=1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    /// A libFuzzer binary.
    #[default]
    #[serde(alias = "libfuzzer")]
    Native,
    /// A Java fuzz test driven by Jazzer.
    #[serde(alias = "jazzer")]
    Jvm,
}

#[derive(Debug, Clone, Default)]
pub struct JvmOptions {
    /// Overrides the Java installation found by the [`ToolFinder`].
    pub java_home: Option<PathBuf>,
    pub class_paths: Vec<PathBuf>,
    pub target_class: Option<String>,
    pub autofuzz_target: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub engine: EngineKind,
    /// The libFuzzer binary. Unused for JVM runs.
    pub executable: PathBuf,
    pub jvm: JvmOptions,
    /// Where the engine stores new interesting inputs. Created if missing.
    pub generated_corpus_dir: PathBuf,
    pub seed_corpus_dirs: Vec<PathBuf>,
    pub dictionary: Option<PathBuf>,
    pub engine_args: Vec<String>,
    pub fuzz_test_args: Vec<String>,
    pub env_vars: EnvOverlay,
    /// Passed as `-max_total_time`. Zero lets the engine run until it
    /// finds something.
    pub timeout: Duration,
    pub use_sandbox: bool,
    /// Overrides `$CIFUZZ_MINIJAIL_BINDINGS` for sandboxed runs.
    pub extra_bindings: Option<String>,
    pub project_dir: PathBuf,
    /// Crashing inputs of new findings are copied here.
    pub crashing_inputs_dir: PathBuf,
    pub fuzz_test: String,
    pub metrics_interval: Duration,
    pub error_details: Option<Vec<ErrorDetails>>,
}

impl RunnerOptions {
    /// Options for a native run of `executable` with the layout defaults
    /// below `project_dir`.
    pub fn new(
        executable: impl Into<PathBuf>,
        project_dir: impl Into<PathBuf>,
        fuzz_test: impl Into<String>,
    ) -> Self {
        let project_dir = project_dir.into();
        let fuzz_test = fuzz_test.into();
        Self {
            engine: EngineKind::Native,
            executable: executable.into(),
            jvm: JvmOptions::default(),
            generated_corpus_dir: project_dir.join(".cifuzz-corpus").join(&fuzz_test),
            seed_corpus_dirs: Vec::new(),
            dictionary: None,
            engine_args: Vec::new(),
            fuzz_test_args: Vec::new(),
            env_vars: EnvOverlay::new(),
            timeout: Duration::ZERO,
            use_sandbox: false,
            extra_bindings: None,
            crashing_inputs_dir: project_dir.join(format!("{fuzz_test}_inputs")),
            project_dir,
            fuzz_test,
            metrics_interval: DEFAULT_METRICS_INTERVAL,
            error_details: None,
        }
    }

    pub fn validate(&self) -> Result<(), RunError> {
        match self.engine {
            EngineKind::Native if self.executable.as_os_str().is_empty() => Err(
                RunError::Config("no fuzz test executable specified".to_string()),
            ),
            EngineKind::Jvm => match (&self.jvm.target_class, &self.jvm.autofuzz_target) {
                (None, None) => Err(RunError::Config(
                    "either an autofuzz target or a target class must be specified".to_string(),
                )),
                (Some(_), Some(_)) => Err(RunError::Config(
                    "only specify either an autofuzz target or a target class".to_string(),
                )),
                _ => Ok(()),
            },
            EngineKind::Native => Ok(()),
        }
    }
}

/// How a run that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// The engine stopped with an error after reporting findings. This
    /// is the expected way for a run to end when it found a bug.
    CompletedWithFindings,
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Invalid run configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("Failed to create {path:?}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Process(ProcessError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("Fuzz test failed: {command}\n{}", .stderr_tail.join("\n"))]
    Execution {
        command: String,
        stderr_tail: Vec<String>,
    },
    #[error("Fuzzing was cancelled")]
    Cancelled,
}

impl RunError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunError::Cancelled)
    }
}

/// Runs one fuzz test and collects its findings.
pub struct Runner<'a> {
    options: RunnerOptions,
    finder: &'a dyn ToolFinder,
    handler: ReportHandler,
}

impl<'a> Runner<'a> {
    pub fn new(options: RunnerOptions, finder: &'a dyn ToolFinder) -> Self {
        let handler = ReportHandler::new(ReportHandlerOptions {
            project_dir: options.project_dir.clone(),
            seed_corpus_dir: options.crashing_inputs_dir.clone(),
            error_details: options.error_details.clone(),
        });
        Self {
            options,
            finder,
            handler,
        }
    }

    pub fn add_sink(&mut self, sink: Box<dyn ReportSink>) {
        self.handler.add_sink(sink);
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    pub fn report_handler(&self) -> &ReportHandler {
        &self.handler
    }

    /// Runs the engine until it exits or `cancel` fires.
    ///
    /// A cancelled run always yields [`RunError::Cancelled`], even if the
    /// engine exited with an error of its own while being stopped.
    pub fn run(&mut self, cancel: &CancelToken) -> Result<RunStatus, RunError> {
        self.options.validate()?;

        let generated = &self.options.generated_corpus_dir;
        fs::create_dir_all(generated).map_err(|source| RunError::CreateDir {
            path: generated.clone(),
            source,
        })?;

        let artifacts = tempfile::Builder::new()
            .prefix("fuzzwarden-artifacts-")
            .tempdir()
            .map_err(|source| RunError::CreateDir {
                path: env::temp_dir(),
                source,
            })?;

        let launch = match self.options.engine {
            EngineKind::Native => native_launch(&self.options, artifacts.path(), self.finder)?,
            EngineKind::Jvm => jvm_launch(&self.options, self.finder)?,
        };

        let mut session = None;
        let args = if self.options.use_sandbox {
            let mut sandbox = SandboxOptions::new(launch.args).with_env();
            sandbox.bindings = launch.bindings;
            if self.options.engine == EngineKind::Native {
                sandbox.output_dir = Some(artifacts.path().to_path_buf());
            }
            if self.options.extra_bindings.is_some() {
                sandbox.extra_bindings = self.options.extra_bindings.clone();
            }
            let created = session.insert(SandboxSession::new(sandbox, self.finder)?);
            created.args().to_vec()
        } else {
            launch.args
        };
        let sandboxed = session.is_some();

        let command = ProcessCommand::new(args, launch.env);
        info!("Running fuzz test {}", self.options.fuzz_test);

        // Cancelled on our own when a finding cannot be persisted.
        let stop = cancel.child();
        let mut classifier = Classifier::new(self.options.fuzz_test.as_str())
            .with_metrics_interval(self.options.metrics_interval);
        let mut report_error: Option<ReportError> = None;
        let handler = &mut self.handler;

        let exit = process::supervise(&command, &stop, |line| {
            let text = line.text();
            if sandboxed && is_minijail_log_line(text) {
                debug!("{}", text);
                return;
            }
            if report_error.is_some() {
                return;
            }
            for report in classifier.push_line(text) {
                if let Err(e) = handler.handle(report) {
                    report_error = Some(e);
                    stop.cancel();
                    break;
                }
            }
        });

        if report_error.is_none() {
            for report in classifier.finish() {
                if let Err(e) = handler.handle(report) {
                    report_error = Some(e);
                    break;
                }
            }
        }

        if let Some(mut session) = session {
            session.cleanup();
        }

        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        if let Some(e) = report_error {
            return Err(RunError::Report(e));
        }

        let exit = exit.map_err(|e| match e {
            ProcessError::Spawn { command, source } => RunError::Execution {
                command,
                stderr_tail: vec![source.to_string()],
            },
            other => RunError::Process(other),
        })?;

        if exit.success() {
            info!("Fuzz test {} completed", self.options.fuzz_test);
            return Ok(RunStatus::Completed);
        }
        if self.handler.has_findings() {
            debug!("Engine exited with {} after reporting findings", exit.status);
            return Ok(RunStatus::CompletedWithFindings);
        }
        warn!("Engine exited with {}", exit.status);
        Err(RunError::Execution {
            command: command.command_line(),
            stderr_tail: exit.stderr_tail,
        })
    }
}

/// What to execute, before sandboxing.
#[derive(Debug)]
struct Launch {
    args: Vec<String>,
    env: EnvOverlay,
    bindings: Vec<Binding>,
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

/// The engine flags and positional corpus arguments shared by both
/// engines, up to the fuzz test arguments.
fn push_engine_args(args: &mut Vec<String>, options: &RunnerOptions, rss_limit: Option<&str>) {
    args.push(format!("-max_total_time={}", options.timeout.as_secs()));
    if let Some(dict) = &options.dictionary {
        args.push(format!("-dict={}", dict.display()));
    }
    args.extend(options.engine_args.iter().cloned());
    if let Some(limit) = rss_limit {
        if !options
            .engine_args
            .iter()
            .any(|a| a.starts_with("-rss_limit_mb="))
        {
            args.push(limit.to_string());
        }
    }

    // the generated corpus comes first: libFuzzer writes to the first dir
    args.push(path_arg(&options.generated_corpus_dir));
    args.extend(options.seed_corpus_dirs.iter().map(|d| path_arg(d)));

    if !options.fuzz_test_args.is_empty() {
        args.push("--".to_string());
        args.extend(options.fuzz_test_args.iter().cloned());
    }
}

fn corpus_bindings(options: &RunnerOptions) -> Vec<Binding> {
    let mut bindings = vec![Binding::read_write(&options.generated_corpus_dir)];
    bindings.extend(options.seed_corpus_dirs.iter().map(|d| Binding::read_only(d)));
    if let Some(dict) = &options.dictionary {
        bindings.push(Binding::read_only(dict));
    }
    bindings
}

/// User-provided sanitizer options from the overlay or the inherited
/// environment, appended to ours so they take precedence.
fn sanitizer_options(overlay: &EnvOverlay, name: &str, ours: &str) -> String {
    let theirs = overlay
        .get(name)
        .map(str::to_string)
        .or_else(|| env::var(name).ok());
    join_options(ours, theirs.as_deref())
}

fn native_launch(
    options: &RunnerOptions,
    artifact_dir: &Path,
    finder: &dyn ToolFinder,
) -> Result<Launch, RunError> {
    let mut args = vec![
        path_arg(&options.executable),
        format!("-artifact_prefix={}/", artifact_dir.display()),
    ];
    push_engine_args(&mut args, options, None);

    let mut env = options.env_vars.clone();
    env.set(
        "ASAN_OPTIONS",
        &sanitizer_options(&options.env_vars, "ASAN_OPTIONS", ASAN_OPTIONS),
    )?;
    env.set(
        "UBSAN_OPTIONS",
        &sanitizer_options(&options.env_vars, "UBSAN_OPTIONS", UBSAN_OPTIONS),
    )?;
    if !env.contains("LLVM_SYMBOLIZER_PATH") {
        match finder.tool_path(Tool::LlvmSymbolizer) {
            Ok(path) => env.set("LLVM_SYMBOLIZER_PATH", &path_arg(&path))?,
            Err(e) => debug!("Running without symbolizer: {}", e),
        }
    }
    env.set(NO_CIFUZZ_ENV, "1")?;

    Ok(Launch {
        args,
        env,
        bindings: corpus_bindings(options),
    })
}

fn jvm_launch(options: &RunnerOptions, finder: &dyn ToolFinder) -> Result<Launch, RunError> {
    let java_home = match &options.jvm.java_home {
        Some(home) => home.clone(),
        None => finder.tool_path(Tool::JavaHome)?,
    };

    let class_path = env::join_paths(&options.jvm.class_paths)
        .map_err(|e| RunError::Config(format!("invalid class path: {e}")))?;

    let mut args = vec![
        path_arg(&java_home.join("bin").join("java")),
        "-cp".to_string(),
        class_path.to_string_lossy().into_owned(),
        JAZZER_MAIN_CLASS.to_string(),
    ];
    match (&options.jvm.autofuzz_target, &options.jvm.target_class) {
        (Some(target), _) => args.push(format!("--autofuzz={target}")),
        (None, Some(class)) => args.push(format!("--target_class={class}")),
        (None, None) => {}
    }
    push_engine_args(&mut args, options, Some(JAZZER_RSS_LIMIT_ARG));

    let mut env = options.env_vars.clone();
    if !env.contains("JAVA_HOME") {
        env.set("JAVA_HOME", &path_arg(&java_home))?;
    }
    // verbose logging of Jazzer's libjvm.so search
    env.set("RULES_JNI_TRACE", "1")?;
    env.set(NO_CIFUZZ_ENV, "1")?;

    let mut bindings = corpus_bindings(options);
    bindings.extend(options.jvm.class_paths.iter().map(|p| Binding::read_only(p)));
    bindings.push(Binding::read_only(&java_home));

    Ok(Launch {
        args,
        env,
        bindings,
    })
}
