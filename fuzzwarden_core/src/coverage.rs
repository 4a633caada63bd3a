//! Source-based coverage of a fuzz test over its corpus.
//!
//! The executable is built with `-fprofile-instr-generate`. It is run over
//! every corpus input in libFuzzer's merge mode, which restarts the target
//! in a fresh subprocess whenever an input crashes it. When the runtime
//! supports LLVM's continuous mode, counters are mmapped into the
//! `.profraw` file and survive those crashes, so coverage stays complete
//! even for corpora with crashing inputs.
//!
//! Afterwards the raw profiles are indexed with `llvm-profdata` and
//! exported with `llvm-cov`.

use crate::binding::Binding;
use crate::build_result::BuildResult;
use crate::cancel::CancelToken;
use crate::envutil::{EnvError, EnvOverlay};
use crate::lcov::{CoverageSummary, parse_lcov};
use crate::macho::{self, MachoError};
use crate::process::{self, ProcessCommand, ProcessError};
use crate::runner::NO_CIFUZZ_ENV;
use crate::sandbox::{SandboxError, SandboxOptions, SandboxSession, is_minijail_log_line};
use crate::tools::{Tool, ToolError, ToolFinder};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::str::FromStr;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info};

/// Symbol only present in binaries whose profile runtime supports
/// continuous mode.
const COUNTER_BIAS_SYMBOL: &[u8] = b"__llvm_profile_counter_bias";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    #[default]
    Html,
    Lcov,
    /// Only print the summary table.
    None,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "html" => Ok(OutputFormat::Html),
            "lcov" => Ok(OutputFormat::Lcov),
            "none" => Ok(OutputFormat::None),
            other => Err(format!(
                "unsupported output format '{other}', expected one of html, lcov, none"
            )),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputFormat::Html => "html",
            OutputFormat::Lcov => "lcov",
            OutputFormat::None => "none",
        })
    }
}

#[derive(Error, Debug)]
pub enum CoverageError {
    #[error("Failed to {action} {path:?}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        source: io::Error,
    },
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Macho(#[from] MachoError),
    #[error("{executable:?} did not generate .profraw files at {pattern}")]
    NoRawProfiles { executable: PathBuf, pattern: String },
    #[error("Command failed ({status}): {command}\n{}", .stderr_tail.join("\n"))]
    Command {
        command: String,
        status: String,
        stderr_tail: Vec<String>,
    },
    #[error("Coverage run was cancelled")]
    Cancelled,
}

impl CoverageError {
    fn io(action: &'static str, path: &Path) -> impl FnOnce(io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| CoverageError::Io {
            action,
            path,
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoverageOptions {
    pub build: BuildResult,
    /// User-provided corpus directories, in addition to the build's seed
    /// and generated corpora.
    pub seed_corpus_dirs: Vec<PathBuf>,
    pub output_format: OutputFormat,
    /// Report location. Defaults to a temporary directory for HTML and
    /// to `<executable>.coverage.lcov` in the working directory for lcov.
    pub output_path: Option<PathBuf>,
    pub use_sandbox: bool,
    pub extra_bindings: Option<String>,
    pub project_dir: PathBuf,
}

impl CoverageOptions {
    pub fn new(build: BuildResult, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            build,
            seed_corpus_dirs: Vec::new(),
            output_format: OutputFormat::default(),
            output_path: None,
            use_sandbox: false,
            extra_bindings: None,
            project_dir: project_dir.into(),
        }
    }
}

#[derive(Debug)]
pub struct CoverageReport {
    pub summary: CoverageSummary,
    /// The HTML directory or lcov file, if one was requested.
    pub report_path: Option<PathBuf>,
}

pub struct CoverageGenerator<'a> {
    options: CoverageOptions,
    finder: &'a dyn ToolFinder,
    tmp: TempDir,
    output_dir: PathBuf,
}

impl<'a> CoverageGenerator<'a> {
    pub fn new(options: CoverageOptions, finder: &'a dyn ToolFinder) -> Result<Self, CoverageError> {
        let tmp = tempfile::Builder::new()
            .prefix("llvm-coverage-")
            .tempdir()
            .map_err(CoverageError::io("create", &std::env::temp_dir()))?;
        let output_dir = tmp.path().join("output");
        fs::create_dir(&output_dir).map_err(CoverageError::io("create", &output_dir))?;
        Ok(Self {
            options,
            finder,
            tmp,
            output_dir,
        })
    }

    /// Runs the fuzz test over its corpus and produces the report.
    pub fn generate(&self, cancel: &CancelToken) -> Result<CoverageReport, CoverageError> {
        self.run(cancel)?;
        self.index_raw_profiles()?;

        let summary_lcov = self.export_lcov(true)?;
        let summary = parse_lcov(summary_lcov.as_slice())
            .map_err(CoverageError::io("parse", &self.profdata_path()))?;

        let report_path = match self.options.output_format {
            OutputFormat::Html => Some(self.html_report()?),
            OutputFormat::Lcov => Some(self.lcov_report()?),
            OutputFormat::None => None,
        };
        Ok(CoverageReport {
            summary,
            report_path,
        })
    }

    fn executable(&self) -> &Path {
        &self.options.build.executable
    }

    fn executable_name(&self) -> String {
        self.executable()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "fuzz_test".to_string())
    }

    /// User corpus dirs, then the build's seed and generated corpora if
    /// they exist, all with symlinks resolved so they can be bound into
    /// the sandbox.
    fn corpus_dirs(&self) -> Result<Vec<PathBuf>, CoverageError> {
        let build = &self.options.build;
        let optional = [&build.seed_corpus, &build.generated_corpus]
            .into_iter()
            .flatten()
            .filter(|dir| dir.exists());
        self.options
            .seed_corpus_dirs
            .iter()
            .chain(optional)
            .map(|dir| fs::canonicalize(dir).map_err(CoverageError::io("resolve", dir)))
            .collect()
    }

    fn raw_profile_pattern(&self, continuous: bool) -> String {
        // %m gives each executable and shared library its own file; %c
        // expands to nothing and turns on continuous mode.
        let base = if continuous { "%c%m.profraw" } else { "%m.profraw" };
        self.output_dir.join(base).display().to_string()
    }

    fn run(&self, cancel: &CancelToken) -> Result<(), CoverageError> {
        info!("Running {} on corpus", self.executable_name());
        debug!("Executable: {}", self.executable().display());

        let corpus_dirs = self.corpus_dirs()?;
        let continuous = supports_continuous_mode(self.executable())?;

        let mut env = EnvOverlay::new();
        env.set("LLVM_PROFILE_FILE", &self.raw_profile_pattern(continuous))?;
        env.set(NO_CIFUZZ_ENV, "1")?;

        let empty_input_dir = self.output_dir.join("empty-file-corpus");
        let merge_target = self.output_dir.join("merge-target");
        let artifacts = self.output_dir.join("merge-artifacts");
        for dir in [&empty_input_dir, &merge_target, &artifacts] {
            fs::create_dir(dir).map_err(CoverageError::io("create", dir))?;
        }
        let empty_file = empty_input_dir.join("empty_file");
        fs::write(&empty_file, b"").map_err(CoverageError::io("create", &empty_file))?;

        // Crashing inputs are already known, the artifacts of a coverage
        // run are discarded with the temp dir.
        let artifact_arg = format!("-artifact_prefix={}/", artifacts.display());

        // Merge mode skips the empty input, which fuzzing runs always try
        // first. Crashes on it are expected and ignored.
        if let Err(e) = self.run_fuzzer(
            &[artifact_arg.clone(), "-runs=0".to_string()],
            std::slice::from_ref(&empty_input_dir),
            &env,
            cancel,
        ) {
            if cancel.is_cancelled() {
                return Err(CoverageError::Cancelled);
            }
            debug!("Ignoring failure on the empty input: {}", e);
        }

        let mut merge_dirs = vec![merge_target];
        merge_dirs.extend(corpus_dirs);
        self.run_fuzzer(&[artifact_arg, "-merge=1".to_string()], &merge_dirs, &env, cancel)
    }

    fn run_fuzzer(
        &self,
        flags: &[String],
        corpus_dirs: &[PathBuf],
        env: &EnvOverlay,
        cancel: &CancelToken,
    ) -> Result<(), CoverageError> {
        let mut args = vec![self.executable().display().to_string()];
        args.extend(flags.iter().cloned());
        args.extend(corpus_dirs.iter().map(|d| d.display().to_string()));

        let mut session = None;
        if self.options.use_sandbox {
            let mut sandbox = SandboxOptions::new(args.clone()).with_env();
            sandbox.bindings.push(Binding::read_only(self.executable()));
            sandbox
                .bindings
                .extend(corpus_dirs.iter().map(|d| Binding::read_only(d)));
            sandbox.output_dir = Some(self.output_dir.clone());
            if self.options.extra_bindings.is_some() {
                sandbox.extra_bindings = self.options.extra_bindings.clone();
            }
            let created = session.insert(SandboxSession::new(sandbox, self.finder)?);
            args = created.args().to_vec();
        }
        let sandboxed = session.is_some();

        let command = ProcessCommand::new(args, env.clone());
        let result = process::supervise(&command, cancel, |line| {
            let text = line.text();
            if sandboxed && is_minijail_log_line(text) {
                return;
            }
            debug!("{}", text);
        });

        if let Some(mut session) = session {
            session.cleanup();
        }
        if cancel.is_cancelled() {
            return Err(CoverageError::Cancelled);
        }

        let exit = result?;
        if exit.success() {
            Ok(())
        } else {
            Err(CoverageError::Command {
                command: command.command_line(),
                status: exit.status.to_string(),
                stderr_tail: exit.stderr_tail,
            })
        }
    }

    fn profdata_path(&self) -> PathBuf {
        self.tmp
            .path()
            .join(format!("{}.profdata", self.executable_name()))
    }

    fn index_raw_profiles(&self) -> Result<(), CoverageError> {
        let mut raw_profiles = Vec::new();
        let entries =
            fs::read_dir(&self.output_dir).map_err(CoverageError::io("read", &self.output_dir))?;
        for entry in entries {
            let path = entry.map_err(CoverageError::io("read", &self.output_dir))?.path();
            if path.extension().is_some_and(|ext| ext == "profraw") {
                raw_profiles.push(path);
            }
        }
        if raw_profiles.is_empty() {
            return Err(CoverageError::NoRawProfiles {
                executable: self.executable().to_path_buf(),
                pattern: self.raw_profile_pattern(false),
            });
        }
        raw_profiles.sort();

        let profdata = self.finder.tool_path(Tool::LlvmProfdata)?;
        let mut cmd = Command::new(profdata);
        cmd.args(["merge", "-sparse", "-o"])
            .arg(self.profdata_path())
            .args(&raw_profiles);
        run_tool(cmd)?;
        Ok(())
    }

    fn ignore_includes_arg(&self) -> Result<String, CoverageError> {
        let include_dir = self.finder.tool_path(Tool::IncludeDir)?;
        Ok(format!(
            "-ignore-filename-regex={}/.*",
            regex::escape(&include_dir.display().to_string())
        ))
    }

    /// Runs `llvm-cov export -format=lcov` over the executable and its
    /// instrumented shared libraries and returns the tracefile.
    fn export_lcov(&self, summary_only: bool) -> Result<Vec<u8>, CoverageError> {
        let llvm_cov = self.finder.tool_path(Tool::LlvmCov)?;
        let mut cmd = Command::new(llvm_cov);
        cmd.args(["export", "-format=lcov"]);
        if summary_only {
            cmd.arg("-summary-only");
        }
        cmd.arg(self.ignore_includes_arg()?);
        cmd.arg(format!("-instr-profile={}", self.profdata_path().display()));

        cmd.arg(self.executable());
        if let Some(flag) = arch_flag(self.executable())? {
            cmd.arg(flag);
        }
        for object in self.options.build.instrumented_objects() {
            cmd.arg(format!("-object={}", object.display()));
            if let Some(flag) = arch_flag(object)? {
                cmd.arg(flag);
            }
        }
        Ok(run_tool(cmd)?.stdout)
    }

    fn lcov_report(&self) -> Result<PathBuf, CoverageError> {
        let report = self.export_lcov(false)?;
        // Not a temp dir: an lcov file is only useful if it stays around.
        let path = self
            .options
            .output_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}.coverage.lcov", self.executable_name())));
        fs::write(&path, report).map_err(CoverageError::io("write", &path))?;
        debug!("Created lcov trace file: {}", path.display());
        Ok(path)
    }

    fn html_report(&self) -> Result<PathBuf, CoverageError> {
        let report = self.export_lcov(false)?;
        let lcov_file = self.tmp.path().join("coverage.lcov");
        fs::write(&lcov_file, report).map_err(CoverageError::io("write", &lcov_file))?;

        let output = match &self.options.output_path {
            Some(path) => path.clone(),
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("coverage-")
                    .tempdir()
                    .map_err(CoverageError::io("create", &std::env::temp_dir()))?;
                dir.keep().join(self.executable_name())
            }
        };

        let genhtml = self.finder.tool_path(Tool::GenHtml)?;
        let mut cmd = Command::new(genhtml);
        cmd.arg("--prefix")
            .arg(&self.options.project_dir)
            .arg("--output")
            .arg(&output)
            .arg(&lcov_file)
            .current_dir(&self.options.project_dir);
        run_tool(cmd)?;
        Ok(output)
    }
}

/// Whether the profile runtime linked into `executable` can keep its
/// counters in sync with the `.profraw` file while running.
pub fn supports_continuous_mode(executable: &Path) -> Result<bool, CoverageError> {
    if cfg!(target_os = "macos") {
        return Ok(true);
    }
    let data = fs::read(executable).map_err(CoverageError::io("read", executable))?;
    Ok(data
        .windows(COUNTER_BIAS_SYMBOL.len())
        .any(|window| window == COUNTER_BIAS_SYMBOL))
}

/// Only universal binaries on macOS need an explicit architecture.
fn arch_flag(object: &Path) -> Result<Option<String>, CoverageError> {
    if !cfg!(target_os = "macos") {
        return Ok(None);
    }
    Ok(Some(macho::preferred_arch(object)?.llvm_cov_flag()))
}

fn run_tool(mut cmd: Command) -> Result<Output, CoverageError> {
    let command = format!("{cmd:?}");
    debug!("Command: {}", command);
    let output = cmd.output().map_err(|source| {
        CoverageError::from(ProcessError::Spawn {
            command: command.clone(),
            source,
        })
    })?;
    if output.status.success() {
        return Ok(output);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(CoverageError::Command {
        command,
        status: output.status.to_string(),
        stderr_tail: stderr.lines().map(str::to_string).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::StaticToolFinder;
    use std::os::unix::fs::PermissionsExt;

    const SUMMARY: &str = "SF:/project/src/explore_me.cpp\nFNF:2\nFNH:2\nLF:10\nLH:8\nBRF:4\nBRH:2\nend_of_record\n";

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    struct Fixture {
        dir: TempDir,
        finder: StaticToolFinder,
        build: BuildResult,
    }

    /// A fake fuzz test writing a raw profile next to `$LLVM_PROFILE_FILE`
    /// and fake llvm tools that log their arguments.
    fn fixture(target_writes_profile: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let log = root.join("calls.log");
        let log = log.display();

        let profile = if target_writes_profile {
            "touch \"$(dirname \"$LLVM_PROFILE_FILE\")/default.profraw\"\n"
        } else {
            ""
        };
        let exe = write_script(
            root,
            "my_fuzz_test",
            &format!("printf '%s\\n' \"target $*\" >> {log}\n{profile}exit 0\n"),
        );
        let profdata = write_script(
            root,
            "llvm-profdata",
            &format!(
                "printf '%s\\n' \"profdata $*\" >> {log}\n\
                 while [ $# -gt 0 ]; do\n\
                   if [ \"$1\" = -o ]; then shift; out=\"$1\"; fi\n\
                   shift\n\
                 done\n\
                 echo indexed > \"$out\"\n"
            ),
        );
        let cov = write_script(
            root,
            "llvm-cov",
            &format!("printf '%s\\n' \"cov $*\" >> {log}\nprintf '{}'\n", SUMMARY.replace('\n', "\\n")),
        );
        let genhtml = write_script(
            root,
            "genhtml",
            &format!(
                "printf '%s\\n' \"genhtml $*\" >> {log}\n\
                 while [ $# -gt 0 ]; do\n\
                   if [ \"$1\" = --output ]; then shift; out=\"$1\"; fi\n\
                   shift\n\
                 done\n\
                 mkdir -p \"$out\" && echo '<html/>' > \"$out/index.html\"\n"
            ),
        );

        let include = root.join("include.dir");
        fs::create_dir(&include).unwrap();
        let finder = StaticToolFinder::new()
            .with(Tool::LlvmProfdata, profdata)
            .with(Tool::LlvmCov, cov)
            .with(Tool::GenHtml, genhtml)
            .with(Tool::IncludeDir, include);

        let seeds = root.join("seeds");
        fs::create_dir(&seeds).unwrap();
        fs::write(seeds.join("a"), b"FUZ").unwrap();
        let mut build = BuildResult::new(exe);
        build.seed_corpus = Some(seeds);
        build.generated_corpus = Some(root.join("missing-generated"));

        Fixture { dir, finder, build }
    }

    fn calls(fixture: &Fixture) -> String {
        fs::read_to_string(fixture.dir.path().join("calls.log")).unwrap()
    }

    #[test]
    fn lcov_report_over_merged_corpus() {
        let fx = fixture(true);
        let out = fx.dir.path().join("report.lcov");
        let mut options = CoverageOptions::new(fx.build.clone(), fx.dir.path());
        options.output_format = OutputFormat::Lcov;
        options.output_path = Some(out.clone());

        let generator = CoverageGenerator::new(options, &fx.finder).unwrap();
        let report = generator.generate(&CancelToken::new()).unwrap();

        assert_eq!(report.report_path.as_deref(), Some(out.as_path()));
        assert_eq!(fs::read_to_string(&out).unwrap(), SUMMARY);
        assert_eq!(report.summary.total().lines.hit, 8);

        let calls = calls(&fx);
        let lines: Vec<&str> = calls.lines().collect();
        assert!(lines[0].starts_with("target -artifact_prefix="));
        assert!(lines[0].contains("-runs=0"));
        assert!(lines[0].ends_with("empty-file-corpus"));
        assert!(lines[1].contains("-merge=1"));
        let seeds = fs::canonicalize(fx.dir.path().join("seeds")).unwrap();
        assert!(lines[1].ends_with(&format!("merge-target {}", seeds.display())));
        assert!(lines[2].starts_with("profdata merge -sparse -o "));
        assert!(lines[2].ends_with("default.profraw"));
        assert!(lines[3].starts_with("cov export -format=lcov -summary-only -ignore-filename-regex="));
        assert!(lines[3].contains(r"include\.dir/.*"));
        assert!(lines[3].contains("-instr-profile="));
        assert!(lines[4].starts_with("cov export -format=lcov -ignore-filename-regex="));
    }

    #[test]
    fn crashing_corpus_input_keeps_its_coverage() {
        let fx = fixture(true);
        let root = fx.dir.path();
        let log = root.join("calls.log");
        // Behaves like libFuzzer's merge mode: every input runs in a fresh
        // subprocess and the merge itself survives crashes. In continuous
        // mode the counters are on disk before the input runs, so the
        // crashing input still leaves a profile behind.
        let exe = write_script(
            root,
            "crashy_fuzz_test",
            &format!(
                r#"# links __llvm_profile_counter_bias
printf '%s\n' "target $*" >> "{log}"
printf '%s\n' "profile $LLVM_PROFILE_FILE" >> "{log}"
profiles="$(dirname "$LLVM_PROFILE_FILE")"
case "$LLVM_PROFILE_FILE" in
  *%c*) continuous=1 ;;
esac
case "$*" in
  *-merge=1*) ;;
  *) exit 0 ;;
esac
n=0
for dir in "$@"; do
  [ -d "$dir" ] || continue
  for input in "$dir"/*; do
    [ -f "$input" ] || continue
    n=$((n + 1))
    (
      if [ -n "$continuous" ]; then touch "$profiles/input-$n.profraw"; fi
      if grep -q CRASH "$input"; then
        echo "==$n==ERROR: AddressSanitizer: SEGV on unknown address 0x000000000000" >&2
        exit 1
      fi
      touch "$profiles/input-$n.profraw"
    ) || echo "MERGE-OUTER: attempt $n crashed, continuing" >&2
  done
done
exit 0
"#,
                log = log.display()
            ),
        );
        let seeds = root.join("seeds");
        fs::write(seeds.join("b"), b"CRASH").unwrap();

        let mut build = fx.build.clone();
        build.executable = exe;
        let mut options = CoverageOptions::new(build, root);
        options.output_format = OutputFormat::None;

        let generator = CoverageGenerator::new(options, &fx.finder).unwrap();
        let report = generator.generate(&CancelToken::new()).unwrap();
        assert!(!report.summary.is_empty());

        let calls = calls(&fx);
        assert!(calls.contains("%c%m.profraw"));
        let merge = calls.lines().find(|l| l.starts_with("profdata ")).unwrap();
        // "a" ran cleanly, "b" crashed the target
        assert!(merge.contains("input-1.profraw"));
        assert!(merge.contains("input-2.profraw"));
    }

    #[test]
    fn html_report_via_genhtml() {
        let fx = fixture(true);
        let out = fx.dir.path().join("html");
        let mut options = CoverageOptions::new(fx.build.clone(), fx.dir.path());
        options.output_path = Some(out.clone());

        let generator = CoverageGenerator::new(options, &fx.finder).unwrap();
        let report = generator.generate(&CancelToken::new()).unwrap();
        assert_eq!(report.report_path, Some(out.clone()));
        assert!(out.join("index.html").exists());
        assert!(calls(&fx).contains("genhtml --prefix"));
    }

    #[test]
    fn summary_only_writes_no_report() {
        let fx = fixture(true);
        let mut options = CoverageOptions::new(fx.build.clone(), fx.dir.path());
        options.output_format = OutputFormat::None;
        let generator = CoverageGenerator::new(options, &fx.finder).unwrap();
        let report = generator.generate(&CancelToken::new()).unwrap();
        assert!(report.report_path.is_none());
        assert_eq!(report.summary.files.len(), 1);
    }

    #[test]
    fn missing_raw_profiles_are_reported() {
        let fx = fixture(false);
        let options = CoverageOptions::new(fx.build.clone(), fx.dir.path());
        let generator = CoverageGenerator::new(options, &fx.finder).unwrap();
        assert!(matches!(
            generator.generate(&CancelToken::new()),
            Err(CoverageError::NoRawProfiles { .. })
        ));
        assert!(!calls(&fx).contains("profdata"));
    }

    #[test]
    fn continuous_mode_detection() {
        let dir = tempfile::tempdir().unwrap();
        let with = dir.path().join("with");
        fs::write(&with, b"\x7fELF....__llvm_profile_counter_bias\0....").unwrap();
        let without = dir.path().join("without");
        fs::write(&without, b"\x7fELF....__llvm_profile_runtime\0").unwrap();

        assert!(supports_continuous_mode(&with).unwrap());
        assert_eq!(
            supports_continuous_mode(&without).unwrap(),
            cfg!(target_os = "macos")
        );
    }

    #[test]
    fn output_format_parsing() {
        assert_eq!("lcov".parse::<OutputFormat>().unwrap(), OutputFormat::Lcov);
        assert_eq!(OutputFormat::Html.to_string(), "html");
        assert!("jacocoxml".parse::<OutputFormat>().is_err());
    }
}
