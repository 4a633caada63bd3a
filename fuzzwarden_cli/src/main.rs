use fuzzwarden_core::cancel::install_signal_handler;
use fuzzwarden_core::config::FuzzwardenConfig;
use fuzzwarden_core::coverage::{CoverageGenerator, CoverageOptions, OutputFormat};
use fuzzwarden_core::envutil::EnvOverlay;
use fuzzwarden_core::report::{JsonSink, TracingSink, count_corpus_entries};
use fuzzwarden_core::runner::{
    EngineKind, JvmOptions, NO_CIFUZZ_ENV, RunError, RunStatus, Runner, RunnerOptions,
};
use fuzzwarden_core::store::FindingStore;
use fuzzwarden_core::tools::InstallLayoutFinder;
use fuzzwarden_core::BuildResult;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Conventional exit status of a process stopped by SIGINT.
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file. Defaults to fuzzwarden.toml in the project
    /// directory, if present.
    #[clap(short, long, value_parser, global = true)]
    config_file: Option<PathBuf>,
    #[clap(short = 'C', long, global = true)]
    project_dir: Option<PathBuf>,
    /// Show debug output and full error chains.
    #[clap(short, long, global = true)]
    verbose: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fuzz a fuzz test until it crashes or the timeout expires.
    Run(RunArgs),
    /// Produce a coverage report of a fuzz test over its corpus.
    Coverage(CoverageArgs),
    /// List the findings of the project, or show one of them.
    Findings(FindingsArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// The libFuzzer executable. Not needed for JVM fuzz tests or when
    /// --build-result is given.
    executable: Option<PathBuf>,
    /// TOML file describing the build of the fuzz test.
    #[clap(long)]
    build_result: Option<PathBuf>,
    /// libfuzzer (native) or jazzer (jvm).
    #[clap(long, value_parser = parse_engine)]
    engine: Option<EngineKind>,
    /// Stop after this many seconds.
    #[clap(long)]
    timeout: Option<u64>,
    #[clap(long)]
    dict: Option<PathBuf>,
    #[clap(short, long = "seed-corpus")]
    seed_corpus: Vec<PathBuf>,
    /// Passed to the engine as is, e.g. --engine-arg=-runs=100.
    #[clap(long = "engine-arg", allow_hyphen_values = true)]
    engine_args: Vec<String>,
    /// KEY=VALUE pairs added to the environment of the fuzz test.
    #[clap(long = "env")]
    env: Vec<String>,
    #[clap(long)]
    use_sandbox: Option<bool>,
    #[clap(long)]
    target_class: Option<String>,
    #[clap(long)]
    autofuzz: Option<String>,
    #[clap(long = "class-path")]
    class_paths: Vec<PathBuf>,
    #[clap(long)]
    java_home: Option<PathBuf>,
    /// Print findings as JSON lines to stdout.
    #[clap(long)]
    json: bool,
    /// Arguments for the fuzz test itself.
    #[clap(last = true)]
    fuzz_test_args: Vec<String>,
}

#[derive(Args, Debug)]
struct CoverageArgs {
    executable: Option<PathBuf>,
    #[clap(long)]
    build_result: Option<PathBuf>,
    /// html, lcov or none.
    #[clap(long)]
    format: Option<OutputFormat>,
    #[clap(short, long)]
    output: Option<PathBuf>,
    #[clap(short, long = "seed-corpus")]
    seed_corpus: Vec<PathBuf>,
    #[clap(long)]
    use_sandbox: Option<bool>,
}

#[derive(Args, Debug)]
struct FindingsArgs {
    /// Show only this finding.
    name: Option<String>,
    #[clap(long)]
    json: bool,
}

fn parse_engine(value: &str) -> Result<EngineKind, String> {
    match value {
        "libfuzzer" | "native" => Ok(EngineKind::Native),
        "jazzer" | "jvm" => Ok(EngineKind::Jvm),
        other => Err(format!("unknown engine '{other}'")),
    }
}

fn init_logging(verbose: bool) {
    let default_directive = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive)),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

struct Project {
    dir: PathBuf,
    config: FuzzwardenConfig,
    finder: InstallLayoutFinder,
}

fn load_project(cli: &Cli) -> Result<Project, anyhow::Error> {
    let project_dir = match &cli.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to determine the current directory")?,
    };
    let config = match &cli.config_file {
        Some(path) => FuzzwardenConfig::load_from_file(path)?,
        None => FuzzwardenConfig::discover(&project_dir)?,
    };
    let finder = match &config.tools.install_dir {
        Some(dir) => InstallLayoutFinder::new(dir),
        None => InstallLayoutFinder::from_env(),
    };
    Ok(Project {
        dir: project_dir,
        config,
        finder,
    })
}

fn load_build(
    executable: Option<&Path>,
    build_result: Option<&Path>,
) -> Result<Option<BuildResult>, anyhow::Error> {
    match (build_result, executable) {
        (Some(path), _) => Ok(Some(BuildResult::load_from_file(path)?)),
        (None, Some(exe)) => Ok(Some(BuildResult::new(exe))),
        (None, None) => Ok(None),
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn run(project: &Project, args: RunArgs) -> Result<ExitCode, anyhow::Error> {
    if std::env::var_os(NO_CIFUZZ_ENV).is_some() {
        bail!("{NO_CIFUZZ_ENV} is set, refusing to start fuzzing from within a fuzz test");
    }
    let settings = &project.config.run;
    let engine = args.engine.unwrap_or(settings.engine);
    let build = load_build(args.executable.as_deref(), args.build_result.as_deref())?;

    let (executable, fuzz_test) = match (engine, &build) {
        (EngineKind::Native, Some(build)) => {
            (build.executable.clone(), file_stem(&build.executable))
        }
        (EngineKind::Native, None) => bail!("No fuzz test executable given"),
        (EngineKind::Jvm, _) => {
            let target = args
                .target_class
                .clone()
                .or_else(|| args.autofuzz.clone())
                .context("JVM fuzz tests need --target-class or --autofuzz")?;
            (PathBuf::new(), target)
        }
    };

    let mut options = RunnerOptions::new(executable, &project.dir, fuzz_test);
    options.engine = engine;
    options.jvm = JvmOptions {
        java_home: args.java_home,
        class_paths: args.class_paths,
        target_class: args.target_class,
        autofuzz_target: args.autofuzz,
    };
    options.seed_corpus_dirs = settings.seed_corpus_dirs.clone();
    options.seed_corpus_dirs.extend(args.seed_corpus);
    if let Some(build) = &build {
        if let Some(generated) = &build.generated_corpus {
            options.generated_corpus_dir = generated.clone();
        }
        if let Some(seeds) = &build.seed_corpus {
            options.crashing_inputs_dir = seeds.clone();
            if seeds.is_dir() {
                options.seed_corpus_dirs.push(seeds.clone());
            }
        }
    }
    options.dictionary = args.dict.or_else(|| settings.dictionary.clone());
    options.engine_args = settings.engine_args.clone();
    options.engine_args.extend(args.engine_args);
    options.fuzz_test_args = args.fuzz_test_args;
    options.env_vars = EnvOverlay::from_assignments(&args.env)?;
    options.timeout = Duration::from_secs(args.timeout.unwrap_or(settings.timeout_secs));
    options.use_sandbox = args.use_sandbox.unwrap_or(settings.use_sandbox);
    options.extra_bindings = project.config.sandbox.extra_bindings.clone();
    options.metrics_interval = Duration::from_millis(settings.metrics_interval_ms);

    let cancel = install_signal_handler()?;
    let mut runner = Runner::new(options, &project.finder);
    runner.add_sink(Box::new(TracingSink));
    if args.json {
        runner.add_sink(Box::new(JsonSink::new(io::stdout())));
    }

    match runner.run(&cancel) {
        Ok(status) => {
            if status == RunStatus::CompletedWithFindings {
                info!("Fuzz test stopped after a finding");
            }
        }
        Err(e) if e.is_cancelled() => {
            info!("{}", e);
            return Ok(ExitCode::from(EXIT_CANCELLED));
        }
        Err(e @ RunError::Execution { .. }) => return Err(e.into()),
        Err(e) => return Err(e).context("Fuzzing failed"),
    }

    let options = runner.options();
    let mut corpus_dirs = vec![options.generated_corpus_dir.clone()];
    corpus_dirs.extend(options.seed_corpus_dirs.iter().cloned());
    let corpus_entries = count_corpus_entries(&corpus_dirs).ok();

    let mut stderr = io::stderr().lock();
    let handler = runner.report_handler();
    handler.print_final_metrics(&mut stderr, corpus_entries)?;
    handler.print_crashing_input_note(&mut stderr)?;
    Ok(ExitCode::SUCCESS)
}

fn coverage(project: &Project, args: CoverageArgs) -> Result<ExitCode, anyhow::Error> {
    let Some(build) = load_build(args.executable.as_deref(), args.build_result.as_deref())? else {
        bail!("No fuzz test executable given");
    };
    let settings = &project.config.coverage;

    let mut options = CoverageOptions::new(build, &project.dir);
    options.seed_corpus_dirs = project.config.run.seed_corpus_dirs.clone();
    options.seed_corpus_dirs.extend(args.seed_corpus);
    options.output_format = args.format.unwrap_or(settings.output_format);
    options.output_path = args.output.or_else(|| settings.output_path.clone());
    options.use_sandbox = args.use_sandbox.unwrap_or(project.config.run.use_sandbox);
    options.extra_bindings = project.config.sandbox.extra_bindings.clone();

    let cancel = install_signal_handler()?;
    let generator = CoverageGenerator::new(options, &project.finder)?;
    let report = match generator.generate(&cancel) {
        Ok(report) => report,
        Err(e) if cancel.is_cancelled() => {
            info!("{}", e);
            return Ok(ExitCode::from(EXIT_CANCELLED));
        }
        Err(e) => return Err(e).context("Coverage generation failed"),
    };

    report.summary.write_table(&mut io::stderr().lock())?;
    if let Some(path) = report.report_path {
        println!("Created coverage report: {}", path.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn findings(project: &Project, args: FindingsArgs) -> Result<ExitCode, anyhow::Error> {
    let store = FindingStore::new(&project.dir);
    let mut out = io::stdout().lock();

    if let Some(name) = args.name {
        let finding = store.load(&name)?;
        if args.json {
            serde_json::to_writer_pretty(&mut out, &finding)?;
            writeln!(out)?;
        } else {
            writeln!(out, "{}", finding.short_description_with_name())?;
            writeln!(out, "Date: {}\n", finding.created_at)?;
            for line in &finding.logs {
                writeln!(out, "  {line}")?;
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    let all = store.list()?;
    if args.json {
        serde_json::to_writer_pretty(&mut out, &all)?;
        writeln!(out)?;
    } else if all.is_empty() {
        info!("This project doesn't have any findings yet");
    } else {
        for finding in &all {
            writeln!(
                out,
                "{}  {}",
                finding.created_at.format("%Y-%m-%d %H:%M"),
                finding.short_description_with_name()
            )?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let verbose = cli.verbose;

    let result = load_project(&cli).and_then(|project| match cli.command {
        Command::Run(args) => run(&project, args),
        Command::Coverage(args) => coverage(&project, args),
        Command::Findings(args) => findings(&project, args),
    });

    match result {
        Ok(code) => code,
        Err(e) => {
            if verbose {
                eprintln!("Error: {e:?}");
            } else {
                eprintln!("Error: {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_with_trailing_fuzz_test_args() {
        let cli = Cli::parse_from([
            "fuzzwarden",
            "run",
            "./my_fuzz_test",
            "--engine-arg=-runs=10",
            "-s",
            "seeds",
            "--timeout",
            "30",
            "--",
            "--flag",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.executable, Some(PathBuf::from("./my_fuzz_test")));
        assert_eq!(args.engine_args, vec!["-runs=10".to_string()]);
        assert_eq!(args.seed_corpus, vec![PathBuf::from("seeds")]);
        assert_eq!(args.timeout, Some(30));
        assert_eq!(args.fuzz_test_args, vec!["--flag".to_string()]);
    }

    #[test]
    fn engine_names() {
        assert_eq!(parse_engine("jazzer"), Ok(EngineKind::Jvm));
        assert_eq!(parse_engine("libfuzzer"), Ok(EngineKind::Native));
        assert!(parse_engine("afl").is_err());
    }

    #[test]
    fn coverage_format_flag() {
        let cli = Cli::parse_from(["fuzzwarden", "coverage", "fuzz", "--format", "lcov", "-v"]);
        assert!(cli.verbose);
        let Command::Coverage(args) = cli.command else {
            panic!("expected coverage");
        };
        assert_eq!(args.format, Some(OutputFormat::Lcov));
    }
}
