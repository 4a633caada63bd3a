pub mod binding;
pub mod build_result;
pub mod cancel;
pub mod classifier;
pub mod config;
pub mod coverage;
pub mod envutil;
pub mod finding;
pub mod lcov;
pub mod lock;
pub mod macho;
pub mod metrics;
pub mod process;
pub mod report;
pub mod runner;
pub mod sandbox;
pub mod stacktrace;
pub mod store;
pub mod tools;

pub use binding::{Binding, BindingError};
pub use build_result::BuildResult;
pub use cancel::{CancelToken, install_signal_handler};
pub use classifier::{Classifier, Report};
pub use config::{ConfigError, FuzzwardenConfig};
pub use coverage::{CoverageError, CoverageGenerator, CoverageOptions, CoverageReport, OutputFormat};
pub use envutil::EnvOverlay;
pub use finding::{ErrorType, Finding};
pub use metrics::{FuzzingMetric, PerformanceSummary};
pub use report::{JsonSink, ReportHandler, ReportSink, TracingSink};
pub use runner::{EngineKind, JvmOptions, RunError, RunStatus, Runner, RunnerOptions};
pub use sandbox::{SandboxOptions, SandboxSession};
pub use store::{FindingStore, StoreError};
pub use tools::{InstallLayoutFinder, StaticToolFinder, Tool, ToolFinder};
