//! Locating the external programs fuzzwarden drives.
//!
//! Every component that needs a helper binary (minijail, llvm-cov, ...)
//! receives a [`ToolFinder`] instead of looking the path up itself, so
//! tests can hand in a [`StaticToolFinder`] with canned paths.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Environment variable pointing at the fuzzwarden installation root.
pub const INSTALL_ROOT_ENV: &str = "CIFUZZ_INSTALL_ROOT";

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("{tool} not found (searched ${env_var}, {searched} and PATH)")]
    NotFound {
        tool: Tool,
        env_var: &'static str,
        searched: PathBuf,
    },
    #[error("{tool} path {path:?} from ${env_var} does not exist")]
    BadOverride {
        tool: Tool,
        env_var: &'static str,
        path: PathBuf,
    },
}

/// The external tools and runfiles used by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    Minijail,
    ProcessWrapper,
    LlvmCov,
    LlvmProfdata,
    LlvmSymbolizer,
    GenHtml,
    JavaHome,
    /// Directory holding the headers injected into fuzz tests. Its
    /// sources are excluded from coverage reports.
    IncludeDir,
}

impl Tool {
    /// Environment variable that overrides the lookup.
    pub fn env_var(self) -> &'static str {
        match self {
            Tool::Minijail => "MINIJAIL0",
            Tool::ProcessWrapper => "PROCESS_WRAPPER",
            Tool::LlvmCov => "LLVM_COV",
            Tool::LlvmProfdata => "LLVM_PROFDATA",
            Tool::LlvmSymbolizer => "LLVM_SYMBOLIZER",
            Tool::GenHtml => "GENHTML",
            Tool::JavaHome => "JAVA_HOME",
            Tool::IncludeDir => "CIFUZZ_INCLUDE_DIR",
        }
    }

    /// Location relative to the installation root.
    fn install_path(self) -> &'static str {
        match self {
            Tool::Minijail => "bin/minijail0",
            Tool::ProcessWrapper => "bin/process_wrapper",
            Tool::LlvmCov => "bin/llvm-cov",
            Tool::LlvmProfdata => "bin/llvm-profdata",
            Tool::LlvmSymbolizer => "bin/llvm-symbolizer",
            Tool::GenHtml => "bin/genhtml",
            Tool::JavaHome => "jdk",
            Tool::IncludeDir => "include",
        }
    }

    /// Executable name searched on `PATH`, if the tool is a program.
    fn program_name(self) -> Option<&'static str> {
        match self {
            Tool::Minijail => Some("minijail0"),
            Tool::ProcessWrapper => Some("process_wrapper"),
            Tool::LlvmCov => Some("llvm-cov"),
            Tool::LlvmProfdata => Some("llvm-profdata"),
            Tool::LlvmSymbolizer => Some("llvm-symbolizer"),
            Tool::GenHtml => Some("genhtml"),
            Tool::JavaHome | Tool::IncludeDir => None,
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tool::Minijail => "minijail0",
            Tool::ProcessWrapper => "process_wrapper",
            Tool::LlvmCov => "llvm-cov",
            Tool::LlvmProfdata => "llvm-profdata",
            Tool::LlvmSymbolizer => "llvm-symbolizer",
            Tool::GenHtml => "genhtml",
            Tool::JavaHome => "Java home",
            Tool::IncludeDir => "include directory",
        };
        f.write_str(name)
    }
}

/// Resolves the path of an external tool.
pub trait ToolFinder: Send + Sync {
    fn tool_path(&self, tool: Tool) -> Result<PathBuf, ToolError>;
}

/// Production finder: environment override, then the install layout,
/// then `PATH`.
#[derive(Debug, Clone)]
pub struct InstallLayoutFinder {
    install_dir: PathBuf,
}

impl InstallLayoutFinder {
    pub fn new(install_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_dir: install_dir.into(),
        }
    }

    /// Uses `$CIFUZZ_INSTALL_ROOT`, falling back to
    /// `~/.local/share/cifuzz`.
    pub fn from_env() -> Self {
        let install_dir = match env::var_os(INSTALL_ROOT_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => default_install_dir(),
        };
        Self::new(install_dir)
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }
}

fn default_install_dir() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
        .join(".local/share/cifuzz")
}

impl ToolFinder for InstallLayoutFinder {
    fn tool_path(&self, tool: Tool) -> Result<PathBuf, ToolError> {
        if let Some(value) = env::var_os(tool.env_var()).filter(|v| !v.is_empty()) {
            let path = PathBuf::from(value);
            if !path.exists() {
                return Err(ToolError::BadOverride {
                    tool,
                    env_var: tool.env_var(),
                    path,
                });
            }
            debug!("Using {} from ${}: {}", tool, tool.env_var(), path.display());
            return Ok(path);
        }

        let installed = self.install_dir.join(tool.install_path());
        if installed.exists() {
            return Ok(installed);
        }

        if let Some(program) = tool.program_name() {
            if let Ok(path) = which::which(program) {
                debug!("Using {} from PATH: {}", tool, path.display());
                return Ok(path);
            }
        }

        Err(ToolError::NotFound {
            tool,
            env_var: tool.env_var(),
            searched: installed,
        })
    }
}

/// Finder returning fixed paths, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticToolFinder {
    paths: HashMap<Tool, PathBuf>,
}

impl StaticToolFinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tool: Tool, path: impl Into<PathBuf>) -> Self {
        self.paths.insert(tool, path.into());
        self
    }
}

impl ToolFinder for StaticToolFinder {
    fn tool_path(&self, tool: Tool) -> Result<PathBuf, ToolError> {
        self.paths
            .get(&tool)
            .cloned()
            .ok_or_else(|| ToolError::NotFound {
                tool,
                env_var: tool.env_var(),
                searched: PathBuf::from("<static>"),
            })
    }
}
