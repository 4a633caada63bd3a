//! Paths made visible inside the sandbox, in minijail's `-b` syntax.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while parsing a binding from minijail's `-b` syntax.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BindingError {
    /// The third field was present but was not `0` or `1`.
    #[error("Bad binding {binding:?}: writable flag {flag:?} is not 0 or 1")]
    BadWritableFlag { binding: String, flag: String },
}

/// Whether a bound path can be written to from inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Writable {
    #[default]
    ReadOnly,
    ReadWrite,
}

/// A host path made visible inside the sandbox.
///
/// `target` is the mount point inside the chroot; when it is `None` the
/// source path is mounted at the same location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub source: PathBuf,
    pub target: Option<PathBuf>,
    pub writable: Writable,
}

impl Binding {
    pub fn read_only(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: None,
            writable: Writable::ReadOnly,
        }
    }

    pub fn read_write(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: None,
            writable: Writable::ReadWrite,
        }
    }

    pub fn with_target(mut self, target: impl Into<PathBuf>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// The mount point inside the sandbox.
    pub fn target(&self) -> &Path {
        match &self.target {
            Some(target) if !target.as_os_str().is_empty() => target,
            _ => &self.source,
        }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = self.source.display().to_string();
        let target = self.target().display().to_string();

        if self.writable == Writable::ReadWrite {
            return write!(f, "{source},{target},1");
        }
        // minijail would read a comma inside a path as a field separator
        if source.contains(',') || target.contains(',') {
            return write!(f, "{source},{target},0");
        }
        if source != target {
            return write!(f, "{source},{target}");
        }
        write!(f, "{source}")
    }
}

impl FromStr for Binding {
    type Err = BindingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.splitn(3, ',');
        let source = tokens.next().unwrap_or_default();
        let target = tokens.next().unwrap_or_default();
        let writable = match tokens.next() {
            None => Writable::ReadOnly,
            Some(flag) => match flag.trim().parse::<u8>() {
                Ok(0) => Writable::ReadOnly,
                Ok(1) => Writable::ReadWrite,
                _ => {
                    return Err(BindingError::BadWritableFlag {
                        binding: s.to_string(),
                        flag: flag.to_string(),
                    });
                }
            },
        };

        let target = if target.is_empty() { source } else { target };
        Ok(Binding {
            source: PathBuf::from(source),
            target: Some(PathBuf::from(target)),
            writable,
        })
    }
}

/// Parses the colon-separated binding list used by the
/// `CIFUZZ_MINIJAIL_BINDINGS` environment variable. Empty entries are
/// ignored.
pub fn parse_binding_list(list: &str) -> Result<Vec<Binding>, BindingError> {
    list.split(':')
        .filter(|entry| !entry.is_empty())
        .map(Binding::from_str)
        .collect()
}
