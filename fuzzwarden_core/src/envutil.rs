//! Environment overlays for child processes.
//!
//! The supervising process never mutates its own environment. Each run
//! builds an [`EnvOverlay`] and applies it on top of a copy of the base
//! environment when the command is spawned.

use std::env;
use std::ffi::OsString;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EnvError {
    #[error("invalid environment variable name: {0:?}")]
    InvalidKey(String),
    #[error("invalid value for environment variable {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

/// Ordered set of `KEY=value` pairs. Setting an existing key replaces
/// its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverlay {
    vars: Vec<(String, String)>,
}

impl EnvOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `KEY=value` strings, as given on the command line.
    pub fn from_assignments<S: AsRef<str>>(assignments: &[S]) -> Result<Self, EnvError> {
        let mut overlay = Self::new();
        for assignment in assignments {
            let assignment = assignment.as_ref();
            let (key, value) = assignment
                .split_once('=')
                .ok_or_else(|| EnvError::InvalidKey(assignment.to_string()))?;
            overlay.set(key, value)?;
        }
        Ok(overlay)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), EnvError> {
        if key.is_empty() || key.contains(['=', '\0']) {
            return Err(EnvError::InvalidKey(key.to_string()));
        }
        if value.contains('\0') {
            return Err(EnvError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            });
        }
        match self.vars.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.vars.push((key.to_string(), value.to_string())),
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Copies every variable of `other` into `self`, overwriting.
    pub fn extend_from(&mut self, other: &EnvOverlay) -> Result<(), EnvError> {
        for (key, value) in &other.vars {
            self.set(key, value)?;
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// The current process environment with this overlay applied on top.
    pub fn apply_to_current(&self) -> Vec<(OsString, OsString)> {
        self.merge_onto(env::vars_os())
    }

    /// Applies the overlay to `base`. Base variables that are not valid
    /// UTF-8 are kept as they are.
    pub fn merge_onto<I>(&self, base: I) -> Vec<(OsString, OsString)>
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let mut merged: Vec<(OsString, OsString)> = base.into_iter().collect();
        for (key, value) in &self.vars {
            match merged.iter_mut().find(|(k, _)| k == key.as_str()) {
                Some(entry) => entry.1 = OsString::from(value),
                None => merged.push((OsString::from(key), OsString::from(value))),
            }
        }
        merged
    }
}

/// Appends `value` to a colon-separated option list such as
/// `ASAN_OPTIONS`, so that later entries override earlier ones.
pub fn join_options(ours: &str, theirs: Option<&str>) -> String {
    match theirs {
        Some(theirs) if !theirs.is_empty() => format!("{ours}:{theirs}"),
        _ => ours.to_string(),
    }
}

/// Quotes an argument for a POSIX shell if needed.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// A shell command line reproducing the invocation, prefixed with the
/// overlay's variables. Only the overlay is printed, never the inherited
/// environment, to avoid leaking secrets into logs.
pub fn quoted_command_with_env<S: AsRef<str>>(args: &[S], overlay: &EnvOverlay) -> String {
    overlay
        .iter()
        .map(|(k, v)| format!("{k}={}", shell_quote(v)))
        .chain(args.iter().map(|a| shell_quote(a.as_ref())))
        .collect::<Vec<_>>()
        .join(" ")
}
