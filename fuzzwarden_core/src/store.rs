//! On-disk finding storage.
//!
//! ```text
//! <project>/.cifuzz-findings/<name>/finding.json
//!                                  /crashing-input
//!                                  /.lock
//! ```

use crate::finding::Finding;
use crate::lock::FileLock;
use std::cmp::Reverse;
use std::env;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

pub const FINDINGS_DIR: &str = ".cifuzz-findings";
const JSON_FILE: &str = "finding.json";
const CRASHING_INPUT: &str = "crashing-input";
const LOCK_FILE: &str = ".lock";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Finding {0} does not exist")]
    NotFound(String),
    #[error("Finding {0} has no input file to copy")]
    MissingInput(String),
    #[error("Failed to {action} {path:?}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        source: io::Error,
    },
    #[error("Failed to parse finding {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Failed to serialize finding {name}: {source}")]
    Serialize {
        name: String,
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> Self + 'a {
        move |source| StoreError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Result of [`FindingStore::save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// A record with the same name exists; it was left unchanged.
    AlreadyExists,
}

#[derive(Debug, Clone)]
pub struct FindingStore {
    project_dir: PathBuf,
}

impl FindingStore {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn findings_dir(&self) -> PathBuf {
        self.project_dir.join(FINDINGS_DIR)
    }

    pub fn finding_dir(&self, name: &str) -> PathBuf {
        self.findings_dir().join(name)
    }

    fn json_path(&self, name: &str) -> PathBuf {
        self.finding_dir(name).join(JSON_FILE)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.json_path(name).is_file()
    }

    /// Writes the finding's JSON record. An existing record is never
    /// overwritten.
    pub fn save(&self, finding: &Finding) -> Result<SaveOutcome, StoreError> {
        let dir = self.finding_dir(&finding.name);
        fs::create_dir_all(&dir).map_err(StoreError::io("create", &dir))?;

        let json = serde_json::to_vec_pretty(finding).map_err(|source| StoreError::Serialize {
            name: finding.name.clone(),
            source,
        })?;

        let path = dir.join(JSON_FILE);
        let mut tmp = NamedTempFile::new_in(&dir).map_err(StoreError::io("create", &dir))?;
        tmp.write_all(&json)
            .map_err(StoreError::io("write", tmp.path()))?;
        // persist_noclobber fails instead of replacing a concurrent writer's record
        match tmp.persist_noclobber(&path) {
            Ok(_) => {
                debug!("Saved finding {} to {}", finding.name, path.display());
                Ok(SaveOutcome::Saved)
            }
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                debug!("Finding {} already exists, not overwriting", finding.name);
                Ok(SaveOutcome::AlreadyExists)
            }
            Err(e) => Err(StoreError::Io {
                action: "write",
                path,
                source: e.error,
            }),
        }
    }

    /// Copies the finding's crashing input into its finding directory and
    /// into `seed_corpus_dir`, then rewrites `input_file` relative to the
    /// project directory and scrubs the original path from the logs.
    ///
    /// Serialized across processes by the finding's lock file.
    pub fn copy_input_file_and_update(
        &self,
        finding: &mut Finding,
        seed_corpus_dir: &Path,
    ) -> Result<(), StoreError> {
        let dir = self.finding_dir(&finding.name);
        fs::create_dir_all(&dir).map_err(StoreError::io("create", &dir))?;
        let lock_path = dir.join(LOCK_FILE);
        let _lock = FileLock::acquire(&lock_path).map_err(StoreError::io("lock", &lock_path))?;

        let input = finding
            .input_file
            .clone()
            .ok_or_else(|| StoreError::MissingInput(finding.name.clone()))?;

        let target = dir.join(CRASHING_INPUT);
        copy_atomically(&input, &target)?;

        fs::create_dir_all(seed_corpus_dir).map_err(StoreError::io("create", seed_corpus_dir))?;
        let seed_path = seed_corpus_dir.join(&finding.name);
        copy_atomically(&input, &seed_path)?;
        finding.seed_path = Some(seed_path);

        // Logs may be shared, so they must not reveal the local directory
        // layout.
        let cwd = env::current_dir().map_err(StoreError::io("resolve", Path::new(".")))?;
        let shown = relative_path(&absolute(&target, &cwd), &cwd);
        let original = input.display().to_string();
        let replacement = shown.display().to_string();
        for line in &mut finding.logs {
            if line.contains(&original) {
                *line = line.replace(&original, &replacement);
            }
        }
        debug!("Copied input file from {} to {}", original, target.display());

        let project_dir = absolute(&self.project_dir, &cwd);
        finding.input_file = Some(relative_path(&absolute(&target, &cwd), &project_dir));
        Ok(())
    }

    /// All findings, newest first. A missing findings directory is empty.
    /// Directories without a record, left behind when saving was
    /// interrupted after the input was copied, are skipped.
    pub fn list(&self) -> Result<Vec<Finding>, StoreError> {
        let dir = self.findings_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io("read", &dir)(e)),
        };

        let mut findings = Vec::new();
        for entry in entries {
            let entry = entry.map_err(StoreError::io("read", &dir))?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match self.load(&name) {
                Ok(finding) => findings.push(finding),
                Err(StoreError::NotFound(_)) => {
                    warn!("Skipping finding {}: {} is missing", name, JSON_FILE);
                }
                Err(e) => return Err(e),
            }
        }
        findings.sort_by_key(|f| Reverse(f.created_at));
        Ok(findings)
    }

    pub fn load(&self, name: &str) -> Result<Finding, StoreError> {
        let path = self.json_path(name);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_string()));
            }
            Err(e) => return Err(StoreError::io("open", &path)(e)),
        };
        serde_json::from_reader(BufReader::new(file))
            .map_err(|source| StoreError::Parse { path, source })
    }
}

/// Readers of `dest` see either the old file or the complete new one.
fn copy_atomically(src: &Path, dest: &Path) -> Result<(), StoreError> {
    let dir = dest.parent().unwrap_or(Path::new("."));
    let tmp = NamedTempFile::new_in(dir).map_err(StoreError::io("create", dir))?;
    let mut reader = File::open(src).map_err(StoreError::io("open", src))?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        io::copy(&mut reader, &mut writer).map_err(StoreError::io("copy", src))?;
        writer.flush().map_err(StoreError::io("write", tmp.path()))?;
    }
    tmp.persist(dest).map_err(|e| StoreError::Io {
        action: "write",
        path: dest.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

fn absolute(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

/// `path` expressed relative to `base`. Both must be absolute.
fn relative_path(path: &Path, base: &Path) -> PathBuf {
    let path: Vec<Component> = normalized(path);
    let base: Vec<Component> = normalized(base);
    let common = path
        .iter()
        .zip(base.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..base.len() {
        rel.push("..");
    }
    for component in &path[common..] {
        rel.push(component.as_os_str());
    }
    if rel.as_os_str().is_empty() {
        rel.push(".");
    }
    rel
}

fn normalized(path: &Path) -> Vec<Component<'_>> {
    let mut out: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.last(), Some(Component::Normal(_))) {
                    out.pop();
                }
            }
            other => out.push(other),
        }
    }
    out
}
