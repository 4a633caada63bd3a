use crate::config::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// What a build-system adapter hands over after compiling a fuzz test.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BuildResult {
    pub executable: PathBuf,
    #[serde(default)]
    pub build_dir: PathBuf,
    #[serde(default)]
    pub seed_corpus: Option<PathBuf>,
    #[serde(default)]
    pub generated_corpus: Option<PathBuf>,
    /// Shared libraries and other files the executable needs at runtime.
    #[serde(default)]
    pub runtime_deps: Vec<PathBuf>,
    #[serde(default)]
    pub sanitizers: Vec<String>,
}

impl BuildResult {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            ..Default::default()
        }
    }

    /// Reads a build result written by a build-system adapter.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Runtime dependencies that are instrumented objects, i.e. shared
    /// libraries inside the build directory.
    pub fn instrumented_objects(&self) -> impl Iterator<Item = &Path> {
        self.runtime_deps
            .iter()
            .map(PathBuf::as_path)
            .filter(|dep| dep.starts_with(&self.build_dir) && is_shared_object(dep))
    }
}

fn is_shared_object(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    name.ends_with(".so") || name.contains(".so.") || name.ends_with(".dylib")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_shared_objects_from_the_build_dir_are_instrumented() {
        let mut result = BuildResult::new("/build/my_fuzz_test");
        result.build_dir = PathBuf::from("/build");
        result.runtime_deps = vec![
            PathBuf::from("/build/libparser.so"),
            PathBuf::from("/build/libparser.so.1"),
            PathBuf::from("/build/data/dict.txt"),
            PathBuf::from("/usr/lib/libc.so.6"),
        ];
        let objects: Vec<_> = result.instrumented_objects().collect();
        assert_eq!(
            objects,
            vec![
                Path::new("/build/libparser.so"),
                Path::new("/build/libparser.so.1")
            ]
        );
    }

    #[test]
    fn deserializes_from_toml() {
        let result: BuildResult = toml::from_str(
            r#"
            executable = "/build/fuzz"
            build-dir = "/build"
            seed-corpus = "/src/fuzz_inputs"
            sanitizers = ["address", "undefined"]
            "#,
        )
        .unwrap();
        assert_eq!(result.seed_corpus, Some(PathBuf::from("/src/fuzz_inputs")));
        assert!(result.runtime_deps.is_empty());
        assert_eq!(result.sanitizers.len(), 2);
    }

    #[test]
    fn rejects_unknown_keys_in_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.toml");
        std::fs::write(&path, "executable = \"/b/fuzz\"\ncorpus = \"x\"\n").unwrap();
        assert!(matches!(
            BuildResult::load_from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
