//! Exercise registry: reference harnesses and the signatures they expect.
//!
//! Exercises are discovered under one or more base directories laid out as
//! `guide-<g>/exercise-<e>.c`, with an optional `exercise-<e>.json` sidecar:
//!
//! ```json
//! { "enabled": true, "functionSignature": "int multiplyByTwo(int x)" }
//! ```
//!
//! Without a sidecar signature, the first prototype declared by the harness
//! is used. Base directories are searched in order and the first match for
//! an id wins.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use juez_common::{Exercise, ExerciseId, FunctionSignature, JudgeError, JudgeResult};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("none of the tests directories exist: {0:?}")]
    NoRoots(Vec<PathBuf>),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExerciseMetadata {
    #[serde(default = "default_enabled")]
    enabled: bool,
    function_signature: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// Immutable set of exercises shared by every grading attempt.
#[derive(Debug, Default)]
pub struct Registry {
    exercises: BTreeMap<ExerciseId, Arc<Exercise>>,
}

impl Registry {
    /// Scan the given base directories.
    ///
    /// Missing directories are skipped; it is an error only when none exist.
    /// Harnesses that cannot be read or whose signature cannot be determined
    /// are logged and left out.
    pub fn load(roots: &[PathBuf]) -> Result<Self, RegistryError> {
        let mut exercises = BTreeMap::new();
        let mut found_root = false;

        for root in roots {
            if !root.is_dir() {
                debug!(path = %root.display(), "Tests directory not present, skipping");
                continue;
            }
            found_root = true;

            for (id, harness) in discover(root) {
                if exercises.contains_key(&id) {
                    debug!(exercise_id = %id, path = %harness.display(), "Shadowed by an earlier tests directory");
                    continue;
                }
                match load_exercise(root, id) {
                    Ok(exercise) => {
                        exercises.insert(id, Arc::new(exercise));
                    }
                    Err(reason) => {
                        warn!(exercise_id = %id, path = %harness.display(), %reason, "Skipping exercise");
                    }
                }
            }
        }

        if !found_root {
            return Err(RegistryError::NoRoots(roots.to_vec()));
        }

        let registry = Self { exercises };
        info!(
            exercises = registry.len(),
            enabled = registry.list().count(),
            "Exercise registry loaded"
        );
        Ok(registry)
    }

    /// Build a registry from already constructed exercises.
    pub fn from_exercises(exercises: impl IntoIterator<Item = Exercise>) -> Self {
        Self {
            exercises: exercises
                .into_iter()
                .map(|exercise| (exercise.id, Arc::new(exercise)))
                .collect(),
        }
    }

    /// Find an enabled exercise.
    pub fn lookup(&self, id: &ExerciseId) -> JudgeResult<Arc<Exercise>> {
        self.exercises
            .get(id)
            .filter(|exercise| exercise.enabled)
            .cloned()
            .ok_or_else(|| JudgeError::NotFound(format!("exercise {id}")))
    }

    /// Enabled exercises in id order.
    pub fn list(&self) -> impl Iterator<Item = &Arc<Exercise>> {
        self.exercises.values().filter(|exercise| exercise.enabled)
    }

    /// Number of known exercises, disabled ones included.
    pub fn len(&self) -> usize {
        self.exercises.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exercises.is_empty()
    }
}

/// SHA-256 of a harness, hex encoded.
pub fn content_version(source: &str) -> String {
    hex::encode(Sha256::digest(source.as_bytes()))
}

/// Build an exercise from its harness text and optional sidecar values.
pub fn build_exercise(
    id: ExerciseId,
    test_source: String,
    signature: Option<&str>,
    enabled: bool,
) -> Result<Exercise, String> {
    let signature = match signature {
        Some(text) => text
            .parse::<FunctionSignature>()
            .map_err(|e| format!("invalid functionSignature: {e}"))?,
        None => FunctionSignature::extract_from_source(&test_source)
            .ok_or_else(|| "harness declares no function prototype".to_string())?,
    };

    Ok(Exercise {
        id,
        version: content_version(&test_source),
        test_source,
        signature,
        enabled,
    })
}

/// Harness files directly under `guide-*/` directories of `root`.
fn discover(root: &Path) -> Vec<(ExerciseId, PathBuf)> {
    WalkDir::new(root)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "Error walking tests directory");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let path = entry.path();
            if path.extension()? != "c" {
                return None;
            }
            let guide = path.parent()?.file_name()?.to_str()?;
            let exercise = path.file_stem()?.to_str()?;
            if !guide.starts_with("guide-") || !exercise.starts_with("exercise-") {
                return None;
            }
            let id = format!("{guide}/{exercise}").parse().ok()?;
            Some((id, path.to_path_buf()))
        })
        .collect()
}

fn load_exercise(root: &Path, id: ExerciseId) -> Result<Exercise, String> {
    let test_source = std::fs::read_to_string(root.join(id.harness_path()))
        .map_err(|e| format!("unreadable harness: {e}"))?;

    let metadata_path = root.join(id.metadata_path());
    let metadata = if metadata_path.is_file() {
        let raw = std::fs::read_to_string(&metadata_path)
            .map_err(|e| format!("unreadable metadata: {e}"))?;
        serde_json::from_str::<ExerciseMetadata>(&raw)
            .map_err(|e| format!("invalid metadata: {e}"))?
    } else {
        ExerciseMetadata {
            enabled: true,
            function_signature: None,
        }
    };

    build_exercise(
        id,
        test_source,
        metadata.function_signature.as_deref(),
        metadata.enabled,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const HARNESS: &str = "#include <assert.h>\nint twice(int x);\nint main(void)\n{\n    assert(twice(2) == 4);\n    return 0;\n}\n";

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_load_discovers_harnesses() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "guide-1/exercise-1.c", HARNESS);
        write(dir.path(), "guide-1/notes.txt", "ignored");
        write(dir.path(), "guide-2/exercise-10.c", HARNESS);

        let registry = Registry::load(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(registry.len(), 2);

        let exercise = registry.lookup(&ExerciseId::new(2, 10)).unwrap();
        assert_eq!(exercise.signature.name, "twice");
        assert_eq!(exercise.version, content_version(HARNESS));
        assert_eq!(exercise.version.len(), 64);
    }

    #[test]
    fn test_sidecar_overrides_signature_and_disables() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "guide-1/exercise-1.c", HARNESS);
        write(
            dir.path(),
            "guide-1/exercise-1.json",
            r#"{"functionSignature": "int twice(int value)"}"#,
        );
        write(dir.path(), "guide-1/exercise-2.c", HARNESS);
        write(dir.path(), "guide-1/exercise-2.json", r#"{"enabled": false}"#);

        let registry = Registry::load(&[dir.path().to_path_buf()]).unwrap();
        let exercise = registry.lookup(&ExerciseId::new(1, 1)).unwrap();
        assert_eq!(exercise.signature.params[0].name.as_deref(), Some("value"));

        assert!(matches!(
            registry.lookup(&ExerciseId::new(1, 2)),
            Err(JudgeError::NotFound(_))
        ));
        assert_eq!(registry.list().count(), 1);
    }

    #[test]
    fn test_first_root_wins_and_missing_roots_are_skipped() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        write(first.path(), "guide-1/exercise-1.c", HARNESS);
        write(
            second.path(),
            "guide-1/exercise-1.c",
            "int other(int x);\nint main(void) { return 0; }\n",
        );

        let roots = vec![
            first.path().join("missing"),
            first.path().to_path_buf(),
            second.path().to_path_buf(),
        ];
        let registry = Registry::load(&roots).unwrap();
        let exercise = registry.lookup(&ExerciseId::new(1, 1)).unwrap();
        assert_eq!(exercise.signature.name, "twice");
    }

    #[test]
    fn test_harness_without_prototype_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "guide-1/exercise-1.c", "int main(void) { return 0; }\n");
        let registry = Registry::load(&[dir.path().to_path_buf()]).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_no_roots_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Registry::load(&[dir.path().join("nope")]);
        assert!(matches!(result, Err(RegistryError::NoRoots(_))));
    }

    #[test]
    fn test_unknown_exercise_is_not_found() {
        let registry = Registry::from_exercises(Vec::new());
        let err = registry.lookup(&ExerciseId::new(9, 9)).unwrap_err();
        assert_eq!(err.status_code(), 404);
    }
}
