//! Task inputs and the fingerprints derived from them.
//!
//! A fingerprint answers a single question: "if this task ran again, could it
//! possibly produce something different?" It covers the name of the task, its
//! declared inputs and the artifacts of its direct dependencies, so a change anywhere
//! upstream ripples down into every dependent's fingerprint.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::{Artifact, Blake3Hasher, Hash32};

/// Cache key of a task execution.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Fingerprint(pub(crate) Hash32);

impl Fingerprint {
    pub fn hash(&self) -> Hash32 {
        self.0
    }

    pub fn to_hex(self) -> String {
        self.0.to_hex()
    }
}

impl From<Hash32> for Fingerprint {
    fn from(hash: Hash32) -> Self {
        Fingerprint(hash)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.short())
    }
}

/// Declared inputs of a task.
///
/// Files are matched by glob patterns and resolved at fingerprinting time, so
/// adding a file that matches a pattern changes the fingerprint as well.
/// Values are arbitrary configuration strings, such as a compiler release
/// level or a toolchain version.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inputs {
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    values: BTreeMap<String, String>,
}

impl Inputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file path or glob pattern.
    pub fn file(mut self, pattern: impl Into<String>) -> Self {
        self.files.push(pattern.into());
        self
    }

    pub fn files<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.values.is_empty()
    }

    pub fn patterns(&self) -> &[String] {
        &self.files
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    /// Expands every pattern into the sorted, deduplicated list of matching
    /// files. A pattern that matches nothing contributes nothing.
    pub fn resolve_files(&self, root: &Utf8Path) -> anyhow::Result<Vec<Utf8PathBuf>> {
        let mut paths = Vec::new();

        for pattern in &self.files {
            let pattern = root.join(pattern);
            for entry in glob::glob(pattern.as_str())? {
                let path = Utf8PathBuf::try_from(entry?)?;
                if path.is_file() {
                    paths.push(path);
                }
            }
        }

        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    /// Computes the fingerprint of task `task` with these inputs, given the
    /// artifacts of its dependencies in declaration order. Two tasks never
    /// share a fingerprint, even with identical inputs.
    pub fn fingerprint(&self, task: &str, root: &Utf8Path, upstream: &[&Artifact]) -> anyhow::Result<Fingerprint> {
        let mut hasher = Blake3Hasher::default();

        hasher.field("task").field(task);

        hasher.field("values");
        for (key, value) in &self.values {
            hasher.field(key).field(value);
        }

        hasher.field("files");
        for path in self.resolve_files(root)? {
            let hash = Hash32::hash_file(&path)?;
            let relative = path.strip_prefix(root).unwrap_or(path.as_path());
            hasher.field(relative.as_str()).field(hash.as_bytes());
        }

        hasher.field("upstream");
        for artifact in upstream {
            hasher.field(artifact.hash().as_bytes());
        }

        Ok(Fingerprint(hasher.finish()))
    }
}
