//! Context drift detection for tracked input files.
//!
//! A baseline of SHA-256 fingerprints is captured when the workflow starts and
//! compared at every phase boundary. Under [`DriftPolicy::Warn`] a drift
//! record is logged and the transition proceeds; under [`DriftPolicy::Block`]
//! the transition halts and escalates with the report attached.
//!
//! ## Usage
//!
//! ```no_run
//! use foreman::drift::DriftDetector;
//! use std::path::Path;
//!
//! let detector = DriftDetector::with_default_patterns(Path::new("."));
//! let baseline = detector.capture().unwrap();
//! // ... phase runs ...
//! let report = detector.check(&baseline).unwrap();
//! if !report.is_empty() {
//!     println!("{}", report);
//! }
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Files tracked when no patterns are configured.
pub const DEFAULT_TRACKED_PATTERNS: &[&str] = &[
    "AGENTS.md",
    "PRODUCT.md",
    "CLAUDE.md",
    "GEMINI.md",
    ".cursor/rules",
];

/// What to do when a tracked file changes between phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftPolicy {
    #[default]
    Warn,
    Block,
}

impl fmt::Display for DriftPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriftPolicy::Warn => write!(f, "warn"),
            DriftPolicy::Block => write!(f, "block"),
        }
    }
}

impl std::str::FromStr for DriftPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "warn" => Ok(DriftPolicy::Warn),
            "block" => Ok(DriftPolicy::Block),
            _ => Err(format!(
                "invalid drift policy '{}'. Valid values: warn, block",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub sha256: String,
    pub size: u64,
}

impl FileFingerprint {
    pub fn of_file(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(Self {
            sha256: format!("{:x}", hasher.finalize()),
            size: bytes.len() as u64,
        })
    }
}

/// Fingerprints of the tracked set, keyed by path relative to the project root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBaseline {
    pub captured_at: DateTime<Utc>,
    pub files: BTreeMap<String, FileFingerprint>,
}

/// Paths that differ between a baseline and the current tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReport {
    pub changed: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl DriftReport {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.changed.len() + self.added.len() + self.removed.len()
    }
}

impl fmt::Display for DriftReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.changed.is_empty() {
            parts.push(format!("changed: {}", self.changed.join(", ")));
        }
        if !self.added.is_empty() {
            parts.push(format!("added: {}", self.added.join(", ")));
        }
        if !self.removed.is_empty() {
            parts.push(format!("removed: {}", self.removed.join(", ")));
        }
        if parts.is_empty() {
            write!(f, "no drift")
        } else {
            write!(f, "{}", parts.join("; "))
        }
    }
}

/// Fingerprints a set of glob patterns under a project root.
#[derive(Debug, Clone)]
pub struct DriftDetector {
    root: PathBuf,
    patterns: Vec<String>,
}

impl DriftDetector {
    pub fn new(root: &Path, patterns: Vec<String>) -> Self {
        Self {
            root: root.to_path_buf(),
            patterns,
        }
    }

    pub fn with_default_patterns(root: &Path) -> Self {
        Self::new(
            root,
            DEFAULT_TRACKED_PATTERNS.iter().map(|p| p.to_string()).collect(),
        )
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Expand the patterns into relative file paths. A pattern matching a
    /// directory tracks every file below it.
    fn tracked_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        // Only the configured pattern is glob syntax; paths are matched literally.
        let root = glob::Pattern::escape(&self.root.to_string_lossy());
        for pattern in &self.patterns {
            let full = format!("{}/{}", root.trim_end_matches('/'), pattern);
            let entries =
                glob::glob(&full).with_context(|| format!("Invalid tracked pattern: {}", pattern))?;
            for entry in entries.flatten() {
                if entry.is_dir() {
                    let nested = format!(
                        "{}/**/*",
                        glob::Pattern::escape(&entry.to_string_lossy())
                    );
                    let nested = glob::glob(&nested)
                        .with_context(|| format!("Invalid tracked pattern: {}", pattern))?;
                    files.extend(nested.flatten().filter(|p| p.is_file()));
                } else if entry.is_file() {
                    files.push(entry);
                }
            }
        }

        let mut relative: Vec<String> = files
            .iter()
            .filter_map(|p| p.strip_prefix(&self.root).ok())
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .collect();
        relative.sort();
        relative.dedup();
        Ok(relative)
    }

    /// Fingerprint every tracked file as it is now.
    pub fn capture(&self) -> Result<ContextBaseline> {
        let mut files = BTreeMap::new();
        for rel in self.tracked_files()? {
            let fingerprint = FileFingerprint::of_file(&self.root.join(&rel))?;
            files.insert(rel, fingerprint);
        }
        debug!(count = files.len(), "Captured context baseline");
        Ok(ContextBaseline {
            captured_at: Utc::now(),
            files,
        })
    }

    /// Diff two baselines.
    pub fn compare(before: &ContextBaseline, after: &ContextBaseline) -> DriftReport {
        let mut report = DriftReport::default();
        for (path, fingerprint) in &before.files {
            match after.files.get(path) {
                Some(current) if current != fingerprint => report.changed.push(path.clone()),
                Some(_) => {}
                None => report.removed.push(path.clone()),
            }
        }
        for path in after.files.keys() {
            if !before.files.contains_key(path) {
                report.added.push(path.clone());
            }
        }
        report
    }

    /// Recompute fingerprints and diff against `baseline`.
    pub fn check(&self, baseline: &ContextBaseline) -> Result<DriftReport> {
        let current = self.capture()?;
        Ok(Self::compare(baseline, &current))
    }
}
