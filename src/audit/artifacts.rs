//! Phase-scoped artifact directory: `.foreman/phases/<phase>/attempt-<n>/`.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::phase::Phase;

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn attempt_dir(&self, phase: Phase, attempt: u32) -> PathBuf {
        self.root
            .join(phase.name())
            .join(format!("attempt-{}", attempt))
    }

    fn prepare(&self, phase: Phase, attempt: u32, name: &str) -> Result<PathBuf> {
        let dir = self.attempt_dir(phase, attempt);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create artifact dir: {}", dir.display()))?;
        Ok(dir.join(name))
    }

    pub fn write_json<T: Serialize>(
        &self,
        phase: Phase,
        attempt: u32,
        name: &str,
        value: &T,
    ) -> Result<PathBuf> {
        let path = self.prepare(phase, attempt, name)?;
        let json = serde_json::to_string_pretty(value)
            .with_context(|| format!("Failed to serialize artifact {}", name))?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write artifact: {}", path.display()))?;
        Ok(path)
    }

    pub fn write_text(&self, phase: Phase, attempt: u32, name: &str, text: &str) -> Result<PathBuf> {
        let path = self.prepare(phase, attempt, name)?;
        fs::write(&path, text)
            .with_context(|| format!("Failed to write artifact: {}", path.display()))?;
        Ok(path)
    }

    /// Artifact files of one attempt, sorted by name.
    pub fn list(&self, phase: Phase, attempt: u32) -> Result<Vec<PathBuf>> {
        let dir = self.attempt_dir(phase, attempt);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)
            .with_context(|| format!("Failed to read {}", dir.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        Ok(files)
    }

    /// Path of the most recent `name` artifact for a phase, if any.
    pub fn latest(&self, phase: Phase, name: &str) -> Option<PathBuf> {
        let phase_dir = self.root.join(phase.name());
        let attempts = fs::read_dir(phase_dir).ok()?;
        attempts
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let n = e.file_name().to_string_lossy().strip_prefix("attempt-")?.parse::<u32>().ok()?;
                Some((n, e.path().join(name)))
            })
            .filter(|(_, p)| p.is_file())
            .max_by_key(|(n, _)| *n)
            .map(|(_, p)| p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_layout() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let path = store
            .write_json(Phase::Verifying, 2, "decision.json", &serde_json::json!({"approved": false}))
            .unwrap();
        assert_eq!(path, dir.path().join("verifying/attempt-2/decision.json"));
        store
            .write_text(Phase::Verifying, 2, "notes.md", "# notes")
            .unwrap();

        let files = store.list(Phase::Verifying, 2).unwrap();
        assert_eq!(files.len(), 2);
        assert!(store.list(Phase::Planning, 0).unwrap().is_empty());
    }

    #[test]
    fn test_latest_picks_highest_attempt() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.write_text(Phase::Planning, 0, "plan.json", "{}").unwrap();
        store.write_text(Phase::Planning, 10, "plan.json", "{}").unwrap();
        store.write_text(Phase::Planning, 2, "plan.json", "{}").unwrap();

        assert_eq!(
            store.latest(Phase::Planning, "plan.json").unwrap(),
            dir.path().join("planning/attempt-10/plan.json")
        );
        assert!(store.latest(Phase::Implementing, "result.json").is_none());
    }
}
