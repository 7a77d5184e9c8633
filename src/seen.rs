// src/seen.rs
//! Append-only record of links already dispatched, one `rule<TAB>link` per line.
//!
//! Entries are scoped to the rule that sent them, so two rules watching the
//! same page deliver independently. A line without a tab (older files) counts
//! as seen for every rule.
//!
//! The whole file is read into memory at start-up, so start-up cost grows
//! with the file (O(file size)). There is no compaction.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::error::SeenStoreError;

#[derive(Debug)]
pub struct SeenSet {
    path: PathBuf,
    entries: HashSet<(String, String)>,
    unscoped: HashSet<String>,
    count: Arc<AtomicUsize>,
}

impl SeenSet {
    /// Load every persisted entry. A missing file is an empty set; it is
    /// created on the first [`record`](Self::record).
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SeenStoreError> {
        let path = path.into();
        let mut entries = HashSet::new();
        let mut unscoped = HashSet::new();
        match fs::read_to_string(&path) {
            Ok(content) => {
                for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
                    match line.split_once('\t') {
                        Some((rule, link)) => {
                            entries.insert((rule.trim().to_string(), link.trim().to_string()));
                        }
                        None => {
                            unscoped.insert(line.to_string());
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "seen-links file missing, starting empty");
            }
            Err(source) => return Err(io_err(&path, source)),
        }
        let count = Arc::new(AtomicUsize::new(entries.len() + unscoped.len()));
        info!(path = %path.display(), links = count.load(Ordering::Relaxed), "seen-links loaded");
        Ok(Self {
            path,
            entries,
            unscoped,
            count,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has(&self, rule: &str, link: &str) -> bool {
        let link = link.trim();
        self.unscoped.contains(link) || self.entries.contains(&(rule.to_string(), link.to_string()))
    }

    /// Record `link` for `rule`, appending it to the file. Recording a known entry is a no-op.
    pub fn record(&mut self, rule: &str, link: &str) -> Result<(), SeenStoreError> {
        let link = link.trim();
        if link.is_empty() || self.has(rule, link) {
            return Ok(());
        }
        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| io_err(&self.path, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| io_err(&self.path, e))?;
        writeln!(file, "{rule}\t{link}").map_err(|e| io_err(&self.path, e))?;
        file.flush().map_err(|e| io_err(&self.path, e))?;

        self.entries.insert((rule.to_string(), link.to_string()));
        self.count.store(self.len(), Ordering::Relaxed);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len() + self.unscoped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock-free size readout for diagnostics.
    pub fn count_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.count)
    }
}

fn io_err(path: &Path, source: std::io::Error) -> SeenStoreError {
    SeenStoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("sent_links.txt");

        let mut seen = SeenSet::load(&path).unwrap();
        assert!(seen.is_empty());
        seen.record("gate", "https://x.example/a/1").unwrap();
        assert!(seen.has("gate", "https://x.example/a/1"));

        let reloaded = SeenSet::load(&path).unwrap();
        assert!(reloaded.has("gate", "https://x.example/a/1"));
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn entries_are_scoped_per_rule() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sent_links.txt");

        let mut seen = SeenSet::load(&path).unwrap();
        seen.record("a", "L").unwrap();
        assert!(seen.has("a", "L"));
        assert!(!seen.has("b", "L"));

        seen.record("b", "L").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "a\tL\nb\tL\n");
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn duplicate_record_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sent_links.txt");

        let mut seen = SeenSet::load(&path).unwrap();
        seen.record("r", "L").unwrap();
        seen.record("r", "L").unwrap();
        seen.record("r", "  L  ").unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "r\tL\n");
        assert_eq!(seen.count_handle().load(Ordering::Relaxed), 1);
    }

    #[test]
    fn plain_lines_count_for_every_rule() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sent_links.txt");
        fs::write(&path, "a\n\n  \nr\tb\n").unwrap();
        let seen = SeenSet::load(&path).unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.has("anything", "a"));
        assert!(seen.has("r", "b"));
        assert!(!seen.has("other", "b"));
    }
}
