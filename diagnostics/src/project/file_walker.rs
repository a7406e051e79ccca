//! File Walker: Python source discovery using the `ignore` crate
//!
//! Skips configured directory names (virtual envs, caches, VCS metadata,
//! dependency folders), hidden directories and files above a size ceiling.

use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory names that never contain project sources.
pub const DEFAULT_IGNORE_DIRS: &[&str] = &[
    "venv",
    ".venv",
    "env",
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    ".git",
    ".svn",
    ".hg",
    "node_modules",
    "dist",
    "build",
    ".idea",
    ".vscode",
    ".tox",
    ".eggs",
];

/// 1 MiB
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1_048_576;

/// Ignore rules applied while walking a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Directory names skipped wherever they appear in the tree.
    pub ignore_dirs: Vec<String>,
    /// Files larger than this many bytes are skipped.
    pub max_file_size: u64,
    /// Descend into dot-prefixed directories.
    pub follow_hidden: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            ignore_dirs: DEFAULT_IGNORE_DIRS.iter().map(|s| s.to_string()).collect(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            follow_hidden: false,
        }
    }
}

impl ScanConfig {
    /// Whether a directory with this name is excluded from the walk.
    pub fn is_ignored_dir(&self, name: &str) -> bool {
        if name.ends_with(".egg-info") {
            return true;
        }
        if !self.follow_hidden && name.starts_with('.') && name.len() > 1 {
            return true;
        }
        self.ignore_dirs.iter().any(|d| d == name)
    }
}

/// Files found by a walk plus the ones rejected for size.
#[derive(Debug, Default)]
pub struct WalkOutcome {
    pub files: Vec<PathBuf>,
    pub oversized: Vec<PathBuf>,
}

/// Walks a project tree for `.py` files.
pub struct FileWalker {
    root: PathBuf,
    config: ScanConfig,
}

impl FileWalker {
    pub fn new(root: impl AsRef<Path>, config: ScanConfig) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            config,
        }
    }

    /// Return all Python files under root, sorted, with oversized files split out.
    pub fn python_files(&self) -> WalkOutcome {
        let mut outcome = WalkOutcome::default();
        let config = self.config.clone();
        let root = self.root.clone();

        let walker = WalkBuilder::new(&self.root)
            .hidden(false) // hidden dirs are handled by the name filter
            .git_ignore(true)
            .filter_entry(move |entry| {
                // Never filter the root itself, even if its name looks ignorable.
                if entry.path() == root {
                    return true;
                }
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                if !is_dir {
                    return true;
                }
                let name = entry.file_name().to_string_lossy();
                !config.is_ignored_dir(&name)
            })
            .build();

        for entry in walker.flatten() {
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("py") {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if size > self.config.max_file_size {
                debug!(path = %path.display(), size, "Skipping oversized file");
                outcome.oversized.push(path.to_path_buf());
            } else {
                outcome.files.push(path.to_path_buf());
            }
        }

        outcome.files.sort();
        outcome.oversized.sort();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_python_files_skips_ignored_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("pkg");
        fs::create_dir_all(&pkg).unwrap();
        fs::create_dir_all(dir.path().join("venv/lib")).unwrap();
        fs::create_dir_all(dir.path().join("__pycache__")).unwrap();
        fs::create_dir_all(dir.path().join(".hidden")).unwrap();
        fs::create_dir_all(dir.path().join("mylib.egg-info")).unwrap();

        fs::write(dir.path().join("main.py"), "print(1)").unwrap();
        fs::write(pkg.join("utils.py"), "def f(): pass").unwrap();
        fs::write(dir.path().join("venv/lib/site.py"), "x = 1").unwrap();
        fs::write(dir.path().join("__pycache__/cached.py"), "x = 1").unwrap();
        fs::write(dir.path().join(".hidden/secret.py"), "x = 1").unwrap();
        fs::write(dir.path().join("mylib.egg-info/meta.py"), "x = 1").unwrap();
        fs::write(dir.path().join("notes.txt"), "not python").unwrap();

        let walker = FileWalker::new(dir.path(), ScanConfig::default());
        let outcome = walker.python_files();

        let names: Vec<String> = outcome
            .files
            .iter()
            .map(|p| {
                p.strip_prefix(dir.path())
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect();
        assert_eq!(names, vec!["main.py", "pkg/utils.py"]);
    }

    #[test]
    fn test_oversized_files_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("small.py"), "x = 1").unwrap();
        fs::write(dir.path().join("big.py"), "x = 1\n".repeat(100)).unwrap();

        let config = ScanConfig {
            max_file_size: 64,
            ..ScanConfig::default()
        };
        let outcome = FileWalker::new(dir.path(), config).python_files();

        assert_eq!(outcome.files.len(), 1);
        assert_eq!(outcome.oversized.len(), 1);
        assert!(outcome.oversized[0].ends_with("big.py"));
    }

    #[test]
    fn test_follow_hidden() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".tools")).unwrap();
        fs::write(dir.path().join(".tools/gen.py"), "x = 1").unwrap();

        let config = ScanConfig {
            follow_hidden: true,
            ..ScanConfig::default()
        };
        let outcome = FileWalker::new(dir.path(), config).python_files();
        assert_eq!(outcome.files.len(), 1);
    }

    #[test]
    fn test_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let walker = FileWalker::new(dir.path(), ScanConfig::default());
        assert!(walker.python_files().files.is_empty());
    }
}
