//! Project snapshots handed to the analyzer
//!
//! A snapshot is an immutable reference to a project tree plus the file
//! inventory gathered while walking it. The core never reads file contents;
//! the analyzer does.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use ulid::Ulid;
use walkdir::{DirEntry, WalkDir};

/// Directories never descended into
const SKIPPED_DIRS: [&str; 10] = [
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "target",
    "__pycache__",
    ".venv",
    "venv",
    "dist",
    "build",
];

/// Dependency manifests recognized by name
const MANIFESTS: [&str; 6] = [
    "requirements.txt",
    "package.json",
    "pom.xml",
    "go.mod",
    "go.sum",
    "pyproject.toml",
];

/// How thoroughly the analyzer should inspect the project
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisDepth {
    #[default]
    QuickScan,
    DeepAnalysis,
    SecurityAudit,
}

impl AnalysisDepth {
    /// Human label
    #[inline]
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            AnalysisDepth::QuickScan => "Quick Scan",
            AnalysisDepth::DeepAnalysis => "Deep Analysis",
            AnalysisDepth::SecurityAudit => "Security Audit",
        }
    }
}

impl std::str::FromStr for AnalysisDepth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "quick" | "quickscan" => Ok(AnalysisDepth::QuickScan),
            "deep" | "deepanalysis" => Ok(AnalysisDepth::DeepAnalysis),
            "security" | "securityaudit" => Ok(AnalysisDepth::SecurityAudit),
            _ => Err(format!("unknown analysis depth: {s}")),
        }
    }
}

/// Source languages the ingestion step classifies
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Node,
    C,
    Cpp,
    Java,
    Go,
}

impl Language {
    /// Classify by file extension
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "py" => Some(Language::Python),
            "js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs" => Some(Language::Node),
            "c" | "h" => Some(Language::C),
            "cpp" | "cc" | "cxx" | "hpp" | "hh" => Some(Language::Cpp),
            "java" => Some(Language::Java),
            "go" => Some(Language::Go),
            _ => None,
        }
    }
}

/// A classified source file, relative to the snapshot root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: PathBuf,
    pub language: Language,
}

/// Summary of what a snapshot contains
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub files: usize,
    pub languages: BTreeMap<Language, usize>,
    pub manifests: Vec<PathBuf>,
}

/// Error walking a project tree
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// Root is missing or not a directory
    #[error("project root is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// Directory walk failed
    #[error("failed to walk project tree: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Immutable reference to a project handed to the analyzer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub id: Ulid,
    pub root: PathBuf,
    pub depth: AnalysisDepth,
    pub files: Vec<SourceFile>,
    pub manifests: Vec<PathBuf>,
}

impl ProjectSnapshot {
    /// Snapshot without an inventory (analyzer reads `root` itself)
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, depth: AnalysisDepth) -> Self {
        Self {
            id: Ulid::new(),
            root: root.into(),
            depth,
            files: Vec::new(),
            manifests: Vec::new(),
        }
    }

    /// Walk `root` and classify code files and dependency manifests
    ///
    /// # Errors
    /// `NotADirectory` for a bad root, `Walk` for I/O failures.
    pub fn scan(root: impl AsRef<Path>, depth: AnalysisDepth) -> Result<Self, SnapshotError> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(SnapshotError::NotADirectory(root.to_path_buf()));
        }

        let mut snapshot = Self::new(root, depth);
        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_skipped(e));

        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path()).to_path_buf();
            let name = entry.file_name().to_string_lossy();

            if MANIFESTS.contains(&name.as_ref()) {
                snapshot.manifests.push(relative.clone());
            }
            if let Some(language) = Language::from_path(&relative) {
                snapshot.files.push(SourceFile {
                    path: relative,
                    language,
                });
            }
        }

        tracing::debug!(
            root = %root.display(),
            files = snapshot.files.len(),
            manifests = snapshot.manifests.len(),
            "scanned project snapshot"
        );
        Ok(snapshot)
    }

    /// Language and manifest summary
    #[must_use]
    pub fn inventory(&self) -> Inventory {
        let mut languages = BTreeMap::new();
        for file in &self.files {
            *languages.entry(file.language).or_insert(0) += 1;
        }
        Inventory {
            files: self.files.len(),
            languages,
            manifests: self.manifests.clone(),
        }
    }
}

fn is_skipped(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map_or(false, |name| SKIPPED_DIRS.contains(&name))
}
