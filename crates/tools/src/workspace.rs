//! Workspace guard: confines file tools to one root directory.
//!
//! Paths from the model are resolved against the workspace root. Traversal
//! components are rejected outright, and the resolved path (or its nearest
//! existing ancestor, for files that don't exist yet) is canonicalized so
//! symlinks can't point outside the root.

use ignore::WalkBuilder;
use sleuth_core::error::ToolError;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Directories never descended into by search and listing.
pub const IGNORED_DIRS: &[&str] = &[".git", "target", "node_modules", ".hg", ".svn", "dist", "build"];

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Create a workspace rooted at `root`, which must exist.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, ToolError> {
        let root = root.as_ref().canonicalize().map_err(|e| ToolError::ExecutionFailed {
            tool_name: "workspace".into(),
            reason: format!("Cannot open workspace '{}': {e}", root.as_ref().display()),
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a model-supplied path to an absolute path inside the workspace.
    pub fn resolve(&self, tool_name: &str, path: &str) -> Result<PathBuf, ToolError> {
        let denied = |reason: String| ToolError::PermissionDenied {
            tool_name: tool_name.to_string(),
            reason,
        };

        let input = Path::new(path.trim());
        if input.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(denied(format!("Path traversal detected in '{path}'")));
        }

        let joined = if input.is_absolute() {
            input.to_path_buf()
        } else {
            self.root.join(input)
        };

        // Canonicalize the deepest existing ancestor, then re-attach the rest
        let mut existing = joined.as_path();
        let mut rest = Vec::new();
        while !existing.exists() {
            match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    rest.push(name.to_os_string());
                    existing = parent;
                }
                _ => break,
            }
        }
        let mut canonical = existing
            .canonicalize()
            .map_err(|e| denied(format!("Failed to resolve '{path}': {e}")))?;
        for name in rest.into_iter().rev() {
            canonical.push(name);
        }

        if !canonical.starts_with(&self.root) {
            return Err(denied(format!("Path '{path}' is outside the workspace")));
        }
        Ok(canonical)
    }

    /// Path relative to the root, for display.
    pub fn display(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

/// Whether a directory entry should be skipped by walkers.
pub fn is_ignored(name: &str) -> bool {
    IGNORED_DIRS.contains(&name) || (name.starts_with('.') && name.len() > 1)
}

/// One entry found by [`walk`].
#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub path: PathBuf,
    pub is_dir: bool,
}

/// Depth-first listing of `dir` in name order.
///
/// Honours `.gitignore`, `.ignore` and git excludes (inside a repository or
/// not), and skips hidden entries, symlinks and [`IGNORED_DIRS`]. Stops once
/// `limit` entries were collected; the flag reports truncation.
pub fn walk(dir: &Path, recursive: bool, limit: usize) -> (Vec<WalkEntry>, bool) {
    let mut builder = WalkBuilder::new(dir);
    builder
        .hidden(true)
        .git_ignore(true)
        .git_global(true)
        .git_exclude(true)
        .require_git(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(|entry| !is_ignored(&entry.file_name().to_string_lossy()));
    if !recursive {
        builder.max_depth(Some(1));
    }

    let mut out = Vec::new();
    for result in builder.build() {
        let entry = match result {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if entry.depth() == 0 {
            continue;
        }
        let Some(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_symlink() {
            continue;
        }
        if out.len() >= limit {
            return (out, true);
        }
        out.push(WalkEntry {
            is_dir: file_type.is_dir(),
            path: entry.into_path(),
        });
    }
    (out, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_resolve_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "").unwrap();

        let ws = Workspace::new(dir.path()).unwrap();
        let resolved = ws.resolve("extract", "src/lib.rs").unwrap();
        assert!(resolved.starts_with(ws.root()));
        assert_eq!(ws.display(&resolved), "src/lib.rs");
    }

    #[test]
    fn new_files_resolve_through_missing_parents() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        let resolved = ws.resolve("create", "new/dir/file.rs").unwrap();
        assert!(resolved.starts_with(ws.root()));
        assert!(resolved.ends_with("new/dir/file.rs"));
    }

    #[test]
    fn traversal_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        let err = ws.resolve("extract", "../../etc/passwd").unwrap_err();
        assert!(matches!(err, ToolError::PermissionDenied { .. }));
    }

    #[test]
    fn absolute_paths_outside_root_are_denied() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        let outside = other.path().join("secret.txt");
        assert!(ws.resolve("extract", outside.to_str().unwrap()).is_err());
    }

    #[test]
    fn walk_is_sorted_and_limited() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("b/inner")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("a.rs"), "").unwrap();
        std::fs::write(dir.path().join("b/inner/c.rs"), "").unwrap();

        let (entries, truncated) = walk(dir.path(), true, 100);
        let names: Vec<_> = entries
            .iter()
            .map(|e| e.path.strip_prefix(dir.path()).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(names, vec!["a.rs", "b", "b/inner", "b/inner/c.rs"]);
        assert!(!truncated);

        let (entries, truncated) = walk(dir.path(), true, 2);
        assert_eq!(entries.len(), 2);
        assert!(truncated);
    }

    #[test]
    fn gitignored_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "generated/\n*.log\n").unwrap();
        std::fs::create_dir_all(dir.path().join("generated")).unwrap();
        std::fs::write(dir.path().join("generated/out.rs"), "fn needle() {}").unwrap();
        std::fs::write(dir.path().join("run.log"), "").unwrap();
        std::fs::write(dir.path().join("main.rs"), "").unwrap();

        let (entries, _) = walk(dir.path(), true, 100);
        let names: Vec<_> = entries
            .iter()
            .map(|e| e.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["main.rs"]);
    }

    #[test]
    fn non_recursive_walk_stays_at_top_level() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/nested")).unwrap();
        std::fs::write(dir.path().join("src/nested/deep.rs"), "").unwrap();

        let (entries, truncated) = walk(dir.path(), false, 100);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_dir);
        assert!(!truncated);
    }

    #[test]
    fn hidden_and_build_dirs_are_ignored() {
        assert!(is_ignored(".git"));
        assert!(is_ignored("target"));
        assert!(is_ignored(".cache"));
        assert!(!is_ignored("src"));
        assert!(!is_ignored("."));
    }
}
