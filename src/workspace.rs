// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workspace management via git worktrees.
//!
//! Each worker gets an isolated working copy of the repository in a sibling
//! directory (or under a configured worktree dir), bound to a branch derived
//! from the worker's base branch.
//!
//! # Directory Structure
//!
//! ```text
//! /project/                   # Main repo
//! ├── .git/
//! ├── src/
//! └── ...
//!
//! /codi-feat-auth/            # Worker worktree (sibling directory)
//! ├── .git                    # Worktree link file
//! ├── src/
//! └── ...
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::types::Workspace;

/// Errors from workspace operations. All of them surface to callers as
/// "workspace unavailable".
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(String),

    #[error("Branch already in use: {0}")]
    BranchInUse(String),

    #[error("Base branch not found: {0}")]
    BaseBranchMissing(String),

    #[error("Workspace path occupied: {0}")]
    PathOccupied(PathBuf),
}

/// Trait for workspace management strategies.
///
/// The orchestrator only depends on this seam; tests substitute lighter
/// implementations.
#[async_trait]
pub trait WorkspaceManager: Send + Sync {
    /// Create an isolated workspace on a branch derived from `branch` (a
    /// random name when `None`).
    async fn create(&self, branch: Option<&str>) -> Result<Workspace, WorkspaceError>;

    /// Remove a workspace and its branch. Idempotent: destroying a workspace
    /// that no longer exists is a no-op.
    async fn destroy(&self, workspace: &Workspace) -> Result<(), WorkspaceError>;

    /// Destroy every workspace this manager has created.
    async fn cleanup(&self) -> Result<(), WorkspaceError>;

    /// List live workspaces created by this manager.
    async fn list(&self) -> Vec<Workspace>;
}

/// Git worktree workspace manager.
pub struct GitWorktreeManager {
    /// Path to the main repository root.
    repo_root: PathBuf,
    /// Directory worktrees are created in. Defaults to the repo's parent.
    worktree_dir: Option<PathBuf>,
    /// Prefix for branch and directory names.
    prefix: String,
    /// Base branch worker branches are created from.
    base_branch: String,
    /// Tracked workspaces by branch name.
    worktrees: Arc<RwLock<HashMap<String, Workspace>>>,
}

impl GitWorktreeManager {
    /// Create a new manager for a repository.
    pub fn new(repo_root: impl AsRef<Path>, base_branch: impl Into<String>) -> Self {
        Self {
            repo_root: repo_root.as_ref().to_path_buf(),
            worktree_dir: None,
            prefix: "codi-".to_string(),
            base_branch: base_branch.into(),
            worktrees: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Set a custom prefix for branch and directory names.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the directory worktrees are created in.
    pub fn with_worktree_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.worktree_dir = Some(dir.into());
        self
    }

    /// Get the path where a worktree would be created for a branch.
    fn worktree_path(&self, branch: &str) -> PathBuf {
        let dir_name = sanitize_branch_name(branch);
        match &self.worktree_dir {
            Some(dir) => dir.join(dir_name),
            None => self
                .repo_root
                .parent()
                .unwrap_or(&self.repo_root)
                .join(dir_name),
        }
    }

    /// Run a git command in the repo root and return stdout.
    async fn git(&self, args: &[&str]) -> Result<String, WorkspaceError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(WorkspaceError::Git(stderr.trim().to_string()))
        }
    }

    /// Check if a branch exists locally.
    async fn branch_exists(&self, branch: &str) -> bool {
        self.git(&["rev-parse", "--verify", "--quiet", branch])
            .await
            .is_ok()
    }

    /// Check if a branch is checked out in any worktree.
    async fn is_branch_checked_out(&self, branch: &str) -> bool {
        if let Ok(output) = self.git(&["worktree", "list", "--porcelain"]).await {
            for line in output.lines() {
                if let Some(checked) = line.strip_prefix("branch refs/heads/") {
                    if checked == branch {
                        return true;
                    }
                }
            }
        }
        false
    }
}

#[async_trait]
impl WorkspaceManager for GitWorktreeManager {
    async fn create(&self, branch: Option<&str>) -> Result<Workspace, WorkspaceError> {
        let suffix = match branch {
            Some(name) => name.to_string(),
            None => uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
        };
        let branch = format!("{}{}", self.prefix, suffix);
        let worktree_path = self.worktree_path(&branch);

        if !self.branch_exists(&self.base_branch).await {
            return Err(WorkspaceError::BaseBranchMissing(self.base_branch.clone()));
        }

        if self.is_branch_checked_out(&branch).await {
            return Err(WorkspaceError::BranchInUse(branch));
        }

        // The workspace path must be distinct from the repo root and empty or
        // non-existent prior to creation.
        if worktree_path == self.repo_root {
            return Err(WorkspaceError::PathOccupied(worktree_path));
        }
        if worktree_path.exists()
            && std::fs::read_dir(&worktree_path)?.next().is_some()
        {
            return Err(WorkspaceError::PathOccupied(worktree_path));
        }

        info!("Creating worktree for {} at {:?}", branch, worktree_path);
        let worktree_path_str = worktree_path.to_string_lossy().to_string();

        if self.branch_exists(&branch).await {
            self.git(&["worktree", "add", &worktree_path_str, &branch])
                .await?;
        } else {
            self.git(&[
                "worktree",
                "add",
                "-b",
                &branch,
                &worktree_path_str,
                &self.base_branch,
            ])
            .await?;
        }

        let workspace = Workspace {
            path: worktree_path,
            branch: branch.clone(),
            base: self.base_branch.clone(),
        };

        {
            let mut worktrees = self.worktrees.write().await;
            worktrees.insert(branch, workspace.clone());
        }

        debug!("Created workspace at {:?}", workspace.path);
        Ok(workspace)
    }

    async fn destroy(&self, workspace: &Workspace) -> Result<(), WorkspaceError> {
        info!(
            "Removing worktree for {} at {:?}",
            workspace.branch, workspace.path
        );

        let path_str = workspace.path.to_string_lossy().to_string();
        let result = self
            .git(&["worktree", "remove", "--force", &path_str])
            .await;

        if let Err(e) = result {
            warn!("Failed to remove worktree via git: {}", e);
            // Manual removal as fallback, then drop the stale reference.
            if workspace.path.exists() {
                std::fs::remove_dir_all(&workspace.path)?;
            }
            let _ = self.git(&["worktree", "prune"]).await;
        }

        let _ = self.git(&["branch", "-D", &workspace.branch]).await;

        {
            let mut worktrees = self.worktrees.write().await;
            worktrees.remove(&workspace.branch);
        }

        Ok(())
    }

    async fn cleanup(&self) -> Result<(), WorkspaceError> {
        let worktrees: Vec<Workspace> = {
            let tracked = self.worktrees.read().await;
            tracked.values().cloned().collect()
        };

        for workspace in worktrees {
            if let Err(e) = self.destroy(&workspace).await {
                warn!("Failed to cleanup workspace {:?}: {}", workspace.path, e);
            }
        }

        let _ = self.git(&["worktree", "prune"]).await;
        Ok(())
    }

    async fn list(&self) -> Vec<Workspace> {
        let tracked = self.worktrees.read().await;
        tracked
            .values()
            .filter(|ws| ws.path.exists())
            .cloned()
            .collect()
    }
}

/// Sanitize a branch name for use as a directory name.
///
/// Converts slashes to dashes and removes other problematic characters.
pub fn sanitize_branch_name(branch: &str) -> String {
    branch
        .replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "-")
        .trim_matches('-')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn run_git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .expect("git invocation failed");
        assert!(status.success(), "git {args:?} failed in {dir:?}");
    }

    /// Create a git repo on `main` with one commit.
    fn init_repo(dir: &Path) {
        run_git(dir, &["init", "--initial-branch=main"]);
        std::fs::write(dir.join("README.md"), "# test\n").unwrap();
        run_git(dir, &["add", "."]);
        run_git(
            dir,
            &[
                "-c",
                "user.email=test@example.com",
                "-c",
                "user.name=Test",
                "commit",
                "-m",
                "initial",
            ],
        );
    }

    #[test]
    fn test_sanitize_branch_name() {
        assert_eq!(sanitize_branch_name("feat/auth"), "feat-auth");
        assert_eq!(sanitize_branch_name("fix/bug-123"), "fix-bug-123");
        assert_eq!(sanitize_branch_name("main"), "main");
        assert_eq!(sanitize_branch_name("feat/auth/oauth"), "feat-auth-oauth");
    }

    #[test]
    fn test_worktree_path_sibling_default() {
        let manager = GitWorktreeManager::new("/workspace/project", "main");
        let path = manager.worktree_path("codi-feat/auth");
        assert_eq!(path, PathBuf::from("/workspace/codi-feat-auth"));
    }

    #[test]
    fn test_worktree_path_custom_dir() {
        let manager = GitWorktreeManager::new("/workspace/project", "main")
            .with_worktree_dir("/tmp/trees");
        let path = manager.worktree_path("codi-w1");
        assert_eq!(path, PathBuf::from("/tmp/trees/codi-w1"));
    }

    #[tokio::test]
    async fn test_create_and_destroy_worktree() {
        let dir = tempdir().unwrap();
        let repo = dir.path().join("project");
        std::fs::create_dir(&repo).unwrap();
        init_repo(&repo);

        let manager = GitWorktreeManager::new(&repo, "main")
            .with_worktree_dir(dir.path().join("trees"));

        let workspace = manager.create(Some("w1")).await.expect("create failed");
        assert_eq!(workspace.branch, "codi-w1");
        assert_eq!(workspace.base, "main");
        assert!(workspace.path.exists());
        assert!(workspace.path.join("README.md").exists());
        assert_eq!(manager.list().await.len(), 1);

        manager.destroy(&workspace).await.expect("destroy failed");
        assert!(!workspace.path.exists());
        assert!(manager.list().await.is_empty());

        // Destroy is idempotent.
        manager.destroy(&workspace).await.expect("second destroy failed");
    }

    #[tokio::test]
    async fn test_create_random_branch() {
        let dir = tempdir().unwrap();
        let repo = dir.path().join("project");
        std::fs::create_dir(&repo).unwrap();
        init_repo(&repo);

        let manager = GitWorktreeManager::new(&repo, "main")
            .with_worktree_dir(dir.path().join("trees"));

        let a = manager.create(None).await.expect("create failed");
        let b = manager.create(None).await.expect("create failed");
        assert!(a.branch.starts_with("codi-"));
        assert_ne!(a.branch, b.branch);
        assert_ne!(a.path, b.path);

        manager.cleanup().await.expect("cleanup failed");
        assert!(!a.path.exists());
        assert!(!b.path.exists());
    }

    #[tokio::test]
    async fn test_create_fails_on_missing_base() {
        let dir = tempdir().unwrap();
        let repo = dir.path().join("project");
        std::fs::create_dir(&repo).unwrap();
        init_repo(&repo);

        let manager = GitWorktreeManager::new(&repo, "nonexistent")
            .with_worktree_dir(dir.path().join("trees"));

        let result = manager.create(Some("w1")).await;
        assert!(matches!(result, Err(WorkspaceError::BaseBranchMissing(_))));
    }

    #[tokio::test]
    async fn test_create_fails_on_occupied_path() {
        let dir = tempdir().unwrap();
        let repo = dir.path().join("project");
        std::fs::create_dir(&repo).unwrap();
        init_repo(&repo);

        let trees = dir.path().join("trees");
        std::fs::create_dir_all(trees.join("codi-w1")).unwrap();
        std::fs::write(trees.join("codi-w1").join("stale.txt"), "x").unwrap();

        let manager = GitWorktreeManager::new(&repo, "main").with_worktree_dir(&trees);
        let result = manager.create(Some("w1")).await;
        assert!(matches!(result, Err(WorkspaceError::PathOccupied(_))));
    }

    #[tokio::test]
    async fn test_create_fails_on_branch_in_use() {
        let dir = tempdir().unwrap();
        let repo = dir.path().join("project");
        std::fs::create_dir(&repo).unwrap();
        init_repo(&repo);

        let manager = GitWorktreeManager::new(&repo, "main")
            .with_worktree_dir(dir.path().join("trees"));

        let _first = manager.create(Some("w1")).await.expect("create failed");
        let second = manager.create(Some("w1")).await;
        assert!(matches!(second, Err(WorkspaceError::BranchInUse(_))));
    }
}
