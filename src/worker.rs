//! Worker: owns one task end-to-end.
//!
//! Workspace creation, clone, branch adoption, credential files, delegated
//! execution, commit and push. The workspace is torn down on every exit
//! path, panics included, via an RAII guard.

use crate::error::{ErrorKind, ForgeError, WorkerError, WorkerPhase};
use crate::executor::{run_executor, ExecutorConfig};
use crate::task::{Task, WorkerRetryState};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const CREDENTIALS_FILE: &str = ".autoforge-credentials";

/// Execution seam between the pool and the real worker, so scheduler tests
/// run with stub runners instead of git and a child executor.
#[async_trait]
pub trait TaskRunner: Send + Sync + std::fmt::Debug {
    async fn run(
        &self,
        task: &Task,
        state: &WorkerRetryState,
        worker_id: u32,
    ) -> Result<TaskSuccess, WorkerError>;
}

/// Terminal success for one attempt.
#[derive(Debug, Clone)]
pub struct TaskSuccess {
    pub commit_sha: Option<String>,
    pub duration: Duration,
    /// The executor ran but produced no file changes.
    pub no_changes: bool,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub work_dir: PathBuf,
    /// Clone URL of the repository tasks run against.
    pub repo_url: String,
    pub base_branch: String,
    /// Credential token written into the workspace for the executor.
    pub token: String,
    pub shallow_clone: bool,
    pub executor: ExecutorConfig,
}

/// A worker process's view of one task execution.
#[derive(Debug)]
pub struct Worker {
    config: WorkerConfig,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    async fn run_phases(
        &self,
        task: &Task,
        state: &WorkerRetryState,
        workspace: &Path,
        started: Instant,
    ) -> Result<TaskSuccess, WorkerError> {
        let branch = state.branch_name.as_str();
        let fail = |phase: WorkerPhase,
                    elapsed: Duration,
                    source: CommandError|
         -> WorkerError {
            WorkerError::new(phase, branch, workspace, elapsed, source)
        };

        // Clone the repository into the fresh workspace.
        let mut clone_args: Vec<&str> = vec!["clone"];
        if self.config.shallow_clone {
            clone_args.extend(["--depth", "1"]);
        }
        clone_args.extend(["--branch", &self.config.base_branch, &self.config.repo_url, "."]);
        run_git(workspace, &clone_args)
            .await
            .map_err(|e| fail(WorkerPhase::Clone, started.elapsed(), e))?;

        // Adopt the branch if it already exists; otherwise create it from base.
        let adopted = run_git(workspace, &["fetch", "origin", branch]).await.is_ok()
            && run_git(workspace, &["checkout", branch]).await.is_ok();
        if adopted {
            tracing::debug!(branch = %branch, "adopting existing branch");
        } else {
            run_git(workspace, &["checkout", "-b", branch])
                .await
                .map_err(|e| fail(WorkerPhase::Branch, started.elapsed(), e))?;
        }

        // Commit identity plus workspace-scoped credentials for the executor.
        run_git(workspace, &["config", "user.name", "autoforge"])
            .await
            .map_err(|e| fail(WorkerPhase::Credentials, started.elapsed(), e))?;
        run_git(workspace, &["config", "user.email", "autoforge@localhost"])
            .await
            .map_err(|e| fail(WorkerPhase::Credentials, started.elapsed(), e))?;
        write_credentials(workspace, &self.config.token).await.map_err(|e| {
            WorkerError::new(
                WorkerPhase::Credentials,
                branch,
                workspace,
                started.elapsed(),
                e,
            )
        })?;

        // Delegated execution.
        let prompt = build_prompt(task);
        let outcome =
            run_executor(&self.config.executor, workspace, &prompt).await.map_err(|e| {
                WorkerError::new(WorkerPhase::Execute, branch, workspace, started.elapsed(), e)
            })?;
        if !outcome.exit_ok {
            let message = outcome
                .errors
                .last()
                .cloned()
                .unwrap_or_else(|| "executor exited with failure".to_string());
            return Err(WorkerError::new(
                WorkerPhase::Execute,
                branch,
                workspace,
                started.elapsed(),
                ForgeError::new(ErrorKind::Validation, message).non_retryable(),
            ));
        }

        // Commit and push if anything changed.
        let porcelain = run_git(workspace, &["status", "--porcelain"])
            .await
            .map_err(|e| fail(WorkerPhase::Commit, started.elapsed(), e))?;

        let commit_sha = if !porcelain.trim().is_empty() {
            run_git(workspace, &["add", "-A"])
                .await
                .map_err(|e| fail(WorkerPhase::Commit, started.elapsed(), e))?;
            run_git(workspace, &["commit", "-m", &commit_message(task)])
                .await
                .map_err(|e| fail(WorkerPhase::Commit, started.elapsed(), e))?;
            run_git(workspace, &["push", "-u", "origin", branch])
                .await
                .map_err(|e| fail(WorkerPhase::Push, started.elapsed(), e))?;
            let sha = run_git(workspace, &["rev-parse", "HEAD"])
                .await
                .map_err(|e| fail(WorkerPhase::Commit, started.elapsed(), e))?;
            Some(sha.trim().to_string())
        } else if let Some(sha) = outcome.commit_sha {
            // The executor committed on its own; make sure it's published.
            run_git(workspace, &["push", "-u", "origin", branch])
                .await
                .map_err(|e| fail(WorkerPhase::Push, started.elapsed(), e))?;
            Some(sha)
        } else {
            None
        };

        let no_changes = commit_sha.is_none();
        if no_changes {
            tracing::info!(task_id = %task.id, branch = %branch, "no changes produced");
        }
        Ok(TaskSuccess { commit_sha, duration: started.elapsed(), no_changes })
    }
}

#[async_trait]
impl TaskRunner for Worker {
    async fn run(
        &self,
        task: &Task,
        state: &WorkerRetryState,
        worker_id: u32,
    ) -> Result<TaskSuccess, WorkerError> {
        let started = Instant::now();
        let guard = WorkspaceGuard::create(&self.config.work_dir, worker_id, &task.id)
            .await
            .map_err(|e| {
                WorkerError::new(
                    WorkerPhase::Workspace,
                    state.branch_name.as_str(),
                    self.config.work_dir.clone(),
                    started.elapsed(),
                    e,
                )
            })?;

        tracing::info!(
            worker_id,
            task_id = %task.id,
            branch = %state.branch_name,
            timeout_ms = state.current_timeout.as_millis() as u64,
            workspace = %guard.path().display(),
            "worker starting task"
        );

        let outcome = tokio::time::timeout(
            state.current_timeout,
            self.run_phases(task, state, guard.path(), started),
        )
        .await;

        // The guard tears the workspace down when this frame unwinds or
        // returns, whichever happens.
        match outcome {
            Ok(result) => result,
            Err(_) => Err(WorkerError::new(
                WorkerPhase::Execute,
                state.branch_name.as_str(),
                guard.path(),
                started.elapsed(),
                ForgeError::new(
                    ErrorKind::Timeout,
                    format!("task exceeded {:?}", state.current_timeout),
                ),
            )),
        }
    }
}

/// Ephemeral workspace directory, removed on drop: success, failure, panic,
/// and cancellation alike.
#[derive(Debug)]
pub struct WorkspaceGuard {
    path: PathBuf,
}

impl WorkspaceGuard {
    pub async fn create(work_dir: &Path, worker_id: u32, task_id: &str) -> io::Result<Self> {
        let short = task_id.get(..8).unwrap_or(task_id);
        let path = work_dir.join("workspace").join(format!("{worker_id}-{short}"));
        // Recreate from scratch each attempt.
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to remove workspace"
                );
            }
        }
    }
}

#[derive(Debug, Error)]
#[error("git {args:?} exited with {code}: {stderr}")]
pub struct CommandError {
    args: Vec<String>,
    code: i32,
    stderr: String,
}

async fn run_git(dir: &Path, args: &[&str]) -> Result<String, CommandError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| CommandError {
            args: args.iter().map(|s| s.to_string()).collect(),
            code: -1,
            stderr: e.to_string(),
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(CommandError {
            args: args.iter().map(|s| s.to_string()).collect(),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

async fn write_credentials(workspace: &Path, token: &str) -> io::Result<()> {
    let path = workspace.join(CREDENTIALS_FILE);
    let mut file = tokio::fs::File::create(&path).await?;
    file.write_all(token.as_bytes()).await?;
    file.flush().await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&path, perms).await?;
    }
    Ok(())
}

fn build_prompt(task: &Task) -> String {
    let mut prompt = format!(
        "You are working on branch `{}`.\n\nChange request #{}: {}\n",
        task.branch_name, task.request.number, task.request.title
    );
    if !task.request.body.is_empty() {
        prompt.push('\n');
        prompt.push_str(&task.request.body);
        prompt.push('\n');
    }
    if !task.metadata.affected_paths.is_empty() {
        prompt.push_str("\nFocus on these paths:\n");
        for path in &task.metadata.affected_paths {
            prompt.push_str(&format!("- {path}\n"));
        }
    }
    prompt.push_str("\nCommit nothing yourself; leave changes in the working tree.\n");
    prompt
}

fn commit_message(task: &Task) -> String {
    format!("{} (#{})", task.request.title, task.request.number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ChangeRequest;

    fn task() -> Task {
        Task::enrich(
            ChangeRequest {
                number: 42,
                title: "Fix flaky widget".into(),
                body: "Details.\n\n## Affected Paths\n- `src/widget/mod.rs`\n".into(),
                labels: vec!["priority:high".into()],
            },
            "autoforge/fix-42",
            3,
            0,
        )
    }

    #[tokio::test]
    async fn workspace_guard_removes_directory_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let guard = WorkspaceGuard::create(root.path(), 1, "abcdef0123").await.unwrap();
            let path = guard.path().to_path_buf();
            assert!(path.exists());
            std::fs::write(path.join("file.txt"), "contents").unwrap();
            path
        };
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn workspace_guard_recreates_existing_directory() {
        let root = tempfile::tempdir().unwrap();
        let guard = WorkspaceGuard::create(root.path(), 1, "abcdef0123").await.unwrap();
        std::fs::write(guard.path().join("stale.txt"), "old attempt").unwrap();
        let path = guard.path().to_path_buf();
        std::mem::forget(guard);

        let guard = WorkspaceGuard::create(root.path(), 1, "abcdef0123").await.unwrap();
        assert!(!path.join("stale.txt").exists());
        drop(guard);
    }

    #[tokio::test]
    async fn workspace_guard_cleans_up_on_panic() {
        let root = tempfile::tempdir().unwrap();
        let root_path = root.path().to_path_buf();

        let handle = tokio::spawn(async move {
            let _guard = WorkspaceGuard::create(&root_path, 7, "deadbeef99").await.unwrap();
            panic!("worker blew up");
        });
        assert!(handle.await.is_err());

        let workspace_root = root.path().join("workspace");
        let leftovers: Vec<_> = match std::fs::read_dir(&workspace_root) {
            Ok(entries) => entries.collect(),
            Err(_) => Vec::new(),
        };
        assert!(leftovers.is_empty());
    }

    #[test]
    fn prompt_includes_branch_body_and_paths() {
        let prompt = build_prompt(&task());
        assert!(prompt.contains("autoforge/fix-42"));
        assert!(prompt.contains("Change request #42: Fix flaky widget"));
        assert!(prompt.contains("- src/widget/mod.rs"));
    }

    #[test]
    fn commit_message_references_request() {
        assert_eq!(commit_message(&task()), "Fix flaky widget (#42)");
    }

    #[tokio::test]
    async fn run_git_reports_failure_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        // Not a repository: status must fail.
        let err = run_git(dir.path(), &["status", "--porcelain"]).await.unwrap_err();
        assert_ne!(err.code, 0);
        let message = err.to_string();
        assert!(message.contains("status"));
    }
}
