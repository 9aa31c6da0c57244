//! Clone/update local checkouts, scan them for analyzable files, compute
//! diffs between commits, and read file contents with traversal guards.
//!
//! Clone/fetch/pull are implemented by shelling out to the system `git`
//! binary (`tokio::process::Command`) rather than `git2`, since a shallow
//! clone pinned to a cutoff date needs `--shallow-since`, which `git2` does
//! not expose. Diff parsing also goes through the `git` binary
//! (`--name-status`) for the same reason.

use crate::error::{AuditError, Result};
use crate::models::ScannedFile;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{info, warn};

/// Extensions scanned for analyzable source files.
const CODE_EXTENSIONS: &[&str] = &[
    "rs", "ts", "tsx", "js", "jsx", "mjs", "cjs", "py", "go", "java", "kt", "rb", "php", "c", "h",
    "cc", "cpp", "hpp", "cs", "swift", "scala", "sql", "sh", "bash", "yml", "yaml", "json",
    "toml", "html", "css", "scss", "vue", "svelte",
];

/// Basenames scanned regardless of extension.
const INFRA_BASENAMES: &[&str] = &[
    "Dockerfile",
    "Makefile",
    "Procfile",
    ".env.example",
    "docker-compose.yml",
    "docker-compose.yaml",
];

/// Ancestor directory names that exclude a file from scanning.
const SKIP_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "vendor",
    "dist",
    "build",
    "__pycache__",
    "target",
    ".next",
    "out",
];

const MAX_FILE_SIZE: u64 = 1024 * 1024;

pub struct RepoStore {
    repos_root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CloneResult {
    pub local_path: PathBuf,
    pub head_sha: String,
}

#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub renamed: Vec<(String, String)>,
    /// True if the diff could not be computed and all files were treated as
    /// added.
    pub is_fallback: bool,
}

impl RepoStore {
    pub fn new(repos_root: PathBuf) -> Self {
        Self { repos_root }
    }

    /// `<reposRoot>/<host>/<owner>/<repo>` — concurrent projects on the same
    /// repo share one checkout on disk.
    pub fn local_path_for(&self, url: &str) -> Result<PathBuf> {
        let parsed = url::Url::parse(url).map_err(|e| {
            AuditError::other(format!("invalid repository url {url}: {e}"))
        })?;
        let host = parsed
            .host_str()
            .ok_or_else(|| AuditError::other(format!("repository url has no host: {url}")))?;
        let mut segments: Vec<&str> = parsed
            .path_segments()
            .map(|s| s.collect())
            .unwrap_or_default();
        if let Some(last) = segments.last_mut() {
            *last = last.trim_end_matches(".git");
        }
        if segments.len() < 2 {
            return Err(AuditError::other(format!(
                "repository url missing owner/repo: {url}"
            )));
        }
        let repo = segments.pop().unwrap();
        let owner = segments.pop().unwrap();
        Ok(self.repos_root.join(host).join(owner).join(repo))
    }

    /// Idempotent clone-or-update. If a working tree already exists, add the
    /// requested branch to tracked remotes, fetch (with `--shallow-since` if
    /// provided), check out, and pull. Otherwise clone `--single-branch`,
    /// preferring `--shallow-since` over `--depth 1`.
    pub async fn clone_or_update(
        &self,
        url: &str,
        branch: Option<&str>,
        shallow_since: Option<&str>,
    ) -> Result<CloneResult> {
        let local_path = self.local_path_for(url)?;

        if local_path.join(".git").exists() {
            self.update_existing(&local_path, branch, shallow_since)
                .await?;
        } else {
            match self.clone_fresh(url, &local_path, branch, shallow_since).await {
                Ok(()) => {}
                Err(e) => {
                    // Race: a concurrent clone may have created the directory
                    // between our existence check and our clone attempt.
                    if local_path.join(".git").exists() {
                        warn!(
                            "clone race detected for {url}, continuing with existing checkout"
                        );
                    } else {
                        return Err(e);
                    }
                }
            }
        }

        let head_sha = self.head_sha(&local_path).await?;
        if head_sha.is_empty() {
            return Err(AuditError::other(format!(
                "no commits present after clone/update of {url}"
            )));
        }

        Ok(CloneResult {
            local_path,
            head_sha,
        })
    }

    async fn clone_fresh(
        &self,
        url: &str,
        target: &Path,
        branch: Option<&str>,
        shallow_since: Option<&str>,
    ) -> Result<()> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!("cloning {url} to {}", target.display());

        let mut args: Vec<String> = vec!["clone".to_string(), "--single-branch".to_string()];
        if let Some(since) = shallow_since {
            args.push("--shallow-since".to_string());
            args.push(since.to_string());
        } else {
            args.push("--depth".to_string());
            args.push("1".to_string());
        }
        if let Some(b) = branch {
            args.push("--branch".to_string());
            args.push(b.to_string());
        }
        args.push(url.to_string());
        args.push(target.to_string_lossy().to_string());

        run_git(None, &args).await?;
        Ok(())
    }

    async fn update_existing(
        &self,
        repo_path: &Path,
        branch: Option<&str>,
        shallow_since: Option<&str>,
    ) -> Result<()> {
        if let Some(b) = branch {
            // Ensure the branch is tracked from origin; ignore "already exists".
            let _ = run_git(
                Some(repo_path),
                &["remote", "set-branches", "--add", "origin", b],
            )
            .await;
        }

        let mut fetch_args = vec!["fetch", "origin"];
        if let Some(since) = shallow_since {
            fetch_args.push("--shallow-since");
            fetch_args.push(since);
        }
        run_git(Some(repo_path), &fetch_args).await?;

        if let Some(b) = branch {
            run_git(Some(repo_path), &["checkout", b]).await?;
        }

        run_git(Some(repo_path), &["pull", "--ff-only"]).await?;
        Ok(())
    }

    async fn head_sha(&self, repo_path: &Path) -> Result<String> {
        let out = run_git(Some(repo_path), &["rev-parse", "HEAD"]).await?;
        Ok(out.trim().to_string())
    }

    /// Resolve a commit's committer date as an ISO 8601 string, for use as a
    /// `--shallow-since` cutoff. `repo_path` must already contain `commit_sha`
    /// (i.e. a prior checkout of the same repo).
    pub async fn commit_date(&self, repo_path: &Path, commit_sha: &str) -> Result<String> {
        let out = run_git(
            Some(repo_path),
            &["show", "-s", "--format=%cI", commit_sha],
        )
        .await?;
        let date = out.trim().to_string();
        if date.is_empty() {
            return Err(AuditError::other(format!(
                "git show produced no date for commit {commit_sha}"
            )));
        }
        Ok(date)
    }

    /// Scan a checkout for analyzable code files. Walks with the repo's own
    /// `.gitignore` respected (matching whatever the project itself already
    /// excludes) plus an explicit skip-list for build/vendor directories a
    /// repo doesn't always bother gitignoring.
    pub fn scan_code_files(&self, root: &Path) -> Result<Vec<ScannedFile>> {
        let mut out = Vec::new();

        let walk = ignore::WalkBuilder::new(root)
            .hidden(false)
            .git_ignore(true)
            .filter_entry(|e| !is_skipped_dir(e.path()))
            .build();

        for entry in walk {
            let entry = entry.map_err(|e| AuditError::other(format!("walk error: {e}")))?;
            let file_type = match entry.file_type() {
                Some(t) => t,
                None => continue,
            };
            if file_type.is_symlink() || !file_type.is_file() {
                continue;
            }

            let path = entry.path();
            if !is_scanned_file(path) {
                continue;
            }

            let metadata = entry.metadata().map_err(|e| AuditError::other(e.to_string()))?;
            let size = metadata.len();
            if size == 0 || size > MAX_FILE_SIZE {
                continue;
            }

            let relative_path = path
                .strip_prefix(root)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");

            // ~3.3 bytes/token is a rough estimate good enough for planning.
            let rough_tokens = (size as f64 / 3.3).ceil() as i64;

            out.push(ScannedFile {
                relative_path,
                size,
                rough_tokens,
            });
        }

        Ok(out)
    }

    /// Diff between two commits via `--name-status`. On any failure,
    /// callers should treat all files as added (`is_fallback`).
    pub async fn diff_between_commits(
        &self,
        repo_path: &Path,
        base_sha: &str,
        head_sha: &str,
    ) -> DiffResult {
        let result = run_git(
            Some(repo_path),
            &["diff", "--name-status", base_sha, head_sha],
        )
        .await;

        let output = match result {
            Ok(o) => o,
            Err(e) => {
                warn!("diff between {base_sha}..{head_sha} failed: {e}");
                return DiffResult {
                    is_fallback: true,
                    ..Default::default()
                };
            }
        };

        let mut diff = DiffResult::default();
        for line in output.lines() {
            let mut parts = line.split('\t');
            let status = match parts.next() {
                Some(s) => s,
                None => continue,
            };
            match status.chars().next() {
                Some('A') => {
                    if let Some(f) = parts.next() {
                        diff.added.push(f.to_string());
                    }
                }
                Some('M') => {
                    if let Some(f) = parts.next() {
                        diff.modified.push(f.to_string());
                    }
                }
                Some('D') => {
                    if let Some(f) = parts.next() {
                        diff.deleted.push(f.to_string());
                    }
                }
                Some('R') => {
                    let from = parts.next();
                    let to = parts.next();
                    if let (Some(from), Some(to)) = (from, to) {
                        diff.renamed.push((from.to_string(), to.to_string()));
                    }
                }
                // Unrecognized statuses ignored.
                _ => {}
            }
        }

        diff
    }

    /// Read file content with a path-traversal guard: the resolved absolute
    /// path must fall inside the repo root. A missing file whose parent
    /// directory resolves inside the root is `NotFound`, not `PathTraversal`
    /// — only an actual escape of the root raises the latter.
    pub fn read_file_content(&self, repo_root: &Path, relative_path: &str) -> Result<String> {
        let candidate = repo_root.join(relative_path);
        let root_resolved = repo_root
            .canonicalize()
            .map_err(|e| AuditError::other(format!("failed to resolve repo root: {e}")))?;

        let parent = candidate.parent().unwrap_or(&candidate);
        let parent_resolved = parent
            .canonicalize()
            .map_err(|_| AuditError::NotFound(candidate.display().to_string()))?;
        if !parent_resolved.starts_with(&root_resolved) {
            return Err(AuditError::PathTraversal(candidate));
        }

        let file_name = match candidate.file_name() {
            Some(n) => n,
            None => return Err(AuditError::NotFound(candidate.display().to_string())),
        };
        let resolved = parent_resolved.join(file_name);

        std::fs::read_to_string(&resolved).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AuditError::NotFound(resolved.display().to_string()),
            std::io::ErrorKind::PermissionDenied => {
                AuditError::Forbidden(resolved.display().to_string())
            }
            _ => AuditError::Io(e),
        })
    }
}

fn is_skipped_dir(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|name| SKIP_DIRS.contains(&name))
        .unwrap_or(false)
}

fn is_scanned_file(path: &Path) -> bool {
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        if INFRA_BASENAMES.contains(&name) {
            return true;
        }
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| CODE_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

async fn run_git(cwd: Option<&Path>, args: &[&str]) -> Result<String> {
    run_git_owned(cwd, &args.iter().map(|s| s.to_string()).collect::<Vec<_>>()).await
}

async fn run_git_owned(cwd: Option<&Path>, args: &[String]) -> Result<String> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = cmd
        .output()
        .await
        .map_err(|e| AuditError::other(format!("failed to spawn git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AuditError::other(format!(
            "git {:?} failed: {stderr}",
            args
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_path_derives_host_owner_repo() {
        let store = RepoStore::new(PathBuf::from("/data/repos"));
        let path = store
            .local_path_for("https://github.com/acme/widget.git")
            .unwrap();
        assert_eq!(path, PathBuf::from("/data/repos/github.com/acme/widget"));
    }

    #[test]
    fn scan_skips_vendored_directories() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("node_modules")).unwrap();
        std::fs::write(tmp.path().join("node_modules/lib.js"), "console.log(1)").unwrap();
        std::fs::write(tmp.path().join("main.rs"), "fn main() {}").unwrap();

        let store = RepoStore::new(tmp.path().to_path_buf());
        let files = store.scan_code_files(tmp.path()).unwrap();

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, "main.rs");
    }

    #[test]
    fn scan_excludes_empty_and_oversized_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("empty.rs"), "").unwrap();
        std::fs::write(tmp.path().join("huge.rs"), vec![b'a'; (MAX_FILE_SIZE + 1) as usize])
            .unwrap();
        std::fs::write(tmp.path().join("ok.rs"), "fn main() {}").unwrap();

        let store = RepoStore::new(tmp.path().to_path_buf());
        let files = store.scan_code_files(tmp.path()).unwrap();

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, "ok.rs");
    }

    #[test]
    fn read_file_content_rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("in.rs"), "ok").unwrap();
        let outside = tmp.path().parent().unwrap();
        std::fs::write(outside.join("secret.rs"), "nope").ok();

        let store = RepoStore::new(tmp.path().to_path_buf());
        let result = store.read_file_content(tmp.path(), "../secret.rs");
        assert!(matches!(result, Err(AuditError::PathTraversal(_))));
    }

    #[test]
    fn read_file_content_reads_in_bounds_file() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("in.rs"), "hello").unwrap();
        let store = RepoStore::new(tmp.path().to_path_buf());
        let content = store.read_file_content(tmp.path(), "in.rs").unwrap();
        assert_eq!(content, "hello");
    }

    #[test]
    fn read_file_content_missing_in_bounds_file_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RepoStore::new(tmp.path().to_path_buf());
        let result = store.read_file_content(tmp.path(), "does/not/exist.rs");
        assert!(matches!(result, Err(AuditError::NotFound(_))), "{result:?}");
    }
}
