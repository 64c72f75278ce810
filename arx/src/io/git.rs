//! Read-only git probes that feed the gate checks.
//!
//! Nothing here commits, checks out, or touches the index.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result, bail};
use tracing::{debug, instrument};

/// Runs `git` in a fixed working directory.
#[derive(Debug, Clone)]
pub struct GitProbe {
    workdir: PathBuf,
}

impl GitProbe {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Short name of the checked-out branch. Detached HEAD and non-repositories
    /// are errors, since the branch guard cannot judge an unnamed ref.
    #[instrument(skip_all)]
    pub fn branch(&self) -> Result<String> {
        let name = self.capture(&["symbolic-ref", "--quiet", "--short", "HEAD"])?;
        let name = name.trim();
        if name.is_empty() {
            bail!("git reported an empty branch name");
        }
        debug!(branch = name, "branch probed");
        Ok(name.to_string())
    }

    /// Changed or untracked paths, minus those under `ignored_prefixes`.
    #[instrument(skip_all)]
    pub fn dirty_paths(&self, ignored_prefixes: &[&str]) -> Result<Vec<String>> {
        let raw = self.capture(&["status", "--porcelain=v1", "-z", "--untracked-files=all"])?;
        let dirty: Vec<String> = changed_paths(&raw)?
            .into_iter()
            .filter(|path| !ignored_prefixes.iter().any(|prefix| path.starts_with(prefix)))
            .collect();
        debug!(dirty = dirty.len(), "worktree probed");
        Ok(dirty)
    }

    fn capture(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "git {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        String::from_utf8(output.stdout).context("git output is not UTF-8")
    }
}

/// Paths from NUL-separated `status --porcelain=v1 -z` output. A rename or
/// copy record is followed by its source path, which is skipped.
fn changed_paths(raw: &str) -> Result<Vec<String>> {
    let mut records = raw.split('\0').filter(|record| !record.is_empty());
    let mut paths = Vec::new();
    while let Some(record) = records.next() {
        let (Some(code), Some(path)) = (record.get(..2), record.get(3..)) else {
            bail!("malformed status record '{record}'");
        };
        if code.starts_with(['R', 'C']) {
            records.next();
        }
        paths.push(path.to_string());
    }
    Ok(paths)
}
