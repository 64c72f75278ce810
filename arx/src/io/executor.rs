//! Command runner abstraction.
//!
//! The [`CommandRunner`] trait decouples dispatch from process spawning. Tests
//! use scripted runners that return predetermined outcomes without spawning
//! anything.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument};

use crate::io::process::{CapturedOutput, run_argv};

/// Parameters for one command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Abstraction over command execution backends.
pub trait CommandRunner: Send + Sync {
    /// Run to completion or timeout. `Err` means the command could not be
    /// started; a non-zero exit is reported through the output.
    fn run(&self, request: &CommandRequest) -> Result<CapturedOutput>;
}

impl<T: CommandRunner + ?Sized> CommandRunner for Arc<T> {
    fn run(&self, request: &CommandRequest) -> Result<CapturedOutput> {
        (**self).run(request)
    }
}

/// Runner that spawns real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    #[instrument(skip_all, fields(workdir = %request.workdir.display()))]
    fn run(&self, request: &CommandRequest) -> Result<CapturedOutput> {
        info!(command = %request.argv.join(" "), "running command");
        run_argv(
            &request.argv,
            &request.workdir,
            request.timeout,
            request.output_limit_bytes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_runner_runs_in_workdir() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("marker.txt"), "x").expect("write");
        let out = ProcessRunner
            .run(&CommandRequest {
                argv: vec!["ls".to_string()],
                workdir: temp.path().to_path_buf(),
                timeout: Duration::from_secs(10),
                output_limit_bytes: 1_000,
            })
            .expect("run");
        assert!(out.success());
        assert!(out.stdout.contains("marker.txt"));
    }
}
