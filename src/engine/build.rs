use crate::error::BuildError;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Output of a successful build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    /// Combined stdout + stderr of the build tool (warnings, progress).
    pub diagnostics: String,
    pub elapsed: Duration,
}

/// Runs the external build tool inside the build directory.
#[derive(Debug, Clone)]
pub struct BuildInvoker {
    command: Vec<String>,
    working_dir: PathBuf,
}

impl BuildInvoker {
    pub fn new(command: Vec<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command,
            working_dir: working_dir.into(),
        }
    }

    /// Build once and report the outcome. Never retries.
    pub async fn build(&self) -> Result<BuildReport, BuildError> {
        let (program, args) = self.command.split_first().ok_or(BuildError::EmptyCommand)?;
        let start = Instant::now();

        tracing::info!(
            program = %program,
            working_dir = %self.working_dir.display(),
            "build started"
        );

        let output = Command::new(program)
            .args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| BuildError::Spawn {
                program: program.clone(),
                source,
            })?;

        let elapsed = start.elapsed();
        let diagnostics = combine_streams(&output.stdout, &output.stderr);

        if !output.status.success() {
            tracing::warn!(
                code = ?output.status.code(),
                elapsed_ms = elapsed.as_millis() as u64,
                "build failed"
            );
            return Err(BuildError::CompilationFailed {
                code: output.status.code(),
                diagnostics,
            });
        }

        tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "build succeeded");
        Ok(BuildReport {
            diagnostics,
            elapsed,
        })
    }
}

fn combine_streams(stdout: &[u8], stderr: &[u8]) -> String {
    let out = String::from_utf8_lossy(stdout);
    let err = String::from_utf8_lossy(stderr);
    match (out.trim().is_empty(), err.trim().is_empty()) {
        (true, true) => String::new(),
        (false, true) => out.into_owned(),
        (true, false) => err.into_owned(),
        (false, false) => {
            let mut s = out.into_owned();
            if !s.ends_with('\n') {
                s.push('\n');
            }
            s.push_str(&err);
            s
        }
    }
}
