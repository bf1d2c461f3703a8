//! Error types for the run pipeline.

use crate::model::{ErrorKind, RunState};
use std::path::PathBuf;

/// Errors produced while rewriting the configuration document.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration document not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("malformed declaration for {name} on line {line}: {text:?}")]
    MalformedDeclaration {
        name: &'static str,
        line: usize,
        text: String,
    },

    #[error("no declaration for {name} in configuration document")]
    MissingDeclaration { name: &'static str },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors produced by the build step.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("build failed (exit code {code:?})")]
    CompilationFailed {
        code: Option<i32>,
        diagnostics: String,
    },

    #[error("failed to launch build tool {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("build command is empty")]
    EmptyCommand,
}

/// Errors produced by the process supervisor.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for child process: {0}")]
    Wait(#[source] std::io::Error),
}

/// Rejections of controller calls. Never affect an in-flight run.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RunStateError {
    #[error("a run is already in progress (state: {})", state.label())]
    AlreadyRunning { state: RunState },

    #[error("run parameter {name} must be greater than zero")]
    InvalidParameter { name: &'static str },
}

/// Fatal errors that end a run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl RunError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RunError::Config(_) => ErrorKind::Config,
            RunError::Build(_) => ErrorKind::Build,
            RunError::Process(_) => ErrorKind::Process,
        }
    }

    /// Captured build output, when there is any.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            RunError::Build(BuildError::CompilationFailed { diagnostics, .. }) => {
                Some(diagnostics.as_str())
            }
            _ => None,
        }
    }
}
