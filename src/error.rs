use std::panic::Location;

use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NagareError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Process '{0}' could not be expanded into jobs:\n{1}")]
    Expand(String, anyhow::Error),

    #[error("Process '{0}':\n{1}")]
    Jobs(String, JobmgrError),
}

/// Errors raised while building or validating the process tree. All of them
/// are fatal for the pipeline being constructed.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error(
        "You cannot have two processes with the same id({id}) and tag({tag}).\n\
         >>> The 1st one was defined here: {first}\n\
         >>> The 2nd one was defined here: {second}"
    )]
    Duplicate {
        id: String,
        tag: String,
        first: &'static Location<'static>,
        second: &'static Location<'static>,
    },

    #[error("Process '{process}' depends on itself:\n    {}", .chain.join(" <- "))]
    Cyclic { process: String, chain: Vec<String> },

    #[error("Cannot find any end processes by the start processes assigned.{}", render_path(.path))]
    NoEnd { path: Option<Vec<String>> },

    #[error("Process '{0}' is not registered in the process tree")]
    Unregistered(String),
}

fn render_path(path: &Option<Vec<String>>) -> String {
    match path {
        Some(path) => format!("\n>>> One of the paths cannot pass:\n    {}", path.join(" <- ")),
        None => String::new(),
    }
}

/// Errors coming from an execution backend.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Runner is misconfigured: {0}")]
    Configuration(String),

    #[error("No server found for ssh runner.")]
    NoServerConfigured,

    #[error("No server is alive.")]
    NoAliveServer,

    #[error("Submission failed (rc {rc}): {cmd}\n{message}")]
    Submission {
        cmd: String,
        rc: i32,
        message: String,
    },

    #[error("Status query failed: {cmd}\n{message}")]
    Poll { cmd: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Couldn't read signature input {0}:\n{1}")]
    Stat(Utf8PathBuf, std::io::Error),

    #[error("Couldn't store signature:\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed signature file:\n{0}")]
    Format(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Process '{0}', job #{1}: couldn't render template:\n{2}")]
    Template(String, usize, anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Glob(#[from] glob::PatternError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),
}

/// Why a single job attempt did not succeed.
#[derive(Debug, Error)]
pub enum Failure {
    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("Job exited with return code {0}")]
    ReturnCode(i32),

    #[error("Job finished without writing a return code")]
    NoReturnCode,

    #[error("Expected outputs were not generated: {}", join_paths(.0))]
    MissingOutput(Vec<Utf8PathBuf>),

    #[error("Couldn't reset job directory:\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Job driver panicked: {0}")]
    Panic(String),
}

impl Failure {
    /// The job's own return code, if it got far enough to write one.
    pub fn rc(&self) -> Option<i32> {
        match self {
            Failure::ReturnCode(rc) => Some(*rc),
            Failure::MissingOutput(_) => Some(0),
            Failure::Runner(RunnerError::Submission { rc, .. }) => Some(*rc),
            _ => None,
        }
    }
}

fn join_paths(paths: &[Utf8PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error)]
pub enum JobmgrError {
    #[error("Job #{index} failed, halting.\n{failure}\n>>> Last lines of stderr:\n{stderr}")]
    Halted {
        index: usize,
        failure: Failure,
        stderr: String,
        outcome: Box<crate::jobmgr::Outcome>,
    },

    #[error("Batch was killed, {} job(s) never started", .outcome.pending())]
    Killed { outcome: Box<crate::jobmgr::Outcome> },

    #[error("Failed to build the job thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
