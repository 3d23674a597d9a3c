#![forbid(unsafe_code)]
//! Runs graphs of shell processes.
//!
//! A [`Proc`] declares a script template, its outputs, and how its jobs
//! should run. Processes depend on each other, and a [`Pipeline`] walks the
//! resulting [`ProcTree`] from the start processes: each process is expanded
//! into [`Job`]s, one per input, which the [`Jobmgr`] runs with bounded
//! concurrency on a local, SSH, SGE or Slurm backend. Jobs whose signature did
//! not change since their last successful run are skipped.
//!
//! ```no_run
//! use nagare::{JobInput, OutputDecl, Pipeline, Proc, Verbatim};
//!
//! let sort = Proc::builder("pSort")
//!     .script("sort input.txt > output/sorted.txt")
//!     .output(OutputDecl::file("out", "sorted.txt"))
//!     .finish();
//! let count = Proc::builder("pCount")
//!     .script("wc -l ../../pSort.*/1/output/sorted.txt > output/count.txt")
//!     .output(OutputDecl::file("out", "count.txt"))
//!     .depends_on(&sort)
//!     .finish();
//!
//! nagare::init_logging()?;
//! Pipeline::new()
//!     .add(&[&count])
//!     .starts(&[&sort])
//!     .run(|proc, _| Ok(proc.expand(vec![JobInput::new()], &Verbatim)?))?;
//! # Ok::<(), anyhow::Error>(())
//! ```

mod cache;
mod core;
mod error;
mod job;
mod jobmgr;
mod pipeline;
mod process;
mod render;
pub mod runner;
mod tree;
mod utils;

pub use crate::cache::{
    CacheVerdict, FileSig, RunReason, SigField, Signature, SignatureCache, SignatureChange,
};
pub use crate::core::Hash32;
pub use crate::error::*;
pub use crate::job::{Job, JobInput, JobOutput};
pub use crate::jobmgr::{JobReport, JobState, Jobmgr, KillSwitch, Outcome};
pub use crate::pipeline::{Pipeline, ProcRun, find_run};
pub use crate::process::{DEFAULT_TAG, ErrorHow, Fallback, OutputDecl, OutputKind, Proc, ProcBuilder};
#[cfg(feature = "minijinja")]
pub use crate::render::MiniJinja;
pub use crate::render::{Render, Verbatim};
pub use crate::runner::{Backend, Runner, RunnerConfig, Submission};
pub use crate::tree::{ProcNode, ProcTree};
pub use crate::utils::init_logging;
