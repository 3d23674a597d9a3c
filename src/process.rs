//! Process declarations.
//!
//! A [`Proc`] is a user-declared unit of work. It does not run anything by
//! itself: the pipeline driver expands it into one [`Job`](crate::Job) per
//! input element, and the [`Jobmgr`](crate::Jobmgr) runs those jobs on the
//! backend selected by [`Proc::runner`].

use std::panic::Location;
use std::sync::{Arc, RwLock, Weak};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::runner::RunnerConfig;

/// Tag given to processes which don't declare one.
pub const DEFAULT_TAG: &str = "notag";

/// What to do when a job of a process fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorHow {
    /// The first failure kills running jobs and aborts the pipeline.
    Halt,
    /// Failures are recorded, siblings and dependents carry on.
    Ignore,
    /// Resubmit a failing job up to `retries` times, then apply `fallback`.
    Retry { retries: u32, fallback: Fallback },
}

/// Behaviour of [`ErrorHow::Retry`] once the retries are used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fallback {
    Halt,
    Ignore,
}

impl Default for ErrorHow {
    fn default() -> Self {
        ErrorHow::Ignore
    }
}

impl ErrorHow {
    pub(crate) fn retries(&self) -> u32 {
        match self {
            ErrorHow::Retry { retries, .. } => *retries,
            _ => 0,
        }
    }

    /// Whether an exhausted failure should stop the whole batch.
    pub(crate) fn halts(&self) -> bool {
        matches!(
            self,
            ErrorHow::Halt
                | ErrorHow::Retry {
                    fallback: Fallback::Halt,
                    ..
                }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// A plain value, rendered and stored in the signature.
    Var,
    /// A file the job must create inside its output directory.
    File,
    /// A directory the job must create inside its output directory.
    Dir,
}

/// One output declared by a process, with a template rendered per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDecl {
    pub name: String,
    pub kind: OutputKind,
    pub template: String,
}

impl OutputDecl {
    pub fn var(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self::new(name, OutputKind::Var, template)
    }

    pub fn file(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self::new(name, OutputKind::File, template)
    }

    pub fn dir(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self::new(name, OutputKind::Dir, template)
    }

    fn new(name: impl Into<String>, kind: OutputKind, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            template: template.into(),
        }
    }
}

/// A declared process.
pub struct Proc {
    id: String,
    tag: String,
    desc: String,
    suffix: String,
    lang: String,
    script: String,
    output: Vec<OutputDecl>,
    forks: usize,
    error: ErrorHow,
    cache: bool,
    workdir: Utf8PathBuf,
    runner: RunnerConfig,
    depends: RwLock<Vec<Weak<Proc>>>,
    declared: &'static Location<'static>,
}

impl Proc {
    /// Start declaring a process. The caller's location is kept for
    /// diagnostics about duplicated processes.
    #[track_caller]
    pub fn builder(id: impl Into<String>) -> ProcBuilder {
        ProcBuilder {
            id: id.into(),
            tag: DEFAULT_TAG.into(),
            desc: String::new(),
            lang: "bash".into(),
            script: String::new(),
            output: Vec::new(),
            forks: 1,
            error: ErrorHow::default(),
            cache: true,
            workdir: Utf8PathBuf::from("workdir"),
            runner: RunnerConfig::default(),
            depends: Vec::new(),
            declared: Location::caller(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn desc(&self) -> &str {
        &self.desc
    }

    /// Short digest distinguishing processes with the same id and tag but a
    /// different script.
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn lang(&self) -> &str {
        &self.lang
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn output(&self) -> &[OutputDecl] {
        &self.output
    }

    /// Maximum number of jobs running at once.
    pub fn forks(&self) -> usize {
        self.forks
    }

    pub fn error(&self) -> ErrorHow {
        self.error
    }

    pub fn cache(&self) -> bool {
        self.cache
    }

    pub fn runner(&self) -> &RunnerConfig {
        &self.runner
    }

    pub fn declared(&self) -> &'static Location<'static> {
        self.declared
    }

    /// `id`, or `id.tag` when a tag was given.
    pub fn name(&self) -> String {
        if self.tag == DEFAULT_TAG {
            self.id.clone()
        } else {
            format!("{}.{}", self.id, self.tag)
        }
    }

    /// Directory holding one subdirectory per job.
    pub fn workdir(&self) -> Utf8PathBuf {
        self.workdir
            .join(format!("{}.{}.{}", self.id, self.tag, self.suffix))
    }

    /// Processes this one depends on. Dependencies that were dropped are
    /// skipped.
    pub fn depends(&self) -> Vec<Arc<Proc>> {
        let depends = self.depends.read().unwrap_or_else(|e| e.into_inner());
        depends.iter().filter_map(Weak::upgrade).collect()
    }

    /// Replace the declared dependencies.
    pub fn set_depends(&self, depends: &[&Arc<Proc>]) {
        let mut current = self.depends.write().unwrap_or_else(|e| e.into_inner());
        *current = depends.iter().map(|proc| Arc::downgrade(proc)).collect();
    }

    /// Same id and tag as `other`.
    pub fn same_id_tag(&self, other: &Proc) -> bool {
        self.id == other.id && self.tag == other.tag
    }
}

impl std::fmt::Debug for Proc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proc")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("suffix", &self.suffix)
            .field("declared", &format_args!("{}", self.declared))
            .finish()
    }
}

pub struct ProcBuilder {
    id: String,
    tag: String,
    desc: String,
    lang: String,
    script: String,
    output: Vec<OutputDecl>,
    forks: usize,
    error: ErrorHow,
    cache: bool,
    workdir: Utf8PathBuf,
    runner: RunnerConfig,
    depends: Vec<Weak<Proc>>,
    declared: &'static Location<'static>,
}

impl ProcBuilder {
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = desc.into();
        self
    }

    /// Interpreter used in the shebang of the job script.
    pub fn lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = lang.into();
        self
    }

    pub fn script(mut self, script: impl Into<String>) -> Self {
        self.script = script.into();
        self
    }

    pub fn output(mut self, output: OutputDecl) -> Self {
        self.output.push(output);
        self
    }

    pub fn forks(mut self, forks: usize) -> Self {
        self.forks = forks.max(1);
        self
    }

    pub fn error(mut self, error: ErrorHow) -> Self {
        self.error = error;
        self
    }

    pub fn cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    pub fn workdir(mut self, workdir: impl AsRef<Utf8Path>) -> Self {
        self.workdir = workdir.as_ref().to_owned();
        self
    }

    pub fn runner(mut self, runner: RunnerConfig) -> Self {
        self.runner = runner;
        self
    }

    pub fn depends_on(mut self, proc: &Arc<Proc>) -> Self {
        self.depends.push(Arc::downgrade(proc));
        self
    }

    pub fn finish(self) -> Arc<Proc> {
        let suffix = Hash32::hash_fields([
            self.id.as_str(),
            self.tag.as_str(),
            self.lang.as_str(),
            self.script.as_str(),
        ])
        .to_hex()[..8]
            .to_string();

        Arc::new(Proc {
            id: self.id,
            tag: self.tag,
            desc: self.desc,
            suffix,
            lang: self.lang,
            script: self.script,
            output: self.output,
            forks: self.forks,
            error: self.error,
            cache: self.cache,
            workdir: self.workdir,
            runner: self.runner,
            depends: RwLock::new(self.depends),
            declared: self.declared,
        })
    }
}
