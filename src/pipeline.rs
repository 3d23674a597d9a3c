//! Runs a process tree from its start processes to its ends.

use std::sync::Arc;
use std::time::Instant;

use crate::error::NagareError;
use crate::job::Job;
use crate::jobmgr::{Jobmgr, KillSwitch, Outcome};
use crate::tree::ProcTree;
use crate::utils::as_overhead;
use crate::Proc;

/// A process that went through the job manager.
#[derive(Debug)]
pub struct ProcRun {
    pub proc: Arc<Proc>,
    pub jobs: Vec<Job>,
    pub outcome: Outcome,
}

/// Look up the run of `proc`, typically a dependency whose outputs feed the
/// process being expanded.
pub fn find_run<'a>(runs: &'a [ProcRun], proc: &Arc<Proc>) -> Option<&'a ProcRun> {
    runs.iter().find(|run| Arc::ptr_eq(&run.proc, proc))
}

#[derive(Default)]
pub struct Pipeline {
    tree: ProcTree,
    starts: Vec<Arc<Proc>>,
    kill: KillSwitch,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register processes, usually the ends. Their dependencies are
    /// discovered when the pipeline runs.
    pub fn add(mut self, procs: &[&Arc<Proc>]) -> Self {
        for proc in procs {
            self.tree.register(proc);
        }
        self
    }

    /// Processes the pipeline starts from. They are registered too.
    pub fn starts(mut self, procs: &[&Arc<Proc>]) -> Self {
        self.starts = procs.iter().map(|&proc| proc.clone()).collect();
        for proc in procs {
            self.tree.register(proc);
        }
        self
    }

    pub fn tree(&self) -> &ProcTree {
        &self.tree
    }

    /// Cancels whichever process is running and stops the pipeline.
    pub fn kill_switch(&self) -> KillSwitch {
        self.kill.clone()
    }

    /// Build and validate the tree: register every process reachable from
    /// the starts, reject duplicates and cycles, make sure ends exist.
    fn prepare(&mut self) -> Result<(), NagareError> {
        self.tree.reset();
        let starts: Vec<&Arc<Proc>> = self.starts.iter().collect();
        self.tree.set_starts(&starts);
        self.tree.build();

        for proc in self.tree.procs().cloned().collect::<Vec<_>>() {
            self.tree.check_duplicate(&proc)?;
        }

        let ends = self.tree.ends()?;
        tracing::debug!("pipeline: {} process(es), {} end(s)", self.tree.len(), ends.len());
        tracing::debug!("pipeline tree:\n{}", self.tree);
        Ok(())
    }

    /// Run every process once its dependencies ran.
    ///
    /// `expand` turns a process into its jobs. It gets the runs finished so
    /// far, so it can feed the outputs of dependencies into the inputs.
    /// A process whose jobs failed under the `ignore` policy still counts as
    /// ran; a halting failure stops the pipeline.
    pub fn run<F>(&mut self, mut expand: F) -> Result<Vec<ProcRun>, NagareError>
    where
        F: FnMut(&Arc<Proc>, &[ProcRun]) -> anyhow::Result<Vec<Job>>,
    {
        let start = Instant::now();
        self.prepare()?;

        let mut runs = Vec::new();
        while let Some(proc) = self.tree.next_to_run() {
            let name = proc.name();
            if proc.desc().is_empty() {
                tracing::info!("{name}");
            } else {
                tracing::info!("{name}: {}", proc.desc());
            }
            tracing::info!(
                "{name}: DEPENDS {} => {name} => {}",
                self.tree.prev_names(&proc)?,
                self.tree.next_names(&proc)?
            );

            let jobs = expand(&proc, &runs).map_err(|e| NagareError::Expand(name.clone(), e))?;
            let outcome = Jobmgr::new(&proc)
                .with_kill_switch(self.kill.clone())
                .run(&jobs)
                .map_err(|e| NagareError::Jobs(name.clone(), e))?;

            runs.push(ProcRun { proc, jobs, outcome });
        }

        for (name, waiting) in self.tree.unrun_processes()? {
            tracing::warn!("{name} did not run, waiting on: {}", waiting.join(", "));
        }

        tracing::info!("pipeline: {} process(es) ran {}", runs.len(), as_overhead(start));
        Ok(runs)
    }
}
