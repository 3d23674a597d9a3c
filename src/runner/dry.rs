use super::local::{LocalConfig, LocalRunner};
use super::{Backend, Submission, wrapper};
use crate::error::RunnerError;
use crate::job::Job;
use crate::process::OutputKind;
use crate::utils::quote;

/// Pretends to run a job by creating its declared outputs.
pub struct DryRunner {
    inner: LocalRunner,
}

impl DryRunner {
    pub fn new(job: Job, config: &LocalConfig) -> Self {
        Self {
            inner: LocalRunner::new(job, config),
        }
    }
}

impl Backend for DryRunner {
    fn ext(&self) -> &'static str {
        "dry"
    }

    fn wrapper(&self) -> String {
        let job = self.inner.job();
        let command = job
            .outputs()
            .iter()
            .filter_map(|output| match output.kind {
                OutputKind::File => Some(format!("touch {}", quote(&output.value))),
                OutputKind::Dir => Some(format!("mkdir -p {}", quote(&output.value))),
                OutputKind::Var => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        wrapper(job, &[], "", &command, "")
    }

    fn job(&self) -> &Job {
        self.inner.job()
    }

    fn submit(&mut self) -> Result<Submission, RunnerError> {
        let path = self.wrapper_path();
        self.inner.spawn(path.as_str())
    }

    fn is_running(&mut self) -> Result<bool, RunnerError> {
        self.inner.child_running()
    }

    fn kill(&mut self) {
        self.inner.kill_child()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::runner::tests::job_with;
    use crate::runner::{Runner, RunnerConfig};

    #[test]
    fn test_wrapper_touches_outputs() {
        let (_tmp, job) = job_with(RunnerConfig::Dry(LocalConfig::default()), "exit 1", 0);
        let runner = DryRunner::new(job.clone(), &LocalConfig::default());

        let file = job.outdir().join("a.txt");
        let dir = job.outdir().join("b.dir");
        let expected = format!("\n\ntouch '{file}'\nmkdir -p '{dir}'\n\n");
        assert!(runner.wrapper().ends_with(&expected));
        assert_eq!(runner.wrapper_path().as_str(), format!("{}.dry", job.script()));
    }

    #[test]
    fn test_dry_run_succeeds() {
        let (_tmp, job) = job_with(RunnerConfig::Dry(LocalConfig::default()), "exit 1", 0);
        let mut runner = Runner::bind(&job).unwrap();
        runner.prepare().unwrap();
        runner.submit().unwrap();
        while runner.is_running() {
            thread::sleep(Duration::from_millis(20));
        }

        assert_eq!(job.rc(), Some(0));
        assert!(job.outcome().is_ok());
        assert!(fs::metadata(job.outdir().join("b.dir")).unwrap().is_dir());
    }
}
