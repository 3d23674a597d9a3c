use std::fs::File;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use super::command::{render, spawn_failed};
use super::{Backend, Submission, wrapper};
use crate::error::RunnerError;
use crate::job::Job;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub poll_ms: Option<u64>,
    /// Shell lines run before the job script.
    pub pre: String,
    /// Shell lines run after the job script.
    pub post: String,
}

/// Runs the wrapper as a child process in its own process group.
pub struct LocalRunner {
    job: Job,
    config: LocalConfig,
    child: Option<Child>,
}

impl LocalRunner {
    pub fn new(job: Job, config: &LocalConfig) -> Self {
        Self {
            job,
            config: config.clone(),
            child: None,
        }
    }

    /// Spawn `bash <wrapper>` with the job's stdout and stderr files.
    pub(crate) fn spawn(&mut self, wrapper: &str) -> Result<Submission, RunnerError> {
        let mut command = Command::new("bash");
        command
            .arg(wrapper)
            .current_dir(self.job.dir())
            .stdin(Stdio::null())
            .stdout(File::create(self.job.stdout_file())?)
            .stderr(File::create(self.job.stderr_file())?)
            .process_group(0);

        let child = command.spawn().map_err(|e| spawn_failed(&command, e))?;
        let pid = child.id().to_string();
        self.child = Some(child);

        Ok(Submission {
            pid,
            cmd: render(&command),
        })
    }

    pub(crate) fn child_running(&mut self) -> Result<bool, RunnerError> {
        let Some(child) = self.child.as_mut() else {
            return Ok(false);
        };

        match child.try_wait() {
            Ok(status) => Ok(status.is_none()),
            Err(e) => Err(RunnerError::Poll {
                cmd: format!("wait {}", child.id()),
                message: e.to_string(),
            }),
        }
    }

    pub(crate) fn kill_child(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        // The wrapper leads its own group, so this reaches the job script too.
        let pid = Pid::from_raw(child.id() as i32);
        if let Err(e) = killpg(pid, Signal::SIGKILL) {
            tracing::debug!("killpg {pid}: {e}");
        }
        if let Err(e) = child.wait() {
            tracing::warn!("failed to reap job process {pid}: {e}");
        }
    }
}

impl Backend for LocalRunner {
    fn ext(&self) -> &'static str {
        "local"
    }

    fn wrapper(&self) -> String {
        wrapper(
            &self.job,
            &[],
            &self.config.pre,
            self.job.script().as_str(),
            &self.config.post,
        )
    }

    fn job(&self) -> &Job {
        &self.job
    }

    fn submit(&mut self) -> Result<Submission, RunnerError> {
        let path = self.wrapper_path();
        self.spawn(path.as_str())
    }

    fn is_running(&mut self) -> Result<bool, RunnerError> {
        self.child_running()
    }

    fn kill(&mut self) {
        self.kill_child()
    }
}

impl Drop for LocalRunner {
    fn drop(&mut self) {
        // Reap a finished child; a running one keeps going.
        if let Some(child) = self.child.as_mut() {
            let _ = child.try_wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::runner::tests::job_with;
    use crate::runner::{Runner, RunnerConfig};

    fn wait(runner: &mut Runner) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while runner.is_running() {
            assert!(Instant::now() < deadline, "job did not finish");
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_wrapper() {
        let config = LocalConfig {
            pre: "prescript".into(),
            post: "postscript".into(),
            ..Default::default()
        };
        let (_tmp, job) = job_with(RunnerConfig::Local(config), "true", 0);
        let mut runner = Runner::bind(&job).unwrap();
        runner.prepare().unwrap();

        let path = runner.wrapper_path();
        assert_eq!(path.as_str(), format!("{}.local", job.script()));
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("#!/usr/bin/env bash\ntrap "));
        assert!(text.ends_with(&format!("prescript\n\n{}\n\npostscript", job.script())));
    }

    #[test]
    fn test_run_writes_rc_and_output() {
        let (_tmp, job) = job_with(RunnerConfig::default(), "echo hello\necho oops >&2\nexit 3", 0);
        let mut runner = Runner::bind(&job).unwrap();
        runner.prepare().unwrap();

        let submission = runner.submit().unwrap();
        assert_eq!(job.pid(), Some(submission.pid));
        wait(&mut runner);

        assert_eq!(job.rc(), Some(3));
        assert_eq!(fs::read_to_string(job.stdout_file()).unwrap(), "hello\n");
        assert_eq!(fs::read_to_string(job.stderr_file()).unwrap(), "oops\n");
    }

    #[test]
    fn test_kill() {
        let (_tmp, job) = job_with(RunnerConfig::default(), "sleep 30", 0);
        let mut runner = Runner::bind(&job).unwrap();
        runner.prepare().unwrap();
        runner.submit().unwrap();
        assert!(runner.is_running());

        let started = Instant::now();
        runner.kill();
        assert!(!runner.is_running());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
