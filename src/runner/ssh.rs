use std::collections::BTreeMap;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use super::command::{fire, find_id, query, render, run_with_timeout, submit};
use super::{Backend, Submission, check_config, wrapper};
use crate::error::RunnerError;
use crate::job::Job;
use crate::utils::quote;

fn default_ssh() -> String {
    "ssh".into()
}

fn default_alive_timeout() -> u64 {
    3_000
}

/// Servers shared by every job of every process using them.
///
/// With `check_alive` set, the first job to bind checks every server once;
/// the servers that answered are reused until [`SshCluster::reset`]. Jobs
/// binding during the check wait for its result.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SshCluster {
    pub servers: Vec<String>,
    /// Identity file per server.
    #[serde(default)]
    pub keys: BTreeMap<String, Utf8PathBuf>,
    #[serde(default)]
    pub check_alive: bool,
    #[serde(default = "default_alive_timeout")]
    pub alive_timeout_ms: u64,
    #[serde(default = "default_ssh")]
    pub ssh: String,
    #[serde(default)]
    pub pre: String,
    #[serde(default)]
    pub post: String,
    #[serde(skip)]
    alive: Mutex<Option<Arc<[usize]>>>,
}

impl SshCluster {
    pub fn new(servers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            alive_timeout_ms: default_alive_timeout(),
            ssh: default_ssh(),
            ..Default::default()
        }
    }

    pub fn key(mut self, server: impl Into<String>, key: impl Into<Utf8PathBuf>) -> Self {
        self.keys.insert(server.into(), key.into());
        self
    }

    pub fn check_alive(mut self, check: bool) -> Self {
        self.check_alive = check;
        self
    }

    /// Forget which servers answered, the next bind checks again.
    pub fn reset(&self) {
        *self.alive.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// `ssh [-i key]`, without the server.
    fn command(&self, server: &str) -> Command {
        let mut command = Command::new(&self.ssh);
        if let Some(key) = self.keys.get(server) {
            command.arg("-i").arg(key.as_str());
        }
        command
    }

    /// Whether `server` accepts a non-interactive login in time.
    pub fn is_server_alive(&self, server: &str) -> bool {
        let timeout = Duration::from_millis(self.alive_timeout_ms);
        let mut command = self.command(server);
        command
            .args(["-o", "BatchMode=yes", "-o"])
            .arg(format!("ConnectTimeout={}", timeout.as_secs().max(1)))
            .args([server, "true"]);

        match run_with_timeout(&mut command, timeout) {
            Ok(Some(status)) => status.success(),
            Ok(None) => {
                tracing::debug!("{server}: liveness check timed out");
                false
            }
            Err(e) => {
                tracing::debug!("{}: {e}", render(&command));
                false
            }
        }
    }

    /// Indices of usable servers, checking once if needed.
    ///
    /// Called from job threads, so the liveness checks get their own scoped threads
    /// and never run on the job pool.
    fn alive(&self) -> Arc<[usize]> {
        let mut alive = self.alive.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(alive) = alive.as_ref() {
            return alive.clone();
        }

        let found: Arc<[usize]> = if self.check_alive {
            let found: Vec<usize> = thread::scope(|s| {
                let checks: Vec<_> = self
                    .servers
                    .iter()
                    .enumerate()
                    .map(|(i, server)| s.spawn(move || (i, self.is_server_alive(server))))
                    .collect();

                checks
                    .into_iter()
                    .filter_map(|check| check.join().ok())
                    .filter_map(|(i, up)| up.then_some(i))
                    .collect()
            });
            tracing::info!(
                "ssh: {} of {} server(s) alive",
                found.len(),
                self.servers.len()
            );
            found.into()
        } else {
            (0..self.servers.len()).collect()
        };

        *alive = Some(found.clone());
        found
    }

    /// Server for the job with the given index.
    pub fn select(&self, index: usize) -> Result<&str, RunnerError> {
        if self.servers.is_empty() {
            return Err(RunnerError::NoServerConfigured);
        }

        let alive = self.alive();
        if alive.is_empty() {
            return Err(RunnerError::NoAliveServer);
        }

        Ok(&self.servers[alive[index % alive.len()]])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    pub cluster: Arc<SshCluster>,
    #[serde(default)]
    pub poll_ms: Option<u64>,
}

/// Starts the wrapper detached on a remote server sharing the filesystem.
pub struct SshRunner {
    job: Job,
    cluster: Arc<SshCluster>,
    server: String,
    pid: Option<String>,
}

impl SshRunner {
    pub fn new(job: Job, config: &SshConfig) -> Result<Self, RunnerError> {
        check_config("ssh", &BTreeMap::new(), &[config.cluster.ssh.as_str()])?;
        let server = config.cluster.select(job.index())?.to_string();
        Ok(Self {
            job,
            cluster: config.cluster.clone(),
            server,
            pid: None,
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    fn remote(&self, script: String) -> Command {
        let mut command = self.cluster.command(&self.server);
        command.arg(&self.server).arg(script);
        command
    }
}

impl Backend for SshRunner {
    fn ext(&self) -> &'static str {
        "ssh"
    }

    fn wrapper(&self) -> String {
        let cwd = std::env::current_dir()
            .map(|dir| dir.to_string_lossy().into_owned())
            .unwrap_or_else(|_| ".".into());
        let command = format!("cd {}; {}", quote(&cwd), self.job.script());

        wrapper(
            &self.job,
            &[format!("# run on server: {}", self.server)],
            &self.cluster.pre,
            &command,
            &self.cluster.post,
        )
    }

    fn job(&self) -> &Job {
        &self.job
    }

    fn submit(&mut self) -> Result<Submission, RunnerError> {
        let script = format!(
            "setsid nohup bash {} >{} 2>{} </dev/null & echo $!",
            quote(self.wrapper_path().as_str()),
            quote(self.job.stdout_file().as_str()),
            quote(self.job.stderr_file().as_str()),
        );
        let mut command = self.remote(script);
        let output = submit(&mut command)?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        let pid = find_id(&stdout, true).ok_or_else(|| RunnerError::Submission {
            cmd: render(&command),
            rc: 0,
            message: format!("no pid in output: {}", stdout.trim()),
        })?;
        self.pid = Some(pid.clone());

        Ok(Submission {
            pid,
            cmd: render(&command),
        })
    }

    fn is_running(&mut self) -> Result<bool, RunnerError> {
        let Some(pid) = &self.pid else {
            return Ok(false);
        };

        let output = query(&mut self.remote(format!("kill -0 {pid}")))?;
        Ok(output.status.success())
    }

    fn kill(&mut self) {
        if let Some(pid) = self.pid.take() {
            fire(&mut self.remote(format!("kill -9 -- -{pid} || kill -9 {pid}")));
        }
    }
}
