use std::collections::BTreeMap;
use std::process::Command;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::command::{fire, find_id, query, render, submit};
use super::sge::strip_prefix;
use super::{Backend, Submission, check_config, option_value, wrapper};
use crate::error::RunnerError;
use crate::job::Job;

fn default_sbatch() -> String {
    "sbatch".into()
}

fn default_srun() -> String {
    "srun".into()
}

fn default_squeue() -> String {
    "squeue".into()
}

fn default_scancel() -> String {
    "scancel".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlurmConfig {
    /// `#SBATCH` directives, keyed with or without the `slurm.` prefix.
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
    #[serde(default = "default_sbatch")]
    pub sbatch: String,
    #[serde(default = "default_srun")]
    pub srun: String,
    #[serde(default = "default_squeue")]
    pub squeue: String,
    #[serde(default = "default_scancel")]
    pub scancel: String,
    /// Prepended to the job script, `srun` unless set.
    #[serde(default)]
    pub cmd_prefix: Option<String>,
    #[serde(default)]
    pub pre: String,
    #[serde(default)]
    pub post: String,
    #[serde(default)]
    pub poll_ms: Option<u64>,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            options: BTreeMap::new(),
            sbatch: default_sbatch(),
            srun: default_srun(),
            squeue: default_squeue(),
            scancel: default_scancel(),
            cmd_prefix: None,
            pre: String::new(),
            post: String::new(),
            poll_ms: None,
        }
    }
}

impl SlurmConfig {
    pub fn option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// Submits the wrapper with `sbatch`.
pub struct SlurmRunner {
    job: Job,
    config: SlurmConfig,
    id: Option<String>,
}

impl SlurmRunner {
    pub fn new(job: Job, config: &SlurmConfig) -> Result<Self, RunnerError> {
        let programs = [&config.sbatch, &config.srun, &config.squeue, &config.scancel].map(String::as_str);
        check_config("slurm", &config.options, &programs)?;
        Ok(Self {
            job,
            config: config.clone(),
            id: None,
        })
    }

    fn directives(&self) -> Vec<String> {
        let mut options = strip_prefix(&self.config.options, "slurm");
        let mut lines = Vec::new();
        let mut emit = |key: &str, value: Option<String>| {
            let Some(value) = value else { return };
            let flag = if key.chars().count() == 1 {
                format!("-{key}")
            } else {
                format!("--{key}")
            };
            lines.push(if value.is_empty() {
                format!("#SBATCH {flag}")
            } else {
                format!("#SBATCH {flag} {value}")
            });
        };

        let name = options.remove("J").and_then(|v| option_value(&v));
        emit("J", Some(name.unwrap_or_else(|| self.job.name())));
        let stdout = options.remove("o").and_then(|v| option_value(&v));
        emit("o", Some(stdout.unwrap_or_else(|| self.job.stdout_file().into_string())));
        let stderr = options.remove("e").and_then(|v| option_value(&v));
        emit("e", Some(stderr.unwrap_or_else(|| self.job.stderr_file().into_string())));

        for (key, value) in &options {
            emit(key, option_value(value));
        }
        lines
    }
}

impl Backend for SlurmRunner {
    fn ext(&self) -> &'static str {
        "slurm"
    }

    fn wrapper(&self) -> String {
        let prefix = self
            .config
            .cmd_prefix
            .as_deref()
            .unwrap_or(&self.config.srun);
        let command = format!("{prefix} {}", self.job.script());

        wrapper(
            &self.job,
            &self.directives(),
            &self.config.pre,
            &command,
            &self.config.post,
        )
    }

    fn job(&self) -> &Job {
        &self.job
    }

    fn submit(&mut self) -> Result<Submission, RunnerError> {
        let mut command = Command::new(&self.config.sbatch);
        command.arg(self.wrapper_path().as_str());
        let output = submit(&mut command)?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        // "Submitted batch job 1823334"
        let id = find_id(&stdout, true).ok_or_else(|| RunnerError::Submission {
            cmd: render(&command),
            rc: 0,
            message: format!("no job id in output: {}", stdout.trim()),
        })?;
        self.id = Some(id.clone());

        Ok(Submission {
            pid: id,
            cmd: render(&command),
        })
    }

    fn is_running(&mut self) -> Result<bool, RunnerError> {
        let Some(id) = &self.id else {
            return Ok(false);
        };

        let mut command = Command::new(&self.config.squeue);
        command.arg("-h").arg("-j").arg(id);
        let output = query(&mut command)?;
        Ok(output.status.success() && !String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }

    fn kill(&mut self) {
        if let Some(id) = self.id.take() {
            fire(Command::new(&self.config.scancel).arg(&id));
        }
    }
}
