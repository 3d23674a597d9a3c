use std::collections::BTreeMap;
use std::process::Command;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::command::{fire, find_id, query, render, submit};
use super::{Backend, Submission, check_config, option_value, wrapper};
use crate::error::RunnerError;
use crate::job::Job;

fn default_qsub() -> String {
    "qsub".into()
}

fn default_qstat() -> String {
    "qstat".into()
}

fn default_qdel() -> String {
    "qdel".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SgeConfig {
    /// `#$` directives, keyed with or without the `sge.` prefix.
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
    #[serde(default = "default_qsub")]
    pub qsub: String,
    #[serde(default = "default_qstat")]
    pub qstat: String,
    #[serde(default = "default_qdel")]
    pub qdel: String,
    #[serde(default)]
    pub pre: String,
    #[serde(default)]
    pub post: String,
    #[serde(default)]
    pub poll_ms: Option<u64>,
}

impl Default for SgeConfig {
    fn default() -> Self {
        Self {
            options: BTreeMap::new(),
            qsub: default_qsub(),
            qstat: default_qstat(),
            qdel: default_qdel(),
            pre: String::new(),
            post: String::new(),
            poll_ms: None,
        }
    }
}

impl SgeConfig {
    pub fn option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// Options with any `<prefix>.` stripped from their keys.
pub(crate) fn strip_prefix(options: &BTreeMap<String, Value>, prefix: &str) -> BTreeMap<String, Value> {
    options
        .iter()
        .map(|(key, value)| {
            let key = key
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('.'))
                .unwrap_or(key);
            (key.to_string(), value.clone())
        })
        .collect()
}

/// Submits the wrapper to a Sun Grid Engine queue.
pub struct SgeRunner {
    job: Job,
    config: SgeConfig,
    id: Option<String>,
}

impl SgeRunner {
    pub fn new(job: Job, config: &SgeConfig) -> Result<Self, RunnerError> {
        let programs = [&config.qsub, &config.qstat, &config.qdel].map(String::as_str);
        check_config("sge", &config.options, &programs)?;
        Ok(Self {
            job,
            config: config.clone(),
            id: None,
        })
    }

    fn directives(&self) -> Vec<String> {
        let mut options = strip_prefix(&self.config.options, "sge");
        let mut lines = Vec::new();
        let mut emit = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                lines.push(if value.is_empty() {
                    format!("#$ -{key}")
                } else {
                    format!("#$ -{key} {value}")
                });
            }
        };

        let name = options.remove("N").and_then(|v| option_value(&v));
        emit("N", Some(name.unwrap_or_else(|| self.job.name())));
        for key in ["q", "j"] {
            emit(key, options.remove(key).and_then(|v| option_value(&v)));
        }

        let stdout = options.remove("o").and_then(|v| option_value(&v));
        emit("o", Some(stdout.unwrap_or_else(|| self.job.stdout_file().into_string())));
        let stderr = options.remove("e").and_then(|v| option_value(&v));
        emit("e", Some(stderr.unwrap_or_else(|| self.job.stderr_file().into_string())));
        emit("cwd", Some(String::new()));
        options.remove("cwd");

        for (key, value) in &options {
            emit(key, option_value(value));
        }
        lines
    }
}

impl Backend for SgeRunner {
    fn ext(&self) -> &'static str {
        "sge"
    }

    fn wrapper(&self) -> String {
        wrapper(
            &self.job,
            &self.directives(),
            &self.config.pre,
            self.job.script().as_str(),
            &self.config.post,
        )
    }

    fn job(&self) -> &Job {
        &self.job
    }

    fn submit(&mut self) -> Result<Submission, RunnerError> {
        let mut command = Command::new(&self.config.qsub);
        command.arg(self.wrapper_path().as_str());
        let output = submit(&mut command)?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        // "Your job 6556149 ("name") has been submitted"
        let id = find_id(&stdout, false).ok_or_else(|| RunnerError::Submission {
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

        let mut command = Command::new(&self.config.qstat);
        command.arg("-j").arg(id);
        Ok(query(&mut command)?.status.success())
    }

    fn kill(&mut self) {
        if let Some(id) = self.id.take() {
            fire(Command::new(&self.config.qdel).arg(&id));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::runner::tests::{job_with, mock};
    use crate::runner::{Runner, RunnerConfig};

    fn full_options() -> SgeConfig {
        SgeConfig {
            pre: "alias qsub=\"/mocks/qsub\"".into(),
            ..SgeConfig::default()
        }
        .option("sge.q", "queue")
        .option("sge.j", "y")
        .option("sge.M", "xxx@abc.com")
        .option("sge.m", "yes")
        .option("sge.mem", "4G")
        .option("sge.notify", true)
        .option("sge.hold", false)
    }

    #[test]
    fn test_wrapper_defaults() {
        let (_tmp, job) = job_with(RunnerConfig::Sge(full_options()), "true", 1);
        let runner = SgeRunner::new(job.clone(), &full_options()).unwrap();

        let expected = [
            "#!/usr/bin/env bash".to_string(),
            format!("#$ -N {}", job.name()),
            "#$ -q queue".into(),
            "#$ -j y".into(),
            format!("#$ -o {}", job.stdout_file()),
            format!("#$ -e {}", job.stderr_file()),
            "#$ -cwd".into(),
            "#$ -M xxx@abc.com".into(),
            "#$ -m yes".into(),
            "#$ -mem 4G".into(),
            "#$ -notify".into(),
            String::new(),
            format!(
                "trap \"status=\\$?; echo \\$status >'{}'; exit \\$status\" 1 2 3 6 7 8 9 10 11 12 15 16 EXIT",
                job.rc_file()
            ),
            "alias qsub=\"/mocks/qsub\"".into(),
            String::new(),
            job.script().into_string(),
            String::new(),
            String::new(),
        ]
        .join("\n");

        assert_eq!(runner.wrapper(), expected);
        assert!(job.name().ends_with(".2"));
    }

    #[test]
    fn test_wrapper_explicit_name_and_logs() {
        let config = full_options()
            .option("sge.N", "SgeJobName")
            .option("o", "/logs/out")
            .option("sge.e", "/logs/err");
        let (_tmp, job) = job_with(RunnerConfig::Sge(config.clone()), "true", 0);
        let text = SgeRunner::new(job, &config).unwrap().wrapper();

        assert!(text.contains("\n#$ -N SgeJobName\n#$ -q queue\n#$ -j y\n#$ -o /logs/out\n#$ -e /logs/err\n#$ -cwd\n"));
        assert!(!text.contains("hold"));
    }

    #[test]
    fn test_submit_poll_kill() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("calls.log");
        let record = format!("echo \"$0 $@\" >> '{}'", log.display());
        let config = SgeConfig {
            qsub: mock(
                tmp.path(),
                "qsub",
                &format!("{record}\necho 'Your job 6556149 (\"pRun\") has been submitted'"),
            ),
            qstat: mock(tmp.path(), "qstat", &format!("{record}\nexit 1")),
            qdel: mock(tmp.path(), "qdel", &record),
            ..SgeConfig::default()
        };

        let (_tmp, job) = job_with(RunnerConfig::Sge(config), "true", 0);
        let mut runner = Runner::bind(&job).unwrap();
        runner.prepare().unwrap();
        assert!(runner.wrapper_path().as_str().ends_with("job.script.sge"));

        let submission = runner.submit().unwrap();
        assert_eq!(submission.pid, "6556149");
        assert_eq!(job.pid().as_deref(), Some("6556149"));
        assert!(!runner.is_running());
        runner.kill();

        let calls = fs::read_to_string(&log).unwrap();
        let calls: Vec<_> = calls.lines().collect();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].ends_with(&format!("qsub {}", runner.wrapper_path())));
        assert!(calls[1].ends_with("qstat -j 6556149"));
        assert!(calls[2].ends_with("qdel 6556149"));
    }

    #[test]
    fn test_bind_rejects_bad_config() {
        let nested = SgeConfig::default().option("sge.l", serde_json::json!(["h_vmem=4G", "h_rt=1:00:00"]));
        let (_tmp, job) = job_with(RunnerConfig::Sge(nested), "true", 0);
        assert!(matches!(Runner::bind(&job), Err(RunnerError::Configuration(_))));

        let unnamed = SgeConfig {
            qstat: String::new(),
            ..SgeConfig::default()
        };
        let (_tmp, job) = job_with(RunnerConfig::Sge(unnamed), "true", 0);
        assert!(matches!(Runner::bind(&job), Err(RunnerError::Configuration(_))));
    }

    #[test]
    fn test_submit_missing_binary() {
        let config = SgeConfig {
            qsub: "/nonexistent/qsub".into(),
            ..SgeConfig::default()
        };
        let (_tmp, job) = job_with(RunnerConfig::Sge(config), "true", 0);
        let mut runner = Runner::bind(&job).unwrap();
        runner.prepare().unwrap();

        match runner.submit() {
            Err(RunnerError::Submission { rc, .. }) => assert_eq!(rc, 127),
            other => panic!("unexpected result: {:?}", other.map(|s| s.pid)),
        }
        assert_eq!(job.pid(), None);
    }
}
