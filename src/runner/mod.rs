//! Execution backends.
//!
//! A [`Runner`] is bound to exactly one attempt of one job. It writes a
//! backend specific wrapper script next to the job script, submits it, and
//! is then polled until it stops running. Every backend shares the same
//! wrapper layout:
//!
//! ```text
//! #!/usr/bin/env bash
//! <directives>
//!
//! trap "status=\$?; echo \$status >'<rc file>'; exit \$status" 1 2 3 ... EXIT
//! <pre script>
//!
//! <command>
//!
//! <post script>
//! ```

mod command;
mod dry;
mod local;
mod sge;
mod slurm;
mod ssh;

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::RunnerError;
use crate::job::Job;
use crate::utils::quote;

pub use dry::DryRunner;
pub use local::{LocalConfig, LocalRunner};
pub use sge::{SgeConfig, SgeRunner};
pub use slurm::{SlurmConfig, SlurmRunner};
pub use ssh::{SshCluster, SshConfig, SshRunner};

/// Signals caught by the wrapper to record a return code.
const TRAP_SIGNALS: &str = "1 2 3 6 7 8 9 10 11 12 15 16 EXIT";

/// Handle of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Local or remote pid, or queue job id.
    pub pid: String,
    /// Command used for the submission, for the logs.
    pub cmd: String,
}

/// Backend selection and options, as declared on a process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "runner", rename_all = "lowercase")]
pub enum RunnerConfig {
    Local(LocalConfig),
    Dry(LocalConfig),
    Ssh(SshConfig),
    Sge(SgeConfig),
    Slurm(SlurmConfig),
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig::Local(LocalConfig::default())
    }
}

impl RunnerConfig {
    /// Parse a configuration such as `{"runner": "sge", "options": {"q": "long"}}`.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn ssh(cluster: Arc<SshCluster>) -> Self {
        RunnerConfig::Ssh(SshConfig {
            cluster,
            poll_ms: None,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RunnerConfig::Local(_) => "local",
            RunnerConfig::Dry(_) => "dry",
            RunnerConfig::Ssh(_) => "ssh",
            RunnerConfig::Sge(_) => "sge",
            RunnerConfig::Slurm(_) => "slurm",
        }
    }

    /// How long to sleep between two status queries.
    pub fn poll_interval(&self) -> Duration {
        let (custom, default) = match self {
            RunnerConfig::Local(c) | RunnerConfig::Dry(c) => (c.poll_ms, 100),
            RunnerConfig::Ssh(c) => (c.poll_ms, 1_000),
            RunnerConfig::Sge(c) => (c.poll_ms, 5_000),
            RunnerConfig::Slurm(c) => (c.poll_ms, 5_000),
        };
        Duration::from_millis(custom.unwrap_or(default))
    }
}

/// The protocol every backend implements.
pub trait Backend {
    /// Extension of the wrapper script, `job.script.<ext>`.
    fn ext(&self) -> &'static str;

    /// Text of the wrapper script.
    fn wrapper(&self) -> String;

    fn job(&self) -> &Job;

    /// Start the wrapper without waiting for it.
    fn submit(&mut self) -> Result<Submission, RunnerError>;

    fn is_running(&mut self) -> Result<bool, RunnerError>;

    /// Stop the job. Errors are logged, never returned.
    fn kill(&mut self);

    fn wrapper_path(&self) -> Utf8PathBuf {
        let mut path = self.job().script().into_string();
        path.push('.');
        path.push_str(self.ext());
        Utf8PathBuf::from(path)
    }

    /// Write the wrapper script. Safe to call more than once.
    fn prepare(&mut self) -> Result<(), RunnerError> {
        let path = self.wrapper_path();
        fs::write(&path, self.wrapper())?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        Ok(())
    }
}

/// A backend bound to one job attempt.
pub enum Runner {
    Local(LocalRunner),
    Dry(DryRunner),
    Ssh(SshRunner),
    Sge(SgeRunner),
    Slurm(SlurmRunner),
}

impl Runner {
    /// Pick the backend configured on the job's process. For SSH this also
    /// selects the server.
    pub fn bind(job: &Job) -> Result<Runner, RunnerError> {
        let runner = match job.proc().runner() {
            RunnerConfig::Local(config) => Runner::Local(LocalRunner::new(job.clone(), config)),
            RunnerConfig::Dry(config) => Runner::Dry(DryRunner::new(job.clone(), config)),
            RunnerConfig::Ssh(config) => Runner::Ssh(SshRunner::new(job.clone(), config)?),
            RunnerConfig::Sge(config) => Runner::Sge(SgeRunner::new(job.clone(), config)?),
            RunnerConfig::Slurm(config) => Runner::Slurm(SlurmRunner::new(job.clone(), config)?),
        };
        Ok(runner)
    }

    fn backend(&self) -> &dyn Backend {
        match self {
            Runner::Local(r) => r,
            Runner::Dry(r) => r,
            Runner::Ssh(r) => r,
            Runner::Sge(r) => r,
            Runner::Slurm(r) => r,
        }
    }

    fn backend_mut(&mut self) -> &mut dyn Backend {
        match self {
            Runner::Local(r) => r,
            Runner::Dry(r) => r,
            Runner::Ssh(r) => r,
            Runner::Sge(r) => r,
            Runner::Slurm(r) => r,
        }
    }

    pub fn wrapper_path(&self) -> Utf8PathBuf {
        self.backend().wrapper_path()
    }

    pub fn prepare(&mut self) -> Result<(), RunnerError> {
        self.backend_mut().prepare()
    }

    /// Submit the job and record its pid.
    pub fn submit(&mut self) -> Result<Submission, RunnerError> {
        let backend = self.backend_mut();
        let submission = backend.submit()?;
        backend.job().set_pid(&submission.pid)?;
        Ok(submission)
    }

    /// Whether the job is still running. A failed status query counts as
    /// not running.
    pub fn is_running(&mut self) -> bool {
        match self.backend_mut().is_running() {
            Ok(running) => running,
            Err(e) => {
                tracing::warn!("{e}");
                false
            }
        }
    }

    pub fn kill(&mut self) {
        self.backend_mut().kill()
    }
}

/// Lay out a wrapper script.
pub(crate) fn wrapper(
    job: &Job,
    directives: &[String],
    pre: &str,
    command: &str,
    post: &str,
) -> String {
    let mut lines = vec!["#!/usr/bin/env bash".to_string()];
    if !directives.is_empty() {
        lines.extend(directives.iter().cloned());
        lines.push(String::new());
    }

    lines.push(format!(
        r#"trap "status=\$?; echo \$status >{}; exit \$status" {TRAP_SIGNALS}"#,
        quote(job.rc_file().as_str())
    ));
    lines.push(pre.to_string());
    lines.push(String::new());
    lines.push(command.to_string());
    lines.push(String::new());
    lines.push(post.to_string());
    lines.join("\n")
}

/// Reject scheduler options that can't be written as a directive, and
/// blank program names.
pub(crate) fn check_config(
    kind: &str,
    options: &BTreeMap<String, serde_json::Value>,
    programs: &[&str],
) -> Result<(), RunnerError> {
    if programs.iter().any(|program| program.trim().is_empty()) {
        return Err(RunnerError::Configuration(format!("{kind}: empty program name")));
    }

    for (key, value) in options {
        if value.is_object() || value.is_array() {
            return Err(RunnerError::Configuration(format!(
                "{kind}: option '{key}' must be a string, number or boolean, got {value}"
            )));
        }
    }

    Ok(())
}

/// Render a scheduler option value. `None` means the option is left out.
pub(crate) fn option_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null | serde_json::Value::Bool(false) => None,
        serde_json::Value::Bool(true) => Some(String::new()),
        serde_json::Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::job::JobInput;
    use crate::process::OutputDecl;
    use crate::render::Verbatim;
    use crate::Proc;

    /// A job of a process running `script` on `runner`, laid out in a fresh
    /// temporary directory.
    pub(crate) fn job_with(runner: RunnerConfig, script: &str, index: usize) -> (tempfile::TempDir, Job) {
        let tmp = tempfile::tempdir().unwrap();
        let wd = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        let proc = Proc::builder("pRun")
            .workdir(&wd)
            .script(script)
            .output(OutputDecl::file("out", "a.txt"))
            .output(OutputDecl::dir("plots", "b.dir"))
            .output(OutputDecl::var("label", "c"))
            .runner(runner)
            .finish();
        let mut jobs = proc.expand(vec![JobInput::new(); index + 1], &Verbatim).unwrap();
        let job = jobs.swap_remove(index);
        job.reset().unwrap();
        (tmp, job)
    }

    /// Write an executable shell script standing in for a cluster tool.
    pub(crate) fn mock(dir: &std::path::Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_wrapper_layout() {
        let (_tmp, job) = job_with(RunnerConfig::default(), "true", 0);
        let text = wrapper(&job, &["# a".into()], "pre", "cmd", "post");
        let expected = format!(
            "#!/usr/bin/env bash\n# a\n\n\
             trap \"status=\\$?; echo \\$status >'{}'; exit \\$status\" 1 2 3 6 7 8 9 10 11 12 15 16 EXIT\n\
             pre\n\ncmd\n\npost",
            job.rc_file()
        );
        assert_eq!(text, expected);
    }

    #[test]
    fn test_config_from_json() {
        let config = RunnerConfig::from_json(r#"{"runner": "sge", "options": {"sge.q": "long"}}"#).unwrap();
        assert_eq!(config.kind(), "sge");
        assert_eq!(config.poll_interval(), Duration::from_secs(5));

        let config = RunnerConfig::from_json(r#"{"runner": "local", "poll_ms": 10}"#).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_millis(10));

        let config = RunnerConfig::from_json(
            r#"{"runner": "ssh", "cluster": {"servers": ["s1", "s2"]}}"#,
        )
        .unwrap();
        assert_eq!(config.kind(), "ssh");
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_check_config() {
        use serde_json::json;

        let mut options = BTreeMap::new();
        options.insert("q".to_string(), json!("long"));
        options.insert("notify".to_string(), json!(true));
        assert!(check_config("sge", &options, &["qsub"]).is_ok());

        assert!(matches!(
            check_config("sge", &options, &["qsub", " "]),
            Err(RunnerError::Configuration(_))
        ));

        options.insert("l".to_string(), json!({"mem": "4G"}));
        match check_config("sge", &options, &["qsub"]) {
            Err(RunnerError::Configuration(message)) => assert!(message.contains("'l'")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_option_value() {
        use serde_json::json;
        assert_eq!(option_value(&json!(true)).as_deref(), Some(""));
        assert_eq!(option_value(&json!(false)), None);
        assert_eq!(option_value(&json!("4G")).as_deref(), Some("4G"));
        assert_eq!(option_value(&json!(8)).as_deref(), Some("8"));
    }
}
