//! Jobs: one concrete execution of a process over one input element.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::Proc;
use crate::error::{Failure, RenderError};
use crate::process::OutputKind;
use crate::render::Render;

/// Inputs of one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInput {
    pub vars: BTreeMap<String, String>,
    pub files: BTreeMap<String, Utf8PathBuf>,
    pub file_lists: BTreeMap<String, Vec<Utf8PathBuf>>,
}

impl JobInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn file(mut self, key: impl Into<String>, path: impl Into<Utf8PathBuf>) -> Self {
        self.files.insert(key.into(), path.into());
        self
    }

    pub fn file_list(mut self, key: impl Into<String>, paths: Vec<Utf8PathBuf>) -> Self {
        self.file_lists.insert(key.into(), paths);
        self
    }

    /// One input per file matching `pattern`, sorted by path, the file stored
    /// under `key`.
    pub fn from_glob(key: &str, pattern: &str) -> Result<Vec<JobInput>, RenderError> {
        let mut paths = Vec::new();
        for entry in glob::glob(pattern)? {
            let path = entry.map_err(|e| e.into_error())?;
            if path.is_file() {
                paths.push(Utf8PathBuf::try_from(path)?);
            }
        }
        paths.sort();

        Ok(paths
            .into_iter()
            .map(|path| JobInput::new().file(key, path))
            .collect())
    }

    fn to_value(&self) -> Value {
        let mut map = Map::new();
        for (key, value) in &self.vars {
            map.insert(key.clone(), Value::from(value.as_str()));
        }
        for (key, path) in &self.files {
            map.insert(key.clone(), Value::from(path.as_str()));
        }
        for (key, paths) in &self.file_lists {
            let list = paths.iter().map(|p| Value::from(p.as_str())).collect();
            map.insert(key.clone(), Value::Array(list));
        }
        Value::Object(map)
    }
}

/// A rendered output of a job. For files and dirs `value` is the path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutput {
    pub name: String,
    pub kind: OutputKind,
    pub value: String,
}

impl JobOutput {
    pub fn path(&self) -> Option<&Utf8Path> {
        match self.kind {
            OutputKind::Var => None,
            OutputKind::File | OutputKind::Dir => Some(Utf8Path::new(&self.value)),
        }
    }
}

/// One unit of work with its own directory.
///
/// ```text
/// <proc workdir>/<index + 1>/
///     job.script  job.rc  job.pid  job.stdout  job.stderr  job.cache
///     job.script.<backend>
///     output/
/// ```
#[derive(Debug, Clone)]
pub struct Job {
    proc: Arc<Proc>,
    index: usize,
    dir: Utf8PathBuf,
    input: JobInput,
    outputs: Vec<JobOutput>,
}

impl Job {
    pub fn proc(&self) -> &Arc<Proc> {
        &self.proc
    }

    /// Zero-based index within the process.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn input(&self) -> &JobInput {
        &self.input
    }

    pub fn outputs(&self) -> &[JobOutput] {
        &self.outputs
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    pub fn outdir(&self) -> Utf8PathBuf {
        self.dir.join("output")
    }

    pub fn script(&self) -> Utf8PathBuf {
        self.dir.join("job.script")
    }

    pub fn rc_file(&self) -> Utf8PathBuf {
        self.dir.join("job.rc")
    }

    pub fn pid_file(&self) -> Utf8PathBuf {
        self.dir.join("job.pid")
    }

    pub fn stdout_file(&self) -> Utf8PathBuf {
        self.dir.join("job.stdout")
    }

    pub fn stderr_file(&self) -> Utf8PathBuf {
        self.dir.join("job.stderr")
    }

    pub fn cache_file(&self) -> Utf8PathBuf {
        self.dir.join("job.cache")
    }

    /// Name used for queue submissions: `<id>.<tag>.<suffix>.<index + 1>`.
    pub fn name(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.proc.id(),
            self.proc.tag(),
            self.proc.suffix(),
            self.index + 1
        )
    }

    /// Return code written by the wrapper, if any.
    pub fn rc(&self) -> Option<i32> {
        fs::read_to_string(self.rc_file())
            .ok()
            .and_then(|text| text.trim().parse().ok())
    }

    /// Pid or queue job id of the last submission.
    pub fn pid(&self) -> Option<String> {
        fs::read_to_string(self.pid_file())
            .ok()
            .map(|text| text.trim().to_string())
            .filter(|pid| !pid.is_empty())
    }

    pub(crate) fn set_pid(&self, pid: &str) -> std::io::Result<()> {
        fs::write(self.pid_file(), pid)
    }

    /// Clear leftovers of a previous attempt.
    pub fn reset(&self) -> std::io::Result<()> {
        for path in [self.rc_file(), self.pid_file(), self.cache_file()] {
            remove_file(&path)?;
        }

        fs::File::create(self.stdout_file())?;
        fs::File::create(self.stderr_file())?;

        let outdir = self.outdir();
        if outdir.exists() {
            fs::remove_dir_all(&outdir)?;
        }
        fs::create_dir_all(&outdir)?;
        Ok(())
    }

    /// Declared output files and dirs which do not exist.
    pub fn missing_outputs(&self) -> Vec<Utf8PathBuf> {
        self.outputs
            .iter()
            .filter(|output| match output.kind {
                OutputKind::Var => false,
                OutputKind::File => !Utf8Path::new(&output.value).exists(),
                OutputKind::Dir => !Utf8Path::new(&output.value).is_dir(),
            })
            .map(|output| Utf8PathBuf::from(&output.value))
            .collect()
    }

    /// Judge a finished attempt by its return code and outputs.
    pub fn outcome(&self) -> Result<(), Failure> {
        match self.rc() {
            None => Err(Failure::NoReturnCode),
            Some(0) => {
                let missing = self.missing_outputs();
                if missing.is_empty() {
                    Ok(())
                } else {
                    Err(Failure::MissingOutput(missing))
                }
            }
            Some(rc) => Err(Failure::ReturnCode(rc)),
        }
    }
}

fn remove_file(path: &Utf8Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl Proc {
    /// Create one job per input: render the script and outputs, and lay out
    /// the job directories.
    pub fn expand(
        self: &Arc<Self>,
        inputs: Vec<JobInput>,
        render: &dyn Render,
    ) -> Result<Vec<Job>, RenderError> {
        let workdir = self.workdir();
        fs::create_dir_all(&workdir)?;
        // Wrappers change directory, so job paths have to be absolute.
        let workdir = workdir.canonicalize_utf8()?;

        let mut jobs = Vec::with_capacity(inputs.len());
        for (index, input) in inputs.into_iter().enumerate() {
            let dir = workdir.join((index + 1).to_string());
            let outdir = dir.join("output");
            fs::create_dir_all(&outdir)?;

            let context = json!({
                "i": input.to_value(),
                "job": {"index": index, "dir": dir.as_str(), "outdir": outdir.as_str()},
                "proc": {"id": self.id(), "tag": self.tag(), "suffix": self.suffix()},
            });
            let template_err = |e| RenderError::Template(self.name(), index, e);

            let mut outputs = Vec::with_capacity(self.output().len());
            for decl in self.output() {
                let rendered = render
                    .render(&decl.template, &context)
                    .map_err(template_err)?;
                let value = match decl.kind {
                    OutputKind::Var => rendered,
                    OutputKind::File | OutputKind::Dir => outdir.join(rendered).into_string(),
                };
                outputs.push(JobOutput {
                    name: decl.name.clone(),
                    kind: decl.kind,
                    value,
                });
            }

            let mut script = render
                .render(self.script(), &context)
                .map_err(template_err)?;
            if !script.starts_with("#!") {
                script = format!("#!/usr/bin/env {}\n{}", self.lang(), script);
            }
            if !script.ends_with('\n') {
                script.push('\n');
            }

            let path = dir.join("job.script");
            fs::write(&path, script)?;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;

            jobs.push(Job {
                proc: self.clone(),
                index,
                dir,
                input,
                outputs,
            });
        }

        tracing::debug!("{}: expanded into {} job(s)", self.name(), jobs.len());
        Ok(jobs)
    }
}
