//! Signature cache deciding whether a job has to run again.
//!
//! After a successful attempt the job's [`Signature`] is written to
//! `job.cache`. Before the next run the signature is computed again and
//! compared field by field; the job is skipped only when nothing changed and
//! every declared output is still there.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::time::UNIX_EPOCH;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::error::CacheError;
use crate::job::Job;
use crate::process::OutputKind;

/// Identity of a file at signing time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSig {
    pub path: Utf8PathBuf,
    pub mtime_ns: u64,
    pub size: u64,
}

impl FileSig {
    pub fn of(path: &Utf8Path) -> Result<Self, CacheError> {
        let meta = fs::metadata(path).map_err(|e| CacheError::Stat(path.to_owned(), e))?;
        let mtime_ns = meta
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|since| since.as_nanos() as u64)
            .unwrap_or(0);

        Ok(Self {
            path: path.to_owned(),
            mtime_ns,
            size: meta.len(),
        })
    }
}

impl fmt::Display for FileSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (mtime {}ns, {} bytes)", self.path, self.mtime_ns, self.size)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// blake3 of the rendered job script, stored as hex.
    pub script: Hash32,
    pub input_vars: BTreeMap<String, String>,
    pub input_files: BTreeMap<String, FileSig>,
    pub input_file_lists: BTreeMap<String, Vec<FileSig>>,
    pub output_vars: BTreeMap<String, String>,
    pub output_files: BTreeMap<String, FileSig>,
    pub output_dirs: BTreeMap<String, FileSig>,
}

/// Which part of a signature differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigField {
    Script,
    InputVar,
    InputFile,
    InputFileList,
    OutputVar,
    OutputFile,
    OutputDir,
}

impl fmt::Display for SigField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SigField::Script => "script",
            SigField::InputVar => "input var",
            SigField::InputFile => "input file",
            SigField::InputFileList => "input file list",
            SigField::OutputVar => "output var",
            SigField::OutputFile => "output file",
            SigField::OutputDir => "output dir",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureChange {
    pub field: SigField,
    pub key: String,
    pub previous: Option<String>,
    pub current: Option<String>,
}

impl fmt::Display for SignatureChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let none = "<none>".to_string();
        write!(f, "{}", self.field)?;
        if !self.key.is_empty() {
            write!(f, " '{}'", self.key)?;
        }
        write!(
            f,
            ": {} -> {}",
            self.previous.as_ref().unwrap_or(&none),
            self.current.as_ref().unwrap_or(&none)
        )
    }
}

fn diff_maps<T: PartialEq>(
    field: SigField,
    previous: &BTreeMap<String, T>,
    current: &BTreeMap<String, T>,
    show: impl Fn(&T) -> String,
    changes: &mut Vec<SignatureChange>,
) {
    let keys: BTreeSet<&String> = previous.keys().chain(current.keys()).collect();
    for key in keys {
        let (before, after) = (previous.get(key), current.get(key));
        if before != after {
            changes.push(SignatureChange {
                field,
                key: key.clone(),
                previous: before.map(&show),
                current: after.map(&show),
            });
        }
    }
}

fn show_list(list: &Vec<FileSig>) -> String {
    list.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Signature {
    /// Sign a job in its current state on disk.
    pub fn compute(job: &Job) -> Result<Self, CacheError> {
        let script_path = job.script();
        let script =
            Hash32::hash_file(&script_path).map_err(|e| CacheError::Stat(script_path, e))?;

        let input = job.input();
        let mut sig = Signature {
            script,
            input_vars: input.vars.clone(),
            ..Default::default()
        };

        for (key, path) in &input.files {
            sig.input_files.insert(key.clone(), FileSig::of(path)?);
        }
        for (key, paths) in &input.file_lists {
            let list = paths
                .iter()
                .map(|path| FileSig::of(path))
                .collect::<Result<_, _>>()?;
            sig.input_file_lists.insert(key.clone(), list);
        }

        for output in job.outputs() {
            let name = output.name.clone();
            match output.kind {
                OutputKind::Var => {
                    sig.output_vars.insert(name, output.value.clone());
                }
                OutputKind::File => {
                    sig.output_files
                        .insert(name, FileSig::of(Utf8Path::new(&output.value))?);
                }
                OutputKind::Dir => {
                    sig.output_dirs
                        .insert(name, FileSig::of(Utf8Path::new(&output.value))?);
                }
            }
        }

        Ok(sig)
    }

    /// Every field where `current` differs from `self`.
    pub fn diff(&self, current: &Signature) -> Vec<SignatureChange> {
        let mut changes = Vec::new();

        if self.script != current.script {
            changes.push(SignatureChange {
                field: SigField::Script,
                key: String::new(),
                previous: Some(self.script.to_string()),
                current: Some(current.script.to_string()),
            });
        }

        let text = |s: &String| s.clone();
        let file = |s: &FileSig| s.to_string();
        diff_maps(SigField::InputVar, &self.input_vars, &current.input_vars, text, &mut changes);
        diff_maps(SigField::InputFile, &self.input_files, &current.input_files, file, &mut changes);
        diff_maps(
            SigField::InputFileList,
            &self.input_file_lists,
            &current.input_file_lists,
            show_list,
            &mut changes,
        );
        diff_maps(SigField::OutputVar, &self.output_vars, &current.output_vars, text, &mut changes);
        diff_maps(SigField::OutputFile, &self.output_files, &current.output_files, file, &mut changes);
        diff_maps(SigField::OutputDir, &self.output_dirs, &current.output_dirs, file, &mut changes);

        changes
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReason {
    Disabled,
    NoPrevious,
    Unreadable,
    MissingOutput(Vec<Utf8PathBuf>),
    Changed(Vec<SignatureChange>),
}

impl fmt::Display for RunReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunReason::Disabled => f.write_str("cache disabled"),
            RunReason::NoPrevious => f.write_str("no previous signature"),
            RunReason::Unreadable => f.write_str("previous signature unreadable"),
            RunReason::MissingOutput(paths) => write!(f, "{} output(s) missing", paths.len()),
            RunReason::Changed(changes) => match changes.as_slice() {
                [first] => write!(f, "{first}"),
                [first, rest @ ..] => write!(f, "{first} (and {} more)", rest.len()),
                [] => f.write_str("signature changed"),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheVerdict {
    Skip,
    Run(RunReason),
}

#[derive(Debug, Clone, Copy)]
pub struct SignatureCache {
    enabled: bool,
}

impl SignatureCache {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn check(&self, job: &Job) -> Result<CacheVerdict, CacheError> {
        if !self.enabled {
            return Ok(CacheVerdict::Run(RunReason::Disabled));
        }

        let text = match fs::read_to_string(job.cache_file()) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CacheVerdict::Run(RunReason::NoPrevious));
            }
            Err(e) => return Err(e.into()),
        };

        let Ok(previous) = serde_json::from_str::<Signature>(&text) else {
            return Ok(CacheVerdict::Run(RunReason::Unreadable));
        };

        let missing = job.missing_outputs();
        if !missing.is_empty() {
            return Ok(CacheVerdict::Run(RunReason::MissingOutput(missing)));
        }

        let changes = previous.diff(&Signature::compute(job)?);
        if changes.is_empty() {
            Ok(CacheVerdict::Skip)
        } else {
            Ok(CacheVerdict::Run(RunReason::Changed(changes)))
        }
    }

    /// Store the signature of a job that just succeeded.
    pub fn record(&self, job: &Job) -> Result<(), CacheError> {
        if !self.enabled {
            return Ok(());
        }

        let sig = Signature::compute(job)?;
        fs::write(job.cache_file(), serde_json::to_string_pretty(&sig)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::*;
    use crate::job::JobInput;
    use crate::process::OutputDecl;
    use crate::render::Verbatim;
    use crate::Proc;

    fn setup() -> (tempfile::TempDir, Utf8PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        (tmp, path)
    }

    fn changed_fields(verdict: CacheVerdict) -> Vec<(SigField, String)> {
        match verdict {
            CacheVerdict::Run(RunReason::Changed(changes)) => {
                changes.into_iter().map(|c| (c.field, c.key)).collect()
            }
            other => panic!("expected a changed signature, got {other:?}"),
        }
    }

    #[test]
    fn test_skip_when_unchanged() {
        let (_tmp, wd) = setup();
        let infile = wd.join("in.txt");
        fs::write(&infile, "data").unwrap();

        let proc = Proc::builder("pSig").workdir(&wd).script("true").finish();
        let jobs = proc
            .expand(vec![JobInput::new().file("infile", &infile).var("n", "1")], &Verbatim)
            .unwrap();
        let cache = SignatureCache::new(true);

        assert_eq!(cache.check(&jobs[0]).unwrap(), CacheVerdict::Run(RunReason::NoPrevious));
        cache.record(&jobs[0]).unwrap();
        assert_eq!(cache.check(&jobs[0]).unwrap(), CacheVerdict::Skip);

        let sig = Signature::compute(&jobs[0]).unwrap();
        assert!(sig.diff(&sig).is_empty());
    }

    #[test]
    fn test_input_mtime_change() {
        let (_tmp, wd) = setup();
        let infile = wd.join("in.txt");
        fs::write(&infile, "data").unwrap();

        let proc = Proc::builder("pSig").workdir(&wd).script("true").finish();
        let jobs = proc
            .expand(vec![JobInput::new().file("infile", &infile)], &Verbatim)
            .unwrap();
        let cache = SignatureCache::new(true);
        cache.record(&jobs[0]).unwrap();

        let later = SystemTime::now() + Duration::from_secs(60);
        fs::File::options()
            .write(true)
            .open(&infile)
            .unwrap()
            .set_modified(later)
            .unwrap();

        let fields = changed_fields(cache.check(&jobs[0]).unwrap());
        assert_eq!(fields, [(SigField::InputFile, "infile".to_string())]);
    }

    #[test]
    fn test_script_change() {
        let (_tmp, wd) = setup();
        let proc = Proc::builder("pSig").workdir(&wd).script("true").finish();
        let jobs = proc.expand(vec![JobInput::new()], &Verbatim).unwrap();
        let cache = SignatureCache::new(true);
        cache.record(&jobs[0]).unwrap();

        fs::write(jobs[0].script(), "#!/usr/bin/env bash\nfalse\n").unwrap();
        let fields = changed_fields(cache.check(&jobs[0]).unwrap());
        assert_eq!(fields, [(SigField::Script, String::new())]);
    }

    #[test]
    fn test_output_var_change() {
        let (_tmp, wd) = setup();
        let first = Proc::builder("pSig")
            .workdir(&wd)
            .output(OutputDecl::var("label", "a"))
            .finish();
        let jobs = first.expand(vec![JobInput::new()], &Verbatim).unwrap();
        let cache = SignatureCache::new(true);
        cache.record(&jobs[0]).unwrap();

        // Outputs don't take part in the suffix, so the job directory is shared.
        let second = Proc::builder("pSig")
            .workdir(&wd)
            .output(OutputDecl::var("label", "b"))
            .finish();
        let jobs = second.expand(vec![JobInput::new()], &Verbatim).unwrap();

        let fields = changed_fields(cache.check(&jobs[0]).unwrap());
        assert_eq!(fields, [(SigField::OutputVar, "label".to_string())]);
    }

    #[test]
    fn test_missing_output_and_disabled() {
        let (_tmp, wd) = setup();
        let proc = Proc::builder("pSig")
            .workdir(&wd)
            .output(OutputDecl::file("out", "out.txt"))
            .finish();
        let jobs = proc.expand(vec![JobInput::new()], &Verbatim).unwrap();
        let job = &jobs[0];

        fs::write(job.outdir().join("out.txt"), "x").unwrap();
        let cache = SignatureCache::new(true);
        cache.record(job).unwrap();
        assert_eq!(cache.check(job).unwrap(), CacheVerdict::Skip);

        fs::remove_file(job.outdir().join("out.txt")).unwrap();
        assert!(matches!(
            cache.check(job).unwrap(),
            CacheVerdict::Run(RunReason::MissingOutput(_))
        ));

        let disabled = SignatureCache::new(false);
        assert_eq!(disabled.check(job).unwrap(), CacheVerdict::Run(RunReason::Disabled));
    }

    #[test]
    fn test_script_hash_stored_as_hex() {
        let (_tmp, wd) = setup();
        let proc = Proc::builder("pSig").workdir(&wd).script("true").finish();
        let jobs = proc.expand(vec![JobInput::new()], &Verbatim).unwrap();
        let cache = SignatureCache::new(true);
        cache.record(&jobs[0]).unwrap();

        let text = fs::read_to_string(jobs[0].cache_file()).unwrap();
        let stored: serde_json::Value = serde_json::from_str(&text).unwrap();
        let hex = stored["script"].as_str().unwrap();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(Signature::compute(&jobs[0]).unwrap().script.to_string(), hex);

        // a corrupted digest makes the whole signature unreadable
        let broken = text.replace(hex, "not-a-digest");
        fs::write(jobs[0].cache_file(), broken).unwrap();
        assert_eq!(cache.check(&jobs[0]).unwrap(), CacheVerdict::Run(RunReason::Unreadable));
    }

    #[test]
    fn test_unreadable() {
        let (_tmp, wd) = setup();
        let proc = Proc::builder("pSig").workdir(&wd).finish();
        let jobs = proc.expand(vec![JobInput::new()], &Verbatim).unwrap();
        fs::write(jobs[0].cache_file(), "not json").unwrap();

        let verdict = SignatureCache::new(true).check(&jobs[0]).unwrap();
        assert_eq!(verdict, CacheVerdict::Run(RunReason::Unreadable));
    }
}
