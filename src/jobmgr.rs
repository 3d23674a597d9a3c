//! Bounded-concurrency execution of the jobs of one process.
//!
//! The coordinator admits jobs in index order, consulting the signature
//! cache first, and keeps at most `forks` of them in flight. Each admitted
//! job is driven on its own thread of a dedicated rayon pool: submit, poll at
//! the backend's interval, judge the outcome, retry per the process policy.
//! Workers report back over a channel, the coordinator owns all bookkeeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Sender, channel};
use std::thread;
use std::time::{Duration, Instant};

use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cache::{CacheVerdict, SignatureCache};
use crate::error::{Failure, JobmgrError};
use crate::job::Job;
use crate::process::ErrorHow;
use crate::runner::Runner;
use crate::utils::{STYLE_BATCH, STYLE_JOB, as_overhead, tail};
use crate::Proc;

/// Lines of `job.stderr` shown when a job fails.
const STDERR_TAIL: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Submitting,
    Running,
    Done,
    Failed,
    Killed,
    Cached,
}

#[derive(Debug)]
pub struct JobReport {
    pub index: usize,
    pub state: JobState,
    pub attempts: u32,
    /// Why the last attempt failed. Moved into [`JobmgrError::Halted`] for
    /// the job that halted the batch.
    pub failure: Option<Failure>,
    pub duration: Duration,
}

impl JobReport {
    fn pending(index: usize) -> Self {
        Self {
            index,
            state: JobState::Pending,
            attempts: 0,
            failure: None,
            duration: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
pub struct Outcome {
    pub reports: Vec<JobReport>,
    /// Most jobs seen running at the same time.
    pub peak_running: usize,
}

impl Outcome {
    pub fn count(&self, state: JobState) -> usize {
        self.reports.iter().filter(|r| r.state == state).count()
    }

    pub fn pending(&self) -> usize {
        self.count(JobState::Pending)
    }

    pub fn failed(&self) -> impl Iterator<Item = &JobReport> {
        self.reports.iter().filter(|r| r.state == JobState::Failed)
    }

    /// Every job either ran successfully or was cached.
    pub fn is_success(&self) -> bool {
        self.reports
            .iter()
            .all(|r| matches!(r.state, JobState::Done | JobState::Cached))
    }
}

/// Cancels a running batch from another thread.
#[derive(Debug, Clone, Default)]
pub struct KillSwitch(Arc<AtomicBool>);

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kill(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_killed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

enum Event {
    Submitting(usize),
    Running(usize),
    Finished {
        index: usize,
        state: JobState,
        attempts: u32,
        failure: Option<Failure>,
        started: Instant,
    },
}

/// What a worker needs besides the job itself.
struct Driver<'a> {
    name: &'a str,
    error: ErrorHow,
    cache: SignatureCache,
    poll: Duration,
    halt: &'a AtomicBool,
    kill: &'a KillSwitch,
}

enum AttemptEnd {
    Killed,
    Failed(Failure),
}

impl From<Failure> for AttemptEnd {
    fn from(value: Failure) -> Self {
        AttemptEnd::Failed(value)
    }
}

impl Driver<'_> {
    fn stopping(&self) -> bool {
        self.halt.load(Ordering::SeqCst) || self.kill.is_killed()
    }

    /// Run a job until it succeeds, runs out of retries or gets killed.
    fn drive(&self, index: usize, job: &Job, tx: &Sender<Event>) -> (JobState, u32, Option<Failure>) {
        let retries = self.error.retries();
        let mut attempts = 0;

        loop {
            if self.stopping() {
                return (JobState::Killed, attempts, None);
            }

            attempts += 1;
            let _ = tx.send(Event::Submitting(index));

            match self.attempt(index, job, tx) {
                Ok(()) => {
                    if let Err(e) = self.cache.record(job) {
                        tracing::warn!("{}: job #{index}: {e}", self.name);
                    }
                    return (JobState::Done, attempts, None);
                }
                Err(AttemptEnd::Killed) => return (JobState::Killed, attempts, None),
                Err(AttemptEnd::Failed(failure)) => {
                    if attempts <= retries && !self.stopping() {
                        tracing::warn!(
                            "{}: job #{index} failed, retrying ({}/{}): {failure}",
                            self.name,
                            attempts,
                            retries
                        );
                        continue;
                    }
                    return (JobState::Failed, attempts, Some(failure));
                }
            }
        }
    }

    fn attempt(&self, index: usize, job: &Job, tx: &Sender<Event>) -> Result<(), AttemptEnd> {
        job.reset().map_err(Failure::from)?;

        let mut runner = Runner::bind(job).map_err(Failure::from)?;
        runner.prepare().map_err(Failure::from)?;
        let submission = runner.submit().map_err(Failure::from)?;
        tracing::debug!(
            "{}: job #{index} submitted as {}: {}",
            self.name,
            submission.pid,
            submission.cmd
        );
        let _ = tx.send(Event::Running(index));

        while runner.is_running() {
            if self.stopping() {
                runner.kill();
                return Err(AttemptEnd::Killed);
            }
            thread::sleep(self.poll);
        }

        job.outcome()?;
        Ok(())
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown payload")
    }
}

/// Runs the jobs of one process.
pub struct Jobmgr {
    name: String,
    forks: usize,
    error: ErrorHow,
    cache: SignatureCache,
    poll: Duration,
    kill: KillSwitch,
}

impl Jobmgr {
    /// A manager using the concurrency, failure policy, cache flag and poll
    /// interval declared on `proc`.
    pub fn new(proc: &Proc) -> Self {
        Self {
            name: proc.name(),
            forks: proc.forks(),
            error: proc.error(),
            cache: SignatureCache::new(proc.cache()),
            poll: proc.runner().poll_interval(),
            kill: KillSwitch::new(),
        }
    }

    pub fn forks(mut self, forks: usize) -> Self {
        self.forks = forks.max(1);
        self
    }

    pub fn error(mut self, error: ErrorHow) -> Self {
        self.error = error;
        self
    }

    pub fn cache(mut self, enabled: bool) -> Self {
        self.cache = SignatureCache::new(enabled);
        self
    }

    pub fn poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Share a kill switch, e.g. one owned by the pipeline.
    pub fn with_kill_switch(mut self, kill: KillSwitch) -> Self {
        self.kill = kill;
        self
    }

    pub fn kill_switch(&self) -> KillSwitch {
        self.kill.clone()
    }

    pub fn run(&self, jobs: &[Job]) -> Result<Outcome, JobmgrError> {
        let total = jobs.len();
        let mut outcome = Outcome {
            reports: (0..total).map(JobReport::pending).collect(),
            peak_running: 0,
        };
        if total == 0 {
            return Ok(outcome);
        }

        let root_span = tracing::span!(Level::INFO, "jobs", process = self.name.as_str());
        root_span.pb_set_style(&STYLE_BATCH);
        root_span.pb_set_length(total as u64);
        root_span.pb_set_message(&self.name);
        let _enter = root_span.enter();
        let root_span = &root_span;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.forks + 1)
            .thread_name(|i| format!("nagare-job-{i}"))
            .build()?;

        let halt = AtomicBool::new(false);
        let driver = Driver {
            name: &self.name,
            error: self.error,
            cache: self.cache,
            poll: self.poll,
            halt: &halt,
            kill: &self.kill,
        };
        let start = Instant::now();

        let halted = pool.scope(|s| {
            let (tx, rx) = channel::<Event>();
            let mut next = 0;
            let mut in_flight = 0;
            let mut running = 0;
            let mut halted = None;

            loop {
                while in_flight < self.forks && next < total && halted.is_none() && !driver.stopping() {
                    let index = next;
                    let job = &jobs[index];
                    next += 1;

                    match self.cache.check(job) {
                        Ok(CacheVerdict::Skip) => {
                            tracing::info!("{}: job #{index} cached, skipped", self.name);
                            outcome.reports[index].state = JobState::Cached;
                            root_span.pb_inc(1);
                            continue;
                        }
                        Ok(CacheVerdict::Run(reason)) => {
                            tracing::debug!("{}: job #{index} will run: {reason}", self.name);
                        }
                        Err(e) => {
                            tracing::warn!("{}: job #{index}: {e}", self.name);
                        }
                    }

                    in_flight += 1;
                    let tx = tx.clone();
                    let driver = &driver;
                    s.spawn(move |_| {
                        let span = tracing::span!(parent: root_span, Level::INFO, "job", index);
                        span.pb_set_style(&STYLE_JOB);
                        span.pb_set_message(&format!("{} #{index}", driver.name));
                        let _enter = span.enter();

                        let started = Instant::now();
                        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            driver.drive(index, job, &tx)
                        }));
                        let (state, attempts, failure) = match result {
                            Ok(result) => result,
                            Err(panic) => (
                                JobState::Failed,
                                1,
                                Some(Failure::Panic(panic_message(panic))),
                            ),
                        };

                        let _ = tx.send(Event::Finished {
                            index,
                            state,
                            attempts,
                            failure,
                            started,
                        });
                    });
                }

                if in_flight == 0 {
                    break;
                }

                // A worker always sends `Finished`, and `tx` is alive here.
                let Ok(event) = rx.recv() else {
                    break;
                };

                match event {
                    Event::Submitting(index) => {
                        let report = &mut outcome.reports[index];
                        if report.state == JobState::Running {
                            running -= 1;
                        }
                        report.state = JobState::Submitting;
                    }
                    Event::Running(index) => {
                        outcome.reports[index].state = JobState::Running;
                        running += 1;
                        outcome.peak_running = outcome.peak_running.max(running);
                    }
                    Event::Finished {
                        index,
                        state,
                        attempts,
                        failure,
                        started,
                    } => {
                        in_flight -= 1;
                        root_span.pb_inc(1);

                        let report = &mut outcome.reports[index];
                        if report.state == JobState::Running {
                            running -= 1;
                        }
                        report.state = state;
                        report.attempts = attempts;
                        report.duration = started.elapsed();

                        match state {
                            JobState::Done => tracing::info!(
                                "{}: job #{index} done {}",
                                self.name,
                                as_overhead(started)
                            ),
                            JobState::Killed => {
                                tracing::warn!("{}: job #{index} killed", self.name)
                            }
                            _ => {}
                        }

                        if let Some(failure) = &failure {
                            let rc = failure
                                .rc()
                                .map_or_else(|| "-".to_string(), |rc| rc.to_string());
                            tracing::warn!(
                                "{}: job #{index} failed after {attempts} attempt(s), rc {rc}: {failure}\n{}",
                                self.name,
                                tail(&jobs[index].stderr_file(), STDERR_TAIL)
                            );

                            if self.error.halts() && halted.is_none() {
                                halt.store(true, Ordering::SeqCst);
                                halted = Some(index);
                            }
                        }
                        report.failure = failure;
                    }
                }
            }

            halted
        });

        root_span.pb_set_message(&format!("{} finished", self.name));
        tracing::info!(
            "{}: {} done, {} cached, {} failed {}",
            self.name,
            outcome.count(JobState::Done),
            outcome.count(JobState::Cached),
            outcome.count(JobState::Failed),
            as_overhead(start)
        );

        if let Some(index) = halted {
            let failure = outcome.reports[index]
                .failure
                .take()
                .unwrap_or(Failure::NoReturnCode);
            return Err(JobmgrError::Halted {
                index,
                failure,
                stderr: tail(&jobs[index].stderr_file(), STDERR_TAIL),
                outcome: Box::new(outcome),
            });
        }

        if self.kill.is_killed() {
            return Err(JobmgrError::Killed {
                outcome: Box::new(outcome),
            });
        }

        Ok(outcome)
    }
}
