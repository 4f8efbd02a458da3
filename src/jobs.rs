//! The job and task data model: one `Task` per pipeline stage, one `Job` per
//! command line, and the session-lifetime `JobTable`.
//!
//! The table is a plain id-keyed vector rather than a linked structure, so
//! removal is a `retain` and there are no neighbor pointers to dangle. It is
//! owned exclusively by the control thread; the reaper thread reports child
//! exits over a channel instead of touching it (see [`crate::reaper`]).

use std::fmt::Write as _;
use std::fs::File;

use log::debug;
use nix::unistd::Pid;

/// Identifier of a job within the table. Id 0 is reserved and never
/// assigned; live jobs get monotonically increasing ids starting at 1.
pub type JobId = u32;

/// Where a pipeline stage reads from or writes to.
#[derive(Debug)]
pub enum StageIo {
    /// The controlling terminal (or whatever the shell inherited).
    Inherit,
    /// A redirection target that opened successfully.
    File(File),
    /// A redirection target that failed to open. The stage carrying this
    /// marker is dropped by the executor before anything is spawned.
    Broken,
}

impl StageIo {
    pub fn is_broken(&self) -> bool {
        matches!(self, StageIo::Broken)
    }
}

/// One pipeline stage: a single external command or builtin invocation.
///
/// The stage's position in the pipeline is its index in the owning job's
/// `tasks` vector.
#[derive(Debug)]
pub struct Task {
    /// Command and arguments. An empty first argument denotes a missing
    /// program (see the parser's empty-quotes edge case).
    pub argv: Vec<String>,
    /// Set once the stage has been spawned.
    pub pid: Option<Pid>,
    pub stdin: StageIo,
    pub stdout: StageIo,
}

impl Task {
    pub fn new(argv: Vec<String>, stdin: StageIo, stdout: StageIo) -> Self {
        Self {
            argv,
            pid: None,
            stdin,
            stdout,
        }
    }
}

/// One pipeline as typed on a command line, tracked in the job table from
/// successful parse until the post-completion sweep removes it.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    /// Process group shared by all stages; set when the first stage spawns.
    pub pgid: Option<Pid>,
    /// The original command line, kept verbatim for reporting.
    pub cmdline: String,
    pub background: bool,
    /// Running vs. done. Done jobs are swept out at the next prompt cycle.
    pub done: bool,
    /// Stage processes spawned but not yet reaped.
    pub live_children: usize,
    pub tasks: Vec<Task>,
}

impl Job {
    pub fn new(cmdline: impl Into<String>) -> Self {
        Self {
            id: 0,
            pgid: None,
            cmdline: cmdline.into(),
            background: false,
            done: false,
            live_children: 0,
            tasks: Vec::new(),
        }
    }
}

/// Ordered collection of all known jobs, foreground and background.
#[derive(Debug, Default)]
pub struct JobTable {
    next_id: JobId,
    jobs: Vec<Job>,
}

impl JobTable {
    pub fn new() -> Self {
        // id 0 stays reserved
        Self {
            next_id: 1,
            jobs: Vec::new(),
        }
    }

    /// Appends a job at the table tail and assigns the next id.
    pub fn add(&mut self, mut job: Job) -> JobId {
        job.id = self.next_id;
        self.next_id += 1;
        debug!("job [{}] added: {}", job.id, job.cmdline);
        let id = job.id;
        self.jobs.push(job);
        id
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    /// Finds the job owning a stage process, by scanning stage pids.
    pub fn find_owner(&self, pid: Pid) -> Option<JobId> {
        self.jobs
            .iter()
            .find(|j| j.tasks.iter().any(|t| t.pid == Some(pid)))
            .map(|j| j.id)
    }

    /// Per-prompt sweep: removes done jobs, returning one `[<id>] done
    /// <cmdline>` notice per done background job. Foreground jobs are
    /// removed silently. A job removed here is gone, so each notice is
    /// produced exactly once.
    pub fn sweep(&mut self) -> Vec<String> {
        let mut notices = Vec::new();
        self.jobs.retain(|job| {
            if !job.done {
                return true;
            }
            if job.background {
                notices.push(format!("[{}] done {}", job.id, job.cmdline));
            }
            debug!("job [{}] removed: {}", job.id, job.cmdline);
            false
        });
        notices
    }

    /// `jobs` builtin snapshot: renders every job except `exclude` (the job
    /// being executed) as running or done, then removes the done ones so
    /// they are not reported a second time by [`JobTable::sweep`].
    pub fn listing_sweep(&mut self, exclude: JobId) -> String {
        let mut out = String::new();
        for job in &self.jobs {
            if job.id == exclude {
                continue;
            }
            let state = if job.done { "done" } else { "running" };
            let _ = writeln!(out, "[{}] {} {}", job.id, state, job.cmdline);
        }
        self.jobs.retain(|j| j.id == exclude || !j.done);
        out
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_pid(cmdline: &str, pid: i32) -> Job {
        let mut job = Job::new(cmdline);
        let mut task = Task::new(
            vec![cmdline.to_string()],
            StageIo::Inherit,
            StageIo::Inherit,
        );
        task.pid = Some(Pid::from_raw(pid));
        job.tasks.push(task);
        job
    }

    #[test]
    fn ids_are_monotonic_from_one() {
        let mut table = JobTable::new();
        assert_eq!(table.add(Job::new("a")), 1);
        assert_eq!(table.add(Job::new("b")), 2);
        let removed = table.get_mut(1).unwrap();
        removed.done = true;
        table.sweep();
        // ids are never reused
        assert_eq!(table.add(Job::new("c")), 3);
    }

    #[test]
    fn find_owner_scans_stage_pids() {
        let mut table = JobTable::new();
        let a = table.add(job_with_pid("sleep 1", 100));
        let b = table.add(job_with_pid("sleep 2", 200));
        assert_eq!(table.find_owner(Pid::from_raw(200)), Some(b));
        assert_eq!(table.find_owner(Pid::from_raw(100)), Some(a));
        assert_eq!(table.find_owner(Pid::from_raw(300)), None);
    }

    #[test]
    fn sweep_reports_done_background_jobs_once() {
        let mut table = JobTable::new();
        let id = table.add(Job::new("sleep 1 &"));
        {
            let job = table.get_mut(id).unwrap();
            job.background = true;
            job.done = true;
        }
        let notices = table.sweep();
        assert_eq!(notices, vec!["[1] done sleep 1 &".to_string()]);
        // the job is gone, so a second sweep reports nothing
        assert!(table.sweep().is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn sweep_removes_foreground_jobs_silently() {
        let mut table = JobTable::new();
        let id = table.add(Job::new("ls"));
        table.get_mut(id).unwrap().done = true;
        assert!(table.sweep().is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn listing_renders_running_and_done() {
        let mut table = JobTable::new();
        let bg = table.add(Job::new("sleep 10 &"));
        table.get_mut(bg).unwrap().background = true;
        let done = table.add(Job::new("cat f &"));
        {
            let job = table.get_mut(done).unwrap();
            job.background = true;
            job.done = true;
        }
        let me = table.add(Job::new("jobs"));

        let listing = table.listing_sweep(me);
        assert_eq!(listing, "[1] running sleep 10 &\n[2] done cat f &\n");
        // the done job was consumed by the listing
        assert!(table.sweep().is_empty());
        assert_eq!(table.len(), 2);
    }
}
