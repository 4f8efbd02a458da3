//! Pipeline execution: fork one child per stage, wire the pipes, put the
//! whole pipeline into its own process group, and hand the terminal to a
//! foreground pipeline until the reaper reports it done.
//!
//! Builtins that must affect the session (`cd`, `exit`) run in the shell
//! process, but only as the sole stage of a foreground pipeline; everywhere
//! else builtins run inside the forked stage like any external command.

use std::ffi::CString;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use anyhow::Context;
use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{SigHandler, Signal, signal};
use nix::unistd::{ForkResult, Pid, execvp, fork, pipe, setpgid, tcsetpgrp};

use crate::builtin;
use crate::jobs::{JobId, JobTable, StageIo, Task};
use crate::reaper::{self, ExitNotice};

/// What the control loop should do after running a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Keep reading input; carries the job's exit status.
    Continue(i32),
    /// `exit` was run: leave the read loop.
    Terminate,
}

/// Session-lifetime handles the executor needs besides the job table.
pub struct ExecContext<'a> {
    /// Tells the reaper about every spawned stage.
    pub track: &'a Sender<Pid>,
    /// Exit notices coming back from the reaper.
    pub exits: &'a Receiver<ExitNotice>,
    /// The shell's own process group, restored to the terminal foreground
    /// after every foreground pipeline.
    pub shell_pgid: Pid,
    /// Whether stdin is a terminal; controls foreground handoff.
    pub interactive: bool,
}

/// Runs the job `id` in `table` to completion (foreground) or to launch
/// (background).
pub fn execute(
    table: &mut JobTable,
    id: JobId,
    ctx: &ExecContext<'_>,
) -> anyhow::Result<ExecOutcome> {
    // The `jobs` listing must be rendered before forking: the child's copy
    // of the table is dead memory, it can only print a snapshot.
    let listing = if wants_jobs(table, id) {
        table.listing_sweep(id)
    } else {
        String::new()
    };

    let Some(job) = table.get_mut(id) else {
        return Ok(ExecOutcome::Continue(0));
    };

    if job
        .tasks
        .first()
        .is_none_or(|t| t.argv.first().is_none_or(|arg| arg.is_empty()))
    {
        println!("error: missing program");
        job.done = true;
        return Ok(ExecOutcome::Continue(1));
    }

    // Session-affecting builtins, only when they have the shell to
    // themselves.
    if job.tasks.len() == 1 && !job.background {
        match job.tasks[0].argv[0].as_str() {
            "cd" => {
                let target = job.tasks[0].argv.get(1).map(String::as_str);
                let status = builtin::change_dir(target, &mut io::stdout());
                job.done = true;
                return Ok(ExecOutcome::Continue(status));
            }
            "exit" => {
                println!("exit");
                job.done = true;
                return Ok(ExecOutcome::Terminate);
            }
            _ => {}
        }
    }

    if !repair_stages(&mut job.tasks) {
        // the open error was already reported by the parser; nothing left
        // to run degenerates to a no-op
        job.done = true;
        return Ok(ExecOutcome::Continue(0));
    }

    let stage_count = job.tasks.len();
    let mut pipes: Vec<(OwnedFd, OwnedFd)> = Vec::with_capacity(stage_count - 1);
    for _ in 1..stage_count {
        match pipe() {
            Ok(pair) => pipes.push(pair),
            Err(err) => {
                eprintln!("minnow: pipe: {err}");
                job.done = true;
                return Ok(ExecOutcome::Continue(1));
            }
        }
    }

    for index in 0..stage_count {
        match unsafe { fork() } {
            Ok(ForkResult::Child) => child_exec(index, &job.tasks, &pipes, job.pgid, &listing),
            Ok(ForkResult::Parent { child }) => {
                if index == 0 {
                    job.pgid = Some(child);
                }
                let pgid = job.pgid.unwrap_or(child);
                // Both sides call setpgid; whichever runs first wins, and
                // the group must exist before the terminal handoff below.
                let _ = setpgid(child, pgid);
                if index == 0 && !job.background && ctx.interactive {
                    let _ = tcsetpgrp(io::stdin(), child);
                }
                job.tasks[index].pid = Some(child);
                job.live_children += 1;
                debug!("job [{}] stage {index} spawned as pid {child}", job.id);
                ctx.track.send(child).context("reaper channel closed")?;
            }
            Err(err) => {
                warn!("fork failed for job [{}] stage {index}: {err}", job.id);
                eprintln!("minnow: fork: {err}");
                break;
            }
        }
    }

    // Close every parent-side descriptor: the pipe pairs, and the
    // redirection files the stages duplicated from.
    drop(pipes);
    for task in &mut job.tasks {
        task.stdin = StageIo::Inherit;
        task.stdout = StageIo::Inherit;
    }

    if job.live_children == 0 {
        job.done = true;
        return Ok(ExecOutcome::Continue(1));
    }

    if job.background {
        println!("[{}] {}", job.id, job.cmdline);
        return Ok(ExecOutcome::Continue(0));
    }

    // Foreground: block on exit notices until every stage of this job is
    // reaped. Notices for other jobs are applied along the way.
    loop {
        match table.get(id) {
            None => break,
            Some(job) if job.done => break,
            Some(_) => {}
        }
        let notice = ctx.exits.recv().context("reaper stopped")?;
        reaper::apply_exit(table, notice);
    }
    if ctx.interactive {
        let _ = tcsetpgrp(io::stdin(), ctx.shell_pgid);
    }
    Ok(ExecOutcome::Continue(0))
}

fn wants_jobs(table: &JobTable, id: JobId) -> bool {
    table
        .get(id)
        .map(|job| {
            job.tasks
                .iter()
                .any(|t| t.argv.first().map(String::as_str) == Some("jobs"))
        })
        .unwrap_or(false)
}

/// Drops stages whose redirection target failed to open. A broken target
/// can only sit on the first stage's input or the last stage's output, so
/// repairing means trimming an end of the pipeline. Returns `false` when
/// nothing runnable is left.
fn repair_stages(tasks: &mut Vec<Task>) -> bool {
    if tasks.first().is_some_and(|t| t.stdin.is_broken()) {
        if tasks.len() == 1 {
            return false;
        }
        tasks.remove(0);
    }
    if tasks.last().is_some_and(|t| t.stdout.is_broken()) {
        if tasks.len() == 1 {
            return false;
        }
        tasks.pop();
    }
    true
}

/// The forked stage: never returns. Only `libc::_exit` leaves this
/// function, so no destructor of the shell's state ever runs in the child.
fn child_exec(
    index: usize,
    tasks: &[Task],
    pipes: &[(OwnedFd, OwnedFd)],
    pgid: Option<Pid>,
    listing: &str,
) -> ! {
    unsafe {
        let _ = signal(Signal::SIGINT, SigHandler::SigDfl);
        let _ = signal(Signal::SIGTTOU, SigHandler::SigDfl);
        let _ = signal(Signal::SIGCHLD, SigHandler::SigDfl);
    }
    let _ = setpgid(Pid::from_raw(0), pgid.unwrap_or(Pid::from_raw(0)));

    let task = &tasks[index];
    let stdin_fd = if index > 0 {
        Some(pipes[index - 1].0.as_raw_fd())
    } else if let StageIo::File(file) = &task.stdin {
        Some(file.as_raw_fd())
    } else {
        None
    };
    let stdout_fd = if index + 1 < tasks.len() {
        Some(pipes[index].1.as_raw_fd())
    } else if let StageIo::File(file) = &task.stdout {
        Some(file.as_raw_fd())
    } else {
        None
    };
    if let Some(fd) = stdin_fd {
        if unsafe { libc::dup2(fd, libc::STDIN_FILENO) } < 0 {
            unsafe { libc::_exit(126) }
        }
    }
    if let Some(fd) = stdout_fd {
        if unsafe { libc::dup2(fd, libc::STDOUT_FILENO) } < 0 {
            unsafe { libc::_exit(126) }
        }
    }
    // Unused pipe ends must go, or downstream readers never see EOF.
    for (read_end, write_end) in pipes {
        unsafe {
            libc::close(read_end.as_raw_fd());
            libc::close(write_end.as_raw_fd());
        }
    }

    let mut out = FdWriter(libc::STDOUT_FILENO);
    if let Some(code) = builtin::run_in_child(&task.argv, listing, &mut out) {
        unsafe { libc::_exit(code) }
    }

    let mut err_out = FdWriter(libc::STDERR_FILENO);
    let argv: Vec<CString> = match task
        .argv
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect()
    {
        Ok(argv) => argv,
        Err(_) => {
            let _ = writeln!(err_out, "{}: invalid argument", task.argv[0]);
            unsafe { libc::_exit(126) }
        }
    };
    let err = match execvp(&argv[0], &argv) {
        Ok(never) => match never {},
        Err(err) => err,
    };
    match err {
        Errno::ENOENT => {
            let _ = writeln!(err_out, "{}: command not found", task.argv[0]);
            unsafe { libc::_exit(127) }
        }
        Errno::EACCES => {
            let _ = writeln!(err_out, "{}: Permission denied", task.argv[0]);
            unsafe { libc::_exit(126) }
        }
        other => {
            let _ = writeln!(err_out, "{}: {other}", task.argv[0]);
            unsafe { libc::_exit(126) }
        }
    }
}

/// Writes straight through a raw descriptor. Used only after `fork`, where
/// the `std` stream handles would fight the parent over buffered state.
struct FdWriter(RawFd);

impl Write for FdWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = unsafe { libc::write(self.0, buf.as_ptr().cast(), buf.len()) };
        if written < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(written as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
