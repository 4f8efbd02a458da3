//! Asynchronous child-termination handling.
//!
//! A dedicated thread owns `waitpid`: the executor tells it about every
//! spawned stage over the `track` channel, and it reports each reaped child
//! back as an [`ExitNotice`]. The control thread applies notices to the job
//! table itself — while blocked on a foreground pipeline and when draining
//! the channel at each prompt cycle — so the table never needs a lock and
//! no signal handler runs at all.

use std::io;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, warn};
use nix::errno::Errno;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::jobs::JobTable;

/// One reaped stage process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitNotice {
    pub pid: Pid,
    /// Exit code, or 128 plus the signal number for a signaled child.
    pub status: i32,
}

/// Starts the reaper thread. It blocks on the `track` channel while no
/// children are outstanding and in `waitpid` otherwise, and exits when the
/// `track` channel disconnects (shell shutdown).
pub fn spawn(track: Receiver<Pid>, notices: Sender<ExitNotice>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("reaper".to_string())
        .spawn(move || {
            debug!("reaper started");
            let mut outstanding = 0usize;
            loop {
                while track.try_recv().is_ok() {
                    outstanding += 1;
                }
                if outstanding == 0 {
                    match track.recv() {
                        Ok(_) => {
                            outstanding = 1;
                            continue;
                        }
                        Err(_) => break,
                    }
                }
                match waitpid(Pid::from_raw(-1), None) {
                    Ok(status) => {
                        if let Some(notice) = notice_from(status) {
                            outstanding -= 1;
                            debug!("reaped pid {} (status {})", notice.pid, notice.status);
                            if notices.send(notice).is_err() {
                                break;
                            }
                        }
                    }
                    Err(Errno::EINTR) => continue,
                    Err(Errno::ECHILD) => {
                        // tracking drifted from reality; resynchronize
                        warn!("waitpid reported no children with {outstanding} outstanding");
                        outstanding = 0;
                    }
                    Err(err) => {
                        error!("waitpid failed: {err}");
                        break;
                    }
                }
            }
            debug!("reaper stopped");
        })
}

fn notice_from(status: WaitStatus) -> Option<ExitNotice> {
    match status {
        WaitStatus::Exited(pid, code) => Some(ExitNotice { pid, status: code }),
        WaitStatus::Signaled(pid, signal, _) => Some(ExitNotice {
            pid,
            status: 128 + signal as i32,
        }),
        _ => None,
    }
}

/// Applies one exit notice to the table: find the owning job by its stage
/// pids, decrement its outstanding-child count, and mark it done when the
/// count reaches zero.
pub fn apply_exit(table: &mut JobTable, notice: ExitNotice) {
    let Some(id) = table.find_owner(notice.pid) else {
        debug!("exit notice for unknown pid {}", notice.pid);
        return;
    };
    let Some(job) = table.get_mut(id) else {
        return;
    };
    job.live_children = job.live_children.saturating_sub(1);
    if job.live_children == 0 {
        job.done = true;
        debug!("job [{}] done: {}", job.id, job.cmdline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{Job, StageIo, Task};

    fn job_with_pids(cmdline: &str, pids: &[i32]) -> Job {
        let mut job = Job::new(cmdline);
        for pid in pids {
            let mut task = Task::new(
                vec!["x".to_string()],
                StageIo::Inherit,
                StageIo::Inherit,
            );
            task.pid = Some(Pid::from_raw(*pid));
            job.tasks.push(task);
            job.live_children += 1;
        }
        job
    }

    #[test]
    fn notices_decrement_until_done() {
        let mut table = JobTable::new();
        let id = table.add(job_with_pids("a | b", &[10, 11]));

        apply_exit(
            &mut table,
            ExitNotice {
                pid: Pid::from_raw(10),
                status: 0,
            },
        );
        assert!(!table.get(id).unwrap().done);

        apply_exit(
            &mut table,
            ExitNotice {
                pid: Pid::from_raw(11),
                status: 0,
            },
        );
        assert!(table.get(id).unwrap().done);
    }

    #[test]
    fn notices_land_on_the_owning_job() {
        let mut table = JobTable::new();
        let a = table.add(job_with_pids("a", &[20]));
        let b = table.add(job_with_pids("b", &[30]));

        apply_exit(
            &mut table,
            ExitNotice {
                pid: Pid::from_raw(30),
                status: 1,
            },
        );
        assert!(!table.get(a).unwrap().done);
        assert!(table.get(b).unwrap().done);

        // unknown pids are ignored
        apply_exit(
            &mut table,
            ExitNotice {
                pid: Pid::from_raw(40),
                status: 0,
            },
        );
        assert!(!table.get(a).unwrap().done);
    }
}
