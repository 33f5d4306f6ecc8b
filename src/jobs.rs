use crate::error::ExecError;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::io::{self, Write};
use tracing::{debug, warn};

/// Represents the state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// At least one process is still live.
    Running,
    /// Every process has terminated; the job is about to be dropped.
    Complete,
}

/// The processes spawned from one command line.
#[derive(Debug)]
pub struct Job {
    pub jid: usize,
    /// First process of the job, used in notifications.
    pub pid: Pid,
    pub processes: VecDeque<Pid>,
    pub cmdline: String,
}

impl Job {
    pub fn state(&self) -> JobState {
        if self.processes.is_empty() {
            JobState::Complete
        } else {
            JobState::Running
        }
    }

    /// Drops every process that has terminated, without blocking.
    fn reap(&mut self) {
        let jid = self.jid;
        self.processes
            .retain(|&pid| match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, 0)) => false,
                Ok(WaitStatus::Exited(_, code)) => {
                    debug!(jid, %pid, code, "background process exited with failure");
                    false
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    debug!(jid, %pid, ?signal, "background process killed by signal");
                    false
                }
                Ok(_) | Err(Errno::EINTR) => true,
                // Already reaped elsewhere: nothing left to track.
                Err(Errno::ECHILD) => false,
                Err(e) => {
                    warn!(jid, %pid, error = %e, "cannot poll background process");
                    false
                }
            });
    }
}

/// The live background jobs, oldest first.
#[derive(Debug)]
pub struct JobList {
    jobs: VecDeque<Job>,
    next_jid: usize,
}

impl Default for JobList {
    fn default() -> Self {
        JobList::new()
    }
}

impl JobList {
    /// Creates a new, empty job list.
    pub fn new() -> Self {
        JobList {
            jobs: VecDeque::new(),
            next_jid: 1,
        }
    }

    /// Registers the processes of a background job under a fresh job id.
    ///
    /// Ids are never reused within a session. Returns `None` without
    /// allocating an id when there is no process to track.
    pub fn add_job(&mut self, processes: VecDeque<Pid>, cmdline: String) -> Option<&Job> {
        let pid = *processes.front()?;
        let jid = self.next_jid;
        self.next_jid += 1;
        self.jobs.push_back(Job {
            jid,
            pid,
            processes,
            cmdline,
        });
        debug!(jid, %pid, "registered background job");
        self.jobs.back()
    }

    /// Returns a reference to the job with the given job ID.
    pub fn get_job_by_jid(&self, jid: usize) -> Option<&Job> {
        self.jobs.iter().find(|job| job.jid == jid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Polls every background process and retires jobs that have finished,
    /// writing a completion line for each. Never blocks.
    pub fn check_jobs(&mut self, out: &mut impl Write) -> io::Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let mut finished = Vec::new();
        let mut live = VecDeque::with_capacity(self.jobs.len());
        for mut job in self.jobs.drain(..) {
            job.reap();
            match job.state() {
                JobState::Running => live.push_back(job),
                JobState::Complete => finished.push(job),
            }
        }
        self.jobs = live;

        for job in finished {
            debug!(jid = job.jid, "background job complete");
            print_job_bg_complete(out, job.jid, job.pid, &job.cmdline)?;
        }
        Ok(())
    }

    /// Sends `signal` to every process of job `jid`.
    pub fn kill_job(&self, jid: usize, signal: Signal) -> Result<(), ExecError> {
        let job = self.get_job_by_jid(jid).ok_or(ExecError::UnknownJob(jid))?;
        for &pid in &job.processes {
            match kill(pid, signal) {
                // Exited but not yet polled.
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(source) => return Err(ExecError::Kill { pid, source }),
            }
        }
        debug!(jid, ?signal, "signalled job");
        Ok(())
    }

    /// Prints the list of jobs.
    pub fn list_jobs(&self, out: &mut impl Write) -> io::Result<()> {
        for job in self.iter() {
            print_job(out, job.jid, job.pid, &job.cmdline)?;
        }
        Ok(())
    }
}

/// Blocks until every process of a foreground job has exited, draining the
/// collection as it goes.
pub fn wait_fg(processes: &mut VecDeque<Pid>) {
    while let Some(pid) = processes.pop_back() {
        loop {
            match waitpid(pid, None) {
                Err(Errno::EINTR) => continue,
                Ok(status) => {
                    debug!(%pid, ?status, "foreground process finished");
                    break;
                }
                Err(e) => {
                    debug!(%pid, error = %e, "cannot wait for foreground process");
                    break;
                }
            }
        }
    }
}

/// Prints the job id, the representative process id and the command line.
pub fn print_job(out: &mut impl Write, jid: usize, pid: Pid, cmdline: &str) -> io::Result<()> {
    writeln!(out, "[{}]\t{}\t{}", jid, pid, cmdline)?;
    out.flush()
}

pub fn print_job_bg_start(
    out: &mut impl Write,
    jid: usize,
    pid: Pid,
    cmdline: &str,
) -> io::Result<()> {
    print_job(out, jid, pid, cmdline)
}

pub fn print_job_bg_complete(
    out: &mut impl Write,
    jid: usize,
    pid: Pid,
    cmdline: &str,
) -> io::Result<()> {
    write!(out, "Completed:\t")?;
    print_job(out, jid, pid, cmdline)
}
