use crate::builtins::{prepare_child, run_child, run_parent};
use crate::command::{CommandHolder, CommandType};
use crate::error::ExecError;
use crate::jobs::{print_job_bg_start, wait_fg, JobList};
use crate::pipeline::PipelineContext;
use crate::spawn::{spawn, Wiring};
use crate::utils::report;
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::io::{self, Write};
use tracing::debug;

/// What the main loop should do after a line has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The line was a lone `exit`.
    Exit,
}

/// Runs parsed command lines and owns the background job list.
///
/// Job start and completion notices go to `out`.
pub struct Executor<W: Write> {
    jobs: JobList,
    out: W,
}

impl Executor<io::Stdout> {
    pub fn stdout() -> Self {
        Executor::new(io::stdout())
    }
}

impl<W: Write> Executor<W> {
    pub fn new(out: W) -> Self {
        Executor {
            jobs: JobList::new(),
            out,
        }
    }

    pub fn jobs(&self) -> &JobList {
        &self.jobs
    }

    #[cfg(test)]
    pub fn output(&self) -> &W {
        &self.out
    }

    /// Retires finished background jobs. Safe to call at any time; never blocks.
    pub fn check_jobs(&mut self) {
        if let Err(e) = self.jobs.check_jobs(&mut self.out) {
            report(&e);
        }
    }

    /// Executes one EOC-terminated command line.
    ///
    /// Foreground jobs have fully exited when this returns; background jobs are
    /// registered under a new job id and announced on `out`.
    pub fn run_script(&mut self, holders: &[CommandHolder], cmdline: &str) -> Flow {
        self.check_jobs();

        if is_exit_request(holders) {
            return Flow::Exit;
        }

        let mut ctx = match PipelineContext::plan(holders) {
            Ok(ctx) => ctx,
            Err(e) => {
                report(&e);
                return Flow::Continue;
            }
        };

        // Anything still buffered would otherwise be duplicated into every child.
        let _ = self.out.flush();
        let _ = io::stdout().flush();

        let mut processes = VecDeque::with_capacity(ctx.stage_count);
        for holder in &holders[..ctx.stage_count] {
            if let Err(e) = self.create_process(holder, &ctx, &mut processes) {
                report(&e);
            }
            ctx.advance();
        }
        ctx.release();

        let background = holders[..ctx.stage_count]
            .iter()
            .any(CommandHolder::is_background);
        if background {
            if let Some(job) = self.jobs.add_job(processes, cmdline.to_string()) {
                if let Err(e) = print_job_bg_start(&mut self.out, job.jid, job.pid, &job.cmdline) {
                    report(&e);
                }
            }
        } else {
            wait_fg(&mut processes);
        }
        Flow::Continue
    }

    /// Creates the process for the current stage, records its pid, then runs
    /// the shell-side half of the command.
    fn create_process(
        &self,
        holder: &CommandHolder,
        ctx: &PipelineContext,
        processes: &mut VecDeque<Pid>,
    ) -> Result<(), ExecError> {
        let wiring = Wiring::for_stage(holder, ctx)?;
        let task = prepare_child(&holder.cmd, &self.jobs);
        let pid = spawn(&wiring, ctx.stage(), || run_child(&task))?;
        debug!(stage = ctx.stage(), %pid, kind = ?holder.command_type(), "launched stage");
        processes.push_back(pid);
        run_parent(&holder.cmd, &self.jobs)
    }
}

/// A line consisting of only `exit` asks the shell to stop.
fn is_exit_request(holders: &[CommandHolder]) -> bool {
    matches!(
        holders,
        [first, second, ..]
            if first.command_type() == CommandType::Exit
                && second.command_type() == CommandType::Eoc
    )
}
