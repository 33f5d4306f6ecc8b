use crate::command::{CommandHolder, CommandType};
use crate::error::ExecError;
use nix::unistd::close;
use std::os::unix::io::RawFd;
use tracing::{debug, warn};

/// Descriptor table and stage bookkeeping for launching one job.
///
/// Pipe `i` occupies slots `2i` (read end) and `2i + 1` (write end) of the
/// flat descriptor table. Every descriptor is closed by `release`, or on drop
/// if the context is abandoned early.
#[derive(Debug)]
pub struct PipelineContext {
    pub stage_count: usize,
    pub pipe_count: usize,
    fds: Vec<RawFd>,
    stage: usize,
}

impl PipelineContext {
    /// Counts the stages before the first EOC and allocates the pipes joining them.
    pub fn plan(holders: &[CommandHolder]) -> Result<Self, ExecError> {
        let stage_count = count_stages(holders);
        let pipe_count = stage_count.saturating_sub(1);
        let mut ctx = PipelineContext {
            stage_count,
            pipe_count,
            fds: Vec::with_capacity(pipe_count * 2),
            stage: 0,
        };
        for _ in 0..pipe_count {
            // On error `ctx` drops here and closes the pipes already made.
            let (read, write) = open_pipe()?;
            ctx.fds.push(read);
            ctx.fds.push(write);
        }
        debug!(stage_count, pipe_count, "planned pipeline");
        Ok(ctx)
    }

    /// Index of the stage currently being launched.
    pub fn stage(&self) -> usize {
        self.stage
    }

    pub fn advance(&mut self) {
        self.stage += 1;
    }

    pub fn read_end(&self, pipe: usize) -> Option<RawFd> {
        self.fds.get(pipe * 2).copied()
    }

    pub fn write_end(&self, pipe: usize) -> Option<RawFd> {
        self.fds.get(pipe * 2 + 1).copied()
    }

    /// All descriptors still open in the controlling process.
    pub fn descriptors(&self) -> &[RawFd] {
        &self.fds
    }

    /// Closes every pipe descriptor held by the shell and frees the table.
    pub fn release(&mut self) {
        for fd in self.fds.drain(..) {
            if let Err(e) = close(fd) {
                warn!(fd, error = %e, "failed to close pipe descriptor");
            }
        }
        self.fds.shrink_to_fit();
    }
}

impl Drop for PipelineContext {
    fn drop(&mut self) {
        self.release();
    }
}

/// Number of stages before the EOC sentinel (or the end of the slice).
pub fn count_stages(holders: &[CommandHolder]) -> usize {
    holders
        .iter()
        .take_while(|holder| holder.command_type() != CommandType::Eoc)
        .count()
}

#[cfg(any(
    target_os = "android",
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "linux",
    target_os = "netbsd",
    target_os = "openbsd"
))]
fn open_pipe() -> Result<(RawFd, RawFd), ExecError> {
    use nix::fcntl::OFlag;
    // Close-on-exec: only the ends a stage dup2s onto its stdio survive exec.
    nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(ExecError::Pipe)
}

#[cfg(not(any(
    target_os = "android",
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "linux",
    target_os = "netbsd",
    target_os = "openbsd"
)))]
fn open_pipe() -> Result<(RawFd, RawFd), ExecError> {
    nix::unistd::pipe().map_err(ExecError::Pipe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use nix::errno::Errno;
    use nix::fcntl::{fcntl, FcntlArg};

    fn stages(n: usize) -> Vec<CommandHolder> {
        let mut holders: Vec<CommandHolder> = (0..n)
            .map(|_| CommandHolder::new(Command::Pwd))
            .collect();
        holders.push(CommandHolder::eoc());
        holders
    }

    fn is_open(fd: RawFd) -> bool {
        fcntl(fd, FcntlArg::F_GETFD) != Err(Errno::EBADF)
    }

    #[test]
    fn single_stage_allocates_no_pipes() {
        let ctx = PipelineContext::plan(&stages(1)).unwrap();
        assert_eq!(ctx.stage_count, 1);
        assert_eq!(ctx.pipe_count, 0);
        assert!(ctx.descriptors().is_empty());
        assert_eq!(ctx.read_end(0), None);
        assert_eq!(ctx.write_end(0), None);
    }

    #[test]
    fn empty_sequence_has_no_stages() {
        let ctx = PipelineContext::plan(&[CommandHolder::eoc()]).unwrap();
        assert_eq!(ctx.stage_count, 0);
        assert_eq!(ctx.pipe_count, 0);
    }

    #[test]
    fn stages_after_eoc_are_ignored() {
        let mut holders = stages(2);
        holders.push(CommandHolder::new(Command::Jobs));
        assert_eq!(count_stages(&holders), 2);
    }

    #[test]
    fn pipes_are_laid_out_in_pairs() {
        let mut ctx = PipelineContext::plan(&stages(3)).unwrap();
        assert_eq!(ctx.pipe_count, 2);
        assert_eq!(ctx.descriptors().len(), 4);
        assert_eq!(ctx.read_end(1), Some(ctx.descriptors()[2]));
        assert_eq!(ctx.write_end(1), Some(ctx.descriptors()[3]));
        assert_eq!(ctx.read_end(2), None);

        assert!(ctx.descriptors().iter().all(|&fd| is_open(fd)));
        ctx.release();
        assert!(ctx.descriptors().is_empty());
        // A second release is a no-op.
        ctx.release();
    }

    #[test]
    fn stage_index_advances() {
        let mut ctx = PipelineContext::plan(&stages(2)).unwrap();
        assert_eq!(ctx.stage(), 0);
        ctx.advance();
        assert_eq!(ctx.stage(), 1);
    }
}
