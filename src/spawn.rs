use crate::command::{CommandHolder, Flags};
use crate::error::ExecError;
use crate::pipeline::PipelineContext;
use crate::utils::report;
use nix::fcntl::{fcntl, open, FcntlArg, FdFlag, OFlag};
use nix::libc::{self, STDIN_FILENO, STDOUT_FILENO};
use nix::sys::stat::Mode;
use nix::unistd::{close, dup2, fork, ForkResult, Pid};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;

/// Where a redirected stdout goes and whether it keeps existing content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRedirect {
    pub path: Arc<Path>,
    pub append: bool,
}

/// Descriptor wiring a stage process applies before running its command.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Wiring {
    /// Pipe read end to place on stdin.
    pub stdin: Option<RawFd>,
    /// Pipe write end to place on stdout.
    pub stdout: Option<RawFd>,
    /// Every pipe descriptor the new process inherits; all are closed after dup2.
    pub inherited: Vec<RawFd>,
    pub redirect_in: Option<Arc<Path>>,
    pub redirect_out: Option<OutputRedirect>,
}

impl Wiring {
    /// Works out the wiring for the stage `ctx` is currently launching.
    pub fn for_stage(holder: &CommandHolder, ctx: &PipelineContext) -> Result<Self, ExecError> {
        let stage = ctx.stage();
        let flags = holder.flags;
        let mut wiring = Wiring {
            inherited: ctx.descriptors().to_vec(),
            ..Wiring::default()
        };

        if flags.contains(Flags::PIPE_IN) {
            let pipe = stage
                .checked_sub(1)
                .ok_or(ExecError::MissingPipe { stage, pipe: 0 })?;
            wiring.stdin = Some(
                ctx.read_end(pipe)
                    .ok_or(ExecError::MissingPipe { stage, pipe })?,
            );
        }
        if flags.contains(Flags::PIPE_OUT) {
            wiring.stdout = Some(
                ctx.write_end(stage)
                    .ok_or(ExecError::MissingPipe { stage, pipe: stage })?,
            );
        }

        if flags.contains(Flags::REDIRECT_IN) {
            wiring.redirect_in = holder.redirect_in.as_deref().map(Arc::from);
        }
        if flags.contains(Flags::REDIRECT_OUT) {
            wiring.redirect_out = holder.redirect_out.as_deref().map(|path| OutputRedirect {
                path: Arc::from(path),
                append: flags.contains(Flags::REDIRECT_APPEND),
            });
        }
        Ok(wiring)
    }

    /// Applies pipes first, then redirections, which win over pipes on the
    /// same descriptor. Runs only inside the new process.
    fn apply(&self) -> Result<(), ExecError> {
        if let Some(fd) = self.stdin {
            dup_onto(fd, STDIN_FILENO)?;
        }
        if let Some(fd) = self.stdout {
            dup_onto(fd, STDOUT_FILENO)?;
        }
        for &fd in &self.inherited {
            if fd != STDIN_FILENO && fd != STDOUT_FILENO {
                let _ = close(fd);
            }
        }

        if let Some(path) = &self.redirect_in {
            redirect(path, OFlag::O_RDONLY, STDIN_FILENO)?;
        }
        if let Some(out) = &self.redirect_out {
            let mode = if out.append {
                OFlag::O_APPEND
            } else {
                OFlag::O_TRUNC
            };
            redirect(
                &out.path,
                OFlag::O_WRONLY | OFlag::O_CREAT | mode,
                STDOUT_FILENO,
            )?;
        }
        Ok(())
    }
}

fn dup_onto(fd: RawFd, target: RawFd) -> Result<(), ExecError> {
    let result = if fd == target {
        // dup2 onto itself leaves close-on-exec set.
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty())).map(drop)
    } else {
        dup2(fd, target).map(drop)
    };
    result.map_err(|source| ExecError::Dup { fd, target, source })
}

fn redirect(path: &Arc<Path>, flags: OFlag, target: RawFd) -> Result<(), ExecError> {
    let fd = open(&**path, flags, Mode::from_bits_truncate(0o666)).map_err(|source| {
        ExecError::Redirect {
            path: Arc::clone(path),
            source,
        }
    })?;
    if fd != target {
        let duped = dup_onto(fd, target);
        let _ = close(fd);
        duped?;
    }
    Ok(())
}

/// Creates the process for one stage.
///
/// The new process applies `wiring`, runs `child` and exits with the status it
/// returns; it never returns from this call. The calling process only gets
/// the new pid back. `child` must not allocate: other threads may hold the
/// allocator lock at the moment of the fork.
pub fn spawn<F>(wiring: &Wiring, stage: usize, child: F) -> Result<Pid, ExecError>
where
    F: FnOnce() -> i32,
{
    // SAFETY: the child only rewires descriptors, runs the stage and calls
    // `_exit`, never unwinding back into the caller.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child: pid }) => Ok(pid),
        Ok(ForkResult::Child) => {
            let status = match wiring.apply() {
                Ok(()) => child(),
                Err(e) => {
                    report(&e);
                    e.exit_code()
                }
            };
            // SAFETY: ends the new process without running destructors or
            // atexit handlers registered by the shell.
            unsafe { libc::_exit(status) }
        }
        Err(source) => Err(ExecError::Fork { stage, source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use nix::sys::wait::{waitpid, WaitStatus};
    use serial_test::serial;
    use std::fs;

    fn three_stages() -> Vec<CommandHolder> {
        vec![
            CommandHolder::new(Command::Pwd).with_flags(Flags::PIPE_OUT),
            CommandHolder::new(Command::Pwd).with_flags(Flags::PIPE_IN | Flags::PIPE_OUT),
            CommandHolder::new(Command::Pwd).with_flags(Flags::PIPE_IN),
            CommandHolder::eoc(),
        ]
    }

    #[test]
    fn first_stage_writes_to_first_pipe() {
        let holders = three_stages();
        let ctx = PipelineContext::plan(&holders).unwrap();
        let wiring = Wiring::for_stage(&holders[0], &ctx).unwrap();
        assert_eq!(wiring.stdin, None);
        assert_eq!(wiring.stdout, ctx.write_end(0));
        assert_eq!(wiring.inherited, ctx.descriptors());
    }

    #[test]
    fn interior_stage_reads_previous_and_writes_current() {
        let holders = three_stages();
        let mut ctx = PipelineContext::plan(&holders).unwrap();
        ctx.advance();
        let wiring = Wiring::for_stage(&holders[1], &ctx).unwrap();
        assert_eq!(wiring.stdin, ctx.read_end(0));
        assert_eq!(wiring.stdout, ctx.write_end(1));
    }

    #[test]
    fn last_stage_reads_last_pipe() {
        let holders = three_stages();
        let mut ctx = PipelineContext::plan(&holders).unwrap();
        ctx.advance();
        ctx.advance();
        let wiring = Wiring::for_stage(&holders[2], &ctx).unwrap();
        assert_eq!(wiring.stdin, ctx.read_end(1));
        assert_eq!(wiring.stdout, None);
    }

    #[test]
    fn pipe_flag_without_pipe_is_rejected() {
        let holders = vec![
            CommandHolder::new(Command::Pwd).with_flags(Flags::PIPE_IN),
            CommandHolder::eoc(),
        ];
        let ctx = PipelineContext::plan(&holders).unwrap();
        let err = Wiring::for_stage(&holders[0], &ctx).unwrap_err();
        assert!(matches!(err, ExecError::MissingPipe { stage: 0, .. }));
    }

    #[test]
    fn redirects_follow_flags() {
        let holder = CommandHolder::new(Command::Pwd)
            .with_redirect_in("in.txt")
            .with_redirect_out("out.txt", true);
        let ctx = PipelineContext::plan(&[holder.clone(), CommandHolder::eoc()]).unwrap();
        let wiring = Wiring::for_stage(&holder, &ctx).unwrap();
        assert_eq!(wiring.redirect_in, Some(Arc::from(Path::new("in.txt"))));
        assert_eq!(
            wiring.redirect_out,
            Some(OutputRedirect {
                path: Arc::from(Path::new("out.txt")),
                append: true
            })
        );
    }

    #[test]
    #[serial]
    fn child_status_reaches_parent() {
        let pid = spawn(&Wiring::default(), 0, || 3).unwrap();
        assert_eq!(waitpid(pid, None).unwrap(), WaitStatus::Exited(pid, 3));
    }

    #[test]
    #[serial]
    fn failed_redirect_skips_the_stage() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let wiring = Wiring {
            redirect_in: Some(Arc::from(dir.path().join("missing"))),
            ..Wiring::default()
        };
        let marker_in_child = marker.clone();
        let pid = spawn(&wiring, 0, move || {
            let _ = fs::write(&marker_in_child, b"x");
            0
        })
        .unwrap();
        assert_eq!(waitpid(pid, None).unwrap(), WaitStatus::Exited(pid, 1));
        assert!(!marker.exists());
    }

    #[test]
    #[serial]
    #[cfg(target_os = "linux")]
    fn pipe_end_already_on_stdin_stays_open_across_exec() {
        let pid = spawn(&Wiring::default(), 0, || {
            let _ = close(STDIN_FILENO);
            let (read, _write) = match nix::unistd::pipe2(OFlag::O_CLOEXEC) {
                Ok(ends) => ends,
                Err(_) => return 2,
            };
            if read != STDIN_FILENO {
                return 3;
            }
            if dup_onto(read, STDIN_FILENO).is_err() {
                return 4;
            }
            match fcntl(STDIN_FILENO, FcntlArg::F_GETFD) {
                Ok(bits) if !FdFlag::from_bits_truncate(bits).contains(FdFlag::FD_CLOEXEC) => 0,
                _ => 1,
            }
        })
        .unwrap();
        assert_eq!(waitpid(pid, None).unwrap(), WaitStatus::Exited(pid, 0));
    }
}
