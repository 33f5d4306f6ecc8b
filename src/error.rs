use nix::errno::Errno;
use nix::unistd::Pid;
use std::io;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while launching or running the stages of a job.
///
/// None of these terminate the shell: the affected stage or command is
/// abandoned and the error is reported on stderr. Variants raised inside a
/// forked process hold only shared or inline data, so building them there
/// does not allocate.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to create pipe: {0}")]
    Pipe(#[source] Errno),

    #[error("failed to create process for stage {stage}: {source}")]
    Fork { stage: usize, source: Errno },

    /// A stage is flagged to use a pipe the planner never allocated.
    #[error("stage {stage} expects pipe {pipe}, which does not exist")]
    MissingPipe { stage: usize, pipe: usize },

    #[error("failed to duplicate descriptor {fd} onto {target}: {source}")]
    Dup {
        fd: RawFd,
        target: RawFd,
        source: Errno,
    },

    #[error("{}: {source}", .path.display())]
    Redirect { path: Arc<Path>, source: Errno },

    #[error("{program}: {source}")]
    Exec { program: Arc<str>, source: Errno },

    #[error("cd: {dir}: {source}")]
    ChangeDir { dir: String, source: io::Error },

    #[error("cannot set environment variable {key:?}")]
    Env { key: String },

    #[error("kill: no such job [{0}]")]
    UnknownJob(usize),

    #[error("kill: invalid signal {0}")]
    InvalidSignal(i32),

    #[error("kill: failed to signal {pid}: {source}")]
    Kill { pid: Pid, source: Errno },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ExecError {
    /// Exit status a stage process uses when it fails with this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecError::Exec {
                source: Errno::ENOENT,
                ..
            } => 127,
            ExecError::Exec { .. } => 126,
            _ => 1,
        }
    }
}
