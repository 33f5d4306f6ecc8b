use crate::command::{CdCommand, Command, EchoCommand, ExportCommand, KillCommand};
use crate::error::ExecError;
use crate::jobs::JobList;
use crate::utils::{report, FdWriter};
use nix::errno::Errno;
use nix::libc::{self, c_char};
use nix::sys::signal::Signal;
use std::env;
use std::ffi::{CString, OsStr};
use std::io::Write;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Component, Path, PathBuf};
use std::ptr;
use std::sync::Arc;

/// What a stage process does once its descriptors are wired.
///
/// Built by the shell before `fork`; running it in the new process does not
/// allocate.
#[derive(Debug)]
pub enum ChildTask {
    /// Replace the process image.
    Exec(ExecArgs),
    /// Write prepared output to stdout.
    Write(Vec<u8>),
    /// Exit straight away with this status.
    Exit(i32),
}

/// An argument vector ready for `execvp(3)`.
#[derive(Debug)]
pub struct ExecArgs {
    program: Arc<str>,
    argv: Vec<CString>,
    /// Null-terminated pointers into `argv`.
    ptrs: Vec<*const c_char>,
}

impl ExecArgs {
    pub fn new(args: &[String]) -> Result<Self, ExecError> {
        let program: Arc<str> = Arc::from(args.first().map(String::as_str).unwrap_or_default());
        if args.is_empty() {
            return Err(ExecError::Exec {
                program,
                source: Errno::ENOENT,
            });
        }
        let argv = args
            .iter()
            .map(|arg| CString::new(arg.as_bytes()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ExecError::Exec {
                program: Arc::clone(&program),
                source: Errno::EINVAL,
            })?;
        let ptrs = argv
            .iter()
            .map(|arg| arg.as_ptr())
            .chain([ptr::null()])
            .collect();
        Ok(ExecArgs {
            program,
            argv,
            ptrs,
        })
    }

    /// Replaces the process image, searching `PATH` as a shell does. Only
    /// returns on failure.
    fn exec(&self) -> ExecError {
        // SAFETY: `ptrs` is null-terminated and every entry points into
        // `argv`, which outlives the call. nix's `execvp` would build this
        // array on the heap.
        unsafe { libc::execvp(self.argv[0].as_ptr(), self.ptrs.as_ptr()) };
        ExecError::Exec {
            program: Arc::clone(&self.program),
            source: Errno::last(),
        }
    }
}

/// Prepares the part of a command that belongs inside its stage process.
///
/// Only commands whose effect is visible on the standard streams do anything
/// there; the rest change shell state and run in [`run_parent`]. A command
/// that cannot be prepared is reported here and its process exits with the
/// matching status.
pub fn prepare_child(cmd: &Command, jobs: &JobList) -> ChildTask {
    let prepared = match cmd {
        Command::Generic(generic) => ExecArgs::new(&generic.args).map(ChildTask::Exec),
        Command::Echo(echo) => Ok(ChildTask::Write(echo_output(echo))),
        Command::Pwd => pwd_output().map(ChildTask::Write),
        Command::Jobs => jobs_output(jobs).map(ChildTask::Write),
        Command::Export(_) | Command::Cd(_) | Command::Kill(_) | Command::Exit | Command::Eoc => {
            Ok(ChildTask::Exit(0))
        }
    };
    prepared.unwrap_or_else(|e| {
        report(&e);
        ChildTask::Exit(e.exit_code())
    })
}

/// Runs a prepared task after pipes and redirections are wired. Returns the
/// exit status for the process.
pub fn run_child(task: &ChildTask) -> i32 {
    match task {
        ChildTask::Exec(args) => {
            let err = args.exec();
            report(&err);
            err.exit_code()
        }
        ChildTask::Write(bytes) => match FdWriter::stdout().write_all(bytes) {
            Ok(()) => 0,
            Err(e) => {
                let errno = Errno::from_i32(e.raw_os_error().unwrap_or(0));
                report(&format_args!("write error: {}", errno));
                1
            }
        },
        ChildTask::Exit(status) => *status,
    }
}

/// Runs the part of a command that must change the shell process itself.
pub fn run_parent(cmd: &Command, jobs: &JobList) -> Result<(), ExecError> {
    match cmd {
        Command::Export(export) => run_export(export),
        Command::Cd(cd) => run_cd(cd),
        Command::Kill(kill) => run_kill(kill, jobs),
        Command::Generic(_)
        | Command::Echo(_)
        | Command::Pwd
        | Command::Jobs
        | Command::Exit
        | Command::Eoc => Ok(()),
    }
}

fn echo_output(cmd: &EchoCommand) -> Vec<u8> {
    format!("{}\n", cmd.args.join(" ")).into_bytes()
}

fn pwd_output() -> Result<Vec<u8>, ExecError> {
    let mut out = env::current_dir()?.into_os_string().into_vec();
    out.push(b'\n');
    Ok(out)
}

fn jobs_output(jobs: &JobList) -> Result<Vec<u8>, ExecError> {
    let mut out = Vec::new();
    jobs.list_jobs(&mut out)?;
    Ok(out)
}

fn run_export(cmd: &ExportCommand) -> Result<(), ExecError> {
    set_env(&cmd.env_var, OsStr::new(&cmd.val))
}

/// Changes directory and records the move in `PWD` and `OLD_PWD`.
///
/// `PWD` keeps the directory as named, symlinks included. Nothing changes if
/// the directory is invalid or a variable cannot be set.
fn run_cd(cmd: &CdCommand) -> Result<(), ExecError> {
    let previous_cwd = env::current_dir()?;
    let previous_pwd = env::var_os("PWD");
    let old_pwd = previous_pwd
        .clone()
        .unwrap_or_else(|| previous_cwd.clone().into_os_string());
    let base = previous_pwd
        .as_deref()
        .map(Path::new)
        .filter(|pwd| pwd.is_absolute())
        .unwrap_or(previous_cwd.as_path());
    let pwd = logical_path(base, Path::new(&cmd.dir));

    env::set_current_dir(&cmd.dir).map_err(|source| ExecError::ChangeDir {
        dir: cmd.dir.clone(),
        source,
    })?;

    let updated = set_env("PWD", pwd.as_os_str()).and_then(|()| set_env("OLD_PWD", &old_pwd));
    if updated.is_err() {
        let _ = env::set_current_dir(&previous_cwd);
        match previous_pwd {
            Some(pwd) => env::set_var("PWD", pwd),
            None => env::remove_var("PWD"),
        }
    }
    updated
}

/// `dir` reached from `base`, with `.` and `..` folded lexically.
fn logical_path(base: &Path, dir: &Path) -> PathBuf {
    let mut path = PathBuf::new();
    for component in base.join(dir).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                path.pop();
            }
            other => path.push(other),
        }
    }
    path
}

fn run_kill(cmd: &KillCommand, jobs: &JobList) -> Result<(), ExecError> {
    let signal = Signal::try_from(cmd.sig).map_err(|_| ExecError::InvalidSignal(cmd.sig))?;
    jobs.kill_job(cmd.job_id, signal)
}

/// `std::env::set_var` panics on names or values the OS cannot hold; reject
/// them up front instead.
fn set_env(key: &str, value: &OsStr) -> Result<(), ExecError> {
    if key.is_empty() || key.contains(['=', '\0']) || value.as_bytes().contains(&0) {
        return Err(ExecError::Env {
            key: key.to_string(),
        });
    }
    env::set_var(key, value);
    Ok(())
}
