use nix::libc::{STDERR_FILENO, STDOUT_FILENO};
use nix::unistd::write;
use std::io;
use std::os::unix::io::RawFd;
use std::process;

pub fn print_usage() {
    println!("Usage: quash [-hvp]");
    println!("   -h   Print this help message");
    println!("   -v   Enable verbose mode (debug logging)");
    println!("   -p   Do not print a command prompt");
    process::exit(1);
}

/// Unbuffered writer over a raw descriptor.
///
/// Stage processes write through this instead of `std::io::stdout()`: it takes
/// no locks, so it is safe after `fork`, and it always targets whatever is on
/// the descriptor after pipe and redirect wiring.
#[derive(Debug, Clone, Copy)]
pub struct FdWriter(RawFd);

impl FdWriter {
    pub fn stdout() -> Self {
        FdWriter(STDOUT_FILENO)
    }

    pub fn stderr() -> Self {
        FdWriter(STDERR_FILENO)
    }
}

impl io::Write for FdWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match write(self.0, buf) {
                Err(nix::errno::Errno::EINTR) => continue,
                result => return result.map_err(io::Error::from),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reports a failure on stderr the way every part of the shell does.
pub fn report(err: &dyn std::fmt::Display) {
    use std::io::Write;
    let _ = writeln!(FdWriter::stderr(), "quash: {}", err);
}
