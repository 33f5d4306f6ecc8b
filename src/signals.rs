use signal_hook::{consts::signal::*, iterator::Signals};
use std::io;
use std::thread;
use tracing::debug;

/// Installs signal handlers for the shell:
/// - SIGQUIT: prints a termination message and exits.
/// - SIGINT: (Ctrl-C) absorbed so the shell survives. Foreground stages share
///   the shell's process group, so the terminal still interrupts them, and
///   `exec` restores the default action in every external program.
pub fn install_signal_handlers() -> io::Result<()> {
    let mut signals = Signals::new([SIGQUIT, SIGINT])?;
    thread::spawn(move || {
        for signal in signals.forever() {
            match signal {
                SIGQUIT => {
                    println!("Terminating after receipt of SIGQUIT signal");
                    std::process::exit(0);
                }
                SIGINT => debug!("shell ignored SIGINT"),
                _ => unreachable!(),
            }
        }
    });
    Ok(())
}
