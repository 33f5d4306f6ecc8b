use crate::exec::{Executor, Flow};
use crate::parser::{parse_command_line, ParseError};
use crate::utils::report;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Global prompt string.
pub static PROMPT: &str = "quash> ";

const HISTORY_FILE: &str = ".quash_history";

/// Where command lines come from.
enum LineSource {
    /// Interactive editing with history.
    Editor(DefaultEditor),
    /// Plain stdin, no prompt; used when driving the shell from scripts.
    Stdin(io::StdinLock<'static>),
}

impl LineSource {
    fn open(emit_prompt: bool) -> Self {
        if emit_prompt {
            match DefaultEditor::new() {
                Ok(mut editor) => {
                    if let Some(path) = history_path() {
                        let _ = editor.load_history(&path);
                    }
                    return LineSource::Editor(editor);
                }
                Err(e) => warn!(error = %e, "line editor unavailable, reading stdin"),
            }
        }
        LineSource::Stdin(io::stdin().lock())
    }

    /// Returns the next line, or `None` at end of input.
    fn read_line(&mut self) -> Option<String> {
        match self {
            LineSource::Editor(editor) => loop {
                match editor.readline(PROMPT) {
                    Ok(line) => {
                        if !line.trim().is_empty() {
                            let _ = editor.add_history_entry(line.as_str());
                        }
                        return Some(line);
                    }
                    // Ctrl-C discards the current line.
                    Err(ReadlineError::Interrupted) => continue,
                    Err(ReadlineError::Eof) => return None,
                    Err(e) => {
                        eprintln!("Error reading input: {}", e);
                        return None;
                    }
                }
            },
            LineSource::Stdin(stdin) => {
                let mut line = String::new();
                match stdin.read_line(&mut line) {
                    Ok(0) => None, // End-of-file (Ctrl-D)
                    Ok(_) => Some(line),
                    Err(e) => {
                        eprintln!("Error reading input: {}", e);
                        None
                    }
                }
            }
        }
    }

    fn save_history(&mut self) {
        if let (LineSource::Editor(editor), Some(path)) = (self, history_path()) {
            if let Err(e) = editor.save_history(&path) {
                debug!(error = %e, "could not save history");
            }
        }
    }
}

fn history_path() -> Option<PathBuf> {
    dirs_next::home_dir().map(|home| home.join(HISTORY_FILE))
}

/// Runs the main shell loop: reads a line (with a prompt when `emit_prompt`
/// is set), parses it and runs it, until end of input or `exit`.
pub fn run_shell(emit_prompt: bool) {
    let mut executor = Executor::stdout();
    let mut source = LineSource::open(emit_prompt);

    while let Some(cmdline) = source.read_line() {
        let cmdline = cmdline.trim();
        debug!(cmdline, "received command");
        match parse_command_line(cmdline) {
            Ok(holders) => {
                if executor.run_script(&holders, cmdline) == Flow::Exit {
                    break;
                }
            }
            Err(ParseError::Empty) => executor.check_jobs(),
            Err(e) => {
                report(&e);
                executor.check_jobs();
            }
        }
    }

    if !executor.jobs().is_empty() {
        debug!(
            remaining = executor.jobs().len(),
            "leaving background jobs running"
        );
    }
    source.save_history();
    let _ = io::stdout().flush();
}
