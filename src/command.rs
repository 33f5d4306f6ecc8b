use std::path::{Path, PathBuf};

/// The kind of a command, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    Generic,
    Echo,
    Export,
    Cd,
    Kill,
    Pwd,
    Jobs,
    Exit,
    /// End of the stage sequence. Never executed.
    Eoc,
}

/// An external program and its argument vector; `args[0]` is the program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericCommand {
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoCommand {
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportCommand {
    pub env_var: String,
    pub val: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdCommand {
    pub dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillCommand {
    pub sig: i32,
    pub job_id: usize,
}

/// One parsed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Generic(GenericCommand),
    Echo(EchoCommand),
    Export(ExportCommand),
    Cd(CdCommand),
    Kill(KillCommand),
    Pwd,
    Jobs,
    Exit,
    Eoc,
}

impl Command {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Generic(_) => CommandType::Generic,
            Command::Echo(_) => CommandType::Echo,
            Command::Export(_) => CommandType::Export,
            Command::Cd(_) => CommandType::Cd,
            Command::Kill(_) => CommandType::Kill,
            Command::Pwd => CommandType::Pwd,
            Command::Jobs => CommandType::Jobs,
            Command::Exit => CommandType::Exit,
            Command::Eoc => CommandType::Eoc,
        }
    }
}

bitflags::bitflags! {
    /// Pipeline and redirection flags attached to a stage.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Flags: u8 {
        const PIPE_IN = 1 << 0;
        const PIPE_OUT = 1 << 1;
        const REDIRECT_IN = 1 << 2;
        const REDIRECT_OUT = 1 << 3;
        /// Only meaningful together with `REDIRECT_OUT`.
        const REDIRECT_APPEND = 1 << 4;
        const BACKGROUND = 1 << 5;
    }
}

/// A command together with how its standard streams are connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandHolder {
    pub cmd: Command,
    pub flags: Flags,
    pub redirect_in: Option<PathBuf>,
    pub redirect_out: Option<PathBuf>,
}

impl CommandHolder {
    pub fn new(cmd: Command) -> Self {
        CommandHolder {
            cmd,
            flags: Flags::empty(),
            redirect_in: None,
            redirect_out: None,
        }
    }

    /// The sentinel that terminates every stage sequence.
    pub fn eoc() -> Self {
        CommandHolder::new(Command::Eoc)
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_redirect_in(mut self, path: impl AsRef<Path>) -> Self {
        self.flags |= Flags::REDIRECT_IN;
        self.redirect_in = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_redirect_out(mut self, path: impl AsRef<Path>, append: bool) -> Self {
        self.flags |= Flags::REDIRECT_OUT;
        if append {
            self.flags |= Flags::REDIRECT_APPEND;
        }
        self.redirect_out = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn command_type(&self) -> CommandType {
        self.cmd.command_type()
    }

    pub fn is_background(&self) -> bool {
        self.flags.contains(Flags::BACKGROUND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine_and_query() {
        let mut flags = Flags::PIPE_IN | Flags::PIPE_OUT;
        assert!(flags.contains(Flags::PIPE_IN));
        assert!(flags.contains(Flags::PIPE_IN | Flags::PIPE_OUT));
        assert!(!flags.contains(Flags::BACKGROUND));
        flags.insert(Flags::BACKGROUND);
        assert!(flags.contains(Flags::BACKGROUND));
        assert!(Flags::empty().is_empty());
        assert_eq!(CommandHolder::eoc().flags, Flags::empty());
    }

    #[test]
    fn append_implies_redirect_out() {
        let holder = CommandHolder::new(Command::Pwd).with_redirect_out("out.txt", true);
        assert!(holder.flags.contains(Flags::REDIRECT_OUT | Flags::REDIRECT_APPEND));
        assert_eq!(holder.redirect_out, Some(PathBuf::from("out.txt")));

        let holder = CommandHolder::new(Command::Pwd).with_redirect_out("out.txt", false);
        assert!(!holder.flags.contains(Flags::REDIRECT_APPEND));
    }

    #[test]
    fn command_type_follows_variant() {
        let generic = Command::Generic(GenericCommand {
            args: vec!["ls".into()],
        });
        assert_eq!(generic.command_type(), CommandType::Generic);
        assert_eq!(CommandHolder::eoc().command_type(), CommandType::Eoc);
        assert_eq!(Command::Exit.command_type(), CommandType::Exit);
    }
}
