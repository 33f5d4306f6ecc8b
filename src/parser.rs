use crate::command::{
    CdCommand, Command, CommandHolder, CommandType, EchoCommand, ExportCommand, Flags,
    GenericCommand, KillCommand,
};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::env;
use thiserror::Error;

pub const MAXARGS: usize = 128;

/// Words that select a command kind other than GENERIC.
static KEYWORDS: Lazy<HashMap<&'static str, CommandType>> = Lazy::new(|| {
    HashMap::from([
        ("echo", CommandType::Echo),
        ("export", CommandType::Export),
        ("cd", CommandType::Cd),
        ("kill", CommandType::Kill),
        ("pwd", CommandType::Pwd),
        ("jobs", CommandType::Jobs),
        ("exit", CommandType::Exit),
        ("quit", CommandType::Exit),
    ])
});

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty command line")]
    Empty,
    #[error("missing command in pipeline")]
    EmptyStage,
    #[error("no input file specified")]
    MissingInput,
    #[error("no output file specified")]
    MissingOutput,
    #[error("too many arguments")]
    TooManyArgs,
    #[error("unterminated {0} quote")]
    UnterminatedQuote(char),
    #[error("usage: export NAME=VALUE")]
    Export,
    #[error("usage: kill SIGNUM JOBID")]
    Kill,
    #[error("cd: HOME not set")]
    NoHome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    /// Quoted text: never expanded.
    Quoted(String),
    In,
    Out,
    Append,
    Pipe,
    Background,
}

/// Words and redirections collected for one stage.
#[derive(Debug, Default)]
struct Stage {
    argv: Vec<String>,
    infile: Option<String>,
    outfile: Option<(String, bool)>,
}

/// Parses the input command line into the stage sequence the executor runs.
///
/// This handles:
///
/// - Tokenization (including quoted strings)
/// - Input redirection ("<") and output redirection (">" or ">>")
/// - Pipelines ("|") of any length
/// - Background execution using "&"
/// - `$NAME` expansion of unquoted words
///
/// The returned sequence always ends with an EOC holder.
pub fn parse_command_line(cmdline: &str) -> Result<Vec<CommandHolder>, ParseError> {
    let tokens = tokenize(cmdline)?;
    if tokens.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut stages = vec![Stage::default()];
    let mut bg = false;
    let mut iter = tokens.into_iter();

    while let Some(token) = iter.next() {
        let current = stages.last_mut().ok_or(ParseError::Empty)?;
        match token {
            Token::In => {
                let file = iter.next().and_then(word).ok_or(ParseError::MissingInput)?;
                current.infile = Some(file);
            }
            Token::Out | Token::Append => {
                let file = iter.next().and_then(word).ok_or(ParseError::MissingOutput)?;
                current.outfile = Some((file, token == Token::Append));
            }
            Token::Pipe => stages.push(Stage::default()),
            Token::Background => bg = true,
            Token::Word(_) | Token::Quoted(_) => {
                if current.argv.len() >= MAXARGS - 1 {
                    return Err(ParseError::TooManyArgs);
                }
                if let Some(text) = word(token) {
                    current.argv.push(text);
                }
            }
        }
    }

    let last = stages.len() - 1;
    let mut holders = Vec::with_capacity(stages.len() + 1);
    for (i, stage) in stages.into_iter().enumerate() {
        let mut flags = Flags::empty();
        if i > 0 {
            flags |= Flags::PIPE_IN;
        }
        if i < last {
            flags |= Flags::PIPE_OUT;
        }
        if bg {
            flags |= Flags::BACKGROUND;
        }
        let mut holder = CommandHolder::new(build_command(stage.argv)?).with_flags(flags);
        if let Some(infile) = stage.infile {
            holder = holder.with_redirect_in(infile);
        }
        if let Some((outfile, append)) = stage.outfile {
            holder = holder.with_redirect_out(outfile, append);
        }
        holders.push(holder);
    }
    holders.push(CommandHolder::eoc());
    Ok(holders)
}

/// Text of a word token after expansion; `None` for operators.
fn word(token: Token) -> Option<String> {
    match token {
        Token::Word(text) => Some(substitute_token(&text)),
        Token::Quoted(text) => Some(text),
        _ => None,
    }
}

fn build_command(argv: Vec<String>) -> Result<Command, ParseError> {
    let name = argv.first().ok_or(ParseError::EmptyStage)?;
    let kind = KEYWORDS
        .get(name.as_str())
        .copied()
        .unwrap_or(CommandType::Generic);
    let cmd = match kind {
        CommandType::Echo => Command::Echo(EchoCommand {
            args: argv[1..].to_vec(),
        }),
        CommandType::Export => {
            let assignment = argv.get(1).ok_or(ParseError::Export)?;
            let (env_var, val) = assignment.split_once('=').ok_or(ParseError::Export)?;
            if env_var.is_empty() {
                return Err(ParseError::Export);
            }
            Command::Export(ExportCommand {
                env_var: env_var.to_string(),
                val: val.to_string(),
            })
        }
        CommandType::Cd => {
            let dir = match argv.get(1) {
                Some(dir) => dir.clone(),
                None => dirs_next::home_dir()
                    .ok_or(ParseError::NoHome)?
                    .to_string_lossy()
                    .into_owned(),
            };
            Command::Cd(CdCommand { dir })
        }
        CommandType::Kill => {
            let (sig, job) = match &argv[1..] {
                [sig, job] => (sig, job),
                _ => return Err(ParseError::Kill),
            };
            let sig = sig
                .trim_start_matches('-')
                .parse()
                .map_err(|_| ParseError::Kill)?;
            let job_id = job
                .trim_start_matches('%')
                .parse()
                .map_err(|_| ParseError::Kill)?;
            Command::Kill(KillCommand { sig, job_id })
        }
        CommandType::Pwd => Command::Pwd,
        CommandType::Jobs => Command::Jobs,
        CommandType::Exit => Command::Exit,
        CommandType::Generic | CommandType::Eoc => {
            Command::Generic(GenericCommand { args: argv })
        }
    };
    Ok(cmd)
}

/// Splits the input command line into tokens. This function handles:
///
/// - Quoted strings (using single or double quotes)
/// - Special tokens: `<`, `>`, `>>`, `|`, and `&`
fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }
        match ch {
            '"' | '\'' => {
                chars.next(); // Consume opening quote.
                let mut token = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == ch => break,
                        Some(c) => token.push(c),
                        None => return Err(ParseError::UnterminatedQuote(ch)),
                    }
                }
                tokens.push(Token::Quoted(token));
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'>') {
                    chars.next();
                    tokens.push(Token::Append);
                } else {
                    tokens.push(Token::Out);
                }
            }
            '<' | '|' | '&' => {
                chars.next();
                tokens.push(match ch {
                    '<' => Token::In,
                    '|' => Token::Pipe,
                    _ => Token::Background,
                });
            }
            _ => {
                let mut token = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '<' | '>' | '|' | '&' | '"' | '\'') {
                        break;
                    }
                    token.push(c);
                    chars.next();
                }
                tokens.push(Token::Word(token));
            }
        }
    }
    Ok(tokens)
}

/// Expands a `$NAME` word from the environment; an unset name expands to
/// the empty string. Other words are returned unchanged.
fn substitute_token(token: &str) -> String {
    match token.strip_prefix('$') {
        Some(name) if !name.is_empty() => env::var(name).unwrap_or_default(),
        _ => token.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::path::PathBuf;

    fn words(tokens: Vec<Token>) -> Vec<String> {
        tokens.into_iter().filter_map(word).collect()
    }

    #[test]
    fn test_tokenize_simple() {
        let tokens = tokenize("ls -l").unwrap();
        assert_eq!(words(tokens), vec!["ls", "-l"]);
    }

    #[test]
    fn test_tokenize_quotes() {
        let tokens = tokenize("echo \"hello world\"").unwrap();
        assert_eq!(words(tokens), vec!["echo", "hello world"]);
    }

    #[test]
    fn test_tokenize_operators_without_spaces() {
        let tokens = tokenize("a|b>>c<d&").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Word("a".into()),
                Token::Pipe,
                Token::Word("b".into()),
                Token::Append,
                Token::Word("c".into()),
                Token::In,
                Token::Word("d".into()),
                Token::Background,
            ]
        );
    }

    #[test]
    fn test_unterminated_quote() {
        assert_eq!(
            parse_command_line("echo 'oops"),
            Err(ParseError::UnterminatedQuote('\''))
        );
    }

    #[test]
    fn test_parse_command_line() {
        let input = "grep 'pattern' < input.txt | sort > output.txt &";
        let holders = parse_command_line(input).unwrap();
        assert_eq!(holders.len(), 3);

        let grep = &holders[0];
        assert_eq!(
            grep.cmd,
            Command::Generic(GenericCommand {
                args: vec!["grep".into(), "pattern".into()]
            })
        );
        assert_eq!(grep.redirect_in, Some(PathBuf::from("input.txt")));
        assert!(grep.flags.contains(Flags::PIPE_OUT | Flags::REDIRECT_IN | Flags::BACKGROUND));
        assert!(!grep.flags.contains(Flags::PIPE_IN));

        let sort = &holders[1];
        assert_eq!(sort.redirect_out, Some(PathBuf::from("output.txt")));
        assert!(sort.flags.contains(Flags::PIPE_IN | Flags::REDIRECT_OUT | Flags::BACKGROUND));
        assert!(!sort.flags.contains(Flags::PIPE_OUT | Flags::REDIRECT_APPEND));

        assert_eq!(holders[2].command_type(), CommandType::Eoc);
    }

    #[test]
    fn test_interior_stages_pipe_both_ways() {
        let holders = parse_command_line("a | b | c").unwrap();
        assert!(holders[1].flags.contains(Flags::PIPE_IN | Flags::PIPE_OUT));
        assert!(!holders[1].is_background());
    }

    #[test]
    fn test_append_redirect() {
        let holders = parse_command_line("echo hi >> log").unwrap();
        assert!(holders[0]
            .flags
            .contains(Flags::REDIRECT_OUT | Flags::REDIRECT_APPEND));
    }

    #[test]
    fn test_builtin_kinds() {
        let lines = [
            "echo a",
            "export A=1",
            "cd /",
            "kill 9 1",
            "pwd",
            "jobs",
            "exit",
            "quit",
            "ls",
        ];
        let kinds: Vec<CommandType> = lines
            .iter()
            .map(|line| parse_command_line(line).unwrap()[0].command_type())
            .collect();
        assert_eq!(
            kinds,
            vec![
                CommandType::Echo,
                CommandType::Export,
                CommandType::Cd,
                CommandType::Kill,
                CommandType::Pwd,
                CommandType::Jobs,
                CommandType::Exit,
                CommandType::Exit,
                CommandType::Generic,
            ]
        );
    }

    #[test]
    fn test_builtin_payloads() {
        let holders = parse_command_line("export FOO=a=b").unwrap();
        assert_eq!(
            holders[0].cmd,
            Command::Export(ExportCommand {
                env_var: "FOO".into(),
                val: "a=b".into()
            })
        );

        let holders = parse_command_line("kill -15 %2").unwrap();
        assert_eq!(holders[0].cmd, Command::Kill(KillCommand { sig: 15, job_id: 2 }));

        let holders = parse_command_line("echo one two").unwrap();
        assert_eq!(
            holders[0].cmd,
            Command::Echo(EchoCommand {
                args: vec!["one".into(), "two".into()]
            })
        );
    }

    #[test]
    fn test_builtin_usage_errors() {
        assert_eq!(parse_command_line("export FOO"), Err(ParseError::Export));
        assert_eq!(parse_command_line("kill 9"), Err(ParseError::Kill));
        assert_eq!(parse_command_line("kill x 1"), Err(ParseError::Kill));
    }

    #[test]
    fn test_structural_errors() {
        assert_eq!(parse_command_line("   "), Err(ParseError::Empty));
        assert_eq!(parse_command_line("ls |"), Err(ParseError::EmptyStage));
        assert_eq!(parse_command_line("| ls"), Err(ParseError::EmptyStage));
        assert_eq!(parse_command_line("cat <"), Err(ParseError::MissingInput));
        assert_eq!(parse_command_line("ls >"), Err(ParseError::MissingOutput));
        assert_eq!(parse_command_line("ls > |"), Err(ParseError::MissingOutput));
    }

    #[test]
    #[serial]
    fn test_env_expansion() {
        env::set_var("QUASH_PARSE_VAR", "expanded");
        env::remove_var("QUASH_PARSE_UNSET");
        let line = "echo $QUASH_PARSE_VAR '$QUASH_PARSE_VAR' $QUASH_PARSE_UNSET $";
        let holders = parse_command_line(line).unwrap();
        assert_eq!(
            holders[0].cmd,
            Command::Echo(EchoCommand {
                args: vec![
                    "expanded".into(),
                    "$QUASH_PARSE_VAR".into(),
                    "".into(),
                    "$".into()
                ]
            })
        );
        env::remove_var("QUASH_PARSE_VAR");
    }
}
