//! Grammar analysis: turns one scanned command line into a [`Job`] with its
//! pipeline stages, or a continuation state, or a syntax error.
//!
//! Redirection targets are opened here, at stage boundaries; a target that
//! fails to open is reported immediately and recorded as [`StageIo::Broken`]
//! so the executor can drop the stage without aborting the rest of the
//! pipeline.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};

use log::debug;

use crate::jobs::{Job, StageIo, Task};
use crate::lexer::{self, LexOutcome, OpenQuote, Token};

/// What the line was waiting for when it ended.
///
/// Continuations are not errors: the caller keeps the raw text and appends
/// the next input line before reparsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    SingleQuote,
    DoubleQuote,
    /// A dangling trailing `|`. Deliberately tolerated while `| cmd` and
    /// `a | | b` are hard errors.
    Pipe,
    /// A redirection operator with no target yet.
    RedirectTarget,
}

impl Continuation {
    /// Inside an open quote the line break is part of the string, so the
    /// retry must join lines with a literal newline; everywhere else a
    /// space is the right joiner.
    pub fn keeps_newline(self) -> bool {
        matches!(self, Continuation::SingleQuote | Continuation::DoubleQuote)
    }
}

/// Grammar errors. `Display` produces the exact diagnostic the shell
/// prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntaxError {
    /// `<`, `>` or `|` at an invalid position.
    UnexpectedToken(char),
    DuplicateInput,
    DuplicateOutput,
    MissingProgram,
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyntaxError::UnexpectedToken(tok) => {
                write!(f, "syntax error near unexpected token `{tok}'")
            }
            SyntaxError::DuplicateInput => write!(f, "error: duplicated input redirection"),
            SyntaxError::DuplicateOutput => write!(f, "error: duplicated output redirection"),
            SyntaxError::MissingProgram => write!(f, "error: missing program"),
        }
    }
}

impl std::error::Error for SyntaxError {}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseOutcome {
    Complete(Job),
    Incomplete(Continuation),
}

// PartialEq on Job is only needed so ParseOutcome can be asserted on; two
// jobs compare equal when their visible parse results match.
impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.cmdline == other.cmdline
            && self.background == other.background
            && self.tasks.len() == other.tasks.len()
            && self
                .tasks
                .iter()
                .zip(&other.tasks)
                .all(|(a, b)| a.argv == b.argv)
    }
}

impl Eq for Job {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RedirKind {
    In,
    Out,
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prev {
    Word,
    Pipe,
    Redir,
}

/// Accumulates one pipeline stage until a `|` or the end of line closes it.
struct StageBuilder {
    words: Vec<String>,
    saw_empty: bool,
    in_file: Option<String>,
    out_file: Option<(String, bool)>,
    /// True for every stage after a `|`: its input is already redirected
    /// through the pipe, so an explicit `<` is a duplicate.
    piped_in: bool,
}

impl StageBuilder {
    fn new(piped_in: bool) -> Self {
        StageBuilder {
            words: Vec::new(),
            saw_empty: false,
            in_file: None,
            out_file: None,
            piped_in,
        }
    }

    fn finish(self, first: bool) -> Result<Task, SyntaxError> {
        let mut argv: Vec<String> = self.words.into_iter().filter(|w| !w.is_empty()).collect();
        if argv.is_empty() {
            if !first {
                return Err(SyntaxError::MissingProgram);
            }
            if self.saw_empty {
                // sole intentionally-empty argument of the first stage;
                // kept so the executor reports the missing program
                argv.push(String::new());
            }
        }
        let stdin = match self.in_file {
            Some(path) => open_input(&path),
            None => StageIo::Inherit,
        };
        let stdout = match self.out_file {
            Some((path, append)) => open_output(&path, append),
            None => StageIo::Inherit,
        };
        Ok(Task::new(argv, stdin, stdout))
    }
}

/// Parses one raw command line.
///
/// The line may span several input lines joined by the caller; see
/// [`Continuation`]. On success the returned job's `cmdline` is the input
/// trimmed of trailing whitespace, and reparsing that `cmdline` yields the
/// same argument vectors.
pub fn parse(line: &str) -> Result<ParseOutcome, SyntaxError> {
    let (stripped, background) = lexer::strip_background(line);
    let tokens = match lexer::scan(stripped) {
        LexOutcome::Incomplete(OpenQuote::Single) => {
            return Ok(ParseOutcome::Incomplete(Continuation::SingleQuote));
        }
        LexOutcome::Incomplete(OpenQuote::Double) => {
            return Ok(ParseOutcome::Incomplete(Continuation::DoubleQuote));
        }
        LexOutcome::Done(tokens) => tokens,
    };

    let mut job = Job::new(line.trim_end());
    job.background = background;

    let mut stage = StageBuilder::new(false);
    let mut first = true;
    let mut pending: Option<RedirKind> = None;
    let mut prev: Option<Prev> = None;

    for token in tokens {
        match token {
            Token::Word { text, quoted } => {
                match pending.take() {
                    Some(RedirKind::In) => stage.in_file = Some(text),
                    Some(RedirKind::Out) => stage.out_file = Some((text, false)),
                    Some(RedirKind::Append) => stage.out_file = Some((text, true)),
                    None => {
                        if text.is_empty() && quoted {
                            stage.saw_empty = true;
                        }
                        stage.words.push(text);
                    }
                }
                prev = Some(Prev::Word);
            }
            Token::Pipe => {
                if pending.is_some() {
                    return Err(SyntaxError::UnexpectedToken('|'));
                }
                match prev {
                    None => return Err(SyntaxError::UnexpectedToken('|')),
                    Some(Prev::Pipe) => return Err(SyntaxError::MissingProgram),
                    _ => {}
                }
                if stage.out_file.is_some() {
                    // this stage's output already feeds the pipe
                    return Err(SyntaxError::DuplicateOutput);
                }
                job.tasks.push(stage.finish(first)?);
                first = false;
                stage = StageBuilder::new(true);
                prev = Some(Prev::Pipe);
            }
            Token::RedirIn => {
                if pending.is_some() || prev == Some(Prev::Pipe) {
                    return Err(SyntaxError::UnexpectedToken('<'));
                }
                if stage.piped_in || stage.in_file.is_some() {
                    return Err(SyntaxError::DuplicateInput);
                }
                pending = Some(RedirKind::In);
                prev = Some(Prev::Redir);
            }
            Token::RedirOut => {
                if pending.is_some() || prev == Some(Prev::Pipe) {
                    return Err(SyntaxError::UnexpectedToken('>'));
                }
                if stage.out_file.is_some() {
                    return Err(SyntaxError::DuplicateOutput);
                }
                pending = Some(RedirKind::Out);
                prev = Some(Prev::Redir);
            }
            Token::RedirAppend => {
                if pending.is_some() || prev == Some(Prev::Pipe) {
                    return Err(SyntaxError::UnexpectedToken('>'));
                }
                if stage.out_file.is_some() {
                    return Err(SyntaxError::DuplicateOutput);
                }
                pending = Some(RedirKind::Append);
                prev = Some(Prev::Redir);
            }
        }
    }

    if pending.is_some() {
        debug!("incomplete line (awaiting redirection target): {line:?}");
        return Ok(ParseOutcome::Incomplete(Continuation::RedirectTarget));
    }
    if prev == Some(Prev::Pipe) {
        debug!("incomplete line (dangling pipe): {line:?}");
        return Ok(ParseOutcome::Incomplete(Continuation::Pipe));
    }

    job.tasks.push(stage.finish(first)?);
    Ok(ParseOutcome::Complete(job))
}

fn open_input(path: &str) -> StageIo {
    match File::open(path) {
        Ok(file) => StageIo::File(file),
        Err(err) => {
            report_open_error(path, &err);
            StageIo::Broken
        }
    }
}

fn open_output(path: &str, append: bool) -> StageIo {
    let mut opts = OpenOptions::new();
    opts.write(true).create(true);
    if append {
        opts.append(true);
    } else {
        opts.truncate(true);
    }
    match opts.open(path) {
        Ok(file) => StageIo::File(file),
        Err(err) => {
            report_open_error(path, &err);
            StageIo::Broken
        }
    }
}

fn report_open_error(path: &str, err: &io::Error) {
    match err.kind() {
        ErrorKind::NotFound => println!("{path}: No such file or directory"),
        ErrorKind::PermissionDenied => println!("{path}: Permission denied"),
        _ => println!("{path}: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn complete(line: &str) -> Job {
        match parse(line) {
            Ok(ParseOutcome::Complete(job)) => job,
            other => panic!("expected complete parse for {line:?}, got {other:?}"),
        }
    }

    fn argvs(job: &Job) -> Vec<Vec<String>> {
        job.tasks.iter().map(|t| t.argv.clone()).collect()
    }

    #[test]
    fn quoting_round_trip_yields_three_arguments() {
        let job = complete("echo 'a b' \"c d\" e");
        assert_eq!(argvs(&job), vec![vec!["echo", "a b", "c d", "e"]]);
    }

    #[test]
    fn pipeline_splits_into_stages() {
        let job = complete("cat f | sort -r | wc -l");
        assert_eq!(
            argvs(&job),
            vec![vec!["cat", "f"], vec!["sort", "-r"], vec!["wc", "-l"]]
        );
        assert!(!job.background);
    }

    #[test]
    fn trailing_ampersand_marks_background() {
        let job = complete("sleep 1 &");
        assert!(job.background);
        assert_eq!(job.cmdline, "sleep 1 &");
        assert_eq!(argvs(&job), vec![vec!["sleep", "1"]]);
    }

    #[test]
    fn duplicate_redirections_are_errors() {
        assert_eq!(parse("cmd < a < b"), Err(SyntaxError::DuplicateInput));
        assert_eq!(parse("cmd > a > b"), Err(SyntaxError::DuplicateOutput));
        assert_eq!(parse("cmd >> a > b"), Err(SyntaxError::DuplicateOutput));
        // pipe-implied redirections count too
        assert_eq!(parse("a | b < f"), Err(SyntaxError::DuplicateInput));
        assert_eq!(parse("a > f | b"), Err(SyntaxError::DuplicateOutput));
    }

    #[test]
    fn pipe_grammar_errors() {
        assert_eq!(parse("|"), Err(SyntaxError::UnexpectedToken('|')));
        assert_eq!(parse("| cmd"), Err(SyntaxError::UnexpectedToken('|')));
        assert_eq!(parse("a | | b"), Err(SyntaxError::MissingProgram));
        assert_eq!(parse("a < | b"), Err(SyntaxError::UnexpectedToken('|')));
        assert_eq!(parse("a | < f"), Err(SyntaxError::UnexpectedToken('<')));
        assert_eq!(parse("a < > f"), Err(SyntaxError::UnexpectedToken('>')));
    }

    #[test]
    fn error_messages_match_protocol() {
        assert_eq!(
            SyntaxError::UnexpectedToken('|').to_string(),
            "syntax error near unexpected token `|'"
        );
        assert_eq!(
            SyntaxError::DuplicateInput.to_string(),
            "error: duplicated input redirection"
        );
        assert_eq!(
            SyntaxError::MissingProgram.to_string(),
            "error: missing program"
        );
    }

    #[test]
    fn dangling_constructs_are_continuations() {
        assert_eq!(
            parse("a |"),
            Ok(ParseOutcome::Incomplete(Continuation::Pipe))
        );
        assert_eq!(
            parse("a | b >"),
            Ok(ParseOutcome::Incomplete(Continuation::RedirectTarget))
        );
        assert_eq!(
            parse("echo 'open"),
            Ok(ParseOutcome::Incomplete(Continuation::SingleQuote))
        );
        assert_eq!(
            parse("echo \"open"),
            Ok(ParseOutcome::Incomplete(Continuation::DoubleQuote))
        );
        assert!(Continuation::SingleQuote.keeps_newline());
        assert!(!Continuation::Pipe.keeps_newline());
    }

    #[test]
    fn empty_quotes_as_sole_argument_survive() {
        let job = complete("''");
        assert_eq!(argvs(&job), vec![vec![String::new()]]);
        // but they vanish when other arguments exist
        let job = complete("'' echo hi");
        assert_eq!(argvs(&job), vec![vec!["echo", "hi"]]);
    }

    #[test]
    fn empty_stage_after_pipe_is_missing_program() {
        assert_eq!(parse("a | ''"), Err(SyntaxError::MissingProgram));
    }

    #[test]
    fn reparsing_cmdline_is_idempotent() {
        for line in ["echo 'a b' c &", "cat x | wc -l", "a b  c"] {
            let job = complete(line);
            let again = complete(&job.cmdline);
            assert_eq!(argvs(&job), argvs(&again));
            assert_eq!(job.background, again.background);
        }
    }

    #[test]
    fn redirection_targets_are_opened() {
        let dir = std::env::temp_dir().join(format!("minnow_parse_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).expect("create temp dir");
        let input = dir.join("in");
        fs::write(&input, "hello\n").expect("write input");
        let output = dir.join("out");

        let line = format!("cat < {} > {}", input.display(), output.display());
        let job = complete(&line);
        assert_eq!(job.tasks.len(), 1);
        assert!(matches!(job.tasks[0].stdin, StageIo::File(_)));
        assert!(matches!(job.tasks[0].stdout, StageIo::File(_)));
        assert!(output.exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn unopenable_input_is_broken_not_fatal() {
        let job = complete("cat < /definitely/not/there | wc -l");
        assert!(job.tasks[0].stdin.is_broken());
        assert!(matches!(job.tasks[1].stdin, StageIo::Inherit));
    }
}
