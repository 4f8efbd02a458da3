//! minnow, a small job-controlling shell.
//!
//! The control thread owns the prompt loop, the parser and the job table;
//! a reaper thread owns `waitpid`. The two talk over channels, so there is
//! no shared table and no signal handler.

mod builtin;
mod executor;
mod jobs;
mod lexer;
mod parser;
mod reaper;

use std::fs::{self, OpenOptions};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;
use std::str::FromStr;

use anyhow::Context;
use argh::FromArgs;
use crossbeam_channel::unbounded;
use log::{LevelFilter, debug, info};
use nix::sys::signal::{SigHandler, Signal, signal};
use nix::unistd::{Pid, getpgrp, getpid, setpgid, tcsetpgrp};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use simplelog::{Config, WriteLogger};

use crate::executor::{ExecContext, ExecOutcome};
use crate::jobs::JobTable;
use crate::parser::{Continuation, ParseOutcome};

#[derive(FromArgs)]
/// An interactive shell with pipelines, redirections and background jobs.
struct Options {
    /// run a single command line and exit
    #[argh(option, short = 'c')]
    command: Option<String>,

    /// path of the debug log (default: ~/.local/share/minnow/minnow.log)
    #[argh(option)]
    log_file: Option<PathBuf>,

    /// log verbosity: off, error, warn, info, debug or trace (default: info)
    #[argh(option)]
    log_level: Option<String>,
}

fn main() {
    let options: Options = argh::from_env();
    init_logging(&options);
    match run(&options) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("minnow: {err:#}");
            process::exit(1);
        }
    }
}

/// Logging goes to a file, never to the terminal the user is typing at.
/// Failure to set it up is not fatal; the shell just runs unlogged.
fn init_logging(options: &Options) {
    let level = options
        .log_level
        .as_deref()
        .and_then(|s| LevelFilter::from_str(s).ok())
        .unwrap_or(LevelFilter::Info);
    if level == LevelFilter::Off {
        return;
    }
    let Some(path) = options.log_file.clone().or_else(default_log_path) else {
        return;
    };
    if let Some(dir) = path.parent() {
        let _ = fs::create_dir_all(dir);
    }
    let Ok(file) = OpenOptions::new().create(true).append(true).open(&path) else {
        return;
    };
    if WriteLogger::init(level, Config::default(), file).is_ok() {
        info!("minnow started (pid {})", process::id());
    }
}

fn default_log_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".local/share/minnow")
            .join("minnow.log"),
    )
}

enum LineResult {
    Done,
    Again(Continuation),
    Exit,
}

fn run(options: &Options) -> anyhow::Result<i32> {
    let interactive = std::io::stdin().is_terminal() && options.command.is_none();
    if interactive {
        // own our process group and the terminal before spawning anything
        let me = getpid();
        let _ = setpgid(me, me);
        let _ = tcsetpgrp(std::io::stdin(), getpgrp());
        // Ctrl-C belongs to the foreground pipeline, not the shell; the
        // prompt itself is guarded by rustyline.
        unsafe {
            let _ = signal(Signal::SIGINT, SigHandler::SigIgn);
        }
    }
    // Writing to a broken pipe or touching the terminal from a background
    // group must not stop the shell.
    unsafe {
        let _ = signal(Signal::SIGTTOU, SigHandler::SigIgn);
    }

    let (track_tx, track_rx) = unbounded::<Pid>();
    let (exit_tx, exit_rx) = unbounded();
    // Not joined on exit: the reaper may be blocked in waitpid on a
    // background child that outlives the shell.
    let _reaper = reaper::spawn(track_rx, exit_tx).context("failed to start the reaper")?;

    let mut table = JobTable::new();
    let ctx = ExecContext {
        track: &track_tx,
        exits: &exit_rx,
        shell_pgid: getpgrp(),
        interactive,
    };

    if let Some(line) = &options.command {
        let result = run_line(line, &mut table, &ctx)?;
        if let LineResult::Again(_) = result {
            eprintln!("minnow: unexpected end of input");
            return Ok(1);
        }
        drain_notices(&mut table, &ctx, false);
        return Ok(0);
    }

    let mut editor = DefaultEditor::new().context("failed to open the line editor")?;
    let mut pending: Option<(String, Continuation)> = None;
    let code = loop {
        drain_notices(&mut table, &ctx, true);
        let prompt = if pending.is_some() { "> " } else { "minnow $ " };
        match editor.readline(prompt) {
            Ok(line) => {
                let line = match pending.take() {
                    Some((kept, cont)) => {
                        let joiner = if cont.keeps_newline() { "\n" } else { " " };
                        format!("{kept}{joiner}{line}")
                    }
                    None => line,
                };
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                match run_line(&line, &mut table, &ctx)? {
                    LineResult::Done => {}
                    LineResult::Again(cont) => pending = Some((line, cont)),
                    LineResult::Exit => break 0,
                }
            }
            Err(ReadlineError::Interrupted) => {
                // Ctrl-C at the prompt abandons any half-typed line
                pending = None;
            }
            Err(ReadlineError::Eof) => {
                println!("exit");
                break 0;
            }
            Err(err) => return Err(err).context("failed to read input"),
        }
    };

    drain_notices(&mut table, &ctx, true);
    Ok(code)
}

/// Parses and executes one (possibly joined) command line.
fn run_line(line: &str, table: &mut JobTable, ctx: &ExecContext<'_>) -> anyhow::Result<LineResult> {
    if line.trim().is_empty() {
        return Ok(LineResult::Done);
    }
    let job = match parser::parse(line) {
        Ok(ParseOutcome::Complete(job)) => job,
        Ok(ParseOutcome::Incomplete(cont)) => {
            debug!("awaiting more input ({cont:?})");
            return Ok(LineResult::Again(cont));
        }
        Err(err) => {
            println!("{err}");
            return Ok(LineResult::Done);
        }
    };
    let id = table.add(job);
    match executor::execute(table, id, ctx)? {
        ExecOutcome::Continue(status) => {
            debug!("job [{id}] finished with status {status}");
            Ok(LineResult::Done)
        }
        ExecOutcome::Terminate => Ok(LineResult::Exit),
    }
}

/// Applies every queued exit notice, then announces and removes finished
/// jobs. Notices are printed only between prompts of an interactive run.
fn drain_notices(table: &mut JobTable, ctx: &ExecContext<'_>, announce: bool) {
    while let Ok(notice) = ctx.exits.try_recv() {
        reaper::apply_exit(table, notice);
    }
    for notice in table.sweep() {
        if announce {
            println!("{notice}");
        }
    }
}
