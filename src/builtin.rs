//! Built-in commands.
//!
//! `cd` and `exit` run in the shell process itself when they are the only
//! stage of a non-background pipeline, so they can affect the session.
//! Inside a multi-stage pipeline or a backgrounded job every builtin runs
//! in a forked child, where it can only affect that child's soon-discarded
//! environment (see [`run_in_child`]).

use std::env;
use std::io::{self, Write};
use std::path::PathBuf;

use log::debug;

/// Resolves the directory-change target and performs it in the calling
/// process. Returns a shell exit status (0 on success).
///
/// - no argument: change to `$HOME`;
/// - `-`: swap with the previous directory (`$OLDPWD`) and print the new
///   directory;
/// - anything else: change there.
///
/// Every successful change rewrites `OLDPWD` to the directory we left.
pub fn change_dir(target: Option<&str>, out: &mut dyn Write) -> i32 {
    match target {
        None => match env::var("HOME") {
            Ok(home) => chdir_tracked(&home, out),
            Err(_) => {
                let _ = writeln!(out, "cd: HOME not set");
                1
            }
        },
        Some("-") => match env::var("OLDPWD") {
            Ok(previous) => {
                let status = chdir_tracked(&previous, out);
                if status == 0 {
                    let _ = writeln!(out, "{previous}");
                }
                status
            }
            Err(_) => {
                let _ = writeln!(out, "cd: OLDPWD not set");
                1
            }
        },
        Some(path) => chdir_tracked(path, out),
    }
}

/// Like [`change_dir`] but with the child-scoped fallback: a missing
/// `$HOME` falls back to the root directory instead of failing.
pub fn change_dir_in_child(target: Option<&str>, out: &mut dyn Write) -> i32 {
    match target {
        None => {
            let home = env::var("HOME").unwrap_or_else(|_| "/".to_string());
            chdir_tracked(&home, out)
        }
        other => change_dir(other, out),
    }
}

fn chdir_tracked(path: &str, out: &mut dyn Write) -> i32 {
    let left: Option<PathBuf> = env::current_dir().ok();
    match env::set_current_dir(path) {
        Ok(()) => {
            if let Some(previous) = left {
                // rewritten on every successful directory change
                unsafe { env::set_var("OLDPWD", &previous) };
            }
            debug!("cd: now in {path}");
            0
        }
        Err(err) => {
            report_path_error(path, &err, out);
            1
        }
    }
}

fn report_path_error(path: &str, err: &io::Error, out: &mut dyn Write) {
    match err.kind() {
        io::ErrorKind::NotFound => {
            let _ = writeln!(out, "{path}: No such file or directory");
        }
        io::ErrorKind::PermissionDenied => {
            let _ = writeln!(out, "{path}: Permission denied");
        }
        _ => {
            let _ = writeln!(out, "{path}: {err}");
        }
    }
}

/// `pwd`: prints the working directory.
pub fn print_working_dir(out: &mut dyn Write) -> i32 {
    match env::current_dir() {
        Ok(dir) => {
            let _ = writeln!(out, "{}", dir.display());
            0
        }
        Err(err) => {
            let _ = writeln!(out, "pwd: {err}");
            1
        }
    }
}

/// Builtin dispatch for a forked pipeline stage. Returns `Some(status)` if
/// `argv` names a builtin, `None` when the stage is an external program.
///
/// `jobs_listing` is the table snapshot rendered by the parent before the
/// fork; the child just writes it, since its copy of the table is dead.
pub fn run_in_child(argv: &[String], jobs_listing: &str, out: &mut dyn Write) -> Option<i32> {
    match argv.first().map(String::as_str) {
        Some("cd") => Some(change_dir_in_child(argv.get(1).map(String::as_str), out)),
        Some("exit") => Some(0),
        Some("jobs") => {
            let _ = out.write_all(jobs_listing.as_bytes());
            Some(0)
        }
        Some("pwd") => Some(print_working_dir(out)),
        _ => None,
    }
}
