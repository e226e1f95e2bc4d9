mod backend;

pub use backend::*;

use std::ffi::OsStr;
use std::io;
use std::process::{Command, Stdio};

/// Captured result of one external command: exit success, the exit code
/// when available, and merged stdout/stderr text.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub output: String,
}

/// Seam for everything that shells out. The privileged engine uses a
/// plain runner; the one-shot fallback substitutes an elevated one, and
/// tests substitute a scripted mock, all driving the same logic.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput>;
}

pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        run_command(program, args)
    }
}

pub fn run_command<I, S>(program: &str, args: I) -> io::Result<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.stderr.is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&String::from_utf8_lossy(&output.stderr));
    }
    Ok(CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        output: text.trim().to_string(),
    })
}
