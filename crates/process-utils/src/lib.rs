//! Small process-related helpers shared across the workspace.
//!
//! External tools are always launched through these helpers so that every
//! child gets the same treatment: no console window on Windows, piped output,
//! and termination when the owning future is dropped.

use std::collections::VecDeque;
use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Default number of output lines retained by [`OutputTail`].
pub const DEFAULT_TAIL_LINES: usize = 20;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` for a long-running external tool.
///
/// Stdout and stderr are piped, stdin is closed, and the child is killed if
/// the handle is dropped before it exits (for example when a timeout fires).
#[cfg(feature = "tokio")]
pub fn tool_command<I, S>(program: impl AsRef<OsStr>, args: I) -> tokio::process::Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    cmd.no_window();
    cmd
}

/// Bounded buffer keeping the last lines a child wrote.
///
/// Used to build error messages from tool output without holding the
/// whole stream in memory.
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record a line, evicting the oldest when full. Blank lines are skipped.
    pub fn push(&mut self, line: impl Into<String>) {
        let line = line.into();
        if line.trim().is_empty() {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Whether any retained line contains `needle` (ASCII case-insensitive).
    pub fn contains_ignore_case(&self, needle: &str) -> bool {
        let needle = needle.to_ascii_lowercase();
        self.lines
            .iter()
            .any(|l| l.to_ascii_lowercase().contains(&needle))
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Retained lines joined with newlines.
    pub fn joined(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// The most recent line, if any.
    pub fn last(&self) -> Option<&str> {
        self.lines.back().map(String::as_str)
    }
}

impl Default for OutputTail {
    fn default() -> Self {
        Self::new(DEFAULT_TAIL_LINES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_most_recent_lines() {
        let mut tail = OutputTail::new(2);
        tail.push("first");
        tail.push("   ");
        tail.push("second");
        tail.push("third");
        assert_eq!(tail.joined(), "second\nthird");
        assert_eq!(tail.last(), Some("third"));
    }

    #[test]
    fn tail_case_insensitive_search() {
        let mut tail = OutputTail::default();
        tail.push("ERROR: HTTP Error 429: Too Many Requests");
        assert!(tail.contains_ignore_case("http error 429"));
        assert!(!tail.contains_ignore_case("unsupported url"));
    }
}
