// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! A single persistent shell process shared across many tool calls.
//!
//! Modeled on the GDB tool family's `Arc<Mutex<State>>`-owned child process
//! (connect → interrupt → stop lifecycle), generalized here to a plain
//! interactive POSIX shell instead of a debugger. The worker owns the child;
//! a reader task drains its stdout into a bounded, mutex-guarded line buffer
//! so tool dispatch never blocks on shell output.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// How long the reader waits for new output before considering the shell
/// "idle" during `open()`'s startup probe.
const IDLE_QUIET_PERIOD: Duration = Duration::from_millis(300);
/// Hard ceiling on `open()`'s idle wait, regardless of how chatty the shell's
/// startup banner is.
const IDLE_CEILING: Duration = Duration::from_secs(3);

/// Commands that would wipe the model's view of the terminal screen if they
/// reached the real shell — rejected at the tool boundary instead.
const SCREEN_CLEAR_COMMANDS: &[&str] = &["clear", "cls", "reset"];

fn is_screen_clear(command: &str) -> bool {
    let trimmed = command.trim();
    if trimmed == "\u{1b}c" {
        return true;
    }
    SCREEN_CLEAR_COMMANDS.contains(&trimmed)
}

fn ansi_strip_regex() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b(\[[0-9;?]*[a-zA-Z]|\][^\x07]*\x07|[=>])").unwrap())
}

/// Strip ANSI escape sequences, leaving plain text suitable for the model.
pub fn strip_ansi(text: &str) -> String {
    ansi_strip_regex().replace_all(text, "").to_string()
}

/// Shared state for the persistent shell child process and its rolling
/// output buffer.
pub struct ShellWorkerState {
    child: Option<Child>,
    stdin: Option<tokio::process::ChildStdin>,
    lines: Vec<String>,
    buffer_max_bytes: usize,
}

impl ShellWorkerState {
    fn new(buffer_max_bytes: usize) -> Self {
        Self { child: None, stdin: None, lines: Vec::new(), buffer_max_bytes }
    }

    fn is_open(&self) -> bool {
        self.child.is_some()
    }

    fn push_line(&mut self, line: String) {
        self.lines.push(line);
        self.trim_to_budget();
    }

    /// Drop whole lines from the head until the buffer is at or under
    /// `buffer_max_bytes`, always leaving at least one line.
    fn trim_to_budget(&mut self) {
        let mut total: usize = self.lines.iter().map(|l| l.len() + 1).sum();
        while total > self.buffer_max_bytes && self.lines.len() > 1 {
            total -= self.lines[0].len() + 1;
            self.lines.remove(0);
        }
    }

    fn snapshot(&self) -> String {
        strip_ansi(&self.lines.join("\n"))
    }
}

/// Handle shared by every shell-category tool. Cloning is cheap — the inner
/// state lives behind an `Arc<Mutex<_>>`, matching the GDB session pattern.
#[derive(Clone)]
pub struct ShellWorker {
    state: Arc<Mutex<ShellWorkerState>>,
}

impl ShellWorker {
    pub fn new(buffer_max_bytes: usize) -> Self {
        Self { state: Arc::new(Mutex::new(ShellWorkerState::new(buffer_max_bytes))) }
    }

    /// Spawn the child shell if not already running, then wait for it to go
    /// idle. Idempotent: calling `open()` on an already-open shell is a no-op
    /// that returns immediately.
    pub async fn open(&self) -> anyhow::Result<()> {
        {
            let guard = self.state.lock().await;
            if guard.is_open() {
                return Ok(());
            }
        }

        let shell_path = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        let mut cmd = Command::new(&shell_path);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        unsafe {
            use std::os::unix::process::CommandExt;
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|e| anyhow::anyhow!("failed to spawn {shell_path}: {e}"))?;
        let stdin = child.stdin.take().ok_or_else(|| anyhow::anyhow!("no stdin on spawned shell"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow::anyhow!("no stdout on spawned shell"))?;
        let stderr = child.stderr.take().ok_or_else(|| anyhow::anyhow!("no stderr on spawned shell"))?;

        {
            let mut guard = self.state.lock().await;
            guard.child = Some(child);
            guard.stdin = Some(stdin);
        }

        spawn_reader(self.state.clone(), stdout);
        spawn_reader(self.state.clone(), stderr);

        self.wait_idle().await;
        debug!(shell = %shell_path, "shell worker opened");
        Ok(())
    }

    /// Block until no new output has arrived for `IDLE_QUIET_PERIOD`, or
    /// `IDLE_CEILING` elapses — whichever comes first.
    async fn wait_idle(&self) {
        let deadline = tokio::time::Instant::now() + IDLE_CEILING;
        loop {
            let before = { self.state.lock().await.lines.len() };
            tokio::time::sleep(IDLE_QUIET_PERIOD).await;
            let after = { self.state.lock().await.lines.len() };
            if after == before || tokio::time::Instant::now() >= deadline {
                return;
            }
        }
    }

    /// Write `command` to the shell's stdin, opening the shell first if
    /// needed. Rejects screen-clearing commands with a success-shaped notice
    /// rather than letting them reach the real terminal.
    pub async fn enqueue(&self, command: &str, wait_output: Duration) -> anyhow::Result<String> {
        if is_screen_clear(command) {
            return Ok("screen-clearing commands are not permitted; the session buffer is preserved".to_string());
        }
        self.open().await?;

        let mut guard = self.state.lock().await;
        let stdin = guard.stdin.as_mut().ok_or_else(|| anyhow::anyhow!("shell stdin unavailable"))?;
        stdin.write_all(command.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        drop(guard);

        if !wait_output.is_zero() {
            tokio::time::sleep(wait_output).await;
        }
        Ok(self.snapshot().await)
    }

    /// Send SIGINT to the child; callers needing a harder stop should follow
    /// with `close()`.
    pub async fn interrupt(&self) -> anyhow::Result<()> {
        let guard = self.state.lock().await;
        let Some(child) = &guard.child else {
            return Ok(());
        };
        let Some(pid) = child.id() else {
            return Ok(());
        };
        // SAFETY: pid is the live child's own process id, obtained directly
        // from tokio::process::Child; SIGINT is non-destructive.
        let ret = unsafe { libc::kill(pid as i32, libc::SIGINT) };
        if ret != 0 {
            warn!(pid, "SIGINT to shell worker failed");
        }
        Ok(())
    }

    /// Current buffered output, ANSI-stripped.
    pub async fn snapshot(&self) -> String {
        self.state.lock().await.snapshot()
    }

    pub async fn is_open(&self) -> bool {
        self.state.lock().await.is_open()
    }

    /// Tell the worker to exit, then terminate and reap the child. Falls back
    /// from a polite `exit` to SIGTERM to SIGKILL, matching the GDB session's
    /// terminate-then-kill teardown.
    pub async fn close(&self) {
        let mut guard = self.state.lock().await;
        if let Some(stdin) = guard.stdin.as_mut() {
            let _ = stdin.write_all(b"exit\n").await;
            let _ = stdin.flush().await;
        }
        guard.stdin = None;

        let Some(mut child) = guard.child.take() else { return };
        drop(guard);

        if let Ok(Some(_)) = tokio::time::timeout(Duration::from_millis(500), child.wait())
            .await
            .map(|r| r.ok())
        {
            return;
        }
        if let Some(pid) = child.id() {
            unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        }
        if tokio::time::timeout(Duration::from_secs(2), child.wait()).await.is_err() {
            if let Some(pid) = child.id() {
                unsafe { libc::kill(pid as i32, libc::SIGKILL) };
            }
            let _ = child.wait().await;
        }
    }
}

fn spawn_reader<R>(state: Arc<Mutex<ShellWorkerState>>, reader: R)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    state.lock().await.push_line(line);
                }
                Ok(None) | Err(_) => break,
            }
        }
    });
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screen_clear_commands_are_recognized() {
        assert!(is_screen_clear("clear"));
        assert!(is_screen_clear("  clear  "));
        assert!(is_screen_clear("cls"));
        assert!(is_screen_clear("reset"));
        assert!(is_screen_clear("\u{1b}c"));
        assert!(!is_screen_clear("ls"));
        assert!(!is_screen_clear("clear_history")); // must be exact, not a substring
    }

    #[test]
    fn strip_ansi_removes_csi_sequences() {
        let raw = "\x1b[31mred text\x1b[0m plain";
        assert_eq!(strip_ansi(raw), "red text plain");
    }

    #[test]
    fn strip_ansi_is_noop_on_plain_text() {
        assert_eq!(strip_ansi("hello world"), "hello world");
    }

    #[test]
    fn buffer_trims_oldest_lines_first() {
        let mut state = ShellWorkerState::new(30);
        for i in 0..10 {
            state.push_line(format!("line{i}"));
        }
        assert!(state.lines.len() < 10);
        assert_eq!(state.lines.last().unwrap(), "line9");
    }

    #[test]
    fn buffer_trims_unconditionally_down_to_cap() {
        let mut state = ShellWorkerState::new(60);
        state.push_line("x".repeat(55));
        state.push_line("y".repeat(55));
        // Total would be 112 bytes against a 60-byte cap; the oldest line is
        // dropped even though only one line then remains.
        assert_eq!(state.lines.len(), 1);
        assert_eq!(state.lines[0], "y".repeat(55));
    }

    #[test]
    fn snapshot_joins_lines_and_strips_ansi() {
        let mut state = ShellWorkerState::new(1000);
        state.push_line("\x1b[32mok\x1b[0m".to_string());
        state.push_line("plain".to_string());
        assert_eq!(state.snapshot(), "ok\nplain");
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let worker = ShellWorker::new(4096);
        worker.open().await.unwrap();
        assert!(worker.is_open().await);
        worker.open().await.unwrap(); // no panic, no second spawn
        assert!(worker.is_open().await);
        worker.close().await;
    }

    #[tokio::test]
    async fn enqueue_rejects_screen_clear_without_touching_shell() {
        let worker = ShellWorker::new(4096);
        let result = worker.enqueue("clear", Duration::from_millis(0)).await.unwrap();
        assert!(result.contains("not permitted"));
        // Rejected before open() — the shell was never spawned.
        assert!(!worker.is_open().await);
    }

    #[tokio::test]
    async fn enqueue_then_snapshot_sees_command_output() {
        let worker = ShellWorker::new(65536);
        worker.enqueue("echo hello_from_shell", Duration::from_millis(200)).await.unwrap();
        let snap = worker.snapshot().await;
        assert!(snap.contains("hello_from_shell"), "snapshot was: {snap}");
        worker.close().await;
    }

    #[tokio::test]
    async fn close_before_open_does_not_panic() {
        let worker = ShellWorker::new(4096);
        worker.close().await;
    }
}
