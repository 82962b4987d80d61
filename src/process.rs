// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Child process spawning and lifecycle management for the driver and
// output worker processes.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::{ChildStdin, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// WaitResult
// ---------------------------------------------------------------------------

/// Result of a [`ChildProcess::wait_for_exit`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WaitResult {
    pub exited: bool,
    pub exit_code: i32,
    pub signaled: bool,
    pub signal: i32,
}

impl WaitResult {
    /// The process is gone (exited or killed by a signal).
    pub fn finished(&self) -> bool {
        self.exited || self.signaled
    }

    fn from_status(status: libc::c_int) -> Self {
        let mut r = WaitResult::default();
        if libc::WIFEXITED(status) {
            r.exited = true;
            r.exit_code = libc::WEXITSTATUS(status);
        }
        if libc::WIFSIGNALED(status) {
            r.signaled = true;
            r.signal = libc::WTERMSIG(status);
        }
        r
    }
}

// ---------------------------------------------------------------------------
// ChildProcess
// ---------------------------------------------------------------------------

/// Handle to a spawned child process.
///
/// The handle reaps the child itself with `waitpid`, so it remembers the exit
/// status: a reaped pid may be reused and an unreaped zombie still answers
/// `kill(pid, 0)`.
#[derive(Debug)]
pub struct ChildProcess {
    pid: u32,
    /// Logical name used in log lines.
    name: String,
    executable: PathBuf,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    exit: Option<WaitResult>,
}

impl ChildProcess {
    /// Spawn `executable` with piped stdin/stdout. stderr is inherited so the
    /// child's log output lands next to ours.
    pub fn spawn(name: &str, executable: &Path, args: &[&str]) -> io::Result<Self> {
        let mut child = Command::new(executable)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let h = Self {
            pid: child.id(),
            name: name.to_owned(),
            executable: executable.to_owned(),
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            exit: None,
        };
        // Dropping `Child` neither kills nor waits; the pid is ours to manage.
        drop(child);
        tracing::debug!(name, pid = h.pid, exe = %executable.display(), "spawned process");
        Ok(h)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Exit status, if the process has been reaped.
    pub fn exit_status(&self) -> Option<WaitResult> {
        self.exit
    }

    /// Non-blocking liveness check. Reaps the child if it has exited.
    pub fn is_alive(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        match self.try_reap() {
            Some(r) => {
                self.exit = Some(r);
                false
            }
            None => {
                let rc = unsafe { libc::kill(self.pid as libc::pid_t, 0) };
                rc == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
            }
        }
    }

    fn try_reap(&self) -> Option<WaitResult> {
        let mut status: libc::c_int = 0;
        let ret = unsafe { libc::waitpid(self.pid as libc::pid_t, &mut status, libc::WNOHANG) };
        if ret == self.pid as libc::pid_t {
            Some(WaitResult::from_status(status))
        } else if ret == -1 && io::Error::last_os_error().raw_os_error() == Some(libc::ECHILD) {
            // Reaped elsewhere; report it as gone.
            Some(WaitResult::default())
        } else {
            None
        }
    }

    /// Wait for the process to exit, with a timeout.
    /// Returns immediately if the process has already exited.
    pub fn wait_for_exit(&mut self, timeout: Duration) -> WaitResult {
        if let Some(r) = self.exit {
            return r;
        }
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(r) = self.try_reap() {
                self.exit = Some(r);
                return r;
            }
            if Instant::now() >= deadline {
                return WaitResult::default();
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Send SIGTERM.
    pub fn request_shutdown(&self) -> bool {
        self.exit.is_none() && unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGTERM) == 0 }
    }

    /// Send SIGKILL.
    pub fn force_kill(&self) -> bool {
        self.exit.is_none() && unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGKILL) == 0 }
    }

    /// Wait up to `grace` for a voluntary exit, then SIGKILL. Returns the final
    /// wait result and whether the kill was needed.
    pub fn join_or_kill(&mut self, grace: Duration) -> (WaitResult, bool) {
        let r = self.wait_for_exit(grace);
        if r.finished() || !self.is_alive() {
            return (self.exit.unwrap_or(r), false);
        }
        tracing::warn!(name = %self.name, pid = self.pid, "process did not exit in time, killing");
        self.force_kill();
        (self.wait_for_exit(Duration::from_secs(1)), true)
    }

    /// SIGTERM → wait `grace` → SIGKILL if still alive.
    pub fn shutdown(&mut self, grace: Duration) -> WaitResult {
        if self.exit.is_some() {
            return self.wait_for_exit(Duration::ZERO);
        }
        self.request_shutdown();
        self.join_or_kill(grace).0
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.exit.is_none() {
            // Collect an already-dead child so it does not linger as a zombie.
            let _ = self.try_reap();
        }
    }
}

// ---------------------------------------------------------------------------
// Pipe readiness
// ---------------------------------------------------------------------------

/// Wait until `fd` is readable (data or EOF). `Ok(false)` on timeout.
pub fn wait_readable(fd: &impl AsRawFd, timeout: Duration) -> io::Result<bool> {
    poll_fd(fd.as_raw_fd(), timeout)
}

fn poll_fd(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let ms = remaining.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
        if rc > 0 {
            return Ok(true);
        }
        if rc == 0 {
            return Ok(false);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Locate a companion executable: the explicit path if given, otherwise a
/// sibling of the running executable.
pub fn resolve_executable(explicit: Option<&Path>, name: &str) -> io::Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_owned());
    }
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "executable has no parent"))?;
    Ok(dir.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exited_child_is_reaped_and_reported() {
        let mut p = ChildProcess::spawn("true", Path::new("/bin/sh"), &["-c", "exit 3"]).unwrap();
        let r = p.wait_for_exit(Duration::from_secs(5));
        assert!(r.exited);
        assert_eq!(r.exit_code, 3);
        assert!(!p.is_alive());
    }

    #[test]
    fn force_kill_ends_a_sleeping_child() {
        let mut p = ChildProcess::spawn("sleep", Path::new("/bin/sh"), &["-c", "sleep 30"]).unwrap();
        assert!(p.is_alive());
        let (r, killed) = p.join_or_kill(Duration::from_millis(50));
        assert!(killed);
        assert!(r.signaled);
        assert_eq!(r.signal, libc::SIGKILL);
        assert!(!p.is_alive());
    }

    #[test]
    fn shutdown_terminates_politely_first() {
        let mut p = ChildProcess::spawn("sleep", Path::new("/bin/sh"), &["-c", "sleep 30"]).unwrap();
        assert!(p.exit_status().is_none());
        let r = p.shutdown(Duration::from_secs(5));
        assert!(r.signaled);
        assert_eq!(r.signal, libc::SIGTERM);
        assert_eq!(p.exit_status(), Some(r));
    }

    #[test]
    fn wait_readable_sees_eof() {
        let mut p = ChildProcess::spawn("echo", Path::new("/bin/sh"), &["-c", "exit 0"]).unwrap();
        let out = p.take_stdout().unwrap();
        assert!(wait_readable(&out, Duration::from_secs(5)).unwrap());
        p.wait_for_exit(Duration::from_secs(5));
    }
}
