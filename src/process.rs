use std::fmt;
use std::io;
use std::time::Duration;

/// Exit code reported for a child that was terminated because the run was aborted.
///
/// This is `ERROR_PROCESS_ABORTED` on Windows. On Unix it lies outside the range a
/// process can exit with (0-255, or 128 plus a signal number when killed by a signal),
/// so it cannot be confused with a real exit status.
pub const ABORTED_EXIT_CODE: u32 = 1067;

/// A handle to a spawned child.
///
/// Created by [`launch`](crate::launch). The exit code is recorded exactly once, either
/// when the child is observed to have exited or when it is forcibly terminated.
/// Consuming the handle with [`release`](Self::release) frees the OS resources.
///
/// # Drop behavior
///
/// Dropping a handle whose child is still running kills the child and, on Unix, reaps
/// it, so that no process outlives a failed run unobserved.
pub struct ChildHandle {
    pid: u32,
    exit_code: Option<u32>,
    ext: os::ExtProcessState,
}

impl ChildHandle {
    pub(crate) fn new(pid: u32, ext: os::ExtProcessState) -> ChildHandle {
        ChildHandle {
            pid,
            exit_code: None,
            ext,
        }
    }

    /// Returns the PID of the child.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns the exit code if the child is known to have finished.
    ///
    /// This does not perform any system calls.
    pub fn exit_code(&self) -> Option<u32> {
        self.exit_code
    }

    /// Wait up to `dur` for the child to exit.
    ///
    /// Returns `Ok(Some(code))` if the child has exited, `Ok(None)` if it is still
    /// running after `dur`.
    pub fn wait_timeout(&mut self, dur: Duration) -> io::Result<Option<u32>> {
        if let Some(code) = self.exit_code {
            return Ok(Some(code));
        }
        let code = os::wait_timeout(self.pid, &self.ext, Some(dur))?;
        if code.is_some() {
            self.exit_code = code;
        }
        Ok(code)
    }

    /// Wait for the child to exit and return its exit code.
    pub fn wait(&mut self) -> io::Result<u32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        match os::wait_timeout(self.pid, &self.ext, None)? {
            Some(code) => {
                self.exit_code = Some(code);
                Ok(code)
            }
            None => Err(io::Error::other("child still running after unbounded wait")),
        }
    }

    /// Forcibly terminate the child and record `exit_code` as its exit code.
    ///
    /// The child is killed outright (`SIGKILL` on Unix, `TerminateProcess` on Windows)
    /// and waited for. Processes the child spawned itself are not affected. If the child
    /// was already observed to have exited, its real exit code is kept; otherwise
    /// `exit_code` replaces whatever status the OS reports for the killed child.
    pub fn terminate(&mut self, exit_code: u32) -> io::Result<u32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        os::terminate(self.pid, &self.ext, exit_code)?;
        os::wait_timeout(self.pid, &self.ext, None)?;
        self.exit_code = Some(exit_code);
        Ok(exit_code)
    }

    /// Release the process resources, returning the recorded exit code.
    pub fn release(self) -> Option<u32> {
        self.exit_code
    }
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        if self.exit_code.is_none() {
            if let Err(err) = os::terminate(self.pid, &self.ext, ABORTED_EXIT_CODE) {
                tracing::warn!(pid = self.pid, "failed to kill abandoned child: {err}");
            }
            if let Err(err) = os::wait_timeout(self.pid, &self.ext, None) {
                tracing::warn!(pid = self.pid, "failed to reap abandoned child: {err}");
            }
        }
    }
}

impl fmt::Debug for ChildHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildHandle")
            .field("pid", &self.pid)
            .field("exit_code", &self.exit_code)
            .finish()
    }
}

#[cfg(unix)]
pub(crate) mod os {
    use crate::posix;
    use std::cmp::min;
    use std::io;
    use std::time::{Duration, Instant};

    pub type ExtProcessState = ();

    pub fn wait_timeout(pid: u32, _ext: &(), dur: Option<Duration>) -> io::Result<Option<u32>> {
        let Some(dur) = dur else {
            return waitpid(pid, true);
        };
        let deadline = Instant::now() + dur;
        let mut delay = Duration::from_millis(1);
        loop {
            if let Some(code) = waitpid(pid, false)? {
                return Ok(Some(code));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(min(delay, deadline - now));
            delay = min(delay * 2, Duration::from_millis(100));
        }
    }

    fn waitpid(pid: u32, block: bool) -> io::Result<Option<u32>> {
        loop {
            match posix::waitpid(pid, if block { 0 } else { posix::WNOHANG }) {
                Ok((pid_out, status)) if pid_out == pid => {
                    return Ok(Some(posix::decode_exit_code(status)));
                }
                Ok(_) => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn terminate(pid: u32, _ext: &(), _exit_code: u32) -> io::Result<()> {
        match posix::kill(pid, posix::SIGKILL) {
            // already reaped by someone else
            Err(e) if e.raw_os_error() == Some(posix::ESRCH) => Ok(()),
            other => other,
        }
    }
}

#[cfg(windows)]
pub(crate) mod os {
    use crate::win32;
    use std::io;
    use std::time::Duration;

    #[derive(Debug)]
    pub struct ExtProcessState {
        pub process: win32::Handle,
        // Held so that the primary thread handle lives exactly as long as the
        // process handle.
        #[allow(dead_code)]
        pub thread: win32::Handle,
    }

    pub fn wait_timeout(
        _pid: u32,
        ext: &ExtProcessState,
        dur: Option<Duration>,
    ) -> io::Result<Option<u32>> {
        match win32::WaitForSingleObject(&ext.process, dur)? {
            win32::WaitEvent::OBJECT_0 => Ok(Some(win32::GetExitCodeProcess(&ext.process)?)),
            win32::WaitEvent::TIMEOUT => Ok(None),
        }
    }

    pub fn terminate(_pid: u32, ext: &ExtProcessState, exit_code: u32) -> io::Result<()> {
        if let Err(err) = win32::TerminateProcess(&ext.process, exit_code) {
            // TerminateProcess fails with access denied if the process has already
            // exited.
            if err.raw_os_error() != Some(win32::ERROR_ACCESS_DENIED as i32) {
                return Err(err);
            }
        }
        Ok(())
    }
}
