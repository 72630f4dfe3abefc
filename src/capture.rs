use std::fs::File;
use std::io;
use std::mem;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::abort::{AbortSignal, NeverAbort};
use crate::error::CaptureError;
use crate::pipe::{self, StreamSet};
use crate::process::{ABORTED_EXIT_CODE, ChildHandle};
use crate::spawn::{self, Identity, WindowMode};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Settings for [`CapturedProcess`].
///
/// ```
/// use captured_process::{CaptureConfig, WindowMode};
/// use std::time::Duration;
///
/// let config = CaptureConfig::default()
///     .window_mode(WindowMode::Visible)
///     .poll_interval(Duration::from_millis(10));
/// assert_eq!(config.get_poll_interval(), Duration::from_millis(10));
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CaptureConfig {
    window_mode: WindowMode,
    poll_interval: Duration,
}

impl Default for CaptureConfig {
    fn default() -> CaptureConfig {
        CaptureConfig {
            window_mode: WindowMode::Hidden,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl CaptureConfig {
    /// Set the window visibility of the child. Defaults to `Hidden`.
    pub fn window_mode(mut self, mode: WindowMode) -> CaptureConfig {
        self.window_mode = mode;
        self
    }

    /// Set how often a running child is checked for exit and abort. Defaults to 50 ms.
    ///
    /// This bounds the latency of an abort. Zero is treated as 1 ms.
    pub fn poll_interval(mut self, interval: Duration) -> CaptureConfig {
        self.poll_interval = interval.max(MIN_POLL_INTERVAL);
        self
    }

    pub fn get_window_mode(&self) -> WindowMode {
        self.window_mode
    }

    pub fn get_poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// Progress of the most recent run of a [`CapturedProcess`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RunState {
    /// No run has been started.
    Idle,
    /// Pipes are being created and the child started.
    Launching,
    /// The child is running; input is written and output drained.
    Running,
    /// The child has ended; the remaining output is being collected.
    Draining,
    /// The run finished and produced an exit code.
    Completed,
    /// The run failed; see [`CapturedProcess::last_error`].
    Failed,
}

/// Runs a child process with a byte buffer as its standard input and captures its
/// standard output and error.
///
/// Input data is set with [`set_stdin_data`](Self::set_stdin_data) and consumed by the
/// next run. The run writes it to the child while two threads concurrently drain the
/// child's stdout and stderr, so a child that produces a lot of output while still
/// reading input cannot deadlock against the parent. While the child runs, it is
/// polled for exit, and the abort signal, if any, is checked at every poll.
///
/// The `run` methods return the child's exit code. If the run fails before the child
/// can produce one, they return the OS error code of the failure instead and place a
/// description of it in the error buffer, so that [`fetch_stderr_data`] tells the two
/// cases apart. The typed failure is also available from [`last_error`].
///
/// Captured output is retrieved with [`fetch_stdout_data`] and [`fetch_stderr_data`],
/// which hand the buffers over to the caller and leave them empty.
///
/// ```no_run
/// use captured_process::CapturedProcess;
///
/// let mut process = CapturedProcess::new();
/// process.set_stdin_data("hello world");
/// let exit_code = process.run("cat", "");
/// assert_eq!(exit_code, 0);
/// assert_eq!(process.fetch_stdout_data(), b"hello world");
/// ```
///
/// [`fetch_stdout_data`]: Self::fetch_stdout_data
/// [`fetch_stderr_data`]: Self::fetch_stderr_data
/// [`last_error`]: Self::last_error
#[derive(Debug)]
pub struct CapturedProcess {
    stdin_data: Vec<u8>,
    stdout_data: Vec<u8>,
    stderr_data: Vec<u8>,
    config: CaptureConfig,
    state: RunState,
    last_error: Option<CaptureError>,
}

impl Default for CapturedProcess {
    fn default() -> CapturedProcess {
        CapturedProcess::with_config(CaptureConfig::default())
    }
}

impl CapturedProcess {
    pub fn new() -> CapturedProcess {
        CapturedProcess::default()
    }

    pub fn with_config(config: CaptureConfig) -> CapturedProcess {
        CapturedProcess {
            stdin_data: Vec::new(),
            stdout_data: Vec::new(),
            stderr_data: Vec::new(),
            config,
            state: RunState::Idle,
            last_error: None,
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Set the window visibility of children started by subsequent runs.
    pub fn set_window_mode(&mut self, mode: WindowMode) {
        self.config = self.config.window_mode(mode);
    }

    /// Set the interval at which a running child is polled.
    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.config = self.config.poll_interval(interval);
    }

    /// Set the data written to the standard input of the next child.
    ///
    /// Replaces any data previously set. If the data is empty, the child gets no
    /// standard input at all rather than an empty stream.
    pub fn set_stdin_data(&mut self, data: impl Into<Vec<u8>>) {
        self.stdin_data = data.into();
    }

    /// Run `program` with `arguments` and return its exit code.
    ///
    /// See [`launch`](crate::launch) for how `program` and `arguments` are
    /// interpreted.
    pub fn run(&mut self, program: &str, arguments: &str) -> u32 {
        self.execute(program, arguments, &NeverAbort, None)
    }

    /// Like [`run`](Self::run), but terminate the child when `abort` becomes set.
    ///
    /// An aborted run returns [`ABORTED_EXIT_CODE`](crate::ABORTED_EXIT_CODE).
    pub fn run_with_abort(
        &mut self,
        program: &str,
        arguments: &str,
        abort: &impl AbortSignal,
    ) -> u32 {
        self.execute(program, arguments, abort, None)
    }

    /// Like [`run`](Self::run), but start the child under `identity`.
    pub fn run_as(&mut self, identity: &Identity, program: &str, arguments: &str) -> u32 {
        self.execute(program, arguments, &NeverAbort, Some(identity))
    }

    /// Like [`run_with_abort`](Self::run_with_abort), but start the child under
    /// `identity`.
    pub fn run_as_with_abort(
        &mut self,
        identity: &Identity,
        program: &str,
        arguments: &str,
        abort: &impl AbortSignal,
    ) -> u32 {
        self.execute(program, arguments, abort, Some(identity))
    }

    /// True if the last run captured any standard output not yet fetched.
    pub fn has_stdout_data(&self) -> bool {
        !self.stdout_data.is_empty()
    }

    /// True if the error buffer holds data not yet fetched.
    pub fn has_stderr_data(&self) -> bool {
        !self.stderr_data.is_empty()
    }

    /// Take the captured standard output, leaving the buffer empty.
    ///
    /// A second call without an intervening run returns an empty vector.
    pub fn fetch_stdout_data(&mut self) -> Vec<u8> {
        mem::take(&mut self.stdout_data)
    }

    /// Take the captured standard error, or the description of a failed run, leaving
    /// the buffer empty.
    pub fn fetch_stderr_data(&mut self) -> Vec<u8> {
        mem::take(&mut self.stderr_data)
    }

    /// The failure of the most recent run, if it failed.
    pub fn last_error(&self) -> Option<&CaptureError> {
        self.last_error.as_ref()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn execute(
        &mut self,
        program: &str,
        arguments: &str,
        abort: &dyn AbortSignal,
        identity: Option<&Identity>,
    ) -> u32 {
        self.last_error = None;
        self.stdout_data.clear();
        self.stderr_data.clear();
        let stdin_data = mem::take(&mut self.stdin_data);

        match self.capture(program, arguments, &stdin_data, abort, identity) {
            Ok(captured) => {
                self.stdout_data = captured.stdout;
                self.stderr_data = captured.stderr;
                self.state = RunState::Completed;
                debug!(
                    program,
                    exit_code = captured.exit_code,
                    stdout_len = self.stdout_data.len(),
                    stderr_len = self.stderr_data.len(),
                    "run completed"
                );
                captured.exit_code
            }
            Err(err) => {
                warn!(program, "run failed: {err}");
                let code = err.os_code();
                self.stderr_data = err.to_string().into_bytes();
                self.state = RunState::Failed;
                self.last_error = Some(err);
                code
            }
        }
    }

    fn capture(
        &mut self,
        program: &str,
        arguments: &str,
        stdin_data: &[u8],
        abort: &dyn AbortSignal,
        identity: Option<&Identity>,
    ) -> Result<Captured, CaptureError> {
        self.state = RunState::Launching;
        let mut streams = StreamSet::create()?;
        let redirect_stdin = !stdin_data.is_empty();
        let mut child = spawn::launch(
            program,
            arguments,
            &streams,
            redirect_stdin,
            self.config.window_mode,
            identity,
        )?;
        debug!(program, pid = child.pid(), redirect_stdin, "child started");

        self.state = RunState::Running;
        streams.close_child_ends();
        if !redirect_stdin {
            streams.stdin.close_write();
        }

        // Start draining before writing any input: a child echoing its input would
        // otherwise fill the output pipe and stop reading while we block on stdin.
        let mut stdout = Drain::start(Stream::Stdout, streams.stdout.take_read())?;
        let mut stderr = Drain::start(Stream::Stderr, streams.stderr.take_read())?;

        if redirect_stdin {
            // A child that exits without reading all of its input fails the run too.
            if let Err(source) = streams.stdin.write_all(stdin_data) {
                streams.stdin.close_write();
                terminate_child(&mut child, "failed input write");
                abandon(child, stdout, stderr);
                return Err(CaptureError::StdinWrite { source });
            }
            trace!(pid = child.pid(), len = stdin_data.len(), "input written");
            streams.stdin.close_write();
        }

        let aborted = match self.poll(&mut child, &mut stdout, &mut stderr, abort) {
            Ok(aborted) => aborted,
            Err(source) => {
                abandon(child, stdout, stderr);
                return Err(CaptureError::ProcessWait { source });
            }
        };

        self.state = RunState::Draining;
        let pid = child.pid();
        let exit_code = match child.release() {
            Some(code) => code,
            // terminate() failed; the handle was killed and reaped on release
            None => ABORTED_EXIT_CODE,
        };
        let stdout = stdout
            .join()
            .map_err(|source| CaptureError::StdoutRead { source })?;
        let stderr = stderr
            .join()
            .map_err(|source| CaptureError::StderrRead { source })?;
        debug!(pid, exit_code, aborted, "child finished");

        Ok(Captured {
            exit_code,
            stdout,
            stderr,
        })
    }

    /// Wait for the child to exit, terminating it if a drain fails or `abort` is set.
    ///
    /// Returns true if the child was terminated. If waiting fails, the child is
    /// terminated and the error returned.
    pub(crate) fn poll(
        &self,
        child: &mut ChildHandle,
        stdout: &mut Drain,
        stderr: &mut Drain,
        abort: &dyn AbortSignal,
    ) -> io::Result<bool> {
        loop {
            match child.wait_timeout(self.config.poll_interval) {
                Ok(Some(_)) => return Ok(false),
                Ok(None) => {}
                Err(err) => {
                    terminate_child(child, "failed wait");
                    return Err(err);
                }
            }
            let reason = if stdout.failed() {
                "stdout read failure"
            } else if stderr.failed() {
                "stderr read failure"
            } else if abort.is_set() {
                "abort signal"
            } else {
                trace!(pid = child.pid(), "child still running");
                continue;
            };
            debug!(pid = child.pid(), reason, "terminating child");
            terminate_child(child, reason);
            return Ok(true);
        }
    }
}

struct Captured {
    exit_code: u32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

// Release the child (killing it if still running) before joining, so the drains
// see end-of-stream.
fn abandon(child: ChildHandle, stdout: Drain, stderr: Drain) {
    drop(child);
    stdout.discard();
    stderr.discard();
}

fn terminate_child(child: &mut ChildHandle, context: &str) {
    if let Err(err) = child.terminate(ABORTED_EXIT_CODE) {
        warn!(pid = child.pid(), "failed to terminate child after {context}: {err}");
    }
}

#[derive(Debug, Copy, Clone)]
pub(crate) enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn thread_name(self) -> &'static str {
        match self {
            Stream::Stdout => "capture-stdout",
            Stream::Stderr => "capture-stderr",
        }
    }

    fn wrap_error(self, source: io::Error) -> CaptureError {
        match self {
            Stream::Stdout => CaptureError::StdoutRead { source },
            Stream::Stderr => CaptureError::StderrRead { source },
        }
    }
}

/// One output stream being read to EOF on its own thread.
pub(crate) struct Drain {
    stream: Stream,
    handle: Option<JoinHandle<io::Result<Vec<u8>>>>,
    result: Option<io::Result<Vec<u8>>>,
}

impl Drain {
    fn start(stream: Stream, source: Option<File>) -> Result<Drain, CaptureError> {
        let Some(source) = source else {
            return Ok(Drain::finished(stream));
        };
        Drain::spawn(stream, move || pipe::drain(source))
    }

    /// Run `read` on a thread named after `stream`.
    pub(crate) fn spawn<F>(stream: Stream, read: F) -> Result<Drain, CaptureError>
    where
        F: FnOnce() -> io::Result<Vec<u8>> + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(stream.thread_name().to_owned())
            .spawn(read)
            .map_err(|e| stream.wrap_error(e))?;
        Ok(Drain {
            stream,
            handle: Some(handle),
            result: None,
        })
    }

    /// Collect the result if the thread has finished; true if it finished with an
    /// error. Reaching EOF while the child still runs is not a failure.
    pub(crate) fn failed(&mut self) -> bool {
        if self.result.is_none()
            && let Some(handle) = self.handle.take_if(|h| h.is_finished())
        {
            self.result = Some(Self::join_thread(self.stream, handle));
        }
        matches!(self.result, Some(Err(_)))
    }

    pub(crate) fn join(mut self) -> io::Result<Vec<u8>> {
        if let Some(result) = self.result.take() {
            return result;
        }
        match self.handle.take() {
            Some(handle) => Self::join_thread(self.stream, handle),
            None => Ok(Vec::new()),
        }
    }

    fn discard(self) {
        let stream = self.stream;
        if let Err(err) = self.join() {
            debug!(?stream, "discarded output stream failed: {err}");
        }
    }

    pub(crate) fn finished(stream: Stream) -> Drain {
        Drain {
            stream,
            handle: None,
            result: Some(Ok(Vec::new())),
        }
    }

    fn join_thread(stream: Stream, handle: JoinHandle<io::Result<Vec<u8>>>) -> io::Result<Vec<u8>> {
        handle.join().unwrap_or_else(|panic| {
            warn!(?stream, "drain thread panicked: {panic:?}");
            Err(io::Error::other(format!("{} thread panicked", stream.thread_name())))
        })
    }
}
