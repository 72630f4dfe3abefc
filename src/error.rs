//! Failures of a captured run.

use std::io;

/// Why a run could not produce a real exit code.
///
/// Every variant wraps the `io::Error` carrying the OS error code. The `Display` text
/// is what [`CapturedProcess`](crate::CapturedProcess) deposits into the captured error
/// buffer, so callers that only look at the returned code and the error buffer can
/// still tell a setup failure from a process that ran and failed.
///
/// Aborting a run through an [`AbortSignal`](crate::AbortSignal) is not an error; it
/// yields [`ABORTED_EXIT_CODE`](crate::ABORTED_EXIT_CODE).
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum CaptureError {
    /// The three standard stream pipes could not be created.
    #[error("Error creating std io pipes: {source}")]
    PipeCreation {
        #[source]
        source: io::Error,
    },

    /// The child process could not be started.
    #[error("Error creating process '{program}': {source}")]
    ProcessCreation {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Writing the input data to the child's stdin failed.
    #[error("Error writing to child's stdin stream: {source}")]
    StdinWrite {
        #[source]
        source: io::Error,
    },

    /// Waiting for the child to exit failed. The child is killed.
    #[error("Error waiting for child process: {source}")]
    ProcessWait {
        #[source]
        source: io::Error,
    },

    /// Reading the child's stdout failed.
    #[error("Error reading from child's stdout stream: {source}")]
    StdoutRead {
        #[source]
        source: io::Error,
    },

    /// Reading the child's stderr failed.
    #[error("Error reading from child's stderr stream: {source}")]
    StderrRead {
        #[source]
        source: io::Error,
    },
}

impl CaptureError {
    /// The underlying I/O error.
    pub fn io_error(&self) -> &io::Error {
        match self {
            CaptureError::PipeCreation { source }
            | CaptureError::ProcessCreation { source, .. }
            | CaptureError::StdinWrite { source }
            | CaptureError::ProcessWait { source }
            | CaptureError::StdoutRead { source }
            | CaptureError::StderrRead { source } => source,
        }
    }

    /// The OS error code, as returned by the `run` methods in place of an exit code.
    ///
    /// Errors that did not originate in a system call report 1.
    pub fn os_code(&self) -> u32 {
        self.io_error()
            .raw_os_error()
            .map(|code| code as u32)
            .unwrap_or(1)
    }
}
