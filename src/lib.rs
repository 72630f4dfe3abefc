//! Run a child process with in-memory input and captured output.
//!
//! The crate starts a program with its standard input fed from a byte buffer and its
//! standard output and error collected into separate buffers, waits for it to finish,
//! and reports its exit code. A run can be cut short with an [`AbortSignal`], in which
//! case the child is forcibly terminated and [`ABORTED_EXIT_CODE`] is reported.
//!
//! The main entry point is [`CapturedProcess`]:
//!
//! ```no_run
//! use captured_process::{CapturedProcess, Deadline};
//! use std::time::Duration;
//!
//! let mut process = CapturedProcess::new();
//! process.set_stdin_data("b\na\nc\n");
//! let exit_code = process.run_with_abort("sort", "", &Deadline::after(Duration::from_secs(5)));
//! if exit_code == 0 {
//!     assert_eq!(process.fetch_stdout_data(), b"a\nb\nc\n");
//! } else {
//!     eprintln!("{}", String::from_utf8_lossy(&process.fetch_stderr_data()));
//! }
//! ```
//!
//! The building blocks it is made of, [`Pipe`], [`StreamSet`], [`launch`] and
//! [`ChildHandle`], are public as well.
//!
//! # Platform notes
//!
//! On Unix, `program` is looked up in `PATH` unless it contains a slash, and the
//! argument string is split into words using shell quoting rules. On Windows the
//! argument string is passed verbatim as the command line after the quoted program
//! name, and the child window is hidden unless configured otherwise.

#![warn(missing_debug_implementations, rust_2018_idioms)]

mod abort;
mod capture;
mod error;
mod pipe;
mod process;
mod spawn;

#[cfg(unix)]
mod posix;

#[cfg(windows)]
mod win32;

#[cfg(test)]
mod tests;

pub use abort::{AbortSignal, AbortWhen, Deadline, NeverAbort};
pub use capture::{CaptureConfig, CapturedProcess, RunState};
pub use error::CaptureError;
pub use pipe::{Pipe, StreamSet, drain};
pub use process::{ABORTED_EXIT_CODE, ChildHandle};
pub use spawn::{Identity, WindowMode, launch};
