//! Anonymous pipes wired to a child's standard streams.

use std::fs::File;
use std::io::{self, Read, Write};

use crate::error::CaptureError;

const READ_CHUNK: usize = 4096;

/// An OS pipe that owns both of its ends.
///
/// An end is `None` once closed. Closing an end that is already closed does nothing,
/// and each end is released exactly once, when it is closed or when the `Pipe` is
/// dropped.
#[derive(Debug)]
pub struct Pipe {
    read: Option<File>,
    write: Option<File>,
}

impl Pipe {
    /// Create a new pipe.
    ///
    /// Both ends may be handed to a child; the caller marks the end it keeps as
    /// non-inheritable with [`Pipe::set_read_inheritable`] or
    /// [`Pipe::set_write_inheritable`].
    pub fn new() -> io::Result<Pipe> {
        let (read, write) = os::make_pipe()?;
        Ok(Pipe {
            read: Some(read),
            write: Some(write),
        })
    }

    /// The read end, if still open.
    pub fn read_end(&self) -> Option<&File> {
        self.read.as_ref()
    }

    /// The write end, if still open.
    pub fn write_end(&self) -> Option<&File> {
        self.write.as_ref()
    }

    /// Close the read end.
    pub fn close_read(&mut self) {
        self.read.take();
    }

    /// Close the write end.
    pub fn close_write(&mut self) {
        self.write.take();
    }

    /// Hand over ownership of the read end, leaving it closed in the pipe.
    pub fn take_read(&mut self) -> Option<File> {
        self.read.take()
    }

    /// Hand over ownership of the write end, leaving it closed in the pipe.
    pub fn take_write(&mut self) -> Option<File> {
        self.write.take()
    }

    /// True if both ends are closed.
    pub fn is_closed(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }

    pub fn set_read_inheritable(&self, inheritable: bool) -> io::Result<()> {
        match &self.read {
            Some(f) => os::set_inheritable(f, inheritable),
            None => Ok(()),
        }
    }

    pub fn set_write_inheritable(&self, inheritable: bool) -> io::Result<()> {
        match &self.write {
            Some(f) => os::set_inheritable(f, inheritable),
            None => Ok(()),
        }
    }

    /// Check whether at least one byte is queued on the read end.
    ///
    /// Neither blocks nor consumes data. A closed read end reports `false`.
    pub fn has_data(&self) -> io::Result<bool> {
        match &self.read {
            Some(f) => Ok(os::bytes_available(f)? > 0),
            None => Ok(false),
        }
    }

    /// Read from the read end until the write side is closed.
    ///
    /// The read end is consumed. See [`drain`].
    pub fn read_to_end(&mut self) -> io::Result<Vec<u8>> {
        match self.read.take() {
            Some(f) => drain(f),
            None => Ok(Vec::new()),
        }
    }

    /// Write all of `data` to the write end, blocking as needed.
    ///
    /// Fails on the first failed write. Writing to a closed write end fails with
    /// `ErrorKind::BrokenPipe`.
    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.write {
            Some(f) => f.write_all(data),
            None => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }
}

/// Read `source` to clean end-of-stream.
///
/// Data is appended in the order it arrives. End-of-stream is a zero-length read or
/// the broken-pipe condition some platforms report once the last writer is gone; any
/// other error is returned. Bytes read before an error are discarded with it.
pub fn drain(mut source: File) -> io::Result<Vec<u8>> {
    let mut result = Vec::new();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => result.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(result)
}

/// The three pipes serving one child invocation.
#[derive(Debug)]
pub struct StreamSet {
    pub stdin: Pipe,
    pub stdout: Pipe,
    pub stderr: Pipe,
}

impl StreamSet {
    /// Create pipes for stdin, stdout and stderr.
    ///
    /// The parent's ends (stdin write, stdout read, stderr read) are made
    /// non-inheritable. If anything fails, the pipes created so far are closed.
    ///
    /// # Errors
    ///
    /// * `CaptureError::PipeCreation` if a pipe cannot be created or configured.
    pub fn create() -> Result<StreamSet, CaptureError> {
        let make = || -> io::Result<StreamSet> {
            let stdin = Pipe::new()?;
            stdin.set_write_inheritable(false)?;
            let stdout = Pipe::new()?;
            stdout.set_read_inheritable(false)?;
            let stderr = Pipe::new()?;
            stderr.set_read_inheritable(false)?;
            Ok(StreamSet {
                stdin,
                stdout,
                stderr,
            })
        };
        make().map_err(|source| CaptureError::PipeCreation { source })
    }

    /// Close the parent's copies of the ends the child now owns.
    pub fn close_child_ends(&mut self) {
        self.stdin.close_read();
        self.stdout.close_write();
        self.stderr.close_write();
    }
}

#[cfg(unix)]
mod os {
    use crate::posix;
    use std::fs::File;
    use std::io;

    pub fn make_pipe() -> io::Result<(File, File)> {
        posix::pipe()
    }

    // Every pipe end starts out close-on-exec; the child's ends become inheritable
    // only as the duplicates made onto descriptors 0-2 after fork.
    pub fn set_inheritable(f: &File, inheritable: bool) -> io::Result<()> {
        if !inheritable {
            posix::set_cloexec(f, true)?;
        }
        Ok(())
    }

    pub fn bytes_available(f: &File) -> io::Result<usize> {
        posix::bytes_available(f)
    }
}

#[cfg(windows)]
mod os {
    use crate::win32;
    use std::fs::File;
    use std::io;

    pub fn make_pipe() -> io::Result<(File, File)> {
        win32::CreatePipe()
    }

    pub fn set_inheritable(f: &File, inheritable: bool) -> io::Result<()> {
        win32::SetHandleInformation(
            f,
            win32::HANDLE_FLAG_INHERIT,
            if inheritable { win32::HANDLE_FLAG_INHERIT } else { 0 },
        )
    }

    pub fn bytes_available(f: &File) -> io::Result<usize> {
        match win32::PeekNamedPipe(f) {
            Ok(n) => Ok(n as usize),
            // all writers gone and nothing left to read
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(0),
            Err(e) => Err(e),
        }
    }
}
