use std::ffi::OsStr;
use std::io;

use crate::error::CaptureError;
use crate::pipe::StreamSet;
use crate::process::ChildHandle;

pub use os::Identity;

/// Visibility of the child's main window.
///
/// Only meaningful on Windows, where `Hidden` starts the child with `SW_HIDE`. The
/// setting has no effect on Unix.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub enum WindowMode {
    Visible,
    #[default]
    Hidden,
}

/// Spawn `program` with its standard streams bound to `streams`.
///
/// `arguments` is a single argument string. On Windows it is passed to the child as its
/// command line, following the quoted program name. On Unix it is split using POSIX
/// shell quoting rules, and the pieces follow `program` as `argv[1..]`.
///
/// The child's stdin is the read end of `streams.stdin` if `redirect_stdin` is true;
/// otherwise the child gets no standard input at all (a null handle on Windows, a
/// closed descriptor 0 on Unix), which a child can tell apart from an empty stream.
/// On Unix the first file the child opens takes the lowest free descriptor, 0, and so
/// becomes its standard input; children that open files before checking their input
/// may then read from such a file.
/// The child's stdout and stderr are always the write ends of the respective pipes.
///
/// If `identity` is given, the child runs under that identity instead of the
/// caller's.
///
/// The parent's copies of the child ends are left open; the caller closes them with
/// [`StreamSet::close_child_ends`] once the child is running.
///
/// # Errors
///
/// * `CaptureError::ProcessCreation` if the child cannot be started, including when
///   the executable does not exist or the identity cannot be assumed.
pub fn launch(
    program: &str,
    arguments: &str,
    streams: &StreamSet,
    redirect_stdin: bool,
    window_mode: WindowMode,
    identity: Option<&Identity>,
) -> Result<ChildHandle, CaptureError> {
    os::os_launch(
        program.as_ref(),
        arguments,
        streams,
        redirect_stdin,
        window_mode,
        identity,
    )
    .map_err(|source| CaptureError::ProcessCreation {
        program: program.to_owned(),
        source,
    })
}

fn child_end<'a>(end: Option<&'a std::fs::File>, which: &str) -> io::Result<&'a std::fs::File> {
    end.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("child {} end of the pipe is already closed", which),
        )
    })
}

#[cfg(unix)]
pub(crate) mod os {
    use super::*;

    use crate::posix;
    use std::ffi::OsString;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;

    /// A Unix user and group to run the child as.
    ///
    /// Before executing the program the child sets its supplementary groups to `gid`
    /// alone, then calls `setgid()` and `setuid()`, so a privileged caller's groups
    /// never carry over. An unprivileged caller running as its own identity keeps its
    /// groups. Switching to another user normally requires the caller to be privileged.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct Identity {
        pub uid: u32,
        pub gid: u32,
    }

    impl Identity {
        pub fn new(uid: u32, gid: u32) -> Identity {
            Identity { uid, gid }
        }

        /// The real user and group of the calling process.
        pub fn current() -> Identity {
            Identity {
                uid: posix::getuid(),
                gid: posix::getgid(),
            }
        }
    }

    /// Read exactly N bytes, or return None on immediate EOF. A partial read is an
    /// error.
    fn read_exact_or_eof<const N: usize>(source: &mut File) -> io::Result<Option<[u8; N]>> {
        let mut buf = [0u8; N];
        let mut total_read = 0;
        while total_read < N {
            let n = match source.read(&mut buf[total_read..]) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if n == 0 {
                break;
            }
            total_read += n;
        }
        match total_read {
            0 => Ok(None),
            n if n == N => Ok(Some(buf)),
            _ => Err(io::ErrorKind::UnexpectedEof.into()),
        }
    }

    fn split_arguments(program: &OsStr, arguments: &str) -> io::Result<Vec<OsString>> {
        let words =
            shlex::split(arguments).ok_or_else(|| io::Error::from_raw_os_error(posix::EINVAL))?;
        Ok(std::iter::once(program.to_owned())
            .chain(words.into_iter().map(OsString::from))
            .collect())
    }

    pub(crate) fn os_launch(
        program: &OsStr,
        arguments: &str,
        streams: &StreamSet,
        redirect_stdin: bool,
        _window_mode: WindowMode,
        identity: Option<&Identity>,
    ) -> io::Result<ChildHandle> {
        let stdin_fd = if redirect_stdin {
            Some(child_end(streams.stdin.read_end(), "stdin")?.as_raw_fd())
        } else {
            None
        };
        let stdout_fd = child_end(streams.stdout.write_end(), "stdout")?.as_raw_fd();
        let stderr_fd = child_end(streams.stderr.write_end(), "stderr")?.as_raw_fd();

        let argv = split_arguments(program, arguments)?;
        let just_exec = posix::prep_exec(program, &argv)?;

        let (mut exec_fail_read, mut exec_fail_write) = posix::pipe()?;

        let pid = match unsafe { posix::fork()? } {
            Some(pid) => pid,
            None => {
                drop(exec_fail_read);
                let err = do_exec(&just_exec, stdin_fd, stdout_fd, stderr_fd, identity);
                let error_code = err.raw_os_error().unwrap_or(-1) as u32;
                exec_fail_write.write_all(&error_code.to_le_bytes()).ok();
                posix::_exit(127);
            }
        };

        drop(exec_fail_write);
        match read_exact_or_eof::<4>(&mut exec_fail_read)? {
            None => Ok(ChildHandle::new(pid, ())),
            Some(error_buf) => {
                // The child has already exited; reap it so it does not linger.
                posix::waitpid(pid, 0).ok();
                let error_code = u32::from_le_bytes(error_buf);
                Err(io::Error::from_raw_os_error(error_code as i32))
            }
        }
    }

    fn dup2_if_needed(fd: i32, target_fd: i32) -> io::Result<()> {
        if fd != target_fd {
            posix::dup2(fd, target_fd)
        } else {
            // dup2() would have cleared close-on-exec on the duplicate
            posix::set_cloexec_fd(fd, false)
        }
    }

    // Runs in the forked child: no allocation, only async-signal-safe calls.
    fn do_exec(
        just_exec: &posix::PreparedExec,
        stdin_fd: Option<i32>,
        stdout_fd: i32,
        stderr_fd: i32,
        identity: Option<&Identity>,
    ) -> io::Error {
        let setup = || -> io::Result<()> {
            match stdin_fd {
                Some(fd) => dup2_if_needed(fd, 0)?,
                None => {
                    if let Err(e) = posix::close(0)
                        && e.raw_os_error() != Some(posix::EBADF)
                    {
                        return Err(e);
                    }
                }
            }
            dup2_if_needed(stdout_fd, 1)?;
            dup2_if_needed(stderr_fd, 2)?;
            posix::reset_sigpipe()?;
            if let Some(identity) = identity {
                // An unprivileged caller cannot drop groups, but may keep its own.
                if let Err(e) = posix::setgroups_single(identity.gid) {
                    let keeps_own = e.raw_os_error() == Some(posix::EPERM)
                        && *identity == Identity::current();
                    if !keeps_own {
                        return Err(e);
                    }
                }
                posix::setgid(identity.gid)?;
                posix::setuid(identity.uid)?;
            }
            Ok(())
        };
        match setup() {
            Ok(()) => just_exec.exec(),
            Err(e) => e,
        }
    }
}

#[cfg(windows)]
pub(crate) mod os {
    use super::*;

    use crate::process::os::ExtProcessState;
    use crate::win32;
    use std::ffi::OsString;
    use std::os::windows::ffi::{OsStrExt, OsStringExt};
    use std::os::windows::io::RawHandle;

    /// A Windows primary access token to create the child with.
    ///
    /// The child is started with `CreateProcessAsUserW`. The token is borrowed: the
    /// caller keeps ownership and must keep it open for the duration of the run.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct Identity {
        token: RawHandle,
    }

    impl Identity {
        /// Wrap a primary token handle.
        ///
        /// # Safety
        ///
        /// `token` must be a valid primary token handle with the access rights
        /// `CreateProcessAsUserW` requires, and must stay open while the identity is
        /// used.
        pub unsafe fn from_raw_token(token: RawHandle) -> Identity {
            Identity { token }
        }

        pub fn as_raw_token(&self) -> RawHandle {
            self.token
        }
    }

    pub(crate) fn os_launch(
        program: &OsStr,
        arguments: &str,
        streams: &StreamSet,
        redirect_stdin: bool,
        window_mode: WindowMode,
        identity: Option<&Identity>,
    ) -> io::Result<ChildHandle> {
        let stdin = if redirect_stdin {
            Some(child_end(streams.stdin.read_end(), "stdin")?)
        } else {
            None
        };
        let stdout = child_end(streams.stdout.write_end(), "stdout")?;
        let stderr = child_end(streams.stderr.write_end(), "stderr")?;

        let cmdline = assemble_cmdline(program, arguments)?;
        let mut flags = win32::STARTF_USESTDHANDLES;
        let mut show_window = None;
        if window_mode == WindowMode::Hidden {
            flags |= win32::STARTF_USESHOWWINDOW;
            show_window = Some(win32::SW_HIDE as u16);
        }
        let (process, thread, pid) = win32::CreateProcess(
            program,
            &cmdline,
            identity.map(Identity::as_raw_token),
            win32::StartupHandles {
                stdin,
                stdout: Some(stdout),
                stderr: Some(stderr),
            },
            flags,
            show_window,
        )?;
        Ok(ChildHandle::new(pid, ExtProcessState { process, thread }))
    }

    fn assemble_cmdline(program: &OsStr, arguments: &str) -> io::Result<OsString> {
        if program.encode_wide().any(|c| c == 0) || arguments.contains('\0') {
            return Err(io::Error::from_raw_os_error(
                win32::ERROR_INVALID_PARAMETER as i32,
            ));
        }
        let mut cmdline = vec![];
        append_quoted(program, &mut cmdline);
        if !arguments.is_empty() {
            cmdline.push(' ' as u16);
            cmdline.extend(OsStr::new(arguments).encode_wide());
        }
        Ok(OsString::from_wide(&cmdline))
    }

    // Quote the program name the way the MSVC runtime parses argv[0].
    fn append_quoted(arg: &OsStr, cmdline: &mut Vec<u16>) {
        if !arg.is_empty()
            && !arg
                .encode_wide()
                .any(|c| c == ' ' as u16 || c == '\t' as u16 || c == '"' as u16)
        {
            cmdline.extend(arg.encode_wide());
            return;
        }
        cmdline.push('"' as u16);
        cmdline.extend(arg.encode_wide().filter(|&c| c != '"' as u16));
        cmdline.push('"' as u16);
    }
}
