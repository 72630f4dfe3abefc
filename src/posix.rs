use std::env;
use std::ffi::{CString, OsStr, OsString};
use std::fs::File;
use std::io::{Error, Result};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::PathBuf;
use std::ptr;

pub use libc::{EBADF, EINVAL, EPERM, ESRCH, SIGKILL};

fn check_err<T: Ord + Default>(num: T) -> Result<T> {
    if num < T::default() {
        return Err(Error::last_os_error());
    }
    Ok(num)
}

/// Create a pipe whose ends are both close-on-exec.
///
/// The child receives its ends through `dup2()` onto the standard descriptors, which
/// clears the flag on the duplicate, so no pipe end leaks into other children forked
/// while this one is being set up.
pub fn pipe() -> Result<(File, File)> {
    let mut fds = [0 as libc::c_int; 2];
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    {
        check_err(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
    }
    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    )))]
    {
        check_err(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    }
    let (read, write) = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };
    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    )))]
    {
        set_cloexec(&read, true)?;
        set_cloexec(&write, true)?;
    }
    Ok((read, write))
}

pub fn set_cloexec(f: &File, cloexec: bool) -> Result<()> {
    set_cloexec_fd(f.as_raw_fd(), cloexec)
}

pub fn set_cloexec_fd(fd: i32, cloexec: bool) -> Result<()> {
    let old = check_err(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    let new = if cloexec {
        old | libc::FD_CLOEXEC
    } else {
        old & !libc::FD_CLOEXEC
    };
    if new != old {
        check_err(unsafe { libc::fcntl(fd, libc::F_SETFD, new) })?;
    }
    Ok(())
}

#[cfg(test)]
pub fn is_cloexec(f: &File) -> Result<bool> {
    let flags = check_err(unsafe { libc::fcntl(f.as_raw_fd(), libc::F_GETFD) })?;
    Ok(flags & libc::FD_CLOEXEC != 0)
}

/// Number of bytes queued for reading on `f`, without consuming them.
pub fn bytes_available(f: &File) -> Result<usize> {
    let mut avail: libc::c_int = 0;
    check_err(unsafe { libc::ioctl(f.as_raw_fd(), libc::FIONREAD, &mut avail) })?;
    Ok(avail as usize)
}

/// Fork the process. Returns `Some(pid)` in the parent and `None` in the child.
///
/// # Safety
///
/// The child of a multi-threaded parent may only perform async-signal-safe operations
/// until it calls `exec` or `_exit`.
pub unsafe fn fork() -> Result<Option<u32>> {
    let pid = check_err(unsafe { libc::fork() })?;
    if pid == 0 {
        Ok(None)
    } else {
        Ok(Some(pid as u32))
    }
}

fn os_to_cstring(s: &OsStr) -> Result<CString> {
    CString::new(s.as_bytes()).map_err(|_| Error::from_raw_os_error(libc::EINVAL))
}

#[derive(Debug)]
struct CVec {
    // Owned C strings; `ptrs` points into them.
    #[allow(dead_code)]
    strings: Vec<CString>,
    ptrs: Vec<*const libc::c_char>,
}

impl CVec {
    fn new<S: AsRef<OsStr>>(slice: &[S]) -> Result<CVec> {
        let strings = slice
            .iter()
            .map(|x| os_to_cstring(x.as_ref()))
            .collect::<Result<Vec<CString>>>()?;
        let ptrs = strings
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect();
        Ok(CVec { strings, ptrs })
    }

    fn as_c_vec(&self) -> *const *const libc::c_char {
        self.ptrs.as_ptr()
    }
}

/// Locate `program` in `PATH` unless it already names a path.
fn resolve_program(program: &OsStr) -> OsString {
    if program.is_empty() || program.as_bytes().contains(&b'/') {
        return program.to_owned();
    }
    let Some(path) = env::var_os("PATH") else {
        return program.to_owned();
    };
    env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate: &PathBuf| {
            candidate
                .metadata()
                .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
        .map(PathBuf::into_os_string)
        .unwrap_or_else(|| program.to_owned())
}

/// Everything `execv()` needs, allocated before `fork()` so that the child does not
/// have to allocate.
#[derive(Debug)]
pub struct PreparedExec {
    path: CString,
    argv: CVec,
}

pub fn prep_exec<S: AsRef<OsStr>>(program: &OsStr, argv: &[S]) -> Result<PreparedExec> {
    Ok(PreparedExec {
        path: os_to_cstring(&resolve_program(program))?,
        argv: CVec::new(argv)?,
    })
}

impl PreparedExec {
    /// Replace the current process image. Only returns on failure.
    pub fn exec(&self) -> Error {
        unsafe {
            libc::execv(self.path.as_ptr(), self.argv.as_c_vec());
        }
        Error::last_os_error()
    }
}

pub fn _exit(status: u8) -> ! {
    unsafe { libc::_exit(status as libc::c_int) }
}

pub const WNOHANG: i32 = libc::WNOHANG;

pub fn waitpid(pid: u32, flags: i32) -> Result<(u32, i32)> {
    let mut status = 0 as libc::c_int;
    let pid = check_err(unsafe {
        libc::waitpid(
            pid as libc::pid_t,
            &mut status as *mut libc::c_int,
            flags as libc::c_int,
        )
    })?;
    Ok((pid as u32, status))
}

/// Translate a raw wait status into a shell-style exit code.
pub fn decode_exit_code(status: i32) -> u32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status) as u32
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status) as u32
    } else {
        status as u32
    }
}

pub fn kill(pid: u32, signal: i32) -> Result<()> {
    check_err(unsafe { libc::kill(pid as libc::pid_t, signal) })?;
    Ok(())
}

pub fn dup2(oldfd: i32, newfd: i32) -> Result<()> {
    check_err(unsafe { libc::dup2(oldfd, newfd) })?;
    Ok(())
}

pub fn close(fd: i32) -> Result<()> {
    check_err(unsafe { libc::close(fd) })?;
    Ok(())
}

pub fn setuid(uid: u32) -> Result<()> {
    check_err(unsafe { libc::setuid(uid as libc::uid_t) })?;
    Ok(())
}

/// Replace the supplementary group list with `gid` alone.
pub fn setgroups_single(gid: u32) -> Result<()> {
    let groups = [gid as libc::gid_t];
    check_err(unsafe { libc::setgroups(groups.len() as _, groups.as_ptr()) })?;
    Ok(())
}

pub fn setgid(gid: u32) -> Result<()> {
    check_err(unsafe { libc::setgid(gid as libc::gid_t) })?;
    Ok(())
}

pub fn getuid() -> u32 {
    unsafe { libc::getuid() as u32 }
}

pub fn getgid() -> u32 {
    unsafe { libc::getgid() as u32 }
}

pub fn reset_sigpipe() -> Result<()> {
    // libstd ignores SIGPIPE and signal-handling libraries often set a mask. The
    // child inherits both, and most programs expect the defaults.
    unsafe {
        let mut set = std::mem::MaybeUninit::<libc::sigset_t>::uninit();
        check_err(libc::sigemptyset(set.as_mut_ptr()))?;
        let set = set.assume_init();
        let rc = libc::pthread_sigmask(libc::SIG_SETMASK, &set, ptr::null_mut());
        if rc != 0 {
            return Err(Error::from_raw_os_error(rc));
        }
        if libc::signal(libc::SIGPIPE, libc::SIG_DFL) == libc::SIG_ERR {
            return Err(Error::last_os_error());
        }
    }
    Ok(())
}
