#![allow(non_snake_case)]

use std::ffi::OsStr;
use std::fs::File;
use std::io::{Error, Result};
use std::iter;
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, RawHandle};
use std::ptr;
use std::time::Duration;

use winapi::shared::minwindef::{BOOL, DWORD, LPVOID, TRUE};
use winapi::um::handleapi::{CloseHandle, SetHandleInformation as WinSetHandleInformation};
use winapi::um::minwinbase::SECURITY_ATTRIBUTES;
use winapi::um::namedpipeapi::{CreatePipe as WinCreatePipe, PeekNamedPipe as WinPeekNamedPipe};
use winapi::um::processthreadsapi::{
    CreateProcessAsUserW, CreateProcessW, GetExitCodeProcess as WinGetExitCodeProcess,
    PROCESS_INFORMATION, STARTUPINFOW, TerminateProcess as WinTerminateProcess,
};
use winapi::um::synchapi::WaitForSingleObject as WinWaitForSingleObject;
use winapi::um::winbase::{INFINITE, WAIT_FAILED, WAIT_OBJECT_0};
use winapi::um::winnt::HANDLE;

pub use winapi::shared::winerror::{
    ERROR_ACCESS_DENIED, ERROR_FILE_NOT_FOUND, ERROR_INVALID_PARAMETER, ERROR_PROCESS_ABORTED,
    WAIT_TIMEOUT,
};
pub use winapi::um::winbase::{HANDLE_FLAG_INHERIT, STARTF_USESHOWWINDOW, STARTF_USESTDHANDLES};
pub use winapi::um::winuser::SW_HIDE;

/// Owned kernel handle, closed exactly once on drop.
#[derive(Debug)]
pub struct Handle(RawHandle);

impl Drop for Handle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0 as HANDLE);
        }
    }
}

impl AsRawHandle for Handle {
    fn as_raw_handle(&self) -> RawHandle {
        self.0
    }
}

impl FromRawHandle for Handle {
    unsafe fn from_raw_handle(handle: RawHandle) -> Handle {
        Handle(handle)
    }
}

// Process and thread handles are usable from any thread.
unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

fn check(status: BOOL) -> Result<()> {
    if status != 0 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

fn to_nullterm(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(iter::once(0u16)).collect()
}

/// Create an anonymous pipe whose handles are both inheritable.
pub fn CreatePipe() -> Result<(File, File)> {
    let mut attributes = SECURITY_ATTRIBUTES {
        nLength: mem::size_of::<SECURITY_ATTRIBUTES>() as DWORD,
        lpSecurityDescriptor: ptr::null_mut(),
        bInheritHandle: TRUE,
    };
    let (mut r, mut w): (HANDLE, HANDLE) = (ptr::null_mut(), ptr::null_mut());
    check(unsafe { WinCreatePipe(&mut r, &mut w, &mut attributes, 0) })?;
    Ok(unsafe {
        (
            File::from_raw_handle(r as RawHandle),
            File::from_raw_handle(w as RawHandle),
        )
    })
}

pub fn SetHandleInformation(handle: &File, mask: u32, flags: u32) -> Result<()> {
    check(unsafe { WinSetHandleInformation(handle.as_raw_handle() as HANDLE, mask, flags) })
}

/// Bytes queued in the pipe, without removing them.
pub fn PeekNamedPipe(handle: &File) -> Result<u32> {
    let mut available: DWORD = 0;
    check(unsafe {
        WinPeekNamedPipe(
            handle.as_raw_handle() as HANDLE,
            ptr::null_mut(),
            0,
            ptr::null_mut(),
            &mut available,
            ptr::null_mut(),
        )
    })?;
    Ok(available)
}

fn raw_or_null(handle: Option<&File>) -> HANDLE {
    handle.map_or(ptr::null_mut(), |f| f.as_raw_handle() as HANDLE)
}

pub struct StartupHandles<'a> {
    pub stdin: Option<&'a File>,
    pub stdout: Option<&'a File>,
    pub stderr: Option<&'a File>,
}

/// Call `CreateProcessW`, or `CreateProcessAsUserW` when `token` is given.
///
/// Returns the process and primary thread handles and the PID.
pub fn CreateProcess(
    appname: &OsStr,
    cmdline: &OsStr,
    token: Option<RawHandle>,
    handles: StartupHandles<'_>,
    sinfo_flags: u32,
    show_window: Option<u16>,
) -> Result<(Handle, Handle, u32)> {
    let mut sinfo: STARTUPINFOW = unsafe { mem::zeroed() };
    sinfo.cb = mem::size_of::<STARTUPINFOW>() as DWORD;
    sinfo.hStdInput = raw_or_null(handles.stdin);
    sinfo.hStdOutput = raw_or_null(handles.stdout);
    sinfo.hStdError = raw_or_null(handles.stderr);
    sinfo.dwFlags = sinfo_flags;
    if let Some(show) = show_window {
        sinfo.wShowWindow = show;
    }
    let mut pinfo: PROCESS_INFORMATION = unsafe { mem::zeroed() };
    let wc_appname = to_nullterm(appname);
    let mut wc_cmdline = to_nullterm(cmdline);
    check(unsafe {
        match token {
            Some(token) => CreateProcessAsUserW(
                token as HANDLE,
                wc_appname.as_ptr(),
                wc_cmdline.as_mut_ptr(),
                ptr::null_mut(),           // lpProcessAttributes
                ptr::null_mut(),           // lpThreadAttributes
                TRUE,                      // bInheritHandles
                0,                         // dwCreationFlags
                ptr::null_mut() as LPVOID, // lpEnvironment
                ptr::null(),               // lpCurrentDirectory
                &mut sinfo,
                &mut pinfo,
            ),
            None => CreateProcessW(
                wc_appname.as_ptr(),
                wc_cmdline.as_mut_ptr(),
                ptr::null_mut(),
                ptr::null_mut(),
                TRUE,
                0,
                ptr::null_mut() as LPVOID,
                ptr::null(),
                &mut sinfo,
                &mut pinfo,
            ),
        }
    })?;
    unsafe {
        Ok((
            Handle::from_raw_handle(pinfo.hProcess as RawHandle),
            Handle::from_raw_handle(pinfo.hThread as RawHandle),
            pinfo.dwProcessId,
        ))
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum WaitEvent {
    OBJECT_0,
    TIMEOUT,
}

pub fn WaitForSingleObject(handle: &Handle, timeout: Option<Duration>) -> Result<WaitEvent> {
    let millis = timeout
        .map(|t| t.as_millis().min((INFINITE - 1) as u128) as DWORD)
        .unwrap_or(INFINITE);
    match unsafe { WinWaitForSingleObject(handle.as_raw_handle() as HANDLE, millis) } {
        WAIT_OBJECT_0 => Ok(WaitEvent::OBJECT_0),
        WAIT_TIMEOUT => Ok(WaitEvent::TIMEOUT),
        WAIT_FAILED => Err(Error::last_os_error()),
        other => Err(Error::other(format!(
            "WaitForSingleObject returned {}",
            other
        ))),
    }
}

pub fn GetExitCodeProcess(handle: &Handle) -> Result<u32> {
    let mut exit_code: DWORD = 0;
    check(unsafe { WinGetExitCodeProcess(handle.as_raw_handle() as HANDLE, &mut exit_code) })?;
    Ok(exit_code)
}

pub fn TerminateProcess(handle: &Handle, exit_code: u32) -> Result<()> {
    check(unsafe { WinTerminateProcess(handle.as_raw_handle() as HANDLE, exit_code) })
}
