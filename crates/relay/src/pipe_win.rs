//! Concrete [`PipeOpener`]/[`PipeEndpoint`] backed by real Windows named
//! pipes, reached over SMB by naming the remote host in the UNC path.
//!
//! Matches the access mask and open disposition called out for the pipe
//! endpoint: generic read/write, EA and attribute read/write, read-control
//! and synchronize, opened against an existing file with normal attributes.
//! I/O is overlapped so `read`/`write` can honor the caller's timeout
//! instead of blocking forever on a stalled remote.

use std::ffi::c_void;
use std::time::Duration;

use relay_transport::{PipeEndpoint, PipeIoError, PipeOpener};
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_BROKEN_PIPE, ERROR_IO_PENDING, ERROR_PIPE_NOT_CONNECTED,
    GENERIC_READ, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadFile, WriteFile, FILE_ATTRIBUTE_NORMAL, FILE_FLAG_OVERLAPPED,
    FILE_READ_ATTRIBUTES, FILE_READ_EA, FILE_SHARE_READ, FILE_SHARE_WRITE, FILE_WRITE_ATTRIBUTES,
    FILE_WRITE_EA, OPEN_EXISTING, READ_CONTROL, SYNCHRONIZE,
};
use windows_sys::Win32::System::IO::{CancelIoEx, GetOverlappedResultEx, OVERLAPPED};
use windows_sys::Win32::System::Threading::{CreateEventW, WaitForSingleObject};

const DESIRED_ACCESS: u32 = GENERIC_READ
    | GENERIC_WRITE
    | FILE_READ_EA
    | FILE_WRITE_EA
    | FILE_READ_ATTRIBUTES
    | FILE_WRITE_ATTRIBUTES
    | READ_CONTROL
    | SYNCHRONIZE;

const READ_CHUNK: usize = 64 * 1024;

/// Opens named pipes by handing `CreateFileW` the UNC path built by the
/// caller (`\\<host>\pipe\<name>`). One attempt per call; polling for the
/// pipe's availability is the transport's job.
pub struct WindowsPipeOpener;

impl PipeOpener for WindowsPipeOpener {
    fn open(&self, name: &str) -> Result<Box<dyn PipeEndpoint>, PipeIoError> {
        let wide = to_wide(name);
        let handle = unsafe {
            CreateFileW(
                wide.as_ptr(),
                DESIRED_ACCESS,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                std::ptr::null(),
                OPEN_EXISTING,
                FILE_ATTRIBUTE_NORMAL | FILE_FLAG_OVERLAPPED,
                0,
            )
        };

        if handle == INVALID_HANDLE_VALUE {
            return Err(PipeIoError::Io(std::io::Error::last_os_error()));
        }

        Ok(Box::new(WindowsPipeEndpoint::new(handle)))
    }
}

struct WindowsPipeEndpoint {
    handle: HANDLE,
}

// The handle is only ever touched from the single thread that owns this
// endpoint (the pipe transport's read or write worker), never shared.
unsafe impl Send for WindowsPipeEndpoint {}

impl WindowsPipeEndpoint {
    fn new(handle: HANDLE) -> Self {
        Self { handle }
    }
}

impl PipeEndpoint for WindowsPipeEndpoint {
    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, PipeIoError> {
        let mut buf = vec![0u8; READ_CHUNK];
        let mut overlapped = OverlappedGuard::new()?;
        let mut read = 0u32;

        let ok = unsafe {
            ReadFile(
                self.handle,
                buf.as_mut_ptr() as *mut c_void,
                buf.len() as u32,
                std::ptr::null_mut(),
                overlapped.as_mut_ptr(),
            )
        };

        if ok == 0 {
            let err = unsafe { GetLastError() };
            if err != ERROR_IO_PENDING {
                return Err(map_terminal_error(err));
            }
        }

        match overlapped.await_completion(self.handle, timeout, &mut read)? {
            true => {
                buf.truncate(read as usize);
                Ok(buf)
            }
            false => Err(PipeIoError::Timeout),
        }
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), PipeIoError> {
        let mut overlapped = OverlappedGuard::new()?;
        let mut written = 0u32;

        let ok = unsafe {
            WriteFile(
                self.handle,
                data.as_ptr() as *const c_void,
                data.len() as u32,
                std::ptr::null_mut(),
                overlapped.as_mut_ptr(),
            )
        };

        if ok == 0 {
            let err = unsafe { GetLastError() };
            if err != ERROR_IO_PENDING {
                return Err(map_terminal_error(err));
            }
        }

        match overlapped.await_completion(self.handle, timeout, &mut written)? {
            true if written as usize == data.len() => Ok(()),
            true => Err(PipeIoError::Io(std::io::Error::other("short write on named pipe"))),
            false => Err(PipeIoError::Timeout),
        }
    }

    fn close(&mut self) {
        unsafe {
            CloseHandle(self.handle);
        }
        self.handle = INVALID_HANDLE_VALUE;
    }
}

impl Drop for WindowsPipeEndpoint {
    fn drop(&mut self) {
        if self.handle != INVALID_HANDLE_VALUE {
            unsafe {
                CloseHandle(self.handle);
            }
        }
    }
}

/// Owns one `OVERLAPPED` struct and its completion event for the lifetime
/// of a single `ReadFile`/`WriteFile` call.
struct OverlappedGuard {
    overlapped: Box<OVERLAPPED>,
    event: HANDLE,
}

impl OverlappedGuard {
    fn new() -> Result<Self, PipeIoError> {
        let event = unsafe { CreateEventW(std::ptr::null(), 1, 0, std::ptr::null()) };
        if event.is_null() {
            return Err(PipeIoError::Io(std::io::Error::last_os_error()));
        }

        let mut overlapped: Box<OVERLAPPED> = Box::new(unsafe { std::mem::zeroed() });
        overlapped.hEvent = event;

        Ok(Self { overlapped, event })
    }

    fn as_mut_ptr(&mut self) -> *mut OVERLAPPED {
        &mut *self.overlapped
    }

    /// Waits for the pending I/O to finish within `timeout`. Returns
    /// `Ok(true)` with `bytes` set on completion, `Ok(false)` on timeout
    /// (after cancelling the I/O), or an error for anything else.
    fn await_completion(
        &mut self,
        handle: HANDLE,
        timeout: Duration,
        bytes: &mut u32,
    ) -> Result<bool, PipeIoError> {
        let millis = timeout.as_millis().min(u32::MAX as u128) as u32;
        let wait = unsafe { WaitForSingleObject(self.event, millis) };

        if wait == WAIT_TIMEOUT {
            unsafe {
                CancelIoEx(handle, self.as_mut_ptr());
            }
            return Ok(false);
        }
        if wait != WAIT_OBJECT_0 {
            return Err(PipeIoError::Io(std::io::Error::last_os_error()));
        }

        let ok = unsafe { GetOverlappedResultEx(handle, self.as_mut_ptr(), bytes, 0, 0) };
        if ok == 0 {
            let err = unsafe { GetLastError() };
            return Err(map_terminal_error(err));
        }

        Ok(true)
    }
}

impl Drop for OverlappedGuard {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.event);
        }
    }
}

fn map_terminal_error(err: u32) -> PipeIoError {
    match err {
        ERROR_BROKEN_PIPE | ERROR_PIPE_NOT_CONNECTED => PipeIoError::Closed,
        _ => PipeIoError::Io(std::io::Error::from_raw_os_error(err as i32)),
    }
}

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}
