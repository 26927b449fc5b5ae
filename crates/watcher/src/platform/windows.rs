//! Directory-change backend
//!
//! Each root gets a directory handle opened for overlapped I/O and one
//! outstanding `ReadDirectoryChangesW` with a completion routine. The watcher
//! thread sleeps alertably; completion routines and wake APCs run on it during
//! that sleep. The routine only records `(WatchId, error, bytes)` in a
//! thread-local queue; decoding happens after the sleep returns, before the
//! read is re-issued into the same buffer.
//!
//! The id travels in `OVERLAPPED::hEvent`, which completion routines leave to
//! the caller. A completion whose id is no longer registered is dropped.

use crate::registry::{WatchId, WatchRegistry};
use crate::server::{RunLoop, Waker};
use crate::watch_point::{Completion, NativeWatch, WatchStatus};
use fsw_core::{codec, record, EventSink};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::mem;
use std::path::Path;
use std::ptr;
use std::time::Duration;
use tracing::{debug, error, trace, warn};
use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_OPERATION_ABORTED, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadDirectoryChangesW, FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED,
    FILE_LIST_DIRECTORY, FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_CREATION,
    FILE_NOTIFY_CHANGE_DIR_NAME, FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_WRITE,
    FILE_NOTIFY_CHANGE_SIZE, FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::IO::{CancelIo, OVERLAPPED};
use windows_sys::Win32::System::Threading::{
    GetCurrentThread, GetCurrentThreadId, OpenThread, QueueUserAPC, SetThreadPriority, SleepEx,
    INFINITE, THREAD_PRIORITY_ABOVE_NORMAL, THREAD_SET_CONTEXT,
};

/// Change buffer size in bytes
pub const BUFFER_SIZE: usize = 64 * 1024;

const NOTIFY_FILTER: u32 = FILE_NOTIFY_CHANGE_FILE_NAME
    | FILE_NOTIFY_CHANGE_DIR_NAME
    | FILE_NOTIFY_CHANGE_ATTRIBUTES
    | FILE_NOTIFY_CHANGE_SIZE
    | FILE_NOTIFY_CHANGE_LAST_WRITE
    | FILE_NOTIFY_CHANGE_CREATION;

struct RawCompletion {
    id: WatchId,
    error: u32,
    bytes: u32,
}

thread_local! {
    static COMPLETIONS: RefCell<VecDeque<RawCompletion>> = RefCell::new(VecDeque::new());
}

unsafe extern "system" fn on_completion(error: u32, bytes: u32, overlapped: *mut OVERLAPPED) {
    if overlapped.is_null() {
        return;
    }
    let id = WatchId::from_raw((*overlapped).hEvent as u64);
    COMPLETIONS.with(|queue| {
        queue.borrow_mut().push_back(RawCompletion { id, error, bytes });
    });
}

unsafe extern "system" fn on_wake(_: usize) {}

fn wide(path: &str) -> Vec<u16> {
    path.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Native half of one root
pub struct DirectoryWatch {
    native_root: String,
    handle: HANDLE,
    overlapped: Box<OVERLAPPED>,
    // u32 elements keep the buffer DWORD-aligned
    buffer: Box<[u32]>,
    pending: bool,
}

impl DirectoryWatch {
    fn open(id: WatchId, root: &Path) -> Self {
        let native_root = codec::to_native(&root.to_string_lossy()).into_owned();
        // SAFETY: all-zero is a valid OVERLAPPED
        let mut overlapped: Box<OVERLAPPED> = Box::new(unsafe { mem::zeroed() });
        overlapped.hEvent = id.as_raw() as HANDLE;

        let name = wide(&native_root);
        // SAFETY: `name` is NUL-terminated and outlives the call
        let handle = unsafe {
            CreateFileW(
                name.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                0,
            )
        };

        Self {
            native_root,
            handle,
            overlapped,
            buffer: vec![0u32; BUFFER_SIZE / mem::size_of::<u32>()].into_boxed_slice(),
            pending: false,
        }
    }

    fn close_handle(&mut self) {
        if self.handle != INVALID_HANDLE_VALUE {
            // SAFETY: handle came from CreateFileW and is closed once
            unsafe { CloseHandle(self.handle) };
            self.handle = INVALID_HANDLE_VALUE;
        }
    }

    /// Decode a finished read. Must run before the read is re-issued.
    fn take(&mut self, error: u32, bytes: u32) -> Completion {
        self.pending = false;
        if error == ERROR_OPERATION_ABORTED {
            return Completion::Cancelled;
        }
        if error != 0 {
            debug!("Read completed with error {} for '{}'", error, self.native_root);
        }
        if bytes == 0 {
            return Completion::Overflow;
        }
        let len = (bytes as usize).min(BUFFER_SIZE);
        // SAFETY: the buffer is BUFFER_SIZE bytes and no read is outstanding
        let data = unsafe { std::slice::from_raw_parts(self.buffer.as_ptr().cast::<u8>(), len) };
        Completion::Events(record::decode_notify_buffer(&self.native_root, data))
    }
}

impl NativeWatch for DirectoryWatch {
    fn listen(&mut self) -> io::Result<()> {
        if self.handle == INVALID_HANDLE_VALUE {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("couldn't open '{}'", self.native_root),
            ));
        }
        // SAFETY: buffer and OVERLAPPED are heap-pinned and stay alive until
        // the completion for this read has been taken
        let ok = unsafe {
            ReadDirectoryChangesW(
                self.handle,
                self.buffer.as_mut_ptr().cast(),
                BUFFER_SIZE as u32,
                1,
                NOTIFY_FILTER,
                ptr::null_mut(),
                &mut *self.overlapped,
                Some(on_completion),
            )
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        self.pending = true;
        Ok(())
    }

    fn cancel(&mut self) -> io::Result<bool> {
        if self.handle == INVALID_HANDLE_VALUE {
            return Ok(!self.pending);
        }
        // SAFETY: valid handle owned by this watch
        let cancelled = unsafe { CancelIo(self.handle) };
        let result = if cancelled == 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(!self.pending)
        };
        self.close_handle();
        result
    }
}

impl Drop for DirectoryWatch {
    fn drop(&mut self) {
        self.close_handle();
        if self.pending {
            // The kernel may still write here; leaking beats a use after free
            error!("Releasing '{}' with a read in flight", self.native_root);
            mem::forget(mem::take(&mut self.buffer));
            mem::forget(mem::replace(&mut self.overlapped, Box::new(unsafe { mem::zeroed() })));
        }
    }
}

struct ApcWaker {
    thread: HANDLE,
}

// SAFETY: thread handles may be used from any thread
unsafe impl Send for ApcWaker {}
unsafe impl Sync for ApcWaker {}

impl Waker for ApcWaker {
    fn wake(&self) -> io::Result<()> {
        // Queued APCs stay queued until the next alertable wait
        // SAFETY: handle has THREAD_SET_CONTEXT access
        if unsafe { QueueUserAPC(Some(on_wake), self.thread, 0) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for ApcWaker {
    fn drop(&mut self) {
        // SAFETY: handle came from OpenThread
        unsafe { CloseHandle(self.thread) };
    }
}

/// Run loop sleeping alertably on the watcher thread
pub struct WindowsRunLoop {
    registry: WatchRegistry<DirectoryWatch>,
}

impl WindowsRunLoop {
    /// Latency has no meaning for directory reads; it is accepted and ignored.
    pub fn new(_latency: Option<Duration>) -> io::Result<Self> {
        // SAFETY: pseudo handle for the calling thread
        if unsafe { SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_ABOVE_NORMAL) } == 0 {
            warn!(
                "Couldn't raise watcher thread priority: {}",
                io::Error::last_os_error()
            );
        }
        Ok(Self {
            registry: WatchRegistry::new(),
        })
    }

    fn drain_completions(&mut self, sink: &dyn EventSink) {
        while let Some(raw) = COMPLETIONS.with(|queue| queue.borrow_mut().pop_front()) {
            let Some(point) = self.registry.get_mut(raw.id) else {
                trace!("Dropping completion for unknown watch {:?}", raw.id);
                continue;
            };
            let Some(native) = point.native_mut() else {
                continue;
            };
            let completion = native.take(raw.error, raw.bytes);
            self.registry.complete(raw.id, completion, sink);
        }
    }
}

impl RunLoop for WindowsRunLoop {
    fn waker(&self) -> io::Result<Box<dyn Waker>> {
        // SAFETY: opens a real handle to the calling (watcher) thread
        let thread = unsafe { OpenThread(THREAD_SET_CONTEXT, 0, GetCurrentThreadId()) };
        if thread == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Box::new(ApcWaker { thread }))
    }

    fn start_watching(&mut self, root: &Path) -> WatchStatus {
        self.registry
            .start(root, |id| DirectoryWatch::open(id, root))
    }

    fn stop_watching(&mut self, root: &Path) -> bool {
        self.registry.cancel(root)
    }

    fn stop_all(&mut self) {
        self.registry.cancel_all();
    }

    fn is_idle(&self) -> bool {
        self.registry.is_empty()
    }

    fn wait(&mut self, sink: &dyn EventSink) -> io::Result<()> {
        // SAFETY: alertable sleep; completion routines and APCs run inside
        unsafe { SleepEx(INFINITE, 1) };
        self.drain_completions(sink);
        Ok(())
    }
}
