//! Coalescing-stream backend
//!
//! One FSEvents stream covers every registered root. It is scheduled on the
//! watcher thread's CFRunLoop, so its callback runs on the watcher thread while
//! [`RunLoop::wait`] spins the loop. The callback only copies each batch into a
//! thread-local queue; decoding and dispatch to the per-root watch points
//! happen once the loop returns.
//!
//! The root set of a stream is fixed at creation, so registering or
//! unregistering a root recreates the stream, resuming from the last observed
//! event id. The old stream is flushed first and its batches are decoded
//! against the root set they were produced for. That cycle lives in
//! [`StreamSet`]; this module supplies the FSEvents side of it.
//!
//! Watch points on this backend are logical: the stream owns the native
//! resources, so `listen` and `cancel` have nothing to do.

#![allow(non_upper_case_globals, non_snake_case)]

use crate::coalesce::{StreamFactory, StreamSet};
use crate::registry::WatchRegistry;
use crate::server::{RunLoop, Waker};
use crate::watch_point::{Completion, NativeWatch, WatchStatus};
use fsevent_sys as fs;
use fsevent_sys::core_foundation as cf;
use fsw_core::fsevent::{RawEvent, WatchRoots};
use fsw_core::{ChangeEvent, EventSink};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::ffi::{c_void, CStr};
use std::io;
use std::path::{Path, PathBuf};
use std::ptr;
use std::time::Duration;
use tracing::{info, trace, warn};

type CFIndex = isize;
type CFHashCode = usize;

#[repr(C)]
struct CFRunLoopSourceContext {
    version: CFIndex,
    info: *mut c_void,
    retain: Option<extern "C" fn(*const c_void) -> *const c_void>,
    release: Option<extern "C" fn(*const c_void)>,
    copy_description: Option<extern "C" fn(*const c_void) -> cf::CFRef>,
    equal: Option<extern "C" fn(*const c_void, *const c_void) -> cf::Boolean>,
    hash: Option<extern "C" fn(*const c_void) -> CFHashCode>,
    schedule: Option<extern "C" fn(*mut c_void, cf::CFRunLoopRef, cf::CFRef)>,
    cancel: Option<extern "C" fn(*mut c_void, cf::CFRunLoopRef, cf::CFRef)>,
    perform: Option<extern "C" fn(*mut c_void)>,
}

#[link(name = "CoreFoundation", kind = "framework")]
extern "C" {
    fn CFRetain(cf: cf::CFRef) -> cf::CFRef;
    fn CFRunLoopSourceCreate(
        allocator: cf::CFRef,
        order: CFIndex,
        context: *mut CFRunLoopSourceContext,
    ) -> cf::CFRef;
    fn CFRunLoopAddSource(rl: cf::CFRunLoopRef, source: cf::CFRef, mode: cf::CFRef);
    fn CFRunLoopSourceInvalidate(source: cf::CFRef);
    fn CFRunLoopSourceSignal(source: cf::CFRef);
    fn CFRunLoopWakeUp(rl: cf::CFRunLoopRef);
    fn CFRunLoopRunInMode(
        mode: cf::CFRef,
        seconds: cf::CFTimeInterval,
        return_after_source_handled: cf::Boolean,
    ) -> i32;
}

/// Effectively forever; the wake source interrupts it
const RUN_SECONDS: cf::CFTimeInterval = 1.0e10;

thread_local! {
    static BATCHES: RefCell<VecDeque<Vec<RawEvent>>> = RefCell::new(VecDeque::new());
}

extern "C" fn on_wake(_: *mut c_void) {}

extern "C" fn on_events(
    _stream: fs::FSEventStreamRef,
    _info: *mut c_void,
    num_events: usize,
    event_paths: *mut c_void,
    event_flags: *const fs::FSEventStreamEventFlags,
    event_ids: *const fs::FSEventStreamEventId,
) {
    // Must not unwind into CoreFoundation
    let paths = event_paths as *const *const std::os::raw::c_char;
    let mut batch = Vec::with_capacity(num_events);
    for i in 0..num_events {
        // SAFETY: FSEvents hands us `num_events` entries in each array
        let (path, flags, id) = unsafe {
            (
                CStr::from_ptr(*paths.add(i)).to_string_lossy().into_owned(),
                *event_flags.add(i),
                *event_ids.add(i),
            )
        };
        batch.push(RawEvent { path, flags, id });
    }
    BATCHES.with(|queue| queue.borrow_mut().push_back(batch));
}

/// Logical watch point; the shared stream does the native work
pub struct RootRegistration;

impl NativeWatch for RootRegistration {
    fn listen(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn cancel(&mut self) -> io::Result<bool> {
        Ok(true)
    }
}

struct Stream(fs::FSEventStreamRef);

impl Stream {
    fn create(
        roots: &WatchRoots,
        since: u64,
        latency: Duration,
        run_loop: cf::CFRunLoopRef,
    ) -> io::Result<Self> {
        // SAFETY: CF calls on objects we create and release here
        unsafe {
            let paths =
                cf::CFArrayCreateMutable(cf::kCFAllocatorDefault, 0, &cf::kCFTypeArrayCallBacks);
            for root in roots.iter() {
                let mut err: cf::CFErrorRef = ptr::null_mut();
                let cf_path =
                    cf::str_path_to_cfstring_ref(&root.canonical.to_string_lossy(), &mut err);
                if cf_path.is_null() {
                    cf::CFRelease(err as cf::CFRef);
                    cf::CFRelease(paths);
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("couldn't convert '{}'", root.canonical.display()),
                    ));
                }
                cf::CFArrayAppendValue(paths, cf_path);
                cf::CFRelease(cf_path);
            }

            let context = fs::FSEventStreamContext {
                version: 0,
                info: ptr::null_mut(),
                retain: None,
                release: None,
                copy_description: None,
            };
            let stream = fs::FSEventStreamCreate(
                cf::kCFAllocatorDefault,
                on_events,
                &context,
                paths,
                since,
                latency.as_secs_f64(),
                fs::kFSEventStreamCreateFlagNoDefer
                    | fs::kFSEventStreamCreateFlagFileEvents
                    | fs::kFSEventStreamCreateFlagWatchRoot,
            );
            cf::CFRelease(paths);
            if stream.is_null() {
                return Err(io::Error::new(io::ErrorKind::Other, "FSEventStreamCreate failed"));
            }

            fs::FSEventStreamScheduleWithRunLoop(stream, run_loop, cf::kCFRunLoopDefaultMode);
            if fs::FSEventStreamStart(stream) == 0 {
                fs::FSEventStreamInvalidate(stream);
                fs::FSEventStreamRelease(stream);
                return Err(io::Error::new(io::ErrorKind::Other, "FSEventStreamStart failed"));
            }
            Ok(Self(stream))
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // SAFETY: stream is started and scheduled on this thread's run loop;
        // flushing delivers outstanding batches to the callback synchronously
        unsafe {
            fs::FSEventStreamFlushSync(self.0);
            fs::FSEventStreamStop(self.0);
            fs::FSEventStreamInvalidate(self.0);
            fs::FSEventStreamRelease(self.0);
        }
    }
}

fn take_batches() -> Vec<Vec<RawEvent>> {
    BATCHES.with(|queue| queue.borrow_mut().drain(..).collect())
}

/// FSEvents streams scheduled on the watcher thread's run loop
struct FsEventsFactory {
    latency: Duration,
    run_loop: cf::CFRunLoopRef,
}

impl StreamFactory for FsEventsFactory {
    type Stream = Stream;

    fn create(&mut self, roots: &WatchRoots, since: u64) -> io::Result<Stream> {
        Stream::create(roots, since, self.latency, self.run_loop)
    }

    fn retire(&mut self, stream: Stream) -> Vec<Vec<RawEvent>> {
        // Dropping flushes the stream into the queue
        drop(stream);
        take_batches()
    }
}

struct SourceWaker {
    source: cf::CFRef,
    run_loop: cf::CFRunLoopRef,
}

// SAFETY: signalling a source and waking a run loop are thread safe
unsafe impl Send for SourceWaker {}
unsafe impl Sync for SourceWaker {}

impl Waker for SourceWaker {
    fn wake(&self) -> io::Result<()> {
        // A signalled source stays signalled until the loop services it
        // SAFETY: both objects are retained by this waker
        unsafe {
            CFRunLoopSourceSignal(self.source);
            CFRunLoopWakeUp(self.run_loop);
        }
        Ok(())
    }
}

impl Drop for SourceWaker {
    fn drop(&mut self) {
        // SAFETY: balances the retains in `MacRunLoop::waker`
        unsafe {
            cf::CFRelease(self.source);
            cf::CFRelease(self.run_loop);
        }
    }
}

/// Run loop driving one coalescing stream
pub struct MacRunLoop {
    registry: WatchRegistry<RootRegistration>,
    streams: StreamSet<FsEventsFactory>,
    run_loop: cf::CFRunLoopRef,
    wake_source: cf::CFRef,
}

impl MacRunLoop {
    pub fn new(latency: Option<Duration>) -> io::Result<Self> {
        let mut context = CFRunLoopSourceContext {
            version: 0,
            info: ptr::null_mut(),
            retain: None,
            release: None,
            copy_description: None,
            equal: None,
            hash: None,
            schedule: None,
            cancel: None,
            perform: Some(on_wake),
        };
        // SAFETY: source is created and scheduled on the current thread
        let (run_loop, wake_source) = unsafe {
            let run_loop = cf::CFRunLoopGetCurrent();
            let source = CFRunLoopSourceCreate(cf::kCFAllocatorDefault, 0, &mut context);
            if source.is_null() {
                return Err(io::Error::new(io::ErrorKind::Other, "CFRunLoopSourceCreate failed"));
            }
            CFRunLoopAddSource(run_loop, source, cf::kCFRunLoopDefaultMode);
            (run_loop, source)
        };

        let factory = FsEventsFactory {
            latency: latency.unwrap_or(Duration::ZERO),
            run_loop,
        };
        Ok(Self {
            registry: WatchRegistry::new(),
            streams: StreamSet::new(factory),
            run_loop,
            wake_source,
        })
    }

    fn decode_queued(&mut self) {
        self.streams.decode(take_batches());
    }

    /// Deliver decoded batches, keeping global order and grouping runs of
    /// events for the same root into one completion
    fn deliver(&mut self, sink: &dyn EventSink) -> bool {
        let mut delivered = false;
        while let Some(batch) = self.streams.pop_batch() {
            delivered = true;
            let mut group: Vec<ChangeEvent> = Vec::new();
            let mut group_root: Option<PathBuf> = None;
            for (root, event) in batch.events {
                if group_root.as_deref() != Some(root.as_path()) {
                    if let Some(previous) = group_root.take() {
                        self.complete_root(&previous, std::mem::take(&mut group), sink);
                    }
                    group_root = Some(root);
                }
                group.push(event);
            }
            if let Some(root) = group_root {
                self.complete_root(&root, group, sink);
            }
        }
        delivered
    }

    fn complete_root(&mut self, root: &Path, events: Vec<ChangeEvent>, sink: &dyn EventSink) {
        match self.registry.id_for_root(root) {
            Some(id) => {
                self.registry.complete(id, Completion::Events(events), sink);
            }
            None => trace!("Dropping {} event(s) for unwatched '{}'", events.len(), root.display()),
        }
    }
}

impl RunLoop for MacRunLoop {
    fn waker(&self) -> io::Result<Box<dyn Waker>> {
        // SAFETY: retained for the waker's lifetime, released in its Drop
        let (source, run_loop) = unsafe { (CFRetain(self.wake_source), CFRetain(self.run_loop)) };
        Ok(Box::new(SourceWaker { source, run_loop }))
    }

    fn start_watching(&mut self, root: &Path) -> WatchStatus {
        if let Some(id) = self.registry.id_for_root(root) {
            return self
                .registry
                .get(id)
                .map(|p| p.status())
                .unwrap_or(WatchStatus::Finished);
        }

        let canonical = match std::fs::canonicalize(root) {
            Ok(canonical) if canonical.is_dir() => canonical,
            Ok(_) => {
                warn!("Couldn't start watching '{}': not a directory", root.display());
                return WatchStatus::FailedToListen;
            }
            Err(e) => {
                warn!("Couldn't start watching '{}': {}", root.display(), e);
                return WatchStatus::FailedToListen;
            }
        };

        // Batches queued since the last wait belong to the current root set
        self.decode_queued();
        if let Err(e) = self.streams.add_root(root.to_path_buf(), canonical) {
            warn!("Couldn't start watching '{}': {}", root.display(), e);
            return WatchStatus::FailedToListen;
        }
        self.registry.start(root, |_| RootRegistration)
    }

    fn stop_watching(&mut self, root: &Path) -> bool {
        if !self.registry.cancel(root) {
            return false;
        }
        self.decode_queued();
        self.streams.remove_root(root);
        true
    }

    fn stop_all(&mut self) {
        self.registry.cancel_all();
        self.streams.clear();
        info!("Stream stopped");
    }

    fn is_idle(&self) -> bool {
        self.registry.is_empty() && !self.streams.is_running()
    }

    fn wait(&mut self, sink: &dyn EventSink) -> io::Result<()> {
        // Batches left over from a stream recreation go out without blocking
        self.decode_queued();
        if self.deliver(sink) {
            return Ok(());
        }

        // SAFETY: runs this thread's own run loop
        unsafe {
            CFRunLoopRunInMode(cf::kCFRunLoopDefaultMode, RUN_SECONDS, 1);
        }

        self.decode_queued();
        self.deliver(sink);
        Ok(())
    }
}

impl Drop for MacRunLoop {
    fn drop(&mut self) {
        self.streams.clear();
        BATCHES.with(|queue| queue.borrow_mut().clear());
        // SAFETY: source was created in `new`; wakers hold their own retain
        unsafe {
            CFRunLoopSourceInvalidate(self.wake_source);
            cf::CFRelease(self.wake_source);
        }
    }
}
