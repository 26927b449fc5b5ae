//! Dedicated watcher thread and its request mailbox
//!
//! Every native handle is created, used and released on one thread. Callers
//! talk to it through a mailbox: push a request, wake the run loop, then block
//! on the request's response slot. The thread drains the mailbox in order
//! before every wait, so responses come back in the order requests were
//! accepted.

use crate::error::{Result, WatchError};
use crate::watch_point::WatchStatus;
use fsw_core::EventSink;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

const THREAD_NAME: &str = "fsw-watcher";

/// Interrupts a blocked [`RunLoop::wait`] from another thread.
///
/// A wake issued while the loop is not waiting must still interrupt the next
/// wait.
pub trait Waker: Send + Sync + 'static {
    fn wake(&self) -> io::Result<()>;
}

/// Platform side of the watcher thread
///
/// Constructed on the watcher thread and never leaves it.
pub trait RunLoop {
    /// Handle other threads use to interrupt [`RunLoop::wait`]
    fn waker(&self) -> io::Result<Box<dyn Waker>>;

    /// Register and arm a root; failure is reported as a status
    fn start_watching(&mut self, root: &Path) -> WatchStatus;

    /// Begin cancelling a root; returns whether it was registered
    fn stop_watching(&mut self, root: &Path) -> bool;

    /// Begin cancelling every root
    fn stop_all(&mut self);

    /// No watch point is still waiting for a native completion
    fn is_idle(&self) -> bool;

    /// Block until native completions or a wake arrive, delivering decoded
    /// changes to the sink.
    fn wait(&mut self, sink: &dyn EventSink) -> io::Result<()>;
}

#[derive(Debug)]
enum Request {
    StartWatching(PathBuf),
    StopWatching(PathBuf),
    Terminate,
}

#[derive(Debug)]
enum Response {
    Status(WatchStatus),
    Stopped(bool),
    Terminated,
    Terminating,
}

/// Single-use reply cell a caller blocks on
#[derive(Default)]
struct ResponseSlot {
    value: Mutex<Option<Response>>,
    ready: Condvar,
}

impl ResponseSlot {
    fn fill(&self, response: Response) {
        let mut value = self.value.lock();
        if value.is_none() {
            *value = Some(response);
            self.ready.notify_all();
        }
    }

    fn wait(&self) -> Response {
        let mut value = self.value.lock();
        loop {
            if let Some(response) = value.take() {
                return response;
            }
            // Spurious wakeups just loop
            self.ready.wait(&mut value);
        }
    }
}

struct Envelope {
    request: Request,
    reply: Arc<ResponseSlot>,
}

#[derive(Default)]
struct MailboxState {
    requests: VecDeque<Envelope>,
    closed: bool,
}

#[derive(Default)]
struct Mailbox {
    state: Mutex<MailboxState>,
}

impl Mailbox {
    fn push(&self, request: Request) -> Option<Arc<ResponseSlot>> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        let reply = Arc::new(ResponseSlot::default());
        state.requests.push_back(Envelope {
            request,
            reply: reply.clone(),
        });
        Some(reply)
    }

    /// Take back a request the thread has not picked up yet
    fn withdraw(&self, reply: &Arc<ResponseSlot>) -> bool {
        let mut state = self.state.lock();
        let before = state.requests.len();
        state.requests.retain(|e| !Arc::ptr_eq(&e.reply, reply));
        state.requests.len() != before
    }

    fn drain(&self) -> Vec<Envelope> {
        self.state.lock().requests.drain(..).collect()
    }
}

/// Closes the mailbox when the watcher thread leaves its loop, panics
/// included, and answers everything still queued.
struct MailboxGuard {
    mailbox: Arc<Mailbox>,
}

impl Drop for MailboxGuard {
    fn drop(&mut self) {
        let pending = {
            let mut state = self.mailbox.state.lock();
            state.closed = true;
            state.requests.drain(..).collect::<Vec<_>>()
        };
        for envelope in pending {
            envelope.reply.fill(Response::Terminating);
        }
    }
}

/// Handle to the watcher thread
pub struct Server {
    mailbox: Arc<Mailbox>,
    waker: Box<dyn Waker>,
    thread: Option<JoinHandle<()>>,
}

impl Server {
    /// Spawn the watcher thread and wait until its run loop is ready.
    ///
    /// `factory` runs on the new thread. The sink moves there too and is
    /// dropped when the thread exits.
    pub fn start<R, F, S>(factory: F, sink: S) -> Result<Self>
    where
        R: RunLoop,
        F: FnOnce() -> io::Result<R> + Send + 'static,
        S: EventSink,
    {
        let mailbox = Arc::new(Mailbox::default());
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<io::Result<Box<dyn Waker>>>(1);

        let thread_mailbox = mailbox.clone();
        let thread = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                let guard = MailboxGuard {
                    mailbox: thread_mailbox,
                };
                let mut run_loop = match factory().and_then(|rl| rl.waker().map(|w| (rl, w))) {
                    Ok((rl, waker)) => {
                        if ready_tx.send(Ok(waker)).is_err() {
                            return;
                        }
                        rl
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                drop(ready_tx);

                serve(&guard.mailbox, &mut run_loop, &sink);

                // Native handles go first, then the sink; the guard answers
                // stragglers last
                drop(run_loop);
                drop(sink);
                debug!("Watcher thread exiting");
            })
            .map_err(WatchError::ThreadSpawn)?;

        match ready_rx.recv() {
            Ok(Ok(waker)) => {
                info!("Watcher thread started");
                Ok(Self {
                    mailbox,
                    waker,
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(WatchError::RunLoop(e))
            }
            Err(_) => match thread.join() {
                Ok(()) => Err(WatchError::ThreadStartup),
                Err(_) => Err(WatchError::ThreadPanicked),
            },
        }
    }

    fn call(&self, request: Request) -> Result<Response> {
        let reply = self.mailbox.push(request).ok_or(WatchError::Terminating)?;
        if let Err(e) = self.waker.wake() {
            if self.mailbox.withdraw(&reply) {
                return Err(WatchError::Dispatch(e));
            }
            // Already picked up; it will be answered
            warn!("Wake failed after request was taken: {}", e);
        }
        match reply.wait() {
            Response::Terminating => Err(WatchError::Terminating),
            response => Ok(response),
        }
    }

    pub fn start_watching(&self, root: &Path) -> Result<WatchStatus> {
        match self.call(Request::StartWatching(root.to_path_buf()))? {
            Response::Status(status) => Ok(status),
            other => unexpected(other),
        }
    }

    pub fn stop_watching(&self, root: &Path) -> Result<bool> {
        match self.call(Request::StopWatching(root.to_path_buf()))? {
            Response::Stopped(stopped) => Ok(stopped),
            other => unexpected(other),
        }
    }

    /// Stop every watch, wait for the thread to release everything and exit.
    ///
    /// Once this returns the sink has been dropped and will not be called again.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        match self.call(Request::Terminate) {
            Ok(_) | Err(WatchError::Terminating) => {}
            Err(e) => {
                // Without a wake the thread never sees the request
                error!("Failed to stop watcher thread: {}", e);
                return Err(e);
            }
        }
        thread.join().map_err(|_| WatchError::ThreadPanicked)?;
        info!("Watcher thread stopped");
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.thread.is_some() {
            if let Err(e) = self.shutdown() {
                warn!("Watch engine dropped without clean shutdown: {}", e);
            }
        }
    }
}

fn unexpected<T>(response: Response) -> Result<T> {
    error!("Unexpected response from watcher thread: {:?}", response);
    Err(WatchError::Terminating)
}

fn serve<R: RunLoop>(mailbox: &Mailbox, run_loop: &mut R, sink: &dyn EventSink) {
    let mut terminating = false;
    loop {
        for envelope in mailbox.drain() {
            let response = match envelope.request {
                Request::StartWatching(_) if terminating => Response::Terminating,
                Request::StartWatching(root) => Response::Status(run_loop.start_watching(&root)),
                Request::StopWatching(root) => Response::Stopped(run_loop.stop_watching(&root)),
                Request::Terminate => {
                    if !terminating {
                        debug!("Terminate requested, cancelling all watches");
                        terminating = true;
                        run_loop.stop_all();
                    }
                    Response::Terminated
                }
            };
            envelope.reply.fill(response);
        }

        if terminating && run_loop.is_idle() {
            break;
        }

        if let Err(e) = run_loop.wait(sink) {
            error!("Watcher run loop failed: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{WatchId, WatchRegistry};
    use crate::watch_point::{Completion, NativeWatch};
    use ahash::AHashMap;
    use fsw_core::{ChangeEvent, ChangeKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Shared between the test and the scripted loop
    #[derive(Default)]
    struct Script {
        completions: Mutex<VecDeque<(WatchId, Completion)>>,
        ids: Mutex<AHashMap<PathBuf, WatchId>>,
        woken: Mutex<bool>,
        cond: Condvar,
        live: AtomicUsize,
    }

    impl Script {
        /// Deliver a completion to the most recent watch point of `root`
        fn complete(&self, root: &str, completion: Completion) {
            let id = self.ids.lock()[Path::new(root)];
            self.completions.lock().push_back((id, completion));
            self.signal();
        }

        fn signal(&self) {
            *self.woken.lock() = true;
            self.cond.notify_all();
        }
    }

    struct ScriptWaker(Arc<Script>);

    impl Waker for ScriptWaker {
        fn wake(&self) -> io::Result<()> {
            self.0.signal();
            Ok(())
        }
    }

    struct ScriptedWatch {
        id: WatchId,
        root: PathBuf,
        script: Arc<Script>,
    }

    impl NativeWatch for ScriptedWatch {
        fn listen(&mut self) -> io::Result<()> {
            if self.root.to_string_lossy().contains("missing") {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such directory"));
            }
            Ok(())
        }

        fn cancel(&mut self) -> io::Result<bool> {
            // Cancellation completes later, like an aborted overlapped read
            self.script
                .completions
                .lock()
                .push_back((self.id, Completion::Cancelled));
            Ok(false)
        }
    }

    impl Drop for ScriptedWatch {
        fn drop(&mut self) {
            self.script.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct ScriptedLoop {
        script: Arc<Script>,
        registry: WatchRegistry<ScriptedWatch>,
    }

    impl RunLoop for ScriptedLoop {
        fn waker(&self) -> io::Result<Box<dyn Waker>> {
            Ok(Box::new(ScriptWaker(self.script.clone())))
        }

        fn start_watching(&mut self, root: &Path) -> WatchStatus {
            let script = self.script.clone();
            self.registry.start(root, |id| {
                script.live.fetch_add(1, Ordering::SeqCst);
                script.ids.lock().insert(root.to_path_buf(), id);
                ScriptedWatch {
                    id,
                    root: root.to_path_buf(),
                    script,
                }
            })
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
            {
                let mut woken = self.script.woken.lock();
                while !*woken && self.script.completions.lock().is_empty() {
                    self.script.cond.wait(&mut woken);
                }
                *woken = false;
            }
            let batch: Vec<_> = self.script.completions.lock().drain(..).collect();
            for (id, completion) in batch {
                self.registry.complete(id, completion, sink);
            }
            Ok(())
        }
    }

    fn start_scripted() -> (Server, Arc<Script>, crossbeam_channel::Receiver<ChangeEvent>) {
        let script = Arc::new(Script::default());
        let (tx, rx) = crossbeam_channel::unbounded();
        let loop_script = script.clone();
        let server = Server::start(
            move || {
                Ok(ScriptedLoop {
                    script: loop_script,
                    registry: WatchRegistry::new(),
                })
            },
            tx,
        )
        .unwrap();
        (server, script, rx)
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_partial_start_failure() {
        let (server, script, _rx) = start_scripted();

        assert_eq!(server.start_watching(Path::new("/a")).unwrap(), WatchStatus::Listening);
        assert_eq!(
            server.start_watching(Path::new("/missing")).unwrap(),
            WatchStatus::FailedToListen
        );
        assert_eq!(server.start_watching(Path::new("/b")).unwrap(), WatchStatus::Listening);
        assert_eq!(script.live.load(Ordering::SeqCst), 2);

        server.close().unwrap();
        assert_eq!(script.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_events_delivered_in_order() {
        let (server, script, rx) = start_scripted();
        server.start_watching(Path::new("/a")).unwrap();

        script.complete(
            "/a",
            Completion::Events(vec![
                ChangeEvent::new(ChangeKind::Removed, "/a/f"),
                ChangeEvent::new(ChangeKind::Created, "/a/f"),
            ]),
        );
        script.complete("/a", Completion::Overflow);

        assert_eq!(
            rx.recv_timeout(TIMEOUT).unwrap(),
            ChangeEvent::new(ChangeKind::Removed, "/a/f")
        );
        assert_eq!(
            rx.recv_timeout(TIMEOUT).unwrap(),
            ChangeEvent::new(ChangeKind::Created, "/a/f")
        );
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), ChangeEvent::invalidate("/a"));

        server.close().unwrap();
    }

    #[test]
    fn test_close_releases_handles_and_drops_sink() {
        let (server, script, rx) = start_scripted();
        server.start_watching(Path::new("/a")).unwrap();
        server.start_watching(Path::new("/b")).unwrap();

        server.close().unwrap();

        assert_eq!(script.live.load(Ordering::SeqCst), 0);
        // Sink was the only sender
        assert!(matches!(
            rx.recv_timeout(Duration::from_millis(100)),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected)
        ));
    }

    #[test]
    fn test_stale_completion_after_stop_is_dropped() {
        let (server, script, rx) = start_scripted();
        server.start_watching(Path::new("/a")).unwrap();
        assert!(server.stop_watching(Path::new("/a")).unwrap());
        assert!(!server.stop_watching(Path::new("/never")).unwrap());

        script.complete(
            "/a",
            Completion::Events(vec![ChangeEvent::new(ChangeKind::Created, "/a/late")]),
        );
        // Round trip through the mailbox so the loop has consumed the script
        server.start_watching(Path::new("/c")).unwrap();

        assert!(rx.try_recv().is_err());
        server.close().unwrap();
        assert_eq!(script.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_run_loop_init_failure_is_reported() {
        let result = Server::start(
            || -> io::Result<ScriptedLoop> { Err(io::Error::new(io::ErrorKind::Other, "no loop")) },
            |_: ChangeKind, _: &Path| {},
        );
        assert!(matches!(result, Err(WatchError::RunLoop(_))));
    }

    #[test]
    fn test_drop_without_close_shuts_down() {
        let (server, script, rx) = start_scripted();
        server.start_watching(Path::new("/a")).unwrap();
        drop(server);

        assert_eq!(script.live.load(Ordering::SeqCst), 0);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_requests_after_thread_exit_fail_fast() {
        let mailbox = Arc::new(Mailbox::default());
        let pending = mailbox.push(Request::StopWatching(PathBuf::from("/a"))).unwrap();
        drop(MailboxGuard {
            mailbox: mailbox.clone(),
        });

        assert!(matches!(pending.wait(), Response::Terminating));
        assert!(mailbox.push(Request::Terminate).is_none());
    }
}
