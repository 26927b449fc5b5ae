//! Inode-notification backend
//!
//! One recursive `notify` watcher per root. Watcher callbacks run on notify's
//! own thread and only forward `(WatchId, event)` pairs over a channel; all
//! decoding and watch point state changes happen on the watcher thread in
//! [`RunLoop::wait`].

use crate::registry::{WatchId, WatchRegistry};
use crate::server::{RunLoop, Waker};
use crate::watch_point::{Completion, NativeWatch, WatchStatus};
use crossbeam_channel::{Receiver, Sender};
use fsw_core::{ChangeEvent, ChangeKind, EventSink};
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, trace, warn};

type Notification = (WatchId, notify::Result<Event>);

/// Native half of one root
pub struct NotifyWatch {
    id: WatchId,
    root: PathBuf,
    events: Sender<Notification>,
    watcher: Option<RecommendedWatcher>,
    /// Set once the root itself was deleted or moved away
    root_gone: bool,
}

impl NotifyWatch {
    fn new(id: WatchId, root: &Path, events: Sender<Notification>) -> Self {
        Self {
            id,
            root: root.to_path_buf(),
            events,
            watcher: None,
            root_gone: false,
        }
    }
}

impl NativeWatch for NotifyWatch {
    fn listen(&mut self) -> io::Result<()> {
        // Inotify drops its watch along with the root, so a later directory
        // under the same name is not covered by this watcher
        if self.root_gone || !self.root.is_dir() {
            self.watcher = None;
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("'{}' is not a directory", self.root.display()),
            ));
        }
        // Inotify watches stay armed between reads
        if self.watcher.is_some() {
            return Ok(());
        }

        let id = self.id;
        let events = self.events.clone();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            if events.send((id, result)).is_err() {
                trace!("Watcher thread gone, dropping notification");
            }
        })
        .map_err(into_io)?;
        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(into_io)?;

        self.watcher = Some(watcher);
        Ok(())
    }

    fn cancel(&mut self) -> io::Result<bool> {
        // Dropping the watcher removes the inotify watches and joins its thread
        self.watcher = None;
        Ok(true)
    }
}

fn into_io(err: notify::Error) -> io::Error {
    match err.kind {
        notify::ErrorKind::Io(e) => e,
        notify::ErrorKind::PathNotFound => {
            io::Error::new(io::ErrorKind::NotFound, "path not found")
        }
        other => io::Error::new(io::ErrorKind::Other, format!("{:?}", other)),
    }
}

/// Whether `event` says the watched root itself went away
pub fn removes_root(root: &Path, event: &Event) -> bool {
    let removal = matches!(
        event.kind,
        EventKind::Remove(_)
            | EventKind::Modify(ModifyKind::Name(RenameMode::From | RenameMode::Any))
    );
    removal && event.paths.iter().any(|p| p == root)
}

/// Translate one notify event into a completion for `root`
pub fn map_event(root: &Path, event: Event, exists: impl Fn(&Path) -> bool) -> Completion {
    if event.need_rescan() {
        return Completion::Overflow;
    }

    let mut changes = Vec::with_capacity(event.paths.len());
    let mut push = |kind: ChangeKind, path: &Path| {
        debug!("Change detected: {} '{}'", kind, path.display());
        changes.push(ChangeEvent::new(kind, path));
    };

    match event.kind {
        EventKind::Access(_) => {}
        EventKind::Create(_) => {
            for path in &event.paths {
                push(ChangeKind::Created, path);
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                push(ChangeKind::Removed, path);
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in &event.paths {
                push(ChangeKind::Removed, path);
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for path in &event.paths {
                push(ChangeKind::Created, path);
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = event.paths.iter();
            if let Some(from) = paths.next() {
                push(ChangeKind::Removed, from);
            }
            for to in paths {
                push(ChangeKind::Created, to);
            }
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            for path in &event.paths {
                let kind = if exists(path) {
                    ChangeKind::Created
                } else {
                    ChangeKind::Removed
                };
                push(kind, path);
            }
        }
        EventKind::Modify(_) => {
            for path in &event.paths {
                push(ChangeKind::Modified, path);
            }
        }
        EventKind::Any | EventKind::Other => {
            if event.paths.is_empty() {
                push(ChangeKind::Unknown, root);
            }
            for path in &event.paths {
                push(ChangeKind::Unknown, path);
            }
        }
    }

    Completion::Events(changes)
}

struct ChannelWaker(Sender<()>);

impl Waker for ChannelWaker {
    fn wake(&self) -> io::Result<()> {
        // Unbounded, so a wake sent before the loop blocks is never lost
        self.0
            .send(())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "watcher thread gone"))
    }
}

/// Run loop over per-root notify watchers
pub struct LinuxRunLoop {
    registry: WatchRegistry<NotifyWatch>,
    events_tx: Sender<Notification>,
    events_rx: Receiver<Notification>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl LinuxRunLoop {
    /// Latency has no meaning for inotify; it is accepted and ignored.
    pub fn new(_latency: Option<Duration>) -> io::Result<Self> {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let (wake_tx, wake_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            registry: WatchRegistry::new(),
            events_tx,
            events_rx,
            wake_tx,
            wake_rx,
        })
    }

    fn dispatch(&mut self, (id, result): Notification, sink: &dyn EventSink) {
        let Some(root) = self.registry.get(id).map(|p| p.root().to_path_buf()) else {
            trace!("Dropping notification for unknown watch {:?}", id);
            return;
        };
        let completion = match result {
            Ok(event) => {
                if removes_root(&root, &event) {
                    debug!("Root '{}' went away", root.display());
                    let native = self.registry.get_mut(id).and_then(|p| p.native_mut());
                    if let Some(native) = native {
                        native.root_gone = true;
                    }
                }
                map_event(&root, event, |p| p.exists())
            }
            Err(e) => {
                warn!("Watch error under '{}': {}", root.display(), e);
                Completion::Overflow
            }
        };
        self.registry.complete(id, completion, sink);
    }
}

impl RunLoop for LinuxRunLoop {
    fn waker(&self) -> io::Result<Box<dyn Waker>> {
        Ok(Box::new(ChannelWaker(self.wake_tx.clone())))
    }

    fn start_watching(&mut self, root: &Path) -> WatchStatus {
        let events = self.events_tx.clone();
        self.registry
            .start(root, |id| NotifyWatch::new(id, root, events))
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
        crossbeam_channel::select! {
            recv(self.wake_rx) -> _ => {}
            recv(self.events_rx) -> msg => {
                if let Ok(notification) = msg {
                    self.dispatch(notification, sink);
                }
            }
        }

        // Drain what is already queued so one wake covers a burst
        while let Ok(notification) = self.events_rx.try_recv() {
            self.dispatch(notification, sink);
        }
        while self.wake_rx.try_recv().is_ok() {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, DataChange, Flag, RemoveKind};

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for path in paths {
            event = event.add_path(PathBuf::from(path));
        }
        event
    }

    fn changes(completion: Completion) -> Vec<ChangeEvent> {
        match completion {
            Completion::Events(events) => events,
            other => panic!("expected events, got {:?}", other),
        }
    }

    #[test]
    fn test_create_remove_modify() {
        let root = Path::new("/w");
        let never = |_: &Path| -> bool { panic!("existence check not expected") };

        assert_eq!(
            changes(map_event(root, event(EventKind::Create(CreateKind::File), &["/w/a"]), never)),
            vec![ChangeEvent::new(ChangeKind::Created, "/w/a")]
        );
        assert_eq!(
            changes(map_event(root, event(EventKind::Remove(RemoveKind::Any), &["/w/a"]), never)),
            vec![ChangeEvent::new(ChangeKind::Removed, "/w/a")]
        );
        assert_eq!(
            changes(map_event(
                root,
                event(EventKind::Modify(ModifyKind::Data(DataChange::Content)), &["/w/a"]),
                never
            )),
            vec![ChangeEvent::new(ChangeKind::Modified, "/w/a")]
        );
        assert!(changes(map_event(
            root,
            event(EventKind::Access(AccessKind::Any), &["/w/a"]),
            never
        ))
        .is_empty());
    }

    #[test]
    fn test_rename_both_is_remove_then_create() {
        let completion = map_event(
            Path::new("/w"),
            event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["/w/old", "/w/new"],
            ),
            |_| panic!("existence check not expected"),
        );
        assert_eq!(
            changes(completion),
            vec![
                ChangeEvent::new(ChangeKind::Removed, "/w/old"),
                ChangeEvent::new(ChangeKind::Created, "/w/new"),
            ]
        );
    }

    #[test]
    fn test_ambiguous_rename_uses_existence() {
        let completion = map_event(
            Path::new("/w"),
            event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Any)),
                &["/w/here", "/w/gone"],
            ),
            |p| p.ends_with("here"),
        );
        assert_eq!(
            changes(completion),
            vec![
                ChangeEvent::new(ChangeKind::Created, "/w/here"),
                ChangeEvent::new(ChangeKind::Removed, "/w/gone"),
            ]
        );
    }

    #[test]
    fn test_rescan_is_overflow() {
        let rescan = Event::new(EventKind::Other).set_flag(Flag::Rescan);
        assert_eq!(map_event(Path::new("/w"), rescan, |_| true), Completion::Overflow);
    }

    #[test]
    fn test_unknown_without_paths_reports_root() {
        assert_eq!(
            changes(map_event(Path::new("/w"), event(EventKind::Other, &[]), |_| true)),
            vec![ChangeEvent::new(ChangeKind::Unknown, "/w")]
        );
    }

    #[test]
    fn test_root_removal_is_detected() {
        let root = Path::new("/w");
        assert!(removes_root(root, &event(EventKind::Remove(RemoveKind::Folder), &["/w"])));
        assert!(removes_root(
            root,
            &event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &["/w"])
        ));
        assert!(!removes_root(root, &event(EventKind::Remove(RemoveKind::File), &["/w/a"])));
        assert!(!removes_root(root, &event(EventKind::Create(CreateKind::Folder), &["/w"])));
    }

    #[test]
    fn test_rearm_after_root_removal_fails() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        let (tx, _rx) = crossbeam_channel::unbounded();

        let mut watch = NotifyWatch::new(WatchId::from_raw(1), &root, tx);
        watch.listen().unwrap();
        assert!(watch.listen().is_ok());

        std::fs::remove_dir(&root).unwrap();
        std::fs::create_dir(&root).unwrap();
        watch.root_gone = true;
        assert!(watch.listen().is_err());
        assert!(watch.watcher.is_none());
    }

    #[test]
    fn test_missing_root_fails_to_listen() {
        let dir = tempfile::tempdir().unwrap();
        let mut run_loop = LinuxRunLoop::new(None).unwrap();
        let missing = dir.path().join("missing");

        assert_eq!(run_loop.start_watching(&missing), WatchStatus::FailedToListen);
        assert!(run_loop.is_idle());
        assert_eq!(run_loop.start_watching(dir.path()), WatchStatus::Listening);
        assert!(!run_loop.is_idle());

        assert!(run_loop.stop_watching(dir.path()));
        assert!(run_loop.is_idle());
    }
}
