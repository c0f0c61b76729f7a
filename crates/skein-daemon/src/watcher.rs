//! Cross-platform file watcher for the two skein directories.
//!
//! Wraps a `notify` OS watcher and reduces its event stream to the three
//! operations the sync pipeline cares about: create, modify, delete. Exactly
//! the two named directories are watched (not their subdirectories), only
//! `.json` filenames pass the filter, and renames surface as a delete of the
//! old name plus a create of the new one. Debouncing is deliberately absent
//! — that is the daemon's job.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use skein_core::{Error, Result};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Which directory an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Task,
    Dep,
}

/// The reduced file operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOp {
    Create,
    Modify,
    Delete,
}

/// One observed change to a task or dependency file.
#[derive(Debug, Clone)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: WatchKind,
    pub op: FileOp,
}

/// A watched directory in both its given and canonical spelling, since OS
/// backends report whichever they prefer.
#[derive(Debug, Clone)]
pub(crate) struct DirMatch {
    given: PathBuf,
    canonical: PathBuf,
}

impl DirMatch {
    pub(crate) fn new(dir: &Path) -> Self {
        Self {
            given: dir.to_path_buf(),
            canonical: dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf()),
        }
    }

    pub(crate) fn contains(&self, path: &Path) -> bool {
        match path.parent() {
            Some(parent) => parent == self.given || parent == self.canonical,
            None => false,
        }
    }
}

/// Watches the tasks and deps directories and emits [`FileEvent`]s.
///
/// Lifecycle: `new` → `start` (once) → `stop` (terminal). The two output
/// channels are handed to a single consumer via [`FileWatcher::take_events`]
/// and [`FileWatcher::take_errors`].
pub struct FileWatcher {
    tasks_dir: PathBuf,
    deps_dir: PathBuf,
    watcher: Option<RecommendedWatcher>,
    forward: Option<tokio::task::JoinHandle<()>>,
    events_rx: Option<mpsc::Receiver<FileEvent>>,
    errors_rx: Option<mpsc::Receiver<Error>>,
    running: Arc<AtomicBool>,
    started: bool,
}

impl FileWatcher {
    pub fn new(tasks_dir: &Path, deps_dir: &Path) -> Self {
        Self {
            tasks_dir: tasks_dir.to_path_buf(),
            deps_dir: deps_dir.to_path_buf(),
            watcher: None,
            forward: None,
            events_rx: None,
            errors_rx: None,
            running: Arc::new(AtomicBool::new(false)),
            started: false,
        }
    }

    /// Safe to call from any thread at any time.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Attach the OS watches and begin forwarding events.
    ///
    /// May be called once; any later call (including after `stop`) fails
    /// with [`Error::AlreadyRunning`].
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::AlreadyRunning);
        }
        self.started = true;

        let (fs_tx, fs_rx) = std::sync::mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel(256);
        let (error_tx, error_rx) = mpsc::channel(16);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                let _ = fs_tx.send(res);
            },
            Config::default(),
        )
        .map_err(|e| Error::Watcher(e.to_string()))?;

        watcher
            .watch(&self.tasks_dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Watcher(e.to_string()))?;
        watcher
            .watch(&self.deps_dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Watcher(e.to_string()))?;

        info!("Watching tasks: {}", self.tasks_dir.display());
        info!("Watching deps: {}", self.deps_dir.display());

        let tasks = DirMatch::new(&self.tasks_dir);
        let deps = DirMatch::new(&self.deps_dir);
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        // The OS callback feeds a std channel; this loop drains it and owns
        // the output senders. Dropping the watcher closes the std channel,
        // which drains the loop and in turn closes both outputs.
        let forward = tokio::task::spawn_blocking(move || {
            while let Ok(res) = fs_rx.recv() {
                match res {
                    Ok(event) => {
                        for file_event in translate(&event, &tasks, &deps) {
                            debug!(
                                "File event: {:?} {:?} {}",
                                file_event.kind,
                                file_event.op,
                                file_event.path.display()
                            );
                            if event_tx.blocking_send(file_event).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = error_tx.blocking_send(Error::Watcher(e.to_string()));
                    }
                }
            }
        });

        self.watcher = Some(watcher);
        self.forward = Some(forward);
        self.events_rx = Some(event_rx);
        self.errors_rx = Some(error_rx);

        Ok(())
    }

    /// Take the events stream. Yields `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<FileEvent>> {
        self.events_rx.take()
    }

    /// Take the errors stream. Yields `None` after the first call.
    pub fn take_errors(&mut self) -> Option<mpsc::Receiver<Error>> {
        self.errors_rx.take()
    }

    /// Detach the OS watches, wait for the forwarding loop to drain, and
    /// close both output channels. The watcher is terminal afterwards.
    pub async fn stop(&mut self) {
        // Dropping the OS watcher drops the callback and its sender; the
        // forwarding loop sees the closed channel and exits after draining.
        self.watcher = None;

        if let Some(handle) = self.forward.take() {
            let _ = handle.await;
        }

        self.running.store(false, Ordering::SeqCst);
        info!("File watcher stopped");
    }
}

/// Reduce one notify event to zero or more [`FileEvent`]s.
fn translate(event: &notify::Event, tasks: &DirMatch, deps: &DirMatch) -> Vec<FileEvent> {
    // A full rename carries the old name first, the new name second.
    if let EventKind::Modify(ModifyKind::Name(RenameMode::Both)) = event.kind {
        let mut out = Vec::new();
        if let Some(old) = event.paths.first() {
            out.extend(make_event(old, FileOp::Delete, tasks, deps));
        }
        if let Some(new) = event.paths.get(1) {
            out.extend(make_event(new, FileOp::Create, tasks, deps));
        }
        return out;
    }

    let op = match map_op(&event.kind) {
        Some(op) => op,
        None => return Vec::new(),
    };

    event
        .paths
        .iter()
        .filter_map(|path| make_event(path, op, tasks, deps))
        .collect()
}

fn make_event(
    path: &Path,
    op: FileOp,
    tasks: &DirMatch,
    deps: &DirMatch,
) -> Option<FileEvent> {
    let kind = classify(path, tasks, deps)?;
    Some(FileEvent {
        path: path.to_path_buf(),
        kind,
        op,
    })
}

/// Map the OS event kind onto create/modify/delete; everything else
/// (access, metadata-only changes) is dropped.
fn map_op(kind: &EventKind) -> Option<FileOp> {
    match kind {
        EventKind::Create(_) => Some(FileOp::Create),
        EventKind::Remove(_) => Some(FileOp::Delete),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(FileOp::Delete),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(FileOp::Create),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(FileOp::Modify),
        _ => None,
    }
}

/// A path is in scope when it sits directly in one of the two directories
/// and its filename ends in `.json`.
fn classify(path: &Path, tasks: &DirMatch, deps: &DirMatch) -> Option<WatchKind> {
    if path.extension().and_then(|s| s.to_str()) != Some("json") {
        return None;
    }

    if tasks.contains(path) {
        Some(WatchKind::Task)
    } else if deps.contains(path) {
        Some(WatchKind::Dep)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};

    fn dirs() -> (DirMatch, DirMatch) {
        (
            DirMatch::new(Path::new("/repo/tasks")),
            DirMatch::new(Path::new("/repo/deps")),
        )
    }

    fn notify_event(kind: EventKind, paths: Vec<&str>) -> notify::Event {
        let mut event = notify::Event::new(kind);
        for p in paths {
            event = event.add_path(PathBuf::from(p));
        }
        event
    }

    #[test]
    fn test_map_op() {
        assert_eq!(
            map_op(&EventKind::Create(CreateKind::File)),
            Some(FileOp::Create)
        );
        assert_eq!(
            map_op(&EventKind::Remove(RemoveKind::File)),
            Some(FileOp::Delete)
        );
        assert_eq!(
            map_op(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            Some(FileOp::Modify)
        );
        assert_eq!(
            map_op(&EventKind::Modify(ModifyKind::Name(RenameMode::From))),
            Some(FileOp::Delete)
        );
        assert_eq!(
            map_op(&EventKind::Modify(ModifyKind::Name(RenameMode::To))),
            Some(FileOp::Create)
        );
        assert_eq!(
            map_op(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any))),
            None
        );
        assert_eq!(map_op(&EventKind::Access(notify::event::AccessKind::Any)), None);
    }

    #[test]
    fn test_classify_filters_scope_and_extension() {
        let (tasks, deps) = dirs();

        assert_eq!(
            classify(Path::new("/repo/tasks/sk-1.json"), &tasks, &deps),
            Some(WatchKind::Task)
        );
        assert_eq!(
            classify(Path::new("/repo/deps/a--blocks--b.json"), &tasks, &deps),
            Some(WatchKind::Dep)
        );
        // Wrong extension.
        assert_eq!(classify(Path::new("/repo/tasks/notes.txt"), &tasks, &deps), None);
        // Temp file from an atomic write.
        assert_eq!(
            classify(Path::new("/repo/tasks/sk-1.json.tmp"), &tasks, &deps),
            None
        );
        // Subdirectory is out of scope.
        assert_eq!(
            classify(Path::new("/repo/tasks/sub/sk-1.json"), &tasks, &deps),
            None
        );
        // Unrelated directory.
        assert_eq!(classify(Path::new("/repo/other/x.json"), &tasks, &deps), None);
    }

    #[test]
    fn test_translate_rename_is_delete_plus_create() {
        let (tasks, deps) = dirs();

        let event = notify_event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            vec!["/repo/tasks/old.json", "/repo/tasks/new.json"],
        );

        let out = translate(&event, &tasks, &deps);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].op, FileOp::Delete);
        assert!(out[0].path.ends_with("old.json"));
        assert_eq!(out[1].op, FileOp::Create);
        assert!(out[1].path.ends_with("new.json"));
    }

    #[test]
    fn test_translate_drops_out_of_scope_paths() {
        let (tasks, deps) = dirs();

        let event = notify_event(
            EventKind::Create(CreateKind::File),
            vec!["/repo/tasks/a.json", "/elsewhere/b.json", "/repo/tasks/c.txt"],
        );

        let out = translate(&event, &tasks, &deps);
        assert_eq!(out.len(), 1);
        assert!(out[0].path.ends_with("a.json"));
    }
}
