//! Download orchestration: one task per file, concurrent transfers, live
//! snapshots for any number of subscribers.
//!
//! The orchestrator is an explicitly constructed, cheaply cloneable handle;
//! the application builds one and passes clones to whatever needs it.
//!
//! # Coalescing
//!
//! [`DownloadOrchestrator::start_download`] checks for a non-terminal task with
//! the same file key and creates the new one under the same registry lock, so
//! a double-tap or a re-entered screen can never start a second transfer of a
//! file that is already queued or downloading.
//!
//! # Progress
//!
//! Every tick from the transport is applied to the task with that handle and a
//! full snapshot is pushed to every subscriber. Ticks whose byte count goes
//! backwards are held at the last recorded value. Ticks arriving after a task
//! reached a terminal state are dropped.
//!
//! # Failures
//!
//! Nothing is retried. A failed transfer ends as `Failed` with an
//! [`ErrorKind`]; calling `start_download` again is the retry.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::Stream;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaborators::{AlwaysGranted, GalleryImporter, NoGallery, PermissionGate};
use crate::entry::DirectoryEntry;
use crate::error::{Error, ErrorKind, Result};
use crate::journal::TransferJournal;
use crate::task::{Tick, TransferHandle, TransferStatus, TransferTask};
use crate::transport::{ProgressSink, TransferOutcome, TransferRequest, Transport};

/// How long a timed-out transport gets to clean up after being cancelled.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

// --- CONFIG ---

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Transfers allowed in `InProgress` at once; the rest wait as `Queued`.
    pub max_concurrent: usize,
    /// Terminal tasks kept for display. `0` drops them as soon as they finish.
    pub history_limit: usize,
    /// Fail a transfer with `RemoteUnavailable` after this long without a tick.
    pub idle_timeout: Option<Duration>,
    pub journal_path: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            history_limit: 50,
            idle_timeout: Some(Duration::from_secs(60)),
            journal_path: None,
        }
    }
}

// --- EVENTS ---

/// The active and recent tasks at one instant.
///
/// Active tasks come first in start order, then finished ones, newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadSnapshot {
    pub tasks: Vec<TransferTask>,
}

impl DownloadSnapshot {
    pub fn get(&self, handle: &TransferHandle) -> Option<&TransferTask> {
        self.tasks.iter().find(|t| t.id == handle.id())
    }

    /// Most relevant task for a file: the running one, else the latest.
    pub fn find(&self, file_key: &str) -> Option<&TransferTask> {
        self.tasks.iter().find(|t| t.file_key == file_key)
    }

    pub fn active(&self) -> impl Iterator<Item = &TransferTask> {
        self.tasks.iter().filter(|t| !t.is_terminal())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Snapshot(DownloadSnapshot),
    /// A non-fatal problem after a successful download (gallery import).
    Warning { file_key: String, message: String },
}

// --- REGISTRY ---

struct ActiveTask {
    task: TransferTask,
    cancel: CancellationToken,
    last_activity: Instant,
}

#[derive(Default)]
struct Registry {
    active: Vec<ActiveTask>,
    history: VecDeque<TransferTask>,
    subscribers: Vec<(u64, mpsc::UnboundedSender<DownloadEvent>)>,
    next_subscriber: u64,
}

impl Registry {
    fn snapshot(&self) -> DownloadSnapshot {
        let tasks = self
            .active
            .iter()
            .map(|a| a.task.clone())
            .chain(self.history.iter().cloned())
            .collect();
        DownloadSnapshot { tasks }
    }

    fn broadcast(&mut self, event: DownloadEvent) {
        self.subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    fn publish(&mut self) {
        let snapshot = self.snapshot();
        self.broadcast(DownloadEvent::Snapshot(snapshot));
    }

    fn position(&self, handle: &TransferHandle) -> Option<usize> {
        self.active.iter().position(|a| a.task.id == handle.id())
    }

    fn active_mut(&mut self, handle: &TransferHandle) -> Option<&mut ActiveTask> {
        let index = self.position(handle)?;
        Some(&mut self.active[index])
    }

    /// Moves a terminal task into history and publishes it there before the
    /// history is cut back to `history_limit`, so subscribers always see the
    /// final state even when nothing is retained.
    fn retire(&mut self, index: usize, history_limit: usize) -> TransferTask {
        let task = self.active.remove(index).task;
        self.history.push_front(task.clone());
        self.publish();
        self.history.truncate(history_limit);
        task
    }
}

// --- ORCHESTRATOR ---

struct Inner {
    registry: Mutex<Registry>,
    transport: Arc<dyn Transport>,
    gallery: Arc<dyn GalleryImporter>,
    permission: Arc<dyn PermissionGate>,
    permission_granted: AtomicBool,
    permits: Arc<Semaphore>,
    config: OrchestratorConfig,
    journal_lock: tokio::sync::Mutex<()>,
}

pub struct OrchestratorBuilder {
    transport: Arc<dyn Transport>,
    gallery: Arc<dyn GalleryImporter>,
    permission: Arc<dyn PermissionGate>,
    config: OrchestratorConfig,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn gallery(mut self, gallery: Arc<dyn GalleryImporter>) -> Self {
        self.gallery = gallery;
        self
    }

    pub fn permission(mut self, permission: Arc<dyn PermissionGate>) -> Self {
        self.permission = permission;
        self
    }

    pub fn build(self) -> DownloadOrchestrator {
        let permits = self.config.max_concurrent.max(1);
        DownloadOrchestrator {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                transport: self.transport,
                gallery: self.gallery,
                permission: self.permission,
                permission_granted: AtomicBool::new(false),
                permits: Arc::new(Semaphore::new(permits)),
                config: self.config,
                journal_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

#[derive(Clone)]
pub struct DownloadOrchestrator {
    inner: Arc<Inner>,
}

impl DownloadOrchestrator {
    pub fn builder(transport: Arc<dyn Transport>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            transport,
            gallery: Arc::new(NoGallery),
            permission: Arc::new(AlwaysGranted),
            config: OrchestratorConfig::default(),
        }
    }

    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::builder(transport).build()
    }

    /// Starts downloading `file`, or returns the handle of the transfer already
    /// running for it.
    ///
    /// Returns as soon as the task is registered; the bytes move on a spawned
    /// task. Fails without creating a task when storage permission is refused.
    pub async fn start_download(&self, file: &DirectoryEntry) -> Result<TransferHandle> {
        if file.is_directory {
            return Err(Error::NotAFile(file.path.clone()));
        }
        self.ensure_permission().await?;

        let (handle, cancel) = {
            let mut registry = self.inner.lock();
            if let Some(existing) = registry.active.iter().find(|a| a.task.file_key == file.path) {
                debug!(file = %file.path, "download already running, reusing task");
                return Ok(existing.task.handle());
            }

            let task = TransferTask::new(file);
            let handle = task.handle();
            let cancel = CancellationToken::new();
            registry.active.push(ActiveTask {
                task,
                cancel: cancel.clone(),
                last_activity: Instant::now(),
            });
            registry.publish();
            (handle, cancel)
        };

        info!(file = %file.path, "download queued");
        self.inner.schedule_journal();

        let request = TransferRequest {
            file_key: file.path.clone(),
            name: file.name.clone(),
        };
        tokio::spawn(run_transfer(self.inner.clone(), handle.clone(), request, cancel));
        Ok(handle)
    }

    /// Asks the transfer to stop.
    ///
    /// A queued task is cancelled on the spot; a running one becomes
    /// `Cancelled` when the transport gives up, or `Completed` if the transport
    /// had already finished. Returns `false` if the task is no longer active.
    pub fn cancel(&self, handle: &TransferHandle) -> bool {
        let mut registry = self.inner.lock();
        let Some(index) = registry.position(handle) else {
            return false;
        };

        let active = &mut registry.active[index];
        active.cancel.cancel();
        if active.task.status != TransferStatus::Queued {
            info!(file = %handle.file_key(), "cancellation requested");
            return true;
        }

        active.task.cancel();
        registry.retire(index, self.inner.config.history_limit);
        drop(registry);

        info!(file = %handle.file_key(), "queued download cancelled");
        self.inner.schedule_journal();
        true
    }

    /// Registers a new listener. It immediately receives the current snapshot.
    ///
    /// Delivery is unbounded: every change, including each progress tick,
    /// queues a full snapshot for every listener. A subscription that is kept
    /// but never read grows with each tick, so drop it (or call
    /// [`Subscription::unsubscribe`]) once it is no longer polled.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.inner.lock();
        let id = registry.next_subscriber;
        registry.next_subscriber += 1;
        let _ = tx.send(DownloadEvent::Snapshot(registry.snapshot()));
        registry.subscribers.push((id, tx));

        Subscription {
            id,
            rx,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn snapshot(&self) -> DownloadSnapshot {
        self.inner.lock().snapshot()
    }

    pub fn task(&self, handle: &TransferHandle) -> Option<TransferTask> {
        self.snapshot().get(handle).cloned()
    }

    /// Waits until the task is terminal and returns its final state.
    ///
    /// Resolves to `None` if the task is not (or no longer) tracked, which is
    /// always the case for finished tasks when `history_limit` is zero.
    pub async fn wait(&self, handle: &TransferHandle) -> Option<TransferTask> {
        let mut subscription = self.subscribe();
        while let Some(event) = subscription.recv().await {
            if let DownloadEvent::Snapshot(snapshot) = event {
                match snapshot.get(handle) {
                    Some(task) if task.is_terminal() => return Some(task.clone()),
                    Some(_) => {}
                    None => return None,
                }
            }
        }
        None
    }

    /// Forgets all finished tasks.
    pub fn clear_history(&self) {
        {
            let mut registry = self.inner.lock();
            registry.history.clear();
            registry.publish();
        }
        self.inner.schedule_journal();
    }

    /// Writes the journal now and waits for it to land on disk.
    ///
    /// Status changes save the journal in the background; call this before
    /// shutting down so the last change is not lost.
    pub async fn flush_journal(&self) {
        self.inner.write_journal().await;
    }

    /// Loads finished transfers from the journal into the recent history.
    pub fn restore_history(&self) -> Result<usize> {
        let Some(path) = &self.inner.config.journal_path else {
            return Ok(0);
        };
        let restored = TransferJournal::load_from_file(path)?.into_history();

        let mut registry = self.inner.lock();
        let mut count = 0;
        for task in restored {
            let known = registry.active.iter().any(|a| a.task.id == task.id)
                || registry.history.iter().any(|t| t.id == task.id);
            if !known {
                registry.history.push_back(task);
                count += 1;
            }
        }
        registry.history.truncate(self.inner.config.history_limit);
        registry.publish();
        debug!(count, "restored transfer history");
        Ok(count)
    }

    async fn ensure_permission(&self) -> Result<()> {
        if self.inner.permission_granted.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.inner.permission.request().await {
            self.inner.permission_granted.store(true, Ordering::Release);
            Ok(())
        } else {
            warn!("storage permission refused");
            Err(Error::PermissionDenied("storage access refused".to_string()))
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(self: &Arc<Self>, handle: &TransferHandle) -> bool {
        {
            let mut registry = self.lock();
            let Some(active) = registry.active_mut(handle) else {
                return false;
            };
            if active.cancel.is_cancelled() || !active.task.begin() {
                return false;
            }
            active.last_activity = Instant::now();
            registry.publish();
        }
        info!(file = %handle.file_key(), "download started");
        self.schedule_journal();
        true
    }

    fn on_progress(&self, handle: &TransferHandle, written: u64, expected: Option<u64>) {
        let mut registry = self.lock();
        let Some(active) = registry.active_mut(handle) else {
            return;
        };
        match active.task.record_progress(written, expected) {
            Tick::Ignored => return,
            Tick::Clamped => warn!(
                file = %handle.file_key(),
                reported = written,
                recorded = active.task.bytes_written,
                "progress went backwards, keeping last value"
            ),
            Tick::Applied => {}
        }
        active.last_activity = Instant::now();
        registry.publish();
    }

    fn last_activity(&self, handle: &TransferHandle) -> Option<Instant> {
        let mut registry = self.lock();
        registry.active_mut(handle).map(|a| a.last_activity)
    }

    /// Applies a terminal transition and moves the task into history.
    fn finish<F>(self: &Arc<Self>, handle: &TransferHandle, apply: F) -> Option<TransferTask>
    where
        F: FnOnce(&mut TransferTask) -> bool,
    {
        let finished = {
            let mut registry = self.lock();
            let index = registry.position(handle)?;
            if !apply(&mut registry.active[index].task) {
                return None;
            }
            registry.retire(index, self.config.history_limit)
        };
        info!(file = %finished.file_key, status = %finished.status, "download finished");
        self.schedule_journal();
        Some(finished)
    }

    fn complete(self: &Arc<Self>, handle: &TransferHandle, outcome: &TransferOutcome) -> bool {
        self.finish(handle, |task| {
            if let Some(expected) = task.bytes_expected {
                if expected != outcome.bytes_written {
                    warn!(
                        file = %task.file_key,
                        expected,
                        actual = outcome.bytes_written,
                        "final size differs from announced size"
                    );
                }
            }
            task.complete(
                outcome.bytes_written,
                outcome.local_path.clone(),
                outcome.sha256.clone(),
            )
        })
        .is_some()
    }

    fn warn_subscribers(&self, handle: &TransferHandle, message: String) {
        self.lock().broadcast(DownloadEvent::Warning {
            file_key: handle.file_key().to_string(),
            message,
        });
    }

    /// Resolves once the task has gone `idle` without a progress tick.
    async fn idle_watchdog(&self, handle: &TransferHandle, idle: Duration) {
        loop {
            let Some(last) = self.last_activity(handle) else {
                return std::future::pending().await;
            };
            let deadline = last + idle;
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }

    /// Saves the journal in the background. Each write takes the registry
    /// state current at the time it runs, so the last write always wins.
    fn schedule_journal(self: &Arc<Self>) {
        if self.config.journal_path.is_none() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = self.clone();
                runtime.spawn(async move { inner.write_journal().await });
            }
            Err(_) => warn!("no async runtime, transfer journal not updated"),
        }
    }

    async fn write_journal(&self) {
        let Some(path) = &self.config.journal_path else {
            return;
        };
        let _guard = self.journal_lock.lock().await;
        let tasks = self.lock().snapshot().tasks;
        if let Err(e) = TransferJournal::new(tasks).save_to_file(path).await {
            warn!(path = %path.display(), error = %e, "could not write transfer journal");
        }
    }
}

async fn run_transfer(
    inner: Arc<Inner>,
    handle: TransferHandle,
    request: TransferRequest,
    cancel: CancellationToken,
) {
    let permit = tokio::select! {
        _ = cancel.cancelled() => return,
        permit = inner.permits.clone().acquire_owned() => permit,
    };
    if !inner.begin(&handle) {
        return;
    }
    let Ok(_permit) = permit else {
        inner.finish(&handle, |task| task.fail(ErrorKind::Unknown));
        return;
    };

    let sink = {
        let inner = Arc::downgrade(&inner);
        let handle = handle.clone();
        ProgressSink::new(move |written, expected| {
            if let Some(inner) = inner.upgrade() {
                inner.on_progress(&handle, written, expected);
            }
        })
    };

    // The transport sees a child token so an idle timeout can stop it without
    // being mistaken for a user cancellation.
    let transport_cancel = cancel.child_token();
    let mut fetch = inner.transport.fetch(request, sink, transport_cancel.clone());
    let result = match inner.config.idle_timeout {
        None => fetch.await,
        Some(idle) => tokio::select! {
            result = &mut fetch => result,
            () = inner.idle_watchdog(&handle, idle) => {
                warn!(file = %handle.file_key(), ?idle, "no progress, giving up");
                transport_cancel.cancel();
                let _ = tokio::time::timeout(CANCEL_GRACE, &mut fetch).await;
                Err(Error::RemoteUnavailable(format!(
                    "no progress for {} seconds",
                    idle.as_secs()
                )))
            }
        },
    };

    // A successful result means the file is already in place: complete it.
    if cancel.is_cancelled() {
        if result.is_err() {
            inner.finish(&handle, TransferTask::cancel);
            return;
        }
        debug!(file = %handle.file_key(), "cancel arrived after the transfer finished");
    }

    match result {
        Ok(outcome) => {
            if !inner.complete(&handle, &outcome) {
                return;
            }
            if let Err(e) = inner.gallery.import(&outcome.local_path).await {
                warn!(file = %handle.file_key(), error = %e, "gallery import failed");
                inner.warn_subscribers(&handle, format!("saved, but gallery import failed: {e}"));
            }
        }
        Err(e) => {
            warn!(file = %handle.file_key(), error = %e, "download failed");
            let kind = e.kind();
            inner.finish(&handle, |task| task.fail(kind));
        }
    }
}

// --- SUBSCRIPTION ---

/// A listener registration. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<DownloadEvent>,
    inner: Weak<Inner>,
}

impl Subscription {
    /// Next event, or `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<DownloadEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<DownloadEvent> {
        self.rx.try_recv().ok()
    }

    /// Stops delivery. Safe to call any number of times.
    pub fn unsubscribe(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lock().subscribers.retain(|(id, _)| *id != self.id);
        }
        self.inner = Weak::new();
        self.rx.close();
    }

    pub fn into_stream(self) -> impl Stream<Item = DownloadEvent> {
        async_stream::stream! {
            let mut subscription = self;
            while let Some(event) = subscription.recv().await {
                yield event;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
