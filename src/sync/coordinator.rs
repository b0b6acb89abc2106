//! Sync coordinator
//!
//! Runs sync passes: drain the operation queue oldest-first against the
//! remote, then pull the authoritative record set and diff it against the
//! local cache. At most one pass runs at a time; a trigger that arrives
//! while a pass is active is dropped rather than queued.
//!
//! ```text
//! idle -> syncing -> {completed | has-conflicts | failed} -> idle
//! ```
//!
//! Progress is reported through a broadcast channel of [`SyncEvent`]s.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::conflict::{ConflictResolver, Detection, SyncConflict};
use super::network::{ConnectivityEvents, NetworkObserver};
use super::operation::{Mutation, PendingOperation};
use super::queue::OperationQueue;
use super::record::{Entity, Record, RecordFilter, SyncState};
use super::remote::RemoteDataService;
use super::retry::{CancelToken, RetryPolicy};
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::storage::LocalStore;

/// Coordinator state as reported to observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Syncing,
    Completed { uploaded: usize, downloaded: usize },
    HasConflicts(usize),
    Failed(String),
}

impl SyncStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SyncStatus::Idle | SyncStatus::Syncing)
    }
}

/// Why a pending operation was discarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// The remote rejected it; retrying cannot help
    Fatal(RemoteError),
    /// It kept failing until the retry ceiling
    RetriesExhausted { attempts: u32, last_error: RemoteError },
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::Fatal(err) => write!(f, "rejected by remote: {}", err),
            DropReason::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "gave up after {} attempts: {}", attempts, last_error),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    StateChanged(SyncStatus),
    ConflictDetected(SyncConflict),
    OperationDropped {
        operation: PendingOperation,
        reason: DropReason,
    },
}

/// Result of asking for a pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another pass was already running
    Skipped,
    /// The pass ran and ended in this terminal status
    Finished(SyncStatus),
}

/// Command to send to the background loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCommand {
    /// Run a pass now unless one is active
    Trigger,
    /// Stop the loop
    Shutdown,
}

/// Configuration for the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub policy: RetryPolicy,
    /// Page size for remote `list` calls
    pub page_size: usize,
    /// Periodic pass interval; `None` disables the timer
    pub sync_interval: Option<Duration>,
    /// Entity types fetched during the pull phase
    pub entity_types: Vec<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            page_size: 100,
            sync_interval: None,
            entity_types: vec![crate::lesson::LESSON_TYPE.to_string()],
        }
    }
}

#[derive(Default)]
struct PassReport {
    uploaded: usize,
    downloaded: usize,
}

/// What happened to one operation during a drain
enum Attempt {
    Applied,
    Pending,
    Dropped,
}

pub struct SyncCoordinator {
    store: Arc<LocalStore>,
    queue: Arc<OperationQueue>,
    resolver: Arc<ConflictResolver>,
    remote: Arc<dyn RemoteDataService>,
    network: Arc<NetworkObserver>,
    config: CoordinatorConfig,
    events: broadcast::Sender<SyncEvent>,
    status: RwLock<SyncStatus>,
    pass_lock: tokio::sync::Mutex<()>,
    cancel: CancelToken,
    command_tx: mpsc::Sender<SyncCommand>,
    command_rx: Mutex<Option<mpsc::Receiver<SyncCommand>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<LocalStore>,
        queue: Arc<OperationQueue>,
        resolver: Arc<ConflictResolver>,
        remote: Arc<dyn RemoteDataService>,
        network: Arc<NetworkObserver>,
        config: CoordinatorConfig,
    ) -> SyncResult<Self> {
        // A crash mid-pass can leave records flagged as syncing
        release_syncing(&store)?;

        let (events, _) = broadcast::channel(256);
        let (command_tx, command_rx) = mpsc::channel(100);
        Ok(Self {
            store,
            queue,
            resolver,
            remote,
            network,
            config,
            events,
            status: RwLock::new(SyncStatus::Idle),
            pass_lock: tokio::sync::Mutex::new(()),
            cancel: CancelToken::new(),
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
            task: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.read().clone()
    }

    pub fn is_syncing(&self) -> bool {
        self.pass_lock.try_lock().is_err()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn emit(&self, event: SyncEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn set_status(&self, status: SyncStatus) {
        *self.status.write() = status.clone();
        self.emit(SyncEvent::StateChanged(status));
    }

    /// Ask the background loop for a pass. Non-blocking; returns `false`
    /// when the request was dropped.
    pub fn trigger(&self) -> bool {
        self.command_tx.try_send(SyncCommand::Trigger).is_ok()
    }

    /// Run one pass now, unless one is already in flight
    pub async fn sync_now(&self) -> SyncOutcome {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            debug!("Sync already in progress, trigger dropped");
            return SyncOutcome::Skipped;
        };

        self.set_status(SyncStatus::Syncing);
        self.release_stale_syncing();
        let result = self.run_pass().await;
        self.release_stale_syncing();

        let terminal = match result {
            Ok(report) => {
                let conflicts = self.resolver.count().unwrap_or_else(|e| {
                    error!("Failed to count conflicts: {}", e);
                    0
                });
                if conflicts > 0 {
                    SyncStatus::HasConflicts(conflicts)
                } else {
                    SyncStatus::Completed {
                        uploaded: report.uploaded,
                        downloaded: report.downloaded,
                    }
                }
            }
            Err(e) => SyncStatus::Failed(e.to_string()),
        };

        match &terminal {
            SyncStatus::Failed(reason) => warn!("Sync failed: {}", reason),
            other => info!("Sync finished: {:?}", other),
        }
        self.set_status(terminal.clone());
        self.set_status(SyncStatus::Idle);
        SyncOutcome::Finished(terminal)
    }

    /// No record stays `syncing` past the pass that flagged it, even when
    /// resetting it failed at the time
    fn release_stale_syncing(&self) {
        match release_syncing(&self.store) {
            Ok(0) => {}
            Ok(n) => debug!("Released {} records left syncing", n),
            Err(e) => error!("Failed to release records left syncing: {}", e),
        }
    }

    async fn run_pass(&self) -> SyncResult<PassReport> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if !self.network.is_connected_now() {
            return Err(SyncError::Offline);
        }

        let mut report = PassReport::default();
        self.drain(&mut report).await?;
        self.pull(&mut report).await?;
        Ok(report)
    }

    // ==================== Drain ====================

    async fn drain(&self, report: &mut PassReport) -> SyncResult<()> {
        let snapshot = self.queue.peek_all();
        if snapshot.is_empty() {
            return Ok(());
        }
        debug!("Draining {} pending operations", snapshot.len());

        // An entity whose earlier operation stays pending keeps the rest
        // of its operations for the next pass
        let mut blocked: HashSet<String> = HashSet::new();

        for op in snapshot {
            if blocked.contains(&op.entity_id) {
                continue;
            }
            if !self.queue.contains(&op.id) {
                // Removed meanwhile by a conflict resolution
                continue;
            }
            if self.resolver.get(&op.entity_id)?.is_some() {
                debug!("{} awaits conflict resolution, holding its operations", op.entity_id);
                blocked.insert(op.entity_id.clone());
                continue;
            }

            match self.attempt(&op).await? {
                Attempt::Applied => report.uploaded += 1,
                Attempt::Dropped => {}
                Attempt::Pending => {
                    blocked.insert(op.entity_id.clone());
                }
            }
        }
        Ok(())
    }

    async fn attempt(&self, op: &PendingOperation) -> SyncResult<Attempt> {
        if let Err(e) = self.store.set_sync_state(&op.entity_id, SyncState::Syncing) {
            error!(
                "Local store failure before {} of {}: {}",
                op.mutation.name(),
                op.entity_id,
                e
            );
            return Ok(Attempt::Pending);
        }

        let what = format!("{} {}", op.mutation.name(), op.entity_id);
        let policy = &self.config.policy;
        let result = match (&op.mutation, op.entity()) {
            (Mutation::Create { .. }, Some(entity)) => {
                let created = match policy
                    .run(&self.cancel, &what, || self.remote.create(&entity))
                    .await
                {
                    Err(SyncError::Remote(RemoteError::AlreadyExists(_))) => {
                        self.confirm_created(&entity, &what).await
                    }
                    other => other,
                };
                created.map(Some)
            }
            (Mutation::Update { .. }, Some(entity)) => policy
                .run(&self.cancel, &what, || self.remote.update(&entity))
                .await
                .map(Some),
            _ => match policy
                .run(&self.cancel, &what, || {
                    self.remote.delete(&op.entity_type, &op.entity_id)
                })
                .await
            {
                Ok(()) | Err(SyncError::Remote(RemoteError::NotFound(_))) => Ok(None),
                Err(e) => Err(e),
            },
        };

        match result {
            Ok(entity) => match self.apply_success(op, entity) {
                Ok(()) => {
                    debug!("Applied {}", what);
                    Ok(Attempt::Applied)
                }
                Err(e) => {
                    error!(
                        "Local store failure after {}: {}; operation stays queued",
                        what, e
                    );
                    self.reset_state(&op.entity_id, SyncState::LocalOnly);
                    Ok(Attempt::Pending)
                }
            },
            Err(SyncError::Remote(err)) if RetryPolicy::is_retryable(&err) => {
                self.handle_retryable(op, err)
            }
            Err(SyncError::Remote(err)) => {
                warn!("{} rejected by remote: {}", what, err);
                self.drop_operation(op, DropReason::Fatal(err))?;
                Ok(Attempt::Dropped)
            }
            Err(SyncError::Cancelled) => {
                self.reset_state(&op.entity_id, SyncState::LocalOnly);
                Err(SyncError::Cancelled)
            }
            Err(e) => {
                error!("{} failed: {}", what, e);
                self.reset_state(&op.entity_id, SyncState::LocalOnly);
                Ok(Attempt::Pending)
            }
        }
    }

    /// A create whose earlier attempt landed remotely, but whose reply or
    /// local bookkeeping was lost, comes back as `AlreadyExists`. It counts
    /// as applied when the remote holds the same payload.
    async fn confirm_created(&self, entity: &Entity, what: &str) -> SyncResult<Entity> {
        let existing = self
            .config
            .policy
            .run(&self.cancel, what, || {
                self.remote.get(&entity.entity_type, &entity.id)
            })
            .await;

        match existing {
            Ok(existing) if existing.payload == entity.payload => {
                debug!("{} was already applied remotely", what);
                Ok(existing)
            }
            Ok(_) | Err(SyncError::Remote(RemoteError::NotFound(_))) => Err(SyncError::Remote(
                RemoteError::AlreadyExists(entity.id.clone()),
            )),
            Err(e) => Err(e),
        }
    }

    fn handle_retryable(&self, op: &PendingOperation, err: RemoteError) -> SyncResult<Attempt> {
        let (attempts, should_drop) = match self.queue.increment_retry(&op.id) {
            Ok(v) => v,
            Err(e) => {
                error!("Failed to record retry for {}: {}", op.id, e);
                self.reset_state(&op.entity_id, SyncState::LocalOnly);
                return Ok(Attempt::Pending);
            }
        };

        if should_drop {
            warn!(
                "{} {} failed {} times, dropping: {}",
                op.mutation.name(),
                op.entity_id,
                attempts,
                err
            );
            self.drop_operation(
                op,
                DropReason::RetriesExhausted {
                    attempts,
                    last_error: err,
                },
            )?;
            return Ok(Attempt::Dropped);
        }

        warn!(
            "{} {} failed (retry {}/{}): {}",
            op.mutation.name(),
            op.entity_id,
            attempts,
            self.queue.max_retries(),
            err
        );
        self.reset_state(&op.entity_id, SyncState::LocalOnly);
        Ok(Attempt::Pending)
    }

    fn drop_operation(&self, op: &PendingOperation, reason: DropReason) -> SyncResult<()> {
        let mut operation = self.queue.remove(&op.id)?;
        if let DropReason::RetriesExhausted { attempts, .. } = &reason {
            operation.retry_count = *attempts;
        }
        self.reset_state(&op.entity_id, SyncState::Failed);
        self.emit(SyncEvent::OperationDropped { operation, reason });
        Ok(())
    }

    fn reset_state(&self, entity_id: &str, state: SyncState) {
        if let Err(e) = self.store.set_sync_state(entity_id, state) {
            error!("Failed to mark {} as {:?}: {}", entity_id, state, e);
        }
    }

    /// Record a confirmed operation locally, then dequeue it
    fn apply_success(&self, op: &PendingOperation, confirmed: Option<Entity>) -> SyncResult<()> {
        let _edits = self.store.lock_edits();
        let later_ops = self
            .queue
            .pending_for(&op.entity_id)
            .iter()
            .any(|o| o.id != op.id);

        match confirmed {
            Some(entity) if later_ops => {
                // Newer local edits are still queued; rebase them on the
                // confirmed version
                if let Some(mut record) = self.store.get(&op.entity_id)? {
                    record.synced_version = Some(entity.version);
                    record.version = entity.version + 1;
                    record.sync_state = SyncState::LocalOnly;
                    self.store.put(&record)?;
                }
            }
            Some(entity) => self.store.put(&Record::from_entity(&entity))?,
            None if later_ops => {}
            None => self.store.delete(&op.entity_id)?,
        }

        self.queue.remove(&op.id)?;
        Ok(())
    }

    // ==================== Pull ====================

    async fn fetch_all(&self, entity_type: &str) -> SyncResult<Vec<Entity>> {
        let mut entities = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let what = format!("list {}", entity_type);
            let page = self
                .config
                .policy
                .run(&self.cancel, &what, || {
                    self.remote
                        .list(entity_type, self.config.page_size, token.as_deref())
                })
                .await?;
            entities.extend(page.entities);

            match page.next_page_token {
                Some(next) if !next.is_empty() => token = Some(next),
                _ => break,
            }
        }
        Ok(entities)
    }

    async fn pull(&self, report: &mut PassReport) -> SyncResult<()> {
        for entity_type in &self.config.entity_types {
            let remote: HashMap<String, Entity> = self
                .fetch_all(entity_type)
                .await?
                .into_iter()
                .map(|e| (e.id.clone(), e))
                .collect();

            let local_ids: Vec<String> = self
                .store
                .list_all(&RecordFilter::entity_type(entity_type.as_str()))?
                .into_iter()
                .map(|r| r.id)
                .collect();
            let mut seen = HashSet::with_capacity(local_ids.len());

            for id in local_ids {
                let detected = self.reconcile(&id, remote.get(&id), report)?;
                seen.insert(id);
                if let Some(conflict) = detected {
                    info!("Conflict on {}: {}", conflict.entity_id, conflict.conflict_type);
                    self.emit(SyncEvent::ConflictDetected(conflict));
                }
            }

            for (id, entity) in &remote {
                if seen.contains(id) {
                    continue;
                }
                let _edits = self.store.lock_edits();
                // Created locally since the listing, or queued for upload
                if self.store.get(id)?.is_some() || !self.queue.pending_for(id).is_empty() {
                    continue;
                }
                self.store.put(&Record::from_entity(entity))?;
                report.downloaded += 1;
            }
        }
        Ok(())
    }

    /// Diff one cached record against the remote and apply the outcome.
    ///
    /// The record is re-read under the edit lock so a mutation made since
    /// the listing is never overwritten. Returns a conflict worth
    /// reporting.
    fn reconcile(
        &self,
        id: &str,
        remote: Option<&Entity>,
        report: &mut PassReport,
    ) -> SyncResult<Option<SyncConflict>> {
        let _edits = self.store.lock_edits();
        let Some(local) = self.store.get(id)? else {
            // Deleted locally meanwhile; its delete is queued
            return Ok(None);
        };
        let has_pending = !self.queue.pending_for(id).is_empty();

        match Detection::classify(&local, remote, has_pending) {
            Detection::Conflict(conflict_type) => {
                let conflict = SyncConflict {
                    entity_id: local.id.clone(),
                    entity_type: local.entity_type.clone(),
                    remote: remote.map(Record::from_entity),
                    local,
                    conflict_type,
                    detected_at: chrono::Utc::now(),
                };
                let is_new = self.resolver.record(&conflict)?;
                return Ok(is_new.then_some(conflict));
            }
            Detection::AdoptRemote => {
                if let Some(entity) = remote {
                    self.store.put(&Record::from_entity(entity))?;
                    report.downloaded += 1;
                }
            }
            Detection::InSync => {
                if let Some(entity) = remote {
                    self.store.put(&Record::from_entity(entity))?;
                }
            }
            Detection::EvictLocal => {
                debug!("{} was deleted remotely", id);
                self.store.delete(id)?;
                report.downloaded += 1;
            }
            Detection::KeepLocal => {
                if local.sync_state == SyncState::Conflicted {
                    self.store.set_sync_state(id, SyncState::LocalOnly)?;
                }
            }
        }

        // No longer diverged
        if self.resolver.get(id)?.is_some() {
            self.resolver.clear(id)?;
        }
        Ok(None)
    }

    // ==================== Lifecycle ====================

    /// Spawn the background loop. Passes run on connectivity restore, on
    /// [`SyncCommand::Trigger`] and on the optional periodic timer.
    pub fn start(self: &Arc<Self>) -> SyncResult<()> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let Some(commands) = self.command_rx.lock().take() else {
            return Err(SyncError::Cancelled);
        };

        // Subscribe before spawning so a transition right after start is seen
        let connectivity = self.network.subscribe();
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            this.run_loop(commands, connectivity).await
        }));
        info!("Sync coordinator started");
        Ok(())
    }

    /// Cancel the loop and any pass in flight, then wait for it to exit.
    ///
    /// The coordinator cannot be restarted afterwards.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let _ = self.command_tx.try_send(SyncCommand::Shutdown);

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Sync loop terminated abnormally: {}", e);
            }
        }
        // Wait for a pass started through sync_now to unwind
        let _ = self.pass_lock.lock().await;
        info!("Sync coordinator stopped");
    }

    async fn run_loop(
        self: Arc<Self>,
        mut commands: mpsc::Receiver<SyncCommand>,
        mut connectivity: ConnectivityEvents,
    ) {
        let mut connectivity_open = true;
        let mut ticker = self.config.sync_interval.map(|period| {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval
        });

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                changed = connectivity.changed(), if connectivity_open => match changed {
                    Some(true) => {
                        info!("Connectivity restored, starting sync");
                        self.sync_now().await;
                    }
                    Some(false) => debug!("Connectivity lost"),
                    None => connectivity_open = false,
                },

                cmd = commands.recv() => match cmd {
                    Some(SyncCommand::Trigger) => {
                        self.sync_now().await;
                    }
                    Some(SyncCommand::Shutdown) | None => break,
                },

                _ = tick(&mut ticker) => {
                    self.sync_now().await;
                }
            }

            // Triggers that arrived during the pass are dropped
            connectivity.mark_seen();
            loop {
                match commands.try_recv() {
                    Ok(SyncCommand::Trigger) => continue,
                    Ok(SyncCommand::Shutdown) => return,
                    Err(_) => break,
                }
            }
        }
        debug!("Sync loop exited");
    }
}

/// Return records flagged `syncing` to `local-only`
fn release_syncing(store: &LocalStore) -> SyncResult<usize> {
    let stale = store.list_all(&RecordFilter::all().with_state(SyncState::Syncing))?;
    for record in &stale {
        store.set_sync_state(&record.id, SyncState::LocalOnly)?;
    }
    Ok(stale.len())
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
