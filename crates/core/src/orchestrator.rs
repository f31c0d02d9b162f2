//! Sync orchestration
//!
//! [`SyncOrchestrator`] owns one session. After the initial sync it runs a
//! local-to-remote task and a remote-to-local task side by side. The two
//! share a single lock over the echo set, the last known snapshot of each
//! side and the session record; no I/O happens while it is held.
//!
//! The last known snapshots double as the baseline for change detection and
//! for three-way reconciliation. They are replaced entry by entry as changes
//! are applied, so a failed entry keeps its old baseline and is retried by
//! the next poll.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::batch::{BatcherConfig, ChangeBatcher, WatchEvent, run_batcher};
use crate::conflict::{InitialPolicy, Resolution, SyncPlan, compare_sides, plan_reconcile};
use crate::diff::{ChangeSet, Direction, diff};
use crate::echo::{EchoSet, Fingerprint};
use crate::error::{Result, SyncError};
use crate::exclude::{ExclusionMatcher, ExclusionRule};
use crate::local_fs;
use crate::lock;
use crate::path::RelPath;
use crate::scan::Scanner;
use crate::session::{
    SessionRecord, SessionReport, SessionState, SyncEvent, SyncReport, SyncRoot,
};
use crate::snapshot::{EntryMeta, Side, Snapshot};
use crate::transport::{
    ConnectionStatus, Op, RetryPolicy, RetryingTransport, TransportAdapter, TransportError,
};

/// Extra time granted to in-flight transport calls on shutdown, on top of
/// the retry policy's worst-case backoff
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Capacity of the channel between the batcher and the local task
const BATCH_CHANNEL: usize = 16;

/// Tunables for a sync session
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub exclude: Vec<ExclusionRule>,
    pub policy: InitialPolicy,
    pub batcher: BatcherConfig,
    /// Remote polling interval, and local polling without a watch feed
    pub poll_interval: Duration,
    pub echo_expiry: Duration,
    /// How long a lost connection may stay down before the session fails
    pub reconnect_timeout: Duration,
    pub retry: RetryPolicy,
    pub hash_contents: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            exclude: Vec::new(),
            policy: InitialPolicy::default(),
            batcher: BatcherConfig::default(),
            poll_interval: Duration::from_secs(1),
            echo_expiry: Duration::from_secs(10),
            reconnect_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            hash_contents: true,
        }
    }
}

impl SyncOptions {
    #[must_use]
    pub fn exclude(mut self, rules: impl IntoIterator<Item = ExclusionRule>) -> Self {
        self.exclude.extend(rules);
        self
    }

    #[must_use]
    pub fn policy(mut self, policy: InitialPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// State shared by both directional tasks
#[derive(Debug)]
struct Shared {
    echoes: EchoSet,
    local_known: Arc<Snapshot>,
    remote_known: Arc<Snapshot>,
    record: SessionRecord,
}

#[derive(Debug)]
struct SessionCore {
    state: watch::Sender<SessionState>,
    shared: Mutex<Shared>,
    shutdown: watch::Sender<bool>,
    reconcile: Notify,
}

impl SessionCore {
    fn new(echo_expiry: Duration) -> Self {
        Self {
            state: watch::Sender::new(SessionState::Initializing),
            shared: Mutex::new(Shared {
                echoes: EchoSet::new(echo_expiry),
                local_known: Arc::new(Snapshot::empty(Side::Local)),
                remote_known: Arc::new(Snapshot::empty(Side::Remote)),
                record: SessionRecord::default(),
            }),
            shutdown: watch::Sender::new(false),
            reconcile: Notify::new(),
        }
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "session state changed");
        }
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn report(&self) -> SessionReport {
        let state = *self.state.borrow();
        lock(&self.shared).record.report(state)
    }

    fn fail(&self, err: SyncError) {
        error!(error = %err, "sync session failed");
        lock(&self.shared).record.last_error = Some(Arc::new(err));
        self.set_state(SessionState::Failed);
    }
}

/// Builder and entry point for a sync session
pub struct SyncOrchestrator<T> {
    root: SyncRoot,
    transport: RetryingTransport<T>,
    options: SyncOptions,
    watch_events: Option<mpsc::UnboundedReceiver<WatchEvent>>,
    connection: Option<watch::Receiver<ConnectionStatus>>,
}

impl<T: TransportAdapter + 'static> SyncOrchestrator<T> {
    /// `transport` is wrapped in a [`RetryingTransport`] using
    /// `options.retry`
    #[must_use]
    pub fn new(root: SyncRoot, transport: T, options: SyncOptions) -> Self {
        let transport = RetryingTransport::new(transport, options.retry);
        Self {
            root,
            transport,
            options,
            watch_events: None,
            connection: None,
        }
    }

    /// Feed local changes from a filesystem watcher instead of polling
    #[must_use]
    pub fn with_watch_events(mut self, events: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        self.watch_events = Some(events);
        self
    }

    /// Follow the remote connection's liveness
    #[must_use]
    pub fn with_connection_status(mut self, status: watch::Receiver<ConnectionStatus>) -> Self {
        self.connection = Some(status);
        self
    }

    #[must_use]
    pub fn root(&self) -> &SyncRoot {
        &self.root
    }

    #[must_use]
    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Run the session in the background. Must be called within a tokio
    /// runtime.
    #[must_use]
    pub fn start(self) -> SyncHandle {
        let core = Arc::new(SessionCore::new(self.options.echo_expiry));
        let task = tokio::spawn(supervise(self, Arc::clone(&core)));
        SyncHandle { core, task }
    }

    /// One-shot: initialize, perform the initial sync, stop
    pub async fn run_initial_sync(self) -> Result<SyncReport> {
        let started = Instant::now();
        let core = Arc::new(SessionCore::new(self.options.echo_expiry));
        let Self {
            root,
            transport,
            options,
            ..
        } = self;

        let outcome = async {
            let engine = Engine::initialize(root, transport, options, Arc::clone(&core))?;
            let stats = engine.initial_sync().await?;
            engine.drain().await;
            Ok::<_, SyncError>(stats)
        }
        .await;

        match outcome {
            Ok(stats) => {
                core.set_state(SessionState::Stopped);
                let report = core.report();
                Ok(SyncReport {
                    local_entries: stats.local_entries,
                    remote_entries: stats.remote_entries,
                    planned: stats.planned,
                    counters: report.counters,
                    failing: report.failing,
                    scan_errors: report.scan_errors,
                    elapsed: started.elapsed(),
                })
            }
            Err(err) => {
                error!(error = %err, "initial sync failed");
                core.set_state(SessionState::Failed);
                Err(err)
            }
        }
    }
}

/// Control surface of a running session
#[derive(Debug)]
pub struct SyncHandle {
    core: Arc<SessionCore>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.core.state.borrow()
    }

    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.core.state.subscribe()
    }

    /// Resolve with the first state (current included) matching `predicate`
    pub async fn wait_for_state(
        &self,
        mut predicate: impl FnMut(SessionState) -> bool,
    ) -> SessionState {
        let mut states = self.core.state.subscribe();
        match states.wait_for(|state| predicate(*state)).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    #[must_use]
    pub fn report(&self) -> SessionReport {
        self.core.report()
    }

    /// Force a three-way reconciliation against the last known snapshots
    pub fn request_reconcile(&self) {
        self.core.reconcile.notify_one();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop both directional tasks after their current change, let
    /// in-flight transport calls drain, and return the final report.
    ///
    /// # Errors
    /// Returns `SessionFailed` if the session ended in `Failed`.
    pub async fn stop(self) -> Result<SessionReport> {
        self.core.shutdown.send_replace(true);
        self.task
            .await
            .map_err(|e| SyncError::TaskFailed(e.to_string()))?;

        let report = self.core.report();
        match (report.state, &report.last_error) {
            (SessionState::Failed, Some(err)) => Err(SyncError::SessionFailed(Arc::clone(err))),
            _ => Ok(report),
        }
    }
}

async fn supervise<T: TransportAdapter + 'static>(
    orchestrator: SyncOrchestrator<T>,
    core: Arc<SessionCore>,
) {
    match run_session(orchestrator, Arc::clone(&core)).await {
        Ok(()) => core.set_state(SessionState::Stopped),
        Err(err) => core.fail(err),
    }
}

async fn run_session<T: TransportAdapter + 'static>(
    orchestrator: SyncOrchestrator<T>,
    core: Arc<SessionCore>,
) -> Result<()> {
    let SyncOrchestrator {
        root,
        transport,
        options,
        watch_events,
        mut connection,
    } = orchestrator;

    let engine = Arc::new(Engine::initialize(root, transport, options, core)?);

    // Start batching right away so edits made during the initial sync queue up
    let (feed, batcher) = match watch_events {
        Some(events) => {
            let (tx, rx) = mpsc::channel(BATCH_CHANNEL);
            let batcher = ChangeBatcher::new(engine.options.batcher, engine.matcher.clone());
            let task = tokio::spawn(run_batcher(events, tx, batcher));
            (LocalFeed::Batches(rx), Some(task))
        }
        None => (LocalFeed::Poll, None),
    };

    let result = engine.run(feed, &mut connection).await;
    if let Some(batcher) = batcher {
        batcher.abort();
    }
    result
}

/// Where the local task learns about local changes
enum LocalFeed {
    Poll,
    Batches(mpsc::Receiver<ChangeSet>),
}

/// Why the supervisor interrupted the directional tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Stop,
    ConnectionLost,
    Reconcile,
    TaskEnded,
}

struct InitialStats {
    local_entries: usize,
    remote_entries: usize,
    planned: usize,
}

struct Engine<T> {
    root: SyncRoot,
    transport: RetryingTransport<T>,
    matcher: ExclusionMatcher,
    scanner: Scanner,
    options: SyncOptions,
    core: Arc<SessionCore>,
}

impl<T: TransportAdapter + 'static> Engine<T> {
    fn initialize(
        root: SyncRoot,
        transport: RetryingTransport<T>,
        options: SyncOptions,
        core: Arc<SessionCore>,
    ) -> Result<Self> {
        core.set_state(SessionState::Initializing);
        root.validate()?;
        let matcher = ExclusionMatcher::new(options.exclude.iter().cloned())?;
        let scanner = Scanner::new(root.local())
            .side(Side::Local)
            .hash_contents(options.hash_contents);

        info!(%root, remote = %transport.describe(), rules = matcher.rules().len(), "session initialized");
        Ok(Self {
            root,
            transport,
            matcher,
            scanner,
            options,
            core,
        })
    }

    /// Initial sync, then watch until stopped or failed
    async fn run(
        self: &Arc<Self>,
        mut feed: LocalFeed,
        connection: &mut Option<watch::Receiver<ConnectionStatus>>,
    ) -> Result<()> {
        self.initial_sync().await?;
        let mut shutdown = self.core.shutdown.subscribe();

        while !self.core.stopping() {
            self.core.set_state(SessionState::Watching);
            let (halt_tx, halt_rx) = watch::channel(false);
            let mut local = tokio::spawn(Arc::clone(self).run_local(feed, halt_rx.clone()));
            let mut remote = tokio::spawn(Arc::clone(self).run_remote(halt_rx));

            let mut local_done = None;
            let mut remote_done = None;
            let mut wake = tokio::select! {
                () = halted(&mut shutdown) => Wake::Stop,
                () = connection_lost(connection) => Wake::ConnectionLost,
                () = self.core.reconcile.notified() => Wake::Reconcile,
                joined = &mut local => {
                    local_done = Some(joined);
                    Wake::TaskEnded
                }
                joined = &mut remote => {
                    remote_done = Some(joined);
                    Wake::TaskEnded
                }
            };

            halt_tx.send_replace(true);
            let local_joined = match local_done {
                Some(joined) => joined,
                None => local.await,
            };
            let remote_joined = match remote_done {
                Some(joined) => joined,
                None => remote.await,
            };
            let (returned_feed, local_result) =
                local_joined.map_err(|e| SyncError::TaskFailed(e.to_string()))?;
            let remote_result = remote_joined.map_err(|e| SyncError::TaskFailed(e.to_string()))?;
            feed = returned_feed;

            if let Err(err) = local_result.and(remote_result) {
                if wake == Wake::Stop {
                    warn!(error = %err, "directional task failed during shutdown");
                } else if is_lost(connection) {
                    warn!(error = %err, "transport failed while the connection is down");
                    wake = Wake::ConnectionLost;
                } else {
                    return Err(err);
                }
            }

            match wake {
                Wake::Stop => break,
                Wake::ConnectionLost => {
                    self.await_reconnect(connection, &mut shutdown).await?;
                    if !self.core.stopping() {
                        self.reconcile().await?;
                    }
                }
                Wake::Reconcile => self.reconcile().await?,
                Wake::TaskEnded => debug!("directional task ended, restarting"),
            }
        }

        self.drain().await;
        Ok(())
    }

    async fn initial_sync(&self) -> Result<InitialStats> {
        self.core.set_state(SessionState::InitialSync);
        let (local, remote) = tokio::try_join!(self.scan_local(), self.list_remote())?;
        let plan = compare_sides(&local, &remote, self.options.policy);
        let stats = InitialStats {
            local_entries: local.len(),
            remote_entries: remote.len(),
            planned: plan.total_operations(),
        };
        info!(
            local = stats.local_entries,
            remote = stats.remote_entries,
            push = plan.to_remote.len(),
            pull = plan.to_local.len(),
            "initial sync planned"
        );

        self.apply_plan(&plan, local, remote).await?;

        let counters = lock(&self.core.shared).record.counters;
        info!(
            pushed = counters.pushed,
            pulled = counters.pulled,
            deleted_remote = counters.deleted_remote,
            deleted_local = counters.deleted_local,
            "initial sync complete"
        );
        Ok(stats)
    }

    /// Three-way comparison of both sides against the last known snapshots
    async fn reconcile(&self) -> Result<()> {
        self.core.set_state(SessionState::Reconciling);
        let (local, remote) = tokio::try_join!(self.scan_local(), self.list_remote())?;
        let (base_local, base_remote) = {
            let shared = lock(&self.core.shared);
            (
                Arc::clone(&shared.local_known),
                Arc::clone(&shared.remote_known),
            )
        };

        let plan = plan_reconcile(&base_local, &local, &base_remote, &remote);
        let operations = plan.total_operations();
        let conflicts = plan.conflicts.len();
        info!(operations, conflicts, "reconciling");

        self.apply_plan(&plan, local, remote).await?;
        lock(&self.core.shared)
            .record
            .push_event(SyncEvent::Reconciled {
                operations,
                conflicts,
            });
        Ok(())
    }

    /// Apply a plan and install the resulting snapshots as the new baseline
    async fn apply_plan(&self, plan: &SyncPlan, mut local: Snapshot, mut remote: Snapshot) -> Result<()> {
        for (conflict, resolution) in &plan.conflicts {
            self.note_conflict(&conflict.path, *resolution);
        }

        self.apply_changes(&plan.to_remote, &mut remote).await?;
        self.apply_changes(&plan.to_local, &mut local).await?;

        let mut shared = lock(&self.core.shared);
        shared.local_known = Arc::new(local);
        shared.remote_known = Arc::new(remote);
        Ok(())
    }

    /// Apply a change set in order, updating `target` with each success
    async fn apply_changes(&self, changes: &ChangeSet, target: &mut Snapshot) -> Result<()> {
        let removals = changes.removed.iter().map(|c| (&c.path, None));
        let upserts = changes.upserts().map(|c| (&c.path, Some(&c.meta)));

        for (path, state) in removals.chain(upserts) {
            if self.core.stopping() {
                break;
            }
            let result = match changes.direction {
                Direction::LocalToRemote => self.push_entry(path, state).await,
                Direction::RemoteToLocal => self.pull_entry(path, state).await,
            };
            if let Some(after) = self.settle(path, result)? {
                set_entry(target, path, after);
            }
        }
        Ok(())
    }

    async fn run_local(
        self: Arc<Self>,
        mut feed: LocalFeed,
        mut halt: watch::Receiver<bool>,
    ) -> (LocalFeed, Result<()>) {
        let result = loop {
            let outcome = match &mut feed {
                LocalFeed::Batches(batches) => self.follow_batches(batches, &mut halt).await,
                LocalFeed::Poll => self.poll_local(&mut halt).await.map(|()| false),
            };
            match outcome {
                Ok(true) => {
                    warn!("watch feed closed, polling the local tree instead");
                    feed = LocalFeed::Poll;
                }
                other => break other.map(|_| ()),
            }
        };
        (feed, result)
    }

    /// Returns `Ok(true)` when the feed closed
    async fn follow_batches(
        &self,
        batches: &mut mpsc::Receiver<ChangeSet>,
        halt: &mut watch::Receiver<bool>,
    ) -> Result<bool> {
        loop {
            let batch = tokio::select! {
                () = halted(halt) => return Ok(false),
                batch = batches.recv() => batch,
            };
            let Some(batch) = batch else {
                return Ok(true);
            };
            debug!(changes = batch.len(), "local batch");
            let paths = batch.changes().map(|c| c.path.clone()).collect();
            self.push_local_changes(paths, halt).await?;
        }
    }

    async fn poll_local(&self, halt: &mut watch::Receiver<bool>) -> Result<()> {
        loop {
            tokio::select! {
                () = halted(halt) => return Ok(()),
                () = tokio::time::sleep(self.options.poll_interval) => {}
            }

            let scan = self.scan_local().await?;
            let previous = self.known(Side::Local);
            let changes = diff(&previous, &scan, Direction::LocalToRemote);
            if changes.is_empty() {
                continue;
            }
            debug!(changes = changes.len(), "local poll found changes");
            let paths = changes.changes().map(|c| c.path.clone()).collect();
            self.push_local_changes(paths, halt).await?;
        }
    }

    /// Propagate the current local state of each path. New directories are
    /// expanded, since a watcher may report only the directory itself.
    async fn push_local_changes(
        &self,
        paths: Vec<RelPath>,
        halt: &watch::Receiver<bool>,
    ) -> Result<()> {
        let mut queue: VecDeque<RelPath> = paths.into();
        let mut expanded: Vec<RelPath> = Vec::new();

        while let Some(path) = queue.pop_front() {
            if *halt.borrow() {
                break;
            }
            let result = self.push_local_change(&path).await;
            let new_dir = self.settle(&path, result)?.unwrap_or(false);
            if !new_dir || expanded.iter().any(|dir| path.is_within(dir)) {
                continue;
            }

            let result = self.scan_local_subtree(&path).await;
            if let Some(subtree) = self.settle(&path, result)? {
                queue.extend(subtree.paths().cloned());
            }
            expanded.push(path);
        }
        Ok(())
    }

    /// Returns whether a directory new to the remote was created
    async fn push_local_change(&self, path: &RelPath) -> Result<bool> {
        let current = self.stat_local(path).await?;
        if current
            .as_ref()
            .is_some_and(|meta| self.matcher.is_excluded(path, meta.kind))
        {
            return Ok(false);
        }
        let fingerprint = Fingerprint::of(current.as_ref());

        let known_dir = {
            let mut guard = lock(&self.core.shared);
            let shared = &mut *guard;
            let known = shared.local_known.get(path);
            if same_state(known, current.as_ref()) {
                // Already in the baseline; drop any echo it would have matched
                shared.echoes.take_match(Side::Local, path, &fingerprint);
                return Ok(false);
            }
            let known_dir = known.is_some_and(EntryMeta::is_dir);

            if shared.echoes.take_match(Side::Local, path, &fingerprint) {
                debug!(%path, "suppressed local echo");
                shared.record.counters.echoes_suppressed += 1;
                shared.record.push_event(SyncEvent::EchoSuppressed {
                    path: path.clone(),
                    side: Side::Local,
                });
                set_entry(Arc::make_mut(&mut shared.local_known), path, current);
                return Ok(false);
            }
            known_dir
        };

        self.check_remote_before_push(path, current.as_ref()).await;
        self.push_entry(path, current.as_ref()).await?;
        set_entry(
            Arc::make_mut(&mut lock(&self.core.shared).local_known),
            path,
            current.clone(),
        );
        debug!(%path, "pushed local change");
        Ok(current.as_ref().is_some_and(EntryMeta::is_dir) && !known_dir)
    }

    /// Note a conflict when the remote changed `path` since it was last
    /// listed and the push about to happen would overwrite that change before
    /// the remote poll sees it
    async fn check_remote_before_push(&self, path: &RelPath, local: Option<&EntryMeta>) {
        let observed = match self.transport.stat(path).await {
            Ok(observed) => observed,
            Err(e) => {
                // The push reports the failure if the remote is really gone
                debug!(%path, error = %e, "cannot check remote state before push");
                return;
            }
        };

        {
            let mut guard = lock(&self.core.shared);
            let shared = &mut *guard;
            if same_content(shared.remote_known.get(path), observed.as_ref())
                || same_content(local, observed.as_ref())
                || shared
                    .echoes
                    .has_pending(Side::Remote, path, &Fingerprint::of(observed.as_ref()))
            {
                return;
            }
            // The poll must not count the overwritten state a second time
            set_entry(Arc::make_mut(&mut shared.remote_known), path, observed);
        }
        self.note_conflict(path, Resolution::UseLocal);
    }

    async fn run_remote(self: Arc<Self>, mut halt: watch::Receiver<bool>) -> Result<()> {
        let root = RelPath::root();
        loop {
            tokio::select! {
                () = halted(&mut halt) => return Ok(()),
                () = tokio::time::sleep(self.options.poll_interval) => {}
            }

            let result = self.list_remote().await;
            let Some(listing) = self.settle(&root, result)? else {
                continue;
            };
            let previous = self.known(Side::Remote);
            let changes = diff(&previous, &listing, Direction::RemoteToLocal);
            if changes.is_empty() {
                continue;
            }
            debug!(changes = changes.len(), "remote poll found changes");

            let removals = changes.removed.iter().map(|c| (&c.path, None));
            let upserts = changes.upserts().map(|c| (&c.path, Some(&c.meta)));
            for (path, state) in removals.chain(upserts) {
                if *halt.borrow() {
                    break;
                }
                let result = self.pull_remote_change(path, state).await;
                self.settle(path, result)?;
            }
        }
    }

    /// Apply one observed remote change locally unless it is an echo, the
    /// local side already agrees, or a pending local change takes priority
    async fn pull_remote_change(&self, path: &RelPath, remote: Option<&EntryMeta>) -> Result<()> {
        let fingerprint = Fingerprint::of(remote);
        {
            let mut guard = lock(&self.core.shared);
            let shared = &mut *guard;
            if shared.echoes.take_match(Side::Remote, path, &fingerprint) {
                debug!(%path, "suppressed remote echo");
                shared.record.counters.echoes_suppressed += 1;
                shared.record.push_event(SyncEvent::EchoSuppressed {
                    path: path.clone(),
                    side: Side::Remote,
                });
                set_entry(Arc::make_mut(&mut shared.remote_known), path, remote.cloned());
                return Ok(());
            }
        }

        let local = self.stat_local(path).await?;
        // A remote directory removal must not take pending local additions with it
        let subtree = match (&local, remote) {
            (Some(meta), None) if meta.is_dir() => Some(self.scan_local_subtree(path).await?),
            _ => None,
        };

        {
            let mut guard = lock(&self.core.shared);
            let shared = &mut *guard;
            if same_content(local.as_ref(), remote) {
                set_entry(Arc::make_mut(&mut shared.remote_known), path, remote.cloned());
                set_entry(Arc::make_mut(&mut shared.local_known), path, local);
                return Ok(());
            }

            let known = &shared.local_known;
            let local_pending = !same_state(known.get(path), local.as_ref())
                || subtree.as_ref().is_some_and(|subtree| {
                    subtree
                        .iter()
                        .any(|(p, meta)| !same_state(known.get(p), Some(meta)))
                });
            if local_pending {
                set_entry(Arc::make_mut(&mut shared.remote_known), path, remote.cloned());
                drop(guard);
                self.note_conflict(path, Resolution::UseLocal);
                return Ok(());
            }
        }

        let after = self.pull_entry(path, remote).await?;
        let mut shared = lock(&self.core.shared);
        set_entry(Arc::make_mut(&mut shared.local_known), path, after);
        set_entry(Arc::make_mut(&mut shared.remote_known), path, remote.cloned());
        debug!(%path, "pulled remote change");
        Ok(())
    }

    /// Make the remote match `state` (the local state) at `path`. Returns
    /// the remote state afterwards.
    async fn push_entry(&self, path: &RelPath, state: Option<&EntryMeta>) -> Result<Option<EntryMeta>> {
        match state {
            None => {
                let fingerprint = Fingerprint::Absent;
                self.remember(Side::Remote, path, fingerprint);
                let result = self.transport.delete(path).await;
                self.remote_outcome(path, fingerprint, result)?;
                lock(&self.core.shared).record.counters.deleted_remote += 1;
                debug!(%path, "deleted on remote");
                Ok(None)
            }
            Some(meta) if meta.is_dir() => {
                let fingerprint = Fingerprint::Dir;
                self.remember(Side::Remote, path, fingerprint);
                let result = self.transport.mkdir(path).await;
                self.remote_outcome(path, fingerprint, result)?;
                lock(&self.core.shared).record.counters.pushed += 1;
                debug!(%path, "created directory on remote");
                Ok(Some(EntryMeta::dir()))
            }
            Some(_) => {
                let root = self.root.local().to_path_buf();
                let target = path.clone();
                let content = self
                    .local_io(path, move || local_fs::read_file(&root, &target))
                    .await?;
                let written = EntryMeta::for_content(&content);
                let fingerprint = Fingerprint::of(Some(&written));

                self.remember(Side::Remote, path, fingerprint);
                let result = self.transport.push(path, Bytes::from(content)).await;
                self.remote_outcome(path, fingerprint, result)?;

                {
                    let mut shared = lock(&self.core.shared);
                    shared.record.counters.pushed += 1;
                    shared.record.counters.bytes_pushed += written.size;
                }
                debug!(%path, size = written.size, "pushed file");
                Ok(Some(written))
            }
        }
    }

    /// Make the local side match `state` (the remote state) at `path`.
    /// Returns the local state afterwards.
    async fn pull_entry(&self, path: &RelPath, state: Option<&EntryMeta>) -> Result<Option<EntryMeta>> {
        let root = self.root.local().to_path_buf();
        let target = path.clone();
        match state {
            None => {
                let fingerprint = Fingerprint::Absent;
                self.remember(Side::Local, path, fingerprint);
                let result = self
                    .local_io(path, move || local_fs::remove(&root, &target))
                    .await;
                self.local_outcome(path, fingerprint, result)?;
                lock(&self.core.shared).record.counters.deleted_local += 1;
                debug!(%path, "deleted locally");
                Ok(None)
            }
            Some(meta) if meta.is_dir() => {
                let fingerprint = Fingerprint::Dir;
                self.remember(Side::Local, path, fingerprint);
                let result = self
                    .local_io(path, move || local_fs::create_dir(&root, &target))
                    .await;
                self.local_outcome(path, fingerprint, result)?;
                lock(&self.core.shared).record.counters.pulled += 1;
                debug!(%path, "created directory locally");
                Ok(Some(EntryMeta::dir()))
            }
            Some(_) => {
                let content = self
                    .transport
                    .pull(path)
                    .await
                    .map_err(|e| SyncError::from_transport(path, e))?;
                let size = content.len() as u64;
                let fingerprint = Fingerprint::of(Some(&EntryMeta::for_content(&content)));

                self.remember(Side::Local, path, fingerprint);
                let result = self
                    .local_io(path, move || local_fs::write_file(&root, &target, &content))
                    .await;
                self.local_outcome(path, fingerprint, result)?;

                {
                    let mut shared = lock(&self.core.shared);
                    shared.record.counters.pulled += 1;
                    shared.record.counters.bytes_pulled += size;
                }
                debug!(%path, size, "pulled file");
                self.stat_local(path).await
            }
        }
    }

    /// Record the state `side` is about to take on at `path`
    fn remember(&self, side: Side, path: &RelPath, fingerprint: Fingerprint) {
        lock(&self.core.shared).echoes.record(side, path, fingerprint);
    }

    fn remote_outcome(
        &self,
        path: &RelPath,
        fingerprint: Fingerprint,
        result: Result<(), TransportError>,
    ) -> Result<()> {
        result.map_err(|err| {
            lock(&self.core.shared)
                .echoes
                .forget(Side::Remote, path, &fingerprint);
            SyncError::from_transport(path, err)
        })
    }

    fn local_outcome(&self, path: &RelPath, fingerprint: Fingerprint, result: Result<()>) -> Result<()> {
        if result.is_err() {
            lock(&self.core.shared)
                .echoes
                .forget(Side::Local, path, &fingerprint);
        }
        result
    }

    /// Keep per-entry failures in the report and let the session go on;
    /// anything else propagates
    fn settle<R>(&self, path: &RelPath, result: Result<R>) -> Result<Option<R>> {
        match result {
            Ok(value) => {
                lock(&self.core.shared).record.failing.remove(path);
                Ok(Some(value))
            }
            Err(err) if !err.is_fatal() => {
                warn!(%path, error = %err, "sync failed for entry");
                lock(&self.core.shared)
                    .record
                    .failing
                    .insert(path.clone(), err.to_string());
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn note_conflict(&self, path: &RelPath, resolution: Resolution) {
        let mut shared = lock(&self.core.shared);
        if resolution == Resolution::UseLocal {
            warn!(%path, "changed on both sides, keeping the local state");
            shared.record.counters.conflicts_resolved += 1;
        } else {
            debug!(%path, ?resolution, "both sides changed identically");
        }
        shared.record.push_event(SyncEvent::ConflictResolved {
            path: path.clone(),
            resolution,
        });
    }

    fn known(&self, side: Side) -> Arc<Snapshot> {
        let shared = lock(&self.core.shared);
        match side {
            Side::Local => Arc::clone(&shared.local_known),
            Side::Remote => Arc::clone(&shared.remote_known),
        }
    }

    async fn scan_local(&self) -> Result<Snapshot> {
        let scanner = self.scanner.clone();
        let matcher = self.matcher.clone();
        let snapshot = blocking(move || scanner.scan(&matcher)).await??;
        lock(&self.core.shared)
            .record
            .set_scan_errors(Side::Local, snapshot.errors());
        Ok(snapshot)
    }

    async fn scan_local_subtree(&self, path: &RelPath) -> Result<Snapshot> {
        let scanner = self.scanner.clone();
        let matcher = self.matcher.clone();
        let start = path.clone();
        blocking(move || scanner.scan_subtree(&start, &matcher)).await?
    }

    async fn list_remote(&self) -> Result<Snapshot> {
        let root = RelPath::root();
        let listing = self
            .transport
            .list(&root)
            .await
            .map_err(|e| SyncError::from_transport(&root, e))?
            .filtered(&self.matcher);
        lock(&self.core.shared)
            .record
            .set_scan_errors(Side::Remote, listing.errors());
        Ok(listing)
    }

    async fn stat_local(&self, path: &RelPath) -> Result<Option<EntryMeta>> {
        let scanner = self.scanner.clone();
        let target = path.clone();
        self.local_io(path, move || scanner.entry(&target)).await
    }

    async fn local_io<R, F>(&self, path: &RelPath, f: F) -> Result<R>
    where
        F: FnOnce() -> io::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        blocking(f).await?.map_err(|source| SyncError::LocalIo {
            path: path.clone(),
            source,
        })
    }

    async fn await_reconnect(
        &self,
        connection: &mut Option<watch::Receiver<ConnectionStatus>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        self.core.set_state(SessionState::Reconciling);
        lock(&self.core.shared)
            .record
            .push_event(SyncEvent::ConnectionLost);
        let Some(status) = connection.as_mut() else {
            return Ok(());
        };

        let timeout = self.options.reconnect_timeout;
        warn!(?timeout, "remote connection lost, waiting for it to return");
        let restored = tokio::select! {
            () = halted(shutdown) => return Ok(()),
            result = tokio::time::timeout(
                timeout,
                status.wait_for(|s| *s == ConnectionStatus::Connected),
            ) => matches!(result, Ok(Ok(_))),
        };

        if !restored {
            let root = RelPath::root();
            return Err(SyncError::TransportUnavailable(TransportError::Unavailable {
                op: Op::List,
                path: root.clone(),
                attempts: 0,
                last: Box::new(TransportError::Transient {
                    op: Op::List,
                    path: root,
                    message: format!("connection not restored within {timeout:?}"),
                }),
            }));
        }

        info!("remote connection restored");
        lock(&self.core.shared)
            .record
            .push_event(SyncEvent::ConnectionRestored);
        Ok(())
    }

    /// Wait for in-flight transport calls, bounded by the retry ceiling
    async fn drain(&self) {
        let bound = self.options.retry.worst_case_delay() + DRAIN_GRACE;
        if tokio::time::timeout(bound, self.transport.wait_idle())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.transport.in_flight().len(),
                "transport calls still running at shutdown"
            );
        }
    }
}

async fn blocking<R, F>(f: F) -> Result<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::TaskFailed(e.to_string()))
}

async fn halted(signal: &mut watch::Receiver<bool>) {
    // A dropped sender also means stop
    let _ = signal.wait_for(|stop| *stop).await;
}

/// Resolves when the connection is reported lost; never without a monitor
async fn connection_lost(connection: &mut Option<watch::Receiver<ConnectionStatus>>) {
    let reported = match connection.as_mut() {
        Some(status) => status
            .wait_for(|s| *s == ConnectionStatus::Lost)
            .await
            .is_ok(),
        None => false,
    };
    if reported {
        return;
    }
    *connection = None;
    std::future::pending::<()>().await;
}

fn is_lost(connection: &Option<watch::Receiver<ConnectionStatus>>) -> bool {
    connection
        .as_ref()
        .is_some_and(|status| *status.borrow() == ConnectionStatus::Lost)
}

fn same_state(a: Option<&EntryMeta>, b: Option<&EntryMeta>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.same_state(b),
        _ => false,
    }
}

fn same_content(a: Option<&EntryMeta>, b: Option<&EntryMeta>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.same_content(b),
        _ => false,
    }
}

fn set_entry(snapshot: &mut Snapshot, path: &RelPath, state: Option<EntryMeta>) {
    match state {
        Some(meta) => snapshot.upsert(path.clone(), meta),
        None => snapshot.remove_subtree(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converge::{ConvergenceWaiter, LocalObserver, PathExpectation};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    /// In-memory remote, enough to drive the engine without a filesystem
    #[derive(Default)]
    struct MemoryRemote {
        entries: Mutex<BTreeMap<RelPath, Option<Bytes>>>,
    }

    impl MemoryRemote {
        fn file(&self, path: &str) -> Option<Bytes> {
            lock(&self.entries)
                .get(&RelPath::new(path).unwrap())
                .cloned()
                .flatten()
        }

        fn put(&self, path: &str, content: &'static [u8]) {
            lock(&self.entries).insert(
                RelPath::new(path).unwrap(),
                Some(Bytes::from_static(content)),
            );
        }
    }

    #[async_trait]
    impl TransportAdapter for MemoryRemote {
        async fn push(&self, path: &RelPath, content: Bytes) -> Result<(), TransportError> {
            let mut entries = lock(&self.entries);
            for parent in path.ancestors().filter(|p| !p.is_root()) {
                entries.insert(parent, None);
            }
            entries.insert(path.clone(), Some(content));
            Ok(())
        }

        async fn pull(&self, path: &RelPath) -> Result<Bytes, TransportError> {
            lock(&self.entries)
                .get(path)
                .cloned()
                .flatten()
                .ok_or_else(|| TransportError::NotFound { path: path.clone() })
        }

        async fn delete(&self, path: &RelPath) -> Result<(), TransportError> {
            lock(&self.entries).retain(|p, _| !p.is_within(path));
            Ok(())
        }

        async fn mkdir(&self, path: &RelPath) -> Result<(), TransportError> {
            let mut entries = lock(&self.entries);
            for parent in path.ancestors().filter(|p| !p.is_root()) {
                entries.insert(parent, None);
            }
            entries.insert(path.clone(), None);
            Ok(())
        }

        async fn list(&self, _root: &RelPath) -> Result<Snapshot, TransportError> {
            let entries = lock(&self.entries)
                .iter()
                .map(|(path, content)| {
                    let meta = match content {
                        Some(content) => EntryMeta::for_content(content),
                        None => EntryMeta::dir(),
                    };
                    (path.clone(), meta)
                })
                .collect::<Vec<_>>();
            Ok(Snapshot::from_entries(Side::Remote, entries))
        }

        fn describe(&self) -> String {
            "memory".into()
        }
    }

    fn rel(s: &str) -> RelPath {
        RelPath::new(s).unwrap()
    }

    fn fast_options() -> SyncOptions {
        SyncOptions::default().poll_interval(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_initial_sync_pushes_and_removes() {
        let local = TempDir::new().unwrap();
        std::fs::write(local.path().join("a.txt"), "A").unwrap();
        std::fs::create_dir(local.path().join("d")).unwrap();
        std::fs::write(local.path().join("d/b.txt"), "B").unwrap();

        let remote = Arc::new(MemoryRemote::default());
        remote.put("stale.txt", b"old");

        let root = SyncRoot::new(local.path(), "memory").unwrap();
        let report = SyncOrchestrator::new(root, Arc::clone(&remote), SyncOptions::default())
            .run_initial_sync()
            .await
            .unwrap();

        assert_eq!(remote.file("a.txt").as_deref(), Some(&b"A"[..]));
        assert_eq!(remote.file("d/b.txt").as_deref(), Some(&b"B"[..]));
        assert_eq!(remote.file("stale.txt"), None);
        assert_eq!(report.counters.pushed, 3);
        assert_eq!(report.counters.deleted_remote, 1);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_invalid_pattern_fails_initialization() {
        let local = TempDir::new().unwrap();
        let root = SyncRoot::new(local.path(), "memory").unwrap();
        let options = SyncOptions::default().exclude([ExclusionRule::new("")]);

        let err = SyncOrchestrator::new(root, MemoryRemote::default(), options)
            .run_initial_sync()
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidExclusionPattern { .. }));
    }

    #[tokio::test]
    async fn test_watching_pulls_remote_and_pushes_local() {
        let local = TempDir::new().unwrap();
        let remote = Arc::new(MemoryRemote::default());
        let root = SyncRoot::new(local.path(), "memory").unwrap();

        let handle = SyncOrchestrator::new(root, Arc::clone(&remote), fast_options()).start();
        handle
            .wait_for_state(|s| s == SessionState::Watching)
            .await;

        remote.put("from-remote.txt", b"R");
        std::fs::write(local.path().join("from-local.txt"), "L").unwrap();

        let waiter = ConvergenceWaiter::new(
            LocalObserver::new(local.path()),
            crate::converge::TransportObserver::new(Arc::clone(&remote)),
        )
        .with_interval(Duration::from_millis(10));
        waiter
            .await_convergence(
                &[
                    PathExpectation::mirrored_file(rel("from-remote.txt"), "R"),
                    PathExpectation::mirrored_file(rel("from-local.txt"), "L"),
                ],
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        // The pushed file comes back on the next remote poll as an echo
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.report().counters.echoes_suppressed == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let report = handle.stop().await.unwrap();
        assert_eq!(report.state, SessionState::Stopped);
        assert_eq!(remote.file("from-local.txt").as_deref(), Some(&b"L"[..]));
    }

    #[tokio::test]
    async fn test_stop_reaches_stopped() {
        let local = TempDir::new().unwrap();
        let root = SyncRoot::new(local.path(), "memory").unwrap();
        let handle = SyncOrchestrator::new(root, MemoryRemote::default(), fast_options()).start();

        handle
            .wait_for_state(|s| s == SessionState::Watching)
            .await;
        let report = handle.stop().await.unwrap();
        assert_eq!(report.state, SessionState::Stopped);
        assert!(report.last_error.is_none());
    }

    #[test]
    fn test_set_entry_replaces_subtree() {
        let mut snapshot = Snapshot::from_entries(
            Side::Local,
            [
                (rel("d"), EntryMeta::dir()),
                (rel("d/f"), EntryMeta::for_content(b"f")),
            ],
        );
        set_entry(&mut snapshot, &rel("d"), Some(EntryMeta::for_content(b"file")));
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get(&rel("d")).unwrap().is_file());

        set_entry(&mut snapshot, &rel("d"), None);
        assert!(snapshot.is_empty());
    }
}
