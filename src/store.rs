//! Main Store struct tying all components together.

use crate::error::{Result, StoreError};
use crate::records::{Change, Journal, JournalEntry, TodoTable};
use crate::subscriptions::{
    DropReason, LiveQuery, Query, QueryResult, SubscriptionHandle, SubscriptionId,
    SubscriptionManager,
};
use crate::transaction::{Transaction, TransactionReceipt};
use crate::types::{Sequence, StoreStats, Timestamp, Todo, TodoId};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, info};

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Journal directory. `None` keeps everything in memory.
    pub path: Option<PathBuf>,

    /// Fsync the journal every N commits.
    pub sync_interval: u64,

    /// Max buffered events per channel subscription before it is dropped.
    pub channel_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            sync_interval: 1,
            channel_buffer_size: 1000,
        }
    }
}

impl StoreConfig {
    /// A store that is lost when dropped.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// A store journaled under `path`.
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }
}

/// The reactive todo store.
///
/// Provides a unified interface for:
/// - Applying transactions atomically (`apply`, `apply_with`)
/// - Reading snapshots (`snapshot_matching`, `get`)
/// - Live queries (`subscribe`, `subscribe_channel`)
///
/// All mutation goes through one write lock. Notifications for a batch are
/// delivered while that lock is still held, so a subscriber sees batches in
/// commit order and never sees one before it is committed.
pub struct Store {
    config: StoreConfig,

    table: RwLock<TodoTable>,

    journal: Option<Journal>,

    subscriptions: Arc<SubscriptionManager>,

    /// Lock for write operations to ensure atomicity.
    write_lock: Mutex<()>,

    /// Thread currently running subscriber callbacks.
    delivering_on: Mutex<Option<ThreadId>>,

    /// Set by [`Store::close`]; rejects further writes and subscriptions.
    closed: AtomicBool,
}

impl Store {
    /// Open a store, replaying its journal if it has one.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let mut table = TodoTable::new();

        let journal = match config.path {
            Some(ref path) => {
                let (journal, entries) = Journal::open(path, config.sync_interval)?;
                let replayed = entries.len();
                for entry in entries {
                    Self::replay(&mut table, entry)?;
                }
                info!(
                    path = %path.display(),
                    batches = replayed,
                    todos = table.len(),
                    "store opened"
                );
                Some(journal)
            }
            None => None,
        };

        Ok(Self {
            config,
            table: RwLock::new(table),
            journal,
            subscriptions: Arc::new(SubscriptionManager::new()),
            write_lock: Mutex::new(()),
            delivering_on: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// An empty in-memory store.
    pub fn in_memory() -> Self {
        Self {
            config: StoreConfig::in_memory(),
            table: RwLock::new(TodoTable::new()),
            journal: None,
            subscriptions: Arc::new(SubscriptionManager::new()),
            write_lock: Mutex::new(()),
            delivering_on: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn replay(table: &mut TodoTable, entry: JournalEntry) -> Result<()> {
        let expected = table.sequence().next();
        if entry.sequence != expected {
            return Err(StoreError::Load(format!(
                "journal out of order: expected {:?}, found {:?}",
                expected, entry.sequence
            )));
        }

        let tx = Transaction::from(entry.operations);
        let staged = table.stage(&tx).map_err(|e| {
            StoreError::Load(format!("journal batch {:?} no longer applies: {}", entry.sequence, e))
        })?;
        table.commit(&staged);
        Ok(())
    }

    // --- Mutation ---

    /// Apply a transaction atomically.
    ///
    /// Either every operation takes effect and affected subscribers are
    /// notified once, or the store is unchanged and nobody is notified.
    /// An empty transaction is a no-op.
    pub fn apply(&self, tx: Transaction) -> Result<TransactionReceipt> {
        self.apply_with(move |_| Ok(tx))
    }

    /// Build a transaction from the current state and apply it.
    ///
    /// `build` runs under the write lock, so the state it reads is exactly
    /// the state the transaction is applied to.
    pub fn apply_with<F>(&self, build: F) -> Result<TransactionReceipt>
    where
        F: FnOnce(&TodoTable) -> Result<Transaction>,
    {
        self.ensure_not_delivering("apply")?;
        let _lock = self.write_lock.lock();
        self.ensure_open()?;

        let (tx, staged) = {
            let table = self.table.read();
            let tx = build(&table)?;
            if tx.is_empty() {
                return Ok(TransactionReceipt {
                    sequence: table.sequence(),
                    changed: 0,
                    committed_at: Timestamp::now(),
                });
            }
            let staged = table.stage(&tx)?;
            (tx, staged)
        };

        let committed_at = Timestamp::now();
        if let Some(ref journal) = self.journal {
            let entry = JournalEntry {
                sequence: staged.sequence,
                timestamp: committed_at,
                operations: tx.into_operations(),
            };
            journal
                .append(&entry)
                .map_err(|e| StoreError::Transaction(format!("journal write failed: {}", e)))?;
        }

        self.table.write().commit(&staged);

        debug!(
            sequence = staged.sequence.0,
            changed = staged.changes.len(),
            "batch committed"
        );

        self.notify(staged.sequence, &staged.changes);

        Ok(TransactionReceipt {
            sequence: staged.sequence,
            changed: staged.changes.len(),
            committed_at,
        })
    }

    /// Deliver fresh results to every subscription touched by `changes`.
    /// Called with the write lock held.
    fn notify(&self, sequence: Sequence, changes: &[Change]) {
        if changes.is_empty() {
            return;
        }

        let targets = self.subscriptions.affected(changes);
        if targets.is_empty() {
            return;
        }

        let results: Vec<(SubscriptionId, QueryResult)> = {
            let table = self.table.read();
            targets
                .into_iter()
                .map(|(id, query)| {
                    let todos = table.snapshot_matching(|t| query.matches(t));
                    (id, QueryResult { todos, sequence })
                })
                .collect()
        };

        let _delivering = DeliveryGuard::enter(&self.delivering_on);
        for (id, result) in results {
            self.subscriptions.deliver(id, result);
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn ensure_not_delivering(&self, operation: &'static str) -> Result<()> {
        if *self.delivering_on.lock() == Some(thread::current().id()) {
            return Err(StoreError::ReentrantCall(operation));
        }
        Ok(())
    }

    // --- Reads ---

    /// Current todos satisfying `query`.
    pub fn snapshot_matching(&self, query: &Query) -> QueryResult {
        let table = self.table.read();
        QueryResult {
            todos: table.snapshot_matching(|t| query.matches(t)),
            sequence: table.sequence(),
        }
    }

    /// Get a todo by ID.
    pub fn get(&self, id: &TodoId) -> Option<Todo> {
        self.table.read().get(id).cloned()
    }

    /// Sequence of the last committed batch.
    pub fn sequence(&self) -> Sequence {
        self.table.read().sequence()
    }

    // --- Subscriptions ---

    /// Subscribe a callback to a query.
    ///
    /// The returned handle carries the current matching set. `callback` is
    /// then invoked once per committed batch that changes the matching set,
    /// on the committing thread. It must not call `apply` or `subscribe` on
    /// this store (those return [`StoreError::ReentrantCall`]); reads and
    /// unsubscribing are fine.
    pub fn subscribe<F>(&self, query: Query, callback: F) -> Result<LiveQuery>
    where
        F: FnMut(&QueryResult) + Send + 'static,
    {
        self.ensure_not_delivering("subscribe")?;
        let _lock = self.write_lock.lock();
        self.ensure_open()?;

        let initial = self.snapshot_matching(&query);
        let (id, active) = self.subscriptions.register_callback(query, Box::new(callback));

        Ok(LiveQuery {
            id,
            initial,
            active,
            manager: Arc::downgrade(&self.subscriptions),
        })
    }

    /// Subscribe to a query through a bounded channel.
    ///
    /// The first event is the current matching set.
    pub fn subscribe_channel(&self, query: Query) -> Result<SubscriptionHandle> {
        self.ensure_not_delivering("subscribe")?;
        let _lock = self.write_lock.lock();
        self.ensure_open()?;

        let initial = self.snapshot_matching(&query);
        Ok(self
            .subscriptions
            .register_channel(query, self.config.channel_buffer_size, initial))
    }

    /// Unsubscribe and clean up.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.unsubscribe(id)
    }

    /// Get the number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.subscription_count()
    }

    // --- Lifecycle ---

    /// Close the store.
    ///
    /// Waits for any in-flight batch, drops every subscription with
    /// [`DropReason::Closed`] and syncs the journal. Afterwards `apply`,
    /// `subscribe` and `subscribe_channel` fail with [`StoreError::Closed`]
    /// for every holder of this store; reads keep working. Closing twice is
    /// a no-op.
    pub fn close(&self) -> Result<()> {
        self.ensure_not_delivering("close")?;
        let _lock = self.write_lock.lock();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.subscriptions.close_all(DropReason::Closed);
        self.sync()?;
        info!(persistent = self.journal.is_some(), "store closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // --- Store Operations ---

    /// Get store statistics.
    pub fn stats(&self) -> StoreStats {
        let table = self.table.read();
        StoreStats {
            todo_count: table.len() as u64,
            done_count: table.iter().filter(|t| t.done).count() as u64,
            sequence: table.sequence(),
            subscription_count: self.subscriptions.subscription_count() as u64,
            journal_bytes: self.journal.as_ref().map_or(0, Journal::size),
        }
    }

    /// Sync the journal to disk.
    pub fn sync(&self) -> Result<()> {
        match self.journal {
            Some(ref journal) => journal.sync(),
            None => Ok(()),
        }
    }

    /// Journal directory, if the store is persistent.
    pub fn path(&self) -> Option<&Path> {
        self.config.path.as_deref()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}

/// Marks the current thread as delivering notifications until dropped.
struct DeliveryGuard<'a> {
    slot: &'a Mutex<Option<ThreadId>>,
}

impl<'a> DeliveryGuard<'a> {
    fn enter(slot: &'a Mutex<Option<ThreadId>>) -> Self {
        *slot.lock() = Some(thread::current().id());
        Self { slot }
    }
}

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock() = None;
    }
}
