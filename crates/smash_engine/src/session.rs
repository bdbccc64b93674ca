//! Sessions and the background polling loop.
//!
//! A [`Session`] owns one [`SessionClient`], one [`Deduper`], the joined
//! tables and a dedicated polling thread. The thread repeatedly asks the
//! coordination service for rows newer than the session watermark and
//! applies them through the deduper into the tables.
//!
//! Poll thread states:
//!
//! ```text
//! Ended -> Active -> PrepareToStop -> Stopped -> Ended
//! ```
//!
//! Shutdown signals `PrepareToStop`, aborts the in-flight GetRows call and
//! waits for the thread to report `Ended` before the transport is closed.

use crate::client::{Participant, SessionClient};
use crate::config::SessionConfig;
use crate::context::{ChangeContext, SaveHandle, SaveReceipt};
use crate::deduper::Deduper;
use crate::dispatcher::{Dispatcher, ImmediateDispatcher, ThreadDispatcher};
use crate::error::{SmashError, SmashResult};
use crate::record::{Envelope, Payload};
use crate::stats::{SessionStats, StatsCounters};
use crate::table::{RowSink, Table};
use crate::transport::SessionTransport;
use parking_lot::{Condvar, Mutex, RwLock};
use smash_protocol::{DataRow, JoinSessionRequest};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::runtime::Runtime;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// State of a session's polling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Not running.
    Ended,
    /// Polling.
    Active,
    /// Shutdown requested; the current call is being aborted.
    PrepareToStop,
    /// The loop has exited.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RowOrigin {
    /// Returned by the GetRows call issued in the given resync epoch;
    /// advances the watermark.
    Network(u64),
    /// Confirmed by SendRows; never advances the watermark.
    Local,
}

struct Cursor {
    last_known_row_version: u64,
    /// Bumped by every forced resync.
    resync_epoch: u64,
    deduper: Deduper,
}

/// Parameters of one GetRows call.
struct PollTicket {
    last_known: u64,
    cached: bool,
    epoch: u64,
}

pub(crate) struct SessionShared {
    config: SessionConfig,
    client: SessionClient,
    cursor: Mutex<Cursor>,
    tables: RwLock<HashMap<u32, Arc<dyn RowSink>>>,
    dispatcher: Arc<dyn Dispatcher>,
    outbox: ThreadDispatcher,
    state: Mutex<PollState>,
    state_changed: Condvar,
    wake: Notify,
    abort: Notify,
    stats: StatsCounters,
    closed: AtomicBool,
}

impl SessionShared {
    fn poll_state(&self) -> PollState {
        *self.state.lock()
    }

    fn is_active(&self) -> bool {
        self.poll_state() == PollState::Active
    }

    fn set_state(&self, state: PollState) {
        *self.state.lock() = state;
        self.state_changed.notify_all();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn has_table(&self, type_hash: u32) -> bool {
        self.tables.read().contains_key(&type_hash)
    }

    /// Trims the deduper, adapts the transfer budget and returns the
    /// parameters of the next GetRows call.
    fn begin_poll(&self) -> PollTicket {
        let mut cursor = self.cursor.lock();
        let last_known = cursor.last_known_row_version;
        cursor.deduper.apply_retention_window(last_known);
        cursor.deduper.on_transfer_start();
        self.stats.record_poll();
        PollTicket {
            last_known,
            cached: last_known != 0,
            epoch: cursor.resync_epoch,
        }
    }

    /// Resets the watermark so the next GetRows refetches everything.
    fn force_resync(&self, reason: &str) {
        let mut cursor = self.cursor.lock();
        if cursor.last_known_row_version != 0 || !cursor.deduper.is_empty() {
            self.stats.record_resync();
            info!(
                from_version = cursor.last_known_row_version,
                reason, "forcing full resync"
            );
        }
        cursor.last_known_row_version = 0;
        cursor.resync_epoch += 1;
        cursor.deduper.reset();
    }

    fn request_resync(&self, reason: &str) {
        self.force_resync(reason);
        self.abort.notify_one();
    }

    async fn backoff(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_backoff) => {}
            _ = self.abort.notified() => {}
        }
    }

    /// Filters rows through the deduper and dispatches the survivors to
    /// their tables. Returns the number of rows dispatched.
    pub(crate) fn apply_rows(&self, rows: Vec<DataRow>, origin: RowOrigin) -> usize {
        if rows.is_empty() {
            return 0;
        }

        let mut cursor = self.cursor.lock();
        if let RowOrigin::Network(epoch) = origin {
            // Rows fetched before a resync would advance the reset watermark.
            if epoch != cursor.resync_epoch {
                debug!(rows = rows.len(), "dropping rows fetched before a resync");
                return 0;
            }
        }
        let tables = self.tables.read();

        let received = rows.len();
        let mut max_version = 0;
        let mut duplicates = 0;
        let mut unknown = 0;
        let mut accepted = Vec::with_capacity(received);
        for row in rows {
            max_version = max_version.max(row.version);
            if cursor.deduper.is_known(row.guid, row.version) {
                duplicates += 1;
                continue;
            }
            match tables.get(&row.type_hash) {
                Some(sink) => {
                    cursor.deduper.record(row.guid, row.version);
                    accepted.push((Arc::clone(sink), row));
                }
                None => unknown += 1,
            }
        }

        if matches!(origin, RowOrigin::Network(_)) {
            self.stats.record_received(received);
            if max_version > cursor.last_known_row_version {
                cursor.last_known_row_version = max_version;
            }
        }
        self.stats.record_duplicates(duplicates);
        if unknown > 0 {
            self.stats.record_unknown(unknown);
            debug!(rows = unknown, "dropped rows for tables not joined");
        }

        let applied = accepted.len();
        self.stats.record_applied(applied);
        debug!(
            ?origin,
            received,
            applied,
            duplicates,
            watermark = cursor.last_known_row_version,
            "rows filtered"
        );

        if applied > 0 {
            // Dispatch under the cursor lock so tables see rows in dedup order.
            self.dispatcher.dispatch(Box::new(move || {
                for (sink, row) in accepted {
                    if let Err(e) = sink.apply_row(&row) {
                        warn!(
                            table = sink.name(),
                            record = %row.guid,
                            error = %e,
                            "failed to apply row"
                        );
                    }
                }
            }));
        }
        applied
    }

    /// Shows locally committed changes in the table ahead of confirmation.
    pub(crate) fn apply_local<T: Payload>(
        &self,
        table: &Arc<Table<T>>,
        envelopes: Vec<Envelope<T>>,
    ) {
        if envelopes.is_empty() {
            return;
        }
        let _cursor = self.cursor.lock();
        let table = Arc::clone(table);
        self.dispatcher.dispatch(Box::new(move || {
            for envelope in envelopes {
                table.apply_local(envelope);
            }
        }));
    }

    fn discard_pending(&self, type_hash: u32, id: Uuid) {
        let _cursor = self.cursor.lock();
        if let Some(sink) = self.tables.read().get(&type_hash) {
            let sink = Arc::clone(sink);
            self.dispatcher.dispatch(Box::new(move || {
                sink.discard_pending(id);
            }));
        }
    }

    /// Queues rows for sending; batches go out in submission order.
    pub(crate) fn submit(self: &Arc<Self>, rows: Vec<DataRow>) -> SaveHandle {
        let (sender, receiver) = oneshot::channel();
        let shared = Arc::clone(self);
        self.outbox.dispatch(Box::new(move || {
            let result = shared.commit_rows(rows);
            if let Err(e) = &result {
                shared.stats.record_save(false);
                warn!(error = %e, "save failed; local changes stay committed");
            }
            let _ = sender.send(result);
        }));
        SaveHandle::pending(receiver)
    }

    /// Sends rows in budget-sized batches and applies each confirmation.
    fn commit_rows(&self, rows: Vec<DataRow>) -> SmashResult<SaveReceipt> {
        if self.is_closed() {
            return Err(SmashError::SessionClosed);
        }
        let budget = self.cursor.lock().deduper.transfer_budget_bytes() as usize;
        let client_id = self.client.client_id();

        let mut receipt = SaveReceipt::default();
        for batch in split_batches(rows, budget) {
            let assignments = self.client.send_rows(batch.clone())?;
            self.stats.record_save(true);

            let mut confirmed = Vec::with_capacity(batch.len());
            for (mut row, (version, guid)) in batch.into_iter().zip(assignments) {
                if guid != row.guid {
                    warn!(
                        local = %row.guid,
                        server = %guid,
                        "server confirmed record under another id"
                    );
                    self.discard_pending(row.type_hash, row.guid);
                }
                row.guid = guid;
                row.version = version;
                row.creator = client_id;
                receipt.versions.push((version, guid));
                confirmed.push(row);
            }
            receipt.rows += confirmed.len();
            self.apply_rows(confirmed, RowOrigin::Local);
        }
        Ok(receipt)
    }
}

/// Splits rows into consecutive batches whose payloads fit the budget.
///
/// A row larger than the budget travels alone.
fn split_batches(rows: Vec<DataRow>, budget: usize) -> Vec<Vec<DataRow>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut size = 0;
    for row in rows {
        let cost = row.payload_size();
        if !current.is_empty() && size + cost > budget {
            batches.push(std::mem::take(&mut current));
            size = 0;
        }
        size += cost;
        current.push(row);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Reports `Ended` when the poll thread exits, even on panic.
struct EndGuard(Arc<SessionShared>);

impl Drop for EndGuard {
    fn drop(&mut self) {
        self.0.set_state(PollState::Ended);
    }
}

async fn poll_loop(shared: Arc<SessionShared>) {
    info!(
        client = %shared.client.client_id(),
        long_poll = shared.config.is_long_poll(),
        "poll loop started"
    );

    while shared.is_active() {
        if !shared.config.is_long_poll() {
            tokio::select! {
                _ = shared.wake.notified() => {
                    debug!("manual refresh");
                }
                _ = shared.abort.notified() => {}
                _ = tokio::time::sleep(shared.config.refresh_interval) => {}
            }
            if !shared.is_active() {
                break;
            }
        }

        let ticket = shared.begin_poll();
        let fetched = shared
            .client
            .get_rows(ticket.last_known, ticket.cached, &shared.abort)
            .await;
        match fetched {
            Ok(response) => {
                shared.apply_rows(response.rows, RowOrigin::Network(ticket.epoch));
            }
            Err(SmashError::Timeout) => {
                shared.stats.record_timeout();
                shared.stats.record_abandoned();
                warn!(
                    deadline_ms = shared.config.request_deadline().as_millis() as u64,
                    "GetRows timed out"
                );
                shared.force_resync("GetRows timed out");
                shared.backoff().await;
            }
            Err(SmashError::Aborted) => {
                shared.stats.record_abandoned();
                if !shared.is_active() {
                    break;
                }
                shared.force_resync("GetRows aborted");
            }
            Err(e) => {
                shared.stats.record_poll_error();
                warn!(error = %e, retryable = e.is_retryable(), "GetRows failed; backing off");
                shared.backoff().await;
            }
        }
    }

    shared.set_state(PollState::Stopped);
    info!("poll loop stopped");
}

/// A joined session: the top-level object applications interact with.
pub struct Session {
    shared: Arc<SessionShared>,
    runtime: Option<Runtime>,
    poll_thread: Option<JoinHandle<()>>,
}

impl Session {
    /// Joins a session and starts polling, applying table mutations inline.
    pub fn join(
        transport: Arc<dyn SessionTransport>,
        config: SessionConfig,
        request: &JoinSessionRequest,
    ) -> SmashResult<Self> {
        Self::join_with(transport, config, request, Arc::new(ImmediateDispatcher::new()))
    }

    /// Joins a session and starts polling, applying table mutations through
    /// `dispatcher`.
    pub fn join_with(
        transport: Arc<dyn SessionTransport>,
        config: SessionConfig,
        request: &JoinSessionRequest,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> SmashResult<Self> {
        let client = SessionClient::join(transport, config.clone(), request)?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("smash-runtime")
            .enable_all()
            .build()?;

        let shared = Arc::new(SessionShared {
            cursor: Mutex::new(Cursor {
                last_known_row_version: 0,
                resync_epoch: 0,
                deduper: Deduper::new(config.history_tracking),
            }),
            config,
            client,
            tables: RwLock::new(HashMap::new()),
            dispatcher,
            outbox: ThreadDispatcher::new("smash-send")?,
            state: Mutex::new(PollState::Ended),
            state_changed: Condvar::new(),
            wake: Notify::new(),
            abort: Notify::new(),
            stats: StatsCounters::default(),
            closed: AtomicBool::new(false),
        });

        shared.set_state(PollState::Active);
        let handle = runtime.handle().clone();
        let poll_shared = Arc::clone(&shared);
        let spawned = std::thread::Builder::new()
            .name("smash-poll".into())
            .spawn(move || {
                let _end = EndGuard(Arc::clone(&poll_shared));
                handle.block_on(poll_loop(poll_shared));
            });
        let poll_thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                shared.set_state(PollState::Ended);
                runtime.shutdown_background();
                return Err(e.into());
            }
        };

        Ok(Self {
            shared,
            runtime: Some(runtime),
            poll_thread: Some(poll_thread),
        })
    }

    /// Joins a table of `T` named `name`.
    ///
    /// Fails with [`SmashError::DuplicateTable`] if a joined table has the
    /// same type hash. Joining after rows were received forces a full
    /// resync so the new table receives its history.
    pub fn join_table<T: Payload>(&self, name: &str) -> SmashResult<Arc<Table<T>>> {
        let table = Arc::new(Table::<T>::new(name));
        {
            let mut tables = self.shared.tables.write();
            if let Some(existing) = tables.get(&table.type_hash()) {
                return Err(SmashError::DuplicateTable {
                    name: format!("{name} (collides with `{}`)", existing.name()),
                    type_hash: table.type_hash(),
                });
            }
            let sink: Arc<dyn RowSink> = Arc::clone(&table) as Arc<dyn RowSink>;
            tables.insert(table.type_hash(), sink);
        }
        info!(table = name, type_hash = table.type_hash(), "joined table");

        if self.last_known_row_version() > 0 {
            self.shared.request_resync("table joined");
        }
        Ok(table)
    }

    /// Opens a change context against a joined table.
    pub fn change_context<T: Payload>(
        &self,
        table: &Arc<Table<T>>,
    ) -> SmashResult<ChangeContext<T>> {
        if !self.shared.has_table(table.type_hash()) {
            return Err(SmashError::validation(format!(
                "table `{}` is not joined to this session",
                table.name()
            )));
        }
        Ok(ChangeContext::new(Arc::clone(&self.shared), Arc::clone(table)))
    }

    /// Wakes the polling thread early when polling on an interval.
    pub fn refresh(&self) {
        self.shared.wake.notify_one();
    }

    /// Discards the watermark and refetches every row.
    pub fn resync(&self) {
        self.shared.request_resync("requested");
    }

    /// Blocks until every table mutation dispatched so far has run.
    pub fn flush(&self) {
        self.shared.dispatcher.flush();
    }

    /// State of the polling thread.
    pub fn poll_state(&self) -> PollState {
        self.shared.poll_state()
    }

    /// Highest row version received from the network.
    pub fn last_known_row_version(&self) -> u64 {
        self.shared.cursor.lock().last_known_row_version
    }

    /// Counter snapshot.
    pub fn stats(&self) -> SessionStats {
        self.shared.stats.snapshot()
    }

    /// Identity assigned on join.
    pub fn participant(&self) -> &Participant {
        self.shared.client.participant()
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Stops polling and releases the transport.
    ///
    /// Blocks until the polling thread has ended and queued saves have been
    /// sent. Calling it again does nothing.
    pub fn shutdown(&mut self) {
        let Some(poll_thread) = self.poll_thread.take() else {
            return;
        };
        info!(client = %self.shared.client.client_id(), "shutting down session");

        {
            let mut state = self.shared.state.lock();
            if *state == PollState::Active {
                *state = PollState::PrepareToStop;
            }
        }
        self.shared.abort.notify_one();
        self.shared.wake.notify_one();

        {
            let mut state = self.shared.state.lock();
            while *state != PollState::Ended {
                self.shared.state_changed.wait(&mut state);
            }
        }
        if poll_thread.join().is_err() {
            warn!("poll thread panicked");
        }

        // Drain queued saves while the transport is still open.
        self.shared.outbox.shutdown();
        self.shared.closed.store(true, Ordering::SeqCst);
        if let Err(e) = self.shared.client.close() {
            warn!(error = %e, "failed to close transport");
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        info!("session shut down");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}
