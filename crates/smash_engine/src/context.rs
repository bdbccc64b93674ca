//! Change contexts: budgeted batches of local edits against one table.

use crate::error::{SmashError, SmashResult};
use crate::record::{freeze_all, Frozen, Payload, Record, RecordState, Unfrozen};
use crate::session::SessionShared;
use crate::table::Table;
use smash_protocol::RowAction;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

/// Units available to one change context.
pub const CHANGE_UNIT_LIMIT: u32 = 100;

/// Cost of adding a record.
pub const ADD_COST: u32 = 1;

/// Cost of unfreezing a record for update (lock, update, stale-mark).
pub const UPDATE_COST: u32 = 3;

/// Cost of deleting a record.
pub const DELETE_COST: u32 = 3;

struct Tracked<T> {
    copy: Unfrozen<T>,
    /// Published version the copy was made from; `None` for additions.
    origin: Option<Frozen<T>>,
}

/// A single-use batch of Add, Update and Delete operations on one table.
///
/// Not meant to be shared between threads; build, mutate and commit it
/// from one caller.
pub struct ChangeContext<T: Payload> {
    session: Arc<SessionShared>,
    table: Arc<Table<T>>,
    entries: Vec<Tracked<T>>,
    by_id: HashMap<Uuid, usize>,
    units_used: u32,
    exhausted: bool,
}

impl<T: Payload> ChangeContext<T> {
    pub(crate) fn new(session: Arc<SessionShared>, table: Arc<Table<T>>) -> Self {
        Self {
            session,
            table,
            entries: Vec::new(),
            by_id: HashMap::new(),
            units_used: 0,
            exhausted: false,
        }
    }

    /// Table this context edits.
    pub fn table(&self) -> &Arc<Table<T>> {
        &self.table
    }

    /// Units charged so far.
    pub fn units_used(&self) -> u32 {
        self.units_used
    }

    /// Units still available.
    pub fn units_remaining(&self) -> u32 {
        CHANGE_UNIT_LIMIT - self.units_used
    }

    /// Returns true once the context was committed.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Number of tracked records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn ensure_open(&self) -> SmashResult<()> {
        if self.exhausted {
            Err(SmashError::ContextExhausted)
        } else {
            Ok(())
        }
    }

    fn charge(&mut self, cost: u32) -> SmashResult<()> {
        let remaining = self.units_remaining();
        if cost > remaining {
            return Err(SmashError::ChangeBudgetExceeded {
                cost,
                remaining,
                limit: CHANGE_UNIT_LIMIT,
            });
        }
        self.units_used += cost;
        Ok(())
    }

    fn track(&mut self, copy: Unfrozen<T>, origin: Option<Frozen<T>>) -> Unfrozen<T> {
        self.by_id.insert(copy.id(), self.entries.len());
        self.entries.push(Tracked {
            copy: copy.clone(),
            origin,
        });
        copy
    }

    /// Tracks a new record for addition.
    ///
    /// The returned handle stays editable until the context commits.
    pub fn add(&mut self, record: Record<T>) -> SmashResult<Unfrozen<T>> {
        self.ensure_open()?;
        if self.by_id.contains_key(&record.id()) {
            return Err(SmashError::DuplicateAdd(record.id()));
        }
        self.charge(ADD_COST)?;
        let copy = Unfrozen::tracked(record.into_envelope(), RecordState::Mutable);
        Ok(self.track(copy, None))
    }

    /// Returns the private edit copy of a published record.
    ///
    /// Repeated calls for the same record return the same copy and are not
    /// charged again.
    pub fn get_unfrozen(&mut self, record: &Frozen<T>) -> SmashResult<Unfrozen<T>> {
        self.ensure_open()?;
        if record.type_hash() != self.table.type_hash() {
            return Err(SmashError::validation(format!(
                "record {} does not belong to table `{}`",
                record.id(),
                self.table.name()
            )));
        }
        if record.is_deleted() || record.pending_action() == RowAction::Delete {
            return Err(SmashError::stale(format!(
                "record {} was deleted",
                record.id()
            )));
        }

        if let Some(&index) = self.by_id.get(&record.id()) {
            let copy = &self.entries[index].copy;
            if copy.pending_action() == RowAction::Delete {
                return Err(SmashError::stale(format!(
                    "record {} is marked for deletion",
                    record.id()
                )));
            }
            return Ok(copy.clone());
        }

        self.charge(UPDATE_COST)?;
        let mut envelope = record.envelope().clone();
        envelope.set_action(RowAction::Update);
        let copy = Unfrozen::tracked(envelope, RecordState::Unfrozen);
        Ok(self.track(copy, Some(record.clone())))
    }

    /// Marks a published record for deletion.
    pub fn delete(&mut self, record: &Frozen<T>) -> SmashResult<()> {
        self.ensure_open()?;
        if !self.by_id.contains_key(&record.id()) && self.units_remaining() < DELETE_COST {
            return Err(SmashError::ChangeBudgetExceeded {
                cost: DELETE_COST,
                remaining: self.units_remaining(),
                limit: CHANGE_UNIT_LIMIT,
            });
        }
        self.get_unfrozen(record)?.mark_delete()
    }

    /// Commits the context.
    ///
    /// Every tracked record is frozen and shown in the table as pending
    /// before anything is sent; the returned handle resolves once the server
    /// has confirmed all rows. A failed send does not roll the local
    /// changes back.
    pub fn save_changes(&mut self) -> SmashResult<SaveHandle> {
        self.ensure_open()?;
        if self.session.is_closed() {
            return Err(SmashError::SessionClosed);
        }

        // An oversized record fails here and leaves the context usable.
        let copies: Vec<_> = self.entries.iter().map(|entry| &entry.copy).collect();
        let (envelopes, rows): (Vec<_>, Vec<_>) =
            freeze_all(&copies, self.table.type_hash())?.into_iter().unzip();

        self.exhausted = true;
        for entry in &self.entries {
            if entry.copy.pending_action() == RowAction::Delete {
                if let Some(origin) = &entry.origin {
                    origin.mark_deleted();
                }
            }
        }
        debug!(
            table = self.table.name(),
            rows = rows.len(),
            units = self.units_used,
            "change context committed"
        );

        self.session.apply_local(&self.table, envelopes);
        if rows.is_empty() {
            return Ok(SaveHandle::ready(Ok(SaveReceipt::default())));
        }
        Ok(self.session.submit(rows))
    }
}

/// Versions the server assigned to a committed context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReceipt {
    /// Rows confirmed.
    pub rows: usize,
    /// `(version, id)` of each confirmed row, in submission order.
    pub versions: Vec<(u64, Uuid)>,
}

enum SaveState {
    Ready(Option<SmashResult<SaveReceipt>>),
    Pending(oneshot::Receiver<SmashResult<SaveReceipt>>),
}

/// Completion of a [`ChangeContext::save_changes`] call.
///
/// Await it from async code or call [`SaveHandle::wait`] from a plain
/// thread.
pub struct SaveHandle {
    state: SaveState,
}

impl SaveHandle {
    pub(crate) fn ready(result: SmashResult<SaveReceipt>) -> Self {
        Self {
            state: SaveState::Ready(Some(result)),
        }
    }

    pub(crate) fn pending(receiver: oneshot::Receiver<SmashResult<SaveReceipt>>) -> Self {
        Self {
            state: SaveState::Pending(receiver),
        }
    }

    /// Blocks until the save completes.
    ///
    /// Must not be called from within an async runtime; await the handle
    /// there instead.
    pub fn wait(self) -> SmashResult<SaveReceipt> {
        match self.state {
            SaveState::Ready(result) => result.unwrap_or(Err(SmashError::SessionClosed)),
            SaveState::Pending(receiver) => receiver
                .blocking_recv()
                .unwrap_or(Err(SmashError::SessionClosed)),
        }
    }
}

impl Future for SaveHandle {
    type Output = SmashResult<SaveReceipt>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            SaveState::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(SmashError::SessionClosed)))
            }
            SaveState::Pending(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => Poll::Ready(Err(SmashError::SessionClosed)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::record::decode_payload;
    use crate::session::Session;
    use crate::transport::MockTransport;
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};
    use smash_protocol::{JoinSessionRequest, MAX_ROW_PAYLOAD_BYTES};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        name: String,
        qty: u32,
    }

    fn item(name: &str) -> Item {
        Item {
            name: name.into(),
            qty: 1,
        }
    }

    fn session(mock: &Arc<MockTransport>) -> Session {
        let config = SessionConfig::default()
            .with_long_poll_timeout(Duration::from_millis(50))
            .with_timeout_margin(Duration::from_millis(50))
            .with_poll_backoff(Duration::from_millis(10));
        let request = JoinSessionRequest::new("token", "Cy", "cy@example.com", "tablet");
        Session::join(mock.clone(), config, &request).unwrap()
    }

    /// Adds and confirms `names`, returning the published records.
    fn seed(session: &Session, table: &Arc<Table<Item>>, names: &[&str]) -> Vec<Frozen<Item>> {
        let mut context = session.change_context(table).unwrap();
        let ids: Vec<Uuid> = names
            .iter()
            .map(|name| context.add(Record::new(item(name))).unwrap().id())
            .collect();
        context.save_changes().unwrap().wait().unwrap();
        ids.into_iter().map(|id| table.get(id).unwrap()).collect()
    }

    #[test]
    fn add_costs_one_unit_and_rejects_duplicates() {
        let mock = Arc::new(MockTransport::new());
        let session = session(&mock);
        let table = session.join_table::<Item>("items").unwrap();
        let mut context = session.change_context(&table).unwrap();

        let record = Record::new(item("pen"));
        let twin = Record::with_id(record.id(), item("pen"));
        let copy = context.add(record).unwrap();
        assert_eq!(copy.state(), RecordState::Mutable);
        assert_eq!(context.units_used(), ADD_COST);
        assert!(matches!(context.add(twin), Err(SmashError::DuplicateAdd(_))));
        assert_eq!(context.units_used(), ADD_COST);
    }

    #[test]
    fn budget_failure_leaves_prior_operations_intact() {
        let mock = Arc::new(MockTransport::new());
        let session = session(&mock);
        let table = session.join_table::<Item>("items").unwrap();
        let published = seed(&session, &table, &["a"]);

        let mut context = session.change_context(&table).unwrap();
        for i in 0..99 {
            context.add(Record::new(item(&format!("n{i}")))).unwrap();
        }
        assert_eq!(context.units_remaining(), 1);

        let err = context.get_unfrozen(&published[0]).unwrap_err();
        assert!(matches!(
            err,
            SmashError::ChangeBudgetExceeded {
                cost: 3,
                remaining: 1,
                limit: 100
            }
        ));
        assert!(context.delete(&published[0]).is_err());
        assert_eq!(context.len(), 99);

        context.add(Record::new(item("last"))).unwrap();
        assert!(matches!(
            context.add(Record::new(item("over"))),
            Err(SmashError::ChangeBudgetExceeded { .. })
        ));

        let receipt = context.save_changes().unwrap().wait().unwrap();
        assert_eq!(receipt.rows, 100);
        assert_eq!(table.len(), 101);
    }

    #[test]
    fn get_unfrozen_is_idempotent() {
        let mock = Arc::new(MockTransport::new());
        let session = session(&mock);
        let table = session.join_table::<Item>("items").unwrap();
        let published = seed(&session, &table, &["cup"]);

        let mut context = session.change_context(&table).unwrap();
        let first = context.get_unfrozen(&published[0]).unwrap();
        first.edit(|i| i.qty = 4).unwrap();
        let second = context.get_unfrozen(&published[0]).unwrap();

        assert_eq!(context.units_used(), UPDATE_COST);
        assert_eq!(second.state(), RecordState::Unfrozen);
        assert_eq!(second.payload().qty, 4);
        assert_eq!(published[0].qty, 1);
    }

    #[test]
    fn update_replaces_record_in_place() {
        let mock = Arc::new(MockTransport::new());
        let session = session(&mock);
        let table = session.join_table::<Item>("items").unwrap();
        let published = seed(&session, &table, &["a", "b", "c"]);

        let mut context = session.change_context(&table).unwrap();
        context
            .get_unfrozen(&published[1])
            .unwrap()
            .edit(|i| i.name = "B".into())
            .unwrap();
        context.save_changes().unwrap().wait().unwrap();

        let names: Vec<String> = table.iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, vec!["a", "B", "c"]);
        assert_eq!(table.get(published[1].id()).unwrap().pending_action(), RowAction::Update);
    }

    #[test]
    fn delete_blocks_further_edits_and_removes_record() {
        let mock = Arc::new(MockTransport::new());
        let session = session(&mock);
        let table = session.join_table::<Item>("items").unwrap();
        let published = seed(&session, &table, &["gone"]);

        let mut context = session.change_context(&table).unwrap();
        let copy = context.get_unfrozen(&published[0]).unwrap();
        context.delete(&published[0]).unwrap();
        assert_eq!(context.units_used(), UPDATE_COST);
        assert!(matches!(copy.edit(|i| i.qty = 9), Err(SmashError::StaleEdit(_))));
        assert!(matches!(
            context.get_unfrozen(&published[0]),
            Err(SmashError::StaleEdit(_))
        ));

        context.save_changes().unwrap().wait().unwrap();
        assert!(table.is_empty());
        assert!(published[0].is_deleted());

        let mut next = session.change_context(&table).unwrap();
        assert!(matches!(
            next.get_unfrozen(&published[0]),
            Err(SmashError::StaleEdit(_))
        ));
    }

    #[test]
    fn committed_context_is_exhausted_and_copies_are_frozen() {
        let mock = Arc::new(MockTransport::new());
        let session = session(&mock);
        let table = session.join_table::<Item>("items").unwrap();

        let mut context = session.change_context(&table).unwrap();
        let copy = context.add(Record::new(item("x"))).unwrap();
        let handle = context.save_changes().unwrap();

        assert!(context.is_exhausted());
        assert_eq!(copy.state(), RecordState::Frozen);
        assert!(matches!(copy.edit(|i| i.qty = 2), Err(SmashError::StaleEdit(_))));
        assert!(matches!(
            context.add(Record::new(item("y"))),
            Err(SmashError::ContextExhausted)
        ));
        assert!(matches!(
            context.save_changes(),
            Err(SmashError::ContextExhausted)
        ));
        handle.wait().unwrap();
    }

    #[test]
    fn local_changes_show_before_confirmation() {
        let mock = Arc::new(MockTransport::new());
        mock.fail_sends(Some("offline".into()));
        let session = session(&mock);
        let table = session.join_table::<Item>("items").unwrap();

        let mut context = session.change_context(&table).unwrap();
        let id = context.add(Record::new(item("draft"))).unwrap().id();
        let handle = context.save_changes().unwrap();

        // Shown immediately as pending; kept after the send fails.
        assert!(table.get(id).unwrap().is_pending());
        assert!(matches!(
            handle.wait(),
            Err(SmashError::Transport { .. })
        ));
        assert!(table.get(id).unwrap().is_pending());
        assert_eq!(session.stats().saves_failed, 1);
    }

    #[test]
    fn concurrent_edits_land_in_sent_and_local_copy_alike() {
        let mock = Arc::new(MockTransport::new());
        let session = session(&mock);
        let table = session.join_table::<Item>("items").unwrap();

        for round in 0..20 {
            let mut context = session.change_context(&table).unwrap();
            let copy = context.add(Record::new(item("race"))).unwrap();
            let editor = copy.clone();
            let writer = std::thread::spawn(move || {
                let mut qty = 0;
                while editor
                    .edit(|i| {
                        qty += 1;
                        i.qty = qty;
                    })
                    .is_ok()
                {}
            });
            context.save_changes().unwrap().wait().unwrap();
            writer.join().unwrap();

            let sent = mock.sent_requests();
            let sent_item: Item = decode_payload(&sent[round].rows[0].payload).unwrap();
            assert_eq!(sent_item, copy.payload());
        }
    }

    #[test]
    fn oversized_record_leaves_context_usable() {
        let mock = Arc::new(MockTransport::new());
        let session = session(&mock);
        let table = session.join_table::<Item>("items").unwrap();

        let mut context = session.change_context(&table).unwrap();
        let copy = context
            .add(Record::new(Item {
                name: "x".repeat(MAX_ROW_PAYLOAD_BYTES),
                qty: 0,
            }))
            .unwrap();
        assert!(matches!(context.save_changes(), Err(SmashError::Validation(_))));
        assert!(!context.is_exhausted());
        assert!(mock.sent_requests().is_empty());

        copy.edit(|i| i.name = "small".into()).unwrap();
        context.save_changes().unwrap().wait().unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn records_from_other_tables_are_rejected() {
        let mock = Arc::new(MockTransport::new());
        let session = session(&mock);
        let items = session.join_table::<Item>("items").unwrap();
        let archive = session.join_table::<Item>("archive").unwrap();
        let published = seed(&session, &archive, &["old"]);

        let mut context = session.change_context(&items).unwrap();
        assert!(matches!(
            context.get_unfrozen(&published[0]),
            Err(SmashError::Validation(_))
        ));
        assert_eq!(context.units_used(), 0);
    }

    #[test]
    fn empty_commit_resolves_immediately() {
        let mock = Arc::new(MockTransport::new());
        let session = session(&mock);
        let table = session.join_table::<Item>("items").unwrap();
        let mut context = session.change_context(&table).unwrap();
        let receipt = context.save_changes().unwrap().wait().unwrap();
        assert_eq!(receipt, SaveReceipt::default());
        assert!(mock.sent_requests().is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add,
        Update(usize),
        Delete(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Add),
            (0usize..8).prop_map(Op::Update),
            (0usize..8).prop_map(Op::Delete),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn budget_is_never_exceeded(ops in prop::collection::vec(op(), 1..80)) {
            let mock = Arc::new(MockTransport::new());
            let session = session(&mock);
            let table = session.join_table::<Item>("items").unwrap();
            let published = seed(&session, &table, &["a", "b", "c", "d", "e", "f", "g", "h"]);

            let mut context = session.change_context(&table).unwrap();
            let mut touched = std::collections::HashSet::new();
            let mut expected = 0u32;
            for op in ops {
                let (cost, result) = match op {
                    Op::Add => (ADD_COST, context.add(Record::new(item("n"))).map(|_| ())),
                    Op::Update(i) => {
                        let cost = if touched.contains(&i) { 0 } else { UPDATE_COST };
                        (cost, context.get_unfrozen(&published[i]).map(|_| ()))
                    }
                    Op::Delete(i) => {
                        let cost = if touched.contains(&i) { 0 } else { DELETE_COST };
                        (cost, context.delete(&published[i]))
                    }
                };
                match result {
                    Ok(()) => {
                        expected += cost;
                        if let Op::Update(i) | Op::Delete(i) = op {
                            touched.insert(i);
                        }
                    }
                    Err(SmashError::ChangeBudgetExceeded { .. }) => {
                        prop_assert!(expected + cost > CHANGE_UNIT_LIMIT);
                    }
                    Err(SmashError::StaleEdit(_)) => {}
                    Err(e) => prop_assert!(false, "unexpected error: {}", e),
                }
                prop_assert_eq!(context.units_used(), expected);
                prop_assert!(context.units_used() <= CHANGE_UNIT_LIMIT);
            }
            prop_assert!(context.save_changes().unwrap().wait().is_ok());
        }
    }
}
