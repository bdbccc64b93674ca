//! Observable, ordered collections of frozen records.

use crate::error::{SmashError, SmashResult};
use crate::record::{Envelope, Frozen, Payload};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use smash_protocol::{DataRow, RowAction};
use std::sync::mpsc::{self, Receiver, Sender};
use tracing::debug;
use uuid::Uuid;

/// Computes the type hash identifying a table of `T` named `name`.
///
/// The hash is the first four bytes of SHA-256 over the payload type name
/// and the table name.
pub fn type_hash_for<T>(name: &str) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(std::any::type_name::<T>().as_bytes());
    hasher.update([0u8]);
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// A mutation observed on a table.
#[derive(Debug, Clone)]
pub enum TableEvent<T> {
    /// A record was appended.
    Inserted(Frozen<T>),
    /// A record was replaced in place.
    Updated {
        /// Version that was replaced.
        previous: Frozen<T>,
        /// Version now in the table.
        current: Frozen<T>,
    },
    /// A record was removed.
    Removed(Frozen<T>),
}

/// Outcome of applying one row or local change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableChange {
    /// A record was appended.
    Inserted,
    /// A record was replaced in place.
    Updated,
    /// A record was removed.
    Removed,
    /// Nothing matched; the table is unchanged.
    Ignored,
}

/// An ordered collection of frozen records of one type.
///
/// Consumers read snapshots; the session is the only writer and funnels
/// every mutation through its dispatcher.
pub struct Table<T: Payload> {
    name: String,
    type_hash: u32,
    records: RwLock<Vec<Frozen<T>>>,
    subscribers: Mutex<Vec<Sender<TableEvent<T>>>>,
}

impl<T: Payload> Table<T> {
    /// Creates an empty, detached table.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let type_hash = type_hash_for::<T>(&name);
        Self {
            name,
            type_hash,
            records: RwLock::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type hash carried by every row of this table.
    pub fn type_hash(&self) -> u32 {
        self.type_hash
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if the table holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Returns the first record with the given id.
    pub fn get(&self, id: Uuid) -> Option<Frozen<T>> {
        self.records.read().iter().find(|r| r.id() == id).cloned()
    }

    /// Returns true if a record with the given id exists.
    pub fn contains(&self, id: Uuid) -> bool {
        self.records.read().iter().any(|r| r.id() == id)
    }

    /// Returns a snapshot of all records in table order.
    pub fn snapshot(&self) -> Vec<Frozen<T>> {
        self.records.read().clone()
    }

    /// Iterates a snapshot of the records.
    pub fn iter(&self) -> impl Iterator<Item = Frozen<T>> {
        self.snapshot().into_iter()
    }

    /// Subscribes to mutations, delivered in application order.
    pub fn subscribe(&self) -> Receiver<TableEvent<T>> {
        let (sender, receiver) = mpsc::channel();
        self.subscribers.lock().push(sender);
        receiver
    }

    /// Applies a row received from the network or confirmed by a save.
    pub(crate) fn apply_incoming(&self, row: &DataRow) -> SmashResult<TableChange> {
        if row.type_hash != self.type_hash {
            return Err(SmashError::validation(format!(
                "row {} has type hash {:#010x}, table `{}` expects {:#010x}",
                row.guid, row.type_hash, self.name, self.type_hash
            )));
        }
        match row.action {
            RowAction::Delete => Ok(self.remove(row.guid)),
            RowAction::Add | RowAction::Update => {
                let envelope = Envelope::from_row(row)?;
                Ok(self.apply_envelope(envelope))
            }
        }
    }

    /// Applies a locally committed change ahead of server confirmation.
    pub(crate) fn apply_local(&self, envelope: Envelope<T>) -> TableChange {
        match envelope.pending_action() {
            RowAction::Delete => self.remove(envelope.id()),
            RowAction::Add | RowAction::Update => self.apply_envelope(envelope),
        }
    }

    /// Drops a locally pending record the server confirmed under another id.
    pub(crate) fn discard_pending(&self, id: Uuid) -> TableChange {
        let pending = self
            .records
            .read()
            .iter()
            .any(|r| r.id() == id && r.is_pending());
        if pending {
            self.remove(id)
        } else {
            TableChange::Ignored
        }
    }

    fn apply_envelope(&self, envelope: Envelope<T>) -> TableChange {
        let id = envelope.id();
        let action = envelope.pending_action();
        let current = Frozen::new(envelope, self.type_hash);

        let event = {
            let mut records = self.records.write();
            match records.iter().position(|r| r.id() == id) {
                Some(index) => {
                    let previous = std::mem::replace(&mut records[index], current.clone());
                    TableEvent::Updated { previous, current }
                }
                None if action == RowAction::Add => {
                    records.push(current.clone());
                    TableEvent::Inserted(current)
                }
                None => {
                    debug!(table = %self.name, record = %id, "update for absent record ignored");
                    return TableChange::Ignored;
                }
            }
        };

        let change = match event {
            TableEvent::Inserted(_) => TableChange::Inserted,
            _ => TableChange::Updated,
        };
        self.publish(event);
        change
    }

    fn remove(&self, id: Uuid) -> TableChange {
        let removed = {
            let mut records = self.records.write();
            records
                .iter()
                .position(|r| r.id() == id)
                .map(|index| records.remove(index))
        };
        match removed {
            Some(record) => {
                record.mark_deleted();
                self.publish(TableEvent::Removed(record));
                TableChange::Removed
            }
            None => TableChange::Ignored,
        }
    }

    fn publish(&self, event: TableEvent<T>) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| s.send(event.clone()).is_ok());
    }
}

/// Type-erased view of a table used by the session.
pub(crate) trait RowSink: Send + Sync {
    fn name(&self) -> &str;
    fn type_hash(&self) -> u32;
    fn apply_row(&self, row: &DataRow) -> SmashResult<TableChange>;
    fn discard_pending(&self, id: Uuid) -> TableChange;
}

impl<T: Payload> RowSink for Table<T> {
    fn name(&self) -> &str {
        Table::name(self)
    }

    fn type_hash(&self) -> u32 {
        Table::type_hash(self)
    }

    fn apply_row(&self, row: &DataRow) -> SmashResult<TableChange> {
        self.apply_incoming(row)
    }

    fn discard_pending(&self, id: Uuid) -> TableChange {
        Table::discard_pending(self, id)
    }
}
