//! Records and their freeze/thaw lifecycle.
//!
//! A record moves through three states:
//!
//! - [`Record`] is `Mutable`: freshly created and detached from any table.
//! - [`Frozen`] is a published, immutable version owned by a table or in flight.
//!   It has no mutators at all.
//! - [`Unfrozen`] is a private edit copy tracked by exactly one change context.
//!   Once the context commits, the copy is frozen again and every further
//!   mutation fails with [`SmashError::StaleEdit`].

use crate::error::{SmashError, SmashResult};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use smash_protocol::{ClientId, DataRow, RowAction};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Types that can be stored in a table.
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Ownership state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// New and detached.
    Mutable,
    /// Published and immutable.
    Frozen,
    /// Private edit copy inside a change context.
    Unfrozen,
}

/// Identity, version and payload of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    id: Uuid,
    creator: ClientId,
    version: u64,
    modification_flag: i32,
    pending_action: RowAction,
    payload: T,
}

impl<T> Envelope<T> {
    /// Creates an unversioned envelope pending addition.
    pub fn new(id: Uuid, payload: T) -> Self {
        Self {
            id,
            creator: ClientId::UNASSIGNED,
            version: 0,
            modification_flag: 0,
            pending_action: RowAction::Add,
            payload,
        }
    }

    /// Record id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Participant that authored this version.
    pub fn creator(&self) -> ClientId {
        self.creator
    }

    /// Server-assigned version, zero while unconfirmed.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Application-defined modification flag.
    pub fn modification_flag(&self) -> i32 {
        self.modification_flag
    }

    /// Action that produced this version.
    pub fn pending_action(&self) -> RowAction {
        self.pending_action
    }

    /// Payload.
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Returns true until the server has confirmed this version.
    pub fn is_pending(&self) -> bool {
        self.version == 0
    }

    pub(crate) fn set_action(&mut self, action: RowAction) {
        self.pending_action = action;
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl<T: Payload> Envelope<T> {
    /// Serializes into a wire row for the table identified by `type_hash`.
    ///
    /// Rows carrying more than 64 KiB of payload are rejected here, before
    /// anything is sent.
    pub fn to_row(&self, type_hash: u32) -> SmashResult<DataRow> {
        let payload = match self.pending_action {
            RowAction::Delete => Vec::new(),
            RowAction::Add | RowAction::Update => encode_payload(&self.payload)?,
        };
        let row = DataRow::new(self.pending_action, self.id, type_hash, payload)
            .with_version(self.version)
            .with_creator(self.creator)
            .with_modification_flag(self.modification_flag);
        row.validate()?;
        Ok(row)
    }

    /// Reconstructs an envelope from an Add or Update row.
    pub fn from_row(row: &DataRow) -> SmashResult<Self> {
        Ok(Self {
            id: row.guid,
            creator: row.creator,
            version: row.version,
            modification_flag: row.modification_flag,
            pending_action: row.action,
            payload: decode_payload(&row.payload)?,
        })
    }
}

pub(crate) fn encode_payload<T: Serialize>(payload: &T) -> SmashResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(payload, &mut bytes)
        .map_err(|e| SmashError::Codec(format!("failed to encode payload: {e}")))?;
    Ok(bytes)
}

pub(crate) fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> SmashResult<T> {
    ciborium::de::from_reader(bytes)
        .map_err(|e| SmashError::Codec(format!("failed to decode payload: {e}")))
}

/// A new, detached record.
#[derive(Debug, Clone)]
pub struct Record<T> {
    envelope: Envelope<T>,
}

impl<T> Record<T> {
    /// Creates a record with a fresh random id.
    pub fn new(payload: T) -> Self {
        Self::with_id(Uuid::new_v4(), payload)
    }

    /// Creates a record with the given id.
    pub fn with_id(id: Uuid, payload: T) -> Self {
        Self {
            envelope: Envelope::new(id, payload),
        }
    }

    /// Record id.
    pub fn id(&self) -> Uuid {
        self.envelope.id
    }

    /// Always [`RecordState::Mutable`].
    pub fn state(&self) -> RecordState {
        RecordState::Mutable
    }

    /// Payload.
    pub fn payload(&self) -> &T {
        &self.envelope.payload
    }

    /// Mutable payload.
    pub fn payload_mut(&mut self) -> &mut T {
        &mut self.envelope.payload
    }

    /// Sets the modification flag.
    pub fn set_modification_flag(&mut self, flag: i32) {
        self.envelope.modification_flag = flag;
    }

    pub(crate) fn into_envelope(self) -> Envelope<T> {
        self.envelope
    }
}

struct FrozenInner<T> {
    envelope: Envelope<T>,
    type_hash: u32,
    deleted: AtomicBool,
}

/// A published, immutable record version.
///
/// Cloning is cheap; clones share the same instance.
pub struct Frozen<T> {
    inner: Arc<FrozenInner<T>>,
}

impl<T> Frozen<T> {
    pub(crate) fn new(envelope: Envelope<T>, type_hash: u32) -> Self {
        Self {
            inner: Arc::new(FrozenInner {
                envelope,
                type_hash,
                deleted: AtomicBool::new(false),
            }),
        }
    }

    /// Identity and version information.
    pub fn envelope(&self) -> &Envelope<T> {
        &self.inner.envelope
    }

    /// Record id.
    pub fn id(&self) -> Uuid {
        self.inner.envelope.id
    }

    /// Server-assigned version, zero while unconfirmed.
    pub fn version(&self) -> u64 {
        self.inner.envelope.version
    }

    /// Participant that authored this version.
    pub fn creator(&self) -> ClientId {
        self.inner.envelope.creator
    }

    /// Application-defined modification flag.
    pub fn modification_flag(&self) -> i32 {
        self.inner.envelope.modification_flag
    }

    /// Action that produced this version.
    pub fn pending_action(&self) -> RowAction {
        self.inner.envelope.pending_action
    }

    /// Payload.
    pub fn payload(&self) -> &T {
        &self.inner.envelope.payload
    }

    /// Hash of the table this record belongs to.
    pub fn type_hash(&self) -> u32 {
        self.inner.type_hash
    }

    /// Returns true until the server has confirmed this version.
    pub fn is_pending(&self) -> bool {
        self.inner.envelope.is_pending()
    }

    /// Returns true once the record was removed from its table.
    pub fn is_deleted(&self) -> bool {
        self.inner.deleted.load(Ordering::Acquire)
    }

    /// Always [`RecordState::Frozen`].
    pub fn state(&self) -> RecordState {
        RecordState::Frozen
    }

    /// Returns true if both handles refer to the same instance.
    pub fn ptr_eq(&self, other: &Frozen<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn mark_deleted(&self) {
        self.inner.deleted.store(true, Ordering::Release);
    }
}

impl<T> Clone for Frozen<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Deref for Frozen<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.payload()
    }
}

impl<T: fmt::Debug> fmt::Debug for Frozen<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frozen")
            .field("envelope", &self.inner.envelope)
            .field("type_hash", &self.inner.type_hash)
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

struct EditSlot<T> {
    envelope: Envelope<T>,
    state: RecordState,
}

/// A private edit copy tracked by one change context.
///
/// Clones share the same copy, so the handle returned by repeated
/// `get_unfrozen` calls always observes the same edits.
pub struct Unfrozen<T> {
    slot: Arc<Mutex<EditSlot<T>>>,
}

impl<T> Unfrozen<T> {
    pub(crate) fn tracked(envelope: Envelope<T>, state: RecordState) -> Self {
        Self {
            slot: Arc::new(Mutex::new(EditSlot { envelope, state })),
        }
    }

    /// Record id.
    pub fn id(&self) -> Uuid {
        self.slot.lock().envelope.id
    }

    /// Current state: `Mutable` for added records, `Unfrozen` for edit copies,
    /// `Frozen` once the owning context has committed.
    pub fn state(&self) -> RecordState {
        self.slot.lock().state
    }

    /// Action that will be sent on commit.
    pub fn pending_action(&self) -> RowAction {
        self.slot.lock().envelope.pending_action
    }

    /// Reads the payload.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.slot.lock().envelope.payload)
    }

    /// Mutates the payload.
    ///
    /// Fails with [`SmashError::StaleEdit`] once the owning context has
    /// committed or the record is marked for deletion.
    pub fn edit<R>(&self, f: impl FnOnce(&mut T) -> R) -> SmashResult<R> {
        let mut slot = self.slot.lock();
        Self::ensure_editable(&slot)?;
        Ok(f(&mut slot.envelope.payload))
    }

    /// Sets the modification flag.
    pub fn set_modification_flag(&self, flag: i32) -> SmashResult<()> {
        let mut slot = self.slot.lock();
        Self::ensure_editable(&slot)?;
        slot.envelope.modification_flag = flag;
        Ok(())
    }

    fn ensure_editable(slot: &EditSlot<T>) -> SmashResult<()> {
        if slot.state == RecordState::Frozen {
            return Err(SmashError::stale(format!(
                "record {} is frozen; obtain a new copy from a change context",
                slot.envelope.id
            )));
        }
        if slot.envelope.pending_action == RowAction::Delete {
            return Err(SmashError::stale(format!(
                "record {} is marked for deletion",
                slot.envelope.id
            )));
        }
        Ok(())
    }

    pub(crate) fn mark_delete(&self) -> SmashResult<()> {
        let mut slot = self.slot.lock();
        Self::ensure_editable(&slot)?;
        slot.envelope.set_action(RowAction::Delete);
        Ok(())
    }
}

impl<T: Clone> Unfrozen<T> {
    /// Returns a copy of the payload.
    pub fn payload(&self) -> T {
        self.slot.lock().envelope.payload.clone()
    }

}

/// Serializes and freezes a batch of edit copies as one step.
///
/// Every copy stays locked from serialization until it is frozen, so the
/// rows sent and the envelopes shown locally carry the same edits. If any
/// copy fails to serialize, nothing is frozen.
pub(crate) fn freeze_all<T: Payload>(
    copies: &[&Unfrozen<T>],
    type_hash: u32,
) -> SmashResult<Vec<(Envelope<T>, DataRow)>> {
    let mut slots: Vec<_> = copies.iter().map(|copy| copy.slot.lock()).collect();
    let rows = slots
        .iter()
        .map(|slot| slot.envelope.to_row(type_hash))
        .collect::<SmashResult<Vec<_>>>()?;

    Ok(slots
        .iter_mut()
        .zip(rows)
        .map(|(slot, row)| {
            slot.state = RecordState::Frozen;
            slot.envelope.set_version(0);
            (slot.envelope.clone(), row)
        })
        .collect())
}

impl<T> Clone for Unfrozen<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Unfrozen<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("Unfrozen")
            .field("envelope", &slot.envelope)
            .field("state", &slot.state)
            .finish()
    }
}
