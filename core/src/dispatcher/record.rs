//! Operation records and the arena that owns them.
//!
//! Records never point at each other or at their observers' owners. The
//! dispatcher addresses them through `RecordIndex` values, which carry a
//! generation so a stale index left in a table after the slot was reused
//! resolves to nothing instead of to an unrelated record.

use std::fmt;

use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::cache::CacheEntry;
use crate::error::OperationError;
use crate::key::RequestKey;
use crate::observer::{Observer, Response};
use crate::request::OperationRequest;

/// Handle returned for every submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub(crate) u64);

impl OperationId {
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Rebuild an id that was handed out as a plain integer.
    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Lifecycle of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationState {
    Ready,
    Started,
    /// A fresh cached payload was delivered; a background load may follow.
    RespondingFromCache,
    /// A stale payload was delivered while a revalidation runs.
    RespondingFromStaleCache,
    Completed,
    Error,
    Cancelled,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Error | OperationState::Cancelled
        )
    }

    /// Whether the state is one a same-key submission may attach to.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            OperationState::Started
                | OperationState::RespondingFromCache
                | OperationState::RespondingFromStaleCache
        )
    }

    pub fn can_transition_to(self, next: OperationState) -> bool {
        use OperationState::*;
        match (self, next) {
            (Ready, Started | RespondingFromCache | RespondingFromStaleCache | Cancelled) => true,
            (Started, RespondingFromCache | RespondingFromStaleCache) => true,
            (Started | RespondingFromCache | RespondingFromStaleCache, Completed | Error | Cancelled) => {
                true
            }
            _ => false,
        }
    }
}

/// One caller's interest in a record.
pub(crate) struct Subscriber {
    pub id: OperationId,
    pub observers: Vec<Observer>,
    pub freezable: bool,
    /// Already received a cached payload.
    pub delivered: bool,
    done: Option<oneshot::Sender<OperationState>>,
}

impl Subscriber {
    pub fn new(
        id: OperationId,
        observer: Observer,
        freezable: bool,
        done: Option<oneshot::Sender<OperationState>>,
    ) -> Self {
        Self {
            id,
            observers: vec![observer],
            freezable,
            delivered: false,
            done,
        }
    }

    /// Report the final local state to whoever waits on this submission.
    pub fn finish(&mut self, state: OperationState) {
        if let Some(tx) = self.done.take() {
            let _ = tx.send(state);
        }
    }
}

/// The unit of work the dispatcher drives.
pub(crate) struct OperationRecord {
    /// Instance id; the id of the submission that created the record.
    pub id: OperationId,
    pub key: RequestKey,
    pub sequence: u64,
    pub request: OperationRequest,
    pub state: OperationState,
    pub subscribers: Vec<Subscriber>,
    /// Entry delivered before the transfer, sent back as a validator.
    pub cached: Option<CacheEntry>,
    pub response: Option<Response>,
    pub error: Option<OperationError>,
    pub abort: Option<AbortHandle>,
    /// The transfer task is writing this record to the freeze store.
    pub freezing: bool,
}

impl OperationRecord {
    pub fn new(id: OperationId, key: RequestKey, sequence: u64, request: OperationRequest) -> Self {
        Self {
            id,
            key,
            sequence,
            request,
            state: OperationState::Ready,
            subscribers: Vec::new(),
            cached: None,
            response: None,
            error: None,
            abort: None,
            freezing: false,
        }
    }

    /// Move to `next`. Illegal moves are ignored and reported as `false`.
    pub fn transition(&mut self, next: OperationState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::warn!(id = %self.id, from = ?self.state, to = ?next, "ignoring illegal transition");
            return false;
        }
        tracing::debug!(id = %self.id, key = %self.key, from = ?self.state, to = ?next, "transition");
        self.state = next;
        true
    }

    pub fn is_freezable(&self) -> bool {
        self.subscribers.iter().any(|s| s.freezable)
    }

    pub fn observers(&self) -> Vec<Observer> {
        self.subscribers
            .iter()
            .flat_map(|s| s.observers.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RecordIndex {
    slot: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    record: Option<OperationRecord>,
}

/// Generational slab of live records.
#[derive(Default)]
pub(crate) struct RecordArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl RecordArena {
    pub fn insert(&mut self, record: OperationRecord) -> RecordIndex {
        self.live += 1;
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot as usize];
            entry.record = Some(record);
            return RecordIndex {
                slot,
                generation: entry.generation,
            };
        }
        self.slots.push(Slot {
            generation: 0,
            record: Some(record),
        });
        RecordIndex {
            slot: (self.slots.len() - 1) as u32,
            generation: 0,
        }
    }

    pub fn get(&self, index: RecordIndex) -> Option<&OperationRecord> {
        self.slots
            .get(index.slot as usize)
            .filter(|s| s.generation == index.generation)
            .and_then(|s| s.record.as_ref())
    }

    pub fn get_mut(&mut self, index: RecordIndex) -> Option<&mut OperationRecord> {
        self.slots
            .get_mut(index.slot as usize)
            .filter(|s| s.generation == index.generation)
            .and_then(|s| s.record.as_mut())
    }

    pub fn remove(&mut self, index: RecordIndex) -> Option<OperationRecord> {
        let slot = self.slots.get_mut(index.slot as usize)?;
        if slot.generation != index.generation {
            return None;
        }
        let record = slot.record.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index.slot);
        self.live -= 1;
        Some(record)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn iter(&self) -> impl Iterator<Item = (RecordIndex, &OperationRecord)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.record.as_ref().map(|r| {
                (
                    RecordIndex {
                        slot: i as u32,
                        generation: s.generation,
                    },
                    r,
                )
            })
        })
    }
}
