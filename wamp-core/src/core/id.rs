use std::fmt::Display;

use async_trait::async_trait;
use futures_util::lock::Mutex;
use thiserror::Error;

/// An integer ID, used for identification of resources and requests.
///
/// IDs on the wire may take any value in `[0, 2^53]`. Allocators only generate values in
/// `[1, 2^53]`, so that `0` can be used for router-initiated messages that answer no request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Id(u64);

impl Id {
    /// The minimum allowable value of an ID.
    pub const MIN: Id = Id(0);

    /// The maximum allowable value of an ID.
    pub const MAX: Id = Id(1 << 53);

    /// The smallest ID an allocator hands out.
    pub const FIRST: Id = Id(1);

    /// The raw integer value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Default for Id {
    fn default() -> Self {
        Id::FIRST
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Id> for u64 {
    fn from(value: Id) -> Self {
        value.0
    }
}

/// Error for an ID being out of range.
#[derive(Debug, Error)]
#[error("{value} is out of range for IDs")]
pub struct IdOutOfRange {
    value: u64,
}

impl IdOutOfRange {
    fn new(value: u64) -> Self {
        Self { value }
    }
}

impl TryFrom<u64> for Id {
    type Error = IdOutOfRange;
    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value > Self::MAX.0 {
            Err(IdOutOfRange::new(value))
        } else {
            Ok(Id(value))
        }
    }
}

/// An ID allocator.
#[async_trait]
pub trait IdAllocator: Send + Sync {
    /// Generates a new ID.
    async fn generate_id(&self) -> Id;

    /// Resets the allocator to its initial state.
    async fn reset(&self);
}

/// An ID allocator that generates IDs from a random sequence.
///
/// Used for global-scoped IDs, such as sessions, publications, and invocations.
#[derive(Debug, Default)]
pub struct RandomIdAllocator {}

#[async_trait]
impl IdAllocator for RandomIdAllocator {
    async fn generate_id(&self) -> Id {
        Id((rand::random::<u64>() & (Id::MAX.0 - 1)) + 1)
    }

    async fn reset(&self) {}
}

/// An ID allocator that generates IDs sequentially.
///
/// Used for session-scoped IDs, such as request IDs on a peer or subscriptions on a router.
#[derive(Debug, Default)]
pub struct SequentialIdAllocator {
    next: Mutex<Id>,
}

#[async_trait]
impl IdAllocator for SequentialIdAllocator {
    async fn generate_id(&self) -> Id {
        let mut lock = self.next.lock().await;
        let id = *lock;
        *lock = if id.0 >= Id::MAX.0 {
            Id::FIRST
        } else {
            Id(id.0 + 1)
        };
        id
    }

    async fn reset(&self) {
        let mut lock = self.next.lock().await;
        *lock = Id::FIRST;
    }
}
