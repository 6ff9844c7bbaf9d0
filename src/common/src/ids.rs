use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static TXN_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Implementation of transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId {
    /// Id of transaction.
    id: u64,
}

impl TransactionId {
    /// Creates a new transaction id.
    pub fn new() -> Self {
        Self {
            id: TXN_COUNTER.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Returns the transaction id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        TransactionId::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Identifies a column within a record shape.
pub type ColumnId = u32;

/// Driver-issued cursor id. Zero is never a valid cursor.
pub type CursorId = u64;

/// The cursor id a driver returns when opening failed silently.
pub const NO_CURSOR: CursorId = 0;

/// Handle under which the host binding tracks an open query.
pub type QueryHandle = u64;
