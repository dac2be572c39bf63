// Transaction handling for the single-writer / many-reader model: write-ahead
// logging, crash recovery, and the lifecycle coordinator tying them together.

pub mod manager;
pub mod recovery;
pub mod snapshot;
pub mod types;
pub mod wal_manager;
pub mod write_lock;

pub use manager::TransactionManager;
pub use recovery::{recover, RecoveryReport};
pub use snapshot::SnapshotRegistry;
pub use types::{Transaction, TransactionKind, TransactionState};
pub use wal_manager::{WalEntry, WalEntryKind, WalManager};
pub use write_lock::{CancellationToken, WriteLock, WriteLockGuard};
