pub mod concurrency;
pub mod wal;

pub use concurrency::lock_manager::LockManager;
pub use concurrency::transaction::{Transaction, TransactionState};
pub use concurrency::transaction_manager::{TransactionError, TransactionManager};
pub use wal::log_manager::LogManager;
pub use wal::log_record::{LogPayload, LogRecord, LogRecordType};
