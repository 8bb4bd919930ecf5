//! Key-value view over a transaction

use manifold_core::{ByteKey, ManifoldError, ManifoldResult, Value};
use tracing::debug;

use crate::transaction::{Transaction, TxnStatus};

/// Key-value access that reports an aborted transaction as `Aborted`.
///
/// Once the transaction is closed by its owner or doomed by a concurrent
/// committer, reads and writes fail with `ManifoldError::Aborted`. A doomed
/// transaction fails `close` too; closing after a self-abort is a no-op.
/// The locks are released on the first such failure.
pub trait TransactionView {
    fn get(&mut self, key: &ByteKey) -> ManifoldResult<Option<Value>>;

    fn put(&mut self, key: ByteKey, value: Value) -> ManifoldResult<()>;

    fn delete(&mut self, key: &ByteKey) -> ManifoldResult<()>;

    fn close(&mut self) -> ManifoldResult<()>;
}

impl Transaction {
    fn check_not_aborted(&mut self) -> ManifoldResult<()> {
        match self.status() {
            TxnStatus::Aborted | TxnStatus::Conflicted => Err(ManifoldError::Aborted),
            TxnStatus::Active if self.is_doomed() => {
                debug!("{} was aborted by a concurrent commit", self.id());
                Transaction::close(self);
                Err(ManifoldError::Aborted)
            }
            _ => Ok(()),
        }
    }
}

impl TransactionView for Transaction {
    fn get(&mut self, key: &ByteKey) -> ManifoldResult<Option<Value>> {
        self.check_not_aborted()?;
        self.read(key)
    }

    fn put(&mut self, key: ByteKey, value: Value) -> ManifoldResult<()> {
        self.check_not_aborted()?;
        self.write(key, value)
    }

    fn delete(&mut self, key: &ByteKey) -> ManifoldResult<()> {
        self.check_not_aborted()?;
        Transaction::delete(self, key)
    }

    fn close(&mut self) -> ManifoldResult<()> {
        if self.status() == TxnStatus::Aborted {
            return Ok(());
        }
        self.check_not_aborted()?;
        if self.status() == TxnStatus::Active {
            Transaction::close(self);
        }
        Ok(())
    }
}
