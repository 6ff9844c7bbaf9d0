use common::driver::{lock_driver, new_driver_ref, DriverRef, TransactionDriver};
use common::ids::TransactionId;
use common::DbError;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Live transactions of one session, keyed by transaction id.
///
/// Passed explicitly to everything that resolves a transaction; there is no
/// process-wide instance.
#[derive(Default)]
pub struct TransactionRegistry {
    transactions: RwLock<HashMap<TransactionId, DriverRef>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self {
            transactions: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry ready to be shared between executors.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<TransactionId, DriverRef>>, DbError> {
        self.transactions
            .read()
            .map_err(|_| DbError::InternalError(String::from("transaction registry poisoned")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<TransactionId, DriverRef>>, DbError> {
        self.transactions
            .write()
            .map_err(|_| DbError::InternalError(String::from("transaction registry poisoned")))
    }

    /// Register a driver as a new transaction.
    ///
    /// # Arguments
    ///
    /// * `driver` - Driver serving the transaction.
    pub fn register(&self, driver: Box<dyn TransactionDriver>) -> Result<TransactionId, DbError> {
        let tid = TransactionId::new();
        self.write()?.insert(tid, new_driver_ref(driver));
        debug!("registered transaction {}", tid);
        Ok(tid)
    }

    /// Get the driver slot of a transaction.
    pub fn get(&self, tid: TransactionId) -> Result<DriverRef, DbError> {
        self.read()?
            .get(&tid)
            .cloned()
            .ok_or_else(|| DbError::InvalidTransaction(format!("transaction {} does not exist", tid)))
    }

    pub fn contains(&self, tid: TransactionId) -> bool {
        self.read().map(|m| m.contains_key(&tid)).unwrap_or(false)
    }

    /// Remove a transaction. Queries still holding it fail on their next call.
    pub fn invalidate(&self, tid: TransactionId) -> Result<DriverRef, DbError> {
        let removed = self.write()?.remove(&tid);
        match removed {
            Some(driver) => {
                info!("invalidated transaction {}", tid);
                Ok(driver)
            }
            None => Err(DbError::InvalidTransaction(format!(
                "transaction {} does not exist",
                tid
            ))),
        }
    }

    /// Swap the driver behind a live transaction, keeping its id and every
    /// outstanding binding. Returns the previous driver.
    ///
    /// # Arguments
    ///
    /// * `tid` - Transaction to rebind.
    /// * `driver` - The new driver.
    pub fn rebind(
        &self,
        tid: TransactionId,
        driver: Box<dyn TransactionDriver>,
    ) -> Result<Box<dyn TransactionDriver>, DbError> {
        let slot = self.get(tid)?;
        let mut guard = lock_driver(&slot)?;
        info!("rebinding transaction {}", tid);
        Ok(std::mem::replace(&mut *guard, driver))
    }

    /// Probe every registered driver. Runs under the registry lock and
    /// returns the ids whose probe failed.
    pub fn keep_alive_sweep(&self) -> Result<Vec<TransactionId>, DbError> {
        let map = self.read()?;
        let mut failed = Vec::new();
        for (tid, slot) in map.iter() {
            let alive = match slot.try_lock() {
                Ok(mut driver) => driver.keep_alive(),
                // Busy drivers are evidently alive.
                Err(std::sync::TryLockError::WouldBlock) => true,
                Err(std::sync::TryLockError::Poisoned(_)) => false,
            };
            if !alive {
                warn!("keep-alive failed for transaction {}", tid);
                failed.push(*tid);
            }
        }
        failed.sort();
        Ok(failed)
    }

    /// Number of registered transactions.
    pub fn len(&self) -> usize {
        self.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
