use log::{debug, warn};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::protocol::{ModbusRequest, ResponseData};
use crate::utils::error::ModbusError;

type Completion = oneshot::Sender<Result<ResponseData, ModbusError>>;

struct PendingRequest {
    request: ModbusRequest,
    completion: Completion,
    timer: JoinHandle<()>,
    /// Distinguishes this entry from a later one that reuses the id.
    seq: u64,
    issued_at: Instant,
}

struct TableInner {
    pending: HashMap<u16, PendingRequest>,
    next_id: u16,
    next_seq: u64,
}

/// Correlates responses with outstanding requests by transaction id.
///
/// Cloning yields another handle to the same table. Every entry leaves the
/// table exactly once: through `resolve`, `reject`, `fail_all` or its own
/// timeout. Whatever arrives for an id that already left is dropped.
#[derive(Clone)]
pub struct TransactionTable {
    inner: Arc<Mutex<TableInner>>,
}

/// Completion of one registered request; resolves to the decoded data or
/// the error the entry was rejected with.
#[derive(Debug)]
pub struct PendingHandle {
    transaction_id: u16,
    receiver: oneshot::Receiver<Result<ResponseData, ModbusError>>,
}

impl PendingHandle {
    pub fn transaction_id(&self) -> u16 {
        self.transaction_id
    }
}

impl Future for PendingHandle {
    type Output = Result<ResponseData, ModbusError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(ModbusError::ConnectionClosed)))
    }
}

impl Default for TransactionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionTable {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TableInner {
                pending: HashMap::new(),
                next_id: 1,
                next_seq: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next id from the wrapping 16-bit counter, skipping ids still pending.
    pub fn next_id(&self) -> Result<u16, ModbusError> {
        let mut inner = self.lock();
        for _ in 0..=u16::MAX as u32 {
            let id = inner.next_id;
            inner.next_id = inner.next_id.wrapping_add(1);
            if !inner.pending.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(ModbusError::TransactionIdExhausted)
    }

    /// Stores a pending entry and arms its timeout.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(
        &self,
        transaction_id: u16,
        request: ModbusRequest,
        timeout: Duration,
    ) -> Result<PendingHandle, ModbusError> {
        let (completion, receiver) = oneshot::channel();
        let mut inner = self.lock();

        if inner.pending.contains_key(&transaction_id) {
            return Err(ModbusError::Validation(format!(
                "transaction {} is already pending",
                transaction_id
            )));
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;

        let table = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            table.expire(transaction_id, seq, timeout);
        });

        debug!(
            "⏳ Registered transaction {} ({} @ {}, timeout {:?})",
            transaction_id, request.function, request.address, timeout
        );

        inner.pending.insert(
            transaction_id,
            PendingRequest {
                request,
                completion,
                timer,
                seq,
                issued_at: Instant::now(),
            },
        );

        Ok(PendingHandle {
            transaction_id,
            receiver,
        })
    }

    /// Descriptor of a pending request, used to decode its response.
    pub fn request(&self, transaction_id: u16) -> Option<ModbusRequest> {
        self.lock()
            .pending
            .get(&transaction_id)
            .map(|entry| entry.request.clone())
    }

    pub fn is_pending(&self, transaction_id: u16) -> bool {
        self.lock().pending.contains_key(&transaction_id)
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Completes an entry successfully. Returns `false` when the id is
    /// unknown or already completed; the data is dropped in that case.
    pub fn resolve(&self, transaction_id: u16, data: ResponseData) -> bool {
        match self.take(transaction_id) {
            Some(entry) => {
                debug!(
                    "✅ Transaction {} resolved after {:?}",
                    transaction_id,
                    entry.issued_at.elapsed()
                );
                let _ = entry.completion.send(Ok(data));
                true
            }
            None => {
                debug!("🗑️  Dropping response for unknown transaction {}", transaction_id);
                false
            }
        }
    }

    /// Completes an entry with `error`. Same removal rules as `resolve`.
    pub fn reject(&self, transaction_id: u16, error: ModbusError) -> bool {
        match self.take(transaction_id) {
            Some(entry) => {
                debug!("❌ Transaction {} rejected: {}", transaction_id, error);
                let _ = entry.completion.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Rejects and removes every pending entry. Returns how many were failed.
    pub fn fail_all(&self, error: ModbusError) -> usize {
        let drained: Vec<(u16, PendingRequest)> = self.lock().pending.drain().collect();
        let count = drained.len();

        for (_, entry) in drained {
            entry.timer.abort();
            let _ = entry.completion.send(Err(error.clone()));
        }

        if count > 0 {
            warn!("⚠️  Failed {} pending request(s): {}", count, error);
        }
        count
    }

    fn take(&self, transaction_id: u16) -> Option<PendingRequest> {
        let entry = self.lock().pending.remove(&transaction_id)?;
        entry.timer.abort();
        Some(entry)
    }

    fn expire(&self, transaction_id: u16, seq: u64, timeout: Duration) {
        let entry = {
            let mut inner = self.lock();
            match inner.pending.get(&transaction_id) {
                Some(entry) if entry.seq == seq => inner.pending.remove(&transaction_id),
                _ => None,
            }
        };

        if let Some(entry) = entry {
            warn!(
                "⏰ Transaction {} ({}) timed out after {:?}",
                transaction_id, entry.request.function, timeout
            );
            let _ = entry
                .completion
                .send(Err(ModbusError::RequestTimeout { transaction_id }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::protocol::FunctionCode;

    fn read_request() -> ModbusRequest {
        ModbusRequest::read(FunctionCode::ReadHoldingRegisters, 1, 0, 1)
    }

    #[tokio::test]
    async fn test_resolve_completes_handle() {
        let table = TransactionTable::new();
        let id = table.next_id().unwrap();
        let handle = table.register(id, read_request(), Duration::from_secs(5)).unwrap();

        assert!(table.resolve(id, ResponseData::Registers(vec![7])));
        assert_eq!(handle.await, Ok(ResponseData::Registers(vec![7])));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_id_is_dropped_without_side_effects() {
        let table = TransactionTable::new();
        let id = table.next_id().unwrap();
        let handle = table.register(id, read_request(), Duration::from_secs(5)).unwrap();

        assert!(!table.resolve(id.wrapping_add(100), ResponseData::Registers(vec![1])));
        assert!(table.is_pending(id));

        table.resolve(id, ResponseData::Registers(vec![2]));
        assert_eq!(handle.await, Ok(ResponseData::Registers(vec![2])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects_and_late_response_is_dropped() {
        let table = TransactionTable::new();
        let id = table.next_id().unwrap();
        let handle = table.register(id, read_request(), Duration::from_millis(50)).unwrap();

        assert_eq!(handle.await, Err(ModbusError::RequestTimeout { transaction_id: id }));
        assert!(!table.is_pending(id));
        assert!(!table.resolve(id, ResponseData::Registers(vec![1])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_only_affects_its_own_entry() {
        let table = TransactionTable::new();
        let short_id = table.next_id().unwrap();
        let long_id = table.next_id().unwrap();
        let short = table.register(short_id, read_request(), Duration::from_millis(50)).unwrap();
        let long = table.register(long_id, read_request(), Duration::from_secs(10)).unwrap();

        assert!(short.await.is_err());
        assert!(table.is_pending(long_id));
        table.resolve(long_id, ResponseData::Bits(vec![true]));
        assert_eq!(long.await, Ok(ResponseData::Bits(vec![true])));
    }

    #[tokio::test]
    async fn test_fail_all_rejects_everything() {
        let table = TransactionTable::new();
        let mut handles = Vec::new();
        for _ in 0..5 {
            let id = table.next_id().unwrap();
            handles.push(table.register(id, read_request(), Duration::from_secs(5)).unwrap());
        }

        assert_eq!(table.fail_all(ModbusError::ConnectionLost), 5);
        for handle in handles {
            assert_eq!(handle.await, Err(ModbusError::ConnectionLost));
        }
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_ids_are_distinct_and_skip_pending() {
        let table = TransactionTable::new();
        let first = table.next_id().unwrap();
        let _pending = table.register(first, read_request(), Duration::from_secs(5)).unwrap();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..u16::MAX {
            let id = table.next_id().unwrap();
            assert_ne!(id, first);
            assert!(seen.insert(id));
        }
    }

    #[tokio::test]
    async fn test_counter_wraps() {
        let table = TransactionTable::new();
        let ids: Vec<u16> = (0..=u16::MAX as u32 + 1).map(|_| table.next_id().unwrap()).collect();
        assert_eq!(ids[0], 1);
        assert_eq!(ids[u16::MAX as usize - 1], u16::MAX);
        assert_eq!(ids[u16::MAX as usize], 0);
        assert_eq!(ids[u16::MAX as usize + 1], 1);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let table = TransactionTable::new();
        let _first = table.register(9, read_request(), Duration::from_secs(5)).unwrap();
        assert!(table.register(9, read_request(), Duration::from_secs(5)).is_err());
    }
}
