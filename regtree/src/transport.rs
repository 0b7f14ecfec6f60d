/*!
Transactions and the transport seam.

A [`Transaction`] is one in-flight hardware access. Transports accept
transactions without blocking and complete them later, possibly from another
thread; the issuer waits on the transaction when it needs the result.
*/

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{trace, warn};

use crate::constants::DEFAULT_TIMEOUT;
use crate::util::lock;

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

/// Transaction kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnKind {
    Read,
    Write,
    Post,
    Verify,
}

impl TxnKind {
    /// Numeric code shared with hardware transports
    pub fn code(&self) -> u32 {
        match self {
            Self::Read => 1,
            Self::Write => 2,
            Self::Post => 3,
            Self::Verify => 4,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Read),
            2 => Some(Self::Write),
            3 => Some(Self::Post),
            4 => Some(Self::Verify),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Post => "post",
            Self::Verify => "verify",
        }
    }

    /// Whether the transaction returns data from hardware
    pub fn is_read(&self) -> bool {
        matches!(self, Self::Read | Self::Verify)
    }
}

impl fmt::Display for TxnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error reported by a transport when completing a transaction
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportError {
    #[error("transaction timeout")]
    Timeout,
    #[error("verify mismatch")]
    Verify,
    #[error("address error")]
    Address,
    #[error("bus timeout")]
    BusTimeout,
    #[error("bus failure")]
    BusFail,
    #[error("unsupported transaction")]
    Unsupported,
    #[error("size error")]
    Size,
    #[error("protocol error")]
    Protocol,
}

impl TransportError {
    /// Error code carried in the top byte of a transport status word
    pub fn code(&self) -> u32 {
        match self {
            Self::Timeout => 0x0100_0000,
            Self::Verify => 0x0200_0000,
            Self::Address => 0x0300_0000,
            Self::BusTimeout => 0x0400_0000,
            Self::BusFail => 0x0500_0000,
            Self::Unsupported => 0x0600_0000,
            Self::Size => 0x0700_0000,
            Self::Protocol => 0x0800_0000,
        }
    }

    /// Decode a status word; low bytes carry transport-specific detail
    pub fn from_code(code: u32) -> Option<Self> {
        match code & 0xFF00_0000 {
            0x0100_0000 => Some(Self::Timeout),
            0x0200_0000 => Some(Self::Verify),
            0x0300_0000 => Some(Self::Address),
            0x0400_0000 => Some(Self::BusTimeout),
            0x0500_0000 => Some(Self::BusFail),
            0x0600_0000 => Some(Self::Unsupported),
            0x0700_0000 => Some(Self::Size),
            0x0800_0000 => Some(Self::Protocol),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct TxnState {
    done: bool,
    error: Option<TransportError>,
}

/// One in-flight hardware access
#[derive(Debug)]
pub struct Transaction {
    id: u32,
    address: u64,
    kind: TxnKind,
    data: Mutex<Vec<u8>>,
    state: Mutex<TxnState>,
    cond: Condvar,
    timeout: Duration,
    start: Instant,
}

impl Transaction {
    pub fn new(address: u64, kind: TxnKind, data: Vec<u8>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            address,
            kind,
            data: Mutex::new(data),
            state: Mutex::new(TxnState::default()),
            cond: Condvar::new(),
            timeout,
            start: Instant::now(),
        })
    }

    /// Create a transaction with a zeroed buffer of `size` bytes
    pub fn read(address: u64, kind: TxnKind, size: usize, timeout: Duration) -> Arc<Self> {
        Self::new(address, kind, vec![0; size], timeout)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn kind(&self) -> TxnKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        lock(&self.data).len()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Snapshot of the transaction buffer
    pub fn data(&self) -> Vec<u8> {
        lock(&self.data).clone()
    }

    /// Copy `bytes` into the buffer at `offset`; out of range bytes are dropped
    pub fn set_bytes(&self, offset: usize, bytes: &[u8]) {
        let mut data = lock(&self.data);
        if offset >= data.len() {
            return;
        }
        let end = (offset + bytes.len()).min(data.len());
        data[offset..end].copy_from_slice(&bytes[..end - offset]);
    }

    /// Mark the transaction complete. Later calls are ignored.
    pub fn done(&self, error: Option<TransportError>) {
        let mut state = lock(&self.state);
        if state.done {
            return;
        }
        state.done = true;
        state.error = error;
        trace!(
            "Transaction {} {} at {:#x} done: {:?}",
            self.id,
            self.kind,
            self.address,
            error
        );
        self.cond.notify_all();
    }

    pub fn is_done(&self) -> bool {
        lock(&self.state).done
    }

    pub fn error(&self) -> Option<TransportError> {
        lock(&self.state).error
    }

    pub fn expired(&self) -> bool {
        self.start.elapsed() >= self.timeout
    }

    /// Block until the transaction completes. A transaction still pending
    /// when its timeout elapses is failed with [`TransportError::Timeout`].
    pub fn wait(&self) -> Option<TransportError> {
        let deadline = self.start + self.timeout;
        let mut state = lock(&self.state);

        while !state.done {
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "⏱️ Transaction {} {} at {:#x} timed out after {:?}",
                    self.id, self.kind, self.address, self.timeout
                );
                state.done = true;
                state.error = Some(TransportError::Timeout);
                self.cond.notify_all();
                break;
            }
            state = match self.cond.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }

        state.error
    }
}

/// Carrier of transactions to hardware
pub trait Transport: Send + Sync {
    /// Smallest addressable unit, in bytes
    fn min_access(&self) -> usize;

    /// Largest single transaction, in bytes
    fn max_access(&self) -> usize;

    /// Whether the transport implements a transaction kind natively
    fn supports(&self, _kind: TxnKind) -> bool {
        true
    }

    /// Accept a transaction. Must not block on completion.
    fn submit(&self, txn: Arc<Transaction>);
}

/// Handle to a transport at a base address
#[derive(Clone)]
pub struct Master {
    transport: Arc<dyn Transport>,
    address: u64,
    timeout: Duration,
}

impl Master {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            address: 0,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_address(mut self, address: u64) -> Self {
        self.address = address;
        self
    }

    /// Same transport, base address moved by `offset`
    pub fn with_offset(&self, offset: u64) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            address: self.address + offset,
            timeout: self.timeout,
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn min_access(&self) -> usize {
        self.transport.min_access()
    }

    pub fn max_access(&self) -> usize {
        self.transport.max_access()
    }

    pub fn supports(&self, kind: TxnKind) -> bool {
        self.transport.supports(kind)
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Submit a transaction at `offset` from the base address
    pub fn issue(&self, offset: u64, kind: TxnKind, data: Vec<u8>) -> Arc<Transaction> {
        let txn = Transaction::new(self.address + offset, kind, data, self.timeout);
        trace!(
            "Issue transaction {} {} at {:#x} size {}",
            txn.id(),
            kind,
            txn.address(),
            txn.size()
        );
        self.transport.submit(Arc::clone(&txn));
        txn
    }
}

impl fmt::Debug for Master {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Master")
            .field("address", &format_args!("{:#x}", self.address))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Wait for every transaction and return the first error
pub fn wait_all(txns: &[Arc<Transaction>]) -> Option<TransportError> {
    let mut first = None;
    for txn in txns {
        if let Some(error) = txn.wait() {
            first.get_or_insert(error);
        }
    }
    first
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_error_codes() {
        let all = [
            TransportError::Timeout,
            TransportError::Verify,
            TransportError::Address,
            TransportError::BusTimeout,
            TransportError::BusFail,
            TransportError::Unsupported,
            TransportError::Size,
            TransportError::Protocol,
        ];
        for err in all {
            assert_eq!(TransportError::from_code(err.code()), Some(err));
        }
        assert_eq!(
            TransportError::from_code(0x0500_0012),
            Some(TransportError::BusFail)
        );
        assert_eq!(TransportError::from_code(0), None);
        assert_eq!(TxnKind::from_code(TxnKind::Post.code()), Some(TxnKind::Post));
    }

    #[test]
    fn test_wait_after_done() {
        let txn = Transaction::read(0x10, TxnKind::Read, 4, DEFAULT_TIMEOUT);
        txn.set_bytes(0, &[1, 2, 3, 4]);
        txn.done(None);
        txn.done(Some(TransportError::BusFail));
        assert_eq!(txn.wait(), None);
        assert_eq!(txn.data(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_completion_from_other_thread() {
        let txn = Transaction::read(0, TxnKind::Read, 2, Duration::from_secs(5));
        let remote = Arc::clone(&txn);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.done(Some(TransportError::Address));
        });
        assert_eq!(txn.wait(), Some(TransportError::Address));
        handle.join().unwrap();
    }

    #[test]
    fn test_timeout() {
        let txn = Transaction::read(0, TxnKind::Read, 4, Duration::from_millis(20));
        assert_eq!(txn.wait(), Some(TransportError::Timeout));
        assert!(txn.is_done());
        assert!(txn.expired());
    }

    #[test]
    fn test_set_bytes_clamps() {
        let txn = Transaction::read(0, TxnKind::Read, 3, DEFAULT_TIMEOUT);
        txn.set_bytes(1, &[9, 9, 9, 9]);
        txn.set_bytes(7, &[5]);
        assert_eq!(txn.data(), vec![0, 9, 9]);
    }
}
