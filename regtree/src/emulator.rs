/*!
In-process memory space.

[`MemoryEmulator`] implements [`Transport`] over a sparse byte map. It can
complete transactions inline on submit or from a worker thread, and supports
fault injection so that error paths can be exercised without hardware.
*/

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::constants::{DEFAULT_HISTORY_CAPACITY, DEFAULT_MAX_ACCESS, DEFAULT_MIN_ACCESS};
use crate::transport::{Transaction, Transport, TransportError, TxnKind};
use crate::util::lock;

/// Emulator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Required address alignment, in bytes
    pub min_access: usize,
    /// Largest accepted transaction, in bytes
    pub max_access: usize,
    /// Artificial completion delay, in milliseconds
    pub latency_ms: u64,
    /// Complete transactions from a worker thread instead of inline
    pub threaded: bool,
    /// Accept native verify transactions
    pub verify: bool,
    /// Most recent transactions kept in the access history; 0 disables it
    pub history_capacity: usize,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            min_access: DEFAULT_MIN_ACCESS,
            max_access: DEFAULT_MAX_ACCESS,
            latency_ms: 0,
            threaded: false,
            verify: true,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

/// Transaction counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EmulatorStats {
    pub reads: u64,
    pub writes: u64,
    pub posts: u64,
    pub verifies: u64,
    pub errors: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// One transaction as seen by the emulator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessRecord {
    pub address: u64,
    pub size: usize,
    pub kind: TxnKind,
}

#[derive(Debug, Default)]
struct EmulatorState {
    memory: BTreeMap<u64, u8>,
    faults: HashMap<u64, TransportError>,
    read_overrides: BTreeMap<u64, u8>,
    stats: EmulatorStats,
    history: VecDeque<AccessRecord>,
}

/// Sparse memory space implementing [`Transport`]
pub struct MemoryEmulator {
    config: EmulatorConfig,
    state: Arc<Mutex<EmulatorState>>,
    running: Arc<AtomicBool>,
    queue: Option<Sender<Arc<Transaction>>>,
    worker: Option<JoinHandle<()>>,
}

impl MemoryEmulator {
    pub fn new(config: EmulatorConfig) -> Arc<Self> {
        let state = Arc::new(Mutex::new(EmulatorState::default()));
        let running = Arc::new(AtomicBool::new(true));

        let (queue, worker) = if config.threaded {
            let (tx, rx) = unbounded::<Arc<Transaction>>();
            let worker_state = Arc::clone(&state);
            let worker_running = Arc::clone(&running);
            let worker_config = config.clone();
            let handle = thread::spawn(move || {
                Self::worker_thread(rx, worker_state, worker_config, worker_running)
            });
            (Some(tx), Some(handle))
        } else {
            (None, None)
        };

        info!(
            "🧪 Memory emulator ready (min access {}, max access {}, threaded: {})",
            config.min_access, config.max_access, config.threaded
        );

        Arc::new(Self {
            config,
            state,
            running,
            queue,
            worker,
        })
    }

    /// Emulator with default configuration completing transactions inline
    pub fn inline() -> Arc<Self> {
        Self::new(EmulatorConfig::default())
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    /// Fail every transaction covering `address` with `error`
    pub fn fail_at(&self, address: u64, error: TransportError) {
        lock(&self.state).faults.insert(address, error);
    }

    pub fn clear_fault(&self, address: u64) {
        lock(&self.state).faults.remove(&address);
    }

    /// Return `bytes` at `address` on read-back instead of memory contents.
    /// Writes still land in memory.
    pub fn override_read(&self, address: u64, bytes: &[u8]) {
        let mut state = lock(&self.state);
        for (i, b) in bytes.iter().enumerate() {
            state.read_overrides.insert(address + i as u64, *b);
        }
    }

    pub fn clear_overrides(&self) {
        lock(&self.state).read_overrides.clear();
    }

    /// Read memory directly, bypassing the transaction path
    pub fn peek(&self, address: u64, size: usize) -> Vec<u8> {
        let state = lock(&self.state);
        (0..size as u64)
            .map(|i| state.memory.get(&(address + i)).copied().unwrap_or(0))
            .collect()
    }

    /// Write memory directly, bypassing the transaction path
    pub fn poke(&self, address: u64, bytes: &[u8]) {
        let mut state = lock(&self.state);
        for (i, b) in bytes.iter().enumerate() {
            state.memory.insert(address + i as u64, *b);
        }
    }

    pub fn stats(&self) -> EmulatorStats {
        lock(&self.state).stats
    }

    /// Recorded transactions, oldest first
    pub fn history(&self) -> Vec<AccessRecord> {
        lock(&self.state).history.iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        lock(&self.state).history.clear();
    }

    fn worker_thread(
        rx: Receiver<Arc<Transaction>>,
        state: Arc<Mutex<EmulatorState>>,
        config: EmulatorConfig,
        running: Arc<AtomicBool>,
    ) {
        debug!("🧵 Memory emulator worker started");

        while running.load(Ordering::SeqCst) || !rx.is_empty() {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(txn) => Self::process(&state, &config, &txn),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        debug!("Memory emulator worker stopped");
    }

    fn process(state: &Mutex<EmulatorState>, config: &EmulatorConfig, txn: &Transaction) {
        if config.latency_ms > 0 {
            thread::sleep(Duration::from_millis(config.latency_ms));
        }

        let address = txn.address();
        let size = txn.size();
        let kind = txn.kind();
        let mut state = lock(state);

        if config.history_capacity > 0 {
            if state.history.len() >= config.history_capacity {
                state.history.pop_front();
            }
            state.history.push_back(AccessRecord {
                address,
                size,
                kind,
            });
        }

        let end = address.saturating_add(size as u64);
        let error = if config.min_access > 0 && address % config.min_access as u64 != 0 {
            Some(TransportError::Address)
        } else if size == 0 || size > config.max_access {
            Some(TransportError::Size)
        } else if address.checked_add(size as u64).is_none() {
            Some(TransportError::Address)
        } else if kind == TxnKind::Verify && !config.verify {
            Some(TransportError::Unsupported)
        } else {
            state
                .faults
                .iter()
                .find(|(fault, _)| (address..end).contains(fault))
                .map(|(_, error)| *error)
        };

        if let Some(error) = error {
            state.stats.errors += 1;
            drop(state);
            warn!(
                "❌ Emulated {} at {:#x} size {} failed: {}",
                kind, address, size, error
            );
            txn.done(Some(error));
            return;
        }

        match kind {
            TxnKind::Write | TxnKind::Post => {
                let data = txn.data();
                for (i, b) in data.iter().enumerate() {
                    state.memory.insert(address + i as u64, *b);
                }
                if kind == TxnKind::Write {
                    state.stats.writes += 1;
                } else {
                    state.stats.posts += 1;
                }
                state.stats.bytes_written += size as u64;
                drop(state);
            }
            TxnKind::Read | TxnKind::Verify => {
                let data: Vec<u8> = (address..end)
                    .map(|a| {
                        state
                            .read_overrides
                            .get(&a)
                            .or_else(|| state.memory.get(&a))
                            .copied()
                            .unwrap_or(0)
                    })
                    .collect();
                if kind == TxnKind::Read {
                    state.stats.reads += 1;
                } else {
                    state.stats.verifies += 1;
                }
                state.stats.bytes_read += size as u64;
                drop(state);
                txn.set_bytes(0, &data);
            }
        }

        txn.done(None);
    }
}

impl Transport for MemoryEmulator {
    fn min_access(&self) -> usize {
        self.config.min_access
    }

    fn max_access(&self) -> usize {
        self.config.max_access
    }

    fn supports(&self, kind: TxnKind) -> bool {
        kind != TxnKind::Verify || self.config.verify
    }

    fn submit(&self, txn: Arc<Transaction>) {
        match &self.queue {
            Some(queue) => {
                if let Err(e) = queue.send(txn) {
                    e.into_inner().done(Some(TransportError::Protocol));
                }
            }
            None => Self::process(&self.state, &self.config, &txn),
        }
    }
}

impl Drop for MemoryEmulator {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.queue.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Memory emulator worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_TIMEOUT;
    use crate::transport::Master;

    #[test]
    fn test_write_then_read() {
        let emu = MemoryEmulator::inline();
        let master = Master::new(emu.clone());

        let wr = master.issue(0x100, TxnKind::Write, vec![1, 2, 3, 4]);
        assert_eq!(wr.wait(), None);

        let rd = Transaction::read(0x100, TxnKind::Read, 8, DEFAULT_TIMEOUT);
        emu.submit(Arc::clone(&rd));
        assert_eq!(rd.wait(), None);
        assert_eq!(rd.data(), vec![1, 2, 3, 4, 0, 0, 0, 0]);
        assert_eq!(emu.peek(0x102, 2), vec![3, 4]);

        let stats = emu.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.bytes_read, 8);
    }

    #[test]
    fn test_alignment_and_size_errors() {
        let emu = MemoryEmulator::new(EmulatorConfig {
            max_access: 8,
            ..Default::default()
        });
        let master = Master::new(emu.clone());

        let unaligned = master.issue(0x102, TxnKind::Write, vec![0; 4]);
        assert_eq!(unaligned.wait(), Some(TransportError::Address));

        let too_big = master.issue(0x100, TxnKind::Write, vec![0; 12]);
        assert_eq!(too_big.wait(), Some(TransportError::Size));
        assert_eq!(emu.stats().errors, 2);
    }

    #[test]
    fn test_fault_injection() {
        let emu = MemoryEmulator::inline();
        let master = Master::new(emu.clone());
        emu.fail_at(0x24, TransportError::BusFail);

        let covering = master.issue(0x20, TxnKind::Read, vec![0; 8]);
        assert_eq!(covering.wait(), Some(TransportError::BusFail));

        let elsewhere = master.issue(0x28, TxnKind::Read, vec![0; 4]);
        assert_eq!(elsewhere.wait(), None);

        emu.clear_fault(0x24);
        let retry = master.issue(0x20, TxnKind::Read, vec![0; 8]);
        assert_eq!(retry.wait(), None);
    }

    #[test]
    fn test_read_override() {
        let emu = MemoryEmulator::inline();
        let master = Master::new(emu.clone());

        master.issue(0x10, TxnKind::Write, vec![5, 0, 0, 0]).wait();
        emu.override_read(0x10, &[6]);

        let verify = master.issue(0x10, TxnKind::Verify, vec![0; 4]);
        assert_eq!(verify.wait(), None);
        assert_eq!(verify.data(), vec![6, 0, 0, 0]);
        assert_eq!(emu.peek(0x10, 1), vec![5]);

        emu.clear_overrides();
        let read = master.issue(0x10, TxnKind::Read, vec![0; 4]);
        read.wait();
        assert_eq!(read.data(), vec![5, 0, 0, 0]);
    }

    #[test]
    fn test_verify_unsupported() {
        let emu = MemoryEmulator::new(EmulatorConfig {
            verify: false,
            ..Default::default()
        });
        assert!(!emu.supports(TxnKind::Verify));
        let master = Master::new(emu.clone());
        let txn = master.issue(0, TxnKind::Verify, vec![0; 4]);
        assert_eq!(txn.wait(), Some(TransportError::Unsupported));
    }

    #[test]
    fn test_threaded_completion() {
        let emu = MemoryEmulator::new(EmulatorConfig {
            threaded: true,
            latency_ms: 1,
            ..Default::default()
        });
        let master = Master::new(emu.clone());

        let txns: Vec<_> = (0..8u64)
            .map(|i| master.issue(i * 4, TxnKind::Write, vec![i as u8; 4]))
            .collect();
        assert_eq!(crate::transport::wait_all(&txns), None);
        assert_eq!(emu.peek(28, 4), vec![7; 4]);
        assert_eq!(emu.history().len(), 8);
    }

    #[test]
    fn test_history_is_bounded() {
        let emu = MemoryEmulator::new(EmulatorConfig {
            history_capacity: 3,
            ..Default::default()
        });
        let master = Master::new(emu.clone());
        for i in 0..5u64 {
            master.issue(i * 4, TxnKind::Write, vec![0; 4]).wait();
        }

        let addresses: Vec<u64> = emu.history().iter().map(|r| r.address).collect();
        assert_eq!(addresses, vec![8, 12, 16]);
        assert_eq!(emu.stats().writes, 5);

        let quiet = MemoryEmulator::new(EmulatorConfig {
            history_capacity: 0,
            ..Default::default()
        });
        Master::new(quiet.clone())
            .issue(0, TxnKind::Read, vec![0; 4])
            .wait();
        assert!(quiet.history().is_empty());
    }
}
