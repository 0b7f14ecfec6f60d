/*!
Memory blocks.

A [`Block`] is one contiguous hardware-addressable byte range shared by every
variable attached at the same offset. It keeps a shadow copy of the hardware
bytes, issues whole-block transactions without waiting, and accumulates
transport errors until the next check.
*/

use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{RegError, Result};
use crate::transport::{Master, Transaction, TransportError, TxnKind};
use crate::util::{byte_count, lock, read, write};
use crate::variable::{Mode, Variable};

#[derive(Clone)]
struct Pending {
    txn: Arc<Transaction>,
    /// Bytes the read-back must match, for verify transactions
    expected: Option<Vec<u8>>,
}

struct BlockInner {
    size: usize,
    mode: Option<Mode>,
    poll_enabled: bool,
    enabled: bool,
    variables: Vec<Arc<Variable>>,
    data: Vec<u8>,
    verify_mask: Vec<u8>,
    written: Option<Vec<u8>>,
    pending: Vec<Pending>,
    error: Option<TransportError>,
    updated: bool,
}

/// Contiguous hardware byte range backing one or more variables
pub struct Block {
    offset: u64,
    inner: Mutex<BlockInner>,
    master: RwLock<Option<Master>>,
}

impl Block {
    pub fn new(offset: u64) -> Self {
        Self {
            offset,
            inner: Mutex::new(BlockInner {
                size: 0,
                mode: None,
                poll_enabled: false,
                enabled: true,
                variables: Vec::new(),
                data: Vec::new(),
                verify_mask: Vec::new(),
                written: None,
                pending: Vec::new(),
                error: None,
                updated: false,
            }),
            master: RwLock::new(None),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Absolute hardware address
    pub fn address(&self) -> u64 {
        read(&self.master)
            .as_ref()
            .map(|m| m.address() + self.offset)
            .unwrap_or(self.offset)
    }

    pub fn size(&self) -> usize {
        lock(&self.inner).size
    }

    /// Widest access mode of the attached variables
    pub fn mode(&self) -> Mode {
        lock(&self.inner).mode.unwrap_or(Mode::RW)
    }

    pub fn poll_enabled(&self) -> bool {
        lock(&self.inner).poll_enabled
    }

    pub fn enabled(&self) -> bool {
        lock(&self.inner).enabled
    }

    pub fn variables(&self) -> Vec<Arc<Variable>> {
        lock(&self.inner).variables.clone()
    }

    /// Snapshot of the shadow bytes
    pub fn bytes(&self) -> Vec<u8> {
        lock(&self.inner).data.clone()
    }

    pub fn master(&self) -> Option<Master> {
        read(&self.master).clone()
    }

    /// Attach a variable, widening size, mode and poll flag to cover it.
    /// The size is rounded up to a multiple of `min_access` and never shrinks.
    pub fn attach(&self, variable: &Arc<Variable>, min_access: usize) -> Result<()> {
        if variable.offset() != self.offset {
            return Err(RegError::config(format!(
                "Variable {} at offset {:#x} cannot join block at {:#x}",
                variable.name(),
                variable.offset(),
                self.offset
            )));
        }

        let mut inner = lock(&self.inner);
        let needed = byte_count(variable.bit_offset() + variable.bit_size());
        let size = round_up(inner.size.max(needed), min_access);
        inner.size = size;
        inner.data.resize(size, 0);
        inner.verify_mask.resize(size, 0);

        inner.mode = Some(match inner.mode {
            None => variable.mode(),
            Some(mode) if mode == variable.mode() => mode,
            Some(_) => Mode::RW,
        });
        inner.poll_enabled |= variable.poll();

        if variable.mode() == Mode::RW {
            for bit in variable.bit_offset()..variable.bit_offset() + variable.bit_size() {
                inner.verify_mask[bit / 8] |= 1 << (bit % 8);
            }
        }

        inner.variables.push(Arc::clone(variable));
        debug!(
            "Attached {} to block {:#x} (size {}, mode {:?})",
            variable.name(),
            self.offset,
            size,
            inner.mode
        );
        Ok(())
    }

    /// Round the size up to a new access granularity
    pub fn align(&self, min_access: usize) {
        let mut inner = lock(&self.inner);
        let size = round_up(inner.size, min_access);
        inner.size = size;
        inner.data.resize(size, 0);
        inner.verify_mask.resize(size, 0);
    }

    pub fn set_master(&self, master: Master) {
        let min_access = master.min_access();
        *write(&self.master) = Some(master);
        self.align(min_access);
    }

    /// Transactions are not issued while disabled
    pub fn set_enable(&self, enabled: bool) {
        lock(&self.inner).enabled = enabled;
    }

    /// Copy `bit_size` bits from `bytes` into the shadow at `bit_offset`
    pub fn set_field(&self, bit_offset: usize, bit_size: usize, bytes: &[u8]) -> Result<()> {
        let mut inner = lock(&self.inner);
        check_span(inner.size, bit_offset, bit_size)?;

        if bit_offset % 8 == 0 && bit_size % 8 == 0 {
            let start = bit_offset / 8;
            let len = bit_size / 8;
            inner.data[start..start + len].copy_from_slice(&bytes[..len]);
        } else {
            for i in 0..bit_size {
                let bit = (bytes[i / 8] >> (i % 8)) & 1;
                let dst = bit_offset + i;
                inner.data[dst / 8] &= !(1 << (dst % 8));
                inner.data[dst / 8] |= bit << (dst % 8);
            }
        }
        Ok(())
    }

    /// Extract `bit_size` bits at `bit_offset` from the shadow
    pub fn get_field(&self, bit_offset: usize, bit_size: usize) -> Result<Vec<u8>> {
        let inner = lock(&self.inner);
        check_span(inner.size, bit_offset, bit_size)?;

        if bit_offset % 8 == 0 && bit_size % 8 == 0 {
            let start = bit_offset / 8;
            return Ok(inner.data[start..start + bit_size / 8].to_vec());
        }

        let mut out = vec![0u8; byte_count(bit_size)];
        for i in 0..bit_size {
            let src = bit_offset + i;
            let bit = (inner.data[src / 8] >> (src % 8)) & 1;
            out[i / 8] |= bit << (i % 8);
        }
        Ok(out)
    }

    /// Issue a write of the shadow bytes. Returns immediately.
    pub fn background_write(&self) {
        self.start(TxnKind::Write);
    }

    /// Issue a posted write of the shadow bytes. Returns immediately.
    pub fn background_post(&self) {
        self.start(TxnKind::Post);
    }

    /// Issue a read into the shadow bytes. Returns immediately.
    pub fn background_read(&self) {
        self.start(TxnKind::Read);
    }

    /// Issue a read-back of the last written bytes. Does nothing when no
    /// write happened since the previous verify.
    pub fn background_verify(&self) {
        self.start(TxnKind::Verify);
    }

    fn start(&self, kind: TxnKind) {
        let master = self.master();
        let mut inner = lock(&self.inner);

        if !inner.enabled || inner.size == 0 {
            return;
        }

        let mode = inner.mode.unwrap_or(Mode::RW);
        let allowed = match kind {
            TxnKind::Write | TxnKind::Post => mode != Mode::RO,
            TxnKind::Read => mode != Mode::WO,
            TxnKind::Verify => mode == Mode::RW && inner.written.is_some(),
        };
        if !allowed {
            return;
        }

        let Some(master) = master else {
            warn!("Block {:#x} has no transport, {} skipped", self.offset, kind);
            inner.error.get_or_insert(TransportError::Unsupported);
            return;
        };

        let size = inner.size;
        let (kind, data, expected) = match kind {
            TxnKind::Write => {
                let data = inner.data.clone();
                inner.written = Some(data.clone());
                (kind, data, None)
            }
            TxnKind::Post => (kind, inner.data.clone(), None),
            TxnKind::Read => (kind, vec![0; size], None),
            TxnKind::Verify => {
                let expected = inner.written.take();
                let kind = if master.supports(TxnKind::Verify) {
                    TxnKind::Verify
                } else {
                    TxnKind::Read
                };
                (kind, vec![0; size], expected)
            }
        };

        let txn = master.issue(self.offset, kind, data);
        inner.pending.push(Pending { txn, expected });
    }

    /// Block until every transaction issued so far has completed and merge
    /// the results into the shadow state
    pub fn wait_complete(&self) {
        let pending = lock(&self.inner).pending.clone();
        if pending.is_empty() {
            return;
        }

        for p in &pending {
            p.txn.wait();
        }

        let mut inner = lock(&self.inner);
        inner
            .pending
            .retain(|p| !pending.iter().any(|done| done.txn.id() == p.txn.id()));

        // A read older than a write carries hardware bytes the shadow has
        // already moved past
        let last_write = pending
            .iter()
            .chain(inner.pending.iter())
            .filter(|p| matches!(p.txn.kind(), TxnKind::Write | TxnKind::Post))
            .map(|p| p.txn.id())
            .max();

        for p in pending {
            if let Some(error) = p.txn.error() {
                inner.error.get_or_insert(error);
                continue;
            }

            match (p.txn.kind(), p.expected) {
                (TxnKind::Read | TxnKind::Verify, Some(expected)) => {
                    let actual = p.txn.data();
                    let mismatch = actual
                        .iter()
                        .zip(&expected)
                        .zip(&inner.verify_mask)
                        .any(|((a, e), m)| (a ^ e) & m != 0);
                    if mismatch {
                        warn!(
                            "❌ Verify failed at {:#x}: wrote {} read {}",
                            p.txn.address(),
                            hex::encode(&expected),
                            hex::encode(&actual)
                        );
                        inner.error.get_or_insert(TransportError::Verify);
                    } else {
                        inner.updated = true;
                    }
                }
                (TxnKind::Read, None) if last_write.is_some_and(|id| id > p.txn.id()) => {
                    debug!("Discarding stale read at {:#x}", p.txn.address());
                }
                (TxnKind::Read, None) => {
                    let data = p.txn.data();
                    let len = data.len().min(inner.data.len());
                    inner.data[..len].copy_from_slice(&data[..len]);
                    inner.updated = true;
                }
                _ => inner.updated = true,
            }
        }
    }

    /// Wait for outstanding transactions, then report and clear the dirty
    /// flag. An accumulated transport error is returned instead and cleared.
    pub fn get_updated(&self) -> std::result::Result<bool, TransportError> {
        self.wait_complete();
        let mut inner = lock(&self.inner);
        if let Some(error) = inner.error.take() {
            inner.updated = false;
            return Err(error);
        }
        Ok(std::mem::take(&mut inner.updated))
    }

    /// Call every attached variable's update hook. Takes no block lock while
    /// the hooks run.
    pub fn notify_variables(&self) {
        let variables = self.variables();
        for variable in variables {
            variable.updated();
        }
    }

    /// Wrap a transport error with this block's location
    pub fn memory_error(&self, name: &str, error: TransportError) -> RegError {
        RegError::Memory {
            name: name.to_string(),
            address: self.address(),
            size: self.size(),
            error,
        }
    }

    fn check(&self, name: &str) -> Result<()> {
        match self.get_updated() {
            Ok(true) => {
                self.notify_variables();
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(error) => Err(self.memory_error(name, error)),
        }
    }

    /// Write, verify when writable and readable, then check
    pub fn blocking_write(&self, name: &str) -> Result<()> {
        self.background_write();
        if self.mode() == Mode::RW {
            self.background_verify();
        }
        self.check(name)
    }

    pub fn blocking_post(&self, name: &str) -> Result<()> {
        self.background_post();
        self.check(name)
    }

    pub fn blocking_read(&self, name: &str) -> Result<()> {
        self.background_read();
        self.check(name)
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("Block")
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("size", &inner.size)
            .field("mode", &inner.mode)
            .field("poll_enabled", &inner.poll_enabled)
            .field("variables", &inner.variables.len())
            .finish()
    }
}

fn round_up(size: usize, granularity: usize) -> usize {
    if granularity <= 1 {
        size
    } else {
        size.div_ceil(granularity) * granularity
    }
}

fn check_span(size: usize, bit_offset: usize, bit_size: usize) -> Result<()> {
    if bit_offset + bit_size > size * 8 {
        return Err(RegError::config(format!(
            "Bit span {}+{} exceeds block size {} bytes",
            bit_offset, bit_size, size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::{EmulatorConfig, MemoryEmulator};
    use crate::model::Model;
    use crate::variable::VariableBuilder;

    fn var(name: &str, offset: u64, bit_offset: usize, bits: usize, mode: Mode) -> Arc<Variable> {
        VariableBuilder::new(name, Model::uint(bits).unwrap())
            .offset(offset)
            .bit_offset(bit_offset)
            .mode(mode)
            .build()
            .unwrap()
    }

    #[test]
    fn test_mode_widening() {
        let block = Block::new(0x10);
        block.attach(&var("a", 0x10, 0, 8, Mode::RO), 4).unwrap();
        assert_eq!(block.mode(), Mode::RO);
        block.attach(&var("b", 0x10, 8, 8, Mode::WO), 4).unwrap();
        assert_eq!(block.mode(), Mode::RW);
    }

    #[test]
    fn test_size_grows_never_shrinks() {
        let block = Block::new(0);
        block.attach(&var("wide", 0, 0, 48, Mode::RW), 4).unwrap();
        assert_eq!(block.size(), 8);
        block.attach(&var("narrow", 0, 0, 4, Mode::RW), 4).unwrap();
        assert_eq!(block.size(), 8);
        block.attach(&var("wider", 0, 60, 12, Mode::RW), 4).unwrap();
        assert_eq!(block.size(), 12);
    }

    #[test]
    fn test_offset_mismatch_rejected() {
        let block = Block::new(0);
        assert!(matches!(
            block.attach(&var("x", 4, 0, 8, Mode::RW), 4),
            Err(RegError::Config(_))
        ));
    }

    #[test]
    fn test_bit_fields() {
        let block = Block::new(0);
        block.attach(&var("f", 0, 4, 12, Mode::RW), 4).unwrap();
        block.set_field(4, 12, &[0xBC, 0x0A]).unwrap();
        assert_eq!(block.bytes(), vec![0xC0, 0xAB, 0, 0]);
        assert_eq!(block.get_field(4, 12).unwrap(), vec![0xBC, 0x0A]);
        assert!(block.get_field(30, 4).is_err());
    }

    #[test]
    fn test_write_read_roundtrip() {
        let emu = MemoryEmulator::inline();
        let block = Block::new(0x20);
        block.attach(&var("r", 0x20, 0, 32, Mode::RW), 4).unwrap();
        block.set_master(Master::new(emu.clone()).with_address(0x1000));

        block.set_field(0, 32, &[1, 2, 3, 4]).unwrap();
        block.background_write();
        assert_eq!(block.get_updated(), Ok(true));
        assert_eq!(emu.peek(0x1020, 4), vec![1, 2, 3, 4]);

        emu.poke(0x1020, &[9, 9, 9, 9]);
        block.background_read();
        assert_eq!(block.get_updated(), Ok(true));
        assert_eq!(block.bytes(), vec![9, 9, 9, 9]);
        assert_eq!(block.get_updated(), Ok(false));
    }

    #[test]
    fn test_read_before_write_keeps_new_value() {
        let emu = MemoryEmulator::new(EmulatorConfig {
            threaded: true,
            latency_ms: 1,
            ..Default::default()
        });
        let block = Block::new(0);
        block.attach(&var("r", 0, 0, 32, Mode::RW), 4).unwrap();
        block.set_master(Master::new(emu.clone()));

        block.background_read();
        block.set_field(0, 32, &[5, 0, 0, 0]).unwrap();
        block.background_write();
        assert_eq!(block.get_updated(), Ok(true));
        assert_eq!(block.bytes(), vec![5, 0, 0, 0]);
        assert_eq!(emu.peek(0, 4), vec![5, 0, 0, 0]);

        // Reads issued after the write still land
        emu.poke(0, &[6, 0, 0, 0]);
        block.background_read();
        assert_eq!(block.get_updated(), Ok(true));
        assert_eq!(block.bytes(), vec![6, 0, 0, 0]);
    }

    #[test]
    fn test_verify_mismatch_surfaces_once() {
        let emu = MemoryEmulator::inline();
        let block = Block::new(0);
        block.attach(&var("r", 0, 0, 8, Mode::RW), 4).unwrap();
        block.set_master(Master::new(emu.clone()));

        emu.override_read(0, &[7]);
        block.set_field(0, 8, &[5]).unwrap();
        block.background_write();
        block.background_verify();
        assert_eq!(block.get_updated(), Err(TransportError::Verify));
        assert_eq!(block.get_updated(), Ok(false));
    }

    #[test]
    fn test_verify_ignores_unowned_bits() {
        let emu = MemoryEmulator::new(EmulatorConfig {
            verify: false,
            ..Default::default()
        });
        let block = Block::new(0);
        block.attach(&var("low", 0, 0, 8, Mode::RW), 4).unwrap();
        block.attach(&var("status", 0, 8, 8, Mode::RO), 4).unwrap();
        block.set_master(Master::new(emu.clone()));

        emu.override_read(1, &[0xEE]);
        block.set_field(0, 8, &[5]).unwrap();
        block.background_write();
        block.background_verify();
        assert_eq!(block.get_updated(), Ok(true));
        assert_eq!(emu.history().last().map(|r| r.kind), Some(TxnKind::Read));
    }

    #[test]
    fn test_transport_error_deferred() {
        let emu = MemoryEmulator::inline();
        let block = Block::new(0x8);
        block.attach(&var("r", 0x8, 0, 32, Mode::RW), 4).unwrap();
        block.set_master(Master::new(emu.clone()));

        emu.fail_at(0x8, TransportError::BusFail);
        block.background_read();
        assert_eq!(block.get_updated(), Err(TransportError::BusFail));
        assert_eq!(block.get_updated(), Ok(false));
    }

    #[test]
    fn test_disabled_block_issues_nothing() {
        let emu = MemoryEmulator::inline();
        let block = Block::new(0);
        block.attach(&var("r", 0, 0, 32, Mode::RW), 4).unwrap();
        block.set_master(Master::new(emu.clone()));
        block.set_enable(false);

        block.background_write();
        block.background_read();
        assert!(emu.history().is_empty());
    }
}
