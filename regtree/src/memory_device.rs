/*!
Staged bulk-transfer device.

A [`MemoryDevice`] exposes a window of word-addressed memory. Values are staged
per offset, sent through a [`Chunker`] by the write pass, read back by the
verify pass and compared by the check pass:

```text
Idle -> Staged -> Written -> Verifying -> Checked -> Staged ...
```

A single device-wide lock serializes staging and every pass, so a write can
never observe a partially staged set and a new write cannot start while a
verify cycle is in flight.
*/

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

use crate::chunker::{Chunker, ReadBack};
use crate::device::{Device, DeviceNode, ResetKind};
use crate::error::{RegError, Result};
use crate::model::{Model, Value};
use crate::transport::{wait_all, Master, Transaction, TxnKind};
use crate::util::lock;

/// Position of the staged pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Idle,
    Staged,
    Written,
    Verifying,
    Checked,
}

#[derive(Debug)]
struct MemoryState {
    phase: Phase,
    set_values: BTreeMap<u64, Vec<Value>>,
    wr_values: BTreeMap<u64, Vec<Value>>,
    wr_data: BTreeMap<u64, Vec<u8>>,
    ver_values: BTreeMap<u64, Vec<Value>>,
    ver_data: BTreeMap<u64, ReadBack>,
    pending: Vec<Arc<Transaction>>,
}

impl MemoryState {
    fn in_flight(&self, offset: u64) -> bool {
        self.wr_values.contains_key(&offset)
            || self.wr_data.contains_key(&offset)
            || self.ver_values.contains_key(&offset)
            || self.ver_data.contains_key(&offset)
    }
}

/// Word-addressed memory window with staged writes and verification
pub struct MemoryDevice {
    device: Arc<Device>,
    size: u64,
    chunker: Chunker,
    verify: bool,
    state: Mutex<MemoryState>,
}

impl MemoryDevice {
    /// Memory window of `size` bytes holding `model` words every `stride` bytes
    pub fn new(
        name: impl Into<String>,
        offset: u64,
        size: u64,
        model: Arc<Model>,
        stride: usize,
        verify: bool,
    ) -> Result<Arc<Self>> {
        let device = Device::new(name, "Bulk memory window", offset)?;
        let chunker = Chunker::new(model, stride)?;

        Ok(Arc::new(Self {
            device,
            size,
            chunker,
            verify,
            state: Mutex::new(MemoryState {
                phase: Phase::Idle,
                set_values: BTreeMap::new(),
                wr_values: BTreeMap::new(),
                wr_data: BTreeMap::new(),
                ver_values: BTreeMap::new(),
                ver_data: BTreeMap::new(),
                pending: Vec::new(),
            }),
        }))
    }

    pub fn model(&self) -> &Arc<Model> {
        self.chunker.model()
    }

    pub fn stride(&self) -> usize {
        self.chunker.stride()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn verify_enabled(&self) -> bool {
        self.verify
    }

    pub fn phase(&self) -> Phase {
        lock(&self.state).phase
    }

    /// Offsets and values waiting for the next write pass
    pub fn staged(&self) -> BTreeMap<u64, Vec<Value>> {
        lock(&self.state).set_values.clone()
    }

    /// Parse comma-separated literal lists per offset and stage them. Either
    /// every entry is staged or none is.
    pub fn stage<'a>(&self, entries: impl IntoIterator<Item = (u64, &'a str)>) -> Result<()> {
        let mut parsed = BTreeMap::new();
        for (offset, text) in entries {
            let values = text
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(|t| self.canonical(self.model().from_string(t)?))
                .collect::<Result<Vec<_>>>()?;
            parsed.insert(offset, values);
        }
        self.stage_values(parsed)
    }

    /// Stage already typed values per offset. Either every entry is staged or
    /// none is.
    pub fn stage_values(&self, entries: BTreeMap<u64, Vec<Value>>) -> Result<()> {
        let mut checked = BTreeMap::new();
        for (offset, values) in entries {
            self.check_window(offset, values.len())?;
            let values = values
                .into_iter()
                .map(|v| self.canonical(v))
                .collect::<Result<Vec<_>>>()?;
            checked.insert(offset, values);
        }

        let mut state = lock(&self.state);
        if let Some(offset) = checked.keys().find(|o| state.in_flight(**o)) {
            return Err(RegError::node(format!(
                "Offset {:#x} of {} is awaiting verification",
                offset,
                self.device.path()
            )));
        }

        for (offset, values) in checked {
            if values.is_empty() {
                continue;
            }
            debug!("Staged {} values at {:#x}", values.len(), offset);
            state.set_values.insert(offset, values);
        }
        if !state.set_values.is_empty() {
            state.phase = Phase::Staged;
        }
        Ok(())
    }

    /// Blocking read of `count` words at `offset`, outside the staged pipeline
    pub fn read_values(&self, offset: u64, count: usize) -> Result<Vec<Value>> {
        self.check_window(offset, count)?;
        let master = self.require_master()?;
        let _state = lock(&self.state);

        let readback = self.chunker.read(
            &master,
            offset,
            count * self.stride(),
            TxnKind::Read,
        );
        if let Some(error) = readback.wait() {
            return Err(RegError::Memory {
                name: self.device.path(),
                address: master.address() + offset,
                size: readback.size(),
                error,
            });
        }
        self.chunker.decode(&readback.assemble())
    }

    /// Round trip through the model so staged values compare equal to what
    /// the read-back decodes to
    fn canonical(&self, value: Value) -> Result<Value> {
        let model = self.model();
        let bytes = model.to_bytes(&value)?;
        model.from_bytes(&model.apply_mask(&bytes))
    }

    fn check_window(&self, offset: u64, count: usize) -> Result<()> {
        let outside = |end: String| {
            RegError::config(format!(
                "Range {:#x}..{} outside memory window of {} ({:#x} bytes, stride {})",
                offset,
                end,
                self.device.path(),
                self.size,
                self.stride()
            ))
        };

        let end = count
            .checked_mul(self.stride())
            .and_then(|len| u64::try_from(len).ok())
            .and_then(|len| offset.checked_add(len))
            .ok_or_else(|| outside("overflow".to_string()))?;
        if offset % self.stride() as u64 != 0 || end > self.size {
            return Err(outside(format!("{:#x}", end)));
        }
        Ok(())
    }

    fn require_master(&self) -> Result<Master> {
        self.device
            .master()
            .ok_or_else(|| RegError::node(format!("{} has no transport", self.device.path())))
    }

    fn verify_kind(&self, master: &Master) -> TxnKind {
        if master.supports(TxnKind::Verify) {
            TxnKind::Verify
        } else {
            TxnKind::Read
        }
    }

    fn describe(&self, values: &[Value]) -> String {
        let model = self.model();
        values
            .iter()
            .map(|v| model.display(v))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl DeviceNode for MemoryDevice {
    fn device(&self) -> &Device {
        &self.device
    }

    fn write_blocks(&self) -> Result<()> {
        if !self.device.enabled() {
            return Ok(());
        }

        let mut state = lock(&self.state);
        if state.set_values.is_empty() {
            return Ok(());
        }
        let master = self.require_master()?;

        let staged = std::mem::take(&mut state.set_values);
        for (offset, values) in staged {
            let (data, txns) = self
                .chunker
                .write(&master, offset, &values, TxnKind::Write)?;
            state.pending.extend(txns);
            if self.verify {
                state.wr_values.insert(offset, values);
                state.wr_data.insert(offset, data);
            }
        }

        state.phase = Phase::Written;
        Ok(())
    }

    fn verify_blocks(&self) -> Result<()> {
        if !self.device.enabled() {
            return Ok(());
        }

        let mut state = lock(&self.state);
        if state.wr_data.is_empty() {
            return Ok(());
        }
        let master = self.require_master()?;
        let kind = self.verify_kind(&master);

        let written = std::mem::take(&mut state.wr_data);
        for (offset, data) in written {
            let readback = self.chunker.read(&master, offset, data.len(), kind);
            state.ver_data.insert(offset, readback);
        }

        let values = std::mem::take(&mut state.wr_values);
        state.ver_values.extend(values);
        state.phase = Phase::Verifying;
        Ok(())
    }

    fn read_blocks(&self) -> Result<()> {
        Ok(())
    }

    fn poll_blocks(&self) -> Result<()> {
        Ok(())
    }

    /// Runs even while disabled so a cycle started before disabling is
    /// drained and cleared
    fn check_blocks(&self) -> Result<()> {
        let mut state = lock(&self.state);
        let pending = std::mem::take(&mut state.pending);
        let ver_data = std::mem::take(&mut state.ver_data);
        let ver_values = std::mem::take(&mut state.ver_values);

        // A disabled device will not verify, so its write copies are dropped
        if !self.device.enabled() && !state.wr_data.is_empty() {
            debug!("Dropping unverified writes of {}", self.device.path());
            state.wr_data.clear();
            state.wr_values.clear();
        }

        if pending.is_empty() && ver_data.is_empty() {
            return Ok(());
        }
        state.phase = Phase::Checked;

        let base = self.device.address();
        let name = self.device.path();

        let mut failure = wait_all(&pending).map(|error| RegError::Memory {
            name: name.clone(),
            address: base,
            size: self.size as usize,
            error,
        });
        for (offset, readback) in &ver_data {
            if let Some(error) = readback.wait() {
                failure.get_or_insert(RegError::Memory {
                    name: name.clone(),
                    address: base + offset,
                    size: readback.size(),
                    error,
                });
            }
        }
        if let Some(err) = failure {
            error!("❌ {}", err);
            return Err(err);
        }

        let mut diff = String::new();
        let mut first: Option<(u64, usize)> = None;
        for (offset, expected) in &ver_values {
            let Some(readback) = ver_data.get(offset) else {
                continue;
            };
            let actual = self.chunker.decode(&readback.assemble())?;
            if &actual != expected {
                first.get_or_insert((*offset, readback.size()));
                let _ = writeln!(
                    diff,
                    "Offset {:#x}: expected [{}] got [{}]",
                    offset,
                    self.describe(expected),
                    self.describe(&actual)
                );
            }
        }

        if let Some((offset, size)) = first {
            let err = RegError::Verify {
                name,
                address: base + offset,
                size,
                msg: diff,
            };
            error!("❌ {}", err);
            return Err(err);
        }

        if !ver_values.is_empty() {
            info!("✅ Verified {} offsets of {}", ver_values.len(), name);
        }
        Ok(())
    }

    fn dev_reset(&self, kind: ResetKind) -> Result<()> {
        self.device.dev_reset(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::{EmulatorConfig, MemoryEmulator};
    use std::thread;

    fn memory(verify: bool) -> (Arc<MemoryDevice>, Arc<MemoryEmulator>) {
        let emu = MemoryEmulator::inline();
        let mem = MemoryDevice::new("mem", 0, 0x1000, Model::uint(32).unwrap(), 4, verify).unwrap();
        mem.device().set_master(Master::new(emu.clone()));
        (mem, emu)
    }

    fn cycle(mem: &MemoryDevice) -> Result<()> {
        mem.write_blocks()?;
        mem.verify_blocks()?;
        mem.check_blocks()
    }

    #[test]
    fn test_phases() {
        let (mem, emu) = memory(true);
        assert_eq!(mem.phase(), Phase::Idle);

        mem.stage([(0x10, "1, 2, 0x3")]).unwrap();
        assert_eq!(mem.phase(), Phase::Staged);

        mem.write_blocks().unwrap();
        assert_eq!(mem.phase(), Phase::Written);
        assert!(mem.staged().is_empty());

        mem.verify_blocks().unwrap();
        assert_eq!(mem.phase(), Phase::Verifying);

        mem.check_blocks().unwrap();
        assert_eq!(mem.phase(), Phase::Checked);
        assert_eq!(emu.peek(0x18, 4), vec![3, 0, 0, 0]);
        assert_eq!(
            mem.read_values(0x10, 3).unwrap(),
            vec![Value::UInt(1), Value::UInt(2), Value::UInt(3)]
        );
    }

    #[test]
    fn test_stage_is_atomic() {
        let (mem, _) = memory(true);
        let err = mem.stage([(0x0, "1"), (0x4, "2, nope")]).unwrap_err();
        assert!(matches!(err, RegError::Parse(_)));
        assert!(mem.staged().is_empty());
        assert_eq!(mem.phase(), Phase::Idle);

        assert!(mem.stage([(0x0, "0x1_0000_0000")]).is_err());
        assert!(mem.stage([(0x2, "1")]).is_err());
        assert!(mem.stage([(0xFFC, "1, 2")]).is_err());
    }

    #[test]
    fn test_verify_mismatch_reported_once() {
        let (mem, emu) = memory(true);
        emu.override_read(0x10, &[6]);
        mem.stage([(0x10, "5")]).unwrap();

        let err = cycle(&mem).unwrap_err();
        match err {
            RegError::Verify { address, size, msg, .. } => {
                assert_eq!(address, 0x10);
                assert_eq!(size, 4);
                assert!(msg.contains("Offset 0x10"));
                assert!(msg.contains("expected [0x5] got [0x6]"));
            }
            other => panic!("unexpected error {:?}", other),
        }

        assert!(mem.check_blocks().is_ok());
        assert_eq!(mem.phase(), Phase::Checked);
    }

    #[test]
    fn test_diff_lists_only_mismatches() {
        let (mem, emu) = memory(true);
        emu.override_read(0x24, &[0xFF]);
        mem.stage([(0x0, "1, 2"), (0x20, "3, 4")]).unwrap();

        let Err(RegError::Verify { msg, address, .. }) = cycle(&mem) else {
            panic!("expected verify error");
        };
        assert_eq!(address, 0x20);
        assert_eq!(msg.lines().count(), 1);
        assert!(msg.contains("expected [0x3, 0x4] got [0x3, 0xff]"));
    }

    #[test]
    fn test_no_verify_when_disabled() {
        let (mem, emu) = memory(false);
        emu.override_read(0x0, &[9]);
        mem.stage([(0x0, "1")]).unwrap();
        cycle(&mem).unwrap();
        assert_eq!(emu.stats().verifies, 0);
        assert_eq!(emu.stats().reads, 0);
    }

    #[test]
    fn test_disabled_device_keeps_staged() {
        let (mem, emu) = memory(true);
        mem.stage([(0x0, "1")]).unwrap();
        mem.device().set_enable(false);

        cycle(&mem).unwrap();
        assert!(emu.history().is_empty());
        assert_eq!(mem.staged().len(), 1);
        assert_eq!(mem.phase(), Phase::Staged);
    }

    #[test]
    fn test_check_drains_after_disable() {
        let (mem, emu) = memory(true);
        mem.stage([(0x0, "1")]).unwrap();
        mem.write_blocks().unwrap();
        mem.device().set_enable(false);
        mem.verify_blocks().unwrap();
        mem.check_blocks().unwrap();
        assert_eq!(mem.phase(), Phase::Checked);

        mem.device().set_enable(true);
        mem.verify_blocks().unwrap();
        mem.check_blocks().unwrap();
        assert_eq!(emu.stats().verifies, 0);
        mem.stage([(0x0, "2")]).unwrap();

        emu.override_read(0x0, &[7]);
        mem.write_blocks().unwrap();
        mem.verify_blocks().unwrap();
        mem.device().set_enable(false);
        assert!(matches!(mem.check_blocks(), Err(RegError::Verify { .. })));
        mem.check_blocks().unwrap();
    }

    #[test]
    fn test_stage_rejects_overflowing_offset() {
        let (mem, _) = memory(true);
        assert!(matches!(
            mem.stage([(u64::MAX - 3, "1, 2")]),
            Err(RegError::Config(_))
        ));
        assert!(mem.read_values(u64::MAX - 3, 2).is_err());
        assert!(mem.staged().is_empty());
    }

    #[test]
    fn test_transport_error_promoted() {
        let (mem, emu) = memory(true);
        emu.fail_at(0x8, crate::transport::TransportError::Address);
        mem.stage([(0x8, "1")]).unwrap();
        assert!(matches!(
            cycle(&mem),
            Err(RegError::Memory {
                error: crate::transport::TransportError::Address,
                ..
            })
        ));
        assert!(mem.check_blocks().is_ok());
    }

    #[test]
    fn test_stage_rejected_while_in_flight() {
        let (mem, _) = memory(true);
        mem.stage([(0x0, "1")]).unwrap();
        mem.write_blocks().unwrap();
        assert!(matches!(mem.stage([(0x0, "2")]), Err(RegError::Node(_))));
        mem.stage([(0x4, "2")]).unwrap();
        mem.verify_blocks().unwrap();
        mem.check_blocks().unwrap();
        mem.stage([(0x0, "2")]).unwrap();
    }

    #[test]
    fn test_concurrent_stage_and_write() {
        let emu = MemoryEmulator::new(EmulatorConfig {
            threaded: true,
            ..Default::default()
        });
        let mem =
            MemoryDevice::new("mem", 0, 0x1000, Model::uint(32).unwrap(), 4, false).unwrap();
        mem.device().set_master(Master::new(emu.clone()));

        let stager = Arc::clone(&mem);
        let handle = thread::spawn(move || {
            for _ in 0..50 {
                stager
                    .stage([(0x0, "1, 1, 1, 1"), (0x40, "2, 2, 2, 2")])
                    .unwrap();
                thread::yield_now();
            }
        });

        for _ in 0..50 {
            mem.write_blocks().unwrap();
            mem.check_blocks().unwrap();
        }
        handle.join().unwrap();
        mem.write_blocks().unwrap();
        mem.check_blocks().unwrap();

        // Each write pass carried either both staged offsets or neither
        let history = emu.history();
        let low = history.iter().filter(|r| r.address == 0x0).count();
        let high = history.iter().filter(|r| r.address == 0x40).count();
        assert_eq!(low, high);
        assert_eq!(emu.peek(0x40, 4), vec![2, 0, 0, 0]);
    }
}
