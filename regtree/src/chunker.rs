/*!
Word-sized transaction splitting for bulk transfers.

Each value occupies one `stride`-byte slot, with the encoded word at the start
of the slot and zero padding after it. The slot buffer is cut into
transactions no larger than the transport's maximum access size, always on a
slot boundary.
*/

use std::sync::Arc;

use crate::error::{RegError, Result};
use crate::model::{Model, Value};
use crate::transport::{wait_all, Master, Transaction, TransportError, TxnKind};

/// Splits value lists into word transactions and reassembles read results
#[derive(Debug, Clone)]
pub struct Chunker {
    model: Arc<Model>,
    stride: usize,
}

impl Chunker {
    pub fn new(model: Arc<Model>, stride: usize) -> Result<Self> {
        if stride == 0 || stride < model.byte_count() {
            return Err(RegError::config(format!(
                "Stride {} too small for {} ({} bytes)",
                stride,
                model.name(),
                model.byte_count()
            )));
        }
        Ok(Self { model, stride })
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn word_bit_size(&self) -> usize {
        self.model.bit_size()
    }

    /// Encode values into consecutive stride slots
    pub fn encode(&self, values: &[Value]) -> Result<Vec<u8>> {
        let mut data = vec![0u8; values.len() * self.stride];
        for (slot, value) in data.chunks_exact_mut(self.stride).zip(values) {
            let word = self.model.to_bytes(value)?;
            slot[..word.len()].copy_from_slice(&word);
        }
        Ok(data)
    }

    /// Decode stride slots into values, masking bits outside the word first
    pub fn decode(&self, data: &[u8]) -> Result<Vec<Value>> {
        data.chunks_exact(self.stride)
            .map(|slot| self.model.from_bytes(&self.model.apply_mask(slot)))
            .collect()
    }

    /// Encode and issue `values` starting at `offset`. Returns the bytes sent
    /// and the issued transactions.
    pub fn write(
        &self,
        master: &Master,
        offset: u64,
        values: &[Value],
        kind: TxnKind,
    ) -> Result<(Vec<u8>, Vec<Arc<Transaction>>)> {
        let data = self.encode(values)?;
        let txns = self.write_bytes(master, offset, &data, kind);
        Ok((data, txns))
    }

    /// Issue already encoded slot data starting at `offset`
    pub fn write_bytes(
        &self,
        master: &Master,
        offset: u64,
        data: &[u8],
        kind: TxnKind,
    ) -> Vec<Arc<Transaction>> {
        let step = self.step(master);
        data.chunks(step)
            .enumerate()
            .map(|(i, chunk)| master.issue(offset + (i * step) as u64, kind, chunk.to_vec()))
            .collect()
    }

    /// Issue reads covering `size` bytes starting at `offset`
    pub fn read(&self, master: &Master, offset: u64, size: usize, kind: TxnKind) -> ReadBack {
        let step = self.step(master);
        let mut txns = Vec::with_capacity(size.div_ceil(step));
        let mut pos = 0;

        while pos < size {
            let len = step.min(size - pos);
            txns.push(master.issue(offset + pos as u64, kind, vec![0; len]));
            pos += len;
        }

        ReadBack { offset, size, txns }
    }

    /// Largest multiple of the stride accepted by the transport, at least one slot
    fn step(&self, master: &Master) -> usize {
        (master.max_access() / self.stride).max(1) * self.stride
    }
}

/// Outstanding read-back of a contiguous byte range
#[derive(Debug, Clone)]
pub struct ReadBack {
    offset: u64,
    size: usize,
    txns: Vec<Arc<Transaction>>,
}

impl ReadBack {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn transactions(&self) -> &[Arc<Transaction>] {
        &self.txns
    }

    /// Wait for every transaction and return the first error
    pub fn wait(&self) -> Option<TransportError> {
        wait_all(&self.txns)
    }

    /// Concatenate transaction buffers in address order
    pub fn assemble(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.size);
        for txn in &self.txns {
            data.extend(txn.data());
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::{EmulatorConfig, MemoryEmulator};

    fn values(raw: &[u128]) -> Vec<Value> {
        raw.iter().map(|v| Value::UInt(*v)).collect()
    }

    #[test]
    fn test_word_per_transaction() {
        let emu = MemoryEmulator::new(EmulatorConfig {
            max_access: 4,
            ..Default::default()
        });
        let master = Master::new(emu.clone());
        let chunker = Chunker::new(Model::uint(32).unwrap(), 4).unwrap();

        let (sent, txns) = chunker
            .write(&master, 0x100, &values(&[1, 2, 3, 4, 5]), TxnKind::Write)
            .unwrap();
        assert_eq!(wait_all(&txns), None);
        assert_eq!(sent.len(), 20);

        let history = emu.history();
        let addresses: Vec<u64> = history.iter().map(|r| r.address).collect();
        assert_eq!(addresses, vec![0x100, 0x104, 0x108, 0x10C, 0x110]);
        assert!(history.iter().all(|r| r.size == 4 && r.kind == TxnKind::Write));
        assert_eq!(emu.peek(0x110, 4), vec![5, 0, 0, 0]);
    }

    #[test]
    fn test_contiguous_words_batched() {
        let emu = MemoryEmulator::new(EmulatorConfig {
            max_access: 8,
            ..Default::default()
        });
        let master = Master::new(emu.clone());
        let chunker = Chunker::new(Model::uint(32).unwrap(), 4).unwrap();

        let (_, txns) = chunker
            .write(&master, 0, &values(&[1, 2, 3, 4, 5]), TxnKind::Write)
            .unwrap();
        wait_all(&txns);

        let sizes: Vec<usize> = emu.history().iter().map(|r| r.size).collect();
        assert_eq!(sizes, vec![8, 8, 4]);
    }

    #[test]
    fn test_partial_word_padding() {
        let chunker = Chunker::new(Model::uint(12).unwrap(), 4).unwrap();
        let data = chunker.encode(&values(&[0xABC, 0x123])).unwrap();
        assert_eq!(data, vec![0xBC, 0x0A, 0, 0, 0x23, 0x01, 0, 0]);
    }

    #[test]
    fn test_read_masks_garbage() {
        let emu = MemoryEmulator::inline();
        let master = Master::new(emu.clone());
        let chunker = Chunker::new(Model::uint(12).unwrap(), 4).unwrap();

        emu.poke(0x40, &[0xBC, 0xFA, 0xEE, 0xEE, 0x23, 0x01, 0, 0]);
        let readback = chunker.read(&master, 0x40, 8, TxnKind::Read);
        assert_eq!(readback.wait(), None);
        assert_eq!(
            chunker.decode(&readback.assemble()).unwrap(),
            values(&[0xABC, 0x123])
        );
    }

    #[test]
    fn test_stride_too_small() {
        assert!(matches!(
            Chunker::new(Model::uint(32).unwrap(), 2),
            Err(RegError::Config(_))
        ));
    }
}
