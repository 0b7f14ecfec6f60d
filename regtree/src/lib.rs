/*!
# Register Tree

Register-block transaction engine for memory-mapped hardware control.

A tree of [`Device`] nodes owns [`Variable`] leaves. Variables sharing a byte
offset are grouped into a [`Block`], the unit of hardware access. Values are
converted to and from raw bytes by a [`Model`], and transactions are carried
by a pluggable [`Transport`].

## Passes

Hardware access is split into separate tree passes so that every block can
issue its transaction before anything waits:

1. `write_blocks` - issue writes for writable blocks
2. `verify_blocks` - read back what was written
3. `read_blocks` / `poll_blocks` - issue reads
4. `check_blocks` - wait, surface transport errors, notify variables

## Modules

- [`model`] - value/bytes codecs and byte masks
- [`transport`] - transactions, transport trait and master handle
- [`emulator`] - in-process memory space implementing [`Transport`]
- [`chunker`] - word-sized transaction splitting for bulk transfers
- [`block`] - memory blocks
- [`variable`] - typed views into blocks
- [`device`] - block aggregation and tree traversal
- [`memory_device`] - staged bulk-transfer device
- [`root`] - tree root, system log and polling
- [`error`] - error types
*/

pub mod block;
pub mod chunker;
pub mod device;
pub mod emulator;
pub mod error;
pub mod memory_device;
pub mod model;
pub mod node;
pub mod root;
pub mod transport;
pub mod variable;

mod util;

// Re-export commonly used types
pub use block::Block;
pub use chunker::{Chunker, ReadBack};
pub use device::{Device, DeviceNode, ResetKind};
pub use emulator::{AccessRecord, EmulatorConfig, EmulatorStats, MemoryEmulator};
pub use error::{RegError, Result};
pub use memory_device::{MemoryDevice, Phase};
pub use model::{Endianness, Model, ModelKind, Value};
pub use node::{Command, Node};
pub use root::{LogEntry, Root, SystemLog, TreeContext, VariableDump};
pub use transport::{Master, Transaction, TransportError, Transport, TxnKind};
pub use variable::{Mode, Variable, VariableBuilder};

/// Version information for the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine constants
pub mod constants {
    use std::time::Duration;

    /// Default transaction timeout before a transaction is failed with a timeout error
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

    /// Widest integer supported by the integer codecs, in bits
    pub const MAX_INT_BITS: usize = 128;

    /// Number of entries retained by the root system log
    pub const SYSTEM_LOG_CAPACITY: usize = 1000;

    /// Default minimum access size of a transport, in bytes
    pub const DEFAULT_MIN_ACCESS: usize = 4;

    /// Default maximum transaction size of a transport, in bytes
    pub const DEFAULT_MAX_ACCESS: usize = 4096;

    /// Default number of transactions kept by the emulator access history
    pub const DEFAULT_HISTORY_CAPACITY: usize = 1024;
}
