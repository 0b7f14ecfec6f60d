/*!
Register tree session.

Builds a [`Root`] from the configuration on top of a [`MemoryEmulator`],
applies the configured values and reads the tree back.
*/

use anyhow::{Context, Result};
use regtree::{
    Device, EmulatorStats, Master, MemoryDevice, MemoryEmulator, Mode, Model, Root, Value,
    VariableBuilder, VariableDump,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::AppConfig;

/// Memory window contents read back after a pass
#[derive(Debug, Clone, Serialize)]
pub struct MemoryDump {
    pub path: String,
    pub offset: u64,
    pub values: Vec<Value>,
}

/// Full readback of the tree
#[derive(Debug, Clone, Serialize)]
pub struct TreeDump {
    pub variables: Vec<VariableDump>,
    pub memory: Vec<MemoryDump>,
    pub stats: EmulatorStats,
}

struct MemoryWindow {
    device: Arc<MemoryDevice>,
    path: String,
    staged: BTreeMap<u64, String>,
}

pub struct Session {
    root: Arc<Root>,
    emulator: Arc<MemoryEmulator>,
    memories: Vec<MemoryWindow>,
    values: Vec<(String, String)>,
    running: Arc<AtomicBool>,
}

impl Session {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let emulator = MemoryEmulator::new(config.emulator.clone());
        let root = Root::new(config.root.name.clone())?;
        root.set_master(Master::new(emulator.clone()));

        let mut memories = Vec::new();
        let mut values = Vec::new();

        for dc in &config.devices {
            let device = Device::new(dc.name.clone(), "", dc.offset)
                .with_context(|| format!("Invalid device {}", dc.name))?;

            for vc in &dc.variables {
                let model = vc.model()?;
                let mut builder = VariableBuilder::new(vc.name.clone(), model.clone())
                    .offset(vc.offset)
                    .bit_offset(vc.bit_offset)
                    .mode(vc.mode)
                    .poll(vc.poll);
                for (value, label) in vc.enum_entries(&model)? {
                    builder = builder.enum_entry(value, label);
                }
                device
                    .add_variable(builder)
                    .with_context(|| format!("Invalid variable {}.{}", dc.name, vc.name))?;

                if let Some(value) = &vc.value {
                    values.push((format!("{}.{}", dc.name, vc.name), value.clone()));
                }
            }

            for mc in &dc.memory {
                let memory = MemoryDevice::new(
                    mc.name.clone(),
                    mc.offset,
                    mc.size,
                    Model::uint(mc.word_bit_size)?,
                    mc.stride,
                    mc.verify,
                )
                .with_context(|| format!("Invalid memory window {}.{}", dc.name, mc.name))?;
                device.add_device(memory.clone())?;
                memories.push(MemoryWindow {
                    device: memory,
                    path: format!("{}.{}.{}", config.root.name, dc.name, mc.name),
                    staged: mc.staged()?,
                });
            }

            if !dc.enable {
                device.set_enable(false);
            }
            root.add_device(device)?;
        }

        info!(
            "🌳 Built tree {} with {} devices (max access {} bytes)",
            config.root.name,
            config.devices.len(),
            config.emulator.max_access
        );

        Ok(Self {
            root,
            emulator,
            memories,
            values,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Get a handle to the running flag for signal handling
    pub fn get_running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn root(&self) -> &Arc<Root> {
        &self.root
    }

    pub fn emulator(&self) -> &Arc<MemoryEmulator> {
        &self.emulator
    }

    /// Stage memory values, set configured variables and write the tree
    pub fn apply(&self) -> Result<()> {
        for window in &self.memories {
            window
                .device
                .stage(window.staged.iter().map(|(offset, text)| (*offset, text.as_str())))
                .with_context(|| format!("Failed to stage {}", window.path))?;
        }

        info!(
            "✍️ Writing {} values and {} memory windows",
            self.values.len(),
            self.memories.len()
        );
        self.root
            .set_variables(
                self.values.iter().map(|(path, text)| (path.as_str(), text.as_str())),
                &[Mode::RW, Mode::WO],
            )
            .context("Failed to write tree")?;

        Ok(())
    }

    /// Read the whole tree back
    pub fn dump(&self) -> Result<TreeDump> {
        self.root.read_all().context("Failed to read tree")?;

        let mut memory = Vec::new();
        for window in &self.memories {
            for (offset, text) in &window.staged {
                let count = text.split(',').filter(|s| !s.trim().is_empty()).count();
                match window.device.read_values(*offset, count) {
                    Ok(values) => memory.push(MemoryDump {
                        path: window.path.clone(),
                        offset: *offset,
                        values,
                    }),
                    Err(e) => warn!("⚠️ Failed to read {} at {:#x}: {}", window.path, offset, e),
                }
            }
        }

        Ok(TreeDump {
            variables: self.root.get_variables(&[Mode::RO, Mode::RW, Mode::WO]),
            memory,
            stats: self.emulator.stats(),
        })
    }

    /// Poll the tree and print every update until the running flag clears
    pub fn monitor(&self, period: Duration, json: bool) -> Result<()> {
        self.root.add_listener(move |path, value, display| {
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "path": path, "value": value, "display": display })
                );
            } else {
                println!("{} = {}", path, display);
            }
        });

        let start_time = Instant::now();
        self.root.read_all().context("Failed to read tree")?;
        self.root.set_poll_period(Some(period))?;

        while self.running.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(100));
        }

        self.root.stop();
        debug!("Monitor loop exited");

        let elapsed = start_time.elapsed();
        let stats = self.emulator.stats();
        info!(
            "📊 Monitored for {:.1}s: {} reads ({} bytes), {} errors",
            elapsed.as_secs_f64(),
            stats.reads,
            stats.bytes_read,
            stats.errors
        );
        Ok(())
    }
}

/// Render a dump as aligned text lines
pub fn render_text(dump: &TreeDump) -> String {
    let mut out = String::new();
    for var in &dump.variables {
        out.push_str(&format!("{:<32} {:<24} {}\n", var.path, var.display, var.mode.as_str()));
    }
    for mem in &dump.memory {
        let values: Vec<String> = mem.values.iter().map(|v| v.to_string()).collect();
        out.push_str(&format!("{}[{:#x}] = [{}]\n", mem.path, mem.offset, values.join(", ")));
    }
    out
}
