/*!
Block aggregation and tree traversal.

A [`Device`] owns an ordered list of child nodes and the blocks backing its
variables. Tree passes visit local blocks first, then child devices in
insertion order, and are skipped entirely for a disabled device.
*/

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{error, info};

use crate::block::Block;
use crate::error::{RegError, Result};
use crate::model::{Model, Value};
use crate::node::{Command, Node};
use crate::root::TreeContext;
use crate::transport::Master;
use crate::util::{read, write};
use crate::variable::{validate_name, Mode, Variable, VariableBuilder};

/// Reset flavours passed to device reset hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResetKind {
    Soft,
    Hard,
    Count,
}

impl ResetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Soft => "soft",
            Self::Hard => "hard",
            Self::Count => "count",
        }
    }
}

pub type ResetHook = Arc<dyn Fn(ResetKind) -> Result<()> + Send + Sync>;

/// Tree passes implemented by every device kind
pub trait DeviceNode: Send + Sync {
    /// Underlying device holding name, path, enable state and transport
    fn device(&self) -> &Device;

    /// Issue writes for writable blocks, then recurse
    fn write_blocks(&self) -> Result<()>;

    /// Issue read-backs of blocks written since the last verify, then recurse
    fn verify_blocks(&self) -> Result<()>;

    /// Issue reads for readable blocks, then recurse
    fn read_blocks(&self) -> Result<()>;

    /// Issue reads for pollable blocks, then recurse
    fn poll_blocks(&self) -> Result<()>;

    /// Wait for outstanding transactions, promote transport errors and
    /// notify variables, then recurse
    fn check_blocks(&self) -> Result<()>;

    /// Run the reset hook, then recurse
    fn dev_reset(&self, kind: ResetKind) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pass {
    Write,
    Verify,
    Read,
    Poll,
}

/// Tree node owning variables, blocks and child devices
pub struct Device {
    name: String,
    description: String,
    offset: u64,
    path: RwLock<String>,
    enabled: AtomicBool,
    nodes: RwLock<Vec<Node>>,
    blocks: RwLock<Vec<Arc<Block>>>,
    master: RwLock<Option<Master>>,
    own_master: AtomicBool,
    reset_hook: RwLock<Option<ResetHook>>,
    context: RwLock<Option<Arc<TreeContext>>>,
}

impl Device {
    /// Create a device at `offset` from its parent's base address. Every
    /// device carries an `enable` variable.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        offset: u64,
    ) -> Result<Arc<Device>> {
        let name = name.into();
        validate_name(&name)?;

        let device = Arc::new(Self {
            path: RwLock::new(name.clone()),
            name,
            description: description.into(),
            offset,
            enabled: AtomicBool::new(true),
            nodes: RwLock::new(Vec::new()),
            blocks: RwLock::new(Vec::new()),
            master: RwLock::new(None),
            own_master: AtomicBool::new(false),
            reset_hook: RwLock::new(None),
            context: RwLock::new(None),
        });

        let getter = Arc::downgrade(&device);
        let setter = Arc::downgrade(&device);
        device.add_variable(
            VariableBuilder::new("enable", Model::bool()?)
                .description("Determines if the device takes part in hardware access")
                .get_hook(move || {
                    Ok(Value::Bool(
                        getter.upgrade().map(|d| d.enabled()).unwrap_or(false),
                    ))
                })
                .set_hook(move |value| {
                    let device = setter
                        .upgrade()
                        .ok_or_else(|| RegError::node("Device no longer exists"))?;
                    let enabled = value
                        .as_bool()
                        .ok_or_else(|| RegError::parse(format!("Invalid enable value {:?}", value)))?;
                    device.set_enable(enabled);
                    Ok(())
                }),
        )?;

        Ok(device)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn path(&self) -> String {
        read(&self.path).clone()
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enable(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        for block in self.blocks() {
            block.set_enable(enabled);
        }
        info!(
            "{} {}",
            self.path(),
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn master(&self) -> Option<Master> {
        read(&self.master).clone()
    }

    /// Absolute base address
    pub fn address(&self) -> u64 {
        self.master()
            .map(|m| m.address())
            .unwrap_or(self.offset)
    }

    /// Bytes spanned by the local blocks, measured from offset zero
    pub fn size(&self) -> u64 {
        self.blocks()
            .iter()
            .map(|b| b.offset().saturating_add(b.size() as u64))
            .max()
            .unwrap_or(0)
    }

    /// Attach a transport at `base`; the device offset is added to it. An
    /// explicitly attached transport is kept when the device joins a parent.
    pub fn set_master(&self, base: Master) {
        self.own_master.store(true, Ordering::SeqCst);
        self.apply_master(base);
    }

    pub(crate) fn inherit_master(&self, base: Master) {
        if !self.own_master.load(Ordering::SeqCst) {
            self.apply_master(base);
        }
    }

    fn apply_master(&self, base: Master) {
        let master = base.with_offset(self.offset);
        for block in self.blocks() {
            block.set_master(master.clone());
        }
        *write(&self.master) = Some(master.clone());
        for child in self.devices() {
            child.device().inherit_master(master.clone());
        }
    }

    pub fn set_reset_hook(&self, hook: impl Fn(ResetKind) -> Result<()> + Send + Sync + 'static) {
        *write(&self.reset_hook) = Some(Arc::new(hook));
    }

    pub fn context(&self) -> Option<Arc<TreeContext>> {
        read(&self.context).clone()
    }

    pub(crate) fn set_context(&self, context: Option<Arc<TreeContext>>) {
        *write(&self.context) = context.clone();
        for node in self.nodes() {
            match node {
                Node::Variable(v) => v.set_context(context.clone()),
                Node::Device(d) => d.device().set_context(context.clone()),
                Node::Command(_) => {}
            }
        }
    }

    pub(crate) fn set_path(&self, path: String) {
        for node in self.nodes() {
            let child = format!("{}.{}", path, node.name());
            match node {
                Node::Variable(v) => v.set_path(child),
                Node::Device(d) => d.device().set_path(child),
                Node::Command(_) => {}
            }
        }
        *write(&self.path) = path;
    }

    /// Add a child node. Names are unique among siblings.
    pub fn add(&self, node: Node) -> Result<()> {
        let name = node.name();
        let mut nodes = write(&self.nodes);

        if nodes.iter().any(|n| n.name() == name) {
            return Err(RegError::node(format!(
                "Duplicate node name {} in {}",
                name,
                self.path()
            )));
        }

        match &node {
            Node::Device(child) => {
                let device = child.device();
                device.set_path(format!("{}.{}", self.path(), name));
                device.set_context(self.context());
                if let Some(master) = self.master() {
                    device.inherit_master(master);
                }
            }
            Node::Variable(variable) => self.attach_variable(variable)?,
            Node::Command(_) => {}
        }

        nodes.push(node);
        Ok(())
    }

    /// Build and add a variable, creating its block on first use of the offset
    pub fn add_variable(&self, builder: VariableBuilder) -> Result<Arc<Variable>> {
        let initial = builder.initial.clone();
        let variable = builder.build()?;
        self.add(Node::Variable(Arc::clone(&variable)))?;

        if let Some(value) = initial {
            if !variable.is_local() {
                variable.raw_set(&value)?;
            }
        }
        Ok(variable)
    }

    pub fn add_device(&self, device: Arc<dyn DeviceNode>) -> Result<()> {
        self.add(Node::Device(device))
    }

    pub fn add_command(&self, command: Arc<Command>) -> Result<()> {
        self.add(Node::Command(command))
    }

    fn attach_variable(&self, variable: &Arc<Variable>) -> Result<()> {
        variable.set_path(format!("{}.{}", self.path(), variable.name()));
        variable.set_context(self.context());

        if variable.is_local() {
            return Ok(());
        }

        let master = self.master();
        let block = {
            let mut blocks = write(&self.blocks);
            match blocks.iter().find(|b| b.offset() == variable.offset()) {
                Some(block) => Arc::clone(block),
                None => {
                    let block = Arc::new(Block::new(variable.offset()));
                    if let Some(master) = &master {
                        block.set_master(master.clone());
                    }
                    block.set_enable(self.enabled());
                    blocks.push(Arc::clone(&block));
                    block
                }
            }
        };

        let min_access = master.map(|m| m.min_access()).unwrap_or(1);
        block.attach(variable, min_access)?;
        variable.link(&block);
        Ok(())
    }

    pub fn nodes(&self) -> Vec<Node> {
        read(&self.nodes).clone()
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        read(&self.nodes).iter().find(|n| n.name() == name).cloned()
    }

    /// Look up a node by dotted path relative to this device
    pub fn find(&self, path: &str) -> Option<Node> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let node = self.node(head)?;
        match rest {
            None => Some(node),
            Some(rest) => node.as_device()?.device().find(rest),
        }
    }

    pub fn variable(&self, name: &str) -> Option<Arc<Variable>> {
        self.node(name).and_then(|n| n.as_variable().cloned())
    }

    pub fn command(&self, name: &str) -> Option<Arc<Command>> {
        self.node(name).and_then(|n| n.as_command().cloned())
    }

    pub fn variables(&self) -> Vec<Arc<Variable>> {
        read(&self.nodes)
            .iter()
            .filter_map(|n| n.as_variable().cloned())
            .collect()
    }

    pub fn devices(&self) -> Vec<Arc<dyn DeviceNode>> {
        read(&self.nodes)
            .iter()
            .filter_map(|n| n.as_device().cloned())
            .collect()
    }

    /// Every variable in the subtree, in tree order
    pub fn all_variables(&self) -> Vec<Arc<Variable>> {
        let mut out = Vec::new();
        for node in self.nodes() {
            match node {
                Node::Variable(v) => out.push(v),
                Node::Device(d) => out.extend(d.device().all_variables()),
                Node::Command(_) => {}
            }
        }
        out
    }

    pub fn blocks(&self) -> Vec<Arc<Block>> {
        read(&self.blocks).clone()
    }

    pub(crate) fn issue_local(&self, pass: Pass) {
        for block in self.blocks() {
            let mode = block.mode();
            match pass {
                Pass::Write if mode != Mode::RO => block.background_write(),
                Pass::Verify if mode == Mode::RW => block.background_verify(),
                Pass::Read if mode != Mode::WO => block.background_read(),
                Pass::Poll if mode != Mode::WO && block.poll_enabled() => {
                    block.background_read()
                }
                _ => {}
            }
        }
    }

    pub(crate) fn check_local(&self) -> Result<()> {
        let mut first = None;
        for block in self.blocks() {
            match block.get_updated() {
                Ok(true) => block.notify_variables(),
                Ok(false) => {}
                Err(e) => {
                    let err = block.memory_error(&self.path(), e);
                    error!("❌ {}", err);
                    first.get_or_insert(err);
                }
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Run `f` on every child device, continuing past failures. Returns the
    /// first error.
    fn each_child(&self, f: impl Fn(&dyn DeviceNode) -> Result<()>) -> Result<()> {
        let mut first = None;
        for child in self.devices() {
            if let Err(e) = f(child.as_ref()) {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl DeviceNode for Device {
    fn device(&self) -> &Device {
        self
    }

    fn write_blocks(&self) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        self.issue_local(Pass::Write);
        self.each_child(|c| c.write_blocks())
    }

    fn verify_blocks(&self) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        self.issue_local(Pass::Verify);
        self.each_child(|c| c.verify_blocks())
    }

    fn read_blocks(&self) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        self.issue_local(Pass::Read);
        self.each_child(|c| c.read_blocks())
    }

    fn poll_blocks(&self) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        self.issue_local(Pass::Poll);
        self.each_child(|c| c.poll_blocks())
    }

    fn check_blocks(&self) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        let local = self.check_local();
        let children = self.each_child(|c| c.check_blocks());
        local.and(children)
    }

    fn dev_reset(&self, kind: ResetKind) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        let hook = read(&self.reset_hook).clone();
        if let Some(hook) = hook {
            info!("🔁 {} reset of {}", kind.as_str(), self.path());
            hook(kind)?;
        }
        self.each_child(|c| c.dev_reset(kind))
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("path", &self.path())
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("enabled", &self.enabled())
            .field("blocks", &read(&self.blocks).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::MemoryEmulator;
    use crate::transport::{TransportError, TxnKind};
    use std::sync::Mutex;

    fn reg(name: &str, offset: u64) -> VariableBuilder {
        VariableBuilder::new(name, Model::uint(32).unwrap()).offset(offset)
    }

    #[test]
    fn test_enable_variable() {
        let dev = Device::new("dev", "", 0).unwrap();
        let enable = dev.variable("enable").unwrap();
        assert_eq!(enable.get().unwrap(), Value::Bool(true));
        enable.set(false).unwrap();
        assert!(!dev.enabled());
        enable.set_display("True").unwrap();
        assert!(dev.enabled());
    }

    #[test]
    fn test_duplicate_names() {
        let dev = Device::new("dev", "", 0).unwrap();
        dev.add_variable(reg("a", 0)).unwrap();
        assert!(matches!(
            dev.add_variable(reg("a", 4)),
            Err(RegError::Node(_))
        ));
        let child = Device::new("a", "", 0x100).unwrap();
        assert!(dev.add_device(child).is_err());
    }

    #[test]
    fn test_blocks_grouped_by_offset() {
        let dev = Device::new("dev", "", 0).unwrap();
        dev.add_variable(
            VariableBuilder::new("lo", Model::uint(8).unwrap()).offset(0x10),
        )
        .unwrap();
        dev.add_variable(
            VariableBuilder::new("hi", Model::uint(8).unwrap())
                .offset(0x10)
                .bit_offset(8),
        )
        .unwrap();
        dev.add_variable(reg("other", 0x20)).unwrap();

        let blocks = dev.blocks();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].variables().len(), 2);
        assert_eq!(dev.size(), 0x24);

        dev.add_variable(reg("far", 0x1_0000_0000)).unwrap();
        assert_eq!(dev.size(), 0x1_0000_0004);
    }

    #[test]
    fn test_transport_inherited_with_offsets() {
        let emu = MemoryEmulator::inline();
        let top = Device::new("top", "", 0x1000).unwrap();
        let child = Device::new("child", "", 0x100).unwrap();
        let var = child.add_variable(reg("r", 0x10)).unwrap();

        top.add_device(child.clone()).unwrap();
        top.set_master(Master::new(emu.clone()));

        assert_eq!(child.address(), 0x1100);
        assert_eq!(var.path(), "top.child.r");
        var.set(0xAABBCCDDu32).unwrap();
        assert_eq!(emu.peek(0x1110, 4), vec![0xDD, 0xCC, 0xBB, 0xAA]);
    }

    #[test]
    fn test_write_verify_check_passes() {
        let emu = MemoryEmulator::inline();
        let dev = Device::new("dev", "", 0).unwrap();
        dev.set_master(Master::new(emu.clone()));
        let a = dev.add_variable(reg("a", 0).value(7u32)).unwrap();
        dev.add_variable(reg("b", 4).mode(Mode::RO)).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        a.add_listener(move |path, value, _| sink.lock().unwrap().push((path.to_string(), value.clone())));

        dev.write_blocks().unwrap();
        dev.verify_blocks().unwrap();
        dev.check_blocks().unwrap();

        let kinds: Vec<TxnKind> = emu.history().iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![TxnKind::Write, TxnKind::Verify]);
        assert_eq!(emu.peek(0, 4), vec![7, 0, 0, 0]);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            [("dev.a".to_string(), Value::UInt(7))]
        );
    }

    #[test]
    fn test_poll_only_pollable_blocks() {
        let emu = MemoryEmulator::inline();
        let dev = Device::new("dev", "", 0).unwrap();
        dev.set_master(Master::new(emu.clone()));
        dev.add_variable(reg("status", 0).mode(Mode::RO).poll(true)).unwrap();
        dev.add_variable(reg("config", 4)).unwrap();

        dev.poll_blocks().unwrap();
        dev.check_blocks().unwrap();
        let addresses: Vec<u64> = emu.history().iter().map(|r| r.address).collect();
        assert_eq!(addresses, vec![0]);

        emu.clear_history();
        dev.read_blocks().unwrap();
        dev.check_blocks().unwrap();
        assert_eq!(emu.history().len(), 2);
    }

    #[test]
    fn test_check_promotes_and_continues() {
        let emu = MemoryEmulator::inline();
        let dev = Device::new("dev", "", 0x40).unwrap();
        dev.set_master(Master::new(emu.clone()));
        dev.add_variable(reg("bad", 0)).unwrap();
        let good = dev.add_variable(reg("good", 4)).unwrap();
        emu.fail_at(0x40, TransportError::BusFail);
        emu.poke(0x44, &[3, 0, 0, 0]);

        dev.read_blocks().unwrap();
        let err = dev.check_blocks().unwrap_err();
        assert_eq!(
            err,
            RegError::Memory {
                name: "dev".to_string(),
                address: 0x40,
                size: 4,
                error: TransportError::BusFail,
            }
        );
        assert_eq!(good.raw_get().unwrap(), Value::UInt(3));
        assert!(dev.check_blocks().is_ok());
    }

    #[test]
    fn test_disabled_device_is_silent() {
        let emu = MemoryEmulator::inline();
        let dev = Device::new("dev", "", 0).unwrap();
        let child = Device::new("child", "", 0x10).unwrap();
        child.add_variable(reg("r", 0)).unwrap();
        dev.add_device(child).unwrap();
        dev.add_variable(reg("r", 0)).unwrap();
        dev.set_master(Master::new(emu.clone()));

        dev.set_enable(false);
        dev.write_blocks().unwrap();
        dev.verify_blocks().unwrap();
        dev.read_blocks().unwrap();
        dev.poll_blocks().unwrap();
        dev.check_blocks().unwrap();
        assert!(emu.history().is_empty());
    }

    #[test]
    fn test_reset_recurses() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let dev = Device::new("dev", "", 0).unwrap();
        let child = Device::new("child", "", 0).unwrap();

        let log = Arc::clone(&calls);
        dev.set_reset_hook(move |kind| {
            log.lock().unwrap().push(format!("dev:{}", kind.as_str()));
            Ok(())
        });
        let log = Arc::clone(&calls);
        child.set_reset_hook(move |kind| {
            log.lock().unwrap().push(format!("child:{}", kind.as_str()));
            Ok(())
        });
        dev.add_device(child).unwrap();

        dev.dev_reset(ResetKind::Hard).unwrap();
        assert_eq!(calls.lock().unwrap().as_slice(), ["dev:hard", "child:hard"]);
    }

    #[test]
    fn test_find_by_path() {
        let dev = Device::new("dev", "", 0).unwrap();
        let child = Device::new("child", "", 0).unwrap();
        child.add_variable(reg("r", 0)).unwrap();
        dev.add_device(child).unwrap();

        assert!(dev.find("child.r").and_then(|n| n.as_variable().cloned()).is_some());
        assert!(dev.find("child.enable").is_some());
        assert!(dev.find("child.missing").is_none());
        assert!(dev.find("enable.x").is_none());
        assert_eq!(dev.all_variables().len(), 3);
    }
}
