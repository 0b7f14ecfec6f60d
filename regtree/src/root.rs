/*!
Tree root, system log and polling.

The [`Root`] drives whole-tree passes. Each top-level device runs inside its
own error guard: a failure is logged to the console and the system log, the
remaining devices still run, and the first error is returned at the end.
*/

use chrono::Local;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::constants::SYSTEM_LOG_CAPACITY;
use crate::device::{Device, DeviceNode, Pass, ResetKind};
use crate::error::{RegError, Result};
use crate::model::{Model, Value};
use crate::node::{Command, Node};
use crate::transport::Master;
use crate::util::lock;
use crate::variable::{Mode, VariableBuilder};

/// One system log line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub message: String,
}

/// Bounded append-only log; the oldest entries are dropped first
#[derive(Debug)]
pub struct SystemLog {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
}

impl SystemLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity: capacity.max(1),
        }
    }

    pub fn add(&self, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            message: message.into(),
        };
        let mut entries = lock(&self.entries);
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        lock(&self.entries).iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    /// One `timestamp message` line per entry
    pub fn render(&self) -> String {
        lock(&self.entries)
            .iter()
            .map(|e| format!("{} {}", e.timestamp, e.message))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub type UpdateListener = Arc<dyn Fn(&str, &Value, &str) + Send + Sync>;

#[derive(Default)]
struct UpdateBatch {
    depth: usize,
    entries: Vec<(String, Value, String)>,
}

/// State shared by every node of one tree
pub struct TreeContext {
    log: SystemLog,
    listeners: Mutex<Vec<UpdateListener>>,
    batch: Mutex<UpdateBatch>,
}

impl TreeContext {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            log: SystemLog::new(log_capacity),
            listeners: Mutex::new(Vec::new()),
            batch: Mutex::new(UpdateBatch::default()),
        }
    }

    pub fn log(&self) -> &SystemLog {
        &self.log
    }

    pub fn add_listener(&self, listener: impl Fn(&str, &Value, &str) + Send + Sync + 'static) {
        lock(&self.listeners).push(Arc::new(listener));
    }

    /// Forward a variable update to the tree listeners, or hold it until the
    /// enclosing update group ends. Within a group only the latest update
    /// per path is kept.
    pub fn var_updated(&self, path: &str, value: &Value, display: &str) {
        {
            let mut batch = lock(&self.batch);
            if batch.depth > 0 {
                match batch.entries.iter_mut().find(|e| e.0 == path) {
                    Some(entry) => {
                        entry.1 = value.clone();
                        entry.2 = display.to_string();
                    }
                    None => batch
                        .entries
                        .push((path.to_string(), value.clone(), display.to_string())),
                }
                return;
            }
        }
        self.dispatch(path, value, display);
    }

    /// Hold variable updates until the returned guard is dropped. Groups nest.
    pub fn update_group(&self) -> UpdateGroup<'_> {
        lock(&self.batch).depth += 1;
        UpdateGroup { context: self }
    }

    fn dispatch(&self, path: &str, value: &Value, display: &str) {
        let listeners = lock(&self.listeners).clone();
        for listener in listeners {
            listener(path, value, display);
        }
    }
}

/// Guard returned by [`TreeContext::update_group`]
pub struct UpdateGroup<'a> {
    context: &'a TreeContext,
}

impl Drop for UpdateGroup<'_> {
    fn drop(&mut self) {
        let entries = {
            let mut batch = lock(&self.context.batch);
            batch.depth = batch.depth.saturating_sub(1);
            if batch.depth > 0 {
                return;
            }
            std::mem::take(&mut batch.entries)
        };
        for (path, value, display) in entries {
            self.context.dispatch(&path, &value, &display);
        }
    }
}

/// Variable snapshot returned by [`Root::get_variables`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableDump {
    pub path: String,
    pub value: Value,
    pub display: String,
    pub mode: Mode,
}

#[derive(Default)]
struct PollState {
    period: Option<Duration>,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

/// Top of a device tree
pub struct Root {
    device: Arc<Device>,
    context: Arc<TreeContext>,
    poll: Mutex<PollState>,
}

impl Root {
    pub fn new(name: impl Into<String>) -> Result<Arc<Root>> {
        let context = Arc::new(TreeContext::new(SYSTEM_LOG_CAPACITY));
        let device = Device::new(name, "Tree root", 0)?;
        device.set_context(Some(Arc::clone(&context)));

        let root = Arc::new(Root {
            device,
            context,
            poll: Mutex::new(PollState::default()),
        });
        root.add_builtins()?;

        info!("🌳 Root {} created", root.name());
        Ok(root)
    }

    fn add_builtins(self: &Arc<Self>) -> Result<()> {
        let context = Arc::clone(&self.context);
        self.device.add_variable(
            VariableBuilder::new("systemLog", Model::string(8)?)
                .mode(Mode::RO)
                .description("Errors caught during tree passes")
                .get_hook(move || Ok(Value::Str(context.log().render()))),
        )?;

        let getter = Arc::downgrade(self);
        let setter = Arc::downgrade(self);
        self.device.add_variable(
            VariableBuilder::new("pollPeriod", Model::double()?)
                .units("s")
                .description("Poll interval in seconds, zero disables polling")
                .get_hook(move || {
                    let period = getter.upgrade().and_then(|r| r.poll_period());
                    Ok(Value::Float(period.map(|p| p.as_secs_f64()).unwrap_or(0.0)))
                })
                .set_hook(move |value| {
                    let root = upgrade(&setter)?;
                    let seconds = value
                        .as_f64()
                        .filter(|s| s.is_finite() && *s >= 0.0)
                        .ok_or_else(|| RegError::parse(format!("Invalid poll period {:?}", value)))?;
                    let period = (seconds > 0.0).then(|| Duration::from_secs_f64(seconds));
                    root.set_poll_period(period)
                }),
        )?;

        for (name, kind) in [
            ("hardReset", ResetKind::Hard),
            ("softReset", ResetKind::Soft),
            ("countReset", ResetKind::Count),
        ] {
            let weak = Arc::downgrade(self);
            self.device.add_command(Command::new(
                name,
                format!("Generate a {} reset on every device", kind.as_str()),
                move |_| upgrade(&weak)?.reset(kind),
            )?)?;
        }

        let weak = Arc::downgrade(self);
        self.device.add_command(Command::new("clearLog", "Clear the system log", move |_| {
            upgrade(&weak)?.clear_log();
            Ok(())
        })?)?;

        Ok(())
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn context(&self) -> &Arc<TreeContext> {
        &self.context
    }

    pub fn log(&self) -> &SystemLog {
        self.context.log()
    }

    pub fn clear_log(&self) {
        self.context.log().clear();
        info!("🧹 System log cleared");
    }

    pub fn add(&self, node: Node) -> Result<()> {
        self.device.add(node)
    }

    pub fn add_device(&self, device: Arc<dyn DeviceNode>) -> Result<()> {
        self.device.add_device(device)
    }

    /// Attach a transport inherited by every device without its own
    pub fn set_master(&self, master: Master) {
        self.device.set_master(master);
    }

    /// Register a callback for variable updates anywhere in the tree
    pub fn add_listener(&self, listener: impl Fn(&str, &Value, &str) + Send + Sync + 'static) {
        self.context.add_listener(listener);
    }

    /// Look up a node by dotted path, with or without the root name prefix
    pub fn get_node(&self, path: &str) -> Option<Node> {
        let relative = path
            .strip_prefix(self.name())
            .and_then(|rest| rest.strip_prefix('.'))
            .unwrap_or(path);
        self.device.find(relative)
    }

    /// Write every writable block, verify, then check
    pub fn write_all(&self) -> Result<()> {
        self.run(&[Pass::Write, Pass::Verify])
    }

    /// Read every readable block, then check
    pub fn read_all(&self) -> Result<()> {
        self.run(&[Pass::Read])
    }

    /// Read every pollable block, then check
    pub fn poll_once(&self) -> Result<()> {
        self.run(&[Pass::Poll])
    }

    fn run(&self, passes: &[Pass]) -> Result<()> {
        if !self.device.enabled() {
            return Ok(());
        }

        let _group = self.context.update_group();
        let devices = self.device.devices();
        let mut first = None;

        for pass in passes {
            self.device.issue_local(*pass);
            for child in &devices {
                let (op, result) = match pass {
                    Pass::Write => ("write", child.write_blocks()),
                    Pass::Verify => ("verify", child.verify_blocks()),
                    Pass::Read => ("read", child.read_blocks()),
                    Pass::Poll => ("poll", child.poll_blocks()),
                };
                self.guard(op, &child.device().path(), result, &mut first);
            }
        }

        self.guard("check", self.name(), self.device.check_local(), &mut first);
        for child in &devices {
            self.guard("check", &child.device().path(), child.check_blocks(), &mut first);
        }

        first.map_or(Ok(()), Err)
    }

    fn guard(&self, op: &str, path: &str, result: Result<()>, first: &mut Option<RegError>) {
        if let Err(e) = result {
            error!("❌ Error in {} of {}: {}", op, path, e);
            self.context
                .log()
                .add(format!("Error in {} of {}: {}", op, path, e));
            first.get_or_insert(e);
        }
    }

    /// Run reset hooks over the tree. A hard reset also clears the system log.
    pub fn reset(&self, kind: ResetKind) -> Result<()> {
        info!("🔁 {} reset", kind.as_str());
        if kind == ResetKind::Hard {
            self.clear_log();
        }
        let result = self.device.dev_reset(kind);
        let mut first = None;
        self.guard(kind.as_str(), self.name(), result, &mut first);
        first.map_or(Ok(()), Err)
    }

    /// Shadow values of every visible variable whose mode is in `modes`
    pub fn get_variables(&self, modes: &[Mode]) -> Vec<VariableDump> {
        self.device
            .all_variables()
            .into_iter()
            .filter(|v| !v.hidden() && modes.contains(&v.mode()))
            .filter_map(|v| match v.raw_get() {
                Ok(value) => Some(VariableDump {
                    path: v.path(),
                    display: v.display(&value),
                    value,
                    mode: v.mode(),
                }),
                Err(e) => {
                    warn!("Skipping {}: {}", v.path(), e);
                    None
                }
            })
            .collect()
    }

    /// Apply display text per variable path to the shadows, then write the
    /// tree. Entries whose variable mode is not in `modes` are rejected.
    pub fn set_variables<'a>(
        &self,
        entries: impl IntoIterator<Item = (&'a str, &'a str)>,
        modes: &[Mode],
    ) -> Result<()> {
        let _group = self.context.update_group();
        let mut first = None;

        for (path, text) in entries {
            let result = self.apply_text(path, text, modes);
            self.guard("set", path, result, &mut first);
        }

        let written = self.write_all();
        first.map_or(written, Err)
    }

    fn apply_text(&self, path: &str, text: &str, modes: &[Mode]) -> Result<()> {
        let variable = self
            .get_node(path)
            .and_then(|n| n.as_variable().cloned())
            .ok_or_else(|| RegError::node(format!("No variable at {}", path)))?;

        if !modes.contains(&variable.mode()) {
            return Err(RegError::variable(format!(
                "{} is {} and cannot be set here",
                path,
                variable.mode().as_str()
            )));
        }

        let value = variable.parse_display(text)?;
        if variable.is_local() {
            variable.set(value)
        } else {
            variable.raw_set(&value)
        }
    }

    pub fn poll_period(&self) -> Option<Duration> {
        lock(&self.poll).period
    }

    /// Start, restart or stop (`None`) the poll thread
    pub fn set_poll_period(self: &Arc<Self>, period: Option<Duration>) -> Result<()> {
        let previous = {
            let mut poll = lock(&self.poll);
            let previous = Self::take_thread(&mut poll);
            poll.period = period;

            if let Some(period) = period {
                let (stop, stopped) = bounded::<()>(1);
                let weak = Arc::downgrade(self);
                let handle = thread::Builder::new()
                    .name(format!("{}-poll", self.name()))
                    .spawn(move || Self::poll_thread(weak, stopped, period))
                    .map_err(|e| RegError::node(format!("Failed to start poll thread: {}", e)))?;
                poll.stop = Some(stop);
                poll.handle = Some(handle);
                info!("🔄 Polling {} every {:?}", self.name(), period);
            }
            previous
        };

        Self::join(previous);
        if period.is_none() {
            info!("⏹️ Polling of {} stopped", self.name());
        }
        Ok(())
    }

    /// Stop the poll thread
    pub fn stop(&self) {
        let previous = {
            let mut poll = lock(&self.poll);
            poll.period = None;
            Self::take_thread(&mut poll)
        };
        Self::join(previous);
    }

    fn take_thread(poll: &mut PollState) -> Option<JoinHandle<()>> {
        if let Some(stop) = poll.stop.take() {
            let _ = stop.send(());
        }
        poll.handle.take()
    }

    fn join(handle: Option<JoinHandle<()>>) {
        let Some(handle) = handle else {
            return;
        };
        // The poll thread may stop itself through a listener
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!("Poll thread panicked");
        }
    }

    fn poll_thread(root: Weak<Root>, stop: Receiver<()>, period: Duration) {
        debug!("Poll thread started ({:?})", period);
        loop {
            match stop.recv_timeout(period) {
                Err(RecvTimeoutError::Timeout) => {
                    let Some(root) = root.upgrade() else {
                        break;
                    };
                    if let Err(e) = root.poll_once() {
                        debug!("Poll pass failed: {}", e);
                    }
                }
                _ => break,
            }
        }
        debug!("Poll thread stopped");
    }
}

impl Drop for Root {
    fn drop(&mut self) {
        let poll = self.poll.get_mut().unwrap_or_else(|e| e.into_inner());
        let handle = Self::take_thread(poll);
        Self::join(handle);
    }
}

fn upgrade(root: &Weak<Root>) -> Result<Arc<Root>> {
    root.upgrade()
        .ok_or_else(|| RegError::node("Root no longer exists"))
}
