/*!
Typed views into blocks.

A [`Variable`] is either block-backed (a bit span inside a [`Block`]) or local
(its value lives in the variable itself or behind get/set hooks). Both kinds
share the same client API.
*/

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use tracing::{error, warn};

use crate::block::Block;
use crate::error::{RegError, Result};
use crate::model::{Model, Value};
use crate::root::TreeContext;
use crate::util::{lock, read, write};

/// Access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    RO,
    WO,
    RW,
}

impl Mode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "RO" => Some(Self::RO),
            "WO" => Some(Self::WO),
            "RW" => Some(Self::RW),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RO => "RO",
            Self::WO => "WO",
            Self::RW => "RW",
        }
    }
}

pub type SetHook = Arc<dyn Fn(&Value) -> Result<()> + Send + Sync>;
pub type GetHook = Arc<dyn Fn() -> Result<Value> + Send + Sync>;
pub type Listener = Arc<dyn Fn(&str, &Value, &str) + Send + Sync>;

pub(crate) fn validate_name(name: &str) -> Result<()> {
    static NAME: OnceLock<Regex> = OnceLock::new();
    let pattern = NAME.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Invalid node name pattern")
    });
    if pattern.is_match(name) {
        Ok(())
    } else {
        Err(RegError::node(format!("Invalid node name '{}'", name)))
    }
}

/// Builder for [`Variable`]
pub struct VariableBuilder {
    name: String,
    description: String,
    model: Arc<Model>,
    offset: u64,
    bit_offset: usize,
    mode: Mode,
    poll: bool,
    hidden: bool,
    local: bool,
    units: Option<String>,
    enum_map: Vec<(Value, String)>,
    set_hook: Option<SetHook>,
    get_hook: Option<GetHook>,
    pub(crate) initial: Option<Value>,
}

impl VariableBuilder {
    pub fn new(name: impl Into<String>, model: Arc<Model>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            model,
            offset: 0,
            bit_offset: 0,
            mode: Mode::RW,
            poll: false,
            hidden: false,
            local: false,
            units: None,
            enum_map: Vec::new(),
            set_hook: None,
            get_hook: None,
            initial: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn bit_offset(mut self, bit_offset: usize) -> Self {
        self.bit_offset = bit_offset;
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Include the variable's block in poll passes
    pub fn poll(mut self, poll: bool) -> Self {
        self.poll = poll;
        self
    }

    pub fn hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    /// Keep the value in the variable instead of hardware
    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    /// Initial value, applied to the shadow when the variable is added
    pub fn value(mut self, value: impl Into<Value>) -> Self {
        self.initial = Some(value.into());
        self
    }

    /// Map a raw value to a display label
    pub fn enum_entry(mut self, value: impl Into<Value>, label: impl Into<String>) -> Self {
        self.enum_map.push((value.into(), label.into()));
        self
    }

    /// Replace the raw setter; makes the variable local
    pub fn set_hook(mut self, hook: impl Fn(&Value) -> Result<()> + Send + Sync + 'static) -> Self {
        self.set_hook = Some(Arc::new(hook));
        self.local = true;
        self
    }

    /// Replace the raw getter; makes the variable local
    pub fn get_hook(mut self, hook: impl Fn() -> Result<Value> + Send + Sync + 'static) -> Self {
        self.get_hook = Some(Arc::new(hook));
        self.local = true;
        self
    }

    pub fn build(self) -> Result<Arc<Variable>> {
        validate_name(&self.name)?;

        if self.local && (self.offset != 0 || self.bit_offset != 0 || self.poll) {
            return Err(RegError::config(format!(
                "Local variable {} cannot take an offset or poll",
                self.name
            )));
        }

        let local_value = if self.local && self.get_hook.is_none() {
            Some(
                self.initial
                    .clone()
                    .unwrap_or_else(|| self.model.default_value()),
            )
        } else {
            None
        };

        Ok(Arc::new(Variable {
            path: RwLock::new(self.name.clone()),
            name: self.name,
            description: self.description,
            model: self.model,
            offset: self.offset,
            bit_offset: self.bit_offset,
            mode: self.mode,
            poll: self.poll,
            hidden: self.hidden,
            local: self.local,
            units: self.units,
            enum_map: self.enum_map,
            set_hook: self.set_hook,
            get_hook: self.get_hook,
            local_value: Mutex::new(local_value),
            block: RwLock::new(Weak::new()),
            context: RwLock::new(None),
            listeners: Mutex::new(Vec::new()),
        }))
    }
}

/// Named, typed view into a block or a local value
pub struct Variable {
    name: String,
    description: String,
    model: Arc<Model>,
    offset: u64,
    bit_offset: usize,
    mode: Mode,
    poll: bool,
    hidden: bool,
    local: bool,
    units: Option<String>,
    enum_map: Vec<(Value, String)>,
    set_hook: Option<SetHook>,
    get_hook: Option<GetHook>,
    local_value: Mutex<Option<Value>>,
    block: RwLock<Weak<Block>>,
    path: RwLock<String>,
    context: RwLock<Option<Arc<TreeContext>>>,
    listeners: Mutex<Vec<Listener>>,
}

impl Variable {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn path(&self) -> String {
        read(&self.path).clone()
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn bit_offset(&self) -> usize {
        self.bit_offset
    }

    pub fn bit_size(&self) -> usize {
        self.model.bit_size()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn poll(&self) -> bool {
        self.poll
    }

    pub fn hidden(&self) -> bool {
        self.hidden
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn units(&self) -> Option<&str> {
        self.units.as_deref()
    }

    pub fn enum_entries(&self) -> &[(Value, String)] {
        &self.enum_map
    }

    pub fn block(&self) -> Option<Arc<Block>> {
        read(&self.block).upgrade()
    }

    pub(crate) fn link(&self, block: &Arc<Block>) {
        *write(&self.block) = Arc::downgrade(block);
    }

    pub(crate) fn set_path(&self, path: String) {
        *write(&self.path) = path;
    }

    pub(crate) fn set_context(&self, context: Option<Arc<TreeContext>>) {
        *write(&self.context) = context;
    }

    /// Register a callback invoked with `(path, value, display)` on update
    pub fn add_listener(&self, listener: impl Fn(&str, &Value, &str) + Send + Sync + 'static) {
        lock(&self.listeners).push(Arc::new(listener));
    }

    /// Store a value in the shadow without any hardware access
    pub fn raw_set(&self, value: &Value) -> Result<()> {
        if self.local {
            return match &self.set_hook {
                Some(hook) => hook(value),
                None => {
                    *lock(&self.local_value) = Some(value.clone());
                    Ok(())
                }
            };
        }

        let bytes = self.field_order(self.model.to_bytes(value)?);
        self.require_block()?
            .set_field(self.bit_offset, self.bit_size(), &bytes)
    }

    /// Decode the current shadow value without any hardware access
    pub fn raw_get(&self) -> Result<Value> {
        if let Some(hook) = &self.get_hook {
            return hook();
        }
        if self.local {
            return Ok(lock(&self.local_value)
                .clone()
                .unwrap_or_else(|| self.model.default_value()));
        }

        let bytes = self
            .require_block()?
            .get_field(self.bit_offset, self.bit_size())?;
        self.model.from_bytes(&self.field_order(bytes))
    }

    /// Blocks pack partial-byte fields in little-endian bit order, so a
    /// big-endian encoding is byte-swapped on the way in and out. Whole-byte
    /// fields keep the model's byte order.
    fn field_order(&self, mut bytes: Vec<u8>) -> Vec<u8> {
        let whole_bytes = self.bit_offset % 8 == 0 && self.bit_size() % 8 == 0;
        if self.model.is_big_endian() && !whole_bytes {
            bytes.reverse();
        }
        bytes
    }

    /// Write a value and wait for it to complete. Writable and readable
    /// variables are verified.
    pub fn set(&self, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let result = self.do_set(&value, false);
        self.log_failure("set", result)
    }

    /// Posted write; waits for the transport to accept it
    pub fn post(&self, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let result = self.do_set(&value, true);
        self.log_failure("post", result)
    }

    /// Read from hardware when readable and return the decoded value
    pub fn get(&self) -> Result<Value> {
        let result = self.do_get();
        self.log_failure("get", result)
    }

    /// Parse display text and [`set`](Self::set) the result
    pub fn set_display(&self, text: &str) -> Result<()> {
        let value = self.parse_display(text)?;
        self.set(value)
    }

    /// [`get`](Self::get) the value as display text
    pub fn get_display(&self) -> Result<String> {
        self.get().map(|v| self.display(&v))
    }

    /// Enum label or model display form of a value
    pub fn display(&self, value: &Value) -> String {
        self.enum_map
            .iter()
            .find(|(v, _)| v == value)
            .map(|(_, label)| label.clone())
            .unwrap_or_else(|| self.model.display(value))
    }

    /// Enum label lookup, falling back to the model literal syntax
    pub fn parse_display(&self, text: &str) -> Result<Value> {
        let text = text.trim();
        if let Some((value, _)) = self.enum_map.iter().find(|(_, label)| label == text) {
            return Ok(value.clone());
        }
        self.model.from_string(text)
    }

    /// Notify listeners of the current value. Write-only variables have no
    /// meaningful shadow and are skipped.
    pub fn updated(&self) {
        if self.mode == Mode::WO {
            return;
        }

        let value = match self.raw_get() {
            Ok(value) => value,
            Err(e) => {
                warn!("Could not decode {}: {}", self.path(), e);
                return;
            }
        };
        let display = self.display(&value);
        let path = self.path();

        let listeners = lock(&self.listeners).clone();
        for listener in listeners {
            listener(&path, &value, &display);
        }

        if let Some(context) = read(&self.context).clone() {
            context.var_updated(&path, &value, &display);
        }
    }

    fn do_set(&self, value: &Value, posted: bool) -> Result<()> {
        if self.mode == Mode::RO {
            return Err(RegError::variable(format!(
                "Cannot set read-only variable {}",
                self.path()
            )));
        }

        self.raw_set(value)?;

        if self.local {
            self.updated();
            return Ok(());
        }

        let block = self.require_block()?;
        let path = self.path();
        if posted {
            block.blocking_post(&path)
        } else {
            block.blocking_write(&path)
        }
    }

    fn do_get(&self) -> Result<Value> {
        if !self.local && self.mode != Mode::WO {
            let block = self.require_block()?;
            block.blocking_read(&self.path())?;
        }
        self.raw_get()
    }

    fn require_block(&self) -> Result<Arc<Block>> {
        self.block().ok_or_else(|| {
            RegError::variable(format!("Variable {} is not attached to a block", self.path()))
        })
    }

    fn log_failure<T>(&self, op: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            error!("❌ Error in {} of {}: {}", op, self.path(), e);
            if let Some(context) = read(&self.context).as_ref() {
                context
                    .log()
                    .add(format!("Error in {} of {}: {}", op, self.path(), e));
            }
        }
        result
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("path", &self.path())
            .field("model", &self.model.name())
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("bit_offset", &self.bit_offset)
            .field("mode", &self.mode)
            .field("local", &self.local)
            .finish()
    }
}
