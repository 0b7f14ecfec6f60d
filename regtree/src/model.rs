/*!
Value/bytes codecs.

A [`Model`] describes how a logical value is laid out in hardware: its kind,
bit width, binary point and byte order. Models are pure data; the factory
functions return a shared instance per distinct set of arguments.
*/

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use crate::constants::MAX_INT_BITS;
use crate::error::{RegError, Result};
use crate::util::{byte_count, lock};

/// Codec kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    UInt,
    UIntReversed,
    Int,
    Bool,
    String,
    Float,
    Double,
    Fixed,
}

impl ModelKind {
    /// Parse a model kind from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "uint" | "hex" => Some(Self::UInt),
            "uintreversed" | "uint_reversed" => Some(Self::UIntReversed),
            "int" => Some(Self::Int),
            "bool" => Some(Self::Bool),
            "string" => Some(Self::String),
            "float" => Some(Self::Float),
            "double" => Some(Self::Double),
            "fixed" => Some(Self::Fixed),
            _ => None,
        }
    }

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UInt => "UInt",
            Self::UIntReversed => "UIntReversed",
            Self::Int => "Int",
            Self::Bool => "Bool",
            Self::String => "String",
            Self::Float => "Float",
            Self::Double => "Double",
            Self::Fixed => "Fixed",
        }
    }

    /// Bit width imposed by the kind, if any
    pub fn fixed_bit_size(&self) -> Option<usize> {
        match self {
            Self::Bool => Some(1),
            Self::Float => Some(32),
            Self::Double => Some(64),
            _ => None,
        }
    }
}

/// Byte order of a value in hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

/// A decoded logical value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    UInt(u128),
    Int(i128),
    Float(f64),
    Str(String),
}

impl Value {
    pub fn as_u128(&self) -> Option<u128> {
        match self {
            Self::UInt(v) => Some(*v),
            Self::Int(v) => u128::try_from(*v).ok(),
            Self::Bool(b) => Some(*b as u128),
            _ => None,
        }
    }

    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Self::UInt(v) => i128::try_from(*v).ok(),
            Self::Int(v) => Some(*v),
            Self::Bool(b) => Some(*b as i128),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::UInt(v) => Some(*v as f64),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::UInt(v) => Some(*v != 0),
            Self::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            Self::UInt(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Str(s) => write!(f, "{}", s),
        }
    }
}

macro_rules! value_from {
    ($variant:ident, $cast:ty, $($t:ty),+) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::$variant(v as $cast)
            }
        })+
    };
}

value_from!(UInt, u128, u8, u16, u32, u64, u128, usize);
value_from!(Int, i128, i8, i16, i32, i64, i128);
value_from!(Float, f64, f32, f64);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// Immutable type descriptor converting values to and from raw bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Model {
    kind: ModelKind,
    bit_size: usize,
    bin_point: u32,
    endianness: Endianness,
    name: String,
}

type ModelKey = (ModelKind, usize, u32, Endianness);
type MaskKey = (usize, usize, Endianness);

fn model_cache() -> &'static Mutex<HashMap<ModelKey, Arc<Model>>> {
    static CACHE: OnceLock<Mutex<HashMap<ModelKey, Arc<Model>>>> = OnceLock::new();
    CACHE.get_or_init(Default::default)
}

fn mask_cache() -> &'static Mutex<HashMap<MaskKey, Arc<[u8]>>> {
    static CACHE: OnceLock<Mutex<HashMap<MaskKey, Arc<[u8]>>>> = OnceLock::new();
    CACHE.get_or_init(Default::default)
}

impl Model {
    /// Get the shared model for the given parameters, creating it on first use
    pub fn new(
        kind: ModelKind,
        bit_size: usize,
        bin_point: u32,
        endianness: Endianness,
    ) -> Result<Arc<Model>> {
        let key = (kind, bit_size, bin_point, endianness);
        let mut cache = lock(model_cache());

        if let Some(model) = cache.get(&key) {
            return Ok(Arc::clone(model));
        }

        let model = Arc::new(Self::build(kind, bit_size, bin_point, endianness)?);
        cache.insert(key, Arc::clone(&model));
        Ok(model)
    }

    fn build(
        kind: ModelKind,
        bit_size: usize,
        bin_point: u32,
        endianness: Endianness,
    ) -> Result<Model> {
        if bit_size == 0 {
            return Err(RegError::config(format!(
                "The bitSize param of Model {} must be greater than zero",
                kind.as_str()
            )));
        }

        if let Some(required) = kind.fixed_bit_size() {
            if bit_size != required {
                return Err(RegError::config(format!(
                    "The bitSize param of Model {} must be {}",
                    kind.as_str(),
                    required
                )));
            }
        }

        match kind {
            ModelKind::UInt | ModelKind::UIntReversed | ModelKind::Int | ModelKind::Fixed
                if bit_size > MAX_INT_BITS =>
            {
                return Err(RegError::config(format!(
                    "Model {} supports at most {} bits, got {}",
                    kind.as_str(),
                    MAX_INT_BITS,
                    bit_size
                )));
            }
            ModelKind::String if bit_size % 8 != 0 => {
                return Err(RegError::config(format!(
                    "The bitSize param of Model String must be a multiple of 8, got {}",
                    bit_size
                )));
            }
            _ => {}
        }

        if kind != ModelKind::Fixed && bin_point != 0 {
            return Err(RegError::config(format!(
                "Model {} does not take a binary point",
                kind.as_str()
            )));
        }

        if kind == ModelKind::Fixed && bin_point as usize >= MAX_INT_BITS {
            return Err(RegError::config(format!(
                "Binary point {} out of range",
                bin_point
            )));
        }

        let suffix = match endianness {
            Endianness::Little => "",
            Endianness::Big => "BE",
        };

        let name = match kind {
            ModelKind::Bool => "Bool".to_string(),
            ModelKind::String => format!("String({})", bit_size / 8),
            ModelKind::Fixed => format!("Fixed{}_S_{}_{}", suffix, bit_size, bin_point),
            _ => format!("{}{}{}", kind.as_str(), suffix, bit_size),
        };

        Ok(Model {
            kind,
            bit_size,
            bin_point,
            endianness,
            name,
        })
    }

    pub fn uint(bit_size: usize) -> Result<Arc<Model>> {
        Self::new(ModelKind::UInt, bit_size, 0, Endianness::Little)
    }

    pub fn uint_be(bit_size: usize) -> Result<Arc<Model>> {
        Self::new(ModelKind::UInt, bit_size, 0, Endianness::Big)
    }

    pub fn uint_reversed(bit_size: usize) -> Result<Arc<Model>> {
        Self::new(ModelKind::UIntReversed, bit_size, 0, Endianness::Little)
    }

    pub fn int(bit_size: usize) -> Result<Arc<Model>> {
        Self::new(ModelKind::Int, bit_size, 0, Endianness::Little)
    }

    pub fn int_be(bit_size: usize) -> Result<Arc<Model>> {
        Self::new(ModelKind::Int, bit_size, 0, Endianness::Big)
    }

    pub fn bool() -> Result<Arc<Model>> {
        Self::new(ModelKind::Bool, 1, 0, Endianness::Little)
    }

    pub fn string(bit_size: usize) -> Result<Arc<Model>> {
        Self::new(ModelKind::String, bit_size, 0, Endianness::Little)
    }

    pub fn float() -> Result<Arc<Model>> {
        Self::new(ModelKind::Float, 32, 0, Endianness::Little)
    }

    pub fn float_be() -> Result<Arc<Model>> {
        Self::new(ModelKind::Float, 32, 0, Endianness::Big)
    }

    pub fn double() -> Result<Arc<Model>> {
        Self::new(ModelKind::Double, 64, 0, Endianness::Little)
    }

    pub fn double_be() -> Result<Arc<Model>> {
        Self::new(ModelKind::Double, 64, 0, Endianness::Big)
    }

    pub fn fixed(bit_size: usize, bin_point: u32) -> Result<Arc<Model>> {
        Self::new(ModelKind::Fixed, bit_size, bin_point, Endianness::Little)
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn bit_size(&self) -> usize {
        self.bit_size
    }

    pub fn bin_point(&self) -> u32 {
        self.bin_point
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn is_big_endian(&self) -> bool {
        self.endianness == Endianness::Big
    }

    pub fn signed(&self) -> bool {
        matches!(self.kind, ModelKind::Int | ModelKind::Fixed)
    }

    pub fn bit_reverse(&self) -> bool {
        self.kind == ModelKind::UIntReversed
    }

    /// Text encoding of string models
    pub fn encoding(&self) -> Option<&'static str> {
        match self.kind {
            ModelKind::String => Some("utf-8"),
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of bytes occupied by an encoded value
    pub fn byte_count(&self) -> usize {
        byte_count(self.bit_size)
    }

    /// Encode a value into `byte_count()` bytes
    pub fn to_bytes(&self, value: &Value) -> Result<Vec<u8>> {
        match self.kind {
            ModelKind::UInt => {
                let raw = self.expect_uint(value)?;
                Ok(self.pack(raw))
            }
            ModelKind::UIntReversed => {
                let raw = self.expect_uint(value)?;
                Ok(self.pack(reverse_bits(raw, self.bit_size)))
            }
            ModelKind::Int => {
                let v = value
                    .as_i128()
                    .ok_or_else(|| self.type_error(value))?;
                self.encode_signed(v, value)
            }
            ModelKind::Bool => {
                let b = value.as_bool().ok_or_else(|| self.type_error(value))?;
                Ok(vec![b as u8])
            }
            ModelKind::String => {
                let s = value.as_str().ok_or_else(|| self.type_error(value))?;
                let len = self.byte_count();
                if s.len() > len {
                    return Err(RegError::overflow(s, self.name.as_str()));
                }
                let mut bytes = s.as_bytes().to_vec();
                bytes.resize(len, 0);
                Ok(bytes)
            }
            ModelKind::Float => {
                let v = value.as_f64().ok_or_else(|| self.type_error(value))?;
                if v.is_finite() && v.abs() > f32::MAX as f64 {
                    return Err(RegError::overflow(v, self.name.as_str()));
                }
                let v = v as f32;
                Ok(match self.endianness {
                    Endianness::Little => v.to_le_bytes().to_vec(),
                    Endianness::Big => v.to_be_bytes().to_vec(),
                })
            }
            ModelKind::Double => {
                let v = value.as_f64().ok_or_else(|| self.type_error(value))?;
                Ok(match self.endianness {
                    Endianness::Little => v.to_le_bytes().to_vec(),
                    Endianness::Big => v.to_be_bytes().to_vec(),
                })
            }
            ModelKind::Fixed => {
                let v = value.as_f64().ok_or_else(|| self.type_error(value))?;
                let scaled = (v * self.scale()).round();
                if !scaled.is_finite() || scaled.abs() >= 2f64.powi(MAX_INT_BITS as i32 - 1) {
                    return Err(RegError::overflow(v, self.name.as_str()));
                }
                self.encode_signed(scaled as i128, value)
            }
        }
    }

    /// Decode a value from the first `byte_count()` bytes
    pub fn from_bytes(&self, bytes: &[u8]) -> Result<Value> {
        let len = self.byte_count();
        if bytes.len() < len {
            return Err(RegError::parse(format!(
                "{} needs {} bytes, got {}",
                self.name,
                len,
                bytes.len()
            )));
        }
        let bytes = &bytes[..len];

        match self.kind {
            ModelKind::UInt => Ok(Value::UInt(self.unpack(bytes))),
            ModelKind::UIntReversed => {
                let raw = self.unpack(bytes) & uint_mask(self.bit_size);
                Ok(Value::UInt(reverse_bits(raw, self.bit_size)))
            }
            ModelKind::Int => Ok(Value::Int(self.decode_signed(bytes))),
            ModelKind::Bool => Ok(Value::Bool(bytes[0] & 1 != 0)),
            ModelKind::String => {
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                String::from_utf8(bytes[..end].to_vec())
                    .map(Value::Str)
                    .map_err(|e| RegError::parse(format!("{}: {}", self.name, e)))
            }
            ModelKind::Float => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(bytes);
                let v = match self.endianness {
                    Endianness::Little => f32::from_le_bytes(raw),
                    Endianness::Big => f32::from_be_bytes(raw),
                };
                Ok(Value::Float(v as f64))
            }
            ModelKind::Double => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                let v = match self.endianness {
                    Endianness::Little => f64::from_le_bytes(raw),
                    Endianness::Big => f64::from_be_bytes(raw),
                };
                Ok(Value::Float(v))
            }
            ModelKind::Fixed => {
                let raw = self.decode_signed(bytes);
                Ok(Value::Float(raw as f64 / self.scale()))
            }
        }
    }

    /// Parse a literal into a value of this model
    pub fn from_string(&self, text: &str) -> Result<Value> {
        let text = text.trim();

        match self.kind {
            ModelKind::UInt | ModelKind::UIntReversed => {
                let (negative, magnitude) = parse_int_literal(text)?;
                if negative && magnitude != 0 {
                    return Err(RegError::parse(format!(
                        "Negative literal '{}' for unsigned model {}",
                        text, self.name
                    )));
                }
                Ok(Value::UInt(magnitude))
            }
            ModelKind::Int => {
                let (negative, magnitude) = parse_int_literal(text)?;
                if negative {
                    if magnitude > i128::MAX as u128 + 1 {
                        return Err(RegError::overflow(text, self.name.as_str()));
                    }
                    return Ok(Value::Int((magnitude as i128).wrapping_neg()));
                }

                // A positive literal with the sign bit set is a two's complement pattern
                let bits = self.bit_size;
                if bits < MAX_INT_BITS
                    && magnitude <= uint_mask(bits)
                    && (magnitude >> (bits - 1)) & 1 == 1
                {
                    return Ok(Value::Int((magnitude | !uint_mask(bits)) as i128));
                }

                i128::try_from(magnitude)
                    .map(Value::Int)
                    .map_err(|_| RegError::overflow(text, self.name.as_str()))
            }
            ModelKind::Bool => match text.to_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(RegError::parse(format!("Invalid bool literal '{}'", text))),
            },
            ModelKind::String => Ok(Value::Str(text.to_string())),
            ModelKind::Float | ModelKind::Double | ModelKind::Fixed => text
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|e| RegError::parse(format!("Invalid float literal '{}': {}", text, e))),
        }
    }

    /// Zero value of the model's kind
    pub fn default_value(&self) -> Value {
        match self.kind {
            ModelKind::UInt | ModelKind::UIntReversed => Value::UInt(0),
            ModelKind::Int => Value::Int(0),
            ModelKind::Bool => Value::Bool(false),
            ModelKind::String => Value::Str(String::new()),
            ModelKind::Float | ModelKind::Double | ModelKind::Fixed => Value::Float(0.0),
        }
    }

    /// Lowest declared value. The signed lower bound excludes the most negative
    /// representable value.
    pub fn min_value(&self) -> Option<Value> {
        match self.kind {
            ModelKind::UInt | ModelKind::UIntReversed | ModelKind::Bool => Some(Value::UInt(0)),
            ModelKind::Int => Some(Value::Int(-signed_max(self.bit_size))),
            ModelKind::Float => Some(Value::Float(-3.4e38)),
            // The declared 1.80e308 bound lies past f64::MAX and evaluates to infinity
            ModelKind::Double => Some(Value::Float(f64::NEG_INFINITY)),
            ModelKind::String | ModelKind::Fixed => None,
        }
    }

    /// Highest declared value
    pub fn max_value(&self) -> Option<Value> {
        match self.kind {
            ModelKind::UInt | ModelKind::UIntReversed => {
                Some(Value::UInt(uint_mask(self.bit_size)))
            }
            ModelKind::Bool => Some(Value::UInt(1)),
            ModelKind::Int => Some(Value::Int(signed_max(self.bit_size))),
            ModelKind::Float => Some(Value::Float(3.4e38)),
            ModelKind::Double => Some(Value::Float(f64::INFINITY)),
            ModelKind::String | ModelKind::Fixed => None,
        }
    }

    /// Byte mask selecting the value bits inside a slot of `byte_count` bytes
    pub fn byte_mask(&self, byte_count: usize) -> Arc<[u8]> {
        byte_mask(self.bit_size, byte_count, self.endianness)
    }

    /// Zero every bit of `bytes` that does not belong to the value
    pub fn apply_mask(&self, bytes: &[u8]) -> Vec<u8> {
        let mask = self.byte_mask(bytes.len());
        bytes.iter().zip(mask.iter()).map(|(b, m)| b & m).collect()
    }

    /// Default display form of a value
    pub fn display(&self, value: &Value) -> String {
        match (self.kind, value) {
            (ModelKind::UInt | ModelKind::UIntReversed, Value::UInt(v)) => format!("{:#x}", v),
            (ModelKind::Float | ModelKind::Double, Value::Float(v)) => format!("{:.6}", v),
            _ => value.to_string(),
        }
    }

    fn expect_uint(&self, value: &Value) -> Result<u128> {
        let raw = match value {
            Value::Int(v) if *v < 0 => return Err(RegError::overflow(v, self.name.as_str())),
            _ => value.as_u128().ok_or_else(|| self.type_error(value))?,
        };
        if raw > uint_mask(self.bit_size) {
            return Err(RegError::overflow(raw, self.name.as_str()));
        }
        Ok(raw)
    }

    fn encode_signed(&self, v: i128, original: &Value) -> Result<Vec<u8>> {
        let bits = self.bit_size;
        if bits < MAX_INT_BITS {
            let max = signed_max(bits);
            if v > max || v < -max - 1 {
                return Err(RegError::overflow(original, self.name.as_str()));
            }
        }

        // Negative values narrower than their byte width are masked so the sign
        // does not spill into the padding bits.
        let raw = if v < 0 && bits < self.byte_count() * 8 {
            (v as u128) & uint_mask(bits)
        } else {
            v as u128
        };
        Ok(self.pack(raw))
    }

    fn decode_signed(&self, bytes: &[u8]) -> i128 {
        let bits = self.bit_size;
        let raw = self.unpack(bytes) & uint_mask(bits);
        if bits < MAX_INT_BITS && (raw >> (bits - 1)) & 1 == 1 {
            (raw | !uint_mask(bits)) as i128
        } else {
            raw as i128
        }
    }

    fn pack(&self, raw: u128) -> Vec<u8> {
        let mut bytes = raw.to_le_bytes()[..self.byte_count()].to_vec();
        if self.is_big_endian() {
            bytes.reverse();
        }
        bytes
    }

    fn unpack(&self, bytes: &[u8]) -> u128 {
        let len = self.byte_count().min(16);
        let mut le = [0u8; 16];
        le[..len].copy_from_slice(&bytes[..len]);
        if self.is_big_endian() {
            le[..len].reverse();
        }
        u128::from_le_bytes(le)
    }

    fn scale(&self) -> f64 {
        2f64.powi(self.bin_point as i32)
    }

    fn type_error(&self, value: &Value) -> RegError {
        RegError::parse(format!("Cannot encode {:?} with model {}", value, self.name))
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Byte mask for a value of `bit_size` bits placed at the start of a slot of
/// `byte_count` bytes. Cached per argument set.
pub fn byte_mask(bit_size: usize, byte_count: usize, endianness: Endianness) -> Arc<[u8]> {
    let key = (bit_size, byte_count, endianness);
    let mut cache = lock(mask_cache());

    if let Some(mask) = cache.get(&key) {
        return Arc::clone(mask);
    }

    let word = crate::util::byte_count(bit_size).min(byte_count);
    let mut mask = vec![0u8; byte_count];
    let mut remaining = bit_size.min(word * 8);

    for byte in mask[..word].iter_mut() {
        let take = remaining.min(8);
        *byte = if take == 8 { 0xFF } else { (1u8 << take) - 1 };
        remaining -= take;
    }

    if endianness == Endianness::Big {
        mask[..word].reverse();
    }

    let mask: Arc<[u8]> = mask.into();
    cache.insert(key, Arc::clone(&mask));
    mask
}

/// Reverse the order of the low `bit_size` bits of `value`
pub fn reverse_bits(value: u128, bit_size: usize) -> u128 {
    let mut value = value;
    let mut result = 0u128;
    for _ in 0..bit_size {
        result = (result << 1) | (value & 1);
        value >>= 1;
    }
    result
}

fn uint_mask(bits: usize) -> u128 {
    if bits >= 128 {
        u128::MAX
    } else {
        (1u128 << bits) - 1
    }
}

fn signed_max(bits: usize) -> i128 {
    if bits >= 128 {
        i128::MAX
    } else {
        (1i128 << (bits - 1)) - 1
    }
}

/// Parse an integer literal with automatic base detection (`0x`, `0o`, `0b`
/// or decimal). Returns the sign and magnitude.
fn parse_int_literal(text: &str) -> Result<(bool, u128)> {
    let (negative, rest) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };

    let lower = rest.to_ascii_lowercase();
    let (radix, digits) = if let Some(d) = lower.strip_prefix("0x") {
        (16, d)
    } else if let Some(d) = lower.strip_prefix("0o") {
        (8, d)
    } else if let Some(d) = lower.strip_prefix("0b") {
        (2, d)
    } else {
        (10, lower.as_str())
    };

    let digits: String = digits.chars().filter(|c| *c != '_').collect();
    if digits.is_empty() || digits.starts_with(['+', '-']) {
        return Err(RegError::parse(format!("Invalid integer literal '{}'", text)));
    }

    if radix == 10 && digits.len() > 1 && digits.starts_with('0') && digits.chars().any(|c| c != '0')
    {
        return Err(RegError::parse(format!(
            "Leading zeros are not allowed in decimal literal '{}'",
            text
        )));
    }

    u128::from_str_radix(&digits, radix)
        .map(|v| (negative, v))
        .map_err(|e| RegError::parse(format!("Invalid integer literal '{}': {}", text, e)))
}
